use once_cell::sync::Lazy;
use regex::Regex;

static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("think regex must compile"));

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[ \t]*\r?\n(.*?)```").expect("fence regex must compile")
});

/// Remove reasoning blocks some models emit before the answer. An unclosed
/// `<think>` swallows the rest of the text.
pub fn strip_think(text: &str) -> String {
    let stripped = THINK_BLOCK.replace_all(text, "");
    match stripped.find("<think>") {
        Some(idx) => stripped[..idx].trim().to_string(),
        None => stripped.trim().to_string(),
    }
}

/// Source code to execute for a model response.
///
/// Prefers the first ```` ```python ```` block, then the first fenced block of
/// any language, then the whole think-stripped text.
pub fn extract_code(text: &str) -> String {
    let text = strip_think(text);
    let mut first_any: Option<String> = None;
    for caps in FENCED_BLOCK.captures_iter(&text) {
        let lang = caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
        let body = caps.get(2).map_or("", |m| m.as_str());
        if lang == "python" || lang == "py" || lang == "python3" {
            return body.trim_end().to_string();
        }
        if first_any.is_none() {
            first_any = Some(body.trim_end().to_string());
        }
    }
    first_any.unwrap_or(text)
}
