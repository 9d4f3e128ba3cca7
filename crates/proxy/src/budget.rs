use serde_json::{Map, Value};
use std::fmt;

/// Share of the context window kept free for the prompt.
pub const RESPONSE_RESERVE_FRACTION: f64 = 0.25;

/// Largest completion budget for a model: `floor(context_window * (1 - reserve))`.
pub fn token_budget(context_window: u32, reserve_fraction: f64) -> u64 {
    let reserve = if reserve_fraction.is_finite() {
        reserve_fraction.clamp(0.0, 1.0)
    } else {
        RESPONSE_RESERVE_FRACTION
    };
    (f64::from(context_window) * (1.0 - reserve)).floor() as u64
}

/// What [`apply_budget`] did to a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    /// `max_tokens` was missing or null.
    Inserted { budget: u64 },
    /// The caller asked for more than the model can give, or for an
    /// unbounded (negative) completion.
    Lowered { budget: u64 },
    /// The caller's value already fits.
    Kept,
    /// `max_tokens` is not a number; the upstream server gets to judge it.
    Ignored,
}

impl BudgetDecision {
    pub fn rewrote(self) -> bool {
        matches!(self, Self::Inserted { .. } | Self::Lowered { .. })
    }
}

impl fmt::Display for BudgetDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inserted { budget } => write!(f, "set max_tokens to {budget}"),
            Self::Lowered { budget } => write!(f, "lowered max_tokens to {budget}"),
            Self::Kept => f.write_str("kept caller max_tokens"),
            Self::Ignored => f.write_str("left non-numeric max_tokens alone"),
        }
    }
}

/// Cap `max_tokens` in a completion body at `budget`. A lower value set by
/// the caller is never raised. No other field is touched.
pub fn apply_budget(body: &mut Map<String, Value>, budget: u64) -> BudgetDecision {
    let decision = match body.get("max_tokens") {
        None | Some(Value::Null) => BudgetDecision::Inserted { budget },
        Some(Value::Number(requested)) => match requested.as_f64() {
            Some(n) if n < 0.0 || n > budget as f64 => BudgetDecision::Lowered { budget },
            Some(_) => BudgetDecision::Kept,
            None => BudgetDecision::Ignored,
        },
        Some(_) => BudgetDecision::Ignored,
    };
    if decision.rewrote() {
        body.insert("max_tokens".to_string(), Value::from(budget));
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn budget_reserves_a_quarter_by_default() {
        assert_eq!(token_budget(8192, RESPONSE_RESERVE_FRACTION), 6144);
        assert_eq!(token_budget(4095, RESPONSE_RESERVE_FRACTION), 3071);
        assert_eq!(token_budget(8192, 0.5), 4096);
        assert_eq!(token_budget(8192, 2.0), 0);
        assert_eq!(token_budget(8192, f64::NAN), 6144);
    }

    #[test]
    fn missing_or_null_max_tokens_is_inserted() {
        let mut body = object(json!({"model": "m", "messages": []}));
        assert_eq!(apply_budget(&mut body, 6144), BudgetDecision::Inserted { budget: 6144 });
        assert_eq!(body["max_tokens"], json!(6144));

        let mut body = object(json!({"model": "m", "max_tokens": null}));
        assert!(apply_budget(&mut body, 6144).rewrote());
        assert_eq!(body["max_tokens"], json!(6144));
    }

    #[test]
    fn caller_budget_is_lowered_never_raised() {
        let mut body = object(json!({"model": "m", "max_tokens": 100}));
        assert_eq!(apply_budget(&mut body, 6144), BudgetDecision::Kept);
        assert_eq!(body["max_tokens"], json!(100));

        let mut body = object(json!({"model": "m", "max_tokens": 6144}));
        assert_eq!(apply_budget(&mut body, 6144), BudgetDecision::Kept);

        let mut body = object(json!({"model": "m", "max_tokens": 100000}));
        assert_eq!(apply_budget(&mut body, 6144), BudgetDecision::Lowered { budget: 6144 });
        assert_eq!(body["max_tokens"], json!(6144));
    }

    #[test]
    fn unbounded_and_odd_values() {
        let mut body = object(json!({"max_tokens": -1}));
        assert_eq!(apply_budget(&mut body, 3072), BudgetDecision::Lowered { budget: 3072 });
        assert_eq!(body["max_tokens"], json!(3072));

        let mut body = object(json!({"max_tokens": "lots"}));
        assert_eq!(apply_budget(&mut body, 3072), BudgetDecision::Ignored);
        assert_eq!(body["max_tokens"], json!("lots"));
    }

    #[test]
    fn other_fields_keep_their_order() {
        let mut body = object(json!({"model": "m", "stream": true, "temperature": 0.2}));
        apply_budget(&mut body, 10);
        let keys: Vec<&str> = body.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["model", "stream", "temperature", "max_tokens"]);
    }
}
