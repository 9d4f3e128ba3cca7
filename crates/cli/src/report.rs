use broker_harness::{ModelRun, ModelRunSummary, ModelState, PASS_AT_K};
use broker_provider::ModelDescriptor;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn render_models(models: &[Arc<ModelDescriptor>]) -> String {
    let mut md = String::new();
    md.push_str("| model | context | size | params | provider |\n");
    md.push_str("|---|---:|---|---:|---|\n");
    for model in models {
        md.push_str(&format!(
            "| `{}` | `{}` | `{}` | `{}` | `{}` |\n",
            model.id,
            model.context_window,
            model.param_size_hint,
            model
                .param_count_billions
                .map_or("n/a".to_string(), |b| format!("{b}B")),
            model.provider,
        ));
    }
    md
}

pub fn render_runs(runs: &[ModelRun]) -> String {
    let mut md = String::new();
    md.push_str("# Benchmark report\n\n");
    md.push_str("| model | tasks | passed | avg score |");
    for k in PASS_AT_K {
        md.push_str(&format!(" pass@{k} |"));
    }
    md.push_str(" retried | provider failures |\n");
    md.push_str("|---|---:|---:|---:|");
    for _ in PASS_AT_K {
        md.push_str("---:|");
    }
    md.push_str("---:|---:|\n");

    for run in runs {
        if run.skipped {
            md.push_str(&format!("| `{}` | skipped (embedding model) |\n", run.model_id));
            continue;
        }
        let summary = ModelRunSummary::from_results(&run.model_id, run.results());
        md.push_str(&format!(
            "| `{}` | `{}` | `{}` | `{:.3}` |",
            summary.model_id, summary.tasks_run, summary.passed, summary.average_score
        ));
        for k in PASS_AT_K {
            let cell = summary
                .pass_at_k
                .get(&k)
                .map_or("n/a".to_string(), |p| format!("{p:.3}"));
            md.push_str(&format!(" `{cell}` |"));
        }
        md.push_str(&format!(
            " `{}` | `{}` |\n",
            summary.retried, summary.provider_failures
        ));
    }
    md.push('\n');

    for run in runs.iter().filter(|r| !r.reports.is_empty()) {
        md.push_str(&format!("## `{}`\n\n", run.model_id));
        md.push_str("| task | phase | score | retries | ms | error |\n");
        md.push_str("|---|---|---:|---:|---:|---|\n");
        for report in &run.reports {
            let result = &report.result;
            md.push_str(&format!(
                "| `{}` | `{}` | `{:.2}` | `{}` | `{}` | {} |\n",
                result.task_id,
                report.phase,
                result.score,
                result.retry_count,
                result.elapsed_ms,
                escape_cell(&truncate_one_line(result.error.as_deref().unwrap_or(""), 80)),
            ));
        }
        if run.stopped {
            md.push_str("\n_Stopped before every task ran._\n");
        }
        md.push('\n');
    }
    md
}

pub fn runs_json(runs: &[ModelRun]) -> Value {
    let models: Vec<Value> = runs
        .iter()
        .map(|run| {
            json!({
                "model_id": run.model_id,
                "skipped": run.skipped,
                "stopped": run.stopped,
                "summary": ModelRunSummary::from_results(&run.model_id, run.results()),
                "results": run.results().collect::<Vec<_>>(),
                "phases": run.reports.iter().map(|r| r.phase.to_string()).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({ "models": models })
}

pub fn render_state(state: &ModelState) -> String {
    let summary = ModelRunSummary::from_results(&state.model_id, &state.results);
    let mut md = String::new();
    md.push_str(&format!("# `{}`\n\n", state.model_id));
    md.push_str(&format!("- Context window: `{}`\n", state.context_window));
    md.push_str(&format!(
        "- Results: `{}` (passed `{}`, avg score `{:.3}`)\n",
        summary.tasks_run, summary.passed, summary.average_score
    ));
    md.push_str(&format!(
        "- Learned prompts: `{}`\n\n",
        state.prompt_strategies.len()
    ));
    for (task_id, prompt) in &state.prompt_strategies {
        md.push_str(&format!(
            "- `{task_id}`: {}\n",
            escape_cell(&truncate_one_line(prompt, 160))
        ));
    }
    md
}

fn truncate_one_line(text: &str, max_chars: usize) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() <= max_chars {
        return line;
    }
    let mut out: String = line.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_harness::{AttemptOutcome, BenchmarkResult, TaskPhase, TaskReport};
    use broker_provider::ProviderKind;

    fn report(task_id: &str, passed: bool) -> TaskReport {
        TaskReport {
            phase: if passed {
                TaskPhase::Passed
            } else {
                TaskPhase::FailedTerminal
            },
            result: BenchmarkResult {
                task_id: task_id.into(),
                model_id: "m".into(),
                passed,
                score: if passed { 1.0 } else { 0.0 },
                elapsed_ms: 5,
                raw_response: String::new(),
                used_prompt: "p".into(),
                retry_count: u32::from(!passed),
                outcome: if passed {
                    AttemptOutcome::Passed
                } else {
                    AttemptOutcome::FailedGrading
                },
                error: (!passed).then(|| "unexpected value | 3".to_string()),
                timeout_secs: 30,
                recorded_at_unix_ms: 0,
            },
            refined_prompt: None,
        }
    }

    #[test]
    fn run_report_has_summary_and_task_rows() {
        let runs = vec![
            ModelRun {
                model_id: "m".into(),
                reports: vec![report("swap", true), report("stack", false)],
                skipped: false,
                stopped: false,
            },
            ModelRun {
                model_id: "text-embedding".into(),
                reports: Vec::new(),
                skipped: true,
                stopped: false,
            },
        ];
        let md = render_runs(&runs);
        assert!(md.contains("| `m` | `2` | `1` | `0.500` | `0.500` | `n/a` | `n/a` | `1` | `0` |"), "{md}");
        assert!(md.contains("| `text-embedding` | skipped (embedding model) |"));
        assert!(md.contains("unexpected value \\| 3"));

        let json = runs_json(&runs);
        assert_eq!(json["models"][0]["summary"]["passed"], 1);
        assert_eq!(json["models"][0]["phases"][1], "failed_terminal");
    }

    #[test]
    fn models_table_lists_hints() {
        let models = vec![Arc::new(ModelDescriptor::new(
            "qwen2.5-coder-7b",
            32768,
            ProviderKind::LmStudio,
            None,
        ))];
        let md = render_models(&models);
        assert!(md.contains("| `qwen2.5-coder-7b` | `32768` | `large` | `7B` | `lmstudio` |"), "{md}");
    }

    #[test]
    fn truncation_is_single_line() {
        assert_eq!(truncate_one_line("a\n  b", 10), "a b");
        assert_eq!(truncate_one_line("abcdef", 4), "abc…");
    }
}
