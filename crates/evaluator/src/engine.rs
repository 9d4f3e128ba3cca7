use crate::compare::values_equal;
use crate::executor::{CodeExecutor, ExecOutcome, ExecRequest, Invocation};
use crate::python::PythonExecutor;
use crate::response::{extract_code, strip_think};
use crate::task::{BenchmarkTask, TaskCases};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CASE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseVerdict {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
}

impl CaseVerdict {
    fn pass() -> Self {
        Self {
            passed: true,
            error: None,
            timed_out: false,
        }
    }

    fn fail(error: Option<String>) -> Self {
        Self {
            passed: false,
            error,
            timed_out: false,
        }
    }

    fn timeout(bound: Duration) -> Self {
        Self {
            passed: false,
            error: Some(format!("execution exceeded {}s", bound.as_secs_f64())),
            timed_out: true,
        }
    }
}

/// Aggregate grade for one response against all cases of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGrade {
    pub passed: bool,
    pub score: f64,
    pub cases: Vec<CaseVerdict>,
}

impl TaskGrade {
    pub fn from_cases(cases: Vec<CaseVerdict>) -> Self {
        let total = cases.len();
        let passed_count = cases.iter().filter(|c| c.passed).count();
        let score = if total == 0 {
            0.0
        } else {
            passed_count as f64 / total as f64
        };
        Self {
            passed: total > 0 && passed_count == total,
            score,
            cases,
        }
    }

    /// First recorded failure, for logs and persisted results.
    pub fn first_error(&self) -> Option<&str> {
        self.cases.iter().find_map(|c| c.error.as_deref())
    }
}

/// Grades model responses. Never fails: every execution problem becomes a
/// failing case verdict.
#[derive(Clone)]
pub struct Evaluator {
    executor: Arc<dyn CodeExecutor>,
    case_timeout: Duration,
}

impl Evaluator {
    pub fn new(executor: Arc<dyn CodeExecutor>) -> Self {
        Self {
            executor,
            case_timeout: DEFAULT_CASE_TIMEOUT,
        }
    }

    pub fn python(interpreter: impl Into<String>) -> Self {
        Self::new(Arc::new(PythonExecutor::new(interpreter)))
    }

    pub fn with_case_timeout(mut self, case_timeout: Duration) -> Self {
        self.case_timeout = case_timeout;
        self
    }

    pub fn case_timeout(&self) -> Duration {
        self.case_timeout
    }

    pub async fn grade(&self, task: &BenchmarkTask, response: &str) -> TaskGrade {
        let verdicts = match &task.cases {
            TaskCases::StringContains(cases) => {
                let text = strip_think(response);
                cases
                    .iter()
                    .map(|case| {
                        if text.contains(&case.expected) {
                            CaseVerdict::pass()
                        } else {
                            CaseVerdict::fail(Some(format!("response does not contain {:?}", case.expected)))
                        }
                    })
                    .collect()
            }
            TaskCases::ExecCheckState(cases) => {
                let code = extract_code(response);
                let mut out = Vec::with_capacity(cases.len());
                for case in cases {
                    let request = ExecRequest::new(code.as_str(), Invocation::None).with_bindings(case.input.clone());
                    out.push(
                        self.run_case(&request, |outcome| {
                            case.expected.iter().all(|(key, want)| {
                                outcome
                                    .bindings_after
                                    .get(key)
                                    .is_some_and(|got| values_equal(got, want))
                            })
                        })
                        .await,
                    );
                }
                out
            }
            TaskCases::ExecCallFunc(cases) => {
                let code = extract_code(response);
                let mut out = Vec::with_capacity(cases.len());
                for case in cases {
                    let request = ExecRequest::new(
                        code.as_str(),
                        Invocation::CallSingleFunction {
                            args: case.input.clone(),
                        },
                    );
                    out.push(self.run_case(&request, |o| returned(o, &case.expected)).await);
                }
                out
            }
            TaskCases::EvalExpression(cases) => {
                let code = extract_code(response);
                let mut out = Vec::with_capacity(cases.len());
                for case in cases {
                    let request =
                        ExecRequest::new(code.as_str(), Invocation::LastValue).with_bindings(case.input.clone());
                    out.push(self.run_case(&request, |o| returned(o, &case.expected)).await);
                }
                out
            }
            TaskCases::ClassEval(cases) => {
                let code = extract_code(response);
                let mut out = Vec::with_capacity(cases.len());
                for case in cases {
                    let request = ExecRequest::new(
                        code.as_str(),
                        Invocation::ReplayClass {
                            sequence: case.sequence.clone(),
                        },
                    );
                    out.push(self.run_case(&request, |o| returned(o, &case.expected)).await);
                }
                out
            }
        };

        let grade = TaskGrade::from_cases(verdicts);
        log::debug!(
            "graded task {} ({}): score {:.2}, passed {}",
            task.id,
            task.evaluation_method(),
            grade.score,
            grade.passed
        );
        grade
    }

    async fn run_case<F>(&self, request: &ExecRequest, check: F) -> CaseVerdict
    where
        F: Fn(&ExecOutcome) -> bool,
    {
        if request.source.trim().is_empty() {
            return CaseVerdict::fail(Some("response contains no code".to_string()));
        }
        match self.executor.execute(request, self.case_timeout).await {
            Ok(outcome) if outcome.timed_out => CaseVerdict::timeout(self.case_timeout),
            Ok(outcome) => match outcome.error {
                Some(error) => CaseVerdict::fail(Some(error)),
                None if check(&outcome) => CaseVerdict::pass(),
                None => CaseVerdict::fail(Some(mismatch_message(&request.invoke, &outcome))),
            },
            Err(err) => {
                log::warn!("code executor failed: {err}");
                CaseVerdict::fail(Some(err.to_string()))
            }
        }
    }
}

fn returned(outcome: &ExecOutcome, expected: &Value) -> bool {
    values_equal(outcome.return_value.as_ref().unwrap_or(&Value::Null), expected)
}

fn mismatch_message(invoke: &Invocation, outcome: &ExecOutcome) -> String {
    if matches!(invoke, Invocation::None) {
        return "resulting state did not match".to_string();
    }
    match &outcome.return_value {
        None | Some(Value::Null) => "no value produced".to_string(),
        Some(value) => format!("unexpected value {value}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeExecutor {
        outcomes: Mutex<Vec<Result<ExecOutcome, String>>>,
        seen: Mutex<Vec<ExecRequest>>,
    }

    impl FakeExecutor {
        fn with(outcomes: Vec<Result<ExecOutcome, String>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<ExecRequest> {
            self.seen.lock().expect("seen lock poisoned").clone()
        }
    }

    #[async_trait]
    impl CodeExecutor for FakeExecutor {
        async fn execute(&self, request: &ExecRequest, _timeout: Duration) -> Result<ExecOutcome, ExecError> {
            self.seen.lock().expect("seen lock poisoned").push(request.clone());
            match self.outcomes.lock().expect("outcomes lock poisoned").pop() {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(message)) => Err(ExecError::Protocol(message)),
                None => Ok(ExecOutcome::failed("no scripted outcome")),
            }
        }
    }

    fn task(method: &str, cases: Value) -> BenchmarkTask {
        let text = json!({
            "id": "t",
            "name": "t",
            "type": "function",
            "difficulty": "basic",
            "prompt": "p",
            "evaluation_method": method,
            "test_cases": cases,
        })
        .to_string();
        BenchmarkTask::from_json_str("t.json", &text, None).unwrap()
    }

    fn returning(value: Value) -> Result<ExecOutcome, String> {
        Ok(ExecOutcome {
            return_value: Some(value),
            ..ExecOutcome::default()
        })
    }

    #[tokio::test]
    async fn string_contains_needs_no_executor() {
        let fake = FakeExecutor::with(vec![]);
        let evaluator = Evaluator::new(fake.clone());
        let task = task("string_contains", json!([{"expected": "77"}]));

        let grade = evaluator.grade(&task, "<think>maybe 76?</think>The number is 77.").await;
        assert!(grade.passed);
        assert_eq!(grade.score, 1.0);

        let grade = evaluator.grade(&task, "<think>it is 77</think>I forgot.").await;
        assert!(!grade.passed);
        assert!(fake.seen().is_empty());
    }

    #[tokio::test]
    async fn check_state_ignores_extra_bindings_and_seeds_input() {
        let mut after = Map::new();
        after.insert("a".into(), json!(10));
        after.insert("b".into(), json!(5));
        after.insert("temp".into(), json!(5));
        let fake = FakeExecutor::with(vec![Ok(ExecOutcome {
            bindings_after: after,
            ..ExecOutcome::default()
        })]);
        let evaluator = Evaluator::new(fake.clone());
        let task = task(
            "exec_check_state",
            json!([{"input": {"a": 5, "b": 10}, "expected": {"a": 10, "b": 5}}]),
        );

        let grade = evaluator
            .grade(&task, "```python\ntemp = a\na = b\nb = temp\n```")
            .await;
        assert!(grade.passed);
        let seen = fake.seen();
        assert_eq!(seen[0].source, "temp = a\na = b\nb = temp");
        assert_eq!(seen[0].bindings.get("a"), Some(&json!(5)));
        assert_eq!(seen[0].invoke, Invocation::None);
    }

    #[tokio::test]
    async fn score_is_fraction_of_passing_cases() {
        let fake = FakeExecutor::with(vec![returning(json!(2)), returning(json!(false))]);
        let evaluator = Evaluator::new(fake);
        let task = task(
            "class_eval",
            json!([
                {"sequence": ["push(1)", "push(2)", "pop()"], "expected": 2},
                {"sequence": ["isEmpty()"], "expected": true}
            ]),
        );

        let grade = evaluator.grade(&task, "class Stack: pass").await;
        assert!(!grade.passed);
        assert_eq!(grade.score, 0.5);
        assert_eq!(grade.cases[1].error.as_deref(), Some("unexpected value false"));
    }

    #[tokio::test]
    async fn mismatch_names_what_went_wrong() {
        let fake = FakeExecutor::with(vec![
            Ok(ExecOutcome::default()),
            returning(Value::Null),
            Ok(ExecOutcome::default()),
        ]);
        let evaluator = Evaluator::new(fake.clone());

        let call = task("exec_call_func", json!([{"input": {"n": 2}, "expected": 4}]));
        let grade = evaluator.grade(&call, "def square(n): n*n").await;
        assert_eq!(grade.cases[0].error.as_deref(), Some("no value produced"));

        let expr = task("eval_expression", json!([{"expected": [1]}]));
        let grade = evaluator.grade(&expr, "print([1])").await;
        assert_eq!(grade.cases[0].error.as_deref(), Some("no value produced"));

        let state = task("exec_check_state", json!([{"input": {"a": 1}, "expected": {"a": 2}}]));
        let grade = evaluator.grade(&state, "a = a").await;
        assert_eq!(grade.cases[0].error.as_deref(), Some("resulting state did not match"));
    }

    #[tokio::test]
    async fn failures_fail_closed() {
        let fake = FakeExecutor::with(vec![
            Ok(ExecOutcome::timed_out()),
            Ok(ExecOutcome::failed("ZeroDivisionError: division by zero")),
            Err("driver vanished".into()),
        ]);
        let evaluator = Evaluator::new(fake).with_case_timeout(Duration::from_secs(2));
        let task = task(
            "exec_call_func",
            json!([
                {"input": {"n": 1}, "expected": 1},
                {"input": {"n": 2}, "expected": 4},
                {"input": {"n": 3}, "expected": 9}
            ]),
        );

        let grade = evaluator.grade(&task, "def square(n): return n*n").await;
        assert_eq!(grade.score, 0.0);
        assert!(grade.cases[0].timed_out);
        assert_eq!(grade.cases[0].error.as_deref(), Some("execution exceeded 2s"));
        assert_eq!(
            grade.cases[1].error.as_deref(),
            Some("ZeroDivisionError: division by zero")
        );
        assert!(grade.cases[2].error.as_deref().unwrap().contains("driver vanished"));
    }

    #[tokio::test]
    async fn empty_code_is_not_executed() {
        let fake = FakeExecutor::with(vec![]);
        let evaluator = Evaluator::new(fake.clone());
        let task = task("eval_expression", json!([{"input": {}, "expected": [0, 1, 4]}]));

        let grade = evaluator.grade(&task, "<think>only thoughts</think>").await;
        assert!(!grade.passed);
        assert!(fake.seen().is_empty());
    }
}
