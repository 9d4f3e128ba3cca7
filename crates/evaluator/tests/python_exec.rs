use broker_evaluator::{
    BenchmarkTask, CodeExecutor, Evaluator, ExecRequest, Invocation, PythonExecutor,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const STACK: &str = r#"```python
class Stack:
    def __init__(self):
        self.items = []

    def push(self, item):
        self.items.append(item)

    def pop(self):
        return self.items.pop()

    def is_empty(self):
        return len(self.items) == 0
```"#;

async fn python() -> Option<PythonExecutor> {
    let executor = PythonExecutor::default();
    match executor.probe().await {
        Ok(_) => Some(executor),
        Err(err) => {
            eprintln!("skipping: python3 unavailable ({err})");
            None
        }
    }
}

fn task(method: &str, cases: serde_json::Value) -> BenchmarkTask {
    let text = json!({
        "id": "t",
        "name": "t",
        "type": "class",
        "difficulty": "basic",
        "prompt": "p",
        "evaluation_method": method,
        "test_cases": cases,
    })
    .to_string();
    BenchmarkTask::from_json_str("t.json", &text, None).unwrap()
}

#[tokio::test]
async fn stack_sequences_replay_on_fresh_instances() {
    let Some(executor) = python().await else { return };
    let evaluator = Evaluator::new(Arc::new(executor));
    let task = task(
        "class_eval",
        json!([
            {"sequence": ["push(1)", "push(2)", "pop()"], "expected": 2},
            {"sequence": ["isEmpty()"], "expected": true},
            {"sequence": ["push(1)", "isEmpty()"], "expected": false}
        ]),
    );

    let grade = evaluator.grade(&task, STACK).await;
    assert!(grade.passed, "{grade:?}");
    assert_eq!(grade.score, 1.0);
}

#[tokio::test]
async fn call_func_ignores_formatting() {
    let Some(executor) = python().await else { return };
    let evaluator = Evaluator::new(Arc::new(executor));
    let task = task(
        "exec_call_func",
        json!([
            {"input": {"n": 5}, "expected": 25},
            {"input": {"x": 3}, "expected": 9},
            {"input": [4], "expected": 16}
        ]),
    );

    let tight = "def square(n): return n*n";
    let loose = "```python\n\n\ndef   square( n ):\n\n    # squares\n    return (n\n            * n)\n\n```";
    let tight_grade = evaluator.grade(&task, tight).await;
    let loose_grade = evaluator.grade(&task, loose).await;
    assert!(tight_grade.passed, "{tight_grade:?}");
    assert_eq!(tight_grade, loose_grade);
}

#[tokio::test]
async fn check_state_and_last_value() {
    let Some(executor) = python().await else { return };
    let evaluator = Evaluator::new(Arc::new(executor));

    let swap = task(
        "exec_check_state",
        json!([{"input": {"a": 5, "b": 10}, "expected": {"a": 10, "b": 5}}]),
    );
    assert!(evaluator.grade(&swap, "a, b = b, a\nprint('swapped')").await.passed);

    let squares = task("eval_expression", json!([{"expected": [0, 1, 4, 9, 16]}]));
    assert!(evaluator.grade(&squares, "squares = [x**2 for x in range(5)]").await.passed);
    assert!(evaluator.grade(&squares, "[x*x for x in range(5)]").await.passed);
    assert!(!evaluator.grade(&squares, "squares = [x for x in range(5)]").await.passed);

    let evens = task("eval_expression", json!([{"expected": [0, 4, 16, 36, 64]}]));
    let printed = "result = [x*x for x in range(10) if x % 2 == 0]\nprint(result)";
    let grade = evaluator.grade(&evens, printed).await;
    assert!(grade.passed, "{grade:?}");
    assert!(evaluator.grade(&evens, "evens = [0, 4, 16, 36, 64]\nprint(evens)").await.passed);
}

#[tokio::test]
async fn class_eval_picks_the_class_under_test() {
    let Some(executor) = python().await else { return };
    let evaluator = Evaluator::new(Arc::new(executor));
    let task = task(
        "class_eval",
        json!([
            {"sequence": ["push(1)", "push(2)", "pop()"], "expected": 2},
            {"sequence": ["isEmpty()"], "expected": true}
        ]),
    );

    let stack = STACK.trim_start_matches("```python").trim_end_matches("```");
    let trailing = format!("{stack}\nclass StackTest:\n    def run(self):\n        pass\n");
    let grade = evaluator.grade(&task, &trailing).await;
    assert!(grade.passed, "{grade:?}");

    let leading = "class Node:\n    pass\n\nclass Stack:\n    def __init__(self):\n        self.items = []\n    def push(self, x):\n        self.items.append(x)\n    def pop(self):\n        return self.items.pop()\n    def is_empty(self):\n        return not self.items\n";
    let grade = evaluator.grade(&task, leading).await;
    assert!(grade.passed, "{grade:?}");
}

#[tokio::test]
async fn sets_and_syntax_errors() {
    let Some(executor) = python().await else { return };

    let outcome = executor
        .execute(
            &ExecRequest::new("s = {3, 1, 2}", Invocation::LastValue),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert!(broker_evaluator::values_equal(
        outcome.return_value.as_ref().unwrap(),
        &json!([1, 2, 3])
    ));

    let outcome = executor
        .execute(&ExecRequest::new("def f(:", Invocation::None), Duration::from_secs(10))
        .await
        .unwrap();
    assert!(outcome.error.as_deref().unwrap().starts_with("SyntaxError"));
}

#[tokio::test]
async fn runaway_snippet_is_killed() {
    let Some(executor) = python().await else { return };

    let started = Instant::now();
    let outcome = executor
        .execute(
            &ExecRequest::new("while True:\n    pass", Invocation::None),
            Duration::from_millis(500),
        )
        .await
        .unwrap();
    assert!(outcome.timed_out);
    assert!(started.elapsed() < Duration::from_secs(5));
}
