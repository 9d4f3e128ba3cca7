use broker_evaluator::{BenchmarkTask, SchemaError, TaskSet};

const STANDARD_TASKS: &[(&str, &str)] = &[
    ("01_simple_statement.json", include_str!("../benchmarks/01_simple_statement.json")),
    ("02_square_function.json", include_str!("../benchmarks/02_square_function.json")),
    ("03_stack_class.json", include_str!("../benchmarks/03_stack_class.json")),
    ("04_list_comprehension.json", include_str!("../benchmarks/04_list_comprehension.json")),
    ("05_context_window.json", include_str!("../benchmarks/05_context_window.json")),
];

/// The built-in suite used when no task directory is given.
pub fn standard_tasks() -> Result<TaskSet, SchemaError> {
    let tasks = STANDARD_TASKS
        .iter()
        .map(|(name, text)| BenchmarkTask::from_json_str(name, text, None))
        .collect::<Result<Vec<_>, _>>()?;
    TaskSet::new(tasks)
}
