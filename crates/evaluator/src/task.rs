use crate::SchemaError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use walkdir::WalkDir;

pub type Bindings = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Statement,
    Function,
    Class,
    Algorithm,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Basic,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMethod {
    StringContains,
    ExecCheckState,
    ExecCallFunc,
    EvalExpression,
    ClassEval,
}

impl EvaluationMethod {
    pub const ALL: [Self; 5] = [
        Self::StringContains,
        Self::ExecCheckState,
        Self::ExecCallFunc,
        Self::EvalExpression,
        Self::ClassEval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StringContains => "string_contains",
            Self::ExecCheckState => "exec_check_state",
            Self::ExecCallFunc => "exec_call_func",
            Self::EvalExpression => "eval_expression",
            Self::ClassEval => "class_eval",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == raw)
    }
}

impl fmt::Display for EvaluationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringContainsCase {
    pub expected: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStateCase {
    #[serde(default)]
    pub input: Bindings,
    pub expected: Bindings,
}

/// Arguments for a single function call: keyword (object) or positional (list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallArgs {
    Keyword(Bindings),
    Positional(Vec<Value>),
}

impl Default for CallArgs {
    fn default() -> Self {
        Self::Keyword(Bindings::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFuncCase {
    #[serde(default)]
    pub input: CallArgs,
    pub expected: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionCase {
    #[serde(default)]
    pub input: Bindings,
    pub expected: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassEvalCase {
    pub sequence: Vec<String>,
    pub expected: Value,
}

/// Evaluation method together with its test cases. The pairing is checked at
/// load time so a grader can never see a case shaped for another method.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCases {
    StringContains(Vec<StringContainsCase>),
    ExecCheckState(Vec<CheckStateCase>),
    ExecCallFunc(Vec<CallFuncCase>),
    EvalExpression(Vec<ExpressionCase>),
    ClassEval(Vec<ClassEvalCase>),
}

impl TaskCases {
    pub fn method(&self) -> EvaluationMethod {
        match self {
            Self::StringContains(_) => EvaluationMethod::StringContains,
            Self::ExecCheckState(_) => EvaluationMethod::ExecCheckState,
            Self::ExecCallFunc(_) => EvaluationMethod::ExecCallFunc,
            Self::EvalExpression(_) => EvaluationMethod::EvalExpression,
            Self::ClassEval(_) => EvaluationMethod::ClassEval,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::StringContains(c) => c.len(),
            Self::ExecCheckState(c) => c.len(),
            Self::ExecCallFunc(c) => c.len(),
            Self::EvalExpression(c) => c.len(),
            Self::ClassEval(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn parse(source_name: &str, method: EvaluationMethod, raw: Vec<Value>) -> Result<Self, SchemaError> {
        if raw.is_empty() {
            return Err(SchemaError::EmptyTestCases {
                source_name: source_name.to_string(),
            });
        }
        let cases = match method {
            EvaluationMethod::StringContains => Self::StringContains(parse_cases(source_name, method, raw)?),
            EvaluationMethod::ExecCheckState => Self::ExecCheckState(parse_cases(source_name, method, raw)?),
            EvaluationMethod::ExecCallFunc => Self::ExecCallFunc(parse_cases(source_name, method, raw)?),
            EvaluationMethod::EvalExpression => Self::EvalExpression(parse_cases(source_name, method, raw)?),
            EvaluationMethod::ClassEval => {
                let cases: Vec<ClassEvalCase> = parse_cases(source_name, method, raw)?;
                if let Some(index) = cases.iter().position(|c| c.sequence.is_empty()) {
                    return Err(SchemaError::InvalidTestCase {
                        source_name: source_name.to_string(),
                        method: method.to_string(),
                        index,
                        message: "sequence must not be empty".to_string(),
                    });
                }
                Self::ClassEval(cases)
            }
        };
        Ok(cases)
    }
}

fn parse_cases<T: for<'de> Deserialize<'de>>(
    source_name: &str,
    method: EvaluationMethod,
    raw: Vec<Value>,
) -> Result<Vec<T>, SchemaError> {
    raw.into_iter()
        .enumerate()
        .map(|(index, case)| {
            serde_json::from_value(case).map_err(|e| SchemaError::InvalidTestCase {
                source_name: source_name.to_string(),
                method: method.to_string(),
                index,
                message: e.to_string(),
            })
        })
        .collect()
}

/// One benchmark task. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkTask {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub difficulty: Difficulty,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub cases: TaskCases,
    pub temperature: Option<f32>,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(rename = "type")]
    kind: TaskKind,
    difficulty: Difficulty,
    prompt: String,
    #[serde(default)]
    system_prompt: Option<String>,
    evaluation_method: String,
    test_cases: Vec<Value>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    tags: BTreeSet<String>,
}

impl BenchmarkTask {
    pub fn evaluation_method(&self) -> EvaluationMethod {
        self.cases.method()
    }

    /// Parse one task definition. `default_id` is used when the document has
    /// no `id` (file-backed tasks fall back to the file stem).
    pub fn from_json_str(source_name: &str, text: &str, default_id: Option<&str>) -> Result<Self, SchemaError> {
        let raw: RawTask = serde_json::from_str(text).map_err(|e| SchemaError::Invalid {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;
        Self::from_raw(source_name, raw, default_id)
    }

    fn from_raw(source_name: &str, raw: RawTask, default_id: Option<&str>) -> Result<Self, SchemaError> {
        let method = EvaluationMethod::parse(raw.evaluation_method.trim()).ok_or_else(|| {
            SchemaError::UnknownMethod {
                source_name: source_name.to_string(),
                method: raw.evaluation_method.clone(),
            }
        })?;
        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| default_id.map(str::to_string))
            .ok_or_else(|| SchemaError::Invalid {
                source_name: source_name.to_string(),
                message: "missing field `id`".to_string(),
            })?;
        if raw.prompt.trim().is_empty() {
            return Err(SchemaError::Invalid {
                source_name: source_name.to_string(),
                message: "prompt must not be empty".to_string(),
            });
        }
        let cases = TaskCases::parse(source_name, method, raw.test_cases)?;

        Ok(Self {
            id,
            name: raw.name,
            kind: raw.kind,
            difficulty: raw.difficulty,
            prompt: raw.prompt,
            system_prompt: raw.system_prompt.filter(|s| !s.trim().is_empty()),
            cases,
            temperature: raw.temperature,
            tags: raw.tags,
        })
    }

    /// Human-readable description of what a correct answer produces, handed
    /// to the critic during prompt refinement.
    pub fn expected_shape(&self) -> String {
        fn compact(value: &Value) -> String {
            serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
        }

        let lines: Vec<String> = match &self.cases {
            TaskCases::StringContains(cases) => cases
                .iter()
                .map(|c| format!("response contains {:?}", c.expected))
                .collect(),
            TaskCases::ExecCheckState(cases) => cases
                .iter()
                .map(|c| {
                    format!(
                        "starting from {} the variables end as {}",
                        compact(&Value::Object(c.input.clone())),
                        compact(&Value::Object(c.expected.clone()))
                    )
                })
                .collect(),
            TaskCases::ExecCallFunc(cases) => cases
                .iter()
                .map(|c| {
                    let args = serde_json::to_value(&c.input).unwrap_or(Value::Null);
                    format!("f({}) returns {}", compact(&args), compact(&c.expected))
                })
                .collect(),
            TaskCases::EvalExpression(cases) => cases
                .iter()
                .map(|c| format!("the final expression evaluates to {}", compact(&c.expected)))
                .collect(),
            TaskCases::ClassEval(cases) => cases
                .iter()
                .map(|c| format!("{} -> {}", c.sequence.join(", "), compact(&c.expected)))
                .collect(),
        };
        lines.join("\n")
    }
}

/// An ordered, validated collection of tasks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskSet {
    tasks: Vec<BenchmarkTask>,
}

impl TaskSet {
    /// Build a set, rejecting duplicate ids.
    pub fn new(tasks: Vec<BenchmarkTask>) -> Result<Self, SchemaError> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (idx, task) in tasks.iter().enumerate() {
            if let Some(first) = seen.insert(task.id.as_str(), idx) {
                return Err(SchemaError::DuplicateId {
                    id: task.id.clone(),
                    first: tasks[first].name.clone(),
                    second: task.name.clone(),
                });
            }
        }
        Ok(Self { tasks })
    }

    /// Load every `*.json` under `dir` (recursively, in path order). The
    /// first invalid definition rejects the whole set.
    pub fn load_dir(dir: &Path) -> Result<Self, SchemaError> {
        let dir_name = dir.display().to_string();
        if !dir.is_dir() {
            return Err(SchemaError::Io {
                source_name: dir_name,
                message: "not a directory".to_string(),
            });
        }

        let mut files: Vec<_> = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut tasks = Vec::with_capacity(files.len());
        let mut errors = Vec::new();
        for path in &files {
            let source_name = path.display().to_string();
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) => {
                    errors.push(SchemaError::Io {
                        source_name,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            let stem = path.file_stem().and_then(|s| s.to_str());
            match BenchmarkTask::from_json_str(&source_name, &text, stem) {
                Ok(task) => tasks.push(task),
                Err(err) => errors.push(err),
            }
        }

        if let Some(first) = errors.first().cloned() {
            for err in &errors {
                log::error!("Benchmark validation error: {err}");
            }
            log::warn!(
                "Loaded {} of {} benchmark definitions; rejecting task set",
                tasks.len(),
                files.len()
            );
            return Err(first);
        }
        if tasks.is_empty() {
            return Err(SchemaError::EmptyTaskSet(dir_name));
        }
        Self::new(tasks)
    }

    pub fn tasks(&self) -> &[BenchmarkTask] {
        &self.tasks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BenchmarkTask> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&BenchmarkTask> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

impl<'a> IntoIterator for &'a TaskSet {
    type Item = &'a BenchmarkTask;
    type IntoIter = std::slice::Iter<'a, BenchmarkTask>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STACK_TASK: &str = r#"{
        "id": "class_implementation",
        "name": "Stack class",
        "type": "class",
        "difficulty": "advanced",
        "prompt": "Create a Stack class implementing push, pop, and isEmpty methods using a list.",
        "evaluation_method": "class_eval",
        "test_cases": [
            {"sequence": ["push(1)", "push(2)", "pop()"], "expected": 2},
            {"sequence": ["isEmpty()"], "expected": true}
        ],
        "tags": ["oop", "data-structures"]
    }"#;

    #[test]
    fn parses_class_eval_task() {
        let task = BenchmarkTask::from_json_str("stack.json", STACK_TASK, None).unwrap();
        assert_eq!(task.evaluation_method(), EvaluationMethod::ClassEval);
        assert_eq!(task.kind, TaskKind::Class);
        assert_eq!(task.cases.len(), 2);
        assert!(task.system_prompt.is_none());
        assert!(task.tags.contains("oop"));
        assert_eq!(
            task.expected_shape(),
            "push(1), push(2), pop() -> 2\nisEmpty() -> true"
        );
    }

    #[test]
    fn id_falls_back_to_default() {
        let text = STACK_TASK.replace("\"id\": \"class_implementation\",", "");
        let task = BenchmarkTask::from_json_str("stack.json", &text, Some("stack")).unwrap();
        assert_eq!(task.id, "stack");
    }

    #[test]
    fn rejects_unknown_method() {
        let text = STACK_TASK.replace("class_eval", "vibes_check");
        let err = BenchmarkTask::from_json_str("stack.json", &text, None).unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownMethod {
                source_name: "stack.json".into(),
                method: "vibes_check".into()
            }
        );
    }

    #[test]
    fn rejects_empty_test_cases() {
        let text = r#"{"id":"t","name":"t","type":"statement","difficulty":"basic",
            "prompt":"p","evaluation_method":"string_contains","test_cases":[]}"#;
        let err = BenchmarkTask::from_json_str("t.json", text, None).unwrap_err();
        assert!(matches!(err, SchemaError::EmptyTestCases { .. }), "{err:?}");
    }

    #[test]
    fn rejects_case_shape_mismatch() {
        let text = r#"{"id":"t","name":"t","type":"statement","difficulty":"basic",
            "prompt":"p","evaluation_method":"exec_check_state",
            "test_cases":[{"input":{"x":1},"expected":{"x":2}},{"input":{},"expected":5}]}"#;
        let err = BenchmarkTask::from_json_str("t.json", text, None).unwrap_err();
        match err {
            SchemaError::InvalidTestCase { index, method, .. } => {
                assert_eq!(index, 1);
                assert_eq!(method, "exec_check_state");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let text = r#"{"id":"t","name":"t","type":"statement","difficulty":"basic",
            "prompt":"p","evaluation_method":"string_contains","test_cases":[{"expected":77}]}"#;
        assert!(BenchmarkTask::from_json_str("t.json", text, None).is_err());
    }

    #[test]
    fn call_args_accept_objects_and_lists() {
        let case: CallFuncCase = serde_json::from_str(r#"{"input":{"n":5},"expected":25}"#).unwrap();
        assert!(matches!(case.input, CallArgs::Keyword(_)));
        let case: CallFuncCase = serde_json::from_str(r#"{"input":[1,2],"expected":3}"#).unwrap();
        assert!(matches!(case.input, CallArgs::Positional(_)));
    }

    #[test]
    fn load_dir_reads_nested_files_in_order_and_rejects_bad_sets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.json"), STACK_TASK.replace("class_implementation", "b")).unwrap();
        std::fs::write(
            dir.path().join("nested/a.json"),
            STACK_TASK.replace("\"id\": \"class_implementation\",", ""),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let set = TaskSet::load_dir(dir.path()).unwrap();
        let ids: Vec<&str> = set.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        std::fs::write(dir.path().join("c.json"), "{ not json").unwrap();
        let err = TaskSet::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { .. }), "{err:?}");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let a = BenchmarkTask::from_json_str("a.json", STACK_TASK, None).unwrap();
        let err = TaskSet::new(vec![a.clone(), a]).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateId { .. }));
    }
}
