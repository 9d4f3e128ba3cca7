//! # Broker Evaluator
//!
//! Benchmark task schema and the grading strategies that run against model
//! responses.
//!
//! ```text
//! task JSON ──> TaskSet::load_dir ──> BenchmarkTask { cases: TaskCases }
//!                                          │
//! response ──> strip_think / extract_code ─┤
//!                                          ▼
//!                         Evaluator::grade ──> CodeExecutor ──> TaskGrade
//!                                                 (PythonExecutor)
//! ```
//!
//! Grading never fails. Syntax errors, exceptions, timeouts and backend
//! faults all become failing [`CaseVerdict`]s; only task loading reports
//! errors ([`SchemaError`]).

mod compare;
mod engine;
mod error;
mod executor;
mod python;
mod response;
mod task;

pub use compare::{values_equal, SET_MARKER};
pub use engine::{CaseVerdict, Evaluator, TaskGrade, DEFAULT_CASE_TIMEOUT};
pub use error::{ExecError, SchemaError};
pub use executor::{CodeExecutor, ExecOutcome, ExecRequest, Invocation};
pub use python::{PythonExecutor, DEFAULT_PYTHON};
pub use response::{extract_code, strip_think};
pub use task::{
    BenchmarkTask, Bindings, CallArgs, CallFuncCase, CheckStateCase, ClassEvalCase, Difficulty,
    EvaluationMethod, ExpressionCase, StringContainsCase, TaskCases, TaskKind, TaskSet,
};
