//! # Broker Harness
//!
//! Runs benchmark tasks against models and keeps what it learns.
//!
//! ## Per task
//!
//! ```text
//! Pending ──> Running ──> Passed
//!               │
//!               └──> FailedRetryable ──(critic refines prompt)──> Running ──> Passed
//!                                                                   └──> FailedTerminal
//! ```
//!
//! - The completion bound follows the model size (30s / 60s / 120s). A
//!   provider timeout escalates the bound for the retry.
//! - One retry per task, whatever the cause. Exactly one [`BenchmarkResult`]
//!   is persisted per run, before the next task starts.
//! - Tasks of one model run in order; models may run concurrently since each
//!   owns its own [`ModelState`].

mod error;
mod harness;
mod refine;
mod standard;
mod state;
mod store;
mod summary;
mod timeout;

pub use error::{HarnessError, Result, StoreError};
pub use harness::{BenchmarkHarness, ModelRun, TaskPhase, TaskReport, DEFAULT_TEMPERATURE};
pub use refine::{PromptRefiner, DEFAULT_CRITIC_TIMEOUT};
pub use standard::standard_tasks;
pub use state::{AttemptOutcome, BenchmarkResult, ModelState, STATE_SCHEMA_VERSION};
pub use store::{JsonStateStore, MemoryStateStore, StateStore};
pub use summary::{pass_at_k, ModelRunSummary, PASS_AT_K};
pub use timeout::TimeoutPolicy;
