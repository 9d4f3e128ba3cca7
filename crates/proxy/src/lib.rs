//! # Broker Proxy
//!
//! Sits between a client (an editor agent, a script) and the inference
//! server and caps each completion's `max_tokens` at what the target model
//! can actually produce.
//!
//! ```text
//! client ──> ContextProxy ──> ModelContextCache (lookup / refresh)
//!                 │
//!                 └── rewritten body ──> upstream ──> streamed back as is
//! ```
//!
//! The proxy fails open: when the cache cannot describe a model the request
//! goes upstream unmodified.

mod budget;
mod error;
mod server;

pub use budget::{apply_budget, token_budget, BudgetDecision, RESPONSE_RESERVE_FRACTION};
pub use error::{ProxyError, Result};
pub use server::{ContextProxy, DEFAULT_PROXY_BIND, REWRITE_PATHS};
