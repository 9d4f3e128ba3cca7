use crate::state::{AttemptOutcome, BenchmarkResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PASS_AT_K: [u32; 3] = [1, 5, 10];

/// Aggregate view of one model's benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRunSummary {
    pub model_id: String,
    pub tasks_run: usize,
    pub passed: usize,
    pub average_score: f64,
    pub provider_failures: usize,
    pub retried: usize,
    /// `pass@k` keyed by k. Absent when fewer than k tasks ran.
    pub pass_at_k: BTreeMap<u32, f64>,
}

impl ModelRunSummary {
    pub fn from_results<'a>(model_id: &str, results: impl IntoIterator<Item = &'a BenchmarkResult>) -> Self {
        let mut tasks_run = 0usize;
        let mut passed = 0usize;
        let mut score_sum = 0.0;
        let mut provider_failures = 0usize;
        let mut retried = 0usize;
        for result in results {
            tasks_run += 1;
            score_sum += result.score;
            if result.passed {
                passed += 1;
            }
            if result.outcome == AttemptOutcome::ProviderError {
                provider_failures += 1;
            }
            if result.retry_count > 0 {
                retried += 1;
            }
        }

        let pass_at_k = PASS_AT_K
            .iter()
            .filter_map(|&k| pass_at_k(tasks_run as u64, passed as u64, u64::from(k)).map(|p| (k, p)))
            .collect();

        Self {
            model_id: model_id.to_string(),
            tasks_run,
            passed,
            average_score: if tasks_run == 0 { 0.0 } else { score_sum / tasks_run as f64 },
            provider_failures,
            retried,
            pass_at_k,
        }
    }
}

/// Unbiased pass@k estimator (Chen et al., 2021) over `n` samples of which
/// `c` passed: `1 - C(n-c, k) / C(n, k)`, evaluated as a running product.
pub fn pass_at_k(n: u64, c: u64, k: u64) -> Option<f64> {
    if k == 0 || n < k || c > n {
        return None;
    }
    if n - c < k {
        return Some(1.0);
    }
    let mut all_fail = 1.0f64;
    for i in (n - c + 1)..=n {
        all_fail *= 1.0 - k as f64 / i as f64;
    }
    Some(1.0 - all_fail)
}
