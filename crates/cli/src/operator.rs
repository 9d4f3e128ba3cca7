//! Operator interaction between benchmarked models.
//!
//! The harness never waits on a human. The CLI asks between models and
//! treats silence as "continue".

use std::io::BufRead;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Lines typed on stdin, read by a detached thread so a pending read never
/// holds up runtime shutdown.
pub(crate) struct OperatorInput {
    lines: mpsc::UnboundedReceiver<String>,
}

impl OperatorInput {
    pub(crate) fn spawn() -> Self {
        let (tx, lines) = mpsc::unbounded_channel();
        let spawned = std::thread::Builder::new()
            .name("operator-input".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(err) = spawned {
            log::warn!("Cannot read operator input: {err}");
        }
        Self { lines }
    }

    /// Ask whether to go on with the next model. Anything but `n` (or no
    /// answer within `wait`) continues.
    pub(crate) async fn ask_continue(&mut self, next_model: &str, wait: Duration) -> bool {
        eprintln!(
            "Continue with next model ({next_model})? [Y/n] (continues in {}s)",
            wait.as_secs()
        );
        match tokio::time::timeout(wait, self.lines.recv()).await {
            Ok(Some(answer)) => parse_answer(&answer),
            Ok(None) | Err(_) => true,
        }
    }
}

fn parse_answer(answer: &str) -> bool {
    !matches!(answer.trim().to_ascii_lowercase().as_str(), "n" | "no")
}

/// Flip `stop` on Ctrl-C. Work already persisted stays persisted.
pub(crate) fn stop_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; finishing the current task and stopping");
            let _ = tx.send(true);
        }
    });
    rx
}
