use crate::executor::{CodeExecutor, ExecOutcome, ExecRequest};
use crate::ExecError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

const DRIVER: &str = include_str!("python/driver.py");
const RESULT_MARKER: &str = "__BROKER_RESULT__";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const STDERR_TAIL_CHARS: usize = 400;

pub const DEFAULT_PYTHON: &str = "python3";

/// Runs each request in a fresh `python3 -I` child process.
///
/// The request travels as JSON on stdin; the driver prints one marked result
/// line on stdout. A child that outlives its bound is killed.
#[derive(Debug, Clone)]
pub struct PythonExecutor {
    interpreter: String,
}

impl Default for PythonExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_PYTHON)
    }
}

impl PythonExecutor {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    /// Check that the interpreter starts, returning its version string.
    pub async fn probe(&self) -> Result<String, ExecError> {
        let output = timeout(
            PROBE_TIMEOUT,
            Command::new(&self.interpreter)
                .arg("-I")
                .arg("-c")
                .arg("import sys; print(sys.version.split()[0])")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ExecError::Protocol(format!("{} did not answer within {PROBE_TIMEOUT:?}", self.interpreter)))?
        .map_err(|source| self.spawn_error(source))?;

        if !output.status.success() {
            return Err(ExecError::Protocol(format!(
                "{} exited with {}",
                self.interpreter, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn spawn_error(&self, source: std::io::Error) -> ExecError {
        ExecError::Spawn {
            interpreter: self.interpreter.clone(),
            source,
        }
    }

    async fn run(&self, payload: Vec<u8>) -> Result<std::process::Output, ExecError> {
        let mut child = Command::new(&self.interpreter)
            .arg("-I")
            .arg("-c")
            .arg(DRIVER)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| self.spawn_error(source))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }
        Ok(child.wait_with_output().await?)
    }
}

#[async_trait]
impl CodeExecutor for PythonExecutor {
    async fn execute(&self, request: &ExecRequest, bound: Duration) -> Result<ExecOutcome, ExecError> {
        let payload = serde_json::to_vec(request)?;
        let output = match timeout(bound, self.run(payload)).await {
            Ok(output) => output?,
            Err(_) => {
                log::debug!("snippet exceeded {bound:?}; child killed");
                return Ok(ExecOutcome::timed_out());
            }
        };
        parse_output(&output.stdout, &output.stderr, output.status.success())
    }
}

fn parse_output(stdout: &[u8], stderr: &[u8], success: bool) -> Result<ExecOutcome, ExecError> {
    let stdout = String::from_utf8_lossy(stdout);
    let marked = stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(RESULT_MARKER));

    match marked {
        Some(json) => Ok(serde_json::from_str(json)?),
        None => {
            let stderr = String::from_utf8_lossy(stderr);
            let tail = stderr_tail(&stderr);
            let message = if success {
                "snippet exited before producing a result".to_string()
            } else if tail.is_empty() {
                "interpreter exited abnormally".to_string()
            } else {
                tail
            };
            Ok(ExecOutcome::failed(message))
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_last_marked_line() {
        let stdout = format!(
            "noise\n{RESULT_MARKER}{{\"bindings_after\":{{}},\"return_value\":1,\"error\":null}}\n\
             {RESULT_MARKER}{{\"bindings_after\":{{\"x\":2}},\"return_value\":3,\"error\":null}}\n"
        );
        let outcome = parse_output(stdout.as_bytes(), b"", true).unwrap();
        assert_eq!(outcome.return_value, Some(json!(3)));
        assert_eq!(outcome.bindings_after.get("x"), Some(&json!(2)));
        assert!(outcome.is_ok());
    }

    #[test]
    fn missing_marker_is_a_snippet_failure() {
        let outcome = parse_output(b"", b"Traceback...\nMemoryError\n", false).unwrap();
        assert_eq!(outcome.error.as_deref(), Some("Traceback...\nMemoryError"));
        assert!(!outcome.timed_out);
    }

    #[test]
    fn garbled_result_is_a_protocol_error() {
        let stdout = format!("{RESULT_MARKER}{{not json\n");
        assert!(matches!(
            parse_output(stdout.as_bytes(), b"", true),
            Err(ExecError::Json(_))
        ));
    }
}
