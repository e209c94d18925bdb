//! The external analysis/action pipeline seam.
//!
//! Friction scoring, ticket filing and notifications all live behind
//! [`AnalysisActionPipeline`]. Timeouts and retries belong to the
//! implementation, never to the monitor.

use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::PipelineError;

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_STDERR_CHARS: usize = 2000;

/// Performs the side-effecting work for one analyzed session.
///
/// Implementors should:
/// - Return the result payload verbatim; the monitor stores it as `agentResult`
/// - Return `Err` for any failure rather than panicking
pub trait AnalysisActionPipeline: Send + Sync {
    fn process(&self, session_id: &str) -> Result<Value, PipelineError>;
}

impl<F> AnalysisActionPipeline for F
where
    F: Fn(&str) -> Result<Value, PipelineError> + Send + Sync,
{
    fn process(&self, session_id: &str) -> Result<Value, PipelineError> {
        self(session_id)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CommandPipelineConfig {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CommandPipelineConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    120
}

/// Runs an external program per session.
///
/// The session id is passed as the final argument and in `SESSION_ID`.
/// Stdout becomes the result (JSON when it parses, a string otherwise);
/// a non-zero exit or a timeout is a pipeline error.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPipeline {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Returns `None` when no program is configured.
    pub fn from_config(config: &CommandPipelineConfig) -> Option<Self> {
        let program = config.program.as_deref()?.trim();
        if program.is_empty() {
            return None;
        }
        Some(Self::new(
            program,
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        ))
    }
}

impl AnalysisActionPipeline for CommandPipeline {
    fn process(&self, session_id: &str) -> Result<Value, PipelineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(session_id)
            .env("SESSION_ID", session_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                PipelineError::new(format!("Failed to spawn {}: {}", self.program, err))
            })?;

        // Drain both pipes on their own threads so a chatty child cannot block
        // on a full pipe while we wait for it.
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    if let Err(err) = child.kill() {
                        warn!(error = %err, program = %self.program, "Failed to kill timed out pipeline");
                    }
                    let _ = child.wait();
                    return Err(PipelineError::new(format!(
                        "{} timed out after {}s",
                        self.program,
                        self.timeout.as_secs()
                    )));
                }
                Ok(None) => thread::sleep(COMMAND_POLL_INTERVAL),
                Err(err) => {
                    return Err(PipelineError::new(format!(
                        "Failed to wait for {}: {}",
                        self.program, err
                    )))
                }
            }
        };

        let stdout = stdout.map(join_reader).unwrap_or_default();
        let stderr = stderr.map(join_reader).unwrap_or_default();

        if !status.success() {
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                format!("{} exited with {}", self.program, status)
            } else {
                stderr.chars().take(MAX_STDERR_CHARS).collect()
            };
            return Err(PipelineError::new(message));
        }

        debug!(session_id = %session_id, bytes = stdout.len(), "Pipeline command finished");
        Ok(parse_output(&stdout))
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).to_string()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}
