use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::ExecutionError;

/// Most combined output kept for a failure report. The tail is kept, since
/// that is where workflow engines print the error.
pub const OUTPUT_LIMIT: usize = 64 * 1024;

const TRUNCATION_MARKER: &str = "...[output truncated, showing the last 64 KiB]...\n";

/// How long to keep reading pipes after the process is gone. Children of the
/// workflow engine can hold them open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Pipes are read in fixed-size chunks, so a newline-free stream never
/// buffers more than this before it reaches the [`OutputBuffer`].
const READ_CHUNK: usize = 8 * 1024;

/// A workflow run that exited with code 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub output: String,
}

/// Runs one workflow to completion.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Block until the workflow exits or `cancel` fires. Cancelling kills
    /// the process and yields [`ExecutionError::Aborted`].
    async fn run(
        &self,
        workflow_path: &Path,
        parameter_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError>;
}

/// Launches `<engine> [args..] <workflow_path> <parameter_file>`.
#[derive(Debug, Clone)]
pub struct WorkflowExecutor {
    engine: String,
    engine_args: Vec<String>,
    output_limit: usize,
}

impl WorkflowExecutor {
    pub fn new(engine: impl Into<String>, engine_args: Vec<String>) -> Self {
        Self {
            engine: engine.into(),
            engine_args,
            output_limit: OUTPUT_LIMIT,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.workflow_engine.clone(),
            config.workflow_engine_args.clone(),
        )
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    fn classify(
        &self,
        status: std::io::Result<ExitStatus>,
        output: String,
    ) -> Result<ExecutionResult, ExecutionError> {
        match status {
            Ok(status) if status.success() => Ok(ExecutionResult {
                exit_code: 0,
                output,
            }),
            Ok(status) => Err(ExecutionError::Failed {
                code: status.code(),
                output,
            }),
            Err(e) => Err(ExecutionError::Failed {
                code: None,
                output: format!("{}failed waiting for {}: {}\n", output, self.engine, e),
            }),
        }
    }
}

#[async_trait]
impl ProcessSupervisor for WorkflowExecutor {
    async fn run(
        &self,
        workflow_path: &Path,
        parameter_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Aborted {
                output: String::new(),
            });
        }

        tracing::info!(
            engine = %self.engine,
            workflow_path = %workflow_path.display(),
            parameter_file = %parameter_file.display(),
            "Launching workflow"
        );

        let mut child = Command::new(&self.engine)
            .args(&self.engine_args)
            .arg(workflow_path)
            .arg(parameter_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Launch {
                program: self.engine.clone(),
                source,
            })?;

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.output_limit)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, buffer.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, buffer.clone()));
        }

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let Some(status) = status else {
            tracing::warn!(pid = ?child.id(), "Abort requested, killing workflow process");
            if let Err(e) = child.kill().await {
                tracing::error!(error = %e, "Failed to kill workflow process");
            }
            drain(readers).await;
            return Err(ExecutionError::Aborted {
                output: take_output(&buffer),
            });
        };

        drain(readers).await;
        let output = take_output(&buffer);
        self.classify(status, output)
    }
}

fn spawn_reader<R>(pipe: R, buffer: Arc<Mutex<OutputBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(read_output(pipe, buffer))
}

async fn read_output<R>(mut pipe: R, buffer: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    // Bytes of a UTF-8 sequence split across two reads.
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                let text = take_decoded(&mut pending);
                push_output(&buffer, &text);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error reading workflow output");
                break;
            }
        }
    }
    if !pending.is_empty() {
        push_output(&buffer, &String::from_utf8_lossy(&pending));
    }
}

/// Decode everything in `pending` except an incomplete trailing sequence.
fn take_decoded(pending: &mut Vec<u8>) -> String {
    let complete = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let text = String::from_utf8_lossy(&pending[..complete]).into_owned();
    pending.drain(..complete);
    text
}

fn push_output(buffer: &Arc<Mutex<OutputBuffer>>, text: &str) {
    buffer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(text);
}

async fn drain(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut reader)
            .await
            .is_err()
        {
            tracing::debug!("Workflow output pipe still open after exit, abandoning it");
            reader.abort();
        }
    }
}

fn take_output(buffer: &Arc<Mutex<OutputBuffer>>) -> String {
    buffer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .render()
}

/// Interleaved stdout/stderr, bounded to the last `limit` bytes.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > self.limit {
            let mut start = self.text.len() - self.limit;
            while !self.text.is_char_boundary(start) {
                start += 1;
            }
            self.text.drain(..start);
            self.truncated = true;
        }
    }

    pub(crate) fn render(&self) -> String {
        if self.truncated {
            format!("{}{}", TRUNCATION_MARKER, self.text)
        } else {
            self.text.clone()
        }
    }
}
