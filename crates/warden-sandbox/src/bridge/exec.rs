//! `exec_run` and the higher-level `execute_command`

use super::HostBridge;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::output::{LimitedBuffer, SandboxOutput};
use crate::policy::Capability;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Captured result of an allow-listed subprocess
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Standard output, capped at `max_output_bytes`
    pub stdout: Vec<u8>,
    /// Standard error, capped at `max_output_bytes`
    pub stderr: Vec<u8>,
    /// Exit status; -1 when the process was killed by a signal
    pub exit_code: i32,
}

type SharedBuffer = Arc<Mutex<LimitedBuffer>>;

impl HostBridge {
    /// Run an allow-listed command with captured, capped output
    ///
    /// A non-zero exit is returned as a normal [`ProcessOutput`]. When the
    /// deadline (or the policy timeout) fires the process is killed and a
    /// timeout error carrying the partial output is returned.
    pub async fn exec_run(
        &self,
        command: &str,
        args: &[String],
        deadline: &Deadline,
    ) -> Result<ProcessOutput> {
        self.run_process(command, args, None, deadline).await
    }

    /// Run a command and package the outcome as a [`SandboxOutput`]
    #[instrument(skip(self, args, stdin, deadline), fields(command = %command))]
    pub async fn execute_command(
        &self,
        command: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
        deadline: &Deadline,
    ) -> Result<SandboxOutput> {
        let started = Instant::now();
        let output = self
            .run_process(command, args, stdin.as_deref(), deadline)
            .await?;
        let duration = started.elapsed();

        info!(
            exit_code = output.exit_code,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            duration_ms = duration.as_millis() as u64,
            "Command execution completed"
        );

        Ok(SandboxOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration,
            ..SandboxOutput::default()
        })
    }

    async fn run_process(
        &self,
        command: &str,
        args: &[String],
        stdin: Option<&[u8]>,
        deadline: &Deadline,
    ) -> Result<ProcessOutput> {
        self.check_capability(Capability::ExecRun, "exec_run")?;
        self.validate_command(command)?;

        let deadline = deadline.tighten(self.policy.timeout());
        if deadline.is_expired() {
            return Err(Error::timeout(deadline.timeout()));
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.policy.working_dir() {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::runtime_with(format!("failed to start command {command:?}"), e))?;
        debug!(command = %command, pid = ?child.id(), "process started");

        let limit = self.policy.max_output_bytes();
        let stdout = SharedBuffer::new(Mutex::new(LimitedBuffer::new(limit)));
        let stderr = SharedBuffer::new(Mutex::new(LimitedBuffer::new(limit)));
        let mut drains = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            drains.push(tokio::spawn(drain(pipe, Arc::clone(&stdout))));
        }
        if let Some(pipe) = child.stderr.take() {
            drains.push(tokio::spawn(drain(pipe, Arc::clone(&stderr))));
        }

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let data = data.to_vec();
            tokio::spawn(async move {
                // The child may exit without reading; a broken pipe is expected then
                let _ = pipe.write_all(&data).await;
                let _ = pipe.shutdown().await;
            });
        }

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = deadline.expired() => None,
        };

        match status {
            Some(status) => {
                let status = status
                    .map_err(|e| Error::runtime_with(format!("failed to wait for {command:?}"), e))?;
                finish_drains(drains, &deadline).await;
                Ok(ProcessOutput {
                    stdout: take(&stdout),
                    stderr: take(&stderr),
                    exit_code: status.code().unwrap_or(-1),
                })
            }
            None => {
                warn!(command = %command, timeout = ?deadline.timeout(), "process exceeded deadline, killing");
                let cleanup = Deadline::cleanup();
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "kill failed");
                }
                let _ = cleanup.run(child.wait()).await;
                finish_drains(drains, &cleanup).await;
                Err(Error::timeout(deadline.timeout()).with_partial(take(&stdout), take(&stderr)))
            }
        }
    }
}

async fn drain<R>(mut pipe: R, sink: SharedBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut sink) = sink.lock() {
                    sink.push(&chunk[..n]);
                }
            }
        }
    }
}

/// Wait for the pipe readers, abandoning them once `deadline` passes
async fn finish_drains(drains: Vec<JoinHandle<()>>, deadline: &Deadline) {
    for handle in drains {
        let abort = handle.abort_handle();
        if deadline.run(handle).await.is_err() {
            abort.abort();
        }
    }
}

fn take(buffer: &SharedBuffer) -> Vec<u8> {
    buffer
        .lock()
        .map(|mut sink| std::mem::take(&mut *sink).into_inner())
        .unwrap_or_default()
}
