//! Output from sandboxed execution

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

/// Output from sandboxed execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOutput {
    /// Standard output, capped at the policy's `max_output_bytes`
    pub stdout: Vec<u8>,
    /// Standard error, capped at the policy's `max_output_bytes`
    pub stderr: Vec<u8>,
    /// Exit code reported by the module, process or container
    pub exit_code: i32,
    /// Wall-clock time spent executing
    pub duration: Duration,
    /// Peak linear memory in bytes (bytecode backend only)
    pub memory_used_bytes: u64,
    /// Instructions charged against the fuel budget (bytecode backend only)
    pub fuel_consumed: u64,
}

impl SandboxOutput {
    /// Create a successful output
    #[must_use]
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Create a failed output
    #[must_use]
    pub fn failure(stderr: impl Into<Vec<u8>>, exit_code: i32) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Self::default()
        }
    }

    /// Attach the measured duration
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Whether the unit exited with status 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output decoded lossily
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Get combined output
    #[must_use]
    pub fn combined_output(&self) -> String {
        let stdout = self.stdout_lossy();
        let stderr = self.stderr_lossy();
        if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{stdout}\n{stderr}")
        }
    }
}

/// Byte sink that keeps at most `limit` bytes and silently drops the rest
///
/// Writes always report the full length so producers never see a short write.
#[derive(Debug, Clone, Default)]
pub struct LimitedBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl LimitedBuffer {
    /// Empty buffer holding up to `limit` bytes
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Append what fits; returns the number of bytes kept
    pub fn push(&mut self, data: &[u8]) -> usize {
        let room = self.limit.saturating_sub(self.buf.len());
        let kept = room.min(data.len());
        self.buf.extend_from_slice(&data[..kept]);
        kept
    }

    /// Captured bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Whether the cap has been reached
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.limit
    }

    /// Consume into the captured bytes
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl io::Write for LimitedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.push(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_limited_buffer_discards_overflow() {
        let mut buffer = LimitedBuffer::new(5);
        assert_eq!(buffer.write(b"abc").unwrap(), 3);
        assert_eq!(buffer.write(b"defgh").unwrap(), 5);
        assert!(buffer.is_full());
        assert_eq!(buffer.write(b"ijk").unwrap(), 3);
        assert_eq!(buffer.into_inner(), b"abcde");
    }

    #[test]
    fn test_combined_output() {
        let output = SandboxOutput {
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
            ..SandboxOutput::default()
        };
        assert_eq!(output.combined_output(), "out\nerr");
        assert_eq!(SandboxOutput::success("ok").combined_output(), "ok");

        let failed = SandboxOutput::failure("boom", 2);
        assert!(!failed.is_success());
        assert_eq!(failed.combined_output(), "boom");
    }
}
