//! Error types for warden-sandbox
//!
//! Every failure surfaced by either backend maps onto one of four kinds:
//! `capability`, `timeout`, `memory` or `runtime`. A non-zero exit status is
//! never an error; it travels through [`SandboxOutput::exit_code`].
//!
//! [`SandboxOutput::exit_code`]: crate::output::SandboxOutput::exit_code

use crate::deadline::DeadlineExceeded;
use crate::policy::Capability;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed underlying cause attached to runtime errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of an execution failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The policy denies the attempted operation
    Capability,
    /// The deadline elapsed (or the caller cancelled)
    Timeout,
    /// A resource ceiling was exceeded
    Memory,
    /// Any other backend failure
    Runtime,
}

impl ErrorKind {
    /// Stable lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capability => "capability",
            Self::Timeout => "timeout",
            Self::Memory => "memory",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output captured before an execution unit was killed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialOutput {
    /// Standard output received before the deadline
    pub stdout: Vec<u8>,
    /// Standard error received before the deadline
    pub stderr: Vec<u8>,
}

/// Sandbox error type
#[derive(Debug, Error)]
pub enum Error {
    /// Policy violation, always raised before any side effect
    #[error("capability: {0}")]
    Capability(String),

    /// Deadline exceeded; the execution unit has been torn down
    #[error("timeout: execution exceeded timeout of {timeout:?}")]
    Timeout {
        /// The budget that was exceeded
        timeout: Duration,
        /// Output collected before the kill, when the backend could keep it
        partial: Option<PartialOutput>,
        /// Always the generic deadline condition
        #[source]
        source: DeadlineExceeded,
    },

    /// Instruction budget used up before the module finished
    #[error("timeout: execution exhausted fuel limit of {limit} instructions")]
    FuelExhausted {
        /// The configured fuel budget
        limit: u64,
        /// Reported like any other deadline
        #[source]
        source: DeadlineExceeded,
    },

    /// Resource ceiling exceeded
    #[error("memory: memory limit exceeded: {used} bytes used, {limit} bytes allowed")]
    Memory {
        /// Bytes in use when the limit was hit
        used: u64,
        /// Configured ceiling in bytes
        limit: u64,
    },

    /// Everything else: compile errors, daemon failures, spawn failures, I/O
    #[error("runtime: {message}{}", display_cause(.source))]
    Runtime {
        /// What was being attempted
        message: String,
        /// Underlying error, if any
        #[source]
        source: Option<BoxError>,
    },
}

fn display_cause(source: &Option<BoxError>) -> String {
    source
        .as_ref()
        .map(|cause| format!(": {cause}"))
        .unwrap_or_default()
}

impl Error {
    /// `operation "<op>" requires capability "<cap>"`
    #[must_use]
    pub fn missing_capability(capability: Capability, operation: &str) -> Self {
        Self::Capability(format!(
            "operation \"{operation}\" requires capability \"{capability}\""
        ))
    }

    /// A policy denial with a custom message
    #[must_use]
    pub fn denied(message: impl Into<String>) -> Self {
        Self::Capability(message.into())
    }

    /// The execution ran past `timeout`
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout,
            partial: None,
            source: DeadlineExceeded,
        }
    }

    /// Fuel budget exhausted; reported as a timeout since fuel stands in for wall-clock time
    #[must_use]
    pub fn fuel_exhausted(limit: u64) -> Self {
        Self::FuelExhausted {
            limit,
            source: DeadlineExceeded,
        }
    }

    /// Memory ceiling exceeded
    #[must_use]
    pub fn memory(limit: u64, used: u64) -> Self {
        Self::Memory { used, limit }
    }

    /// Runtime failure without an underlying cause
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Runtime failure wrapping `cause`
    #[must_use]
    pub fn runtime_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    /// Attach partial output to a timeout error; other kinds are returned unchanged
    #[must_use]
    pub fn with_partial(self, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        match self {
            Self::Timeout {
                timeout, source, ..
            } => Self::Timeout {
                timeout,
                partial: Some(PartialOutput { stdout, stderr }),
                source,
            },
            other => other,
        }
    }

    /// The taxonomy bucket of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Capability(_) => ErrorKind::Capability,
            Self::Timeout { .. } | Self::FuelExhausted { .. } => ErrorKind::Timeout,
            Self::Memory { .. } => ErrorKind::Memory,
            Self::Runtime { .. } => ErrorKind::Runtime,
        }
    }

    /// Partial output attached to a timeout, if any
    #[must_use]
    pub fn partial_output(&self) -> Option<&PartialOutput> {
        match self {
            Self::Timeout { partial, .. } => partial.as_ref(),
            _ => None,
        }
    }

    /// Whether the error is worth retrying at the caller's discretion
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Runtime)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::runtime_with("io error", err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
