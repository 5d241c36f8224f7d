//! Backend abstraction and runtime selection

use crate::config::SandboxSettings;
use crate::container::DockerSandbox;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::output::SandboxOutput;
use crate::wasm::WasmBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionRequest {
    /// A module previously compiled under `name`
    Module {
        /// Cache key given to `compile`
        name: String,
        /// Bytes served on fd 0
        stdin: Vec<u8>,
    },
    /// A module compiled, run and discarded in one step
    Bytes {
        /// Binary or text module
        wasm: Vec<u8>,
        /// Bytes served on fd 0
        stdin: Vec<u8>,
    },
    /// An allow-listed command
    Command {
        /// Program name or path
        command: String,
        /// Arguments, passed without a shell
        args: Vec<String>,
        /// Optional standard input
        stdin: Option<Vec<u8>>,
    },
    /// A script for `sh -c`
    Shell {
        /// Shell source
        script: String,
    },
}

impl ExecutionRequest {
    /// Shorthand for a command without stdin
    #[must_use]
    pub fn command(command: impl Into<String>, args: &[&str]) -> Self {
        Self::Command {
            command: command.into(),
            args: args.iter().map(|arg| (*arg).to_string()).collect(),
            stdin: None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Module { .. } => "module",
            Self::Bytes { .. } => "bytes",
            Self::Command { .. } => "command",
            Self::Shell { .. } => "shell",
        }
    }
}

/// An isolation technology able to run [`ExecutionRequest`]s
#[async_trait::async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short backend identifier
    fn name(&self) -> &'static str;

    /// Whether this backend can run `request` at all
    fn supports(&self, request: &ExecutionRequest) -> bool;

    /// Run `request` under `deadline`
    async fn execute(&self, request: ExecutionRequest, deadline: Deadline)
        -> Result<SandboxOutput>;
}

fn unsupported(backend: &dyn SandboxBackend, request: &ExecutionRequest) -> Error {
    Error::runtime(format!(
        "{} backend does not support {} requests",
        backend.name(),
        request.label()
    ))
}

#[async_trait::async_trait]
impl SandboxBackend for WasmBackend {
    fn name(&self) -> &'static str {
        "bytecode"
    }

    fn supports(&self, request: &ExecutionRequest) -> bool {
        !matches!(request, ExecutionRequest::Shell { .. })
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        deadline: Deadline,
    ) -> Result<SandboxOutput> {
        match request {
            ExecutionRequest::Module { name, stdin } => {
                WasmBackend::execute(self, &name, stdin, &deadline).await
            }
            ExecutionRequest::Bytes { wasm, stdin } => {
                self.execute_bytes(wasm, stdin, &deadline).await
            }
            ExecutionRequest::Command {
                command,
                args,
                stdin,
            } => {
                self.bridge()
                    .execute_command(&command, &args, stdin, &deadline)
                    .await
            }
            other @ ExecutionRequest::Shell { .. } => Err(unsupported(self, &other)),
        }
    }
}

#[async_trait::async_trait]
impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "container"
    }

    fn supports(&self, request: &ExecutionRequest) -> bool {
        matches!(
            request,
            ExecutionRequest::Command { .. } | ExecutionRequest::Shell { .. }
        )
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        deadline: Deadline,
    ) -> Result<SandboxOutput> {
        match request {
            ExecutionRequest::Command {
                command,
                args,
                stdin: Some(stdin),
            } => self.run_with_stdin(&command, &args, stdin, &deadline).await,
            ExecutionRequest::Command {
                command,
                args,
                stdin: None,
            } => self.run(&command, &args, &deadline).await,
            ExecutionRequest::Shell { script } => self.run_shell(&script, &deadline).await,
            other => Err(unsupported(self, &other)),
        }
    }
}

/// Which backend to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process WebAssembly VM
    Bytecode,
    /// Docker containers
    Container,
    /// Containers when a daemon answers, bytecode otherwise
    #[default]
    Auto,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bytecode => "bytecode",
            Self::Container => "container",
            Self::Auto => "auto",
        })
    }
}

/// Build the backend selected by `settings`
pub async fn connect_backend(settings: &SandboxSettings) -> Result<Arc<dyn SandboxBackend>> {
    let kind = match settings.backend {
        BackendKind::Auto => {
            if DockerSandbox::is_docker_available().await {
                BackendKind::Container
            } else {
                warn!("No container daemon reachable - using bytecode backend");
                BackendKind::Bytecode
            }
        }
        kind => kind,
    };

    let backend: Arc<dyn SandboxBackend> = match kind {
        BackendKind::Container => Arc::new(
            DockerSandbox::connect(settings.docker.clone(), Some(settings.policy.clone())).await?,
        ),
        _ => Arc::new(WasmBackend::new(settings.policy.clone())?),
    };

    info!(
        backend = backend.name(),
        requested = %settings.backend,
        "Sandbox backend initialized"
    );
    Ok(backend)
}
