//! Warden Sandbox - capability-gated execution engine
//!
//! Runs untrusted commands and WebAssembly modules under one policy across
//! two isolation backends:
//! - Bytecode: in-process wasmtime VM with fuel, memory and wall-clock limits
//! - Container: ephemeral, hardened Docker containers
//!
//! Host access (files, HTTP, subprocesses) goes through [`HostBridge`],
//! which checks the [`Policy`] before touching anything.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod bridge;
pub mod config;
pub mod container;
pub mod deadline;
pub mod error;
pub mod output;
pub mod policy;
pub mod validator;
pub mod wasm;

pub use backend::{connect_backend, BackendKind, ExecutionRequest, SandboxBackend};
pub use bridge::{HostBridge, HttpResponse, ProcessOutput};
pub use self::config::{load_settings, SandboxSettings};
pub use container::{DockerConfig, DockerMount, DockerSandbox, NetworkMode};
pub use deadline::{Deadline, DeadlineExceeded};
pub use error::{Error, ErrorKind, PartialOutput, Result};
pub use output::{LimitedBuffer, SandboxOutput};
pub use policy::{Capability, Policy};
pub use validator::PathValidator;
pub use wasm::WasmBackend;
