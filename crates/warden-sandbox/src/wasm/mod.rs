//! Bytecode backend - WebAssembly modules on wasmtime
//!
//! Each backend owns one engine, one pre-built linker and an instance-scoped
//! cache of compiled modules. Every execution gets a fresh store with its own
//! memory ceiling, fuel budget and capped stdio, and runs on a blocking
//! thread so the async caller can race it against the deadline.
//!
//! Wall-clock limits use epoch interruption: a ticker thread bumps the engine
//! epoch every [`EPOCH_TICK`], and each store checks its own deadline on
//! every tick.

mod host;
mod runtime;
mod wasi;


pub use host::{
    STATUS_BAD_ARGUMENT, STATUS_CAPABILITY, STATUS_MEMORY, STATUS_RUNTIME, STATUS_TIMEOUT,
};
pub use runtime::WASM_PAGE_SIZE;

use crate::bridge::HostBridge;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::output::SandboxOutput;
use crate::policy::{Policy, MAX_MEMORY_LIMIT_MB};
use runtime::{into_box, run_module, HostState, RunLimits, RunRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use wasmtime::{Config, Engine, Linker, Module};

/// Interval between engine epoch increments
pub const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Program name reported through `args_get` for one-shot executions
const ONE_SHOT_NAME: &str = "module";

/// WebAssembly execution backend
pub struct WasmBackend {
    engine: Engine,
    linker: Linker<HostState>,
    bridge: Arc<HostBridge>,
    limits: RunLimits,
    modules: RwLock<HashMap<String, Module>>,
    _ticker: EpochTicker,
}

impl std::fmt::Debug for WasmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmBackend")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl WasmBackend {
    /// Create a backend enforcing `policy`
    ///
    /// Fails when the memory ceiling exceeds the 4 GiB address space of a
    /// 32-bit module.
    pub fn new(policy: impl Into<Arc<Policy>>) -> Result<Self> {
        let policy: Arc<Policy> = policy.into();
        let memory_limit_mb = policy.memory_limit_mb();
        if memory_limit_mb > MAX_MEMORY_LIMIT_MB {
            return Err(Error::runtime(format!(
                "memory limit of {memory_limit_mb} MB exceeds maximum of {MAX_MEMORY_LIMIT_MB} MB"
            )));
        }

        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config)
            .map_err(|e| Error::runtime_with("failed to create wasm engine", into_box(e)))?;

        let mut linker = Linker::new(&engine);
        wasi::add_to_linker(&mut linker)
            .and_then(|()| host::add_to_linker(&mut linker))
            .map_err(|e| Error::runtime_with("failed to register host functions", into_box(e)))?;

        let pages = u64::from(memory_limit_mb) * 16;
        let limits = RunLimits {
            memory_bytes: pages * WASM_PAGE_SIZE,
            fuel_limit: policy.fuel_limit(),
            max_output_bytes: policy.max_output_bytes(),
            timeout: policy.timeout(),
        };

        let bridge = Arc::new(HostBridge::new(Arc::clone(&policy))?);
        let ticker = EpochTicker::start(engine.clone())?;

        debug!(
            memory_limit_mb,
            fuel_limit = limits.fuel_limit,
            "wasm backend ready"
        );

        Ok(Self {
            engine,
            linker,
            bridge,
            limits,
            modules: RwLock::new(HashMap::new()),
            _ticker: ticker,
        })
    }

    /// The bridge host imports are served by
    #[must_use]
    pub fn bridge(&self) -> &Arc<HostBridge> {
        &self.bridge
    }

    /// Compile `wasm` (binary or text format) and cache it under `name`
    ///
    /// Recompiling an existing name replaces the cached module.
    #[instrument(skip(self, wasm), fields(size = wasm.len()))]
    pub async fn compile(&self, name: &str, wasm: Vec<u8>) -> Result<()> {
        let module = self.compile_module(wasm).await?;
        let replaced = self
            .modules
            .write()
            .await
            .insert(name.to_string(), module)
            .is_some();
        info!(replaced, "Module compiled");
        Ok(())
    }

    /// Run a previously compiled module
    #[instrument(skip(self, stdin, deadline))]
    pub async fn execute(
        &self,
        name: &str,
        stdin: Vec<u8>,
        deadline: &Deadline,
    ) -> Result<SandboxOutput> {
        let module = self
            .modules
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::runtime(format!("module \"{name}\" has not been compiled")))?;
        self.run(module, name.to_string(), stdin, deadline).await
    }

    /// Compile, run and discard a module in one step
    #[instrument(skip(self, wasm, stdin, deadline), fields(size = wasm.len()))]
    pub async fn execute_bytes(
        &self,
        wasm: Vec<u8>,
        stdin: Vec<u8>,
        deadline: &Deadline,
    ) -> Result<SandboxOutput> {
        let module = self.compile_module(wasm).await?;
        self.run(module, ONE_SHOT_NAME.to_string(), stdin, deadline)
            .await
    }

    /// Drop a cached module; returns whether it was present
    pub async fn evict(&self, name: &str) -> bool {
        self.modules.write().await.remove(name).is_some()
    }

    /// Names of all cached modules, sorted
    pub async fn cached_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn compile_module(&self, wasm: Vec<u8>) -> Result<Module> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || Module::new(&engine, &wasm))
            .await
            .map_err(|e| Error::runtime_with("compile task failed", e))?
            .map_err(|e| Error::runtime_with("failed to compile module", into_box(e)))
    }

    async fn run(
        &self,
        module: Module,
        program: String,
        stdin: Vec<u8>,
        deadline: &Deadline,
    ) -> Result<SandboxOutput> {
        let deadline = deadline.tighten(self.limits.timeout).child();
        if deadline.is_expired() {
            return Err(Error::timeout(deadline.timeout()));
        }

        // Dropping the caller's future cancels the run, which the epoch
        // callback turns into a trap on the next tick.
        let guard = deadline.token().clone().drop_guard();

        let engine = self.engine.clone();
        let linker = self.linker.clone();
        let bridge = Arc::clone(&self.bridge);
        let limits = self.limits;
        let request = RunRequest {
            module,
            program,
            stdin,
            deadline: deadline.clone(),
            handle: Handle::current(),
        };

        let result = tokio::task::spawn_blocking(move || {
            run_module(&engine, linker, bridge, limits, request)
        })
        .await;
        drop(guard.disarm());

        let output = result.map_err(|e| Error::runtime_with("execution task failed", e))??;
        info!(
            exit_code = output.exit_code,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            memory_used = output.memory_used_bytes,
            fuel_consumed = output.fuel_consumed,
            duration_ms = output.duration.as_millis() as u64,
            "Module execution completed"
        );
        Ok(output)
    }
}

/// Background thread advancing the engine epoch until dropped
struct EpochTicker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("warden-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| Error::runtime_with("failed to start epoch ticker", e))?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("epoch ticker panicked");
            }
        }
    }
}
