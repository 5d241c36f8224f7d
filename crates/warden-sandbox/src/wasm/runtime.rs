//! Per-execution store setup, guest memory access and failure classification

use crate::bridge::HostBridge;
use crate::deadline::{Deadline, DeadlineExceeded};
use crate::error::{Error, Result};
use crate::output::{LimitedBuffer, SandboxOutput};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tokio::runtime::Handle;
use tracing::debug;
use wasmtime::{
    Caller, Engine, Extern, Linker, Memory, Module, ResourceLimiter, Store, StoreLimits,
    StoreLimitsBuilder, Trap, UpdateDeadline,
};

/// Size of one WebAssembly page
pub const WASM_PAGE_SIZE: u64 = 65_536;

/// Raised by `proc_exit`; unwinds the guest and carries its exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
#[error("module exited with status {0}")]
pub(crate) struct ModuleExit(pub i32);

/// Store limiter that remembers whether it ever refused a memory growth
pub(crate) struct MemoryGuard {
    limits: StoreLimits,
    denied: bool,
}

impl MemoryGuard {
    fn new(memory_bytes: usize) -> Self {
        Self {
            limits: StoreLimitsBuilder::new()
                .memory_size(memory_bytes)
                .trap_on_grow_failure(true)
                .build(),
            denied: false,
        }
    }

    /// Whether a growth request was refused during this run
    pub fn denied(&self) -> bool {
        self.denied
    }
}

impl ResourceLimiter for MemoryGuard {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let verdict = self.limits.memory_growing(current, desired, maximum);
        if !matches!(verdict, Ok(true)) {
            self.denied = true;
        }
        verdict
    }

    fn memory_grow_failed(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
        self.denied = true;
        self.limits.memory_grow_failed(error)
    }

    fn table_growing(
        &mut self,
        current: u32,
        desired: u32,
        maximum: Option<u32>,
    ) -> anyhow::Result<bool> {
        self.limits.table_growing(current, desired, maximum)
    }

    fn table_grow_failed(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
        self.limits.table_grow_failed(error)
    }

    fn instances(&self) -> usize {
        self.limits.instances()
    }

    fn tables(&self) -> usize {
        self.limits.tables()
    }

    fn memories(&self) -> usize {
        self.limits.memories()
    }
}

/// Everything one running instance owns
pub(crate) struct HostState {
    pub limits: MemoryGuard,
    pub stdin: Cursor<Vec<u8>>,
    pub stdout: LimitedBuffer,
    pub stderr: LimitedBuffer,
    pub bridge: Arc<HostBridge>,
    pub handle: Handle,
    pub deadline: Deadline,
    pub program: String,
    pub started: Instant,
}

/// Inputs for a single run
pub(crate) struct RunRequest {
    pub module: Module,
    pub program: String,
    pub stdin: Vec<u8>,
    pub deadline: Deadline,
    pub handle: Handle,
}

/// Store-level limits shared by every run on one backend
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunLimits {
    pub memory_bytes: u64,
    pub fuel_limit: u64,
    pub max_output_bytes: usize,
    pub timeout: Duration,
}

/// Instantiate `request.module` and run it to completion on the current thread
pub(crate) fn run_module(
    engine: &Engine,
    mut linker: Linker<HostState>,
    bridge: Arc<HostBridge>,
    limits: RunLimits,
    request: RunRequest,
) -> Result<SandboxOutput> {
    let started = Instant::now();
    let memory_limit = usize::try_from(limits.memory_bytes).unwrap_or(usize::MAX);
    let state = HostState {
        limits: MemoryGuard::new(memory_limit),
        stdin: Cursor::new(request.stdin),
        stdout: LimitedBuffer::new(limits.max_output_bytes),
        stderr: LimitedBuffer::new(limits.max_output_bytes),
        bridge,
        handle: request.handle,
        deadline: request.deadline.clone(),
        program: request.program,
        started,
    };

    let mut store = Store::new(engine, state);
    store.limiter(|state| &mut state.limits);

    let fuel_budget = if limits.fuel_limit > 0 {
        limits.fuel_limit
    } else {
        u64::MAX
    };
    store
        .set_fuel(fuel_budget)
        .map_err(|e| Error::runtime_with("failed to configure fuel", into_box(e)))?;

    let deadline = request.deadline.clone();
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(move |_| {
        if deadline.is_expired() {
            Err(DeadlineExceeded.into())
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });

    linker
        .define_unknown_imports_as_traps(&request.module)
        .map_err(|e| Error::runtime_with("failed to link module", into_box(e)))?;

    let outcome = linker
        .instantiate(&mut store, &request.module)
        .and_then(|instance| {
            let memory = instance.get_memory(&mut store, "memory");
            let result = match instance.get_typed_func::<(), ()>(&mut store, "_start") {
                Ok(start) => start.call(&mut store, ()),
                Err(_) => Ok(()),
            };
            Ok((memory, result))
        });

    let fuel_consumed = fuel_budget.saturating_sub(store.get_fuel().unwrap_or(fuel_budget));
    let (memory, result) = match outcome {
        Ok(parts) => parts,
        Err(err) => (None, Err(err)),
    };
    let memory_used = memory.map_or(0, |memory| memory.data_size(&store) as u64);
    let memory_denied = store.data().limits.denied();

    let exit_code = match result {
        Ok(()) => 0,
        Err(err) => match err.downcast_ref::<ModuleExit>() {
            Some(ModuleExit(code)) => *code,
            None => {
                return Err(classify(
                    err,
                    &request.deadline,
                    limits,
                    memory_used,
                    memory_denied,
                ))
            }
        },
    };

    let state = store.into_data();
    let duration = started.elapsed();
    debug!(
        exit_code,
        memory_used,
        fuel_consumed,
        duration_ms = duration.as_millis() as u64,
        "module finished"
    );

    Ok(SandboxOutput {
        stdout: state.stdout.into_inner(),
        stderr: state.stderr.into_inner(),
        exit_code,
        duration,
        memory_used_bytes: memory_used,
        fuel_consumed,
    })
}

/// Map a failed run onto the error taxonomy
///
/// A trap counts as a memory failure only when the limiter refused a growth
/// request; a guest that traps for another reason near its ceiling is a
/// runtime failure.
fn classify(
    err: anyhow::Error,
    deadline: &Deadline,
    limits: RunLimits,
    used: u64,
    memory_denied: bool,
) -> Error {
    if err.downcast_ref::<DeadlineExceeded>().is_some()
        || err.downcast_ref::<Trap>() == Some(&Trap::Interrupt)
        || deadline.is_expired()
    {
        let timeout = if deadline.timeout().is_zero() {
            limits.timeout
        } else {
            deadline.timeout()
        };
        return Error::timeout(timeout);
    }

    if err.downcast_ref::<Trap>() == Some(&Trap::OutOfFuel) {
        return Error::fuel_exhausted(limits.fuel_limit);
    }

    if memory_denied {
        return Error::memory(limits.memory_bytes, used);
    }

    Error::runtime_with("module execution failed", into_box(err))
}

pub(crate) fn into_box(err: anyhow::Error) -> crate::error::BoxError {
    err.into()
}

// ---------------------------------------------------------------------------
// Guest memory access

/// Failure reading or writing guest memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BadPointer;

pub(crate) fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    caller.get_export("memory").and_then(Extern::into_memory)
}

fn span(ptr: i32, len: i32) -> std::result::Result<(usize, usize), BadPointer> {
    let start = usize::try_from(ptr as u32).map_err(|_| BadPointer)?;
    let len = usize::try_from(len as u32).map_err(|_| BadPointer)?;
    Ok((start, len))
}

/// Copy `len` bytes out of guest memory
pub(crate) fn read_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> std::result::Result<Vec<u8>, BadPointer> {
    let memory = guest_memory(caller).ok_or(BadPointer)?;
    let (start, len) = span(ptr, len)?;
    if start.checked_add(len).map_or(true, |end| end > memory.data_size(&*caller)) {
        return Err(BadPointer);
    }
    let mut buf = vec![0u8; len];
    memory.read(&*caller, start, &mut buf).map_err(|_| BadPointer)?;
    Ok(buf)
}

/// Bounds-checked mutable view of `len` guest bytes at `ptr`
pub(crate) fn guest_slice_mut<'a>(
    caller: &'a mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> std::result::Result<&'a mut [u8], BadPointer> {
    let memory = guest_memory(caller).ok_or(BadPointer)?;
    let (start, len) = span(ptr, len)?;
    let end = start.checked_add(len).ok_or(BadPointer)?;
    memory.data_mut(caller).get_mut(start..end).ok_or(BadPointer)
}

/// Copy a UTF-8 string out of guest memory
pub(crate) fn read_string(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> std::result::Result<String, BadPointer> {
    String::from_utf8(read_bytes(caller, ptr, len)?).map_err(|_| BadPointer)
}

/// Copy `data` into guest memory at `ptr`
pub(crate) fn write_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    data: &[u8],
) -> std::result::Result<(), BadPointer> {
    let memory = guest_memory(caller).ok_or(BadPointer)?;
    let start = usize::try_from(ptr as u32).map_err(|_| BadPointer)?;
    memory.write(&mut *caller, start, data).map_err(|_| BadPointer)
}

pub(crate) fn write_u32(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    value: u32,
) -> std::result::Result<(), BadPointer> {
    write_bytes(caller, ptr, &value.to_le_bytes())
}

pub(crate) fn write_u64(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    value: u64,
) -> std::result::Result<(), BadPointer> {
    write_bytes(caller, ptr, &value.to_le_bytes())
}
