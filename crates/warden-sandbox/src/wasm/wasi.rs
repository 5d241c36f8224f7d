//! Minimal `wasi_snapshot_preview1` surface: stdio, args, clocks, randomness
//!
//! Modules see no filesystem, environment or sockets through WASI. File and
//! network access goes exclusively through the `warden` host imports.

use super::runtime::{
    guest_memory, guest_slice_mut, write_bytes, write_u32, write_u64, BadPointer, HostState,
    ModuleExit,
};
use crate::deadline::DeadlineExceeded;
use rand::RngCore;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};
use wasmtime::{Caller, Linker};

pub(crate) const WASI_MODULE: &str = "wasi_snapshot_preview1";

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;
const ERRNO_FAULT: i32 = 21;
const ERRNO_INVAL: i32 = 28;
const ERRNO_SPIPE: i32 = 70;

const FILETYPE_CHARACTER_DEVICE: u8 = 2;

const RANDOM_CHUNK: usize = 64 * 1024;

const CLOCK_REALTIME: i32 = 0;
const CLOCK_MONOTONIC: i32 = 1;

fn errno(result: Result<(), BadPointer>) -> i32 {
    match result {
        Ok(()) => ERRNO_SUCCESS,
        Err(BadPointer) => ERRNO_FAULT,
    }
}

/// Register the WASI shim on `linker`
pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(WASI_MODULE, "fd_write", fd_write)?;
    linker.func_wrap(WASI_MODULE, "fd_read", fd_read)?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_close",
        |_: Caller<'_, HostState>, fd: i32| -> i32 {
            if (0..=2).contains(&fd) {
                ERRNO_SUCCESS
            } else {
                ERRNO_BADF
            }
        },
    )?;
    linker.func_wrap(WASI_MODULE, "fd_fdstat_get", fd_fdstat_get)?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_get",
        |_: Caller<'_, HostState>, _fd: i32, _ptr: i32| -> i32 { ERRNO_BADF },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_prestat_dir_name",
        |_: Caller<'_, HostState>, _fd: i32, _ptr: i32, _len: i32| -> i32 { ERRNO_BADF },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "fd_seek",
        |_: Caller<'_, HostState>, fd: i32, _offset: i64, _whence: i32, _out: i32| -> i32 {
            if (0..=2).contains(&fd) {
                ERRNO_SPIPE
            } else {
                ERRNO_BADF
            }
        },
    )?;
    linker.func_wrap(WASI_MODULE, "args_sizes_get", args_sizes_get)?;
    linker.func_wrap(WASI_MODULE, "args_get", args_get)?;
    linker.func_wrap(
        WASI_MODULE,
        "environ_sizes_get",
        |mut caller: Caller<'_, HostState>, count_ptr: i32, size_ptr: i32| -> i32 {
            errno(
                write_u32(&mut caller, count_ptr, 0)
                    .and_then(|()| write_u32(&mut caller, size_ptr, 0)),
            )
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "environ_get",
        |_: Caller<'_, HostState>, _environ: i32, _buf: i32| -> i32 { ERRNO_SUCCESS },
    )?;
    linker.func_wrap(WASI_MODULE, "clock_time_get", clock_time_get)?;
    linker.func_wrap(
        WASI_MODULE,
        "clock_res_get",
        |mut caller: Caller<'_, HostState>, id: i32, ptr: i32| -> i32 {
            match id {
                CLOCK_REALTIME | CLOCK_MONOTONIC => errno(write_u64(&mut caller, ptr, 1_000)),
                _ => ERRNO_INVAL,
            }
        },
    )?;
    linker.func_wrap(WASI_MODULE, "random_get", random_get)?;
    linker.func_wrap(
        WASI_MODULE,
        "proc_exit",
        |_: Caller<'_, HostState>, code: i32| -> anyhow::Result<()> {
            Err(ModuleExit(code).into())
        },
    )?;
    linker.func_wrap(
        WASI_MODULE,
        "sched_yield",
        |_: Caller<'_, HostState>| -> i32 { ERRNO_SUCCESS },
    )?;
    Ok(())
}

fn fd_write(
    mut caller: Caller<'_, HostState>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nwritten_ptr: i32,
) -> i32 {
    if fd != 1 && fd != 2 {
        return ERRNO_BADF;
    }
    let Some(memory) = guest_memory(&mut caller) else {
        return ERRNO_FAULT;
    };

    let (mem, state) = memory.data_and_store_mut(&mut caller);
    let sink = if fd == 1 {
        &mut state.stdout
    } else {
        &mut state.stderr
    };

    let mut written: u32 = 0;
    for i in 0..iovs_len.max(0) as usize {
        let Some((base, len)) = iovec(mem, iovs as u32 as usize + i * 8) else {
            return ERRNO_FAULT;
        };
        let Some(chunk) = mem.get(base..base + len) else {
            return ERRNO_FAULT;
        };
        // Bytes beyond the output cap are acknowledged but dropped
        sink.push(chunk);
        written = written.wrapping_add(len as u32);
    }

    errno(write_u32(&mut caller, nwritten_ptr, written))
}

fn fd_read(
    mut caller: Caller<'_, HostState>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nread_ptr: i32,
) -> i32 {
    if fd != 0 {
        return ERRNO_BADF;
    }
    let Some(memory) = guest_memory(&mut caller) else {
        return ERRNO_FAULT;
    };

    let (mem, state) = memory.data_and_store_mut(&mut caller);
    let mut total: u32 = 0;
    for i in 0..iovs_len.max(0) as usize {
        let Some((base, len)) = iovec(mem, iovs as u32 as usize + i * 8) else {
            return ERRNO_FAULT;
        };
        let Some(target) = mem.get_mut(base..base + len) else {
            return ERRNO_FAULT;
        };
        let n = state.stdin.read(target).unwrap_or(0);
        total = total.wrapping_add(n as u32);
        if n < len {
            break;
        }
    }

    errno(write_u32(&mut caller, nread_ptr, total))
}

/// Decode one `(buf, buf_len)` pair at `offset`
fn iovec(mem: &[u8], offset: usize) -> Option<(usize, usize)> {
    let raw = mem.get(offset..offset + 8)?;
    let base = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
    Some((base, len))
}

fn fd_fdstat_get(mut caller: Caller<'_, HostState>, fd: i32, ptr: i32) -> i32 {
    if !(0..=2).contains(&fd) {
        return ERRNO_BADF;
    }
    // filetype u8, pad, flags u16, pad, rights_base u64, rights_inheriting u64
    let mut stat = [0u8; 24];
    stat[0] = FILETYPE_CHARACTER_DEVICE;
    let rights: u64 = if fd == 0 { 1 << 1 } else { 1 << 6 };
    stat[8..16].copy_from_slice(&rights.to_le_bytes());
    errno(write_bytes(&mut caller, ptr, &stat))
}

fn args_sizes_get(mut caller: Caller<'_, HostState>, argc_ptr: i32, size_ptr: i32) -> i32 {
    let size = caller.data().program.len() as u32 + 1;
    errno(write_u32(&mut caller, argc_ptr, 1).and_then(|()| write_u32(&mut caller, size_ptr, size)))
}

fn args_get(mut caller: Caller<'_, HostState>, argv_ptr: i32, buf_ptr: i32) -> i32 {
    let mut arg = caller.data().program.clone().into_bytes();
    arg.push(0);
    errno(
        write_bytes(&mut caller, buf_ptr, &arg)
            .and_then(|()| write_u32(&mut caller, argv_ptr, buf_ptr as u32)),
    )
}

fn clock_time_get(mut caller: Caller<'_, HostState>, id: i32, _precision: i64, ptr: i32) -> i32 {
    let nanos = match id {
        CLOCK_REALTIME => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0),
        CLOCK_MONOTONIC => caller.data().started.elapsed().as_nanos() as u64,
        _ => return ERRNO_INVAL,
    };
    errno(write_u64(&mut caller, ptr, nanos))
}

/// Fills guest memory in place, checking the deadline between chunks
fn random_get(mut caller: Caller<'_, HostState>, ptr: i32, len: i32) -> anyhow::Result<i32> {
    let deadline = caller.data().deadline.clone();
    let dest = match guest_slice_mut(&mut caller, ptr, len) {
        Ok(dest) => dest,
        Err(BadPointer) => return Ok(ERRNO_FAULT),
    };
    let mut rng = rand::thread_rng();
    for chunk in dest.chunks_mut(RANDOM_CHUNK) {
        if deadline.is_expired() {
            return Err(DeadlineExceeded.into());
        }
        rng.fill_bytes(chunk);
    }
    Ok(ERRNO_SUCCESS)
}

