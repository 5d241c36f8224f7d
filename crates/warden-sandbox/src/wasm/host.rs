//! The `warden` import module: bridge operations callable from guest code
//!
//! Arguments are `(ptr, len)` pairs into guest memory. Every function returns
//! a non-negative value on success or one of the `STATUS_*` codes below; a
//! denied or failed call never traps the module.
//!
//! | import | signature | success value |
//! |---|---|---|
//! | `fs_read` | `(path, path_len, out, out_cap) -> i64` | file length (copy truncated to `out_cap`) |
//! | `fs_write` | `(path, path_len, data, data_len) -> i32` | 0 |
//! | `http_fetch` | `(method, method_len, url, url_len, headers, headers_len, body, body_len, out, out_cap, status_out) -> i64` | body length |
//! | `exec_run` | `(cmd, cmd_len, argv, argv_len, out, out_cap, err, err_cap, ret_out) -> i32` | 0 |
//!
//! `http_fetch` headers are `Name: value` lines separated by `\n`. `exec_run`
//! arguments are NUL-separated; `ret_out` receives `[exit_code: i32,
//! stdout_len: u32, stderr_len: u32]` little-endian.

use super::runtime::{read_bytes, read_string, write_bytes, write_u32, BadPointer, HostState};
use crate::error::{Error, ErrorKind};
use std::future::Future;
use tracing::debug;
use wasmtime::{Caller, Linker};

pub(crate) const HOST_MODULE: &str = "warden";

pub const STATUS_CAPABILITY: i32 = -1;
pub const STATUS_TIMEOUT: i32 = -2;
pub const STATUS_MEMORY: i32 = -3;
pub const STATUS_RUNTIME: i32 = -4;
pub const STATUS_BAD_ARGUMENT: i32 = -5;

fn status_of(err: &Error) -> i32 {
    match err.kind() {
        ErrorKind::Capability => STATUS_CAPABILITY,
        ErrorKind::Timeout => STATUS_TIMEOUT,
        ErrorKind::Memory => STATUS_MEMORY,
        ErrorKind::Runtime => STATUS_RUNTIME,
    }
}

impl From<BadPointer> for i32 {
    fn from(_: BadPointer) -> Self {
        STATUS_BAD_ARGUMENT
    }
}

/// Drive a bridge future to completion from the blocking execution thread
fn block_on<F: Future>(caller: &Caller<'_, HostState>, fut: F) -> F::Output {
    caller.data().handle.block_on(fut)
}

/// Drive a bridge call that has no deadline of its own, bounded by the run's
fn block_on_bounded<T, F>(caller: &Caller<'_, HostState>, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    let deadline = caller.data().deadline.clone();
    block_on(caller, deadline.run(fut))
        .unwrap_or_else(|_| Err(Error::timeout(deadline.timeout())))
}

fn report(operation: &str, err: &Error) -> i32 {
    debug!(operation = %operation, error = %err, "host call failed");
    status_of(err)
}

/// Register the bridge imports on `linker`
pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(HOST_MODULE, "fs_read", fs_read)?;
    linker.func_wrap(HOST_MODULE, "fs_write", fs_write)?;
    linker.func_wrap(HOST_MODULE, "http_fetch", http_fetch)?;
    linker.func_wrap(HOST_MODULE, "exec_run", exec_run)?;
    Ok(())
}

fn fs_read(
    mut caller: Caller<'_, HostState>,
    path_ptr: i32,
    path_len: i32,
    out_ptr: i32,
    out_cap: i32,
) -> i64 {
    let path = match read_string(&mut caller, path_ptr, path_len) {
        Ok(path) => path,
        Err(bad) => return i32::from(bad).into(),
    };

    let bridge = caller.data().bridge.clone();
    let data = match block_on_bounded(&caller, bridge.fs_read(&path)) {
        Ok(data) => data,
        Err(err) => return report("fs_read", &err).into(),
    };

    let copied = data.len().min(out_cap.max(0) as usize);
    if let Err(bad) = write_bytes(&mut caller, out_ptr, &data[..copied]) {
        return i32::from(bad).into();
    }
    data.len() as i64
}

fn fs_write(
    mut caller: Caller<'_, HostState>,
    path_ptr: i32,
    path_len: i32,
    data_ptr: i32,
    data_len: i32,
) -> i32 {
    let (path, data) = match read_string(&mut caller, path_ptr, path_len)
        .and_then(|path| Ok((path, read_bytes(&mut caller, data_ptr, data_len)?)))
    {
        Ok(parts) => parts,
        Err(bad) => return bad.into(),
    };

    let bridge = caller.data().bridge.clone();
    match block_on_bounded(&caller, bridge.fs_write(&path, &data)) {
        Ok(()) => 0,
        Err(err) => report("fs_write", &err),
    }
}

#[allow(clippy::too_many_arguments)]
fn http_fetch(
    mut caller: Caller<'_, HostState>,
    method_ptr: i32,
    method_len: i32,
    url_ptr: i32,
    url_len: i32,
    headers_ptr: i32,
    headers_len: i32,
    body_ptr: i32,
    body_len: i32,
    out_ptr: i32,
    out_cap: i32,
    status_ptr: i32,
) -> i64 {
    let request = (|| -> Result<_, BadPointer> {
        let method = read_string(&mut caller, method_ptr, method_len)?;
        let url = read_string(&mut caller, url_ptr, url_len)?;
        let headers = parse_headers(&read_string(&mut caller, headers_ptr, headers_len)?)?;
        let body = if body_len > 0 {
            Some(read_bytes(&mut caller, body_ptr, body_len)?)
        } else {
            None
        };
        Ok((method, url, headers, body))
    })();
    let (method, url, headers, body) = match request {
        Ok(parts) => parts,
        Err(bad) => return i32::from(bad).into(),
    };

    let bridge = caller.data().bridge.clone();
    let deadline = caller.data().deadline.clone();
    let response = match block_on(
        &caller,
        bridge.http_fetch(&method, &url, body, &headers, &deadline),
    ) {
        Ok(response) => response,
        Err(err) => return report("http_fetch", &err).into(),
    };

    let copied = response.body.len().min(out_cap.max(0) as usize);
    let written = write_bytes(&mut caller, out_ptr, &response.body[..copied])
        .and_then(|()| write_u32(&mut caller, status_ptr, u32::from(response.status)));
    match written {
        Ok(()) => response.body.len() as i64,
        Err(bad) => i32::from(bad).into(),
    }
}

/// Parse `Name: value` lines; blank lines are ignored
fn parse_headers(raw: &str) -> Result<Vec<(String, String)>, BadPointer> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (name, value) = line.split_once(':').ok_or(BadPointer)?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn exec_run(
    mut caller: Caller<'_, HostState>,
    cmd_ptr: i32,
    cmd_len: i32,
    argv_ptr: i32,
    argv_len: i32,
    out_ptr: i32,
    out_cap: i32,
    err_ptr: i32,
    err_cap: i32,
    ret_ptr: i32,
) -> i32 {
    let request = read_string(&mut caller, cmd_ptr, cmd_len).and_then(|command| {
        let argv = read_string(&mut caller, argv_ptr, argv_len)?;
        let args: Vec<String> = argv
            .split('\0')
            .filter(|arg| !arg.is_empty())
            .map(str::to_string)
            .collect();
        Ok((command, args))
    });
    let (command, args) = match request {
        Ok(parts) => parts,
        Err(bad) => return bad.into(),
    };

    let bridge = caller.data().bridge.clone();
    let deadline = caller.data().deadline.clone();
    let output = match block_on(&caller, bridge.exec_run(&command, &args, &deadline)) {
        Ok(output) => output,
        Err(err) => return report("exec_run", &err),
    };

    let stdout = &output.stdout[..output.stdout.len().min(out_cap.max(0) as usize)];
    let stderr = &output.stderr[..output.stderr.len().min(err_cap.max(0) as usize)];
    let mut ret = [0u8; 12];
    ret[0..4].copy_from_slice(&output.exit_code.to_le_bytes());
    ret[4..8].copy_from_slice(&(stdout.len() as u32).to_le_bytes());
    ret[8..12].copy_from_slice(&(stderr.len() as u32).to_le_bytes());

    let written = write_bytes(&mut caller, out_ptr, stdout)
        .and_then(|()| write_bytes(&mut caller, err_ptr, stderr))
        .and_then(|()| write_bytes(&mut caller, ret_ptr, &ret));
    match written {
        Ok(()) => 0,
        Err(bad) => bad.into(),
    }
}
