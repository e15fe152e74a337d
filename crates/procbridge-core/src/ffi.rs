//! C ABI over the process-wide bridge.
//!
//! Hosts load the `cdylib` and either call the exported functions directly
//! or fetch the [`BridgeApi`] table from [`procbridge_api`]. Return codes are
//! `0` for success and [`ErrorKind::code`] otherwise.

use std::ffi::{CStr, c_char, c_void};

use crate::api;
use crate::error::ErrorKind;
use crate::memory::{CallMemory, MemMode};

/// Version stored in [`BridgeApi::version`].
pub const PROCBRIDGE_API_VERSION: i32 = 1;

/// Success return code.
pub const PROCBRIDGE_OK: i32 = 0;

/// Pixel buffer descriptor passed by C callers.
#[repr(C)]
#[derive(Debug)]
pub struct CallMem {
    pub buf: *mut c_void,
    /// Bitwise OR of `MemMode` bits.
    pub mode: i32,
    pub width: i32,
    pub height: i32,
}

/// Signature of [`procbridge_call`].
pub type CallFn = unsafe extern "C" fn(
    *const c_char,
    *const c_void,
    i32,
    *mut CallMem,
    *mut *mut c_void,
    *mut i32,
) -> i32;

/// Function table handed to hosts that resolve a single symbol.
#[repr(C)]
pub struct BridgeApi {
    pub version: i32,
    pub call: CallFn,
}

static BRIDGE_API: BridgeApi = BridgeApi {
    version: PROCBRIDGE_API_VERSION,
    call: procbridge_call,
};

/// Initialize the process-wide bridge.
#[unsafe(no_mangle)]
pub extern "C" fn procbridge_init(max_width: i32, max_height: i32) -> bool {
    api::init(max_width, max_height)
}

/// Tear down the process-wide bridge.
#[unsafe(no_mangle)]
pub extern "C" fn procbridge_exit() -> bool {
    api::shutdown()
}

/// Function table for hosts.
#[unsafe(no_mangle)]
pub extern "C" fn procbridge_api() -> *const BridgeApi {
    &BRIDGE_API
}

/// Send `len` bytes at `buf` to the worker started from `exe_path`.
///
/// On success `*r`/`*rlen` describe the worker's reply. The bytes belong to
/// the bridge and stay valid until the next call to the same worker or
/// `procbridge_exit`. On failure `*r` is null and `*rlen` is zero.
///
/// # Safety
///
/// - `exe_path` must be null or a NUL-terminated string.
/// - `buf` must be valid for `len` bytes when `len > 0`.
/// - `mem` must be null or point to a `CallMem` whose `buf` satisfies
///   [`CallMemory::from_raw`].
/// - `r` and `rlen` must be null or writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn procbridge_call(
    exe_path: *const c_char,
    buf: *const c_void,
    len: i32,
    mem: *mut CallMem,
    r: *mut *mut c_void,
    rlen: *mut i32,
) -> i32 {
    // SAFETY: forwarded from this function's contract.
    let result = unsafe { call_raw(exe_path, buf, len, mem) };
    let (ptr, size) = match result {
        Ok(reply) => reply,
        Err(kind) => {
            // SAFETY: r and rlen are null or writable.
            unsafe { store_reply(r, rlen, std::ptr::null_mut(), 0) };
            return kind.code();
        }
    };
    // SAFETY: r and rlen are null or writable.
    unsafe { store_reply(r, rlen, ptr, size) };
    PROCBRIDGE_OK
}

unsafe fn call_raw(
    exe_path: *const c_char,
    buf: *const c_void,
    len: i32,
    mem: *mut CallMem,
) -> Result<(*mut c_void, i32), ErrorKind> {
    if !api::is_initialized() {
        return Err(ErrorKind::NotInitialized);
    }
    if exe_path.is_null() {
        return Err(ErrorKind::PathConversionFailed);
    }
    // SAFETY: exe_path is non-null and NUL-terminated by contract.
    let command_line = unsafe { CStr::from_ptr(exe_path) }
        .to_str()
        .map_err(|_| ErrorKind::PathConversionFailed)?;

    let request: &[u8] = match usize::try_from(len) {
        Ok(0) => &[],
        Ok(n) if !buf.is_null() => {
            // SAFETY: buf covers len bytes by contract.
            unsafe { std::slice::from_raw_parts(buf.cast::<u8>(), n) }
        }
        _ => return Err(ErrorKind::SendFailed),
    };

    let mut memory = if mem.is_null() {
        None
    } else {
        // SAFETY: mem is non-null and points to a CallMem by contract.
        let mem = unsafe { &*mem };
        // SAFETY: mem.buf covers width * height * 4 bytes by contract.
        let memory = unsafe {
            CallMemory::from_raw(mem.buf.cast(), MemMode(mem.mode), mem.width, mem.height)
        }
        .map_err(|e| e.kind())?;
        Some(memory)
    };

    let (ptr, size) = api::call_with(command_line, request, memory.as_mut(), |reply| {
        (reply.as_ptr(), reply.len())
    })?;
    let size = i32::try_from(size).map_err(|_| ErrorKind::ReceiveFailed)?;
    Ok((ptr.cast_mut().cast(), size))
}

unsafe fn store_reply(r: *mut *mut c_void, rlen: *mut i32, ptr: *mut c_void, size: i32) {
    if !r.is_null() {
        // SAFETY: r is writable by contract.
        unsafe { *r = ptr };
    }
    if !rlen.is_null() {
        // SAFETY: rlen is writable by contract.
        unsafe { *rlen = size };
    }
}
