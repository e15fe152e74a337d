//! Named file mappings backed by the paging file.

use std::ffi::OsStr;
use std::io;
use std::iter::once;
use std::os::windows::ffi::OsStrExt;
use std::ptr::NonNull;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION,
    MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile, OpenFileMappingW, PAGE_READWRITE,
    UnmapViewOfFile, VirtualQuery,
};

/// A mapped view of a named file mapping object.
pub struct Segment {
    mapping: HANDLE,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the view is plain memory owned by this value; access is
// serialized by the bridge lock on the host side.
unsafe impl Send for Segment {}

impl Segment {
    /// Create a new mapping of `len` bytes under `name`.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let wide = wide_name(name);
        let size = len as u64;
        // SAFETY: wide is NUL-terminated; INVALID_HANDLE_VALUE selects the paging file.
        let mapping = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE,
                (size >> 32) as u32,
                size as u32,
                wide.as_ptr(),
            )
        };
        if mapping.is_null() {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: reads the thread's last error set by CreateFileMappingW.
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            // SAFETY: mapping is a handle we own.
            unsafe { CloseHandle(mapping) };
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("mapping {} already exists", name),
            ));
        }
        Self::map(mapping, len)
    }

    /// Open an existing mapping created by another process.
    pub fn open(name: &str) -> io::Result<Self> {
        let wide = wide_name(name);
        // SAFETY: wide is NUL-terminated.
        let mapping = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide.as_ptr()) };
        if mapping.is_null() {
            return Err(io::Error::last_os_error());
        }
        Self::map(mapping, 0)
    }

    /// Map `mapping`; `len == 0` maps and measures the whole object.
    fn map(mapping: HANDLE, len: usize) -> io::Result<Self> {
        // SAFETY: mapping is a valid file mapping handle.
        let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, len) };
        let Some(ptr) = NonNull::new(view.Value.cast::<u8>()) else {
            let err = io::Error::last_os_error();
            // SAFETY: mapping is a handle we own.
            unsafe { CloseHandle(mapping) };
            return Err(err);
        };

        let len = if len == 0 {
            // SAFETY: zeroed MEMORY_BASIC_INFORMATION is a valid out-parameter.
            let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
            // SAFETY: ptr is the base of a live view; info is writable.
            let written = unsafe {
                VirtualQuery(
                    ptr.as_ptr().cast(),
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 {
                let err = io::Error::last_os_error();
                // SAFETY: view and mapping are owned here and released once.
                unsafe {
                    UnmapViewOfFile(view);
                    CloseHandle(mapping);
                }
                return Err(err);
            }
            info.RegionSize
        } else {
            len
        };

        Ok(Self { mapping, ptr, len })
    }

    /// Size of the view in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live view owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe a live view owned by self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: the view and handle were created by this value and are
        // released exactly once.
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.ptr.as_ptr().cast(),
            });
            CloseHandle(self.mapping);
        }
    }
}

fn wide_name(name: &str) -> Vec<u16> {
    OsStr::new(name).encode_wide().chain(once(0)).collect()
}
