//! POSIX shared memory segments (`shm_open` + `mmap`).

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

/// A mapped POSIX shared memory object.
pub struct Segment {
    ptr: NonNull<u8>,
    len: usize,
    /// Set for the creating side, which unlinks the name on drop.
    owned_name: Option<CString>,
}

// SAFETY: the mapping is plain memory owned by this value; access is
// serialized by the bridge lock on the host side.
unsafe impl Send for Segment {}

impl Segment {
    /// Create a new segment of `len` bytes under `name` (must start with `/`).
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is NUL-terminated.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by shm_open and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // From here on, a failure must also remove the name.
        let unlink_on_error = |e: io::Error| {
            // SAFETY: c_name is NUL-terminated.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            e
        };

        let size = libc::off_t::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment too large"))
            .map_err(unlink_on_error)?;
        // SAFETY: fd is a valid open descriptor.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size) } != 0 {
            return Err(unlink_on_error(io::Error::last_os_error()));
        }

        let ptr = map(&fd, len).map_err(unlink_on_error)?;
        Ok(Self {
            ptr,
            len,
            owned_name: Some(c_name),
        })
    }

    /// Map an existing segment created by another process.
    pub fn open(name: &str) -> io::Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is NUL-terminated.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by shm_open and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: zeroed stat is a valid out-parameter.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is valid and stat points to writable memory.
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let len = usize::try_from(stat.st_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative segment size"))?;

        let ptr = map(&fd, len)?;
        Ok(Self {
            ptr,
            len,
            owned_name: None,
        })
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe a live mapping owned by self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: ptr/len were returned by mmap and are unmapped exactly once.
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if let Some(name) = self.owned_name.take() {
            // SAFETY: name is NUL-terminated.
            unsafe { libc::shm_unlink(name.as_ptr()) };
        }
    }
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in segment name"))
}

fn map(fd: &OwnedFd, len: usize) -> io::Result<NonNull<u8>> {
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty segment"));
    }
    // SAFETY: fd is valid; the kernel picks the address.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
}
