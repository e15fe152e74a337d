//! Keeps pipe writes from raising `SIGPIPE` in the host process.
//!
//! Rust binaries ignore `SIGPIPE`, but a C host loading the `cdylib` usually
//! keeps the default action, which terminates the process when a worker has
//! closed its stdin. While a [`SigpipeGuard`] is alive, `SIGPIPE` is blocked
//! for the calling thread, so the write fails with `EPIPE` instead. A signal
//! raised meanwhile is consumed before the previous mask is restored.

#[cfg(unix)]
pub(crate) struct SigpipeGuard {
    previous: libc::sigset_t,
    already_blocked: bool,
}

#[cfg(unix)]
impl SigpipeGuard {
    pub(crate) fn new() -> Self {
        // SAFETY: sigset_t is plain data; every call gets valid pointers.
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGPIPE);
            let mut previous: libc::sigset_t = std::mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous);
            Self {
                already_blocked: libc::sigismember(&previous, libc::SIGPIPE) == 1,
                previous,
            }
        }
    }
}

#[cfg(unix)]
impl Drop for SigpipeGuard {
    fn drop(&mut self) {
        if self.already_blocked {
            return;
        }
        // SAFETY: sigset_t is plain data; every call gets valid pointers.
        unsafe {
            let mut pending: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut pending);
            if libc::sigpending(&mut pending) == 0
                && libc::sigismember(&pending, libc::SIGPIPE) == 1
            {
                // Pending, so this returns at once.
                let mut set: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut set);
                libc::sigaddset(&mut set, libc::SIGPIPE);
                let mut signal = 0;
                libc::sigwait(&set, &mut signal);
            }
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
        }
    }
}

#[cfg(not(unix))]
pub(crate) struct SigpipeGuard;

#[cfg(not(unix))]
impl SigpipeGuard {
    pub(crate) fn new() -> Self {
        Self
    }
}
