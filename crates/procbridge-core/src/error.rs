//! Error types for procbridge-core.

use thiserror::Error;

/// Result type for procbridge-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bridging a call to a worker process.
#[derive(Debug, Error)]
pub enum Error {
    /// The bridge was used before `init` or after `shutdown`.
    #[error("bridge is not initialized")]
    NotInitialized,

    /// The executable command line could not be turned into a launchable path.
    #[error("failed to convert exe path: {0}")]
    PathConversion(String),

    /// The OS refused to start the worker process.
    #[error("failed to start process '{command}': {source}")]
    ProcessSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing the request frame to the worker's stdin failed.
    #[error("could not send command to child process: {0}")]
    Send(String),

    /// No reply could be obtained from the worker.
    #[error("could not receive reply from child process: {0}")]
    Receive(String),

    /// The call memory descriptor does not fit the caller buffer or the segment.
    #[error("invalid call memory: {0}")]
    InvalidMemory(String),

    /// The shared memory segment could not be created or mapped.
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    /// `init` was given a non-positive or overflowing image size.
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: i32, height: i32 },

    /// The bridge lock is already held by this thread (reentrant call).
    #[error("bridge is busy with a call on this thread")]
    Busy,
}

impl Error {
    /// Coarse classification used by the process-wide API and the C ABI.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotInitialized => ErrorKind::NotInitialized,
            Error::PathConversion(_) => ErrorKind::PathConversionFailed,
            Error::ProcessSpawn { .. } => ErrorKind::ProcessSpawnFailed,
            Error::Send(_) => ErrorKind::SendFailed,
            Error::Receive(_) => ErrorKind::ReceiveFailed,
            Error::InvalidMemory(_) => ErrorKind::InvalidMemory,
            Error::SharedMemory(_) | Error::InvalidDimensions { .. } => ErrorKind::InitFailed,
            Error::Busy => ErrorKind::Busy,
        }
    }
}

/// Error classification with stable numeric codes.
///
/// Code `0` is reserved for success on the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    NotInitialized = 1,
    PathConversionFailed = 2,
    ProcessSpawnFailed = 3,
    SendFailed = 4,
    ReceiveFailed = 5,
    InvalidMemory = 6,
    Busy = 7,
    InitFailed = 8,
}

impl ErrorKind {
    /// Numeric code reported across the C ABI.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Human-readable description, suitable for surfacing to script authors.
    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::NotInitialized => "bridge library is not initialized yet",
            ErrorKind::PathConversionFailed => "failed to convert exe path",
            ErrorKind::ProcessSpawnFailed => "failed to start new process",
            ErrorKind::SendFailed => "could not send command to child process",
            ErrorKind::ReceiveFailed => "could not receive reply from child process",
            ErrorKind::InvalidMemory => "pixel buffer does not match the requested size",
            ErrorKind::Busy => "bridge is already handling a call on this thread",
            ErrorKind::InitFailed => "bridge initialization failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for ErrorKind {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(ErrorKind::NotInitialized.code(), 1);
        assert_eq!(ErrorKind::PathConversionFailed.code(), 2);
        assert_eq!(ErrorKind::ProcessSpawnFailed.code(), 3);
        assert_eq!(ErrorKind::SendFailed.code(), 4);
        assert_eq!(ErrorKind::ReceiveFailed.code(), 5);
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::NotInitialized.kind(), ErrorKind::NotInitialized);
        assert_eq!(Error::Send("pipe".into()).kind(), ErrorKind::SendFailed);
        let spawn = Error::ProcessSpawn {
            command: "missing.exe".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(spawn.kind(), ErrorKind::ProcessSpawnFailed);
        assert!(spawn.to_string().contains("missing.exe"));
        assert_eq!(
            Error::InvalidDimensions { width: 0, height: 1 }.kind(),
            ErrorKind::InitFailed
        );
    }
}
