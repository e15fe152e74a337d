//! Frame codec for worker pipes.
//!
//! Both directions use the same framing:
//! 4-byte length (i32 LE) + exactly that many payload bytes.
//! A zero length is a valid, empty frame; it is not end-of-stream.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors produced by the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended cleanly between frames.
    #[error("stream closed")]
    Closed,

    /// The length prefix was negative.
    #[error("invalid frame length: {0}")]
    InvalidLength(i32),

    /// The payload does not fit the length prefix.
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    /// The stream ended inside a frame.
    #[error("stream ended inside a frame ({read} of {expected} bytes)")]
    Truncated { read: usize, expected: usize },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Write one frame and flush the writer.
///
/// Short writes are retried until the whole frame is written.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let len = i32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len()))?;

    writer.write_all(&len.to_le_bytes())?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    writer.flush()?;

    tracing::trace!("wrote frame of {} bytes", payload.len());
    Ok(())
}

/// Read one frame, blocking until it is complete.
///
/// Returns [`FrameError::Closed`] if the stream ends before the first
/// length byte, so callers can tell an orderly close from a torn frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Err(FrameError::Closed),
            Ok(0) => {
                return Err(FrameError::Truncated {
                    read: filled,
                    expected: LENGTH_PREFIX_SIZE,
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = i32::from_le_bytes(len_bytes);
    if len < 0 {
        return Err(FrameError::InvalidLength(len));
    }
    let len = len as usize;

    // Grow as bytes arrive instead of trusting the prefix with one allocation.
    let mut payload = Vec::with_capacity(len.min(64 * 1024));
    reader.by_ref().take(len as u64).read_to_end(&mut payload)?;
    if payload.len() != len {
        return Err(FrameError::Truncated {
            read: payload.len(),
            expected: len,
        });
    }

    tracing::trace!("read frame of {} bytes", len);
    Ok(payload)
}
