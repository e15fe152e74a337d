//! Worker-side helpers.
//!
//! A worker reads request frames from stdin and answers each with exactly
//! one reply frame on stdout. Anything else written to stdout corrupts the
//! stream; log to stderr.

use std::io::{self, BufReader, BufWriter, Read, Stdin, Stdout, Write};

use crate::ipc::{FrameError, read_frame, write_frame};

/// Request/reply loop over a pair of byte streams.
pub struct FrameServer<R, W> {
    reader: R,
    writer: W,
}

impl FrameServer<BufReader<Stdin>, BufWriter<Stdout>> {
    /// Serve over this process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), BufWriter::new(io::stdout()))
    }
}

impl<R: Read, W: Write> FrameServer<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Next request, or `None` once the host closed the pipe.
    pub fn next_request(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        match read_frame(&mut self.reader) {
            Ok(request) => Ok(Some(request)),
            Err(FrameError::Closed) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Send one reply frame.
    pub fn reply(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        write_frame(&mut self.writer, payload)
    }

    /// Answer requests with `handler` until the host closes stdin.
    ///
    /// A handler returning `None` sends no reply for that request.
    pub fn serve<F>(&mut self, mut handler: F) -> Result<(), FrameError>
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>>,
    {
        while let Some(request) = self.next_request()? {
            if let Some(reply) = handler(&request) {
                self.reply(&reply)?;
            }
        }
        Ok(())
    }

    /// Consume the server and return its streams.
    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}
