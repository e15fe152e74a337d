//! Worker process management.
//!
//! A `WorkerProcess` owns one child's pipes, a detached reader thread that
//! turns stdout frames into relay items, and the consuming half of the relay
//! queue. Replies are handed out by reference from a single retained slot,
//! so a reply stays valid until the next read on the same worker.

use std::io::{BufRead, BufReader, BufWriter};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};

use super::protocol::{FrameError, read_frame, write_frame};
use super::queue::{RelayConsumer, RelayError, RelayItem, RelayProducer, relay_queue};
use super::sigpipe::SigpipeGuard;
use super::transport;

/// Handle to one running worker executable.
pub struct WorkerProcess {
    /// Command line the worker was started from.
    command_line: String,
    /// The child process.
    child: Child,
    /// Buffered stdin writer; `None` once closed.
    stdin: Option<BufWriter<ChildStdin>>,
    /// Stderr read end, held only until `close_stderr`.
    stderr: Option<ChildStderr>,
    /// Consumer side of the relay queue fed by the reader thread.
    relay: RelayConsumer,
    /// Reader thread handle. Dropped, never joined.
    reader: Option<JoinHandle<()>>,
    /// Last reply handed out; replaced on the next successful read.
    last_response: Option<Vec<u8>>,
    /// Set once a sentinel or a reply timeout has been observed.
    exhausted: bool,
    /// Set once the sentinel has been consumed from the queue.
    sentinel_seen: bool,
    /// Whether `finish` already ran.
    finished: bool,
    read_timeout: Duration,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("command_line", &self.command_line)
            .field("pid", &self.child.id())
            .field("exhausted", &self.exhausted)
            .field("finished", &self.finished)
            .finish()
    }
}

impl WorkerProcess {
    /// Spawn a worker and start its reader thread.
    ///
    /// `shm_name` is published to the child through `config.env_var`.
    pub fn spawn(command_line: &str, config: &BridgeConfig, shm_name: &str) -> Result<Self> {
        let spawned = transport::spawn(command_line, &config.env_var, shm_name)?;
        let pid = spawned.child.id();

        let (producer, consumer) = relay_queue();
        let stdout = spawned.stdout;
        let reader = thread::Builder::new()
            .name(format!("procbridge-reader-{}", pid))
            .spawn(move || reader_loop(BufReader::new(stdout), producer, pid))
            .map_err(|source| Error::ProcessSpawn {
                command: command_line.to_string(),
                source,
            })?;

        let mut worker = Self {
            command_line: command_line.to_string(),
            child: spawned.child.disarm(),
            stdin: Some(BufWriter::new(spawned.stdin)),
            stderr: Some(spawned.stderr),
            relay: consumer,
            reader: Some(reader),
            last_response: None,
            exhausted: false,
            sentinel_seen: false,
            finished: false,
            read_timeout: config.read_timeout,
            shutdown_grace: config.shutdown_grace,
        };

        if config.capture_stderr {
            worker.forward_stderr();
        } else {
            worker.close_stderr();
        }

        Ok(worker)
    }

    /// Command line this worker was started from.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Process id of the worker.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking liveness poll. False only once the process has exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Whether the reply channel is permanently dead.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether the worker can take another request.
    pub fn is_usable(&mut self) -> bool {
        !self.finished && !self.exhausted && self.is_running()
    }

    /// Send one request frame to the worker's stdin.
    pub fn write_request(&mut self, request: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Send("worker stdin is closed".to_string()))?;
        let _sigpipe = SigpipeGuard::new();
        write_frame(stdin, request).map_err(|e| {
            tracing::debug!("Write to worker {} failed: {}", self.child.id(), e);
            Error::Send(e.to_string())
        })
    }

    /// Wait for the next reply.
    ///
    /// The returned slice lives in the worker's retained slot and is
    /// released by the next call to `read_response` or by `finish`.
    pub fn read_response(&mut self) -> Result<&[u8]> {
        if self.exhausted {
            return Err(Error::Receive("worker reply channel is closed".to_string()));
        }

        match self.relay.pop_timeout(self.read_timeout) {
            Ok(RelayItem::Payload(bytes)) => Ok(self.last_response.insert(bytes).as_slice()),
            Ok(RelayItem::Closed(reason)) => {
                self.last_response = None;
                self.exhausted = true;
                self.sentinel_seen = true;
                Err(Error::Receive(reason))
            }
            Err(RelayError::Timeout) => {
                // A late reply would pair with the wrong request.
                self.exhausted = true;
                tracing::warn!(
                    "Worker {} did not reply within {:?}",
                    self.child.id(),
                    self.read_timeout
                );
                Err(Error::Receive(format!(
                    "no reply within {:?}",
                    self.read_timeout
                )))
            }
            Err(RelayError::Disconnected) => {
                self.last_response = None;
                self.exhausted = true;
                self.sentinel_seen = true;
                Err(Error::Receive("reader thread is gone".to_string()))
            }
        }
    }

    /// Close the stderr read end so an unread pipe cannot stall the child.
    pub fn close_stderr(&mut self) {
        self.stderr = None;
    }

    /// Move stderr to a thread that forwards each line to the log.
    fn forward_stderr(&mut self) {
        let Some(stderr) = self.stderr.take() else {
            return;
        };
        let pid = self.child.id();
        let spawned = thread::Builder::new()
            .name(format!("procbridge-stderr-{}", pid))
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => tracing::info!(target: "procbridge::worker", "[{}] {}", pid, line),
                        Err(_) => break,
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not forward stderr of worker {}: {}", pid, e);
        }
    }

    /// Tear the worker down.
    ///
    /// Closes stdin and stderr, abandons the reader thread, and waits for its
    /// sentinel through the queue instead of joining it: joins can deadlock
    /// when shutdown runs on a process-exit call stack. A worker that keeps
    /// its stdout open past the grace period is killed, which closes the
    /// pipe and releases the reader.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let pid = self.child.id();

        {
            // Dropping the writer flushes anything a failed write left behind.
            let _sigpipe = SigpipeGuard::new();
            self.stdin = None;
        }
        self.stderr = None;
        drop(self.reader.take());

        if !self.sentinel_seen && !self.drain_until_sentinel(self.shutdown_grace) {
            tracing::warn!(
                "Worker {} kept stdout open {:?} after stdin closed; killing",
                pid,
                self.shutdown_grace
            );
            let _ = self.child.kill();
            if !self.drain_until_sentinel(self.read_timeout) {
                tracing::warn!("Reader thread of worker {} never reported closure", pid);
            }
        }
        self.last_response = None;

        // Reap so no zombie outlives the handle.
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => tracing::debug!("Worker {} finished with {}", pid, status),
            Err(e) => tracing::debug!("Failed to reap worker {}: {}", pid, e),
        }
    }

    /// Discard queued payloads until the sentinel arrives or `timeout` passes.
    fn drain_until_sentinel(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.relay.pop_timeout(remaining) {
                Ok(RelayItem::Payload(_)) => continue,
                Ok(RelayItem::Closed(_)) | Err(RelayError::Disconnected) => {
                    self.sentinel_seen = true;
                    return true;
                }
                Err(RelayError::Timeout) => return false,
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Reader thread body: stdout frames in, relay items out.
fn reader_loop(mut stdout: BufReader<ChildStdout>, producer: RelayProducer, pid: u32) {
    loop {
        match read_frame(&mut stdout) {
            Ok(payload) => {
                if producer.push(payload).is_err() {
                    // Consumer is gone; nobody is left to tell.
                    return;
                }
            }
            Err(FrameError::Closed) => {
                tracing::debug!("Worker {} closed its stdout", pid);
                producer.close("worker closed its stdout");
                return;
            }
            Err(e) => {
                tracing::warn!("Reading from worker {} failed: {}", pid, e);
                producer.close(e.to_string());
                return;
            }
        }
    }
}
