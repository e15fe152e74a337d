//! Bridge facade: one lock around the registry and the shared segment.
//!
//! Every call runs the full round trip under a single reentrant mutex, so
//! at most one request is in flight across all workers. The segment has one
//! instance and is staged per call; serializing everything keeps staging and
//! stdin writes from interleaving.

use std::cell::RefCell;

use parking_lot::ReentrantMutex;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::memory::CallMemory;
use crate::registry::ProcessRegistry;
use crate::shm::{SegmentHeader, SharedMemoryChannel};

/// State that exists between `init` and `shutdown`.
#[derive(Debug)]
struct BridgeState {
    registry: ProcessRegistry,
    channel: SharedMemoryChannel,
}

impl BridgeState {
    fn round_trip<R>(
        &mut self,
        command_line: &str,
        request: &[u8],
        mut memory: Option<&mut CallMemory<'_>>,
        on_reply: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let worker = self
            .registry
            .resolve_or_spawn(command_line, self.channel.name())?;

        if let Some(memory) = memory.as_deref() {
            self.channel.stage(memory)?;
        }

        let pid = worker.pid();
        worker.write_request(request)?;
        let reply = worker.read_response()?;
        tracing::trace!("Worker {} replied with {} bytes", pid, reply.len());

        if let Some(memory) = memory.as_deref_mut() {
            self.channel.destage(memory)?;
        }

        Ok(on_reply(reply))
    }
}

/// Owned bridge between a host and its worker executables.
pub struct Bridge {
    state: ReentrantMutex<RefCell<Option<BridgeState>>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("shm_name", &self.shm_name())
            .field("workers", &self.worker_count())
            .finish()
    }
}

impl Bridge {
    /// Create a bridge whose segment holds images up to the given size.
    pub fn init(max_width: i32, max_height: i32) -> Result<Self> {
        Self::with_config(BridgeConfig::new(max_width, max_height))
    }

    /// Create a bridge from an explicit configuration.
    pub fn with_config(config: BridgeConfig) -> Result<Self> {
        let channel = SharedMemoryChannel::create(config.max_width, config.max_height)?;
        tracing::debug!(
            "Bridge initialized with segment {} ({}x{})",
            channel.name(),
            config.max_width,
            config.max_height
        );
        let state = BridgeState {
            registry: ProcessRegistry::new(config),
            channel,
        };
        Ok(Self {
            state: ReentrantMutex::new(RefCell::new(Some(state))),
        })
    }

    /// Send `request` to the worker started from `command_line` and return
    /// a copy of its reply.
    ///
    /// With `memory`, the call's dimensions are published in the segment
    /// header and pixels are staged in and out according to its access.
    pub fn call(
        &self,
        command_line: &str,
        request: &[u8],
        memory: Option<&mut CallMemory<'_>>,
    ) -> Result<Vec<u8>> {
        self.call_with(command_line, request, memory, <[u8]>::to_vec)
    }

    /// Like [`call`](Self::call), but hands the worker's retained reply to
    /// `on_reply` without copying it.
    ///
    /// `on_reply` runs with the bridge lock held; calling back into this
    /// bridge from it fails with [`Error::Busy`].
    pub fn call_with<R>(
        &self,
        command_line: &str,
        request: &[u8],
        memory: Option<&mut CallMemory<'_>>,
        on_reply: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let guard = self.state.lock();
        let mut slot = guard.try_borrow_mut().map_err(|_| Error::Busy)?;
        let state = slot.as_mut().ok_or(Error::NotInitialized)?;
        state.round_trip(command_line, request, memory, on_reply)
    }

    /// Finish every worker and release the segment.
    ///
    /// Returns false if the bridge was already shut down, or if called from
    /// inside a reply callback on this bridge.
    pub fn shutdown(&self) -> bool {
        let guard = self.state.lock();
        let Ok(mut slot) = guard.try_borrow_mut() else {
            tracing::warn!("Ignoring shutdown requested during a call");
            return false;
        };
        let Some(mut state) = slot.take() else {
            return false;
        };
        state.registry.shutdown();
        tracing::debug!("Bridge segment {} released", state.channel.name());
        true
    }

    /// Whether `shutdown` has not run yet.
    pub fn is_active(&self) -> bool {
        let guard = self.state.lock();
        guard.try_borrow().map(|slot| slot.is_some()).unwrap_or(true)
    }

    /// Number of registered workers, live or not yet found dead.
    pub fn worker_count(&self) -> usize {
        self.inspect(|state| state.registry.len()).unwrap_or(0)
    }

    /// OS-level name of the shared segment.
    pub fn shm_name(&self) -> Option<String> {
        self.inspect(|state| state.channel.name().to_string())
    }

    /// Snapshot of the segment header.
    pub fn header(&self) -> Option<SegmentHeader> {
        self.inspect(|state| state.channel.header())
    }

    fn inspect<T>(&self, f: impl FnOnce(&BridgeState) -> T) -> Option<T> {
        let guard = self.state.lock();
        let slot = guard.try_borrow().ok()?;
        slot.as_ref().map(f)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn bridge() -> Bridge {
        Bridge::with_config(
            BridgeConfig::new(4, 4)
                .with_read_timeout(Duration::from_secs(5))
                .with_shutdown_grace(Duration::from_millis(200)),
        )
        .unwrap()
    }

    #[test]
    fn test_call_round_trip() {
        let bridge = bridge();
        assert_eq!(bridge.call("cat", b"ping", None).unwrap(), b"ping");
        assert_eq!(bridge.call("cat", b"", None).unwrap(), b"");
        assert_eq!(bridge.worker_count(), 1);
    }

    #[test]
    fn test_call_with_borrows_reply() {
        let bridge = bridge();
        let len = bridge.call_with("cat", b"abc", None, |reply| reply.len()).unwrap();
        assert_eq!(len, 3);
    }

    #[test]
    fn test_memory_staged_both_ways() {
        let bridge = bridge();
        let mut pixels: Vec<u8> = (0..16).collect();
        let before = pixels.clone();
        let mut memory = CallMemory::read_write(&mut pixels, 2, 2);

        bridge.call("cat", b"x", Some(&mut memory)).unwrap();

        let header = bridge.header().unwrap();
        assert_eq!((header.width, header.height), (2, 2));
        assert_eq!(pixels, before);
    }

    #[test]
    fn test_invalid_memory_is_reported() {
        let bridge = bridge();
        let pixels = vec![0u8; 400];
        let mut memory = CallMemory::read(&pixels, 10, 10);
        let err = bridge.call("cat", b"x", Some(&mut memory)).unwrap_err();
        assert!(matches!(err, Error::InvalidMemory(_)));
    }

    #[test]
    fn test_reentrant_call_is_busy() {
        let bridge = bridge();
        let inner = bridge
            .call_with("cat", b"outer", None, |_| bridge.call("cat", b"inner", None))
            .unwrap();
        assert!(matches!(inner, Err(Error::Busy)));
        assert!(!bridge
            .call_with("cat", b"outer", None, |_| bridge.shutdown())
            .unwrap());
        assert!(bridge.is_active());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let bridge = bridge();
        bridge.call("cat", b"x", None).unwrap();
        assert!(bridge.shutdown());
        assert!(!bridge.shutdown());
        assert!(!bridge.is_active());
        assert!(bridge.shm_name().is_none());
        assert!(matches!(
            bridge.call("cat", b"x", None),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn test_concurrent_callers_get_their_own_replies() {
        let bridge = Arc::new(bridge());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let bridge = Arc::clone(&bridge);
                thread::spawn(move || {
                    for j in 0..25 {
                        let request = format!("{}-{}", i, j);
                        let reply = bridge.call("cat", request.as_bytes(), None).unwrap();
                        assert_eq!(reply, request.as_bytes());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(bridge.worker_count(), 1);
    }

    #[test]
    fn test_init_rejects_bad_dimensions() {
        assert!(matches!(
            Bridge::init(0, 0),
            Err(Error::InvalidDimensions { .. })
        ));
    }
}
