//! Process-wide bridge instance.
//!
//! Hosts that cannot thread a [`Bridge`] value through their code use these
//! functions instead. Nothing is constructed implicitly: `call` before
//! `init` fails with [`ErrorKind::NotInitialized`] and spawns nothing.

use std::sync::{Arc, RwLock};

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::{Error, ErrorKind};
use crate::memory::CallMemory;

static BRIDGE: RwLock<Option<Arc<Bridge>>> = RwLock::new(None);

fn current() -> Option<Arc<Bridge>> {
    match BRIDGE.read() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Initialize the process-wide bridge.
///
/// Returns false if it is already initialized or creation fails.
pub fn init(max_width: i32, max_height: i32) -> bool {
    init_with_config(BridgeConfig::new(max_width, max_height).from_env())
}

/// Initialize the process-wide bridge with an explicit configuration.
pub fn init_with_config(config: BridgeConfig) -> bool {
    let mut slot = BRIDGE.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    if slot.is_some() {
        tracing::warn!("Bridge is already initialized");
        return false;
    }
    match Bridge::with_config(config) {
        Ok(bridge) => {
            *slot = Some(Arc::new(bridge));
            true
        }
        Err(e) => {
            tracing::error!("Bridge initialization failed: {}", e);
            false
        }
    }
}

/// Whether `init` has succeeded and `shutdown` has not run since.
pub fn is_initialized() -> bool {
    current().is_some()
}

/// Run one round trip on the process-wide bridge.
pub fn call(
    command_line: &str,
    request: &[u8],
    memory: Option<&mut CallMemory<'_>>,
) -> Result<Vec<u8>, ErrorKind> {
    call_with(command_line, request, memory, <[u8]>::to_vec)
}

/// Run one round trip and hand the retained reply to `on_reply`.
pub fn call_with<R>(
    command_line: &str,
    request: &[u8],
    memory: Option<&mut CallMemory<'_>>,
    on_reply: impl FnOnce(&[u8]) -> R,
) -> Result<R, ErrorKind> {
    let bridge = current().ok_or(ErrorKind::NotInitialized)?;
    bridge
        .call_with(command_line, request, memory, on_reply)
        .map_err(|e| report(command_line, e))
}

fn report(command_line: &str, error: Error) -> ErrorKind {
    tracing::debug!("Call to '{}' failed: {}", command_line, error);
    error.kind()
}

/// Tear down the process-wide bridge.
///
/// Returns false if it was not initialized.
pub fn shutdown() -> bool {
    let bridge = {
        let mut slot = BRIDGE.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.take()
    };
    match bridge {
        // A call still holding a clone finishes first; shutdown waits on the
        // bridge lock.
        Some(bridge) => bridge.shutdown(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_call_before_init() {
        assert!(!is_initialized());
        assert_eq!(call("cat", b"x", None), Err(ErrorKind::NotInitialized));
        assert!(!shutdown());
    }

    #[test]
    #[serial]
    fn test_init_twice() {
        assert!(init(8, 8));
        assert!(!init(8, 8));
        assert!(is_initialized());
        assert!(shutdown());
        assert!(!is_initialized());
    }

    #[test]
    #[serial]
    fn test_init_failure_leaves_uninitialized() {
        assert!(!init(-1, 8));
        assert!(!is_initialized());
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn test_call_after_shutdown() {
        assert!(init(8, 8));
        assert_eq!(call("cat", b"hi", None).unwrap(), b"hi");
        assert!(shutdown());
        assert_eq!(call("cat", b"hi", None), Err(ErrorKind::NotInitialized));
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn test_spawn_failure_kind() {
        assert!(init(8, 8));
        assert_eq!(
            call("/no/such/dir/worker", b"x", None),
            Err(ErrorKind::ProcessSpawnFailed)
        );
        assert!(shutdown());
    }
}
