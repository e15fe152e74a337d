//! Registry of live worker processes, keyed by command line.
//!
//! Keys are compared as exact strings: two spellings of the same executable
//! get two independent workers. Dead workers are only noticed when their key
//! is addressed again, at which point they are finished and replaced.

use rustc_hash::FxHashMap;

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::ipc::WorkerProcess;

/// Maps command lines to their worker process.
#[derive(Debug)]
pub struct ProcessRegistry {
    workers: FxHashMap<String, WorkerProcess>,
    config: BridgeConfig,
}

impl ProcessRegistry {
    /// Create an empty registry; workers inherit `config`.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            workers: FxHashMap::default(),
            config,
        }
    }

    /// Return the usable worker for `command_line`, spawning or respawning
    /// as needed.
    ///
    /// A spawn failure leaves no entry for the key.
    pub fn resolve_or_spawn(
        &mut self,
        command_line: &str,
        shm_name: &str,
    ) -> Result<&mut WorkerProcess> {
        let (key, worker) = match self.workers.remove_entry(command_line) {
            Some((key, mut worker)) => {
                if worker.is_usable() {
                    (key, worker)
                } else {
                    tracing::warn!(
                        "Worker {} for '{}' is gone, respawning",
                        worker.pid(),
                        command_line
                    );
                    worker.finish();
                    drop(worker);
                    (key, self.spawn_worker(command_line, shm_name)?)
                }
            }
            None => (
                command_line.to_string(),
                self.spawn_worker(command_line, shm_name)?,
            ),
        };

        Ok(self.workers.entry(key).or_insert(worker))
    }

    fn spawn_worker(&self, command_line: &str, shm_name: &str) -> Result<WorkerProcess> {
        let worker = WorkerProcess::spawn(command_line, &self.config, shm_name)?;
        tracing::debug!("Registered worker {} for '{}'", worker.pid(), command_line);
        Ok(worker)
    }

    /// Whether a worker is registered under exactly this key.
    pub fn contains(&self, command_line: &str) -> bool {
        self.workers.contains_key(command_line)
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Finish every worker and empty the registry.
    pub fn shutdown(&mut self) {
        for (command_line, mut worker) in self.workers.drain() {
            tracing::debug!("Finishing worker {} for '{}'", worker.pid(), command_line);
            worker.finish();
        }
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    fn registry() -> ProcessRegistry {
        ProcessRegistry::new(
            BridgeConfig::new(16, 16)
                .with_read_timeout(Duration::from_secs(5))
                .with_shutdown_grace(Duration::from_millis(200)),
        )
    }

    #[test]
    fn test_reuses_live_worker() {
        let mut registry = registry();
        let first = registry.resolve_or_spawn("cat", "shm").unwrap().pid();
        let second = registry.resolve_or_spawn("cat", "shm").unwrap().pid();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_keys_are_not_canonicalized() {
        let mut registry = registry();
        let a = registry.resolve_or_spawn("cat", "shm").unwrap().pid();
        let b = registry.resolve_or_spawn("cat ", "shm").unwrap().pid();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_respawns_exhausted_worker() {
        let mut registry = registry();
        let worker = registry.resolve_or_spawn("true", "shm").unwrap();
        let first = worker.pid();
        assert!(worker.read_response().is_err());

        let worker = registry.resolve_or_spawn("true", "shm").unwrap();
        assert_ne!(worker.pid(), first);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_spawn_failure_leaves_no_entry() {
        let mut registry = registry();
        let err = registry
            .resolve_or_spawn("/no/such/dir/worker", "shm")
            .unwrap_err();
        assert!(matches!(err, Error::ProcessSpawn { .. }));
        assert!(registry.is_empty());

        let err = registry.resolve_or_spawn("", "shm").unwrap_err();
        assert!(matches!(err, Error::PathConversion(_)));
        assert!(!registry.contains(""));
    }

    #[test]
    fn test_shutdown_empties_registry() {
        let mut registry = registry();
        registry.resolve_or_spawn("cat", "shm").unwrap();
        registry.resolve_or_spawn("sleep 30", "shm").unwrap();
        registry.shutdown();
        assert!(registry.is_empty());
    }
}
