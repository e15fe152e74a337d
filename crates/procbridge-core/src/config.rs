//! Bridge configuration.
//!
//! Defaults match what deployed worker executables expect (`BRIDGE_FMO`
//! environment variable, one-minute reply wait).
//! `BridgeConfig::from_env` lets deployments tune timeouts without a rebuild.

use std::time::Duration;

/// Environment variable carrying the shared memory segment name to workers.
pub const DEFAULT_ENV_VAR: &str = "BRIDGE_FMO";

/// How long `read_response` waits for a reply before giving up.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `finish` waits for a worker to close its stdout before killing it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Largest image width the host can present.
    pub max_width: i32,
    /// Largest image height the host can present.
    pub max_height: i32,
    /// Bounded wait for one reply.
    pub read_timeout: Duration,
    /// Grace period between closing a worker's stdin and killing it.
    pub shutdown_grace: Duration,
    /// Name of the environment variable that carries the segment name.
    pub env_var: String,
    /// Forward worker stderr to the log instead of closing it at spawn.
    pub capture_stderr: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl BridgeConfig {
    /// Create a configuration for the given maximum image size.
    pub fn new(max_width: i32, max_height: i32) -> Self {
        Self {
            max_width,
            max_height,
            read_timeout: DEFAULT_READ_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            env_var: DEFAULT_ENV_VAR.to_string(),
            capture_stderr: false,
        }
    }

    /// Set the reply timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the environment variable used to publish the segment name.
    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var = name.into();
        self
    }

    /// Forward worker stderr to the log.
    pub fn with_capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    /// Apply overrides from the process environment.
    ///
    /// Recognized variables:
    /// - `PROCBRIDGE_READ_TIMEOUT_MS`
    /// - `PROCBRIDGE_SHUTDOWN_GRACE_MS`
    /// - `PROCBRIDGE_CAPTURE_STDERR` (`1`/`true`/`yes`)
    ///
    /// Malformed values are logged and ignored.
    pub fn from_env(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = parse_millis(&lookup, "PROCBRIDGE_READ_TIMEOUT_MS") {
            self.read_timeout = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "PROCBRIDGE_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace = ms;
        }
        if let Some(value) = lookup("PROCBRIDGE_CAPTURE_STDERR") {
            self.capture_stderr = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            );
        }
        self
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}
