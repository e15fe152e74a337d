//! Bench command implementation for procbridge CLI.
//!
//! Repeats one request against a warm worker and reports round-trip latency.

use std::time::{Duration, Instant};

use anyhow::Context;
use procbridge_core::{Bridge, BridgeConfig};

use crate::colors;

/// Latency summary over a run.
#[derive(Debug)]
pub struct Summary {
    pub calls: usize,
    pub total: Duration,
    pub min: Duration,
    pub p50: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl Summary {
    /// Summarize `samples`; `None` when empty.
    pub fn from_samples(mut samples: Vec<Duration>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let calls = samples.len();
        let percentile = |p: usize| samples[((calls - 1) * p) / 100];
        Some(Self {
            calls,
            total: samples.iter().sum(),
            min: samples[0],
            p50: percentile(50),
            p99: percentile(99),
            max: samples[calls - 1],
        })
    }

    pub fn mean(&self) -> Duration {
        let nanos = self.total.as_nanos() / self.calls as u128;
        u64::try_from(nanos).map_or(Duration::MAX, Duration::from_nanos)
    }

    pub fn calls_per_sec(&self) -> f64 {
        self.calls as f64 / self.total.as_secs_f64().max(f64::EPSILON)
    }
}

/// Run `iterations` calls and print the latency summary.
pub fn execute(exe: &str, request: &[u8], iterations: usize) -> anyhow::Result<()> {
    if iterations == 0 {
        anyhow::bail!("iteration count must be positive");
    }

    let bridge =
        Bridge::with_config(BridgeConfig::default().from_env()).context("Failed to initialize bridge")?;

    // Spawn outside the measured loop.
    let start = Instant::now();
    bridge.call(exe, request, None).context("Warm-up call failed")?;
    let startup = start.elapsed();

    let mut samples = Vec::with_capacity(iterations);
    for i in 0..iterations {
        let start = Instant::now();
        bridge
            .call_with(exe, request, None, |_| ())
            .with_context(|| format!("Call {} of {} failed", i + 1, iterations))?;
        samples.push(start.elapsed());
    }
    bridge.shutdown();

    let Some(summary) = Summary::from_samples(samples) else {
        return Ok(());
    };

    println!(
        "{}Benchmarked{} {} calls to {}",
        colors::BOLD,
        colors::RESET,
        summary.calls,
        exe
    );
    println!("{}  first call (spawn): {:?}{}", colors::DIM, startup, colors::RESET);
    println!("  min   {:?}", summary.min);
    println!("  p50   {:?}", summary.p50);
    println!("  p99   {:?}", summary.p99);
    println!("  max   {:?}", summary.max);
    println!("  mean  {:?}", summary.mean());
    println!(
        "{}{:.0} calls/s{}",
        colors::GREEN,
        summary.calls_per_sec(),
        colors::RESET
    );
    Ok(())
}
