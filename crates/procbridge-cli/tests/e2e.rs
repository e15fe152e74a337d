//! End-to-end tests for procbridge CLI commands.
//!
//! `cat` echoes every frame back unchanged, so it serves as a worker that
//! replies with its request.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests
#![cfg(unix)]

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn procbridge() -> Command {
    Command::cargo_bin("procbridge").expect("Failed to find procbridge binary")
}

#[test]
fn test_call_prints_reply() {
    procbridge()
        .args(["call", "cat", "hello bridge"])
        .assert()
        .success()
        .stdout("hello bridge\n");
}

#[test]
fn test_call_raw_reply() {
    procbridge()
        .args(["call", "cat", "abc", "--raw"])
        .assert()
        .success()
        .stdout("abc");
}

#[test]
fn test_call_with_pixels_round_trips_file() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("image.raw");
    let pixels: Vec<u8> = (0..2 * 2 * 4).collect();
    fs::write(&path, &pixels).unwrap();

    procbridge()
        .args(["call", "cat", "x", "--width", "2", "--height", "2", "--pixels"])
        .arg(&path)
        .args(["--mode", "rw"])
        .assert()
        .success()
        .stdout("x\n");

    assert_eq!(fs::read(&path).unwrap(), pixels);
}

#[test]
fn test_call_with_short_pixel_file_fails() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("short.raw");
    fs::write(&path, [0u8; 4]).unwrap();

    procbridge()
        .args(["call", "cat", "x", "--width", "2", "--height", "2", "--pixels"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("needs 16"));
}

#[test]
fn test_call_missing_worker_fails() {
    procbridge()
        .args(["call", "/no/such/dir/worker", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to start process"));
}

#[test]
fn test_bench_reports_latency() {
    procbridge()
        .args(["bench", "cat", "ping", "-n", "20"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Benchmarked"))
        .stdout(predicate::str::contains("20 calls"))
        .stdout(predicate::str::contains("p99"));
}

#[test]
fn test_bench_rejects_zero_iterations() {
    procbridge()
        .args(["bench", "cat", "ping", "-n", "0"])
        .assert()
        .failure();
}
