//! Process bridge for calling out-of-process worker executables.
//!
//! This crate provides:
//! - Length-prefixed frame codec over worker stdin/stdout
//! - Lazily spawned, self-healing workers keyed by command line
//! - A shared memory segment for bulk pixel transfer
//! - A serialized `Bridge` facade, a process-wide API and a C ABI
//! - Worker-side helpers for writing worker executables

pub mod api;
pub mod bridge;
pub mod child;
pub mod config;
pub mod error;
pub mod ffi;
pub mod ipc;
pub mod memory;
pub mod registry;
pub mod shm;

pub use bridge::Bridge;
pub use child::FrameServer;
pub use config::BridgeConfig;
pub use error::{Error, ErrorKind, Result};
pub use ipc::{CommandLine, FrameError, WorkerProcess};
pub use memory::{BYTES_PER_PIXEL, CallMemory, MemMode, PixelAccess};
pub use registry::ProcessRegistry;
pub use shm::{FORMAT_VERSION, HEADER_SIZE, SegmentHeader, SharedMemoryChannel, SharedMemoryView};
