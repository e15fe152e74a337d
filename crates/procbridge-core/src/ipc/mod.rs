//! Inter-process communication with worker executables.
//!
//! This module provides the frame codec, child spawning, the bounded relay
//! queue and the `WorkerProcess` handle that ties them together.

pub mod protocol;
pub mod queue;
mod sigpipe;
pub mod transport;
mod worker;

pub use protocol::{FrameError, LENGTH_PREFIX_SIZE, read_frame, write_frame};
pub use queue::{RELAY_CAPACITY, RelayConsumer, RelayError, RelayItem, RelayProducer, relay_queue};
pub use transport::CommandLine;
pub use worker::WorkerProcess;
