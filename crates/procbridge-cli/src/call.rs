//! Call command implementation for procbridge CLI.
//!
//! Sends one request to a worker, optionally staging an image file through
//! the shared segment, and prints the reply.

use std::fs;
use std::io::{self, Write};

use anyhow::Context;
use procbridge_core::{BYTES_PER_PIXEL, Bridge, BridgeConfig, CallMemory};

use crate::Mode;

/// Image file staged through shared memory.
pub struct Image {
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub mode: Mode,
}

impl Image {
    fn extent(&self) -> anyhow::Result<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|px| px.checked_mul(BYTES_PER_PIXEL))
            .with_context(|| format!("{}x{} is too large", self.width, self.height))
    }

    /// Pixels to hand to the worker; a download-only file may not exist yet.
    fn load(&self) -> anyhow::Result<Vec<u8>> {
        let extent = self.extent()?;
        let mut pixels = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if self.mode == Mode::W && e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", self.path)),
        };
        if pixels.len() < extent {
            if self.mode != Mode::W {
                anyhow::bail!(
                    "{} holds {} bytes, {}x{} needs {}",
                    self.path,
                    pixels.len(),
                    self.width,
                    self.height,
                    extent
                );
            }
            pixels.resize(extent, 0);
        }
        Ok(pixels)
    }
}

/// Send one request and print the reply.
pub fn execute(exe: &str, request: &[u8], image: Option<Image>, raw: bool) -> anyhow::Result<()> {
    let config = match &image {
        Some(image) => BridgeConfig::new(
            i32::try_from(image.width).context("width out of range")?,
            i32::try_from(image.height).context("height out of range")?,
        ),
        None => BridgeConfig::default(),
    }
    .from_env();
    let bridge = Bridge::with_config(config).context("Failed to initialize bridge")?;

    let reply = match image {
        Some(image) => {
            let mut pixels = image.load()?;
            let (width, height) = (image.width, image.height);
            let mut memory = match image.mode {
                Mode::R => CallMemory::read(&pixels, width, height),
                Mode::W => CallMemory::write(&mut pixels, width, height),
                Mode::Rw => CallMemory::read_write(&mut pixels, width, height),
            };
            let reply = bridge.call(exe, request, Some(&mut memory))?;
            if image.mode != Mode::R {
                fs::write(&image.path, &pixels)
                    .with_context(|| format!("Failed to write {}", image.path))?;
            }
            reply
        }
        None => bridge.call(exe, request, None)?,
    };
    bridge.shutdown();

    let mut stdout = io::stdout().lock();
    if raw {
        stdout.write_all(&reply)?;
    } else {
        writeln!(stdout, "{}", String::from_utf8_lossy(&reply))?;
    }
    stdout.flush()?;
    Ok(())
}
