//! Shared memory channel for bulk pixel transfer.
//!
//! One named segment per bridge, sized at init for the largest image the host
//! can present. Layout (all fields `u32` little-endian):
//!
//! ```text
//! +-------------+-----------+---------+-------+--------+------------------------+
//! | header_size | body_size | version | width | height | body: w * h * 4 bytes  |
//! +-------------+-----------+---------+-------+--------+------------------------+
//! ```
//!
//! `width`/`height` describe the current call and are rewritten on every call
//! that carries a [`CallMemory`]; the logical body extent comes from them,
//! never from the segment size.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::memory::{CallMemory, extent_of};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix::Segment;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows::Segment;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 20;

/// Layout version written into every segment.
pub const FORMAT_VERSION: u32 = 1;

static NEXT_SEGMENT: AtomicU32 = AtomicU32::new(0);

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub header_size: u32,
    pub body_size: u32,
    pub version: u32,
    pub width: u32,
    pub height: u32,
}

impl SegmentHeader {
    fn read_from(bytes: &[u8]) -> Self {
        let field = |i: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_le_bytes(raw)
        };
        Self {
            header_size: field(0),
            body_size: field(1),
            version: field(2),
            width: field(3),
            height: field(4),
        }
    }

    fn write_to(&self, bytes: &mut [u8]) {
        let fields = [
            self.header_size,
            self.body_size,
            self.version,
            self.width,
            self.height,
        ];
        for (i, value) in fields.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Body bytes covered by the declared width and height.
    pub fn declared_extent(&self) -> usize {
        extent_of(self.width, self.height)
            .unwrap_or(usize::MAX)
            .min(self.body_size as usize)
    }
}

/// Unique OS-level name for a new segment.
fn segment_name() -> String {
    let seq = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
    let base = format!("bridge_fmo_{:08x}_{:x}", std::process::id(), seq);
    if cfg!(unix) { format!("/{}", base) } else { base }
}

/// Host side of the shared segment.
pub struct SharedMemoryChannel {
    segment: Segment,
    name: String,
}

impl std::fmt::Debug for SharedMemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryChannel")
            .field("name", &self.name)
            .field("header", &self.header())
            .finish()
    }
}

impl SharedMemoryChannel {
    /// Create and map a segment for images up to `max_width` x `max_height`.
    pub fn create(max_width: i32, max_height: i32) -> Result<Self> {
        let invalid = || Error::InvalidDimensions {
            width: max_width,
            height: max_height,
        };
        if max_width <= 0 || max_height <= 0 {
            return Err(invalid());
        }
        let body_size = extent_of(max_width as u32, max_height as u32)
            .ok()
            .filter(|size| u32::try_from(*size).is_ok())
            .ok_or_else(invalid)?;

        let name = segment_name();
        let mut segment = Segment::create(&name, HEADER_SIZE + body_size)
            .map_err(|e| Error::SharedMemory(format!("cannot create segment {}: {}", name, e)))?;

        SegmentHeader {
            header_size: HEADER_SIZE as u32,
            body_size: body_size as u32,
            version: FORMAT_VERSION,
            width: max_width as u32,
            height: max_height as u32,
        }
        .write_to(segment.as_mut_slice());

        tracing::debug!(
            "Created shared segment {} ({} bytes body)",
            name,
            body_size
        );
        Ok(Self { segment, name })
    }

    /// OS-level name workers use to map the segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current header contents.
    pub fn header(&self) -> SegmentHeader {
        SegmentHeader::read_from(self.segment.as_slice())
    }

    /// Maximum body size in bytes.
    pub fn body_capacity(&self) -> usize {
        self.segment.len() - HEADER_SIZE
    }

    /// Body bytes within the currently declared width and height.
    pub fn body(&self) -> &[u8] {
        let extent = self.header().declared_extent().min(self.body_capacity());
        &self.segment.as_slice()[HEADER_SIZE..HEADER_SIZE + extent]
    }

    /// Publish the call's dimensions and upload its pixels if it uploads.
    ///
    /// Nothing is written when the extent does not fit.
    pub fn stage(&mut self, memory: &CallMemory<'_>) -> Result<()> {
        let extent = self.check_extent(memory)?;

        let mut header = self.header();
        header.width = memory.width();
        header.height = memory.height();
        let bytes = self.segment.as_mut_slice();
        header.write_to(bytes);

        if let Some(pixels) = memory.upload() {
            bytes[HEADER_SIZE..HEADER_SIZE + extent].copy_from_slice(&pixels[..extent]);
        }
        Ok(())
    }

    /// Download the call's extent into the caller buffer if it downloads.
    ///
    /// Caller bytes beyond `width * height * 4` are left untouched.
    pub fn destage(&self, memory: &mut CallMemory<'_>) -> Result<()> {
        let extent = self.check_extent(memory)?;
        let body = &self.segment.as_slice()[HEADER_SIZE..HEADER_SIZE + extent];
        if let Some(pixels) = memory.download() {
            pixels[..extent].copy_from_slice(body);
        }
        Ok(())
    }

    fn check_extent(&self, memory: &CallMemory<'_>) -> Result<usize> {
        let extent = memory.extent()?;
        if extent > self.body_capacity() {
            return Err(Error::InvalidMemory(format!(
                "{}x{} needs {} bytes, segment holds {}",
                memory.width(),
                memory.height(),
                extent,
                self.body_capacity()
            )));
        }
        if let Some(len) = memory.buffer_len() {
            if len < extent {
                return Err(Error::InvalidMemory(format!(
                    "{}x{} needs {} bytes, buffer holds {}",
                    memory.width(),
                    memory.height(),
                    extent,
                    len
                )));
            }
        }
        Ok(extent)
    }
}

/// Worker side of the shared segment.
pub struct SharedMemoryView {
    segment: Segment,
}

impl SharedMemoryView {
    /// Map the segment named `name`.
    pub fn open(name: &str) -> Result<Self> {
        let segment = Segment::open(name)
            .map_err(|e| Error::SharedMemory(format!("cannot open segment {}: {}", name, e)))?;
        if segment.len() < HEADER_SIZE {
            return Err(Error::SharedMemory(format!(
                "segment {} is smaller than its header",
                name
            )));
        }
        Ok(Self { segment })
    }

    /// Map the segment named by environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self> {
        let name = std::env::var(var)
            .map_err(|e| Error::SharedMemory(format!("{} is not set: {}", var, e)))?;
        Self::open(&name)
    }

    /// Current header contents.
    pub fn header(&self) -> SegmentHeader {
        SegmentHeader::read_from(self.segment.as_slice())
    }

    fn extent(&self) -> usize {
        self.header()
            .declared_extent()
            .min(self.segment.len() - HEADER_SIZE)
    }

    /// Pixels within the declared width and height.
    pub fn body(&self) -> &[u8] {
        let extent = self.extent();
        &self.segment.as_slice()[HEADER_SIZE..HEADER_SIZE + extent]
    }

    /// Mutable pixels within the declared width and height.
    pub fn body_mut(&mut self) -> &mut [u8] {
        let extent = self.extent();
        &mut self.segment.as_mut_slice()[HEADER_SIZE..HEADER_SIZE + extent]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_writes_header() {
        let channel = SharedMemoryChannel::create(4, 3).unwrap();
        let header = channel.header();
        assert_eq!(header.header_size, HEADER_SIZE as u32);
        assert_eq!(header.body_size, 48);
        assert_eq!(header.version, FORMAT_VERSION);
        assert_eq!((header.width, header.height), (4, 3));
        assert_eq!(channel.body_capacity(), 48);
    }

    #[test]
    fn test_create_rejects_bad_dimensions() {
        assert!(matches!(
            SharedMemoryChannel::create(0, 10),
            Err(Error::InvalidDimensions { .. })
        ));
        assert!(matches!(
            SharedMemoryChannel::create(10, -1),
            Err(Error::InvalidDimensions { .. })
        ));
        assert!(matches!(
            SharedMemoryChannel::create(i32::MAX, i32::MAX),
            Err(Error::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_names_are_unique() {
        let a = SharedMemoryChannel::create(1, 1).unwrap();
        let b = SharedMemoryChannel::create(1, 1).unwrap();
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_stage_read_copies_exact_extent() {
        let mut channel = SharedMemoryChannel::create(8, 8).unwrap();
        let pixels = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];

        channel.stage(&CallMemory::read(&pixels, 2, 1)).unwrap();

        let header = channel.header();
        assert_eq!((header.width, header.height), (2, 1));
        assert_eq!(channel.body(), &pixels);
    }

    #[test]
    fn test_destage_write_leaves_tail_untouched() {
        let mut channel = SharedMemoryChannel::create(8, 8).unwrap();
        let source: Vec<u8> = (1..=8).collect();
        channel.stage(&CallMemory::read(&source, 2, 1)).unwrap();

        let mut target = vec![0x77u8; 12];
        let mut mem = CallMemory::write(&mut target, 2, 1);
        channel.stage(&mem).unwrap();
        channel.destage(&mut mem).unwrap();

        assert_eq!(&target[..8], source.as_slice());
        assert_eq!(&target[8..], &[0x77; 4]);
    }

    #[test]
    fn test_direct_publishes_dimensions_only() {
        let mut channel = SharedMemoryChannel::create(4, 4).unwrap();
        let pixels = [9u8; 16];
        channel.stage(&CallMemory::read(&pixels, 2, 2)).unwrap();

        channel.stage(&CallMemory::direct(1, 1)).unwrap();
        assert_eq!((channel.header().width, channel.header().height), (1, 1));
        assert_eq!(channel.body(), &[9, 9, 9, 9]);
    }

    #[test]
    fn test_oversize_extent_rejected() {
        let mut channel = SharedMemoryChannel::create(2, 2).unwrap();
        let pixels = vec![0u8; 64];
        let err = channel.stage(&CallMemory::read(&pixels, 4, 4)).unwrap_err();
        assert!(matches!(err, Error::InvalidMemory(_)));
        assert_eq!((channel.header().width, channel.header().height), (2, 2));

        let short = [0u8; 4];
        let err = channel.stage(&CallMemory::read(&short, 2, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidMemory(_)));
    }

    #[test]
    fn test_view_sees_host_writes() {
        let mut channel = SharedMemoryChannel::create(4, 4).unwrap();
        let pixels: Vec<u8> = (0..8).collect();
        channel.stage(&CallMemory::read(&pixels, 1, 2)).unwrap();

        let mut view = SharedMemoryView::open(channel.name()).unwrap();
        assert_eq!(view.header(), channel.header());
        assert_eq!(view.body(), pixels.as_slice());

        for b in view.body_mut() {
            *b = !*b;
        }
        let expected: Vec<u8> = pixels.iter().map(|b| !b).collect();
        assert_eq!(channel.body(), expected.as_slice());
    }

    #[test]
    fn test_open_missing_segment() {
        assert!(matches!(
            SharedMemoryView::open(if cfg!(unix) { "/bridge_fmo_missing" } else { "bridge_fmo_missing" }),
            Err(Error::SharedMemory(_))
        ));
    }
}
