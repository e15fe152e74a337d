//! Per-call pixel staging descriptor.
//!
//! A [`CallMemory`] names a caller-owned pixel buffer, its dimensions, and
//! which direction the bytes travel through the shared segment. Pixels are
//! 4 bytes each, row-major.

use crate::error::{Error, Result};

/// Bytes per pixel in the shared segment.
pub const BYTES_PER_PIXEL: usize = 4;

/// Raw mode bits used on the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemMode(pub i32);

impl MemMode {
    /// Copy the caller buffer into the segment before dispatch.
    pub const READ: MemMode = MemMode(1);
    /// Copy the segment back into the caller buffer after the reply.
    pub const WRITE: MemMode = MemMode(2);
    /// The worker works on the segment in place; no staging copies.
    pub const DIRECT: MemMode = MemMode(4);

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: MemMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MemMode {
    type Output = MemMode;

    fn bitor(self, rhs: MemMode) -> MemMode {
        MemMode(self.0 | rhs.0)
    }
}

/// How the caller buffer participates in a call.
#[derive(Debug)]
pub enum PixelAccess<'a> {
    /// Upload only.
    Read(&'a [u8]),
    /// Download only.
    Write(&'a mut [u8]),
    /// Upload before the call and download after it.
    ReadWrite(&'a mut [u8]),
    /// No copies; only the dimensions are published.
    Direct,
}

/// Pixel buffer and dimensions for one call.
#[derive(Debug)]
pub struct CallMemory<'a> {
    width: u32,
    height: u32,
    access: PixelAccess<'a>,
}

impl<'a> CallMemory<'a> {
    /// Describe a call with explicit access.
    pub fn new(width: u32, height: u32, access: PixelAccess<'a>) -> Self {
        Self {
            width,
            height,
            access,
        }
    }

    /// Upload `pixels` before the call.
    pub fn read(pixels: &'a [u8], width: u32, height: u32) -> Self {
        Self::new(width, height, PixelAccess::Read(pixels))
    }

    /// Download into `pixels` after the call.
    pub fn write(pixels: &'a mut [u8], width: u32, height: u32) -> Self {
        Self::new(width, height, PixelAccess::Write(pixels))
    }

    /// Upload before and download after the call.
    pub fn read_write(pixels: &'a mut [u8], width: u32, height: u32) -> Self {
        Self::new(width, height, PixelAccess::ReadWrite(pixels))
    }

    /// Publish dimensions only.
    pub fn direct(width: u32, height: u32) -> Self {
        Self::new(width, height, PixelAccess::Direct)
    }

    /// Build a descriptor from C ABI mode bits.
    ///
    /// `DIRECT` on its own suppresses all copies; combined with `READ` or
    /// `WRITE` it is ignored and the copies happen. Mode `0` behaves like
    /// `DIRECT`.
    ///
    /// # Safety
    ///
    /// When `mode` has `READ` or `WRITE`, `pixels` must be valid for reads
    /// and writes of `width * height * 4` bytes for `'a`, and not aliased.
    pub unsafe fn from_raw(
        pixels: *mut u8,
        mode: MemMode,
        width: i32,
        height: i32,
    ) -> Result<Self> {
        let (width, height) = match (u32::try_from(width), u32::try_from(height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => {
                return Err(Error::InvalidMemory(format!(
                    "negative dimensions {}x{}",
                    width, height
                )));
            }
        };

        let read = mode.contains(MemMode::READ);
        let write = mode.contains(MemMode::WRITE);
        if !read && !write {
            return Ok(Self::direct(width, height));
        }

        if pixels.is_null() {
            return Err(Error::InvalidMemory("pixel buffer is null".to_string()));
        }
        let len = extent_of(width, height)?;
        // SAFETY: caller guarantees `pixels` covers `len` bytes for 'a.
        let buf = unsafe { std::slice::from_raw_parts_mut(pixels, len) };

        let access = match (read, write) {
            (true, true) => PixelAccess::ReadWrite(buf),
            (true, false) => PixelAccess::Read(buf),
            _ => PixelAccess::Write(buf),
        };
        Ok(Self::new(width, height, access))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn access(&self) -> &PixelAccess<'a> {
        &self.access
    }

    /// Mode bits equivalent to this descriptor.
    pub fn mode(&self) -> MemMode {
        match self.access {
            PixelAccess::Read(_) => MemMode::READ,
            PixelAccess::Write(_) => MemMode::WRITE,
            PixelAccess::ReadWrite(_) => MemMode::READ | MemMode::WRITE,
            PixelAccess::Direct => MemMode::DIRECT,
        }
    }

    /// Number of body bytes this call covers: `width * height * 4`.
    pub fn extent(&self) -> Result<usize> {
        extent_of(self.width, self.height)
    }

    /// Caller bytes to upload, if this call uploads.
    pub(crate) fn upload(&self) -> Option<&[u8]> {
        match &self.access {
            PixelAccess::Read(buf) => Some(*buf),
            PixelAccess::ReadWrite(buf) => Some(&**buf),
            PixelAccess::Write(_) | PixelAccess::Direct => None,
        }
    }

    /// Caller buffer to download into, if this call downloads.
    pub(crate) fn download(&mut self) -> Option<&mut [u8]> {
        match &mut self.access {
            PixelAccess::Write(buf) | PixelAccess::ReadWrite(buf) => Some(&mut **buf),
            PixelAccess::Read(_) | PixelAccess::Direct => None,
        }
    }

    /// Length of the caller buffer, or `None` for `Direct`.
    pub(crate) fn buffer_len(&self) -> Option<usize> {
        match &self.access {
            PixelAccess::Read(buf) => Some(buf.len()),
            PixelAccess::Write(buf) | PixelAccess::ReadWrite(buf) => Some(buf.len()),
            PixelAccess::Direct => None,
        }
    }
}

pub(crate) fn extent_of(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(BYTES_PER_PIXEL))
        .ok_or_else(|| Error::InvalidMemory(format!("{}x{} overflows", width, height)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent() {
        let pixels = [0u8; 8];
        let mem = CallMemory::read(&pixels, 2, 1);
        assert_eq!(mem.extent().unwrap(), 8);
        assert_eq!(mem.mode(), MemMode::READ);
        assert!(CallMemory::direct(u32::MAX, u32::MAX).extent().is_err());
    }

    #[test]
    fn test_from_raw_mode_mapping() {
        let mut pixels = vec![0u8; 16];
        let ptr = pixels.as_mut_ptr();

        {
            let mem =
                unsafe { CallMemory::from_raw(ptr, MemMode::READ | MemMode::WRITE, 2, 2) }.unwrap();
            assert!(matches!(mem.access(), PixelAccess::ReadWrite(buf) if buf.len() == 16));
        }
        {
            let mem =
                unsafe { CallMemory::from_raw(ptr, MemMode::WRITE | MemMode::DIRECT, 2, 2) }.unwrap();
            assert!(matches!(mem.access(), PixelAccess::Write(_)));
        }

        let mem = unsafe { CallMemory::from_raw(std::ptr::null_mut(), MemMode::DIRECT, 2, 2) }.unwrap();
        assert!(matches!(mem.access(), PixelAccess::Direct));

        let mem = unsafe { CallMemory::from_raw(std::ptr::null_mut(), MemMode(0), 2, 2) }.unwrap();
        assert_eq!(mem.mode(), MemMode::DIRECT);
    }

    #[test]
    fn test_from_raw_rejects_bad_input() {
        let err = unsafe { CallMemory::from_raw(std::ptr::null_mut(), MemMode::READ, 2, 2) };
        assert!(matches!(err, Err(Error::InvalidMemory(_))));

        let mut pixels = vec![0u8; 4];
        let err = unsafe { CallMemory::from_raw(pixels.as_mut_ptr(), MemMode::READ, -1, 1) };
        assert!(matches!(err, Err(Error::InvalidMemory(_))));
    }
}
