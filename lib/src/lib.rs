//! This library lets a client use a simple "queue a buffer, dequeue a filled
//! buffer" API on top of a capture driver that is strictly asynchronous and
//! callback-driven.
//!
//! Such drivers complete each capture request in several fragments (the
//! metadata and the pixel buffer are delivered separately and in no particular
//! order), possibly from their own threads, and require the client buffers to
//! be mapped before they can be submitted. The crate is organized in layers:
//!
//! * The `memory` module models buffer identities (DMA-buf file descriptors or
//!   user pointers), the mapping service that turns them into driver-visible
//!   handles, and the table that caches these mappings.
//!
//! * The `driver` module defines the contract of the capture driver and of the
//!   result sink through which it reports completions. A software loopback
//!   driver is provided for testing purposes.
//!
//! * The `engine` module is the core of the library: it dispatches buffers to
//!   the driver, merges partial results and hands completed buffers back to
//!   their submitter, exactly once.
//!
//! * The `adapter` and `registry` modules provide the higher-level camera
//!   lifecycle (open, stream configuration, parameters, start/stop, close) and
//!   an explicit per-camera registry.
//!
pub mod adapter;
pub mod driver;
pub mod engine;
pub mod memory;
pub mod registry;
pub mod settings;

use std::fmt;
use std::fmt::{Debug, Display};

/// Identifier of a stream, as passed to `qbuf`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId(pub u32);

impl Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {}", self.0)
    }
}

/// A Fourcc pixel format.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// The only pixel format buffers can currently be allocated or mapped with.
    pub const NV12: PixelFormat = PixelFormat::from_fourcc(b"NV12");

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    /// Returns the size in bytes of a `width`x`height` frame in this format,
    /// along with the number of bits per pixel, or `None` if the format is not
    /// supported.
    ///
    /// # Examples
    ///
    /// ```
    /// # use camera_adapter::PixelFormat;
    /// assert_eq!(PixelFormat::NV12.frame_size(640, 480), Some((460800, 12)));
    /// assert_eq!(PixelFormat::from_fourcc(b"YUYV").frame_size(640, 480), None);
    /// assert_eq!(PixelFormat::NV12.frame_size(u32::MAX, u32::MAX), None);
    /// ```
    pub fn frame_size(self, width: u32, height: u32) -> Option<(usize, u32)> {
        match self {
            PixelFormat::NV12 => {
                let size = (width as usize)
                    .checked_mul(height as usize)?
                    .checked_mul(3)?
                    / 2;
                Some((size, 12))
            }
            _ => None,
        }
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use camera_adapter::PixelFormat;
/// assert_eq!(format!("{:?}", PixelFormat::NV12), "0x3231564e (NV12)");
/// ```
impl Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

/// Produces a displayable form of this PixelFormat.
impl Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

#[cfg(test)]
pub(crate) mod testing;
