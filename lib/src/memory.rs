//! Abstracts the buffers that client code submits for capture.
//!
//! A physical buffer is designated by a `BufferIdentity`: either a DMA-buf
//! file descriptor imported from another device, or a user pointer into
//! memory the client already has access to. Before a buffer can be handed to
//! the capture driver, its identity must be turned into a `MappedBuffer` by a
//! `BufferMapper`. The mapping gives the buffer a driver-visible
//! `BufferHandle` and a CPU-visible address.
//!
//! Mappings are cached per identity by the `MappingTable` so that a buffer
//! that cycles between the client and the driver is only mapped once, the
//! first time it is seen.
//!
//! `CameraBuffer` is the client-side object that travels through the capture
//! engine and comes back, filled, through `dqbuf`.
mod dmabuf;
pub mod table;

pub use dmabuf::*;

use crate::PixelFormat;

use bitflags::bitflags;
use std::fmt;
use std::fmt::{Debug, Display};
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Kinds of memory a stream can be configured to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Buffers allocated by the adapter itself through `allocate_memory`.
    Mmap,
    /// Buffers provided as user pointers.
    UserPtr,
    /// Buffers provided as DMA-buf file descriptors.
    DmaBuf,
}

/// Opaque key distinguishing a physical buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BufferIdentity {
    /// Imported DMA-buf, designated by its file descriptor.
    DmaBuf(RawFd),
    /// CPU-visible memory, designated by its address.
    UserPtr(usize),
}

impl BufferIdentity {
    /// Returns whether this identity can designate a buffer at all, i.e. the
    /// file descriptor is not negative and the address not null.
    pub fn is_valid(&self) -> bool {
        match *self {
            BufferIdentity::DmaBuf(fd) => fd >= 0,
            BufferIdentity::UserPtr(addr) => addr != 0,
        }
    }
}

impl Display for BufferIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferIdentity::DmaBuf(fd) => write!(f, "dmabuf fd {}", fd),
            BufferIdentity::UserPtr(addr) => write!(f, "userptr 0x{:x}", addr),
        }
    }
}

/// Pixel geometry of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per line of the luma plane.
    pub stride: u32,
    pub format: PixelFormat,
}

impl BufferGeometry {
    /// Geometry of a tightly packed NV12 buffer.
    pub fn nv12(width: u32, height: u32) -> Self {
        BufferGeometry {
            width,
            height,
            stride: width,
            format: PixelFormat::NV12,
        }
    }

    /// Size in bytes of the backing memory, or `None` if the format is not
    /// supported or the size does not fit in memory.
    pub fn size(&self) -> Option<usize> {
        self.format
            .frame_size(self.stride.max(self.width), self.height)
            .map(|(size, _)| size)
    }
}

/// Driver-visible representation of a mapped buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(pub u64);

impl Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A `BufferIdentity` after a successful mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedBuffer {
    identity: BufferIdentity,
    geometry: BufferGeometry,
    handle: BufferHandle,
    cpu_addr: usize,
}

impl MappedBuffer {
    pub fn new(
        identity: BufferIdentity,
        geometry: BufferGeometry,
        handle: BufferHandle,
        cpu_addr: usize,
    ) -> Self {
        MappedBuffer {
            identity,
            geometry,
            handle,
            cpu_addr,
        }
    }

    pub fn identity(&self) -> BufferIdentity {
        self.identity
    }

    pub fn geometry(&self) -> &BufferGeometry {
        &self.geometry
    }

    /// Handle to pass to the capture driver.
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Address at which the CPU can access the buffer's memory.
    pub fn cpu_addr(&self) -> usize {
        self.cpu_addr
    }
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("invalid buffer identity: {0}")]
    InvalidIdentity(BufferIdentity),
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("buffer geometry {0}x{1} has no backing memory")]
    EmptyGeometry(u32, u32),
    #[error("buffer geometry {0}x{1} is too large")]
    TooLarge(u32, u32),
    #[error("no more resources to map buffers")]
    Exhausted,
    #[error("error while mapping buffer: {0}")]
    Io(#[from] std::io::Error),
}

/// Service turning buffer identities into mapped buffers.
///
/// Implementations must be usable from several threads, as mappings may be
/// requested by any thread submitting buffers.
pub trait BufferMapper: Send + Sync {
    /// Import the buffer designated by `identity` and make it accessible to
    /// both the driver and the CPU.
    fn map(
        &self,
        identity: BufferIdentity,
        geometry: &BufferGeometry,
    ) -> Result<MappedBuffer, MapError>;

    /// Release a mapping previously returned by `map` or `allocate`.
    fn unmap(&self, buffer: &MappedBuffer);

    /// Allocate new memory for a buffer of `geometry` and return it mapped.
    /// The returned buffer's identity is a user pointer to that memory.
    fn allocate(&self, geometry: &BufferGeometry) -> Result<MappedBuffer, MapError>;
}

bitflags! {
    /// Status flags of a completed buffer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// The driver reported an error for the request this buffer was part of.
        const ERROR = 1 << 0;
        /// The request metadata carried no shutter timestamp.
        const NO_TIMESTAMP = 1 << 1;
    }
}

/// Buffer object owned by the client and passed to `qbuf`/returned by `dqbuf`.
///
/// Ownership of the buffer moves into the adapter when it is queued, and back
/// to the client once it has been captured into, so a buffer can never be
/// returned twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraBuffer {
    identity: BufferIdentity,
    geometry: BufferGeometry,
    addr: Option<usize>,
    sequence: Option<u32>,
    timestamp: u64,
    flags: BufferFlags,
}

impl CameraBuffer {
    /// Create a buffer backed by the DMA-buf `fd`. Its CPU address is set the
    /// first time it gets mapped.
    pub fn dmabuf(fd: RawFd, geometry: BufferGeometry) -> Self {
        Self::new(BufferIdentity::DmaBuf(fd), geometry, None)
    }

    /// Create a buffer backed by the memory at `addr`.
    pub fn user_ptr(addr: usize, geometry: BufferGeometry) -> Self {
        Self::new(BufferIdentity::UserPtr(addr), geometry, Some(addr))
    }

    pub(crate) fn from_mapped(mapped: &MappedBuffer) -> Self {
        Self::new(mapped.identity, mapped.geometry, Some(mapped.cpu_addr))
    }

    fn new(identity: BufferIdentity, geometry: BufferGeometry, addr: Option<usize>) -> Self {
        CameraBuffer {
            identity,
            geometry,
            addr,
            sequence: None,
            timestamp: 0,
            flags: BufferFlags::empty(),
        }
    }

    pub fn identity(&self) -> BufferIdentity {
        self.identity
    }

    pub fn geometry(&self) -> &BufferGeometry {
        &self.geometry
    }

    /// CPU address of the buffer's memory, if known yet.
    pub fn addr(&self) -> Option<usize> {
        self.addr
    }

    /// Sequence number of the capture this buffer was filled by.
    pub fn sequence(&self) -> Option<u32> {
        self.sequence
    }

    /// Shutter timestamp of the capture, in nanoseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub(crate) fn set_addr(&mut self, addr: usize) {
        self.addr = Some(addr);
    }

    pub(crate) fn set_capture_info(&mut self, sequence: u32, timestamp: u64) {
        self.sequence = Some(sequence);
        self.timestamp = timestamp;
    }

    pub(crate) fn add_flags(&mut self, flags: BufferFlags) {
        self.flags |= flags;
    }

    /// Reset the capture information so the buffer can be queued again.
    pub fn recycle(&mut self) {
        self.sequence = None;
        self.timestamp = 0;
        self.flags = BufferFlags::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_validity() {
        assert!(BufferIdentity::DmaBuf(0).is_valid());
        assert!(BufferIdentity::DmaBuf(12).is_valid());
        assert!(!BufferIdentity::DmaBuf(-1).is_valid());
        assert!(BufferIdentity::UserPtr(0x1000).is_valid());
        assert!(!BufferIdentity::UserPtr(0).is_valid());
    }

    #[test]
    fn test_geometry_size() {
        assert_eq!(BufferGeometry::nv12(640, 480).size(), Some(460800));

        let padded = BufferGeometry {
            stride: 768,
            ..BufferGeometry::nv12(640, 480)
        };
        assert_eq!(padded.size(), Some(552960));

        let yuyv = BufferGeometry {
            format: PixelFormat::from_fourcc(b"YUYV"),
            ..BufferGeometry::nv12(640, 480)
        };
        assert_eq!(yuyv.size(), None);
    }

    #[test]
    fn test_camera_buffer_recycle() {
        let mut buffer = CameraBuffer::dmabuf(7, BufferGeometry::nv12(64, 64));
        assert_eq!(buffer.addr(), None);
        assert_eq!(buffer.sequence(), None);

        buffer.set_addr(0x4000);
        buffer.set_capture_info(3, 1234);
        buffer.add_flags(BufferFlags::ERROR);
        assert_eq!(buffer.sequence(), Some(3));
        assert_eq!(buffer.timestamp(), 1234);
        assert!(buffer.flags().contains(BufferFlags::ERROR));

        buffer.recycle();
        assert_eq!(buffer.sequence(), None);
        assert_eq!(buffer.timestamp(), 0);
        assert!(buffer.flags().is_empty());
        // The mapping survives recycling.
        assert_eq!(buffer.addr(), Some(0x4000));
    }
}
