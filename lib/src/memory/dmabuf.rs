//! Buffer mapper backed by memory mappings of DMA-buf file descriptors.
use super::*;

use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// What keeps the memory of a mapped buffer alive.
enum Backing {
    /// Shared mapping of an imported DMA-buf.
    Imported(MmapMut),
    /// Anonymous memory allocated by the mapper.
    Allocated(MmapMut),
    /// Client memory, which we only reference.
    UserPtr,
}

impl Backing {
    fn data(&mut self) -> Option<&mut [u8]> {
        match self {
            Backing::Imported(mapping) | Backing::Allocated(mapping) => Some(mapping.as_mut()),
            Backing::UserPtr => None,
        }
    }
}

/// `BufferMapper` that maps DMA-buf file descriptors into the process address
/// space and passes user pointers through unchanged.
///
/// The file descriptors are not owned by the mapper: the client must keep
/// them open for as long as the buffers are in use. Mappings are released by
/// `unmap`, or when the mapper is dropped.
pub struct DmaBufMapper {
    mappings: Mutex<BTreeMap<BufferHandle, Backing>>,
    next_handle: AtomicU64,
}

impl Default for DmaBufMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaBufMapper {
    pub fn new() -> Self {
        DmaBufMapper {
            mappings: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Number of buffers currently mapped.
    pub fn num_mapped(&self) -> usize {
        self.mappings.lock().unwrap().len()
    }

    /// Run `f` on the memory of the buffer designated by `handle`. Returns
    /// `None` if the handle is unknown or if the buffer is a user pointer the
    /// mapper did not allocate.
    pub fn with_data<R, F: FnOnce(&mut [u8]) -> R>(
        &self,
        handle: BufferHandle,
        f: F,
    ) -> Option<R> {
        let mut mappings = self.mappings.lock().unwrap();
        mappings.get_mut(&handle).and_then(Backing::data).map(f)
    }

    fn register(
        &self,
        identity: BufferIdentity,
        geometry: &BufferGeometry,
        cpu_addr: usize,
        backing: Backing,
    ) -> MappedBuffer {
        let handle = BufferHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.mappings.lock().unwrap().insert(handle, backing);

        debug!(
            "Mapped {} as handle {} at 0x{:x} ({}x{}, {})",
            identity, handle, cpu_addr, geometry.width, geometry.height, geometry.format
        );

        MappedBuffer::new(identity, *geometry, handle, cpu_addr)
    }
}

/// Returns the size of the memory backing `geometry`, provided it is one we
/// know how to map.
fn backing_size(geometry: &BufferGeometry) -> Result<usize, MapError> {
    if geometry.format.frame_size(0, 0).is_none() {
        return Err(MapError::UnsupportedFormat(geometry.format));
    }

    match geometry.size() {
        None => Err(MapError::TooLarge(geometry.width, geometry.height)),
        Some(0) => Err(MapError::EmptyGeometry(geometry.width, geometry.height)),
        Some(size) => Ok(size),
    }
}

impl BufferMapper for DmaBufMapper {
    fn map(
        &self,
        identity: BufferIdentity,
        geometry: &BufferGeometry,
    ) -> Result<MappedBuffer, MapError> {
        if !identity.is_valid() {
            return Err(MapError::InvalidIdentity(identity));
        }
        let size = backing_size(geometry)?;

        let (cpu_addr, backing) = match identity {
            BufferIdentity::DmaBuf(fd) => {
                // Safe because the client guarantees `fd` remains open and
                // backed by at least `size` bytes while the buffer is mapped.
                let mut mapping = unsafe { MmapOptions::new().len(size).map_mut(fd)? };
                (mapping.as_mut_ptr() as usize, Backing::Imported(mapping))
            }
            BufferIdentity::UserPtr(addr) => (addr, Backing::UserPtr),
        };

        Ok(self.register(identity, geometry, cpu_addr, backing))
    }

    fn unmap(&self, buffer: &MappedBuffer) {
        match self.mappings.lock().unwrap().remove(&buffer.handle()) {
            Some(_) => debug!("Unmapped {} (handle {})", buffer.identity(), buffer.handle()),
            None => warn!(
                "Trying to unmap unknown handle {} for {}",
                buffer.handle(),
                buffer.identity()
            ),
        }
    }

    fn allocate(&self, geometry: &BufferGeometry) -> Result<MappedBuffer, MapError> {
        let size = backing_size(geometry)?;
        let mut mapping = MmapMut::map_anon(size)?;
        let cpu_addr = mapping.as_mut_ptr() as usize;

        Ok(self.register(
            BufferIdentity::UserPtr(cpu_addr),
            geometry,
            cpu_addr,
            Backing::Allocated(mapping),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::{self, File, OpenOptions};
    use std::io::Read;
    use std::os::unix::io::AsRawFd;
    use std::path::PathBuf;

    /// A file large enough to back a buffer, removed when dropped.
    struct BackingFile {
        path: PathBuf,
        file: File,
    }

    impl BackingFile {
        fn new(name: &str, len: u64) -> Self {
            let path = std::env::temp_dir().join(format!(
                "camera-adapter-{}-{}",
                std::process::id(),
                name
            ));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .unwrap();
            file.set_len(len).unwrap();

            BackingFile { path, file }
        }
    }

    impl Drop for BackingFile {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    #[test]
    fn test_map_fd_is_shared() {
        let geometry = BufferGeometry::nv12(16, 16);
        let backing = BackingFile::new("shared", geometry.size().unwrap() as u64);
        let mapper = DmaBufMapper::new();

        let mapped = mapper
            .map(BufferIdentity::DmaBuf(backing.file.as_raw_fd()), &geometry)
            .unwrap();
        assert_ne!(mapped.cpu_addr(), 0);
        assert_eq!(mapper.num_mapped(), 1);

        mapper
            .with_data(mapped.handle(), |data| {
                assert_eq!(data.len(), 384);
                data[0] = 0xab;
                data[383] = 0xcd;
            })
            .unwrap();

        // Writes through the mapping land in the file.
        let mut content = Vec::new();
        File::open(&backing.path)
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content[0], 0xab);
        assert_eq!(content[383], 0xcd);

        mapper.unmap(&mapped);
        assert_eq!(mapper.num_mapped(), 0);
        assert!(mapper.with_data(mapped.handle(), |_| ()).is_none());
    }

    #[test]
    fn test_map_rejects_invalid_buffers() {
        let mapper = DmaBufMapper::new();
        let geometry = BufferGeometry::nv12(16, 16);

        assert!(matches!(
            mapper.map(BufferIdentity::DmaBuf(-1), &geometry),
            Err(MapError::InvalidIdentity(_))
        ));
        assert!(matches!(
            mapper.map(BufferIdentity::UserPtr(0), &geometry),
            Err(MapError::InvalidIdentity(_))
        ));

        let yuyv = BufferGeometry {
            format: crate::PixelFormat::from_fourcc(b"YUYV"),
            ..geometry
        };
        assert!(matches!(
            mapper.map(BufferIdentity::UserPtr(0x1000), &yuyv),
            Err(MapError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            mapper.allocate(&BufferGeometry::nv12(0, 16)),
            Err(MapError::EmptyGeometry(0, 16))
        ));
        assert!(matches!(
            mapper.allocate(&BufferGeometry::nv12(u32::MAX, u32::MAX)),
            Err(MapError::TooLarge(u32::MAX, u32::MAX))
        ));
        assert!(matches!(
            mapper.map(BufferIdentity::DmaBuf(0), &BufferGeometry::nv12(u32::MAX, u32::MAX)),
            Err(MapError::TooLarge(_, _))
        ));
        assert_eq!(mapper.num_mapped(), 0);
    }

    #[test]
    fn test_user_ptr_passthrough() {
        let mapper = DmaBufMapper::new();
        let geometry = BufferGeometry::nv12(16, 16);

        let mapped = mapper.map(BufferIdentity::UserPtr(0x7000), &geometry).unwrap();
        assert_eq!(mapped.cpu_addr(), 0x7000);
        // We do not own this memory, so do not give access to it.
        assert!(mapper.with_data(mapped.handle(), |_| ()).is_none());
    }

    #[test]
    fn test_allocate() {
        let mapper = DmaBufMapper::new();
        let geometry = BufferGeometry::nv12(32, 8);

        let first = mapper.allocate(&geometry).unwrap();
        let second = mapper.allocate(&geometry).unwrap();
        assert_ne!(first.handle(), second.handle());
        assert_eq!(first.identity(), BufferIdentity::UserPtr(first.cpu_addr()));

        let len = mapper.with_data(first.handle(), |data| data.len()).unwrap();
        assert_eq!(len, 384);

        mapper.unmap(&first);
        mapper.unmap(&second);
        assert_eq!(mapper.num_mapped(), 0);
    }
}
