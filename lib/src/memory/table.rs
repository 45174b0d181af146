//! Cache of the buffers mapped during a capture session.
use super::{BufferGeometry, BufferHandle, BufferIdentity, BufferMapper, MapError, MappedBuffer};

use log::{debug, warn};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Maps buffer identities to their `MappedBuffer`.
///
/// Entries are created lazily the first time an identity is seen and live
/// until `unmap_all` is called. There is no eviction: once an identity is
/// mapped, later lookups return the first mapping even if they come with a
/// different geometry.
pub struct MappingTable {
    mapper: Arc<dyn BufferMapper>,
    buffers: BTreeMap<BufferIdentity, MappedBuffer>,
    // Reverse lookup used when the driver hands a buffer back to us.
    handles: BTreeMap<BufferHandle, BufferIdentity>,
}

impl MappingTable {
    pub fn new(mapper: Arc<dyn BufferMapper>) -> Self {
        MappingTable {
            mapper,
            buffers: BTreeMap::new(),
            handles: BTreeMap::new(),
        }
    }

    /// Returns the mapping for `identity`, creating it with `geometry_hint` if
    /// this is the first time we see it. On failure nothing is recorded, so
    /// the call can be retried.
    pub fn map_or_get(
        &mut self,
        identity: BufferIdentity,
        geometry_hint: &BufferGeometry,
    ) -> Result<&MappedBuffer, MapError> {
        if !identity.is_valid() {
            return Err(MapError::InvalidIdentity(identity));
        }

        match self.buffers.entry(identity) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mapped = self.mapper.map(identity, geometry_hint)?;
                self.handles.insert(mapped.handle(), identity);
                Ok(entry.insert(mapped))
            }
        }
    }

    /// Record a buffer that has been mapped outside of `map_or_get`, typically
    /// one obtained from `BufferMapper::allocate`. If its identity is already
    /// known, the existing entry is kept and `buffer` is unmapped.
    pub fn insert(&mut self, buffer: MappedBuffer) -> &MappedBuffer {
        match self.buffers.entry(buffer.identity()) {
            Entry::Occupied(entry) => {
                warn!(
                    "{} is already mapped, releasing duplicate handle {}",
                    buffer.identity(),
                    buffer.handle()
                );
                self.mapper.unmap(&buffer);
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                self.handles.insert(buffer.handle(), buffer.identity());
                entry.insert(buffer)
            }
        }
    }

    /// Allocate a new buffer through the mapper and record it.
    pub fn allocate(&mut self, geometry: &BufferGeometry) -> Result<&MappedBuffer, MapError> {
        let buffer = self.mapper.allocate(geometry)?;
        Ok(self.insert(buffer))
    }

    /// Find the buffer a driver handle belongs to.
    pub fn resolve(&self, handle: BufferHandle) -> Option<&MappedBuffer> {
        self.handles
            .get(&handle)
            .and_then(|identity| self.buffers.get(identity))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Release every mapping. Must only be called once the driver cannot
    /// access any of the buffers anymore.
    pub fn unmap_all(&mut self) {
        debug!("Unmapping {} buffers", self.buffers.len());

        for buffer in self.buffers.values() {
            self.mapper.unmap(buffer);
        }
        self.buffers.clear();
        self.handles.clear();
    }
}
