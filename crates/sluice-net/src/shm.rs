//! Anonymous memory-mapped regions backing the broadcast hand-off.
//!
//! Each published partition is copied once into its own mapping, which is
//! then sealed read-only; readers share the mapping through [`BufferView`]
//! without further copies.

use std::collections::HashMap;

use memmap2::{Mmap, MmapMut};
use parking_lot::RwLock;
use sluice_pipeline::{BackendError, BufferView, SharedMemory};
use sluice_types::PartitionId;
use tracing::trace;

use crate::error::NetError;

struct Region {
    map: Mmap,
    len: usize,
}

impl AsRef<[u8]> for Region {
    fn as_ref(&self) -> &[u8] {
        &self.map[..self.len]
    }
}

#[derive(Default)]
pub struct MmapSharedMemory {
    regions: RwLock<HashMap<PartitionId, BufferView>>,
}

impl MmapSharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }

    /// Drop the region for `partition`. Views already handed out stay valid.
    pub fn release(&self, partition: PartitionId) -> bool {
        self.regions.write().remove(&partition).is_some()
    }

    fn map(data: &[u8]) -> Result<Region, NetError> {
        // Zero-length anonymous mappings are rejected by the kernel.
        let mut map = MmapMut::map_anon(data.len().max(1))
            .map_err(|e| NetError::SharedMemory(format!("map {} bytes: {e}", data.len())))?;
        map[..data.len()].copy_from_slice(data);
        let map = map
            .make_read_only()
            .map_err(|e| NetError::SharedMemory(format!("seal region: {e}")))?;
        Ok(Region {
            map,
            len: data.len(),
        })
    }
}

impl SharedMemory for MmapSharedMemory {
    fn publish(&self, partition: PartitionId, data: &[u8]) -> Result<(), BackendError> {
        let region = Self::map(data)?;
        trace!(partition = %partition, bytes = data.len(), "region published");
        self.regions
            .write()
            .insert(partition, BufferView::new(region));
        Ok(())
    }

    fn acquire(&self, partition: PartitionId) -> Option<BufferView> {
        self.regions.read().get(&partition).cloned()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_acquire() {
        let shm = MmapSharedMemory::new();
        let pid = PartitionId::new(1, 2);
        assert!(shm.acquire(pid).is_none());

        shm.publish(pid, &[9, 8, 7]).unwrap();
        let view = shm.acquire(pid).unwrap();
        assert_eq!(&*view, &[9, 8, 7]);
        assert_eq!(shm.len(), 1);
    }

    #[test]
    fn republish_replaces_but_old_views_survive() {
        let shm = MmapSharedMemory::new();
        let pid = PartitionId::new(0, 0);
        shm.publish(pid, &[1; 16]).unwrap();
        let old = shm.acquire(pid).unwrap();

        shm.publish(pid, &[2; 16]).unwrap();
        assert_eq!(&*old, &[1; 16]);
        assert_eq!(&*shm.acquire(pid).unwrap(), &[2; 16]);

        assert!(shm.release(pid));
        assert!(shm.is_empty());
        assert_eq!(old.len(), 16);
    }

    #[test]
    fn empty_partition_maps() {
        let shm = MmapSharedMemory::new();
        let pid = PartitionId::new(0, 1);
        shm.publish(pid, &[]).unwrap();
        assert!(shm.acquire(pid).unwrap().is_empty());
    }
}
