//! Partition registry.
//!
//! Splits every declared tensor into contiguous byte ranges no larger than
//! the configured maximum, assigns the declaration index that defines the
//! tensor's default priority, and resolves `PartitionId`s back to ranges.

use std::collections::HashMap;

use parking_lot::RwLock;
use sluice_types::{Partition, PartitionId, TensorSpec, MAX_PARTITIONS_PER_TENSOR};
use tracing::info;

use crate::error::{EngineError, Result};

// ── Split ─────────────────────────────────────────────────────────────────────

/// Compute `(offset, length)` ranges for a tensor of `total` bytes.
///
/// The effective partition size is `max_bytes` rounded down to whole
/// elements. A trailing remainder shorter than `min_merge_bytes` is folded
/// into the preceding range.
pub fn split(
    total: usize,
    element_bytes: usize,
    max_bytes: usize,
    min_merge_bytes: usize,
) -> Vec<(usize, usize)> {
    let size = (max_bytes / element_bytes * element_bytes).max(element_bytes);

    let mut ranges: Vec<(usize, usize)> = (0..total / size).map(|i| (i * size, size)).collect();

    let rem = total % size;
    if rem > 0 {
        match ranges.last_mut() {
            Some(last) if rem < min_merge_bytes => last.1 += rem,
            _ => ranges.push((total - rem, rem)),
        }
    }
    ranges
}

// ── Registry ──────────────────────────────────────────────────────────────────

struct Entry {
    spec: TensorSpec,
    index: u32,
    partitions: Vec<Partition>,
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<String, Entry>,
    /// Keys in declaration order; position is the declaration index.
    order: Vec<String>,
}

pub struct PartitionRegistry {
    min_merge_bytes: usize,
    inner: RwLock<Inner>,
}

impl PartitionRegistry {
    pub fn new(min_merge_bytes: usize) -> Self {
        Self {
            min_merge_bytes,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register `spec` and return its partitions.
    ///
    /// Re-registering the same key with the same size returns the identical
    /// list; a different size is a configuration error.
    pub fn register(&self, spec: &TensorSpec, max_partition_bytes: usize) -> Result<Vec<Partition>> {
        let mut inner = self.inner.write();

        if let Some(existing) = inner.by_key.get(&spec.key) {
            if existing.spec.num_bytes != spec.num_bytes {
                return Err(EngineError::Configuration(format!(
                    "tensor {} re-declared with {} bytes (was {})",
                    spec.key, spec.num_bytes, existing.spec.num_bytes
                )));
            }
            return Ok(existing.partitions.clone());
        }

        let width = spec.dtype.element_bytes();
        if spec.num_bytes == 0 {
            return Err(EngineError::Configuration(format!(
                "tensor {} has zero bytes",
                spec.key
            )));
        }
        if spec.num_bytes % width != 0 {
            return Err(EngineError::Configuration(format!(
                "tensor {}: {} bytes is not a whole number of {} elements",
                spec.key, spec.num_bytes, spec.dtype
            )));
        }
        if max_partition_bytes == 0 {
            return Err(EngineError::Configuration(
                "max partition size must be positive".into(),
            ));
        }

        let ranges = split(spec.num_bytes, width, max_partition_bytes, self.min_merge_bytes);
        if ranges.len() > MAX_PARTITIONS_PER_TENSOR {
            return Err(EngineError::Configuration(format!(
                "tensor {} needs {} partitions (max {MAX_PARTITIONS_PER_TENSOR})",
                spec.key,
                ranges.len()
            )));
        }
        let index = u32::try_from(inner.order.len()).map_err(|_| {
            EngineError::Configuration("too many declared tensors".into())
        })?;

        let partitions: Vec<Partition> = ranges
            .into_iter()
            .enumerate()
            .map(|(i, (offset, length))| Partition {
                id: PartitionId::new(index, i as u32),
                tensor_key: spec.key.clone(),
                offset,
                length,
            })
            .collect();

        info!(
            tensor = %spec.key,
            index,
            bytes = spec.num_bytes,
            partitions = partitions.len(),
            "registered tensor"
        );

        inner.order.push(spec.key.clone());
        inner.by_key.insert(
            spec.key.clone(),
            Entry {
                spec: spec.clone(),
                index,
                partitions: partitions.clone(),
            },
        );
        Ok(partitions)
    }

    pub fn lookup(&self, id: PartitionId) -> Option<Partition> {
        let inner = self.inner.read();
        let key = inner.order.get(id.tensor_index() as usize)?;
        inner
            .by_key
            .get(key)?
            .partitions
            .get(id.partition_index() as usize)
            .cloned()
    }

    pub fn partitions(&self, key: &str) -> Option<Vec<Partition>> {
        self.inner.read().by_key.get(key).map(|e| e.partitions.clone())
    }

    pub fn spec(&self, key: &str) -> Option<TensorSpec> {
        self.inner.read().by_key.get(key).map(|e| e.spec.clone())
    }

    /// Scheduling priority: the explicit one, else the declaration index.
    pub fn priority(&self, key: &str) -> Option<i64> {
        self.inner
            .read()
            .by_key
            .get(key)
            .map(|e| e.spec.priority.unwrap_or(e.index as i64))
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
