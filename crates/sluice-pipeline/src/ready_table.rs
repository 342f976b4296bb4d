//! Readiness barrier per `(partition, stage)`.
//!
//! Entries live in a sharded concurrent map. The announcement that brings an
//! entry's arrival count up to its required count is the only one that
//! observes `true`, no matter how many contributors race.

use std::collections::HashSet;

use dashmap::DashMap;
use sluice_types::{ContributorId, PartitionId, Stage, TensorRole};
use tracing::trace;

use crate::error::{EngineError, Result};

#[derive(Debug)]
struct Entry {
    required: usize,
    arrived: HashSet<ContributorId>,
}

pub struct ReadyTable {
    local_size: usize,
    entries: DashMap<(PartitionId, Stage), Entry>,
}

impl ReadyTable {
    /// `local_size` is the number of local devices that must announce
    /// before a partition's local reduction may run.
    pub fn new(local_size: usize) -> Self {
        Self {
            local_size: local_size.max(1),
            entries: DashMap::new(),
        }
    }

    /// Announcements needed before `stage` is ready.
    pub fn required(&self, stage: Stage) -> usize {
        match stage {
            Stage::LocalReduceWait => self.local_size,
            _ => 1,
        }
    }

    /// Record that `contributor` is ready for `(partition, stage)`.
    ///
    /// Returns `Ok(true)` for exactly the announcement that completes the
    /// entry, `Ok(false)` for incomplete entries and for duplicates from a
    /// contributor already counted. A new contributor on a complete entry is
    /// a scheduling invariant violation.
    pub fn add_ready(
        &self,
        partition: PartitionId,
        stage: Stage,
        contributor: ContributorId,
    ) -> Result<bool> {
        let required = self.required(stage);
        let mut entry = self.entries.entry((partition, stage)).or_insert_with(|| Entry {
            required,
            arrived: HashSet::with_capacity(required),
        });

        if entry.arrived.contains(&contributor) {
            trace!(%partition, %stage, %contributor, "duplicate ready announcement");
            return Ok(false);
        }
        if entry.arrived.len() >= entry.required {
            return Err(EngineError::SchedulingInvariant {
                partition,
                stage,
                detail: format!(
                    "{contributor} announced on a complete entry ({}/{})",
                    entry.arrived.len(),
                    entry.required
                ),
            });
        }

        entry.arrived.insert(contributor);
        Ok(entry.arrived.len() == entry.required)
    }

    /// Drop the entry; later announcements start a fresh count.
    pub fn reset(&self, partition: PartitionId, stage: Stage) {
        self.entries.remove(&(partition, stage));
    }

    /// Drop every entry of `partition` along its role's path.
    pub fn reset_partition(&self, partition: PartitionId, role: TensorRole) {
        for stage in Stage::path(role) {
            self.entries.remove(&(partition, *stage));
        }
    }

    /// Announcements still missing for `(partition, stage)`.
    pub fn pending(&self, partition: PartitionId, stage: Stage) -> usize {
        match self.entries.get(&(partition, stage)) {
            Some(entry) => entry.required - entry.arrived.len(),
            None => self.required(stage),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
