use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tensor::TensorRole;

// ── Stage Machine ────────────────────────────────────────────────────────────

/// One phase of the per-partition pipeline.
///
/// Gradient: Init → LocalReduceWait → Compress → Transmit → ServerAggregate
///           → Decompress → BroadcastWait → Done
///
/// Parameter: Init → Transmit → Decompress → Done
///
/// Any stage may end in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Init,
    LocalReduceWait,
    Compress,
    Transmit,
    ServerAggregate,
    Decompress,
    BroadcastWait,
    Done,
    Failed,
}

const GRADIENT_PATH: &[Stage] = &[
    Stage::Init,
    Stage::LocalReduceWait,
    Stage::Compress,
    Stage::Transmit,
    Stage::ServerAggregate,
    Stage::Decompress,
    Stage::BroadcastWait,
    Stage::Done,
];

const PARAMETER_PATH: &[Stage] = &[
    Stage::Init,
    Stage::Transmit,
    Stage::Decompress,
    Stage::Done,
];

impl Stage {
    /// Full stage sequence for a tensor role, `Init` through `Done`.
    pub fn path(role: TensorRole) -> &'static [Stage] {
        match role {
            TensorRole::Gradient => GRADIENT_PATH,
            TensorRole::Parameter => PARAMETER_PATH,
        }
    }

    /// First stage after `Init` for a role.
    pub fn entry(role: TensorRole) -> Stage {
        Self::path(role)[1]
    }

    /// Stage that follows `self` on the given path, or `None` when `self` is
    /// terminal or not on that path.
    pub fn next(self, role: TensorRole) -> Option<Stage> {
        let path = Self::path(role);
        let pos = path.iter().position(|s| *s == self)?;
        path.get(pos + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init            => "INIT",
            Self::LocalReduceWait => "LOCAL_REDUCE_WAIT",
            Self::Compress        => "COMPRESS",
            Self::Transmit        => "TRANSMIT",
            Self::ServerAggregate => "SERVER_AGGREGATE",
            Self::Decompress      => "DECOMPRESS",
            Self::BroadcastWait   => "BROADCAST_WAIT",
            Self::Done            => "DONE",
            Self::Failed          => "FAILED",
        };
        f.write_str(name)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
