//! Worker ↔ server wire messages.
//!
//! Each frame on the wire is:
//!   [u32 big-endian length][bincode payload]
//!
//! Push bodies are the self-describing [`sluice_compress::Payload`] bytes
//! produced by the compression stage; the server never needs codec state to
//! read them.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// Frames larger than this are rejected before any allocation.
pub const MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionRequest {
    /// Contribute one worker's encoded partition to the current round.
    Push {
        worker: u32,
        /// Raw `PartitionId` value.
        partition: u64,
        payload: Vec<u8>,
    },
    /// Fetch the aggregate of `partition` once it reaches `min_round`.
    Pull {
        worker: u32,
        partition: u64,
        min_round: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitionResponse {
    /// Push accepted into `round`.
    Accepted { partition: u64, round: u64 },
    /// Aggregated partition, encoded as an uncompressed payload.
    Aggregate {
        partition: u64,
        round: u64,
        payload: Vec<u8>,
    },
    Rejected { partition: u64, reason: String },
    /// No aggregate reached the requested round in time.
    TimedOut { partition: u64, min_round: u64 },
    /// Server or caller is shutting down.
    Closed { partition: u64 },
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Serialize `msg` and write it as one length-prefixed frame.
pub fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: Write,
    T: Serialize,
{
    let body = encode(msg)?;
    let len = u32::try_from(body.len()).map_err(|_| NetError::TooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame, refusing anything over `max_bytes`.
pub fn read_frame<R, T>(reader: &mut R, max_bytes: usize) -> Result<T>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(NetError::TooLarge { len, max: max_bytes });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode(&body)
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| NetError::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (msg, used): (T, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| NetError::Serialization(e.to_string()))?;
    if used != bytes.len() {
        return Err(NetError::Serialization(format!(
            "{} trailing bytes after message",
            bytes.len() - used
        )));
    }
    Ok(msg)
}

/// Pass `msg` through a complete frame write and read.
pub(crate) fn through_frame<T>(msg: &T) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut buf = Vec::new();
    write_frame(&mut buf, msg)?;
    read_frame(&mut io::Cursor::new(buf), MAX_FRAME_BYTES)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
