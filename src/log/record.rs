//! Wire format for persisted log records (§6): an append-only stream of
//! length-prefixed records, each carrying `{length, storage_id, record_kind,
//! commit_epoch, payload}`. Grounded on `engines/granite/log.rs`'s
//! `LogRecord`/bincode encoding, generalized from SQL DML ops to the single
//! operation this core's reference array storage needs: an overwrite at a
//! byte offset.

use serde::{Deserialize, Serialize};

use crate::engine_error::{engine_error, ErrorCode, Result};
use crate::epoch::Epoch;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum RecordKind {
    /// Overwrite `payload` into the record starting at `offset`. The only
    /// log-entry kind the reference array storage needs (§4.6); additional
    /// kinds (insert/delete with key-based addressing) belong to storage
    /// implementations the core treats as out-of-scope collaborators (§1).
    Overwrite,
}

/// A single persisted log record. `commit_epoch` is frozen at the moment the
/// owning transaction's Phase 2 sampled it — a record is only ever appended
/// to a thread log buffer after that point, so by construction no record on
/// disk can carry an epoch whose commit hasn't already been finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub storage_id: u32,
    pub record_kind: RecordKind,
    pub commit_epoch: u32,
    pub page_id: u32,
    pub record_offset: u32,
    pub write_offset: u32,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn commit_epoch(&self) -> Epoch {
        Epoch::new(self.commit_epoch)
    }

    /// Encodes as a 4-byte little-endian length prefix followed by the
    /// bincode body, matching the teacher's WAL framing so recovery-style
    /// scanning (read length, read body, repeat until EOF) works unchanged.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| engine_error!(ErrorCode::Io, "failed to encode log record: {}", e))?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes one length-prefixed record from the front of `bytes`,
    /// returning the record and the number of bytes consumed, or `None` if
    /// `bytes` doesn't contain a complete record yet.
    pub fn decode_one(bytes: &[u8]) -> Result<Option<(LogRecord, usize)>> {
        if bytes.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + len {
            return Ok(None);
        }
        let record: LogRecord = bincode::deserialize(&bytes[4..4 + len])
            .map_err(|e| engine_error!(ErrorCode::Io, "malformed log record: {}", e))?;
        Ok(Some((record, 4 + len)))
    }

    /// Decodes every complete record from `bytes`, returning the records and
    /// the total number of bytes consumed (always a multiple of whole
    /// records — a trailing partial record, if any, is left unconsumed).
    pub fn decode_all(bytes: &[u8]) -> Result<(Vec<LogRecord>, usize)> {
        let mut records = Vec::new();
        let mut consumed = 0;
        loop {
            match LogRecord::decode_one(&bytes[consumed..])? {
                Some((record, used)) => {
                    records.push(record);
                    consumed += used;
                }
                None => break,
            }
        }
        Ok((records, consumed))
    }
}
