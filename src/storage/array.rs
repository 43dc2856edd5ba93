//! Fixed-size array storage (§4.6): records addressed by integer slot,
//! sufficient to exercise the transactional core end-to-end without a real
//! masstree/hash index (§1 scope, §8 S1/S2/S4). Grounded on the teacher's
//! `StorageEngine` for the shape of a storage type owning its own records and
//! exposing read/write entry points that return the crate's `Result`, with
//! the actual storage swapped for the page-addressed `Record` word this core
//! requires.

use std::sync::Arc;

use crate::engine_error::{engine_error, ErrorCode, Result};
use crate::record::{OwnerId, Record, RecordAddress};
use crate::xct::{LogEntry, ReadSetEntry, WriteSetEntry, Xct};

/// A fixed-size-record array storage: `slot_count` records, each
/// `payload_size` bytes, addressed by a dense integer key.
pub struct ArrayStorage {
    storage_id: u32,
    name: String,
    payload_size: usize,
    slots: Vec<Arc<Record>>,
}

impl ArrayStorage {
    pub fn create(storage_id: u32, name: impl Into<String>, slot_count: u32, payload_size: usize) -> Self {
        let slots = (0..slot_count).map(|_| Arc::new(Record::new(payload_size))).collect();
        Self {
            storage_id,
            name: name.into(),
            payload_size,
            slots,
        }
    }

    pub fn storage_id(&self) -> u32 {
        self.storage_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    fn record(&self, slot: u32) -> Result<&Arc<Record>> {
        self.slots.get(slot as usize).ok_or_else(|| {
            engine_error!(
                ErrorCode::KeyNotFound,
                "slot {} out of range for array storage '{}' (slot_count={})",
                slot,
                self.name,
                self.slots.len()
            )
        })
    }

    /// Captures `(owner_id, payload)` as a consistent pair, per §4.6's
    /// release-consume contract: spins past a concurrently-locked record,
    /// then retries if the owner-id changed between the two reads (the
    /// payload `RwLock` already rules out a torn byte-level read; this rules
    /// out the payload having been overwritten mid-read).
    fn consistent_snapshot(record: &Record) -> (OwnerId, Vec<u8>) {
        loop {
            let before = record.owner_id.load_acquire();
            if before.is_locked() {
                std::hint::spin_loop();
                continue;
            }
            let payload = record.read_payload();
            let after = record.owner_id.load_acquire();
            if after == before {
                return (before, payload);
            }
        }
    }

    /// Reads `slot`, adding an entry to `xct`'s read-set for later
    /// validation. Returns `KeyNotFound` for a slot that has never been
    /// written — the reference array storage's stand-in for "missing key"
    /// (§8 S4), since real key-based lookup belongs to masstree/hash.
    pub fn read(&self, xct: &mut Xct, slot: u32) -> Result<Vec<u8>> {
        let record = self.record(slot)?;
        let (observed_owner_id, payload) = Self::consistent_snapshot(record);
        if observed_owner_id == OwnerId::EMPTY {
            return Err(engine_error!(
                ErrorCode::KeyNotFound,
                "slot {} in array storage '{}' has never been written",
                slot,
                self.name
            ));
        }
        xct.add_read(ReadSetEntry {
            storage_id: self.storage_id,
            address: RecordAddress::new(self.storage_id, slot),
            record: record.clone(),
            observed_owner_id,
        })?;
        Ok(payload)
    }

    /// Queues an overwrite of `slot` at `offset` with `data`, appending to
    /// `xct`'s write-set. Also serves as "insert" for a never-before-written
    /// slot — the array storage's slots are pre-allocated, so there is no
    /// separate allocation step.
    pub fn overwrite(&self, xct: &mut Xct, slot: u32, offset: usize, data: &[u8]) -> Result<()> {
        let record = self.record(slot)?;
        if offset + data.len() > self.payload_size {
            return Err(engine_error!(
                ErrorCode::InvalidArgument,
                "write at offset {} len {} exceeds payload_size {} for slot {}",
                offset,
                data.len(),
                self.payload_size,
                slot
            ));
        }
        xct.add_write(WriteSetEntry {
            storage_id: self.storage_id,
            address: RecordAddress::new(self.storage_id, slot),
            record: record.clone(),
            log_entry: LogEntry {
                offset,
                payload: data.to_vec(),
            },
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xct::manager::WorkerHandle;
    use crate::xct::manager::XctManager;
    use crate::log::buffer::new_shared;
    use crate::log::logger::{Logger, WorkerSlot};
    use crate::epoch::{AtomicEpoch, Epoch};
    use crate::thread_id::ThreadId;
    use crate::log::manager::LogManager;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_setup(dir: &std::path::Path) -> (std::sync::Arc<XctManager>, WorkerHandle) {
        let log_buffer = new_shared(8192);
        let in_commit = std::sync::Arc::new(AtomicEpoch::new(Epoch::INVALID));
        let thread_id = ThreadId::new(0, 0);
        let slot = WorkerSlot {
            thread_id,
            buffer: log_buffer.clone(),
            in_commit_log_epoch: in_commit.clone(),
        };
        let logger = Logger::new(0, dir.join("log-0"), vec![slot], Epoch::new(1)).unwrap();
        let log_manager = LogManager::start(vec![logger], dir.join("savepoint.json"), Epoch::new(1));
        let xct_manager = XctManager::start(Epoch::new(1), Duration::from_millis(5), log_manager);
        let mut worker = WorkerHandle::new(thread_id, log_buffer);
        worker.in_commit_log_epoch = in_commit;
        (xct_manager, worker)
    }

    #[test]
    fn reading_never_written_slot_is_key_not_found() {
        let storage = ArrayStorage::create(1, "myarray", 4, 16);
        let mut xct = Xct::new(16, 16);
        xct.activate().unwrap();
        let err = storage.read(&mut xct, 0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);
        assert!(xct.read_set().is_empty());
    }

    #[test]
    fn out_of_range_slot_is_key_not_found() {
        let storage = ArrayStorage::create(1, "myarray", 4, 16);
        let mut xct = Xct::new(16, 16);
        xct.activate().unwrap();
        let err = storage.read(&mut xct, 99).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);
    }

    #[test]
    fn write_then_commit_then_read_returns_new_value() {
        let dir = tempdir().unwrap();
        let (manager, worker) = test_setup(dir.path());
        let storage = ArrayStorage::create(1, "myarray", 1 << 4, 16);

        let mut xct = Xct::new(16, 16);
        manager.begin(&mut xct).unwrap();
        storage.overwrite(&mut xct, 123 % storage.slot_count(), 0, b"abcXYZ").unwrap();
        let commit_epoch = manager.precommit(&worker, &mut xct).unwrap();
        assert!(commit_epoch.value() > 0);

        let mut xct2 = Xct::new(16, 16);
        manager.begin(&mut xct2).unwrap();
        let payload = storage.read(&mut xct2, 123 % storage.slot_count()).unwrap();
        assert_eq!(&payload[0..6], b"abcXYZ");
        assert_eq!(payload.len(), 16);
        manager.precommit(&worker, &mut xct2).unwrap();
        manager.shutdown();
    }

    #[test]
    fn overwrite_rejects_write_past_payload_size() {
        let storage = ArrayStorage::create(1, "myarray", 4, 8);
        let mut xct = Xct::new(16, 16);
        xct.activate().unwrap();
        let err = storage.overwrite(&mut xct, 0, 4, b"toolong!").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }
}
