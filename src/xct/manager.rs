//! The OCC commit protocol (§4.1) plus the epoch advancer (§4.2). Grounded on
//! `foedus::xct::XctManagerPimpl::precommit_xct` for the phase structure and
//! on the teacher's `TransactionManager::commit`/`rollback` (`engines/granite/
//! manager.rs`) for the shape of a manager that wraps a multi-phase protocol
//! behind `begin`/`commit`/`abort`-style entry points with explicit error
//! returns rather than panics.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::engine_error::{engine_error, ErrorCode, Result};
use crate::epoch::{AtomicEpoch, Epoch};
use crate::log::buffer::SharedLogBuffer;
use crate::log::manager::LogManager;
use crate::log::record::{LogRecord, RecordKind};
use crate::record::OwnerId;
use crate::thread_id::ThreadId;
use crate::xct::{OrdinalCounter, Xct};

/// Everything the commit protocol needs that is specific to one worker, kept
/// separate from `Xct` because it outlives any single transaction and is
/// shared with this worker's logger (the `in_commit_log_epoch` guard and the
/// log buffer are also read by the `Logger` that owns this worker's slot).
pub struct WorkerHandle {
    pub thread_id: ThreadId,
    pub in_commit_log_epoch: Arc<AtomicEpoch>,
    pub log_buffer: SharedLogBuffer,
    ordinal_counter: Mutex<OrdinalCounter>,
}

impl WorkerHandle {
    pub fn new(thread_id: ThreadId, log_buffer: SharedLogBuffer) -> Self {
        Self {
            thread_id,
            in_commit_log_epoch: Arc::new(AtomicEpoch::new(Epoch::INVALID)),
            log_buffer,
            ordinal_counter: Mutex::new(OrdinalCounter::default()),
        }
    }

    fn next_ordinal(&self, epoch: Epoch) -> u16 {
        self.ordinal_counter
            .lock()
            .expect("ordinal counter mutex poisoned")
            .next_for(epoch)
    }
}

/// RAII publication of `in_commit_log_epoch` for the duration of Phase 2/3
/// (§4.1, §4.2): loggers must never persist a record whose commit epoch this
/// worker has not yet finalized, and this guard's `Drop` is what makes that
/// true on every exit path, including an early return on verify failure.
struct InCommitEpochGuard<'a> {
    slot: &'a AtomicEpoch,
}

impl<'a> InCommitEpochGuard<'a> {
    fn publish(slot: &'a AtomicEpoch, epoch: Epoch) -> Self {
        slot.store_release(epoch);
        Self { slot }
    }
}

impl Drop for InCommitEpochGuard<'_> {
    fn drop(&mut self) {
        self.slot.store_release(Epoch::INVALID);
    }
}

/// Owns `current_global_epoch`, the dedicated epoch-advancer thread, and the
/// three OCC phases. One instance per engine, shared by every worker.
pub struct XctManager {
    current_global_epoch: AtomicEpoch,
    epoch_advance_interval: Duration,
    advanced_mutex: Mutex<()>,
    advanced_cond: Condvar,
    log_manager: Arc<LogManager>,
    advancer_shutdown: Arc<AtomicBool>,
    advancer_nudge: Arc<(Mutex<bool>, Condvar)>,
    advancer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl XctManager {
    pub fn start(initial_epoch: Epoch, epoch_advance_interval: Duration, log_manager: Arc<LogManager>) -> Arc<Self> {
        let manager = Arc::new(Self {
            current_global_epoch: AtomicEpoch::new(initial_epoch),
            epoch_advance_interval,
            advanced_mutex: Mutex::new(()),
            advanced_cond: Condvar::new(),
            log_manager,
            advancer_shutdown: Arc::new(AtomicBool::new(false)),
            advancer_nudge: Arc::new((Mutex::new(false), Condvar::new())),
            advancer_handle: Mutex::new(None),
        });

        let advancer = manager.clone();
        let handle = std::thread::spawn(move || advancer.run_epoch_advancer());
        *manager.advancer_handle.lock().expect("advancer handle mutex poisoned") = Some(handle);
        manager
    }

    pub fn shutdown(&self) {
        self.advancer_shutdown.store(true, Ordering::Release);
        {
            let (lock, cond) = &*self.advancer_nudge;
            *lock.lock().expect("advancer nudge mutex poisoned") = true;
            cond.notify_all();
        }
        if let Some(handle) = self.advancer_handle.lock().expect("advancer handle mutex poisoned").take() {
            let _ = handle.join();
        }
    }

    pub fn current_global_epoch(&self) -> Epoch {
        self.current_global_epoch.load_acquire()
    }

    fn run_epoch_advancer(&self) {
        log::info!("epoch advancer started, interval={:?}", self.epoch_advance_interval);
        let (nudge_lock, nudge_cond) = &*self.advancer_nudge;
        loop {
            if self.advancer_shutdown.load(Ordering::Acquire) {
                break;
            }
            {
                let guard = nudge_lock.lock().expect("advancer nudge mutex poisoned");
                let (mut guard, _timeout) = nudge_cond
                    .wait_timeout(guard, self.epoch_advance_interval)
                    .expect("advancer nudge condvar poisoned");
                *guard = false;
            }
            if self.advancer_shutdown.load(Ordering::Acquire) {
                break;
            }
            self.tick();
        }
        log::info!("epoch advancer stopped");
    }

    /// Increments `current_global_epoch`, wakes everyone waiting on
    /// `advance_current_global_epoch`, and nudges loggers so durability can
    /// catch up to the new epoch sooner rather than waiting on their own
    /// idle poll.
    fn tick(&self) {
        let next = self.current_global_epoch().next();
        self.current_global_epoch.store_release(next);
        log::debug!("current_global_epoch advanced to {}", next);
        {
            let _guard = self.advanced_mutex.lock().expect("epoch-advanced mutex poisoned");
            self.advanced_cond.notify_all();
        }
        self.log_manager.wakeup_loggers();
    }

    /// Forces the advancer to tick once and blocks the caller until an epoch
    /// strictly greater than the one observed on entry is visible (§4.1).
    pub fn advance_current_global_epoch(&self) {
        let observed = self.current_global_epoch();
        {
            let (lock, cond) = &*self.advancer_nudge;
            *lock.lock().expect("advancer nudge mutex poisoned") = true;
            cond.notify_all();
        }
        let guard = self.advanced_mutex.lock().expect("epoch-advanced mutex poisoned");
        let _unused = self
            .advanced_cond
            .wait_while(guard, |_| self.current_global_epoch() <= observed)
            .expect("epoch-advanced condvar poisoned");
    }

    pub fn begin(&self, xct: &mut Xct) -> Result<()> {
        xct.activate().map_err(|e| e.context("xct_manager::begin"))?;
        log::debug!("xct begin");
        Ok(())
    }

    pub fn abort(&self, worker: &WorkerHandle, xct: &mut Xct) -> Result<()> {
        if !xct.is_active() {
            return Err(engine_error!(ErrorCode::NoXct, "abort called with no active transaction")
                .context("xct_manager::abort"));
        }
        worker
            .log_buffer
            .lock()
            .expect("log buffer mutex poisoned")
            .discard_current_xct_log();
        xct.deactivate();
        log::debug!("xct abort");
        Ok(())
    }

    /// Runs the appropriate commit path and returns the assigned commit
    /// epoch. On `RaceAbort` the transaction is already deactivated and its
    /// log tail discarded — the caller's decision whether to retry (§1
    /// Non-goals: no implicit retry).
    pub fn precommit(&self, worker: &WorkerHandle, xct: &mut Xct) -> Result<Epoch> {
        if !xct.is_active() {
            return Err(engine_error!(ErrorCode::NoXct, "precommit called with no active transaction")
                .context("xct_manager::precommit"));
        }

        let result = if xct.write_set().is_empty() {
            self.precommit_read_only(xct)
        } else {
            self.precommit_read_write(worker, xct)
        };

        match &result {
            Ok(epoch) => {
                xct.deactivate();
                log::debug!("xct precommit ok, commit_epoch={}", epoch);
            }
            Err(e) => {
                worker
                    .log_buffer
                    .lock()
                    .expect("log buffer mutex poisoned")
                    .discard_current_xct_log();
                xct.deactivate();
                log::warn!("xct precommit aborted: {}", e);
            }
        }
        result
    }

    /// §4.1 read-only commit: validate the read-set, pick `commit_epoch` as
    /// the max observed epoch (or the durable epoch if the read-set is
    /// empty), and return without touching the log at all.
    fn precommit_read_only(&self, xct: &Xct) -> Result<Epoch> {
        fence(Ordering::Acquire);
        let mut max_epoch: Option<Epoch> = None;
        for entry in xct.read_set() {
            let current = entry.record.owner_id.load_acquire();
            if !current.compare_epoch_and_thread(entry.observed_owner_id) || current.is_locked() {
                return Err(engine_error!(
                    ErrorCode::RaceAbort,
                    "read-only commit: record at {:?} changed since observed",
                    entry.address
                )
                .context("xct_manager::precommit_read_only"));
            }
            let e = current.epoch();
            max_epoch = Some(match max_epoch {
                Some(cur) if cur >= e => cur,
                _ => e,
            });
        }
        Ok(max_epoch.unwrap_or_else(|| self.log_manager.get_durable_global_epoch()))
    }

    /// §4.1 read-write commit: lock, pick a serialization point, verify, then
    /// apply-and-unlock in one release store per write.
    fn precommit_read_write(&self, worker: &WorkerHandle, xct: &mut Xct) -> Result<Epoch> {
        // Phase 1 — Lock: total order by address prevents deadlock.
        xct.write_set_mut().sort_by_key(|e| e.address);
        for entry in xct.write_set() {
            entry.record.owner_id.lock_unconditional();
        }

        // Phase 2 — Serialization point.
        let guard = InCommitEpochGuard::publish(&worker.in_commit_log_epoch, self.current_global_epoch());
        fence(Ordering::AcqRel);
        let commit_epoch = self.current_global_epoch();
        fence(Ordering::AcqRel);

        // Phase 3 — Verify.
        let verify_result = self.verify_read_set(xct, commit_epoch);
        if let Err(e) = verify_result {
            for entry in xct.write_set() {
                entry.record.owner_id.unlock();
            }
            fence(Ordering::Release);
            drop(guard);
            return Err(e);
        }

        // Encode every write-set entry's log record and make sure the whole
        // batch fits before touching any record, so the apply loop below
        // cannot fail partway through and leave some records applied,
        // unlocked, and logged while others stay locked forever (§7: no
        // partial writes). `commit_epoch` is already frozen, so nothing here
        // depends on the apply loop itself.
        let ordinal = worker.next_ordinal(commit_epoch);
        let next_id = OwnerId::compose(commit_epoch, worker.thread_id, ordinal, false);
        let mut encoded = Vec::with_capacity(xct.write_set().len());
        let mut total_bytes: u64 = 0;
        let mut encode_err = None;
        for entry in xct.write_set() {
            let log_record = LogRecord {
                storage_id: entry.storage_id,
                record_kind: RecordKind::Overwrite,
                commit_epoch: commit_epoch.value(),
                page_id: entry.address.page_id,
                record_offset: entry.address.offset,
                write_offset: entry.log_entry.offset as u32,
                payload: entry.log_entry.payload.clone(),
            };
            match log_record.encode() {
                Ok(bytes) => {
                    total_bytes += bytes.len() as u64;
                    encoded.push(bytes);
                }
                Err(e) => {
                    encode_err = Some(e.context("xct_manager::precommit_read_write"));
                    break;
                }
            }
        }

        let mut buffer = worker.log_buffer.lock().expect("log buffer mutex poisoned");
        let capacity_err = if encode_err.is_none() && total_bytes > buffer.free_space() {
            Some(
                engine_error!(
                    ErrorCode::MemoryNoFreePages,
                    "thread log buffer cannot fit commit batch: requested={} free={}",
                    total_bytes,
                    buffer.free_space()
                )
                .context("xct_manager::precommit_read_write"),
            )
        } else {
            None
        };

        if let Some(e) = encode_err.or(capacity_err) {
            drop(buffer);
            for entry in xct.write_set() {
                entry.record.owner_id.unlock();
            }
            fence(Ordering::Release);
            drop(guard);
            return Err(e);
        }

        // Apply, as the same store that clears the lock bit — infallible
        // from here on, since the log bytes are already known to fit.
        for (entry, bytes) in xct.write_set().iter().zip(encoded.iter()) {
            entry.record.apply_write(entry.log_entry.offset, &entry.log_entry.payload);
            entry.record.owner_id.store_release(next_id);
            buffer.append(bytes).expect("capacity already verified for this commit batch");
        }
        buffer.publish_committed_log();
        drop(buffer);
        drop(guard);

        xct.set_id(next_id);
        Ok(commit_epoch)
    }

    /// Re-validates every read-set entry under the chosen serialization
    /// point. A locked record is only acceptable if it's this transaction's
    /// own write (§4.1: "we cannot race with ourselves").
    fn verify_read_set(&self, xct: &Xct, _commit_epoch: Epoch) -> Result<()> {
        for entry in xct.read_set() {
            let current = entry.record.owner_id.load_acquire();
            if !current.compare_epoch_and_thread(entry.observed_owner_id) {
                return Err(engine_error!(
                    ErrorCode::RaceAbort,
                    "read-write commit: record at {:?} changed since observed",
                    entry.address
                )
                .context("xct_manager::verify_read_set"));
            }
            if current.is_locked() {
                let in_write_set = xct.write_set().binary_search_by_key(&entry.address, |w| w.address).is_ok();
                if !in_write_set {
                    return Err(engine_error!(
                        ErrorCode::RaceAbort,
                        "read-write commit: record at {:?} locked by another transaction",
                        entry.address
                    )
                    .context("xct_manager::verify_read_set"));
                }
            }
        }
        Ok(())
    }

    pub fn wait_for_commit(&self, commit_epoch: Epoch, wait_micros: i64) -> Result<()> {
        self.log_manager
            .wait_until_durable(commit_epoch, wait_micros)
            .map_err(|e| e.context("xct_manager::wait_for_commit"))
    }
}
