//! One logger per log file (§3, §4.3): drains a disjoint group of worker
//! thread-log-buffers, fsyncs them as a batch, and advances its own
//! `durable_epoch` to the highest epoch it can prove is fully persisted.
//! Grounded on `engines/granite/wal.rs`'s `FsyncState`/`GraniteWorkerHandle`
//! (the condvar-gated background-writer pattern) and on
//! `foedus/log/log_manager_pimpl.cpp`'s per-logger distribution and
//! durable-epoch bookkeeping.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::engine_error::Result;
use crate::epoch::{AtomicEpoch, Epoch};
use crate::log::buffer::SharedLogBuffer;
use crate::log::record::LogRecord;
use crate::thread_id::ThreadId;

/// How long a logger sleeps between wake checks absent an explicit nudge —
/// bounds the worst-case group-commit latency the way the teacher's
/// `fsync_interval_ms` bounds Granite's deferred fsync.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One worker's buffer plus the guard epoch the logger must respect (§4.3):
/// never report an epoch as durable while the worker that owns this slot
/// still has an open `in_commit_log_epoch` at or below that epoch.
pub struct WorkerSlot {
    pub thread_id: ThreadId,
    pub buffer: SharedLogBuffer,
    pub in_commit_log_epoch: Arc<AtomicEpoch>,
}

pub struct Logger {
    pub id: u32,
    assigned: Vec<WorkerSlot>,
    durable_epoch: AtomicEpoch,
    file: Mutex<File>,
    wake_mutex: Mutex<bool>,
    wake_cond: Condvar,
    shutdown: AtomicBool,
}

impl Logger {
    pub fn new(id: u32, path: PathBuf, assigned: Vec<WorkerSlot>, initial_durable_epoch: Epoch) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            id,
            assigned,
            durable_epoch: AtomicEpoch::new(initial_durable_epoch),
            file: Mutex::new(file),
            wake_mutex: Mutex::new(false),
            wake_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn durable_epoch(&self) -> Epoch {
        self.durable_epoch.load_acquire()
    }

    pub fn assigned_threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.assigned.iter().map(|s| s.thread_id)
    }

    /// Wakes the logger's background thread for an immediate drain cycle.
    pub fn wakeup(&self) {
        *self.wake_mutex.lock().expect("logger wake mutex poisoned") = true;
        self.wake_cond.notify_all();
    }

    /// Same signal as `wakeup`; named separately because callers waiting for
    /// a specific epoch to become durable (§4.3's `wait_until_durable`) call
    /// this to express intent, even though the logger has no way to prioritize
    /// one epoch over another beyond "drain now".
    pub fn wakeup_for_durable_epoch(&self, _target: Epoch) {
        self.wakeup();
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wakeup();
    }

    fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Drains every assigned worker's committed range, appends the decoded
    /// records to the log file, fsyncs once, and advances `durable_epoch`.
    /// Returns whether anything was written.
    ///
    /// A record whose `commit_epoch` is at or past the minimum open
    /// `in_commit_log_epoch` guard among assigned workers is left entirely
    /// undrained — not written, head not advanced past it — so a later
    /// cycle picks it back up once that worker's commit finishes publishing
    /// (§4.3: never persist an entry whose header epoch is at or past the
    /// committing worker's own in-commit epoch).
    pub fn drain_and_fsync(&self) -> Result<bool> {
        let min_guard = self
            .assigned
            .iter()
            .map(|s| s.in_commit_log_epoch.load_acquire())
            .filter(|e| e.is_valid())
            .min();

        let mut max_epoch_in_batch: Option<Epoch> = None;
        let mut wrote_anything = false;
        let mut file = self.file.lock().expect("logger file mutex poisoned");

        for slot in &self.assigned {
            let mut buffer = slot.buffer.lock().expect("log buffer mutex poisoned");
            let committed_bytes = buffer.peek_committed();
            if committed_bytes.is_empty() {
                continue;
            }

            let mut consumed = 0usize;
            loop {
                match LogRecord::decode_one(&committed_bytes[consumed..])? {
                    Some((record, used)) => {
                        let e = record.commit_epoch();
                        if let Some(guard) = min_guard {
                            if e >= guard {
                                break;
                            }
                        }
                        consumed += used;
                        max_epoch_in_batch = Some(match max_epoch_in_batch {
                            Some(cur) if cur >= e => cur,
                            _ => e,
                        });
                    }
                    None => break,
                }
            }
            if consumed == 0 {
                continue;
            }

            file.write_all(&committed_bytes[..consumed])?;
            wrote_anything = true;
            let new_head = buffer.offset_head() + consumed as u64;
            buffer.advance_head(new_head);
        }

        if wrote_anything {
            file.flush()?;
            file.sync_data()?;
        }
        drop(file);

        if let Some(batch_max) = max_epoch_in_batch {
            if batch_max > self.durable_epoch() {
                self.durable_epoch.store_release(batch_max);
            }
        }

        Ok(wrote_anything)
    }

    /// Spawns the background thread that drives this logger's drain/fsync
    /// cycle, matching the teacher's `GraniteWorkerHandle::new` pattern of a
    /// dedicated `std::thread` rather than a task on an async runtime.
    pub fn spawn(logger: Arc<Logger>) -> JoinHandle<()> {
        std::thread::spawn(move || loop {
            if logger.should_shutdown() {
                let _ = logger.drain_and_fsync();
                break;
            }
            {
                let guard = logger.wake_mutex.lock().expect("logger wake mutex poisoned");
                if !*guard {
                    let (mut guard, _timeout) = logger
                        .wake_cond
                        .wait_timeout(guard, IDLE_POLL_INTERVAL)
                        .expect("logger wake condvar poisoned");
                    *guard = false;
                } else {
                    drop(guard);
                    *logger.wake_mutex.lock().expect("logger wake mutex poisoned") = false;
                }
            }
            if let Err(e) = logger.drain_and_fsync() {
                log::error!("logger {} drain/fsync failed: {}", logger.id, e);
            }
        })
    }
}
