//! Top-level engine: wires options, loggers, the log manager, the Xct
//! manager, the proc manager, and the thread pool into the star topology of
//! §9 ("the engine exclusively owns each manager; each manager exposes
//! back-references only as non-owning handles resolved through the engine").
//! Grounded on the teacher's `Server::new`/`Server::run` (`lib.rs`) for the
//! two-phase "construct, then start" shape, generalized from "bind a TCP
//! listener" to "start the epoch advancer, loggers, and worker pool".

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::engine_error::{engine_error, ErrorCode, Result};
use crate::epoch::{AtomicEpoch, Epoch};
use crate::log::buffer::{new_shared, SharedLogBuffer};
use crate::log::logger::{Logger, WorkerSlot};
use crate::log::manager::{self, LogManager};
use crate::options::EngineOptions;
use crate::procs::ProcManager;
use crate::storage::ArrayStorage;
use crate::thread_id::{distribute_thread_ids, ThreadId};
use crate::thread_pool::ThreadPool;
use crate::xct::manager::{WorkerHandle, XctManager};

/// Per-worker capacity for its thread-local log buffer. Not currently
/// exposed as a configuration key (§6 doesn't list one); sized generously
/// relative to `max_write_set_size` so ordinary workloads never see
/// `MemoryNoFreePages` from the log buffer specifically.
const LOG_BUFFER_BYTES: usize = 1 << 20;

struct EngineInner {
    xct_manager: Arc<XctManager>,
    log_manager: Arc<LogManager>,
    thread_pool: Arc<ThreadPool>,
    storages: RwLock<HashMap<String, Arc<ArrayStorage>>>,
    next_storage_id: AtomicU32,
}

/// The embedded engine. Construct with `Engine::new`, register procedures via
/// `proc_manager()`, then call `start()`. Only after `start()` can storages be
/// created and procedures impersonated.
pub struct Engine {
    options: EngineOptions,
    proc_manager: Arc<ProcManager>,
    inner: Mutex<Option<EngineInner>>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            proc_manager: Arc::new(ProcManager::new()),
            inner: Mutex::new(None),
        }
    }

    /// Non-owning handle for registering procedures before `start()` (§4.5).
    pub fn proc_manager(&self) -> &ProcManager {
        &self.proc_manager
    }

    fn savepoint_path(&self) -> PathBuf {
        let first_log = self
            .options
            .log
            .log_paths
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("./data/log-0"));
        first_log
            .parent()
            .map(|p| p.join("savepoint.json"))
            .unwrap_or_else(|| PathBuf::from("savepoint.json"))
    }

    /// Builds and starts every manager in dependency order: loggers, the log
    /// manager, the epoch advancer, and the worker pool. Idempotent only in
    /// the sense that calling it twice is rejected — engine init order is
    /// fixed (§9).
    pub fn start(&self) -> Result<()> {
        let mut guard = self.inner.lock().expect("engine inner mutex poisoned");
        if guard.is_some() {
            return Err(engine_error!(
                ErrorCode::DependentModuleUnavailableInit,
                "engine already started"
            ));
        }

        let threads_per_group = self.options.thread.thread_count_per_group;
        let groups = self.options.thread.group_count;
        let total_threads = self.options.thread.total_thread_count();
        let total_loggers = self.options.log.log_paths.len() as u16;
        manager::validate_logger_count(total_loggers, total_threads, groups)?;

        // One shared (log buffer, in-commit-epoch guard) pair per worker,
        // referenced by both its Logger's WorkerSlot and its ThreadPool
        // WorkerHandle — the only state those two otherwise-independent
        // components share (§4.3's "respects the worker's
        // in_commit_log_epoch").
        let mut shared: HashMap<ThreadId, (SharedLogBuffer, Arc<AtomicEpoch>)> = HashMap::new();
        for group in 0..groups {
            for ordinal in 0..threads_per_group {
                let thread_id = ThreadId::new(group, ordinal);
                shared.insert(
                    thread_id,
                    (new_shared(LOG_BUFFER_BYTES), Arc::new(AtomicEpoch::new(Epoch::INVALID))),
                );
            }
        }

        let initial_durable_epoch = manager::read_savepoint(&self.savepoint_path());

        let logger_groups = distribute_thread_ids(groups, threads_per_group, total_loggers);
        let mut loggers = Vec::with_capacity(logger_groups.len());
        for (id, thread_ids) in logger_groups.into_iter().enumerate() {
            let slots = thread_ids
                .iter()
                .map(|tid| {
                    let (buffer, guard_epoch) = shared.get(tid).expect("thread id missing from shared map").clone();
                    WorkerSlot {
                        thread_id: *tid,
                        buffer,
                        in_commit_log_epoch: guard_epoch,
                    }
                })
                .collect();
            let path = self.options.log.log_paths[id].clone();
            loggers.push(Logger::new(id as u32, path, slots, initial_durable_epoch)?);
        }

        let log_manager = LogManager::start(loggers, self.savepoint_path(), initial_durable_epoch);
        let xct_manager = XctManager::start(
            initial_durable_epoch,
            std::time::Duration::from_millis(self.options.xct.epoch_advance_interval_ms),
            log_manager.clone(),
        );

        let mut worker_handles = Vec::with_capacity(total_threads as usize);
        for group in 0..groups {
            for ordinal in 0..threads_per_group {
                let thread_id = ThreadId::new(group, ordinal);
                let (buffer, guard_epoch) = shared.remove(&thread_id).expect("thread id missing from shared map");
                let mut handle = WorkerHandle::new(thread_id, buffer);
                handle.in_commit_log_epoch = guard_epoch;
                worker_handles.push((thread_id, handle));
            }
        }

        let thread_pool = ThreadPool::start(
            worker_handles,
            xct_manager.clone(),
            self.proc_manager.clone(),
            self.options.xct.max_read_set_size,
            self.options.xct.max_write_set_size,
        );
        self.proc_manager.mark_started();

        log::info!(
            "engine started: groups={} threads_per_group={} loggers={}",
            groups,
            threads_per_group,
            total_loggers
        );

        *guard = Some(EngineInner {
            xct_manager,
            log_manager,
            thread_pool,
            storages: RwLock::new(HashMap::new()),
            next_storage_id: AtomicU32::new(1),
        });
        Ok(())
    }

    pub fn stop(&self) {
        let inner = self.inner.lock().expect("engine inner mutex poisoned").take();
        if let Some(inner) = inner {
            inner.thread_pool.shutdown();
            inner.xct_manager.shutdown();
            inner.log_manager.shutdown();
            log::info!("engine stopped");
        }
    }

    fn with_inner<T>(&self, f: impl FnOnce(&EngineInner) -> Result<T>) -> Result<T> {
        let guard = self.inner.lock().expect("engine inner mutex poisoned");
        match &*guard {
            Some(inner) => f(inner),
            None => Err(engine_error!(
                ErrorCode::DependentModuleUnavailableUninit,
                "engine not started"
            )),
        }
    }

    pub fn xct_manager(&self) -> Result<Arc<XctManager>> {
        self.with_inner(|inner| Ok(inner.xct_manager.clone()))
    }

    pub fn create_array_storage(&self, name: &str, slot_count: u32, payload_size: usize) -> Result<Arc<ArrayStorage>> {
        self.with_inner(|inner| {
            let mut storages = inner.storages.write().expect("storages lock poisoned");
            if storages.contains_key(name) {
                return Err(engine_error!(
                    ErrorCode::InvalidArgument,
                    "storage '{}' already exists",
                    name
                ));
            }
            let id = inner.next_storage_id.fetch_add(1, Ordering::SeqCst);
            let storage = Arc::new(ArrayStorage::create(id, name, slot_count, payload_size));
            storages.insert(name.to_string(), storage.clone());
            Ok(storage)
        })
    }

    pub fn get_array_storage(&self, name: &str) -> Result<Arc<ArrayStorage>> {
        self.with_inner(|inner| {
            inner
                .storages
                .read()
                .expect("storages lock poisoned")
                .get(name)
                .cloned()
                .ok_or_else(|| engine_error!(ErrorCode::KeyNotFound, "no storage named '{}'", name))
        })
    }

    pub fn impersonate(&self, proc_name: &str, input: Vec<u8>, output_capacity: usize) -> Result<Option<Arc<crate::thread_pool::Session>>> {
        self.with_inner(|inner| inner.thread_pool.impersonate(proc_name, input, output_capacity))
    }

    pub fn impersonate_synchronous(&self, proc_name: &str, input: Vec<u8>, output_capacity: usize) -> Result<Vec<u8>> {
        self.with_inner(|inner| inner.thread_pool.impersonate_synchronous(proc_name, input, output_capacity))
    }

    pub fn advance_current_global_epoch(&self) -> Result<()> {
        self.with_inner(|inner| {
            inner.xct_manager.advance_current_global_epoch();
            Ok(())
        })
    }

    pub fn wait_for_commit(&self, commit_epoch: Epoch, wait_micros: i64) -> Result<()> {
        self.with_inner(|inner| inner.xct_manager.wait_for_commit(commit_epoch, wait_micros))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
