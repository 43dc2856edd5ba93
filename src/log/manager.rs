//! Aggregates per-logger durable-epoch into the engine-wide
//! `durable_global_epoch` and implements `wait_for_commit`'s blocking half
//! (§4.3). Grounded on `foedus/log/log_manager_pimpl.cpp`'s
//! `refresh_global_durable_epoch`/`wait_until_durable`, with the savepoint
//! persisted as small JSON the way the teacher's WAL checkpoint marker is
//! (`engines/granite/recovery.rs::read_checkpoint`), via `serde_json`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::engine_error::{engine_error, ErrorCode, Result};
use crate::epoch::{AtomicEpoch, Epoch};
use crate::log::logger::Logger;

/// How often the background aggregator re-checks whether the minimum
/// per-logger durable epoch has advanced. Distinct from a logger's own idle
/// poll interval — this just notifies `wait_until_durable` waiters sooner.
const AGGREGATOR_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Serialize, Deserialize)]
struct Savepoint {
    durable_global_epoch: u32,
}

/// Validates the divisibility rules of §4.3: `total_loggers % groups == 0`,
/// `total_threads % total_loggers == 0`, `total_loggers <= total_threads`.
pub fn validate_logger_count(total_loggers: u16, total_threads: u16, groups: u16) -> Result<()> {
    if groups == 0 || total_loggers == 0 {
        return Err(engine_error!(
            ErrorCode::InvalidLoggerCount,
            "groups and total_loggers must be nonzero (groups={}, total_loggers={})",
            groups,
            total_loggers
        ));
    }
    if total_loggers % groups != 0 || total_threads % total_loggers != 0 || total_loggers > total_threads {
        return Err(engine_error!(
            ErrorCode::InvalidLoggerCount,
            "invalid logger distribution: total_loggers={} total_threads={} groups={}",
            total_loggers,
            total_threads,
            groups
        ));
    }
    Ok(())
}

pub fn read_savepoint(path: &Path) -> Epoch {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<Savepoint>(&contents) {
            Ok(sp) if sp.durable_global_epoch != 0 => Epoch::new(sp.durable_global_epoch),
            _ => Epoch::new(1),
        },
        Err(_) => Epoch::new(1),
    }
}

pub struct LogManager {
    loggers: Vec<Arc<Logger>>,
    logger_handles: Mutex<Vec<JoinHandle<()>>>,
    durable_global_epoch: AtomicEpoch,
    savepoint_mutex: Mutex<()>,
    durable_advanced_mutex: Mutex<()>,
    durable_advanced_cond: Condvar,
    savepoint_path: PathBuf,
    aggregator_shutdown: Arc<AtomicBool>,
    aggregator_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    /// Takes ownership of already-constructed loggers, spawns their
    /// background drain threads plus one aggregator thread, and returns the
    /// manager ready to serve `wait_for_commit`.
    pub fn start(loggers: Vec<Logger>, savepoint_path: PathBuf, initial_durable_epoch: Epoch) -> Arc<Self> {
        let loggers: Vec<Arc<Logger>> = loggers.into_iter().map(Arc::new).collect();
        let logger_handles = loggers.iter().cloned().map(Logger::spawn).collect();

        let manager = Arc::new(Self {
            loggers,
            logger_handles: Mutex::new(logger_handles),
            durable_global_epoch: AtomicEpoch::new(initial_durable_epoch),
            savepoint_mutex: Mutex::new(()),
            durable_advanced_mutex: Mutex::new(()),
            durable_advanced_cond: Condvar::new(),
            savepoint_path,
            aggregator_shutdown: Arc::new(AtomicBool::new(false)),
            aggregator_handle: Mutex::new(None),
        });

        let aggregator_manager = manager.clone();
        let shutdown_flag = manager.aggregator_shutdown.clone();
        let handle = std::thread::spawn(move || {
            while !shutdown_flag.load(Ordering::Acquire) {
                std::thread::sleep(AGGREGATOR_INTERVAL);
                if let Err(e) = aggregator_manager.refresh_global_durable_epoch() {
                    log::error!("refresh_global_durable_epoch failed: {}", e);
                }
            }
        });
        *manager.aggregator_handle.lock().expect("aggregator handle mutex poisoned") = Some(handle);
        manager
    }

    pub fn shutdown(&self) {
        self.aggregator_shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.aggregator_handle.lock().expect("aggregator handle mutex poisoned").take() {
            let _ = handle.join();
        }
        for logger in &self.loggers {
            logger.request_shutdown();
        }
        for handle in self.logger_handles.lock().expect("logger handles mutex poisoned").drain(..) {
            let _ = handle.join();
        }
    }

    pub fn wakeup_loggers(&self) {
        for logger in &self.loggers {
            logger.wakeup();
        }
    }

    pub fn get_durable_global_epoch(&self) -> Epoch {
        self.durable_global_epoch.load_acquire()
    }

    pub fn refresh_global_durable_epoch(&self) -> Result<()> {
        let min_durable = self.loggers.iter().map(|l| l.durable_epoch()).min();
        let min_durable = match min_durable {
            Some(e) if e.is_valid() => e,
            _ => return Ok(()),
        };

        if min_durable <= self.get_durable_global_epoch() {
            return Ok(());
        }

        {
            let _guard = self.savepoint_mutex.lock().expect("savepoint mutex poisoned");
            // Double-checked: another thread may have already advanced past
            // min_durable while we waited for the lock.
            if min_durable <= self.get_durable_global_epoch() {
                return Ok(());
            }
            self.write_savepoint(min_durable)?;
            self.durable_global_epoch.store_release(min_durable);
        }

        let _guard = self.durable_advanced_mutex.lock().expect("durable-advanced mutex poisoned");
        self.durable_advanced_cond.notify_all();
        Ok(())
    }

    fn write_savepoint(&self, durable_epoch: Epoch) -> Result<()> {
        let savepoint = Savepoint {
            durable_global_epoch: durable_epoch.value(),
        };
        let json = serde_json::to_string_pretty(&savepoint)
            .map_err(|e| engine_error!(ErrorCode::Io, "failed to serialize savepoint: {}", e))?;
        if let Some(parent) = self.savepoint_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.savepoint_path, json)?;
        Ok(())
    }

    /// Blocks (or probes, if `wait_micros == 0`) until `commit_epoch` is
    /// durable. `wait_micros < 0` waits indefinitely (§5 Timeouts).
    pub fn wait_until_durable(&self, commit_epoch: Epoch, wait_micros: i64) -> Result<()> {
        if commit_epoch <= self.get_durable_global_epoch() {
            return Ok(());
        }
        if wait_micros == 0 {
            return Err(engine_error!(
                ErrorCode::Timeout,
                "commit_epoch {} not yet durable (non-blocking probe)",
                commit_epoch
            ));
        }

        let deadline = if wait_micros > 0 {
            Some(Instant::now() + Duration::from_micros(wait_micros as u64))
        } else {
            None
        };

        loop {
            self.wakeup_loggers();
            if commit_epoch <= self.get_durable_global_epoch() {
                return Ok(());
            }

            let guard = self.durable_advanced_mutex.lock().expect("durable-advanced mutex poisoned");
            if commit_epoch <= self.get_durable_global_epoch() {
                return Ok(());
            }

            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(engine_error!(
                            ErrorCode::Timeout,
                            "wait_until_durable timed out waiting for commit_epoch {}",
                            commit_epoch
                        ));
                    }
                    let (_guard, result) = self
                        .durable_advanced_cond
                        .wait_timeout(guard, d - now)
                        .expect("durable-advanced condvar poisoned");
                    if result.timed_out() && commit_epoch > self.get_durable_global_epoch() {
                        return Err(engine_error!(
                            ErrorCode::Timeout,
                            "wait_until_durable timed out waiting for commit_epoch {}",
                            commit_epoch
                        ));
                    }
                }
                None => {
                    let _guard = self
                        .durable_advanced_cond
                        .wait(guard)
                        .expect("durable-advanced condvar poisoned");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_logger_count_rejects_non_divisible_threads() {
        assert!(validate_logger_count(3, 10, 1).is_err());
    }

    #[test]
    fn validate_logger_count_rejects_more_loggers_than_threads() {
        assert!(validate_logger_count(8, 4, 1).is_err());
    }

    #[test]
    fn validate_logger_count_accepts_even_split() {
        assert!(validate_logger_count(2, 8, 1).is_ok());
    }

    #[test]
    fn read_savepoint_defaults_to_epoch_one_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        assert_eq!(read_savepoint(&path), Epoch::new(1));
    }
}
