//! Engine configuration. Mirrors the recognized configuration keys of §6
//! one-for-one as struct fields, the way `GraniteConfig`/`SandstoneConfig`
//! group related knobs behind a `Default` impl plus named presets.

use std::path::PathBuf;

/// Workers per NUMA group and number of NUMA groups.
#[derive(Debug, Clone)]
pub struct ThreadOptions {
    pub thread_count_per_group: u16,
    pub group_count: u16,
}

impl ThreadOptions {
    pub fn total_thread_count(&self) -> u16 {
        self.thread_count_per_group * self.group_count
    }
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            thread_count_per_group: 4,
            group_count: 1,
        }
    }
}

/// Per-node page pool sizing. The page pool itself is out of scope (§1); this
/// only carries the configured budget through for diagnostics.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub page_pool_size_mb_per_node: u32,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            page_pool_size_mb_per_node: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub snapshot_cache_size_mb_per_node: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            snapshot_cache_size_mb_per_node: 16,
        }
    }
}

/// Per-transaction bounds and the epoch tick interval.
#[derive(Debug, Clone)]
pub struct XctOptions {
    pub max_read_set_size: usize,
    pub max_write_set_size: usize,
    pub epoch_advance_interval_ms: u64,
}

impl Default for XctOptions {
    fn default() -> Self {
        Self {
            max_read_set_size: 1024,
            max_write_set_size: 1024,
            epoch_advance_interval_ms: 20,
        }
    }
}

/// Ordered list of log file paths. The count must satisfy the divisibility
/// rules of §4.3: `total_loggers % group_count == 0`,
/// `total_threads % total_loggers == 0`, `total_loggers <= total_threads`.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub log_paths: Vec<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_paths: vec![PathBuf::from("./data/log-0")],
        }
    }
}

/// Top-level engine configuration, composed of the per-module options above.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub thread: ThreadOptions,
    pub memory: MemoryOptions,
    pub cache: CacheOptions,
    pub xct: XctOptions,
    pub log: LogOptions,
}

impl EngineOptions {
    /// One NUMA group, one worker, one log file. Used by unit tests and small
    /// examples where the divisibility rules are trivially satisfied and
    /// there is no real concurrency to reason about.
    pub fn single_threaded_debug(log_path: impl Into<PathBuf>) -> Self {
        Self {
            thread: ThreadOptions {
                thread_count_per_group: 1,
                group_count: 1,
            },
            log: LogOptions {
                log_paths: vec![log_path.into()],
            },
            xct: XctOptions {
                epoch_advance_interval_ms: 5,
                ..XctOptions::default()
            },
            ..Self::default()
        }
    }

    /// A small multi-worker, multi-logger configuration suitable for
    /// exercising the OCC protocol's cross-thread conflict paths in tests.
    pub fn small_concurrent(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            thread: ThreadOptions {
                thread_count_per_group: 4,
                group_count: 1,
            },
            log: LogOptions {
                log_paths: vec![data_dir.join("log-0"), data_dir.join("log-1")],
            },
            xct: XctOptions {
                epoch_advance_interval_ms: 5,
                ..XctOptions::default()
            },
            ..Self::default()
        }
    }
}
