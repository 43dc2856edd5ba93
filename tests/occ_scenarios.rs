//! End-to-end exercises of the literal scenarios in spec §8 (S1, S3, S4, S5
//! against the transactional core directly through its public module API;
//! S6 through the full `Engine` + impersonation surface). S2 is adapted to
//! the reference array storage per SPEC_FULL.md §4.6/§8, since masstree is
//! out of scope (§1) and has no bulk-scan operation of its own to test.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use foedus_lite::epoch::{AtomicEpoch, Epoch};
use foedus_lite::log::buffer::new_shared;
use foedus_lite::log::logger::{Logger, WorkerSlot};
use foedus_lite::log::manager::LogManager;
use foedus_lite::storage::ArrayStorage;
use foedus_lite::thread_id::ThreadId;
use foedus_lite::xct::manager::{WorkerHandle, XctManager};
use foedus_lite::xct::Xct;
use foedus_lite::{Engine, EngineOptions, ErrorCode};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A single-worker, single-logger transactional core, wired the way
/// `Engine::start` wires one, for tests that need direct access to the
/// `XctManager`/`WorkerHandle`/`ArrayStorage` triple without going through
/// impersonation.
struct CoreHarness {
    xct_manager: Arc<XctManager>,
    worker: WorkerHandle,
}

impl CoreHarness {
    fn new(dir: &std::path::Path) -> Self {
        let log_buffer = new_shared(1 << 16);
        let in_commit = Arc::new(AtomicEpoch::new(Epoch::INVALID));
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
        Self { xct_manager, worker }
    }

    fn shutdown(self) {
        self.xct_manager.shutdown();
    }
}

/// S1 — single-key write then read, followed by a successful
/// `wait_for_commit` within budget.
#[test]
fn s1_single_key_write_read() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let harness = CoreHarness::new(dir.path());
    let storage = ArrayStorage::create(1, "myarray", 1 << 8, 16);

    let mut xct = Xct::new(64, 64);
    harness.xct_manager.begin(&mut xct).unwrap();
    storage.overwrite(&mut xct, 123, 0, b"abcXYZ").unwrap();
    let commit_epoch = harness.xct_manager.precommit(&harness.worker, &mut xct).unwrap();
    assert!(commit_epoch.value() > 0);

    let mut xct2 = Xct::new(64, 64);
    harness.xct_manager.begin(&mut xct2).unwrap();
    let payload = storage.read(&mut xct2, 123).unwrap();
    let mut expected = vec![0u8; 16];
    expected[0..6].copy_from_slice(b"abcXYZ");
    assert_eq!(payload, expected);
    harness.xct_manager.precommit(&harness.worker, &mut xct2).unwrap();

    harness
        .xct_manager
        .wait_for_commit(commit_epoch, 1_000_000)
        .expect("commit should become durable within 1s");

    harness.shutdown();
}

/// S2 (adapted) — bulk write across many slots, committing in batches, then
/// a single read-only xct touching every slot (the reference array
/// storage's stand-in for a full-index scan; masstree itself is out of
/// scope per §1).
#[test]
fn s2_bulk_write_then_read_all_slots() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let harness = CoreHarness::new(dir.path());
    const N: u32 = 50;
    const BATCH: u32 = 10;
    let storage = ArrayStorage::create(1, "bulk", N, 1024);

    let mut payload = vec![b'@'; 1024];
    payload[1023] = 0;

    let mut xct = Xct::new(BATCH as usize, BATCH as usize);
    for slot in 0..N {
        if slot % BATCH == 0 {
            harness.xct_manager.begin(&mut xct).unwrap();
        }
        storage.overwrite(&mut xct, slot, 0, &payload).unwrap();
        if (slot + 1) % BATCH == 0 {
            harness.xct_manager.precommit(&harness.worker, &mut xct).unwrap();
        }
    }

    let mut read_xct = Xct::new(N as usize, N as usize);
    harness.xct_manager.begin(&mut read_xct).unwrap();
    let mut result_count = 0;
    for slot in 0..N {
        let bytes = storage.read(&mut read_xct, slot).unwrap();
        assert_eq!(bytes.len(), 1024);
        result_count += 1;
    }
    assert_eq!(result_count, N);
    harness.xct_manager.precommit(&harness.worker, &mut read_xct).unwrap();
    harness.shutdown();
}

/// S3 — two transactions observe the same record; after the first commits a
/// write, the second's precommit must detect the stale read and abort with
/// `RaceAbort`, discarding its log tail and leaving the manager ready for a
/// clean `begin`. `compare_epoch_and_thread` (§4.1/§9) only compares {epoch,
/// thread}, not ordinal, so the second write has to land in a *later* epoch
/// than the one the stale reader observed — otherwise two same-thread
/// commits within one epoch would be indistinguishable from each other, by
/// design. `advance_current_global_epoch` forces that boundary deterministically.
#[test]
fn s3_conflicting_write_causes_race_abort() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let harness = CoreHarness::new(dir.path());
    let storage = ArrayStorage::create(1, "myarray", 16, 16);

    // Worker B "observes" record 7 before worker A ever writes it.
    let mut observer = Xct::new(16, 16);
    harness.xct_manager.begin(&mut observer).unwrap();
    let observe_err = storage.read(&mut observer, 7).unwrap_err();
    assert_eq!(observe_err.code(), ErrorCode::KeyNotFound);
    harness.xct_manager.abort(&harness.worker, &mut observer).unwrap();

    // Worker A writes and commits record 7 first, establishing an owner_id.
    let mut xct_a = Xct::new(16, 16);
    harness.xct_manager.begin(&mut xct_a).unwrap();
    storage.overwrite(&mut xct_a, 7, 0, b"A").unwrap();
    harness.xct_manager.precommit(&harness.worker, &mut xct_a).unwrap();

    // Worker B reads A's committed value into its read-set, then sits on a
    // write it hasn't committed yet.
    let mut xct_b = Xct::new(16, 16);
    harness.xct_manager.begin(&mut xct_b).unwrap();
    let observed = storage.read(&mut xct_b, 7).unwrap();
    assert_eq!(&observed[0..1], b"A");
    storage.overwrite(&mut xct_b, 7, 0, b"B").unwrap();

    // The epoch advances, then a second transaction from A overwrites
    // record 7 again and commits in this new epoch — a genuinely newer
    // owner_id, distinguishable from what B observed by epoch alone.
    harness.xct_manager.advance_current_global_epoch();
    let mut xct_a2 = Xct::new(16, 16);
    harness.xct_manager.begin(&mut xct_a2).unwrap();
    storage.overwrite(&mut xct_a2, 7, 0, b"C").unwrap();
    harness.xct_manager.precommit(&harness.worker, &mut xct_a2).unwrap();

    let err = harness.xct_manager.precommit(&harness.worker, &mut xct_b).unwrap_err();
    assert_eq!(err.code(), ErrorCode::RaceAbort);
    assert!(!xct_b.is_active());

    // The manager is clean: a fresh begin works immediately afterward.
    let mut xct_clean = Xct::new(16, 16);
    harness.xct_manager.begin(&mut xct_clean).unwrap();
    harness.xct_manager.abort(&harness.worker, &mut xct_clean).unwrap();

    harness.shutdown();
}

/// S4 — reading a slot that has never been written returns `KeyNotFound`;
/// the commit still succeeds (there is no write-set side effect from a
/// failed read, and the read never entered the read-set).
#[test]
fn s4_missing_key_is_not_found_but_commit_still_succeeds() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let harness = CoreHarness::new(dir.path());
    let storage = ArrayStorage::create(1, "myarray", 4, 16);

    let mut xct = Xct::new(16, 16);
    harness.xct_manager.begin(&mut xct).unwrap();
    let err = storage.read(&mut xct, 0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNotFound);
    assert!(xct.read_set().is_empty());
    assert!(xct.write_set().is_empty());

    let commit_epoch = harness.xct_manager.precommit(&harness.worker, &mut xct).unwrap();
    assert!(commit_epoch.is_valid());
    harness.shutdown();
}

/// S5 — `wait_for_commit` with `wait_micros = 0` is a non-blocking probe
/// that returns `Timeout` while a record's commit epoch is not yet durable
/// (simulated deterministically by holding another worker's
/// `in_commit_log_epoch` guard open at the batch's epoch, per §4.3); a
/// subsequent call with a real budget succeeds once the guard clears.
#[test]
fn s5_wait_for_commit_timeout_then_success() {
    init_log();
    let dir = tempfile::tempdir().unwrap();

    let log_buffer = new_shared(1 << 16);
    let committer_guard = Arc::new(AtomicEpoch::new(Epoch::INVALID));
    let other_guard = Arc::new(AtomicEpoch::new(Epoch::INVALID));
    let committer_thread = ThreadId::new(0, 0);
    let other_thread = ThreadId::new(0, 1);

    let other_buffer = new_shared(1 << 16);
    let slots = vec![
        WorkerSlot {
            thread_id: committer_thread,
            buffer: log_buffer.clone(),
            in_commit_log_epoch: committer_guard.clone(),
        },
        WorkerSlot {
            thread_id: other_thread,
            buffer: other_buffer,
            in_commit_log_epoch: other_guard.clone(),
        },
    ];
    let logger = Logger::new(0, dir.path().join("log-0"), slots, Epoch::new(1)).unwrap();
    let log_manager = LogManager::start(vec![logger], dir.path().join("savepoint.json"), Epoch::new(1));
    let xct_manager = XctManager::start(Epoch::new(1), Duration::from_millis(5), log_manager.clone());
    let mut worker = WorkerHandle::new(committer_thread, log_buffer);
    worker.in_commit_log_epoch = committer_guard;

    // The log manager's initial durable epoch and the xct manager's initial
    // current epoch are both 1, so a commit landing in epoch 1 would satisfy
    // `wait_until_durable`'s "already durable" check trivially. Advance past
    // that once so the write's commit_epoch is strictly ahead of what's
    // already considered durable.
    xct_manager.advance_current_global_epoch();

    // A second worker is "mid-commit" at the current epoch before our write
    // lands — its open guard must block the logger from claiming any epoch
    // at or past it as durable, however far the first worker's own commit
    // has progressed.
    let current_epoch = xct_manager.current_global_epoch();
    other_guard.store_release(current_epoch);

    let mut xct = Xct::new(16, 16);
    xct_manager.begin(&mut xct).unwrap();
    let record = Arc::new(foedus_lite::record::Record::new(16));
    xct.add_write(foedus_lite::xct::WriteSetEntry {
        storage_id: 1,
        address: foedus_lite::record::RecordAddress::new(1, 0),
        record: record.clone(),
        log_entry: foedus_lite::xct::LogEntry {
            offset: 0,
            payload: b"abcXYZ".to_vec(),
        },
    })
    .unwrap();
    let commit_epoch = xct_manager.precommit(&worker, &mut xct).unwrap();

    let err = xct_manager.wait_for_commit(commit_epoch, 0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);

    // Clear the blocking guard; durability can now catch up.
    other_guard.store_release(Epoch::INVALID);
    xct_manager
        .wait_for_commit(commit_epoch, 1_000_000)
        .expect("commit should become durable once the blocking guard clears");

    xct_manager.shutdown();
}

/// S6 — procedure registration and impersonation through the full `Engine`
/// surface: a registered procedure runs exactly once per
/// `impersonate_synchronous` call, and an unregistered name fails with
/// `ProcNotFound`.
#[test]
fn s6_procedure_registration_and_impersonation() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    let options = EngineOptions::single_threaded_debug(dir.path().join("log-0"));
    let engine = Engine::new(options);

    // `ProcedureFn` is a bare `fn` pointer, so a run counter has to live at
    // module scope rather than be captured; a single flag is enough to
    // prove "ran exactly once" for this test.
    static RAN: AtomicBool = AtomicBool::new(false);
    fn counting_proc(ctx: &mut foedus_lite::procedure::ProcedureContext) -> foedus_lite::Result<()> {
        RAN.store(true, std::sync::atomic::Ordering::SeqCst);
        ctx.write_output(b"ok")
    }

    engine.proc_manager().pre_register("counting", counting_proc).unwrap();
    engine.start().unwrap();

    assert!(!RAN.load(std::sync::atomic::Ordering::SeqCst));
    let output = engine.impersonate_synchronous("counting", vec![], 8).unwrap();
    assert_eq!(&output, b"ok");
    assert!(RAN.load(std::sync::atomic::Ordering::SeqCst));

    let err = engine.impersonate("missing", vec![], 8).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ProcNotFound);

    engine.stop();
}
