//! Worker thread pool and impersonation dispatch (§4.4). A fixed set of
//! pre-started OS threads, one per `(group, ordinal)` pair, each running at
//! most one procedure at a time; `impersonate` binds a procedure name and
//! input buffer to a free worker and returns a `Session` the caller
//! rendezvouses with via `get_result`. Grounded on the teacher's
//! `GraniteWorkerHandle`/`ConnectionHandler` pattern (a background thread
//! parked on a condvar, woken with exactly one unit of work) generalized
//! from "one channel per engine" to "one job slot per worker".

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::engine_error::{engine_error, ErrorCode, Result};
use crate::procedure::{OutputBuffer, ProcedureContext};
use crate::procs::ProcManager;
use crate::thread_id::ThreadId;
use crate::xct::manager::{WorkerHandle, XctManager};
use crate::xct::Xct;

struct Job {
    proc_name: String,
    session: Arc<Session>,
}

enum SessionOutcome {
    Pending,
    Done(Result<Vec<u8>>),
}

/// The client's handle to one in-flight procedure invocation (§4.4).
pub struct Session {
    input: Vec<u8>,
    output_capacity: usize,
    outcome: Mutex<SessionOutcome>,
    completion: Condvar,
}

impl Session {
    fn new(input: Vec<u8>, output_capacity: usize) -> Self {
        Self {
            input,
            output_capacity,
            outcome: Mutex::new(SessionOutcome::Pending),
            completion: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<Vec<u8>>) {
        let mut guard = self.outcome.lock().expect("session outcome mutex poisoned");
        *guard = SessionOutcome::Done(result);
        self.completion.notify_all();
    }

    /// Blocks until the procedure returns, then yields its output bytes (or
    /// the error it returned).
    pub fn get_result(&self) -> Result<Vec<u8>> {
        let mut guard = self.outcome.lock().expect("session outcome mutex poisoned");
        loop {
            match &*guard {
                SessionOutcome::Done(_) => break,
                SessionOutcome::Pending => {
                    guard = self.completion.wait(guard).expect("session completion condvar poisoned");
                }
            }
        }
        match std::mem::replace(&mut *guard, SessionOutcome::Pending) {
            SessionOutcome::Done(result) => result,
            SessionOutcome::Pending => unreachable!(),
        }
    }

    /// Releases the session. The underlying worker slot was already returned
    /// to the pool's free list when the procedure finished; this only drops
    /// the client's handle.
    pub fn release(self: Arc<Self>) {
        drop(self);
    }
}

struct Worker {
    index: usize,
    thread_id: ThreadId,
    xct_manager: Arc<XctManager>,
    proc_manager: Arc<ProcManager>,
    worker_handle: WorkerHandle,
    xct: Mutex<Xct>,
    job: Mutex<Option<Job>>,
    job_cond: Condvar,
}

/// A fixed-size pool of worker threads, one per `(group, ordinal)` pair
/// (§4.4). Never spawns a thread per request; dispatch only ever wakes an
/// already-running worker parked on `job_cond`.
pub struct ThreadPool {
    workers: Vec<Arc<Worker>>,
    free_list: Mutex<VecDeque<usize>>,
    free_cond: Condvar,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// `workers` is `(thread_id, worker_handle)` pairs prepared by the
    /// engine, carrying the same log buffer / `in_commit_log_epoch` that the
    /// matching `Logger` slot was built from.
    pub fn start(
        workers: Vec<(ThreadId, WorkerHandle)>,
        xct_manager: Arc<XctManager>,
        proc_manager: Arc<ProcManager>,
        max_read_set_size: usize,
        max_write_set_size: usize,
    ) -> Arc<Self> {
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut built = Vec::with_capacity(workers.len());
        let mut free_list = VecDeque::with_capacity(workers.len());
        for (index, (thread_id, worker_handle)) in workers.into_iter().enumerate() {
            built.push(Arc::new(Worker {
                index,
                thread_id,
                xct_manager: xct_manager.clone(),
                proc_manager: proc_manager.clone(),
                worker_handle,
                xct: Mutex::new(Xct::new(max_read_set_size, max_write_set_size)),
                job: Mutex::new(None),
                job_cond: Condvar::new(),
            }));
            free_list.push_back(index);
        }

        let pool = Arc::new(Self {
            workers: built,
            free_list: Mutex::new(free_list),
            free_cond: Condvar::new(),
            shutdown,
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for worker in &pool.workers {
            let worker = worker.clone();
            let pool_for_thread = pool.clone();
            handles.push(std::thread::spawn(move || Self::run_worker(pool_for_thread, worker)));
        }
        *pool.handles.lock().expect("thread pool handles mutex poisoned") = handles;
        pool
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::Release);
        for worker in &self.workers {
            let _guard = worker.job.lock().expect("worker job mutex poisoned");
            worker.job_cond.notify_all();
        }
        for handle in self.handles.lock().expect("thread pool handles mutex poisoned").drain(..) {
            let _ = handle.join();
        }
    }

    fn run_worker(pool: Arc<Self>, worker: Arc<Worker>) {
        log::info!("worker {} started", worker.thread_id);
        loop {
            let job = {
                let mut guard = worker.job.lock().expect("worker job mutex poisoned");
                loop {
                    if let Some(job) = guard.take() {
                        break Some(job);
                    }
                    if pool.shutdown.load(std::sync::atomic::Ordering::Acquire) {
                        break None;
                    }
                    guard = worker.job_cond.wait(guard).expect("worker job condvar poisoned");
                }
            };
            let job = match job {
                Some(job) => job,
                None => break,
            };

            let result = Self::run_job(&worker, &job);
            job.session.complete(result);

            pool.free_list.lock().expect("free list mutex poisoned").push_back(worker.index);
            pool.free_cond.notify_one();
        }
        log::info!("worker {} stopped", worker.thread_id);
    }

    fn run_job(worker: &Worker, job: &Job) -> Result<Vec<u8>> {
        let func = worker.proc_manager.get(&job.proc_name)?;
        let mut output = bytes::BytesMut::zeroed(job.session.output_capacity);
        let mut xct = worker.xct.lock().expect("worker xct mutex poisoned");
        let mut out_buf = OutputBuffer::new(&mut output);
        let mut ctx = ProcedureContext::new(&worker.xct_manager, &worker.worker_handle, &mut xct, &job.session.input, &mut out_buf);
        let run_result = func(&mut ctx);
        let used = out_buf.used();
        drop(out_buf);
        run_result?;
        output.truncate(used);
        Ok(output.to_vec())
    }

    fn dispatch(&self, index: usize, proc_name: &str, session: Arc<Session>) {
        let worker = &self.workers[index];
        let mut guard = worker.job.lock().expect("worker job mutex poisoned");
        *guard = Some(Job {
            proc_name: proc_name.to_string(),
            session,
        });
        worker.job_cond.notify_all();
    }

    /// Non-blocking: returns `Ok(None)` if no worker is free right now
    /// (§4.4 — caller may try again), `Err` if `proc_name` isn't registered.
    pub fn impersonate(&self, proc_name: &str, input: Vec<u8>, output_capacity: usize) -> Result<Option<Arc<Session>>> {
        let worker = self.workers.first().ok_or_else(|| {
            engine_error!(ErrorCode::DependentModuleUnavailableInit, "thread pool has no workers")
        })?;
        worker.proc_manager.get(proc_name)?;

        let mut free = self.free_list.lock().expect("free list mutex poisoned");
        match free.pop_front() {
            None => Ok(None),
            Some(index) => {
                drop(free);
                let session = Arc::new(Session::new(input, output_capacity));
                self.dispatch(index, proc_name, session.clone());
                Ok(Some(session))
            }
        }
    }

    /// Blocks until a worker is free, dispatches, and waits for the result.
    pub fn impersonate_synchronous(&self, proc_name: &str, input: Vec<u8>, output_capacity: usize) -> Result<Vec<u8>> {
        let worker = self.workers.first().ok_or_else(|| {
            engine_error!(ErrorCode::DependentModuleUnavailableInit, "thread pool has no workers")
        })?;
        worker.proc_manager.get(proc_name)?;

        let index = {
            let mut free = self.free_list.lock().expect("free list mutex poisoned");
            loop {
                if let Some(index) = free.pop_front() {
                    break index;
                }
                free = self.free_cond.wait(free).expect("free list condvar poisoned");
            }
        };

        let session = Arc::new(Session::new(input, output_capacity));
        self.dispatch(index, proc_name, session.clone());
        session.get_result()
    }
}
