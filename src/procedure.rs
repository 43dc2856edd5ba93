//! The stored-procedure calling convention (§6): a procedure receives
//! `{thread_context, input_bytes, output_buffer, output_used_out}` and may
//! issue `begin`/`precommit`/`abort` at will. It must not outlive the
//! session that invoked it, which Rust enforces here structurally — a
//! `ProcedureContext` only ever exists as a stack-local borrow for the
//! duration of one worker-thread dispatch (§4.4).

use crate::engine_error::{engine_error, ErrorCode, Result};
use crate::epoch::Epoch;
use crate::xct::manager::{WorkerHandle, XctManager};
use crate::xct::Xct;

/// A bounded output buffer a procedure fills via `write`/`write_at`.
/// `output_used` is tracked internally and read back by the dispatcher once
/// the procedure returns (§4.4).
pub struct OutputBuffer<'a> {
    buffer: &'a mut [u8],
    used: usize,
}

impl<'a> OutputBuffer<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, used: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Appends `data` at the current write position. Fails with
    /// `TooSmallPayloadBuffer` rather than truncating silently — standard
    /// for the two-step "probe size, then retry with a bigger buffer"
    /// pattern (§4.4).
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.buffer.len() - self.used {
            return Err(engine_error!(
                ErrorCode::TooSmallPayloadBuffer,
                "output buffer has {} bytes free, procedure wrote {}",
                self.buffer.len() - self.used,
                data.len()
            ));
        }
        let end = self.used + data.len();
        self.buffer[self.used..end].copy_from_slice(data);
        self.used = end;
        Ok(())
    }
}

/// Everything a registered procedure receives when the thread pool dispatches
/// it to a worker (§4.4, §6). Procedures drive the transactional core purely
/// through `begin`/`precommit`/`abort` plus whatever storage references they
/// were given separately (storages are looked up by the caller, not carried
/// in this context, since the core treats them as external collaborators).
pub struct ProcedureContext<'a> {
    xct_manager: &'a XctManager,
    worker: &'a WorkerHandle,
    xct: &'a mut Xct,
    input: &'a [u8],
    output: &'a mut OutputBuffer<'a>,
}

impl<'a> ProcedureContext<'a> {
    pub fn new(
        xct_manager: &'a XctManager,
        worker: &'a WorkerHandle,
        xct: &'a mut Xct,
        input: &'a [u8],
        output: &'a mut OutputBuffer<'a>,
    ) -> Self {
        Self {
            xct_manager,
            worker,
            xct,
            input,
            output,
        }
    }

    pub fn input(&self) -> &[u8] {
        self.input
    }

    pub fn thread_id(&self) -> crate::thread_id::ThreadId {
        self.worker.thread_id
    }

    pub fn xct(&mut self) -> &mut Xct {
        self.xct
    }

    pub fn write_output(&mut self, data: &[u8]) -> Result<()> {
        self.output.write(data)
    }

    pub fn begin(&mut self) -> Result<()> {
        self.xct_manager.begin(self.xct)
    }

    pub fn precommit(&mut self) -> Result<Epoch> {
        self.xct_manager.precommit(self.worker, self.xct)
    }

    pub fn abort(&mut self) -> Result<()> {
        self.xct_manager.abort(self.worker, self.xct)
    }

    pub fn wait_for_commit(&self, commit_epoch: Epoch, wait_micros: i64) -> Result<()> {
        self.xct_manager.wait_for_commit(commit_epoch, wait_micros)
    }
}
