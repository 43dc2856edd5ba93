//! Thread-local log buffer: an append-only byte ring per worker, with
//! `head`/`tail`/`committed` offsets (§3). Writes extend `tail`; a
//! successful precommit publishes the range by advancing `committed` to the
//! current `tail`; an abort rewinds `tail` back to `committed`, discarding
//! whatever was written for the doomed transaction. A logger drains
//! `[head, committed)` and, once fsynced, advances `head`.
//!
//! Shared between exactly two parties: the owning worker (appends, commits,
//! discards) and its assigned logger (drains, advances head). Both sides
//! take the same mutex — there is no lock-free fast path here, matching the
//! buffer's role as a small, rarely-contended handoff point rather than the
//! hot path (the hot path is the owner-id word on each record).

use std::sync::{Arc, Mutex};

use crate::engine_error::{engine_error, ErrorCode, Result};

pub struct ThreadLogBuffer {
    storage: Vec<u8>,
    capacity: u64,
    head: u64,
    tail: u64,
    committed: u64,
}

impl ThreadLogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity],
            capacity: capacity as u64,
            head: 0,
            tail: 0,
            committed: 0,
        }
    }

    pub fn offset_head(&self) -> u64 {
        self.head
    }

    pub fn offset_tail(&self) -> u64 {
        self.tail
    }

    pub fn offset_committed(&self) -> u64 {
        self.committed
    }

    /// Bytes free for appending before the ring catches up with `head`.
    pub fn free_space(&self) -> u64 {
        self.capacity - (self.tail - self.head)
    }

    /// Appends `bytes` at the current tail, advancing it. Fails rather than
    /// silently wrapping over undrained data if the ring has no free space —
    /// a logger that falls behind is a capacity problem, not something to
    /// paper over.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let used = self.tail - self.head;
        let free = self.capacity - used;
        if bytes.len() as u64 > free {
            return Err(engine_error!(
                ErrorCode::MemoryNoFreePages,
                "thread log buffer full: used={} capacity={} requested={}",
                used,
                self.capacity,
                bytes.len()
            ));
        }
        let start = self.tail;
        for (i, b) in bytes.iter().enumerate() {
            let pos = ((start + i as u64) % self.capacity) as usize;
            self.storage[pos] = *b;
        }
        self.tail += bytes.len() as u64;
        Ok(start)
    }

    /// Phase 3 publish: the commit-epoch has been chosen and the write-set
    /// applied, so whatever was appended since the last commit becomes
    /// visible to the logger.
    pub fn publish_committed_log(&mut self) {
        self.committed = self.tail;
    }

    /// Abort path: rewind the tail to the last committed boundary, discarding
    /// log bytes written for a transaction that never reached Phase 3.
    pub fn discard_current_xct_log(&mut self) {
        self.tail = self.committed;
    }

    /// Returns the bytes in `[head, committed)` without consuming them — the
    /// logger calls `advance_head` itself only after a successful fsync.
    pub fn peek_committed(&self) -> Vec<u8> {
        let len = (self.committed - self.head) as usize;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let pos = ((self.head + i as u64) % self.capacity) as usize;
            out.push(self.storage[pos]);
        }
        out
    }

    pub fn advance_head(&mut self, new_head: u64) {
        debug_assert!(new_head <= self.committed);
        self.head = new_head;
    }
}

/// A `ThreadLogBuffer` shared between its owning worker and its logger.
pub type SharedLogBuffer = Arc<Mutex<ThreadLogBuffer>>;

pub fn new_shared(capacity: usize) -> SharedLogBuffer {
    Arc::new(Mutex::new(ThreadLogBuffer::new(capacity)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_advances_tail_and_peek_returns_nothing_until_committed() {
        let mut buf = ThreadLogBuffer::new(64);
        buf.append(b"hello").unwrap();
        assert_eq!(buf.offset_tail(), 5);
        assert_eq!(buf.offset_committed(), 0);
        assert!(buf.peek_committed().is_empty());
    }

    #[test]
    fn publish_then_peek_returns_appended_bytes() {
        let mut buf = ThreadLogBuffer::new(64);
        buf.append(b"hello").unwrap();
        buf.publish_committed_log();
        assert_eq!(buf.peek_committed(), b"hello");
    }

    #[test]
    fn discard_rewinds_tail_to_committed() {
        let mut buf = ThreadLogBuffer::new(64);
        buf.append(b"committed").unwrap();
        buf.publish_committed_log();
        buf.append(b"doomed").unwrap();
        assert_eq!(buf.offset_tail(), 15);
        buf.discard_current_xct_log();
        assert_eq!(buf.offset_tail(), buf.offset_committed());
        assert_eq!(buf.peek_committed(), b"committed");
    }

    #[test]
    fn begin_invariant_tail_equals_committed_after_discard_or_publish() {
        let mut buf = ThreadLogBuffer::new(64);
        buf.append(b"x").unwrap();
        buf.discard_current_xct_log();
        assert_eq!(buf.offset_tail(), buf.offset_committed());
    }

    #[test]
    fn advance_head_after_drain() {
        let mut buf = ThreadLogBuffer::new(64);
        buf.append(b"abc").unwrap();
        buf.publish_committed_log();
        let drained = buf.peek_committed();
        buf.advance_head(buf.offset_head() + drained.len() as u64);
        assert_eq!(buf.offset_head(), 3);
        assert!(buf.peek_committed().is_empty());
    }

    #[test]
    fn append_fails_when_buffer_is_full() {
        let mut buf = ThreadLogBuffer::new(4);
        let err = buf.append(b"toolong").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MemoryNoFreePages);
    }

    #[test]
    fn wraps_around_ring_capacity() {
        let mut buf = ThreadLogBuffer::new(4);
        buf.append(b"ab").unwrap();
        buf.publish_committed_log();
        let drained = buf.peek_committed();
        buf.advance_head(buf.offset_head() + drained.len() as u64);
        buf.append(b"cdef").unwrap();
        buf.publish_committed_log();
        assert_eq!(buf.peek_committed(), b"cdef");
    }
}
