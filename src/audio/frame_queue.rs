//! # Frame Queue Bridge
//!
//! Turns push-style frame delivery from the transport into pull-style fixed-size
//! reads for the segmenter worker. The transport callback pushes whatever chunk
//! sizes it receives; the worker asks for exactly `n` bytes at a time.
//!
//! ## Key Features:
//! - **Never blocks the writer**: `push` appends under a short mutex and returns
//! - **Exact reads**: `read(n)` returns exactly `n` bytes, stitched from as many chunks as needed
//! - **Lossless**: bytes beyond `n` stay at the head of the queue for the next read
//! - **Interruptible**: `close()` wakes a blocked reader, which then returns `None`
//!
//! ## Rust Concepts:
//! - **Mutex + Condvar**: The reader sleeps on the condition variable instead of spinning
//! - **wait_timeout**: Bounded waits so the closed flag is re-checked at a fixed cadence

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Single-producer, single-consumer byte queue shared between the transport
/// context and a session's segmenter thread.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    poll_interval: Duration,
}

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<Vec<u8>>,
    /// Total bytes across `chunks`
    buffered: usize,
    closed: bool,
}

impl FrameQueue {
    /// Create an empty queue.
    ///
    /// ## Parameters:
    /// - **poll_interval**: longest time a blocked `read` sleeps before re-checking for shutdown
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a chunk to the tail of the queue.
    ///
    /// ## Returns:
    /// - **true**: the chunk was queued
    /// - **false**: the queue is closed and the chunk was dropped
    pub fn push(&self, chunk: Vec<u8>) -> bool {
        if chunk.is_empty() {
            return !self.is_closed();
        }

        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.buffered += chunk.len();
        state.chunks.push_back(chunk);
        drop(state);

        self.available.notify_one();
        true
    }

    /// Block until `n_bytes` are buffered, then return exactly that many bytes
    /// in arrival order.
    ///
    /// ## Returns:
    /// - **Some(bytes)**: `bytes.len() == n_bytes`
    /// - **None**: the queue was closed before enough data arrived
    pub fn read(&self, n_bytes: usize) -> Option<Vec<u8>> {
        let mut state = self.lock();

        loop {
            if state.closed {
                return None;
            }
            if state.buffered >= n_bytes {
                break;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, self.poll_interval)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        let mut out = Vec::with_capacity(n_bytes);
        while out.len() < n_bytes {
            let mut chunk = state.chunks.pop_front()?;
            let needed = n_bytes - out.len();
            if chunk.len() > needed {
                // Keep the tail of a split chunk at the head of the queue
                let rest = chunk.split_off(needed);
                state.chunks.push_front(rest);
            }
            out.extend_from_slice(&chunk);
        }
        state.buffered -= n_bytes;

        Some(out)
    }

    /// Mark the queue closed, discard buffered data and wake any blocked reader.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.chunks.clear();
        state.buffered = 0;
        drop(state);

        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.lock().buffered
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
