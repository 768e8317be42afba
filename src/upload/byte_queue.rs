//! Producer/consumer byte buffering for upload sessions.
//!
//! This module provides the [`ByteQueue`] struct, the single hand-off point
//! between the data producer (the caller pushing buffers) and the session
//! controller (the consumer pulling exactly the bytes the next request needs).
//!
//! # Overview
//!
//! - `push` appends a buffer and never blocks.
//! - `pull` yields the next buffer, splitting the head buffer when it is
//!   larger than the requested limit, and suspends the caller while the queue
//!   is empty and the producer has not finished.
//! - `finish` marks the producer as done; subsequent pulls drain the queue
//!   and then terminate with `None`.
//!
//! The queue is the only suspension point on the ingestion side: the
//! consumer awaits data, the producer is never throttled.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// FIFO buffer of byte chunks shared between a producer and one consumer.
///
/// Designed to be wrapped in `Arc` and shared between the caller's task and
/// the upload controller task. All state lives behind a `std::sync::Mutex`
/// with short critical sections; suspension is signalled via [`Notify`].
#[derive(Debug, Default)]
pub struct ByteQueue {
    state: Mutex<QueueState>,
    data_ready: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    buffers: VecDeque<Bytes>,
    buffered: u64,
    finished: bool,
}

impl ByteQueue {
    /// Creates an empty queue with the producer still active.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a buffer to the back of the queue. Never blocks.
    ///
    /// Buffers pushed after [`finish`](Self::finish) are dropped with a
    /// warning; the producer contract is write-then-finish.
    pub fn push(&self, chunk: Bytes) {
        let mut state = self.lock_state();
        if state.finished {
            warn!(
                len = chunk.len(),
                "buffer pushed after producer finished; dropping"
            );
            return;
        }
        state.buffered += chunk.len() as u64;
        state.buffers.push_back(chunk);
        drop(state);
        self.data_ready.notify_one();
    }

    /// Marks the producer as finished. Pending pulls wake up and drain.
    pub fn finish(&self) {
        let mut state = self.lock_state();
        if state.finished {
            return;
        }
        state.finished = true;
        debug!(buffered = state.buffered, "producer finished");
        drop(state);
        self.data_ready.notify_one();
    }

    /// Returns whether the producer has signalled completion.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.lock_state().finished
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered_bytes(&self) -> u64 {
        self.lock_state().buffered
    }

    /// Re-injects buffers at the front of the queue, preserving their order.
    ///
    /// Used by reconciliation to resend an unacknowledged suffix without
    /// asking the producer for it again.
    pub fn requeue_front(&self, buffers: Vec<Bytes>) {
        let mut state = self.lock_state();
        for chunk in buffers.into_iter().rev() {
            state.buffered += chunk.len() as u64;
            state.buffers.push_front(chunk);
        }
        drop(state);
        self.data_ready.notify_one();
    }

    /// Drops all buffered data. Used on cancellation to release memory.
    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.buffers.clear();
        state.buffered = 0;
        state.finished = true;
        drop(state);
        self.data_ready.notify_one();
    }

    /// Pulls the next buffer, yielding at most `max` bytes.
    ///
    /// If the buffer at the head of the queue is larger than `max`, it is
    /// split: the first `max` bytes are returned and the remainder stays
    /// queued. Suspends while the queue is empty and the producer has not
    /// finished. Returns `None` once the producer has finished and the queue
    /// is drained.
    pub async fn pull(&self, max: u64) -> Option<Bytes> {
        loop {
            {
                let mut state = self.lock_state();
                if let Some(mut head) = state.buffers.pop_front() {
                    let take = usize::try_from(max).unwrap_or(usize::MAX).min(head.len());
                    if take < head.len() {
                        let front = head.split_to(take);
                        state.buffers.push_front(head);
                        state.buffered -= front.len() as u64;
                        return Some(front);
                    }
                    state.buffered -= head.len() as u64;
                    return Some(head);
                }
                if state.finished {
                    return None;
                }
            }
            // notify_one stores a permit, so a push racing with this await
            // cannot be missed; spurious wakeups just re-check the state.
            self.data_ready.notified().await;
        }
    }

    /// Waits until the queue holds data or the producer finishes, without
    /// consuming anything.
    ///
    /// Returns `true` when at least one buffer is available and `false` when
    /// the producer finished with the queue drained.
    pub async fn wait_for_data(&self) -> bool {
        loop {
            {
                let state = self.lock_state();
                if !state.buffers.is_empty() {
                    return true;
                }
                if state.finished {
                    return false;
                }
            }
            self.data_ready.notified().await;
        }
    }

    /// Discards up to `count` bytes from the front of the queue, suspending
    /// for more data as needed. Returns the number of bytes actually
    /// discarded, which is smaller than `count` only if the producer
    /// finished first.
    pub async fn discard(&self, count: u64) -> u64 {
        let mut discarded = 0u64;
        while discarded < count {
            match self.pull(count - discarded).await {
                Some(chunk) => discarded += chunk.len() as u64,
                None => break,
            }
        }
        discarded
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
