//! Body channels and single-shot completions.
//!
//! DATA payloads move between the connection's event loop and application
//! code through a bounded channel whose capacity is accounted in bytes, not
//! items. The producer side never blocks the event loop; the peer cannot
//! overrun the bound because the inbound flow-control window is only
//! replenished as the consumer drains (see `take_consumed`).

use crate::error::Error;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

struct ChannelState {
    queue: VecDeque<Bytes>,
    /// Bytes currently buffered.
    buffered: usize,
    /// Bytes drained by the consumer since the last `take_consumed`.
    consumed: usize,
    closed: bool,
    error: Option<Error>,
}

struct ChannelShared {
    state: Mutex<ChannelState>,
    readable: Condvar,
    capacity: usize,
}

/// Create a bounded body channel with `capacity` bytes of buffer.
pub fn body_channel(capacity: usize) -> (BodySink, BodySource) {
    let shared = Arc::new(ChannelShared {
        state: Mutex::new(ChannelState {
            queue: VecDeque::new(),
            buffered: 0,
            consumed: 0,
            closed: false,
            error: None,
        }),
        readable: Condvar::new(),
        capacity,
    });
    (
        BodySink {
            shared: shared.clone(),
        },
        BodySource { shared },
    )
}

/// Producer half of a body channel. Held by the connection's event loop.
pub struct BodySink {
    shared: Arc<ChannelShared>,
}

impl BodySink {
    /// Enqueue a chunk. Never blocks; backpressure is applied by withholding
    /// window replenishment once the buffer is over capacity.
    pub fn push(&self, data: Bytes) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.buffered += data.len();
        state.queue.push_back(data);
        self.shared.readable.notify_all();
    }

    /// Close the channel; the consumer sees end-of-body after draining.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        self.shared.readable.notify_all();
    }

    /// Close the channel with an error.
    pub fn fail(&self, error: Error) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            state.closed = true;
            state.error = Some(error);
        }
        self.shared.readable.notify_all();
    }

    /// Whether the buffered bytes exceed the configured capacity.
    pub fn is_over_capacity(&self) -> bool {
        let state = self.shared.state.lock();
        state.buffered >= self.shared.capacity
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Bytes drained by the consumer since the last call. The connection
    /// reports these to the codec as released flow-control capacity.
    pub fn take_consumed(&self) -> usize {
        let mut state = self.shared.state.lock();
        std::mem::take(&mut state.consumed)
    }
}

impl Drop for BodySink {
    fn drop(&mut self) {
        // The consumer must observe end-of-body once the producer is gone.
        self.close();
    }
}

impl std::fmt::Debug for BodySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BodySink")
            .field("buffered", &state.buffered)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Consumer half of a body channel.
pub struct BodySource {
    shared: Arc<ChannelShared>,
}

impl BodySource {
    /// Take the next chunk without blocking. `None` means nothing is queued
    /// right now; check [`is_closed`](Self::is_closed) to distinguish
    /// end-of-body.
    pub fn try_recv(&self) -> Option<Bytes> {
        let mut state = self.shared.state.lock();
        let chunk = state.queue.pop_front()?;
        state.buffered -= chunk.len();
        state.consumed += chunk.len();
        Some(chunk)
    }

    /// Take the next chunk, blocking until one arrives. `Ok(None)` is
    /// end-of-body; a failure recorded by the producer surfaces as `Err`.
    pub fn recv(&self) -> Result<Option<Bytes>, Error> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(chunk) = state.queue.pop_front() {
                state.buffered -= chunk.len();
                state.consumed += chunk.len();
                return Ok(Some(chunk));
            }
            if state.closed {
                return match state.error.clone() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
            self.shared.readable.wait(&mut state);
        }
    }

    /// Drain the whole body into one buffer.
    pub fn read_to_end(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv()? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Whether the producer closed the channel. Queued chunks may remain.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Whether no chunks are queued.
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().queue.is_empty()
    }
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BodySource")
            .field("buffered", &state.buffered)
            .field("closed", &state.closed)
            .finish()
    }
}

struct CompletionSlot<T> {
    done: bool,
    value: Option<T>,
}

struct CompletionShared<T> {
    slot: Mutex<CompletionSlot<T>>,
    cond: Condvar,
}

/// A single-shot completion.
///
/// The first `complete` wins; later completions are ignored and report
/// `false`. Readers either clone the value out (`peek`/`wait`) or move it
/// out once (`try_take`/`wait_take`).
pub struct Completion<T> {
    shared: Arc<CompletionShared<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    /// Create a pending completion.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(CompletionShared {
                slot: Mutex::new(CompletionSlot {
                    done: false,
                    value: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Fulfill the completion. Returns whether this call was the first.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.done {
            return false;
        }
        slot.done = true;
        slot.value = Some(value);
        self.shared.cond.notify_all();
        true
    }

    /// Whether the completion has been fulfilled.
    pub fn is_complete(&self) -> bool {
        self.shared.slot.lock().done
    }

    /// Move the value out if fulfilled and not yet taken.
    pub fn try_take(&self) -> Option<T> {
        self.shared.slot.lock().value.take()
    }

    /// Block until fulfilled, then move the value out. Single consumer.
    pub fn wait_take(&self) -> T {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                return value;
            }
            self.shared.cond.wait(&mut slot);
        }
    }

    /// Block until fulfilled or the timeout elapses, then move the value out.
    pub fn wait_take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            if self
                .shared
                .cond
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                return slot.value.take();
            }
        }
    }
}

impl<T: Clone> Completion<T> {
    /// A clone of the value, if fulfilled.
    pub fn peek(&self) -> Option<T> {
        self.shared.slot.lock().value.clone()
    }

    /// Block until fulfilled and return a clone of the value.
    pub fn wait(&self) -> T {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = slot.value.clone() {
                return value;
            }
            self.shared.cond.wait(&mut slot);
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_complete())
            .finish()
    }
}
