//! Per-stream state.

use crate::codec::StreamId;
use crate::error::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stream state (RFC 9113 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is open (can send and receive).
    Open,
    /// Half-closed (local), END_STREAM sent.
    HalfClosedLocal,
    /// Half-closed (remote), peer sent END_STREAM.
    HalfClosedRemote,
    /// Stream is closed.
    Closed,
}

/// State for one HTTP/2 stream.
///
/// Shared between the connection's event loop and application code, so the
/// writable flag is an atomic and the exception slot sits behind a mutex.
/// The writable flag only ever transitions true to false.
#[derive(Debug)]
pub struct StreamChannel {
    id: StreamId,
    writable: AtomicBool,
    sent_end: AtomicBool,
    recv_end: AtomicBool,
    reset: AtomicBool,
    exception: Mutex<Option<Error>>,
}

impl StreamChannel {
    /// Create channel state for a freshly opened stream.
    pub fn new(id: StreamId) -> Self {
        Self {
            id,
            writable: AtomicBool::new(true),
            sent_end: AtomicBool::new(false),
            recv_end: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            exception: Mutex::new(None),
        }
    }

    /// The stream identifier.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Whether HEADERS/DATA may still be emitted on this stream.
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Flip the writable flag to false. One-way.
    pub fn set_unwritable(&self) {
        self.writable.store(false, Ordering::Release);
    }

    /// Record that END_STREAM was sent. The stream stops being writable.
    pub fn mark_sent_end(&self) {
        self.sent_end.store(true, Ordering::Release);
        self.set_unwritable();
    }

    /// Record that the peer's END_STREAM was observed.
    pub fn mark_recv_end(&self) {
        self.recv_end.store(true, Ordering::Release);
    }

    /// Record a RST_STREAM in either direction.
    pub fn mark_reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.set_unwritable();
    }

    /// Whether END_STREAM was sent locally.
    pub fn sent_end_stream(&self) -> bool {
        self.sent_end.load(Ordering::Acquire)
    }

    /// Whether the peer's END_STREAM was observed.
    pub fn recv_end_stream(&self) -> bool {
        self.recv_end.load(Ordering::Acquire)
    }

    /// Current state, derived from the direction flags.
    pub fn state(&self) -> StreamState {
        if self.reset.load(Ordering::Acquire) {
            return StreamState::Closed;
        }
        match (self.sent_end_stream(), self.recv_end_stream()) {
            (true, true) => StreamState::Closed,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (false, false) => StreamState::Open,
        }
    }

    /// Record an asynchronous shutdown so application code can observe it.
    /// The first recorded exception sticks.
    pub fn record_exception(&self, error: Error) {
        let mut slot = self.exception.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// The recorded exception, if any.
    pub fn exception(&self) -> Option<Error> {
        self.exception.lock().clone()
    }
}
