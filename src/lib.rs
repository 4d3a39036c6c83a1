//! h2-exchange - HTTP/2 request/response engine over an external frame codec.
//!
//! This crate turns a framed bidirectional HTTP/2 transport into an
//! ergonomic request/response exchange. It does not implement byte framing,
//! HPACK, or TLS; those live behind the [`codec::FrameCodec`] boundary.
//! It does not use async/await or tokio: each connection is driven by
//! polling on its own event loop.
//!
//! # Features
//!
//! - Header block construction and validation (pseudo-headers, forbidden
//!   connection headers, lowercase normalization through a process-wide cache)
//! - Body dispatch over a closed sum of body shapes: contiguous, chunked,
//!   file-backed, zero-copy file regions, streaming sources
//! - Per-stream state tracking with an atomic writable flag and an
//!   exception slot observable from application code
//! - Client promise fulfillment and server handler dispatch, inline or on a
//!   worker executor
//! - Symmetric shutdown propagation: RST_STREAM for stream errors, GOAWAY
//!   with hard/graceful hints for connection errors
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `codec`: the frame codec boundary (trait, events, wire types)
//! - `headers`: HEADERS block construction and parsing
//! - `body` / `dispatch`: body shapes and their transmission strategies
//! - `stream` / `channel`: per-stream state and bounded body channels
//! - `client` / `server`: the per-connection engines

pub mod body;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod headers;
pub mod message;
pub mod server;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_codec;

// Re-export commonly used types
pub use body::{Body, ChunkedBody, FileBody};
pub use channel::{BodySink, BodySource, Completion, body_channel};
pub use client::{ClientConnection, ResponseHandle};
pub use codec::{
    CodecEvent, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, ErrorCode, FileRegion,
    FrameCodec, HeaderField, Http2Settings, MAX_FRAME_SIZE_LIMIT, StreamId,
};
pub use config::ConnectionOptions;
pub use dispatch::{BodyPump, DEFAULT_CHUNK_SIZE};
pub use error::{ConnectionException, Error, ShutdownHint, StreamException};
pub use executor::{Executor, Task, ThreadPoolExecutor};
pub use message::{Headers, Method, Request, RequestBuilder, Response};
pub use server::{Handler, ServerConnection};
pub use stream::{StreamChannel, StreamState};
