//! Frame codec boundary.
//!
//! The exchange engine does not implement HTTP/2 byte framing or HPACK; it
//! drives an external frame codec through the [`FrameCodec`] trait and
//! consumes the decoded frames the codec surfaces as [`CodecEvent`]s.
//! Header blocks cross this boundary already decoded into
//! [`HeaderField`] lists.

mod error;
mod settings;
mod types;

pub use error::ErrorCode;
pub use settings::{
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, Http2Settings, MAX_FRAME_SIZE_LIMIT,
};
pub use types::{FileRegion, HeaderField, StreamId};

use bytes::Bytes;
use std::io;

/// Events produced by the frame codec.
#[derive(Debug)]
pub enum CodecEvent {
    /// Settings exchange finished; the connection is ready for streams.
    Ready,
    /// Received a HEADERS block for a stream, HPACK-decoded.
    Headers {
        stream_id: StreamId,
        fields: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Received data for a stream.
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// Stream was reset by the peer.
    StreamReset {
        stream_id: StreamId,
        code: ErrorCode,
    },
    /// Peer sent GOAWAY.
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
    },
    /// Flow-control window for a stream (or the whole connection, when the
    /// id is connection-level) was replenished; suspended sends may resume.
    WindowAvailable { stream_id: StreamId },
    /// The transport went inactive.
    Closed,
    /// Decoder or transport failure.
    Error(io::Error),
}

/// The underlying HTTP/2 frame codec.
///
/// One instance serves one connection; all calls happen on the connection's
/// event loop. `send_data` may accept fewer bytes than offered when the
/// flow-control window is exhausted; the END_STREAM flag only applies when
/// the final byte was accepted, and the caller retries the remainder after
/// a [`CodecEvent::WindowAvailable`].
pub trait FrameCodec {
    /// Configure the initial SETTINGS advertised to the peer. Called once
    /// when the connection engine takes ownership, before any stream opens.
    fn apply_settings(&mut self, settings: &Http2Settings);

    /// Write a HEADERS frame carrying the given fields.
    fn send_headers(
        &mut self,
        stream_id: StreamId,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> io::Result<()>;

    /// Write DATA. Returns the number of bytes the codec accepted.
    fn send_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool)
    -> io::Result<usize>;

    /// Hand a file region to the codec for a zero-copy transfer.
    fn send_file_region(
        &mut self,
        stream_id: StreamId,
        region: &FileRegion,
        end_stream: bool,
    ) -> io::Result<()>;

    /// Write RST_STREAM with the given code.
    fn send_rst_stream(&mut self, stream_id: StreamId, code: ErrorCode) -> io::Result<()>;

    /// Write GOAWAY.
    fn send_goaway(
        &mut self,
        last_stream_id: StreamId,
        code: ErrorCode,
        debug_data: &[u8],
    ) -> io::Result<()>;

    /// Drain pending inbound events.
    fn poll_events(&mut self) -> Vec<CodecEvent>;

    /// Replenish the inbound flow-control window after the application
    /// consumed `bytes` of a stream's data.
    fn release_capacity(&mut self, stream_id: StreamId, bytes: usize);

    /// Peer's maximum frame size.
    fn max_frame_size(&self) -> u32;

    /// Whether the connection runs over TLS.
    fn is_tls(&self) -> bool;
}
