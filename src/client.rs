//! Client side of the exchange.
//!
//! [`ClientConnection`] multiplexes requests over one HTTP/2 connection.
//! `request` encodes and sends immediately and hands back a
//! [`ResponseHandle`]; `poll` drives the codec, fulfills response promises
//! from inbound HEADERS, feeds DATA into bounded body sources, and
//! translates RST_STREAM/GOAWAY into exceptional completions.

use crate::body::Body;
use crate::channel::{BodySink, Completion, body_channel};
use crate::codec::{CodecEvent, ErrorCode, FrameCodec, HeaderField, StreamId};
use crate::config::ConnectionOptions;
use crate::dispatch::{self, BodyPump};
use crate::error::{ConnectionException, Error, ShutdownHint, StreamException};
use crate::headers;
use crate::message::{Method, Request, Response};
use crate::stream::{StreamChannel, StreamState};
use ahash::AHashMap;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// The caller's view of one in-flight request.
#[derive(Debug)]
pub struct ResponseHandle {
    /// Stream carrying the exchange.
    pub stream_id: StreamId,
    /// Resolves with the response head (and body source) or the failure.
    pub response: Completion<Result<Response, Error>>,
    /// Resolves true when the connection must shut down, false when the
    /// stream closed cleanly.
    pub complete: Completion<bool>,
}

struct ClientStream {
    channel: Arc<StreamChannel>,
    response: Completion<Result<Response, Error>>,
    complete: Completion<bool>,
    /// Feeds the inbound response body once HEADERS arrived.
    sink: Option<BodySink>,
    /// Remaining outbound request body.
    pump: Option<BodyPump>,
}

impl ClientStream {
    fn is_finished(&self) -> bool {
        self.channel.state() == StreamState::Closed && self.pump.is_none()
    }
}

/// One HTTP/2 client connection.
pub struct ClientConnection<C: FrameCodec> {
    codec: C,
    options: ConnectionOptions,
    streams: AHashMap<u32, ClientStream>,
    /// Next stream ID to use (clients use odd numbers).
    next_stream_id: u32,
    sent_goaway: bool,
    remote_goaway: Option<(StreamId, ErrorCode)>,
    closed: bool,
    last_activity: Instant,
}

impl<C: FrameCodec> ClientConnection<C> {
    /// Create a connection with default options.
    pub fn new(codec: C) -> Self {
        Self::with_options(codec, ConnectionOptions::default())
    }

    /// Create a connection with the given options.
    pub fn with_options(mut codec: C, options: ConnectionOptions) -> Self {
        codec.apply_settings(&options.http2_settings);
        Self {
            codec,
            options,
            streams: AHashMap::new(),
            next_stream_id: 1,
            sent_goaway: false,
            remote_goaway: None,
            closed: false,
            last_activity: Instant::now(),
        }
    }

    /// Whether the connection can open new streams.
    pub fn is_open(&self) -> bool {
        !self.closed && !self.sent_goaway && self.remote_goaway.is_none()
    }

    /// Whether a GOAWAY was seen or sent and streams are draining.
    pub fn is_draining(&self) -> bool {
        !self.closed && (self.sent_goaway || self.remote_goaway.is_some())
    }

    /// Whether the connection is fully closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of in-flight streams.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// The underlying codec.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Mutable access to the underlying codec.
    pub fn codec_mut(&mut self) -> &mut C {
        &mut self.codec
    }

    /// Send a request and return the handle its response resolves through.
    ///
    /// Header validation failures surface here, before any frame is
    /// emitted. A connection that saw or sent GOAWAY refuses new streams.
    pub fn request(&mut self, mut request: Request) -> Result<ResponseHandle, Error> {
        if self.closed {
            return Err(ConnectionException::new(ErrorCode::NoError, "connection closed").into());
        }
        if let Some((_, code)) = self.remote_goaway {
            return Err(ConnectionException::new(code, "connection is going away").into());
        }
        if self.sent_goaway {
            return Err(
                ConnectionException::new(ErrorCode::NoError, "connection is draining").into(),
            );
        }

        if request.method == Method::Trace && !matches!(request.body, Body::Empty | Body::Omitted)
        {
            warn!("TRACE request must not carry a body, dropping it");
            request.body = Body::Empty;
        }

        let fields = headers::encode_request_headers(&request)?;

        let stream_id = StreamId::new(self.next_stream_id);
        self.next_stream_id += 2;

        let channel = Arc::new(StreamChannel::new(stream_id));
        if let Some(hook) = &self.options.stream_initializer {
            hook(&channel);
        }

        let chunk_size = request.chunk_size.unwrap_or(self.options.chunk_size);
        let pump = dispatch::send_message(
            &mut self.codec,
            &channel,
            fields,
            request.body,
            Some(chunk_size),
            None,
        )?;
        self.touch();

        let response = Completion::new();
        let complete = Completion::new();
        self.streams.insert(
            stream_id.value(),
            ClientStream {
                channel,
                response: response.clone(),
                complete: complete.clone(),
                sink: None,
                pump,
            },
        );

        Ok(ResponseHandle {
            stream_id,
            response,
            complete,
        })
    }

    /// Drive the connection: drain codec events, resume suspended bodies,
    /// replenish consumed window, enforce the idle timeout.
    pub fn poll(&mut self) {
        let events = self.codec.poll_events();
        if !events.is_empty() {
            self.touch();
        }
        for event in events {
            self.handle_event(event);
        }
        self.pump_bodies();
        self.release_capacity();
        self.check_idle();
    }

    /// Close the connection: GOAWAY(NO_ERROR) if none was sent, in-flight
    /// streams receive a ConnectionException.
    pub fn close(&mut self) {
        self.shutdown(ConnectionException::new(
            ErrorCode::NoError,
            "connection closed locally",
        ));
    }

    /// Shut the connection down with the given exception. A second GOAWAY
    /// send is a no-op. A graceful hint leaves in-flight streams draining.
    pub fn shutdown(&mut self, exception: ConnectionException) {
        if !self.sent_goaway {
            let _ = self
                .codec
                .send_goaway(StreamId::CONNECTION, exception.code, b"");
            self.sent_goaway = true;
        }
        match exception.hint {
            ShutdownHint::Graceful => {}
            ShutdownHint::Hard => {
                self.fail_all(exception);
                self.closed = true;
            }
        }
    }

    /// Cancel one stream: RST_STREAM(CANCEL) if still open, inbound body
    /// source closed, pending promise failed.
    pub fn close_stream(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.remove(&stream_id.value()) else {
            return;
        };
        if stream.channel.state() != StreamState::Closed {
            let _ = self.codec.send_rst_stream(stream_id, ErrorCode::Cancel);
        }
        stream.channel.mark_reset();
        if let Some(sink) = &stream.sink {
            sink.close();
        }
        let exception = StreamException::new(ErrorCode::Cancel, "stream cancelled locally")
            .on_stream(stream_id);
        stream.channel.record_exception(Error::Stream(exception.clone()));
        stream.response.complete(Err(Error::Stream(exception)));
        stream.complete.complete(false);
    }

    fn handle_event(&mut self, event: CodecEvent) {
        match event {
            CodecEvent::Ready => debug!("connection ready"),
            CodecEvent::Headers {
                stream_id,
                fields,
                end_stream,
            } => self.on_headers(stream_id, fields, end_stream),
            CodecEvent::Data {
                stream_id,
                data,
                end_stream,
            } => self.on_data(stream_id, data, end_stream),
            CodecEvent::StreamReset { stream_id, code } => self.on_reset(stream_id, code),
            CodecEvent::GoAway {
                last_stream_id,
                code,
            } => self.on_goaway(last_stream_id, code),
            // Suspended bodies resume in the pump pass below.
            CodecEvent::WindowAvailable { .. } => {}
            CodecEvent::Closed => {
                info!("transport closed");
                self.fail_all(ConnectionException::new(
                    ErrorCode::NoError,
                    "channel inactive",
                ));
                self.closed = true;
            }
            CodecEvent::Error(e) => {
                error!("transport error: {}", e);
                self.fail_all(ConnectionException::new(
                    ErrorCode::InternalError,
                    e.to_string(),
                ));
                self.closed = true;
            }
        }
    }

    fn on_headers(&mut self, stream_id: StreamId, fields: Vec<HeaderField>, end_stream: bool) {
        if stream_id.is_server_initiated() {
            error!(
                stream = stream_id.value(),
                "server push is not supported, resetting stream"
            );
            let _ = self
                .codec
                .send_rst_stream(stream_id, ErrorCode::RefusedStream);
            return;
        }

        let Some(mut stream) = self.streams.remove(&stream_id.value()) else {
            debug!(stream = stream_id.value(), "headers for unknown stream");
            return;
        };

        if stream.sink.is_some() {
            // A second HEADERS block is trailers, which are not surfaced.
            if end_stream {
                stream.channel.mark_recv_end();
                if let Some(sink) = &stream.sink {
                    sink.close();
                }
                stream.complete.complete(false);
            }
            if !stream.is_finished() {
                self.streams.insert(stream_id.value(), stream);
            }
            return;
        }

        match headers::decode_response_head(&fields) {
            Ok((status, response_headers)) => {
                let body = if end_stream {
                    Body::Empty
                } else {
                    let (sink, source) = body_channel(self.options.response_buffer_size);
                    stream.sink = Some(sink);
                    Body::Source(source)
                };
                let response = Response {
                    status: Some(status),
                    headers: response_headers,
                    body,
                    complete: Some(stream.complete.clone()),
                };
                if end_stream {
                    stream.channel.mark_recv_end();
                    stream.complete.complete(false);
                }
                stream.response.complete(Ok(response));
                if !stream.is_finished() {
                    self.streams.insert(stream_id.value(), stream);
                }
            }
            Err(e) => {
                let exception = match e {
                    Error::Stream(se) => se,
                    other => StreamException::new(ErrorCode::ProtocolError, other.to_string()),
                };
                let failure = dispatch::fail_stream(&mut self.codec, &stream.channel, exception);
                stream.channel.record_exception(failure.clone());
                stream.response.complete(Err(failure));
                stream.complete.complete(true);
            }
        }
    }

    fn on_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) {
        let Some(mut stream) = self.streams.remove(&stream_id.value()) else {
            debug!(stream = stream_id.value(), "data for unknown stream");
            return;
        };

        if let Some(sink) = &stream.sink {
            let chunk = if self.options.raw_stream {
                data
            } else {
                Bytes::from(data.to_vec())
            };
            sink.push(chunk);
        }
        if end_stream {
            stream.channel.mark_recv_end();
            if let Some(sink) = &stream.sink {
                sink.close();
            }
            stream.complete.complete(false);
        }
        if !stream.is_finished() {
            self.streams.insert(stream_id.value(), stream);
        }
    }

    fn on_reset(&mut self, stream_id: StreamId, code: ErrorCode) {
        if code == ErrorCode::NoError {
            info!(stream = stream_id.value(), "stream reset by peer");
        } else {
            warn!(stream = stream_id.value(), code = %code, "stream reset by peer");
        }
        if let Some(handler) = &self.options.reset_stream_handler {
            handler(stream_id, code);
        }

        let Some(stream) = self.streams.remove(&stream_id.value()) else {
            return;
        };
        stream.channel.mark_reset();
        let exception =
            StreamException::new(code, "stream reset by peer").on_stream(stream_id);
        if let Some(sink) = &stream.sink {
            sink.fail(Error::Stream(exception.clone()));
        }
        stream.channel.record_exception(Error::Stream(exception.clone()));
        stream.response.complete(Err(Error::Stream(exception)));
        stream.complete.complete(false);
    }

    fn on_goaway(&mut self, last_stream_id: StreamId, code: ErrorCode) {
        if code == ErrorCode::NoError {
            info!(last_stream = last_stream_id.value(), "received GOAWAY");
        } else {
            warn!(last_stream = last_stream_id.value(), code = %code, "received GOAWAY");
        }
        self.remote_goaway = Some((last_stream_id, code));
        if let Some(handler) = &self.options.conn_goaway_handler {
            handler(last_stream_id, code);
        }

        // Streams above the advertised last id will never be processed;
        // streams at or below it keep draining.
        let refused: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id.value())
            .collect();
        for id in refused {
            let stream_id = StreamId::new(id);
            if let Some(handler) = &self.options.stream_goaway_handler {
                handler(stream_id, code);
            }
            let stream = self.streams.remove(&id).expect("stream id just listed");
            stream.channel.set_unwritable();
            let exception = ConnectionException::new(code, "connection going away");
            if let Some(sink) = &stream.sink {
                sink.fail(Error::Connection(exception.clone()));
            }
            stream
                .channel
                .record_exception(Error::Connection(exception.clone()));
            stream.response.complete(Err(Error::Connection(exception)));
            stream.complete.complete(true);
        }
    }

    fn pump_bodies(&mut self) {
        let codec = &mut self.codec;
        let mut failures: Vec<(u32, Error)> = Vec::new();

        for (id, stream) in self.streams.iter_mut() {
            if let Some(pump) = &mut stream.pump {
                match pump.pump(codec) {
                    Ok(true) => stream.pump = None,
                    Ok(false) => {}
                    Err(e) => {
                        stream.pump = None;
                        failures.push((*id, e));
                    }
                }
            }
        }

        for (id, e) in failures {
            if let Some(stream) = self.streams.remove(&id) {
                stream.channel.record_exception(e.clone());
                if let Some(sink) = &stream.sink {
                    sink.fail(e.clone());
                }
                stream.response.complete(Err(e));
                stream.complete.complete(false);
            }
        }

        self.streams.retain(|_, stream| !stream.is_finished());
    }

    fn release_capacity(&mut self) {
        let codec = &mut self.codec;
        for (id, stream) in self.streams.iter() {
            if let Some(sink) = &stream.sink {
                let consumed = sink.take_consumed();
                if consumed > 0 {
                    codec.release_capacity(StreamId::new(*id), consumed);
                }
            }
        }
    }

    fn check_idle(&mut self) {
        if self.closed || self.options.idle_timeout.is_zero() {
            return;
        }
        if self.last_activity.elapsed() >= self.options.idle_timeout {
            info!("idle timeout, closing connection");
            self.close();
        }
    }

    fn fail_all(&mut self, exception: ConnectionException) {
        for (_, stream) in self.streams.drain() {
            stream.channel.set_unwritable();
            if let Some(sink) = &stream.sink {
                sink.fail(Error::Connection(exception.clone()));
            }
            stream
                .channel
                .record_exception(Error::Connection(exception.clone()));
            stream
                .response
                .complete(Err(Error::Connection(exception.clone())));
            stream.complete.complete(true);
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl<C: FrameCodec> std::fmt::Debug for ClientConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("streams", &self.streams.len())
            .field("next_stream_id", &self.next_stream_id)
            .field("sent_goaway", &self.sent_goaway)
            .field("closed", &self.closed)
            .finish()
    }
}
