//! Server side of the exchange.
//!
//! [`ServerConnection`] assembles inbound requests from HEADERS + DATA,
//! hands them to the user [`Handler`] (inline or on the configured
//! executor), and pipes the resulting response back out through the body
//! dispatcher. Responses for streams that stopped being writable are
//! dropped silently.

use crate::body::Body;
use crate::channel::{BodySink, body_channel};
use crate::codec::{CodecEvent, ErrorCode, FrameCodec, HeaderField, StreamId};
use crate::config::ConnectionOptions;
use crate::dispatch::{self, BodyPump};
use crate::error::{ConnectionException, Error, ShutdownHint, StreamException};
use crate::executor::Task;
use crate::headers;
use crate::message::{Headers, Method, Request, Response};
use crate::stream::{StreamChannel, StreamState};
use ahash::AHashMap;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const SERVER_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Produces one response per inbound request.
///
/// Handlers run inline on the connection's event loop unless an executor is
/// configured. An inline handler must not block on an unfinished request
/// body; the DATA feeding it arrives on the same loop. Put body-consuming
/// handlers on an executor.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(Request) -> Response + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> Response {
        self(request)
    }
}

struct ServerStream {
    channel: Arc<StreamChannel>,
    /// Feeds the inbound request body.
    sink: Option<BodySink>,
    is_head: bool,
    /// Remaining outbound response body.
    pump: Option<BodyPump>,
    responded: bool,
}

impl ServerStream {
    fn is_finished(&self) -> bool {
        self.responded
            && self.pump.is_none()
            && self.channel.state() == StreamState::Closed
    }
}

/// One HTTP/2 server connection.
pub struct ServerConnection<C: FrameCodec> {
    codec: C,
    options: ConnectionOptions,
    handler: Arc<dyn Handler>,
    streams: AHashMap<u32, ServerStream>,
    response_tx: Sender<(StreamId, Result<Response, Error>)>,
    response_rx: Receiver<(StreamId, Result<Response, Error>)>,
    /// Set once a local GOAWAY went out, with its last-stream-id.
    goaway_last: Option<StreamId>,
    /// Peer-initiated streams still accepted past the GOAWAY.
    extra_streams_left: u32,
    remote_goaway: bool,
    /// Highest stream ID received from the client.
    last_peer_stream: u32,
    closed: bool,
    last_activity: Instant,
}

impl<C: FrameCodec> ServerConnection<C> {
    /// Create a connection with default options.
    pub fn new(codec: C, handler: impl Handler) -> Self {
        Self::with_options(codec, handler, ConnectionOptions::default())
    }

    /// Create a connection with the given options.
    pub fn with_options(mut codec: C, handler: impl Handler, options: ConnectionOptions) -> Self {
        codec.apply_settings(&options.http2_settings);
        let (response_tx, response_rx) = unbounded();
        Self {
            codec,
            options,
            handler: Arc::new(handler),
            streams: AHashMap::new(),
            response_tx,
            response_rx,
            goaway_last: None,
            extra_streams_left: 0,
            remote_goaway: false,
            last_peer_stream: 0,
            closed: false,
            last_activity: Instant::now(),
        }
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

    /// Drive the connection: drain codec events, write finished handler
    /// responses, resume suspended bodies, replenish consumed window,
    /// enforce the idle timeout.
    pub fn poll(&mut self) {
        let events = self.codec.poll_events();
        if !events.is_empty() {
            self.touch();
        }
        for event in events {
            if self.closed {
                break;
            }
            self.handle_event(event);
        }

        while let Ok((stream_id, result)) = self.response_rx.try_recv() {
            self.write_response(stream_id, result);
        }

        self.pump_bodies();
        self.release_capacity();
        self.drop_finished_streams();
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

    /// Shut the connection down. A second GOAWAY send is a no-op. A
    /// graceful hint drains open streams and accepts late peer streams; a
    /// hard hint closes after the GOAWAY is flushed.
    pub fn shutdown(&mut self, exception: ConnectionException) {
        if self.goaway_last.is_none() {
            let last = StreamId::new(self.last_peer_stream);
            let _ = self.codec.send_goaway(last, exception.code, b"");
            self.goaway_last = Some(last);
            self.extra_streams_left = match exception.hint {
                ShutdownHint::Graceful => u32::MAX,
                ShutdownHint::Hard => self.options.extra_stream_ids,
            };
        }
        if exception.hint == ShutdownHint::Hard {
            for (_, stream) in self.streams.drain() {
                stream.channel.set_unwritable();
                if let Some(sink) = &stream.sink {
                    sink.fail(Error::Connection(exception.clone()));
                }
                stream
                    .channel
                    .record_exception(Error::Connection(exception.clone()));
            }
            self.closed = true;
        }
    }

    fn handle_event(&mut self, event: CodecEvent) {
        match event {
            CodecEvent::Ready => debug!("connection ready"),
            CodecEvent::Headers {
                stream_id,
                fields,
                end_stream,
            } => self.on_request_headers(stream_id, fields, end_stream),
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

    fn on_request_headers(
        &mut self,
        stream_id: StreamId,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) {
        if !stream_id.is_client_initiated() {
            self.shutdown(ConnectionException::new(
                ErrorCode::ProtocolError,
                "client used an even stream id",
            ));
            return;
        }
        if stream_id.value() <= self.last_peer_stream {
            self.shutdown(ConnectionException::new(
                ErrorCode::ProtocolError,
                "stream id not greater than previous",
            ));
            return;
        }

        if let Some(last) = self.goaway_last
            && stream_id.value() > last.value()
        {
            if self.extra_streams_left == 0 {
                debug!(stream = stream_id.value(), "refusing post-GOAWAY stream");
                let _ = self
                    .codec
                    .send_rst_stream(stream_id, ErrorCode::RefusedStream);
                return;
            }
            self.extra_streams_left -= 1;
        }

        self.last_peer_stream = stream_id.value();

        let channel = Arc::new(StreamChannel::new(stream_id));
        if let Some(hook) = &self.options.stream_initializer {
            hook(&channel);
        }

        let head = match headers::decode_request_head(&fields) {
            Ok(head) => head,
            Err(e) => {
                let exception = match e {
                    Error::Stream(se) => se,
                    other => StreamException::new(ErrorCode::ProtocolError, other.to_string()),
                };
                let _ = dispatch::fail_stream(&mut self.codec, &channel, exception);
                return;
            }
        };

        let (sink, source) = body_channel(self.options.request_buffer_size);
        if end_stream {
            channel.mark_recv_end();
            sink.close();
        }

        let is_head = head.method == Method::Head;
        let request = Request {
            method: head.method,
            scheme: head.scheme,
            authority: head.authority,
            uri: head.uri,
            query_string: head.query_string,
            headers: head.headers,
            body: Body::Source(source),
            chunk_size: None,
            stream: Some(channel.clone()),
            trailers: None,
        };

        self.streams.insert(
            stream_id.value(),
            ServerStream {
                channel,
                sink: if end_stream { None } else { Some(sink) },
                is_head,
                pump: None,
                responded: false,
            },
        );

        self.dispatch(stream_id, request);
    }

    fn dispatch(&mut self, stream_id: StreamId, request: Request) {
        if let Some(executor) = self.options.executor.clone() {
            let handler = self.handler.clone();
            let tx = self.response_tx.clone();
            let task: Task = Box::new(move || {
                let result = run_handler(&*handler, request);
                let _ = tx.send((stream_id, result));
            });
            if let Err(task) = executor.execute(task) {
                drop(task);
                warn!(stream = stream_id.value(), "executor rejected request");
                let response = match &self.options.rejected_handler {
                    Some(handler) => handler(),
                    None => Response::new(503).body("Service Unavailable"),
                };
                self.write_response(stream_id, Ok(response));
            }
        } else {
            let handler = self.handler.clone();
            let result = run_handler(&*handler, request);
            self.write_response(stream_id, result);
        }
    }

    fn write_response(&mut self, stream_id: StreamId, result: Result<Response, Error>) {
        let Some(mut stream) = self.streams.remove(&stream_id.value()) else {
            debug!(stream = stream_id.value(), "dropping response for vanished stream");
            return;
        };
        if !stream.channel.is_writable() {
            debug!(
                stream = stream_id.value(),
                "dropping response for unwritable stream"
            );
            return;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(stream = stream_id.value(), "handler failed: {}", e);
                self.error_response(&e)
            }
        };

        if let Err(e) = self.try_send(&mut stream, response) {
            warn!(
                stream = stream_id.value(),
                "sending response failed: {}, retrying with error handler output", e
            );
            let fallback = self.error_response(&e);
            if stream.channel.is_writable() {
                if let Err(e2) = self.try_send(&mut stream, fallback) {
                    error!(stream = stream_id.value(), "error response failed: {}", e2);
                    stream.channel.record_exception(e2);
                }
            } else {
                stream.channel.record_exception(e);
            }
        }

        if stream.is_finished() {
            if let Some(sink) = &stream.sink {
                let consumed = sink.take_consumed();
                if consumed > 0 {
                    self.codec.release_capacity(stream_id, consumed);
                }
            }
        } else {
            self.streams.insert(stream_id.value(), stream);
        }
    }

    fn try_send(&mut self, stream: &mut ServerStream, mut response: Response) -> Result<(), Error> {
        inject_default_headers(&mut response.headers);

        if stream.is_head && !matches!(response.body, Body::Empty | Body::Omitted) {
            warn!(
                stream = stream.channel.id().value(),
                "dropping body on HEAD response"
            );
            response.body = Body::Omitted;
        }

        let status = response.status_or_default();
        let fields = headers::encode_response_headers(&response)?;
        let pump = dispatch::send_message(
            &mut self.codec,
            &stream.channel,
            fields,
            response.body,
            Some(self.options.chunk_size),
            Some(status),
        )?;
        stream.pump = pump;
        stream.responded = true;
        Ok(())
    }

    fn error_response(&self, error: &Error) -> Response {
        match &self.options.error_handler {
            Some(handler) => handler(error),
            None => Response::new(500).body("Internal Server Error"),
        }
    }

    fn on_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) {
        let Some(stream) = self.streams.get(&stream_id.value()) else {
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
        }
    }

    fn on_reset(&mut self, stream_id: StreamId, code: ErrorCode) {
        if code == ErrorCode::NoError {
            info!(stream = stream_id.value(), "stream reset by client");
        } else {
            warn!(stream = stream_id.value(), code = %code, "stream reset by client");
        }
        if let Some(handler) = &self.options.reset_stream_handler {
            handler(stream_id, code);
        }

        let Some(stream) = self.streams.remove(&stream_id.value()) else {
            return;
        };
        stream.channel.mark_reset();
        let exception = StreamException::new(code, "stream reset by client").on_stream(stream_id);
        if let Some(sink) = &stream.sink {
            sink.fail(Error::Stream(exception.clone()));
        }
        stream.channel.record_exception(Error::Stream(exception));
    }

    fn on_goaway(&mut self, last_stream_id: StreamId, code: ErrorCode) {
        if code == ErrorCode::NoError {
            info!(last_stream = last_stream_id.value(), "received GOAWAY");
        } else {
            warn!(last_stream = last_stream_id.value(), code = %code, "received GOAWAY");
        }
        self.remote_goaway = true;
        if let Some(handler) = &self.options.conn_goaway_handler {
            handler(last_stream_id, code);
        }

        // Open streams keep draining; handlers observe the shutdown through
        // the per-request exception slot.
        let exception = ConnectionException::new(code, "connection going away");
        for (id, stream) in self.streams.iter() {
            if let Some(handler) = &self.options.stream_goaway_handler {
                handler(StreamId::new(*id), code);
            }
            stream
                .channel
                .record_exception(Error::Connection(exception.clone()));
        }
    }

    fn pump_bodies(&mut self) {
        let codec = &mut self.codec;
        for (_, stream) in self.streams.iter_mut() {
            if let Some(pump) = &mut stream.pump {
                match pump.pump(codec) {
                    Ok(true) => stream.pump = None,
                    Ok(false) => {}
                    Err(e) => {
                        stream.pump = None;
                        stream.channel.record_exception(e);
                    }
                }
            }
        }
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

    fn drop_finished_streams(&mut self) {
        let finished: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            if let Some(stream) = self.streams.remove(&id)
                && let Some(sink) = &stream.sink
            {
                let consumed = sink.take_consumed();
                if consumed > 0 {
                    self.codec.release_capacity(StreamId::new(id), consumed);
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
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl<C: FrameCodec> std::fmt::Debug for ServerConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("streams", &self.streams.len())
            .field("goaway_last", &self.goaway_last)
            .field("closed", &self.closed)
            .finish()
    }
}

fn run_handler(handler: &dyn Handler, request: Request) -> Result<Response, Error> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
        Ok(response) => Ok(response),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(Error::stream(ErrorCode::InternalError, message))
        }
    }
}

/// Inject the default `server`, `date`, and `text/plain` charset headers.
fn inject_default_headers(headers: &mut Headers) {
    if !headers.contains_key("server") {
        headers.insert("server", SERVER_NAME);
    }
    if !headers.contains_key("date") {
        headers.insert("date", httpdate::fmt_http_date(std::time::SystemTime::now()));
    }
    if let Some(content_type) = headers.get("content-type")
        && content_type.eq_ignore_ascii_case("text/plain")
    {
        headers.insert("content-type", "text/plain; charset=UTF-8");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPoolExecutor;
    use crate::test_codec::{SentFrame, TestCodec};
    use std::time::Duration;

    fn request_fields(method: &str, path: &str) -> Vec<HeaderField> {
        vec![
            HeaderField::new(":method", method),
            HeaderField::new(":scheme", "https"),
            HeaderField::new(":authority", "h.example"),
            HeaderField::new(":path", path),
        ]
    }

    fn ok_handler(request: Request) -> Response {
        let _ = request;
        Response::new(200)
            .header("content-type", "text/plain")
            .body("hello")
    }

    fn sent_headers(codec: &TestCodec) -> Vec<&Vec<HeaderField>> {
        codec
            .frames
            .iter()
            .filter_map(|f| match f {
                SentFrame::Headers { fields, .. } => Some(fields),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_inline_request_response_cycle() {
        let mut conn = ServerConnection::new(TestCodec::new(), ok_handler);

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();

        let headers = sent_headers(conn.codec());
        assert_eq!(headers.len(), 1);
        let fields = headers[0];
        assert_eq!(fields[0].name_str(), Some(":status"));
        assert_eq!(fields[0].value_str(), Some("200"));
        assert!(fields.iter().any(|f| f.name == b"server"));
        assert!(fields.iter().any(|f| f.name == b"date"));
        assert!(
            fields
                .iter()
                .any(|f| f.name == b"content-type"
                    && f.value == b"text/plain; charset=UTF-8")
        );

        assert_eq!(conn.codec().data_payload(StreamId::new(1)), b"hello");
        assert_eq!(conn.active_streams(), 0);
    }

    #[test]
    fn test_head_response_omits_body() {
        let mut conn = ServerConnection::new(TestCodec::new(), ok_handler);

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("HEAD", "/"),
            end_stream: true,
        });
        conn.poll();

        let data_frames = conn
            .codec()
            .frames
            .iter()
            .filter(|f| matches!(f, SentFrame::Data { .. }))
            .count();
        assert_eq!(data_frames, 0);

        match &conn.codec().frames.last().unwrap() {
            SentFrame::Headers { fields, end_stream } => {
                assert!(end_stream);
                assert!(
                    fields
                        .iter()
                        .any(|f| f.name == b"content-type"
                            && f.value == b"text/plain; charset=UTF-8")
                );
            }
            other => panic!("expected headers frame, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_pseudo_headers_reset() {
        let mut conn = ServerConnection::new(TestCodec::new(), ok_handler);

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: vec![HeaderField::new(":method", "GET")],
            end_stream: true,
        });
        conn.poll();

        assert!(conn.codec().frames.iter().any(|f| matches!(
            f,
            SentFrame::RstStream {
                code: ErrorCode::ProtocolError,
                ..
            }
        )));
        assert_eq!(conn.active_streams(), 0);
    }

    #[test]
    fn test_handler_panic_becomes_500() {
        let mut conn = ServerConnection::new(TestCodec::new(), |_req: Request| -> Response {
            panic!("boom");
        });

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();

        let headers = sent_headers(conn.codec());
        assert_eq!(headers[0][0].value_str(), Some("500"));
    }

    #[test]
    fn test_custom_error_handler() {
        let options = ConnectionOptions::new()
            .error_handler(|_| Response::new(418).body("teapot"));
        let mut conn = ServerConnection::with_options(
            TestCodec::new(),
            |_req: Request| -> Response { panic!("boom") },
            options,
        );

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();

        let headers = sent_headers(conn.codec());
        assert_eq!(headers[0][0].value_str(), Some("418"));
    }

    #[test]
    fn test_executor_streams_request_body() {
        let executor = Arc::new(ThreadPoolExecutor::new(1, 4));
        let options = ConnectionOptions::new().executor(executor);
        let mut conn = ServerConnection::with_options(
            TestCodec::new(),
            |req: Request| -> Response {
                let body = match req.body {
                    Body::Source(source) => source.read_to_end().unwrap_or_default(),
                    _ => Vec::new(),
                };
                Response::new(200).body(body)
            },
            options,
        );

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("POST", "/echo"),
            end_stream: false,
        });
        conn.poll();

        conn.codec_mut().push_event(CodecEvent::Data {
            stream_id: StreamId::new(1),
            data: Bytes::from_static(b"echo me"),
            end_stream: true,
        });

        // The worker drains the body and queues its response; poll until
        // the response frames appear.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            conn.poll();
            if conn.codec().data_payload(StreamId::new(1)) == b"echo me" {
                break;
            }
            assert!(Instant::now() < deadline, "response never arrived");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    struct RejectingExecutor;

    impl crate::executor::Executor for RejectingExecutor {
        fn execute(&self, task: Task) -> Result<(), Task> {
            Err(task)
        }
    }

    #[test]
    fn test_executor_rejection_synthesizes_503() {
        let options = ConnectionOptions::new().executor(Arc::new(RejectingExecutor));
        let mut conn = ServerConnection::with_options(TestCodec::new(), ok_handler, options);

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();

        let headers = sent_headers(conn.codec());
        assert_eq!(headers[0][0].value_str(), Some("503"));
    }

    #[test]
    fn test_executor_rejection_uses_rejected_handler() {
        let options = ConnectionOptions::new()
            .executor(Arc::new(RejectingExecutor))
            .rejected_handler(|| Response::new(429).body("slow down"));
        let mut conn = ServerConnection::with_options(TestCodec::new(), ok_handler, options);

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();

        let headers = sent_headers(conn.codec());
        assert_eq!(headers[0][0].value_str(), Some("429"));
    }

    #[test]
    fn test_response_dropped_when_stream_reset_first() {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
        let executor = Arc::new(ThreadPoolExecutor::new(1, 4));
        let options = ConnectionOptions::new().executor(executor);
        let mut conn = ServerConnection::with_options(
            TestCodec::new(),
            move |_req: Request| -> Response {
                let _ = gate_rx.recv();
                Response::new(200).body("too late")
            },
            options,
        );

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();

        // The stream dies while the handler is still working.
        conn.codec_mut().push_event(CodecEvent::StreamReset {
            stream_id: StreamId::new(1),
            code: ErrorCode::Cancel,
        });
        conn.poll();
        assert_eq!(conn.active_streams(), 0);

        // Release the handler and wait for its worker to finish.
        gate_tx.send(()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while conn.response_rx.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        conn.poll();

        // The response was dropped: no HEADERS went out.
        assert!(sent_headers(conn.codec()).is_empty());
    }

    #[test]
    fn test_reset_records_exception_for_handler() {
        let mut conn = ServerConnection::new(TestCodec::new(), ok_handler);

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("POST", "/"),
            end_stream: false,
        });
        conn.poll();

        // Keep the stream handle before the reset removes the entry.
        let channel = conn
            .streams
            .get(&1)
            .map(|s| s.channel.clone())
            .unwrap();

        conn.codec_mut().push_event(CodecEvent::StreamReset {
            stream_id: StreamId::new(1),
            code: ErrorCode::Cancel,
        });
        conn.poll();

        assert!(!channel.is_writable());
        let exception = channel.exception().unwrap();
        assert_eq!(exception.code(), ErrorCode::Cancel);
    }

    #[test]
    fn test_goaway_records_exception_but_streams_drain() {
        let mut conn = ServerConnection::new(TestCodec::new(), ok_handler);

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("POST", "/"),
            end_stream: false,
        });
        conn.poll();
        let channel = conn.streams.get(&1).map(|s| s.channel.clone()).unwrap();

        conn.codec_mut().push_event(CodecEvent::GoAway {
            last_stream_id: StreamId::new(1),
            code: ErrorCode::NoError,
        });
        conn.poll();

        // Exception recorded, but the stream is still writable to drain.
        assert!(channel.is_writable());
        assert!(matches!(channel.exception(), Some(Error::Connection(_))));
        assert_eq!(conn.active_streams(), 1);
    }

    #[test]
    fn test_close_sends_single_goaway() {
        let mut conn = ServerConnection::new(TestCodec::new(), ok_handler);
        conn.close();
        conn.close();

        let goaways = conn
            .codec()
            .frames
            .iter()
            .filter(|f| matches!(f, SentFrame::GoAway { .. }))
            .count();
        assert_eq!(goaways, 1);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_graceful_shutdown_accepts_late_streams() {
        let mut conn = ServerConnection::new(TestCodec::new(), ok_handler);
        conn.shutdown(
            ConnectionException::new(ErrorCode::NoError, "draining").graceful(),
        );
        assert!(!conn.is_closed());

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();

        assert_eq!(sent_headers(conn.codec()).len(), 1);
    }

    #[test]
    fn test_post_goaway_streams_refused_without_budget() {
        let mut conn = ServerConnection::new(TestCodec::new(), ok_handler);
        conn.shutdown(
            ConnectionException::new(ErrorCode::NoError, "draining").graceful(),
        );
        conn.extra_streams_left = 0;

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();

        assert!(conn.codec().frames.iter().any(|f| matches!(
            f,
            SentFrame::RstStream {
                code: ErrorCode::RefusedStream,
                ..
            }
        )));
        assert!(sent_headers(conn.codec()).is_empty());
    }

    #[test]
    fn test_even_stream_id_is_connection_error() {
        let mut conn = ServerConnection::new(TestCodec::new(), ok_handler);

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(2),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();

        assert!(conn.codec().frames.iter().any(|f| matches!(
            f,
            SentFrame::GoAway {
                code: ErrorCode::ProtocolError,
                ..
            }
        )));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_send_failure_records_exception_after_retry() {
        let mut codec = TestCodec::new();
        codec.fail_sends = true;
        let mut conn = ServerConnection::new(codec, ok_handler);

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();

        // The first failure reset the stream, so the retry could not run;
        // the exception lands in the stream's slot.
        assert!(conn.codec().frames.iter().any(|f| matches!(
            f,
            SentFrame::RstStream {
                code: ErrorCode::InternalError,
                ..
            }
        )));
        let stream = conn.streams.get(&1).expect("stream entry kept");
        assert!(!stream.channel.is_writable());
        assert!(stream.channel.exception().is_some());
    }

    #[test]
    fn test_response_body_pump_resumes_after_window() {
        let mut codec = TestCodec::new();
        codec.window = 2;
        let mut conn = ServerConnection::new(codec, |_req: Request| -> Response {
            Response::new(200).body("abcdef")
        });

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("GET", "/"),
            end_stream: true,
        });
        conn.poll();
        assert_eq!(conn.codec().data_payload(StreamId::new(1)), b"ab");
        assert_eq!(conn.active_streams(), 1);

        conn.codec_mut().window = usize::MAX;
        conn.poll();
        assert_eq!(conn.codec().data_payload(StreamId::new(1)), b"abcdef");
        assert_eq!(conn.active_streams(), 0);
    }

    #[test]
    fn test_inbound_body_releases_capacity_as_handler_drains() {
        let executor = Arc::new(ThreadPoolExecutor::new(1, 4));
        let options = ConnectionOptions::new().executor(executor);
        let mut conn = ServerConnection::with_options(
            TestCodec::new(),
            |req: Request| -> Response {
                if let Body::Source(source) = req.body {
                    let _ = source.read_to_end();
                }
                Response::new(204)
            },
            options,
        );

        conn.codec_mut().push_event(CodecEvent::Headers {
            stream_id: StreamId::new(1),
            fields: request_fields("POST", "/"),
            end_stream: false,
        });
        conn.poll();
        conn.codec_mut().push_event(CodecEvent::Data {
            stream_id: StreamId::new(1),
            data: Bytes::from_static(b"0123456789"),
            end_stream: true,
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            conn.poll();
            if conn.codec().released.iter().any(|(_, n)| *n == 10) {
                break;
            }
            assert!(Instant::now() < deadline, "capacity never released");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
