//! Per-connection configuration.

use crate::codec::{ErrorCode, Http2Settings, StreamId};
use crate::dispatch::DEFAULT_CHUNK_SIZE;
use crate::error::Error;
use crate::executor::Executor;
use crate::message::Response;
use crate::stream::StreamChannel;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with a connection-level GOAWAY.
pub type ConnGoAwayHandler = Arc<dyn Fn(StreamId, ErrorCode) + Send + Sync>;

/// Callback invoked per affected stream on GOAWAY or RST_STREAM.
pub type StreamEventHandler = Arc<dyn Fn(StreamId, ErrorCode) + Send + Sync>;

/// Maps a handler or send failure to the response that is written instead.
pub type ErrorHandler = Arc<dyn Fn(&Error) -> Response + Send + Sync>;

/// Produces the response for requests the executor refused.
pub type RejectedHandler = Arc<dyn Fn() -> Response + Send + Sync>;

/// Hook run for every newly opened stream.
pub type StreamInitializer = Arc<dyn Fn(&Arc<StreamChannel>) + Send + Sync>;

/// Options for one connection.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// DATA chunk size for chunked and file-backed bodies.
    pub chunk_size: usize,
    /// Buffer capacity, in bytes, for inbound request bodies.
    pub request_buffer_size: usize,
    /// Buffer capacity, in bytes, for inbound response bodies.
    pub response_buffer_size: usize,
    /// Close the connection after this much inactivity. Zero disables.
    pub idle_timeout: Duration,
    /// Forward DATA payloads as the codec delivered them instead of copying.
    pub raw_stream: bool,
    /// Initial SETTINGS handed to the codec.
    pub http2_settings: Http2Settings,
    /// Peer-initiated streams still processed after sending GOAWAY.
    pub extra_stream_ids: u32,
    /// Worker pool for user handlers. Absent runs handlers inline.
    pub executor: Option<Arc<dyn Executor>>,
    /// Maps handler failures to a response. Absent synthesizes a 500.
    pub error_handler: Option<ErrorHandler>,
    /// Response for executor-rejected requests. Absent synthesizes a 503.
    pub rejected_handler: Option<RejectedHandler>,
    /// Connection-level GOAWAY callback.
    pub conn_goaway_handler: Option<ConnGoAwayHandler>,
    /// Per-stream GOAWAY callback.
    pub stream_goaway_handler: Option<StreamEventHandler>,
    /// RST_STREAM callback.
    pub reset_stream_handler: Option<StreamEventHandler>,
    /// Hook run for each newly opened stream.
    pub stream_initializer: Option<StreamInitializer>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_buffer_size: 16_384,
            response_buffer_size: 16_384,
            idle_timeout: Duration::ZERO,
            raw_stream: false,
            http2_settings: Http2Settings::default(),
            extra_stream_ids: 0,
            executor: None,
            error_handler: None,
            rejected_handler: None,
            conn_goaway_handler: None,
            stream_goaway_handler: None,
            reset_stream_handler: None,
            stream_initializer: None,
        }
    }
}

impl ConnectionOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the DATA chunk size.
    pub fn chunk_size(mut self, value: usize) -> Self {
        self.chunk_size = value;
        self
    }

    /// Set the request body buffer capacity in bytes.
    pub fn request_buffer_size(mut self, value: usize) -> Self {
        self.request_buffer_size = value;
        self
    }

    /// Set the response body buffer capacity in bytes.
    pub fn response_buffer_size(mut self, value: usize) -> Self {
        self.response_buffer_size = value;
        self
    }

    /// Set the idle timeout. Zero disables.
    pub fn idle_timeout(mut self, value: Duration) -> Self {
        self.idle_timeout = value;
        self
    }

    /// Forward raw DATA buffers instead of copying.
    pub fn raw_stream(mut self, value: bool) -> Self {
        self.raw_stream = value;
        self
    }

    /// Set the initial HTTP/2 settings.
    pub fn http2_settings(mut self, value: Http2Settings) -> Self {
        self.http2_settings = value;
        self
    }

    /// Allow this many peer-initiated streams after a local GOAWAY.
    pub fn extra_stream_ids(mut self, value: u32) -> Self {
        self.extra_stream_ids = value;
        self
    }

    /// Run user handlers on this executor.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Map handler failures with this callback.
    pub fn error_handler(
        mut self,
        handler: impl Fn(&Error) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Answer executor-rejected requests with this callback.
    pub fn rejected_handler(mut self, handler: impl Fn() -> Response + Send + Sync + 'static) -> Self {
        self.rejected_handler = Some(Arc::new(handler));
        self
    }

    /// Observe connection-level GOAWAY frames.
    pub fn conn_goaway_handler(
        mut self,
        handler: impl Fn(StreamId, ErrorCode) + Send + Sync + 'static,
    ) -> Self {
        self.conn_goaway_handler = Some(Arc::new(handler));
        self
    }

    /// Observe GOAWAY per affected stream.
    pub fn stream_goaway_handler(
        mut self,
        handler: impl Fn(StreamId, ErrorCode) + Send + Sync + 'static,
    ) -> Self {
        self.stream_goaway_handler = Some(Arc::new(handler));
        self
    }

    /// Observe RST_STREAM frames.
    pub fn reset_stream_handler(
        mut self,
        handler: impl Fn(StreamId, ErrorCode) + Send + Sync + 'static,
    ) -> Self {
        self.reset_stream_handler = Some(Arc::new(handler));
        self
    }

    /// Run a hook for each newly opened stream.
    pub fn stream_initializer(
        mut self,
        hook: impl Fn(&Arc<StreamChannel>) + Send + Sync + 'static,
    ) -> Self {
        self.stream_initializer = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("chunk_size", &self.chunk_size)
            .field("request_buffer_size", &self.request_buffer_size)
            .field("response_buffer_size", &self.response_buffer_size)
            .field("idle_timeout", &self.idle_timeout)
            .field("raw_stream", &self.raw_stream)
            .field("extra_stream_ids", &self.extra_stream_ids)
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::default();
        assert_eq!(options.chunk_size, 16_384);
        assert_eq!(options.request_buffer_size, 16_384);
        assert_eq!(options.response_buffer_size, 16_384);
        assert_eq!(options.idle_timeout, Duration::ZERO);
        assert!(!options.raw_stream);
        assert_eq!(options.extra_stream_ids, 0);
        assert!(options.executor.is_none());
        assert!(options.error_handler.is_none());
    }

    #[test]
    fn test_builder_chained() {
        let options = ConnectionOptions::new()
            .chunk_size(8192)
            .request_buffer_size(65536)
            .idle_timeout(Duration::from_secs(30))
            .raw_stream(true)
            .extra_stream_ids(4)
            .error_handler(|_| Response::new(500));

        assert_eq!(options.chunk_size, 8192);
        assert_eq!(options.request_buffer_size, 65536);
        assert_eq!(options.idle_timeout, Duration::from_secs(30));
        assert!(options.raw_stream);
        assert_eq!(options.extra_stream_ids, 4);
        assert!(options.error_handler.is_some());
    }
}
