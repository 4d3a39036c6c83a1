//! Codec-facing type definitions.

use std::fs::File;
use std::sync::Arc;

/// Stream identifier (31 bits, high bit reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Connection-level stream (stream 0).
    pub const CONNECTION: StreamId = StreamId(0);

    /// Create a new stream ID, masking the reserved bit.
    #[inline]
    pub fn new(id: u32) -> Self {
        StreamId(id & 0x7FFF_FFFF)
    }

    /// Get the raw stream ID value.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Check if this is the connection-level stream.
    #[inline]
    pub fn is_connection_level(self) -> bool {
        self.0 == 0
    }

    /// Check if this is a client-initiated stream (odd numbers).
    #[inline]
    pub fn is_client_initiated(self) -> bool {
        self.0 % 2 == 1
    }

    /// Check if this is a server-initiated stream (even numbers, non-zero).
    #[inline]
    pub fn is_server_initiated(self) -> bool {
        self.0 != 0 && self.0.is_multiple_of(2)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        StreamId::new(id)
    }
}

/// A single header name/value pair as the codec delivers and accepts it.
///
/// Names are expected to be lowercase ASCII on the wire; the exchange layer
/// normalizes before handing fields to the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    /// Create a new header field.
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Header name as a str, if valid UTF-8.
    pub fn name_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.name).ok()
    }

    /// Header value as a str, if valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// Zero-copy file transfer descriptor.
///
/// Describes a region of an open file to be handed to the codec for a
/// sendfile-style transfer. The handle is shared so the descriptor stays
/// cheap to clone while the transfer is in flight.
#[derive(Debug, Clone)]
pub struct FileRegion {
    file: Arc<File>,
    position: u64,
    count: u64,
}

impl FileRegion {
    /// Create a region covering `count` bytes starting at `position`.
    pub fn new(file: File, position: u64, count: u64) -> Self {
        Self {
            file: Arc::new(file),
            position,
            count,
        }
    }

    /// The underlying file handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Byte offset where the transfer starts.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of bytes to transfer.
    pub fn count(&self) -> u64 {
        self.count
    }
}
