//! Message bodies.
//!
//! [`Body`] is a closed sum over every shape the dispatcher knows how to
//! transmit. Each variant maps to exactly one transmission strategy; adding
//! a variant means adding a dispatch branch.

use crate::channel::BodySource;
use crate::codec::FileRegion;
use bytes::Bytes;
use std::fs::File;
use std::path::PathBuf;

/// An outbound (or inbound, via `Source`) message body.
#[derive(Debug, Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Explicitly omitted body (HEAD responses). Transmitted like `Empty`
    /// but distinguishable from "nothing was set".
    Omitted,
    /// UTF-8 text.
    Text(String),
    /// Owned byte vector.
    Bytes(Vec<u8>),
    /// Contiguous shared buffer.
    Buf(Bytes),
    /// Pre-chunked input, with the total length when the input declares one.
    Chunks(ChunkedBody),
    /// Random-access region of an open file, read positionally.
    File(FileBody),
    /// File addressed by path; opened and chunked at send time.
    Path(PathBuf),
    /// Zero-copy file region handed to the codec.
    Region(FileRegion),
    /// Lazy or asynchronous sequence of chunks.
    Source(BodySource),
}

/// Pre-chunked body input.
#[derive(Debug, Default)]
pub struct ChunkedBody {
    chunks: Vec<Bytes>,
    declared_length: Option<u64>,
}

impl ChunkedBody {
    /// Chunked input of unknown total length.
    pub fn new(chunks: Vec<Bytes>) -> Self {
        Self {
            chunks,
            declared_length: None,
        }
    }

    /// Chunked input that declares its total length up front.
    pub fn with_length(chunks: Vec<Bytes>, length: u64) -> Self {
        Self {
            chunks,
            declared_length: Some(length),
        }
    }

    /// The declared total length, when known.
    pub fn declared_length(&self) -> Option<u64> {
        self.declared_length
    }

    pub(crate) fn into_chunks(self) -> Vec<Bytes> {
        self.chunks
    }
}

/// Random-access file body.
#[derive(Debug)]
pub struct FileBody {
    file: File,
    offset: u64,
    length: u64,
    chunk_size: Option<usize>,
}

impl FileBody {
    /// Send `length` bytes of `file` starting at `offset`.
    pub fn new(file: File, offset: u64, length: u64) -> Self {
        Self {
            file,
            offset,
            length,
            chunk_size: None,
        }
    }

    /// Override the chunk size for this body.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub(crate) fn into_parts(self) -> (File, u64, u64, Option<usize>) {
        (self.file, self.offset, self.length, self.chunk_size)
    }

    /// Number of bytes this body will transmit.
    pub fn length(&self) -> u64 {
        self.length
    }
}

impl Body {
    /// Whether this body transmits no DATA frames.
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty | Body::Omitted => true,
            Body::Text(s) => s.is_empty(),
            Body::Bytes(b) => b.is_empty(),
            Body::Buf(b) => b.is_empty(),
            _ => false,
        }
    }

    /// The body length when it is statically known.
    ///
    /// `Path` bodies consult the filesystem; everything else answers from
    /// memory. Streaming sources and undeclared chunked inputs are unknown.
    pub fn known_length(&self) -> Option<u64> {
        match self {
            Body::Empty | Body::Omitted => None,
            Body::Text(s) => Some(s.len() as u64),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Buf(b) => Some(b.len() as u64),
            Body::Chunks(c) => c.declared_length(),
            Body::File(f) => Some(f.length()),
            Body::Path(p) => std::fs::metadata(p).ok().map(|m| m.len()),
            Body::Region(r) => Some(r.count()),
            Body::Source(_) => None,
        }
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Body::Empty
        } else {
            Body::Text(s.to_string())
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        if s.is_empty() { Body::Empty } else { Body::Text(s) }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        if v.is_empty() { Body::Empty } else { Body::Bytes(v) }
    }
}

impl From<&[u8]> for Body {
    fn from(s: &[u8]) -> Self {
        if s.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(s.to_vec())
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        if b.is_empty() { Body::Empty } else { Body::Buf(b) }
    }
}

impl From<PathBuf> for Body {
    fn from(p: PathBuf) -> Self {
        Body::Path(p)
    }
}

impl From<BodySource> for Body {
    fn from(s: BodySource) -> Self {
        Body::Source(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_body_default_is_empty() {
        let body = Body::default();
        assert!(matches!(body, Body::Empty));
        assert!(body.is_empty());
    }

    #[test]
    fn test_body_from_str() {
        assert!(matches!(Body::from("hello"), Body::Text(_)));
        assert!(matches!(Body::from(""), Body::Empty));
    }

    #[test]
    fn test_body_from_bytes() {
        assert!(matches!(Body::from(vec![1u8, 2, 3]), Body::Bytes(_)));
        assert!(matches!(Body::from(Vec::<u8>::new()), Body::Empty));
        assert!(matches!(
            Body::from(Bytes::from_static(b"abc")),
            Body::Buf(_)
        ));
    }

    #[test]
    fn test_known_length_contiguous() {
        assert_eq!(Body::from("hello").known_length(), Some(5));
        assert_eq!(Body::from(vec![0u8; 7]).known_length(), Some(7));
        assert_eq!(Body::Empty.known_length(), None);
        assert_eq!(Body::Omitted.known_length(), None);
    }

    #[test]
    fn test_known_length_chunked() {
        let chunks = vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")];
        assert_eq!(Body::Chunks(ChunkedBody::new(chunks.clone())).known_length(), None);
        assert_eq!(
            Body::Chunks(ChunkedBody::with_length(chunks, 4)).known_length(),
            Some(4)
        );
    }

    #[test]
    fn test_known_length_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let body = Body::File(FileBody::new(file.reopen().unwrap(), 2, 6));
        assert_eq!(body.known_length(), Some(6));

        let body = Body::Path(file.path().to_path_buf());
        assert_eq!(body.known_length(), Some(10));
    }

    #[test]
    fn test_known_length_region() {
        let file = tempfile::tempfile().unwrap();
        let body = Body::Region(FileRegion::new(file, 0, 32));
        assert_eq!(body.known_length(), Some(32));
    }

    #[test]
    fn test_known_length_source_unknown() {
        let (_sink, source) = crate::channel::body_channel(64);
        assert_eq!(Body::Source(source).known_length(), None);
    }

    #[test]
    fn test_file_body_chunk_size_override() {
        let file = tempfile::tempfile().unwrap();
        let body = FileBody::new(file, 0, 10).chunk_size(4);
        let (_, offset, length, chunk) = body.into_parts();
        assert_eq!(offset, 0);
        assert_eq!(length, 10);
        assert_eq!(chunk, Some(4));
    }
}
