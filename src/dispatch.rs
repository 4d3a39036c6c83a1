//! Body transmission.
//!
//! Given an encoded HEADERS block and a [`Body`], the dispatcher picks one
//! transmission strategy and emits HEADERS plus DATA frames so that the
//! last frame carries END_STREAM. Bodies the flow-control window cannot
//! absorb in one pass leave behind a [`BodyPump`] the connection re-drives
//! whenever the codec reports window again.

use crate::body::Body;
use crate::channel::BodySource;
use crate::codec::{ErrorCode, FrameCodec, HeaderField, StreamId};
use crate::error::{Error, StreamException};
use crate::stream::StreamChannel;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::warn;

/// Default DATA chunk size (the SETTINGS_MAX_FRAME_SIZE default).
pub const DEFAULT_CHUNK_SIZE: usize = 16_384;

/// Whether a message of this status may carry an inferred content-length
/// (RFC 9110 Section 8.6). `None` is a request.
fn content_length_allowed(status: Option<u16>) -> bool {
    !matches!(status, Some(s) if (100..200).contains(&s) || s == 204)
}

/// Close the stream and answer the failure with RST_STREAM.
///
/// Used for every body emission failure: the channel stops being writable,
/// the peer gets the error code, and the caller gets the exception back to
/// surface on its promise or exception slot.
pub(crate) fn fail_stream<C: FrameCodec>(
    codec: &mut C,
    channel: &StreamChannel,
    exception: StreamException,
) -> Error {
    channel.mark_reset();
    let _ = codec.send_rst_stream(channel.id(), exception.code);
    warn!(
        stream = channel.id().value(),
        code = %exception.code,
        "stream failed: {}",
        exception.message
    );
    Error::Stream(exception.on_stream(channel.id()))
}

/// Emit a message: HEADERS, then the body under its strategy.
///
/// `status` is the response status, or `None` for requests; it gates the
/// content-length inference. Returns a [`BodyPump`] when the body could not
/// be emitted completely in this pass.
pub fn send_message<C: FrameCodec>(
    codec: &mut C,
    channel: &Arc<StreamChannel>,
    mut fields: Vec<HeaderField>,
    body: Body,
    chunk_size: Option<usize>,
    status: Option<u16>,
) -> Result<Option<BodyPump>, Error> {
    if !channel.is_writable() {
        return Err(Error::Stream(
            StreamException::new(ErrorCode::StreamClosed, "stream is no longer writable")
                .on_stream(channel.id()),
        ));
    }

    let has_content_length = fields.iter().any(|f| f.name == b"content-length");
    if !has_content_length
        && content_length_allowed(status)
        && let Some(length) = body.known_length()
    {
        fields.push(HeaderField::new("content-length", length.to_string()));
    }

    let chunk_size = chunk_size
        .unwrap_or(DEFAULT_CHUNK_SIZE)
        .min(codec.max_frame_size() as usize);
    let stream_id = channel.id();

    match body {
        Body::Empty | Body::Omitted => {
            if let Err(e) = codec.send_headers(stream_id, &fields, true) {
                return Err(fail_stream(
                    codec,
                    channel,
                    StreamException::new(ErrorCode::InternalError, e.to_string()),
                ));
            }
            channel.mark_sent_end();
            Ok(None)
        }
        Body::Text(s) => {
            send_contiguous(codec, channel, &fields, Bytes::from(s), chunk_size)
        }
        Body::Bytes(v) => {
            send_contiguous(codec, channel, &fields, Bytes::from(v), chunk_size)
        }
        Body::Buf(b) => send_contiguous(codec, channel, &fields, b, chunk_size),
        Body::Chunks(chunked) => {
            let chunks: VecDeque<Bytes> = chunked.into_chunks().into();
            start_pump(
                codec,
                channel,
                &fields,
                PumpState::Buffered(if chunks.is_empty() {
                    VecDeque::from([Bytes::new()])
                } else {
                    chunks
                }),
                chunk_size,
            )
        }
        Body::File(file_body) => {
            let (file, offset, length, override_chunk) = file_body.into_parts();
            start_pump(
                codec,
                channel,
                &fields,
                PumpState::Reader(FileReader {
                    file,
                    position: offset,
                    remaining: length,
                }),
                override_chunk.unwrap_or(chunk_size).min(codec.max_frame_size() as usize),
            )
        }
        Body::Path(path) => {
            let (file, length) = match File::open(&path).and_then(|f| {
                let len = f.metadata()?.len();
                Ok((f, len))
            }) {
                Ok(pair) => pair,
                Err(e) => {
                    return Err(fail_stream(
                        codec,
                        channel,
                        StreamException::new(
                            ErrorCode::InternalError,
                            format!("cannot open {}: {}", path.display(), e),
                        ),
                    ));
                }
            };
            start_pump(
                codec,
                channel,
                &fields,
                PumpState::Reader(FileReader {
                    file,
                    position: 0,
                    remaining: length,
                }),
                chunk_size,
            )
        }
        Body::Region(region) => {
            if codec.is_tls() {
                return Err(fail_stream(
                    codec,
                    channel,
                    StreamException::new(
                        ErrorCode::InternalError,
                        "zero-copy file region is not supported over TLS",
                    ),
                ));
            }
            if let Err(e) = codec
                .send_headers(stream_id, &fields, false)
                .and_then(|_| codec.send_file_region(stream_id, &region, true))
            {
                return Err(fail_stream(
                    codec,
                    channel,
                    StreamException::new(ErrorCode::InternalError, e.to_string()),
                ));
            }
            channel.mark_sent_end();
            Ok(None)
        }
        Body::Source(source) => {
            start_pump(codec, channel, &fields, PumpState::Source(source), chunk_size)
        }
    }
}

fn send_contiguous<C: FrameCodec>(
    codec: &mut C,
    channel: &Arc<StreamChannel>,
    fields: &[HeaderField],
    data: Bytes,
    chunk_size: usize,
) -> Result<Option<BodyPump>, Error> {
    start_pump(
        codec,
        channel,
        fields,
        PumpState::Buffered(VecDeque::from([data])),
        chunk_size,
    )
}

fn start_pump<C: FrameCodec>(
    codec: &mut C,
    channel: &Arc<StreamChannel>,
    fields: &[HeaderField],
    state: PumpState,
    chunk_size: usize,
) -> Result<Option<BodyPump>, Error> {
    if let Err(e) = codec.send_headers(channel.id(), fields, false) {
        return Err(fail_stream(
            codec,
            channel,
            StreamException::new(ErrorCode::InternalError, e.to_string()),
        ));
    }

    let mut pump = BodyPump {
        channel: channel.clone(),
        chunk_size,
        state,
        pending: None,
    };
    if pump.pump(codec)? {
        Ok(None)
    } else {
        Ok(Some(pump))
    }
}

#[derive(Debug)]
struct FileReader {
    file: File,
    position: u64,
    remaining: u64,
}

#[derive(Debug)]
enum PumpState {
    /// Fully realized chunks; the last one carries END_STREAM.
    Buffered(VecDeque<Bytes>),
    /// Positional reads from an open file.
    Reader(FileReader),
    /// Streaming source; close yields a final empty DATA with END_STREAM.
    Source(BodySource),
    Done,
}

/// Remaining body emission for one stream.
///
/// The connection keeps pumps for streams whose window ran dry (or whose
/// streaming source has not produced its tail yet) and re-drives them on
/// every poll.
#[derive(Debug)]
pub struct BodyPump {
    channel: Arc<StreamChannel>,
    chunk_size: usize,
    state: PumpState,
    /// A piece the codec did not fully accept, with its END_STREAM flag.
    pending: Option<(Bytes, bool)>,
}

impl BodyPump {
    /// The stream this pump feeds.
    pub fn stream_id(&self) -> StreamId {
        self.channel.id()
    }

    /// Whether emission finished (or was abandoned).
    pub fn is_done(&self) -> bool {
        matches!(self.state, PumpState::Done)
    }

    /// Push as much of the body as the codec will take right now.
    ///
    /// Returns `Ok(true)` when END_STREAM went out (or the stream stopped
    /// being writable and the body was abandoned), `Ok(false)` when the
    /// window ran dry or a streaming source has nothing realized yet.
    pub fn pump<C: FrameCodec>(&mut self, codec: &mut C) -> Result<bool, Error> {
        loop {
            if matches!(self.state, PumpState::Done) {
                return Ok(true);
            }
            if !self.channel.is_writable() {
                self.state = PumpState::Done;
                self.pending = None;
                return Ok(true);
            }

            let (piece, last) = match self.next_piece() {
                Ok(Piece::Ready(piece, last)) => (piece, last),
                Ok(Piece::NotYet) => return Ok(false),
                Err(exception) => {
                    self.state = PumpState::Done;
                    return Err(fail_stream(codec, &self.channel, exception));
                }
            };

            let offered = piece.len();
            let accepted = match codec.send_data(self.channel.id(), piece.clone(), last) {
                Ok(n) => n,
                Err(e) => {
                    self.state = PumpState::Done;
                    return Err(fail_stream(
                        codec,
                        &self.channel,
                        StreamException::new(ErrorCode::InternalError, e.to_string()),
                    ));
                }
            };

            if accepted < offered {
                self.pending = Some((piece.slice(accepted..), last));
                return Ok(false);
            }
            if last {
                self.channel.mark_sent_end();
                self.state = PumpState::Done;
                return Ok(true);
            }
        }
    }

    fn next_piece(&mut self) -> Result<Piece, StreamException> {
        if let Some((piece, last)) = self.pending.take() {
            return Ok(Piece::Ready(piece, last));
        }

        match &mut self.state {
            PumpState::Buffered(chunks) => {
                let front = chunks
                    .front_mut()
                    .expect("buffered pump exists only with chunks");
                if front.len() > self.chunk_size {
                    let piece = front.split_to(self.chunk_size);
                    Ok(Piece::Ready(piece, false))
                } else {
                    let piece = chunks.pop_front().unwrap();
                    Ok(Piece::Ready(piece, chunks.is_empty()))
                }
            }
            PumpState::Reader(reader) => {
                let want = (reader.remaining.min(self.chunk_size as u64)) as usize;
                if want == 0 {
                    return Ok(Piece::Ready(Bytes::new(), true));
                }
                let mut buf = vec![0u8; want];
                let read = reader
                    .file
                    .seek(SeekFrom::Start(reader.position))
                    .and_then(|_| reader.file.read(&mut buf));
                match read {
                    Ok(0) => Err(StreamException::new(
                        ErrorCode::InternalError,
                        "file body truncated",
                    )),
                    Ok(n) => {
                        buf.truncate(n);
                        reader.position += n as u64;
                        reader.remaining -= n as u64;
                        Ok(Piece::Ready(Bytes::from(buf), reader.remaining == 0))
                    }
                    Err(e) => Err(StreamException::new(ErrorCode::InternalError, e.to_string())),
                }
            }
            PumpState::Source(source) => match source.try_recv() {
                Some(mut chunk) => {
                    if chunk.len() > self.chunk_size {
                        let piece = chunk.split_to(self.chunk_size);
                        self.pending = Some((chunk, false));
                        Ok(Piece::Ready(piece, false))
                    } else {
                        Ok(Piece::Ready(chunk, false))
                    }
                }
                None if source.is_closed() => Ok(Piece::Ready(Bytes::new(), true)),
                None => Ok(Piece::NotYet),
            },
            PumpState::Done => Ok(Piece::NotYet),
        }
    }
}

enum Piece {
    Ready(Bytes, bool),
    NotYet,
}
