//! Recording frame codec for unit tests.

use crate::codec::{
    CodecEvent, ErrorCode, FileRegion, FrameCodec, HeaderField, Http2Settings, StreamId,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;

/// A frame the test codec was asked to send.
#[derive(Debug)]
pub(crate) enum SentFrame {
    Headers {
        fields: Vec<HeaderField>,
        end_stream: bool,
    },
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    FileRegion {
        count: u64,
        end_stream: bool,
    },
    RstStream {
        stream_id: StreamId,
        code: ErrorCode,
    },
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
    },
}

/// Records outbound frames and replays queued inbound events.
///
/// `window` limits how many DATA bytes `send_data` accepts in total until
/// refilled, which is how tests exercise flow-control suspension.
pub(crate) struct TestCodec {
    pub frames: Vec<SentFrame>,
    pub events: VecDeque<CodecEvent>,
    pub window: usize,
    pub tls: bool,
    pub max_frame: u32,
    pub released: Vec<(StreamId, usize)>,
    pub fail_sends: bool,
    pub settings: Option<Http2Settings>,
}

impl TestCodec {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            events: VecDeque::new(),
            window: usize::MAX,
            tls: false,
            max_frame: 16_384,
            released: Vec::new(),
            fail_sends: false,
            settings: None,
        }
    }

    pub fn push_event(&mut self, event: CodecEvent) {
        self.events.push_back(event);
    }

    pub fn data_payload(&self, stream: StreamId) -> Vec<u8> {
        self.frames
            .iter()
            .filter_map(|f| match f {
                SentFrame::Data {
                    stream_id, data, ..
                } if *stream_id == stream => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl FrameCodec for TestCodec {
    fn apply_settings(&mut self, settings: &Http2Settings) {
        self.settings = Some(*settings);
    }

    fn send_headers(
        &mut self,
        _stream_id: StreamId,
        fields: &[HeaderField],
        end_stream: bool,
    ) -> io::Result<()> {
        if self.fail_sends {
            return Err(io::Error::other("send failure injected"));
        }
        self.frames.push(SentFrame::Headers {
            fields: fields.to_vec(),
            end_stream,
        });
        Ok(())
    }

    fn send_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> io::Result<usize> {
        if self.fail_sends {
            return Err(io::Error::other("send failure injected"));
        }
        let accepted = data.len().min(self.window);
        self.window -= accepted;
        let complete = accepted == data.len();
        self.frames.push(SentFrame::Data {
            stream_id,
            data: data.slice(..accepted),
            end_stream: end_stream && complete,
        });
        Ok(accepted)
    }

    fn send_file_region(
        &mut self,
        _stream_id: StreamId,
        region: &FileRegion,
        end_stream: bool,
    ) -> io::Result<()> {
        if self.fail_sends {
            return Err(io::Error::other("send failure injected"));
        }
        self.frames.push(SentFrame::FileRegion {
            count: region.count(),
            end_stream,
        });
        Ok(())
    }

    fn send_rst_stream(&mut self, stream_id: StreamId, code: ErrorCode) -> io::Result<()> {
        self.frames.push(SentFrame::RstStream { stream_id, code });
        Ok(())
    }

    fn send_goaway(
        &mut self,
        last_stream_id: StreamId,
        code: ErrorCode,
        _debug_data: &[u8],
    ) -> io::Result<()> {
        self.frames.push(SentFrame::GoAway {
            last_stream_id,
            code,
        });
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<CodecEvent> {
        self.events.drain(..).collect()
    }

    fn release_capacity(&mut self, stream_id: StreamId, bytes: usize) {
        self.released.push((stream_id, bytes));
    }

    fn max_frame_size(&self) -> u32 {
        self.max_frame
    }

    fn is_tls(&self) -> bool {
        self.tls
    }
}
