//! HTTP/2 error codes.

use std::fmt;

/// HTTP/2 error codes (RFC 9113 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown.
    NoError = 0x0,
    /// Protocol error detected.
    ProtocolError = 0x1,
    /// Implementation fault.
    InternalError = 0x2,
    /// Flow control limits exceeded.
    FlowControlError = 0x3,
    /// Settings not acknowledged in time.
    SettingsTimeout = 0x4,
    /// Frame received for closed stream.
    StreamClosed = 0x5,
    /// Frame size incorrect.
    FrameSizeError = 0x6,
    /// Stream not processed.
    RefusedStream = 0x7,
    /// Stream cancelled.
    Cancel = 0x8,
    /// Compression state not updated.
    CompressionError = 0x9,
    /// TCP connection error.
    ConnectError = 0xa,
    /// Processing capacity exceeded.
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS requirements not met.
    InadequateSecurity = 0xc,
    /// HTTP/1.1 required.
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            // Unknown error codes are treated as INTERNAL_ERROR
            _ => ErrorCode::InternalError,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NoError => write!(f, "NO_ERROR"),
            ErrorCode::ProtocolError => write!(f, "PROTOCOL_ERROR"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
            ErrorCode::FlowControlError => write!(f, "FLOW_CONTROL_ERROR"),
            ErrorCode::SettingsTimeout => write!(f, "SETTINGS_TIMEOUT"),
            ErrorCode::StreamClosed => write!(f, "STREAM_CLOSED"),
            ErrorCode::FrameSizeError => write!(f, "FRAME_SIZE_ERROR"),
            ErrorCode::RefusedStream => write!(f, "REFUSED_STREAM"),
            ErrorCode::Cancel => write!(f, "CANCEL"),
            ErrorCode::CompressionError => write!(f, "COMPRESSION_ERROR"),
            ErrorCode::ConnectError => write!(f, "CONNECT_ERROR"),
            ErrorCode::EnhanceYourCalm => write!(f, "ENHANCE_YOUR_CALM"),
            ErrorCode::InadequateSecurity => write!(f, "INADEQUATE_SECURITY"),
            ErrorCode::Http11Required => write!(f, "HTTP_1_1_REQUIRED"),
        }
    }
}
