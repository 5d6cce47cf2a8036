//! Engine errors and the RFC 7540 error codes they map to
//!
//! Every failure the engine reports to the peer is an [`Error`] whose
//! [`Error::code`] goes into RST_STREAM or GOAWAY. The reason string of
//! a connection error becomes the GOAWAY debug data.

use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport or HTTP/1.1 upgrade failure below the engine
    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Flow control error: {0}")]
    FlowControl(String),

    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Stream would exceed our MAX_CONCURRENT_STREAMS
    #[error("Refused stream: {0}")]
    RefusedStream(u32),

    /// HPACK decoding failed; the shared table is no longer trustworthy
    #[error("Compression error: {0}")]
    Compression(String),

    /// Peer asked for more than we are willing to buffer
    #[error("Enhance your calm: {0}")]
    EnhanceYourCalm(String),

    /// A SETTINGS value out of range; RFC 7540 picks the code per setting
    #[error("Invalid settings value: {1}")]
    InvalidSettings(ErrorCode, String),

    /// TLS selected something other than "h2"
    #[error("ALPN negotiation failed: expected h2, got {0:?}")]
    AlpnFailed(Option<Vec<u8>>),

    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    /// Malformed request header list (RFC 7540 Section 8.1.2.6)
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Missing connection preface")]
    MissingPreface,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Code put on the wire when this error ends a stream or the connection
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) | Error::MissingPreface | Error::InvalidHeader(_) => {
                ErrorCode::ProtocolError
            }
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::StreamClosed(_) => ErrorCode::StreamClosed,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::RefusedStream(_) => ErrorCode::RefusedStream,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::EnhanceYourCalm(_) => ErrorCode::EnhanceYourCalm,
            Error::InvalidSettings(code, _) => *code,
            Error::AlpnFailed(_) => ErrorCode::InadequateSecurity,
            Error::Io(_)
            | Error::Http(_)
            | Error::Internal(_)
            | Error::StreamNotFound(_)
            | Error::ConnectionClosed => ErrorCode::InternalError,
        }
    }
}

macro_rules! error_codes {
    ($($(#[$doc:meta])* $variant:ident = $value:literal => $name:literal,)+) => {
        /// RST_STREAM and GOAWAY error codes (RFC 7540 Section 7)
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum ErrorCode {
            $($(#[$doc])* $variant = $value,)+
        }

        impl ErrorCode {
            /// Code for a wire value; `None` for codes RFC 7540 does not define
            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $($value => Some(ErrorCode::$variant),)+
                    _ => None,
                }
            }

            /// Upper-case name as written in RFC 7540
            pub fn name(&self) -> &'static str {
                match self {
                    $(ErrorCode::$variant => $name,)+
                }
            }
        }
    };
}

error_codes! {
    /// Graceful shutdown
    NoError = 0x0 => "NO_ERROR",
    ProtocolError = 0x1 => "PROTOCOL_ERROR",
    InternalError = 0x2 => "INTERNAL_ERROR",
    FlowControlError = 0x3 => "FLOW_CONTROL_ERROR",
    /// SETTINGS not acknowledged in time
    SettingsTimeout = 0x4 => "SETTINGS_TIMEOUT",
    /// Frame received on a half-closed or closed stream
    StreamClosed = 0x5 => "STREAM_CLOSED",
    FrameSizeError = 0x6 => "FRAME_SIZE_ERROR",
    /// Stream not processed; safe for the client to retry
    RefusedStream = 0x7 => "REFUSED_STREAM",
    Cancel = 0x8 => "CANCEL",
    CompressionError = 0x9 => "COMPRESSION_ERROR",
    ConnectError = 0xa => "CONNECT_ERROR",
    EnhanceYourCalm = 0xb => "ENHANCE_YOUR_CALM",
    InadequateSecurity = 0xc => "INADEQUATE_SECURITY",
    Http11Required = 0xd => "HTTP_1_1_REQUIRED",
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_values() {
        for value in 0..=0xd {
            let code = ErrorCode::from_u32(value).unwrap();
            assert_eq!(code.as_u32(), value);
        }
        assert_eq!(ErrorCode::from_u32(0x9), Some(ErrorCode::CompressionError));
        assert_eq!(ErrorCode::from_u32(0xe), None);
        assert_eq!(ErrorCode::from_u32(0xffff_ffff), None);
    }

    #[test]
    fn test_error_maps_to_wire_code() {
        assert_eq!(Error::Protocol("x".into()).code(), ErrorCode::ProtocolError);
        assert_eq!(Error::FrameSize("x".into()).code(), ErrorCode::FrameSizeError);
        assert_eq!(Error::FlowControl("x".into()).code(), ErrorCode::FlowControlError);
        assert_eq!(Error::Compression("x".into()).code(), ErrorCode::CompressionError);
        assert_eq!(Error::RefusedStream(3).code(), ErrorCode::RefusedStream);
        assert_eq!(Error::MissingPreface.code(), ErrorCode::ProtocolError);
        assert_eq!(
            Error::InvalidSettings(ErrorCode::FlowControlError, "x".into()).code(),
            ErrorCode::FlowControlError
        );
        assert_eq!(Error::ConnectionClosed.code(), ErrorCode::InternalError);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Protocol("DATA on stream 0".to_string()).to_string(),
            "Protocol error: DATA on stream 0"
        );
        assert_eq!(Error::StreamClosed(42).to_string(), "Stream closed: 42");
        assert_eq!(
            ErrorCode::FlowControlError.to_string(),
            "FLOW_CONTROL_ERROR (0x3)"
        );
        assert_eq!(ErrorCode::Http11Required.name(), "HTTP_1_1_REQUIRED");
    }
}
