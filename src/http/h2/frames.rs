//! Typed HTTP/2 frames (RFC 7540 Section 6)
//!
//! [`FrameCodec`](super::codec::FrameCodec) turns bytes into a [`Frame`]
//! and back. Padding and priority fields are kept so that flow control
//! can charge the exact wire length.

use super::error::ErrorCode;
use super::settings::Settings;
use super::stream::StreamId;
use bytes::Bytes;
use std::fmt;

macro_rules! frame_types {
    ($($variant:ident = $value:literal => $name:literal,)+) => {
        /// Frame types defined by RFC 7540 Section 6
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum FrameType {
            $($variant = $value,)+
        }

        impl FrameType {
            /// Type for a wire byte; extension types yield `None`
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(FrameType::$variant),)+
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(FrameType::$variant => $name,)+
                }
            }
        }
    };
}

frame_types! {
    Data = 0x0 => "DATA",
    Headers = 0x1 => "HEADERS",
    Priority = 0x2 => "PRIORITY",
    RstStream = 0x3 => "RST_STREAM",
    Settings = 0x4 => "SETTINGS",
    PushPromise = 0x5 => "PUSH_PROMISE",
    Ping = 0x6 => "PING",
    Goaway = 0x7 => "GOAWAY",
    WindowUpdate = 0x8 => "WINDOW_UPDATE",
    Continuation = 0x9 => "CONTINUATION",
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether bit 0x1 means END_STREAM or ACK for this type
    pub fn defines_low_flag(&self) -> bool {
        matches!(
            self,
            FrameType::Data | FrameType::Headers | FrameType::Settings | FrameType::Ping
        )
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// The flags octet of a frame header
///
/// Bits are only meaningful for the frame types that define them;
/// END_STREAM and ACK share bit 0x1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn is_set(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A decoded HTTP/2 frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise(PushPromiseFrame),
    Ping(PingFrame),
    Goaway(GoawayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    /// Frame of an extension type; receivers skip it (RFC 7540 Section 4.1)
    Unknown(UnknownFrame),
}

impl Frame {
    /// Stream the frame is associated with (0 for connection-level frames)
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data(f) => f.stream_id,
            Frame::Headers(f) => f.stream_id,
            Frame::Priority(f) => f.stream_id,
            Frame::RstStream(f) => f.stream_id,
            Frame::PushPromise(f) => f.stream_id,
            Frame::WindowUpdate(f) => f.stream_id,
            Frame::Continuation(f) => f.stream_id,
            Frame::Unknown(f) => f.stream_id,
            Frame::Settings(_) | Frame::Ping(_) | Frame::Goaway(_) => 0,
        }
    }

    /// Frame type name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Data(_) => FrameType::Data.name(),
            Frame::Headers(_) => FrameType::Headers.name(),
            Frame::Priority(_) => FrameType::Priority.name(),
            Frame::RstStream(_) => FrameType::RstStream.name(),
            Frame::Settings(_) => FrameType::Settings.name(),
            Frame::PushPromise(_) => FrameType::PushPromise.name(),
            Frame::Ping(_) => FrameType::Ping.name(),
            Frame::Goaway(_) => FrameType::Goaway.name(),
            Frame::WindowUpdate(_) => FrameType::WindowUpdate.name(),
            Frame::Continuation(_) => FrameType::Continuation.name(),
            Frame::Unknown(_) => "UNKNOWN",
        }
    }
}

/// DATA frame (RFC 7540 Section 6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub data: Bytes,
    pub end_stream: bool,
    /// Pad Length when PADDED is set
    pub padding: Option<u8>,
}

impl DataFrame {
    pub fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    /// Add `padding` zero octets after the payload
    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Payload length on the wire, padding included; flow control
    /// charges this, not `data.len()`
    pub fn frame_size(&self) -> usize {
        let mut size = self.data.len();
        if let Some(pad_len) = self.padding {
            size += 1 + pad_len as usize;
        }
        size
    }
}

/// HEADERS frame (RFC 7540 Section 6.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    /// Priority information (if PRIORITY flag is set)
    pub priority: Option<PrioritySpec>,
    /// Pad Length when PADDED is set
    pub padding: Option<u8>,
}

impl HeadersFrame {
    pub fn new(stream_id: StreamId, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            priority: None,
            padding: None,
        }
    }

    pub fn with_priority(mut self, priority: PrioritySpec) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Add `padding` zero octets after the payload
    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }
}

/// Stream dependency and weight (RFC 7540 Section 5.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub stream_dependency: StreamId,
    pub exclusive: bool,
    /// Weight (1-256); the wire carries `weight - 1`
    pub weight: u16,
}

impl PrioritySpec {
    pub fn new(stream_dependency: StreamId, exclusive: bool, weight: u16) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }
}

impl Default for PrioritySpec {
    /// Dependency on the connection root with weight 16 (RFC 7540 Section 5.3.5)
    fn default() -> Self {
        PrioritySpec::new(0, false, 16)
    }
}

/// PRIORITY frame (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: StreamId,
    pub priority: PrioritySpec,
}

/// RST_STREAM frame (RFC 7540 Section 6.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: StreamId, error_code: ErrorCode) -> Self {
        RstStreamFrame {
            stream_id,
            error_code,
        }
    }
}

/// SETTINGS frame (RFC 7540 Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    /// Create a SETTINGS ACK frame
    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::default(),
        }
    }
}

/// PUSH_PROMISE frame (RFC 7540 Section 6.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    pub stream_id: StreamId,
    pub promised_stream_id: StreamId,
    pub header_block: Bytes,
    pub end_headers: bool,
    /// Pad Length when PADDED is set
    pub padding: Option<u8>,
}

impl PushPromiseFrame {
    /// Create a new PUSH_PROMISE frame carrying a complete header block
    pub fn new(stream_id: StreamId, promised_stream_id: StreamId, header_block: Bytes) -> Self {
        PushPromiseFrame {
            stream_id,
            promised_stream_id,
            header_block,
            end_headers: true,
            padding: None,
        }
    }
}

/// PING frame (RFC 7540 Section 6.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    /// Create a PING ACK frame
    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }
}

/// GOAWAY frame (RFC 7540 Section 6.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoawayFrame {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: StreamId, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }
}

/// WINDOW_UPDATE frame (RFC 7540 Section 6.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    /// 31-bit increment; zero is a protocol error at the receiver
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: StreamId, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }
}

/// CONTINUATION frame (RFC 7540 Section 6.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: StreamId,
    pub header_block: Bytes,
    pub end_headers: bool,
}

/// Frame with a type this implementation does not know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrame {
    /// Raw frame type
    pub frame_type: u8,
    pub flags: FrameFlags,
    pub stream_id: StreamId,
    /// Undecoded payload
    pub payload: Bytes,
}
