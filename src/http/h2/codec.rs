//! HTTP/2 frame encoding and decoding
//!
//! [`FrameCodec`] buffers inbound bytes and yields complete [`Frame`]s,
//! reporting `Incomplete` without consuming anything until a whole frame
//! is available. The write side splits payloads that exceed the peer's
//! MAX_FRAME_SIZE into several physical frames.

use super::error::{Error, ErrorCode};
use super::frames::*;
use super::settings::Settings;
use super::stream::StreamId;
use super::DEFAULT_MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Size of the PRIORITY fields inside HEADERS/PRIORITY payloads
const PRIORITY_FIELDS_SIZE: usize = 5;

/// Why a frame could not be read
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not enough bytes buffered yet; nothing was consumed
    #[error("incomplete frame")]
    Incomplete,
    /// The frame violates RFC 7540 framing rules
    #[error(transparent)]
    Malformed(#[from] Error),
}

/// Decoded 9-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length
    pub length: usize,
    /// Raw frame type
    pub frame_type: u8,
    /// Flags
    pub flags: FrameFlags,
    /// Stream ID with the reserved bit cleared
    pub stream_id: StreamId,
}

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec {
    /// Buffer for reading
    read_buffer: BytesMut,
    /// Largest payload we accept (our advertised MAX_FRAME_SIZE)
    max_frame_size: u32,
}

impl FrameCodec {
    /// Create a new frame codec
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec accepting payloads up to `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        FrameCodec {
            read_buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Inbound payload limit
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Change the inbound payload limit
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    /// Append received bytes to the read buffer
    pub fn feed(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> &[u8] {
        &self.read_buffer
    }

    /// Remove `n` raw bytes from the front of the read buffer
    pub fn consume(&mut self, n: usize) -> Bytes {
        let n = n.min(self.read_buffer.len());
        self.read_buffer.split_to(n).freeze()
    }

    /// Encode a frame header into a buffer
    pub fn encode_header(
        frame_type: u8,
        flags: FrameFlags,
        stream_id: StreamId,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type;
        header[4] = flags.as_u8();

        // Stream ID (31 bits, big-endian, reserved bit is 0)
        let stream_id = stream_id & 0x7FFFFFFF;
        header[5..9].copy_from_slice(&stream_id.to_be_bytes());

        header
    }

    /// Decode a frame header from bytes
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let length =
            ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);

        // Stream ID (31 bits, ignore reserved bit)
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        FrameHeader {
            length,
            frame_type: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    /// Read the next complete frame from the buffer
    ///
    /// On `Incomplete` the buffer is left untouched, so the call can be
    /// retried after more bytes are fed.
    pub fn read_frame(&mut self) -> Result<Frame, DecodeError> {
        if self.read_buffer.len() < FRAME_HEADER_SIZE {
            return Err(DecodeError::Incomplete);
        }

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&self.read_buffer[..FRAME_HEADER_SIZE]);
        let header = Self::decode_header(&raw);

        if header.length > self.max_frame_size as usize {
            return Err(Error::FrameSize(format!(
                "frame payload {} exceeds MAX_FRAME_SIZE {}",
                header.length, self.max_frame_size
            ))
            .into());
        }

        if self.read_buffer.len() < FRAME_HEADER_SIZE + header.length {
            return Err(DecodeError::Incomplete);
        }

        self.read_buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.read_buffer.split_to(header.length).freeze();

        Ok(Self::decode_payload(header, payload)?)
    }

    /// Interpret a frame payload according to its header
    pub fn decode_payload(header: FrameHeader, payload: Bytes) -> Result<Frame, Error> {
        let FrameHeader {
            frame_type,
            flags,
            stream_id,
            ..
        } = header;

        let Some(kind) = FrameType::from_u8(frame_type) else {
            return Ok(Frame::Unknown(UnknownFrame {
                frame_type,
                flags,
                stream_id,
                payload,
            }));
        };

        if !kind.defines_low_flag() && flags.is_set(FrameFlags::ACK) {
            return Err(Error::Protocol(format!("ACK flag set on {} frame", kind.name())));
        }

        match kind {
            FrameType::Data => {
                require_stream(kind, stream_id)?;
                let (data, padding) = strip_padding(kind, flags, payload)?;
                Ok(Frame::Data(DataFrame {
                    stream_id,
                    data,
                    end_stream: flags.is_end_stream(),
                    padding,
                }))
            }
            FrameType::Headers => {
                require_stream(kind, stream_id)?;
                let (mut block, padding) = strip_padding(kind, flags, payload)?;
                let priority = if flags.is_priority() {
                    if block.len() < PRIORITY_FIELDS_SIZE {
                        return Err(Error::FrameSize(
                            "HEADERS too short for priority fields".to_string(),
                        ));
                    }
                    Some(read_priority(&mut block))
                } else {
                    None
                };
                Ok(Frame::Headers(HeadersFrame {
                    stream_id,
                    header_block: block,
                    end_stream: flags.is_end_stream(),
                    end_headers: flags.is_end_headers(),
                    priority,
                    padding,
                }))
            }
            FrameType::Priority => {
                require_stream(kind, stream_id)?;
                require_length(kind, &payload, PRIORITY_FIELDS_SIZE)?;
                let mut payload = payload;
                Ok(Frame::Priority(PriorityFrame {
                    stream_id,
                    priority: read_priority(&mut payload),
                }))
            }
            FrameType::RstStream => {
                require_stream(kind, stream_id)?;
                require_length(kind, &payload, 4)?;
                let mut payload = payload;
                Ok(Frame::RstStream(RstStreamFrame {
                    stream_id,
                    error_code: read_error_code(&mut payload),
                }))
            }
            FrameType::Settings => {
                require_connection(kind, stream_id)?;
                if flags.is_ack() {
                    if !payload.is_empty() {
                        return Err(Error::Protocol(
                            "SETTINGS ACK with non-empty payload".to_string(),
                        ));
                    }
                    return Ok(Frame::Settings(SettingsFrame::ack()));
                }
                Ok(Frame::Settings(SettingsFrame::new(Settings::decode_payload(
                    &payload,
                )?)))
            }
            FrameType::PushPromise => {
                require_stream(kind, stream_id)?;
                let (mut block, padding) = strip_padding(kind, flags, payload)?;
                if block.len() < 4 {
                    return Err(Error::FrameSize(
                        "PUSH_PROMISE too short for promised stream id".to_string(),
                    ));
                }
                let promised_stream_id = block.get_u32() & 0x7FFFFFFF;
                Ok(Frame::PushPromise(PushPromiseFrame {
                    stream_id,
                    promised_stream_id,
                    header_block: block,
                    end_headers: flags.is_end_headers(),
                    padding,
                }))
            }
            FrameType::Ping => {
                require_connection(kind, stream_id)?;
                require_length(kind, &payload, 8)?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Ok(Frame::Ping(PingFrame {
                    ack: flags.is_ack(),
                    data,
                }))
            }
            FrameType::Goaway => {
                require_connection(kind, stream_id)?;
                if payload.len() < 8 {
                    return Err(Error::FrameSize(format!(
                        "GOAWAY payload {} shorter than 8 bytes",
                        payload.len()
                    )));
                }
                let mut payload = payload;
                let last_stream_id = payload.get_u32() & 0x7FFFFFFF;
                let error_code = read_error_code(&mut payload);
                Ok(Frame::Goaway(GoawayFrame {
                    last_stream_id,
                    error_code,
                    debug_data: payload,
                }))
            }
            FrameType::WindowUpdate => {
                require_length(kind, &payload, 4)?;
                let mut payload = payload;
                Ok(Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id,
                    size_increment: payload.get_u32() & 0x7FFFFFFF,
                }))
            }
            FrameType::Continuation => {
                require_stream(kind, stream_id)?;
                Ok(Frame::Continuation(ContinuationFrame {
                    stream_id,
                    header_block: payload,
                    end_headers: flags.is_end_headers(),
                }))
            }
        }
    }

    /// Encode a single frame, without any splitting
    pub fn encode_frame(frame: &Frame) -> Bytes {
        let mut buf = BytesMut::new();
        Self::put_frame(frame, &mut buf);
        buf.freeze()
    }

    /// Encode `frame` into `dst`, splitting it so no payload exceeds
    /// `max_frame_size`
    ///
    /// DATA is split into several DATA frames with END_STREAM on the last
    /// one only. HEADERS and PUSH_PROMISE blocks continue in CONTINUATION
    /// frames with END_HEADERS on the last one.
    pub fn write_frame(frame: &Frame, max_frame_size: usize, dst: &mut BytesMut) {
        let max = max_frame_size.max(1);
        match frame {
            Frame::Data(data) if data.frame_size() > max => {
                let mut remaining = data.data.clone();
                while remaining.len() > max {
                    let chunk = remaining.split_to(max);
                    Self::put_data(&DataFrame::new(data.stream_id, chunk, false), dst);
                }
                Self::put_data(&DataFrame::new(data.stream_id, remaining, data.end_stream), dst);
            }
            Frame::Headers(headers) => {
                let overhead = headers.priority.map_or(0, |_| PRIORITY_FIELDS_SIZE)
                    + headers.padding.map_or(0, |pad| 1 + pad as usize);
                let first = max.saturating_sub(overhead).max(1);
                if headers.header_block.len() <= first {
                    Self::put_headers(headers, dst);
                    return;
                }
                let mut rest = headers.header_block.clone();
                let head = HeadersFrame {
                    header_block: rest.split_to(first),
                    end_headers: false,
                    ..headers.clone()
                };
                Self::put_headers(&head, dst);
                Self::put_continuations(headers.stream_id, rest, max, dst);
            }
            Frame::PushPromise(push) => {
                let overhead = 4 + push.padding.map_or(0, |pad| 1 + pad as usize);
                let first = max.saturating_sub(overhead).max(1);
                if push.header_block.len() <= first {
                    Self::put_push_promise(push, dst);
                    return;
                }
                let mut rest = push.header_block.clone();
                let head = PushPromiseFrame {
                    header_block: rest.split_to(first),
                    end_headers: false,
                    ..push.clone()
                };
                Self::put_push_promise(&head, dst);
                Self::put_continuations(push.stream_id, rest, max, dst);
            }
            other => Self::put_frame(other, dst),
        }
    }

    fn put_continuations(stream_id: StreamId, mut rest: Bytes, max: usize, dst: &mut BytesMut) {
        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max));
            let frame = ContinuationFrame {
                stream_id,
                header_block: chunk,
                end_headers: rest.is_empty(),
            };
            Self::put_continuation(&frame, dst);
        }
    }

    fn put_frame(frame: &Frame, buf: &mut BytesMut) {
        match frame {
            Frame::Data(f) => Self::put_data(f, buf),
            Frame::Headers(f) => Self::put_headers(f, buf),
            Frame::Priority(f) => {
                let header = Self::encode_header(
                    FrameType::Priority.as_u8(),
                    FrameFlags::empty(),
                    f.stream_id,
                    PRIORITY_FIELDS_SIZE,
                );
                buf.put_slice(&header);
                put_priority(&f.priority, buf);
            }
            Frame::RstStream(f) => {
                let header = Self::encode_header(
                    FrameType::RstStream.as_u8(),
                    FrameFlags::empty(),
                    f.stream_id,
                    4,
                );
                buf.put_slice(&header);
                buf.put_u32(f.error_code.as_u32());
            }
            Frame::Settings(f) => {
                let flags = if f.ack {
                    FrameFlags::from_u8(FrameFlags::ACK)
                } else {
                    FrameFlags::empty()
                };
                let length = if f.ack { 0 } else { f.settings.payload_len() };
                let header = Self::encode_header(FrameType::Settings.as_u8(), flags, 0, length);
                buf.put_slice(&header);
                if !f.ack {
                    f.settings.encode_payload(buf);
                }
            }
            Frame::PushPromise(f) => Self::put_push_promise(f, buf),
            Frame::Ping(f) => {
                let flags = if f.ack {
                    FrameFlags::from_u8(FrameFlags::ACK)
                } else {
                    FrameFlags::empty()
                };
                let header = Self::encode_header(FrameType::Ping.as_u8(), flags, 0, 8);
                buf.put_slice(&header);
                buf.put_slice(&f.data);
            }
            Frame::Goaway(f) => {
                // 4 bytes last stream ID + 4 bytes error code + debug data
                let length = 8 + f.debug_data.len();
                let header =
                    Self::encode_header(FrameType::Goaway.as_u8(), FrameFlags::empty(), 0, length);
                buf.put_slice(&header);
                buf.put_u32(f.last_stream_id & 0x7FFFFFFF);
                buf.put_u32(f.error_code.as_u32());
                buf.put_slice(&f.debug_data);
            }
            Frame::WindowUpdate(f) => {
                let header = Self::encode_header(
                    FrameType::WindowUpdate.as_u8(),
                    FrameFlags::empty(),
                    f.stream_id,
                    4,
                );
                buf.put_slice(&header);
                buf.put_u32(f.size_increment & 0x7FFFFFFF);
            }
            Frame::Continuation(f) => Self::put_continuation(f, buf),
            Frame::Unknown(f) => {
                let header =
                    Self::encode_header(f.frame_type, f.flags, f.stream_id, f.payload.len());
                buf.put_slice(&header);
                buf.put_slice(&f.payload);
            }
        }
    }

    fn put_data(frame: &DataFrame, buf: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.padding.is_some() {
            flags.set(FrameFlags::PADDED);
        }

        let header =
            Self::encode_header(FrameType::Data.as_u8(), flags, frame.stream_id, frame.frame_size());
        buf.put_slice(&header);

        if let Some(pad_len) = frame.padding {
            buf.put_u8(pad_len);
            buf.put_slice(&frame.data);
            buf.put_bytes(0, pad_len as usize);
        } else {
            buf.put_slice(&frame.data);
        }
    }

    fn put_headers(frame: &HeadersFrame, buf: &mut BytesMut) {
        let mut payload_len = frame.header_block.len();
        let mut flags = FrameFlags::empty();

        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        if frame.priority.is_some() {
            flags.set(FrameFlags::PRIORITY);
            payload_len += PRIORITY_FIELDS_SIZE;
        }
        if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
        }

        let header =
            Self::encode_header(FrameType::Headers.as_u8(), flags, frame.stream_id, payload_len);
        buf.put_slice(&header);

        if let Some(pad_len) = frame.padding {
            buf.put_u8(pad_len);
        }
        if let Some(priority) = &frame.priority {
            put_priority(priority, buf);
        }
        buf.put_slice(&frame.header_block);
        if let Some(pad_len) = frame.padding {
            buf.put_bytes(0, pad_len as usize);
        }
    }

    fn put_push_promise(frame: &PushPromiseFrame, buf: &mut BytesMut) {
        let mut payload_len = 4 + frame.header_block.len();
        let mut flags = FrameFlags::empty();

        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
        }

        let header = Self::encode_header(
            FrameType::PushPromise.as_u8(),
            flags,
            frame.stream_id,
            payload_len,
        );
        buf.put_slice(&header);

        if let Some(pad_len) = frame.padding {
            buf.put_u8(pad_len);
        }
        buf.put_u32(frame.promised_stream_id & 0x7FFFFFFF);
        buf.put_slice(&frame.header_block);
        if let Some(pad_len) = frame.padding {
            buf.put_bytes(0, pad_len as usize);
        }
    }

    fn put_continuation(frame: &ContinuationFrame, buf: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }
        let header = Self::encode_header(
            FrameType::Continuation.as_u8(),
            flags,
            frame.stream_id,
            frame.header_block.len(),
        );
        buf.put_slice(&header);
        buf.put_slice(&frame.header_block);
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn require_stream(kind: FrameType, stream_id: StreamId) -> Result<(), Error> {
    if stream_id == 0 {
        return Err(Error::Protocol(format!("{} frame on stream 0", kind.name())));
    }
    Ok(())
}

fn require_connection(kind: FrameType, stream_id: StreamId) -> Result<(), Error> {
    if stream_id != 0 {
        return Err(Error::Protocol(format!(
            "{} frame on stream {}, expected stream 0",
            kind.name(),
            stream_id
        )));
    }
    Ok(())
}

fn require_length(kind: FrameType, payload: &Bytes, expected: usize) -> Result<(), Error> {
    if payload.len() != expected {
        return Err(Error::FrameSize(format!(
            "{} payload is {} bytes, expected {}",
            kind.name(),
            payload.len(),
            expected
        )));
    }
    Ok(())
}

/// Split off the pad-length prefix and trailing padding
fn strip_padding(
    kind: FrameType,
    flags: FrameFlags,
    mut payload: Bytes,
) -> Result<(Bytes, Option<u8>), Error> {
    if !flags.is_padded() {
        return Ok((payload, None));
    }
    if payload.is_empty() {
        return Err(Error::Protocol(format!(
            "PADDED {} frame without pad length",
            kind.name()
        )));
    }
    let pad_len = payload.get_u8();
    if pad_len as usize > payload.len() {
        return Err(Error::Protocol(format!(
            "{} padding {} exceeds payload",
            kind.name(),
            pad_len
        )));
    }
    payload.truncate(payload.len() - pad_len as usize);
    Ok((payload, Some(pad_len)))
}

fn read_priority(buf: &mut Bytes) -> PrioritySpec {
    let dep = buf.get_u32();
    let weight = buf.get_u8();
    PrioritySpec {
        stream_dependency: dep & 0x7FFFFFFF,
        exclusive: dep & 0x80000000 != 0,
        weight: weight as u16 + 1,
    }
}

fn put_priority(priority: &PrioritySpec, buf: &mut BytesMut) {
    let mut dep = priority.stream_dependency & 0x7FFFFFFF;
    if priority.exclusive {
        dep |= 0x80000000;
    }
    buf.put_u32(dep);
    buf.put_u8(priority.weight.clamp(1, 256).saturating_sub(1) as u8);
}

/// Unknown codes must not trigger special behavior; treat them as INTERNAL_ERROR
fn read_error_code(buf: &mut Bytes) -> ErrorCode {
    ErrorCode::from_u32(buf.get_u32()).unwrap_or(ErrorCode::InternalError)
}
