//! HTTP/2 connection engine
//!
//! [`Connection`] is sans-IO: the caller feeds received bytes to
//! [`Connection::recv`], drains [`Event`]s with [`Connection::poll_event`]
//! and writes whatever [`Connection::take_pending_send`] returns. It owns
//! the frame codec, the HPACK state, the settings table, the flow
//! controller and the stream table of exactly one connection.
//!
//! Response bodies are queued per stream and sent by a scheduler pass that
//! runs after every change that can open send window (WINDOW_UPDATE,
//! SETTINGS, a new response).

use super::codec::{DecodeError, FrameCodec};
use super::error::{Error, ErrorCode, Result};
use super::flow_control::{FlowController, WindowTarget};
use super::frames::*;
use super::headers::HeaderList;
use super::hpack::HeaderCodec;
use super::server::{H2Request, H2Response};
use super::settings::{Settings, SettingsTable};
use super::stream::{H2Stream, StreamId, StreamLookup, StreamTable};
use super::{
    CONNECTION_PREFACE, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_FRAME_SIZE,
};
use crate::http::upgrade::{UpgradeRequest, BAD_REQUEST, SWITCHING_PROTOCOLS};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Default cap on an accumulated HEADERS + CONTINUATION block
pub const DEFAULT_MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// How the connection reaches HTTP/2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// The client preface comes first (TLS with ALPN "h2", or prior knowledge)
    Direct,
    /// An HTTP/1.1 request with `Upgrade: h2c` comes first
    Upgrade,
    /// Clear text; decided from the first bytes received
    Detect,
}

impl Negotiation {
    /// Negotiation implied by the protocol ALPN selected
    pub fn from_alpn(protocol: Option<&[u8]>) -> Result<Self> {
        match protocol {
            Some(b"h2") => Ok(Negotiation::Direct),
            other => Err(Error::AlpnFailed(other.map(<[u8]>::to_vec))),
        }
    }
}

/// What to do when a header block fails to decompress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionErrorPolicy {
    /// RST_STREAM(COMPRESSION_ERROR) on the stream, keep the connection
    #[default]
    ResetStream,
    /// GOAWAY(COMPRESSION_ERROR)
    CloseConnection,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SETTINGS advertised to the peer
    pub settings: Settings,
    /// Session receive window; values above 65535 are granted with a
    /// stream 0 WINDOW_UPDATE right after our SETTINGS
    pub connection_window_size: u32,
    pub compression_error_policy: CompressionErrorPolicy,
    /// Largest header block accepted, summed over CONTINUATION frames
    pub max_header_block_size: usize,
    /// Whether responses may carry server pushes
    pub push_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            settings: Settings {
                header_table_size: Some(DEFAULT_HEADER_TABLE_SIZE),
                enable_push: Some(false),
                max_concurrent_streams: Some(100),
                initial_window_size: Some(DEFAULT_INITIAL_WINDOW_SIZE),
                max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
                ..Settings::new()
            },
            connection_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            compression_error_policy: CompressionErrorPolicy::default(),
            max_header_block_size: DEFAULT_MAX_HEADER_BLOCK_SIZE,
            push_enabled: false,
        }
    }
}

/// Notification raised by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The preface and the peer's first SETTINGS were accepted
    ConnectionEstablished,
    /// The peer acknowledged our SETTINGS
    SettingsAcknowledged,
    /// A complete header block arrived (request headers or trailers)
    HeadersReceived {
        stream_id: StreamId,
        headers: HeaderList,
        end_stream: bool,
    },
    /// A request arrived in full, body included
    RequestReceived(H2Request),
    /// A request was rejected without opening (or after resetting) its stream
    InvalidRequest { stream_id: StreamId, reason: String },
    /// The last DATA (or HEADERS) of a response went out
    ResponseSent { stream_id: StreamId },
    /// The peer reset a stream
    StreamReset {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    GoAwayReceived {
        last_stream_id: StreamId,
        error_code: ErrorCode,
    },
    PingAcknowledged { data: [u8; 8] },
    /// The connection failed; a GOAWAY carrying `error_code` was queued
    ConnectionError {
        error_code: ErrorCode,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sniff,
    AwaitingUpgrade,
    AwaitingPreface,
    AwaitingSettings,
    Open,
    Closed,
}

/// Header block waiting for its CONTINUATION frames
#[derive(Debug)]
struct HeaderBlock {
    stream_id: StreamId,
    end_stream: bool,
    priority: Option<PrioritySpec>,
    fragments: BytesMut,
}

/// A server-side HTTP/2 connection
pub struct Connection {
    config: EngineConfig,
    negotiation: Negotiation,
    phase: Phase,
    /// Bytes received before the preface completed
    inbound: BytesMut,
    codec: FrameCodec,
    hpack: HeaderCodec,
    settings: SettingsTable,
    flow: FlowController,
    streams: StreamTable,
    events: VecDeque<Event>,
    out: BytesMut,
    continuation: Option<HeaderBlock>,
    goaway_received: bool,
    /// Stream 1 came from an h2c upgrade and is reported once established
    upgraded: bool,
}

impl Connection {
    /// Create a connection
    ///
    /// For [`Negotiation::Direct`] our SETTINGS are queued immediately.
    pub fn new(config: EngineConfig, negotiation: Negotiation) -> Result<Self> {
        config.settings.validate()?;
        let local = config.settings.clone();

        let mut connection = Connection {
            phase: match negotiation {
                Negotiation::Direct => Phase::AwaitingPreface,
                Negotiation::Upgrade => Phase::AwaitingUpgrade,
                Negotiation::Detect => Phase::Sniff,
            },
            negotiation,
            inbound: BytesMut::new(),
            codec: FrameCodec::with_max_frame_size(local.get_max_frame_size()),
            hpack: HeaderCodec::new(),
            flow: FlowController::new(local.get_initial_window_size()),
            streams: StreamTable::new(local.get_max_concurrent_streams()),
            settings: SettingsTable::new(local),
            events: VecDeque::new(),
            out: BytesMut::new(),
            continuation: None,
            goaway_received: false,
            upgraded: false,
            config,
        };

        if negotiation == Negotiation::Direct {
            connection.send_local_settings()?;
        }
        debug!(?negotiation, "HTTP/2 connection created");
        Ok(connection)
    }

    /// Process bytes received from the peer
    ///
    /// A connection-level error queues a GOAWAY, closes the connection and
    /// is returned. Stream-level errors are answered with RST_STREAM and do
    /// not surface here.
    pub fn recv(&mut self, data: &[u8]) -> Result<()> {
        if self.phase == Phase::Closed {
            return Err(Error::ConnectionClosed);
        }

        match self.phase {
            Phase::Sniff | Phase::AwaitingUpgrade | Phase::AwaitingPreface => {
                self.inbound.extend_from_slice(data)
            }
            _ => self.codec.feed(data),
        }

        self.process().map_err(|err| self.fail(err))
    }

    /// Next pending event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Take every byte queued for the peer
    pub fn take_pending_send(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    /// Whether bytes are queued for the peer
    pub fn has_pending_send(&self) -> bool {
        !self.out.is_empty()
    }

    /// Start the response for `stream_id`
    ///
    /// Promises for `response.pushes` go out first (when pushing is
    /// allowed), then the response HEADERS. Bodies are sent as flow
    /// control permits.
    pub fn send_response(&mut self, stream_id: StreamId, response: H2Response) -> Result<()> {
        if self.phase == Phase::Closed {
            return Err(Error::ConnectionClosed);
        }
        let request_headers = match self.streams.get(stream_id) {
            None => return Err(Error::StreamNotFound(stream_id)),
            Some(stream) if !stream.state().can_send() || stream.is_pushed() => {
                return Err(Error::StreamClosed(stream_id))
            }
            Some(stream) => stream.headers().cloned().unwrap_or_default(),
        };

        let H2Response {
            status,
            headers,
            body,
            pushes,
        } = response;

        let mut promised = Vec::new();
        for push in pushes {
            if !self.push_allowed() {
                debug!(stream_id, path = %push.path, "push not allowed, dropping promise");
                continue;
            }
            let promised_id = match self.streams.reserve_push(stream_id, &mut self.flow) {
                Ok(id) => id,
                Err(Error::RefusedStream(_)) => {
                    debug!(stream_id, path = %push.path, "peer stream limit reached, dropping promise");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let mut promise = HeaderList::new().with(":method", "GET");
            if let Some(scheme) = request_headers.get(":scheme") {
                promise.push(":scheme", scheme);
            }
            if let Some(authority) = request_headers.get(":authority") {
                promise.push(":authority", authority);
            }
            promise.push(":path", &push.path);

            let block = self.hpack.encode(&promise)?;
            if let Some(stream) = self.streams.get_mut(promised_id) {
                stream.set_headers(promise);
            }
            debug!(stream_id, promised_id, path = %push.path, "sending PUSH_PROMISE");
            self.write(Frame::PushPromise(PushPromiseFrame::new(
                stream_id,
                promised_id,
                block,
            )));
            promised.push((promised_id, push.response));
        }

        self.start_response(stream_id, status, &headers, body)?;
        for (promised_id, pushed) in promised {
            self.start_response(promised_id, pushed.status, &pushed.headers, pushed.body)?;
        }

        self.schedule()
    }

    /// Reset a stream with `error_code`, dropping its queued body
    pub fn reset_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) -> Result<()> {
        if self.streams.get(stream_id).is_none() {
            return Err(Error::StreamNotFound(stream_id));
        }
        self.send_reset(stream_id, error_code);
        Ok(())
    }

    /// Send a PING; its ACK raises [`Event::PingAcknowledged`]
    pub fn send_ping(&mut self, data: [u8; 8]) -> Result<()> {
        if self.phase == Phase::Closed {
            return Err(Error::ConnectionClosed);
        }
        self.write(Frame::Ping(PingFrame::new(data)));
        Ok(())
    }

    /// Close the connection with GOAWAY
    ///
    /// The GOAWAY names the last client stream processed. Bodies not yet
    /// sent are dropped; bytes already queued are kept.
    pub fn go_away(&mut self, error_code: ErrorCode) {
        if self.phase == Phase::Closed {
            return;
        }
        let last_stream_id = self.streams.last_client_stream_id();
        debug!(last_stream_id, %error_code, "sending GOAWAY");
        self.write(Frame::Goaway(GoawayFrame::new(
            last_stream_id,
            error_code,
            Bytes::new(),
        )));
        self.streams.close_all(&mut self.flow);
        self.continuation = None;
        self.phase = Phase::Closed;
    }

    /// Whether the connection has closed
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Whether the preface and first SETTINGS were accepted
    pub fn is_established(&self) -> bool {
        self.phase == Phase::Open
    }

    /// How this connection was negotiated
    pub fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Local and peer settings
    pub fn settings(&self) -> &SettingsTable {
        &self.settings
    }

    /// Flow-control windows
    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    /// Stream table
    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    fn process(&mut self) -> Result<()> {
        loop {
            let progressed = match self.phase {
                Phase::Sniff => self.sniff()?,
                Phase::AwaitingUpgrade => self.read_upgrade()?,
                Phase::AwaitingPreface => self.read_preface()?,
                Phase::AwaitingSettings | Phase::Open => return self.read_frames(),
                Phase::Closed => return Ok(()),
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Decide between the client preface and an HTTP/1.1 request
    fn sniff(&mut self) -> Result<bool> {
        let n = self.inbound.len().min(CONNECTION_PREFACE.len());
        if self.inbound[..n] != CONNECTION_PREFACE[..n] {
            debug!("no client preface, expecting HTTP/1.1 upgrade");
            self.phase = Phase::AwaitingUpgrade;
            return Ok(true);
        }
        if n < CONNECTION_PREFACE.len() {
            return Ok(false);
        }
        debug!("client preface detected");
        self.send_local_settings()?;
        self.phase = Phase::AwaitingPreface;
        Ok(true)
    }

    fn read_upgrade(&mut self) -> Result<bool> {
        let (request, head_len) = match UpgradeRequest::parse(&self.inbound) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(false),
            Err(err) => return Err(self.reject_upgrade(err)),
        };

        let body_len = request.content_length();
        if body_len > self.settings.local().get_initial_window_size() as usize {
            return Err(self.reject_upgrade(crate::http::Error::InvalidUpgrade(format!(
                "request body of {} bytes exceeds the stream window",
                body_len
            ))));
        }
        if self.inbound.len() < head_len + body_len {
            return Ok(false);
        }
        self.inbound.advance(head_len);
        let body = self.inbound.split_to(body_len).freeze();

        if let Err(err) = self.apply_peer_settings(request.settings()) {
            return Err(self.reject_upgrade(crate::http::Error::InvalidUpgrade(
                err.to_string(),
            )));
        }

        self.out.extend_from_slice(SWITCHING_PROTOCOLS);
        self.send_local_settings()?;
        debug!(
            method = request.method().as_str(),
            path = request.path(),
            body_len,
            "h2c upgrade accepted"
        );

        let headers = request.to_header_list();
        let stream = self.streams.open_remote(1, &mut self.flow)?;
        if body.is_empty() {
            stream.receive_headers(true)?;
        } else {
            stream.receive_headers(false)?;
            stream.receive_data(&body, true)?;
        }
        stream.set_headers(headers);
        self.upgraded = true;

        self.phase = Phase::AwaitingPreface;
        Ok(true)
    }

    /// Answer an unusable upgrade request with 400 and close
    fn reject_upgrade(&mut self, err: crate::http::Error) -> Error {
        warn!(error = %err, "rejecting h2c upgrade");
        self.out.extend_from_slice(BAD_REQUEST);
        self.events.push_back(Event::InvalidRequest {
            stream_id: 0,
            reason: err.to_string(),
        });
        self.phase = Phase::Closed;
        Error::Http(err)
    }

    fn read_preface(&mut self) -> Result<bool> {
        let n = self.inbound.len().min(CONNECTION_PREFACE.len());
        if self.inbound[..n] != CONNECTION_PREFACE[..n] {
            return Err(Error::MissingPreface);
        }
        if n < CONNECTION_PREFACE.len() {
            return Ok(false);
        }

        self.inbound.advance(n);
        let rest = self.inbound.split();
        self.codec.feed(&rest);
        trace!("client preface received");
        self.phase = Phase::AwaitingSettings;
        Ok(true)
    }

    fn read_frames(&mut self) -> Result<()> {
        while self.phase == Phase::AwaitingSettings || self.phase == Phase::Open {
            let frame = match self.codec.read_frame() {
                Ok(frame) => frame,
                Err(DecodeError::Incomplete) => return Ok(()),
                Err(DecodeError::Malformed(err)) => return Err(err),
            };
            trace!(frame = frame.name(), stream_id = frame.stream_id(), "recv");

            if self.phase == Phase::AwaitingSettings
                && !matches!(&frame, Frame::Settings(settings) if !settings.ack)
            {
                return Err(Error::Protocol(format!(
                    "first frame after the preface was {} instead of SETTINGS",
                    frame.name()
                )));
            }
            self.dispatch(frame)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        if let Some(block) = &self.continuation {
            let continues = matches!(
                &frame,
                Frame::Continuation(c) if c.stream_id == block.stream_id
            );
            if !continues {
                return Err(Error::Protocol(format!(
                    "{} while the header block of stream {} is open",
                    frame.name(),
                    block.stream_id
                )));
            }
        }

        match frame {
            Frame::Data(frame) => self.on_data(frame),
            Frame::Headers(frame) => self.on_headers(frame),
            Frame::Priority(frame) => self.on_priority(frame),
            Frame::RstStream(frame) => self.on_rst_stream(frame),
            Frame::Settings(frame) => self.on_settings(frame),
            Frame::PushPromise(_) => Err(Error::Protocol("client sent PUSH_PROMISE".to_string())),
            Frame::Ping(frame) => self.on_ping(frame),
            Frame::Goaway(frame) => self.on_goaway(frame),
            Frame::WindowUpdate(frame) => self.on_window_update(frame),
            Frame::Continuation(frame) => self.on_continuation(frame),
            Frame::Unknown(frame) => {
                trace!(frame_type = frame.frame_type, "skipping frame of unknown type");
                Ok(())
            }
        }
    }

    fn on_data(&mut self, frame: DataFrame) -> Result<()> {
        let stream_id = frame.stream_id;
        // Padding counts against flow control
        let flow_len = frame.frame_size();

        match self.streams.lookup(stream_id) {
            StreamLookup::Idle => {
                return Err(Error::Protocol(format!("DATA on idle stream {}", stream_id)))
            }
            StreamLookup::Closed if self.streams.was_reset(stream_id) => {
                self.flow.account_receive(stream_id, flow_len)?;
                self.replenish(WindowTarget::Connection);
                return Ok(());
            }
            StreamLookup::Closed => {
                return Err(Error::Protocol(format!("DATA on closed stream {}", stream_id)))
            }
            StreamLookup::Active => {}
        }

        self.flow.account_receive(stream_id, flow_len)?;
        self.replenish(WindowTarget::Connection);

        let received = match self.streams.get_mut(stream_id) {
            Some(stream) => stream.receive_data(&frame.data, frame.end_stream),
            None => Ok(()),
        };
        if let Err(err) = received {
            return self.stream_error(stream_id, err);
        }

        if frame.end_stream {
            self.complete_request(stream_id);
        } else {
            self.replenish(WindowTarget::Stream(stream_id));
        }
        Ok(())
    }

    fn on_headers(&mut self, frame: HeadersFrame) -> Result<()> {
        let block = HeaderBlock {
            stream_id: frame.stream_id,
            end_stream: frame.end_stream,
            priority: frame.priority,
            fragments: BytesMut::from(&frame.header_block[..]),
        };
        self.continue_block(block, frame.end_headers)
    }

    fn on_continuation(&mut self, frame: ContinuationFrame) -> Result<()> {
        let Some(mut block) = self.continuation.take() else {
            return Err(Error::Protocol(format!(
                "CONTINUATION on stream {} without a header block",
                frame.stream_id
            )));
        };
        block.fragments.extend_from_slice(&frame.header_block);
        self.continue_block(block, frame.end_headers)
    }

    fn continue_block(&mut self, block: HeaderBlock, end_headers: bool) -> Result<()> {
        if block.fragments.len() > self.config.max_header_block_size {
            return Err(Error::EnhanceYourCalm(format!(
                "header block on stream {} exceeds {} bytes",
                block.stream_id, self.config.max_header_block_size
            )));
        }
        if end_headers {
            self.on_header_block(block)
        } else {
            self.continuation = Some(block);
            Ok(())
        }
    }

    fn on_header_block(&mut self, block: HeaderBlock) -> Result<()> {
        let stream_id = block.stream_id;

        // Every block goes through the decoder, even on streams we refuse,
        // so its dynamic table stays in step with the peer's encoder
        let decoded = match self.hpack.decode(&block.fragments) {
            Err(err)
                if self.config.compression_error_policy
                    == CompressionErrorPolicy::CloseConnection =>
            {
                return Err(err)
            }
            result => result,
        };

        match self.streams.lookup(stream_id) {
            StreamLookup::Active => {
                return self.on_trailers(stream_id, block.end_stream, decoded);
            }
            StreamLookup::Closed if self.streams.was_reset(stream_id) => return Ok(()),
            StreamLookup::Closed => {
                return Err(Error::Protocol(format!(
                    "HEADERS on closed stream {}",
                    stream_id
                )))
            }
            StreamLookup::Idle => {}
        }

        if stream_id % 2 == 0 {
            let reason = format!("client opened even stream {}", stream_id);
            debug!(stream_id, "invalid request: {}", reason);
            self.events
                .push_back(Event::InvalidRequest { stream_id, reason });
            return Ok(());
        }

        match self.streams.open_remote(stream_id, &mut self.flow).map(|_| ()) {
            Ok(()) => {}
            Err(Error::RefusedStream(_)) => {
                debug!(stream_id, "refusing stream over MAX_CONCURRENT_STREAMS");
                self.send_reset(stream_id, ErrorCode::RefusedStream);
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let headers = match decoded {
            Ok(headers) => headers,
            Err(err) => return self.stream_error(stream_id, err),
        };

        let opened = match self.streams.get_mut(stream_id) {
            Some(stream) => open_request(stream, &block, &headers),
            None => Ok(()),
        };
        if let Err(err) = opened {
            if let Error::InvalidHeader(reason) = &err {
                self.events.push_back(Event::InvalidRequest {
                    stream_id,
                    reason: reason.clone(),
                });
            }
            return self.stream_error(stream_id, err);
        }

        trace!(stream_id, fields = headers.len(), "request headers received");
        self.events.push_back(Event::HeadersReceived {
            stream_id,
            headers,
            end_stream: block.end_stream,
        });
        if block.end_stream {
            self.complete_request(stream_id);
        }
        Ok(())
    }

    fn on_trailers(
        &mut self,
        stream_id: StreamId,
        end_stream: bool,
        decoded: Result<HeaderList>,
    ) -> Result<()> {
        let trailers = match decoded {
            Ok(trailers) => trailers,
            Err(err) => return self.stream_error(stream_id, err),
        };

        let accepted = match self.streams.get_mut(stream_id) {
            Some(stream) => accept_trailers(stream, end_stream, &trailers),
            None => Ok(()),
        };
        if let Err(err) = accepted {
            if let Error::InvalidHeader(reason) = &err {
                self.events.push_back(Event::InvalidRequest {
                    stream_id,
                    reason: reason.clone(),
                });
            }
            return self.stream_error(stream_id, err);
        }

        self.events.push_back(Event::HeadersReceived {
            stream_id,
            headers: trailers,
            end_stream,
        });
        self.complete_request(stream_id);
        Ok(())
    }

    fn on_priority(&mut self, frame: PriorityFrame) -> Result<()> {
        if self.streams.lookup(frame.stream_id) != StreamLookup::Active {
            return Ok(());
        }
        let updated = match self.streams.get_mut(frame.stream_id) {
            Some(stream) => stream.set_priority(frame.priority),
            None => Ok(()),
        };
        match updated {
            Ok(()) => Ok(()),
            Err(err) => self.stream_error(frame.stream_id, err),
        }
    }

    fn on_rst_stream(&mut self, frame: RstStreamFrame) -> Result<()> {
        let stream_id = frame.stream_id;
        match self.streams.lookup(stream_id) {
            StreamLookup::Idle => Err(Error::Protocol(format!(
                "RST_STREAM on idle stream {}",
                stream_id
            ))),
            StreamLookup::Closed => Ok(()),
            StreamLookup::Active => {
                if let Some(mut stream) = self.streams.close(stream_id, &mut self.flow) {
                    stream.reset();
                }
                debug!(stream_id, error_code = %frame.error_code, "stream reset by peer");
                self.events.push_back(Event::StreamReset {
                    stream_id,
                    error_code: frame.error_code,
                });
                self.finish_if_idle();
                Ok(())
            }
        }
    }

    fn on_settings(&mut self, frame: SettingsFrame) -> Result<()> {
        if frame.ack {
            self.settings.acknowledge()?;
            debug!("SETTINGS acknowledged by peer");
            self.events.push_back(Event::SettingsAcknowledged);
            return Ok(());
        }

        self.apply_peer_settings(&frame.settings)?;
        self.write(Frame::Settings(SettingsFrame::ack()));

        if self.phase == Phase::AwaitingSettings {
            self.establish();
        }
        self.schedule()
    }

    fn on_ping(&mut self, frame: PingFrame) -> Result<()> {
        if frame.ack {
            self.events
                .push_back(Event::PingAcknowledged { data: frame.data });
        } else {
            self.write(Frame::Ping(PingFrame::ack(frame.data)));
        }
        Ok(())
    }

    fn on_goaway(&mut self, frame: GoawayFrame) -> Result<()> {
        debug!(
            last_stream_id = frame.last_stream_id,
            error_code = %frame.error_code,
            "GOAWAY received"
        );
        self.goaway_received = true;
        self.events.push_back(Event::GoAwayReceived {
            last_stream_id: frame.last_stream_id,
            error_code: frame.error_code,
        });
        for stream_id in self
            .streams
            .close_pushed_above(frame.last_stream_id, &mut self.flow)
        {
            trace!(stream_id, "pushed stream dropped by GOAWAY");
        }
        self.finish_if_idle();
        Ok(())
    }

    fn on_window_update(&mut self, frame: WindowUpdateFrame) -> Result<()> {
        let target = WindowTarget::from_stream_id(frame.stream_id);
        match target {
            WindowTarget::Connection => {
                self.flow.credit_received(target, frame.size_increment)?;
            }
            WindowTarget::Stream(stream_id) => match self.streams.lookup(stream_id) {
                StreamLookup::Idle => {
                    return Err(Error::Protocol(format!(
                        "WINDOW_UPDATE on idle stream {}",
                        stream_id
                    )))
                }
                StreamLookup::Closed => return Ok(()),
                StreamLookup::Active => {
                    if let Err(err) = self.flow.credit_received(target, frame.size_increment) {
                        return self.stream_error(stream_id, err);
                    }
                }
            },
        }
        self.schedule()
    }

    fn establish(&mut self) {
        self.phase = Phase::Open;
        debug!("HTTP/2 connection established");
        self.events.push_back(Event::ConnectionEstablished);

        if self.upgraded {
            self.upgraded = false;
            if let Some(headers) = self.streams.get(1).and_then(H2Stream::headers).cloned() {
                self.events.push_back(Event::HeadersReceived {
                    stream_id: 1,
                    headers,
                    end_stream: true,
                });
            }
            self.complete_request(1);
        }
    }

    /// Commit peer SETTINGS together with the stream window shift they imply
    fn apply_peer_settings(&mut self, incoming: &Settings) -> Result<()> {
        let flow = &mut self.flow;
        let delta = self.settings.apply_with(incoming, |delta| match delta.initial_window_delta {
            0 => Ok(()),
            change => flow.apply_initial_window_delta(change),
        })?;
        if let Some(size) = delta.header_table_size {
            self.hpack.set_peer_table_size(size);
        }
        if let Some(max) = delta.max_concurrent_streams {
            self.streams.set_peer_max_concurrent_streams(Some(max));
        }
        debug!(?delta, "peer SETTINGS applied");
        Ok(())
    }

    fn send_local_settings(&mut self) -> Result<()> {
        let local = self.settings.local().clone();
        self.write(Frame::Settings(SettingsFrame::new(local)));
        self.settings.local_sent();

        if let Some(increment) = self
            .flow
            .expand_connection_window(self.config.connection_window_size)?
        {
            self.write(Frame::WindowUpdate(WindowUpdateFrame::new(0, increment)));
        }
        Ok(())
    }

    fn complete_request(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return;
        };
        let request = H2Request {
            stream_id,
            headers: stream.headers().cloned().unwrap_or_default(),
            body: stream.take_body(),
            trailers: stream.trailers().cloned(),
        };
        debug!(stream_id, body_len = request.body.len(), "request received");
        self.events.push_back(Event::RequestReceived(request));

        // The response may already have ended our side
        if self.streams.close_if_done(stream_id, &mut self.flow) {
            self.finish_if_idle();
        }
    }

    fn start_response(
        &mut self,
        stream_id: StreamId,
        status: u16,
        headers: &HeaderList,
        body: Bytes,
    ) -> Result<()> {
        let end_stream = body.is_empty();

        // Check the stream before encoding; an encoded block must be sent
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::StreamNotFound(stream_id))?;
        stream.send_headers(end_stream)?;
        if !end_stream {
            stream.queue_body(body, true);
        }

        let mut fields = HeaderList::new().with(":status", status.to_string());
        for (name, value) in headers.regular() {
            fields.push(name, value);
        }
        let block = self.hpack.encode(&fields)?;
        trace!(stream_id, status, "sending response HEADERS");
        self.write(Frame::Headers(HeadersFrame::new(
            stream_id, block, end_stream, true,
        )));

        if end_stream {
            self.response_done(stream_id);
        }
        Ok(())
    }

    /// Send queued bodies as far as the windows allow
    fn schedule(&mut self) -> Result<()> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        // One frame per stream per round keeps streams interleaved
        loop {
            let mut progressed = false;
            for stream_id in self.streams.pending_ids() {
                progressed |= self.send_chunk(stream_id)?;
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn send_chunk(&mut self, stream_id: StreamId) -> Result<bool> {
        let limit = self
            .flow
            .sendable(stream_id)
            .min(self.peer_max_frame_size());
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(false);
        };
        if limit == 0 && stream.pending_len() > 0 {
            trace!(stream_id, "DATA blocked on flow control");
            return Ok(false);
        }
        let Some((chunk, end_stream)) = stream.next_chunk(limit) else {
            return Ok(false);
        };
        stream.send_data(chunk.len(), end_stream)?;
        if !self.flow.reserve_send(stream_id, chunk.len()) {
            return Err(Error::Internal(format!(
                "send window of stream {} shrank during scheduling",
                stream_id
            )));
        }

        self.write(Frame::Data(DataFrame::new(stream_id, chunk, end_stream)));
        if end_stream {
            self.response_done(stream_id);
        }
        Ok(true)
    }

    fn response_done(&mut self, stream_id: StreamId) {
        debug!(stream_id, "response sent");
        self.events.push_back(Event::ResponseSent { stream_id });
        self.streams.close_if_done(stream_id, &mut self.flow);
        self.finish_if_idle();
    }

    fn stream_error(&mut self, stream_id: StreamId, err: Error) -> Result<()> {
        warn!(stream_id, error = %err, "stream error");
        self.send_reset(stream_id, err.code());
        Ok(())
    }

    fn send_reset(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        self.write(Frame::RstStream(RstStreamFrame::new(stream_id, error_code)));
        self.streams.reset(stream_id, &mut self.flow);
        self.finish_if_idle();
    }

    fn replenish(&mut self, target: WindowTarget) {
        if let Some(increment) = self.flow.auto_replenish(target) {
            self.write(Frame::WindowUpdate(WindowUpdateFrame::new(
                target.stream_id(),
                increment,
            )));
        }
    }

    /// After a peer GOAWAY the connection ends with its last stream
    fn finish_if_idle(&mut self) {
        if self.goaway_received && self.streams.active_count() == 0 && self.phase != Phase::Closed {
            debug!("no streams left after GOAWAY, closing");
            self.phase = Phase::Closed;
        }
    }

    fn push_allowed(&self) -> bool {
        self.config.push_enabled && self.settings.remote().get_enable_push() && !self.goaway_received
    }

    fn peer_max_frame_size(&self) -> usize {
        self.settings.remote().get_max_frame_size() as usize
    }

    fn write(&mut self, frame: Frame) {
        trace!(frame = frame.name(), stream_id = frame.stream_id(), "send");
        FrameCodec::write_frame(&frame, self.peer_max_frame_size(), &mut self.out);
    }

    /// Connection-fatal error: queue GOAWAY and close
    fn fail(&mut self, err: Error) -> Error {
        if self.phase == Phase::Closed {
            return err;
        }
        let error_code = err.code();
        let reason = err.to_string();
        warn!(error = %reason, %error_code, "connection error");

        self.write(Frame::Goaway(GoawayFrame::new(
            self.streams.last_client_stream_id(),
            error_code,
            Bytes::from(reason.clone()),
        )));
        self.streams.close_all(&mut self.flow);
        self.continuation = None;
        self.events
            .push_back(Event::ConnectionError { error_code, reason });
        self.phase = Phase::Closed;
        err
    }
}

fn open_request(stream: &mut H2Stream, block: &HeaderBlock, headers: &HeaderList) -> Result<()> {
    if let Some(priority) = block.priority {
        stream.set_priority(priority)?;
    }
    stream.receive_headers(block.end_stream)?;
    headers.validate_request()?;
    stream.set_headers(headers.clone());
    Ok(())
}

fn accept_trailers(stream: &mut H2Stream, end_stream: bool, trailers: &HeaderList) -> Result<()> {
    stream.receive_headers(end_stream)?;
    trailers.validate_trailers()?;
    stream.set_trailers(trailers.clone());
    Ok(())
}
