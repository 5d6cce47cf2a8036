//! Shared helpers for the integration tests
//!
//! [`Peer`] plays the client side of a connection at the frame level: it
//! encodes frames and header blocks for the engine and decodes what the
//! engine sends back, keeping its own HPACK state in step.

#![allow(dead_code)]

use bytes::Bytes;
use h2engine::http::h2::frames::{GoawayFrame, RstStreamFrame, WindowUpdateFrame};
use h2engine::http::h2::{
    Connection, EngineConfig, Event, Frame, FrameCodec, HeaderCodec, HeaderList, HeadersFrame,
    Negotiation, Settings, SettingsFrame, CONNECTION_PREFACE, MAX_ALLOWED_FRAME_SIZE,
};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder};

/// Client half of a connection under test
pub struct Peer {
    codec: FrameCodec,
    encoder: HeaderCodec,
    decoder: HeaderCodec,
}

impl Peer {
    pub fn new() -> Self {
        Peer {
            codec: FrameCodec::with_max_frame_size(MAX_ALLOWED_FRAME_SIZE),
            encoder: HeaderCodec::new(),
            decoder: HeaderCodec::new(),
        }
    }

    /// Client preface followed by a SETTINGS frame
    pub fn preface(&self, settings: Settings) -> Vec<u8> {
        let mut wire = CONNECTION_PREFACE.to_vec();
        wire.extend_from_slice(&self.frame(Frame::Settings(SettingsFrame::new(settings))));
        wire
    }

    /// Encode a single frame, unsplit
    pub fn frame(&self, frame: Frame) -> Vec<u8> {
        FrameCodec::encode_frame(&frame).to_vec()
    }

    /// HPACK-encode `headers` with the client's encoder
    pub fn encode(&mut self, headers: &HeaderList) -> Bytes {
        self.encoder.encode(headers).unwrap()
    }

    /// A complete HEADERS frame carrying `headers`
    pub fn headers(&mut self, stream_id: u32, headers: &HeaderList, end_stream: bool) -> Vec<u8> {
        let block = self.encode(headers);
        self.frame(Frame::Headers(HeadersFrame::new(
            stream_id, block, end_stream, true,
        )))
    }

    pub fn settings_ack(&self) -> Vec<u8> {
        self.frame(Frame::Settings(SettingsFrame::ack()))
    }

    pub fn window_update(&self, stream_id: u32, increment: u32) -> Vec<u8> {
        self.frame(Frame::WindowUpdate(WindowUpdateFrame::new(stream_id, increment)))
    }

    pub fn rst_stream(&self, stream_id: u32, error_code: h2engine::http::h2::ErrorCode) -> Vec<u8> {
        self.frame(Frame::RstStream(RstStreamFrame::new(stream_id, error_code)))
    }

    pub fn goaway(&self, last_stream_id: u32, error_code: h2engine::http::h2::ErrorCode) -> Vec<u8> {
        self.frame(Frame::Goaway(GoawayFrame::new(
            last_stream_id,
            error_code,
            Bytes::new(),
        )))
    }

    /// Decode every complete frame in `wire`
    pub fn read(&mut self, wire: &[u8]) -> Vec<Frame> {
        self.codec.feed(wire);
        let mut frames = Vec::new();
        while let Ok(frame) = self.codec.read_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Decode a header block sent by the server, in wire order
    pub fn decode(&mut self, block: &[u8]) -> HeaderList {
        self.decoder.decode(block).unwrap()
    }
}

impl Default for Peer {
    fn default() -> Self {
        Self::new()
    }
}

/// `GET path` over https on example.com
pub fn get(path: &str) -> HeaderList {
    HeaderList::new()
        .with(":method", "GET")
        .with(":scheme", "https")
        .with(":authority", "example.com")
        .with(":path", path)
}

/// `POST path` over https on example.com
pub fn post(path: &str) -> HeaderList {
    HeaderList::new()
        .with(":method", "POST")
        .with(":scheme", "https")
        .with(":authority", "example.com")
        .with(":path", path)
}

/// Every event queued on `connection`
pub fn events(connection: &mut Connection) -> Vec<Event> {
    std::iter::from_fn(|| connection.poll_event()).collect()
}

/// Requests received among `events`
pub fn requests(events: &[Event]) -> Vec<&h2engine::http::h2::H2Request> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::RequestReceived(request) => Some(request),
            _ => None,
        })
        .collect()
}

/// A direct connection past the SETTINGS exchange, with output and
/// events drained
pub fn established(config: EngineConfig, client: Settings) -> (Connection, Peer) {
    let mut connection = Connection::new(config, Negotiation::Direct).unwrap();
    let mut peer = Peer::new();

    let mut wire = peer.preface(client);
    wire.extend_from_slice(&peer.settings_ack());
    connection.recv(&wire).unwrap();
    assert!(connection.is_established());

    peer.read(&connection.take_pending_send());
    events(&mut connection);
    (connection, peer)
}

/// Self-signed certificate and key for "localhost", as one PEM
pub fn self_signed_pem() -> Vec<u8> {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "localhost").unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    let mut pem = builder.build().to_pem().unwrap();
    pem.extend_from_slice(&key.private_key_to_pem_pkcs8().unwrap());
    pem
}

/// Install a test subscriber honouring RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
