//! HTTP/2 protocol implementation
//!
//! This module provides a server-side HTTP/2 connection engine (RFC 7540).
//!
//! # Architecture
//!
//! The pieces are layered leaves first:
//!
//! - **codec** / **frames**: binary framing, one [`Frame`] variant per type
//! - **hpack** / **headers**: header block compression and header list rules
//! - **settings**: SETTINGS parameters and the local/remote settings table
//! - **flow_control**: session and per-stream send/receive windows
//! - **stream**: stream state machine and the stream table
//! - **connection**: the sans-IO engine that ties them together; bytes go in
//!   through [`Connection::recv`], events and output bytes come out
//! - **server**: a blocking driver running a [`Connection`] over a
//!   [`SessionOps`](crate::http::SessionOps) transport
//!
//! A connection is reached directly (TLS with ALPN "h2", or prior
//! knowledge on clear text) or through an HTTP/1.1 `Upgrade: h2c` request.
//!
//! # Examples
//!
//! ```no_run
//! use h2engine::http::h2::{H2Response, H2ServerBuilder};
//! use h2engine::http::session::from_tcp_stream;
//! use std::net::TcpListener;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("127.0.0.1:8080")?;
//! let (tcp_stream, _) = listener.accept()?;
//!
//! let mut server = H2ServerBuilder::new()
//!     .detect()
//!     .max_concurrent_streams(100)
//!     .build(from_tcp_stream(tcp_stream));
//!
//! server.serve(|request| {
//!     H2Response::new(200)
//!         .header("content-type", "text/plain")
//!         .body(format!("you asked for {}", request.path().unwrap_or("/")))
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod headers;
pub mod hpack;
pub mod server;
pub mod settings;
pub mod stream;

pub use codec::{DecodeError, FrameCodec};
pub use connection::{CompressionErrorPolicy, Connection, EngineConfig, Event, Negotiation};
pub use error::{Error, ErrorCode, Result};
pub use flow_control::{FlowControlWindow, FlowController, WindowTarget};
pub use frames::{DataFrame, Frame, FrameFlags, FrameType, HeadersFrame, SettingsFrame};
pub use headers::HeaderList;
pub use hpack::HeaderCodec;
pub use server::{H2Request, H2Response, H2Server, H2ServerBuilder, PushedResponse};
pub use settings::{Settings, SettingsBuilder, SettingsTable};
pub use stream::{H2Stream, StreamId, StreamState, StreamTable};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Largest flow-control window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Largest MAX_FRAME_SIZE a peer may advertise (2^24 - 1)
pub const MAX_ALLOWED_FRAME_SIZE: u32 = 16_777_215;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
