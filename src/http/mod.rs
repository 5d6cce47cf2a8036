//! Transport and HTTP/1.1 glue for the HTTP/2 engine
//!
//! The engine itself lives in [`h2`]. This module provides what sits
//! around it:
//!
//! - `SessionOps` trait defines operations (poll, read, write, flush, close)
//! - `HttpSession` wraps a `SessionOps` with an I/O timeout
//! - [`tls`] implements `SessionOps` over openssl, with ALPN
//! - [`upgrade`] parses the HTTP/1.1 request of an `Upgrade: h2c` exchange
//!
//! # Examples
//!
//! ```no_run
//! use h2engine::http::h2::H2ServerBuilder;
//! use h2engine::http::session::from_tcp_stream;
//! use std::net::TcpListener;
//!
//! let listener = TcpListener::bind("127.0.0.1:8080").unwrap();
//! let (stream, _) = listener.accept().unwrap();
//! let mut server = H2ServerBuilder::new()
//!     .detect()
//!     .build(from_tcp_stream(stream));
//! server.handshake().unwrap();
//! ```

pub mod h2;
pub mod headers;
pub mod session;
pub mod tls;
pub mod upgrade;

pub use headers::Headers;
pub use session::{HttpSession, PollEvents, SessionOps, TcpSessionOps};
pub use upgrade::UpgradeRequest;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid h2c upgrade: {0}")]
    InvalidUpgrade(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 64;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
