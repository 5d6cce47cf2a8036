//! TLS support for HTTP/2 connections
//!
//! The TLS implementation uses the session operations abstraction pattern:
//!
//! 1. `TlsConfig` defines TLS settings (versions, certificates, ALPN)
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//! 3. The HTTP/2 driver is unchanged; it reads the ALPN result through
//!    `SessionOps::alpn_protocol` and picks direct HTTP/2 when "h2" was selected
//!
//! # Examples
//!
//! ```no_run
//! use h2engine::http::h2::H2ServerBuilder;
//! use h2engine::http::tls::{TlsConfig, TlsVersion, ALPN_H2};
//! use h2engine::http::HttpSession;
//! use std::net::TcpListener;
//!
//! let tls_config = TlsConfig::server()?
//!     .cert_file("server.pem")?
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)?
//!     .alpn(&[ALPN_H2])?
//!     .build()?;
//!
//! let listener = TcpListener::bind("127.0.0.1:8443")?;
//! let (tcp_stream, _) = listener.accept()?;
//! let tls_session = tls_config.accept(tcp_stream)?;
//! let mut server = H2ServerBuilder::new().build(HttpSession::new(tls_session));
//! server.handshake()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod session;

pub use config::{
    ClientConfigBuilder, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion, ALPN_H2,
    ALPN_HTTP11,
};
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
