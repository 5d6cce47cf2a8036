//! h2engine - server-side HTTP/2 connection engine
//!
//! This crate provides an HTTP/2 (RFC 7540) connection engine with binary
//! framing, HPACK header compression, connection and stream flow control,
//! h2c upgrade and server push, plus a blocking server driver that runs it
//! over plain TCP or TLS.

pub mod http;
