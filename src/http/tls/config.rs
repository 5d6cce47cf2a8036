//! openssl contexts for HTTP/2 over TLS
//!
//! Servers select "h2" through ALPN in their own preference order. Clients
//! exist for tests and tooling that talk to such a server.

use openssl::pkey::PKey;
use openssl::ssl::{AlpnError, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// ALPN identifier of HTTP/2 over TLS
pub const ALPN_H2: &str = "h2";

/// ALPN identifier of HTTP/1.1
pub const ALPN_HTTP11: &str = "http/1.1";

/// Protocol versions offered; HTTP/2 needs at least TLS 1.2
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn openssl(self) -> SslVersion {
        match self {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Accepts "TLSv1.2" or "TLS1.2" in any case
    fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_ascii_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

fn set_versions(
    ctx: &mut SslContextBuilder,
    min: TlsVersion,
    max: TlsVersion,
) -> Result<(), TlsError> {
    if min > max {
        return Err(TlsError::InvalidConfig(format!(
            "TLS version range {:?}..{:?} is empty",
            min, max
        )));
    }
    ctx.set_min_proto_version(Some(min.openssl()))?;
    ctx.set_max_proto_version(Some(max.openssl()))?;
    Ok(())
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// A built openssl context, shared by every session made from it
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: openssl::ssl::SslContext,
    pub(crate) is_server: bool,
    pub(crate) servername: Option<String>,
}

impl TlsConfig {
    pub fn client() -> Result<ClientConfigBuilder, TlsError> {
        ClientConfigBuilder::new()
    }

    pub fn server() -> Result<ServerConfigBuilder, TlsError> {
        ServerConfigBuilder::new()
    }

    /// Client handshake; fails for a server configuration
    pub fn connect(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use server config for client connection".to_string(),
            ));
        }
        super::session::TlsSessionOps::connect(stream, self.clone())
    }

    /// Server handshake; fails for a client configuration
    pub fn accept(&self, stream: std::net::TcpStream) -> Result<super::TlsSessionOps, TlsError> {
        if !self.is_server {
            return Err(TlsError::InvalidConfig(
                "Cannot use client config for server accept".to_string(),
            ));
        }
        super::session::TlsSessionOps::accept(stream, self.clone())
    }
}

/// Builder for client contexts; peers are verified unless told otherwise
pub struct ClientConfigBuilder {
    ctx_builder: SslContextBuilder,
    servername: Option<String>,
}

impl ClientConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;
        ctx_builder.set_min_proto_version(Some(TlsVersion::Tls12.openssl()))?;
        ctx_builder.set_verify(SslVerifyMode::PEER);

        Ok(ClientConfigBuilder {
            ctx_builder,
            servername: None,
        })
    }

    /// Offer exactly `version`
    pub fn version(self, version: TlsVersion) -> Result<Self, TlsError> {
        self.version_range(version, version)
    }

    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self, TlsError> {
        set_versions(&mut self.ctx_builder, min, max)?;
        Ok(self)
    }

    /// Protocols to offer, most preferred first
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        let wire = encode_alpn(protocols)?;
        self.ctx_builder.set_alpn_protos(&wire)?;
        Ok(self)
    }

    /// SNI host name sent in the ClientHello
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.ctx_builder.set_verify(if verify {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });
        self
    }

    /// Trust the certificates in a PEM file
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, TlsError> {
        self.ctx_builder.set_ca_file(path)?;
        Ok(self)
    }

    pub fn build(self) -> Result<TlsConfig, TlsError> {
        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: false,
            servername: self.servername,
        })
    }
}

/// Builder for server contexts; a certificate is mandatory
pub struct ServerConfigBuilder {
    ctx_builder: SslContextBuilder,
    has_cert: bool,
}

impl ServerConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_server())?;
        ctx_builder.set_min_proto_version(Some(TlsVersion::Tls12.openssl()))?;

        Ok(ServerConfigBuilder {
            ctx_builder,
            has_cert: false,
        })
    }

    /// Offer exactly `version`
    pub fn version(self, version: TlsVersion) -> Result<Self, TlsError> {
        self.version_range(version, version)
    }

    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self, TlsError> {
        set_versions(&mut self.ctx_builder, min, max)?;
        Ok(self)
    }

    /// Set the protocols this server accepts, most preferred first
    ///
    /// The first of ours that the client also offers is selected. When the
    /// client offers none of them the extension is not acknowledged and the
    /// handshake proceeds without a protocol.
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        if protocols.is_empty() {
            return Err(TlsError::InvalidConfig("empty ALPN protocol list".to_string()));
        }
        let ours: Vec<Vec<u8>> = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();

        self.ctx_builder.set_alpn_select_callback(move |_ssl, client_protos| {
            select_alpn(&ours, client_protos).ok_or(AlpnError::NOACK)
        });

        Ok(self)
    }

    /// Load server certificate and private key from one PEM file
    pub fn cert_file<P: AsRef<Path>>(self, path: P) -> Result<Self, TlsError> {
        let mut pem = Vec::new();
        File::open(path.as_ref())?.read_to_end(&mut pem)?;
        self.cert_pem(&pem)
    }

    /// Load server certificate and private key from PEM bytes
    pub fn cert_pem(mut self, pem: &[u8]) -> Result<Self, TlsError> {
        let cert = X509::from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load certificate: {}", e)))?;
        self.ctx_builder.set_certificate(&cert)?;

        let key = PKey::private_key_from_pem(pem)
            .map_err(|e| TlsError::Certificate(format!("Failed to load private key: {}", e)))?;
        self.ctx_builder.set_private_key(&key)?;
        self.ctx_builder.check_private_key()?;

        self.has_cert = true;
        Ok(self)
    }

    pub fn build(self) -> Result<TlsConfig, TlsError> {
        if !self.has_cert {
            return Err(TlsError::InvalidConfig(
                "server requires a certificate".to_string(),
            ));
        }

        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: true,
            servername: None,
        })
    }
}

/// Length-prefixed ALPN wire list
fn encode_alpn(protocols: &[&str]) -> Result<Vec<u8>, TlsError> {
    let mut wire = Vec::new();
    for proto in protocols {
        let len = u8::try_from(proto.len())
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| TlsError::InvalidConfig(format!("bad ALPN protocol {:?}", proto)))?;
        wire.push(len);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

/// Pick the first of `ours` present in the client's wire list
///
/// The returned slice borrows from `client_protos`.
fn select_alpn<'a>(ours: &[Vec<u8>], client_protos: &'a [u8]) -> Option<&'a [u8]> {
    let mut offered = Vec::new();
    let mut pos = 0;
    while pos < client_protos.len() {
        let len = client_protos[pos] as usize;
        pos += 1;
        if pos + len > client_protos.len() {
            break;
        }
        offered.push(&client_protos[pos..pos + len]);
        pos += len;
    }

    ours.iter()
        .find_map(|proto| offered.iter().copied().find(|o| *o == proto.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_str() {
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("TLS1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert!("SSLv3".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_empty_version_range() {
        let result = TlsConfig::client()
            .unwrap()
            .version_range(TlsVersion::Tls13, TlsVersion::Tls12);
        assert!(matches!(result, Err(TlsError::InvalidConfig(_))));
    }

    #[test]
    fn test_select_prefers_server_order() {
        let ours = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let client = encode_alpn(&["http/1.1", "h2"]).unwrap();
        assert_eq!(select_alpn(&ours, &client), Some(b"h2".as_slice()));

        let client = encode_alpn(&["http/1.1"]).unwrap();
        assert_eq!(select_alpn(&ours, &client), Some(b"http/1.1".as_slice()));

        let client = encode_alpn(&["spdy/3"]).unwrap();
        assert_eq!(select_alpn(&ours, &client), None);
    }

    #[test]
    fn test_select_truncated_list() {
        let ours = vec![b"h2".to_vec()];
        assert_eq!(select_alpn(&ours, &[5, b'h', b'2']), None);
    }

    #[test]
    fn test_server_requires_certificate() {
        let result = TlsConfig::server().unwrap().alpn(&[ALPN_H2]).unwrap().build();
        assert!(matches!(result, Err(TlsError::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_alpn_names() {
        assert!(encode_alpn(&[""]).is_err());
        let long = "x".repeat(256);
        assert!(encode_alpn(&[long.as_str()]).is_err());
    }
}
