//! openssl streams as a [`SessionOps`] transport
//!
//! The handshake runs when the session is created, so the ALPN result is
//! known before the HTTP/2 driver reads its first byte.

use super::config::{TlsConfig, TlsError};
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{Ssl, SslStream};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// An established TLS stream and what its handshake negotiated
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    alpn: Option<Vec<u8>>,
    version: &'static str,
    failed: bool,
}

impl TlsSessionOps {
    /// Run a blocking client handshake over `tcp_stream`
    pub fn connect(tcp_stream: TcpStream, config: TlsConfig) -> std::result::Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;
        if let Some(ref servername) = config.servername {
            ssl.set_hostname(servername)?;
        }

        let ssl_stream = ssl
            .connect(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Connection failed: {}", e)))?;

        Ok(Self::established(ssl_stream))
    }

    /// Run a blocking server handshake over an accepted `tcp_stream`
    pub fn accept(tcp_stream: TcpStream, config: TlsConfig) -> std::result::Result<Self, TlsError> {
        let ssl = Ssl::new(&config.ctx)?;

        let ssl_stream = ssl
            .accept(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("Accept failed: {}", e)))?;

        Ok(Self::established(ssl_stream))
    }

    fn established(stream: SslStream<TcpStream>) -> Self {
        let alpn = stream.ssl().selected_alpn_protocol().map(<[u8]>::to_vec);
        let version = stream.ssl().version_str();
        tracing::debug!(
            version,
            alpn = ?alpn.as_deref().map(String::from_utf8_lossy),
            "TLS handshake complete"
        );

        TlsSessionOps {
            stream,
            alpn,
            version,
            failed: false,
        }
    }

    /// Negotiated protocol version, such as "TLSv1.3"
    pub fn version(&self) -> &'static str {
        self.version
    }

    /// Whether an I/O error has poisoned the stream; no close_notify is
    /// sent then
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// The TCP stream under the TLS layer
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        // Decrypted bytes already buffered by OpenSSL do not show on the fd
        if events.wants_read() && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }
        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        self.stream.read(buf).map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        self.stream.write(buf).map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.stream.flush().map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    fn close(&mut self) -> HttpResult<()> {
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use super::super::config::{ALPN_H2, ALPN_HTTP11};
    use super::super::TlsVersion;
    use openssl::asn1::Asn1Time;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    /// Self-signed certificate and key for "localhost", as one PEM
    pub(crate) fn self_signed_pem() -> Vec<u8> {
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

    fn handshake(server_alpn: &[&'static str], client_alpn: &[&'static str]) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_config = TlsConfig::server()
            .unwrap()
            .cert_pem(&self_signed_pem())
            .unwrap()
            .alpn(server_alpn)
            .unwrap()
            .build()
            .unwrap();

        let client_config = TlsConfig::client()
            .unwrap()
            .version(TlsVersion::Tls13)
            .unwrap()
            .verify_peer(false)
            .alpn(client_alpn)
            .unwrap()
            .build()
            .unwrap();

        let server_handle = thread::spawn(move || {
            let (tcp_stream, _) = listener.accept().unwrap();
            let mut tls_session = server_config.accept(tcp_stream).unwrap();

            let mut buf = [0u8; 5];
            let n = tls_session.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"Hello");
            tls_session.write(b"World").unwrap();
            tls_session.flush().unwrap();

            let alpn = tls_session.alpn_protocol().map(<[u8]>::to_vec);
            tls_session.close().unwrap();
            alpn
        });

        let tcp_stream = TcpStream::connect(addr).unwrap();
        let mut tls_session = client_config.connect(tcp_stream).unwrap();
        assert!(!tls_session.failed());
        assert_eq!(tls_session.version(), "TLSv1.3");

        tls_session.write(b"Hello").unwrap();
        let mut buf = [0u8; 5];
        let n = tls_session.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"World");

        let client_alpn = tls_session.alpn_protocol().map(<[u8]>::to_vec);
        tls_session.close().unwrap();

        (server_handle.join().unwrap(), client_alpn)
    }

    #[test]
    fn test_tls_handshake_selects_h2() {
        let (server, client) = handshake(&[ALPN_H2, ALPN_HTTP11], &[ALPN_HTTP11, ALPN_H2]);
        assert_eq!(server.as_deref(), Some(b"h2".as_slice()));
        assert_eq!(client.as_deref(), Some(b"h2".as_slice()));
    }

    #[test]
    fn test_tls_handshake_without_common_protocol() {
        let (server, client) = handshake(&[ALPN_H2], &[ALPN_HTTP11]);
        assert_eq!(server, None);
        assert_eq!(client, None);
    }
}
