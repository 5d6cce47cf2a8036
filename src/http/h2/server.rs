//! Blocking HTTP/2 server driver
//!
//! [`H2Server`] runs a [`Connection`] over an [`HttpSession`]: it reads
//! from the transport, feeds the engine, writes what the engine queued and
//! hands complete requests to the caller.

use super::connection::{CompressionErrorPolicy, Connection, EngineConfig, Event, Negotiation};
use super::error::{Error, Result};
use super::headers::HeaderList;
use super::stream::StreamId;
use crate::http::{HttpSession, SessionOps};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

/// Read buffer size
const READ_CHUNK: usize = 16 * 1024;

/// A complete request received on a stream
#[derive(Debug, Clone, PartialEq)]
pub struct H2Request {
    /// Stream the request arrived on
    pub stream_id: StreamId,
    /// Request header list, pseudo-headers first
    pub headers: HeaderList,
    /// Request body
    pub body: Bytes,
    /// Trailer fields, if the client sent any
    pub trailers: Option<HeaderList>,
}

impl H2Request {
    /// Get :method
    pub fn method(&self) -> Option<&str> {
        self.headers.get_str(":method")
    }

    /// Get :path
    pub fn path(&self) -> Option<&str> {
        self.headers.get_str(":path")
    }

    /// Get :scheme
    pub fn scheme(&self) -> Option<&str> {
        self.headers.get_str(":scheme")
    }

    /// Get :authority
    pub fn authority(&self) -> Option<&str> {
        self.headers.get_str(":authority")
    }

    /// Get header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get_str(name)
    }

    /// Get body as bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// HTTP/2 response
#[derive(Debug, Clone, PartialEq)]
pub struct H2Response {
    /// Status code
    pub status: u16,
    /// Regular header fields; `:status` is added when sending
    pub headers: HeaderList,
    /// Body
    pub body: Bytes,
    /// Resources to push along with this response
    pub pushes: Vec<PushedResponse>,
}

impl H2Response {
    /// Create a response with no headers or body
    pub fn new(status: u16) -> Self {
        H2Response {
            status,
            headers: HeaderList::new(),
            body: Bytes::new(),
            pushes: Vec::new(),
        }
    }

    /// Add a header field; the name is lowercased
    pub fn header(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        self.headers.push(name.to_ascii_lowercase(), value);
        self
    }

    /// Set the body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Push `response` as the answer to a GET of `path`
    pub fn push(mut self, path: impl Into<String>, response: H2Response) -> Self {
        self.pushes.push(PushedResponse {
            path: path.into(),
            response,
        });
        self
    }

    /// Get status code
    pub fn status(&self) -> u16 {
        self.status
    }
}

/// A response promised with PUSH_PROMISE
#[derive(Debug, Clone, PartialEq)]
pub struct PushedResponse {
    /// `:path` of the promised request
    pub path: String,
    pub response: H2Response,
}

/// HTTP/2 server for one connection
pub struct H2Server<S: SessionOps> {
    /// HTTP session
    session: HttpSession<S>,
    config: EngineConfig,
    /// Explicit negotiation; `None` means take it from ALPN
    negotiation: Option<Negotiation>,
    connection: Option<Connection>,
    established: bool,
    /// Requests received and not yet handed out
    requests: VecDeque<H2Request>,
}

impl<S: SessionOps> H2Server<S> {
    /// Create a server with default settings
    pub fn new(session: HttpSession<S>) -> Self {
        H2ServerBuilder::new().build(session)
    }

    /// Negotiate HTTP/2 and exchange SETTINGS
    ///
    /// Returns once the client's first SETTINGS has been processed.
    pub fn handshake(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        let negotiation = match self.negotiation {
            Some(negotiation) => negotiation,
            None => Negotiation::from_alpn(self.session.get_ref().alpn_protocol())?,
        };
        debug!(?negotiation, "starting HTTP/2 handshake");
        self.connection = Some(Connection::new(self.config.clone(), negotiation)?);
        self.flush()?;

        while !self.established {
            self.read_once()?;
        }
        Ok(())
    }

    /// Wait for the next complete request
    ///
    /// Fails with [`Error::ConnectionClosed`] once the connection is done.
    pub fn receive_request(&mut self) -> Result<H2Request> {
        self.handshake()?;
        loop {
            if let Some(request) = self.requests.pop_front() {
                return Ok(request);
            }
            if self.connection()?.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            self.read_once()?;
        }
    }

    /// Send a response and wait until its body (and pushed bodies) are out
    pub fn send_response(&mut self, stream_id: StreamId, response: H2Response) -> Result<()> {
        self.connection_mut()?.send_response(stream_id, response)?;
        self.flush()?;

        while !self.connection()?.streams().pending_ids().is_empty() {
            trace!("waiting for send window");
            self.read_once()?;
        }
        Ok(())
    }

    /// Answer requests with `handler` until the client goes away
    pub fn serve<F>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(&H2Request) -> H2Response,
    {
        self.handshake()?;
        loop {
            let request = match self.receive_request() {
                Ok(request) => request,
                Err(Error::ConnectionClosed) => return Ok(()),
                Err(err) => return Err(err),
            };

            let response = handler(&request);
            match self.send_response(request.stream_id, response) {
                Ok(()) => {}
                Err(Error::StreamClosed(stream_id)) | Err(Error::StreamNotFound(stream_id)) => {
                    debug!(stream_id, "stream gone before the response was sent");
                }
                Err(Error::ConnectionClosed) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Send GOAWAY(NO_ERROR) and close the transport
    pub fn close(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.as_mut() {
            connection.go_away(super::error::ErrorCode::NoError);
        }
        self.flush()?;
        self.session.close()?;
        Ok(())
    }

    /// The engine, once the handshake started
    pub fn engine(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Get a reference to the underlying session
    pub fn session(&self) -> &HttpSession<S> {
        &self.session
    }

    fn connection(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| Error::Internal("handshake not started".to_string()))
    }

    fn connection_mut(&mut self) -> Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::Internal("handshake not started".to_string()))
    }

    /// Read once from the transport and run the bytes through the engine
    fn read_once(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self.session.read(&mut buf)?;
        if n == 0 {
            debug!("peer closed the transport");
            return Err(Error::ConnectionClosed);
        }

        let result = self.connection_mut()?.recv(&buf[..n]);
        // A failed recv still queued a GOAWAY
        self.flush()?;
        self.drain_events()?;
        result
    }

    fn drain_events(&mut self) -> Result<()> {
        let connection = self.connection_mut()?;
        let mut requests = Vec::new();
        let mut established = false;
        while let Some(event) = connection.poll_event() {
            match event {
                Event::ConnectionEstablished => established = true,
                Event::RequestReceived(request) => requests.push(request),
                other => trace!(event = ?other, "engine event"),
            }
        }
        self.established |= established;
        self.requests.extend(requests);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };
        if !connection.has_pending_send() {
            return Ok(());
        }
        let bytes = connection.take_pending_send();
        self.session.write_all(&bytes)?;
        Ok(())
    }
}

/// HTTP/2 server builder
pub struct H2ServerBuilder {
    config: EngineConfig,
    negotiation: Option<Negotiation>,
    timeout: Option<Duration>,
}

impl H2ServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        H2ServerBuilder {
            config: EngineConfig::default(),
            negotiation: None,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Expect the client preface right away (prior knowledge)
    pub fn direct(mut self) -> Self {
        self.negotiation = Some(Negotiation::Direct);
        self
    }

    /// Expect an HTTP/1.1 `Upgrade: h2c` request first
    pub fn upgrade(mut self) -> Self {
        self.negotiation = Some(Negotiation::Upgrade);
        self
    }

    /// Accept either the preface or an upgrade request on clear text
    pub fn detect(mut self) -> Self {
        self.negotiation = Some(Negotiation::Detect);
        self
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.config.settings.header_table_size = Some(size);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config.settings.initial_window_size = Some(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.settings.max_frame_size = Some(size);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.settings.max_concurrent_streams = Some(max);
        self
    }

    /// Set the session receive window
    pub fn connection_window_size(mut self, size: u32) -> Self {
        self.config.connection_window_size = size;
        self
    }

    /// Allow server push
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.config.push_enabled = enable;
        self
    }

    /// Set what a header decoding failure does
    pub fn compression_error_policy(mut self, policy: CompressionErrorPolicy) -> Self {
        self.config.compression_error_policy = policy;
        self
    }

    /// Set the cap on one header block
    pub fn max_header_block_size(mut self, size: usize) -> Self {
        self.config.max_header_block_size = size;
        self
    }

    /// Set the I/O timeout (`None` waits forever)
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Engine configuration built so far
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build the server
    ///
    /// Settings are validated when the handshake starts.
    pub fn build<S: SessionOps>(self, mut session: HttpSession<S>) -> H2Server<S> {
        session.set_timeout(self.timeout);
        H2Server {
            session,
            config: self.config,
            negotiation: self.negotiation,
            connection: None,
            established: false,
            requests: VecDeque::new(),
        }
    }
}

impl Default for H2ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
