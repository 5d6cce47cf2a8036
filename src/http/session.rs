//! Byte transports under the HTTP/2 driver
//!
//! [`H2Server`](crate::http::h2::H2Server) never touches a socket
//! directly. It reads and writes through [`SessionOps`], implemented here
//! for plain TCP and in [`tls`](crate::http::tls) for openssl streams.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// A bidirectional byte transport with readiness polling
pub trait SessionOps {
    /// Wait until the transport is ready for `events`
    ///
    /// Returns `Ok(false)` when `timeout` elapsed first. `None` waits
    /// forever.
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read available bytes; 0 means end of stream
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Protocol selected by ALPN, if the transport negotiated one
    fn alpn_protocol(&self) -> Option<&[u8]> {
        None
    }

    fn close(&mut self) -> Result<()>;
}

/// Readiness a caller waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

impl PollEvents {
    pub fn wants_read(self) -> bool {
        matches!(self, PollEvents::Read | PollEvents::Both)
    }

    fn mask(self) -> libc::c_short {
        match self {
            PollEvents::Read => libc::POLLIN,
            PollEvents::Write => libc::POLLOUT,
            PollEvents::Both => libc::POLLIN | libc::POLLOUT,
        }
    }
}

/// poll(2) a single descriptor, retrying on EINTR
pub(crate) fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    let timeout_ms = match timeout {
        Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        None => -1,
    };
    let mut pfd = libc::pollfd {
        fd,
        events: events.mask(),
        revents: 0,
    };

    loop {
        // SAFETY: `pfd` is a valid pollfd and the count is 1
        let result = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if result >= 0 {
            return Ok(result > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Io(err));
        }
    }
}

/// A transport with an I/O deadline applied to every read and write
pub struct HttpSession<S: SessionOps> {
    session: S,
    timeout: Option<Duration>,
}

impl<S: SessionOps> HttpSession<S> {
    /// Wrap `session` with a 10 second timeout
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Read whatever arrives before the timeout
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Read, self.timeout)? {
            return Err(Error::Timeout);
        }
        self.session.read(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Write, self.timeout)? {
            return Err(Error::Timeout);
        }
        self.session.write(buf)
    }

    /// Write the whole buffer, then flush
    ///
    /// A zero-length write means the peer went away.
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(Error::ConnectionClosed),
                n => buf = &buf[n..],
            }
        }
        self.session.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    pub fn get_ref(&self) -> &S {
        &self.session
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

/// Clear-text TCP transport, used for prior knowledge and h2c
pub struct TcpSessionOps {
    stream: TcpStream,
}

impl TcpSessionOps {
    pub fn new(stream: TcpStream) -> Self {
        TcpSessionOps { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionOps for TcpSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.stream.write(buf)?)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.stream.flush()?)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            // The peer may already have torn the connection down
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => Ok(other?),
        }
    }
}

/// Session over an accepted or connected TCP stream
pub fn from_tcp_stream(stream: TcpStream) -> HttpSession<TcpSessionOps> {
    HttpSession::new(TcpSessionOps::new(stream))
}
