//! Buffered duplex byte stream over a nonblocking socket
//!
//! A [`ByteStream`] owns a `TcpStream`, an optional [`TlsSession`], an input
//! buffer of received plaintext and an output buffer of plaintext waiting to
//! be sent. Reading and writing each follow a begin/end protocol driven by
//! the [`Reactor`]:
//!
//! 1. `begin_read` / `begin_write` mark the direction `Busy` and register
//!    interest.
//! 2. The owner forwards readiness through [`ByteStream::on_ready`], which
//!    marks the direction `Avail`.
//! 3. `end_read` / `end_write` perform the I/O and return the direction to
//!    `Idle`, or `Disabled` once the peer closed.
//!
//! Blocking helpers (`read_blocking`, `flush_blocking`, `wait_*`) serve the
//! synchronous client path and never touch the reactor.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::reactor::{Handler, Interest, Reactor, Readiness, Token};
use super::sys::{self, POLLFAIL, POLLIN, POLLOUT};
use super::tls::{tls_error, TlsSession};
use crate::protocol::error::{Result, WeftError};

const READ_CHUNK: usize = 16 * 1024;

/// Readiness state of one direction of a [`ByteStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Closed; no further I/O in this direction.
    Disabled,
    Idle,
    /// Waiting for reactor readiness.
    Busy,
    /// Ready; the matching `end_*` call will make progress.
    Avail,
}

#[derive(Debug)]
pub struct ByteStream {
    socket: TcpStream,
    tls: Option<TlsSession>,
    input: Vec<u8>,
    output: Vec<u8>,
    read_state: StreamState,
    write_state: StreamState,
    handshake_armed: bool,
    token: Option<Token>,
    eof: bool,
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

impl ByteStream {
    /// Wraps a connected socket, switching it to nonblocking mode.
    pub fn new(socket: TcpStream) -> Result<Self> {
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        Ok(ByteStream {
            socket,
            tls: None,
            input: Vec::new(),
            output: Vec::new(),
            read_state: StreamState::Idle,
            write_state: StreamState::Idle,
            handshake_armed: false,
            token: None,
            eof: false,
        })
    }

    /// Connects, blocking for at most `timeout`.
    pub fn connect(addr: &SocketAddr, timeout: Duration) -> Result<Self> {
        debug!("connecting to {}", addr);
        let socket = TcpStream::connect_timeout(addr, timeout)
            .map_err(|e| WeftError::from_io(e, "connect", timeout))?;
        Self::new(socket)
    }

    /// Starts a nonblocking connect. The stream becomes writable once the
    /// attempt resolved; call [`finish_connect`](Self::finish_connect) then.
    pub fn connect_nonblocking(addr: &SocketAddr) -> Result<Self> {
        debug!("connecting to {} (nonblocking)", addr);
        let socket = sys::connect_nonblocking(addr)?;
        Self::new(socket)
    }

    /// Reports the outcome of a nonblocking connect.
    pub fn finish_connect(&self) -> Result<()> {
        if let Some(err) = self.socket.take_error()? {
            return Err(WeftError::Transport(format!("connect failed: {}", err)));
        }
        // Distinguishes "not yet connected" from a completed connect.
        self.socket
            .peer_addr()
            .map_err(|e| WeftError::Transport(format!("connect failed: {}", e)))?;
        Ok(())
    }

    pub fn set_tls(&mut self, session: TlsSession) {
        self.tls = Some(session);
    }

    pub fn tls(&self) -> Option<&TlsSession> {
        self.tls.as_ref()
    }

    pub fn is_handshaking(&self) -> bool {
        self.tls.as_ref().is_some_and(|t| t.is_handshaking())
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    pub fn read_state(&self) -> StreamState {
        self.read_state
    }

    pub fn write_state(&self) -> StreamState {
        self.write_state
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    /// True once the peer closed its sending side.
    pub fn at_eof(&self) -> bool {
        self.eof
    }

    /// Received plaintext not yet consumed.
    pub fn input(&self) -> &[u8] {
        &self.input
    }

    /// Drops the first `n` bytes of the input buffer.
    pub fn consume(&mut self, n: usize) {
        self.input.drain(..n.min(self.input.len()));
    }

    /// Buffer for outgoing plaintext; bytes are sent by the next flush.
    pub fn output_mut(&mut self) -> &mut Vec<u8> {
        &mut self.output
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty() || self.tls.as_ref().is_some_and(|t| t.wants_write())
    }

    /// Discards buffered input and output.
    pub fn clear_buffers(&mut self) {
        self.input.clear();
        self.output.clear();
    }

    // Reactor-driven interface

    /// Registers the socket with `reactor`, dispatching readiness to `handler`.
    pub fn attach(&mut self, reactor: &mut Reactor, handler: Handler) -> Token {
        let token = reactor.register(self.fd(), self.interest(), handler);
        self.token = Some(token);
        token
    }

    /// Deregisters the socket. Pending `Busy` directions return to `Idle`.
    pub fn detach(&mut self, reactor: &mut Reactor) {
        if let Some(token) = self.token.take() {
            reactor.deregister(token);
        }
        for state in [&mut self.read_state, &mut self.write_state] {
            if matches!(*state, StreamState::Busy | StreamState::Avail) {
                *state = StreamState::Idle;
            }
        }
        self.handshake_armed = false;
    }

    fn interest(&self) -> Interest {
        let mut interest = Interest {
            readable: self.read_state == StreamState::Busy,
            writable: self.write_state == StreamState::Busy,
        };
        if self.handshake_armed {
            if self.tls.as_ref().is_some_and(|t| t.wants_write()) {
                interest.writable = true;
            } else {
                interest.readable = true;
            }
        }
        interest
    }

    fn update_interest(&self, reactor: &mut Reactor) {
        if let Some(token) = self.token {
            reactor.reregister(token, self.interest());
        }
    }

    pub fn begin_read(&mut self, reactor: &mut Reactor) {
        debug_assert_ne!(self.read_state, StreamState::Disabled, "read on closed stream");
        self.read_state = StreamState::Busy;
        self.update_interest(reactor);
    }

    pub fn begin_write(&mut self, reactor: &mut Reactor) {
        debug_assert_ne!(self.write_state, StreamState::Disabled, "write on closed stream");
        self.write_state = StreamState::Busy;
        self.update_interest(reactor);
    }

    /// Arms the reactor for the next TLS handshake step.
    pub fn begin_handshake(&mut self, reactor: &mut Reactor) {
        self.handshake_armed = true;
        self.update_interest(reactor);
    }

    /// Records readiness reported by the reactor.
    pub fn on_ready(&mut self, readiness: Readiness) {
        if self.read_state == StreamState::Busy && (readiness.readable || readiness.failed) {
            self.read_state = StreamState::Avail;
        }
        if self.write_state == StreamState::Busy && (readiness.writable || readiness.failed) {
            self.write_state = StreamState::Avail;
        }
    }

    /// Reads whatever is available into the input buffer. Returns the number
    /// of plaintext bytes added; zero either when nothing arrived or on end
    /// of stream, which [`at_eof`](Self::at_eof) tells apart.
    pub fn end_read(&mut self, reactor: &mut Reactor) -> Result<usize> {
        self.read_state = StreamState::Idle;
        let result = match self.fill_input() {
            Ok(0) => {
                self.mark_eof();
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => {
                self.read_state = StreamState::Disabled;
                Err(tls_error(e))
            }
        };
        self.update_interest(reactor);
        result
    }

    /// Sends as much buffered output as the socket takes. Returns true once
    /// everything was sent; otherwise call `begin_write` again.
    pub fn end_write(&mut self, reactor: &mut Reactor) -> Result<bool> {
        self.write_state = StreamState::Idle;
        let result = self.flush_nonblocking();
        if result.is_err() {
            self.write_state = StreamState::Disabled;
        }
        self.update_interest(reactor);
        result
    }

    /// Drives the handshake one step after readiness. Returns true once it
    /// completed; otherwise call `begin_handshake` again.
    pub fn end_handshake(&mut self, reactor: &mut Reactor) -> Result<bool> {
        self.handshake_armed = false;
        let result = self.handshake_step();
        self.update_interest(reactor);
        result
    }

    // Shared I/O

    fn mark_eof(&mut self) {
        trace!("end of stream on fd {}", self.fd());
        self.eof = true;
        self.read_state = StreamState::Disabled;
    }

    /// Reads until the socket would block. `Ok(0)` means end of stream,
    /// `WouldBlock` that nothing was available.
    fn fill_input(&mut self) -> io::Result<usize> {
        let Some(tls) = self.tls.as_mut() else {
            let mut total = 0;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match self.socket.read(&mut buf) {
                    Ok(0) if total == 0 => return Ok(0),
                    Ok(0) => {
                        // Report the data now and the end of stream next time.
                        return Ok(total);
                    }
                    Ok(n) => {
                        self.input.extend_from_slice(&buf[..n]);
                        total += n;
                    }
                    Err(e) if would_block(&e) && total > 0 => return Ok(total),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        };

        let mut total = 0;
        let mut closed = false;
        loop {
            // Plaintext may already be decrypted, e.g. sent along with the
            // peer's last handshake flight.
            match tls.read_plain(&mut self.input) {
                Ok(0) => return Ok(total),
                Ok(n) => total += n,
                Err(e) if would_block(&e) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(total),
                Err(e) => return Err(e),
            }
            if closed {
                break;
            }
            match tls.read_tls(&mut self.socket) {
                Ok(0) => closed = true,
                Ok(_) => {}
                Err(e) if would_block(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        // Alerts or post-handshake messages produced while reading.
        match tls.write_tls(&mut self.socket) {
            Ok(()) => {}
            Err(e) if would_block(&e) => {}
            Err(e) => return Err(e),
        }
        if total > 0 {
            Ok(total)
        } else if closed {
            Ok(0)
        } else {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    fn flush_nonblocking(&mut self) -> Result<bool> {
        let Some(tls) = self.tls.as_mut() else {
            while !self.output.is_empty() {
                match self.socket.write(&self.output) {
                    Ok(0) => return Err(WeftError::Transport("write: connection lost".into())),
                    Ok(n) => {
                        self.output.drain(..n);
                    }
                    Err(e) if would_block(&e) => return Ok(false),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(WeftError::from_io(e, "write", Duration::ZERO)),
                }
            }
            return Ok(true);
        };

        loop {
            if !self.output.is_empty() {
                let n = tls.write_plain(&self.output)?;
                self.output.drain(..n);
            }
            match tls.write_tls(&mut self.socket) {
                Ok(()) => {}
                Err(e) if would_block(&e) => return Ok(false),
                Err(e) => return Err(WeftError::from_io(e, "write", Duration::ZERO)),
            }
            if self.output.is_empty() {
                return Ok(true);
            }
        }
    }

    /// Drives the TLS handshake without blocking. Returns true once it
    /// completed; a plain stream is always complete.
    pub fn handshake_step(&mut self) -> Result<bool> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(true);
        };
        loop {
            match tls.write_tls(&mut self.socket) {
                Ok(()) => {}
                Err(e) if would_block(&e) => return Ok(!tls.is_handshaking()),
                Err(e) => return Err(tls_error(e)),
            }
            if !tls.is_handshaking() {
                return Ok(true);
            }
            match tls.read_tls(&mut self.socket) {
                Ok(0) => {
                    return Err(WeftError::Transport(
                        "connection closed during TLS handshake".into(),
                    ))
                }
                Ok(_) => {}
                Err(e) if would_block(&e) => return Ok(false),
                Err(e) => {
                    // Deliver the alert explaining the failure if possible.
                    let _ = tls.write_tls(&mut self.socket);
                    return Err(tls_error(e));
                }
            }
        }
    }

    // Blocking interface

    fn wait(&self, events: libc::c_short, timeout: Option<Duration>) -> Result<bool> {
        let revents = sys::poll_one(self.fd(), events, timeout)?;
        Ok(revents & (events | POLLFAIL) != 0)
    }

    /// Blocks until the socket is readable. False on timeout.
    pub fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool> {
        self.wait(POLLIN, timeout)
    }

    /// Blocks until the socket is writable. False on timeout.
    pub fn wait_writable(&self, timeout: Option<Duration>) -> Result<bool> {
        self.wait(POLLOUT, timeout)
    }

    /// Drives the handshake to completion, blocking for at most `timeout`.
    pub fn complete_handshake(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.handshake_step()? {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wants_write = self.tls.as_ref().is_some_and(|t| t.wants_write());
            let ready = if wants_write {
                self.wait_writable(Some(remaining))?
            } else {
                self.wait_readable(Some(remaining))?
            };
            if !ready {
                return Err(WeftError::Timeout(timeout));
            }
        }
        debug!("TLS handshake complete on fd {}", self.fd());
        Ok(())
    }

    /// Sends all buffered output, blocking for at most `timeout`.
    pub fn flush_blocking(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.flush_nonblocking()? {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.wait_writable(Some(remaining))? {
                return Err(WeftError::Timeout(timeout));
            }
        }
        Ok(())
    }

    /// Reads at least one byte into the input buffer, blocking for at most
    /// `timeout`. Returns zero at end of stream.
    pub fn read_blocking(&mut self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.fill_input() {
                Ok(0) => {
                    self.mark_eof();
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(e) if would_block(&e) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !self.wait_readable(Some(remaining))? {
                        return Err(WeftError::Timeout(timeout));
                    }
                }
                Err(e) => return Err(tls_error(e)),
            }
        }
    }

    /// Tells whether the peer has closed the connection, without consuming
    /// any data.
    pub fn peek_eof(&self) -> bool {
        if self.eof {
            return true;
        }
        let mut buf = [0u8; 1];
        match self.socket.peek(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) if would_block(&e) => false,
            Err(_) => true,
        }
    }

    /// Closes both directions. A TLS session sends close_notify first, best
    /// effort.
    pub fn close(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.send_close_notify();
            let _ = tls.write_tls(&mut self.socket);
        }
        let _ = self.socket.shutdown(Shutdown::Both);
        self.read_state = StreamState::Disabled;
        self.write_state = StreamState::Disabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (ByteStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = ByteStream::connect(&listener.local_addr().unwrap(), Duration::from_secs(5)).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (stream, peer)
    }

    #[test]
    fn test_blocking_roundtrip() {
        let (mut stream, mut peer) = pair();
        stream.output_mut().extend_from_slice(b"ping");
        stream.flush_blocking(Duration::from_secs(5)).unwrap();
        assert!(!stream.has_pending_output());

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").unwrap();
        while stream.input().len() < 4 {
            assert!(stream.read_blocking(Duration::from_secs(5)).unwrap() > 0);
        }
        assert_eq!(stream.input(), b"pong");
        stream.consume(2);
        assert_eq!(stream.input(), b"ng");
    }

    #[test]
    fn test_read_timeout() {
        let (mut stream, _peer) = pair();
        let err = stream.read_blocking(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, WeftError::Timeout(_)));
    }

    #[test]
    fn test_peek_eof() {
        let (mut stream, peer) = pair();
        assert!(!stream.peek_eof());
        drop(peer);
        assert!(stream.wait_readable(Some(Duration::from_secs(5))).unwrap());
        assert!(stream.peek_eof());
        assert_eq!(stream.read_blocking(Duration::from_secs(5)).unwrap(), 0);
        assert!(stream.at_eof());
        assert_eq!(stream.read_state(), StreamState::Disabled);
    }

    #[test]
    fn test_reactor_driven_read() {
        use std::cell::RefCell;
        use std::rc::Rc;

        struct Reader {
            stream: ByteStream,
            got: Rc<RefCell<Vec<u8>>>,
        }

        impl super::super::reactor::EventHandler for Reader {
            fn on_ready(&mut self, reactor: &mut Reactor, _token: Token, readiness: Readiness) {
                self.stream.on_ready(readiness);
                assert_eq!(self.stream.read_state(), StreamState::Avail);
                self.stream.end_read(reactor).unwrap();
                self.got.borrow_mut().extend_from_slice(self.stream.input());
                let n = self.stream.input().len();
                self.stream.consume(n);
                if !self.stream.at_eof() {
                    self.stream.begin_read(reactor);
                } else {
                    self.stream.detach(reactor);
                }
            }
        }

        let (stream, mut peer) = pair();
        let got = Rc::new(RefCell::new(Vec::new()));
        let reader = Rc::new(RefCell::new(Reader {
            stream,
            got: got.clone(),
        }));
        let mut reactor = Reactor::new().unwrap();
        {
            let handler: Handler = reader.clone();
            let mut r = reader.borrow_mut();
            r.stream.attach(&mut reactor, handler);
            r.stream.begin_read(&mut reactor);
        }

        peer.write_all(b"hello").unwrap();
        drop(peer);
        let deadline = Instant::now() + Duration::from_secs(5);
        while reactor.source_count() > 0 && Instant::now() < deadline {
            reactor.run_once(Some(Duration::from_millis(100))).unwrap();
        }
        assert_eq!(&*got.borrow(), b"hello");
        assert_eq!(reactor.source_count(), 0);
    }
}
