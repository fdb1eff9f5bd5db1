//! Per-socket HTTP state machine.
//!
//! A connection is half-duplex: request N+1 is not parsed before reply N has
//! been flushed. Bytes of a pipelined request stay in the input buffer until
//! then.

use std::cell::RefCell;
use std::net::{SocketAddr, TcpStream};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, trace, warn};
use weftrpc_common::codec::Parser;
use weftrpc_common::http::{ChunkedDecoder, RequestHead, RequestParser};
use weftrpc_common::transport::{
    ByteStream, EventHandler, Handler, Reactor, Readiness, StreamState, TimerId, TlsSession, Token,
};
use weftrpc_common::{Result, WeftError};

use super::server::ServerShared;
use super::{HttpReply, Responder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    AwaitingHeader,
    ParsingHeader,
    DispatchingBody,
    Responding,
    SendingReply,
    KeepAliveWait,
    Closed,
}

enum Body {
    Length(usize),
    Chunked(ChunkedDecoder),
}

pub(crate) struct Connection {
    shared: Rc<ServerShared>,
    stream: ByteStream,
    peer: SocketAddr,
    state: ConnectionState,
    parser: RequestParser,
    request: Option<RequestHead>,
    responder: Option<Box<dyn Responder>>,
    body: Option<Body>,
    body_received: usize,
    keep_alive: bool,
    timer: Option<TimerId>,
    timed_out: bool,
    this: Weak<RefCell<Connection>>,
}

impl Connection {
    /// Sets up a connection for an accepted socket and registers it.
    pub(crate) fn accept(
        reactor: &mut Reactor,
        shared: Rc<ServerShared>,
        socket: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let mut stream = ByteStream::new(socket)?;
        let tls = shared.tls.clone();
        if let Some(config) = tls {
            stream.set_tls(TlsSession::server(config)?);
        }
        let parser = RequestParser::new(shared.config.max_header_size);
        shared.connection_opened();

        let conn = Rc::new(RefCell::new(Connection {
            shared,
            stream,
            peer,
            state: ConnectionState::AwaitingHeader,
            parser,
            request: None,
            responder: None,
            body: None,
            body_received: 0,
            keep_alive: false,
            timer: None,
            timed_out: false,
            this: Weak::new(),
        }));
        let handler: Handler = conn.clone();
        let mut c = conn.borrow_mut();
        c.this = Rc::downgrade(&conn);
        c.stream.attach(reactor, handler);

        if c.stream.tls().is_some() {
            c.state = ConnectionState::Handshaking;
            c.stream.begin_handshake(reactor);
        } else {
            c.stream.begin_read(reactor);
        }
        let timeout = c.shared.config.read_timeout;
        c.arm_timer(reactor, timeout);
        debug!("connection from {} accepted", peer);
        Ok(())
    }

    fn arm_timer(&mut self, reactor: &mut Reactor, timeout: Duration) {
        self.disarm_timer(reactor);
        let this = self.this.clone();
        self.timer = Some(reactor.add_timer(
            Instant::now() + timeout,
            Box::new(move |reactor: &mut Reactor| {
                if let Some(conn) = this.upgrade() {
                    conn.borrow_mut().on_timeout(reactor);
                }
            }),
        ));
    }

    fn disarm_timer(&mut self, reactor: &mut Reactor) {
        if let Some(id) = self.timer.take() {
            reactor.cancel_timer(id);
        }
    }

    fn on_timeout(&mut self, reactor: &mut Reactor) {
        self.timer = None;
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!("connection from {} timed out in {:?}", self.peer, self.state);
        self.close(reactor);
        if !self.timed_out {
            self.timed_out = true;
            self.shared.signal_timeout();
        }
    }

    fn close(&mut self, reactor: &mut Reactor) {
        if self.state == ConnectionState::Closed {
            return;
        }
        trace!("closing connection from {}", self.peer);
        self.disarm_timer(reactor);
        self.stream.close();
        self.stream.detach(reactor);
        self.responder = None;
        self.state = ConnectionState::Closed;
        self.shared.connection_closed();
    }

    fn on_handshake(&mut self, reactor: &mut Reactor) -> Result<()> {
        if !self.stream.end_handshake(reactor)? {
            self.stream.begin_handshake(reactor);
            return Ok(());
        }
        if let Some(filter) = &self.shared.certificate_filter {
            let chain = self
                .stream
                .tls()
                .and_then(|t| t.peer_certificates())
                .unwrap_or(&[]);
            if !filter(chain) {
                warn!("certificate of {} rejected", self.peer);
                self.close(reactor);
                return Ok(());
            }
        }
        debug!("TLS handshake with {} complete", self.peer);
        self.state = ConnectionState::AwaitingHeader;
        // The request may have arrived together with the handshake.
        self.stream.end_read(reactor)?;
        self.process_input(reactor)
    }

    fn on_readable(&mut self, reactor: &mut Reactor) -> Result<()> {
        if self.stream.read_state() != StreamState::Avail {
            return Ok(());
        }
        self.stream.end_read(reactor)?;
        self.process_input(reactor)
    }

    fn on_writable(&mut self, reactor: &mut Reactor) -> Result<()> {
        if self.stream.write_state() != StreamState::Avail {
            return Ok(());
        }
        if self.stream.end_write(reactor)? {
            self.reply_sent(reactor)
        } else {
            self.stream.begin_write(reactor);
            Ok(())
        }
    }

    fn is_reading(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::AwaitingHeader
                | ConnectionState::ParsingHeader
                | ConnectionState::KeepAliveWait
                | ConnectionState::DispatchingBody
        )
    }

    /// Consumes buffered input in the current state, then waits for more if
    /// the request is still incomplete.
    fn process_input(&mut self, reactor: &mut Reactor) -> Result<()> {
        loop {
            match self.state {
                ConnectionState::AwaitingHeader
                | ConnectionState::KeepAliveWait
                | ConnectionState::ParsingHeader => {
                    if self.stream.input().is_empty() {
                        break;
                    }
                    self.state = ConnectionState::ParsingHeader;
                    match self.parser.feed(self.stream.input()) {
                        Ok(progress) => {
                            self.stream.consume(progress.consumed);
                            match self.parser.take() {
                                Some(head) => self.on_header(reactor, head)?,
                                None => break,
                            }
                        }
                        Err(e) => {
                            debug!("invalid header from {}: {}", self.peer, e);
                            let detail = e.to_string();
                            return self.send_error(reactor, 400, &detail);
                        }
                    }
                }
                ConnectionState::DispatchingBody => {
                    if self.stream.input().is_empty() {
                        break;
                    }
                    self.feed_body(reactor)?;
                }
                _ => return Ok(()),
            }
        }

        if !self.is_reading() {
            return Ok(());
        }
        if self.stream.at_eof() {
            if self.state == ConnectionState::ParsingHeader
                || self.state == ConnectionState::DispatchingBody
            {
                debug!("{} closed the connection mid-request", self.peer);
            }
            self.close(reactor);
            return Ok(());
        }
        let timeout = match self.state {
            ConnectionState::KeepAliveWait => self.shared.config.keep_alive_timeout,
            _ => self.shared.config.read_timeout,
        };
        self.stream.begin_read(reactor);
        self.arm_timer(reactor, timeout);
        Ok(())
    }

    fn on_header(&mut self, reactor: &mut Reactor, head: RequestHead) -> Result<()> {
        info!("request {} {} from {}", head.method, head.target, self.peer);
        self.keep_alive = head.keep_alive();

        let content_length = match head.headers.content_length() {
            Ok(length) => length.unwrap_or(0),
            Err(e) => {
                let detail = e.to_string();
                return self.send_error(reactor, 400, &detail);
            }
        };
        if content_length > self.shared.config.max_body_size {
            return self.send_error(reactor, 413, "request body too large");
        }

        let mut responder = self.shared.responder_for(&head);
        if let Err(e) = responder.begin_request(&head) {
            warn!("responder rejected request from {}: {}", self.peer, e);
            let mut reply = HttpReply::new();
            responder.reply_error(&e, &mut reply);
            reply.set_header("Connection", "close");
            self.keep_alive = false;
            return self.send_reply(reactor, reply);
        }
        self.responder = Some(responder);
        self.body_received = 0;

        self.body = if head.headers.is_chunked() {
            Some(Body::Chunked(ChunkedDecoder::new()))
        } else if content_length > 0 {
            Some(Body::Length(content_length))
        } else {
            None
        };
        self.request = Some(head);

        if self.body.is_some() {
            self.state = ConnectionState::DispatchingBody;
            Ok(())
        } else {
            self.respond(reactor)
        }
    }

    fn feed_body(&mut self, reactor: &mut Reactor) -> Result<()> {
        let (chunk, consumed, complete) = match &mut self.body {
            Some(Body::Length(remaining)) => {
                let n = (*remaining).min(self.stream.input().len());
                *remaining -= n;
                (self.stream.input()[..n].to_vec(), n, *remaining == 0)
            }
            Some(Body::Chunked(decoder)) => {
                let mut out = Vec::new();
                match decoder.decode(self.stream.input(), &mut out) {
                    Ok(progress) => (out, progress.consumed, progress.complete),
                    Err(e) => {
                        let detail = e.to_string();
                        return self.send_error(reactor, 400, &detail);
                    }
                }
            }
            None => return self.respond(reactor),
        };
        self.stream.consume(consumed);
        self.body_received += chunk.len();
        if self.body_received > self.shared.config.max_body_size {
            return self.send_error(reactor, 413, "request body too large");
        }
        trace!("{} body bytes from {}", chunk.len(), self.peer);

        if !chunk.is_empty() {
            if let Some(responder) = self.responder.as_mut() {
                if let Err(e) = responder.read_body(&chunk) {
                    warn!("responder failed reading body from {}: {}", self.peer, e);
                    let mut reply = HttpReply::new();
                    responder.reply_error(&e, &mut reply);
                    reply.set_header("Connection", "close");
                    self.keep_alive = false;
                    return self.send_reply(reactor, reply);
                }
            }
        }
        if complete {
            self.respond(reactor)
        } else {
            Ok(())
        }
    }

    /// Runs the responder's reply phase.
    fn respond(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.state = ConnectionState::Responding;
        self.disarm_timer(reactor);
        self.body = None;

        let mut reply = HttpReply::new();
        if let (Some(mut responder), Some(request)) = (self.responder.take(), self.request.as_ref())
        {
            if let Err(e) = responder.reply(request, &mut reply) {
                warn!("responder reported error: {}", e);
                reply = HttpReply::new();
                responder.reply_error(&e, &mut reply);
            }
        }
        self.send_reply(reactor, reply)
    }

    fn send_error(&mut self, reactor: &mut Reactor, status: u16, detail: &str) -> Result<()> {
        self.keep_alive = false;
        let mut reply = HttpReply::error(status, detail);
        reply.set_header("Connection", "close");
        self.send_reply(reactor, reply)
    }

    /// Serializes `reply` with the default headers and starts sending it.
    fn send_reply(&mut self, reactor: &mut Reactor, mut reply: HttpReply) -> Result<()> {
        self.responder = None;
        self.body = None;
        self.disarm_timer(reactor);

        let headers = &mut reply.head.headers;
        if headers.has_token("Connection", "close") {
            self.keep_alive = false;
        }
        if reply.head.status != 204 {
            headers.set_default("Content-Length", reply.body.len().to_string());
        }
        headers.set_default("Server", self.shared.config.server_name.clone());
        headers.set_default(
            "Connection",
            if self.keep_alive { "keep-alive" } else { "close" },
        );
        headers.set_default(
            "Date",
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );

        let method = self.request.as_ref().map_or("-", |r| r.method.as_str());
        info!(
            "request {} from {} ready, returncode {} {}",
            method,
            self.peer,
            reply.head.status,
            reply.head.reason
        );

        reply.write_to(self.stream.output_mut());
        self.state = ConnectionState::SendingReply;
        if self.stream.end_write(reactor)? {
            return self.reply_sent(reactor);
        }
        self.stream.begin_write(reactor);
        let timeout = self.shared.config.write_timeout;
        self.arm_timer(reactor, timeout);
        Ok(())
    }

    fn reply_sent(&mut self, reactor: &mut Reactor) -> Result<()> {
        self.disarm_timer(reactor);
        self.request = None;
        if !self.keep_alive {
            debug!("no keep-alive, closing connection from {}", self.peer);
            self.close(reactor);
            return Ok(());
        }
        debug!("keep-alive with {}", self.peer);
        self.parser.reset();
        self.state = ConnectionState::KeepAliveWait;
        self.process_input(reactor)
    }
}

impl EventHandler for Connection {
    fn on_ready(&mut self, reactor: &mut Reactor, _token: Token, readiness: Readiness) {
        self.stream.on_ready(readiness);
        let result = match self.state {
            ConnectionState::Handshaking => self.on_handshake(reactor),
            ConnectionState::SendingReply => self.on_writable(reactor),
            ConnectionState::Closed | ConnectionState::Responding => Ok(()),
            _ => self.on_readable(reactor),
        };
        if let Err(e) = result {
            match &e {
                WeftError::Tls(_) => warn!("TLS failure with {}: {}", self.peer, e),
                _ => debug!("connection from {} failed: {}", self.peer, e),
            }
            self.close(reactor);
        }
    }
}
