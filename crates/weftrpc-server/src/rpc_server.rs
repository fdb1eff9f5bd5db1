//! Raw TCP RPC server
//!
//! Serves a [`Service`] without HTTP framing. Each connection carries a
//! sequence of requests, answered in order:
//!
//! - [`RpcProtocol::Binary`]: binary request / reply envelopes
//! - [`RpcProtocol::Json`]: JSON-RPC 2.0 objects written back to back
//!
//! A malformed request, or one longer than `max_body_size`, is answered with
//! a fault and the connection is closed once the fault has been flushed.

use std::cell::{Cell, RefCell};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};
use weftrpc_common::codec::json::{JsonFormatter, JsonParser};
use weftrpc_common::codec::{Formatter, Parser};
use weftrpc_common::protocol::binrpc::{self, BinaryRequestParser};
use weftrpc_common::protocol::jsonrpc::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, INVALID_REQUEST, PARSE_ERROR,
};
use weftrpc_common::transport::{
    ByteStream, EventHandler, Handler, Reactor, Readiness, StreamState, TimerId, TlsSession, Token,
};
use weftrpc_common::{Node, Result, RpcReply, WeftError};

use crate::config::ServerConfig;
use crate::http::CertificateFilter;
use crate::listener::Listener;
use crate::service::Service;

/// Framing spoken by an [`RpcServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcProtocol {
    Binary,
    Json,
}

struct RpcShared {
    config: ServerConfig,
    protocol: RpcProtocol,
    service: Rc<Service>,
    tls: Option<Arc<rustls::ServerConfig>>,
    certificate_filter: Option<CertificateFilter>,
    active: Cell<usize>,
    timeouts: Cell<usize>,
}

/// RPC server on raw TCP, driven by a [`Reactor`].
///
/// ```no_run
/// use weftrpc_common::Reactor;
/// use weftrpc_server::{RpcProtocol, RpcServer, ServerConfig, Service};
///
/// let mut service = Service::new();
/// service.register_fn("add", |a: i64, b: i64| a + b);
///
/// let mut reactor = Reactor::new().unwrap();
/// let mut server = RpcServer::new(ServerConfig::default(), RpcProtocol::Binary, service);
/// server.listen(&mut reactor, "127.0.0.1:7003").unwrap();
/// reactor.run().unwrap();
/// ```
pub struct RpcServer {
    config: ServerConfig,
    protocol: RpcProtocol,
    service: Rc<Service>,
    tls: Option<Arc<rustls::ServerConfig>>,
    certificate_filter: Option<CertificateFilter>,
    shared: Option<Rc<RpcShared>>,
    listeners: Vec<Token>,
}

impl RpcServer {
    pub fn new(config: ServerConfig, protocol: RpcProtocol, service: Service) -> Self {
        Self::with_shared_service(config, protocol, Rc::new(service))
    }

    /// Serves a registry that is also used by other servers.
    pub fn with_shared_service(
        config: ServerConfig,
        protocol: RpcProtocol,
        service: Rc<Service>,
    ) -> Self {
        RpcServer {
            config,
            protocol,
            service,
            tls: None,
            certificate_filter: None,
            shared: None,
            listeners: Vec::new(),
        }
    }

    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn with_certificate_filter(
        mut self,
        filter: impl Fn(&[rustls::pki_types::CertificateDer<'static>]) -> bool + 'static,
    ) -> Self {
        self.certificate_filter = Some(Box::new(filter));
        self
    }

    pub fn protocol(&self) -> RpcProtocol {
        self.protocol
    }

    fn shared(&mut self) -> Result<Rc<RpcShared>> {
        if let Some(shared) = &self.shared {
            return Ok(shared.clone());
        }
        self.config.validate().map_err(WeftError::Logic)?;
        let shared = Rc::new(RpcShared {
            config: self.config.clone(),
            protocol: self.protocol,
            service: self.service.clone(),
            tls: self.tls.take(),
            certificate_filter: self.certificate_filter.take(),
            active: Cell::new(0),
            timeouts: Cell::new(0),
        });
        self.shared = Some(shared.clone());
        Ok(shared)
    }

    /// Binds `addr` and starts accepting on `reactor`.
    pub fn listen(&mut self, reactor: &mut Reactor, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let shared = self.shared()?;
        let (local, token) = Listener::bind(
            reactor,
            addr,
            Box::new(move |reactor, socket, peer| {
                if let Err(e) = RpcConnection::accept(reactor, shared.clone(), socket, peer) {
                    error!("failed to set up connection from {}: {}", peer, e);
                }
            }),
        )?;
        self.listeners.push(token);
        Ok(local)
    }

    pub fn close(&mut self, reactor: &mut Reactor) {
        for token in self.listeners.drain(..) {
            reactor.deregister(token);
        }
    }

    pub fn active_connections(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.active.get())
    }

    pub fn timeout_count(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.timeouts.get())
    }
}

enum Decoder {
    Binary(BinaryRequestParser),
    Json(JsonParser),
}

impl Decoder {
    fn new(shared: &RpcShared) -> Self {
        match shared.protocol {
            RpcProtocol::Binary => {
                let service = shared.service.clone();
                Decoder::Binary(
                    BinaryRequestParser::new()
                        .with_arity_lookup(Box::new(move |name| service.arity(name))),
                )
            }
            RpcProtocol::Json => Decoder::Json(JsonParser::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Handshaking,
    Reading,
    Writing,
    Closed,
}

struct RpcConnection {
    shared: Rc<RpcShared>,
    stream: ByteStream,
    peer: SocketAddr,
    state: State,
    decoder: Decoder,
    /// Part of a request has been consumed.
    partial: bool,
    /// Bytes fed to the decoder for the current request.
    received: usize,
    close_after_write: bool,
    timer: Option<TimerId>,
    this: Weak<RefCell<RpcConnection>>,
}

impl RpcConnection {
    fn accept(
        reactor: &mut Reactor,
        shared: Rc<RpcShared>,
        socket: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let mut stream = ByteStream::new(socket)?;
        if let Some(config) = shared.tls.clone() {
            stream.set_tls(TlsSession::server(config)?);
        }
        let decoder = Decoder::new(&shared);
        shared.active.set(shared.active.get() + 1);

        let conn = Rc::new(RefCell::new(RpcConnection {
            shared,
            stream,
            peer,
            state: State::Reading,
            decoder,
            partial: false,
            received: 0,
            close_after_write: false,
            timer: None,
            this: Weak::new(),
        }));
        let handler: Handler = conn.clone();
        let mut c = conn.borrow_mut();
        c.this = Rc::downgrade(&conn);
        c.stream.attach(reactor, handler);
        if c.stream.tls().is_some() {
            c.state = State::Handshaking;
            c.stream.begin_handshake(reactor);
        } else {
            c.stream.begin_read(reactor);
        }
        let timeout = c.shared.config.read_timeout;
        c.arm_timer(reactor, timeout);
        debug!("rpc connection from {} accepted", peer);
        Ok(())
    }

    fn arm_timer(&mut self, reactor: &mut Reactor, timeout: Duration) {
        self.disarm_timer(reactor);
        let this = self.this.clone();
        self.timer = Some(reactor.add_timer(
            Instant::now() + timeout,
            Box::new(move |reactor: &mut Reactor| {
                if let Some(conn) = this.upgrade() {
                    let mut conn = conn.borrow_mut();
                    conn.timer = None;
                    if conn.state != State::Closed {
                        debug!("rpc connection from {} timed out", conn.peer);
                        conn.shared.timeouts.set(conn.shared.timeouts.get() + 1);
                        conn.close(reactor);
                    }
                }
            }),
        ));
    }

    fn disarm_timer(&mut self, reactor: &mut Reactor) {
        if let Some(id) = self.timer.take() {
            reactor.cancel_timer(id);
        }
    }

    fn close(&mut self, reactor: &mut Reactor) {
        if self.state == State::Closed {
            return;
        }
        trace!("closing rpc connection from {}", self.peer);
        self.disarm_timer(reactor);
        self.stream.close();
        self.stream.detach(reactor);
        self.state = State::Closed;
        self.shared.active.set(self.shared.active.get().saturating_sub(1));
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
        self.state = State::Reading;
        self.stream.end_read(reactor)?;
        self.process_input(reactor)
    }

    /// Feeds buffered input to the decoder. Returns the completed request
    /// outcome, if any, as the bytes of its reply.
    fn decode(&mut self) -> Option<Vec<u8>> {
        let limit = self.shared.config.max_body_size;
        let input = self.stream.input();
        // One byte past the limit is enough to detect an oversized request.
        let budget = (limit - self.received.min(limit)).saturating_add(1);
        let input = &input[..input.len().min(budget)];
        let (result, consumed) = match &mut self.decoder {
            Decoder::Binary(parser) => match parser.feed(input) {
                Ok(progress) => (Ok(progress.complete), progress.consumed),
                Err(e) => (Err(e), input.len()),
            },
            Decoder::Json(parser) => match parser.feed(input) {
                Ok(progress) => (Ok(progress.complete), progress.consumed),
                Err(e) => (Err(e), input.len()),
            },
        };
        self.stream.consume(consumed);
        self.received += consumed;
        if self.received > limit {
            debug!("request from {} exceeds {} bytes", self.peer, limit);
            self.close_after_write = true;
            return Some(self.oversized());
        }
        match result {
            Ok(false) => {
                self.partial = true;
                None
            }
            Ok(true) => {
                self.partial = false;
                self.received = 0;
                Some(self.dispatch())
            }
            Err(e) => {
                debug!("malformed request from {}: {}", self.peer, e);
                self.close_after_write = true;
                Some(self.malformed(&e))
            }
        }
    }

    fn dispatch(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        match &mut self.decoder {
            Decoder::Binary(parser) => {
                let reply = match parser.take() {
                    Some(request) => self.shared.service.dispatch(&request),
                    None => RpcReply::fault(PARSE_ERROR, "incomplete request"),
                };
                if let Err(e) = binrpc::format_reply(&reply, &mut out) {
                    warn!("cannot encode reply for {}: {}", self.peer, e);
                    out.clear();
                    let fault = RpcReply::fault(PARSE_ERROR, e.to_string());
                    // A fault with a short message always encodes.
                    let _ = binrpc::format_reply(&fault, &mut out);
                }
            }
            Decoder::Json(parser) => {
                let document = parser.take().unwrap_or_default();
                let response = match JsonRpcRequest::from_node(document) {
                    Ok(request) => {
                        let id = request.id.clone();
                        let notification = id.is_void();
                        let reply = self.shared.service.dispatch(&request.into_rpc_request());
                        if notification {
                            return out;
                        }
                        JsonRpcResponse::from_reply(id, reply)
                    }
                    Err(error) => JsonRpcResponse::error(Node::null(), error),
                };
                write_json(&response, &mut out);
            }
        }
        out
    }

    fn malformed(&mut self, error: &WeftError) -> Vec<u8> {
        let mut out = Vec::new();
        match self.decoder {
            Decoder::Binary(_) => {
                let fault = RpcReply::fault(PARSE_ERROR, error.to_string());
                let _ = binrpc::format_reply(&fault, &mut out);
            }
            Decoder::Json(_) => {
                let response = JsonRpcResponse::error(Node::null(), JsonRpcError::parse_error());
                write_json(&response, &mut out);
            }
        }
        out
    }

    fn oversized(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        match self.decoder {
            Decoder::Binary(_) => {
                let fault = RpcReply::fault(INVALID_REQUEST, "request too large");
                let _ = binrpc::format_reply(&fault, &mut out);
            }
            Decoder::Json(_) => {
                let response = JsonRpcResponse::error(Node::null(), JsonRpcError::invalid_request());
                write_json(&response, &mut out);
            }
        }
        out
    }

    fn process_input(&mut self, reactor: &mut Reactor) -> Result<()> {
        while self.state == State::Reading && !self.stream.input().is_empty() {
            let Some(reply) = self.decode() else {
                break;
            };
            if reply.is_empty() {
                continue;
            }
            self.disarm_timer(reactor);
            self.stream.output_mut().extend_from_slice(&reply);
            self.state = State::Writing;
            if self.stream.end_write(reactor)? {
                self.reply_sent(reactor);
            } else {
                self.stream.begin_write(reactor);
                let timeout = self.shared.config.write_timeout;
                self.arm_timer(reactor, timeout);
                return Ok(());
            }
        }
        if self.state != State::Reading {
            return Ok(());
        }
        if self.stream.at_eof() {
            if self.partial {
                debug!("{} closed the connection mid-request", self.peer);
            }
            self.close(reactor);
            return Ok(());
        }
        let timeout = if self.partial {
            self.shared.config.read_timeout
        } else {
            self.shared.config.keep_alive_timeout
        };
        self.stream.begin_read(reactor);
        self.arm_timer(reactor, timeout);
        Ok(())
    }

    fn reply_sent(&mut self, reactor: &mut Reactor) {
        if self.close_after_write {
            self.close(reactor);
        } else {
            self.state = State::Reading;
        }
    }

    fn on_event(&mut self, reactor: &mut Reactor) -> Result<()> {
        match self.state {
            State::Handshaking => self.on_handshake(reactor),
            State::Reading => {
                if self.stream.read_state() != StreamState::Avail {
                    return Ok(());
                }
                self.stream.end_read(reactor)?;
                self.process_input(reactor)
            }
            State::Writing => {
                if self.stream.write_state() != StreamState::Avail {
                    return Ok(());
                }
                if !self.stream.end_write(reactor)? {
                    self.stream.begin_write(reactor);
                    return Ok(());
                }
                self.disarm_timer(reactor);
                self.reply_sent(reactor);
                self.process_input(reactor)
            }
            State::Closed => Ok(()),
        }
    }
}

fn write_json(response: &JsonRpcResponse, out: &mut Vec<u8>) {
    // Value trees built from JSON input always format.
    if JsonFormatter::new().format(&response.to_node(), out).is_err() {
        out.clear();
    }
}

impl EventHandler for RpcConnection {
    fn on_ready(&mut self, reactor: &mut Reactor, _token: Token, readiness: Readiness) {
        self.stream.on_ready(readiness);
        if let Err(e) = self.on_event(reactor) {
            match &e {
                WeftError::Tls(_) => warn!("TLS failure with {}: {}", self.peer, e),
                _ => debug!("rpc connection from {} failed: {}", self.peer, e),
            }
            self.close(reactor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_validates_config() {
        let mut reactor = Reactor::new().unwrap();
        let config = ServerConfig::default().with_read_timeout(Duration::ZERO);
        let mut server = RpcServer::new(config, RpcProtocol::Binary, Service::new());
        assert!(matches!(
            server.listen(&mut reactor, "127.0.0.1:0"),
            Err(WeftError::Logic(_))
        ));
    }

    #[test]
    fn test_listen_and_close() {
        let mut reactor = Reactor::new().unwrap();
        let mut server = RpcServer::new(ServerConfig::default(), RpcProtocol::Json, Service::new());
        let addr = server.listen(&mut reactor, "127.0.0.1:0").unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(reactor.source_count(), 1);
        server.close(&mut reactor);
        assert_eq!(reactor.source_count(), 0);
        assert_eq!(server.active_connections(), 0);
    }
}
