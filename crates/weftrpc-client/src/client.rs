//! RPC client engine
//!
//! An [`RpcClient`] keeps at most one connection to its server and runs at
//! most one call at a time, either blocking ([`RpcClient::call`]) or driven
//! by a [`Reactor`] ([`RpcClient::begin_call`]). A connection that failed is
//! dropped; the next call connects again. Calls are never retried.

use std::cell::RefCell;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use weftrpc_common::transport::{
    ByteStream, EventHandler, Handler, Reactor, Readiness, StreamState, TimerId, TlsSession, Token,
};
use weftrpc_common::{Node, Result, WeftError};

use crate::config::ClientConfig;
use crate::protocol::{encode_request, ClientProtocol, ReplyReader};

/// Receives the outcome of an asynchronous call.
pub type Callback = Box<dyn FnOnce(Result<Node>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Handshaking,
    Writing,
    Reading,
}

struct PendingCall {
    method: String,
    reader: ReplyReader,
    phase: Phase,
    callback: Option<Callback>,
    timer: Option<TimerId>,
}

/// Completion to deliver once the engine is no longer borrowed.
type Completion = (Option<Callback>, Result<Node>);

struct ClientEngine {
    addr: SocketAddr,
    host: String,
    protocol: ClientProtocol,
    config: ClientConfig,
    stream: Option<ByteStream>,
    pending: Option<PendingCall>,
    /// Outcome of an asynchronous call made without callback.
    completed: Option<Result<Node>>,
    next_id: i64,
    driver: Option<Handler>,
    this: Weak<RefCell<ClientEngine>>,
}

/// Forwards reactor readiness to the engine and runs callbacks after the
/// engine borrow is released.
struct Driver {
    engine: Weak<RefCell<ClientEngine>>,
}

impl EventHandler for Driver {
    fn on_ready(&mut self, reactor: &mut Reactor, _token: Token, readiness: Readiness) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let completion = engine.borrow_mut().on_ready(reactor, readiness);
        deliver(&engine, completion);
    }
}

fn deliver(engine: &Rc<RefCell<ClientEngine>>, completion: Option<Completion>) {
    match completion {
        Some((Some(callback), result)) => callback(result),
        Some((None, result)) => engine.borrow_mut().completed = Some(result),
        None => {}
    }
}

impl ClientEngine {
    fn method_name(&self, method: &str) -> String {
        format!("{}{}", self.config.prefix, method)
    }

    fn ensure_idle(&self) -> Result<()> {
        match &self.pending {
            Some(call) => Err(WeftError::Logic(format!(
                "call to '{}' still in progress",
                call.method
            ))),
            None => Ok(()),
        }
    }

    fn tls_session(&self) -> Result<Option<TlsSession>> {
        self.config
            .tls
            .as_ref()
            .map(|tls| TlsSession::client(tls.config.clone(), &tls.server_name))
            .transpose()
    }

    /// Drops a connection the peer has closed in the meantime.
    fn drop_stale_stream(&mut self) {
        if self.stream.as_ref().is_some_and(|s| s.peek_eof()) {
            debug!("connection to {} was closed by the peer", self.addr);
            self.discard_stream();
        }
    }

    fn discard_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }

    fn connect_blocking(&mut self) -> Result<&mut ByteStream> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let timeout = self.config.connect_timeout;
                let mut stream = ByteStream::connect(&self.addr, timeout)?;
                if let Some(session) = self.tls_session()? {
                    stream.set_tls(session);
                    stream.complete_handshake(timeout)?;
                }
                debug!("connected to {}", self.addr);
                stream
            }
        };
        Ok(self.stream.insert(stream))
    }

    fn call(&mut self, method: &str, params: &[Node]) -> Result<Node> {
        self.ensure_idle()?;
        self.completed = None;
        self.drop_stale_stream();
        let id = self.next_id();
        let name = self.method_name(method);
        trace!("calling {} (id {})", name, id);

        let result = self.call_blocking(&name, params, id);
        match &result {
            Ok(_) | Err(WeftError::Remote { .. }) => {}
            Err(e) => {
                debug!("call to {} failed: {}", name, e);
                self.discard_stream();
            }
        }
        result
    }

    fn call_blocking(&mut self, name: &str, params: &[Node], id: i64) -> Result<Node> {
        let timeout = self.config.timeout;
        let mut request = Vec::new();
        encode_request(&self.protocol, &self.host, name, params, id, &mut request)?;
        let mut reader = ReplyReader::new(&self.protocol, id);

        let stream = self.connect_blocking()?;
        stream.output_mut().extend_from_slice(&request);
        stream.flush_blocking(timeout)?;

        let deadline = Instant::now() + timeout;
        loop {
            let used = reader.feed(stream.input())?;
            stream.consume(used);
            if reader.is_complete() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WeftError::Timeout(timeout));
            }
            if stream.read_blocking(remaining)? == 0 {
                reader.finish_eof()?;
                break;
            }
        }
        if !reader.keep_alive() {
            self.discard_stream();
        }
        reader.take()
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Starts a call. A failure after the idle check is handed back as a
    /// completion, to be delivered like any other outcome.
    fn begin_call(
        &mut self,
        reactor: &mut Reactor,
        method: &str,
        params: &[Node],
        callback: Option<Callback>,
    ) -> Result<Option<Completion>> {
        self.ensure_idle()?;
        self.completed = None;
        let (name, id, phase) = match self.start_call(reactor, method, params) {
            Ok(started) => started,
            Err(e) => {
                debug!("call to {} failed to start: {}", method, e);
                return Ok(Some((callback, Err(e))));
            }
        };

        debug!("began call to {} (id {})", name, id);
        self.pending = Some(PendingCall {
            method: name,
            reader: ReplyReader::new(&self.protocol, id),
            phase,
            callback,
            timer: None,
        });
        let timeout = match phase {
            Phase::Connecting => self.config.connect_timeout,
            _ => self.config.timeout,
        };
        self.arm_timer(reactor, timeout);
        Ok(None)
    }

    /// Encodes the request and queues it on a connection, opening one if
    /// needed.
    fn start_call(
        &mut self,
        reactor: &mut Reactor,
        method: &str,
        params: &[Node],
    ) -> Result<(String, i64, Phase)> {
        self.drop_stale_stream();
        let id = self.next_id();
        let name = self.method_name(method);
        let mut request = Vec::new();
        encode_request(&self.protocol, &self.host, &name, params, id, &mut request)?;

        let (mut stream, phase) = match self.stream.take() {
            Some(stream) => (stream, Phase::Writing),
            None => {
                let mut stream = ByteStream::connect_nonblocking(&self.addr)?;
                if let Some(session) = self.tls_session()? {
                    stream.set_tls(session);
                }
                (stream, Phase::Connecting)
            }
        };
        stream.output_mut().extend_from_slice(&request);

        let this = self.this.clone();
        let driver = self
            .driver
            .get_or_insert_with(|| Rc::new(RefCell::new(Driver { engine: this })) as Handler)
            .clone();
        stream.attach(reactor, driver);
        stream.begin_write(reactor);
        self.stream = Some(stream);
        Ok((name, id, phase))
    }

    fn arm_timer(&mut self, reactor: &mut Reactor, timeout: Duration) {
        let Some(call) = self.pending.as_mut() else {
            return;
        };
        if let Some(id) = call.timer.take() {
            reactor.cancel_timer(id);
        }
        let engine = self.this.clone();
        call.timer = Some(reactor.add_timer(
            Instant::now() + timeout,
            Box::new(move |reactor: &mut Reactor| {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                let completion = {
                    let mut e = engine.borrow_mut();
                    if let Some(call) = e.pending.as_mut() {
                        call.timer = None;
                    }
                    e.finish(reactor, Err(WeftError::Timeout(timeout)))
                };
                deliver(&engine, completion);
            }),
        ));
    }

    /// Ends the pending call with `result`, releasing the connection unless
    /// it can carry further calls.
    fn finish(&mut self, reactor: &mut Reactor, result: Result<Node>) -> Option<Completion> {
        let call = self.pending.take()?;
        if let Some(id) = call.timer {
            reactor.cancel_timer(id);
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.detach(reactor);
        }
        let reusable = match &result {
            Ok(_) | Err(WeftError::Remote { .. }) => call.reader.keep_alive(),
            Err(e) => {
                debug!("call to {} failed: {}", call.method, e);
                false
            }
        };
        if !reusable {
            self.discard_stream();
        }
        trace!("call to {} finished", call.method);
        Some((call.callback, result))
    }

    fn on_ready(&mut self, reactor: &mut Reactor, readiness: Readiness) -> Option<Completion> {
        if let Some(stream) = self.stream.as_mut() {
            stream.on_ready(readiness);
        }
        let connecting = self.is_connecting();
        match self.advance(reactor) {
            Ok(Some(result)) => self.finish(reactor, result),
            Ok(None) => {
                if connecting && !self.is_connecting() {
                    let timeout = self.config.timeout;
                    self.arm_timer(reactor, timeout);
                }
                None
            }
            Err(e) => self.finish(reactor, Err(e)),
        }
    }

    fn is_connecting(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|c| matches!(c.phase, Phase::Connecting | Phase::Handshaking))
    }

    /// Moves the pending call forward. Returns the outcome once the reply
    /// is complete.
    fn advance(&mut self, reactor: &mut Reactor) -> Result<Option<Result<Node>>> {
        let (Some(call), Some(stream)) = (self.pending.as_mut(), self.stream.as_mut()) else {
            return Ok(None);
        };
        loop {
            match call.phase {
                Phase::Connecting => {
                    if stream.write_state() != StreamState::Avail {
                        return Ok(None);
                    }
                    stream.finish_connect()?;
                    trace!("connected to {}", self.addr);
                    if stream.tls().is_some() {
                        call.phase = Phase::Handshaking;
                        stream.begin_handshake(reactor);
                        return Ok(None);
                    }
                    // Writable since connecting finished.
                    call.phase = Phase::Writing;
                }
                Phase::Handshaking => {
                    if !stream.end_handshake(reactor)? {
                        stream.begin_handshake(reactor);
                        return Ok(None);
                    }
                    call.phase = Phase::Writing;
                }
                Phase::Writing => {
                    if stream.write_state() != StreamState::Avail {
                        return Ok(None);
                    }
                    if !stream.end_write(reactor)? {
                        stream.begin_write(reactor);
                        return Ok(None);
                    }
                    call.phase = Phase::Reading;
                    stream.begin_read(reactor);
                    return Ok(None);
                }
                Phase::Reading => {
                    if stream.read_state() != StreamState::Avail {
                        return Ok(None);
                    }
                    stream.end_read(reactor)?;
                    let used = call.reader.feed(stream.input())?;
                    stream.consume(used);
                    if !call.reader.is_complete() && stream.at_eof() {
                        call.reader.finish_eof()?;
                    }
                    if call.reader.is_complete() {
                        return Ok(Some(call.reader.take()));
                    }
                    stream.begin_read(reactor);
                    return Ok(None);
                }
            }
        }
    }

    fn cancel(&mut self, reactor: &mut Reactor) {
        let Some(call) = self.pending.take() else {
            return;
        };
        debug!("cancelling call to {}", call.method);
        if let Some(id) = call.timer {
            reactor.cancel_timer(id);
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.detach(reactor);
        }
        self.discard_stream();
    }
}

/// Handle to a client engine. Cheap to clone; clones share the connection
/// and the pending call.
///
/// # Example
///
/// ```no_run
/// use weftrpc_client::{ClientConfig, ClientProtocol, RpcClient};
/// use weftrpc_common::Node;
///
/// let client = RpcClient::new("127.0.0.1:7003", ClientProtocol::Binary, ClientConfig::default())?;
/// let sum = client.call("add", &[Node::from_value(2), Node::from_value(3)])?;
/// assert_eq!(sum.get_value::<i64>()?, 5);
/// # Ok::<(), weftrpc_common::WeftError>(())
/// ```
#[derive(Clone)]
pub struct RpcClient {
    engine: Rc<RefCell<ClientEngine>>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engine = self.engine.borrow();
        f.debug_struct("RpcClient")
            .field("addr", &engine.addr)
            .field("protocol", &engine.protocol)
            .field("connected", &engine.stream.is_some())
            .field("pending", &engine.pending.as_ref().map(|c| c.method.as_str()))
            .finish()
    }
}

impl RpcClient {
    /// Creates a client for `addr`. Nothing is connected until the first
    /// call.
    pub fn new(addr: impl ToSocketAddrs, protocol: ClientProtocol, config: ClientConfig) -> Result<Self> {
        config.validate().map_err(WeftError::Logic)?;
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| WeftError::Transport("no address to connect to".into()))?;
        Ok(RpcClient {
            engine: Rc::new_cyclic(|this| {
                RefCell::new(ClientEngine {
                    addr,
                    host: addr.to_string(),
                    protocol,
                    config,
                    stream: None,
                    pending: None,
                    completed: None,
                    next_id: 0,
                    driver: None,
                    this: this.clone(),
                })
            }),
        })
    }

    /// Overrides the `Host` header sent with HTTP protocols.
    pub fn set_host(&self, host: impl Into<String>) {
        self.engine.borrow_mut().host = host.into();
    }

    pub fn addr(&self) -> SocketAddr {
        self.engine.borrow().addr
    }

    pub fn protocol(&self) -> ClientProtocol {
        self.engine.borrow().protocol.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.engine.borrow().stream.is_some()
    }

    /// True while an asynchronous call is in flight.
    pub fn is_pending(&self) -> bool {
        self.engine.borrow().pending.is_some()
    }

    /// Calls `method` and blocks for the reply.
    ///
    /// # Errors
    ///
    /// - [`WeftError::Logic`] if an asynchronous call is in flight
    /// - [`WeftError::Remote`] for a fault returned by the server
    /// - [`WeftError::Timeout`] and other transport errors; the connection is
    ///   dropped and the next call reconnects
    pub fn call(&self, method: &str, params: &[Node]) -> Result<Node> {
        self.engine.borrow_mut().call(method, params)
    }

    /// Starts calling `method` through `reactor`. `callback` receives the
    /// outcome; without one it is kept for [`wait`](Self::wait) and
    /// [`end_call`](Self::end_call).
    ///
    /// A connection that cannot be opened is reported the same way, so the
    /// callback may run before this returns.
    ///
    /// # Errors
    ///
    /// - [`WeftError::Logic`] if a call is already in flight
    pub fn begin_call(
        &self,
        reactor: &mut Reactor,
        method: &str,
        params: &[Node],
        callback: Option<Callback>,
    ) -> Result<()> {
        let completion = self
            .engine
            .borrow_mut()
            .begin_call(reactor, method, params, callback)?;
        deliver(&self.engine, completion);
        Ok(())
    }

    /// Takes the outcome of the last asynchronous call made without
    /// callback.
    pub fn end_call(&self) -> Result<Node> {
        let mut engine = self.engine.borrow_mut();
        engine.ensure_idle()?;
        engine
            .completed
            .take()
            .unwrap_or_else(|| Err(WeftError::Logic("no completed call".into())))
    }

    /// Abandons the pending call and its connection. The callback is not
    /// invoked.
    pub fn cancel(&self, reactor: &mut Reactor) {
        self.engine.borrow_mut().cancel(reactor);
    }

    /// Runs `reactor` until the pending call resolved, for at most
    /// `timeout` (forever if `None`).
    ///
    /// A failed call made without callback reports its error here. On
    /// timeout the call stays pending.
    pub fn wait(&self, reactor: &mut Reactor, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        while self.is_pending() {
            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(WeftError::Timeout(timeout.unwrap_or_default()));
                    }
                    Some(remaining)
                }
                None => None,
            };
            reactor.run_once(remaining)?;
        }
        let mut engine = self.engine.borrow_mut();
        if matches!(engine.completed, Some(Err(_))) {
            if let Some(Err(e)) = engine.completed.take() {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Closes the connection. Fails while a call is in flight.
    pub fn close(&self) -> Result<()> {
        let mut engine = self.engine.borrow_mut();
        engine.ensure_idle()?;
        engine.discard_stream();
        Ok(())
    }
}
