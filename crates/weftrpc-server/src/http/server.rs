//! HTTP server: listeners, service routing and connection bookkeeping.

use std::cell::{Cell, RefCell};
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, error};
use weftrpc_common::http::RequestHead;
use weftrpc_common::transport::{Reactor, Token};
use weftrpc_common::{Result, WeftError};

use super::connection::Connection;
use super::{CertificateFilter, HttpService, NotFoundResponder, Responder};
use crate::config::ServerConfig;
use crate::listener::Listener;

/// State shared by the server handle and its connections.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    services: RefCell<Vec<(String, Rc<dyn HttpService>)>>,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) certificate_filter: Option<CertificateFilter>,
    on_timeout: RefCell<Option<Box<dyn FnMut()>>>,
    active: Cell<usize>,
    timeouts: Cell<usize>,
}

impl ServerShared {
    /// Creates the responder for `request`: exact path match first, then the
    /// longest registered prefix, then the 404 responder.
    pub(crate) fn responder_for(&self, request: &RequestHead) -> Box<dyn Responder> {
        let path = request.path();
        let services = self.services.borrow();
        let exact = services.iter().find(|(p, _)| p == path);
        let service = exact.or_else(|| {
            services
                .iter()
                .filter(|(p, _)| path.starts_with(p.as_str()))
                .max_by_key(|(p, _)| p.len())
        });
        match service {
            Some((prefix, service)) => {
                debug!("{} routed to service at {}", path, prefix);
                service.create_responder(request)
            }
            None => Box::new(NotFoundResponder),
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.active.set(self.active.get() + 1);
    }

    pub(crate) fn connection_closed(&self) {
        self.active.set(self.active.get().saturating_sub(1));
    }

    /// Raises the timeout signal.
    pub(crate) fn signal_timeout(&self) {
        self.timeouts.set(self.timeouts.get() + 1);
        if let Some(callback) = self.on_timeout.borrow_mut().as_mut() {
            callback();
        }
    }
}

/// HTTP/1.1 server driven by a [`Reactor`].
///
/// # Example
///
/// ```no_run
/// use weftrpc_common::Reactor;
/// use weftrpc_server::{HttpServer, JsonRpcService, ServerConfig, Service};
///
/// let mut service = Service::new();
/// service.register_fn("add", |a: i64, b: i64| a + b);
///
/// let mut reactor = Reactor::new().unwrap();
/// let mut server = HttpServer::new(ServerConfig::default());
/// server.add_service("/jsonrpc", JsonRpcService::new(service));
/// server.listen(&mut reactor, "127.0.0.1:8080").unwrap();
/// reactor.run().unwrap();
/// ```
pub struct HttpServer {
    config: ServerConfig,
    tls: Option<Arc<rustls::ServerConfig>>,
    certificate_filter: Option<CertificateFilter>,
    pending_services: Vec<(String, Rc<dyn HttpService>)>,
    pending_on_timeout: Option<Box<dyn FnMut()>>,
    shared: Option<Rc<ServerShared>>,
    listeners: Vec<Token>,
}

impl HttpServer {
    pub fn new(config: ServerConfig) -> Self {
        HttpServer {
            config,
            tls: None,
            certificate_filter: None,
            pending_services: Vec::new(),
            pending_on_timeout: None,
            shared: None,
            listeners: Vec::new(),
        }
    }

    /// Serves every connection over TLS.
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Installs a predicate that may reject a TLS peer's certificate chain
    /// once the handshake completes.
    pub fn with_certificate_filter(
        mut self,
        filter: impl Fn(&[rustls::pki_types::CertificateDer<'static>]) -> bool + 'static,
    ) -> Self {
        self.certificate_filter = Some(Box::new(filter));
        self
    }

    /// Routes requests whose path equals or starts with `path` to `service`.
    pub fn add_service(&mut self, path: impl Into<String>, service: impl HttpService + 'static) {
        let entry = (path.into(), Rc::new(service) as Rc<dyn HttpService>);
        match &self.shared {
            Some(shared) => shared.services.borrow_mut().push(entry),
            None => self.pending_services.push(entry),
        }
    }

    /// Called each time a connection is closed by its idle timer.
    pub fn on_timeout(&mut self, callback: impl FnMut() + 'static) {
        match &self.shared {
            Some(shared) => *shared.on_timeout.borrow_mut() = Some(Box::new(callback)),
            None => self.pending_on_timeout = Some(Box::new(callback)),
        }
    }

    fn shared(&mut self) -> Result<Rc<ServerShared>> {
        if let Some(shared) = &self.shared {
            return Ok(shared.clone());
        }
        self.config.validate().map_err(WeftError::Logic)?;
        let shared = Rc::new(ServerShared {
            config: self.config.clone(),
            services: RefCell::new(std::mem::take(&mut self.pending_services)),
            tls: self.tls.take(),
            certificate_filter: self.certificate_filter.take(),
            on_timeout: RefCell::new(self.pending_on_timeout.take()),
            active: Cell::new(0),
            timeouts: Cell::new(0),
        });
        self.shared = Some(shared.clone());
        Ok(shared)
    }

    /// Binds `addr` and starts accepting on `reactor`. Returns the bound
    /// address, useful with port 0.
    pub fn listen(&mut self, reactor: &mut Reactor, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let shared = self.shared()?;
        let (local, token) = Listener::bind(
            reactor,
            addr,
            Box::new(move |reactor, socket, peer| {
                if let Err(e) = Connection::accept(reactor, shared.clone(), socket, peer) {
                    error!("failed to set up connection from {}: {}", peer, e);
                }
            }),
        )?;
        self.listeners.push(token);
        Ok(local)
    }

    /// Stops accepting. Established connections run to completion.
    pub fn close(&mut self, reactor: &mut Reactor) {
        for token in self.listeners.drain(..) {
            reactor.deregister(token);
        }
    }

    /// Number of open connections.
    pub fn active_connections(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.active.get())
    }

    /// Number of connections closed by their idle timer so far.
    pub fn timeout_count(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.timeouts.get())
    }
}
