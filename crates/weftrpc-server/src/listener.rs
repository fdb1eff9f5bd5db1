//! Listening socket registered with the reactor.

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::rc::Rc;

use tracing::{error, info, trace};
use weftrpc_common::transport::{EventHandler, Handler, Interest, Reactor, Readiness, Token};
use weftrpc_common::{Result, WeftError};

pub(crate) type AcceptFn = Box<dyn FnMut(&mut Reactor, TcpStream, SocketAddr)>;

/// Accepts connections until the socket would block, handing each to
/// `on_accept`.
pub(crate) struct Listener {
    socket: TcpListener,
    on_accept: AcceptFn,
}

impl Listener {
    /// Binds `addr` and registers the listener with `reactor`.
    pub(crate) fn bind(
        reactor: &mut Reactor,
        addr: impl ToSocketAddrs,
        on_accept: AcceptFn,
    ) -> Result<(SocketAddr, Token)> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| WeftError::Transport("no address to listen on".into()))?;
        let socket = TcpListener::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let fd = socket.as_raw_fd();
        let handler: Handler = Rc::new(RefCell::new(Listener { socket, on_accept }));
        let token = reactor.register(fd, Interest::READABLE, handler);
        info!("listening on {}", local);
        Ok((local, token))
    }
}

impl EventHandler for Listener {
    fn on_ready(&mut self, reactor: &mut Reactor, _token: Token, _readiness: Readiness) {
        loop {
            match self.socket.accept() {
                Ok((stream, peer)) => {
                    trace!("accepted connection from {}", peer);
                    (self.on_accept)(reactor, stream, peer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }
}
