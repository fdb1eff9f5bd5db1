//! weftrpc Transport Layer
//!
//! Nonblocking socket plumbing shared by the server and client engines.
//!
//! # Components
//!
//! - **[`Reactor`]**: single-threaded `poll(2)` loop dispatching readiness to
//!   registered [`EventHandler`]s and firing one-shot timers
//! - **[`ByteStream`]**: buffered socket with begin/end read and write phases
//!   and an optional TLS session
//! - **[`TlsSession`]**: rustls client or server session glue
//!
//! Everything here is `!Send` by construction except [`ExitHandle`], which
//! stops a reactor from another thread.
//!
//! # Example
//!
//! ```no_run
//! use std::time::{Duration, Instant};
//! use weftrpc_common::transport::Reactor;
//!
//! let mut reactor = Reactor::new().unwrap();
//! reactor.add_timer(
//!     Instant::now() + Duration::from_millis(10),
//!     Box::new(|reactor: &mut Reactor| reactor.exit()),
//! );
//! reactor.run().unwrap();
//! ```

pub mod reactor;
pub mod stream;
mod sys;
pub mod tls;

pub use reactor::{
    EventHandler, ExitHandle, Handler, Interest, Reactor, Readiness, TimerCallback, TimerId, Token,
};
pub use stream::{ByteStream, StreamState};
pub use tls::{install_default_provider, TlsSession};

#[cfg(test)]
mod tests;
