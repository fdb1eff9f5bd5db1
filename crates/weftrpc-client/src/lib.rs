//! weftrpc Client
//!
//! [`RpcClient`] calls procedures on a weftrpc server over one of the
//! [`ClientProtocol`]s, either blocking or driven by a
//! [`Reactor`](weftrpc_common::Reactor).
//!
//! # Example
//!
//! ```no_run
//! use weftrpc_client::{ClientConfig, ClientProtocol, RpcClient};
//! use weftrpc_common::{Node, Reactor};
//!
//! let client = RpcClient::new(
//!     "127.0.0.1:8080",
//!     ClientProtocol::JsonHttp { path: "/rpc".into() },
//!     ClientConfig::default(),
//! )?;
//!
//! let mut reactor = Reactor::new()?;
//! client.begin_call(&mut reactor, "echo", &[Node::from_value("hi")], None)?;
//! client.wait(&mut reactor, None)?;
//! let reply = client.end_call()?;
//! assert_eq!(reply.get_value::<String>()?, "hi");
//! # Ok::<(), weftrpc_common::WeftError>(())
//! ```

pub mod client;
pub mod config;
pub mod protocol;

pub use client::{Callback, RpcClient};
pub use config::{ClientConfig, ClientTls};
pub use protocol::ClientProtocol;
