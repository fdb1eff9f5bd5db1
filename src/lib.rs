//! weftrpc
//!
//! Facade crate re-exporting the weftrpc workspace:
//!
//! - [`common`] - value tree, wire codecs, reactor and byte stream
//! - [`server`] - HTTP connection engine, JSON-RPC / XML-RPC services, raw RPC server
//! - [`client`] - RPC client engine with blocking and reactor-driven calls

pub use weftrpc_client as client;
pub use weftrpc_common as common;
pub use weftrpc_server as server;

pub use weftrpc_client::{ClientConfig, ClientProtocol, RpcClient};
pub use weftrpc_common::{Node, Reactor, Result, WeftError};
pub use weftrpc_server::{HttpServer, RpcProtocol, RpcServer, ServerConfig, Service};
