//! weftrpc Server
//!
//! Reactor-driven servers for procedures registered in a [`Service`]:
//!
//! - [`HttpServer`]: HTTP/1.1 with keep-alive and optional TLS, routing
//!   request paths to [`HttpService`]s such as [`JsonRpcService`] and
//!   [`XmlRpcService`]
//! - [`RpcServer`]: binary or JSON-RPC envelopes directly on TCP
//!
//! Everything runs on the thread owning the [`Reactor`](weftrpc_common::Reactor);
//! nothing here spawns threads.

pub mod config;
pub mod http;
mod listener;
pub mod responder;
pub mod rpc_server;
pub mod service;

pub use config::ServerConfig;
pub use http::{CertificateFilter, HttpReply, HttpServer, HttpService, Responder};
pub use responder::{JsonRpcService, XmlRpcService};
pub use rpc_server::{RpcProtocol, RpcServer};
pub use service::{Procedure, Service};
