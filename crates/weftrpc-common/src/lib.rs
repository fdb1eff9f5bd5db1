//! weftrpc Common Types and Transport
//!
//! This crate provides everything the weftrpc server and client share:
//!
//! - [`value`] - the Value Tree every codec translates to and from
//! - [`codec`] - resumable binary, JSON and XML formatter/parser pairs
//! - [`protocol`] - RPC envelopes (binary, JSON-RPC 2.0, XML-RPC) and the error type
//! - [`http`] - HTTP/1.x header parser and chunked body decoder
//! - [`transport`] - the `poll(2)` reactor, byte stream and TLS glue
//! - [`queue`] - a bounded thread-safe FIFO
//!
//! # Example
//!
//! ```
//! use weftrpc_common::codec::{binary::BinaryFormatter, to_bytes};
//! use weftrpc_common::protocol::binrpc;
//! use weftrpc_common::Node;
//!
//! let mut out = Vec::new();
//! binrpc::format_request("add", &[Node::from_value(2), Node::from_value(3)], &mut out).unwrap();
//! assert_eq!(out[0], binrpc::REQUEST_MARK);
//!
//! let bytes = to_bytes(&mut BinaryFormatter::new(), &Node::from_value("hi")).unwrap();
//! assert!(!bytes.is_empty());
//! ```

pub mod codec;
pub mod http;
pub mod protocol;
pub mod queue;
pub mod transport;
pub mod value;

pub use protocol::{IntoRpcResult, MethodName, Result, RpcReply, RpcRequest, WeftError};
pub use queue::BoundedQueue;
pub use transport::{ByteStream, EventHandler, ExitHandle, Reactor};
pub use value::{Category, FromNode, IntoNode, Node, Scalar};
