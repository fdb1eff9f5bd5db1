pub mod binrpc;
pub mod error;
pub mod jsonrpc;
pub mod requests;
pub mod responses;
pub mod xmlrpc;

#[cfg(test)]
mod tests;

pub use error::{Result, WeftError};
pub use requests::{MethodName, RpcRequest};
pub use responses::{IntoRpcResult, RpcReply};
