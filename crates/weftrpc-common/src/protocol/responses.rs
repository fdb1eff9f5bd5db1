//! RPC reply type shared by every protocol.

use crate::protocol::error::{Result, WeftError};
use crate::value::{IntoNode, Node};

/// Outcome of a procedure call as carried on the wire.
///
/// # Example
///
/// ```
/// use weftrpc_common::protocol::RpcReply;
/// use weftrpc_common::value::Node;
///
/// let ok = RpcReply::success(Node::from_value(5));
/// assert_eq!(ok.into_result().unwrap().get_value::<i32>().unwrap(), 5);
///
/// let fault = RpcReply::fault(7, "Fault");
/// assert!(fault.into_result().is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    Success(Node),
    Fault { code: i32, message: String },
}

impl RpcReply {
    pub fn success(result: Node) -> Self {
        RpcReply::Success(result)
    }

    pub fn fault(code: i32, message: impl Into<String>) -> Self {
        RpcReply::Fault {
            code,
            message: message.into(),
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, RpcReply::Fault { .. })
    }

    /// Converts a fault into [`WeftError::Remote`].
    pub fn into_result(self) -> Result<Node> {
        match self {
            RpcReply::Success(node) => Ok(node),
            RpcReply::Fault { code, message } => Err(WeftError::Remote { code, message }),
        }
    }
}

impl From<Result<Node>> for RpcReply {
    /// Maps a procedure outcome to a reply. Remote faults keep their code,
    /// any other error is reported as a server error (-32000).
    fn from(result: Result<Node>) -> Self {
        match result {
            Ok(node) => RpcReply::Success(node),
            Err(WeftError::Remote { code, message }) => RpcReply::Fault { code, message },
            Err(err) => RpcReply::Fault {
                code: super::jsonrpc::SERVER_ERROR,
                message: err.to_string(),
            },
        }
    }
}

/// Return types a procedure may produce: a plain value or a `Result` of one.
pub trait IntoRpcResult {
    fn into_rpc_result(self) -> Result<Node>;
}

impl<T: IntoNode> IntoRpcResult for T {
    fn into_rpc_result(self) -> Result<Node> {
        Ok(self.into_node())
    }
}

impl<T: IntoNode> IntoRpcResult for Result<T> {
    fn into_rpc_result(self) -> Result<Node> {
        self.map(IntoNode::into_node)
    }
}
