//! JSON-RPC 2.0 envelopes
//!
//! Envelopes are built as value trees so they go through the same
//! incremental JSON codec as any other document.
//!
//! - Request: `{"jsonrpc": "2.0", "method": "...", "params": [...], "id": ...}`
//! - Response: `{"jsonrpc": "2.0", "result": ..., "id": ...}` or
//!   `{"jsonrpc": "2.0", "error": {"code": ..., "message": "..."}, "id": ...}`
//!
//! # Error Codes
//!
//! Standard JSON-RPC 2.0 error codes:
//! - `-32700`: Parse error
//! - `-32600`: Invalid request
//! - `-32601`: Method not found
//! - `-32602`: Invalid params
//! - `-32603`: Internal error
//! - `-32000` to `-32099`: Server error
//!
//! # Example
//!
//! ```
//! use weftrpc_common::protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse, JsonRpcError};
//! use weftrpc_common::value::Node;
//!
//! let request = JsonRpcRequest::new("add", vec![Node::from_value(2), Node::from_value(3)], 1);
//! let node = request.to_node();
//! assert_eq!(node.get_member_value::<String>("method").unwrap(), "add");
//!
//! let response = JsonRpcResponse::success(Node::from_value(1), Node::from_value(5));
//! let error = JsonRpcResponse::error(Node::from_value(1), JsonRpcError::method_not_found());
//! assert!(response.error.is_none() && error.result.is_none());
//! ```

use crate::protocol::error::{Result, WeftError};
use crate::protocol::requests::RpcRequest;
use crate::protocol::responses::RpcReply;
use crate::value::{Category, Node};

pub const VERSION: &str = "2.0";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub method: String,
    /// Array or object of parameters; `Void` when omitted
    pub params: Node,
    /// Request identifier; `Void` for notifications
    pub id: Node,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub result: Option<Node>,
    pub error: Option<JsonRpcError>,
    pub id: Node,
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<Node>,
}

// Standard JSON-RPC 2.0 error codes
/// Invalid JSON was received by the server
pub const PARSE_ERROR: i32 = -32700;
/// The JSON sent is not a valid Request object
pub const INVALID_REQUEST: i32 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Invalid method parameter(s)
pub const INVALID_PARAMS: i32 = -32602;
/// Internal JSON-RPC error
pub const INTERNAL_ERROR: i32 = -32603;
/// Application error raised by a procedure
pub const SERVER_ERROR: i32 = -32000;

impl JsonRpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a parse error (-32700)
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    /// Create an invalid request error (-32600)
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    /// Create a method not found error (-32601)
    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    /// Create an invalid params error (-32602)
    pub fn invalid_params(msg: &str) -> Self {
        Self::new(INVALID_PARAMS, msg)
    }

    /// Create an internal error (-32603)
    pub fn internal_error(msg: &str) -> Self {
        Self::new(INTERNAL_ERROR, msg)
    }

    /// Create a server error (-32000)
    pub fn server_error(msg: &str) -> Self {
        Self::new(SERVER_ERROR, msg)
    }

    pub fn to_node(&self) -> Node {
        let mut node = Node::object();
        node.add_member("code").set_value(self.code);
        node.add_member("message").set_value(self.message.as_str());
        if let Some(data) = &self.data {
            let mut data = data.clone();
            data.set_name("data");
            node.push(data);
        }
        node
    }

    fn from_node(node: &Node) -> Result<Self> {
        Ok(Self {
            code: node.get_member_value("code")?,
            message: node
                .find_member("message")
                .map(|m| m.get_value())
                .transpose()?
                .unwrap_or_default(),
            data: node.find_member("data").cloned(),
        })
    }
}

fn with_name(mut node: Node, name: &str) -> Node {
    node.set_name(name);
    node
}

impl JsonRpcRequest {
    /// Creates a request with positional parameters and a numeric id.
    pub fn new(method: impl Into<String>, params: Vec<Node>, id: i64) -> Self {
        let mut array = Node::array();
        for param in params {
            array.push(with_name(param, ""));
        }
        Self {
            method: method.into(),
            params: array,
            id: Node::from_value(id),
        }
    }

    pub fn to_node(&self) -> Node {
        let mut node = Node::object();
        node.add_member("jsonrpc").set_value(VERSION);
        node.add_member("method").set_value(self.method.as_str());
        if !self.params.is_void() {
            node.push(with_name(self.params.clone(), "params"));
        }
        node.push(with_name(self.id.clone(), "id"));
        node
    }

    /// Validates a parsed document as a request.
    pub fn from_node(mut node: Node) -> std::result::Result<Self, JsonRpcError> {
        if node.category() != Category::Object {
            return Err(JsonRpcError::invalid_request());
        }
        if let Some(version) = node.find_member("jsonrpc") {
            if version.get_value::<String>().ok().as_deref() != Some(VERSION) {
                return Err(JsonRpcError::invalid_request());
            }
        }
        let method = match node.find_member("method") {
            Some(m) if m.category() == Category::Value => m
                .get_value::<String>()
                .map_err(|_| JsonRpcError::invalid_request())?,
            _ => return Err(JsonRpcError::invalid_request()),
        };
        let params = node
            .find_member_mut("params")
            .map(std::mem::take)
            .unwrap_or_default();
        if params.category() == Category::Value {
            return Err(JsonRpcError::invalid_params("params must be an array or object"));
        }
        let id = node.find_member_mut("id").map(std::mem::take).unwrap_or_default();
        Ok(Self {
            method,
            params: with_name(params, ""),
            id: with_name(id, ""),
        })
    }

    /// Converts into the protocol-neutral request. Named parameters are
    /// passed positionally in document order.
    pub fn into_rpc_request(self) -> RpcRequest {
        RpcRequest::new(self.method, self.params.into_members()).with_id(self.id)
    }
}

impl JsonRpcResponse {
    /// Create a success response
    ///
    /// # Arguments
    ///
    /// * `id` - Request identifier (must match the request id)
    /// * `result` - Result value
    pub fn success(id: Node, result: Node) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    ///
    /// # Arguments
    ///
    /// * `id` - Request identifier (must match the request id)
    /// * `error` - Error object
    pub fn error(id: Node, error: JsonRpcError) -> Self {
        Self {
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Builds the response to `id` for a procedure outcome.
    pub fn from_reply(id: Node, reply: RpcReply) -> Self {
        match reply {
            RpcReply::Success(result) => Self::success(id, result),
            RpcReply::Fault { code, message } => Self::error(
                id,
                JsonRpcError {
                    code,
                    message,
                    data: None,
                },
            ),
        }
    }

    pub fn to_node(&self) -> Node {
        let mut node = Node::object();
        node.add_member("jsonrpc").set_value(VERSION);
        match &self.error {
            Some(error) => {
                node.push(with_name(error.to_node(), "error"));
            }
            None => {
                let result = self.result.clone().unwrap_or_default();
                node.push(with_name(result, "result"));
            }
        }
        node.push(with_name(self.id.clone(), "id"));
        node
    }

    /// Interprets a parsed document as a response.
    pub fn from_node(node: &Node) -> Result<Self> {
        if node.category() != Category::Object {
            return Err(WeftError::Protocol("JSON-RPC response is not an object".into()));
        }
        let id = node
            .find_member("id")
            .map(|id| with_name(id.clone(), ""))
            .unwrap_or_default();
        match node.find_member("error") {
            Some(error) if !error.is_null() => Ok(Self::error(id, JsonRpcError::from_node(error)?)),
            _ => {
                let result = node
                    .find_member("result")
                    .map(|r| with_name(r.clone(), ""))
                    .unwrap_or_default();
                Ok(Self::success(id, result))
            }
        }
    }

    pub fn into_reply(self) -> RpcReply {
        match self.error {
            Some(error) => RpcReply::Fault {
                code: error.code,
                message: error.message,
            },
            None => RpcReply::Success(self.result.unwrap_or_default()),
        }
    }
}
