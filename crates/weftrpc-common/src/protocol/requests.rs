use crate::value::Node;

pub type MethodName = String;

/// A decoded procedure call.
///
/// `id` carries the JSON-RPC request id and is `Void` for protocols without
/// correlation ids (binary, XML-RPC).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcRequest {
    pub method: MethodName,
    pub params: Vec<Node>,
    pub id: Node,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Node>) -> Self {
        RpcRequest {
            method: method.into(),
            params,
            id: Node::new(),
        }
    }

    pub fn with_id(mut self, id: Node) -> Self {
        self.id = id;
        self
    }

    /// Returns parameter `index`, or a `Void` node when the caller sent fewer.
    pub fn param(&self, index: usize) -> Node {
        self.params.get(index).cloned().unwrap_or_default()
    }
}
