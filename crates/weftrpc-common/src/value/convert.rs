use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use super::{Category, FromScalar, Node, Scalar};
use crate::protocol::error::{Result, WeftError};

/// Typed extraction from a value node.
///
/// Implemented for the scalar types, `String`, `Vec<T>`, `Option<T>`,
/// `BTreeMap<String, T>` and `Node` itself. Procedure parameters are
/// extracted through this trait.
pub trait FromNode: Sized {
    fn from_node(node: &Node) -> Result<Self>;

    /// Extracts a sequence. `u8` overrides this to read narrow strings.
    #[doc(hidden)]
    fn vec_from_node(node: &Node) -> Result<Vec<Self>> {
        if node.category() == Category::Value && !node.scalar().is_none() {
            return Err(WeftError::Conversion {
                target: "sequence",
                from_kind: node.scalar().kind_name(),
                value: node.scalar().to_string(),
            });
        }
        node.members().iter().map(Self::from_node).collect()
    }
}

/// Conversion of a typed value into a value node.
pub trait IntoNode {
    fn into_node(self) -> Node;

    /// Builds a sequence node. `u8` overrides this to produce a narrow string.
    #[doc(hidden)]
    fn vec_into_node(items: Vec<Self>) -> Node
    where
        Self: Sized,
    {
        let mut node = Node::array();
        for item in items {
            node.push(item.into_node());
        }
        node
    }
}

macro_rules! scalar_node_impls {
    ($($t:ty),*) => {
        $(
            impl FromNode for $t {
                fn from_node(node: &Node) -> Result<Self> {
                    <$t as FromScalar>::from_scalar(node.scalar())
                }
            }

            impl IntoNode for $t {
                fn into_node(self) -> Node {
                    Node::from_value(self)
                }
            }
        )*
    };
}

scalar_node_impls!(i8, i16, i32, i64, isize, u16, u32, u64, usize, f32, f64, bool, char, String);

impl FromNode for u8 {
    fn from_node(node: &Node) -> Result<Self> {
        node.get_value()
    }

    fn vec_from_node(node: &Node) -> Result<Vec<Self>> {
        match node.scalar() {
            Scalar::Bytes(b) => Ok(b.clone()),
            Scalar::Text(s) => Ok(s.as_bytes().to_vec()),
            _ => node.members().iter().map(u8::from_node).collect(),
        }
    }
}

impl IntoNode for u8 {
    fn into_node(self) -> Node {
        Node::from_value(self)
    }

    fn vec_into_node(items: Vec<Self>) -> Node {
        Node::from_value(items)
    }
}

impl IntoNode for &str {
    fn into_node(self) -> Node {
        Node::from_value(self)
    }
}

impl IntoNode for Scalar {
    fn into_node(self) -> Node {
        Node::from_value(self)
    }
}

impl IntoNode for () {
    fn into_node(self) -> Node {
        Node::new()
    }
}

impl FromNode for Node {
    fn from_node(node: &Node) -> Result<Self> {
        Ok(node.clone())
    }
}

impl IntoNode for Node {
    fn into_node(self) -> Node {
        self
    }
}

impl<T: FromNode> FromNode for Vec<T> {
    fn from_node(node: &Node) -> Result<Self> {
        T::vec_from_node(node)
    }
}

impl<T: IntoNode> IntoNode for Vec<T> {
    fn into_node(self) -> Node {
        T::vec_into_node(self)
    }
}

impl<T: FromNode> FromNode for Option<T> {
    fn from_node(node: &Node) -> Result<Self> {
        if node.is_null() {
            Ok(None)
        } else {
            T::from_node(node).map(Some)
        }
    }
}

impl<T: IntoNode> IntoNode for Option<T> {
    fn into_node(self) -> Node {
        match self {
            Some(v) => v.into_node(),
            None => Node::new(),
        }
    }
}

impl<T: FromNode> FromNode for BTreeMap<String, T> {
    fn from_node(node: &Node) -> Result<Self> {
        node.members()
            .iter()
            .map(|m| Ok((m.name().to_string(), T::from_node(m)?)))
            .collect()
    }
}

impl<T: IntoNode> IntoNode for BTreeMap<String, T> {
    fn into_node(self) -> Node {
        let mut node = Node::object();
        for (name, value) in self {
            let mut child = value.into_node();
            child.set_name(name);
            node.push(child);
        }
        node
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Node::new(),
            Value::Bool(b) => Node::from_value(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Node::from_value(i)
                } else if let Some(u) = n.as_u64() {
                    Node::from_value(u)
                } else {
                    Node::from_value(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Node::from_value(s),
            Value::Array(items) => {
                let mut node = Node::array();
                for item in items {
                    node.push(Node::from(item));
                }
                node
            }
            Value::Object(map) => {
                let mut node = Node::object();
                for (name, item) in map {
                    let mut child = Node::from(item);
                    child.set_name(name);
                    node.push(child);
                }
                node
            }
        }
    }
}

fn float_to_json(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

impl Node {
    /// Converts the subtree into a `serde_json::Value`.
    ///
    /// Non-finite floats become `null`; narrow strings are decoded lossily.
    /// Duplicate member names keep the last value.
    pub fn to_json_value(&self) -> Value {
        match self.category() {
            Category::Void => Value::Null,
            Category::Value => match self.scalar() {
                Scalar::None => Value::Null,
                Scalar::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
                Scalar::Text(s) => Value::String(s.clone()),
                Scalar::Char(c) => Value::String(c.to_string()),
                Scalar::Bool(b) => Value::Bool(*b),
                Scalar::Int(v) => Value::from(*v),
                Scalar::UInt(v) => Value::from(*v),
                Scalar::Float(v) => float_to_json(f64::from(*v)),
                Scalar::Double(v) | Scalar::Extended(v) => float_to_json(*v),
            },
            Category::Array => Value::Array(self.members().iter().map(Node::to_json_value).collect()),
            Category::Object => {
                let mut map = Map::new();
                for member in self.members() {
                    map.insert(member.name().to_string(), member.to_json_value());
                }
                Value::Object(map)
            }
        }
    }
}
