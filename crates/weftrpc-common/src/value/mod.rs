//! Value Tree
//!
//! Every wire codec translates between bytes and this intermediate tree. A
//! [`Node`] has a category, an optional name, an optional type tag, at most
//! one [`Scalar`] payload and an ordered list of owned children.
//!
//! # Example
//!
//! ```
//! use weftrpc_common::value::{Category, Node};
//!
//! let mut point = Node::new();
//! point.add_member("x").set_value(3);
//! point.add_member("y").set_value(4);
//!
//! assert_eq!(point.category(), Category::Object);
//! assert_eq!(point.get_member_value::<i32>("y").unwrap(), 4);
//! ```

mod convert;
mod scalar;


use std::fmt::Write as _;

pub use convert::{FromNode, IntoNode};
pub use scalar::{FromScalar, Scalar};

use crate::protocol::error::{Result, WeftError};

/// Structural category of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Category {
    #[default]
    Void,
    Value,
    Object,
    Array,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    category: Category,
    name: String,
    type_name: String,
    scalar: Scalar,
    children: Vec<Node>,
}

impl Node {
    /// Creates an unnamed `Void` node.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Creates an unnamed `Value` node holding `value`.
    pub fn from_value<T: Into<Scalar>>(value: T) -> Self {
        let mut node = Self::new();
        node.set_value(value);
        node
    }

    /// Creates an empty `Array` node, distinct from `Void`.
    pub fn array() -> Self {
        Self {
            category: Category::Array,
            ..Self::default()
        }
    }

    /// Creates an empty `Object` node, distinct from `Void`.
    pub fn object() -> Self {
        Self {
            category: Category::Object,
            ..Self::default()
        }
    }

    /// Creates a `Value` node without payload (JSON `null`).
    pub fn null() -> Self {
        Self::from_value(Scalar::None)
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn set_category(&mut self, category: Category) {
        self.category = category;
    }

    pub fn is_void(&self) -> bool {
        self.category == Category::Void
    }

    /// True for `Void` nodes and `Value` nodes without a payload.
    pub fn is_null(&self) -> bool {
        match self.category {
            Category::Void => true,
            Category::Value => self.scalar.is_none(),
            _ => false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn set_type_name(&mut self, type_name: impl Into<String>) {
        self.type_name = type_name.into();
    }

    pub fn scalar(&self) -> &Scalar {
        &self.scalar
    }

    /// Replaces the payload, dropping any children. The node becomes a `Value`.
    pub fn set_value<T: Into<Scalar>>(&mut self, value: T) {
        self.scalar = value.into();
        self.children.clear();
        self.category = Category::Value;
    }

    /// Clears the payload and children. The node becomes a `Value` without payload.
    pub fn set_null(&mut self) {
        self.set_value(Scalar::None);
    }

    /// Converts the payload to `T`.
    ///
    /// Numeric targets are range checked, text sources are parsed and a
    /// missing payload yields zero, `false` or the empty string.
    pub fn get_value<T: FromScalar>(&self) -> Result<T> {
        T::from_scalar(&self.scalar)
    }

    /// Appends a child named `name` and returns it.
    ///
    /// An unnamed child turns a scalar or void parent into an `Array`, a
    /// named child into an `Object`. Parents that already are an `Object` or
    /// `Array` keep their category.
    pub fn add_member(&mut self, name: impl Into<String>) -> &mut Node {
        self.push(Node::named(name))
    }

    /// Appends an existing node as child, applying the same category rule
    /// as [`Node::add_member`].
    pub fn push(&mut self, child: Node) -> &mut Node {
        if !matches!(self.category, Category::Object | Category::Array) {
            self.category = if child.name.is_empty() {
                Category::Array
            } else {
                Category::Object
            };
            self.scalar = Scalar::None;
        }
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Returns the first child named `name`.
    pub fn get_member(&self, name: &str) -> Result<&Node> {
        self.find_member(name)
            .ok_or_else(|| WeftError::MemberNotFound(name.to_string()))
    }

    pub fn find_member(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn find_member_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    pub fn get_member_value<T: FromScalar>(&self, name: &str) -> Result<T> {
        self.get_member(name)?.get_value()
    }

    pub fn member_at(&self, index: usize) -> Result<&Node> {
        self.children.get(index).ok_or_else(|| {
            WeftError::Range(format!(
                "member index {} out of range ({} members)",
                index,
                self.children.len()
            ))
        })
    }

    pub fn members(&self) -> &[Node] {
        &self.children
    }

    pub fn members_mut(&mut self) -> &mut [Node] {
        &mut self.children
    }

    pub fn into_members(self) -> Vec<Node> {
        self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Resets the node to an unnamed `Void`.
    pub fn clear(&mut self) {
        *self = Node::new();
    }

    pub fn swap(&mut self, other: &mut Node) {
        std::mem::swap(self, other);
    }

    /// Multi-line debug rendering of the subtree.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        let _ = write!(out, "{:indent$}", "", indent = depth * 2);
        if !self.name.is_empty() {
            let _ = write!(out, "{} ", self.name);
        }
        if !self.type_name.is_empty() {
            let _ = write!(out, "<{}> ", self.type_name);
        }
        match self.category {
            Category::Void => out.push_str("void\n"),
            Category::Value => {
                let _ = writeln!(out, "{}: {}", self.scalar.kind_name(), self.scalar);
            }
            Category::Object | Category::Array => {
                let (open, close) = if self.category == Category::Object {
                    ('{', '}')
                } else {
                    ('[', ']')
                };
                let _ = writeln!(out, "{}", open);
                for child in &self.children {
                    child.dump_into(out, depth + 1);
                }
                let _ = writeln!(out, "{:indent$}{}", "", close, indent = depth * 2);
            }
        }
    }
}
