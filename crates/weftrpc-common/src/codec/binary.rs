//! Binary codec
//!
//! Each node is encoded as
//!
//! ```text
//! [kind u8][name: u16 len + utf8][type: u16 len + utf8][payload]
//! ```
//!
//! All integers are big endian. Payload by kind: none and void are empty,
//! bool is 1 byte, char is a u32 code point, int/uint are 8 bytes, float is
//! 4 bytes, double and extended are 8 bytes, strings are a u32 length
//! followed by the bytes, objects and arrays are a u32 child count followed
//! by the children.

use tracing::trace;

use super::{Formatter, Parser};
use crate::protocol::error::{Result, WeftError};
use crate::value::{Category, Node, Scalar};

pub const KIND_VOID: u8 = 0;
pub const KIND_NONE: u8 = 1;
pub const KIND_BYTES: u8 = 2;
pub const KIND_TEXT: u8 = 3;
pub const KIND_CHAR: u8 = 4;
pub const KIND_BOOL: u8 = 5;
pub const KIND_INT: u8 = 6;
pub const KIND_UINT: u8 = 7;
pub const KIND_FLOAT: u8 = 8;
pub const KIND_DOUBLE: u8 = 9;
pub const KIND_EXTENDED: u8 = 10;
pub const KIND_OBJECT: u8 = 11;
pub const KIND_ARRAY: u8 = 12;

/// Maximum nesting depth accepted by the parser.
pub const MAX_DEPTH: usize = 512;

fn kind_of(node: &Node) -> u8 {
    match node.category() {
        Category::Void => KIND_VOID,
        Category::Object => KIND_OBJECT,
        Category::Array => KIND_ARRAY,
        Category::Value => match node.scalar() {
            Scalar::None => KIND_NONE,
            Scalar::Bytes(_) => KIND_BYTES,
            Scalar::Text(_) => KIND_TEXT,
            Scalar::Char(_) => KIND_CHAR,
            Scalar::Bool(_) => KIND_BOOL,
            Scalar::Int(_) => KIND_INT,
            Scalar::UInt(_) => KIND_UINT,
            Scalar::Float(_) => KIND_FLOAT,
            Scalar::Double(_) => KIND_DOUBLE,
            Scalar::Extended(_) => KIND_EXTENDED,
        },
    }
}

pub(crate) fn write_short_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| WeftError::Protocol(format!("name too long ({} bytes)", s.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn write_long_bytes(out: &mut Vec<u8>, b: &[u8]) -> Result<()> {
    let len = u32::try_from(b.len())
        .map_err(|_| WeftError::Protocol(format!("string too long ({} bytes)", b.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(b);
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryFormatter;

impl BinaryFormatter {
    pub fn new() -> Self {
        BinaryFormatter
    }
}

impl Formatter for BinaryFormatter {
    fn format(&mut self, node: &Node, out: &mut Vec<u8>) -> Result<()> {
        out.push(kind_of(node));
        write_short_str(out, node.name())?;
        write_short_str(out, node.type_name())?;
        match node.category() {
            Category::Void => {}
            Category::Object | Category::Array => {
                let count = u32::try_from(node.len())
                    .map_err(|_| WeftError::Protocol("too many members".into()))?;
                out.extend_from_slice(&count.to_be_bytes());
                for child in node.members() {
                    self.format(child, out)?;
                }
            }
            Category::Value => match node.scalar() {
                Scalar::None => {}
                Scalar::Bytes(b) => write_long_bytes(out, b)?,
                Scalar::Text(s) => write_long_bytes(out, s.as_bytes())?,
                Scalar::Char(c) => out.extend_from_slice(&u32::from(*c).to_be_bytes()),
                Scalar::Bool(b) => out.push(u8::from(*b)),
                Scalar::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
                Scalar::UInt(v) => out.extend_from_slice(&v.to_be_bytes()),
                Scalar::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
                Scalar::Double(v) | Scalar::Extended(v) => out.extend_from_slice(&v.to_be_bytes()),
            },
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Kind,
    NameLen,
    Name,
    TypeLen,
    Type,
    Fixed,
    StrLen,
    Str,
    Count,
}

impl Step {
    /// Steps whose bytes are content rather than framing.
    fn is_bulk(self) -> bool {
        matches!(self, Step::Name | Step::Type | Step::Str)
    }
}

#[derive(Debug, Default)]
struct Header {
    kind: u8,
    name: String,
    type_name: String,
}

#[derive(Debug)]
struct Frame {
    node: Node,
    remaining: u32,
}

/// Resumable binary node parser.
///
/// In skip mode the parser validates framing without decoding strings or
/// building nodes; [`Parser::take`] then yields a `Void` node.
#[derive(Debug)]
pub struct BinaryParser {
    step: Step,
    need: usize,
    have: usize,
    buf: Vec<u8>,
    header: Header,
    stack: Vec<Frame>,
    result: Option<Node>,
    done: bool,
    skip: bool,
}

impl Default for BinaryParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryParser {
    pub fn new() -> Self {
        BinaryParser {
            step: Step::Kind,
            need: 1,
            have: 0,
            buf: Vec::new(),
            header: Header::default(),
            stack: Vec::new(),
            result: None,
            done: false,
            skip: false,
        }
    }

    /// Creates a parser that discards the node it reads.
    pub fn skipping() -> Self {
        BinaryParser {
            skip: true,
            ..Self::new()
        }
    }

    /// Switches skip mode. Only meaningful before the first byte of a node.
    pub fn set_skip(&mut self, skip: bool) {
        debug_assert!(self.step == Step::Kind && self.have == 0 && self.stack.is_empty());
        self.skip = skip;
    }

    pub fn is_skipping(&self) -> bool {
        self.skip
    }

    fn expect(&mut self, step: Step, need: usize) -> Result<()> {
        self.step = step;
        self.need = need;
        self.have = 0;
        self.buf.clear();
        if need == 0 {
            self.step_complete()?;
        }
        Ok(())
    }

    fn be_u16(&self) -> usize {
        usize::from(u16::from_be_bytes([self.buf[0], self.buf[1]]))
    }

    fn be_u32(&self) -> u32 {
        u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
    }

    fn be_u64(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[..8]);
        u64::from_be_bytes(b)
    }

    fn take_text(&mut self) -> Result<String> {
        if self.skip {
            return Ok(String::new());
        }
        String::from_utf8(std::mem::take(&mut self.buf))
            .map_err(|e| WeftError::Protocol(format!("invalid UTF-8 in binary node: {}", e)))
    }

    fn new_node(&mut self) -> Node {
        if self.skip {
            return Node::new();
        }
        let header = std::mem::take(&mut self.header);
        let mut node = match header.kind {
            KIND_OBJECT => Node::object(),
            KIND_ARRAY => Node::array(),
            _ => Node::new(),
        };
        node.set_name(header.name);
        node.set_type_name(header.type_name);
        node
    }

    fn value_node(&mut self, scalar: Scalar) -> Result<()> {
        let mut node = self.new_node();
        if !self.skip {
            node.set_value(scalar);
        }
        self.node_done(node)
    }

    fn step_complete(&mut self) -> Result<()> {
        match self.step {
            Step::Kind => {
                let kind = self.buf[0];
                if kind > KIND_ARRAY {
                    return Err(WeftError::Protocol(format!("invalid binary node kind {}", kind)));
                }
                self.header.kind = kind;
                self.expect(Step::NameLen, 2)
            }
            Step::NameLen => {
                let n = self.be_u16();
                self.expect(Step::Name, n)
            }
            Step::Name => {
                self.header.name = self.take_text()?;
                self.expect(Step::TypeLen, 2)
            }
            Step::TypeLen => {
                let n = self.be_u16();
                self.expect(Step::Type, n)
            }
            Step::Type => {
                self.header.type_name = self.take_text()?;
                self.begin_payload()
            }
            Step::Fixed => {
                let scalar = match self.header.kind {
                    KIND_BOOL => Scalar::Bool(self.buf[0] != 0),
                    KIND_CHAR => {
                        let code = self.be_u32();
                        Scalar::Char(char::from_u32(code).ok_or_else(|| {
                            WeftError::Protocol(format!("invalid char code point {}", code))
                        })?)
                    }
                    KIND_INT => Scalar::Int(self.be_u64() as i64),
                    KIND_UINT => Scalar::UInt(self.be_u64()),
                    KIND_FLOAT => Scalar::Float(f32::from_bits(self.be_u32())),
                    KIND_DOUBLE => Scalar::Double(f64::from_bits(self.be_u64())),
                    _ => Scalar::Extended(f64::from_bits(self.be_u64())),
                };
                self.value_node(scalar)
            }
            Step::StrLen => {
                let n = self.be_u32() as usize;
                self.expect(Step::Str, n)
            }
            Step::Str => {
                let scalar = if self.skip {
                    Scalar::None
                } else if self.header.kind == KIND_BYTES {
                    Scalar::Bytes(std::mem::take(&mut self.buf))
                } else {
                    Scalar::Text(self.take_text()?)
                };
                self.value_node(scalar)
            }
            Step::Count => {
                let remaining = self.be_u32();
                let node = self.new_node();
                if remaining == 0 {
                    return self.node_done(node);
                }
                if self.stack.len() >= MAX_DEPTH {
                    return Err(WeftError::Protocol("binary node nesting too deep".into()));
                }
                self.stack.push(Frame { node, remaining });
                self.expect(Step::Kind, 1)
            }
        }
    }

    fn begin_payload(&mut self) -> Result<()> {
        match self.header.kind {
            KIND_VOID => {
                let node = self.new_node();
                self.node_done(node)
            }
            KIND_NONE => self.value_node(Scalar::None),
            KIND_BOOL => self.expect(Step::Fixed, 1),
            KIND_CHAR | KIND_FLOAT => self.expect(Step::Fixed, 4),
            KIND_INT | KIND_UINT | KIND_DOUBLE | KIND_EXTENDED => self.expect(Step::Fixed, 8),
            KIND_BYTES | KIND_TEXT => self.expect(Step::StrLen, 4),
            _ => self.expect(Step::Count, 4),
        }
    }

    fn node_done(&mut self, mut node: Node) -> Result<()> {
        loop {
            let Some(mut frame) = self.stack.pop() else {
                if !self.skip {
                    self.result = Some(node);
                }
                self.done = true;
                trace!("binary node complete");
                return Ok(());
            };
            if !self.skip {
                frame.node.push(node);
            }
            frame.remaining -= 1;
            if frame.remaining > 0 {
                self.stack.push(frame);
                return self.expect(Step::Kind, 1);
            }
            node = frame.node;
        }
    }
}

impl Parser for BinaryParser {
    type Output = Node;

    fn advance(&mut self, byte: u8) -> Result<bool> {
        if self.done {
            return Err(WeftError::Protocol("data after complete binary node".into()));
        }
        if !(self.skip && self.step.is_bulk()) {
            self.buf.push(byte);
        }
        self.have += 1;
        if self.have == self.need {
            self.step_complete()?;
        }
        Ok(self.done)
    }

    fn is_complete(&self) -> bool {
        self.done
    }

    fn take(&mut self) -> Option<Node> {
        if !self.done {
            return None;
        }
        let node = self.result.take().unwrap_or_default();
        self.reset();
        Some(node)
    }

    fn reset(&mut self) {
        let skip = self.skip;
        *self = BinaryParser::new();
        self.skip = skip;
    }
}
