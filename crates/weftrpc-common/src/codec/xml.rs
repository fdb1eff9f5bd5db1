//! XML codec for the XML-RPC value grammar
//!
//! ```text
//! <value><int>5</int></value>
//! <value><struct><member><name>x</name><value>..</value></member></struct></value>
//! <value><array><data><value>..</value></data></array></value>
//! ```
//!
//! Parsing is split in two layers. [`XmlTokenizer`] turns bytes into tag and
//! text events one byte at a time; [`ValueBuilder`] assembles those events
//! into a node on an explicit grammar stack. The XML-RPC envelope parsers
//! reuse both.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::trace;

use super::{Formatter, Parser};
use crate::protocol::error::{Result, WeftError};
use crate::value::{Category, Node, Scalar};

/// Maximum element nesting accepted by [`ValueBuilder`].
pub const MAX_DEPTH: usize = 512;

const DATETIME_TAG: &str = "dateTime.iso8601";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    Start(String),
    End(String),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokState {
    Text,
    Entity,
    TagOpen,
    StartName,
    Attrs { quote: Option<u8> },
    EmptyClose,
    EndName,
    Pi { question: bool },
    Bang,
    Comment { dashes: u8 },
    CData { brackets: u8 },
    Doctype { depth: u32 },
}

/// Byte-incremental XML tokenizer.
///
/// Attributes are skipped. The prolog, processing instructions, comments and
/// doctype declarations produce no events. CDATA sections are delivered as
/// text.
#[derive(Debug)]
pub struct XmlTokenizer {
    state: TokState,
    text: Vec<u8>,
    name: Vec<u8>,
    scratch: Vec<u8>,
}

impl Default for XmlTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlTokenizer {
    pub fn new() -> Self {
        XmlTokenizer {
            state: TokState::Text,
            text: Vec::new(),
            name: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = XmlTokenizer::new();
    }

    fn flush_text(&mut self, events: &mut Vec<XmlEvent>) -> Result<()> {
        if !self.text.is_empty() {
            let text = String::from_utf8(std::mem::take(&mut self.text))
                .map_err(|e| WeftError::Protocol(format!("invalid UTF-8 in XML text: {}", e)))?;
            events.push(XmlEvent::Text(text));
        }
        Ok(())
    }

    fn take_name(&mut self) -> Result<String> {
        let name = String::from_utf8(std::mem::take(&mut self.name))
            .map_err(|e| WeftError::Protocol(format!("invalid UTF-8 in XML tag: {}", e)))?;
        if name.is_empty() {
            return Err(WeftError::Protocol("empty XML tag name".into()));
        }
        Ok(name)
    }

    fn decode_entity(&mut self) -> Result<()> {
        let entity = std::str::from_utf8(&self.scratch)
            .map_err(|_| WeftError::Protocol("invalid XML entity".into()))?;
        let c = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32).ok_or_else(|| {
                    WeftError::Protocol(format!("unknown XML entity '&{};'", entity))
                })?
            }
        };
        let mut buf = [0u8; 4];
        self.text.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        Ok(())
    }

    /// Consumes one byte, appending any completed events to `events`.
    pub fn advance(&mut self, byte: u8, events: &mut Vec<XmlEvent>) -> Result<()> {
        match self.state {
            TokState::Text => match byte {
                b'<' => {
                    self.flush_text(events)?;
                    self.state = TokState::TagOpen;
                }
                b'&' => {
                    self.scratch.clear();
                    self.state = TokState::Entity;
                }
                _ => self.text.push(byte),
            },
            TokState::Entity => {
                if byte == b';' {
                    self.decode_entity()?;
                    self.state = TokState::Text;
                } else if self.scratch.len() >= 12 {
                    return Err(WeftError::Protocol("XML entity too long".into()));
                } else {
                    self.scratch.push(byte);
                }
            }
            TokState::TagOpen => match byte {
                b'/' => {
                    self.name.clear();
                    self.state = TokState::EndName;
                }
                b'?' => self.state = TokState::Pi { question: false },
                b'!' => {
                    self.scratch.clear();
                    self.state = TokState::Bang;
                }
                b'>' => return Err(WeftError::Protocol("empty XML tag".into())),
                b if b.is_ascii_whitespace() => {
                    return Err(WeftError::Protocol("whitespace after '<' in XML".into()))
                }
                _ => {
                    self.name.clear();
                    self.name.push(byte);
                    self.state = TokState::StartName;
                }
            },
            TokState::StartName => match byte {
                b'>' => {
                    events.push(XmlEvent::Start(self.take_name()?));
                    self.state = TokState::Text;
                }
                b'/' => self.state = TokState::EmptyClose,
                b if b.is_ascii_whitespace() => self.state = TokState::Attrs { quote: None },
                _ => self.name.push(byte),
            },
            TokState::Attrs { quote: Some(q) } => {
                if byte == q {
                    self.state = TokState::Attrs { quote: None };
                }
            }
            TokState::Attrs { quote: None } => match byte {
                b'"' | b'\'' => self.state = TokState::Attrs { quote: Some(byte) },
                b'/' => self.state = TokState::EmptyClose,
                b'>' => {
                    events.push(XmlEvent::Start(self.take_name()?));
                    self.state = TokState::Text;
                }
                _ => {}
            },
            TokState::EmptyClose => {
                if byte != b'>' {
                    return Err(WeftError::Protocol("expected '>' after '/' in XML tag".into()));
                }
                let name = self.take_name()?;
                events.push(XmlEvent::Start(name.clone()));
                events.push(XmlEvent::End(name));
                self.state = TokState::Text;
            }
            TokState::EndName => match byte {
                b'>' => {
                    events.push(XmlEvent::End(self.take_name()?));
                    self.state = TokState::Text;
                }
                b if b.is_ascii_whitespace() => {}
                _ => self.name.push(byte),
            },
            TokState::Pi { question } => {
                if question && byte == b'>' {
                    self.state = TokState::Text;
                } else {
                    self.state = TokState::Pi {
                        question: byte == b'?',
                    };
                }
            }
            TokState::Bang => {
                self.scratch.push(byte);
                let prefix = self.scratch.as_slice();
                if prefix == b"--" {
                    self.state = TokState::Comment { dashes: 0 };
                } else if prefix == b"[CDATA[" {
                    self.state = TokState::CData { brackets: 0 };
                } else if !b"--".starts_with(prefix) && !b"[CDATA[".starts_with(prefix) {
                    self.state = TokState::Doctype { depth: 0 };
                    return self.advance_doctype(byte);
                }
            }
            TokState::Comment { dashes } => {
                self.state = match byte {
                    b'-' => TokState::Comment {
                        dashes: (dashes + 1).min(2),
                    },
                    b'>' if dashes >= 2 => TokState::Text,
                    _ => TokState::Comment { dashes: 0 },
                };
            }
            TokState::CData { brackets } => match byte {
                b']' => {
                    self.state = TokState::CData {
                        brackets: brackets.saturating_add(1),
                    }
                }
                b'>' if brackets >= 2 => {
                    self.text.resize(self.text.len() + usize::from(brackets - 2), b']');
                    self.state = TokState::Text;
                }
                _ => {
                    self.text.resize(self.text.len() + usize::from(brackets), b']');
                    self.text.push(byte);
                    self.state = TokState::CData { brackets: 0 };
                }
            },
            TokState::Doctype { .. } => return self.advance_doctype(byte),
        }
        Ok(())
    }

    fn advance_doctype(&mut self, byte: u8) -> Result<()> {
        if let TokState::Doctype { depth } = self.state {
            self.state = match byte {
                b'[' => TokState::Doctype { depth: depth + 1 },
                b']' => TokState::Doctype {
                    depth: depth.saturating_sub(1),
                },
                b'>' if depth == 0 => TokState::Text,
                _ => TokState::Doctype { depth },
            };
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Frame {
    Value { text: String, node: Option<Node> },
    Scalar { tag: String, text: String },
    Struct { node: Node },
    Member { name: String, in_name: bool, value: Option<Node> },
    Array { node: Node, in_data: bool },
}

fn unexpected(what: &str, tag: &str) -> WeftError {
    WeftError::Protocol(format!("unexpected {} <{}> in XML-RPC value", what, tag))
}

fn is_scalar_tag(tag: &str) -> bool {
    matches!(
        tag,
        "int" | "i4" | "i8" | "boolean" | "double" | "string" | "base64" | "nil" | DATETIME_TAG
    )
}

fn scalar_node(tag: &str, text: String) -> Result<Node> {
    let invalid = |text: &str| WeftError::Protocol(format!("invalid <{}> value '{}'", tag, text));
    let mut node = Node::new();
    match tag {
        "int" | "i4" | "i8" => {
            let t = text.trim();
            if let Ok(v) = t.parse::<i64>() {
                node.set_value(v);
            } else {
                node.set_value(t.parse::<u64>().map_err(|_| invalid(t))?);
            }
        }
        "boolean" => match text.trim() {
            "1" | "true" => node.set_value(true),
            "0" | "false" => node.set_value(false),
            other => return Err(invalid(other)),
        },
        "double" => {
            let t = text.trim();
            node.set_value(t.parse::<f64>().map_err(|_| invalid(t))?);
        }
        "base64" => {
            // Encoders may wrap lines.
            let compact: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
            let bytes = BASE64
                .decode(&compact)
                .map_err(|_| invalid(text.trim()))?;
            node.set_value(bytes);
        }
        "nil" => node.set_null(),
        DATETIME_TAG => {
            node.set_value(text);
            node.set_type_name(DATETIME_TAG);
        }
        _ => node.set_value(text),
    }
    Ok(node)
}

/// Assembles XML-RPC `<value>` elements from tokenizer events.
#[derive(Debug, Default)]
pub struct ValueBuilder {
    stack: Vec<Frame>,
}

impl ValueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while inside a `<value>` element.
    pub fn is_active(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn reset(&mut self) {
        self.stack.clear();
    }

    fn push(&mut self, frame: Frame) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(WeftError::Protocol("XML-RPC value nesting too deep".into()));
        }
        self.stack.push(frame);
        Ok(())
    }

    fn new_value() -> Frame {
        Frame::Value {
            text: String::new(),
            node: None,
        }
    }

    pub fn start(&mut self, tag: &str) -> Result<()> {
        let frame = match self.stack.last_mut() {
            None if tag == "value" => Self::new_value(),
            None => return Err(unexpected("element", tag)),
            Some(Frame::Value { node: None, .. }) => {
                if is_scalar_tag(tag) {
                    Frame::Scalar {
                        tag: tag.to_string(),
                        text: String::new(),
                    }
                } else if tag == "struct" {
                    Frame::Struct {
                        node: Node::object(),
                    }
                } else if tag == "array" {
                    Frame::Array {
                        node: Node::array(),
                        in_data: false,
                    }
                } else {
                    return Err(unexpected("type", tag));
                }
            }
            Some(Frame::Struct { .. }) if tag == "member" => Frame::Member {
                name: String::new(),
                in_name: false,
                value: None,
            },
            Some(Frame::Member { in_name, value, .. }) => match tag {
                "name" if !*in_name => {
                    *in_name = true;
                    return Ok(());
                }
                "value" if value.is_none() && !*in_name => Self::new_value(),
                _ => return Err(unexpected("member element", tag)),
            },
            Some(Frame::Array { in_data, .. }) => match tag {
                "data" if !*in_data => {
                    *in_data = true;
                    return Ok(());
                }
                "value" if *in_data => Self::new_value(),
                _ => return Err(unexpected("array element", tag)),
            },
            Some(_) => return Err(unexpected("element", tag)),
        };
        self.push(frame)
    }

    pub fn text(&mut self, text: &str) -> Result<()> {
        match self.stack.last_mut() {
            Some(Frame::Value { text: t, node: None }) => t.push_str(text),
            Some(Frame::Scalar { text: t, .. }) => t.push_str(text),
            Some(Frame::Member {
                name,
                in_name: true,
                ..
            }) => name.push_str(text),
            _ if text.trim().is_empty() => {}
            _ => {
                return Err(WeftError::Protocol(format!(
                    "unexpected text '{}' in XML-RPC value",
                    text.trim()
                )))
            }
        }
        Ok(())
    }

    /// Handles a closing tag. Returns the node when a top-level `<value>` closes.
    pub fn end(&mut self, tag: &str) -> Result<Option<Node>> {
        let frame = self
            .stack
            .pop()
            .ok_or_else(|| unexpected("closing", tag))?;
        let completed = match frame {
            Frame::Scalar { tag: t, text } if t == tag => scalar_node(&t, text)?,
            Frame::Struct { node } if tag == "struct" => node,
            Frame::Array { node, in_data } => {
                if tag == "data" && in_data {
                    self.stack.push(Frame::Array {
                        node,
                        in_data: false,
                    });
                    return Ok(None);
                }
                if tag != "array" || in_data {
                    return Err(unexpected("closing", tag));
                }
                node
            }
            Frame::Member {
                name,
                in_name,
                value,
            } => {
                if tag == "name" && in_name {
                    self.stack.push(Frame::Member {
                        name,
                        in_name: false,
                        value,
                    });
                    return Ok(None);
                }
                if tag != "member" || in_name {
                    return Err(unexpected("closing", tag));
                }
                let mut value = value.ok_or_else(|| {
                    WeftError::Protocol(format!("struct member '{}' without value", name))
                })?;
                value.set_name(name);
                match self.stack.last_mut() {
                    Some(Frame::Struct { node }) => {
                        node.push(value);
                        return Ok(None);
                    }
                    _ => return Err(unexpected("closing", tag)),
                }
            }
            Frame::Value { text, node } if tag == "value" => {
                let node = node.unwrap_or_else(|| Node::from_value(text));
                return Ok(self.value_done(node));
            }
            _ => return Err(unexpected("closing", tag)),
        };
        // a typed child of <value> closed
        match self.stack.last_mut() {
            Some(Frame::Value { node, .. }) => {
                *node = Some(completed);
                Ok(None)
            }
            _ => Err(unexpected("closing", tag)),
        }
    }

    fn value_done(&mut self, node: Node) -> Option<Node> {
        match self.stack.last_mut() {
            None => Some(node),
            Some(Frame::Member { value, .. }) => {
                *value = Some(node);
                None
            }
            Some(Frame::Array { node: array, .. }) => {
                array.push(node);
                None
            }
            // start() only opens <value> under a member or array
            Some(_) => None,
        }
    }
}

/// Escapes `&`, `<` and `>` for XML text content.
pub fn escape_into(text: &str, out: &mut Vec<u8>) {
    for b in text.bytes() {
        match b {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            _ => out.push(b),
        }
    }
}

fn write_tagged(out: &mut Vec<u8>, tag: &str, text: &str) {
    out.push(b'<');
    out.extend_from_slice(tag.as_bytes());
    out.push(b'>');
    escape_into(text, out);
    out.extend_from_slice(b"</");
    out.extend_from_slice(tag.as_bytes());
    out.push(b'>');
}

/// Writes `node` as an XML-RPC `<value>` element.
pub fn write_value(node: &Node, out: &mut Vec<u8>) {
    out.extend_from_slice(b"<value>");
    match node.category() {
        Category::Void => out.extend_from_slice(b"<nil/>"),
        Category::Value => match node.scalar() {
            Scalar::None => out.extend_from_slice(b"<nil/>"),
            Scalar::Bool(b) => write_tagged(out, "boolean", if *b { "1" } else { "0" }),
            Scalar::Int(v) => {
                let tag = if i32::try_from(*v).is_ok() { "int" } else { "i8" };
                write_tagged(out, tag, &v.to_string());
            }
            Scalar::UInt(v) => {
                let tag = if i32::try_from(*v).is_ok() { "int" } else { "i8" };
                write_tagged(out, tag, &v.to_string());
            }
            Scalar::Float(v) => write_tagged(out, "double", &v.to_string()),
            Scalar::Double(v) | Scalar::Extended(v) => write_tagged(out, "double", &v.to_string()),
            Scalar::Bytes(bytes) => write_tagged(out, "base64", &BASE64.encode(bytes)),
            other => {
                let tag = if node.type_name() == DATETIME_TAG {
                    DATETIME_TAG
                } else {
                    "string"
                };
                write_tagged(out, tag, &other.to_text());
            }
        },
        Category::Object => {
            out.extend_from_slice(b"<struct>");
            for member in node.members() {
                out.extend_from_slice(b"<member>");
                write_tagged(out, "name", member.name());
                write_value(member, out);
                out.extend_from_slice(b"</member>");
            }
            out.extend_from_slice(b"</struct>");
        }
        Category::Array => {
            out.extend_from_slice(b"<array><data>");
            for child in node.members() {
                write_value(child, out);
            }
            out.extend_from_slice(b"</data></array>");
        }
    }
    out.extend_from_slice(b"</value>");
}

#[derive(Debug, Default, Clone, Copy)]
pub struct XmlFormatter;

impl XmlFormatter {
    pub fn new() -> Self {
        XmlFormatter
    }
}

impl Formatter for XmlFormatter {
    fn format(&mut self, node: &Node, out: &mut Vec<u8>) -> Result<()> {
        write_value(node, out);
        Ok(())
    }
}

/// Resumable parser for a single XML-RPC `<value>` document.
#[derive(Debug, Default)]
pub struct XmlParser {
    tokenizer: XmlTokenizer,
    builder: ValueBuilder,
    events: Vec<XmlEvent>,
    result: Option<Node>,
}

impl XmlParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Parser for XmlParser {
    type Output = Node;

    fn advance(&mut self, byte: u8) -> Result<bool> {
        if self.result.is_some() {
            return Err(WeftError::Protocol("data after complete XML value".into()));
        }
        self.tokenizer.advance(byte, &mut self.events)?;
        for event in self.events.drain(..) {
            if self.result.is_some() {
                return Err(WeftError::Protocol("data after complete XML value".into()));
            }
            match event {
                XmlEvent::Start(tag) => self.builder.start(&tag)?,
                XmlEvent::Text(text) => self.builder.text(&text)?,
                XmlEvent::End(tag) => {
                    if let Some(node) = self.builder.end(&tag)? {
                        trace!("XML value complete");
                        self.result = Some(node);
                    }
                }
            }
        }
        Ok(self.result.is_some())
    }

    fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    fn take(&mut self) -> Option<Node> {
        let node = self.result.take();
        if node.is_some() {
            self.reset();
        }
        node
    }

    fn reset(&mut self) {
        self.tokenizer.reset();
        self.builder.reset();
        self.events.clear();
        self.result = None;
    }
}
