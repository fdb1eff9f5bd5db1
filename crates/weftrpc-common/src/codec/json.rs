//! JSON codec
//!
//! Objects map to `Object` nodes, arrays to `Array` nodes, strings to text,
//! integers to `Int` (or `UInt` above `i64::MAX`), numbers with a fraction or
//! exponent to `Double`, `true`/`false` to `Bool` and `null` to `Void`.

use std::fmt::Write as _;

use tracing::trace;

use super::{Formatter, Parser};
use crate::protocol::error::{Result, WeftError};
use crate::value::{Category, Node, Scalar};

/// Maximum nesting depth accepted by the parser.
pub const MAX_DEPTH: usize = 512;

#[derive(Debug, Default, Clone)]
pub struct JsonFormatter {
    beautify: bool,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables pretty printing with two-space indentation.
    pub fn beautify(mut self, on: bool) -> Self {
        self.beautify = on;
        self
    }

    fn newline(&self, out: &mut Vec<u8>, depth: usize) {
        if self.beautify {
            out.push(b'\n');
            out.resize(out.len() + depth * 2, b' ');
        }
    }

    fn write_node(&self, node: &Node, out: &mut Vec<u8>, depth: usize) {
        match node.category() {
            Category::Void => out.extend_from_slice(b"null"),
            Category::Value => write_scalar(node.scalar(), out),
            Category::Array => {
                out.push(b'[');
                for (i, child) in node.members().iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    self.newline(out, depth + 1);
                    self.write_node(child, out, depth + 1);
                }
                if !node.is_empty() {
                    self.newline(out, depth);
                }
                out.push(b']');
            }
            Category::Object => {
                out.push(b'{');
                for (i, child) in node.members().iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    self.newline(out, depth + 1);
                    write_string(child.name().as_bytes(), out);
                    out.push(b':');
                    if self.beautify {
                        out.push(b' ');
                    }
                    self.write_node(child, out, depth + 1);
                }
                if !node.is_empty() {
                    self.newline(out, depth);
                }
                out.push(b'}');
            }
        }
    }
}

impl Formatter for JsonFormatter {
    fn format(&mut self, node: &Node, out: &mut Vec<u8>) -> Result<()> {
        self.write_node(node, out, 0);
        Ok(())
    }
}

fn write_scalar(scalar: &Scalar, out: &mut Vec<u8>) {
    let mut text = String::new();
    match scalar {
        Scalar::None => out.extend_from_slice(b"null"),
        Scalar::Bytes(b) => write_string(String::from_utf8_lossy(b).as_bytes(), out),
        Scalar::Text(s) => write_string(s.as_bytes(), out),
        Scalar::Char(c) => write_string(c.to_string().as_bytes(), out),
        Scalar::Bool(b) => out.extend_from_slice(if *b { &b"true"[..] } else { &b"false"[..] }),
        Scalar::Int(v) => {
            let _ = write!(text, "{}", v);
        }
        Scalar::UInt(v) => {
            let _ = write!(text, "{}", v);
        }
        Scalar::Float(v) if v.is_finite() => {
            let _ = write!(text, "{:?}", v);
        }
        Scalar::Double(v) | Scalar::Extended(v) if v.is_finite() => {
            let _ = write!(text, "{:?}", v);
        }
        Scalar::Float(_) | Scalar::Double(_) | Scalar::Extended(_) => out.extend_from_slice(b"null"),
    }
    out.extend_from_slice(text.as_bytes());
}

fn write_string(s: &[u8], out: &mut Vec<u8>) {
    out.push(b'"');
    for &b in s {
        match b {
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x08 => out.extend_from_slice(b"\\b"),
            0x0c => out.extend_from_slice(b"\\f"),
            c if c < 0x20 => {
                let _ = write!(ByteWriter(out), "\\u{:04x}", c);
            }
            c => out.push(c),
        }
    }
    out.push(b'"');
}

struct ByteWriter<'a>(&'a mut Vec<u8>);

impl std::fmt::Write for ByteWriter<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Value,
    ObjectStart,
    ObjectKey,
    Colon,
    AfterMember,
    ArrayStart,
    AfterElement,
    Str { key: bool },
    StrEscape { key: bool },
    StrUnicode { key: bool, digits: u8, code: u32 },
    Literal { word: &'static [u8], pos: usize },
    Number,
    Done,
}

#[derive(Debug)]
struct Frame {
    node: Node,
    key: String,
}

/// Resumable JSON parser with an explicit frame stack.
#[derive(Debug)]
pub struct JsonParser {
    state: State,
    stack: Vec<Frame>,
    text: Vec<u8>,
    high_surrogate: Option<u32>,
    result: Option<Node>,
    offset: usize,
}

impl Default for JsonParser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

impl JsonParser {
    pub fn new() -> Self {
        JsonParser {
            state: State::Value,
            stack: Vec::new(),
            text: Vec::new(),
            high_surrogate: None,
            result: None,
            offset: 0,
        }
    }

    fn unexpected(&self, byte: u8) -> WeftError {
        WeftError::Protocol(format!(
            "unexpected character '{}' at offset {} in JSON",
            char::from(byte).escape_default(),
            self.offset
        ))
    }

    fn push_frame(&mut self, node: Node, state: State) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(WeftError::Protocol("JSON nesting too deep".into()));
        }
        self.stack.push(Frame {
            node,
            key: String::new(),
        });
        self.state = state;
        Ok(())
    }

    fn start_value(&mut self, byte: u8) -> Result<()> {
        match byte {
            b'{' => self.push_frame(Node::object(), State::ObjectStart),
            b'[' => self.push_frame(Node::array(), State::ArrayStart),
            b'"' => {
                self.text.clear();
                self.state = State::Str { key: false };
                Ok(())
            }
            b't' => {
                self.state = State::Literal { word: b"true", pos: 1 };
                Ok(())
            }
            b'f' => {
                self.state = State::Literal { word: b"false", pos: 1 };
                Ok(())
            }
            b'n' => {
                self.state = State::Literal { word: b"null", pos: 1 };
                Ok(())
            }
            b'-' | b'0'..=b'9' => {
                self.text.clear();
                self.text.push(byte);
                self.state = State::Number;
                Ok(())
            }
            _ => Err(self.unexpected(byte)),
        }
    }

    fn value_done(&mut self, mut node: Node) {
        match self.stack.last_mut() {
            None => {
                trace!("JSON document complete at offset {}", self.offset);
                self.result = Some(node);
                self.state = State::Done;
            }
            Some(frame) => {
                if frame.node.category() == Category::Object {
                    node.set_name(std::mem::take(&mut frame.key));
                    self.state = State::AfterMember;
                } else {
                    self.state = State::AfterElement;
                }
                frame.node.push(node);
            }
        }
    }

    fn close_container(&mut self) {
        if let Some(frame) = self.stack.pop() {
            self.value_done(frame.node);
        }
    }

    fn string_done(&mut self, key: bool) -> Result<()> {
        let text = String::from_utf8(std::mem::take(&mut self.text))
            .map_err(|e| WeftError::Protocol(format!("invalid UTF-8 in JSON string: {}", e)))?;
        if key {
            if let Some(frame) = self.stack.last_mut() {
                frame.key = text;
            }
            self.state = State::Colon;
        } else {
            self.value_done(Node::from_value(text));
        }
        Ok(())
    }

    fn number_done(&mut self) -> Result<()> {
        let text = std::str::from_utf8(&self.text)
            .map_err(|_| WeftError::Protocol("invalid JSON number".into()))?;
        let invalid = || WeftError::Protocol(format!("invalid JSON number '{}'", text));
        if !is_number_grammar(text.as_bytes()) {
            return Err(invalid());
        }
        let node = if text.contains(|c| matches!(c, '.' | 'e' | 'E')) {
            Node::from_value(text.parse::<f64>().map_err(|_| invalid())?)
        } else if let Ok(v) = text.parse::<i64>() {
            Node::from_value(v)
        } else if let Ok(v) = text.parse::<u64>() {
            Node::from_value(v)
        } else {
            // digits only, beyond u64
            let v = text.parse::<f64>().map_err(|_| invalid())?;
            Node::from_value(v)
        };
        self.value_done(node);
        Ok(())
    }

    fn push_char(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.text.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }

    fn unicode_escape(&mut self, code: u32) -> Result<()> {
        let lone = || WeftError::Protocol("unpaired surrogate in JSON string".into());
        match (self.high_surrogate.take(), code) {
            (None, 0xD800..=0xDBFF) => {
                self.high_surrogate = Some(code);
                Ok(())
            }
            (Some(high), 0xDC00..=0xDFFF) => {
                let combined = 0x10000 + ((high - 0xD800) << 10) + (code - 0xDC00);
                self.push_char(char::from_u32(combined).ok_or_else(lone)?);
                Ok(())
            }
            (None, _) => {
                self.push_char(char::from_u32(code).ok_or_else(lone)?);
                Ok(())
            }
            (Some(_), _) => Err(lone()),
        }
    }
}

/// `-? (0 | [1-9][0-9]*) (. [0-9]+)? ([eE] [+-]? [0-9]+)?`
fn is_number_grammar(text: &[u8]) -> bool {
    fn digits(text: &[u8]) -> usize {
        text.iter().take_while(|b| b.is_ascii_digit()).count()
    }

    let mut rest = text.strip_prefix(b"-").unwrap_or(text);
    match digits(rest) {
        0 => return false,
        n if n > 1 && rest[0] == b'0' => return false,
        n => rest = &rest[n..],
    }
    if let Some(fraction) = rest.strip_prefix(b".") {
        let n = digits(fraction);
        if n == 0 {
            return false;
        }
        rest = &fraction[n..];
    }
    if let Some(exponent) = rest.strip_prefix(b"e").or_else(|| rest.strip_prefix(b"E")) {
        let exponent = exponent
            .strip_prefix(b"+")
            .or_else(|| exponent.strip_prefix(b"-"))
            .unwrap_or(exponent);
        let n = digits(exponent);
        if n == 0 {
            return false;
        }
        rest = &exponent[n..];
    }
    rest.is_empty()
}

impl Parser for JsonParser {
    type Output = Node;

    fn advance(&mut self, byte: u8) -> Result<bool> {
        self.offset += 1;
        match self.state {
            State::Done => return Err(WeftError::Protocol("data after complete JSON document".into())),
            State::Value => {
                if !is_ws(byte) {
                    self.start_value(byte)?;
                }
            }
            State::ArrayStart => match byte {
                b if is_ws(b) => {}
                b']' => self.close_container(),
                _ => self.start_value(byte)?,
            },
            State::ObjectStart => match byte {
                b if is_ws(b) => {}
                b'}' => self.close_container(),
                b'"' => {
                    self.text.clear();
                    self.state = State::Str { key: true };
                }
                _ => return Err(self.unexpected(byte)),
            },
            State::ObjectKey => match byte {
                b if is_ws(b) => {}
                b'"' => {
                    self.text.clear();
                    self.state = State::Str { key: true };
                }
                _ => return Err(self.unexpected(byte)),
            },
            State::Colon => match byte {
                b if is_ws(b) => {}
                b':' => self.state = State::Value,
                _ => return Err(self.unexpected(byte)),
            },
            State::AfterMember => match byte {
                b if is_ws(b) => {}
                b',' => self.state = State::ObjectKey,
                b'}' => self.close_container(),
                _ => return Err(self.unexpected(byte)),
            },
            State::AfterElement => match byte {
                b if is_ws(b) => {}
                b',' => self.state = State::Value,
                b']' => self.close_container(),
                _ => return Err(self.unexpected(byte)),
            },
            State::Str { key } => {
                if self.high_surrogate.is_some() && byte != b'\\' {
                    return Err(WeftError::Protocol("unpaired surrogate in JSON string".into()));
                }
                match byte {
                    b'"' => self.string_done(key)?,
                    b'\\' => self.state = State::StrEscape { key },
                    b if b < 0x20 => return Err(self.unexpected(byte)),
                    b => self.text.push(b),
                }
            }
            State::StrEscape { key } => {
                if self.high_surrogate.is_some() && byte != b'u' {
                    return Err(WeftError::Protocol("unpaired surrogate in JSON string".into()));
                }
                let c = match byte {
                    b'"' => b'"',
                    b'\\' => b'\\',
                    b'/' => b'/',
                    b'b' => 0x08,
                    b'f' => 0x0c,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    b'u' => {
                        self.state = State::StrUnicode {
                            key,
                            digits: 0,
                            code: 0,
                        };
                        return Ok(false);
                    }
                    _ => return Err(self.unexpected(byte)),
                };
                self.text.push(c);
                self.state = State::Str { key };
            }
            State::StrUnicode { key, digits, code } => {
                let digit = char::from(byte)
                    .to_digit(16)
                    .ok_or_else(|| self.unexpected(byte))?;
                let code = (code << 4) | digit;
                if digits == 3 {
                    self.unicode_escape(code)?;
                    self.state = State::Str { key };
                } else {
                    self.state = State::StrUnicode {
                        key,
                        digits: digits + 1,
                        code,
                    };
                }
            }
            State::Literal { word, pos } => {
                if byte != word[pos] {
                    return Err(self.unexpected(byte));
                }
                if pos + 1 == word.len() {
                    let node = match word {
                        b"true" => Node::from_value(true),
                        b"false" => Node::from_value(false),
                        _ => Node::new(),
                    };
                    self.value_done(node);
                } else {
                    self.state = State::Literal { word, pos: pos + 1 };
                }
            }
            State::Number => {
                if matches!(byte, b'0'..=b'9' | b'+' | b'-' | b'.' | b'e' | b'E') {
                    self.text.push(byte);
                } else {
                    self.number_done()?;
                    if self.state == State::Done {
                        if !is_ws(byte) {
                            return Err(self.unexpected(byte));
                        }
                    } else {
                        self.offset -= 1;
                        return self.advance(byte);
                    }
                }
            }
        }
        Ok(self.state == State::Done)
    }

    fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    fn take(&mut self) -> Option<Node> {
        if self.state != State::Done {
            return None;
        }
        let node = self.result.take();
        self.reset();
        node
    }

    fn reset(&mut self) {
        *self = JsonParser::new();
    }

    fn finish(&mut self) -> Result<()> {
        if self.state == State::Number && self.stack.is_empty() {
            self.number_done()?;
        }
        if self.state == State::Done {
            Ok(())
        } else {
            Err(WeftError::Protocol("unexpected end of JSON input".into()))
        }
    }
}
