use std::fmt;

use crate::protocol::error::{Result, WeftError};

/// Scalar payload of a value node.
///
/// Exactly one kind is stored. `Extended` carries an extended-precision float
/// as `f64`; it is kept as its own kind so the binary codec can round-trip it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Scalar {
    #[default]
    None,
    /// 8-bit string
    Bytes(Vec<u8>),
    /// Unicode string
    Text(String),
    Char(char),
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Extended(f64),
}

impl Scalar {
    /// Short name of the stored kind, used in conversion errors and dumps.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Scalar::None => "none",
            Scalar::Bytes(_) => "bytes",
            Scalar::Text(_) => "string",
            Scalar::Char(_) => "char",
            Scalar::Bool(_) => "bool",
            Scalar::Int(_) => "int",
            Scalar::UInt(_) => "uint",
            Scalar::Float(_) => "float",
            Scalar::Double(_) => "double",
            Scalar::Extended(_) => "extended",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Scalar::None)
    }

    fn conversion_error(&self, target: &'static str) -> WeftError {
        WeftError::Conversion {
            target,
            from_kind: self.kind_name(),
            value: self.to_string(),
        }
    }

    /// Widens the payload to a number for the integer and float extractors.
    fn to_number(&self, target: &'static str) -> Result<Number> {
        match self {
            Scalar::None => Ok(Number::Int(0)),
            Scalar::Bool(b) => Ok(Number::Int(i128::from(*b))),
            Scalar::Char(c) => c
                .to_digit(10)
                .map(|d| Number::Int(i128::from(d)))
                .ok_or_else(|| self.conversion_error(target)),
            Scalar::Int(v) => Ok(Number::Int(i128::from(*v))),
            Scalar::UInt(v) => Ok(Number::Int(i128::from(*v))),
            Scalar::Float(v) => Ok(Number::Float(f64::from(*v))),
            Scalar::Double(v) | Scalar::Extended(v) => Ok(Number::Float(*v)),
            Scalar::Bytes(b) => {
                let s = std::str::from_utf8(b).map_err(|_| self.conversion_error(target))?;
                parse_number(s).ok_or_else(|| self.conversion_error(target))
            }
            Scalar::Text(s) => parse_number(s).ok_or_else(|| self.conversion_error(target)),
        }
    }

    /// Interprets the payload as a boolean.
    ///
    /// Text and chars are false when empty or starting with one of
    /// `0 f F n N` or NUL; numbers are false when zero.
    pub fn to_bool(&self) -> bool {
        match self {
            Scalar::None => false,
            Scalar::Bool(b) => *b,
            Scalar::Char(c) => !is_false_char(*c),
            Scalar::Int(v) => *v != 0,
            Scalar::UInt(v) => *v != 0,
            Scalar::Float(v) => *v != 0.0,
            Scalar::Double(v) | Scalar::Extended(v) => *v != 0.0,
            Scalar::Bytes(b) => b.first().map_or(false, |c| !is_false_char(char::from(*c))),
            Scalar::Text(s) => s.chars().next().map_or(false, |c| !is_false_char(c)),
        }
    }

    /// Renders the payload as text. `None` renders as the empty string.
    pub fn to_text(&self) -> String {
        match self {
            Scalar::None => String::new(),
            Scalar::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Scalar::Text(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

fn is_false_char(c: char) -> bool {
    matches!(c, '0' | 'f' | 'F' | 'n' | 'N' | '\0')
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i128),
    Float(f64),
}

fn parse_number(s: &str) -> Option<Number> {
    let s = s.trim();
    if let Ok(v) = s.parse::<i128>() {
        return Some(Number::Int(v));
    }
    s.parse::<f64>().ok().map(Number::Float)
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::None => f.write_str("null"),
            Scalar::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Scalar::Text(s) => f.write_str(s),
            Scalar::Char(c) => write!(f, "{}", c),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::UInt(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Double(v) | Scalar::Extended(v) => write!(f, "{}", v),
        }
    }
}

/// Extraction of a typed value from a [`Scalar`].
pub trait FromScalar: Sized {
    fn from_scalar(scalar: &Scalar) -> Result<Self>;
}

macro_rules! int_from_scalar {
    ($($t:ty),*) => {
        $(
            impl FromScalar for $t {
                fn from_scalar(scalar: &Scalar) -> Result<Self> {
                    let target = stringify!($t);
                    match scalar.to_number(target)? {
                        Number::Int(v) => <$t>::try_from(v).map_err(|_| {
                            WeftError::Range(format!("value {} out of range for {}", v, target))
                        }),
                        Number::Float(v) => {
                            let t = v.trunc();
                            // MAX as f64 may round up to the next power of two.
                            if !v.is_finite() || t < <$t>::MIN as f64 || t >= <$t>::MAX as f64 + 1.0 {
                                return Err(WeftError::Range(format!(
                                    "value {} out of range for {}",
                                    v, target
                                )));
                            }
                            Ok(t as $t)
                        }
                    }
                }
            }
        )*
    };
}

int_from_scalar!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl FromScalar for f64 {
    fn from_scalar(scalar: &Scalar) -> Result<Self> {
        match scalar.to_number("f64")? {
            Number::Int(v) => Ok(v as f64),
            Number::Float(v) => Ok(v),
        }
    }
}

impl FromScalar for f32 {
    fn from_scalar(scalar: &Scalar) -> Result<Self> {
        match scalar.to_number("f32")? {
            Number::Int(v) => Ok(v as f32),
            Number::Float(v) => {
                if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                    return Err(WeftError::Range(format!("value {} out of range for f32", v)));
                }
                Ok(v as f32)
            }
        }
    }
}

impl FromScalar for bool {
    fn from_scalar(scalar: &Scalar) -> Result<Self> {
        Ok(scalar.to_bool())
    }
}

impl FromScalar for char {
    fn from_scalar(scalar: &Scalar) -> Result<Self> {
        match scalar {
            Scalar::None => Ok('\0'),
            Scalar::Char(c) => Ok(*c),
            Scalar::Bool(b) => Ok(if *b { '1' } else { '0' }),
            Scalar::Text(s) => Ok(s.chars().next().unwrap_or('\0')),
            Scalar::Bytes(b) => Ok(b.first().map_or('\0', |c| char::from(*c))),
            Scalar::Int(v) => u32::try_from(*v)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| WeftError::Range(format!("{} is not a valid char", v))),
            Scalar::UInt(v) => u32::try_from(*v)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| WeftError::Range(format!("{} is not a valid char", v))),
            Scalar::Float(_) | Scalar::Double(_) | Scalar::Extended(_) => {
                Err(scalar.conversion_error("char"))
            }
        }
    }
}

impl FromScalar for String {
    fn from_scalar(scalar: &Scalar) -> Result<Self> {
        Ok(scalar.to_text())
    }
}

impl FromScalar for Vec<u8> {
    fn from_scalar(scalar: &Scalar) -> Result<Self> {
        match scalar {
            Scalar::Bytes(b) => Ok(b.clone()),
            other => Ok(other.to_text().into_bytes()),
        }
    }
}

impl FromScalar for Scalar {
    fn from_scalar(scalar: &Scalar) -> Result<Self> {
        Ok(scalar.clone())
    }
}

macro_rules! scalar_from {
    ($variant:ident, $conv:ty => $($t:ty),*) => {
        $(
            impl From<$t> for Scalar {
                fn from(v: $t) -> Self {
                    Scalar::$variant(v as $conv)
                }
            }
        )*
    };
}

scalar_from!(Int, i64 => i8, i16, i32, i64, isize);
scalar_from!(UInt, u64 => u8, u16, u32, u64, usize);

impl From<f32> for Scalar {
    fn from(v: f32) -> Self {
        Scalar::Float(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Double(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<char> for Scalar {
    fn from(v: char) -> Self {
        Scalar::Char(v)
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Scalar {
    fn from(v: Vec<u8>) -> Self {
        Scalar::Bytes(v)
    }
}

impl From<&[u8]> for Scalar {
    fn from(v: &[u8]) -> Self {
        Scalar::Bytes(v.to_vec())
    }
}
