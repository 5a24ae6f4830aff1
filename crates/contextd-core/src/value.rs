//! Typed property values and their wire rendering.
//!
//! Every context property carries one of four concrete types (`bool`, `int`,
//! `double`, `QString`) or the explicit *undefined* state. Undefined is
//! rendered on the wire as the bare marker [`UNKNOWN_MARKER`], distinct from
//! every concrete value.

use std::fmt;

/// Wire marker for a property that currently has no value.
pub const UNKNOWN_MARKER: &str = "Unknown";

/// Declared type of a context property, locked at first definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextType {
    Bool,
    Int,
    Double,
    String,
}

impl ContextType {
    /// Wire name of the type tag. Strings render as `QString`.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Double => "double",
            Self::String => "QString",
        }
    }

    /// Parses a type word as accepted by the provider `add` command.
    ///
    /// Both `string` and `QString` name the string type.
    #[must_use]
    pub fn parse_wire_name(word: &str) -> Option<Self> {
        match word {
            "bool" => Some(Self::Bool),
            "int" => Some(Self::Int),
            "double" => Some(Self::Double),
            "string" | "QString" => Some(Self::String),
            _ => None,
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A concrete property value.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

impl ContextValue {
    /// The declared type this value satisfies.
    #[must_use]
    pub const fn context_type(&self) -> ContextType {
        match self {
            Self::Bool(_) => ContextType::Bool,
            Self::Int(_) => ContextType::Int,
            Self::Double(_) => ContextType::Double,
            Self::Str(_) => ContextType::String,
        }
    }

    /// Parses a provider-supplied literal as a value of type `ty`.
    ///
    /// Booleans are strict `true`/`false`; string literals are taken
    /// verbatim, including leading/trailing whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ValueParseError`] when the literal does not parse as `ty`.
    pub fn parse_typed(ty: ContextType, raw: &str) -> Result<Self, ValueParseError> {
        let invalid = || ValueParseError {
            expected: ty.wire_name(),
            raw: raw.to_string(),
        };
        match ty {
            ContextType::Bool => match raw {
                "true" => Ok(Self::Bool(true)),
                "false" => Ok(Self::Bool(false)),
                _ => Err(invalid()),
            },
            ContextType::Int => raw.parse().map(Self::Int).map_err(|_| invalid()),
            ContextType::Double => raw.parse().map(Self::Double).map_err(|_| invalid()),
            ContextType::String => Ok(Self::Str(raw.to_string())),
        }
    }

    /// Renders the value with its wire type tag, e.g. `QString:"normal"`.
    ///
    /// Strings are double-quoted with `\\` and `\"` escapes; the other types
    /// render their literal unquoted.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Bool(b) => format!("bool:{b}"),
            Self::Int(n) => format!("int:{n}"),
            Self::Double(d) => format!("double:{d}"),
            Self::Str(s) => format!("QString:\"{}\"", escape(s)),
        }
    }
}

/// Renders an optional value for the wire; `None` is the `Unknown` marker.
#[must_use]
pub fn render_opt(value: Option<&ContextValue>) -> String {
    value.map_or_else(|| UNKNOWN_MARKER.to_string(), ContextValue::to_wire)
}

/// Whether `key` is a well-formed property name: non-empty dot-separated
/// segments of ASCII alphanumerics, `_`, or `-`.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(ch),
        }
    }
    out
}

/// A provider-supplied literal that does not parse as the declared type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {expected} literal {raw:?}")]
pub struct ValueParseError {
    /// Wire name of the declared type.
    pub expected: &'static str,
    /// The offending literal.
    pub raw: String,
}
