//! A tagged-variant value type plus a canonical JSON codec, replacing the
//! reference implementation's habit of stringifying Python dicts at every
//! hop (see `SPEC_FULL.md` §9 "Dynamic typing and wire encoding").
//!
//! Every producer in this crate writes [`Value::to_canonical_json`]. The
//! permissive [`robust_dict_parse`] parser is kept only for the legacy
//! ingress boundary described in §6 -- text that may still arrive as a
//! Python `str(dict)` rather than JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;
use thiserror::Error;

/// A value flowing through task details, results, or errors.
///
/// Uses a `BTreeMap` for dict fields so iteration order -- and therefore
/// stringified output -- is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("could not parse {0:?} as a value: {1}")]
    Parse(String, String),
    #[error("expected a dict, got: {0:?}")]
    NotADict(Value),
    #[error("field {0:?} not present in dict")]
    MissingField(String),
}

impl Value {
    /// Build a dict [`Value`] from owned pairs.
    pub fn dict(pairs: impl IntoIterator<Item = (impl Into<String>, Value)>) -> Value {
        Value::Dict(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Whether this value is a bare scalar (not a list or dict).
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Dict(_))
    }

    /// Look up `field` in a dict value.
    pub fn get_field(&self, field: &str) -> Result<&Value, ValueError> {
        let dict = self.as_dict().ok_or_else(|| ValueError::NotADict(self.clone()))?;
        dict.get(field)
            .ok_or_else(|| ValueError::MissingField(field.to_string()))
    }

    /// Canonical JSON encoding of this value.
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(&self.to_json()).expect("Value -> JSON is infallible")
    }

    /// Encode as a wire-ready string: scalars pass through unchanged
    /// (numbers/bools rendered in decimal/`true`/`false` form), lists and
    /// dicts are JSON-encoded. Matches `SPEC_FULL.md` §4.5 `Dispatch`.
    pub fn to_wire_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => "null".to_string(),
            Value::List(_) | Value::Dict(_) => self.to_canonical_json(),
        }
    }

    fn to_json(&self) -> Json {
        match self {
            Value::String(s) => Json::String(s.clone()),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Bool(b) => Json::Bool(*b),
            Value::Null => Json::Null,
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Dict(map) => {
                Json::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }

    fn from_json(json: Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                Value::Dict(map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
        }
    }

    /// Strict JSON parse.
    pub fn parse_json(s: &str) -> Result<Value, ValueError> {
        serde_json::from_str::<Json>(s)
            .map(Value::from_json)
            .map_err(|e| ValueError::Parse(s.to_string(), e.to_string()))
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Json::deserialize(deserializer).map(Value::from_json)
    }
}

impl fmt::Display for Value {
    /// Renders in the legacy Python `repr(dict)` style -- single-quoted
    /// strings, `True`/`False`/`None` -- so code migrating off the
    /// reference implementation's `str(result)` output sees byte-identical
    /// results for the scenarios in `SPEC_FULL.md` §8 (e.g. S1's
    /// `"{'result': 'HI'}"`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Null => write!(f, "None"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Dict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "'{k}': {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Parse `s` as a dict, tolerating legacy Python `str(dict)` text.
///
/// Attempts, in order: (1) strict JSON, (2) a permissive literal parse
/// accepting single-quoted strings and `True`/`False`/`None`, (3) replacing
/// escaped single quotes and retrying (2). This is the only place in the
/// crate that should ever see non-JSON text; see `SPEC_FULL.md` §6/§9.
pub fn robust_dict_parse(s: &str) -> Result<Value, ValueError> {
    if let Ok(v) = Value::parse_json(s) {
        return Ok(v);
    }
    if let Ok(v) = python_literal_parse(s) {
        return Ok(v);
    }
    let unescaped = s.replace("\\'", "'");
    python_literal_parse(&unescaped)
}

/// A small recursive-descent parser for Python literal syntax: dicts,
/// lists, single/double-quoted strings, ints, floats, `True`/`False`/`None`.
pub fn python_literal_parse(s: &str) -> Result<Value, ValueError> {
    let mut parser = LiteralParser {
        chars: s.chars().collect(),
        pos: 0,
    };
    let value = parser.parse_value()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(ValueError::Parse(
            s.to_string(),
            "trailing characters after literal".to_string(),
        ));
    }
    Ok(value)
}

struct LiteralParser {
    chars: Vec<char>,
    pos: usize,
}

impl LiteralParser {
    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn err(&self, msg: &str) -> ValueError {
        let ctx: String = self.chars[self.pos..].iter().take(20).collect();
        ValueError::Parse(ctx, msg.to_string())
    }

    fn expect(&mut self, c: char) -> Result<(), ValueError> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(&format!("expected '{c}'")))
        }
    }

    fn parse_value(&mut self) -> Result<Value, ValueError> {
        self.skip_ws();
        match self.peek() {
            Some('{') => self.parse_dict(),
            Some('[') => self.parse_list(),
            Some('\'') | Some('"') => self.parse_string().map(Value::String),
            Some(c) if c.is_ascii_digit() || c == '-' => self.parse_number(),
            Some(_) => self.parse_keyword(),
            None => Err(self.err("unexpected end of input")),
        }
    }

    fn parse_dict(&mut self) -> Result<Value, ValueError> {
        self.expect('{')?;
        let mut map = BTreeMap::new();
        self.skip_ws();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Ok(Value::Dict(map));
        }
        loop {
            self.skip_ws();
            let key = match self.peek() {
                Some('\'') | Some('"') => self.parse_string()?,
                _ => return Err(self.err("expected string key")),
            };
            self.expect(':')?;
            let value = self.parse_value()?;
            map.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                Some('}') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.err("expected ',' or '}'")),
            }
        }
        Ok(Value::Dict(map))
    }

    fn parse_list(&mut self) -> Result<Value, ValueError> {
        self.expect('[')?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(']') {
            self.pos += 1;
            return Ok(Value::List(items));
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                Some(']') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.err("expected ',' or ']'")),
            }
        }
        Ok(Value::List(items))
    }

    fn parse_string(&mut self) -> Result<String, ValueError> {
        let quote = self.peek().unwrap();
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated string")),
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c) => {
                            out.push(c);
                            self.pos += 1;
                        }
                        None => return Err(self.err("unterminated escape")),
                    }
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(out)
    }

    fn parse_number(&mut self) -> Result<Value, ValueError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' || c == 'e' || c == 'E' {
                is_float = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if is_float {
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|e| self.err(&e.to_string()))
        } else {
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|e| self.err(&e.to_string()))
        }
    }

    fn parse_keyword(&mut self) -> Result<Value, ValueError> {
        for (kw, value) in [
            ("True", Value::Bool(true)),
            ("False", Value::Bool(false)),
            ("None", Value::Null),
        ] {
            if self.chars[self.pos..].starts_with(&kw.chars().collect::<Vec<_>>()[..]) {
                self.pos += kw.len();
                return Ok(value);
            }
        }
        Err(self.err("expected a value"))
    }
}
