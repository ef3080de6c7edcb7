//! Argument codec: host text <-> [`Value`].
//!
//! The host passes each positional argument as a string. [`parse_item`] turns
//! one such string into a [`Value`] using a fixed precedence, first match wins:
//!
//! 1. array literal (`[1,"a",[true]]`), elements parsed recursively
//! 2. boolean literal (`true` / `false`, any case)
//! 3. numeric literal (`10`, `-2.5`, `1e3`), finite only
//! 4. double-quoted text (`"abc"`), doubled `""` collapses to `"`
//! 5. null sentinel (`null`, `nil`, `any`, `nan`, `objNull`, any case)
//! 6. anything else: the raw text itself
//!
//! The order is part of the wire contract: an unquoted `true` is a boolean, a
//! quoted `"true"` is text. Parsing never fails; malformed input degrades to
//! raw text.
//!
//! [`serialize`] is the syntactic inverse. `parse(serialize([v])) == [v]`
//! holds for every value `parse` can produce.

use crate::value::Value;

/// Case-insensitive words that decode to [`Value::Null`].
pub const NULL_SENTINELS: [&str; 5] = ["null", "nil", "any", "nan", "objnull"];

/// Deepest array nesting accepted. Deeper literals are kept as raw text.
pub const MAX_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parses every positional argument.
///
/// # Examples
///
/// ```
/// use extcall_core::{codec, Value};
///
/// let args = codec::parse(&["10", "\"true\"", "[1,nil]"]);
/// assert_eq!(args[0], Value::Number(10.0));
/// assert_eq!(args[1], Value::Text("true".into()));
/// assert_eq!(args[2], Value::Sequence(vec![Value::Number(1.0), Value::Null]));
/// ```
#[must_use]
pub fn parse<S: AsRef<str>>(raw: &[S]) -> Vec<Value> {
    raw.iter().map(|item| parse_item(item.as_ref())).collect()
}

/// Parses a single positional argument.
#[must_use]
pub fn parse_item(item: &str) -> Value {
    let trimmed = item.trim();
    if trimmed.starts_with('[') {
        if let Some(sequence) = ArrayParser::parse(trimmed) {
            return sequence;
        }
        tracing::trace!(item, "malformed array literal, keeping raw text");
    }
    parse_scalar(item)
}

/// Applies precedence steps 2-6 to a non-array element.
fn parse_scalar(item: &str) -> Value {
    let trimmed = item.trim();

    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Boolean(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Boolean(false);
    }
    if let Some(n) = parse_number(trimmed) {
        return Value::Number(n);
    }
    if let Some(text) = unquote(trimmed) {
        return Value::Text(text);
    }
    if NULL_SENTINELS
        .iter()
        .any(|sentinel| trimmed.eq_ignore_ascii_case(sentinel))
    {
        return Value::Null;
    }
    Value::Text(item.to_string())
}

/// Accepts `[+-]digits[.digits][(e|E)[+-]digits]` with at least one mantissa
/// digit. Words like `inf` or `nan` are rejected so they can reach the null
/// sentinel check.
fn parse_number(s: &str) -> Option<f64> {
    let bytes = s.as_bytes();
    let mut i = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        i += 1;
    }

    let mut mantissa_digits = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
        mantissa_digits += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
            mantissa_digits += 1;
        }
    }
    if mantissa_digits == 0 {
        return None;
    }

    if i < bytes.len() && matches!(bytes[i], b'e' | b'E') {
        i += 1;
        if matches!(bytes.get(i), Some(b'+' | b'-')) {
            i += 1;
        }
        let exp_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return None;
        }
    }
    if i != bytes.len() {
        return None;
    }

    s.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Strips a matching pair of double quotes and collapses `""` escapes.
fn unquote(s: &str) -> Option<String> {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        Some(s[1..s.len() - 1].replace("\"\"", "\""))
    } else {
        None
    }
}

/// Recursive-descent parser for host array literals.
///
/// All delimiters are ASCII, so byte offsets always fall on char boundaries.
struct ArrayParser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> ArrayParser<'a> {
    /// Returns `None` unless the whole input is exactly one array literal.
    fn parse(src: &'a str) -> Option<Value> {
        let mut parser = Self {
            src,
            pos: 0,
            depth: 0,
        };
        let value = parser.sequence()?;
        parser.skip_ws();
        (parser.pos == src.len()).then_some(value)
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn sequence(&mut self) -> Option<Value> {
        if self.depth >= MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let value = self.sequence_body();
        self.depth -= 1;
        value
    }

    fn sequence_body(&mut self) -> Option<Value> {
        if self.bump()? != b'[' {
            return None;
        }
        let mut items = Vec::new();

        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Some(Value::Sequence(items));
        }

        loop {
            self.skip_ws();
            items.push(self.element()?);
            self.skip_ws();
            match self.bump()? {
                b',' => {}
                b']' => return Some(Value::Sequence(items)),
                _ => return None,
            }
        }
    }

    fn element(&mut self) -> Option<Value> {
        match self.peek()? {
            b'[' => self.sequence(),
            b'"' => self.quoted(),
            _ => self.bare(),
        }
    }

    fn quoted(&mut self) -> Option<Value> {
        self.pos += 1;
        let mut text = String::new();
        loop {
            let close = self.src[self.pos..].find('"')? + self.pos;
            text.push_str(&self.src[self.pos..close]);
            self.pos = close + 1;
            if self.peek() == Some(b'"') {
                text.push('"');
                self.pos += 1;
            } else {
                return Some(Value::Text(text));
            }
        }
    }

    fn bare(&mut self) -> Option<Value> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| !matches!(b, b',' | b']' | b'[' | b'"'))
        {
            self.pos += 1;
        }
        let token = self.src[start..self.pos].trim();
        if token.is_empty() {
            return None;
        }
        Some(parse_scalar(token))
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serializes values as a bracketed, comma-joined host array literal.
///
/// # Examples
///
/// ```
/// use extcall_core::{codec, Value};
///
/// let text = codec::serialize(&[Value::Number(20.0), Value::Text("a".into()), Value::Null]);
/// assert_eq!(text, r#"[20,"a",null]"#);
/// ```
#[must_use]
pub fn serialize(values: &[Value]) -> String {
    let mut out = String::new();
    write_sequence(&mut out, values);
    out
}

/// Serializes a single value in its wire form.
#[must_use]
pub fn serialize_value(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_sequence(out: &mut String, values: &[Value]) {
    out.push('[');
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_value(out, value);
    }
    out.push(']');
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Text(s) => {
            out.push('"');
            out.push_str(&s.replace('"', "\"\""));
            out.push('"');
        }
        Value::Null => out.push_str("null"),
        Value::Sequence(items) => write_sequence(out, items),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
