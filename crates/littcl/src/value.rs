//! The dual-representation value system.
//!
//! Every piece of data the engine touches is a [`Value`]: a reference-counted
//! cell holding an optional cached string representation and a typed internal
//! representation. Either side may be absent; asking for the missing side
//! materializes it from the other. Re-reading a value under a different type
//! ("shimmering") replaces the internal representation by parsing the string
//! side; it is a legal side effect of read operations and may happen on shared
//! values. Semantic mutation (list append, string append, dict store) is only
//! legal on unshared values — callers duplicate first.
//!
//! The `Rc` strong count *is* the reference count: cloning a `Value` handle
//! retains the cell, dropping releases it, and `is_shared` asks whether more
//! than one handle exists. The interpreter keeps a weak registry of every
//! cell it created so the reference collector can scan live string reps.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::expr::ExprProgram;
use crate::interp::Command;
use crate::script::ScriptProgram;
use crate::strings::{format_double_g, ScanProgram};

/// Completion code carried by `return -code` and reported by `catch`.
///
/// The numbering is part of the surface language (`info returncodes`);
/// codes outside the named range are allowed and flow through `catch`
/// untranslated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnCode(pub i32);

impl ReturnCode {
    pub const OK: ReturnCode = ReturnCode(0);
    pub const ERROR: ReturnCode = ReturnCode(1);
    pub const RETURN: ReturnCode = ReturnCode(2);
    pub const BREAK: ReturnCode = ReturnCode(3);
    pub const CONTINUE: ReturnCode = ReturnCode(4);
    pub const SIGNAL: ReturnCode = ReturnCode(5);
    pub const EXIT: ReturnCode = ReturnCode(6);

    pub fn name(self) -> Option<&'static str> {
        match self.0 {
            0 => Some("ok"),
            1 => Some("error"),
            2 => Some("return"),
            3 => Some("break"),
            4 => Some("continue"),
            5 => Some("signal"),
            6 => Some("exit"),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<ReturnCode> {
        match name {
            "ok" => Some(ReturnCode::OK),
            "error" => Some(ReturnCode::ERROR),
            "return" => Some(ReturnCode::RETURN),
            "break" => Some(ReturnCode::BREAK),
            "continue" => Some(ReturnCode::CONTINUE),
            "signal" => Some(ReturnCode::SIGNAL),
            "exit" => Some(ReturnCode::EXIT),
            _ => None,
        }
    }
}

/// An index into a sequence, with `end`-relative forms.
///
/// `End(0)` is the last element, `End(-2)` the third from last. `End(n)` with
/// positive `n` saturates past the end when resolved; absolute negatives
/// saturate before the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqIndex {
    Abs(i64),
    End(i64),
}

impl SeqIndex {
    /// Resolve against a sequence of `len` elements. The result may be out of
    /// range; callers clamp according to their own conventions.
    pub fn resolve(self, len: usize) -> i64 {
        match self {
            SeqIndex::Abs(i) => i,
            SeqIndex::End(off) => len as i64 - 1 + off,
        }
    }
}

/// The typed internal representation of a value.
///
/// `None` means "string only". Every other variant caches the result of
/// parsing (or the origin of) the string side. A variant that holds `Value`
/// handles (lists, dicts, dict-sugar pairs) contributes those handles'
/// reference counts.
pub(crate) enum Repr {
    None,
    Int(i64),
    Double(f64),
    /// An integer that was read as a double: the exact integer is kept so
    /// that loops alternating int and double reads of the same value do not
    /// lose integer exactness.
    CoercedDouble(i64),
    Index(SeqIndex),
    ReturnCode(ReturnCode),
    List(Vec<Value>),
    /// Insertion-ordered key/value pairs; keys are compared by string rep.
    Dict(Vec<(Value, Value)>),
    Script(Rc<ScriptProgram>),
    Expr(Rc<ExprProgram>),
    /// Provenance decoration on an otherwise plain string value.
    Source { file: Rc<str>, line: u32 },
    Reference { id: u64, tag: [u8; 7] },
    /// Cached command resolution, valid while `epoch` matches the
    /// interpreter's procedure epoch. Weak: the command table owns the
    /// strong reference, so stale caches never keep a deleted command (or
    /// a cycle through a procedure body) alive.
    Command { epoch: u64, cmd: Weak<Command> },
    /// Cached variable resolution, valid while `table_id` matches the current
    /// frame's variable-table generation.
    VarRef { table_id: u64, slot: usize },
    /// Pre-split `$name(key)` sugar: the variable name and the raw key text.
    DictSugar { var: Value, key: Value },
    Regexp { nocase: bool, re: Rc<regex::Regex> },
    ScanFormat(Rc<ScanProgram>),
}

pub(crate) struct ValueCell {
    pub(crate) string: RefCell<Option<Rc<str>>>,
    pub(crate) repr: RefCell<Repr>,
}

/// A handle to a reference-counted, dual-representation value.
pub struct Value {
    pub(crate) cell: Rc<ValueCell>,
}

impl Clone for Value {
    fn clone(&self) -> Self {
        Value {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl Value {
    pub(crate) fn alloc(string: Option<Rc<str>>, repr: Repr) -> Value {
        Value {
            cell: Rc::new(ValueCell {
                string: RefCell::new(string),
                repr: RefCell::new(repr),
            }),
        }
    }

    /// Number of live handles to this cell.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.cell)
    }

    /// A value is shared when more than one handle exists. Shared values must
    /// not be semantically mutated; duplicate first.
    pub fn is_shared(&self) -> bool {
        Rc::strong_count(&self.cell) > 1
    }

    pub(crate) fn same_cell(&self, other: &Value) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    /// The cached string representation, if already materialized.
    pub(crate) fn peek_string(&self) -> Option<Rc<str>> {
        self.cell.string.borrow().clone()
    }

    /// The string representation, materializing it from the internal
    /// representation if necessary.
    pub fn as_string(&self) -> Rc<str> {
        if let Some(s) = self.cell.string.borrow().as_ref() {
            return Rc::clone(s);
        }
        let s: Rc<str> = Rc::from(self.make_string().as_str());
        *self.cell.string.borrow_mut() = Some(Rc::clone(&s));
        s
    }

    /// Byte length of the string representation.
    pub fn len(&self) -> usize {
        self.as_string().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_string().is_empty()
    }

    fn make_string(&self) -> String {
        match &*self.cell.repr.borrow() {
            Repr::None => String::new(),
            Repr::Int(i) | Repr::CoercedDouble(i) => i.to_string(),
            Repr::Double(d) => format_double(*d),
            Repr::Index(idx) => match idx {
                SeqIndex::Abs(i) => i.to_string(),
                SeqIndex::End(0) => "end".to_string(),
                SeqIndex::End(off) if *off < 0 => format!("end{}", off),
                SeqIndex::End(off) => format!("end+{}", off),
            },
            Repr::ReturnCode(code) => match code.name() {
                Some(name) => name.to_string(),
                None => code.0.to_string(),
            },
            Repr::List(items) => format_list(items),
            Repr::Dict(pairs) => {
                let mut flat = Vec::with_capacity(pairs.len() * 2);
                for (k, v) in pairs {
                    flat.push(k.clone());
                    flat.push(v.clone());
                }
                format_list(&flat)
            }
            Repr::Reference { id, tag } => format_reference(*id, tag),
            Repr::DictSugar { var, key } => {
                format!("{}({})", var.as_string(), key.as_string())
            }
            // These representations are only ever installed over an existing
            // string rep, so regenerating one means the cell was corrupted.
            Repr::Script(_)
            | Repr::Expr(_)
            | Repr::Source { .. }
            | Repr::Command { .. }
            | Repr::VarRef { .. }
            | Repr::Regexp { .. }
            | Repr::ScanFormat(_) => String::new(),
        }
    }

    /// Replace the internal representation, keeping the string side.
    ///
    /// This is the shimmering primitive: legal on shared values because it
    /// only swaps one cache for another.
    pub(crate) fn set_repr(&self, repr: Repr) {
        *self.cell.repr.borrow_mut() = repr;
    }

    /// Drop the string representation after a semantic mutation of the
    /// internal one. The two sides would no longer agree.
    pub(crate) fn invalidate_string(&self) {
        debug_assert!(
            !matches!(&*self.cell.repr.borrow(), Repr::None),
            "invalidating the string rep of a string-only value"
        );
        *self.cell.string.borrow_mut() = None;
    }

    pub(crate) fn int_repr(&self) -> Option<i64> {
        match &*self.cell.repr.borrow() {
            Repr::Int(i) | Repr::CoercedDouble(i) => Some(*i),
            _ => None,
        }
    }

    pub(crate) fn double_repr(&self) -> Option<f64> {
        match &*self.cell.repr.borrow() {
            Repr::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub(crate) fn is_list_repr(&self) -> bool {
        matches!(&*self.cell.repr.borrow(), Repr::List(_))
    }

    pub(crate) fn reference_repr(&self) -> Option<u64> {
        match &*self.cell.repr.borrow() {
            Repr::Reference { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Byte equality of the string representations, with a cheap identity
    /// short-circuit.
    pub fn string_eq(&self, other: &Value) -> bool {
        if self.same_cell(other) {
            return true;
        }
        self.as_string() == other.as_string()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.string_eq(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:?})", self.as_string())
    }
}

// ---------------------------------------------------------------------------
// Numeric parsing
// ---------------------------------------------------------------------------

/// Parse an integer literal: optional sign, `0x`/`0b`/`0o` prefixes, a bare
/// leading zero for octal, decimal otherwise. Surrounding ASCII whitespace is
/// ignored; anything else unconsumed makes the parse fail.
pub(crate) fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() {
        return None;
    }
    let (neg, digits) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if digits.is_empty() {
        return None;
    }
    let (radix, digits) = if let Some(rest) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, rest)
    } else if let Some(rest) = digits
        .strip_prefix("0b")
        .or_else(|| digits.strip_prefix("0B"))
    {
        (2, rest)
    } else if let Some(rest) = digits
        .strip_prefix("0o")
        .or_else(|| digits.strip_prefix("0O"))
    {
        (8, rest)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    if digits.is_empty() {
        return None;
    }
    // Route through i128 so that i64::MIN written as "-9223372036854775808"
    // (magnitude first, sign applied after) parses.
    let magnitude = i128::from_str_radix(digits, radix).ok()?;
    let value = if neg { -magnitude } else { magnitude };
    i64::try_from(value).ok()
}

/// Parse a floating point literal. Accepts everything Rust's `f64` parser
/// does, which covers the `strtod` envelope including `inf` and `nan`
/// spellings in any case.
pub(crate) fn parse_double(s: &str) -> Option<f64> {
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok()
}

/// Recognize the boolean spellings accepted wherever an expression needs a
/// truth value.
pub(crate) fn parse_boolean(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Render a double the way the engine prints them: `%.12g` with a `.0`
/// appended when nothing marks the result as non-integral.
pub(crate) fn format_double(d: f64) -> String {
    if d.is_nan() {
        return "NaN".to_string();
    }
    if d.is_infinite() {
        return if d < 0.0 { "-Inf" } else { "Inf" }.to_string();
    }
    let mut s = format_double_g(d, 12, false, false);
    if !s.contains(['.', 'e', 'E']) {
        s.push_str(".0");
    }
    s
}

// ---------------------------------------------------------------------------
// List serialization
// ---------------------------------------------------------------------------

/// How a string must be quoted to survive as a single list element.
enum QuoteMode {
    Plain,
    Brace,
    Backslash,
}

fn element_quote_mode(s: &str) -> QuoteMode {
    if s.is_empty() {
        return QuoteMode::Brace;
    }
    let bytes = s.as_bytes();
    let mut needs_quote = bytes[0] == b'#' || bytes[0] == b'"';
    let mut level = 0i32;
    let mut unbalanced = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => level += 1,
            b'}' => {
                level -= 1;
                if level < 0 {
                    unbalanced = true;
                }
            }
            b' ' | b'\t' | b'\n' | b'\r' | b';' | b'$' | b'[' | b']' | b'"' => {
                needs_quote = true;
            }
            b'\\' => {
                needs_quote = true;
                if i + 1 == bytes.len() {
                    // A trailing backslash cannot be brace quoted.
                    return QuoteMode::Backslash;
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    if level != 0 || unbalanced {
        return QuoteMode::Backslash;
    }
    if needs_quote || bytes[0] == b'{' {
        QuoteMode::Brace
    } else {
        QuoteMode::Plain
    }
}

fn backslash_quote(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            ' ' | '\t' | ';' | '$' | '[' | ']' | '{' | '}' | '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}

/// Append one element to a growing list string, quoting as needed.
pub(crate) fn append_list_element(out: &mut String, element: &str) {
    if !out.is_empty() {
        out.push(' ');
    }
    match element_quote_mode(element) {
        QuoteMode::Plain => out.push_str(element),
        QuoteMode::Brace => {
            out.push('{');
            out.push_str(element);
            out.push('}');
        }
        QuoteMode::Backslash => backslash_quote(element, out),
    }
}

/// Serialize a sequence of values as a canonical list string.
pub(crate) fn format_list(items: &[Value]) -> String {
    let mut out = String::new();
    for item in items {
        append_list_element(&mut out, &item.as_string());
    }
    out
}

// ---------------------------------------------------------------------------
// Reference serialization
// ---------------------------------------------------------------------------

/// Exact size of a serialized reference token.
pub const REFERENCE_SPACE: usize = 42;

/// Serialize a reference as its rigid 42-byte token:
/// `<reference.<TAG>.DDDDDDDDDDDDDDDDDDDD>`.
pub(crate) fn format_reference(id: u64, tag: &[u8; 7]) -> String {
    let tag = std::str::from_utf8(tag).unwrap_or("_______");
    let s = format!("<reference.<{}>.{:020}>", tag, id);
    debug_assert_eq!(s.len(), REFERENCE_SPACE);
    s
}

/// Normalize a user-supplied tag to exactly seven bytes of
/// `[A-Za-z0-9_]`, replacing other bytes with `_` and padding with `_`.
pub(crate) fn normalize_tag(tag: &str) -> [u8; 7] {
    let mut out = [b'_'; 7];
    for (i, b) in tag.bytes().take(7).enumerate() {
        out[i] = if b.is_ascii_alphanumeric() || b == b'_' {
            b
        } else {
            b'_'
        };
    }
    out
}

/// Validate the shape of a reference token and extract its id.
pub(crate) fn parse_reference(s: &str) -> Option<(u64, [u8; 7])> {
    let bytes = s.as_bytes();
    if bytes.len() != REFERENCE_SPACE
        || !s.starts_with("<reference.<")
        || bytes[19] != b'>'
        || bytes[20] != b'.'
        || bytes[41] != b'>'
    {
        return None;
    }
    let mut tag = [0u8; 7];
    for (i, &b) in bytes[12..19].iter().enumerate() {
        if !b.is_ascii_alphanumeric() && b != b'_' {
            return None;
        }
        tag[i] = b;
    }
    let id: u64 = s[21..41].parse().ok()?;
    Some((id, tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_int_bases() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int(" -7 "), Some(-7));
        assert_eq!(parse_int("0x1f"), Some(31));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("010"), Some(8));
        assert_eq!(parse_int("0"), Some(0));
        assert_eq!(parse_int("08"), None);
        assert_eq!(parse_int("9223372036854775807"), Some(i64::MAX));
        assert_eq!(parse_int("-9223372036854775808"), Some(i64::MIN));
        assert_eq!(parse_int("9223372036854775808"), None);
        assert_eq!(parse_int("1.5"), None);
        assert_eq!(parse_int(""), None);
        assert_eq!(parse_int("+"), None);
    }

    #[test]
    fn test_parse_double() {
        assert_eq!(parse_double("2.5"), Some(2.5));
        assert_eq!(parse_double("1e3"), Some(1000.0));
        assert_eq!(parse_double("5"), Some(5.0));
        assert_eq!(parse_double("Inf"), Some(f64::INFINITY));
        assert!(parse_double("NaN").unwrap().is_nan());
        assert_eq!(parse_double("abc"), None);
    }

    #[test]
    fn test_format_double() {
        assert_eq!(format_double(2.0), "2.0");
        assert_eq!(format_double(2.5), "2.5");
        assert_eq!(format_double(f64::INFINITY), "Inf");
        assert_eq!(format_double(f64::NEG_INFINITY), "-Inf");
        assert_eq!(format_double(f64::NAN), "NaN");
    }

    #[test]
    fn test_int_string_round_trip() {
        let v = Value::alloc(None, Repr::Int(-12));
        assert_eq!(&*v.as_string(), "-12");
    }

    #[test]
    fn test_shared_detection() {
        let v = Value::alloc(None, Repr::Int(1));
        assert!(!v.is_shared());
        let w = v.clone();
        assert!(v.is_shared());
        drop(w);
        assert!(!v.is_shared());
    }

    #[test]
    fn test_list_quoting() {
        let items = vec![
            Value::alloc(Some(Rc::from("a")), Repr::None),
            Value::alloc(Some(Rc::from("b c")), Repr::None),
            Value::alloc(Some(Rc::from("")), Repr::None),
            Value::alloc(Some(Rc::from("d$e")), Repr::None),
        ];
        assert_eq!(format_list(&items), "a {b c} {} {d$e}");
    }

    #[test]
    fn test_list_quoting_unbalanced_brace() {
        let items = vec![Value::alloc(Some(Rc::from("a}b")), Repr::None)];
        assert_eq!(format_list(&items), "a\\}b");
    }

    #[test]
    fn test_reference_round_trip() {
        let tag = normalize_tag("refs!");
        assert_eq!(&tag, b"refs___");
        let s = format_reference(7, &tag);
        assert_eq!(s.len(), REFERENCE_SPACE);
        let (id, tag2) = parse_reference(&s).unwrap();
        assert_eq!(id, 7);
        assert_eq!(tag, tag2);
        assert_eq!(parse_reference("<reference.<abc>.1>"), None);
    }

    #[test]
    fn test_seq_index_resolve() {
        assert_eq!(SeqIndex::Abs(2).resolve(5), 2);
        assert_eq!(SeqIndex::End(0).resolve(5), 4);
        assert_eq!(SeqIndex::End(-1).resolve(5), 3);
        assert_eq!(SeqIndex::End(3).resolve(5), 7);
    }
}
