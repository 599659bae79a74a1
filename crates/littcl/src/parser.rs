//! Character-level tokenizer for scripts, lists, and substitutions.
//!
//! The parser is a single-pass scanner: each call to [`Parser::next_token`]
//! advances a cursor and emits one raw token (a borrowed source slice, a
//! kind, and the line it started on). Script compilation, list conversion,
//! expression compilation, and `subst` all drive this same scanner in
//! slightly different modes; the expression lexer in `expr.rs` reuses the
//! variable/command/brace helpers directly.
//!
//! Nesting rules: braces, double quotes, and bracket substitutions nest
//! independently. Inside a bracketed command substitution the scanner tracks
//! brace depth separately, so a `]` inside braces does not close the
//! substitution. A `#` begins a comment only at command position.

/// Raw token kinds produced by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawKind {
    /// Literal text, no escapes present.
    Str,
    /// Literal text containing backslash escapes to decode.
    Esc,
    /// A variable reference (`$name` or `${name}`); text is the bare name.
    Var,
    /// A `$name(key)` reference; text spans `name(key)`.
    DictSugar,
    /// A bracketed command substitution; text is the script between brackets.
    Cmd,
    /// Word separator (spaces, tabs, escaped newlines).
    Sep,
    /// Command separator (newlines, semicolons).
    Eol,
    Eof,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RawToken<'a> {
    pub text: &'a str,
    pub kind: RawKind,
    pub line: u32,
    /// True when the token body came from a braced word. The script builder
    /// uses this to recognize `{*}`/`{expand}` markers.
    pub braced: bool,
}

/// Substitution classes that `subst` can suppress.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SubstFlags {
    pub no_variables: bool,
    pub no_commands: bool,
    pub no_backslashes: bool,
}

enum Mode {
    Script,
    Subst(SubstFlags),
}

pub(crate) struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pub pos: usize,
    pub line: u32,
    mode: Mode,
    in_quote: bool,
    comment_ok: bool,
    /// Set when an opener was never closed: the opener character and its line.
    pub missing: Option<(char, u32)>,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str, line: u32) -> Parser<'a> {
        Parser {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line,
            mode: Mode::Script,
            in_quote: false,
            comment_ok: true,
            missing: None,
        }
    }

    pub fn new_subst(src: &'a str, flags: SubstFlags) -> Parser<'a> {
        Parser {
            mode: Mode::Subst(flags),
            ..Parser::new(src, 1)
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn token(&self, start: usize, end: usize, kind: RawKind, line: u32) -> RawToken<'a> {
        RawToken {
            text: &self.src[start..end],
            kind,
            line,
            braced: false,
        }
    }

    pub fn next_token(&mut self) -> RawToken<'a> {
        match self.mode {
            Mode::Script => self.next_script_token(),
            Mode::Subst(flags) => self.next_subst_token(flags),
        }
    }

    fn next_script_token(&mut self) -> RawToken<'a> {
        loop {
            let Some(c) = self.peek() else {
                if self.in_quote {
                    self.missing.get_or_insert(('"', self.line));
                }
                return self.token(self.src.len(), self.src.len(), RawKind::Eof, self.line);
            };
            if self.in_quote {
                match c {
                    b'[' => return self.parse_cmd(),
                    b'$' => return self.parse_var(),
                    b'"' => {
                        self.pos += 1;
                        self.in_quote = false;
                        continue;
                    }
                    _ => return self.parse_str(),
                }
            }
            match c {
                b' ' | b'\t' | b'\r' => return self.parse_sep(),
                b'\\' if self.peek_at(1) == Some(b'\n') => return self.parse_sep(),
                b'\n' | b';' => {
                    self.comment_ok = true;
                    return self.parse_eol();
                }
                b'#' if self.comment_ok => {
                    self.skip_comment();
                    continue;
                }
                b'[' => return self.parse_cmd(),
                b'$' => return self.parse_var(),
                b'{' => return self.parse_brace(),
                b'"' => {
                    self.pos += 1;
                    self.in_quote = true;
                    self.start_content();
                    if self.peek() == Some(b'"') {
                        // Empty quoted word still contributes one empty token.
                        self.pos += 1;
                        self.in_quote = false;
                        return self.token(self.pos - 1, self.pos - 1, RawKind::Str, self.line);
                    }
                    continue;
                }
                _ => return self.parse_str(),
            }
        }
    }

    fn start_content(&mut self) {
        self.comment_ok = false;
    }

    fn parse_sep(&mut self) -> RawToken<'a> {
        let start = self.pos;
        let line = self.line;
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'\\' if self.peek_at(1) == Some(b'\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                _ => break,
            }
        }
        self.token(start, self.pos, RawKind::Sep, line)
    }

    fn parse_eol(&mut self) -> RawToken<'a> {
        let start = self.pos;
        let line = self.line;
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' | b';' => self.pos += 1,
                b'\n' => {
                    self.pos += 1;
                    self.line += 1;
                }
                _ => break,
            }
        }
        self.comment_ok = true;
        self.token(start, self.pos, RawKind::Eol, line)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b'\\' if self.peek_at(1) == Some(b'\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                b'\\' if self.peek_at(1).is_some() => self.pos += 2,
                b'\n' => break,
                _ => self.pos += 1,
            }
        }
    }

    /// A braced word: the body between balanced braces, taken literally.
    pub fn parse_brace(&mut self) -> RawToken<'a> {
        let open_line = self.line;
        self.pos += 1;
        self.start_content();
        let start = self.pos;
        let mut level = 1;
        while let Some(c) = self.peek() {
            match c {
                b'\\' if self.peek_at(1).is_some() => {
                    if self.peek_at(1) == Some(b'\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                    continue;
                }
                b'{' => level += 1,
                b'}' => {
                    level -= 1;
                    if level == 0 {
                        let tok = RawToken {
                            text: &self.src[start..self.pos],
                            kind: RawKind::Str,
                            line: open_line,
                            braced: true,
                        };
                        self.pos += 1;
                        return tok;
                    }
                }
                b'\n' => self.line += 1,
                _ => {}
            }
            self.pos += 1;
        }
        self.missing.get_or_insert(('{', open_line));
        RawToken {
            text: &self.src[start..self.src.len()],
            kind: RawKind::Str,
            line: open_line,
            braced: true,
        }
    }

    /// A bracketed command substitution. Brace depth is tracked separately so
    /// a `]` inside braces stays part of the nested script.
    pub fn parse_cmd(&mut self) -> RawToken<'a> {
        let open_line = self.line;
        self.pos += 1;
        self.start_content();
        let start = self.pos;
        let mut level = 1;
        let mut brace_level = 0i32;
        while let Some(c) = self.peek() {
            match c {
                b'\\' if self.peek_at(1).is_some() => {
                    if self.peek_at(1) == Some(b'\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                    continue;
                }
                b'{' => brace_level += 1,
                b'}' => brace_level = (brace_level - 1).max(0),
                b'[' if brace_level == 0 => level += 1,
                b']' if brace_level == 0 => {
                    level -= 1;
                    if level == 0 {
                        let tok = self.token(start, self.pos, RawKind::Cmd, open_line);
                        self.pos += 1;
                        return tok;
                    }
                }
                b'\n' => self.line += 1,
                _ => {}
            }
            self.pos += 1;
        }
        self.missing.get_or_insert(('[', open_line));
        self.token(start, self.src.len(), RawKind::Cmd, open_line)
    }

    /// A `$` reference: `${any}`, `$name`, `$name(key)`, or a literal `$`
    /// when no variable name follows.
    pub fn parse_var(&mut self) -> RawToken<'a> {
        let dollar = self.pos;
        let line = self.line;
        self.pos += 1;
        self.start_content();
        if self.peek() == Some(b'{') {
            self.pos += 1;
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == b'}' {
                    let tok = self.token(start, self.pos, RawKind::Var, line);
                    self.pos += 1;
                    return tok;
                }
                if c == b'\n' {
                    self.line += 1;
                }
                self.pos += 1;
            }
            self.missing.get_or_insert(('{', line));
            return self.token(start, self.src.len(), RawKind::Var, line);
        }
        let start = self.pos;
        while self.peek() == Some(b':') {
            self.pos += 1;
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            // A bare dollar that names nothing is a literal dollar.
            return self.token(dollar, dollar + 1, RawKind::Str, line);
        }
        if self.peek() == Some(b'(') {
            let mut level = 1;
            let mut probe = self.pos + 1;
            while probe < self.bytes.len() {
                match self.bytes[probe] {
                    b'\\' if probe + 1 < self.bytes.len() => probe += 1,
                    b'(' => level += 1,
                    b')' => {
                        level -= 1;
                        if level == 0 {
                            let tok = self.token(start, probe + 1, RawKind::DictSugar, line);
                            self.pos = probe + 1;
                            return tok;
                        }
                    }
                    _ => {}
                }
                probe += 1;
            }
            // Missing close paren: fall through to the plain variable name.
        }
        self.token(start, self.pos, RawKind::Var, line)
    }

    /// Literal text up to the next structural character. `Esc` when any
    /// backslash sequence appears in the run.
    fn parse_str(&mut self) -> RawToken<'a> {
        let start = self.pos;
        let line = self.line;
        let mut kind = RawKind::Str;
        self.start_content();
        while let Some(c) = self.peek() {
            match c {
                b'\\' if self.peek_at(1) == Some(b'\n') && !self.in_quote => break,
                b'\\' if self.peek_at(1).is_some() => {
                    kind = RawKind::Esc;
                    if self.peek_at(1) == Some(b'\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                b'\\' => {
                    // Trailing backslash: kept literally, decoded later.
                    kind = RawKind::Esc;
                    self.pos += 1;
                }
                b'$' | b'[' => break,
                b' ' | b'\t' | b';' | b'\r' if !self.in_quote => break,
                b'\n' if !self.in_quote => break,
                b'"' if self.in_quote => break,
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }
        self.token(start, self.pos, kind, line)
    }

    fn next_subst_token(&mut self, flags: SubstFlags) -> RawToken<'a> {
        let Some(c) = self.peek() else {
            return self.token(self.src.len(), self.src.len(), RawKind::Eof, self.line);
        };
        match c {
            b'$' if !flags.no_variables => self.parse_var(),
            b'[' if !flags.no_commands => self.parse_cmd(),
            _ => self.parse_subst_str(flags),
        }
    }

    fn parse_subst_str(&mut self, flags: SubstFlags) -> RawToken<'a> {
        let start = self.pos;
        let line = self.line;
        let mut kind = RawKind::Str;
        while let Some(c) = self.peek() {
            match c {
                b'$' if !flags.no_variables => break,
                b'[' if !flags.no_commands => break,
                b'\\' if !flags.no_backslashes && self.peek_at(1).is_some() => {
                    kind = RawKind::Esc;
                    if self.peek_at(1) == Some(b'\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }
        self.token(start, self.pos, kind, line)
    }
}

// ---------------------------------------------------------------------------
// Escape decoding
// ---------------------------------------------------------------------------

fn hex_val(b: u8) -> Option<u32> {
    match b {
        b'0'..=b'9' => Some((b - b'0') as u32),
        b'a'..=b'f' => Some((b - b'a' + 10) as u32),
        b'A'..=b'F' => Some((b - b'A' + 10) as u32),
        _ => None,
    }
}

/// Decode backslash escapes: control characters, `\xHH`, `\uHHHH`, octal,
/// backslash-newline to space (swallowing following indentation), and
/// unknown `\c` to the literal `c`.
pub(crate) fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            let start = i;
            i += 1;
            while i < bytes.len() && bytes[i] != b'\\' {
                i += 1;
            }
            out.push_str(&s[start..i]);
            continue;
        }
        i += 1;
        match bytes[i] {
            b'a' => {
                out.push('\x07');
                i += 1;
            }
            b'b' => {
                out.push('\x08');
                i += 1;
            }
            b'f' => {
                out.push('\x0c');
                i += 1;
            }
            b'n' => {
                out.push('\n');
                i += 1;
            }
            b'r' => {
                out.push('\r');
                i += 1;
            }
            b't' => {
                out.push('\t');
                i += 1;
            }
            b'v' => {
                out.push('\x0b');
                i += 1;
            }
            b'x' => {
                i += 1;
                let mut val = 0u32;
                let mut digits = 0;
                while digits < 2 {
                    match bytes.get(i).copied().and_then(hex_val) {
                        Some(h) => {
                            val = val * 16 + h;
                            i += 1;
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    out.push('x');
                } else if let Some(c) = char::from_u32(val) {
                    out.push(c);
                }
            }
            b'u' => {
                i += 1;
                let mut val = 0u32;
                let mut digits = 0;
                while digits < 4 {
                    match bytes.get(i).copied().and_then(hex_val) {
                        Some(h) => {
                            val = val * 16 + h;
                            i += 1;
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    out.push('u');
                } else if let Some(c) = char::from_u32(val) {
                    out.push(c);
                }
            }
            b'0'..=b'7' => {
                let mut val = 0u32;
                let mut digits = 0;
                while digits < 3 {
                    match bytes.get(i).copied() {
                        Some(b @ b'0'..=b'7') => {
                            val = val * 8 + (b - b'0') as u32;
                            i += 1;
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                if let Some(c) = char::from_u32(val) {
                    out.push(c);
                }
            }
            b'\n' => {
                out.push(' ');
                i += 1;
                while matches!(bytes.get(i), Some(b' ') | Some(b'\t')) {
                    i += 1;
                }
            }
            other => {
                // Includes `\\`; unknown escapes reduce to the bare character.
                let ch_start = i;
                let mut ch_end = i + 1;
                while ch_end < bytes.len() && !s.is_char_boundary(ch_end) {
                    ch_end += 1;
                }
                let _ = other;
                out.push_str(&s[ch_start..ch_end]);
                i = ch_end;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// List parsing
// ---------------------------------------------------------------------------

/// Split a string into its list elements, honoring brace quoting, double
/// quotes, and backslash escapes. `$` and `[` carry no meaning here.
pub(crate) fn parse_list_elements(src: &str) -> Result<Vec<String>, String> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        match bytes[i] {
            b'{' => {
                let mut level = 1;
                let start = i + 1;
                i += 1;
                while i < bytes.len() {
                    match bytes[i] {
                        b'\\' if i + 1 < bytes.len() => i += 1,
                        b'{' => level += 1,
                        b'}' => {
                            level -= 1;
                            if level == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
                if level != 0 {
                    return Err("unmatched \"{\" in list".to_string());
                }
                out.push(src[start..i].to_string());
                i += 1;
                if i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    return Err(format!(
                        "list element in braces followed by \"{}\" instead of space",
                        &src[i..i + 1]
                    ));
                }
            }
            b'"' => {
                let start = i + 1;
                i += 1;
                let mut escaped = false;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' && i + 1 < bytes.len() {
                        escaped = true;
                        i += 1;
                    }
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err("unmatched \"\\\"\" in list".to_string());
                }
                let body = &src[start..i];
                out.push(if escaped {
                    unescape(body)
                } else {
                    body.to_string()
                });
                i += 1;
                if i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    return Err(format!(
                        "list element in quotes followed by \"{}\" instead of space",
                        &src[i..i + 1]
                    ));
                }
            }
            _ => {
                let start = i;
                let mut escaped = false;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    if bytes[i] == b'\\' && i + 1 < bytes.len() {
                        escaped = true;
                        i += 1;
                    }
                    i += 1;
                }
                let body = &src[start..i];
                out.push(if escaped {
                    unescape(body)
                } else {
                    body.to_string()
                });
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Completeness check
// ---------------------------------------------------------------------------

/// Whether `src` is a complete script, accounting only for brace depth and
/// quote state. Returns the still-open construct (`{` or `"`) when it is not.
/// Interactive layers use this to decide whether to keep reading lines.
pub(crate) fn script_is_complete(src: &str) -> (bool, Option<char>) {
    let bytes = src.as_bytes();
    let mut level = 0i64;
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => i += 1,
            b'{' if !in_quote => level += 1,
            b'}' if !in_quote => level = (level - 1).max(0),
            b'"' => in_quote = !in_quote,
            _ => {}
        }
        i += 1;
    }
    if level > 0 {
        (false, Some('{'))
    } else if in_quote {
        (false, Some('"'))
    } else {
        (true, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tokens(src: &str) -> Vec<(String, RawKind)> {
        let mut p = Parser::new(src, 1);
        let mut out = Vec::new();
        loop {
            let t = p.next_token();
            if t.kind == RawKind::Eof {
                break;
            }
            out.push((t.text.to_string(), t.kind));
        }
        out
    }

    #[test]
    fn test_simple_command() {
        assert_eq!(
            tokens("set x 5"),
            vec![
                ("set".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("x".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("5".into(), RawKind::Str),
            ]
        );
    }

    #[test]
    fn test_braced_word_is_literal() {
        assert_eq!(
            tokens("puts {a $b [c]}"),
            vec![
                ("puts".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("a $b [c]".into(), RawKind::Str),
            ]
        );
    }

    #[test]
    fn test_quoted_word_interpolates() {
        assert_eq!(
            tokens("puts \"a $b c\""),
            vec![
                ("puts".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("a ".into(), RawKind::Str),
                ("b".into(), RawKind::Var),
                (" c".into(), RawKind::Str),
            ]
        );
    }

    #[test]
    fn test_command_substitution_nesting() {
        assert_eq!(
            tokens("set x [lindex {a ]} 0]"),
            vec![
                ("set".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("x".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("lindex {a ]} 0".into(), RawKind::Cmd),
            ]
        );
    }

    #[test]
    fn test_dict_sugar() {
        assert_eq!(
            tokens("puts $a(k)"),
            vec![
                ("puts".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("a(k)".into(), RawKind::DictSugar),
            ]
        );
    }

    #[test]
    fn test_bare_dollar_is_literal() {
        assert_eq!(
            tokens("puts $ x"),
            vec![
                ("puts".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("$".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("x".into(), RawKind::Str),
            ]
        );
    }

    #[test]
    fn test_braced_variable_name() {
        assert_eq!(
            tokens("puts ${a b}"),
            vec![
                ("puts".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("a b".into(), RawKind::Var),
            ]
        );
    }

    #[test]
    fn test_comment_at_command_position_only() {
        assert_eq!(
            tokens("# a comment\nputs x#y"),
            vec![
                ("\n".into(), RawKind::Eol),
                ("puts".into(), RawKind::Str),
                (" ".into(), RawKind::Sep),
                ("x#y".into(), RawKind::Str),
            ]
        );
    }

    #[test]
    fn test_semicolon_separates_commands() {
        let toks = tokens("a; b");
        assert_eq!(toks[1].1, RawKind::Eol);
        assert_eq!(toks[2].0, "b");
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\tb"), "a\tb");
        assert_eq!(unescape(r"\x41"), "A");
        assert_eq!(unescape(r"\u0394"), "Δ");
        assert_eq!(unescape(r"\101"), "A");
        assert_eq!(unescape(r"\\"), "\\");
        assert_eq!(unescape(r"\q"), "q");
        assert_eq!(unescape("a\\\n   b"), "a b");
    }

    #[test]
    fn test_parse_list_elements() {
        assert_eq!(
            parse_list_elements("a {b c} d").unwrap(),
            vec!["a", "b c", "d"]
        );
        assert_eq!(
            parse_list_elements("  \"x y\"  z ").unwrap(),
            vec!["x y", "z"]
        );
        assert_eq!(parse_list_elements("").unwrap(), Vec::<String>::new());
        assert!(parse_list_elements("{a").is_err());
    }

    #[test]
    fn test_is_complete() {
        assert_eq!(script_is_complete("puts hi"), (true, None));
        assert_eq!(script_is_complete("while {1} {"), (false, Some('{')));
        assert_eq!(script_is_complete("puts \"ab"), (false, Some('"')));
        assert_eq!(script_is_complete("puts \\{"), (true, None));
    }

    #[test]
    fn test_missing_brace_reported() {
        let mut p = Parser::new("puts {abc", 1);
        loop {
            if p.next_token().kind == RawKind::Eof {
                break;
            }
        }
        assert_eq!(p.missing, Some(('{', 1)));
    }

    #[test]
    fn test_subst_mode_suppression() {
        let mut p = Parser::new_subst("a$b[c]", SubstFlags {
            no_variables: true,
            no_commands: false,
            no_backslashes: false,
        });
        let t = p.next_token();
        assert_eq!((t.text, t.kind), ("a$b", RawKind::Str));
        let t = p.next_token();
        assert_eq!((t.text, t.kind), ("c", RawKind::Cmd));
    }
}
