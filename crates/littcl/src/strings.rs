//! String commands, `format`, `scan`, glob matching, and the regex bridge.
//!
//! `format` is a self-contained formatter for the documented conversions
//! (`b d o i u x X c s e E f g G`) with `%n$` positional arguments; it does
//! not delegate to the platform printf. `scan` compiles its format into a
//! [`ScanProgram`] cached on the format value. Index-based subcommands work
//! on characters, not bytes.

use std::rc::Rc;

use crate::commands::resolve_enum;
use crate::interp::{CmdResult, Flow, Interp};
use crate::value::{Repr, Value};

pub(crate) fn register(interp: &mut Interp) {
    interp.register("string", cmd_string);
    interp.register("format", cmd_format);
    interp.register("scan", cmd_scan);
}

// ---------------------------------------------------------------------------
// %g rendering shared with the default double-to-string conversion
// ---------------------------------------------------------------------------

fn trim_trailing_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

/// C-style `%g`: `precision` significant digits, scientific notation outside
/// the `[-4, precision)` exponent window, trailing zeros removed unless
/// `alt` (`#`) keeps them.
pub(crate) fn format_double_g(val: f64, precision: usize, upper: bool, alt: bool) -> String {
    if !val.is_finite() {
        let s = if val.is_nan() {
            "nan".to_string()
        } else if val < 0.0 {
            "-inf".to_string()
        } else {
            "inf".to_string()
        };
        return if upper { s.to_uppercase() } else { s };
    }
    let p = precision.max(1);
    if val == 0.0 {
        return if alt && p > 1 {
            format!("0.{}", "0".repeat(p - 1))
        } else {
            "0".to_string()
        };
    }
    let sci = format!("{:.*e}", p - 1, val);
    let e_at = sci.find('e').expect("scientific rendering has an exponent");
    let exp: i32 = sci[e_at + 1..].parse().expect("exponent parses");
    let mut out = if exp < -4 || exp >= p as i32 {
        let mantissa = &sci[..e_at];
        let mantissa = if alt {
            mantissa.to_string()
        } else {
            trim_trailing_zeros(mantissa)
        };
        format!(
            "{}e{}{:02}",
            mantissa,
            if exp < 0 { '-' } else { '+' },
            exp.abs()
        )
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        let fixed = format!("{:.*}", decimals, val);
        if alt {
            fixed
        } else {
            trim_trailing_zeros(&fixed)
        }
    };
    if upper {
        out = out.to_uppercase();
    }
    out
}

/// C-style `%e`: one digit, point, `precision` decimals, two-digit exponent.
fn format_double_e(val: f64, precision: usize, upper: bool) -> String {
    if !val.is_finite() {
        return format_double_g(val, 6, upper, false);
    }
    let sci = format!("{:.*e}", precision, val);
    let e_at = sci.find('e').expect("scientific rendering has an exponent");
    let exp: i32 = sci[e_at + 1..].parse().expect("exponent parses");
    let out = format!(
        "{}{}{}{:02}",
        &sci[..e_at],
        if upper { 'E' } else { 'e' },
        if exp < 0 { '-' } else { '+' },
        exp.abs()
    );
    out
}

// ---------------------------------------------------------------------------
// Glob matching
// ---------------------------------------------------------------------------

fn chars_eq(a: char, b: char, nocase: bool) -> bool {
    if nocase {
        a.eq_ignore_ascii_case(&b)
    } else {
        a == b
    }
}

fn glob_match_at(pattern: &[char], s: &[char], nocase: bool) -> bool {
    let mut p = 0;
    let mut i = 0;
    // Backtracking state for the most recent `*`.
    let mut star: Option<(usize, usize)> = None;
    while i < s.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    star = Some((p, i));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    i += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next_p)) = match_class(pattern, p, s[i], nocase) {
                        if matched {
                            p = next_p;
                            i += 1;
                            continue;
                        }
                    }
                }
                '\\' if p + 1 < pattern.len() => {
                    if chars_eq(pattern[p + 1], s[i], nocase) {
                        p += 2;
                        i += 1;
                        continue;
                    }
                }
                c => {
                    if chars_eq(c, s[i], nocase) {
                        p += 1;
                        i += 1;
                        continue;
                    }
                }
            }
        }
        match star {
            Some((star_p, star_i)) => {
                p = star_p + 1;
                i = star_i + 1;
                star = Some((star_p, star_i + 1));
            }
            None => return false,
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Match a `[...]` class starting at `open`; returns (matched, index past
/// the class).
fn match_class(pattern: &[char], open: usize, c: char, nocase: bool) -> Option<(bool, usize)> {
    let mut p = open + 1;
    let negate = matches!(pattern.get(p), Some('^'));
    if negate {
        p += 1;
    }
    let mut matched = false;
    let mut first = true;
    while p < pattern.len() {
        if pattern[p] == ']' && !first {
            let hit = matched != negate;
            return Some((hit, p + 1));
        }
        first = false;
        if p + 2 < pattern.len() && pattern[p + 1] == '-' && pattern[p + 2] != ']' {
            let (lo, hi) = (pattern[p], pattern[p + 2]);
            let probe = if nocase { c.to_ascii_lowercase() } else { c };
            let (lo, hi) = if nocase {
                (lo.to_ascii_lowercase(), hi.to_ascii_lowercase())
            } else {
                (lo, hi)
            };
            if lo <= probe && probe <= hi {
                matched = true;
            }
            p += 3;
        } else {
            if chars_eq(pattern[p], c, nocase) {
                matched = true;
            }
            p += 1;
        }
    }
    None
}

/// Tcl-style glob: `*`, `?`, `[a-z]` classes with `^` negation, and
/// backslash escapes.
pub(crate) fn glob_match(pattern: &str, s: &str, nocase: bool) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = s.chars().collect();
    glob_match_at(&pattern, &s, nocase)
}

// ---------------------------------------------------------------------------
// Regex bridge
// ---------------------------------------------------------------------------

/// Compile (or reuse) the regex cached on a pattern value.
pub(crate) fn get_regexp(
    interp: &mut Interp,
    pattern: &Value,
    nocase: bool,
) -> Result<Rc<regex::Regex>, Flow> {
    if let Repr::Regexp { nocase: cached, re } = &*pattern.cell.repr.borrow() {
        if *cached == nocase {
            return Ok(Rc::clone(re));
        }
    }
    let source = pattern.as_string();
    let re = regex::RegexBuilder::new(&source)
        .case_insensitive(nocase)
        .build();
    match re {
        Ok(re) => {
            let re = Rc::new(re);
            pattern.set_repr(Repr::Regexp {
                nocase,
                re: Rc::clone(&re),
            });
            Ok(re)
        }
        Err(e) => Err(interp.error(format!(
            "couldn't compile regular expression pattern: {}",
            e
        ))),
    }
}

pub(crate) fn regex_match(
    interp: &mut Interp,
    pattern: &Value,
    text: &str,
    nocase: bool,
) -> Result<bool, Flow> {
    let re = get_regexp(interp, pattern, nocase)?;
    Ok(re.is_match(text))
}

// ---------------------------------------------------------------------------
// format
// ---------------------------------------------------------------------------

#[derive(Default, Clone, Copy)]
struct FmtFlags {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
}

fn pad_field(body: String, width: usize, flags: FmtFlags, numeric_sign: bool) -> String {
    let visible = body.chars().count();
    if visible >= width {
        return body;
    }
    let fill = width - visible;
    if flags.left {
        let mut out = body;
        out.extend(std::iter::repeat_n(' ', fill));
        out
    } else if flags.zero && numeric_sign {
        // Zero padding goes between the sign (or prefix) and the digits.
        let split = body
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(0);
        let (head, tail) = body.split_at(split);
        format!("{}{}{}", head, "0".repeat(fill), tail)
    } else {
        format!("{}{}", " ".repeat(fill), body)
    }
}

fn signed_body(digits: String, negative: bool, flags: FmtFlags) -> String {
    if negative {
        format!("-{}", digits)
    } else if flags.plus {
        format!("+{}", digits)
    } else if flags.space {
        format!(" {}", digits)
    } else {
        digits
    }
}

fn cmd_format(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(argv, "formatString ?arg ...?"));
    }
    let fmt = argv[1].as_string();
    let args = &argv[2..];
    let chars: Vec<char> = fmt.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    let mut next_arg = 0usize;
    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        if i < chars.len() && chars[i] == '%' {
            out.push('%');
            i += 1;
            continue;
        }
        // %n$ positional selector.
        let mut arg_index: Option<usize> = None;
        let digits_start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        if i < chars.len() && chars[i] == '$' && i > digits_start {
            let n: usize = chars[digits_start..i]
                .iter()
                .collect::<String>()
                .parse()
                .unwrap_or(0);
            if n == 0 {
                return Err(interp.error("bad field specifier \"$\""));
            }
            arg_index = Some(n - 1);
            i += 1;
        } else {
            i = digits_start;
        }
        let mut flags = FmtFlags::default();
        while i < chars.len() {
            match chars[i] {
                '-' => flags.left = true,
                '+' => flags.plus = true,
                ' ' => flags.space = true,
                '0' => flags.zero = true,
                '#' => flags.alt = true,
                _ => break,
            }
            i += 1;
        }
        let mut take_arg = |interp: &mut Interp, next_arg: &mut usize| -> Result<Value, Flow> {
            let idx = match arg_index {
                Some(n) => n,
                None => {
                    let n = *next_arg;
                    *next_arg += 1;
                    n
                }
            };
            args.get(idx).cloned().ok_or_else(|| {
                interp.error("not enough arguments for all format specifiers")
            })
        };
        let mut width = 0usize;
        if i < chars.len() && chars[i] == '*' {
            i += 1;
            let v = take_arg(interp, &mut next_arg)?;
            let n = interp.get_int(&v)?;
            if n < 0 {
                flags.left = true;
                width = (-n) as usize;
            } else {
                width = n as usize;
            }
        } else {
            while i < chars.len() && chars[i].is_ascii_digit() {
                width = width * 10 + chars[i].to_digit(10).unwrap() as usize;
                i += 1;
            }
        }
        let mut precision: Option<usize> = None;
        if i < chars.len() && chars[i] == '.' {
            i += 1;
            if i < chars.len() && chars[i] == '*' {
                i += 1;
                let v = take_arg(interp, &mut next_arg)?;
                precision = Some(interp.get_int(&v)?.max(0) as usize);
            } else {
                let mut p = 0usize;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    p = p * 10 + chars[i].to_digit(10).unwrap() as usize;
                    i += 1;
                }
                precision = Some(p);
            }
        }
        let Some(&conv) = chars.get(i) else {
            return Err(interp.error("format string ended in middle of field specifier"));
        };
        i += 1;
        let field = match conv {
            'd' | 'i' => {
                let v = take_arg(interp, &mut next_arg)?;
                let n = interp.get_int(&v)?;
                let body = signed_body(n.unsigned_abs().to_string(), n < 0, flags);
                pad_field(body, width, flags, true)
            }
            'u' => {
                let v = take_arg(interp, &mut next_arg)?;
                let n = interp.get_int(&v)? as u64;
                pad_field(n.to_string(), width, flags, true)
            }
            'o' => {
                let v = take_arg(interp, &mut next_arg)?;
                let n = interp.get_int(&v)? as u64;
                let digits = format!("{:o}", n);
                let body = if flags.alt && !digits.starts_with('0') {
                    format!("0{}", digits)
                } else {
                    digits
                };
                pad_field(body, width, flags, true)
            }
            'x' | 'X' => {
                let v = take_arg(interp, &mut next_arg)?;
                let n = interp.get_int(&v)? as u64;
                let digits = if conv == 'x' {
                    format!("{:x}", n)
                } else {
                    format!("{:X}", n)
                };
                let body = if flags.alt && n != 0 {
                    format!("{}{}", if conv == 'x' { "0x" } else { "0X" }, digits)
                } else {
                    digits
                };
                pad_field(body, width, flags, true)
            }
            'b' => {
                let v = take_arg(interp, &mut next_arg)?;
                let n = interp.get_int(&v)? as u64;
                pad_field(format!("{:b}", n), width, flags, true)
            }
            'c' => {
                let v = take_arg(interp, &mut next_arg)?;
                let n = interp.get_int(&v)?;
                let c = u32::try_from(n)
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or('\u{fffd}');
                pad_field(c.to_string(), width, flags, false)
            }
            's' => {
                let v = take_arg(interp, &mut next_arg)?;
                let s = v.as_string();
                let body = match precision {
                    Some(p) => s.chars().take(p).collect::<String>(),
                    None => s.to_string(),
                };
                pad_field(body, width, flags, false)
            }
            'e' | 'E' => {
                let v = take_arg(interp, &mut next_arg)?;
                let d = interp.get_double(&v)?;
                let body = format_double_e(d.abs(), precision.unwrap_or(6), conv == 'E');
                let body = signed_body(body, d.is_sign_negative() && d != 0.0, flags);
                pad_field(body, width, flags, true)
            }
            'f' => {
                let v = take_arg(interp, &mut next_arg)?;
                let d = interp.get_double(&v)?;
                let body = format!("{:.*}", precision.unwrap_or(6), d.abs());
                let body = signed_body(body, d.is_sign_negative() && d != 0.0, flags);
                pad_field(body, width, flags, true)
            }
            'g' | 'G' => {
                let v = take_arg(interp, &mut next_arg)?;
                let d = interp.get_double(&v)?;
                let body =
                    format_double_g(d.abs(), precision.unwrap_or(6), conv == 'G', flags.alt);
                let body = signed_body(body, d.is_sign_negative() && d != 0.0, flags);
                pad_field(body, width, flags, true)
            }
            other => {
                return Err(interp.error(format!("bad field specifier \"{}\"", other)));
            }
        };
        out.push_str(&field);
    }
    Ok(interp.new_string(&out))
}

// ---------------------------------------------------------------------------
// scan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanKind {
    Dec,
    Uns,
    Base0,
    Oct,
    Hex,
    Bin,
    Char,
    Str,
    Double,
}

#[derive(Debug, Clone)]
enum ScanPart {
    /// Whitespace in the format: skips any whitespace run in the input.
    Space,
    Literal(String),
    Conv {
        pos: Option<usize>,
        suppress: bool,
        width: Option<usize>,
        kind: ScanKind,
    },
    CharSet {
        pos: Option<usize>,
        suppress: bool,
        width: Option<usize>,
        negate: bool,
        set: Vec<char>,
    },
}

/// A compiled scan format, cached on the format value.
#[derive(Debug)]
pub(crate) struct ScanProgram {
    parts: Vec<ScanPart>,
    conversions: usize,
}

fn parse_scan_format(fmt: &str) -> Result<ScanProgram, String> {
    let chars: Vec<char> = fmt.chars().collect();
    let mut parts = Vec::new();
    let mut conversions = 0;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_whitespace() {
            parts.push(ScanPart::Space);
            while i < chars.len() && chars[i].is_ascii_whitespace() {
                i += 1;
            }
            continue;
        }
        if c != '%' {
            let start = i;
            while i < chars.len() && chars[i] != '%' && !chars[i].is_ascii_whitespace() {
                i += 1;
            }
            parts.push(ScanPart::Literal(chars[start..i].iter().collect()));
            continue;
        }
        i += 1;
        if i < chars.len() && chars[i] == '%' {
            parts.push(ScanPart::Literal("%".to_string()));
            i += 1;
            continue;
        }
        let mut suppress = false;
        if i < chars.len() && chars[i] == '*' {
            suppress = true;
            i += 1;
        }
        let digits_start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        let mut pos = None;
        let mut width = None;
        if i > digits_start {
            let n: usize = chars[digits_start..i].iter().collect::<String>().parse().unwrap();
            if i < chars.len() && chars[i] == '$' {
                if n == 0 {
                    return Err("bad positional specifier".to_string());
                }
                pos = Some(n - 1);
                i += 1;
                // A width may still follow the positional selector.
                let w_start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i > w_start {
                    width = Some(chars[w_start..i].iter().collect::<String>().parse().unwrap());
                }
            } else {
                width = Some(n);
            }
        }
        let Some(&conv) = chars.get(i) else {
            return Err("format string ended in middle of field specifier".to_string());
        };
        i += 1;
        if conv == '[' {
            let mut negate = false;
            if matches!(chars.get(i), Some('^')) {
                negate = true;
                i += 1;
            }
            let mut set = Vec::new();
            // A leading `]` is part of the set.
            if matches!(chars.get(i), Some(']')) {
                set.push(']');
                i += 1;
            }
            while i < chars.len() && chars[i] != ']' {
                if i + 2 < chars.len() && chars[i + 1] == '-' && chars[i + 2] != ']' {
                    let (lo, hi) = (chars[i], chars[i + 2]);
                    let mut c = lo;
                    while c <= hi {
                        set.push(c);
                        c = char::from_u32(c as u32 + 1).unwrap_or(hi);
                        if c as u32 > hi as u32 {
                            break;
                        }
                    }
                    i += 3;
                } else {
                    set.push(chars[i]);
                    i += 1;
                }
            }
            if i >= chars.len() {
                return Err("unmatched [ in format string".to_string());
            }
            i += 1;
            conversions += 1;
            parts.push(ScanPart::CharSet {
                pos,
                suppress,
                width,
                negate,
                set,
            });
            continue;
        }
        let kind = match conv {
            'd' => ScanKind::Dec,
            'u' => ScanKind::Uns,
            'i' => ScanKind::Base0,
            'o' => ScanKind::Oct,
            'x' | 'X' => ScanKind::Hex,
            'b' => ScanKind::Bin,
            'c' => ScanKind::Char,
            's' => ScanKind::Str,
            'e' | 'f' | 'g' => ScanKind::Double,
            other => return Err(format!("bad scan conversion character \"{}\"", other)),
        };
        conversions += 1;
        parts.push(ScanPart::Conv {
            pos,
            suppress,
            width,
            kind,
        });
    }
    Ok(ScanProgram { parts, conversions })
}

fn get_scan_program(interp: &mut Interp, fmt: &Value) -> Result<Rc<ScanProgram>, Flow> {
    if let Repr::ScanFormat(p) = &*fmt.cell.repr.borrow() {
        return Ok(Rc::clone(p));
    }
    let s = fmt.as_string();
    match parse_scan_format(&s) {
        Ok(prog) => {
            let prog = Rc::new(prog);
            fmt.set_repr(Repr::ScanFormat(Rc::clone(&prog)));
            Ok(prog)
        }
        Err(msg) => Err(interp.error(msg)),
    }
}

fn scan_integer(input: &[char], at: usize, width: Option<usize>, kind: ScanKind) -> Option<(i64, usize)> {
    let mut i = at;
    let limit = width.map(|w| at + w).unwrap_or(usize::MAX);
    let mut negative = false;
    if i < input.len() && i < limit && (input[i] == '-' || input[i] == '+') {
        negative = input[i] == '-';
        i += 1;
    }
    let mut radix: u32 = match kind {
        ScanKind::Oct => 8,
        ScanKind::Hex => 16,
        ScanKind::Bin => 2,
        _ => 10,
    };
    if matches!(kind, ScanKind::Base0 | ScanKind::Hex)
        && i + 1 < input.len()
        && i + 1 < limit
        && input[i] == '0'
        && (input[i + 1] == 'x' || input[i + 1] == 'X')
    {
        radix = 16;
        i += 2;
    } else if kind == ScanKind::Base0 && i < input.len() && input[i] == '0' {
        radix = 8;
    }
    let digits_start = i;
    let mut value: i64 = 0;
    while i < input.len() && i < limit {
        let Some(d) = input[i].to_digit(radix) else {
            break;
        };
        value = value.wrapping_mul(radix as i64).wrapping_add(d as i64);
        i += 1;
    }
    if i == digits_start {
        return None;
    }
    Some((if negative { value.wrapping_neg() } else { value }, i))
}

fn scan_double(input: &[char], at: usize, width: Option<usize>) -> Option<(f64, usize)> {
    let limit = width.map(|w| at + w).unwrap_or(usize::MAX).min(input.len());
    let mut end = at;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < limit {
        let c = input[end];
        match c {
            '0'..='9' => seen_digit = true,
            '+' | '-' if end == at || matches!(input[end - 1], 'e' | 'E') => {}
            '.' if !seen_dot && !seen_exp => seen_dot = true,
            'e' | 'E' if seen_digit && !seen_exp => seen_exp = true,
            _ => break,
        }
        end += 1;
    }
    if !seen_digit {
        return None;
    }
    // Back off a dangling exponent marker or sign.
    let mut end2 = end;
    while end2 > at && matches!(input[end2 - 1], 'e' | 'E' | '+' | '-') {
        end2 -= 1;
    }
    let text: String = input[at..end2].iter().collect();
    text.parse().ok().map(|d| (d, end2))
}

fn cmd_scan(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 3 {
        return Err(interp.wrong_num_args(argv, "string format ?varName ...?"));
    }
    let prog = get_scan_program(interp, &argv[2])?;
    let vars = &argv[3..];
    let inline = vars.is_empty();
    if !inline && vars.len() != prog.conversions {
        return Err(interp.error(
            "different numbers of variable names and field specifiers",
        ));
    }

    let input: Vec<char> = argv[1].as_string().chars().collect();
    let mut at = 0usize;
    let mut slots: Vec<Option<Value>> = vec![None; prog.conversions];
    let mut next_slot = 0usize;
    let mut early_eof = true;

    'parts: for part in &prog.parts {
        match part {
            ScanPart::Space => {
                while at < input.len() && input[at].is_ascii_whitespace() {
                    at += 1;
                }
            }
            ScanPart::Literal(lit) => {
                for c in lit.chars() {
                    if at >= input.len() || input[at] != c {
                        break 'parts;
                    }
                    at += 1;
                }
            }
            ScanPart::Conv {
                pos,
                suppress,
                width,
                kind,
            } => {
                if *kind != ScanKind::Char {
                    while at < input.len() && input[at].is_ascii_whitespace() {
                        at += 1;
                    }
                }
                if at >= input.len() {
                    break 'parts;
                }
                let slot = pos.unwrap_or(next_slot);
                if pos.is_none() {
                    next_slot += 1;
                }
                let value = match kind {
                    ScanKind::Char => {
                        let code = input[at] as i64;
                        at += 1;
                        interp.new_int(code)
                    }
                    ScanKind::Str => {
                        let limit =
                            width.map(|w| at + w).unwrap_or(usize::MAX).min(input.len());
                        let start = at;
                        while at < limit && !input[at].is_ascii_whitespace() {
                            at += 1;
                        }
                        if at == start {
                            break 'parts;
                        }
                        let s: String = input[start..at].iter().collect();
                        interp.new_string(&s)
                    }
                    ScanKind::Double => {
                        let Some((d, end)) = scan_double(&input, at, *width) else {
                            break 'parts;
                        };
                        at = end;
                        interp.new_double(d)
                    }
                    _ => {
                        let Some((n, end)) = scan_integer(&input, at, *width, *kind) else {
                            break 'parts;
                        };
                        at = end;
                        interp.new_int(n)
                    }
                };
                early_eof = false;
                if !suppress && slot < slots.len() {
                    slots[slot] = Some(value);
                }
            }
            ScanPart::CharSet {
                pos,
                suppress,
                width,
                negate,
                set,
            } => {
                let slot = pos.unwrap_or(next_slot);
                if pos.is_none() {
                    next_slot += 1;
                }
                let limit = width.map(|w| at + w).unwrap_or(usize::MAX).min(input.len());
                let start = at;
                while at < limit && set.contains(&input[at]) != *negate {
                    at += 1;
                }
                if at == start {
                    break 'parts;
                }
                early_eof = false;
                if !suppress && slot < slots.len() {
                    let s: String = input[start..at].iter().collect();
                    let v = interp.new_string(&s);
                    slots[slot] = Some(v);
                }
            }
        }
    }

    if inline {
        let items: Vec<Value> = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| interp.empty()))
            .collect();
        return Ok(interp.new_list(items));
    }
    if early_eof && at >= input.len() {
        return Ok(interp.new_int(-1));
    }
    let mut stored = 0i64;
    for (slot, var) in slots.into_iter().zip(vars) {
        if let Some(value) = slot {
            interp.set_var_value(var, value)?;
            stored += 1;
        }
    }
    Ok(interp.new_int(stored))
}

// ---------------------------------------------------------------------------
// string
// ---------------------------------------------------------------------------

const STRING_SUBCOMMANDS: &[&str] = &[
    "compare",
    "equal",
    "first",
    "index",
    "last",
    "length",
    "map",
    "match",
    "range",
    "repeat",
    "reverse",
    "tolower",
    "toupper",
    "trim",
    "trimleft",
    "trimright",
];

fn resolve_char_index(interp: &mut Interp, v: &Value, len: usize) -> Result<i64, Flow> {
    let idx = interp.get_index(v)?;
    Ok(idx.resolve(len))
}

fn default_trim_set() -> Vec<char> {
    vec![' ', '\t', '\n', '\r', '\x0b', '\x0c']
}

fn cmd_string(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 3 {
        return Err(interp.wrong_num_args(argv, "subcommand string ?arg ...?"));
    }
    let sub = resolve_enum(interp, &argv[1], STRING_SUBCOMMANDS, "subcommand")?;
    let sub = STRING_SUBCOMMANDS[sub];
    let head = format!("string {}", sub);
    match sub {
        "length" => {
            if argv.len() != 3 {
                return Err(interp.wrong_num_args_msg(&head, "string"));
            }
            let len = argv[2].as_string().chars().count() as i64;
            Ok(interp.new_int(len))
        }
        "compare" | "equal" => {
            let mut i = 2;
            let mut nocase = false;
            if argv.len() > 4 && &*argv[i].as_string() == "-nocase" {
                nocase = true;
                i += 1;
            }
            if argv.len() != i + 2 {
                return Err(interp.wrong_num_args_msg(&head, "?-nocase? string1 string2"));
            }
            let a = argv[i].as_string();
            let b = argv[i + 1].as_string();
            let ord = if nocase {
                a.to_lowercase().cmp(&b.to_lowercase())
            } else {
                a.cmp(&b)
            };
            if sub == "equal" {
                Ok(interp.new_bool(ord.is_eq()))
            } else {
                Ok(interp.new_int(match ord {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                }))
            }
        }
        "match" => {
            let mut i = 2;
            let mut nocase = false;
            if argv.len() > 4 && &*argv[i].as_string() == "-nocase" {
                nocase = true;
                i += 1;
            }
            if argv.len() != i + 2 {
                return Err(interp.wrong_num_args_msg(&head, "?-nocase? pattern string"));
            }
            let pattern = argv[i].as_string();
            let s = argv[i + 1].as_string();
            Ok(interp.new_bool(glob_match(&pattern, &s, nocase)))
        }
        "range" => {
            if argv.len() != 5 {
                return Err(interp.wrong_num_args_msg(&head, "string first last"));
            }
            let chars: Vec<char> = argv[2].as_string().chars().collect();
            let first = resolve_char_index(interp, &argv[3], chars.len())?.max(0) as usize;
            let last = resolve_char_index(interp, &argv[4], chars.len())?
                .min(chars.len() as i64 - 1);
            if last < first as i64 || first >= chars.len() {
                return Ok(interp.empty());
            }
            let s: String = chars[first..=last as usize].iter().collect();
            Ok(interp.new_string(&s))
        }
        "index" => {
            if argv.len() != 4 {
                return Err(interp.wrong_num_args_msg(&head, "string index"));
            }
            let chars: Vec<char> = argv[2].as_string().chars().collect();
            let i = resolve_char_index(interp, &argv[3], chars.len())?;
            if i < 0 || i as usize >= chars.len() {
                return Ok(interp.empty());
            }
            Ok(interp.new_string(&chars[i as usize].to_string()))
        }
        "first" => {
            if argv.len() != 4 && argv.len() != 5 {
                return Err(interp.wrong_num_args_msg(&head, "needleString haystackString ?startIndex?"));
            }
            let needle: Vec<char> = argv[2].as_string().chars().collect();
            let haystack: Vec<char> = argv[3].as_string().chars().collect();
            let start = match argv.get(4) {
                Some(v) => resolve_char_index(interp, v, haystack.len())?.max(0) as usize,
                None => 0,
            };
            let found = if needle.is_empty() {
                -1
            } else {
                (start..haystack.len().saturating_sub(needle.len() - 1))
                    .find(|&i| haystack[i..i + needle.len()] == needle[..])
                    .map(|i| i as i64)
                    .unwrap_or(-1)
            };
            Ok(interp.new_int(found))
        }
        "last" => {
            if argv.len() != 4 && argv.len() != 5 {
                return Err(interp.wrong_num_args_msg(&head, "needleString haystackString ?lastIndex?"));
            }
            let needle: Vec<char> = argv[2].as_string().chars().collect();
            let haystack: Vec<char> = argv[3].as_string().chars().collect();
            let last = match argv.get(4) {
                Some(v) => resolve_char_index(interp, v, haystack.len())?,
                None => haystack.len() as i64 - 1,
            };
            let found = if needle.is_empty() || last < 0 {
                -1
            } else {
                let upper = (last as usize + 1)
                    .min(haystack.len())
                    .saturating_sub(needle.len() - 1);
                (0..upper)
                    .rev()
                    .find(|&i| haystack[i..i + needle.len()] == needle[..])
                    .map(|i| i as i64)
                    .unwrap_or(-1)
            };
            Ok(interp.new_int(found))
        }
        "map" => {
            let mut i = 2;
            let mut nocase = false;
            if argv.len() > 4 && &*argv[i].as_string() == "-nocase" {
                nocase = true;
                i += 1;
            }
            if argv.len() != i + 2 {
                return Err(interp.wrong_num_args_msg(&head, "?-nocase? mapList string"));
            }
            let mapping = interp.get_list(&argv[i])?;
            if mapping.len() % 2 != 0 {
                return Err(interp.error("list must contain an even number of elements"));
            }
            let pairs: Vec<(String, String)> = mapping
                .chunks(2)
                .map(|c| (c[0].as_string().to_string(), c[1].as_string().to_string()))
                .collect();
            let s = argv[i + 1].as_string();
            let mut out = String::new();
            let mut at = 0;
            'outer: while at < s.len() {
                for (from, to) in &pairs {
                    if from.is_empty() {
                        continue;
                    }
                    let candidate = s.get(at..at + from.len());
                    let hit = match candidate {
                        Some(c) if nocase => c.eq_ignore_ascii_case(from),
                        Some(c) => c == from,
                        None => false,
                    };
                    if hit {
                        out.push_str(to);
                        at += from.len();
                        continue 'outer;
                    }
                }
                let c = s[at..].chars().next().expect("in-bounds char");
                out.push(c);
                at += c.len_utf8();
            }
            Ok(interp.new_string(&out))
        }
        "repeat" => {
            if argv.len() != 4 {
                return Err(interp.wrong_num_args_msg(&head, "string count"));
            }
            let count = interp.get_int(&argv[3])?.max(0) as usize;
            let s = argv[2].as_string();
            Ok(interp.new_string(&s.repeat(count)))
        }
        "reverse" => {
            if argv.len() != 3 {
                return Err(interp.wrong_num_args_msg(&head, "string"));
            }
            let s: String = argv[2].as_string().chars().rev().collect();
            Ok(interp.new_string(&s))
        }
        "tolower" => {
            if argv.len() != 3 {
                return Err(interp.wrong_num_args_msg(&head, "string"));
            }
            let s = argv[2].as_string().to_lowercase();
            Ok(interp.new_string(&s))
        }
        "toupper" => {
            if argv.len() != 3 {
                return Err(interp.wrong_num_args_msg(&head, "string"));
            }
            let s = argv[2].as_string().to_uppercase();
            Ok(interp.new_string(&s))
        }
        "trim" | "trimleft" | "trimright" => {
            if argv.len() != 3 && argv.len() != 4 {
                return Err(interp.wrong_num_args_msg(&head, "string ?chars?"));
            }
            let set: Vec<char> = match argv.get(3) {
                Some(v) => v.as_string().chars().collect(),
                None => default_trim_set(),
            };
            let s = argv[2].as_string();
            let trimmed = match sub {
                "trim" => s.trim_matches(|c| set.contains(&c)),
                "trimleft" => s.trim_start_matches(|c| set.contains(&c)),
                _ => s.trim_end_matches(|c| set.contains(&c)),
            };
            Ok(interp.new_string(trimmed))
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn eval(interp: &mut Interp, src: &str) -> String {
        match interp.eval(src) {
            Ok(v) => v.as_string().to_string(),
            Err(e) => format!("ERR:{}", e),
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything", false));
        assert!(glob_match("a*c", "abc", false));
        assert!(glob_match("a*c", "ac", false));
        assert!(!glob_match("a*c", "ab", false));
        assert!(glob_match("a?c", "abc", false));
        assert!(glob_match("[a-c]x", "bx", false));
        assert!(!glob_match("[a-c]x", "dx", false));
        assert!(glob_match("[^a-c]x", "dx", false));
        assert!(glob_match(r"a\*b", "a*b", false));
        assert!(!glob_match(r"a\*b", "axb", false));
        assert!(glob_match("AbC", "abc", true));
    }

    #[test]
    fn test_format_double_g() {
        assert_eq!(format_double_g(2.0, 12, false, false), "2");
        assert_eq!(format_double_g(0.5, 12, false, false), "0.5");
        assert_eq!(format_double_g(1e300, 12, false, false), "1e+300");
        assert_eq!(format_double_g(1e-5, 6, false, false), "1e-05");
        assert_eq!(format_double_g(123456.0, 6, false, false), "123456");
        assert_eq!(format_double_g(1234567.0, 6, false, false), "1.23457e+06");
        assert_eq!(format_double_g(0.0, 6, false, false), "0");
    }

    #[test]
    fn test_format_conversions() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "format %d 42"), "42");
        assert_eq!(eval(&mut interp, "format %5d 42"), "   42");
        assert_eq!(eval(&mut interp, "format %-5d| 42"), "42   |");
        assert_eq!(eval(&mut interp, "format %05d 42"), "00042");
        assert_eq!(eval(&mut interp, "format %+d 42"), "+42");
        assert_eq!(eval(&mut interp, "format %x 255"), "ff");
        assert_eq!(eval(&mut interp, "format %#x 255"), "0xff");
        assert_eq!(eval(&mut interp, "format %o 8"), "10");
        assert_eq!(eval(&mut interp, "format %b 5"), "101");
        assert_eq!(eval(&mut interp, "format %c 65"), "A");
        assert_eq!(eval(&mut interp, "format %.2f 3.14159"), "3.14");
        assert_eq!(eval(&mut interp, "format %e 12345.6789"), "1.234568e+04");
        assert_eq!(eval(&mut interp, "format %.3s abcdef"), "abc");
        assert_eq!(eval(&mut interp, "format %%"), "%");
        assert_eq!(eval(&mut interp, "format {%s-%s} a b"), "a-b");
    }

    #[test]
    fn test_format_positional() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "format {%2$s %1$s} world hello"), "hello world");
    }

    #[test]
    fn test_format_errors() {
        let mut interp = Interp::new();
        assert!(eval(&mut interp, "format %d").starts_with("ERR:"));
        assert!(eval(&mut interp, "format %q 1").starts_with("ERR:"));
    }

    #[test]
    fn test_scan_basics() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "scan {42 foo} {%d %s} a b"), "2");
        assert_eq!(eval(&mut interp, "set a"), "42");
        assert_eq!(eval(&mut interp, "set b"), "foo");
        assert_eq!(eval(&mut interp, "scan {} %d x"), "-1");
        assert_eq!(eval(&mut interp, "scan abc %c c; set c"), "97");
        assert_eq!(eval(&mut interp, "scan ff %x n; set n"), "255");
        assert_eq!(eval(&mut interp, "scan 2.5 %f d; set d"), "2.5");
    }

    #[test]
    fn test_scan_inline_and_width() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "scan {123 abc} {%d %s}"), "123 abc");
        assert_eq!(eval(&mut interp, "scan 12345 %2d"), "12");
        assert_eq!(eval(&mut interp, "scan {hello world} {%s %s}"), "hello world");
    }

    #[test]
    fn test_scan_charset() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "scan abc123 {%[a-z]} x; set x"), "abc");
        assert_eq!(eval(&mut interp, "scan abc123 {%[^0-9]}"), "abc");
    }

    #[test]
    fn test_format_scan_round_trip() {
        let mut interp = Interp::new();
        for n in ["0", "1", "-1", "9223372036854775807", "-9223372036854775808"] {
            let script = format!("scan [format %d {}] %d", n);
            assert_eq!(eval(&mut interp, &script), n);
        }
    }

    #[test]
    fn test_string_subcommands() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "string length abc"), "3");
        assert_eq!(eval(&mut interp, "string range abcde 1 end-1"), "bcd");
        assert_eq!(eval(&mut interp, "string index abc 1"), "b");
        assert_eq!(eval(&mut interp, "string index abc end"), "c");
        assert_eq!(eval(&mut interp, "string index abc 9"), "");
        assert_eq!(eval(&mut interp, "string first bc abcbc"), "1");
        assert_eq!(eval(&mut interp, "string last bc abcbc"), "3");
        assert_eq!(eval(&mut interp, "string first xy abc"), "-1");
        assert_eq!(eval(&mut interp, "string repeat ab 3"), "ababab");
        assert_eq!(eval(&mut interp, "string reverse abc"), "cba");
        assert_eq!(eval(&mut interp, "string tolower AbC"), "abc");
        assert_eq!(eval(&mut interp, "string toupper AbC"), "ABC");
        assert_eq!(eval(&mut interp, "string trim {  hi  }"), "hi");
        assert_eq!(eval(&mut interp, "string trimleft xxhixx x"), "hixx");
        assert_eq!(eval(&mut interp, "string trimright xxhixx x"), "xxhi");
        assert_eq!(eval(&mut interp, "string compare a b"), "-1");
        assert_eq!(eval(&mut interp, "string compare b a"), "1");
        assert_eq!(eval(&mut interp, "string equal -nocase AB ab"), "1");
        assert_eq!(eval(&mut interp, "string match {a*} abc"), "1");
        assert_eq!(eval(&mut interp, "string map {ab X c Y} abcab"), "XYX");
    }

    #[test]
    fn test_string_subcommand_abbreviation() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "string len abc"), "3");
        assert!(eval(&mut interp, "string t abc").starts_with("ERR:ambiguous"));
        assert!(eval(&mut interp, "string nosuch abc").starts_with("ERR:bad"));
    }
}
