//! Expression compiler and stack virtual machine.
//!
//! Expressions compile once into an [`ExprProgram`]: a linear instruction
//! sequence for a small stack machine, cached on the expression value and
//! shared behind `Rc`. Compilation is a shunting-yard pass; short-circuit
//! operators and `?:` compile into left/right instruction pairs where the
//! left instruction carries a forward skip distance, emitted as a
//! placeholder and patched in place once the right-hand side is compiled.
//!
//! Numeric dispatch prefers integer arithmetic when both operands carry (or
//! parse to) integers; values whose internal representation is already a
//! double never downgrade to the integer path. Relational operators fall
//! back to byte-wise string comparison for non-numeric operands; `eq`, `ne`,
//! `in`, and `ni` always compare strings.

use std::rc::Rc;

use crate::interp::{Flow, Interp};
use crate::parser::{unescape, Parser, RawKind, SubstFlags};
use crate::script::subst;
use crate::value::{parse_boolean, parse_double, parse_int, Repr, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MathFn {
    Int,
    Double,
    Abs,
    Round,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Ceil,
    Floor,
    Exp,
    Log,
    Log10,
    Sqrt,
}

fn math_fn_by_name(name: &str) -> Option<MathFn> {
    Some(match name {
        "int" => MathFn::Int,
        "double" => MathFn::Double,
        "abs" => MathFn::Abs,
        "round" => MathFn::Round,
        "sin" => MathFn::Sin,
        "cos" => MathFn::Cos,
        "tan" => MathFn::Tan,
        "asin" => MathFn::Asin,
        "acos" => MathFn::Acos,
        "atan" => MathFn::Atan,
        "sinh" => MathFn::Sinh,
        "cosh" => MathFn::Cosh,
        "tanh" => MathFn::Tanh,
        "ceil" => MathFn::Ceil,
        "floor" => MathFn::Floor,
        "exp" => MathFn::Exp,
        "log" => MathFn::Log,
        "log10" => MathFn::Log10,
        "sqrt" => MathFn::Sqrt,
        _ => return None,
    })
}

/// Expression opcodes. Operand opcodes carry a payload value; the lazy left
/// opcodes carry a forward skip distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EOp {
    PushInt,
    PushDouble,
    PushStr,
    Var,
    DictSugar,
    Cmd,
    Esc,

    Not,
    BitNot,
    UnaryMinus,
    UnaryPlus,

    Pow,
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    Shl,
    Shr,
    Rotl,
    Rotr,
    Lt,
    Gt,
    Le,
    Ge,
    NumEq,
    NumNe,
    BitAnd,
    BitXor,
    BitOr,
    StrEq,
    StrNe,
    In,
    NotIn,

    AndLeft,
    AndRight,
    OrLeft,
    OrRight,
    TernaryLeft,
    ColonLeft,

    Fn(MathFn),
}

impl EOp {
    fn operand(self) -> bool {
        matches!(
            self,
            EOp::PushInt
                | EOp::PushDouble
                | EOp::PushStr
                | EOp::Var
                | EOp::DictSugar
                | EOp::Cmd
                | EOp::Esc
        )
    }

    fn display_name(self) -> &'static str {
        match self {
            EOp::Pow => "**",
            EOp::Mul => "*",
            EOp::Div => "/",
            EOp::Mod => "%",
            EOp::Add => "+",
            EOp::Sub => "-",
            EOp::Shl => "<<",
            EOp::Shr => ">>",
            EOp::Rotl => "<<<",
            EOp::Rotr => ">>>",
            EOp::Lt => "<",
            EOp::Gt => ">",
            EOp::Le => "<=",
            EOp::Ge => ">=",
            EOp::NumEq => "==",
            EOp::NumNe => "!=",
            EOp::BitAnd => "&",
            EOp::BitXor => "^",
            EOp::BitOr => "|",
            EOp::UnaryMinus => "-",
            EOp::UnaryPlus => "+",
            EOp::Not => "!",
            EOp::BitNot => "~",
            _ => "?",
        }
    }
}

pub(crate) struct ExprInstr {
    pub op: EOp,
    pub value: Value,
    pub skip: usize,
}

pub(crate) struct ExprProgram {
    pub instrs: Vec<ExprInstr>,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

enum ExprTok {
    Operand(EOp, Value),
    Open,
    Close,
    Unary(EOp),
    Binary(EOp, u8, bool),
    Ternary,
    Colon,
    Func(MathFn),
}

const PREC_TERNARY: u8 = 1;

fn binary_by_symbol(sym: &str) -> Option<(EOp, u8, bool)> {
    Some(match sym {
        "|" => (EOp::BitOr, 4, false),
        "^" => (EOp::BitXor, 4, false),
        "&" => (EOp::BitAnd, 4, false),
        "in" => (EOp::In, 5, false),
        "ni" => (EOp::NotIn, 5, false),
        "eq" => (EOp::StrEq, 6, false),
        "ne" => (EOp::StrNe, 6, false),
        "==" => (EOp::NumEq, 7, false),
        "!=" => (EOp::NumNe, 7, false),
        "<=" => (EOp::Le, 8, false),
        ">=" => (EOp::Ge, 8, false),
        "<" => (EOp::Lt, 8, false),
        ">" => (EOp::Gt, 8, false),
        "<<<" => (EOp::Rotl, 9, false),
        ">>>" => (EOp::Rotr, 9, false),
        "<<" => (EOp::Shl, 9, false),
        ">>" => (EOp::Shr, 9, false),
        "+" => (EOp::Add, 10, false),
        "-" => (EOp::Sub, 10, false),
        "**" => (EOp::Pow, 12, true),
        "*" => (EOp::Mul, 11, false),
        "/" => (EOp::Div, 11, false),
        "%" => (EOp::Mod, 11, false),
        _ => return None,
    })
}

fn lex_expr(interp: &mut Interp, src: &str) -> Result<Vec<ExprTok>, String> {
    let mut toks = Vec::new();
    let mut p = Parser::new(src, 1);
    let bytes = src.as_bytes();
    let mut expect_operand = true;
    while p.pos < bytes.len() {
        let c = bytes[p.pos];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                p.pos += 1;
                continue;
            }
            b'(' => {
                p.pos += 1;
                toks.push(ExprTok::Open);
                expect_operand = true;
            }
            b')' => {
                p.pos += 1;
                toks.push(ExprTok::Close);
                expect_operand = false;
            }
            b'$' => {
                let tok = p.parse_var();
                let (kind, op) = match tok.kind {
                    RawKind::DictSugar => (tok, EOp::DictSugar),
                    RawKind::Var => (tok, EOp::Var),
                    // A bare dollar is not a valid operand here.
                    _ => return Err("invalid dollar sign".to_string()),
                };
                let value = expr_operand_value(interp, op, kind.text);
                toks.push(ExprTok::Operand(op, value));
                expect_operand = false;
            }
            b'[' => {
                let tok = p.parse_cmd();
                if p.missing.is_some() {
                    return Err("missing close-bracket".to_string());
                }
                let value = interp.new_string(tok.text);
                toks.push(ExprTok::Operand(EOp::Cmd, value));
                expect_operand = false;
            }
            b'{' => {
                let tok = p.parse_brace();
                if p.missing.is_some() {
                    return Err("missing close-brace".to_string());
                }
                let value = interp.new_string(tok.text);
                toks.push(ExprTok::Operand(EOp::PushStr, value));
                expect_operand = false;
            }
            b'"' => {
                let (body, end) = scan_quoted(src, p.pos)?;
                p.pos = end;
                if body.contains(['$', '[']) {
                    let value = interp.new_string(&body);
                    toks.push(ExprTok::Operand(EOp::Esc, value));
                } else {
                    let value = interp.new_string(&unescape(&body));
                    toks.push(ExprTok::Operand(EOp::PushStr, value));
                }
                expect_operand = false;
            }
            b'0'..=b'9' => {
                let (tok, end) = scan_number(interp, src, p.pos)?;
                p.pos = end;
                toks.push(tok);
                expect_operand = false;
            }
            b'.' if p.pos + 1 < bytes.len() && bytes[p.pos + 1].is_ascii_digit() => {
                let (tok, end) = scan_number(interp, src, p.pos)?;
                p.pos = end;
                toks.push(tok);
                expect_operand = false;
            }
            b'?' => {
                p.pos += 1;
                toks.push(ExprTok::Ternary);
                expect_operand = true;
            }
            b':' => {
                p.pos += 1;
                toks.push(ExprTok::Colon);
                expect_operand = true;
            }
            _ if c.is_ascii_alphabetic() || c == b'_' => {
                let start = p.pos;
                while p.pos < bytes.len()
                    && (bytes[p.pos].is_ascii_alphanumeric() || bytes[p.pos] == b'_')
                {
                    p.pos += 1;
                }
                let ident = &src[start..p.pos];
                if let Some((op, prec, right)) = binary_by_symbol(ident) {
                    toks.push(ExprTok::Binary(op, prec, right));
                    expect_operand = true;
                } else if let Some(f) = math_fn_by_name(ident) {
                    toks.push(ExprTok::Func(f));
                    expect_operand = true;
                } else if let Some(b) = parse_boolean(ident) {
                    let value = interp.new_int(i64::from(b));
                    toks.push(ExprTok::Operand(EOp::PushInt, value));
                    expect_operand = false;
                } else if ident.eq_ignore_ascii_case("inf") {
                    let value = interp.new_double(f64::INFINITY);
                    toks.push(ExprTok::Operand(EOp::PushDouble, value));
                    expect_operand = false;
                } else if ident.eq_ignore_ascii_case("nan") {
                    let value = interp.new_double(f64::NAN);
                    toks.push(ExprTok::Operand(EOp::PushDouble, value));
                    expect_operand = false;
                } else {
                    return Err(format!("invalid bareword \"{}\"", ident));
                }
            }
            _ => {
                if expect_operand {
                    let unary = match c {
                        b'-' => Some(EOp::UnaryMinus),
                        b'+' => Some(EOp::UnaryPlus),
                        b'!' => Some(EOp::Not),
                        b'~' => Some(EOp::BitNot),
                        _ => None,
                    };
                    if let Some(op) = unary {
                        p.pos += 1;
                        toks.push(ExprTok::Unary(op));
                        continue;
                    }
                    return Err(format!("unexpected character \"{}\"", c as char));
                }
                let rest = &src[p.pos..];
                let mut matched = None;
                for sym in [
                    "<<<", ">>>", "**", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+",
                    "-", "*", "/", "%", "<", ">", "&", "^", "|",
                ] {
                    if rest.starts_with(sym) {
                        matched = Some(sym);
                        break;
                    }
                }
                let Some(sym) = matched else {
                    return Err(format!("unexpected character \"{}\"", c as char));
                };
                p.pos += sym.len();
                match sym {
                    "&&" => toks.push(ExprTok::Binary(EOp::AndLeft, 3, false)),
                    "||" => toks.push(ExprTok::Binary(EOp::OrLeft, 2, false)),
                    _ => {
                        let (op, prec, right) = binary_by_symbol(sym).unwrap();
                        toks.push(ExprTok::Binary(op, prec, right));
                    }
                }
                expect_operand = true;
            }
        }
    }
    Ok(toks)
}

fn expr_operand_value(interp: &mut Interp, op: EOp, text: &str) -> Value {
    if op == EOp::DictSugar {
        let open = text.find('(').unwrap_or(text.len());
        let var = interp.new_string(&text[..open]);
        let key = interp.new_string(text.get(open + 1..text.len() - 1).unwrap_or_default());
        interp.new_value(Some(Rc::from(text)), Repr::DictSugar { var, key })
    } else {
        interp.new_string(text)
    }
}

fn scan_quoted(src: &str, open: usize) -> Result<(String, usize), String> {
    let bytes = src.as_bytes();
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => i += 2,
            b'"' => return Ok((src[open + 1..i].to_string(), i + 1)),
            _ => i += 1,
        }
    }
    Err("missing quote".to_string())
}

fn scan_number(interp: &mut Interp, src: &str, start: usize) -> Result<(ExprTok, usize), String> {
    let bytes = src.as_bytes();
    let mut i = start;
    let mut is_double = false;
    if src[start..].starts_with("0x") || src[start..].starts_with("0X") {
        i += 2;
        while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
            i += 1;
        }
    } else {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'.' {
            is_double = true;
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
        if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
            let mut j = i + 1;
            if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                j += 1;
            }
            if j < bytes.len() && bytes[j].is_ascii_digit() {
                is_double = true;
                i = j;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
        }
    }
    let text = &src[start..i];
    if is_double {
        let d = parse_double(text).ok_or_else(|| format!("bad double literal \"{}\"", text))?;
        let value = interp.new_value(Some(Rc::from(text)), Repr::Double(d));
        Ok((ExprTok::Operand(EOp::PushDouble, value), i))
    } else {
        let n = parse_int(text).ok_or_else(|| format!("bad integer literal \"{}\"", text))?;
        let value = interp.new_value(Some(Rc::from(text)), Repr::Int(n));
        Ok((ExprTok::Operand(EOp::PushInt, value), i))
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

enum StackItem {
    Paren,
    Func(MathFn),
    Op {
        op: EOp,
        prec: u8,
        right_assoc: bool,
        /// Index of the emitted lazy-left placeholder for `&&`/`||`/`?`/`:`.
        patch: usize,
    },
}

struct ExprCompiler<'i> {
    interp: &'i mut Interp,
    instrs: Vec<ExprInstr>,
    stack: Vec<StackItem>,
}

impl<'i> ExprCompiler<'i> {
    fn emit(&mut self, op: EOp) -> usize {
        let idx = self.instrs.len();
        self.instrs.push(ExprInstr {
            op,
            value: self.interp.empty(),
            skip: 0,
        });
        idx
    }

    fn pop_emit(&mut self) -> Result<(), String> {
        match self.stack.pop().expect("operator stack underflow") {
            StackItem::Paren => Err("unbalanced parentheses".to_string()),
            StackItem::Func(_) => Err("missing function argument".to_string()),
            StackItem::Op { op, patch, .. } => match op {
                EOp::AndLeft => {
                    let right = self.emit(EOp::AndRight);
                    self.instrs[patch].skip = right - patch;
                    Ok(())
                }
                EOp::OrLeft => {
                    let right = self.emit(EOp::OrRight);
                    self.instrs[patch].skip = right - patch;
                    Ok(())
                }
                EOp::TernaryLeft => Err("missing \":\" in ternary".to_string()),
                EOp::ColonLeft => {
                    // Jump over the whole false branch once the true branch
                    // has produced its value.
                    self.instrs[patch].skip = self.instrs.len() - patch - 1;
                    Ok(())
                }
                other => {
                    self.emit(other);
                    Ok(())
                }
            },
        }
    }

    fn flush_precedence(&mut self, prec: u8, right_assoc: bool) -> Result<(), String> {
        loop {
            let pop = match self.stack.last() {
                Some(StackItem::Op { prec: top_prec, .. }) => {
                    *top_prec > prec || (*top_prec == prec && !right_assoc)
                }
                _ => false,
            };
            if !pop {
                break;
            }
            self.pop_emit()?;
        }
        Ok(())
    }

    fn push_binary(&mut self, op: EOp, prec: u8, right_assoc: bool) -> Result<(), String> {
        self.flush_precedence(prec, right_assoc)?;
        let patch = match op {
            EOp::AndLeft => self.emit(EOp::AndLeft),
            EOp::OrLeft => self.emit(EOp::OrLeft),
            _ => 0,
        };
        self.stack.push(StackItem::Op {
            op,
            prec,
            right_assoc,
            patch,
        });
        Ok(())
    }

    fn push_ternary(&mut self) -> Result<(), String> {
        self.flush_precedence(PREC_TERNARY, true)?;
        let patch = self.emit(EOp::TernaryLeft);
        self.stack.push(StackItem::Op {
            op: EOp::TernaryLeft,
            prec: PREC_TERNARY,
            right_assoc: true,
            patch,
        });
        Ok(())
    }

    fn push_colon(&mut self) -> Result<(), String> {
        // Close any completed inner ternary (its colon entry) first, but stop
        // at the matching `?` itself.
        loop {
            let pop = match self.stack.last() {
                Some(StackItem::Op { op, prec, .. }) => {
                    *prec > PREC_TERNARY || (*prec == PREC_TERNARY && *op == EOp::ColonLeft)
                }
                _ => false,
            };
            if !pop {
                break;
            }
            self.pop_emit()?;
        }
        let Some(StackItem::Op {
            op: EOp::TernaryLeft,
            patch: ternary_patch,
            ..
        }) = self.stack.pop()
        else {
            return Err("unexpected \":\"".to_string());
        };
        let colon_patch = self.emit(EOp::ColonLeft);
        // A false condition jumps to the first instruction of the false
        // branch, just past the colon marker.
        self.instrs[ternary_patch].skip = colon_patch - ternary_patch;
        self.stack.push(StackItem::Op {
            op: EOp::ColonLeft,
            prec: PREC_TERNARY,
            right_assoc: true,
            patch: colon_patch,
        });
        Ok(())
    }
}

/// Compile expression source into a program.
fn compile_expr(interp: &mut Interp, src: &str) -> Result<ExprProgram, String> {
    let toks = lex_expr(interp, src)?;
    if toks.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut c = ExprCompiler {
        interp,
        instrs: Vec::new(),
        stack: Vec::new(),
    };
    for tok in toks {
        match tok {
            ExprTok::Operand(op, value) => {
                c.instrs.push(ExprInstr {
                    op,
                    value,
                    skip: 0,
                });
            }
            ExprTok::Open => c.stack.push(StackItem::Paren),
            ExprTok::Close => {
                loop {
                    match c.stack.last() {
                        None => return Err("unbalanced parentheses".to_string()),
                        Some(StackItem::Paren) => {
                            c.stack.pop();
                            break;
                        }
                        Some(_) => {}
                    }
                    c.pop_emit()?;
                }
                if matches!(c.stack.last(), Some(StackItem::Func(_))) {
                    if let Some(StackItem::Func(f)) = c.stack.pop() {
                        c.emit(EOp::Fn(f));
                    }
                }
            }
            ExprTok::Unary(op) => {
                c.stack.push(StackItem::Op {
                    op,
                    prec: 13,
                    right_assoc: true,
                    patch: 0,
                });
            }
            ExprTok::Binary(op, prec, right) => c.push_binary(op, prec, right)?,
            ExprTok::Ternary => c.push_ternary()?,
            ExprTok::Colon => c.push_colon()?,
            ExprTok::Func(f) => c.stack.push(StackItem::Func(f)),
        }
    }
    while !c.stack.is_empty() {
        c.pop_emit()?;
    }

    // Post-condition: the net stack effect must be exactly one value.
    let mut effect: i64 = 0;
    for instr in &c.instrs {
        effect += match instr.op {
            op if op.operand() => 1,
            EOp::Not | EOp::BitNot | EOp::UnaryMinus | EOp::UnaryPlus | EOp::Fn(_) => 0,
            EOp::AndRight | EOp::OrRight => 0,
            EOp::AndLeft | EOp::OrLeft | EOp::TernaryLeft | EOp::ColonLeft => -1,
            _ => -1,
        };
    }
    if effect != 1 {
        return Err("invalid expression".to_string());
    }
    Ok(ExprProgram { instrs: c.instrs })
}

pub(crate) fn get_expr_program(
    interp: &mut Interp,
    v: &Value,
) -> Result<Rc<ExprProgram>, Flow> {
    if let Repr::Expr(p) = &*v.cell.repr.borrow() {
        return Ok(Rc::clone(p));
    }
    let s = v.as_string();
    match compile_expr(interp, &s) {
        Ok(prog) => {
            let prog = Rc::new(prog);
            v.set_repr(Repr::Expr(Rc::clone(&prog)));
            Ok(prog)
        }
        Err(msg) => Err(interp.error(format!("syntax error in expression \"{}\": {}", s, msg))),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval_operand(interp: &mut Interp, instr: &ExprInstr) -> Result<Value, Flow> {
    match instr.op {
        EOp::PushInt | EOp::PushDouble | EOp::PushStr => Ok(instr.value.clone()),
        EOp::Var => interp.get_var_value(&instr.value),
        EOp::DictSugar => interp.read_dict_sugar(&instr.value),
        EOp::Cmd => interp.eval_script(&instr.value),
        EOp::Esc => subst(interp, &instr.value, SubstFlags::default()),
        _ => unreachable!("not an operand opcode"),
    }
}

/// Non-erroring integer probe. Values with a double representation never
/// take the integer path, even when their string rep would parse.
fn try_int(v: &Value) -> Option<i64> {
    if let Some(i) = v.int_repr() {
        return Some(i);
    }
    if v.double_repr().is_some() {
        return None;
    }
    let s = v.as_string();
    let i = parse_int(&s)?;
    v.set_repr(Repr::Int(i));
    Some(i)
}

fn try_num(v: &Value) -> Option<f64> {
    if let Some(d) = v.double_repr() {
        return Some(d);
    }
    if let Some(i) = v.int_repr() {
        v.set_repr(Repr::CoercedDouble(i));
        return Some(i as f64);
    }
    let s = v.as_string();
    if let Some(i) = parse_int(&s) {
        v.set_repr(Repr::CoercedDouble(i));
        return Some(i as f64);
    }
    let d = parse_double(&s)?;
    v.set_repr(Repr::Double(d));
    Some(d)
}

/// Floor division: the quotient rounds toward negative infinity so the
/// remainder takes the sign of the divisor.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

fn int_pow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return match base {
            1 => 1,
            -1 => {
                if exp % 2 == 0 {
                    1
                } else {
                    -1
                }
            }
            _ => 0,
        };
    }
    let mut result: i64 = 1;
    let mut base = base;
    let mut exp = exp as u64;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    result
}

fn non_numeric_error(interp: &mut Interp, op: EOp, a: &Value, b: &Value) -> Flow {
    let offender = if try_num(a).is_none() { a } else { b };
    interp.error(format!(
        "can't use non-numeric string as operand of \"{}\": \"{}\"",
        op.display_name(),
        offender.as_string()
    ))
}

fn apply_binary(interp: &mut Interp, op: EOp, a: &Value, b: &Value) -> Result<Value, Flow> {
    match op {
        // Integer-only operators.
        EOp::Mod
        | EOp::Shl
        | EOp::Shr
        | EOp::Rotl
        | EOp::Rotr
        | EOp::BitAnd
        | EOp::BitXor
        | EOp::BitOr => {
            let (Some(x), Some(y)) = (try_int(a), try_int(b)) else {
                if try_num(a).is_some() && try_num(b).is_some() {
                    return Err(interp.error(format!(
                        "can't use floating-point value as operand of \"{}\"",
                        op.display_name()
                    )));
                }
                return Err(non_numeric_error(interp, op, a, b));
            };
            let r = match op {
                EOp::Mod => {
                    if y == 0 {
                        return Err(interp.error("Division by zero"));
                    }
                    floor_mod(x, y)
                }
                EOp::Shl => x.wrapping_shl((y & 63) as u32),
                EOp::Shr => x.wrapping_shr((y & 63) as u32),
                EOp::Rotl => (x as u64).rotate_left((y & 63) as u32) as i64,
                EOp::Rotr => (x as u64).rotate_right((y & 63) as u32) as i64,
                EOp::BitAnd => x & y,
                EOp::BitXor => x ^ y,
                EOp::BitOr => x | y,
                _ => unreachable!(),
            };
            Ok(interp.new_int(r))
        }
        // Arithmetic with integer preference.
        EOp::Add | EOp::Sub | EOp::Mul | EOp::Div | EOp::Pow => {
            if let (Some(x), Some(y)) = (try_int(a), try_int(b)) {
                let r = match op {
                    EOp::Add => x.wrapping_add(y),
                    EOp::Sub => x.wrapping_sub(y),
                    EOp::Mul => x.wrapping_mul(y),
                    EOp::Div => {
                        if y == 0 {
                            return Err(interp.error("Division by zero"));
                        }
                        floor_div(x, y)
                    }
                    EOp::Pow => int_pow(x, y),
                    _ => unreachable!(),
                };
                return Ok(interp.new_int(r));
            }
            let (Some(x), Some(y)) = (try_num(a), try_num(b)) else {
                return Err(non_numeric_error(interp, op, a, b));
            };
            let r = match op {
                EOp::Add => x + y,
                EOp::Sub => x - y,
                EOp::Mul => x * y,
                // Double division by zero yields signed infinity, not an
                // error.
                EOp::Div => x / y,
                EOp::Pow => x.powf(y),
                _ => unreachable!(),
            };
            Ok(interp.new_double(r))
        }
        // Ordering comparisons: numeric when possible, bytes otherwise.
        EOp::Lt | EOp::Gt | EOp::Le | EOp::Ge => {
            let ord = if let (Some(x), Some(y)) = (try_int(a), try_int(b)) {
                x.cmp(&y)
            } else if let (Some(x), Some(y)) = (try_num(a), try_num(b)) {
                x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Greater)
            } else {
                a.as_string().cmp(&b.as_string())
            };
            let r = match op {
                EOp::Lt => ord.is_lt(),
                EOp::Gt => ord.is_gt(),
                EOp::Le => ord.is_le(),
                EOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            Ok(interp.new_bool(r))
        }
        EOp::NumEq | EOp::NumNe => {
            let equal = if let (Some(x), Some(y)) = (try_int(a), try_int(b)) {
                x == y
            } else if let (Some(x), Some(y)) = (try_num(a), try_num(b)) {
                x == y
            } else {
                return Err(non_numeric_error(interp, op, a, b));
            };
            Ok(interp.new_bool(equal == (op == EOp::NumEq)))
        }
        EOp::StrEq => Ok({
            let r = a.string_eq(b);
            interp.new_bool(r)
        }),
        EOp::StrNe => Ok({
            let r = !a.string_eq(b);
            interp.new_bool(r)
        }),
        EOp::In | EOp::NotIn => {
            let items = interp.get_list(b)?;
            let found = items.iter().any(|item| item.string_eq(a));
            Ok(interp.new_bool(found == (op == EOp::In)))
        }
        _ => unreachable!("not a binary opcode"),
    }
}

fn apply_unary(interp: &mut Interp, op: EOp, v: &Value) -> Result<Value, Flow> {
    match op {
        EOp::Not => {
            let b = interp.get_bool(v)?;
            Ok(interp.new_bool(!b))
        }
        EOp::BitNot => {
            let i = interp.get_int(v)?;
            Ok(interp.new_int(!i))
        }
        EOp::UnaryMinus => {
            if let Some(i) = try_int(v) {
                return Ok(interp.new_int(i.wrapping_neg()));
            }
            let d = interp.get_double(v)?;
            Ok(interp.new_double(-d))
        }
        EOp::UnaryPlus => {
            if try_int(v).is_some() || try_num(v).is_some() {
                return Ok(v.clone());
            }
            Err(interp.error(format!(
                "can't use non-numeric string as operand of \"+\": \"{}\"",
                v.as_string()
            )))
        }
        _ => unreachable!("not a unary opcode"),
    }
}

fn apply_math_fn(interp: &mut Interp, f: MathFn, v: &Value) -> Result<Value, Flow> {
    match f {
        MathFn::Int => {
            if let Some(i) = try_int(v) {
                return Ok(interp.new_int(i));
            }
            let d = interp.get_double(v)?;
            Ok(interp.new_int(d as i64))
        }
        MathFn::Double => {
            let d = interp.get_double(v)?;
            Ok(interp.new_double(d))
        }
        MathFn::Abs => {
            if let Some(i) = try_int(v) {
                return Ok(interp.new_int(i.wrapping_abs()));
            }
            let d = interp.get_double(v)?;
            Ok(interp.new_double(d.abs()))
        }
        MathFn::Round => {
            if let Some(i) = try_int(v) {
                return Ok(interp.new_int(i));
            }
            let d = interp.get_double(v)?;
            Ok(interp.new_int(d.round() as i64))
        }
        _ => {
            let d = interp.get_double(v)?;
            let r = match f {
                MathFn::Sin => d.sin(),
                MathFn::Cos => d.cos(),
                MathFn::Tan => d.tan(),
                MathFn::Asin => d.asin(),
                MathFn::Acos => d.acos(),
                MathFn::Atan => d.atan(),
                MathFn::Sinh => d.sinh(),
                MathFn::Cosh => d.cosh(),
                MathFn::Tanh => d.tanh(),
                MathFn::Ceil => d.ceil(),
                MathFn::Floor => d.floor(),
                MathFn::Exp => d.exp(),
                MathFn::Log => d.ln(),
                MathFn::Log10 => d.log10(),
                MathFn::Sqrt => d.sqrt(),
                _ => unreachable!(),
            };
            Ok(interp.new_double(r))
        }
    }
}

/// Evaluate an expression value, shimmering it to a compiled program.
pub(crate) fn eval_expr(interp: &mut Interp, expr: &Value) -> Result<Value, Flow> {
    let prog = get_expr_program(interp, expr)?;
    // Short-expression fast paths: constants, `$var`, `!$var`, and the
    // `$var <rel> operand` shape of loop conditions never build a stack.
    match prog.instrs.as_slice() {
        [single] if single.op.operand() => return eval_operand(interp, single),
        [operand, not] if not.op == EOp::Not && operand.op.operand() => {
            let v = eval_operand(interp, operand)?;
            return apply_unary(interp, EOp::Not, &v);
        }
        [a, b, rel]
            if a.op.operand()
                && b.op.operand()
                && matches!(
                    rel.op,
                    EOp::Lt | EOp::Gt | EOp::Le | EOp::Ge | EOp::NumEq | EOp::NumNe
                ) =>
        {
            let x = eval_operand(interp, a)?;
            let y = eval_operand(interp, b)?;
            return apply_binary(interp, rel.op, &x, &y);
        }
        _ => {}
    }
    run_vm(interp, &prog)
}

/// Evaluate an expression and read the result as a boolean.
pub(crate) fn eval_expr_bool(interp: &mut Interp, expr: &Value) -> Result<bool, Flow> {
    let v = eval_expr(interp, expr)?;
    interp.get_bool(&v)
}

fn run_vm(interp: &mut Interp, prog: &ExprProgram) -> Result<Value, Flow> {
    let mut stack: Vec<Value> = Vec::new();
    let mut ip = 0usize;
    while ip < prog.instrs.len() {
        let instr = &prog.instrs[ip];
        ip += 1;
        match instr.op {
            op if op.operand() => {
                let v = eval_operand(interp, instr)?;
                stack.push(v);
            }
            EOp::Not | EOp::BitNot | EOp::UnaryMinus | EOp::UnaryPlus => {
                let v = stack.pop().expect("expression stack underflow");
                let r = apply_unary(interp, instr.op, &v)?;
                stack.push(r);
            }
            EOp::Fn(f) => {
                let v = stack.pop().expect("expression stack underflow");
                let r = apply_math_fn(interp, f, &v)?;
                stack.push(r);
            }
            EOp::AndLeft => {
                let v = stack.pop().expect("expression stack underflow");
                if !interp.get_bool(&v)? {
                    stack.push(interp.new_bool(false));
                    ip += instr.skip;
                }
            }
            EOp::OrLeft => {
                let v = stack.pop().expect("expression stack underflow");
                if interp.get_bool(&v)? {
                    stack.push(interp.new_bool(true));
                    ip += instr.skip;
                }
            }
            EOp::AndRight | EOp::OrRight => {
                let v = stack.pop().expect("expression stack underflow");
                let b = interp.get_bool(&v)?;
                stack.push(interp.new_bool(b));
            }
            EOp::TernaryLeft => {
                let v = stack.pop().expect("expression stack underflow");
                if !interp.get_bool(&v)? {
                    ip += instr.skip;
                }
            }
            EOp::ColonLeft => {
                ip += instr.skip;
            }
            op => {
                let b = stack.pop().expect("expression stack underflow");
                let a = stack.pop().expect("expression stack underflow");
                let r = apply_binary(interp, op, &a, &b)?;
                stack.push(r);
            }
        }
    }
    Ok(stack.pop().unwrap_or_else(|| interp.empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::Interp;
    use pretty_assertions::assert_eq;

    fn eval(interp: &mut Interp, src: &str) -> String {
        let v = interp.new_string(src);
        let r = eval_expr(interp, &v).map(|v| v.as_string().to_string());
        match r {
            Ok(s) => s,
            Err(_) => format!("ERR:{}", interp.result),
        }
    }

    #[test]
    fn test_precedence() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "1+2*3"), "7");
        assert_eq!(eval(&mut interp, "(1+2)*3"), "9");
        assert_eq!(eval(&mut interp, "2**3**2"), "512");
        assert_eq!(eval(&mut interp, "10-2-3"), "5");
        assert_eq!(eval(&mut interp, "1 < 2 == 1"), "1");
    }

    #[test]
    fn test_unary_operators() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "-3 + 1"), "-2");
        assert_eq!(eval(&mut interp, "--3"), "3");
        assert_eq!(eval(&mut interp, "!0"), "1");
        assert_eq!(eval(&mut interp, "~0"), "-1");
        assert_eq!(eval(&mut interp, "4 * -2"), "-8");
    }

    #[test]
    fn test_division_and_modulo_signs() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "-7 / 2"), "-4");
        assert_eq!(eval(&mut interp, "-7 % 2"), "1");
        assert_eq!(eval(&mut interp, "7 % -2"), "-1");
        assert_eq!(eval(&mut interp, "7 / 2"), "3");
    }

    #[test]
    fn test_integer_division_by_zero_errors() {
        let mut interp = Interp::new();
        assert!(eval(&mut interp, "1 / 0").starts_with("ERR:"));
        assert!(eval(&mut interp, "1 % 0").starts_with("ERR:"));
    }

    #[test]
    fn test_double_division_by_zero_is_inf() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "1 / 0.0"), "Inf");
        assert_eq!(eval(&mut interp, "-1 / 0.0"), "-Inf");
    }

    #[test]
    fn test_int_double_dispatch() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "1 + 2"), "3");
        assert_eq!(eval(&mut interp, "1 + 2.5"), "3.5");
        assert_eq!(eval(&mut interp, "10 / 4"), "2");
        assert_eq!(eval(&mut interp, "10 / 4.0"), "2.5");
    }

    #[test]
    fn test_string_comparisons() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "{abc} eq {abc}"), "1");
        assert_eq!(eval(&mut interp, "{abc} ne {abd}"), "1");
        assert_eq!(eval(&mut interp, "{abc} < {abd}"), "1");
        assert_eq!(eval(&mut interp, "{b} in {a b c}"), "1");
        assert_eq!(eval(&mut interp, "{d} ni {a b c}"), "1");
    }

    #[test]
    fn test_short_circuit_layout() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "0 && 1"), "0");
        assert_eq!(eval(&mut interp, "1 && 2"), "1");
        assert_eq!(eval(&mut interp, "0 || 0"), "0");
        assert_eq!(eval(&mut interp, "0 || 3"), "1");
        // Mixed precedence: && binds tighter than ||.
        assert_eq!(eval(&mut interp, "1 || 0 && 0"), "1");
    }

    #[test]
    fn test_ternary() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "1 ? 10 : 20"), "10");
        assert_eq!(eval(&mut interp, "0 ? 10 : 20"), "20");
        assert_eq!(eval(&mut interp, "1 ? 0 ? 1 : 2 : 3"), "2");
        assert_eq!(eval(&mut interp, "0 ? 1 : 0 ? 2 : 3"), "3");
    }

    #[test]
    fn test_math_functions() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "int(2.9)"), "2");
        assert_eq!(eval(&mut interp, "round(2.5)"), "3");
        assert_eq!(eval(&mut interp, "abs(-4)"), "4");
        assert_eq!(eval(&mut interp, "sqrt(16)"), "4.0");
        assert_eq!(eval(&mut interp, "double(2)"), "2.0");
    }

    #[test]
    fn test_rotates() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "1 <<< 1"), "2");
        assert_eq!(eval(&mut interp, "1 >>> 1"), i64::MIN.to_string());
    }

    #[test]
    fn test_booleans_and_inf() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "true && yes"), "1");
        assert_eq!(eval(&mut interp, "false || off"), "0");
        assert_eq!(eval(&mut interp, "Inf > 1e300"), "1");
    }

    #[test]
    fn test_bad_expressions() {
        let mut interp = Interp::new();
        assert!(eval(&mut interp, "1 +").starts_with("ERR:"));
        assert!(eval(&mut interp, "(1").starts_with("ERR:"));
        assert!(eval(&mut interp, "1 ? 2").starts_with("ERR:"));
        assert!(eval(&mut interp, "foo").starts_with("ERR:"));
    }

    #[test]
    fn test_variables_in_expressions() {
        let mut interp = Interp::new();
        interp.eval("set a 6; set b 7").unwrap();
        assert_eq!(eval(&mut interp, "$a * $b"), "42");
        assert_eq!(eval(&mut interp, "$a < $b"), "1");
    }

    #[test]
    fn test_coerced_double_keeps_exactness() {
        let mut interp = Interp::new();
        let v = interp.new_string("5");
        assert_eq!(interp.get_double(&v).ok(), Some(5.0));
        // Reading the same value as an integer afterwards stays exact.
        assert_eq!(interp.get_int(&v).ok(), Some(5));
    }
}
