//! Compiled scripts and the substitution engine.
//!
//! A script compiles once into a [`ScriptProgram`]: a flat token vector plus
//! a command-structure sidecar describing argument counts. The evaluator
//! walks the sidecar instead of re-parsing source text. Programs are
//! immutable and shared behind `Rc`; the evaluator clones the `Rc` before
//! walking so that a re-compile triggered by shimmering of the source value
//! cannot free the program currently being executed.
//!
//! The command-structure layout is `[argc] [ntok...] [argc] [ntok...] ...`:
//! one argc per command followed by one token count per argument. A negative
//! argc flags a command containing an expansion argument; a negative token
//! count flags the argument itself as a list to splice into the argument
//! vector.

use std::rc::Rc;

use crate::interp::{Flow, Interp};
use crate::parser::{unescape, Parser, RawKind, RawToken, SubstFlags};
use crate::value::{Repr, Value};

/// Compiled token kinds. Escape-bearing words are decoded at compile time,
/// so literal text is always `Word` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokKind {
    Word,
    Var,
    DictSugar,
    Cmd,
    Sep,
    Eol,
}

pub(crate) struct ScriptToken {
    pub kind: TokKind,
    pub value: Value,
    pub line: u32,
}

pub(crate) struct ScriptProgram {
    pub tokens: Vec<ScriptToken>,
    pub cmds: Vec<i32>,
    pub file: Rc<str>,
    pub line: u32,
}

impl ScriptProgram {
    /// Number of commands encoded in the sidecar.
    #[cfg(test)]
    pub fn command_count(&self) -> usize {
        let mut n = 0;
        let mut i = 0;
        while i < self.cmds.len() {
            let argc = self.cmds[i].unsigned_abs() as usize;
            i += 1 + argc;
            n += 1;
        }
        n
    }
}

/// Compile script source into a program.
///
/// `file` and `first_line` locate the source for diagnostics; every token
/// carries its own line so errors point at the failing command.
pub(crate) fn compile_script(
    interp: &mut Interp,
    src: &str,
    file: Rc<str>,
    first_line: u32,
) -> Result<ScriptProgram, Flow> {
    let mut parser = Parser::new(src, first_line);
    let mut raw: Vec<RawToken> = Vec::new();
    loop {
        let tok = parser.next_token();
        if tok.kind == RawKind::Eof {
            break;
        }
        raw.push(tok);
    }
    if let Some((opener, line)) = parser.missing {
        let what = match opener {
            '{' => "missing close-brace",
            '"' => "missing quote",
            _ => "missing close-bracket",
        };
        return Err(interp.error_at(&file, line, what.to_string()));
    }

    let mut program = ScriptProgram {
        tokens: Vec::new(),
        cmds: Vec::new(),
        file: Rc::clone(&file),
        line: first_line,
    };
    let mut words: Vec<Vec<RawToken>> = Vec::new();
    let mut word: Vec<RawToken> = Vec::new();

    for tok in raw {
        match tok.kind {
            RawKind::Sep => {
                if !word.is_empty() {
                    words.push(std::mem::take(&mut word));
                }
            }
            RawKind::Eol => {
                if !word.is_empty() {
                    words.push(std::mem::take(&mut word));
                }
                flush_command(interp, &mut program, &mut words);
            }
            _ => word.push(tok),
        }
    }
    if !word.is_empty() {
        words.push(word);
    }
    flush_command(interp, &mut program, &mut words);
    Ok(program)
}

fn is_expand_marker(tok: &RawToken) -> bool {
    tok.braced && (tok.text == "*" || tok.text == "expand")
}

fn flush_command(interp: &mut Interp, program: &mut ScriptProgram, words: &mut Vec<Vec<RawToken>>) {
    if words.is_empty() {
        return;
    }
    let expansions: Vec<bool> = words
        .iter()
        .map(|w| w.len() >= 2 && is_expand_marker(&w[0]))
        .collect();
    let argc = words.len() as i32;
    program
        .cmds
        .push(if expansions.contains(&true) { -argc } else { argc });
    for (word, &expand) in words.iter().zip(&expansions) {
        let ntok = (word.len() - usize::from(expand)) as i32;
        program.cmds.push(if expand { -ntok } else { ntok });
    }

    let last = words.len() - 1;
    for (wi, word) in words.iter().enumerate() {
        for tok in word.iter().skip(usize::from(expansions[wi])) {
            let compiled = compile_token(interp, tok, &program.file);
            program.tokens.push(compiled);
        }
        let sep_kind = if wi == last { TokKind::Eol } else { TokKind::Sep };
        program.tokens.push(ScriptToken {
            kind: sep_kind,
            value: interp.empty(),
            line: word.last().map_or(program.line, |t| t.line),
        });
    }
    words.clear();
}

fn compile_token(interp: &mut Interp, tok: &RawToken, file: &Rc<str>) -> ScriptToken {
    match tok.kind {
        RawKind::Str => ScriptToken {
            kind: TokKind::Word,
            value: interp.new_sourced_string(tok.text, file, tok.line),
            line: tok.line,
        },
        RawKind::Esc => ScriptToken {
            kind: TokKind::Word,
            value: interp.new_sourced_string(&unescape(tok.text), file, tok.line),
            line: tok.line,
        },
        RawKind::Var => ScriptToken {
            kind: TokKind::Var,
            value: interp.new_string(tok.text),
            line: tok.line,
        },
        RawKind::DictSugar => {
            let open = tok.text.find('(').unwrap_or(tok.text.len());
            let name = &tok.text[..open];
            let key = tok
                .text
                .get(open + 1..tok.text.len() - 1)
                .unwrap_or_default();
            let var = interp.new_string(name);
            let key = interp.new_string(key);
            let value = interp.new_value(
                Some(Rc::from(tok.text)),
                Repr::DictSugar { var, key },
            );
            ScriptToken {
                kind: TokKind::DictSugar,
                value,
                line: tok.line,
            }
        }
        RawKind::Cmd => ScriptToken {
            kind: TokKind::Cmd,
            value: interp.new_sourced_string(tok.text, file, tok.line),
            line: tok.line,
        },
        RawKind::Sep | RawKind::Eol | RawKind::Eof => ScriptToken {
            kind: TokKind::Sep,
            value: interp.empty(),
            line: tok.line,
        },
    }
}

// ---------------------------------------------------------------------------
// Token interpolation
// ---------------------------------------------------------------------------

/// Produce the value of a single compiled token.
pub(crate) fn eval_token(interp: &mut Interp, tok: &ScriptToken) -> Result<Value, Flow> {
    match tok.kind {
        TokKind::Word => Ok(tok.value.clone()),
        TokKind::Var => interp.get_var_value(&tok.value),
        TokKind::DictSugar => interp.read_dict_sugar(&tok.value),
        TokKind::Cmd => interp.eval_script(&tok.value),
        TokKind::Sep | TokKind::Eol => Ok(interp.empty()),
    }
}

/// Interpolate a run of tokens into one value. Single-token runs take the
/// fast path and preserve the token value's internal representation.
pub(crate) fn interpolate_tokens(
    interp: &mut Interp,
    tokens: &[ScriptToken],
) -> Result<Value, Flow> {
    if tokens.len() == 1 {
        return eval_token(interp, &tokens[0]);
    }
    let mut out = String::new();
    for tok in tokens {
        let v = eval_token(interp, tok)?;
        out.push_str(&v.as_string());
    }
    Ok(interp.new_string(&out))
}

// ---------------------------------------------------------------------------
// The subst engine
// ---------------------------------------------------------------------------

/// Evaluate `src` as a substitution body: literal text with each
/// non-suppressed variable, command, and backslash substitution replaced by
/// its value.
///
/// Control codes escaping a substituted command get the historical
/// treatment: `break` ends the whole substitution early with what has
/// accumulated, `continue` skips that command's contribution, and `return`
/// contributes the returned value.
pub(crate) fn subst(
    interp: &mut Interp,
    src: &Value,
    flags: SubstFlags,
) -> Result<Value, Flow> {
    let text = src.as_string();
    let mut parser = Parser::new_subst(&text, flags);
    let mut raw = Vec::new();
    loop {
        let tok = parser.next_token();
        if tok.kind == RawKind::Eof {
            break;
        }
        raw.push(tok);
    }

    // A single variable substitution passes its value through unchanged,
    // internal representation included. Command substitutions always take
    // the general walk so their control codes get the subst treatment.
    if raw.len() == 1 && matches!(raw[0].kind, RawKind::Var | RawKind::DictSugar) {
        let file = Rc::clone(&interp.current_file());
        let tok = compile_token(interp, &raw[0], &file);
        return eval_token(interp, &tok);
    }

    let mut out = String::new();
    for tok in &raw {
        match tok.kind {
            RawKind::Str => out.push_str(tok.text),
            RawKind::Esc => out.push_str(&unescape(tok.text)),
            RawKind::Var | RawKind::DictSugar => {
                let file = Rc::clone(&interp.current_file());
                let compiled = compile_token(interp, tok, &file);
                let v = eval_token(interp, &compiled)?;
                out.push_str(&v.as_string());
            }
            RawKind::Cmd => {
                let file = Rc::clone(&interp.current_file());
                let compiled = compile_token(interp, tok, &file);
                match eval_token(interp, &compiled) {
                    Ok(v) => out.push_str(&v.as_string()),
                    Err(Flow::Break) => break,
                    Err(Flow::Continue) => {}
                    Err(Flow::Return { value, .. }) => out.push_str(&value.as_string()),
                    Err(flow) => return Err(flow),
                }
            }
            RawKind::Sep | RawKind::Eol | RawKind::Eof => {}
        }
    }
    Ok(interp.new_string(&out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::Interp;
    use pretty_assertions::assert_eq;

    fn compile(interp: &mut Interp, src: &str) -> ScriptProgram {
        compile_script(interp, src, Rc::from(""), 1).unwrap()
    }

    #[test]
    fn test_cmd_struct_layout() {
        let mut interp = Interp::new();
        let prog = compile(&mut interp, "set x 5\nputs $x");
        // Two commands: [3, 1, 1, 1] and [2, 1, 1].
        assert_eq!(prog.cmds, vec![3, 1, 1, 1, 2, 1, 1]);
        assert_eq!(prog.command_count(), 2);
    }

    #[test]
    fn test_token_counts_match_sidecar() {
        let mut interp = Interp::new();
        let prog = compile(&mut interp, "a b$c d; e \"f $g\"");
        let content: usize = prog
            .tokens
            .iter()
            .filter(|t| !matches!(t.kind, TokKind::Sep | TokKind::Eol))
            .count();
        let mut counted = 0usize;
        let mut i = 0;
        while i < prog.cmds.len() {
            let argc = prog.cmds[i].unsigned_abs() as usize;
            for j in 0..argc {
                counted += prog.cmds[i + 1 + j].unsigned_abs() as usize;
            }
            i += 1 + argc;
        }
        assert_eq!(content, counted);
    }

    #[test]
    fn test_expansion_flags() {
        let mut interp = Interp::new();
        let prog = compile(&mut interp, "cmd {*}$xs y");
        assert_eq!(prog.cmds, vec![-3, 1, -1, 1]);
    }

    #[test]
    fn test_expand_word_spelled_out() {
        let mut interp = Interp::new();
        let prog = compile(&mut interp, "cmd {expand}$xs");
        assert_eq!(prog.cmds, vec![-2, 1, -1]);
    }

    #[test]
    fn test_lone_expand_braces_are_literal() {
        let mut interp = Interp::new();
        let prog = compile(&mut interp, "cmd {*}");
        assert_eq!(prog.cmds, vec![2, 1, 1]);
    }

    #[test]
    fn test_escapes_decoded_at_compile_time() {
        let mut interp = Interp::new();
        let prog = compile(&mut interp, r"puts a\tb");
        assert_eq!(&*prog.tokens[2].value.as_string(), "a\tb");
    }

    #[test]
    fn test_empty_commands_skipped() {
        let mut interp = Interp::new();
        let prog = compile(&mut interp, ";;  ;\n\n");
        assert_eq!(prog.cmds.len(), 0);
    }

    #[test]
    fn test_missing_brace_is_error() {
        let mut interp = Interp::new();
        assert!(compile_script(&mut interp, "puts {a", Rc::from(""), 1).is_err());
    }
}
