//! Core commands: flow control, variables, procedures, introspection,
//! references, and the small misc set.
//!
//! Every command is a plain function over `(&mut Interp, &[Value])`,
//! registered by name at interpreter construction. List, dict, and string
//! commands live in their own modules.

use std::rc::Rc;
use std::time::Instant;

use crate::interp::{CmdResult, Flow, Interp};
use crate::parser::{script_is_complete, SubstFlags};
use crate::value::{Repr, ReturnCode, Value};
use crate::{expr, script, strings};

pub(crate) fn register(interp: &mut Interp) {
    interp.register("set", cmd_set);
    interp.register("unset", cmd_unset);
    interp.register("incr", cmd_incr);
    interp.register("append", cmd_append);
    interp.register("upvar", cmd_upvar);
    interp.register("global", cmd_global);

    interp.register("if", cmd_if);
    interp.register("while", cmd_while);
    interp.register("for", cmd_for);
    interp.register("foreach", cmd_foreach);
    interp.register("lmap", cmd_lmap);
    interp.register("switch", cmd_switch);
    interp.register("catch", cmd_catch);
    interp.register("return", cmd_return);
    interp.register("break", cmd_break);
    interp.register("continue", cmd_continue);
    interp.register("tailcall", cmd_tailcall);
    interp.register("error", cmd_error);

    interp.register("proc", cmd_proc);
    interp.register("rename", cmd_rename);
    interp.register("eval", cmd_eval);
    interp.register("uplevel", cmd_uplevel);
    interp.register("expr", cmd_expr);
    interp.register("subst", cmd_subst);
    interp.register("source", cmd_source);
    interp.register("info", cmd_info);

    interp.register("ref", cmd_ref);
    interp.register("getref", cmd_getref);
    interp.register("setref", cmd_setref);
    interp.register("finalize", cmd_finalize);
    interp.register("collect", cmd_collect);

    interp.register("puts", cmd_puts);
    interp.register("time", cmd_time);
    interp.register("range", cmd_range);
    interp.register("rand", cmd_rand);
    interp.register("env", cmd_env);
    interp.register("exit", cmd_exit);
}

// ---------------------------------------------------------------------------
// Shared option/subcommand resolution
// ---------------------------------------------------------------------------

fn join_options(options: &[&str]) -> String {
    match options.len() {
        0 => String::new(),
        1 => options[0].to_string(),
        2 => format!("{} or {}", options[0], options[1]),
        _ => {
            let head = options[..options.len() - 1].join(", ");
            format!("{}, or {}", head, options[options.len() - 1])
        }
    }
}

/// Resolve `arg` against an option table, allowing unique abbreviation.
pub(crate) fn resolve_enum(
    interp: &mut Interp,
    arg: &Value,
    options: &[&str],
    what: &str,
) -> Result<usize, Flow> {
    let s = arg.as_string();
    if let Some(exact) = options.iter().position(|o| *o == &*s) {
        return Ok(exact);
    }
    if !s.is_empty() {
        let matches: Vec<usize> = options
            .iter()
            .enumerate()
            .filter(|(_, o)| o.starts_with(&*s))
            .map(|(i, _)| i)
            .collect();
        if matches.len() == 1 {
            return Ok(matches[0]);
        }
        if matches.len() > 1 {
            return Err(interp.error(format!(
                "ambiguous {} \"{}\": must be {}",
                what,
                s,
                join_options(options)
            )));
        }
    }
    Err(interp.error(format!(
        "bad {} \"{}\": must be {}",
        what,
        s,
        join_options(options)
    )))
}

/// `concat`-style join: trim each argument and join the non-empty pieces
/// with single spaces.
pub(crate) fn concat_values(interp: &mut Interp, values: &[Value]) -> Value {
    let mut out = String::new();
    for v in values {
        let s = v.as_string();
        let trimmed = s.trim_matches(|c: char| c.is_ascii_whitespace());
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(trimmed);
    }
    interp.new_string(&out)
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

fn cmd_set(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    match argv.len() {
        2 => interp.get_var_value(&argv[1]),
        3 => {
            interp.set_var_value(&argv[1], argv[2].clone())?;
            Ok(argv[2].clone())
        }
        _ => Err(interp.wrong_num_args(argv, "varName ?newValue?")),
    }
}

fn cmd_unset(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let mut i = 1;
    let mut nocomplain = false;
    while i < argv.len() {
        let s = argv[i].as_string();
        match &*s {
            "-nocomplain" => {
                nocomplain = true;
                i += 1;
            }
            "--" => {
                i += 1;
                break;
            }
            _ => break,
        }
    }
    for name in &argv[i..] {
        interp.unset_var(name, nocomplain)?;
    }
    Ok(interp.empty())
}

fn cmd_incr(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(argv, "varName ?increment?"));
    }
    let inc = if argv.len() == 3 {
        interp.get_int(&argv[2])?
    } else {
        1
    };
    let name = argv[1].as_string();
    if !interp.var_exists(&name) {
        let fresh = interp.new_int(inc);
        interp.set_var_value(&argv[1], fresh.clone())?;
        return Ok(fresh);
    }
    let target = interp.var_mut_value(&argv[1])?;
    let current = interp.get_int(&target)?;
    target.set_repr(Repr::Int(current.wrapping_add(inc)));
    target.invalidate_string();
    Ok(target)
}

fn cmd_append(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(argv, "varName ?value ...?"));
    }
    let name = argv[1].as_string();
    let mut out = if interp.var_exists(&name) {
        interp.get_var_value(&argv[1])?.as_string().to_string()
    } else {
        String::new()
    };
    for v in &argv[2..] {
        out.push_str(&v.as_string());
    }
    let result = interp.new_string(&out);
    interp.set_var_value(&argv[1], result.clone())?;
    Ok(result)
}

fn looks_like_level(s: &str) -> bool {
    s.starts_with('#') || s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty()
}

fn cmd_upvar(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 3 {
        return Err(interp.wrong_num_args(argv, "?level? otherVar localVar ?otherVar localVar ...?"));
    }
    let first = argv[1].as_string();
    let (target, mut i) = if looks_like_level(&first) && (argv.len() - 2) % 2 == 0 {
        (interp.resolve_level(&first)?, 2)
    } else {
        (interp.resolve_level("1")?, 1)
    };
    if (argv.len() - i) % 2 != 0 || argv.len() == i {
        return Err(interp.wrong_num_args(argv, "?level? otherVar localVar ?otherVar localVar ...?"));
    }
    while i < argv.len() {
        let other = argv[i].as_string();
        let local = argv[i + 1].as_string();
        interp.link_var(target, &other, &local)?;
        i += 2;
    }
    Ok(interp.empty())
}

fn cmd_global(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(argv, "varName ?varName ...?"));
    }
    if interp.at_global_frame() {
        return Ok(interp.empty());
    }
    for name in &argv[1..] {
        let name = name.as_string();
        interp.link_var(0, &name, &name)?;
    }
    Ok(interp.empty())
}

// ---------------------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------------------

fn cmd_if(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let mut i = 1;
    loop {
        if i >= argv.len() {
            return Err(interp.wrong_num_args(argv, "condition ?then? script ..."));
        }
        let cond = &argv[i];
        i += 1;
        if i < argv.len() && &*argv[i].as_string() == "then" {
            i += 1;
        }
        if i >= argv.len() {
            return Err(interp.wrong_num_args(argv, "condition ?then? script ..."));
        }
        let body = &argv[i];
        i += 1;
        if expr::eval_expr_bool(interp, cond)? {
            return interp.eval_script(body);
        }
        if i >= argv.len() {
            return Ok(interp.empty());
        }
        let next = argv[i].as_string();
        if &*next == "elseif" {
            i += 1;
            continue;
        }
        if &*next == "else" {
            i += 1;
        }
        if i != argv.len() - 1 {
            return Err(interp.wrong_num_args(argv, "condition ?then? script ..."));
        }
        return interp.eval_script(&argv[i]);
    }
}

fn cmd_while(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 3 {
        return Err(interp.wrong_num_args(argv, "condition body"));
    }
    while expr::eval_expr_bool(interp, &argv[1])? {
        match interp.eval_script(&argv[2]) {
            Ok(_) | Err(Flow::Continue) => {}
            Err(Flow::Break) => break,
            Err(flow) => return Err(flow),
        }
    }
    Ok(interp.empty())
}

fn cmd_for(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 5 {
        return Err(interp.wrong_num_args(argv, "start test next body"));
    }
    interp.eval_script(&argv[1])?;
    while expr::eval_expr_bool(interp, &argv[2])? {
        match interp.eval_script(&argv[4]) {
            Ok(_) | Err(Flow::Continue) => {}
            Err(Flow::Break) => break,
            Err(flow) => return Err(flow),
        }
        match interp.eval_script(&argv[3]) {
            Ok(_) => {}
            Err(Flow::Break) => break,
            Err(flow) => return Err(flow),
        }
    }
    Ok(interp.empty())
}

fn foreach_impl(interp: &mut Interp, argv: &[Value], collect: bool) -> CmdResult {
    if argv.len() < 4 || argv.len() % 2 != 0 {
        return Err(interp.wrong_num_args(argv, "varList list ?varList list ...? body"));
    }
    let body = &argv[argv.len() - 1];
    let mut bindings: Vec<(Vec<Value>, Vec<Value>)> = Vec::new();
    let mut iterations = 0usize;
    let mut pair = 1;
    while pair + 1 < argv.len() {
        let vars = interp.get_list(&argv[pair])?;
        if vars.is_empty() {
            return Err(interp.error("foreach varlist is empty"));
        }
        let items = interp.get_list(&argv[pair + 1])?;
        iterations = iterations.max(items.len().div_ceil(vars.len()));
        bindings.push((vars, items));
        pair += 2;
    }
    let mut collected = Vec::new();
    'outer: for iteration in 0..iterations {
        for (vars, items) in &bindings {
            for (k, var) in vars.iter().enumerate() {
                let idx = iteration * vars.len() + k;
                let value = items.get(idx).cloned().unwrap_or_else(|| interp.empty());
                interp.set_var_value(var, value)?;
            }
        }
        match interp.eval_script(body) {
            Ok(v) => {
                if collect {
                    collected.push(v);
                }
            }
            Err(Flow::Continue) => {}
            Err(Flow::Break) => break 'outer,
            Err(flow) => return Err(flow),
        }
    }
    if collect {
        Ok(interp.new_list(collected))
    } else {
        Ok(interp.empty())
    }
}

fn cmd_foreach(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    foreach_impl(interp, argv, false)
}

fn cmd_lmap(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    foreach_impl(interp, argv, true)
}

fn cmd_switch(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    const USAGE: &str = "?options? string pattern body ... ?default body?";
    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Exact,
        Glob,
        Regexp,
        Command,
    }
    let mut mode = Mode::Exact;
    let mut command: Option<Value> = None;
    let mut i = 1;
    while i < argv.len() {
        let s = argv[i].as_string();
        if !s.starts_with('-') {
            break;
        }
        match &*s {
            "-exact" => mode = Mode::Exact,
            "-glob" => mode = Mode::Glob,
            "-regexp" => mode = Mode::Regexp,
            "-command" => {
                mode = Mode::Command;
                i += 1;
                if i >= argv.len() {
                    return Err(interp.wrong_num_args(argv, USAGE));
                }
                command = Some(argv[i].clone());
            }
            "--" => {
                i += 1;
                break;
            }
            _ => {
                return Err(interp.error(format!(
                    "bad option \"{}\": must be -exact, -glob, -regexp, -command, or --",
                    s
                )))
            }
        }
        i += 1;
    }
    if i >= argv.len() {
        return Err(interp.wrong_num_args(argv, USAGE));
    }
    let subject = argv[i].clone();
    i += 1;
    let pairs: Vec<Value> = if argv.len() - i == 1 {
        interp.get_list(&argv[i])?
    } else {
        argv[i..].to_vec()
    };
    if pairs.is_empty() || pairs.len() % 2 != 0 {
        return Err(interp.error("extra switch pattern with no body"));
    }
    let subject_str = subject.as_string();
    let count = pairs.len() / 2;
    let mut matched_at: Option<usize> = None;
    for p in 0..count {
        let pattern = &pairs[p * 2];
        let pattern_str = pattern.as_string();
        let is_default = &*pattern_str == "default" && p == count - 1;
        let hit = if is_default {
            true
        } else {
            match mode {
                Mode::Exact => *pattern_str == *subject_str,
                Mode::Glob => strings::glob_match(&pattern_str, &subject_str, false),
                Mode::Regexp => strings::regex_match(interp, pattern, &subject_str, false)?,
                Mode::Command => {
                    let cmd = command.clone().expect("-command requires an argument");
                    let argv = vec![cmd, pattern.clone(), subject.clone()];
                    let r = interp.eval_argv(argv)?;
                    interp.get_bool(&r)?
                }
            }
        };
        if hit {
            matched_at = Some(p);
            break;
        }
    }
    let Some(mut p) = matched_at else {
        return Ok(interp.empty());
    };
    // "-" bodies fall through to the next pattern's body.
    while p < count && &*pairs[p * 2 + 1].as_string() == "-" {
        p += 1;
    }
    if p >= count {
        return Err(interp.error("no body specified for pattern"));
    }
    interp.eval_script(&pairs[p * 2 + 1])
}

fn cmd_catch(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    const USAGE: &str = "?-?no?code ... --? script ?resultVarName? ?optionsVarName?";
    let default_mask: u64 = (1 << 0) | (1 << 1) | (1 << 3) | (1 << 4) | (1 << 2);
    let mut mask = default_mask;
    let mut i = 1;
    while i < argv.len() {
        let s = argv[i].as_string();
        if !s.starts_with('-') {
            break;
        }
        if &*s == "--" {
            i += 1;
            break;
        }
        let (clear, name) = match s.strip_prefix("-no") {
            Some(rest) => (true, rest.to_string()),
            None => (false, s[1..].to_string()),
        };
        let Some(code) = ReturnCode::from_name(&name) else {
            break;
        };
        let bit = 1u64 << code.0;
        if clear {
            mask &= !bit;
        } else {
            mask |= bit;
        }
        i += 1;
    }
    if i >= argv.len() || argv.len() > i + 3 {
        return Err(interp.wrong_num_args(argv, USAGE));
    }
    let body = &argv[i];
    let result_var = argv.get(i + 1);
    let options_var = argv.get(i + 2);

    let catch_signals = mask & (1 << ReturnCode::SIGNAL.0) != 0;
    if catch_signals {
        interp.signal_level += 1;
    }
    let outcome = interp.eval_script(body);
    if catch_signals {
        interp.signal_level -= 1;
    }

    // (catch code, captured result, -code, -level)
    let (code, captured, opt_code, opt_level) = match outcome {
        Ok(v) => (0, v, 0, 0),
        Err(Flow::Error) => {
            let v = interp.result.clone();
            (1, v, 1, 0)
        }
        Err(Flow::Return { code, level, value }) => (2, value, code.0, level as i64),
        Err(Flow::Break) => (3, interp.empty(), 3, 0),
        Err(Flow::Continue) => (4, interp.empty(), 4, 0),
        Err(Flow::Signal) => {
            let sig = interp.take_signal_mask();
            let v = interp.new_int(sig as i64);
            (5, v, 5, 0)
        }
        Err(Flow::Exit(exit_code)) => {
            let v = interp.new_int(exit_code);
            (6, v, 6, 0)
        }
        Err(flow @ Flow::Tailcall(_)) => return Err(flow),
    };
    let trapped = code > 6 || (mask >> code) & 1 == 1;
    if !trapped {
        return Err(match code {
            1 => Flow::Error,
            2 => Flow::Return {
                code: ReturnCode(opt_code),
                level: opt_level as usize,
                value: captured,
            },
            3 => Flow::Break,
            4 => Flow::Continue,
            5 => Flow::Signal,
            6 => {
                let exit_code = interp.get_int(&captured).unwrap_or(0);
                Flow::Exit(exit_code)
            }
            _ => Flow::Error,
        });
    }

    let errorinfo = interp.custom_errorinfo.take();
    if code == 1 {
        interp.clear_error();
    }
    if let Some(var) = result_var {
        interp.set_var_value(var, captured.clone())?;
    }
    if let Some(var) = options_var {
        let mut pairs = Vec::new();
        let k = interp.new_string("-code");
        let v = interp.new_int(i64::from(opt_code));
        pairs.push((k, v));
        let k = interp.new_string("-level");
        let v = interp.new_int(opt_level);
        pairs.push((k, v));
        if code == 1 || errorinfo.is_some() {
            let k = interp.new_string("-errorinfo");
            let v = match errorinfo {
                Some(info) => info,
                None => interp.stack_trace_value(),
            };
            pairs.push((k, v));
        }
        let dict = interp.new_dict(pairs);
        interp.set_var_value(var, dict)?;
    }
    Ok(interp.new_int(i64::from(code)))
}

fn cmd_return(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let mut code = ReturnCode::OK;
    let mut level = 1usize;
    let mut errorinfo: Option<Value> = None;
    let mut i = 1;
    while i + 1 < argv.len() {
        let s = argv[i].as_string();
        match &*s {
            "-code" => code = interp.get_return_code(&argv[i + 1])?,
            "-level" => {
                let n = interp.get_int(&argv[i + 1])?;
                if n < 0 {
                    return Err(interp.error(format!("bad level \"{}\"", n)));
                }
                level = n as usize;
            }
            "-errorinfo" => errorinfo = Some(argv[i + 1].clone()),
            _ => break,
        }
        i += 2;
    }
    if argv.len() > i + 1 {
        return Err(interp.wrong_num_args(
            argv,
            "?-code code? ?-errorinfo stacktrace? ?-level level? ?result?",
        ));
    }
    let value = argv.get(i).cloned().unwrap_or_else(|| interp.empty());
    interp.custom_errorinfo = errorinfo;
    if level == 0 && code == ReturnCode::OK {
        return Ok(value);
    }
    Err(Flow::Return { code, level, value })
}

fn cmd_break(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 1 {
        return Err(interp.wrong_num_args(argv, ""));
    }
    Err(Flow::Break)
}

fn cmd_continue(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 1 {
        return Err(interp.wrong_num_args(argv, ""));
    }
    Err(Flow::Continue)
}

fn cmd_tailcall(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(argv, "cmd ?args ...?"));
    }
    Err(Flow::Tailcall(argv[1..].to_vec()))
}

fn cmd_error(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(argv, "message ?stacktrace?"));
    }
    let flow = interp.set_error_value(argv[1].clone());
    if let Some(trace) = argv.get(2) {
        interp.custom_errorinfo = Some(trace.clone());
    }
    Err(flow)
}

// ---------------------------------------------------------------------------
// Procedures and meta evaluation
// ---------------------------------------------------------------------------

fn cmd_proc(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    match argv.len() {
        4 => {
            let name = argv[1].as_string();
            interp.create_proc(&name, argv[2].clone(), None, argv[3].clone())?;
            Ok(interp.empty())
        }
        5 => {
            let name = argv[1].as_string();
            interp.create_proc(&name, argv[2].clone(), Some(argv[3].clone()), argv[4].clone())?;
            Ok(interp.empty())
        }
        _ => Err(interp.wrong_num_args(argv, "name arglist ?statics? body")),
    }
}

fn cmd_rename(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 3 {
        return Err(interp.wrong_num_args(argv, "oldName newName"));
    }
    let old = argv[1].as_string();
    let new = argv[2].as_string();
    interp.rename_command(&old, &new)?;
    Ok(interp.empty())
}

fn cmd_eval(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    match argv.len() {
        1 => Err(interp.wrong_num_args(argv, "arg ?arg ...?")),
        2 => interp.eval_script(&argv[1]),
        _ => {
            let script = concat_values(interp, &argv[1..]);
            interp.eval_script(&script)
        }
    }
}

fn cmd_uplevel(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(argv, "?level? command ?arg ...?"));
    }
    let first = argv[1].as_string();
    let (target, rest) = if argv.len() > 2 && looks_like_level(&first) {
        (interp.resolve_level(&first)?, &argv[2..])
    } else {
        (interp.resolve_level("1")?, &argv[1..])
    };
    let script = if rest.len() == 1 {
        rest[0].clone()
    } else {
        concat_values(interp, rest)
    };
    let saved = interp.swap_frame(target);
    let r = interp.eval_script(&script);
    interp.swap_frame(saved);
    r
}

fn cmd_expr(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    match argv.len() {
        1 => Err(interp.wrong_num_args(argv, "expression ?...?")),
        2 => expr::eval_expr(interp, &argv[1]),
        _ => {
            let parts: Vec<String> = argv[1..]
                .iter()
                .map(|v| v.as_string().to_string())
                .collect();
            let joined = interp.new_string(&parts.join(" "));
            expr::eval_expr(interp, &joined)
        }
    }
}

fn cmd_subst(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    const USAGE: &str = "?-nobackslashes? ?-nocommands? ?-novariables? string";
    let mut flags = SubstFlags::default();
    let mut i = 1;
    while i + 1 < argv.len() {
        let s = argv[i].as_string();
        match &*s {
            "-nobackslashes" => flags.no_backslashes = true,
            "-nocommands" => flags.no_commands = true,
            "-novariables" => flags.no_variables = true,
            _ => return Err(interp.wrong_num_args(argv, USAGE)),
        }
        i += 1;
    }
    if i != argv.len() - 1 {
        return Err(interp.wrong_num_args(argv, USAGE));
    }
    script::subst(interp, &argv[i], flags)
}

fn cmd_source(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 {
        return Err(interp.wrong_num_args(argv, "fileName"));
    }
    let path = argv[1].as_string();
    let src = match std::fs::read_to_string(&*path) {
        Ok(src) => src,
        Err(e) => {
            return Err(interp.error(format!("couldn't read file \"{}\": {}", path, e)));
        }
    };
    let file = interp.intern_filename(&path);
    let script = interp.new_sourced_string(&src, &file, 1);
    interp.eval_script(&script)
}

// ---------------------------------------------------------------------------
// info
// ---------------------------------------------------------------------------

const INFO_SUBCOMMANDS: &[&str] = &[
    "args",
    "body",
    "commands",
    "complete",
    "exists",
    "globals",
    "hostname",
    "level",
    "locals",
    "nameofexecutable",
    "patchlevel",
    "procs",
    "returncodes",
    "script",
    "source",
    "stacktrace",
    "vars",
    "version",
];

fn glob_filter(interp: &mut Interp, names: Vec<String>, pattern: Option<&Value>) -> Value {
    let pattern = pattern.map(|p| p.as_string());
    let items: Vec<Value> = names
        .into_iter()
        .filter(|name| {
            pattern
                .as_ref()
                .is_none_or(|p| strings::glob_match(p, name, false))
        })
        .map(|name| interp.new_string(&name))
        .collect();
    interp.new_list(items)
}

fn cmd_info(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(argv, "subcommand ?arg ...?"));
    }
    let sub = resolve_enum(interp, &argv[1], INFO_SUBCOMMANDS, "subcommand")?;
    match INFO_SUBCOMMANDS[sub] {
        "args" | "body" => {
            if argv.len() != 3 {
                return Err(interp.wrong_num_args(argv, "procname"));
            }
            let name = argv[2].as_string();
            let Some(cmd) = interp.find_command(&name) else {
                return Err(interp.error(format!("command \"{}\" doesn't exist", name)));
            };
            match &cmd.imp {
                crate::interp::CmdImpl::Proc(def) => Ok(if INFO_SUBCOMMANDS[sub] == "args" {
                    def.arg_list.clone()
                } else {
                    def.body.clone()
                }),
                _ => Err(interp.error(format!("command \"{}\" is not a procedure", name))),
            }
        }
        "commands" => {
            let names = interp.command_names(false);
            Ok(glob_filter(interp, names, argv.get(2)))
        }
        "procs" => {
            let names = interp.command_names(true);
            Ok(glob_filter(interp, names, argv.get(2)))
        }
        "complete" => {
            if argv.len() != 3 && argv.len() != 4 {
                return Err(interp.wrong_num_args(argv, "script ?missingVar?"));
            }
            let s = argv[2].as_string();
            let (complete, missing) = script_is_complete(&s);
            if let Some(var) = argv.get(3) {
                let state = missing.map(|c| c.to_string()).unwrap_or_default();
                let state = interp.new_string(&state);
                interp.set_var_value(var, state)?;
            }
            Ok(interp.new_bool(complete))
        }
        "exists" => {
            if argv.len() != 3 {
                return Err(interp.wrong_num_args(argv, "varName"));
            }
            let name = argv[2].as_string();
            let exists = interp.var_exists(&name);
            Ok(interp.new_bool(exists))
        }
        "globals" => {
            let names = interp.frame_var_names(Some(0));
            Ok(glob_filter(interp, names, argv.get(2)))
        }
        "locals" => {
            let names = if interp.at_global_frame() {
                Vec::new()
            } else {
                interp.frame_var_names(None)
            };
            Ok(glob_filter(interp, names, argv.get(2)))
        }
        "vars" => {
            let names = interp.frame_var_names(None);
            Ok(glob_filter(interp, names, argv.get(2)))
        }
        "level" => match argv.len() {
            2 => {
                let level = interp.current_level() as i64;
                Ok(interp.new_int(level))
            }
            3 => {
                let n = interp.get_int(&argv[2])?;
                let level_argv = interp.level_argv(n)?;
                Ok(interp.new_list(level_argv))
            }
            _ => Err(interp.wrong_num_args(argv, "?levelNum?")),
        },
        "script" => {
            let file = interp.current_file();
            Ok(interp.new_string(&file))
        }
        "source" => {
            if argv.len() != 3 {
                return Err(interp.wrong_num_args(argv, "source"));
            }
            let info = match &*argv[2].cell.repr.borrow() {
                Repr::Source { file, line } => Some((Rc::clone(file), *line)),
                _ => None,
            };
            let (file, line) = info.unwrap_or((Rc::from(""), 1));
            let file = interp.new_string(&file);
            let line = interp.new_int(i64::from(line));
            Ok(interp.new_list(vec![file, line]))
        }
        "stacktrace" => Ok(interp.stack_trace_value()),
        "returncodes" => {
            let mut items = Vec::new();
            for code in 0..=6 {
                items.push(interp.new_int(code));
                let name = ReturnCode(code as i32).name().unwrap();
                items.push(interp.new_string(name));
            }
            Ok(interp.new_list(items))
        }
        "version" | "patchlevel" => Ok(interp.new_string(env!("CARGO_PKG_VERSION"))),
        "nameofexecutable" => {
            let name = interp.executable_name().unwrap_or("").to_string();
            Ok(interp.new_string(&name))
        }
        "hostname" => {
            let name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            Ok(interp.new_string(&name))
        }
        _ => unreachable!(),
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

fn cmd_ref(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 3 && argv.len() != 4 {
        return Err(interp.wrong_num_args(argv, "reference tag ?finalizer?"));
    }
    let tag = argv[2].as_string();
    Ok(interp.new_reference(argv[1].clone(), &tag, argv.get(3).cloned()))
}

fn cmd_getref(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 {
        return Err(interp.wrong_num_args(argv, "reference"));
    }
    interp.get_reference(&argv[1])
}

fn cmd_setref(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 3 {
        return Err(interp.wrong_num_args(argv, "reference newValue"));
    }
    interp.set_reference(&argv[1], argv[2].clone())
}

fn cmd_finalize(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(argv, "reference ?finalizerProc?"));
    }
    if let Some(cmd) = argv.get(2) {
        let cmd = if cmd.is_empty() {
            None
        } else {
            Some(cmd.clone())
        };
        interp.set_finalizer(&argv[1], cmd)?;
    }
    interp.get_finalizer(&argv[1])
}

fn cmd_collect(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 1 {
        return Err(interp.wrong_num_args(argv, ""));
    }
    let swept = interp.collect() as i64;
    Ok(interp.new_int(swept))
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

fn cmd_puts(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let (text, newline) = match argv.len() {
        2 => (argv[1].as_string(), true),
        3 if &*argv[1].as_string() == "-nonewline" => (argv[2].as_string(), false),
        _ => return Err(interp.wrong_num_args(argv, "?-nonewline? string")),
    };
    interp.write_output(&text, newline);
    Ok(interp.empty())
}

fn cmd_time(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(argv, "script ?count?"));
    }
    let count = match argv.get(2) {
        Some(v) => interp.get_int(v)?.max(1),
        None => 1,
    };
    let start = Instant::now();
    for _ in 0..count {
        interp.eval_script(&argv[1])?;
    }
    let per_iteration = start.elapsed().as_micros() as i64 / count;
    Ok(interp.new_string(&format!("{} microseconds per iteration", per_iteration)))
}

fn cmd_range(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 || argv.len() > 4 {
        return Err(interp.wrong_num_args(argv, "?start? end ?step?"));
    }
    let (start, end, step) = match argv.len() {
        2 => (0, interp.get_int(&argv[1])?, 1),
        3 => (interp.get_int(&argv[1])?, interp.get_int(&argv[2])?, 1),
        _ => (
            interp.get_int(&argv[1])?,
            interp.get_int(&argv[2])?,
            interp.get_int(&argv[3])?,
        ),
    };
    if step == 0 || (end > start && step < 0) || (end < start && step > 0) {
        return Err(interp.error("Invalid (infinite?) range specified"));
    }
    let mut items = Vec::new();
    let mut i = start;
    while (step > 0 && i < end) || (step < 0 && i > end) {
        items.push(interp.new_int(i));
        i += step;
    }
    Ok(interp.new_list(items))
}

fn cmd_rand(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let (min, max) = match argv.len() {
        1 => {
            let r = (interp.rand_u64() >> 1) as i64;
            return Ok(interp.new_int(r));
        }
        2 => (0, interp.get_int(&argv[1])?),
        3 => (interp.get_int(&argv[1])?, interp.get_int(&argv[2])?),
        _ => return Err(interp.wrong_num_args(argv, "?min? max")),
    };
    if max <= min {
        return Err(interp.error("Invalid arguments (max < min)"));
    }
    let span = (max - min) as u64;
    let r = min + (interp.rand_u64() % span) as i64;
    Ok(interp.new_int(r))
}

fn cmd_env(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(argv, "varName ?default?"));
    }
    let name = argv[1].as_string();
    match std::env::var(&*name) {
        Ok(value) => Ok(interp.new_string(&value)),
        Err(_) => match argv.get(2) {
            Some(default) => Ok(default.clone()),
            None => Err(interp.error(format!(
                "environment variable \"{}\" does not exist",
                name
            ))),
        },
    }
}

fn cmd_exit(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    let code = match argv.len() {
        1 => 0,
        2 => interp.get_int(&argv[1])?,
        _ => return Err(interp.wrong_num_args(argv, "?exitCode?")),
    };
    Err(Flow::Exit(code))
}
