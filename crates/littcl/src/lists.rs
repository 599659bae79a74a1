//! List and dict commands, plus the shimmer helpers other modules use to
//! treat arbitrary values as lists or insertion-ordered dictionaries.

use std::cmp::Ordering;

use crate::commands::{concat_values, resolve_enum};
use crate::interp::{CmdResult, Flow, Interp};
use crate::strings::glob_match;
use crate::value::{Repr, SeqIndex, Value};

pub(crate) fn register(interp: &mut Interp) {
    interp.register("list", cmd_list);
    interp.register("llength", cmd_llength);
    interp.register("lindex", cmd_lindex);
    interp.register("lset", cmd_lset);
    interp.register("lappend", cmd_lappend);
    interp.register("linsert", cmd_linsert);
    interp.register("lreplace", cmd_lreplace);
    interp.register("lrange", cmd_lrange);
    interp.register("lrepeat", cmd_lrepeat);
    interp.register("lreverse", cmd_lreverse);
    interp.register("lsort", cmd_lsort);
    interp.register("lsearch", cmd_lsearch);
    interp.register("concat", cmd_concat);
    interp.register("join", cmd_join);
    interp.register("split", cmd_split);
    interp.register("dict", cmd_dict);
}

// ---------------------------------------------------------------------------
// Dict helpers
// ---------------------------------------------------------------------------

/// Read a value as insertion-ordered key/value pairs, shimmering it.
pub(crate) fn dict_pairs(interp: &mut Interp, v: &Value) -> Result<Vec<(Value, Value)>, Flow> {
    if let Repr::Dict(pairs) = &*v.cell.repr.borrow() {
        return Ok(pairs.clone());
    }
    let items = interp.get_list(v)?;
    if items.len() % 2 != 0 {
        return Err(interp.error("missing value to go with key"));
    }
    let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(items.len() / 2);
    for chunk in items.chunks(2) {
        let key = &chunk[0];
        let val = chunk[1].clone();
        match pairs.iter_mut().find(|(k, _)| k.string_eq(key)) {
            Some(existing) => existing.1 = val,
            None => pairs.push((key.clone(), val)),
        }
    }
    v.set_repr(Repr::Dict(pairs.clone()));
    Ok(pairs)
}

/// Look up a key; `Ok(None)` when absent, `Err` when the value is not a
/// dict at all.
pub(crate) fn dict_get(
    interp: &mut Interp,
    dict: &Value,
    key: &Value,
) -> Result<Option<Value>, Flow> {
    let pairs = dict_pairs(interp, dict)?;
    Ok(pairs
        .iter()
        .find(|(k, _)| k.string_eq(key))
        .map(|(_, v)| v.clone()))
}

/// Store a key in an unshared dict value, replacing in place and keeping
/// insertion order.
pub(crate) fn dict_mut_set(
    interp: &mut Interp,
    dict: &Value,
    key: &Value,
    value: Value,
) -> Result<(), Flow> {
    dict_pairs(interp, dict)?;
    if let Repr::Dict(pairs) = &mut *dict.cell.repr.borrow_mut() {
        match pairs.iter_mut().find(|(k, _)| k.string_eq(key)) {
            Some(existing) => existing.1 = value,
            None => pairs.push((key.clone(), value)),
        }
    }
    dict.invalidate_string();
    Ok(())
}

/// Remove a key from an unshared dict value; returns whether it was there.
pub(crate) fn dict_mut_unset(
    interp: &mut Interp,
    dict: &Value,
    key: &Value,
) -> Result<bool, Flow> {
    dict_pairs(interp, dict)?;
    let mut removed = false;
    if let Repr::Dict(pairs) = &mut *dict.cell.repr.borrow_mut() {
        let before = pairs.len();
        pairs.retain(|(k, _)| !k.string_eq(key));
        removed = pairs.len() != before;
    }
    if removed {
        dict.invalidate_string();
    }
    Ok(removed)
}

/// Append elements to an unshared list value in place.
pub(crate) fn list_append_in_place(
    interp: &mut Interp,
    list: &Value,
    items: &[Value],
) -> Result<(), Flow> {
    interp.get_list(list)?;
    if let Repr::List(elements) = &mut *list.cell.repr.borrow_mut() {
        elements.extend_from_slice(items);
    }
    list.invalidate_string();
    Ok(())
}

// ---------------------------------------------------------------------------
// Index helpers
// ---------------------------------------------------------------------------

fn resolve_index(interp: &mut Interp, v: &Value, len: usize) -> Result<i64, Flow> {
    let idx = interp.get_index(v)?;
    Ok(idx.resolve(len))
}

// ---------------------------------------------------------------------------
// List commands
// ---------------------------------------------------------------------------

fn cmd_list(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    Ok(interp.new_list(argv[1..].to_vec()))
}

fn cmd_llength(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 {
        return Err(interp.wrong_num_args(argv, "list"));
    }
    let len = interp.get_list(&argv[1])?.len() as i64;
    Ok(interp.new_int(len))
}

fn cmd_lindex(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(argv, "list ?index ...?"));
    }
    let mut current = argv[1].clone();
    for index in &argv[2..] {
        let items = interp.get_list(&current)?;
        let i = resolve_index(interp, index, items.len())?;
        if i < 0 || i as usize >= items.len() {
            return Ok(interp.empty());
        }
        current = items[i as usize].clone();
    }
    Ok(current)
}

fn lset_path(
    interp: &mut Interp,
    list: &Value,
    indices: &[Value],
    value: Value,
) -> Result<(), Flow> {
    let items = interp.get_list(list)?;
    let i = resolve_index(interp, &indices[0], items.len())?;
    if i < 0 || i as usize >= items.len() {
        return Err(interp.error(format!(
            "list index out of range \"{}\"",
            indices[0].as_string()
        )));
    }
    let i = i as usize;
    let replacement = if indices.len() == 1 {
        value
    } else {
        let inner = interp.duplicate(&items[i]);
        lset_path(interp, &inner, &indices[1..], value)?;
        inner
    };
    if let Repr::List(elements) = &mut *list.cell.repr.borrow_mut() {
        elements[i] = replacement;
    }
    list.invalidate_string();
    Ok(())
}

fn cmd_lset(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 3 {
        return Err(interp.wrong_num_args(argv, "listVar ?index ...? value"));
    }
    if argv.len() == 3 {
        interp.set_var_value(&argv[1], argv[2].clone())?;
        return Ok(argv[2].clone());
    }
    let target = interp.var_mut_value(&argv[1])?;
    let value = argv[argv.len() - 1].clone();
    lset_path(interp, &target, &argv[2..argv.len() - 1], value)?;
    Ok(target)
}

fn cmd_lappend(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(argv, "varName ?value ...?"));
    }
    let name = argv[1].as_string();
    if !interp.var_exists(&name) {
        let fresh = interp.new_list(argv[2..].to_vec());
        interp.set_var_value(&argv[1], fresh.clone())?;
        return Ok(fresh);
    }
    let target = interp.var_mut_value(&argv[1])?;
    list_append_in_place(interp, &target, &argv[2..])?;
    Ok(target)
}

fn cmd_linsert(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 3 {
        return Err(interp.wrong_num_args(argv, "list index ?element ...?"));
    }
    let mut items = interp.get_list(&argv[1])?;
    // For an insertion point, `end` names the slot after the last element.
    let at = match interp.get_index(&argv[2])? {
        SeqIndex::Abs(i) => i,
        SeqIndex::End(off) => items.len() as i64 + off,
    }
    .clamp(0, items.len() as i64) as usize;
    items.splice(at..at, argv[3..].iter().cloned());
    Ok(interp.new_list(items))
}

fn cmd_lreplace(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 4 {
        return Err(interp.wrong_num_args(argv, "list first last ?element ...?"));
    }
    let items = interp.get_list(&argv[1])?;
    let len = items.len();
    let first = resolve_index(interp, &argv[2], len)?.clamp(0, len as i64) as usize;
    let last = resolve_index(interp, &argv[3], len)?.min(len as i64 - 1);
    let mut out: Vec<Value> = items[..first].to_vec();
    out.extend(argv[4..].iter().cloned());
    if last >= first as i64 {
        out.extend(items[(last as usize + 1)..].iter().cloned());
    } else {
        out.extend(items[first..].iter().cloned());
    }
    Ok(interp.new_list(out))
}

fn cmd_lrange(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 4 {
        return Err(interp.wrong_num_args(argv, "list first last"));
    }
    let items = interp.get_list(&argv[1])?;
    let len = items.len();
    let first = resolve_index(interp, &argv[2], len)?.max(0) as usize;
    let last = resolve_index(interp, &argv[3], len)?.min(len as i64 - 1);
    if last < first as i64 || first >= len {
        return Ok(interp.empty());
    }
    Ok(interp.new_list(items[first..=last as usize].to_vec()))
}

fn cmd_lrepeat(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(argv, "count ?value ...?"));
    }
    let count = interp.get_int(&argv[1])?;
    if count < 0 {
        return Err(interp.error(format!("bad count \"{}\"", count)));
    }
    let mut items = Vec::with_capacity(count as usize * argv[2..].len());
    for _ in 0..count {
        items.extend(argv[2..].iter().cloned());
    }
    Ok(interp.new_list(items))
}

fn cmd_lreverse(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 {
        return Err(interp.wrong_num_args(argv, "list"));
    }
    let mut items = interp.get_list(&argv[1])?;
    items.reverse();
    Ok(interp.new_list(items))
}

fn cmd_concat(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    Ok(concat_values(interp, &argv[1..]))
}

fn cmd_join(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(argv, "list ?joinString?"));
    }
    let sep = match argv.get(2) {
        Some(v) => v.as_string().to_string(),
        None => " ".to_string(),
    };
    let items = interp.get_list(&argv[1])?;
    let joined = items
        .iter()
        .map(|v| v.as_string().to_string())
        .collect::<Vec<_>>()
        .join(&sep);
    Ok(interp.new_string(&joined))
}

fn cmd_split(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() != 2 && argv.len() != 3 {
        return Err(interp.wrong_num_args(argv, "string ?splitChars?"));
    }
    let s = argv[1].as_string();
    let separators: Vec<char> = match argv.get(2) {
        Some(v) => v.as_string().chars().collect(),
        None => vec![' ', '\t', '\n', '\r'],
    };
    let mut items = Vec::new();
    if separators.is_empty() {
        for c in s.chars() {
            items.push(interp.new_string(&c.to_string()));
        }
    } else {
        for piece in s.split(|c: char| separators.contains(&c)) {
            items.push(interp.new_string(piece));
        }
    }
    Ok(interp.new_list(items))
}

// ---------------------------------------------------------------------------
// lsort
// ---------------------------------------------------------------------------

fn cmd_lsort(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    const USAGE: &str = "?options? list";
    #[derive(Clone, Copy, PartialEq)]
    enum SortBy {
        Ascii,
        NoCase,
        Integer,
        Command,
    }
    let mut by = SortBy::Ascii;
    let mut command: Option<Value> = None;
    let mut decreasing = false;
    let mut i = 1;
    while i + 1 < argv.len() {
        let s = argv[i].as_string();
        match &*s {
            "-ascii" => by = SortBy::Ascii,
            "-nocase" => by = SortBy::NoCase,
            "-integer" => by = SortBy::Integer,
            "-increasing" => decreasing = false,
            "-decreasing" => decreasing = true,
            "-command" => {
                by = SortBy::Command;
                i += 1;
                if i + 1 >= argv.len() {
                    return Err(interp.wrong_num_args(argv, USAGE));
                }
                command = Some(argv[i].clone());
            }
            _ => {
                return Err(interp.error(format!(
                    "bad option \"{}\": must be -ascii, -nocase, -integer, -command, -increasing, or -decreasing",
                    s
                )))
            }
        }
        i += 1;
    }
    if i != argv.len() - 1 {
        return Err(interp.wrong_num_args(argv, USAGE));
    }
    let mut items = interp.get_list(&argv[i])?;

    match by {
        SortBy::Integer => {
            // Parse up front so bad elements fail before the sort runs.
            let mut keyed: Vec<(i64, Value)> = Vec::with_capacity(items.len());
            for item in &items {
                let key = interp.get_int(item)?;
                keyed.push((key, item.clone()));
            }
            keyed.sort_by_key(|(k, _)| *k);
            items = keyed.into_iter().map(|(_, v)| v).collect();
        }
        SortBy::Ascii => {
            items.sort_by(|a, b| a.as_string().cmp(&b.as_string()));
        }
        SortBy::NoCase => {
            items.sort_by(|a, b| {
                a.as_string()
                    .to_lowercase()
                    .cmp(&b.as_string().to_lowercase())
            });
        }
        SortBy::Command => {
            let cmd = command.expect("-command requires an argument");
            // The first comparator error latches: remaining comparisons keep
            // the original order instead of invoking the script again, and
            // the error surfaces once the sort completes.
            let mut failed: Option<Flow> = None;
            items.sort_by(|a, b| {
                if failed.is_some() {
                    return Ordering::Equal;
                }
                let call = vec![cmd.clone(), a.clone(), b.clone()];
                match interp.eval_argv(call).and_then(|r| interp.get_int(&r)) {
                    Ok(n) => n.cmp(&0),
                    Err(flow) => {
                        failed = Some(flow);
                        Ordering::Equal
                    }
                }
            });
            if let Some(flow) = failed {
                return Err(flow);
            }
        }
    }
    if decreasing {
        items.reverse();
    }
    Ok(interp.new_list(items))
}

// ---------------------------------------------------------------------------
// lsearch
// ---------------------------------------------------------------------------

fn cmd_lsearch(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    const USAGE: &str = "?options? list pattern";
    #[derive(Clone, Copy, PartialEq)]
    enum Match {
        Exact,
        Glob,
        Regexp,
        Command,
    }
    let mut mode = Match::Exact;
    let mut command: Option<Value> = None;
    let mut nocase = false;
    let mut negated = false;
    let mut inline = false;
    let mut all = false;
    let mut as_bool = false;
    let mut start = 0usize;
    let mut i = 1;
    while i + 2 < argv.len() {
        let s = argv[i].as_string();
        match &*s {
            "-exact" => mode = Match::Exact,
            "-glob" => mode = Match::Glob,
            "-regexp" => mode = Match::Regexp,
            "-command" => {
                mode = Match::Command;
                i += 1;
                if i + 2 >= argv.len() {
                    return Err(interp.wrong_num_args(argv, USAGE));
                }
                command = Some(argv[i].clone());
            }
            "-nocase" => nocase = true,
            "-not" => negated = true,
            "-inline" => inline = true,
            "-all" => all = true,
            "-bool" => as_bool = true,
            "-start" => {
                i += 1;
                if i + 2 >= argv.len() {
                    return Err(interp.wrong_num_args(argv, USAGE));
                }
                let n = interp.get_int(&argv[i])?;
                start = n.max(0) as usize;
            }
            _ => {
                return Err(interp.error(format!(
                    "bad option \"{}\": must be -exact, -glob, -regexp, -command, -bool, -not, -nocase, -inline, -all, or -start",
                    s
                )))
            }
        }
        i += 1;
    }
    if argv.len() != i + 2 {
        return Err(interp.wrong_num_args(argv, USAGE));
    }
    let items = interp.get_list(&argv[i])?;
    let pattern = &argv[i + 1];
    let pattern_str = pattern.as_string();

    let mut results: Vec<Value> = Vec::new();
    for (idx, item) in items.iter().enumerate().skip(start) {
        let item_str = item.as_string();
        let hit = match mode {
            Match::Exact => {
                if nocase {
                    item_str.eq_ignore_ascii_case(&pattern_str)
                } else {
                    *item_str == *pattern_str
                }
            }
            Match::Glob => glob_match(&pattern_str, &item_str, nocase),
            Match::Regexp => crate::strings::regex_match(interp, pattern, &item_str, nocase)?,
            Match::Command => {
                let cmd = command.clone().expect("-command requires an argument");
                let call = vec![cmd, pattern.clone(), item.clone()];
                let r = interp.eval_argv(call)?;
                interp.get_bool(&r)?
            }
        };
        let hit = hit != negated;
        if all {
            if as_bool {
                results.push(interp.new_bool(hit));
            } else if hit {
                if inline {
                    results.push(item.clone());
                } else {
                    results.push(interp.new_int(idx as i64));
                }
            }
            continue;
        }
        if hit {
            return Ok(if as_bool {
                interp.new_bool(true)
            } else if inline {
                item.clone()
            } else {
                interp.new_int(idx as i64)
            });
        }
    }
    if all {
        return Ok(interp.new_list(results));
    }
    Ok(if as_bool {
        interp.new_bool(false)
    } else if inline {
        interp.empty()
    } else {
        interp.new_int(-1)
    })
}

// ---------------------------------------------------------------------------
// dict
// ---------------------------------------------------------------------------

const DICT_SUBCOMMANDS: &[&str] = &["create", "exists", "get", "keys", "set", "size", "unset"];

fn dict_set_path(
    interp: &mut Interp,
    dict: &Value,
    path: &[Value],
    value: Value,
) -> Result<(), Flow> {
    if path.len() == 1 {
        return dict_mut_set(interp, dict, &path[0], value);
    }
    let inner = match dict_get(interp, dict, &path[0])? {
        Some(existing) => interp.duplicate(&existing),
        None => interp.new_dict(Vec::new()),
    };
    dict_set_path(interp, &inner, &path[1..], value)?;
    dict_mut_set(interp, dict, &path[0], inner)
}

fn dict_unset_path(interp: &mut Interp, dict: &Value, path: &[Value]) -> Result<(), Flow> {
    if path.len() == 1 {
        dict_mut_unset(interp, dict, &path[0])?;
        return Ok(());
    }
    let Some(existing) = dict_get(interp, dict, &path[0])? else {
        return Err(interp.error(format!(
            "key \"{}\" not known in dictionary",
            path[0].as_string()
        )));
    };
    let inner = interp.duplicate(&existing);
    dict_unset_path(interp, &inner, &path[1..])?;
    dict_mut_set(interp, dict, &path[0], inner)
}

fn cmd_dict(interp: &mut Interp, argv: &[Value]) -> CmdResult {
    if argv.len() < 2 {
        return Err(interp.wrong_num_args(argv, "subcommand ?arguments ...?"));
    }
    let sub = resolve_enum(interp, &argv[1], DICT_SUBCOMMANDS, "subcommand")?;
    match DICT_SUBCOMMANDS[sub] {
        "create" => {
            if argv.len() % 2 != 0 {
                return Err(interp.wrong_num_args(argv, "create ?key value ...?"));
            }
            let mut pairs: Vec<(Value, Value)> = Vec::new();
            for chunk in argv[2..].chunks(2) {
                let key = chunk[0].clone();
                let val = chunk[1].clone();
                match pairs.iter_mut().find(|(k, _)| k.string_eq(&key)) {
                    Some(existing) => existing.1 = val,
                    None => pairs.push((key, val)),
                }
            }
            Ok(interp.new_dict(pairs))
        }
        "get" => {
            if argv.len() < 3 {
                return Err(interp.wrong_num_args(argv, "get dictionary ?key ...?"));
            }
            let mut current = argv[2].clone();
            for key in &argv[3..] {
                match dict_get(interp, &current, key)? {
                    Some(v) => current = v,
                    None => {
                        return Err(interp.error(format!(
                            "key \"{}\" not known in dictionary",
                            key.as_string()
                        )))
                    }
                }
            }
            Ok(current)
        }
        "set" => {
            if argv.len() < 5 {
                return Err(interp.wrong_num_args(argv, "set dictVar key ?key ...? value"));
            }
            let name = argv[2].as_string();
            let target = if interp.var_exists(&name) {
                interp.var_mut_value(&argv[2])?
            } else {
                let fresh = interp.new_dict(Vec::new());
                interp.set_var_value(&argv[2], fresh.clone())?;
                fresh
            };
            let value = argv[argv.len() - 1].clone();
            dict_set_path(interp, &target, &argv[3..argv.len() - 1], value)?;
            Ok(target)
        }
        "unset" => {
            if argv.len() < 4 {
                return Err(interp.wrong_num_args(argv, "unset dictVar key ?key ...?"));
            }
            let target = interp.var_mut_value(&argv[2])?;
            dict_unset_path(interp, &target, &argv[3..])?;
            Ok(target)
        }
        "exists" => {
            if argv.len() < 4 {
                return Err(interp.wrong_num_args(argv, "exists dictionary key ?key ...?"));
            }
            let mut current = argv[2].clone();
            for (n, key) in argv[3..].iter().enumerate() {
                match dict_get(interp, &current, key) {
                    Ok(Some(v)) => current = v,
                    Ok(None) => return Ok(interp.new_bool(false)),
                    Err(flow) => {
                        // A malformed nested value is only an error for
                        // intermediate keys.
                        if n == argv.len() - 4 {
                            interp.clear_error();
                            return Ok(interp.new_bool(false));
                        }
                        return Err(flow);
                    }
                }
            }
            Ok(interp.new_bool(true))
        }
        "keys" => {
            if argv.len() != 3 && argv.len() != 4 {
                return Err(interp.wrong_num_args(argv, "keys dictionary ?pattern?"));
            }
            let pairs = dict_pairs(interp, &argv[2])?;
            let pattern = argv.get(3).map(|p| p.as_string());
            let keys: Vec<Value> = pairs
                .into_iter()
                .map(|(k, _)| k)
                .filter(|k| {
                    pattern
                        .as_ref()
                        .is_none_or(|p| glob_match(p, &k.as_string(), false))
                })
                .collect();
            Ok(interp.new_list(keys))
        }
        "size" => {
            if argv.len() != 3 {
                return Err(interp.wrong_num_args(argv, "size dictionary"));
            }
            let len = dict_pairs(interp, &argv[2])?.len() as i64;
            Ok(interp.new_int(len))
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
    fn test_list_and_llength() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "list a b {c d}"), "a b {c d}");
        assert_eq!(eval(&mut interp, "llength {a b {c d}}"), "3");
        assert_eq!(eval(&mut interp, "llength {}"), "0");
    }

    #[test]
    fn test_lindex_nested() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "lindex {a b c} 1"), "b");
        assert_eq!(eval(&mut interp, "lindex {a b c} end"), "c");
        assert_eq!(eval(&mut interp, "lindex {{a b} {c d}} 1 0"), "c");
        assert_eq!(eval(&mut interp, "lindex {a b c} 10"), "");
    }

    #[test]
    fn test_lset() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "set l {a b c}; lset l 1 X"), "a X c");
        assert_eq!(eval(&mut interp, "set l {{a b} c}; lset l 0 1 Y; set l"), "{a Y} c");
        assert!(eval(&mut interp, "set l {a}; lset l 5 X").starts_with("ERR:"));
    }

    #[test]
    fn test_lappend_creates_and_appends() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "lappend fresh a b"), "a b");
        assert_eq!(eval(&mut interp, "lappend fresh c; set fresh"), "a b c");
    }

    #[test]
    fn test_linsert_lreplace_lrange() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "linsert {a c} 1 b"), "a b c");
        assert_eq!(eval(&mut interp, "linsert {a b} end x"), "a b x");
        assert_eq!(eval(&mut interp, "lreplace {a b c d} 1 2 X"), "a X d");
        assert_eq!(eval(&mut interp, "lreplace {a b c} 1 0 X"), "a X b c");
        assert_eq!(eval(&mut interp, "lrange {a b c d e} 1 3"), "b c d");
        assert_eq!(eval(&mut interp, "lrange {a b c} 1 end"), "b c");
        assert_eq!(eval(&mut interp, "lrange {a b c} 5 7"), "");
    }

    #[test]
    fn test_lrepeat_lreverse() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "lrepeat 3 a b"), "a b a b a b");
        assert_eq!(eval(&mut interp, "lreverse {1 2 3}"), "3 2 1");
    }

    #[test]
    fn test_lsort_modes() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "lsort {b a c}"), "a b c");
        assert_eq!(eval(&mut interp, "lsort -integer {10 2 1}"), "1 2 10");
        assert_eq!(eval(&mut interp, "lsort -decreasing {a c b}"), "c b a");
        assert_eq!(eval(&mut interp, "lsort -nocase {B a C}"), "a B C");
    }

    #[test]
    fn test_lsort_command_error_latches() {
        let mut interp = Interp::new();
        interp
            .eval("set calls 0; proc boom {a b} { incr ::calls; error nope }")
            .unwrap();
        assert!(eval(&mut interp, "lsort -command boom {3 1 2 5 4}").starts_with("ERR:"));
        // Only the first comparison invoked the script.
        assert_eq!(eval(&mut interp, "set calls"), "1");
    }

    #[test]
    fn test_lsearch_modes() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "lsearch {a b c} b"), "1");
        assert_eq!(eval(&mut interp, "lsearch {a b c} x"), "-1");
        assert_eq!(eval(&mut interp, "lsearch -glob {foo bar baz} b*"), "1");
        assert_eq!(eval(&mut interp, "lsearch -all -glob {foo bar baz} b*"), "1 2");
        assert_eq!(eval(&mut interp, "lsearch -inline {a bb c} bb"), "bb");
        assert_eq!(eval(&mut interp, "lsearch -bool {a b} b"), "1");
        assert_eq!(eval(&mut interp, "lsearch -not {a b} a"), "1");
        assert_eq!(eval(&mut interp, "lsearch -start 1 {a a a} a"), "1");
    }

    #[test]
    fn test_join_split() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "join {a b c} -"), "a-b-c");
        assert_eq!(eval(&mut interp, "join {a b c}"), "a b c");
        assert_eq!(eval(&mut interp, "split a,b,,c ,"), "a b {} c");
        assert_eq!(eval(&mut interp, "split {a b}"), "a b");
        assert_eq!(eval(&mut interp, "llength [split abc {}]"), "3");
    }

    #[test]
    fn test_dict_basics() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "dict get [dict create k v] k"), "v");
        assert_eq!(eval(&mut interp, "dict size {a 1 b 2}"), "2");
        assert_eq!(eval(&mut interp, "dict keys {a 1 b 2}"), "a b");
        assert_eq!(eval(&mut interp, "dict exists {a 1} a"), "1");
        assert_eq!(eval(&mut interp, "dict exists {a 1} b"), "0");
        assert!(eval(&mut interp, "dict get {a 1} b").starts_with("ERR:"));
    }

    #[test]
    fn test_dict_set_unset_nested() {
        let mut interp = Interp::new();
        assert_eq!(eval(&mut interp, "dict set d a 1"), "a 1");
        assert_eq!(eval(&mut interp, "dict set d b 2; dict get $d b"), "2");
        assert_eq!(eval(&mut interp, "dict set nested x y 5; dict get $nested x y"), "5");
        assert_eq!(eval(&mut interp, "dict unset d a; dict keys $d"), "b");
    }

    #[test]
    fn test_dict_insertion_order() {
        let mut interp = Interp::new();
        assert_eq!(
            eval(&mut interp, "dict keys [dict create c 1 a 2 b 3]"),
            "c a b"
        );
        // Re-setting an existing key keeps its original position.
        assert_eq!(
            eval(&mut interp, "set d {a 1 b 2}; dict set d a 9; dict keys $d"),
            "a b"
        );
    }
}
