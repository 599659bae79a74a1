//! The interpreter: root container and command evaluator.
//!
//! An [`Interp`] owns everything: the command table, the call-frame stack,
//! the live-value registry, the reference table, the current result and
//! error state, epoch counters for the lookup caches, the PRNG, and the
//! output buffer. All runtime state mutation happens through `&mut Interp`;
//! every other module is a stateless helper over it.
//!
//! Script-level control flow travels as `Result<Value, Flow>`: `Ok` carries
//! the command result, `Err(Flow::...)` carries errors, `return`, `break`,
//! `continue`, signals, `exit`, and tail calls. No Rust panics or host
//! exceptions are involved; the public `eval` entry points convert an
//! escaped flow into [`crate::Error`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};

use crate::error::Error;
use crate::reference::RefRecord;
use crate::script::{interpolate_tokens, ScriptProgram};
use crate::value::{
    parse_boolean, parse_double, parse_int, Repr, ReturnCode, SeqIndex, Value, ValueCell,
};

/// Default limit on nested procedure/eval levels.
pub const MAX_NESTING_DEPTH: usize = 5000;

/// Cap on consecutive `unknown` handler recursions.
const MAX_UNKNOWN_RECURSION: usize = 50;

/// Non-`Ok` completion of a command, threaded through every evaluator call.
///
/// `Error` carries no payload: the message lives in the interpreter result
/// and the error location and stack trace in the interpreter error state,
/// where `catch` and the embedding boundary can read them.
#[derive(Debug)]
pub enum Flow {
    Error,
    Return {
        code: ReturnCode,
        level: usize,
        value: Value,
    },
    Break,
    Continue,
    Signal,
    Exit(i64),
    Tailcall(Vec<Value>),
}

/// Result type for command implementations.
pub type CmdResult = Result<Value, Flow>;

/// Signature of a native command.
pub(crate) type NativeFn = Rc<dyn Fn(&mut Interp, &[Value]) -> CmdResult>;

pub(crate) enum CmdImpl {
    Native(NativeFn),
    Proc(Rc<ProcDef>),
}

/// A named callable: either a native function or a user procedure.
pub(crate) struct Command {
    pub imp: CmdImpl,
}

/// Precomputed argument structure of a procedure.
pub(crate) struct ArgSpec {
    pub left: Vec<Rc<str>>,
    pub optionals: Vec<(Rc<str>, Value)>,
    pub rest: bool,
    pub right: Vec<Rc<str>>,
    /// Rendered parameter list for "wrong # args" messages.
    pub signature: String,
}

pub(crate) struct ProcDef {
    pub arg_list: Value,
    pub body: Value,
    pub statics: Option<Rc<RefCell<HashMap<Rc<str>, Value>>>>,
    pub spec: ArgSpec,
}

// ---------------------------------------------------------------------------
// Variables and call frames
// ---------------------------------------------------------------------------

pub(crate) enum Var {
    Val(Value),
    /// An upvar/global alias: reads and writes recurse to `frame` under
    /// `name`.
    Link { frame: usize, name: Rc<str> },
    /// Tombstone left by `unset`; the slot index stays valid so stale caches
    /// cannot alias a different variable.
    Undefined,
}

pub(crate) struct VarTable {
    /// Generation stamp validated by `Repr::VarRef` caches. Reassigned
    /// whenever resolution through this table may change (unset, link
    /// install).
    pub id: u64,
    names: HashMap<Rc<str>, usize>,
    slots: Vec<Var>,
}

impl VarTable {
    fn new(id: u64) -> VarTable {
        VarTable {
            id,
            names: HashMap::new(),
            slots: Vec::new(),
        }
    }

    fn slot_of(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    fn define(&mut self, name: &str) -> usize {
        if let Some(slot) = self.names.get(name) {
            return *slot;
        }
        let slot = self.slots.len();
        self.slots.push(Var::Undefined);
        self.names.insert(Rc::from(name), slot);
        slot
    }

    pub(crate) fn visible_names(&self) -> impl Iterator<Item = &Rc<str>> {
        self.names
            .iter()
            .filter(|&(_, &slot)| !matches!(self.slots[slot], Var::Undefined))
            .map(|(name, _)| name)
    }
}

/// A procedure invocation record.
pub(crate) struct CallFrame {
    pub table: VarTable,
    /// Depth number: 0 for the global frame.
    pub level: usize,
    /// Index of the caller's frame in the frame stack.
    pub parent: usize,
    /// The argument vector of the invocation (`info level N`).
    pub argv: Vec<Value>,
    pub proc_name: Option<Rc<str>>,
    pub statics: Option<Rc<RefCell<HashMap<Rc<str>, Value>>>>,
}

enum VarLoc {
    Slot(usize, usize),
    Static(Rc<RefCell<HashMap<Rc<str>, Value>>>, Rc<str>),
    Missing(usize, Rc<str>),
}

// ---------------------------------------------------------------------------
// Miscellaneous interpreter-owned state
// ---------------------------------------------------------------------------

/// xorshift64* generator backing `rand`.
struct Prng(u64);

impl Prng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }
}

/// Result of running a script with output capture.
#[derive(Debug)]
pub struct CaptureOutput {
    /// The result value of the script.
    pub value: Value,
    /// Lines written by `puts` while capturing.
    pub output: Vec<String>,
}

/// An embeddable command-language interpreter.
///
/// # Example
///
/// ```
/// use littcl::Interp;
///
/// let mut interp = Interp::new();
/// let result = interp.eval("set x 5; incr x; set x").unwrap();
/// assert_eq!(&*result.as_string(), "6");
/// ```
///
/// Native commands registered by the host receive the interpreter and the
/// substituted argument vector:
///
/// ```
/// use littcl::Interp;
///
/// let mut interp = Interp::new();
/// interp.register("double", |interp, argv| {
///     let n = interp.get_int(&argv[1])?;
///     Ok(interp.new_int(n * 2))
/// });
/// assert_eq!(&*interp.eval("double 21").unwrap().as_string(), "42");
/// ```
pub struct Interp {
    // Commands
    commands: HashMap<String, Rc<Command>>,
    /// Bumped on any command create/rename/delete; validates command caches.
    pub(crate) proc_epoch: u64,

    // Call frames
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) current: usize,
    table_id_counter: u64,
    pub(crate) num_levels: usize,
    max_nesting_depth: usize,
    unknown_depth: usize,

    // Values
    pub(crate) result: Value,
    empty_value: Value,
    live: Vec<Weak<ValueCell>>,
    live_prune_mark: usize,

    // Error state
    err_in_progress: bool,
    trace_pending: bool,
    pub(crate) error_file: Rc<str>,
    pub(crate) error_line: u32,
    /// (procname, file, line) triples, innermost first.
    stack_trace: Vec<(String, Rc<str>, u32)>,
    pub(crate) custom_errorinfo: Option<Value>,

    // Script location
    current_file_name: Rc<str>,
    pub(crate) current_line: u32,
    filenames: HashMap<String, Rc<str>>,

    // References
    pub(crate) references: HashMap<u64, RefRecord>,
    pub(crate) next_ref_id: u64,
    pub(crate) last_collect_id: u64,
    pub(crate) last_collect_time: Instant,
    pub(crate) collecting: bool,

    // Signals
    sigmask: Arc<AtomicU64>,
    pub(crate) signal_level: usize,

    // Host state
    assoc: HashMap<String, Rc<dyn Any>>,
    prng: Prng,
    executable_name: Option<String>,

    // Output
    capturing: bool,
    out_lines: Vec<String>,
    out_pending: String,
}

impl Interp {
    /// Create an interpreter with the core command set registered.
    pub fn new() -> Interp {
        let empty_value = Value::alloc(Some(Rc::from("")), Repr::None);
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E3779B97F4A7C15)
            | 1;
        let mut interp = Interp {
            commands: HashMap::new(),
            proc_epoch: 1,
            frames: vec![CallFrame {
                table: VarTable::new(1),
                level: 0,
                parent: 0,
                argv: Vec::new(),
                proc_name: None,
                statics: None,
            }],
            current: 0,
            table_id_counter: 1,
            num_levels: 0,
            max_nesting_depth: MAX_NESTING_DEPTH,
            unknown_depth: 0,
            result: empty_value.clone(),
            empty_value,
            live: Vec::new(),
            live_prune_mark: 1024,
            err_in_progress: false,
            trace_pending: false,
            error_file: Rc::from(""),
            error_line: 0,
            stack_trace: Vec::new(),
            custom_errorinfo: None,
            current_file_name: Rc::from(""),
            current_line: 1,
            filenames: HashMap::new(),
            references: HashMap::new(),
            next_ref_id: 1,
            last_collect_id: 1,
            last_collect_time: Instant::now(),
            collecting: false,
            sigmask: Arc::new(AtomicU64::new(0)),
            signal_level: 0,
            assoc: HashMap::new(),
            prng: Prng(seed),
            executable_name: None,
            capturing: false,
            out_lines: Vec::new(),
            out_pending: String::new(),
        };
        interp.register_core_commands();
        interp
    }

    /// Register the full built-in command set. `new` already does this;
    /// exposed for hosts that delete commands and want them back.
    pub fn register_core_commands(&mut self) {
        crate::commands::register(self);
        crate::lists::register(self);
        crate::strings::register(self);
    }

    // -----------------------------------------------------------------------
    // Value construction and the live registry
    // -----------------------------------------------------------------------

    pub(crate) fn new_value(&mut self, string: Option<Rc<str>>, repr: Repr) -> Value {
        let v = Value::alloc(string, repr);
        self.track(&v);
        v
    }

    fn track(&mut self, v: &Value) {
        self.live.push(Rc::downgrade(&v.cell));
        if self.live.len() >= self.live_prune_mark {
            self.prune_live();
        }
    }

    fn prune_live(&mut self) {
        self.live.retain(|w| w.strong_count() > 0);
        self.live_prune_mark = (self.live.len() * 2).max(1024);
    }

    /// Iterate all live values for the reference collector.
    pub(crate) fn live_values(&mut self) -> Vec<Value> {
        self.prune_live();
        self.live
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|cell| Value { cell })
            .collect()
    }

    /// The shared empty-string value.
    pub fn empty(&self) -> Value {
        self.empty_value.clone()
    }

    pub fn new_string(&mut self, s: &str) -> Value {
        if s.is_empty() {
            return self.empty();
        }
        self.new_value(Some(Rc::from(s)), Repr::None)
    }

    /// A string value decorated with its source location.
    pub(crate) fn new_sourced_string(&mut self, s: &str, file: &Rc<str>, line: u32) -> Value {
        self.new_value(
            Some(Rc::from(s)),
            Repr::Source {
                file: Rc::clone(file),
                line,
            },
        )
    }

    pub fn new_int(&mut self, i: i64) -> Value {
        self.new_value(None, Repr::Int(i))
    }

    pub fn new_double(&mut self, d: f64) -> Value {
        self.new_value(None, Repr::Double(d))
    }

    pub fn new_bool(&mut self, b: bool) -> Value {
        self.new_int(i64::from(b))
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        self.new_value(None, Repr::List(items))
    }

    pub fn new_dict(&mut self, pairs: Vec<(Value, Value)>) -> Value {
        self.new_value(None, Repr::Dict(pairs))
    }

    /// Deep-enough copy: a fresh unshared cell with the same string rep and a
    /// duplicated internal rep (containers copy their element handles).
    pub fn duplicate(&mut self, v: &Value) -> Value {
        let string = v.peek_string();
        let repr = match &*v.cell.repr.borrow() {
            Repr::None => Repr::None,
            Repr::Int(i) => Repr::Int(*i),
            Repr::Double(d) => Repr::Double(*d),
            Repr::CoercedDouble(i) => Repr::CoercedDouble(*i),
            Repr::Index(idx) => Repr::Index(*idx),
            Repr::ReturnCode(c) => Repr::ReturnCode(*c),
            Repr::List(items) => Repr::List(items.clone()),
            Repr::Dict(pairs) => Repr::Dict(pairs.clone()),
            Repr::Script(p) => Repr::Script(Rc::clone(p)),
            Repr::Expr(p) => Repr::Expr(Rc::clone(p)),
            Repr::Source { file, line } => Repr::Source {
                file: Rc::clone(file),
                line: *line,
            },
            Repr::Reference { id, tag } => Repr::Reference {
                id: *id,
                tag: *tag,
            },
            Repr::Command { epoch, cmd } => Repr::Command {
                epoch: *epoch,
                cmd: Weak::clone(cmd),
            },
            Repr::VarRef { table_id, slot } => Repr::VarRef {
                table_id: *table_id,
                slot: *slot,
            },
            Repr::DictSugar { var, key } => Repr::DictSugar {
                var: var.clone(),
                key: key.clone(),
            },
            Repr::Regexp { nocase, re } => Repr::Regexp {
                nocase: *nocase,
                re: Rc::clone(re),
            },
            Repr::ScanFormat(p) => Repr::ScanFormat(Rc::clone(p)),
        };
        self.new_value(string, repr)
    }

    pub(crate) fn intern_filename(&mut self, name: &str) -> Rc<str> {
        if let Some(interned) = self.filenames.get(name) {
            return Rc::clone(interned);
        }
        let interned: Rc<str> = Rc::from(name);
        self.filenames.insert(name.to_string(), Rc::clone(&interned));
        interned
    }

    pub(crate) fn current_file(&self) -> Rc<str> {
        Rc::clone(&self.current_file_name)
    }

    // -----------------------------------------------------------------------
    // Errors and the stack trace
    // -----------------------------------------------------------------------

    /// Raise a script error with `msg` as the interpreter result.
    pub fn error(&mut self, msg: impl Into<String>) -> Flow {
        let msg = msg.into();
        let v = self.new_string(&msg);
        self.set_error_value(v)
    }

    pub(crate) fn set_error_value(&mut self, v: Value) -> Flow {
        self.result = v;
        if !self.err_in_progress {
            self.err_in_progress = true;
            self.trace_pending = true;
            self.stack_trace.clear();
            self.custom_errorinfo = None;
            self.error_file = self.current_file();
            self.error_line = self.current_line;
        }
        Flow::Error
    }

    /// Raise an error locating a specific file/line (parse errors).
    pub(crate) fn error_at(&mut self, file: &Rc<str>, line: u32, msg: String) -> Flow {
        self.current_file_name = Rc::clone(file);
        self.current_line = line;
        self.error(msg)
    }

    /// Mark that the next enclosing evaluator should append a trace entry.
    pub(crate) fn request_trace(&mut self) {
        self.trace_pending = true;
    }

    fn add_trace(&mut self, proc_name: String, file: Rc<str>, line: u32) {
        let have_file = !file.is_empty();
        if have_file {
            // Back-patch inner entries that had no filename of their own.
            for entry in self.stack_trace.iter_mut().rev() {
                if !entry.1.is_empty() {
                    break;
                }
                entry.1 = Rc::clone(&file);
            }
        }
        self.stack_trace.push((proc_name, file, line));
        self.trace_pending = !have_file;
    }

    /// The stack trace as a flat (procname, file, line) list value,
    /// outermost invocation first.
    pub(crate) fn stack_trace_value(&mut self) -> Value {
        let triples: Vec<(String, Rc<str>, u32)> =
            self.stack_trace.iter().rev().cloned().collect();
        let mut items = Vec::with_capacity(triples.len() * 3);
        for (proc_name, file, line) in triples {
            items.push(self.new_string(&proc_name));
            items.push(self.new_string(&file));
            items.push(self.new_int(i64::from(line)));
        }
        self.new_list(items)
    }

    pub(crate) fn clear_error(&mut self) {
        self.err_in_progress = false;
        self.trace_pending = false;
    }

    /// Source location of the most recent error: (file, line).
    pub fn error_location(&self) -> (String, u32) {
        (self.error_file.to_string(), self.error_line)
    }

    /// Format a "wrong # args" error for the command named by `argv[0]`.
    pub fn wrong_num_args(&mut self, argv: &[Value], usage: &str) -> Flow {
        let head = argv[0].as_string();
        self.wrong_num_args_msg(&head, usage)
    }

    pub(crate) fn wrong_num_args_msg(&mut self, head: &str, usage: &str) -> Flow {
        let msg = if usage.is_empty() {
            format!("wrong # args: should be \"{}\"", head)
        } else {
            format!("wrong # args: should be \"{} {}\"", head, usage)
        };
        self.error(msg)
    }

    // -----------------------------------------------------------------------
    // Coercing reads
    // -----------------------------------------------------------------------

    /// Read a value as a wide integer, shimmering the internal rep.
    pub fn get_int(&mut self, v: &Value) -> Result<i64, Flow> {
        if let Some(i) = v.int_repr() {
            return Ok(i);
        }
        let s = v.as_string();
        match parse_int(&s) {
            Some(i) => {
                v.set_repr(Repr::Int(i));
                Ok(i)
            }
            None => Err(self.error(format!("expected integer but got \"{}\"", s))),
        }
    }

    /// Read a value as a double. Integer-looking values become
    /// `CoercedDouble` so a later integer read stays exact.
    pub fn get_double(&mut self, v: &Value) -> Result<f64, Flow> {
        enum Num {
            D(f64),
            I(i64),
        }
        let cached = match &*v.cell.repr.borrow() {
            Repr::Double(d) => Some(Num::D(*d)),
            Repr::Int(i) | Repr::CoercedDouble(i) => Some(Num::I(*i)),
            _ => None,
        };
        match cached {
            Some(Num::D(d)) => return Ok(d),
            Some(Num::I(i)) => {
                v.set_repr(Repr::CoercedDouble(i));
                return Ok(i as f64);
            }
            None => {}
        }
        let s = v.as_string();
        if let Some(i) = parse_int(&s) {
            v.set_repr(Repr::CoercedDouble(i));
            return Ok(i as f64);
        }
        match parse_double(&s) {
            Some(d) => {
                v.set_repr(Repr::Double(d));
                Ok(d)
            }
            None => Err(self.error(format!(
                "expected floating-point number but got \"{}\"",
                s
            ))),
        }
    }

    /// Read a value as a boolean: numeric truth or one of the boolean
    /// spellings.
    pub fn get_bool(&mut self, v: &Value) -> Result<bool, Flow> {
        if let Some(i) = v.int_repr() {
            return Ok(i != 0);
        }
        if let Some(d) = v.double_repr() {
            return Ok(d != 0.0);
        }
        let s = v.as_string();
        if let Some(b) = parse_boolean(&s) {
            return Ok(b);
        }
        if let Some(i) = parse_int(&s) {
            v.set_repr(Repr::Int(i));
            return Ok(i != 0);
        }
        if let Some(d) = parse_double(&s) {
            v.set_repr(Repr::Double(d));
            return Ok(d != 0.0);
        }
        Err(self.error(format!("expected boolean but got \"{}\"", s)))
    }

    /// Read a value as a sequence index (`3`, `end`, `end-1`, `2+1`).
    pub fn get_index(&mut self, v: &Value) -> Result<SeqIndex, Flow> {
        if let Repr::Index(idx) = &*v.cell.repr.borrow() {
            return Ok(*idx);
        }
        let s = v.as_string();
        match parse_index(&s) {
            Some(idx) => {
                v.set_repr(Repr::Index(idx));
                Ok(idx)
            }
            None => Err(self.error(format!(
                "bad index \"{}\": must be integer?[+-]integer? or end?[+-]integer?",
                s
            ))),
        }
    }

    pub fn get_return_code(&mut self, v: &Value) -> Result<ReturnCode, Flow> {
        if let Repr::ReturnCode(code) = &*v.cell.repr.borrow() {
            return Ok(*code);
        }
        let s = v.as_string();
        let code = ReturnCode::from_name(&s).or_else(|| parse_int(&s).map(|i| ReturnCode(i as i32)));
        match code {
            Some(code) => {
                v.set_repr(Repr::ReturnCode(code));
                Ok(code)
            }
            None => Err(self.error(format!("expected return code but got \"{}\"", s))),
        }
    }

    /// Read a value as a list, shimmering the internal rep. Returns clones
    /// of the element handles, so callers may evaluate freely while holding
    /// them.
    pub fn get_list(&mut self, v: &Value) -> Result<Vec<Value>, Flow> {
        if let Repr::List(items) = &*v.cell.repr.borrow() {
            return Ok(items.clone());
        }
        let s = v.as_string();
        let elements = match crate::parser::parse_list_elements(&s) {
            Ok(elements) => elements,
            Err(msg) => return Err(self.error(msg)),
        };
        let items: Vec<Value> = elements.iter().map(|e| self.new_string(e)).collect();
        v.set_repr(Repr::List(items.clone()));
        Ok(items)
    }

    pub(crate) fn get_script(&mut self, v: &Value) -> Result<Rc<ScriptProgram>, Flow> {
        if let Repr::Script(p) = &*v.cell.repr.borrow() {
            return Ok(Rc::clone(p));
        }
        let (file, line) = match &*v.cell.repr.borrow() {
            Repr::Source { file, line } => (Rc::clone(file), *line),
            _ => (self.current_file(), self.current_line),
        };
        let s = v.as_string();
        let prog = Rc::new(crate::script::compile_script(self, &s, file, line)?);
        v.set_repr(Repr::Script(Rc::clone(&prog)));
        Ok(prog)
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    fn next_table_id(&mut self) -> u64 {
        self.table_id_counter += 1;
        self.table_id_counter
    }

    /// Route a variable name: a leading `::` retargets the global frame.
    fn route_name<'n>(&self, name: &'n str) -> (usize, &'n str) {
        if let Some(rest) = name.strip_prefix("::") {
            (0, rest)
        } else {
            (self.current, name)
        }
    }

    fn split_sugar(name: &str) -> Option<(&str, &str)> {
        let open = name.find('(')?;
        if open == 0 || !name.ends_with(')') {
            return None;
        }
        Some((&name[..open], &name[open + 1..name.len() - 1]))
    }

    fn locate_var(&self, mut fi: usize, name: &str) -> VarLoc {
        let mut name: Rc<str> = Rc::from(name);
        let mut hops = 0;
        loop {
            let frame = &self.frames[fi];
            if let Some(slot) = frame.table.slot_of(&name) {
                match &frame.table.slots[slot] {
                    Var::Link {
                        frame: target,
                        name: other,
                    } => {
                        hops += 1;
                        if hops > self.frames.len() + 1 {
                            return VarLoc::Missing(fi, name);
                        }
                        fi = *target;
                        name = Rc::clone(other);
                        continue;
                    }
                    Var::Val(_) => return VarLoc::Slot(fi, slot),
                    Var::Undefined => return VarLoc::Missing(fi, name),
                }
            }
            if let Some(statics) = &frame.statics {
                if statics.borrow().contains_key(&name) {
                    return VarLoc::Static(Rc::clone(statics), name);
                }
            }
            return VarLoc::Missing(fi, name);
        }
    }

    /// Read a variable named by `name_val`, using (and refreshing) the
    /// generation-stamped resolution cache on the name value.
    pub(crate) fn get_var_value(&mut self, name_val: &Value) -> Result<Value, Flow> {
        if let Repr::VarRef { table_id, slot } = &*name_val.cell.repr.borrow() {
            let table = &self.frames[self.current].table;
            if table.id == *table_id {
                if let Var::Val(v) = &table.slots[*slot] {
                    return Ok(v.clone());
                }
            }
        }
        let name = name_val.as_string();
        if let Some((base, key)) = Self::split_sugar(&name) {
            return self.read_sugar_parts(&name, base, key);
        }
        let (fi, base) = self.route_name(&name);
        match self.locate_var(fi, base) {
            VarLoc::Slot(f, slot) => {
                let value = match &self.frames[f].table.slots[slot] {
                    Var::Val(v) => v.clone(),
                    _ => unreachable!(),
                };
                // Never install a cache on the shared empty sentinel.
                if f == self.current && fi == self.current && !name.is_empty() {
                    name_val.set_repr(Repr::VarRef {
                        table_id: self.frames[f].table.id,
                        slot,
                    });
                }
                Ok(value)
            }
            VarLoc::Static(statics, key) => {
                let value = statics.borrow().get(&key).cloned();
                Ok(value.expect("static vanished between locate and read"))
            }
            VarLoc::Missing(..) => Err(self.error(format!(
                "can't read \"{}\": no such variable",
                name
            ))),
        }
    }

    /// Write a variable named by `name_val`, creating it in the resolved
    /// frame when missing.
    pub(crate) fn set_var_value(&mut self, name_val: &Value, value: Value) -> Result<(), Flow> {
        if let Repr::VarRef { table_id, slot } = &*name_val.cell.repr.borrow() {
            let table = &mut self.frames[self.current].table;
            if table.id == *table_id {
                if let Var::Val(_) = &table.slots[*slot] {
                    table.slots[*slot] = Var::Val(value);
                    return Ok(());
                }
            }
        }
        let name = name_val.as_string();
        if let Some((base, key)) = Self::split_sugar(&name) {
            return self.write_sugar_parts(&name, base, key, value);
        }
        let (fi, base) = self.route_name(&name);
        match self.locate_var(fi, base) {
            VarLoc::Slot(f, slot) => {
                self.frames[f].table.slots[slot] = Var::Val(value);
                if f == self.current && fi == self.current && !name.is_empty() {
                    name_val.set_repr(Repr::VarRef {
                        table_id: self.frames[f].table.id,
                        slot,
                    });
                }
                Ok(())
            }
            VarLoc::Static(statics, key) => {
                statics.borrow_mut().insert(key, value);
                Ok(())
            }
            VarLoc::Missing(f, final_name) => {
                let slot = self.frames[f].table.define(&final_name);
                self.frames[f].table.slots[slot] = Var::Val(value);
                Ok(())
            }
        }
    }

    /// Unset a variable. Link variables recurse to their target; the link
    /// itself also goes away.
    pub(crate) fn unset_var(&mut self, name_val: &Value, nocomplain: bool) -> Result<(), Flow> {
        let name = name_val.as_string();
        let (fi, base) = self.route_name(&name);
        // Remove a local link slot as well as the linked-to variable.
        if let Some(slot) = self.frames[fi].table.slot_of(base) {
            if matches!(self.frames[fi].table.slots[slot], Var::Link { .. }) {
                let loc = self.locate_var(fi, base);
                let id = self.next_table_id();
                let table = &mut self.frames[fi].table;
                table.slots[slot] = Var::Undefined;
                table.id = id;
                match loc {
                    VarLoc::Slot(f, s) => {
                        let id = self.next_table_id();
                        let table = &mut self.frames[f].table;
                        table.slots[s] = Var::Undefined;
                        table.id = id;
                        return Ok(());
                    }
                    VarLoc::Static(statics, key) => {
                        statics.borrow_mut().remove(&key);
                        return Ok(());
                    }
                    VarLoc::Missing(..) => {
                        if nocomplain {
                            return Ok(());
                        }
                        return Err(self.error(format!(
                            "can't unset \"{}\": no such variable",
                            name
                        )));
                    }
                }
            }
        }
        match self.locate_var(fi, base) {
            VarLoc::Slot(f, slot) => {
                let id = self.next_table_id();
                let table = &mut self.frames[f].table;
                table.slots[slot] = Var::Undefined;
                table.id = id;
                Ok(())
            }
            VarLoc::Static(statics, key) => {
                statics.borrow_mut().remove(&key);
                Ok(())
            }
            VarLoc::Missing(..) => {
                if nocomplain {
                    Ok(())
                } else {
                    Err(self.error(format!("can't unset \"{}\": no such variable", name)))
                }
            }
        }
    }

    pub(crate) fn var_exists(&mut self, name: &str) -> bool {
        if let Some((base, key)) = Self::split_sugar(name) {
            let (fi, base) = self.route_name(base);
            if let VarLoc::Slot(f, slot) = self.locate_var(fi, base) {
                if let Var::Val(container) = &self.frames[f].table.slots[slot] {
                    let container = container.clone();
                    let key_val = self.new_string(key);
                    return match crate::lists::dict_get(self, &container, &key_val) {
                        Ok(found) => found.is_some(),
                        Err(_) => {
                            self.clear_error();
                            false
                        }
                    };
                }
            }
            return false;
        }
        let (fi, base) = self.route_name(name);
        !matches!(self.locate_var(fi, base), VarLoc::Missing(..))
    }

    /// Install a link variable: `local` in the current frame aliasing
    /// `other` in `target_frame`.
    pub(crate) fn link_var(
        &mut self,
        target_frame: usize,
        other: &str,
        local: &str,
    ) -> Result<(), Flow> {
        // Linking a frame to itself under the same name is a no-op alias
        // that would loop forever on lookup.
        if target_frame == self.current && other == local {
            return Err(self.error("can't upvar from variable to itself"));
        }
        if let Some(slot) = self.frames[self.current].table.slot_of(local) {
            match &self.frames[self.current].table.slots[slot] {
                // Re-installing the same link (repeated `global`) is a no-op.
                Var::Link { frame, name } if *frame == target_frame && &**name == other => {
                    return Ok(());
                }
                Var::Undefined => {}
                _ => {
                    return Err(self.error(format!("variable \"{}\" already exists", local)));
                }
            }
        }
        // Walk the target's link chain to reject indirect cycles.
        let mut fi = target_frame;
        let mut name: Rc<str> = Rc::from(other);
        let mut hops = 0;
        loop {
            if fi == self.current && &*name == local {
                return Err(self.error("can't upvar from variable to itself"));
            }
            let frame = &self.frames[fi];
            match frame.table.slot_of(&name).map(|s| &frame.table.slots[s]) {
                Some(Var::Link {
                    frame: target,
                    name: other_name,
                }) => {
                    hops += 1;
                    if hops > self.frames.len() + 1 {
                        break;
                    }
                    fi = *target;
                    name = Rc::clone(other_name);
                }
                _ => break,
            }
        }
        let id = self.next_table_id();
        let table = &mut self.frames[self.current].table;
        let slot = table.define(local);
        table.slots[slot] = Var::Link {
            frame: target_frame,
            name: Rc::from(other),
        };
        table.id = id;
        Ok(())
    }

    pub(crate) fn at_global_frame(&self) -> bool {
        self.current == 0
    }

    /// Switch the current frame (for `uplevel`); returns the previous one.
    pub(crate) fn swap_frame(&mut self, target: usize) -> usize {
        std::mem::replace(&mut self.current, target)
    }

    pub(crate) fn current_level(&self) -> usize {
        self.frames[self.current].level
    }

    /// Sorted visible variable names of a frame (the current one when
    /// `frame` is `None`).
    pub(crate) fn frame_var_names(&self, frame: Option<usize>) -> Vec<String> {
        let frame = frame.unwrap_or(self.current);
        let mut names: Vec<String> = self.frames[frame]
            .table
            .visible_names()
            .map(|n| n.to_string())
            .collect();
        names.sort();
        names
    }

    /// The invocation argument vector of the frame at a level spec: positive
    /// levels are absolute, zero and negative are relative to the current
    /// one.
    pub(crate) fn level_argv(&mut self, n: i64) -> Result<Vec<Value>, Flow> {
        let target = if n > 0 {
            n
        } else {
            self.current_level() as i64 + n
        };
        let mut fi = self.current;
        loop {
            if self.frames[fi].level as i64 == target && !self.frames[fi].argv.is_empty() {
                return Ok(self.frames[fi].argv.clone());
            }
            if fi == 0 {
                return Err(self.error(format!("bad level \"{}\"", n)));
            }
            fi = self.frames[fi].parent;
        }
    }

    /// Resolve a level argument (`N` relative or `#N` absolute) to a frame
    /// index along the current parent chain.
    pub(crate) fn resolve_level(&mut self, spec: &str) -> Result<usize, Flow> {
        let bad = |interp: &mut Interp| interp.error(format!("bad level \"{}\"", spec));
        if let Some(abs) = spec.strip_prefix('#') {
            let Ok(level) = abs.parse::<usize>() else {
                return Err(bad(self));
            };
            let mut fi = self.current;
            loop {
                if self.frames[fi].level == level {
                    return Ok(fi);
                }
                if fi == 0 {
                    return Err(bad(self));
                }
                fi = self.frames[fi].parent;
            }
        }
        let Ok(up) = spec.parse::<usize>() else {
            return Err(bad(self));
        };
        let mut fi = self.current;
        for _ in 0..up {
            if fi == 0 {
                return Err(bad(self));
            }
            fi = self.frames[fi].parent;
        }
        Ok(fi)
    }

    /// Read `$name(key)` sugar through its pre-split representation.
    pub(crate) fn read_dict_sugar(&mut self, sugar: &Value) -> Result<Value, Flow> {
        let cached = match &*sugar.cell.repr.borrow() {
            Repr::DictSugar { var, key } => Some((var.clone(), key.clone())),
            _ => None,
        };
        let (var, key) = match cached {
            Some(pair) => pair,
            None => {
                let full = sugar.as_string();
                let Some((base, key)) = Self::split_sugar(&full) else {
                    return self.get_var_value(sugar);
                };
                let var = self.new_string(base);
                let key = self.new_string(key);
                sugar.set_repr(Repr::DictSugar {
                    var: var.clone(),
                    key: key.clone(),
                });
                (var, key)
            }
        };
        let full = sugar.as_string();
        let base = var.as_string();
        let key_text = key.as_string();
        self.read_sugar_with(&full, &base, &key, key_text.contains(['$', '[']))
    }

    fn read_sugar_parts(&mut self, full: &str, base: &str, key: &str) -> Result<Value, Flow> {
        let key_val = self.new_string(key);
        self.read_sugar_with(full, base, &key_val, false)
    }

    fn read_sugar_with(
        &mut self,
        full: &str,
        base: &str,
        key: &Value,
        substitute_key: bool,
    ) -> Result<Value, Flow> {
        let key_val = if substitute_key {
            crate::script::subst(self, key, crate::parser::SubstFlags::default())?
        } else {
            key.clone()
        };
        let (fi, base) = self.route_name(base);
        let container = match self.locate_var(fi, base) {
            VarLoc::Slot(f, slot) => match &self.frames[f].table.slots[slot] {
                Var::Val(v) => v.clone(),
                _ => unreachable!(),
            },
            VarLoc::Static(statics, key) => statics
                .borrow()
                .get(&key)
                .cloned()
                .expect("static vanished between locate and read"),
            VarLoc::Missing(..) => {
                return Err(self.error(format!("can't read \"{}\": no such variable", full)))
            }
        };
        match crate::lists::dict_get(self, &container, &key_val) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(self.error(format!(
                "can't read \"{}\": no such element in array",
                full
            ))),
            Err(_) => Err(self.error(format!("can't read \"{}\": variable isn't array", full))),
        }
    }

    fn write_sugar_parts(
        &mut self,
        full: &str,
        base: &str,
        key: &str,
        value: Value,
    ) -> Result<(), Flow> {
        let (fi, base_name) = self.route_name(base);
        let container = match self.locate_var(fi, base_name) {
            VarLoc::Slot(f, slot) => {
                let current = match &self.frames[f].table.slots[slot] {
                    Var::Val(v) => v.clone(),
                    _ => unreachable!(),
                };
                // Copy-on-write: the slot handle plus ours makes two.
                if current.ref_count() > 2 {
                    let fresh = self.duplicate(&current);
                    self.frames[f].table.slots[slot] = Var::Val(fresh.clone());
                    fresh
                } else {
                    current
                }
            }
            VarLoc::Static(statics, key_name) => {
                let current = statics.borrow().get(&key_name).cloned().unwrap();
                if current.ref_count() > 2 {
                    let fresh = self.duplicate(&current);
                    statics.borrow_mut().insert(key_name, fresh.clone());
                    fresh
                } else {
                    current
                }
            }
            VarLoc::Missing(f, final_name) => {
                let fresh = self.new_dict(Vec::new());
                let slot = self.frames[f].table.define(&final_name);
                self.frames[f].table.slots[slot] = Var::Val(fresh.clone());
                fresh
            }
        };
        let key_val = self.new_string(key);
        if crate::lists::dict_mut_set(self, &container, &key_val, value).is_err() {
            return Err(self.error(format!("can't set \"{}\": variable isn't array", full)));
        }
        Ok(())
    }

    /// Fetch a variable's value for in-place mutation, duplicating it first
    /// if any handle beyond the variable slot and the returned one exists.
    pub(crate) fn var_mut_value(&mut self, name_val: &Value) -> Result<Value, Flow> {
        let current = self.get_var_value(name_val)?;
        if current.ref_count() > 2 {
            let fresh = self.duplicate(&current);
            self.set_var_value(name_val, fresh.clone())?;
            Ok(fresh)
        } else {
            Ok(current)
        }
    }

    // -----------------------------------------------------------------------
    // Host-facing variable helpers
    // -----------------------------------------------------------------------

    /// Set a variable in the current scope.
    ///
    /// # Example
    ///
    /// ```
    /// use littcl::Interp;
    ///
    /// let mut interp = Interp::new();
    /// interp.set_var_str("greeting", "hello").unwrap();
    /// assert_eq!(&*interp.eval("set greeting").unwrap().as_string(), "hello");
    /// ```
    pub fn set_var_str(&mut self, name: &str, value: &str) -> crate::error::Result<()> {
        let name_val = self.new_string(name);
        let value = self.new_string(value);
        let r = self.set_var_value(&name_val, value);
        self.finish(r.map(|()| self.empty())).map(|_| ())
    }

    pub fn set_var(&mut self, name: &str, value: Value) -> crate::error::Result<()> {
        let name_val = self.new_string(name);
        let r = self.set_var_value(&name_val, value);
        self.finish(r.map(|()| self.empty())).map(|_| ())
    }

    pub fn get_var(&mut self, name: &str) -> crate::error::Result<Value> {
        let name_val = self.new_string(name);
        let r = self.get_var_value(&name_val);
        self.finish(r)
    }

    pub fn unset_var_str(&mut self, name: &str) -> crate::error::Result<()> {
        let name_val = self.new_string(name);
        let r = self.unset_var(&name_val, false);
        self.finish(r.map(|()| self.empty())).map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Register a native command.
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut Interp, &[Value]) -> CmdResult + 'static,
    {
        debug!("registering command \"{}\"", name);
        self.commands.insert(
            name.to_string(),
            Rc::new(Command {
                imp: CmdImpl::Native(Rc::new(f)),
            }),
        );
        self.proc_epoch += 1;
    }

    /// Create a user procedure. `statics` follows the `proc` command's
    /// optional statics list.
    pub fn create_proc(
        &mut self,
        name: &str,
        arg_list: Value,
        statics: Option<Value>,
        body: Value,
    ) -> Result<(), Flow> {
        let spec = self.parse_arg_spec(&arg_list)?;
        let statics = match statics {
            Some(list) => Some(self.parse_statics(&list)?),
            None => None,
        };
        self.commands.insert(
            name.to_string(),
            Rc::new(Command {
                imp: CmdImpl::Proc(Rc::new(ProcDef {
                    arg_list,
                    body,
                    statics,
                    spec,
                })),
            }),
        );
        self.proc_epoch += 1;
        Ok(())
    }

    fn parse_arg_spec(&mut self, arg_list: &Value) -> Result<ArgSpec, Flow> {
        let elements = self.get_list(arg_list)?;
        let mut left = Vec::new();
        let mut optionals = Vec::new();
        let mut rest = false;
        let mut right = Vec::new();
        let mut signature = String::new();
        for element in &elements {
            let parts = self.get_list(element)?;
            if !signature.is_empty() {
                signature.push(' ');
            }
            match parts.len() {
                1 => {
                    let name = parts[0].as_string();
                    if &*name == "args" {
                        if rest {
                            return Err(
                                self.error("procedure has \"args\" specified more than once")
                            );
                        }
                        if !right.is_empty() {
                            return Err(self.error(
                                "procedure has \"args\" after required arguments",
                            ));
                        }
                        rest = true;
                        signature.push_str("?arg ...?");
                    } else if rest {
                        right.push(name.clone());
                        signature.push_str(&name);
                    } else if optionals.is_empty() {
                        left.push(name.clone());
                        signature.push_str(&name);
                    } else {
                        right.push(name.clone());
                        signature.push_str(&name);
                    }
                }
                2 => {
                    if rest || !right.is_empty() {
                        return Err(self.error(
                            "procedure has optional argument after required ones",
                        ));
                    }
                    let name = parts[0].as_string();
                    optionals.push((name.clone(), parts[1].clone()));
                    signature.push('?');
                    signature.push_str(&name);
                    signature.push('?');
                }
                _ => {
                    return Err(self.error(format!(
                        "too many fields in argument specifier \"{}\"",
                        element.as_string()
                    )))
                }
            }
        }
        Ok(ArgSpec {
            left,
            optionals,
            rest,
            right,
            signature,
        })
    }

    fn parse_statics(
        &mut self,
        list: &Value,
    ) -> Result<Rc<RefCell<HashMap<Rc<str>, Value>>>, Flow> {
        let elements = self.get_list(list)?;
        let mut map = HashMap::new();
        for element in &elements {
            let parts = self.get_list(element)?;
            match parts.len() {
                1 => {
                    let name = parts[0].as_string();
                    let value = self.get_var_value(&parts[0]).map_err(|_| {
                        self.error(format!(
                            "variable for initialization of static \"{}\" not found in the local context",
                            name
                        ))
                    })?;
                    map.insert(name, value);
                }
                2 => {
                    map.insert(parts[0].as_string(), parts[1].clone());
                }
                _ => {
                    return Err(self.error(format!(
                        "too many fields in static specifier \"{}\"",
                        element.as_string()
                    )))
                }
            }
        }
        Ok(Rc::new(RefCell::new(map)))
    }

    pub fn delete_command(&mut self, name: &str) -> bool {
        let removed = self.commands.remove(name).is_some();
        if removed {
            debug!("deleted command \"{}\"", name);
            self.proc_epoch += 1;
        }
        removed
    }

    /// Rename a command; an empty new name deletes it.
    pub fn rename_command(&mut self, old: &str, new: &str) -> Result<(), Flow> {
        if new.is_empty() {
            if !self.delete_command(old) {
                return Err(self.error(format!(
                    "can't delete \"{}\": command doesn't exist",
                    old
                )));
            }
            return Ok(());
        }
        if self.commands.contains_key(new) {
            return Err(self.error(format!(
                "can't rename to \"{}\": command already exists",
                new
            )));
        }
        match self.commands.remove(old) {
            Some(cmd) => {
                self.commands.insert(new.to_string(), cmd);
                self.proc_epoch += 1;
                Ok(())
            }
            None => Err(self.error(format!(
                "can't rename \"{}\": command doesn't exist",
                old
            ))),
        }
    }

    pub(crate) fn command_names(&self, procs_only: bool) -> Vec<String> {
        let mut names: Vec<String> = self
            .commands
            .iter()
            .filter(|(_, cmd)| !procs_only || matches!(cmd.imp, CmdImpl::Proc(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn find_command(&self, name: &str) -> Option<Rc<Command>> {
        self.commands.get(name).cloned()
    }

    fn lookup_command(&mut self, name_val: &Value) -> Option<Rc<Command>> {
        if let Repr::Command { epoch, cmd } = &*name_val.cell.repr.borrow() {
            if *epoch == self.proc_epoch {
                if let Some(cmd) = cmd.upgrade() {
                    return Some(cmd);
                }
            }
        }
        let name = name_val.as_string();
        let cmd = self.commands.get(&*name).cloned()?;
        name_val.set_repr(Repr::Command {
            epoch: self.proc_epoch,
            cmd: Rc::downgrade(&cmd),
        });
        Some(cmd)
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Evaluate a value as a script (internal flow-carrying form).
    pub(crate) fn eval_script(&mut self, script: &Value) -> Result<Value, Flow> {
        // An empty script evaluates to the empty result without compiling.
        if let Some(s) = script.peek_string() {
            if s.is_empty() {
                return Ok(self.empty());
            }
        }
        // A pure list without a string rep is a single pre-parsed command.
        if script.is_list_repr() && script.peek_string().is_none() {
            let argv = self.get_list(script)?;
            if argv.is_empty() {
                return Ok(self.empty());
            }
            return self.eval_argv(argv);
        }
        let prog = self.get_script(script)?;
        self.eval_program(&prog)
    }

    fn eval_program(&mut self, prog: &Rc<ScriptProgram>) -> Result<Value, Flow> {
        let saved_file =
            std::mem::replace(&mut self.current_file_name, Rc::clone(&prog.file));
        let saved_line = self.current_line;
        let r = self.eval_program_inner(prog);
        self.current_file_name = saved_file;
        self.current_line = saved_line;
        r
    }

    fn eval_program_inner(&mut self, prog: &Rc<ScriptProgram>) -> Result<Value, Flow> {
        let mut result = self.empty();
        let mut ti = 0usize;
        let mut ci = 0usize;
        while ci < prog.cmds.len() {
            let argc_raw = prog.cmds[ci];
            ci += 1;
            let expand = argc_raw < 0;
            let argc = argc_raw.unsigned_abs() as usize;
            let cmd_line = prog.tokens.get(ti).map_or(prog.line, |t| t.line);
            self.current_line = cmd_line;

            let mut argv: Vec<Value> = Vec::with_capacity(argc);
            let mut failed: Option<Flow> = None;
            for ai in 0..argc {
                let ntok_raw = prog.cmds[ci];
                ci += 1;
                let ntok = ntok_raw.unsigned_abs() as usize;
                match interpolate_tokens(self, &prog.tokens[ti..ti + ntok]) {
                    Ok(v) => {
                        if expand && ntok_raw < 0 {
                            match self.get_list(&v) {
                                Ok(items) => argv.extend(items),
                                Err(flow) => failed = Some(flow),
                            }
                        } else {
                            argv.push(v);
                        }
                    }
                    Err(flow) => failed = Some(flow),
                }
                ti += ntok + 1;
                if failed.is_some() {
                    // Keep the walk consistent: skip the remaining words.
                    for _ in ai + 1..argc {
                        let n = prog.cmds[ci].unsigned_abs() as usize;
                        ci += 1;
                        ti += n + 1;
                    }
                    break;
                }
            }
            if let Some(flow) = failed {
                if matches!(flow, Flow::Error) && self.trace_pending {
                    let proc_name = self.frame_proc_name();
                    self.add_trace(proc_name, Rc::clone(&prog.file), cmd_line);
                }
                return Err(flow);
            }
            if argv.is_empty() {
                continue;
            }
            self.current_line = cmd_line;
            match self.eval_argv(argv) {
                Ok(v) => {
                    result = v;
                    if self.signal_level > 0 && self.sigmask.load(Ordering::Relaxed) != 0 {
                        return Err(Flow::Signal);
                    }
                }
                Err(Flow::Error) => {
                    if self.trace_pending {
                        let proc_name = self.frame_proc_name();
                        self.add_trace(proc_name, Rc::clone(&prog.file), cmd_line);
                    }
                    return Err(Flow::Error);
                }
                Err(flow) => return Err(flow),
            }
        }
        Ok(result)
    }

    fn frame_proc_name(&self) -> String {
        self.frames[self.current]
            .proc_name
            .as_ref()
            .map(|n| n.to_string())
            .unwrap_or_default()
    }

    /// Dispatch a fully substituted argument vector as one command.
    pub(crate) fn eval_argv(&mut self, argv: Vec<Value>) -> Result<Value, Flow> {
        debug_assert!(!argv.is_empty());
        let Some(cmd) = self.lookup_command(&argv[0]) else {
            return self.dispatch_unknown(argv);
        };
        match &cmd.imp {
            CmdImpl::Native(f) => {
                let f = Rc::clone(f);
                f(self, &argv)
            }
            CmdImpl::Proc(p) => self.call_proc(Rc::clone(p), argv),
        }
    }

    fn dispatch_unknown(&mut self, argv: Vec<Value>) -> Result<Value, Flow> {
        if self.commands.contains_key("unknown") && self.unknown_depth < MAX_UNKNOWN_RECURSION {
            trace!("unknown command \"{}\", invoking handler", argv[0].as_string());
            self.unknown_depth += 1;
            let mut handler_argv = Vec::with_capacity(argv.len() + 1);
            handler_argv.push(self.new_string("unknown"));
            handler_argv.extend(argv);
            let r = self.eval_argv(handler_argv);
            self.unknown_depth -= 1;
            return r;
        }
        Err(self.error(format!(
            "invalid command name \"{}\"",
            argv[0].as_string()
        )))
    }

    fn call_proc(&mut self, def: Rc<ProcDef>, argv: Vec<Value>) -> Result<Value, Flow> {
        if self.num_levels >= self.max_nesting_depth {
            return Err(self.error("Too many nested calls. Infinite recursion?"));
        }
        let spec = &def.spec;
        let provided = argv.len() - 1;
        let fixed = spec.left.len() + spec.right.len();
        if provided < fixed
            || (!spec.rest && provided > fixed + spec.optionals.len())
        {
            let head = argv[0].as_string();
            return Err(self.wrong_num_args_msg(&head, &spec.signature));
        }

        self.num_levels += 1;
        let table_id = self.next_table_id();
        let proc_name = argv[0].as_string();
        let frame = CallFrame {
            table: VarTable::new(table_id),
            level: self.frames[self.current].level + 1,
            parent: self.current,
            argv: argv.clone(),
            proc_name: Some(Rc::clone(&proc_name)),
            statics: def.statics.clone(),
        };
        self.frames.push(frame);
        let saved_current = self.current;
        self.current = self.frames.len() - 1;

        self.bind_proc_args(&def, &argv);
        let mut r = self.eval_script(&def.body);

        // Tail calls replace this frame's continuation: pop first, then
        // invoke the replacement command in the caller's context.
        self.frames.pop();
        self.current = saved_current;
        self.num_levels -= 1;
        while let Err(Flow::Tailcall(call_argv)) = r {
            r = self.eval_argv(call_argv);
        }
        self.translate_proc_flow(r)
    }

    fn translate_proc_flow(&mut self, r: Result<Value, Flow>) -> Result<Value, Flow> {
        match r {
            Ok(v) => Ok(v),
            Err(Flow::Return { code, level, value }) => {
                let level = level.saturating_sub(1);
                if level > 0 {
                    return Err(Flow::Return { code, level, value });
                }
                match code {
                    ReturnCode::OK => Ok(value),
                    ReturnCode::ERROR => Err(self.set_error_value(value)),
                    ReturnCode::BREAK => Err(Flow::Break),
                    ReturnCode::CONTINUE => Err(Flow::Continue),
                    ReturnCode::SIGNAL => Err(Flow::Signal),
                    ReturnCode::EXIT => {
                        let code = parse_int(&value.as_string()).unwrap_or(0);
                        Err(Flow::Exit(code))
                    }
                    ReturnCode::RETURN => Err(Flow::Return {
                        code: ReturnCode::OK,
                        level: 1,
                        value,
                    }),
                    other => Err(Flow::Return {
                        code: other,
                        level: 0,
                        value,
                    }),
                }
            }
            Err(Flow::Break) => Err(self.error("invoked \"break\" outside of a loop")),
            Err(Flow::Continue) => Err(self.error("invoked \"continue\" outside of a loop")),
            Err(Flow::Error) => {
                self.request_trace();
                Err(Flow::Error)
            }
            Err(other) => Err(other),
        }
    }

    fn bind_proc_args(&mut self, def: &ProcDef, argv: &[Value]) {
        let spec = &def.spec;
        let provided = argv.len() - 1;
        let mut next = 1usize;
        for name in &spec.left {
            self.set_local(Rc::clone(name), argv[next].clone());
            next += 1;
        }
        let opt_avail = spec
            .optionals
            .len()
            .min(provided - spec.left.len() - spec.right.len());
        for (i, (name, default)) in spec.optionals.iter().enumerate() {
            if i < opt_avail {
                self.set_local(Rc::clone(name), argv[next].clone());
                next += 1;
            } else {
                self.set_local(Rc::clone(name), default.clone());
            }
        }
        if spec.rest {
            let rest_end = argv.len() - spec.right.len();
            let items: Vec<Value> = argv[next..rest_end].to_vec();
            let rest = if items.is_empty() {
                self.empty()
            } else {
                self.new_list(items)
            };
            self.set_local(Rc::from("args"), rest);
            next = rest_end;
        }
        for name in &spec.right {
            self.set_local(Rc::clone(name), argv[next].clone());
            next += 1;
        }
    }

    fn set_local(&mut self, name: Rc<str>, value: Value) {
        let table = &mut self.frames[self.current].table;
        let slot = table.define(&name);
        table.slots[slot] = Var::Val(value);
    }

    // -----------------------------------------------------------------------
    // Public evaluation API
    // -----------------------------------------------------------------------

    /// Evaluate script source and return its result.
    pub fn eval(&mut self, src: &str) -> crate::error::Result<Value> {
        self.eval_named(src, "", 1)
    }

    /// Evaluate script source, attributing errors to `filename` starting at
    /// `line`.
    pub fn eval_named(
        &mut self,
        src: &str,
        filename: &str,
        line: u32,
    ) -> crate::error::Result<Value> {
        let file = self.intern_filename(filename);
        let script = self.new_sourced_string(src, &file, line);
        let r = self.eval_script(&script);
        self.finish(r)
    }

    /// Read and evaluate a script file.
    pub fn eval_file(&mut self, path: &str) -> crate::error::Result<Value> {
        let src = std::fs::read_to_string(path).map_err(|e| Error::Io {
            path: path.to_string(),
            source: e,
        })?;
        self.eval_named(&src, path, 1)
    }

    /// Evaluate a value as a script.
    pub fn eval_value(&mut self, script: &Value) -> crate::error::Result<Value> {
        let script = script.clone();
        let r = self.eval_script(&script);
        self.finish(r)
    }

    /// Invoke a single command from a pre-substituted argument vector.
    pub fn eval_values(&mut self, argv: &[Value]) -> crate::error::Result<Value> {
        let r = self.eval_argv(argv.to_vec());
        self.finish(r)
    }

    /// Convert an escaped flow into the boundary error type.
    pub(crate) fn finish(&mut self, r: Result<Value, Flow>) -> crate::error::Result<Value> {
        match r {
            Ok(v) => {
                self.result = v.clone();
                Ok(v)
            }
            Err(Flow::Return { value, .. }) => {
                self.result = value.clone();
                Ok(value)
            }
            Err(Flow::Error) => {
                let message = self.result.as_string().to_string();
                let stack_trace = self
                    .stack_trace
                    .iter()
                    .rev()
                    .map(|(p, f, l)| (p.clone(), f.to_string(), *l))
                    .collect();
                self.clear_error();
                Err(Error::Script {
                    message,
                    stack_trace,
                })
            }
            Err(Flow::Break) => Err(Error::Script {
                message: "invoked \"break\" outside of a loop".to_string(),
                stack_trace: Vec::new(),
            }),
            Err(Flow::Continue) => Err(Error::Script {
                message: "invoked \"continue\" outside of a loop".to_string(),
                stack_trace: Vec::new(),
            }),
            Err(Flow::Signal) => {
                let mask = self.sigmask.load(Ordering::Relaxed);
                Err(Error::Script {
                    message: format!("untrapped signal (mask {:#x})", mask),
                    stack_trace: Vec::new(),
                })
            }
            Err(Flow::Exit(code)) => Err(Error::Exit(code)),
            Err(Flow::Tailcall(argv)) => {
                let r = self.eval_argv(argv);
                self.finish(r)
            }
        }
    }

    /// Run a script while capturing `puts` output.
    ///
    /// # Example
    ///
    /// ```
    /// use littcl::Interp;
    ///
    /// let mut interp = Interp::new();
    /// let out = interp.capture("puts one; puts two; expr {1 + 1}").unwrap();
    /// assert_eq!(out.output, vec!["one", "two"]);
    /// assert_eq!(&*out.value.as_string(), "2");
    /// ```
    pub fn capture(&mut self, src: &str) -> crate::error::Result<CaptureOutput> {
        self.capturing = true;
        self.out_lines.clear();
        self.out_pending.clear();
        let r = self.eval(src);
        let output = self.take_output();
        self.capturing = false;
        r.map(|value| CaptureOutput { value, output })
    }

    /// Drain any captured output lines.
    pub fn take_output(&mut self) -> Vec<String> {
        let mut lines = std::mem::take(&mut self.out_lines);
        if !self.out_pending.is_empty() {
            lines.push(std::mem::take(&mut self.out_pending));
        }
        lines
    }

    pub(crate) fn write_output(&mut self, text: &str, newline: bool) {
        if self.capturing {
            self.out_pending.push_str(text);
            if newline {
                self.out_lines.push(std::mem::take(&mut self.out_pending));
            }
        } else if newline {
            println!("{}", text);
        } else {
            print!("{}", text);
        }
    }

    // -----------------------------------------------------------------------
    // Host configuration
    // -----------------------------------------------------------------------

    /// Change the nested-call limit (default 5000).
    pub fn set_max_nesting_depth(&mut self, depth: usize) {
        self.max_nesting_depth = depth;
    }

    /// Name reported by `info nameofexecutable`.
    pub fn set_executable_name(&mut self, name: impl Into<String>) {
        self.executable_name = Some(name.into());
    }

    pub(crate) fn executable_name(&self) -> Option<&str> {
        self.executable_name.as_deref()
    }

    /// The signal mask shared with the host's signal handler. Setting bits
    /// from the handler makes the evaluator return a signal at the next
    /// command boundary inside a `catch -signal` body.
    pub fn signal_mask_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.sigmask)
    }

    pub(crate) fn take_signal_mask(&mut self) -> u64 {
        self.sigmask.swap(0, Ordering::Relaxed)
    }

    /// Reseed the PRNG backing `rand`; useful for deterministic tests.
    pub fn seed_random(&mut self, seed: u64) {
        self.prng = Prng(seed | 1);
    }

    pub(crate) fn rand_u64(&mut self) -> u64 {
        self.prng.next()
    }

    /// Attach keyed host state to the interpreter.
    pub fn set_assoc(&mut self, key: &str, value: Rc<dyn Any>) {
        self.assoc.insert(key.to_string(), value);
    }

    /// Fetch keyed host state previously installed with `set_assoc`.
    pub fn get_assoc<T: 'static>(&self, key: &str) -> Option<Rc<T>> {
        self.assoc
            .get(key)
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn remove_assoc(&mut self, key: &str) -> bool {
        self.assoc.remove(key).is_some()
    }
}

impl Default for Interp {
    fn default() -> Self {
        Interp::new()
    }
}

/// Parse an index expression: `N`, `N+M`, `N-M`, `end`, `end+N`, `end-N`.
fn parse_index(s: &str) -> Option<SeqIndex> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(rest) = s.strip_prefix("end") {
        if rest.is_empty() {
            return Some(SeqIndex::End(0));
        }
        let (sign, digits) = match rest.as_bytes()[0] {
            b'+' => (1i64, &rest[1..]),
            b'-' => (-1i64, &rest[1..]),
            _ => return None,
        };
        let n: i64 = digits.parse().ok()?;
        return Some(SeqIndex::End(sign * n));
    }
    // Allow the "N+M"/"N-M" arithmetic form.
    if let Some(split) = s[1..].find(['+', '-']).map(|i| i + 1) {
        let base: i64 = s[..split].trim().parse().ok()?;
        let sign = if s.as_bytes()[split] == b'+' { 1 } else { -1 };
        let offset: i64 = s[split + 1..].trim().parse().ok()?;
        return Some(SeqIndex::Abs(base + sign * offset));
    }
    parse_int(s).map(SeqIndex::Abs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_index_forms() {
        assert_eq!(parse_index("3"), Some(SeqIndex::Abs(3)));
        assert_eq!(parse_index("-2"), Some(SeqIndex::Abs(-2)));
        assert_eq!(parse_index("end"), Some(SeqIndex::End(0)));
        assert_eq!(parse_index("end-1"), Some(SeqIndex::End(-1)));
        assert_eq!(parse_index("end+2"), Some(SeqIndex::End(2)));
        assert_eq!(parse_index("2+3"), Some(SeqIndex::Abs(5)));
        assert_eq!(parse_index("2-3"), Some(SeqIndex::Abs(-1)));
        assert_eq!(parse_index("endx"), None);
        assert_eq!(parse_index("abc"), None);
    }

    #[test]
    fn test_simple_eval() {
        let mut interp = Interp::new();
        let v = interp.eval("set x 41; incr x").unwrap();
        assert_eq!(&*v.as_string(), "42");
    }

    #[test]
    fn test_variable_cache_refresh_after_unset() {
        let mut interp = Interp::new();
        interp.eval("set x 1").unwrap();
        interp.eval("set x 2; unset x").unwrap();
        let err = interp.eval("set y $x").unwrap_err();
        assert!(err.to_string().contains("no such variable"));
    }

    #[test]
    fn test_wrong_num_args_message() {
        let mut interp = Interp::new();
        interp.eval("proc f {a {b 10}} { expr {$a+$b} }").unwrap();
        let err = interp.eval("f").unwrap_err();
        assert_eq!(
            err.to_string(),
            "wrong # args: should be \"f a ?b?\""
        );
    }

    #[test]
    fn test_nesting_limit() {
        let mut interp = Interp::new();
        interp.set_max_nesting_depth(20);
        interp.eval("proc loop {} { loop }").unwrap();
        let err = interp.eval("loop").unwrap_err();
        assert!(err.to_string().contains("Too many nested calls"));
    }

    #[test]
    fn test_unknown_handler() {
        let mut interp = Interp::new();
        interp
            .eval("proc unknown {args} { return \"unknown: $args\" }")
            .unwrap();
        let v = interp.eval("nosuchcmd a b").unwrap();
        assert_eq!(&*v.as_string(), "unknown: nosuchcmd a b");
    }

    #[test]
    fn test_assoc_data() {
        let mut interp = Interp::new();
        interp.set_assoc("limit", Rc::new(7usize));
        let got: Rc<usize> = interp.get_assoc("limit").unwrap();
        assert_eq!(*got, 7);
        assert!(interp.get_assoc::<String>("limit").is_none());
        assert!(interp.remove_assoc("limit"));
    }
}
