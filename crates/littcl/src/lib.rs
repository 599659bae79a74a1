//! Littcl - A lightweight, embeddable Tcl-style command language
//!
//! Littcl provides a small interpreter for a command-oriented scripting
//! language: every construct is a command, arguments are whitespace-separated
//! words, braces quote literally, double quotes interpolate, brackets
//! substitute command results, and `$name` reads variables (with `$name(key)`
//! sugar for dictionary elements).
//!
//! # Features
//!
//! - **Dual-representation values**: every value is a string with a cached
//!   typed representation (integer, double, list, dict, compiled script,
//!   compiled expression, ...) converted lazily as reads demand
//! - **Compile-once evaluation**: scripts and expressions compile to shared
//!   programs cached on the values that hold them
//! - **Native command registration**: host functions become commands
//! - **Garbage-collected references**: opaque handles with finalizers,
//!   collected by scanning live string representations
//! - **No host exceptions**: script errors, `return`, `break`, `continue`,
//!   signals, and `exit` all travel as ordinary return flow
//!
//! # Quick Start
//!
//! ```
//! use littcl::Interp;
//!
//! let mut interp = Interp::new();
//!
//! // Register a command
//! interp.register("triple", |interp, argv| {
//!     let n = interp.get_int(&argv[1])?;
//!     Ok(interp.new_int(n * 3))
//! });
//!
//! // Execute code
//! let result = interp.eval(r#"
//!     proc total {items} {
//!         set sum 0
//!         foreach n $items { incr sum [triple $n] }
//!         return $sum
//!     }
//!     total {1 2 3}
//! "#).unwrap();
//!
//! assert_eq!(&*result.as_string(), "18");
//! ```
//!
//! # Supported language
//!
//! ## Flow control
//! - `if`/`elseif`/`else`, `while`, `for`, `foreach`, `lmap`
//! - `switch` with `-exact`, `-glob`, `-regexp`, `-command`
//! - `catch`/`return`/`break`/`continue`/`tailcall`/`error`
//!
//! ## Values
//! - lists: `list lindex llength lset lappend linsert lreplace lrange
//!   lrepeat lreverse lsort lsearch concat join split`
//! - dicts: `dict create|get|set|unset|exists|keys|size`
//! - strings: `string ...`, `format`, `scan`, `append`
//!
//! ## Procedures
//! - `proc` with optional parameters, defaults, `args`, and static
//!   variables; `upvar`/`global`/`uplevel` for scope surgery
//!
//! ## References
//! - `ref`/`getref`/`setref`/`finalize`/`collect`
//!
//! ## Misc
//! - `expr`, `subst`, `eval`, `source`, `info`, `puts`, `time`, `range`,
//!   `rand`, `env`, `exit`
//!
//! # Not supported
//!
//! - Threads sharing one interpreter (create one `Interp` per thread)
//! - Namespaces beyond the `::` global prefix
//! - File I/O channels beyond `source`

mod commands;
mod error;
mod expr;
mod interp;
mod lists;
mod parser;
mod reference;
mod script;
mod strings;
mod value;

pub use error::{Error, Result};
pub use interp::{CaptureOutput, CmdResult, Flow, Interp, MAX_NESTING_DEPTH};
pub use value::{ReturnCode, SeqIndex, Value, REFERENCE_SPACE};
