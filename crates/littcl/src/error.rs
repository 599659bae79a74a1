use thiserror::Error;

/// Errors surfaced to the embedding host.
///
/// Inside the engine, script-level control flow (errors, `return`, `break`,
/// `continue`, signals, `exit`) travels as [`crate::Flow`] and never as this
/// type. `Error` exists only at the embedding boundary: [`crate::Interp::eval`]
/// and friends convert an escaped flow into one of these variants.
#[derive(Debug, Error)]
pub enum Error {
    /// The source text could not be tokenized or compiled.
    #[error("parse error: {message} (line {line})")]
    Parse { message: String, line: u32 },

    /// A script raised an error that nothing caught.
    ///
    /// `stack_trace` holds (procedure, file, line) triples in invocation
    /// order, outermost first. Procedures invoked from the top level have an
    /// empty procedure name.
    #[error("{message}")]
    Script {
        message: String,
        stack_trace: Vec<(String, String, u32)>,
    },

    /// The script requested host termination via `exit`.
    #[error("exit {0}")]
    Exit(i64),

    /// A file could not be read (`source`, `eval_file`).
    #[error("couldn't read file \"{path}\": {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
