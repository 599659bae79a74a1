//! References and the mark-only garbage collector.
//!
//! A reference is an opaque handle to a value, tracked in a per-interpreter
//! table and serialized as a rigid 42-byte token
//! (`<reference.<TAG>.DDDDDDDDDDDDDDDDDDDD>`). Reference identity lives in
//! the textual form on purpose: the collector marks a reference as reachable
//! by scanning the string representations of all live values for the
//! anchored token shape. Any string that flows between commands is therefore
//! scannable, and the serialization must not change without redesigning the
//! collector.
//!
//! Collection is a mark phase over the live-value registry followed by a
//! sweep of the table; swept entries may run a finalizer command with the
//! token and the referent as arguments. A sentinel guards against re-entrant
//! collection from inside a finalizer.

use std::collections::HashSet;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::debug;

use crate::interp::{Flow, Interp};
use crate::value::{
    format_reference, normalize_tag, parse_reference, Repr, Value, REFERENCE_SPACE,
};

/// A tracked reference: the referent and an optional finalizer command name.
pub(crate) struct RefRecord {
    pub value: Value,
    pub finalizer: Option<Value>,
    pub tag: [u8; 7],
}

/// Create-count threshold that triggers `collect_if_needed`.
const COLLECT_ID_THRESHOLD: u64 = 5000;
/// Wall-clock threshold that triggers `collect_if_needed`.
const COLLECT_TIME_THRESHOLD: Duration = Duration::from_secs(300);

/// Scan a string for embedded reference tokens and mark their ids.
fn mark_tokens(s: &str, marked: &mut HashSet<u64>) {
    for (idx, _) in s.match_indices("<reference.<") {
        if let Some(token) = s.get(idx..idx + REFERENCE_SPACE) {
            if let Some((id, _)) = parse_reference(token) {
                marked.insert(id);
            }
        }
    }
}

impl Interp {
    /// Create a reference to `value` and return its token value.
    pub fn new_reference(&mut self, value: Value, tag: &str, finalizer: Option<Value>) -> Value {
        self.collect_if_needed();
        let id = self.next_ref_id;
        self.next_ref_id += 1;
        let tag = normalize_tag(tag);
        self.references.insert(
            id,
            RefRecord {
                value,
                finalizer,
                tag,
            },
        );
        let token = format_reference(id, &tag);
        self.new_value(Some(Rc::from(token.as_str())), Repr::Reference { id, tag })
    }

    /// Resolve a value to a live reference id, validating the token shape.
    pub(crate) fn get_reference_id(&mut self, v: &Value) -> Result<u64, Flow> {
        let id = match v.reference_repr() {
            Some(id) => id,
            None => {
                let s = v.as_string();
                let Some((id, tag)) = parse_reference(&s) else {
                    return Err(self.error(format!("expected reference but got \"{}\"", s)));
                };
                v.set_repr(Repr::Reference { id, tag });
                id
            }
        };
        if !self.references.contains_key(&id) {
            let s = v.as_string();
            return Err(self.error(format!("invalid reference id {}", s)));
        }
        Ok(id)
    }

    /// The referent of a reference.
    pub fn get_reference(&mut self, v: &Value) -> Result<Value, Flow> {
        let id = self.get_reference_id(v)?;
        Ok(self.references[&id].value.clone())
    }

    /// Replace the referent; returns the new value.
    pub fn set_reference(&mut self, v: &Value, new_value: Value) -> Result<Value, Flow> {
        let id = self.get_reference_id(v)?;
        self.references.get_mut(&id).unwrap().value = new_value.clone();
        Ok(new_value)
    }

    /// Read the current finalizer command name (empty when unset).
    pub fn get_finalizer(&mut self, v: &Value) -> Result<Value, Flow> {
        let id = self.get_reference_id(v)?;
        Ok(self.references[&id]
            .finalizer
            .clone()
            .unwrap_or_else(|| self.empty()))
    }

    /// Install or clear the finalizer command for a reference.
    pub fn set_finalizer(&mut self, v: &Value, cmd: Option<Value>) -> Result<(), Flow> {
        let id = self.get_reference_id(v)?;
        self.references.get_mut(&id).unwrap().finalizer = cmd;
        Ok(())
    }

    /// Collect unreferenced references. Returns the number swept.
    ///
    /// The mark phase walks the live-value registry: values whose internal
    /// representation is a reference mark directly; values with a
    /// materialized string representation are scanned for embedded tokens.
    pub fn collect(&mut self) -> usize {
        if self.collecting {
            return 0;
        }
        self.collecting = true;

        let mut marked: HashSet<u64> = HashSet::new();
        for v in self.live_values() {
            if let Some(id) = v.reference_repr() {
                marked.insert(id);
                continue;
            }
            if let Some(s) = v.peek_string() {
                if s.len() >= REFERENCE_SPACE {
                    mark_tokens(&s, &mut marked);
                }
            }
        }

        let dead: Vec<u64> = self
            .references
            .keys()
            .filter(|id| !marked.contains(id))
            .copied()
            .collect();
        let mut collected = 0;
        for id in dead {
            let Some(record) = self.references.remove(&id) else {
                continue;
            };
            collected += 1;
            if let Some(finalizer) = record.finalizer {
                let token = format_reference(id, &record.tag);
                let token_value = self.new_string(&token);
                let argv = vec![finalizer, token_value, record.value];
                if self.eval_argv(argv).is_err() {
                    debug!("reference finalizer failed: {}", self.result);
                    self.clear_error();
                }
            }
        }
        debug!(
            "reference collection: {} live marks, {} swept, {} remaining",
            marked.len(),
            collected,
            self.references.len()
        );
        self.last_collect_id = self.next_ref_id;
        self.last_collect_time = Instant::now();
        self.collecting = false;
        collected
    }

    /// Collect when enough references have been created since the last run
    /// or enough wall-clock time has passed.
    pub fn collect_if_needed(&mut self) {
        let created = self.next_ref_id - self.last_collect_id;
        if created > COLLECT_ID_THRESHOLD
            || self.last_collect_time.elapsed() > COLLECT_TIME_THRESHOLD
        {
            self.collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reference_round_trip() {
        let mut interp = Interp::new();
        let payload = interp.new_string("hello");
        let r = interp.new_reference(payload, "TAG", None);
        assert_eq!(r.as_string().len(), REFERENCE_SPACE);
        let got = interp.get_reference(&r).unwrap();
        assert_eq!(&*got.as_string(), "hello");
    }

    #[test]
    fn test_setref_changes_referent() {
        let mut interp = Interp::new();
        let payload = interp.new_string("a");
        let r = interp.new_reference(payload, "T", None);
        let replacement = interp.new_string("b");
        interp.set_reference(&r, replacement).unwrap();
        assert_eq!(&*interp.get_reference(&r).unwrap().as_string(), "b");
    }

    #[test]
    fn test_collect_sweeps_unreachable() {
        let mut interp = Interp::new();
        let token = {
            let payload = interp.new_string("data");
            let r = interp.new_reference(payload, "T", None);
            r.as_string().to_string()
            // The reference value handle drops here.
        };
        // Clear the result slot, which may still hold the token.
        interp.eval("set dummy 1").unwrap();
        let swept = interp.collect();
        assert_eq!(swept, 1);
        let stale = interp.new_string(&token);
        let err = interp.get_reference(&stale).unwrap_err();
        drop(err);
        assert!(interp.result.as_string().contains("invalid reference id"));
    }

    #[test]
    fn test_token_held_in_string_survives() {
        let mut interp = Interp::new();
        let payload = interp.new_string("data");
        let r = interp.new_reference(payload, "T", None);
        let holder = format!("prefix {} suffix", r.as_string());
        let _held = interp.new_string(&holder);
        drop(r);
        interp.eval("set dummy 1").unwrap();
        assert_eq!(interp.collect(), 0);
    }

    #[test]
    fn test_second_collect_sweeps_nothing() {
        let mut interp = Interp::new();
        {
            let payload = interp.new_string("x");
            let _r = interp.new_reference(payload, "T", None);
        }
        interp.eval("set dummy 1").unwrap();
        let first = interp.collect();
        assert_eq!(first, 1);
        assert_eq!(interp.collect(), 0);
    }

    #[test]
    fn test_finalizer_runs_on_sweep() {
        let mut interp = Interp::new();
        interp
            .eval("set log {}; proc note {ref val} { lappend ::log $val }")
            .unwrap();
        {
            let payload = interp.new_string("payload");
            let fin = interp.new_string("note");
            let _r = interp.new_reference(payload, "T", Some(fin));
        }
        interp.eval("set dummy 1").unwrap();
        assert_eq!(interp.collect(), 1);
        assert_eq!(&*interp.eval("set log").unwrap().as_string(), "payload");
    }
}
