//! Replay-log line format.
//!
//! Every dispatched GEMM is described by one line of the form
//!
//! ```text
//! [<tag>] <function> op=(<A>, <B>), shape=(<m>, <n>, <k>)[, batch=<N>], mode=<MODE>
//! ```
//!
//! The replay tool parses these lines back into synthetic calls, so
//! `Display` and `FromStr` must agree byte for byte.

use crate::types::{ComputeMode, Operation};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tag written by the dispatcher.
pub const DEFAULT_TAG: &str = "mpsgemm LOG";

/// Errors produced while parsing a replay-log line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallRecordError {
    #[error("missing `{expected}` in call record")]
    Missing { expected: &'static str },
    #[error("invalid {field} `{value}` in call record")]
    InvalidField { field: &'static str, value: String },
}

/// One dispatched GEMM, as written to the replay log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub tag: String,
    pub function: String,
    pub op_a: Operation,
    pub op_b: Operation,
    pub m: u64,
    pub n: u64,
    pub k: u64,
    pub batch: Option<u64>,
    pub mode: ComputeMode,
}

impl CallRecord {
    /// Record with the default tag.
    pub fn new(
        function: impl Into<String>,
        op_a: Operation,
        op_b: Operation,
        (m, n, k): (u64, u64, u64),
        batch: Option<u64>,
        mode: ComputeMode,
    ) -> Self {
        Self { tag: DEFAULT_TAG.to_string(), function: function.into(), op_a, op_b, m, n, k, batch, mode }
    }
}

impl fmt::Display for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} op=({}, {}), shape=({}, {}, {})",
            self.tag, self.function, self.op_a, self.op_b, self.m, self.n, self.k
        )?;
        if let Some(batch) = self.batch {
            write!(f, ", batch={batch}")?;
        }
        write!(f, ", mode={}", self.mode)
    }
}

fn expect<'a>(s: &'a str, prefix: &'static str) -> Result<&'a str, CallRecordError> {
    s.strip_prefix(prefix).ok_or(CallRecordError::Missing { expected: prefix })
}

fn field<T: FromStr>(field: &'static str, value: &str) -> Result<T, CallRecordError> {
    value
        .trim()
        .parse()
        .map_err(|_| CallRecordError::InvalidField { field, value: value.trim().to_string() })
}

fn parenthesized(s: &str) -> Result<(&str, &str), CallRecordError> {
    let close = s.find(')').ok_or(CallRecordError::Missing { expected: ")" })?;
    Ok((&s[..close], &s[close + 1..]))
}

impl FromStr for CallRecord {
    type Err = CallRecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let rest = expect(line.trim(), "[")?;
        let close = rest.find(']').ok_or(CallRecordError::Missing { expected: "]" })?;
        let tag = rest[..close].to_string();
        let rest = expect(&rest[close + 1..], " ")?;

        let space = rest.find(' ').ok_or(CallRecordError::Missing { expected: "op=(" })?;
        let function = rest[..space].to_string();
        if function.is_empty() {
            return Err(CallRecordError::InvalidField { field: "function", value: function });
        }

        let (ops, rest) = parenthesized(expect(&rest[space + 1..], "op=(")?)?;
        let (a, b) = ops.split_once(',').ok_or(CallRecordError::Missing { expected: "," })?;
        let op_a = field("op", a)?;
        let op_b = field("op", b)?;

        let (shape, rest) = parenthesized(expect(rest, ", shape=(")?)?;
        let dims: Vec<&str> = shape.split(',').collect();
        let [m, n, k] = dims.as_slice() else {
            return Err(CallRecordError::InvalidField { field: "shape", value: shape.to_string() });
        };
        let (m, n, k) = (field("m", m)?, field("n", n)?, field("k", k)?);

        let (batch, rest) = match rest.strip_prefix(", batch=") {
            Some(after) => {
                let end = after.find(',').ok_or(CallRecordError::Missing { expected: ", mode=" })?;
                (Some(field("batch", &after[..end])?), &after[end..])
            }
            None => (None, rest),
        };
        let mode = field("mode", expect(rest, ", mode=")?)?;

        Ok(Self { tag, function, op_a, op_b, m, n, k, batch, mode })
    }
}
