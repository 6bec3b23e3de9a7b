//! nREPL request construction and response field access.
//!
//! Requests and responses are bencode dictionaries. This module builds
//! the two request shapes the client sends (`clone` and `eval`) and
//! wraps decoded response dictionaries with typed accessors plus the
//! aggregation rules for a completed response stream.

use std::collections::BTreeMap;

use crate::bencode::Value;

/// Build a `clone` request: asks the server for a fresh session.
pub fn clone_request(id: &str) -> Value {
    let mut fields = BTreeMap::new();
    fields.insert("op".to_string(), Value::from("clone"));
    fields.insert("id".to_string(), Value::from(id));
    Value::Map(fields)
}

/// Build an `eval` request for `code` within `session`.
pub fn eval_request(id: &str, session: &str, code: &str) -> Value {
    let mut fields = BTreeMap::new();
    fields.insert("op".to_string(), Value::from("eval"));
    fields.insert("id".to_string(), Value::from(id));
    fields.insert("session".to_string(), Value::from(session));
    fields.insert("code".to_string(), Value::from(code));
    Value::Map(fields)
}

/// A decoded nREPL response dictionary.
///
/// A single request may be answered by several responses; the one whose
/// `status` list contains `"done"` is terminal and ends accumulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    fields: BTreeMap<String, Value>,
}

impl Response {
    /// Wrap a decoded value; anything other than a dictionary is not a
    /// response.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Map(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Correlation id this response answers.
    pub fn id(&self) -> Option<&str> {
        self.str_field("id")
    }

    /// Session id granted by a `clone` response.
    pub fn new_session(&self) -> Option<&str> {
        self.str_field("new-session")
    }

    /// Printed evaluation result.
    pub fn value(&self) -> Option<&str> {
        self.str_field("value")
    }

    /// Captured stdout.
    pub fn out(&self) -> Option<&str> {
        self.str_field("out")
    }

    /// Captured stderr / error text.
    pub fn err(&self) -> Option<&str> {
        self.str_field("err")
    }

    /// Exception message.
    pub fn ex(&self) -> Option<&str> {
        self.str_field("ex")
    }

    /// Root-cause exception message.
    pub fn root_ex(&self) -> Option<&str> {
        self.str_field("root-ex")
    }

    /// Whether the `status` list marks this as the terminal response.
    pub fn is_done(&self) -> bool {
        self.fields
            .get("status")
            .and_then(Value::as_list)
            .map(|tokens| tokens.iter().any(|t| t.as_str() == Some("done")))
            .unwrap_or(false)
    }
}

/// Extract remote error text from a completed response stream.
///
/// Per response the first present of `ex`, `root-ex`, `err` counts;
/// matches are joined in arrival order. `None` means the evaluation
/// reported no error.
pub fn collect_error(responses: &[Response]) -> Option<String> {
    let errors: Vec<&str> = responses
        .iter()
        .filter_map(|r| r.ex().or_else(|| r.root_ex()).or_else(|| r.err()))
        .collect();
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("\n"))
    }
}

/// Join the `value` and `out` fields of a completed response stream in
/// arrival order, newline-separated.
pub fn collect_output(responses: &[Response]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for response in responses {
        if let Some(value) = response.value() {
            parts.push(value);
        }
        if let Some(out) = response.out() {
            parts.push(out);
        }
    }
    parts.join("\n")
}
