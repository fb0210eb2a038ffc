//! Substitution of `{name}` placeholders in the client's URL template.
//!
//! A placeholder is resolved from, in order:
//!
//! 1. the per-call [`CallOptions`], when the name is present there (any value, including `0`,
//!    `""` and `false`),
//! 2. the [`Placeholders`] registered on the client, either a fixed value or a
//!    [`Placeholder::Computed`] function of the call options,
//!
//! and is otherwise left in the URL as the literal `{name}` token.
//!
//! A token whose body itself contains references, such as `{{shard} % 4}`, is an expression
//! token. Expressions support integer arithmetic, comparisons and `cond ? a : b`, which is
//! enough to route a request to a host or path chosen by a computed shard number.

mod expression;

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;

/// Options passed with a single call, keyed by placeholder name
pub type CallOptions = serde_json::Map<String, Value>;

/// Signature of a computed placeholder: it receives the call options and its own name
pub type ComputeFn = dyn Fn(&CallOptions, &str) -> String + Send + Sync;

/// A placeholder registered on the client
#[derive(Clone)]
pub enum Placeholder {
    /// A fixed value
    Value(String),
    /// A value derived from the call options on every resolution
    Computed(Arc<ComputeFn>),
}

impl std::fmt::Debug for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Computed(_) => f.debug_tuple("Computed").finish_non_exhaustive(),
        }
    }
}

impl Placeholder {
    /// A fixed placeholder value, coerced to a string the way call options are
    pub fn value(v: impl Into<Value>) -> Self {
        Self::Value(coerce(&v.into()))
    }

    /// A computed placeholder
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&CallOptions, &str) -> String + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    fn resolve(&self, options: &CallOptions, name: &str) -> String {
        match self {
            Self::Value(v) => v.clone(),
            Self::Computed(f) => f(options, name),
        }
    }
}

/// The placeholders registered on a client, enumerated when the client is built
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    entries: HashMap<String, Placeholder>,
}

impl Placeholders {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `placeholder` under `name`, replacing any previous registration
    pub fn insert(&mut self, name: impl Into<String>, placeholder: Placeholder) {
        self.entries.insert(name.into(), placeholder);
    }

    /// Resolve a single placeholder name, `None` when neither source knows it
    pub fn lookup(&self, name: &str, options: &CallOptions) -> Option<String> {
        if let Some(v) = options.get(name) {
            return Some(coerce(v));
        }
        self.entries.get(name).map(|p| p.resolve(options, name))
    }

    /// Substitute every placeholder in `template`
    ///
    /// # Example
    /// ```
    /// # use couch_view_client::placeholder::{Placeholder, Placeholders};
    /// # use serde_json::json;
    /// let mut placeholders = Placeholders::new();
    /// placeholders.insert("host", Placeholder::value("localhost"));
    /// placeholders.insert(
    ///     "shard",
    ///     Placeholder::computed(|opts, _| {
    ///         let domain = opts.get("domain").and_then(|d| d.as_str()).unwrap_or_default();
    ///         (domain.len() % 2).to_string()
    ///     }),
    /// );
    ///
    /// let options = json!({"domain": "example.com", "database": "pages"});
    /// let url = placeholders.resolve(
    ///     "http://{host}/{{shard} == 1 ? \"odd\" : \"even\"}_{database}",
    ///     options.as_object().unwrap(),
    /// );
    /// assert_eq!(url, "http://localhost/odd_pages");
    /// ```
    pub fn resolve(&self, template: &str, options: &CallOptions) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let Some(len) = token_len(&rest[open..]) else {
                // unbalanced braces are not tokens
                out.push_str(&rest[open..]);
                return out;
            };
            let token = &rest[open..open + len];
            let body = &token[1..len - 1];
            let resolved = if body.contains('{') {
                expression::evaluate(body, |name| self.lookup(name, options)).ok()
            } else {
                self.lookup(body, options)
            };
            out.push_str(resolved.as_deref().unwrap_or(token));
            rest = &rest[open + len..];
        }
        out.push_str(rest);
        out
    }
}

/// Length of the brace-balanced token at the start of `s`, including both braces
fn token_len(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Render an option value for use in a URL
fn coerce(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
