//! The design document a client installs, and its content fingerprint.

use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Prefix of every design document id
pub const DESIGN_PREFIX: &str = "_design/";

/// Source text of a map, reduce or list function
///
/// Built-in reducers such as `_sum` or `_count` are stored the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionSource(String);

impl FunctionSource {
    /// Wrap the given source text
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    /// The exact source text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FunctionSource {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for FunctionSource {
    fn from(source: String) -> Self {
        Self(source)
    }
}

/// A member of a design document outside its views and lists
///
/// Function members such as `validate_doc_update` hold their source; nested members such as
/// `filters` or `shows` are objects of further values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DesignValue {
    Function(FunctionSource),
    Object(BTreeMap<String, DesignValue>),
    Json(Value),
}

impl From<FunctionSource> for DesignValue {
    fn from(source: FunctionSource) -> Self {
        Self::Function(source)
    }
}

impl From<&str> for DesignValue {
    fn from(source: &str) -> Self {
        Self::Function(source.into())
    }
}

impl From<String> for DesignValue {
    fn from(source: String) -> Self {
        Self::Function(source.into())
    }
}

impl From<BTreeMap<String, DesignValue>> for DesignValue {
    fn from(members: BTreeMap<String, DesignValue>) -> Self {
        Self::Object(members)
    }
}

/// Objects become [`DesignValue::Object`] at every depth, so they serialize in key order, and
/// strings become [`DesignValue::Function`], the variant they deserialize as
impl From<Value> for DesignValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(o) => Self::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect()),
            Value::String(s) => Self::Function(s.into()),
            other => Self::Json(other),
        }
    }
}

impl<K: Into<String>, V: Into<DesignValue>> FromIterator<(K, V)> for DesignValue {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::Object(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Top-level members with their own field on [`DesignDocument`]
const RESERVED_MEMBERS: &[&str] = &["_id", "_rev", "language", "views", "lists", "options"];

/// A map function with an optional reduce function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub map: FunctionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<FunctionSource>,
}

impl ViewDefinition {
    pub fn new(map: impl Into<FunctionSource>) -> Self {
        Self {
            map: map.into(),
            reduce: None,
        }
    }

    pub fn with_reduce(mut self, reduce: impl Into<FunctionSource>) -> Self {
        self.reduce = Some(reduce.into());
        self
    }
}

/// The views and lists a client queries, installed on the server as one design document
///
/// Any other top-level member, e.g. `validate_doc_update` or `filters`, is carried in
/// `members` and is part of the fingerprint like the views are. All maps are ordered, so
/// serializing a [`DesignDocument`] always yields its canonical form regardless of the order
/// its parts were added in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignDocument {
    language: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    views: BTreeMap<String, ViewDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    lists: BTreeMap<String, FunctionSource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    options: BTreeMap<String, Value>,
    #[serde(flatten)]
    members: BTreeMap<String, DesignValue>,
}

impl Default for DesignDocument {
    fn default() -> Self {
        Self {
            language: "javascript".to_string(),
            views: Default::default(),
            lists: Default::default(),
            options: Default::default(),
            members: Default::default(),
        }
    }
}

impl DesignDocument {
    /// Create an empty `javascript` design document
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the query server language
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Add or replace the view `name`
    pub fn with_view(mut self, name: impl Into<String>, view: ViewDefinition) -> Self {
        self.views.insert(name.into(), view);
        self
    }

    /// Add or replace the list function `name`
    pub fn with_list(mut self, name: impl Into<String>, list: impl Into<FunctionSource>) -> Self {
        self.lists.insert(name.into(), list.into());
        self
    }

    /// Set a design document option, e.g. `local_seq`
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// Add or replace the top-level member `name`, e.g. `validate_doc_update`
    ///
    /// Names with a dedicated builder (`language`, `views`, `lists`, `options`) and the
    /// server-managed `_id` and `_rev` are ignored.
    pub fn with_member(mut self, name: impl Into<String>, value: impl Into<DesignValue>) -> Self {
        let name = name.into();
        if RESERVED_MEMBERS.contains(&name.as_str()) {
            warn!(member = %name, "ignoring reserved design document member");
            return self;
        }
        self.members.insert(name, value.into());
        self
    }

    pub fn member(&self, name: &str) -> Option<&DesignValue> {
        self.members.get(name)
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn view(&self, name: &str) -> Option<&ViewDefinition> {
        self.views.get(name)
    }

    pub fn list(&self, name: &str) -> Option<&FunctionSource> {
        self.lists.get(name)
    }

    /// The canonical serialized form, which is also the body used to install the document
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Compute the [`Fingerprint`] of the canonical form
    pub fn fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
        let canonical = self.canonical_json()?;
        Ok(Fingerprint(hex::encode(Sha256::digest(canonical.as_bytes()))))
    }
}

/// Lowercase hex SHA-256 of a design document's canonical form
///
/// Used as the document's id on the server, `_design/<fingerprint>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The server-side id, `_design/<fingerprint>`
    pub fn design_id(&self) -> String {
        format!("{DESIGN_PREFIX}{}", self.0)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    const BY_NAME: &str = "function(doc) { emit(doc.name, null); }";

    fn doc() -> DesignDocument {
        DesignDocument::new()
            .with_view("by_name", ViewDefinition::new(BY_NAME))
            .with_view(
                "count",
                ViewDefinition::new("function(doc) { emit(doc.type, 1); }").with_reduce("_sum"),
            )
            .with_list("names", "function(head, req) { send('x'); }")
    }

    #[test]
    fn canonical_form_renders_function_source() {
        let canonical: Value = serde_json::from_str(&doc().canonical_json().unwrap()).unwrap();
        assert_eq!(
            canonical,
            json!({
                "language": "javascript",
                "views": {
                    "by_name": {"map": BY_NAME},
                    "count": {
                        "map": "function(doc) { emit(doc.type, 1); }",
                        "reduce": "_sum",
                    },
                },
                "lists": {"names": "function(head, req) { send('x'); }"},
            })
        );
    }

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let reordered = DesignDocument::new()
            .with_list("names", "function(head, req) { send('x'); }")
            .with_view(
                "count",
                ViewDefinition::new("function(doc) { emit(doc.type, 1); }").with_reduce("_sum"),
            )
            .with_view("by_name", ViewDefinition::new(BY_NAME));
        assert_eq!(doc().fingerprint().unwrap(), reordered.fingerprint().unwrap());
    }

    #[test]
    fn fingerprint_tracks_function_source() {
        let changed = doc().with_view(
            "by_name",
            ViewDefinition::new("function(doc) { emit(doc.name, 1); }"),
        );
        assert_ne!(doc().fingerprint().unwrap(), changed.fingerprint().unwrap());

        let reduced = doc().with_view("by_name", ViewDefinition::new(BY_NAME).with_reduce("_count"));
        assert_ne!(doc().fingerprint().unwrap(), reduced.fingerprint().unwrap());
    }

    #[test]
    fn extra_members_are_top_level_and_canonical() {
        let doc = DesignDocument::new()
            .with_member("validate_doc_update", "function(newDoc) { }")
            .with_member(
                "filters",
                [("recent", "function(doc, req) { return true; }")]
                    .into_iter()
                    .collect::<DesignValue>(),
            )
            .with_member("updates", json!({"z": "function() {}", "a": {"n": 1}}))
            .with_option("local_seq", true);

        assert_eq!(
            doc.canonical_json().unwrap(),
            concat!(
                r#"{"language":"javascript","options":{"local_seq":true},"#,
                r#""filters":{"recent":"function(doc, req) { return true; }"},"#,
                r#""updates":{"a":{"n":1},"z":"function() {}"},"#,
                r#""validate_doc_update":"function(newDoc) { }"}"#,
            )
        );
        assert_eq!(
            doc.member("validate_doc_update"),
            Some(&DesignValue::Function("function(newDoc) { }".into()))
        );
    }

    #[test]
    fn fingerprint_tracks_other_functions() {
        let validated = doc().with_member("validate_doc_update", "function(newDoc) { }");
        let changed = doc().with_member(
            "validate_doc_update",
            "function(newDoc) { throw({forbidden: 'no'}); }",
        );
        assert_ne!(doc().fingerprint().unwrap(), validated.fingerprint().unwrap());
        assert_ne!(validated.fingerprint().unwrap(), changed.fingerprint().unwrap());
    }

    #[test]
    fn reserved_members_are_ignored() {
        let ignored = doc()
            .with_member("views", json!({}))
            .with_member("_rev", "1-x");
        assert_eq!(ignored.member("views"), None);
        assert_eq!(ignored.fingerprint().unwrap(), doc().fingerprint().unwrap());
    }

    #[test]
    fn installed_document_round_trips() {
        let doc = doc().with_member("shows", json!({"detail": "function(doc, req) { }"}));
        let parsed: DesignDocument = serde_json::from_str(&doc.canonical_json().unwrap()).unwrap();
        assert_eq!(parsed, doc);
        assert_eq!(parsed.fingerprint().unwrap(), doc.fingerprint().unwrap());
    }

    #[test]
    fn fingerprint_is_lowercase_sha256_hex() {
        let fp = doc().fingerprint().unwrap();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
        assert_eq!(fp.design_id(), format!("_design/{fp}"));

        // the empty document hashes its canonical form, `{"language":"javascript"}`
        let empty = DesignDocument::new().fingerprint().unwrap();
        let expected = hex::encode(Sha256::digest(br#"{"language":"javascript"}"#));
        assert_eq!(empty.as_str(), expected);
    }
}
