//! Label sets and label matchers
//!
//! [`Labels`] is kept sorted by name so that two label sets with the same
//! content compare, hash and order identically. The backing storage is shared,
//! which keeps cloning a label set per sample per step cheap.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::query::error::QueryError;

/// Metric name label
pub const METRIC_NAME: &str = "__name__";
/// Histogram bucket upper bound label
pub const BUCKET_LABEL: &str = "le";
/// Backend series identifier, preferred as a join key when both sides carry it
pub const TSID_LABEL: &str = "__tsid";
/// Sentinel label name meaning "any label set" during label introspection
pub const ALL_LABELS: &str = "__all";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A sorted, name-unique set of labels identifying a series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Arc<Vec<Label>>);

impl Labels {
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup_by(|next, prev| next.name == prev.name);
        Self(Arc::new(labels))
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(k, v)| Label::new(k, v)).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|l| l.name.as_str())
    }

    fn position(&self, name: &str) -> Result<usize, usize> {
        self.0.binary_search_by(|l| l.name.as_str().cmp(name))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).ok().map(|i| self.0[i].value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_ok()
    }

    /// Sets `name` to `value`; an empty value removes the label.
    pub fn set(&mut self, name: &str, value: &str) {
        if value.is_empty() {
            self.remove(name);
            return;
        }
        match self.position(name) {
            Ok(i) => {
                if self.0[i].value != value {
                    Arc::make_mut(&mut self.0)[i].value = value.to_string();
                }
            }
            Err(i) => Arc::make_mut(&mut self.0).insert(i, Label::new(name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        if let Ok(i) = self.position(name) {
            Arc::make_mut(&mut self.0).remove(i);
        }
    }

    /// Copy of this set without the listed labels.
    pub fn without<S: AsRef<str>>(&self, names: &[S]) -> Labels {
        let labels = self
            .0
            .iter()
            .filter(|l| !names.iter().any(|n| n.as_ref() == l.name))
            .cloned()
            .collect();
        Labels(Arc::new(labels))
    }

    pub fn without_metric_name(&self) -> Labels {
        if self.contains(METRIC_NAME) {
            self.without(&[METRIC_NAME])
        } else {
            self.clone()
        }
    }

    /// Copy of this set restricted to the listed labels.
    pub fn keep<S: AsRef<str>>(&self, names: &[S]) -> Labels {
        let labels = self
            .0
            .iter()
            .filter(|l| names.iter().any(|n| n.as_ref() == l.name))
            .cloned()
            .collect();
        Labels(Arc::new(labels))
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Labels::from_pairs(iter)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        f.write_str("}")
    }
}

impl Serialize for Labels {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for label in self.0.iter() {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

/// Checks a label name against `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regex => "=~",
            MatchOp::NotRegex => "!~",
        };
        f.write_str(op)
    }
}

/// A single label matcher of a selector. Regex matchers are anchored.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    regex: Option<Regex>,
}

impl Matcher {
    pub fn new(
        op: MatchOp,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, QueryError> {
        let value = value.into();
        let regex = match op {
            MatchOp::Regex | MatchOp::NotRegex => Some(
                Regex::new(&format!("^(?:{value})$"))
                    .map_err(|e| QueryError::bad_data(format!("invalid regular expression: {e}")))?,
            ),
            MatchOp::Equal | MatchOp::NotEqual => None,
        };
        Ok(Self {
            name: name.into(),
            op,
            value,
            regex,
        })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            regex: None,
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match (self.op, &self.regex) {
            (MatchOp::Equal, _) => self.value == value,
            (MatchOp::NotEqual, _) => self.value != value,
            (MatchOp::Regex, Some(re)) => re.is_match(value),
            (MatchOp::NotRegex, Some(re)) => !re.is_match(value),
            (MatchOp::Regex | MatchOp::NotRegex, None) => false,
        }
    }

    /// Absent labels match as the empty string.
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.get(&self.name).unwrap_or(""))
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_unique() {
        let labels = Labels::from_pairs([("job", "api"), ("__name__", "up"), ("job", "dup")]);
        let names: Vec<_> = labels.names().collect();
        assert_eq!(names, vec!["__name__", "job"]);
        assert_eq!(labels.get("job"), Some("api"));
    }

    #[test]
    fn test_set_empty_value_removes() {
        let mut labels = Labels::from_pairs([("a", "1"), ("b", "2")]);
        labels.set("c", "3");
        assert_eq!(labels.get("c"), Some("3"));
        labels.set("a", "");
        assert!(!labels.contains("a"));
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn test_set_does_not_touch_shared_copy() {
        let original = Labels::from_pairs([("a", "1")]);
        let mut copy = original.clone();
        copy.set("a", "2");
        assert_eq!(original.get("a"), Some("1"));
        assert_eq!(copy.get("a"), Some("2"));
    }

    #[test]
    fn test_keep_and_without() {
        let labels = Labels::from_pairs([("__name__", "m"), ("a", "1"), ("b", "2")]);
        assert_eq!(labels.keep(&["a"]), Labels::from_pairs([("a", "1")]));
        assert_eq!(
            labels.without(&["a"]),
            Labels::from_pairs([("__name__", "m"), ("b", "2")])
        );
        assert_eq!(
            labels.without_metric_name(),
            Labels::from_pairs([("a", "1"), ("b", "2")])
        );
    }

    #[test]
    fn test_display_and_serialize() {
        let labels = Labels::from_pairs([("b", "2"), ("a", "1")]);
        assert_eq!(labels.to_string(), r#"{a="1", b="2"}"#);
        assert_eq!(
            serde_json::to_string(&labels).unwrap(),
            r#"{"a":"1","b":"2"}"#
        );
    }

    #[test]
    fn test_valid_label_names() {
        assert!(is_valid_label_name("instance"));
        assert!(is_valid_label_name("_hidden9"));
        assert!(!is_valid_label_name("9lives"));
        assert!(!is_valid_label_name("a-b"));
        assert!(!is_valid_label_name(""));
    }

    #[test]
    fn test_regex_matchers_are_anchored() {
        let m = Matcher::new(MatchOp::Regex, "job", "api|web").unwrap();
        assert!(m.matches("api"));
        assert!(!m.matches("api-gateway"));

        let m = Matcher::new(MatchOp::NotRegex, "job", "a.*").unwrap();
        assert!(!m.matches("abc"));
        assert!(m.matches("bcd"));
    }

    #[test]
    fn test_invalid_regex_is_bad_data() {
        let err = Matcher::new(MatchOp::Regex, "job", "(").unwrap_err();
        assert_eq!(err.kind(), crate::query::error::ErrorKind::BadData);
    }

    #[test]
    fn test_missing_label_matches_empty_string() {
        let labels = Labels::from_pairs([("a", "1")]);
        assert!(Matcher::equal("b", "").matches_labels(&labels));
        assert!(!Matcher::equal("b", "x").matches_labels(&labels));
    }
}
