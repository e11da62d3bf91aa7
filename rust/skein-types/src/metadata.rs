//! Call-scoped key/value metadata.
//!
//! Keys are case-insensitive and stored lowercased. Each key maps to an
//! ordered list of string values, and keys keep their insertion order.

use std::fmt;

use facet::Facet;

/// One key and all of its values.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct MetadataEntry {
    pub key: String,
    pub values: Vec<String>,
}

/// Ordered multimap of metadata keys to string values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct Metadata {
    entries: Vec<MetadataEntry>,
}

fn normalize_key(key: &str) -> String {
    key.to_ascii_lowercase()
}

impl Metadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata from `(key, value)` pairs. Repeated keys accumulate values.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut md = Self::new();
        for (k, v) in pairs {
            md.append(k.as_ref(), v);
        }
        md
    }

    fn entry_mut(&mut self, key: &str) -> Option<&mut MetadataEntry> {
        self.entries.iter_mut().find(|e| e.key == key)
    }

    /// Replace every value of `key` with `value`.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let key = normalize_key(key);
        let value = value.into();
        match self.entry_mut(&key) {
            Some(entry) => entry.values = vec![value],
            None => self.entries.push(MetadataEntry {
                key,
                values: vec![value],
            }),
        }
    }

    /// Add `value` after any existing values of `key`.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        let key = normalize_key(key);
        let value = value.into();
        match self.entry_mut(&key) {
            Some(entry) => entry.values.push(value),
            None => self.entries.push(MetadataEntry {
                key,
                values: vec![value],
            }),
        }
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// All values of `key`, empty if absent.
    pub fn get_all(&self, key: &str) -> &[String] {
        let key = normalize_key(key);
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.values.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        !self.get_all(key).is_empty()
    }

    /// Remove `key`, returning its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        let key = normalize_key(key);
        let idx = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(idx).values)
    }

    /// Append every value of `other` onto `self`.
    pub fn merge(&mut self, other: Metadata) {
        for entry in other.entries {
            for value in entry.values {
                self.append(&entry.key, value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|e| (e.key.as_str(), e.values.as_slice()))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, values)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}: [{}]", values.join(" "))?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let mut md = Metadata::new();
        md.append("Type", "unary");
        md.append("TYPE", "stream");
        assert_eq!(md.len(), 1);
        assert_eq!(md.get_all("type"), ["unary", "stream"]);
        assert_eq!(md.get("tYpE"), Some("unary"));
    }

    #[test]
    fn insert_replaces_append_accumulates() {
        let mut md = Metadata::from_pairs([("from", "client"), ("from", "proxy")]);
        assert_eq!(md.get_all("from").len(), 2);
        md.insert("from", "server");
        assert_eq!(md.get_all("from"), ["server"]);
        assert_eq!(md.remove("from"), Some(vec!["server".to_string()]));
        assert!(md.is_empty());
        assert!(md.get_all("from").is_empty());
    }

    #[test]
    fn merge_keeps_order() {
        let mut a = Metadata::from_pairs([("type", "stream")]);
        let b = Metadata::from_pairs([("in", "header"), ("type", "extra")]);
        a.merge(b);
        let keys: Vec<_> = a.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["type", "in"]);
        assert_eq!(a.get_all("type"), ["stream", "extra"]);
        assert_eq!(a.to_string(), "{type: [stream extra], in: [header]}");
    }
}
