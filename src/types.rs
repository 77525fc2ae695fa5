//! Core types for records, identities, and filters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Record kind carrying profile metadata.
pub const KIND_PROFILE: u32 = 0;
/// Plain note kind; replies use the direct-reply tag convention.
pub const KIND_NOTE: u32 = 1;
/// Contact list kind.
pub const KIND_CONTACTS: u32 = 3;
/// Structured comment kind; replies use scoped root/parent tags.
pub const KIND_COMMENT: u32 = 1111;
/// Declared relay list kind.
pub const KIND_RELAY_LIST: u32 = 10002;

/// Seconds since Unix epoch, as claimed by the record author.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_secs() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch, for store bookkeeping (`added_at`).
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as i64
}

/// True for kinds where only the newest record per author is live.
pub fn is_replaceable_kind(kind: u32) -> bool {
    kind == KIND_PROFILE || kind == KIND_CONTACTS || (10_000..20_000).contains(&kind)
}

/// True for kinds keyed by an additional identifier tag alongside the author.
pub fn is_addressable_kind(kind: u32) -> bool {
    (30_000..40_000).contains(&kind)
}

/// An immutable, content-addressed unit of published data.
///
/// The `id` is the content hash assigned by the publishing protocol and the
/// `created_at` is author-claimed; neither is verified here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub author: String,
    pub kind: u32,
    pub created_at: Timestamp,
    /// Ordered structured references; each tag is `[name, value, ...]`.
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventRecord {
    /// Parses the canonical wire form of a record.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes back to the wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// First value of the first tag with the given name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Identifier tag value for addressable records (empty when absent).
    pub fn identifier(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }

    /// Coordinate for replaceable/addressable records.
    pub fn coordinate(&self) -> Option<Coordinate> {
        if is_replaceable_kind(self.kind) {
            Some(Coordinate {
                kind: self.kind,
                author: self.author.clone(),
                identifier: String::new(),
            })
        } else if is_addressable_kind(self.kind) {
            Some(Coordinate {
                kind: self.kind,
                author: self.author.clone(),
                identifier: self.identifier().to_string(),
            })
        } else {
            None
        }
    }

    /// Identity used for dedup and graph edges: the coordinate for
    /// replaceable/addressable records, the raw id otherwise.
    pub fn canonical_key(&self) -> CanonicalKey {
        match self.coordinate() {
            Some(coord) => CanonicalKey(coord.to_string()),
            None => CanonicalKey(self.id.clone()),
        }
    }
}

/// Dedup/graph identity of a record or thread root.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct CanonicalKey(pub String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanonicalKey({})", self.0)
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CanonicalKey {
    fn from(s: &str) -> Self {
        CanonicalKey(s.to_string())
    }
}

/// Address of a replaceable record: `kind:author[:identifier]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub kind: u32,
    pub author: String,
    pub identifier: String,
}

impl Coordinate {
    pub fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey(self.to_string())
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.identifier.is_empty() && !is_addressable_kind(self.kind) {
            write!(f, "{}:{}", self.kind, self.author)
        } else {
            write!(f, "{}:{}:{}", self.kind, self.author, self.identifier)
        }
    }
}

impl FromStr for Coordinate {
    type Err = ();

    /// Parses `kind:author[:identifier]`. Anything else is not a coordinate.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let kind = parts.next().ok_or(())?.parse::<u32>().map_err(|_| ())?;
        let author = parts.next().ok_or(())?;
        if author.is_empty() {
            return Err(());
        }
        let identifier = parts.next().unwrap_or("");
        Ok(Coordinate {
            kind,
            author: author.to_string(),
            identifier: identifier.to_string(),
        })
    }
}

/// Tag-equality clause of a [`Filter`]: matches records carrying any of
/// `values` under the tag `name`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagQuery {
    pub name: String,
    pub values: Vec<String>,
}

/// Predicate over records, shared by timeline requests and range scans.
///
/// Clauses combine with AND; values within a clause with OR. An empty filter
/// matches everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub ids: Vec<String>,
    pub authors: Vec<String>,
    pub kinds: Vec<u32>,
    pub tags: Vec<TagQuery>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn tag(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.tags.push(TagQuery {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Tests the record against every clause (the `limit` clause is a scan
    /// bound, not a predicate, and is ignored here).
    pub fn matches(&self, record: &EventRecord) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| *id == record.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|a| *a == record.author) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at > until {
                return false;
            }
        }
        for query in &self.tags {
            let hit = record.tags.iter().any(|t| {
                t.first().map(String::as_str) == Some(query.name.as_str())
                    && t.get(1).is_some_and(|v| query.values.iter().any(|q| q == v))
            });
            if !hit {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: u32, tags: Vec<Vec<String>>) -> EventRecord {
        EventRecord {
            id: "id1".into(),
            author: "alice".into(),
            kind,
            created_at: Timestamp(1000),
            tags,
            content: String::new(),
        }
    }

    #[test]
    fn test_canonical_key_regular() {
        let r = record(KIND_NOTE, vec![]);
        assert_eq!(r.canonical_key().as_str(), "id1");
    }

    #[test]
    fn test_wire_roundtrip() {
        let r = record(KIND_NOTE, vec![vec!["e".into(), "parent".into()]]);
        let json = r.to_json().unwrap();
        let parsed = EventRecord::from_json(&json).unwrap();
        assert_eq!(parsed, r);

        assert!(EventRecord::from_json("{\"id\": 42}").is_err());
    }

    #[test]
    fn test_canonical_key_replaceable() {
        let r = record(KIND_RELAY_LIST, vec![]);
        assert_eq!(r.canonical_key().as_str(), "10002:alice");
    }

    #[test]
    fn test_canonical_key_addressable() {
        let r = record(30023, vec![vec!["d".into(), "post-1".into()]]);
        assert_eq!(r.canonical_key().as_str(), "30023:alice:post-1");
    }

    #[test]
    fn test_coordinate_roundtrip() {
        let coord: Coordinate = "30023:alice:post-1".parse().unwrap();
        assert_eq!(coord.kind, 30023);
        assert_eq!(coord.identifier, "post-1");
        assert_eq!(coord.to_string(), "30023:alice:post-1");

        let plain: Coordinate = "10002:alice".parse().unwrap();
        assert_eq!(plain.to_string(), "10002:alice");
    }

    #[test]
    fn test_coordinate_rejects_malformed() {
        assert!("not-a-kind:alice".parse::<Coordinate>().is_err());
        assert!("10002:".parse::<Coordinate>().is_err());
        assert!("10002".parse::<Coordinate>().is_err());
    }

    #[test]
    fn test_filter_matches() {
        let r = record(
            KIND_COMMENT,
            vec![vec!["E".into(), "root-id".into(), "".into(), "bob".into()]],
        );

        assert!(Filter::new().kinds([KIND_COMMENT]).matches(&r));
        assert!(Filter::new().tag("E", ["root-id"]).matches(&r));
        assert!(!Filter::new().tag("E", ["other"]).matches(&r));
        assert!(!Filter::new().kinds([KIND_NOTE]).matches(&r));
        assert!(!Filter::new().since(Timestamp(2000)).matches(&r));
        assert!(Filter::new().until(Timestamp(2000)).matches(&r));
        assert!(Filter::new().authors(["alice"]).matches(&r));
    }
}
