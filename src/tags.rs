//! Parentage reference decoding.
//!
//! Records point at their conversation root and immediate parent through
//! three encodings: by immutable record id, by replaceable-record coordinate,
//! or by an opaque external identifier. Plain notes carry marked or
//! positional id references; structured comments carry scoped tags
//! (uppercase for the root, lowercase for the parent).
//!
//! Anything malformed decodes to `None`: an unparseable reference means
//! "not a reply", never an error.

use crate::types::{CanonicalKey, Coordinate, EventRecord, KIND_COMMENT, KIND_NOTE};

/// A reference from a record to its root or immediate parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentRef {
    /// Points to an immutable record by id.
    Event {
        id: String,
        relay_hint: Option<String>,
        author_hint: Option<String>,
    },
    /// Points to a replaceable record by coordinate.
    Address {
        coordinate: Coordinate,
        relay_hint: Option<String>,
    },
    /// Points to a foreign identifier outside this system.
    External { id: String },
}

impl ParentRef {
    /// Graph-edge identity of the referenced entity.
    pub fn canonical_key(&self) -> CanonicalKey {
        match self {
            ParentRef::Event { id, .. } => CanonicalKey(id.clone()),
            ParentRef::Address { coordinate, .. } => coordinate.canonical_key(),
            ParentRef::External { id } => CanonicalKey(id.clone()),
        }
    }
}

fn non_empty(tag: &[String], index: usize) -> Option<&str> {
    tag.get(index).map(String::as_str).filter(|s| !s.is_empty())
}

fn is_marker(value: &str) -> bool {
    matches!(value, "root" | "reply" | "mention")
}

/// A decoded id reference from a note tag: `["e", id, relay?, marker?, author?]`,
/// with the relay position optionally omitted by some writers.
struct NoteRef<'a> {
    id: &'a str,
    relay: Option<&'a str>,
    marker: Option<&'a str>,
    author: Option<&'a str>,
}

fn parse_note_ref(tag: &[String]) -> Option<NoteRef<'_>> {
    if tag.first().map(String::as_str) != Some("e") {
        return None;
    }
    let id = non_empty(tag, 1)?;
    let (relay, marker, author) = match non_empty(tag, 2) {
        Some(v) if is_marker(v) => (None, Some(v), non_empty(tag, 3)),
        relay => {
            let marker = non_empty(tag, 3).filter(|v| is_marker(v));
            (relay, marker, non_empty(tag, 4))
        }
    };
    Some(NoteRef {
        id,
        relay,
        marker,
        author,
    })
}

fn event_ref(r: &NoteRef<'_>) -> ParentRef {
    ParentRef::Event {
        id: r.id.to_string(),
        relay_hint: r.relay.map(str::to_string),
        author_hint: r.author.map(str::to_string),
    }
}

/// Decodes one scoped tag (`E`/`A`/`I` or `e`/`a`/`i`).
fn parse_scoped(tag: &[String], names: [&str; 3]) -> Option<ParentRef> {
    let name = tag.first()?.as_str();
    let value = non_empty(tag, 1)?;
    if name == names[0] {
        Some(ParentRef::Event {
            id: value.to_string(),
            relay_hint: non_empty(tag, 2).map(str::to_string),
            author_hint: non_empty(tag, 3).map(str::to_string),
        })
    } else if name == names[1] {
        let coordinate: Coordinate = value.parse().ok()?;
        Some(ParentRef::Address {
            coordinate,
            relay_hint: non_empty(tag, 2).map(str::to_string),
        })
    } else if name == names[2] {
        Some(ParentRef::External {
            id: value.to_string(),
        })
    } else {
        None
    }
}

/// Explicit root reference carried by the record, if any.
///
/// Scoped uppercase tags win; notes fall back to the marked-`root` reference
/// and then to the deprecated positional scheme (first id tag is the root).
pub fn root_reference(record: &EventRecord) -> Option<ParentRef> {
    if let Some(found) = record
        .tags
        .iter()
        .find_map(|t| parse_scoped(t, ["E", "A", "I"]))
    {
        return Some(found);
    }

    if record.kind != KIND_NOTE {
        return None;
    }

    let refs: Vec<NoteRef<'_>> = record.tags.iter().filter_map(|t| parse_note_ref(t)).collect();
    if let Some(root) = refs.iter().find(|r| r.marker == Some("root")) {
        return Some(event_ref(root));
    }
    // Positional scheme only applies when nothing is marked.
    if refs.iter().any(|r| r.marker.is_some()) {
        return None;
    }
    refs.first().map(event_ref)
}

/// Immediate-parent reference, if the record is reply-shaped.
pub fn parent_reference(record: &EventRecord) -> Option<ParentRef> {
    match record.kind {
        KIND_COMMENT => record
            .tags
            .iter()
            .find_map(|t| parse_scoped(t, ["e", "a", "i"])),
        KIND_NOTE => {
            let refs: Vec<NoteRef<'_>> =
                record.tags.iter().filter_map(|t| parse_note_ref(t)).collect();
            if let Some(reply) = refs.iter().find(|r| r.marker == Some("reply")) {
                return Some(event_ref(reply));
            }
            if let Some(root) = refs.iter().find(|r| r.marker == Some("root")) {
                return Some(event_ref(root));
            }
            if refs.iter().any(|r| r.marker.is_some()) {
                return None;
            }
            refs.last().map(event_ref)
        }
        _ => None,
    }
}
