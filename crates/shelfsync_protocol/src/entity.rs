//! Entities subject to sync and the remote delta format.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The mutable domain objects that are synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A bookmark inside a document.
    Bookmark,
    /// A comment attached to a document location.
    Comment,
    /// A user-defined tag.
    Tag,
    /// A link between a document and a tag.
    DocumentTag,
    /// A share of a document or library with another user.
    Share,
    /// The reading position within a document.
    ReadingProgress,
    /// A library definition.
    Library,
}

impl EntityType {
    /// All entity types, in a stable order.
    pub const ALL: [EntityType; 7] = [
        EntityType::Bookmark,
        EntityType::Comment,
        EntityType::Tag,
        EntityType::DocumentTag,
        EntityType::Share,
        EntityType::ReadingProgress,
        EntityType::Library,
    ];

    /// Returns the canonical snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Bookmark => "bookmark",
            EntityType::Comment => "comment",
            EntityType::Tag => "tag",
            EntityType::DocumentTag => "document_tag",
            EntityType::Share => "share",
            EntityType::ReadingProgress => "reading_progress",
            EntityType::Library => "library",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEntityType(s.to_string()))
    }
}

/// A point-in-time view of one entity, local or remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Type of the entity.
    pub entity_type: EntityType,
    /// Identifier of the entity.
    pub entity_id: String,
    /// Field values.
    pub fields: BTreeMap<String, Value>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Server-assigned version; 0 if never acknowledged.
    pub version: u64,
    /// Whether the entity has been deleted.
    pub deleted: bool,
}

impl EntitySnapshot {
    /// Creates a live snapshot with no fields.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            fields: BTreeMap::new(),
            updated_at,
            version: 0,
            deleted: false,
        }
    }

    /// Sets one field.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Sets the server version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Marks the snapshot as a deletion.
    pub fn into_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Builds field values from a JSON payload.
    ///
    /// Objects map one-to-one onto fields; any other value is stored under
    /// the `value` field.
    pub fn fields_from_payload(payload: &Value) -> BTreeMap<String, Value> {
        match payload {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Value::Null => BTreeMap::new(),
            other => BTreeMap::from([("value".to_string(), other.clone())]),
        }
    }

    /// Renders the fields back into a JSON object.
    pub fn fields_as_payload(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Position in the server's change feed.
///
/// The feed is ordered by `(updated_at, entity_type, entity_id)`. A cursor
/// names the last change a client has seen, so a page that ends inside a
/// run of equal timestamps resumes at the next change rather than the next
/// timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeltaCursor {
    /// Modification time of the change.
    pub updated_at: DateTime<Utc>,
    /// Entity type of the change.
    pub entity_type: EntityType,
    /// Entity identifier of the change.
    pub entity_id: String,
}

impl DeltaCursor {
    /// The feed position of `snapshot`.
    pub fn of(snapshot: &EntitySnapshot) -> Self {
        Self {
            updated_at: snapshot.updated_at,
            entity_type: snapshot.entity_type,
            entity_id: snapshot.entity_id.clone(),
        }
    }
}

/// One page of remote changes returned by a delta pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteDelta {
    /// Changed entities, oldest first. Deletions have `deleted` set.
    pub changes: Vec<EntitySnapshot>,
    /// Server clock at the time of the response, if reported.
    pub server_time: Option<DateTime<Utc>>,
    /// Whether more changes are available after this page.
    pub has_more: bool,
    /// Where the next page starts, if the server reports it.
    pub next_cursor: Option<DeltaCursor>,
}

impl RemoteDelta {
    /// A delta with no changes.
    pub fn empty(server_time: Option<DateTime<Utc>>) -> Self {
        Self {
            changes: Vec::new(),
            server_time,
            has_more: false,
            next_cursor: None,
        }
    }

    /// The feed position of the last change in this page.
    pub fn last_cursor(&self) -> Option<DeltaCursor> {
        self.changes.iter().map(DeltaCursor::of).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_type_names_round_trip() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert!(matches!(
            "highlight".parse::<EntityType>(),
            Err(ProtocolError::UnknownEntityType(_))
        ));
    }

    #[test]
    fn payload_fields() {
        let fields = EntitySnapshot::fields_from_payload(&json!({"title": "x", "page": 3}));
        assert_eq!(fields.len(), 2);

        let scalar = EntitySnapshot::fields_from_payload(&json!(0.75));
        assert_eq!(scalar.get("value"), Some(&json!(0.75)));

        assert!(EntitySnapshot::fields_from_payload(&Value::Null).is_empty());
    }

    #[test]
    fn last_cursor_in_delta() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        let delta = RemoteDelta {
            changes: vec![
                EntitySnapshot::new(EntityType::Tag, "t1", t1),
                EntitySnapshot::new(EntityType::Tag, "t2", t0),
            ],
            ..RemoteDelta::default()
        };
        let cursor = delta.last_cursor().unwrap();
        assert_eq!(cursor.updated_at, t1);
        assert_eq!(cursor.entity_id, "t1");
        assert_eq!(RemoteDelta::empty(None).last_cursor(), None);
    }

    #[test]
    fn cursor_breaks_timestamp_ties_by_entity() {
        let t = Utc::now();
        let a = DeltaCursor::of(&EntitySnapshot::new(EntityType::Tag, "a", t));
        let b = DeltaCursor::of(&EntitySnapshot::new(EntityType::Tag, "b", t));
        let comment = DeltaCursor::of(&EntitySnapshot::new(EntityType::Comment, "z", t));
        let later = DeltaCursor::of(&EntitySnapshot::new(
            EntityType::Bookmark,
            "a",
            t + chrono::Duration::seconds(1),
        ));

        assert!(a < b);
        assert!(comment < a);
        assert!(b < later);
    }
}
