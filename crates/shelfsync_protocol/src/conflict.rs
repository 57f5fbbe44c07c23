//! Conflict detection and merging.

use crate::entity::{EntitySnapshot, EntityType};
use crate::job::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A divergence between a job's intended state and the server's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// The job whose remote apply was rejected.
    pub job_id: JobId,
    /// Entity identifier.
    pub entity_id: String,
    /// Entity type.
    pub entity_type: EntityType,
    /// Classification, e.g. `"title_conflict"`.
    pub conflict_type: String,
    /// Fields both sides changed since the common ancestor.
    pub fields: Vec<String>,
    /// The state the client wanted to write.
    pub client_version: EntitySnapshot,
    /// The state the server holds.
    pub server_version: EntitySnapshot,
    /// The common ancestor, if it was known.
    pub ancestor: Option<EntitySnapshot>,
    /// Advisory resolution.
    pub suggested: ConflictResolution,
    /// Chosen resolution; `None` while pending.
    pub resolution: Option<ConflictResolution>,
    /// Whether the conflict has been resolved.
    pub resolved: bool,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Records the chosen resolution.
    pub fn resolve(&mut self, resolution: ConflictResolution) {
        self.resolution = Some(resolution);
        self.resolved = true;
    }

    /// Returns true if the conflict still awaits a decision.
    pub fn is_pending(&self) -> bool {
        !self.resolved
    }
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Push the client's version over the server's.
    UseLocal,
    /// Adopt the server's version and drop the local change.
    UseServer,
    /// Combine both versions with [`merge_changes`].
    Merge,
    /// Discard the job without touching either side.
    Skip,
}

impl ConflictResolution {
    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::UseLocal => "use_local",
            ConflictResolution::UseServer => "use_server",
            ConflictResolution::Merge => "merge",
            ConflictResolution::Skip => "skip",
        }
    }
}

impl std::str::FromStr for ConflictResolution {
    type Err = crate::ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "use_local" | "local" => Ok(ConflictResolution::UseLocal),
            "use_server" | "server" => Ok(ConflictResolution::UseServer),
            "merge" => Ok(ConflictResolution::Merge),
            "skip" => Ok(ConflictResolution::Skip),
            other => Err(crate::ProtocolError::InvalidRequest(format!(
                "unknown resolution {other:?}"
            ))),
        }
    }
}

/// Policy for automatic conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Leave conflicts for an explicit decision.
    #[default]
    Manual,
    /// Server always wins.
    ServerWins,
    /// Client always wins.
    ClientWins,
    /// Apply the suggested resolution (later modification wins).
    LastWriteWins,
    /// Always merge.
    MergeFields,
}

impl ConflictPolicy {
    /// Picks a resolution for `conflict`, or `None` under [`ConflictPolicy::Manual`].
    pub fn choose(&self, conflict: &SyncConflict) -> Option<ConflictResolution> {
        match self {
            ConflictPolicy::Manual => None,
            ConflictPolicy::ServerWins => Some(ConflictResolution::UseServer),
            ConflictPolicy::ClientWins => Some(ConflictResolution::UseLocal),
            ConflictPolicy::LastWriteWins => Some(conflict.suggested),
            ConflictPolicy::MergeFields => Some(ConflictResolution::Merge),
        }
    }
}

/// Whether `side` changed `field` since `ancestor`.
///
/// Without an ancestor every field counts as changed. With one, the side
/// must be newer than the ancestor and hold a different value.
fn changed_since(side: &EntitySnapshot, ancestor: Option<&EntitySnapshot>, field: &str) -> bool {
    match ancestor {
        None => true,
        Some(base) => {
            side.updated_at > base.updated_at && side.fields.get(field) != base.fields.get(field)
        }
    }
}

fn touched_since(side: &EntitySnapshot, ancestor: Option<&EntitySnapshot>) -> bool {
    ancestor.map_or(true, |base| side.updated_at > base.updated_at)
}

fn later_wins(local: &EntitySnapshot, server: &EntitySnapshot) -> ConflictResolution {
    if local.updated_at > server.updated_at {
        ConflictResolution::UseLocal
    } else {
        ConflictResolution::UseServer
    }
}

/// Compares a job's intended state with the server's state.
///
/// Returns `None` when the server already holds every value the client
/// wants to write. Otherwise the conflict is classified by the fields both
/// sides changed since `ancestor`: one field gives `"<field>_conflict"`,
/// several give `"multi_field_conflict"`, a deletion on one side against an
/// edit on the other gives `"delete_conflict"`, and a version mismatch with
/// no overlapping edits gives `"version_conflict"` (suggested: merge).
///
/// The suggested resolution for overlapping edits favours the later
/// modification timestamp; ties favour the server.
pub fn detect_conflict(
    job_id: JobId,
    local: &EntitySnapshot,
    server: &EntitySnapshot,
    ancestor: Option<&EntitySnapshot>,
    now: DateTime<Utc>,
) -> Option<SyncConflict> {
    let differing: Vec<&String> = local
        .fields
        .keys()
        .filter(|k| local.fields.get(*k) != server.fields.get(*k))
        .collect();

    if local.deleted == server.deleted && differing.is_empty() {
        return None;
    }

    let (conflict_type, fields, suggested) = if local.deleted != server.deleted {
        let other = if local.deleted { server } else { local };
        if touched_since(other, ancestor) {
            ("delete_conflict".to_string(), Vec::new(), later_wins(local, server))
        } else {
            (
                "version_conflict".to_string(),
                Vec::new(),
                if local.deleted {
                    ConflictResolution::UseLocal
                } else {
                    ConflictResolution::UseServer
                },
            )
        }
    } else {
        let overlapping: Vec<String> = differing
            .into_iter()
            .filter(|k| changed_since(local, ancestor, k) && changed_since(server, ancestor, k))
            .cloned()
            .collect();

        match overlapping.len() {
            0 => ("version_conflict".to_string(), overlapping, ConflictResolution::Merge),
            1 => (
                format!("{}_conflict", overlapping[0]),
                overlapping,
                later_wins(local, server),
            ),
            _ => (
                "multi_field_conflict".to_string(),
                overlapping,
                later_wins(local, server),
            ),
        }
    };

    Some(SyncConflict {
        job_id,
        entity_id: local.entity_id.clone(),
        entity_type: local.entity_type,
        conflict_type,
        fields,
        client_version: local.clone(),
        server_version: server.clone(),
        ancestor: ancestor.cloned(),
        suggested,
        resolution: None,
        resolved: false,
        detected_at: now,
    })
}

/// Set union of two arrays, keeping server order and appending local-only items.
fn union_arrays(server: &[Value], local: &[Value]) -> Value {
    let mut merged = server.to_vec();
    for item in local {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    Value::Array(merged)
}

/// Merges the client's and the server's versions of an entity.
///
/// Starts from the server's fields and layers on the client's edits that do
/// not overlap a server edit. Array-valued fields present on both sides are
/// merged as a set union. For overlapping scalar edits the later
/// modification wins, ties going to the server.
pub fn merge_changes(
    local: &EntitySnapshot,
    server: &EntitySnapshot,
    ancestor: Option<&EntitySnapshot>,
) -> EntitySnapshot {
    let local_wins_ties = local.updated_at > server.updated_at;
    let mut fields: BTreeMap<String, Value> = server.fields.clone();

    for (name, local_value) in &local.fields {
        let server_value = server.fields.get(name);
        if server_value == Some(local_value) {
            continue;
        }

        let merged = match (server_value, local_value) {
            (Some(Value::Array(s)), Value::Array(l)) => Some(union_arrays(s, l)),
            (None, _) => Some(local_value.clone()),
            (Some(_), _) => {
                let local_edit = changed_since(local, ancestor, name);
                let server_edit = changed_since(server, ancestor, name);
                match (local_edit, server_edit) {
                    (true, false) => Some(local_value.clone()),
                    (true, true) if local_wins_ties => Some(local_value.clone()),
                    _ => None,
                }
            }
        };

        if let Some(value) = merged {
            fields.insert(name.clone(), value);
        }
    }

    EntitySnapshot {
        entity_type: server.entity_type,
        entity_id: server.entity_id.clone(),
        fields,
        updated_at: local.updated_at.max(server.updated_at),
        version: server.version,
        deleted: local.deleted && server.deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn snapshot(at: DateTime<Utc>) -> EntitySnapshot {
        EntitySnapshot::new(EntityType::Bookmark, "b1", at)
    }

    #[test]
    fn later_server_edit_wins_title_conflict() {
        let t = Utc::now();
        let local = snapshot(t - Duration::seconds(1)).with_field("title", json!("Mine"));
        let server = snapshot(t).with_field("title", json!("Theirs"));

        let conflict = detect_conflict(JobId(1), &local, &server, None, t).unwrap();
        assert_eq!(conflict.conflict_type, "title_conflict");
        assert_eq!(conflict.fields, vec!["title".to_string()]);
        assert_eq!(conflict.suggested, ConflictResolution::UseServer);
        assert!(conflict.is_pending());
    }

    #[test]
    fn later_local_edit_is_suggested() {
        let t = Utc::now();
        let local = snapshot(t + Duration::seconds(1)).with_field("title", json!("Mine"));
        let server = snapshot(t).with_field("title", json!("Theirs"));

        let conflict = detect_conflict(JobId(1), &local, &server, None, t).unwrap();
        assert_eq!(conflict.suggested, ConflictResolution::UseLocal);
    }

    #[test]
    fn ties_favour_server() {
        let t = Utc::now();
        let local = snapshot(t).with_field("note", json!("a"));
        let server = snapshot(t).with_field("note", json!("b"));

        let conflict = detect_conflict(JobId(1), &local, &server, None, t).unwrap();
        assert_eq!(conflict.suggested, ConflictResolution::UseServer);
    }

    #[test]
    fn identical_values_are_not_a_conflict() {
        let t = Utc::now();
        let local = snapshot(t).with_field("title", json!("Same"));
        let server = snapshot(t + Duration::seconds(3))
            .with_field("title", json!("Same"))
            .with_field("color", json!("red"));

        assert!(detect_conflict(JobId(1), &local, &server, None, t).is_none());
    }

    #[test]
    fn disjoint_edits_since_ancestor_are_a_version_conflict() {
        let t0 = Utc::now();
        let ancestor = snapshot(t0)
            .with_field("title", json!("Old"))
            .with_field("color", json!("red"));
        let local = snapshot(t0 + Duration::seconds(5)).with_field("title", json!("New"));
        let server = snapshot(t0 + Duration::seconds(2))
            .with_field("title", json!("Old"))
            .with_field("color", json!("blue"));

        let conflict = detect_conflict(JobId(9), &local, &server, Some(&ancestor), t0).unwrap();
        assert_eq!(conflict.conflict_type, "version_conflict");
        assert!(conflict.fields.is_empty());
        assert_eq!(conflict.suggested, ConflictResolution::Merge);
    }

    #[test]
    fn several_overlapping_fields() {
        let t = Utc::now();
        let local = snapshot(t)
            .with_field("title", json!("A"))
            .with_field("page", json!(3));
        let server = snapshot(t)
            .with_field("title", json!("B"))
            .with_field("page", json!(9));

        let conflict = detect_conflict(JobId(1), &local, &server, None, t).unwrap();
        assert_eq!(conflict.conflict_type, "multi_field_conflict");
        assert_eq!(conflict.fields.len(), 2);
    }

    #[test]
    fn delete_against_edit() {
        let t = Utc::now();
        let local = snapshot(t).into_deleted();
        let server = snapshot(t + Duration::seconds(1)).with_field("title", json!("Edited"));

        let conflict = detect_conflict(JobId(1), &local, &server, None, t).unwrap();
        assert_eq!(conflict.conflict_type, "delete_conflict");
        assert_eq!(conflict.suggested, ConflictResolution::UseServer);
    }

    #[test]
    fn merge_keeps_non_overlapping_edits() {
        let t0 = Utc::now();
        let ancestor = snapshot(t0)
            .with_field("title", json!("Old"))
            .with_field("color", json!("red"));
        let local = snapshot(t0 + Duration::seconds(5)).with_field("title", json!("New"));
        let server = snapshot(t0 + Duration::seconds(2))
            .with_field("title", json!("Old"))
            .with_field("color", json!("blue"))
            .with_version(7);

        let merged = merge_changes(&local, &server, Some(&ancestor));
        assert_eq!(merged.fields.get("title"), Some(&json!("New")));
        assert_eq!(merged.fields.get("color"), Some(&json!("blue")));
        assert_eq!(merged.version, 7);
        assert_eq!(merged.updated_at, local.updated_at);
    }

    #[test]
    fn merge_unions_tag_sets() {
        let t = Utc::now();
        let local = snapshot(t).with_field("tags", json!(["fiction", "to-read"]));
        let server =
            snapshot(t + Duration::seconds(1)).with_field("tags", json!(["fiction", "classic"]));

        let merged = merge_changes(&local, &server, None);
        assert_eq!(
            merged.fields.get("tags"),
            Some(&json!(["fiction", "classic", "to-read"]))
        );
    }

    #[test]
    fn merge_overlapping_scalar_takes_later_side() {
        let t = Utc::now();
        let local = snapshot(t + Duration::seconds(10)).with_field("title", json!("Local"));
        let server = snapshot(t).with_field("title", json!("Server"));
        assert_eq!(
            merge_changes(&local, &server, None).fields.get("title"),
            Some(&json!("Local"))
        );

        let local = snapshot(t).with_field("title", json!("Local"));
        let server = snapshot(t).with_field("title", json!("Server"));
        assert_eq!(
            merge_changes(&local, &server, None).fields.get("title"),
            Some(&json!("Server"))
        );
    }

    #[test]
    fn policies() {
        let t = Utc::now();
        let local = snapshot(t).with_field("title", json!("a"));
        let server = snapshot(t + Duration::seconds(1)).with_field("title", json!("b"));
        let conflict = detect_conflict(JobId(1), &local, &server, None, t).unwrap();

        assert_eq!(ConflictPolicy::Manual.choose(&conflict), None);
        assert_eq!(
            ConflictPolicy::ClientWins.choose(&conflict),
            Some(ConflictResolution::UseLocal)
        );
        assert_eq!(
            ConflictPolicy::LastWriteWins.choose(&conflict),
            Some(ConflictResolution::UseServer)
        );
        assert_eq!(
            ConflictPolicy::MergeFields.choose(&conflict),
            Some(ConflictResolution::Merge)
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn disjoint_edits_are_all_kept(edits in prop::collection::vec(0u8..3, 1..8)) {
                let t = Utc::now();
                let mut ancestor = snapshot(t);
                for i in 0..edits.len() {
                    ancestor = ancestor.with_field(format!("f{i}"), json!(0));
                }
                let mut local = ancestor.clone();
                local.updated_at = t + Duration::seconds(1);
                let mut server = ancestor.clone();
                server.updated_at = t + Duration::seconds(2);

                for (i, edit) in edits.iter().enumerate() {
                    match edit {
                        1 => local = local.with_field(format!("f{i}"), json!(1)),
                        2 => server = server.with_field(format!("f{i}"), json!(2)),
                        _ => {}
                    }
                }

                let merged = merge_changes(&local, &server, Some(&ancestor));
                prop_assert_eq!(merged.fields.len(), edits.len());
                for (i, edit) in edits.iter().enumerate() {
                    prop_assert_eq!(merged.fields.get(&format!("f{i}")), Some(&json!(*edit)));
                }
            }
        }
    }
}
