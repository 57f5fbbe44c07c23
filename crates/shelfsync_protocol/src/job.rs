//! Mutation jobs.

use crate::conflict::SyncConflict;
use crate::entity::{EntitySnapshot, EntityType};
use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Monotonically assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

/// What a job does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    /// Create the entity.
    Create,
    /// Update some of the entity's fields.
    Update,
    /// Delete the entity.
    Delete,
}

impl MutationOp {
    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(MutationOp::Create),
            "update" => Some(MutationOp::Update),
            "delete" => Some(MutationOp::Delete),
            _ => None,
        }
    }
}

/// The kind of a mutation: an operation on an entity type.
///
/// The string form is `"<op>_<entity_type>"`, e.g. `"create_bookmark"` or
/// `"update_reading_progress"`. Parsing rejects anything outside that closed
/// set; there is no fallback kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKind {
    /// Entity type the job targets.
    pub entity_type: EntityType,
    /// Operation applied to it.
    pub op: MutationOp,
}

impl JobKind {
    /// Creates a kind.
    pub const fn new(op: MutationOp, entity_type: EntityType) -> Self {
        Self { entity_type, op }
    }

    /// Every recognized kind.
    pub fn all() -> impl Iterator<Item = JobKind> {
        EntityType::ALL.into_iter().flat_map(|t| {
            [MutationOp::Create, MutationOp::Update, MutationOp::Delete]
                .into_iter()
                .map(move |op| JobKind::new(op, t))
        })
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.op.as_str(), self.entity_type.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        let unknown = || ProtocolError::UnknownKind(s.to_string());
        let (op, entity) = s.split_once('_').ok_or_else(unknown)?;
        let op = MutationOp::parse(op).ok_or_else(unknown)?;
        let entity_type = entity.parse::<EntityType>().map_err(|_| unknown())?;
        Ok(JobKind::new(op, entity_type))
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be applied (possibly after a backoff delay).
    Pending,
    /// Currently being applied to the remote store.
    Processing,
    /// Applied successfully.
    Completed,
    /// Retries exhausted or permanently rejected; needs manual action.
    Failed,
    /// Rejected because the remote entity moved on; awaiting resolution.
    Conflicted,
}

impl JobStatus {
    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Conflicted => "conflicted",
        }
    }

    /// Returns true once the job will not be applied again automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Conflicted
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "conflicted" => Ok(JobStatus::Conflicted),
            other => Err(ProtocolError::InvalidRequest(format!(
                "unknown job status {other:?}"
            ))),
        }
    }
}

/// A durably queued mutation intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Queue-assigned identifier; creation order.
    pub id: JobId,
    /// Entity the job mutates.
    pub entity_id: String,
    /// What the job does.
    pub kind: JobKind,
    /// Data needed to replay the mutation.
    pub payload: Value,
    /// Entity state the mutation was made against, if known.
    pub base: Option<EntitySnapshot>,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the job last changed state.
    pub updated_at: DateTime<Utc>,
    /// Earliest time a retry may run.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// The detected conflict while the job is conflicted.
    pub conflict: Option<SyncConflict>,
}

impl Job {
    /// Creates a pending job.
    pub fn new(
        id: JobId,
        entity_id: String,
        kind: JobKind,
        payload: Value,
        base: Option<EntitySnapshot>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            entity_id,
            kind,
            payload,
            base,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at,
            updated_at: created_at,
            next_attempt_at: None,
            conflict: None,
        }
    }

    /// Type of the targeted entity.
    pub fn entity_type(&self) -> EntityType {
        self.kind.entity_type
    }

    /// Returns true if `now` is at or past the job's retry time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// The entity state this job intends to produce.
    ///
    /// Only the fields carried in the payload are included; a partial
    /// update leaves the others untouched.
    pub fn intended_state(&self) -> EntitySnapshot {
        EntitySnapshot {
            entity_type: self.entity_type(),
            entity_id: self.entity_id.clone(),
            fields: EntitySnapshot::fields_from_payload(&self.payload),
            updated_at: self.created_at,
            version: self.base.as_ref().map_or(0, |b| b.version),
            deleted: self.kind.op == MutationOp::Delete,
        }
    }
}

/// A caller's request to enqueue a mutation.
///
/// The kind is carried as text so that it can come straight from a caller
/// and is validated by the queue at enqueue time.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    /// Entity the mutation targets.
    pub entity_id: String,
    /// Mutation kind, e.g. `"create_bookmark"`.
    pub kind: String,
    /// Mutation data.
    pub payload: Value,
    /// Entity state the mutation was made against.
    pub base: Option<EntitySnapshot>,
}

impl MutationRequest {
    /// Creates a request.
    pub fn new(entity_id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind: kind.into(),
            payload,
            base: None,
        }
    }

    /// Creates a request from an already typed kind.
    pub fn typed(entity_id: impl Into<String>, kind: JobKind, payload: Value) -> Self {
        Self::new(entity_id, kind.to_string(), payload)
    }

    /// Records the entity state the mutation was made against.
    pub fn with_base(mut self, base: EntitySnapshot) -> Self {
        self.base = Some(base);
        self
    }

    /// Validates the request and returns its parsed kind.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidRequest`] for an empty entity id or
    /// kind, a base snapshot for a different entity, and
    /// [`ProtocolError::UnknownKind`] for an unrecognized kind.
    pub fn validate(&self) -> ProtocolResult<JobKind> {
        if self.entity_id.trim().is_empty() {
            return Err(ProtocolError::InvalidRequest("entity id is empty".into()));
        }
        if self.kind.trim().is_empty() {
            return Err(ProtocolError::InvalidRequest("kind is empty".into()));
        }

        let kind: JobKind = self.kind.parse()?;

        if let Some(base) = &self.base {
            if base.entity_id != self.entity_id || base.entity_type != kind.entity_type {
                return Err(ProtocolError::InvalidRequest(format!(
                    "base snapshot is for {} {:?}, request targets {} {:?}",
                    base.entity_type, base.entity_id, kind.entity_type, self.entity_id
                )));
            }
        }

        Ok(kind)
    }
}
