//! # shelfsync protocol
//!
//! Pure data types shared by the mutation queue and the sync engine:
//!
//! - [`Job`] and [`JobKind`], the durable mutation intents
//! - [`EntitySnapshot`] and [`RemoteDelta`], what the remote store hands back
//! - [`SyncConflict`] with [`detect_conflict`] and [`merge_changes`]
//! - CBOR helpers used for journal records
//!
//! This crate performs no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod entity;
mod error;
mod job;

pub use codec::{from_cbor, to_cbor};
pub use conflict::{
    detect_conflict, merge_changes, ConflictPolicy, ConflictResolution, SyncConflict,
};
pub use entity::{DeltaCursor, EntitySnapshot, EntityType, RemoteDelta};
pub use error::{ProtocolError, ProtocolResult};
pub use job::{Job, JobId, JobKind, JobStatus, MutationOp, MutationRequest};
