//! CBOR encoding for persisted records.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value as CBOR.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if the value cannot be serialized.
pub fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR value.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] if the bytes are not a valid encoding
/// of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Job, JobId, JobKind, JobStatus};
    use chrono::Utc;

    #[test]
    fn job_survives_cbor() {
        let kind: JobKind = "update_bookmark".parse().unwrap();
        let mut job = Job::new(
            JobId(7),
            "doc-1".into(),
            kind,
            serde_json::json!({"title": "Chapter 3", "page": 41, "tags": ["a", "b"]}),
            None,
            Utc::now(),
        );
        job.status = JobStatus::Failed;
        job.attempts = 5;
        job.last_error = Some("timeout".into());

        let bytes = to_cbor(&job).unwrap();
        let decoded: Job = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let result: ProtocolResult<Job> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
