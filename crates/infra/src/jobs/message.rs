//! Job message wire format.
//!
//! On the queue a job is a JSON object whose fields are all optional:
//!
//! ```json
//! {"v":1,"job_name":"inscribe-parlay","job_id":"...","savedParlayId":"p-1","attempt":0,"enqueued_at":"2024-01-01T00:00:00.000Z"}
//! ```
//!
//! Decoding applies the defaulting rules once, at the edge: a missing
//! `attempt` is 0, a missing or blank `savedParlayId` is a
//! [`MessageError::MissingRecordId`], anything that is not a JSON object of
//! the right shape is [`MessageError::Malformed`]. Unknown fields are ignored.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use inscriber_core::ParlayId;

/// Schema version written by this worker. Messages without `v` are legacy v1.
pub const CURRENT_MESSAGE_VERSION: u32 = 1;

/// Default `job_name` for messages created here.
pub const INSCRIBE_JOB_NAME: &str = "inscribe-parlay";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("malformed job payload: {0}")]
    Malformed(String),

    #[error("job payload has no savedParlayId")]
    MissingRecordId,

    #[error("unsupported job schema version {0}")]
    UnsupportedVersion(u32),

    #[error("failed to encode job payload: {0}")]
    Encode(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    #[serde(rename = "savedParlayId", default, skip_serializing_if = "Option::is_none")]
    saved_parlay_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enqueued_at: Option<String>,
}

/// A validated inscription job.
///
/// Never mutated once on the queue: a retry is a fresh copy from
/// [`JobMessage::next_attempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMessage {
    /// Schema version as received (`None` for legacy payloads).
    pub version: Option<u32>,
    pub job_id: Option<String>,
    pub job_name: Option<String>,
    pub record_id: ParlayId,
    /// Number of failed submissions so far.
    pub attempt: u32,
    /// Informational; kept verbatim.
    pub enqueued_at: Option<String>,
}

impl JobMessage {
    /// A first-attempt job for `record_id`.
    pub fn new(record_id: ParlayId) -> Self {
        Self {
            version: Some(CURRENT_MESSAGE_VERSION),
            job_id: Some(Uuid::now_v7().to_string()),
            job_name: Some(INSCRIBE_JOB_NAME.to_string()),
            record_id,
            attempt: 0,
            enqueued_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let wire: WireMessage =
            serde_json::from_slice(bytes).map_err(|e| MessageError::Malformed(e.to_string()))?;

        if let Some(v) = wire.v {
            if v > CURRENT_MESSAGE_VERSION {
                return Err(MessageError::UnsupportedVersion(v));
            }
        }

        let record_id = wire
            .saved_parlay_id
            .as_deref()
            .map(ParlayId::parse)
            .transpose()
            .ok()
            .flatten()
            .ok_or(MessageError::MissingRecordId)?;

        Ok(Self {
            version: wire.v,
            job_id: wire.job_id,
            job_name: wire.job_name,
            record_id,
            attempt: wire.attempt.unwrap_or(0),
            enqueued_at: wire.enqueued_at,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let wire = WireMessage {
            v: self.version,
            job_name: self.job_name.clone(),
            job_id: self.job_id.clone(),
            saved_parlay_id: Some(self.record_id.as_str().to_string()),
            attempt: Some(self.attempt),
            enqueued_at: self.enqueued_at.clone(),
        };

        serde_json::to_vec(&wire).map_err(|e| MessageError::Encode(e.to_string()))
    }

    /// Copy for the next try: `attempt + 1`, everything else unchanged.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_full_payload() {
        let raw = br#"{"job_name":"inscribe","job_id":"j-1","savedParlayId":"p-1","attempt":2,"enqueued_at":"2024-01-01T00:00:00.000Z"}"#;
        let job = JobMessage::decode(raw).unwrap();

        assert_eq!(job.record_id.as_str(), "p-1");
        assert_eq!(job.attempt, 2);
        assert_eq!(job.job_id.as_deref(), Some("j-1"));
        assert_eq!(job.job_name.as_deref(), Some("inscribe"));
        assert_eq!(job.version, None);
    }

    #[test]
    fn missing_attempt_defaults_to_zero() {
        let job = JobMessage::decode(br#"{"savedParlayId":"p-1"}"#).unwrap();
        assert_eq!(job.attempt, 0);
        assert!(job.job_id.is_none());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let job = JobMessage::decode(br#"{"savedParlayId":"p-1","priority":"high"}"#).unwrap();
        assert_eq!(job.record_id.as_str(), "p-1");
    }

    #[test]
    fn missing_or_blank_record_id_is_rejected() {
        let cases: [&[u8]; 4] = [
            br#"{"job_id":"j-1"}"#,
            br#"{"savedParlayId":""}"#,
            br#"{"savedParlayId":"   "}"#,
            br#"{"savedParlayId":null}"#,
        ];
        for raw in cases {
            assert_eq!(JobMessage::decode(raw), Err(MessageError::MissingRecordId));
        }
    }

    #[test]
    fn garbage_is_malformed() {
        let cases: [&[u8]; 5] = [
            b"not json",
            b"[1,2,3]",
            br#"{"savedParlayId":"p-1","attempt":-1}"#,
            br#"{"savedParlayId":42}"#,
            &[0xff, 0xfe, 0x00],
        ];
        for raw in cases {
            assert!(matches!(
                JobMessage::decode(raw),
                Err(MessageError::Malformed(_))
            ));
        }
    }

    #[test]
    fn newer_schema_versions_are_rejected() {
        assert_eq!(
            JobMessage::decode(br#"{"v":2,"savedParlayId":"p-1"}"#),
            Err(MessageError::UnsupportedVersion(2))
        );
        assert!(JobMessage::decode(br#"{"v":1,"savedParlayId":"p-1"}"#).is_ok());
    }

    #[test]
    fn next_attempt_only_bumps_attempt() {
        let job = JobMessage::new(ParlayId::parse("p-1").unwrap());
        let retry = job.next_attempt();

        assert_eq!(retry.attempt, job.attempt + 1);
        assert_eq!(
            JobMessage {
                attempt: job.attempt,
                ..retry.clone()
            },
            job
        );
    }

    #[test]
    fn re_encoding_keeps_the_original_fields() {
        let raw = br#"{"job_name":"inscribe","job_id":"j-1","savedParlayId":"p-1","attempt":0,"enqueued_at":"2024-01-01T00:00:00.000Z"}"#;
        let retry = JobMessage::decode(raw).unwrap().next_attempt();

        let value: serde_json::Value = serde_json::from_slice(&retry.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "job_name": "inscribe",
                "job_id": "j-1",
                "savedParlayId": "p-1",
                "attempt": 1,
                "enqueued_at": "2024-01-01T00:00:00.000Z",
            })
        );
    }
}
