//! Wire format of queue payloads
//!
//! Jobs travel as UTF-8 JSON. Unknown fields are ignored so newer publishers
//! can add fields without breaking older workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::JobMessage;

pub const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Malformed job message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Failed to encode job message: {0}")]
    Encode(serde_json::Error),
}

pub fn encode(message: &JobMessage) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(message).map_err(WireError::Encode)
}

pub fn decode(payload: &[u8]) -> Result<JobMessage, WireError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Entry stored in (or published to) the dead-letter queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The decoded job, when the payload could be decoded at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<JobMessage>,
    /// Raw payload text for messages that failed to decode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
    pub failure_code: String,
    pub failure_message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn exhausted(message: JobMessage, max_deliveries: u32) -> Self {
        Self {
            attempts: message.attempt,
            failure_message: format!("delivery limit of {max_deliveries} reached"),
            message: Some(message),
            raw_payload: None,
            failure_code: "max_deliveries".to_string(),
            failed_at: Utc::now(),
        }
    }

    pub fn rejected(message: JobMessage) -> Self {
        Self {
            attempts: message.attempt,
            message: Some(message),
            raw_payload: None,
            failure_code: "rejected".to_string(),
            failure_message: "rejected by consumer".to_string(),
            failed_at: Utc::now(),
        }
    }

    pub fn malformed(payload: &[u8], error: &WireError) -> Self {
        Self {
            message: None,
            raw_payload: Some(String::from_utf8_lossy(payload).into_owned()),
            failure_code: "malformed".to_string(),
            failure_message: error.to_string(),
            attempts: 0,
            failed_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(WireError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "job_id": "01920000-0000-7000-8000-000000000001",
        "target": {
            "name": "Ubuntu 24.04 LTS",
            "url": "https://releases.example/ubuntu.iso",
            "protocol": "http",
            "destination_path": "/srv/isos/ubuntu.iso",
            "enabled": true
        },
        "enqueued_at": "2026-01-05T02:00:00Z",
        "attempt": 2,
        "priority": "high"
    }"#;

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let msg = decode(PAYLOAD.as_bytes()).unwrap();
        assert_eq!(msg.target.name, "Ubuntu 24.04 LTS");
        assert_eq!(msg.attempt, 2);
        assert_eq!(msg.target.checksum, None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(WireError::Decode(_))));
        assert!(decode(br#"{"job_id": "x"}"#).is_err());
    }

    #[test]
    fn test_malformed_dead_letter_keeps_payload() {
        let err = decode(b"{oops").unwrap_err();
        let dead = DeadLetter::malformed(b"{oops", &err);
        assert_eq!(dead.raw_payload.as_deref(), Some("{oops"));
        assert_eq!(dead.failure_code, "malformed");
        assert!(dead.message.is_none());
    }
}
