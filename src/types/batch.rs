//! Batch lifecycle types
//!
//! A batch moves along `ACCEPTED -> IN_QUEUE -> IN_PROGRESS -> {SUCCESS,
//! FAILED}`; `REJECTED` is issued only by ingress and is terminal. State
//! transitions travel the status bus as compact binary `StatusDelta` frames,
//! while `BatchRecord` is the JSON shape clients see.

use chrono::{DateTime, Utc};
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;
use crate::types::{Method, Point};

// ==========================================================================
// Tests First (TDD)
// ==========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_names_round_trip() {
        for status in [
            BatchStatus::Undefined,
            BatchStatus::Accepted,
            BatchStatus::InQueue,
            BatchStatus::InProgress,
            BatchStatus::Success,
            BatchStatus::Failed,
            BatchStatus::Rejected,
        ] {
            assert_eq!(BatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BatchStatus::parse("RUNNING"), None);
    }

    #[test]
    fn batch_status_serializes_as_enum_name() {
        let json = serde_json::to_string(&BatchStatus::InQueue).unwrap();
        assert_eq!(json, "\"IN_QUEUE\"");
    }

    #[test]
    fn status_lattice_is_monotonic() {
        assert!(BatchStatus::Accepted.rank() < BatchStatus::InQueue.rank());
        assert!(BatchStatus::InQueue.rank() < BatchStatus::InProgress.rank());
        assert!(BatchStatus::InProgress.rank() < BatchStatus::Success.rank());
        assert!(BatchStatus::InProgress.rank() < BatchStatus::Failed.rank());
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(BatchStatus::Success.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Rejected.is_terminal());
        assert!(!BatchStatus::InProgress.is_terminal());
    }

    #[test]
    fn submission_requires_exactly_one_sequence() {
        let neither = BatchSubmission {
            method: Method::FwdFuzzy,
            addresses: vec![],
            points: vec![],
        };
        assert!(matches!(
            neither.validate(),
            Err(ServiceError::BatchArguments)
        ));

        let both = BatchSubmission {
            method: Method::FwdFuzzy,
            addresses: vec!["a".into()],
            points: vec![Point::new(1.0, 1.0)],
        };
        assert!(matches!(both.validate(), Err(ServiceError::BatchArguments)));
    }

    #[test]
    fn submission_sequence_must_match_method() {
        let fwd_with_points = BatchSubmission {
            method: Method::FwdFuzzy,
            addresses: vec![],
            points: vec![Point::new(1.0, 1.0)],
        };
        assert!(matches!(
            fwd_with_points.validate(),
            Err(ServiceError::InvalidForwardRequest)
        ));

        let rev_with_addresses = BatchSubmission {
            method: Method::RevNearest,
            addresses: vec!["451A WINTHROP ST".into()],
            points: vec![],
        };
        assert!(matches!(
            rev_with_addresses.validate(),
            Err(ServiceError::InvalidReverseRequest)
        ));

        let ok = BatchSubmission {
            method: Method::FwdFuzzy,
            addresses: vec!["451A WINTHROP ST".into()],
            points: vec![],
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn status_delta_survives_binary_framing() {
        let delta = StatusDelta {
            id: "6f9619ff-8b86-4d01-b42d-00cf4fc964ff".into(),
            status: BatchStatus::Success,
            download_path: "/tmp/6f9619ff-results.json".into(),
        };

        let frame = minicbor::to_vec(&delta).unwrap();
        let decoded: StatusDelta = minicbor::decode(&frame).unwrap();

        assert_eq!(decoded.id, delta.id);
        assert_eq!(decoded.status, BatchStatus::Success);
        assert_eq!(decoded.download_path, delta.download_path);
    }
}

// ==========================================================================
// Implementation
// ==========================================================================

/// Batch lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cbor(index_only)]
pub enum BatchStatus {
    #[n(0)]
    Undefined,
    #[n(1)]
    Accepted,
    #[n(2)]
    InQueue,
    #[n(3)]
    InProgress,
    #[n(4)]
    Success,
    #[n(5)]
    Failed,
    #[n(6)]
    Rejected,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Undefined => "UNDEFINED",
            BatchStatus::Accepted => "ACCEPTED",
            BatchStatus::InQueue => "IN_QUEUE",
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::Success => "SUCCESS",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Rejected => "REJECTED",
        }
    }

    /// Parse the enum name as persisted in the status cache. Returns `None`
    /// for strings that do not name a known state, so half-written records
    /// never surface as real statuses.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNDEFINED" => Some(BatchStatus::Undefined),
            "ACCEPTED" => Some(BatchStatus::Accepted),
            "IN_QUEUE" => Some(BatchStatus::InQueue),
            "IN_PROGRESS" => Some(BatchStatus::InProgress),
            "SUCCESS" => Some(BatchStatus::Success),
            "FAILED" => Some(BatchStatus::Failed),
            "REJECTED" => Some(BatchStatus::Rejected),
            _ => None,
        }
    }

    /// Position along the lifecycle lattice; publishers only ever move
    /// forward.
    pub fn rank(&self) -> u8 {
        match self {
            BatchStatus::Undefined => 0,
            BatchStatus::Accepted => 1,
            BatchStatus::InQueue => 2,
            BatchStatus::InProgress => 3,
            BatchStatus::Success | BatchStatus::Failed | BatchStatus::Rejected => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Success | BatchStatus::Failed | BatchStatus::Rejected
        )
    }
}

/// Client-submitted batch body. Persisted verbatim (canonical JSON) as
/// `{id}.json` before the job-ready event is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub method: Method,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub points: Vec<Point>,
}

impl BatchSubmission {
    /// Exactly one of the two sequences must be non-empty, and it must match
    /// the method.
    pub fn validate(&self) -> Result<(), ServiceError> {
        let has_addresses = !self.addresses.is_empty();
        let has_points = !self.points.is_empty();

        if has_addresses == has_points {
            return Err(ServiceError::BatchArguments);
        }
        match self.method {
            Method::FwdFuzzy if !has_addresses => Err(ServiceError::InvalidForwardRequest),
            Method::RevNearest if !has_points => Err(ServiceError::InvalidReverseRequest),
            _ => Ok(()),
        }
    }

    /// Number of geocode inputs in the batch.
    pub fn len(&self) -> usize {
        self.addresses.len() + self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The batch lifecycle record clients poll for. `download_path` is non-empty
/// iff `status == SUCCESS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub download_path: String,
    pub update_time: DateTime<Utc>,
}

impl BatchRecord {
    pub fn new(id: impl Into<String>, status: BatchStatus) -> Self {
        Self {
            id: id.into(),
            status,
            download_path: String::new(),
            update_time: Utc::now(),
        }
    }
}

/// Request payload for a batch status lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatusQuery {
    pub id: String,
}

/// A state transition as framed on the status bus. The mirror listener stamps
/// `update_time` when it writes the delta into the status cache.
#[derive(Debug, Clone, Encode, Decode)]
pub struct StatusDelta {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub status: BatchStatus,
    #[n(2)]
    pub download_path: String,
}
