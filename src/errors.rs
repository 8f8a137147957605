//! Service error taxonomy
//!
//! Every fallible surface in the service maps into `ServiceError`, which
//! carries a stable wire code (`code()`). The edge translates codes to HTTP
//! statuses; NATS handlers embed them in `ErrorResponse` envelopes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("`method` must be one of (`FWD_FUZZY`, `REV_NEAREST`)")]
    InvalidMethod,

    #[error("forward geocode requests must have a valid `query_addr`")]
    InvalidForwardRequest,

    #[error("reverse geocode requests must have a valid `query_lat` and `query_lng`")]
    InvalidReverseRequest,

    #[error("geocode requests must have an address *or* a point, not both")]
    MixedArguments,

    #[error("`max_results` must be an int between 1 and 1024")]
    MaxResultsOutOfRange,

    #[error("batches must have points *or* addresses")]
    BatchArguments,

    /// Conditions the search engine is known to reject, caught before the
    /// engine is ever called (empty address, out-of-range coordinates).
    #[error("malformed geocode query")]
    MalformedQuery,

    #[error("search engine failure: {0}")]
    Engine(String),

    #[error("status cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("failed to publish on `{topic}`: {reason}")]
    BusPublish { topic: String, reason: String },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("batch not found")]
    NotFound,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl ServiceError {
    /// Stable machine-readable code carried on error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidMethod
            | ServiceError::InvalidForwardRequest
            | ServiceError::InvalidReverseRequest
            | ServiceError::MixedArguments
            | ServiceError::MaxResultsOutOfRange
            | ServiceError::BatchArguments
            | ServiceError::MalformedQuery => "INVALID_ARGUMENT",
            ServiceError::Engine(_) => "INTERNAL",
            ServiceError::CacheUnavailable(_) => "UNAVAILABLE",
            ServiceError::Storage(_) | ServiceError::BusPublish { .. } => "INTERNAL",
            ServiceError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ServiceError::NotFound => "NOT_FOUND",
            ServiceError::Unknown(_) => "UNKNOWN",
        }
    }

    /// True for domain-level validation rejections (client fault).
    pub fn is_validation(&self) -> bool {
        self.code() == "INVALID_ARGUMENT"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_invalid_argument() {
        for err in [
            ServiceError::InvalidMethod,
            ServiceError::InvalidForwardRequest,
            ServiceError::InvalidReverseRequest,
            ServiceError::MixedArguments,
            ServiceError::MaxResultsOutOfRange,
            ServiceError::BatchArguments,
            ServiceError::MalformedQuery,
        ] {
            assert_eq!(err.code(), "INVALID_ARGUMENT");
            assert!(err.is_validation());
        }
    }

    #[test]
    fn infrastructure_errors_have_distinct_codes() {
        assert_eq!(ServiceError::Engine("down".into()).code(), "INTERNAL");
        assert_eq!(
            ServiceError::CacheUnavailable("conn refused".into()).code(),
            "UNAVAILABLE"
        );
        assert_eq!(ServiceError::DeadlineExceeded.code(), "DEADLINE_EXCEEDED");
        assert_eq!(ServiceError::NotFound.code(), "NOT_FOUND");
        assert!(!ServiceError::NotFound.is_validation());
    }
}
