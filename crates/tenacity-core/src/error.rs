// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tenacity-core.
//!
//! One unified error type covers the invocation surface. The two signals that
//! matter for correctness are [`FlowError::UnexpectedState`] (a reinvocation
//! precondition was not met, usually a lost leader-election race) and
//! [`FlowError::ConcurrentModification`] (an epoch-gated write affected zero
//! rows). Neither is ever retried transparently inside the engine; callers
//! must re-fetch state and derive a fresh epoch.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::identity::FlowId;
use crate::outcome::FlowFailure;

/// Result type using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors surfaced by invokers and the flow store.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum FlowError {
    /// No durable record exists for the flow id.
    FlowNotFound {
        /// The flow that was not found.
        flow_id: FlowId,
    },

    /// A reinvocation precondition (expected status set or expected epoch)
    /// was not met, or another process won the leader election.
    UnexpectedState {
        /// The flow whose state was unexpected.
        flow_id: FlowId,
        /// Description of the acceptable states.
        expected: String,
        /// The observed state.
        actual: String,
    },

    /// An epoch-gated write affected zero rows: the record was mutated out
    /// from under the current attempt. Fatal to the attempt.
    ConcurrentModification {
        /// The flow whose write was rejected.
        flow_id: FlowId,
        /// The epoch the write was gated on.
        expected_epoch: i32,
    },

    /// The flow postponed itself; carries the resume timestamp.
    Postponed {
        /// The flow that postponed.
        flow_id: FlowId,
        /// When the flow asked to be resumed.
        resume_at: DateTime<Utc>,
    },

    /// The flow suspended itself pending external interrupts.
    Suspended {
        /// The flow that suspended.
        flow_id: FlowId,
    },

    /// The flow failed; wraps the persisted failure with the origin identity.
    FlowFailed {
        /// The flow that failed.
        flow_id: FlowId,
        /// The persisted failure.
        failure: FlowFailure,
    },

    /// Parameter, state or result (de)serialization failed.
    Serialization {
        /// Error details.
        details: String,
    },

    /// Storage operation failed.
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The engine is shutting down and refuses new work.
    ShuttingDown,
}

impl FlowError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::FlowNotFound { .. } => "FLOW_NOT_FOUND",
            Self::UnexpectedState { .. } => "UNEXPECTED_FLOW_STATE",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::Postponed { .. } => "FLOW_POSTPONED",
            Self::Suspended { .. } => "FLOW_SUSPENDED",
            Self::FlowFailed { .. } => "FLOW_FAILED",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Whether this error signals a lost race that automatic-retry callers
    /// may legitimately suppress.
    pub fn is_lost_race(&self) -> bool {
        matches!(self, Self::UnexpectedState { .. })
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlowNotFound { flow_id } => {
                write!(f, "Flow '{}' not found", flow_id)
            }
            Self::UnexpectedState {
                flow_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Flow '{}' is in unexpected state: expected {}, got {}",
                    flow_id, expected, actual
                )
            }
            Self::ConcurrentModification {
                flow_id,
                expected_epoch,
            } => {
                write!(
                    f,
                    "Concurrent modification of flow '{}' at epoch {}",
                    flow_id, expected_epoch
                )
            }
            Self::Postponed { flow_id, resume_at } => {
                write!(f, "Flow '{}' postponed until {}", flow_id, resume_at)
            }
            Self::Suspended { flow_id } => {
                write!(f, "Flow '{}' suspended awaiting interrupts", flow_id)
            }
            Self::FlowFailed { flow_id, failure } => {
                write!(f, "Flow '{}' failed: {}", flow_id, failure)
            }
            Self::Serialization { details } => {
                write!(f, "Serialization error: {}", details)
            }
            Self::Database { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::ShuttingDown => {
                write!(f, "Engine is shutting down")
            }
        }
    }
}

impl std::error::Error for FlowError {}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for FlowError {
    fn from(err: sqlx::Error) -> Self {
        FlowError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Serialization {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_id() -> FlowId {
        FlowId::new("order", "abc-123")
    }

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                FlowError::FlowNotFound { flow_id: order_id() },
                "FLOW_NOT_FOUND",
            ),
            (
                FlowError::UnexpectedState {
                    flow_id: order_id(),
                    expected: "{postponed}".to_string(),
                    actual: "executing".to_string(),
                },
                "UNEXPECTED_FLOW_STATE",
            ),
            (
                FlowError::ConcurrentModification {
                    flow_id: order_id(),
                    expected_epoch: 2,
                },
                "CONCURRENT_MODIFICATION",
            ),
            (
                FlowError::Postponed {
                    flow_id: order_id(),
                    resume_at: Utc::now(),
                },
                "FLOW_POSTPONED",
            ),
            (
                FlowError::Suspended { flow_id: order_id() },
                "FLOW_SUSPENDED",
            ),
            (
                FlowError::FlowFailed {
                    flow_id: order_id(),
                    failure: FlowFailure::message("boom"),
                },
                "FLOW_FAILED",
            ),
            (
                FlowError::Serialization {
                    details: "eof".to_string(),
                },
                "SERIALIZATION_ERROR",
            ),
            (
                FlowError::Database {
                    operation: "insert".to_string(),
                    details: "locked".to_string(),
                },
                "DATABASE_ERROR",
            ),
            (FlowError::ShuttingDown, "SHUTTING_DOWN"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_display() {
        let err = FlowError::FlowNotFound { flow_id: order_id() };
        assert_eq!(err.to_string(), "Flow 'order/abc-123' not found");

        let err = FlowError::UnexpectedState {
            flow_id: order_id(),
            expected: "{postponed, failed}".to_string(),
            actual: "executing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Flow 'order/abc-123' is in unexpected state: expected {postponed, failed}, got executing"
        );

        let err = FlowError::ConcurrentModification {
            flow_id: order_id(),
            expected_epoch: 3,
        };
        assert_eq!(
            err.to_string(),
            "Concurrent modification of flow 'order/abc-123' at epoch 3"
        );

        let err = FlowError::FlowFailed {
            flow_id: order_id(),
            failure: FlowFailure::new("PAYMENT_DECLINED", "card expired"),
        };
        assert_eq!(
            err.to_string(),
            "Flow 'order/abc-123' failed: PAYMENT_DECLINED: card expired"
        );
    }

    #[test]
    fn test_lost_race_classification() {
        let lost = FlowError::UnexpectedState {
            flow_id: order_id(),
            expected: "{postponed}".to_string(),
            actual: "executing".to_string(),
        };
        assert!(lost.is_lost_race());
        assert!(!FlowError::ShuttingDown.is_lost_race());
    }
}
