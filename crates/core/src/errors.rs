use thiserror::Error;

use crate::domain::approval::{ApprovalLevel, ApprovalStatus};
use crate::domain::purchase_request::RequestStatus;

/// Caller-distinguishable outcomes of an attempted approval transition.
///
/// Every variant is a terminal answer about the request's current state;
/// none of them is retryable as-is. Transient storage failures are surfaced
/// separately by the engine.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("request has already been finalized as {status}")]
    AlreadyFinalized { status: RequestStatus },
    #[error("user does not hold an approver role")]
    NotAnApprover,
    /// Signals a data-integrity violation: records are created atomically
    /// with the request, so a missing slot means the store is corrupted.
    #[error("no approval record exists at level {level}")]
    NoApprovalSlot { level: ApprovalLevel },
    #[error("approval at level {level} has already been processed as {status}")]
    AlreadyProcessed { level: ApprovalLevel, status: ApprovalStatus },
    #[error("level 1 approval must be completed before level 2")]
    PriorLevelIncomplete,
    #[error("validation failed for `{field}`: {message}")]
    Validation { field: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::ApprovalError;
    use crate::domain::approval::{ApprovalLevel, ApprovalStatus};
    use crate::domain::purchase_request::RequestStatus;

    #[test]
    fn messages_carry_the_state_that_blocked_the_transition() {
        let finalized = ApprovalError::AlreadyFinalized { status: RequestStatus::Rejected };
        assert_eq!(finalized.to_string(), "request has already been finalized as rejected");

        let processed = ApprovalError::AlreadyProcessed {
            level: ApprovalLevel::First,
            status: ApprovalStatus::Approved,
        };
        assert_eq!(
            processed.to_string(),
            "approval at level 1 has already been processed as approved"
        );
    }
}
