//! The approval transition table.
//!
//! Every legality check for the two-level chain lives in this module and
//! nowhere else: the engine consults it before mutating state, and read-side
//! callers consult it through [`can_act`] so that actionability checks and
//! the actual transitions can never drift apart.

use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalLevel, ApprovalStatus};
use crate::domain::purchase_request::{RequestStatus, RequestWithApprovals};
use crate::domain::user::User;
use crate::errors::ApprovalError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

/// Snapshot of the chain a transition is evaluated against. The engine
/// builds this from rows re-read under the request lock, never from cached
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub request: RequestStatus,
    pub levels: [ApprovalStatus; 2],
}

impl ChainState {
    pub fn of(aggregate: &RequestWithApprovals) -> Self {
        Self { request: aggregate.request.status, levels: aggregate.level_statuses() }
    }

    fn level(&self, level: ApprovalLevel) -> ApprovalStatus {
        self.levels[level.index()]
    }
}

/// What a legal transition does: the acted-on record's new status, the
/// recomputed request status, and whether purchase-order generation fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub level: ApprovalLevel,
    pub record_status: ApprovalStatus,
    pub request_status: RequestStatus,
    pub generates_purchase_order: bool,
}

/// Approved iff every record is Approved; Rejected iff any record is
/// Rejected; otherwise Pending. The stored request status must equal this
/// derivation after every transition.
pub fn derive_request_status(levels: [ApprovalStatus; 2]) -> RequestStatus {
    if levels.iter().any(|status| *status == ApprovalStatus::Rejected) {
        RequestStatus::Rejected
    } else if levels.iter().all(|status| *status == ApprovalStatus::Approved) {
        RequestStatus::Approved
    } else {
        RequestStatus::Pending
    }
}

/// Evaluate one action at one level against the chain snapshot.
///
/// Ordering between the levels is enforced here, not by arrival time: a
/// level-2 approval ahead of level 1 fails with `PriorLevelIncomplete` and
/// may simply be retried once level 1 completes. Rejection carries no
/// ordering constraint and finalizes the request from either level.
pub fn evaluate(
    chain: &ChainState,
    level: ApprovalLevel,
    action: ApprovalAction,
) -> Result<TransitionOutcome, ApprovalError> {
    if chain.request.is_finalized() {
        return Err(ApprovalError::AlreadyFinalized { status: chain.request });
    }

    let record = chain.level(level);
    if record != ApprovalStatus::Pending {
        return Err(ApprovalError::AlreadyProcessed { level, status: record });
    }

    if action == ApprovalAction::Approve
        && level == ApprovalLevel::Second
        && chain.level(ApprovalLevel::First) != ApprovalStatus::Approved
    {
        return Err(ApprovalError::PriorLevelIncomplete);
    }

    let record_status = match action {
        ApprovalAction::Approve => ApprovalStatus::Approved,
        ApprovalAction::Reject => ApprovalStatus::Rejected,
    };

    let mut levels = chain.levels;
    levels[level.index()] = record_status;
    let request_status = derive_request_status(levels);

    Ok(TransitionOutcome {
        level,
        record_status,
        request_status,
        generates_purchase_order: request_status == RequestStatus::Approved,
    })
}

pub fn can_act(chain: &ChainState, level: ApprovalLevel, action: ApprovalAction) -> bool {
    evaluate(chain, level, action).is_ok()
}

/// The read-only actionability predicate: true iff `user` is a reviewer
/// whose level may currently approve this request. Reproduces exactly the
/// gating inside the approve transition, so a permitted check can only fail
/// later if another actor committed first.
pub fn can_approve(aggregate: &RequestWithApprovals, user: &User) -> bool {
    let Some(level) = user.approval_level() else {
        return false;
    };
    can_act(&ChainState::of(aggregate), level, ApprovalAction::Approve)
}
