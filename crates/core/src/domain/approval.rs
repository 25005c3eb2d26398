use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::purchase_request::RequestId;
use crate::domain::user::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

/// Position in the fixed two-stage approval chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalLevel {
    First,
    Second,
}

impl ApprovalLevel {
    pub const ALL: [ApprovalLevel; 2] = [ApprovalLevel::First, ApprovalLevel::Second];

    pub fn as_i64(self) -> i64 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }

    pub fn parse(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(Self::First),
            2 => Some(Self::Second),
            _ => None,
        }
    }

    /// Zero-based index into per-level arrays ordered by level.
    pub fn index(self) -> usize {
        match self {
            Self::First => 0,
            Self::Second => 1,
        }
    }
}

impl std::fmt::Display for ApprovalLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reviewer's verdict slot on a purchase request. Created Pending with no
/// approver; leaves Pending exactly once and is immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub request_id: RequestId,
    pub level: ApprovalLevel,
    pub status: ApprovalStatus,
    pub approver: Option<UserId>,
    pub comments: String,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Approval {
    pub fn is_processed(&self) -> bool {
        self.status != ApprovalStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::{ApprovalLevel, ApprovalStatus};

    #[test]
    fn levels_round_trip_through_storage_form() {
        for level in ApprovalLevel::ALL {
            assert_eq!(ApprovalLevel::parse(level.as_i64()), Some(level));
        }
        assert_eq!(ApprovalLevel::parse(0), None);
        assert_eq!(ApprovalLevel::parse(3), None);
    }

    #[test]
    fn statuses_round_trip_through_storage_form() {
        for status in [ApprovalStatus::Pending, ApprovalStatus::Approved, ApprovalStatus::Rejected]
        {
            assert_eq!(ApprovalStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ApprovalStatus::parse("escalated"), None);
    }
}
