use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::ApprovalLevel;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Role determines what a user may do: staff create requests and submit
/// receipts, the two approver roles act on their matching approval level,
/// finance reads approved requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Staff,
    ApproverL1,
    ApproverL2,
    Finance,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staff => "staff",
            Self::ApproverL1 => "approver_l1",
            Self::ApproverL2 => "approver_l2",
            Self::Finance => "finance",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "staff" => Some(Self::Staff),
            "approver_l1" => Some(Self::ApproverL1),
            "approver_l2" => Some(Self::ApproverL2),
            "finance" => Some(Self::Finance),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub full_name: String,
    pub role: Role,
    pub department: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_approver(&self) -> bool {
        self.approval_level().is_some()
    }

    /// The approval level this user acts at, derived one-to-one from role.
    pub fn approval_level(&self) -> Option<ApprovalLevel> {
        match self.role {
            Role::ApproverL1 => Some(ApprovalLevel::First),
            Role::ApproverL2 => Some(ApprovalLevel::Second),
            Role::Staff | Role::Finance => None,
        }
    }
}
