use async_trait::async_trait;
use thiserror::Error;

use procura_core::domain::approval::ApprovalLevel;
use procura_core::domain::purchase_request::{RequestId, RequestStatus, RequestWithApprovals};
use procura_core::domain::user::{User, UserId};

pub mod purchase_request;
pub mod user;

pub use purchase_request::SqlPurchaseRequestRepository;
pub use user::SqlUserRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError>;
    async fn save(&self, user: User) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait PurchaseRequestRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &RequestId,
    ) -> Result<Option<RequestWithApprovals>, RepositoryError>;

    async fn list_for_creator(
        &self,
        creator: &UserId,
    ) -> Result<Vec<RequestWithApprovals>, RepositoryError>;

    /// Requests actionable at `level`: Pending requests whose record at
    /// `level` is Pending and, for level 2, whose level-1 record is already
    /// Approved.
    async fn pending_for_level(
        &self,
        level: ApprovalLevel,
    ) -> Result<Vec<RequestWithApprovals>, RepositoryError>;

    async fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<RequestWithApprovals>, RepositoryError>;
}
