pub mod config;
pub mod documents;
pub mod domain;
pub mod errors;
pub mod workflow;

pub use chrono;

pub use documents::{
    proforma_error_metadata, DocumentError, DocumentPipeline, GeneratedDocument,
    NoopDocumentPipeline, ReceiptValidation,
};
pub use domain::approval::{Approval, ApprovalId, ApprovalLevel, ApprovalStatus};
pub use domain::purchase_request::{
    NewPurchaseRequest, PurchaseRequest, RequestId, RequestStatus, RequestWithApprovals,
    StoredFile,
};
pub use domain::user::{Role, User, UserId};
pub use errors::ApprovalError;
pub use workflow::{
    can_act, can_approve, derive_request_status, evaluate, ApprovalAction, ChainState,
    TransitionOutcome,
};
