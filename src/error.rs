//! Domain error kinds
//!
//! Everything below `api` returns [`HubError`]; the HTTP layer maps each kind
//! to a status code. Store failures and invariant violations are internal and
//! never reach the client verbatim.

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Board {0} is suspended")]
    Suspended(String),

    #[error("{0}")]
    Validation(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl HubError {
    /// Stable kind name for logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::NotFound(_) => "not_found",
            HubError::Conflict(_) => "conflict",
            HubError::Forbidden(_) => "forbidden",
            HubError::Unauthorized => "unauthorized",
            HubError::Suspended(_) => "suspended",
            HubError::Validation(_) => "validation",
            HubError::StoreUnavailable(_) => "store_unavailable",
            HubError::Invariant(_) => "invariant",
        }
    }

    /// Internal errors are logged and reported as a generic 500
    pub fn is_internal(&self) -> bool {
        matches!(self, HubError::StoreUnavailable(_) | HubError::Invariant(_))
    }
}

pub type HubResult<T> = Result<T, HubError>;
