// Error types shared across the runtime

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur inside the orchestration core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Lookup target absent (instance, resource, service, transition)
    #[error("not found: {0}")]
    NotFound(String),

    /// Current state does not match the transition's from-state
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// A transition guard evaluated to false
    #[error("guard denied: {0}")]
    GuardDenied(String),

    /// Malformed request body, missing field, unknown sub-action
    #[error("validation failure: {0}")]
    Validation(String),

    /// Duplicate create or conflicting registration
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or invalid credentials or signature
    #[error("auth failure: {0}")]
    Auth(String),

    /// A required service or engine is not registered
    #[error("missing dependency: {0}")]
    DependencyMissing(String),

    /// Store write failed
    #[error("persist failed: {0}")]
    Persist(String),

    /// Operation was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Catch-all for unexpected conditions
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn illegal_transition(msg: impl Into<String>) -> Self {
        CoreError::IllegalTransition(msg.into())
    }

    pub fn guard_denied(msg: impl Into<String>) -> Self {
        CoreError::GuardDenied(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        CoreError::Auth(msg.into())
    }

    pub fn dependency(msg: impl Into<String>) -> Self {
        CoreError::DependencyMissing(msg.into())
    }

    pub fn persist(msg: impl Into<String>) -> Self {
        CoreError::Persist(msg.into())
    }

    /// Transport mapping used by HTTP triggers and the resource handler.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::NotFound(_) => 404,
            CoreError::IllegalTransition(_) | CoreError::GuardDenied(_) | CoreError::Conflict(_) => 409,
            CoreError::Validation(_) => 400,
            CoreError::Auth(_) => 401,
            CoreError::DependencyMissing(_)
            | CoreError::Persist(_)
            | CoreError::Cancelled
            | CoreError::Internal(_) => 500,
        }
    }

    /// Stable category name, safe to return to clients.
    /// Internal detail stays in logs; responses carry only this label.
    pub fn category(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::IllegalTransition(_) => "illegal_transition",
            CoreError::GuardDenied(_) => "guard_denied",
            CoreError::Validation(_) => "validation_failure",
            CoreError::Conflict(_) => "conflict",
            CoreError::Auth(_) => "auth_failure",
            CoreError::DependencyMissing(_) => "dependency_missing",
            CoreError::Persist(_) => "persist_failure",
            CoreError::Cancelled => "cancelled",
            CoreError::Internal(_) => "internal",
        }
    }
}
