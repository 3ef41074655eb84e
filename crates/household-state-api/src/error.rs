use household_state_core::{FieldIssue, StateError, Usage};

/// Closed error taxonomy surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("request failed validation ({} issue(s))", issues.len())]
    InvalidInput { issues: Vec<FieldIssue> },
    #[error("household requires an authenticated owner")]
    Unauthorized,
    #[error("household belongs to a different subject")]
    Forbidden,
    #[error("free snapshot limit reached")]
    MeteringBlocked { upgrade_url: Option<String>, login_url: Option<String>, usage: Usage },
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Inner error text is for logs only.
    #[error("store unavailable")]
    StoreUnavailable(anyhow::Error),
}

impl EngineError {
    #[must_use]
    pub fn invalid(path: &str, message: impl Into<String>) -> Self {
        Self::InvalidInput { issues: vec![FieldIssue::new(path, message)] }
    }

    /// Stable machine-readable kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::MeteringBlocked { .. } => "metering_blocked",
            Self::NotFound(_) => "not_found",
            Self::StoreUnavailable(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::StoreUnavailable(err)
    }
}

impl From<StateError> for EngineError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Validation(message) => Self::invalid("household_id", message),
            StateError::Serialization(message) => Self::StoreUnavailable(anyhow::anyhow!(message)),
        }
    }
}
