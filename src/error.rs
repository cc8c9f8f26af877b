use thiserror::Error;

use crate::store::StoreError;

/// Request-level error taxonomy. Business errors map to structured codes
/// with no internal detail; infrastructure errors surface as a generic
/// "temporarily unavailable" and keep their detail in logs only.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model not available for tier: {model_id}")]
    AccessDenied { model_id: String },
    #[error("insufficient credits: required {required_micros} micros, available {available_micros}")]
    InsufficientCredits {
        required_micros: u64,
        available_micros: u64,
    },
    #[error("all providers exhausted for model {model_id} after {attempts} attempts")]
    AllProvidersExhausted { model_id: String, attempts: u32 },
    #[error("provider {provider} rejected the request: {message}")]
    ProviderFatal { provider: String, message: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("ledger write failed: {0}")]
    Ledger(#[from] StoreError),
    #[error("unknown user account: {user_id}")]
    UnknownAccount { user_id: String },
}

/// Stable user-facing error codes. These are the only strings the outer
/// request layer is allowed to surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    AccessDenied,
    BillingRequired,
    ServiceUnavailable,
    BadRequest,
    TemporarilyUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::BillingRequired => "billing_required",
            ErrorCode::ServiceUnavailable => "service_unavailable",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::AccessDenied { .. } | EngineError::UnknownAccount { .. } => {
                ErrorCode::AccessDenied
            }
            EngineError::InsufficientCredits { .. } => ErrorCode::BillingRequired,
            EngineError::AllProvidersExhausted { .. } => ErrorCode::ServiceUnavailable,
            EngineError::ProviderFatal { .. } | EngineError::InvalidRequest { .. } => {
                ErrorCode::BadRequest
            }
            EngineError::Ledger(_) => ErrorCode::TemporarilyUnavailable,
        }
    }

    /// Message safe to return to the caller. Never names providers or
    /// internal components.
    pub fn public_message(&self) -> &'static str {
        match self.code() {
            ErrorCode::AccessDenied => "the requested model is not available on this plan",
            ErrorCode::BillingRequired => "not enough credits to complete this request",
            ErrorCode::ServiceUnavailable => "no upstream capacity is available right now",
            ErrorCode::BadRequest => "the request could not be processed",
            ErrorCode::TemporarilyUnavailable => "temporarily unavailable, please retry shortly",
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::AllProvidersExhausted { .. } | EngineError::Ledger(_)
        )
    }
}
