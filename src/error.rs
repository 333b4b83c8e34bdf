//! Error taxonomy for the bridge (§7).
//!
//! Each variant corresponds to one of the five error-kind families the
//! specification distinguishes: transport, correlation, authorization,
//! payment, and lifecycle. The payments and transport layers match on these
//! variants to decide whether to log-and-drop, warn, or fail closed; callers
//! that just need `?` propagation can treat `BridgeError` as an ordinary
//! `std::error::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport: connect failed: {0}")]
    ConnectFailed(String),

    #[error("transport: publish failed: {0}")]
    PublishFailed(String),

    #[error("transport: subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("transport: decrypt failed")]
    DecryptFailed,

    #[error("transport: malformed event: {0}")]
    MalformedEvent(String),

    #[error("transport: message exceeds size limit ({size} > {limit} bytes)")]
    OversizeMessage { size: usize, limit: usize },

    #[error("correlation: unknown request id for event {0}")]
    UnknownCorrelation(String),

    #[error("correlation: progress token {0} has no target")]
    UnknownProgressToken(String),

    #[error("authorization: client {0} is not permitted")]
    Unauthorized(String),

    #[error("payment: createPaymentRequired failed: {0}")]
    PaymentCreateFailed(String),

    #[error("payment: verifyPayment failed: {0}")]
    PaymentVerifyFailed(String),

    #[error("payment: verification timed out after {0:?}")]
    PaymentTimeout(std::time::Duration),

    #[error("payment: declined by {who}: {reason}")]
    PaymentDeclined { who: &'static str, reason: String },

    #[error("lifecycle: operation attempted while {0}")]
    InvalidLifecycle(&'static str),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("relay socket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("signer error: {0}")]
    Signer(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Error-kind family, used by callers that need to decide log level / whether
/// to surface the error to a waiting caller without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Correlation,
    Authorization,
    Payment,
    Lifecycle,
    Other,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        use BridgeError::*;
        match self {
            ConnectFailed(_) | PublishFailed(_) | SubscribeFailed(_) | DecryptFailed
            | MalformedEvent(_) | OversizeMessage { .. } | Ws(_) => ErrorKind::Transport,
            UnknownCorrelation(_) | UnknownProgressToken(_) => ErrorKind::Correlation,
            Unauthorized(_) => ErrorKind::Authorization,
            PaymentCreateFailed(_) | PaymentVerifyFailed(_) | PaymentTimeout(_)
            | PaymentDeclined { .. } => ErrorKind::Payment,
            InvalidLifecycle(_) => ErrorKind::Lifecycle,
            Serde(_) | Signer(_) => ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification_matches_taxonomy() {
        assert_eq!(BridgeError::DecryptFailed.kind(), ErrorKind::Transport);
        assert_eq!(
            BridgeError::UnknownCorrelation("x".into()).kind(),
            ErrorKind::Correlation
        );
        assert_eq!(
            BridgeError::Unauthorized("pk".into()).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            BridgeError::PaymentTimeout(std::time::Duration::from_secs(60)).kind(),
            ErrorKind::Payment
        );
        assert_eq!(
            BridgeError::InvalidLifecycle("closed").kind(),
            ErrorKind::Lifecycle
        );
    }
}
