/// Field level problems found while finalising a listing or a delivery request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Deposit Deadline <= Departure Date <= Arrival Date failed")]
    InvalidDates,
    #[error("{0} is not set")]
    MissingField(&'static str),
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("message body is empty")]
    EmptyMessage,
}

/// Failures reported by a [`crate::store::DurableStore`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conditional write rejected for {key}")]
    Conflict { key: String },
    #[error("corrupt row {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(io) => StoreError::Unavailable(io.to_string()),
            other => StoreError::Corrupt {
                key: String::new(),
                reason: other.to_string(),
            },
        }
    }
}

/// How the presentation layer should treat a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Actor is not allowed to do this. Block.
    Auth,
    /// Business rule or stale view. Inform, never retry automatically.
    Validation,
    /// Store unreachable or left half written. Retry.
    Network,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("user {actor:?} is not a party to {entity}")]
    Unauthorized {
        actor: Option<String>,
        entity: String,
    },
    #[error("invalid transition from {from}: {reason}")]
    InvalidTransition { from: String, reason: String },
    #[error("{entity} was already moved to {current} by another writer")]
    Conflict { entity: String, current: String },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("store still failing after {attempts} attempts: {source}")]
    Transient { attempts: u32, source: StoreError },
    #[error("{entity} is inconsistent: {reason}")]
    Inconsistent { entity: String, reason: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl NegotiationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            NegotiationError::Unauthorized { .. } => ErrorClass::Auth,
            NegotiationError::InvalidTransition { .. }
            | NegotiationError::Conflict { .. }
            | NegotiationError::NotFound { .. }
            | NegotiationError::Validation(_) => ErrorClass::Validation,
            NegotiationError::Transient { .. } | NegotiationError::Inconsistent { .. } => {
                ErrorClass::Network
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Network
    }

    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        NegotiationError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid(from: impl ToString, reason: impl Into<String>) -> Self {
        NegotiationError::InvalidTransition {
            from: from.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestStatus;

    #[test]
    fn classes_are_distinguishable() {
        let auth = NegotiationError::Unauthorized {
            actor: None,
            entity: "chat_1".into(),
        };
        let invalid = NegotiationError::InvalidTransition {
            from: RequestStatus::Refused.to_string(),
            reason: "terminal".into(),
        };
        let network = NegotiationError::Transient {
            attempts: 3,
            source: StoreError::Unavailable("timeout".into()),
        };

        assert_eq!(auth.class(), ErrorClass::Auth);
        assert_eq!(invalid.class(), ErrorClass::Validation);
        assert_eq!(network.class(), ErrorClass::Network);
        assert!(network.is_retryable());
        assert!(!invalid.is_retryable());
    }
}
