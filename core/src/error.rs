use thiserror::Error;

/// Failures talking to the remote spreadsheet mirror.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("remote mirror unreachable: {0}")]
    Connectivity(String),

    #[error("remote mirror rejected the credentials: {0}")]
    Unauthorized(String),

    #[error("{entity} {id} not found in remote mirror")]
    NotFound { entity: &'static str, id: String },

    #[error("malformed row {row} in sheet {sheet}: {reason}")]
    MalformedRow {
        sheet: String,
        row: usize,
        reason: String,
    },

    #[error("remote mirror returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("not connected to a spreadsheet; run `tally connect <sheet-id>` first")]
    NotConnected,
}

impl MirrorError {
    /// Whether trying the same request again later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connectivity(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Unauthorized(_)
            | Self::NotFound { .. }
            | Self::MalformedRow { .. }
            | Self::NotConnected => false,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type MirrorResult<T> = Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MirrorError::Connectivity("timeout".into()).is_retryable());
        assert!(
            MirrorError::Api {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            MirrorError::Api {
                status: 429,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !MirrorError::Api {
                status: 400,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!MirrorError::Unauthorized("bad token".into()).is_retryable());
        assert!(
            !MirrorError::NotFound {
                entity: "transaction",
                id: "t1".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = MirrorError::NotFound {
            entity: "transaction",
            id: "t1".into(),
        };
        assert_eq!(err.to_string(), "transaction t1 not found in remote mirror");
        assert!(err.is_not_found());
    }
}
