/// Chat server error taxonomy.
///
/// Variants group by how the caller is expected to react, not by source: crypto and replay
/// failures never produce a reply (oracle leakage), protocol/auth/conflict/not-found errors
/// map to a single typed reply, transient failures are retried before surfacing, fatal errors
/// abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("cryptographic operation failed")]
    Crypto,

    #[error("nonce already seen for this session")]
    Replay,

    #[error("malformed protocol message: {0}")]
    Protocol(String),

    #[error("authentication required")]
    Auth,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Protocol(e.to_string())
    }
}

impl From<aes_gcm::Error> for ChatError {
    fn from(_: aes_gcm::Error) -> Self {
        ChatError::Crypto
    }
}

impl From<rsa::Error> for ChatError {
    fn from(_: rsa::Error) -> Self {
        ChatError::Crypto
    }
}

impl From<rsa::signature::Error> for ChatError {
    fn from(_: rsa::signature::Error) -> Self {
        ChatError::Crypto
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(se, _)
                if se.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ChatError::Conflict(e.to_string())
            }
            _ => ChatError::Transient(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChatError::Crypto;
        assert_eq!(format!("{err}"), "cryptographic operation failed");

        let err = ChatError::Conflict("name_taken".into());
        assert_eq!(format!("{err}"), "conflict: name_taken");
    }

    #[test]
    fn test_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ChatError = json_err.into();
        assert!(matches!(err, ChatError::Protocol(_)));
    }
}
