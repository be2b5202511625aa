use crate::transport::TransportError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Refresh failed, or the request was still unauthorized after its one retry.
    #[error("session expired")]
    AuthExpired,
    #[error("no refresh credential available")]
    NoRefreshCredential,
    /// The server reports that initial setup has already been completed (403 `already_setup`).
    #[error("setup already completed")]
    SetupCompleted,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("stream error: {0}")]
    Stream(String),
    #[error("transfer error: {0}")]
    Transfer(String),
    #[error("credential storage error: {0}")]
    Storage(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    /// The login endpoint answered without `status: success`.
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("message is empty")]
    EmptyMessage,
    #[error("a chat turn is already in progress")]
    Busy,
    #[error("{0}")]
    InvalidState(String),
}

impl ClientError {
    /// Failures the request pipeline already reported: credentials wiped,
    /// one notice shown and the login redirect issued.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired | Self::NoRefreshCredential | Self::SetupCompleted
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::AuthExpired => "Your session has expired. Please sign in again.".to_string(),
            Self::NoRefreshCredential => "You are not signed in.".to_string(),
            Self::SetupCompleted => "Setup has already been completed. Please sign in.".to_string(),
            Self::Http { status, .. } => format!("Request failed (HTTP {status})."),
            Self::Network(_) => "Network error, check your connection.".to_string(),
            Self::Timeout => "The request timed out.".to_string(),
            Self::Stream(detail) => format!("The reply was interrupted: {detail}"),
            Self::Transfer(detail) => format!("Upload failed: {detail}"),
            Self::Storage(detail) => format!("Could not save credentials: {detail}"),
            Self::Decode(detail) => format!("Unexpected server response: {detail}"),
            Self::LoginRejected(detail) => detail.clone(),
            Self::EmptyMessage => "Type a message first.".to_string(),
            Self::Busy => "Wait for the current reply or stop it first.".to_string(),
            Self::InvalidState(detail) => detail.clone(),
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout,
            other => Self::Network(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_variants_are_flagged() {
        assert!(ClientError::AuthExpired.is_auth());
        assert!(ClientError::NoRefreshCredential.is_auth());
        assert!(ClientError::SetupCompleted.is_auth());
        assert!(!ClientError::Timeout.is_auth());
        assert!(!ClientError::Http {
            status: 500,
            body: String::new()
        }
        .is_auth());
    }

    #[test]
    fn transport_timeouts_keep_their_identity() {
        assert_eq!(ClientError::from(TransportError::Timeout), ClientError::Timeout);
        assert!(matches!(
            ClientError::from(TransportError::Connect("refused".into())),
            ClientError::Network(_)
        ));
    }
}
