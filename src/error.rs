use std::sync::Arc;

use reqwest::StatusCode;

/// Failures that end an authentication stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginFailure {
    #[error("bad credentials: {0}")]
    BadCredentials(String),
    #[error("unexpected redirect after login to {url} (status {status})")]
    UnexpectedRedirect { url: String, status: StatusCode },
    #[error("post-login page is missing {0}")]
    MissingSessionData(&'static str),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum VtopError {
    #[error("connection error while {context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: Arc<reqwest::Error>,
    },
    #[error("csrf error: {0}")]
    Csrf(String),
    #[error("captcha error: {0}")]
    Captcha(String),
    #[error("login error: {0}")]
    Login(#[from] LoginFailure),
    #[error("session error: {0}")]
    Session(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl VtopError {
    pub(crate) fn connection(context: impl Into<String>, source: reqwest::Error) -> Self {
        VtopError::Connection {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// True when the server explicitly rejected the identifier/secret pair.
    pub fn is_bad_credentials(&self) -> bool {
        matches!(self, VtopError::Login(LoginFailure::BadCredentials(_)))
    }
}
