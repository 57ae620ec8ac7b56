use std::error::Error as StdError;

/// Common error type for `roadsync_core`.
///
/// Store and transport failures keep their underlying error chain via
/// `Error::backend`. The remaining variants classify failures by how a caller
/// should react: fix configuration, reconnect, back off, or give up.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or invalid configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// CSRF state, code exchange, refresh, or credential validation failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The CRM kept answering 429, or a workspace exceeded its local budget.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Non-2xx, non-429 answer from the CRM.
    #[error("crm returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("malformed mapping suggestion: {0}")]
    MalformedSuggestion(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap any error into `Backend` with "reqwest" context.
    pub fn backend_reqwest(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: "reqwest".into(),
            source: Box::new(source),
        }
    }

    /// Errors whose message is safe and actionable for an end user.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            Self::Backend { .. } | Self::BackendMessage(_) | Self::Crypto(_) | Self::Remote { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
