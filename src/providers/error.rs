//! Classified backend failures.

use std::fmt;
use thiserror::Error;

/// Failure class of a backend call. Only logs see the distinction; users get one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// Credentials rejected or missing. No user can be served until fixed.
    Authentication,
    /// Backend-side or network failure that may succeed on retry.
    Transient,
    /// Anything else.
    Unknown,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Transient => "transient",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} authentication failed: {message}")]
    Authentication { provider: String, message: String },

    #[error("{provider} transient failure: {message}")]
    Transient {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("{provider} request failed: {source}")]
    Unknown {
        provider: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ProviderError {
    pub fn authentication(provider: &str, message: impl Into<String>) -> Self {
        Self::Authentication {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn transient(provider: &str, message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Transient {
            provider: provider.to_string(),
            message: message.into(),
            status,
        }
    }

    pub fn unknown(provider: &str, source: impl Into<anyhow::Error>) -> Self {
        Self::Unknown {
            provider: provider.to_string(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Authentication { .. } => ProviderErrorKind::Authentication,
            Self::Transient { .. } => ProviderErrorKind::Transient,
            Self::Unknown { .. } => ProviderErrorKind::Unknown,
        }
    }

    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ProviderErrorKind::Transient
    }

    /// Classify a non-success HTTP status. `detail` should already be sanitized.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, detail: &str) -> Self {
        let code = status.as_u16();
        let message = format!("API error ({status}): {detail}");
        match code {
            401 | 403 => Self::authentication(provider, message),
            408 | 409 | 425 | 429 => Self::transient(provider, message, Some(code)),
            _ if status.is_server_error() => Self::transient(provider, message, Some(code)),
            _ => Self::unknown(provider, anyhow::anyhow!(message)),
        }
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::transient(provider, format!("request timed out: {err}"), None);
        }
        if err.is_connect() {
            return Self::transient(provider, format!("connection failed: {err}"), None);
        }
        if let Some(status) = err.status() {
            return Self::from_status(provider, status, &err.to_string());
        }
        Self::unknown(provider, err)
    }
}
