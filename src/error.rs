//! Library error type

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("invalid proxy URL ({reason}): {url}")]
    InvalidProxyUrl { url: String, reason: String },
    #[error("invalid toml data: {0}")]
    InvalidImport(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unable to decode json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unable to encode toml: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    pub fn source_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "source",
            id: id.into(),
        }
    }

    pub fn proxy_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "proxy",
            id: id.into(),
        }
    }

    pub fn invalid_proxy_url(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidProxyUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
