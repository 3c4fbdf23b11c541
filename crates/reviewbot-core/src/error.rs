//! Error types for reviewbot-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("repository already registered: {0}")]
    RepositoryAlreadyRegistered(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("state blob exceeds 1 MiB limit ({0} bytes)")]
    StateBlobTooLarge(usize),

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("prior iteration unknown: {0}")]
    PriorIterationUnknown(String),

    #[error("platform transient error: {0}")]
    PlatformTransient(String),

    #[error("platform permanent error: {0}")]
    PlatformPermanent(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("ingest rejected: {0}")]
    IngestRejected(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Taxonomy from the error-handling design: every error that crosses a retry
/// boundary is classified once so the resilience kit doesn't need to special-case
/// error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Partial,
    Critical,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::PlatformTransient(_) => ErrorClass::Transient,
            Error::Database(sqlx::Error::PoolTimedOut) | Error::Database(sqlx::Error::Io(_)) => {
                ErrorClass::Transient
            }
            Error::PlatformPermanent(_) | Error::Unauthorized | Error::IngestRejected(_) => {
                ErrorClass::Permanent
            }
            Error::StoreUnavailable(_) | Error::CircuitOpen(_) => ErrorClass::Critical,
            _ => ErrorClass::Partial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_platform_transient_as_transient() {
        assert_eq!(
            Error::PlatformTransient("timeout".into()).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn classifies_unauthorized_as_permanent() {
        assert_eq!(Error::Unauthorized.class(), ErrorClass::Permanent);
    }

    #[test]
    fn classifies_circuit_open_as_critical() {
        assert_eq!(
            Error::CircuitOpen("analyzer".into()).class(),
            ErrorClass::Critical
        );
    }
}
