use std::error::Error as StdError;

use axum::{http::StatusCode, response::Response};
use thiserror::Error;

use crate::{
    application::{repos::RepoError, serving::ServeError},
    config::LoadError,
    domain::error::DomainError,
    infra::error::InfraError,
};

/// Diagnostic detail stashed in response extensions for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Top-level failure of a CLI command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Serve(#[from] ServeError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code reported by `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) | AppError::Domain(_) => 2,
            AppError::Serve(ServeError::NotFound(_)) => 3,
            AppError::Infra(_)
            | AppError::Repo(_)
            | AppError::Serve(_)
            | AppError::Unexpected(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::domain::layer::LayerId;

    #[derive(Debug, Error)]
    #[error("outer failure")]
    struct Outer(#[source] io::Error);

    #[test]
    fn report_walks_the_source_chain() {
        let err = Outer(io::Error::other("disk full"));
        let report = ErrorReport::from_error("test", StatusCode::BAD_GATEWAY, &err);
        assert_eq!(report.messages, vec!["outer failure", "disk full"]);
        assert_eq!(report.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn exit_codes_separate_usage_from_runtime_errors() {
        assert_eq!(
            AppError::from(DomainError::policy("bad tiers")).exit_code(),
            2
        );
        assert_eq!(
            AppError::from(ServeError::NotFound(LayerId(9))).exit_code(),
            3
        );
        assert_eq!(AppError::unexpected("boom").exit_code(), 1);
    }
}
