use http::StatusCode;
use thiserror::Error;

use crate::engine::EngineError;

/// Request and startup errors
#[derive(Error, Debug)]
pub enum ProximaError {
    // Request errors
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Unprocessable target: {0}")]
    UnprocessableTarget(String),

    // Policy errors
    #[error("Rule evaluation failed: {0}")]
    EngineFailure(#[from] EngineError),

    #[error("No candidate succeeded")]
    NoCandidate,

    #[error("Candidate {candidate} failed: {reason}")]
    CandidateFailure { candidate: String, reason: String },

    // Startup errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load rules from {origin}: {source}")]
    RuleLoad {
        origin: String,
        #[source]
        source: EngineError,
    },

    // Generic errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProximaError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProximaError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProximaError::UnprocessableTarget(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProximaError::EngineFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProximaError::NoCandidate => StatusCode::BAD_GATEWAY,
            ProximaError::CandidateFailure { .. } => StatusCode::BAD_GATEWAY,
            ProximaError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProximaError::RuleLoad { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProximaError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProximaError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl From<hyper::Error> for ProximaError {
    fn from(err: hyper::Error) -> Self {
        ProximaError::Internal(format!("HTTP error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ProximaError>;
