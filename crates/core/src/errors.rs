use mcp_hostd_proto::envelope;
use thiserror::Error;

/// Argument-validation failures raised by [`crate::validate`].
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required argument: {0}")]
    MissingRequired(String),
    #[error("argument '{name}' must be of type {expected}")]
    TypeMismatch { name: String, expected: String },
    #[error("argument '{0}' is not one of the allowed values")]
    NotInEnum(String),
    #[error("argument '{name}' does not match pattern '{pattern}'")]
    PatternMismatch { name: String, pattern: String },
    #[error("argument '{name}' is out of range [{low}, {high}]")]
    OutOfRange { name: String, low: f64, high: f64 },
    #[error("schema for '{name}' is invalid: {reason}")]
    BadSchema { name: String, reason: String },
}

/// Error taxonomy shared across the daemon. Every variant carries a fixed
/// JSON-RPC error code so no layer has to guess at the mapping.
#[derive(Debug, Error)]
pub enum HostdError {
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Server not initialized")]
    NotInitialized,

    #[error("{0}")]
    NotAllowed(String),

    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    #[error("System command failed: {0}")]
    Command(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl HostdError {
    /// The JSON-RPC error code this error surfaces with.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidRequest(_) => envelope::INVALID_REQUEST,
            Self::MethodNotFound(_) => envelope::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => envelope::INVALID_PARAMS,
            Self::NotInitialized => envelope::NOT_INITIALIZED,
            Self::NotAllowed(_) => envelope::NOT_ALLOWED,
            Self::ResourceLocked(_) => envelope::RESOURCE_LOCKED,
            Self::Command(_)
            | Self::Configuration(_)
            | Self::Io(_)
            | Self::Serde(_)
            | Self::Internal(_) => envelope::INTERNAL_ERROR,
        }
    }
}

impl From<ValidationError> for HostdError {
    fn from(err: ValidationError) -> Self {
        Self::InvalidParams(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HostdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_registry() {
        assert_eq!(HostdError::InvalidRequest("x".into()).code(), -32600);
        assert_eq!(HostdError::MethodNotFound("x".into()).code(), -32601);
        assert_eq!(HostdError::InvalidParams("x".into()).code(), -32602);
        assert_eq!(HostdError::NotInitialized.code(), -32002);
        assert_eq!(HostdError::NotAllowed("x".into()).code(), -31001);
        assert_eq!(HostdError::ResourceLocked("x".into()).code(), -30001);
        assert_eq!(HostdError::Internal("x".into()).code(), -32603);
        assert_eq!(HostdError::Command("x".into()).code(), -32603);
    }

    #[test]
    fn validation_errors_map_to_invalid_params() {
        let err: HostdError = ValidationError::MissingRequired("text".into()).into();
        assert_eq!(err.code(), -32602);
        assert!(err.to_string().contains("text"));
    }
}
