//! Error types for the hybrid retrieval engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    #[error("Graph store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Timed out during {operation} after {elapsed_ms} ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures worth retrying with backoff. Constraint
    /// violations and malformed input are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::ProviderUnavailable(_) | Error::Timeout { .. }
        )
    }

    /// Timeout for a named operation, from the deadline that was set.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<neo4rs::Error> for Error {
    fn from(err: neo4rs::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<qdrant_client::QdrantError> for Error {
    fn from(err: qdrant_client::QdrantError) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<async_openai::error::OpenAIError> for Error {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        Error::ProviderUnavailable(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::ProviderUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_malformed_record() {
        let err = Error::MalformedRecord("missing id".to_string());
        assert!(err.to_string().contains("Malformed record"));
        assert!(err.to_string().contains("missing id"));
    }

    #[test]
    fn test_error_display_invalid_entity() {
        let err = Error::InvalidEntity("blank surface form".to_string());
        assert!(err.to_string().contains("Invalid entity"));
        assert!(err.to_string().contains("blank surface form"));
    }

    #[test]
    fn test_error_display_store_unavailable() {
        let err = Error::StoreUnavailable("connection refused".to_string());
        assert!(err.to_string().contains("Graph store unavailable"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_error_display_provider_unavailable() {
        let err = Error::ProviderUnavailable("rate limit exceeded".to_string());
        assert!(err.to_string().contains("Provider unavailable"));
        assert!(err.to_string().contains("rate limit"));
    }

    #[test]
    fn test_error_display_timeout() {
        let err = Error::Timeout {
            operation: "vector query".to_string(),
            elapsed_ms: 1500,
        };
        let msg = err.to_string();
        assert!(msg.contains("vector query"));
        assert!(msg.contains("1500"));
    }

    #[test]
    fn test_error_display_invalid_argument() {
        let err = Error::InvalidArgument("dimension must be non-zero".to_string());
        assert!(err.to_string().contains("Invalid argument"));
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::ConfigError("bad yaml".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Configuration error"));
        assert!(msg.contains("bad yaml"));
    }

    #[test]
    fn test_error_display_unknown() {
        let err = Error::Unknown("something went wrong".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Unknown error"));
        assert!(msg.contains("something went wrong"));
    }

    #[test]
    fn test_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::IoError(_)));
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();

        assert!(matches!(err, Error::SerializationError(_)));
        assert!(err.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_retryable_variants() {
        assert!(Error::StoreUnavailable("down".to_string()).is_retryable());
        assert!(Error::ProviderUnavailable("down".to_string()).is_retryable());
        assert!(Error::Timeout {
            operation: "embed".to_string(),
            elapsed_ms: 10,
        }
        .is_retryable());
    }

    #[test]
    fn test_non_retryable_variants() {
        assert!(!Error::MalformedRecord("bad".to_string()).is_retryable());
        assert!(!Error::InvalidEntity("bad".to_string()).is_retryable());
        assert!(!Error::InvalidArgument("bad".to_string()).is_retryable());
        assert!(!Error::ConfigError("bad".to_string()).is_retryable());
        assert!(!Error::Unknown("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_timeout_constructor() {
        let err = Error::timeout("graph expansion", std::time::Duration::from_millis(250));
        match err {
            Error::Timeout {
                operation,
                elapsed_ms,
            } => {
                assert_eq!(operation, "graph expansion");
                assert_eq!(elapsed_ms, 250);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_error_debug_impl() {
        let err = Error::MalformedRecord("no text".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("MalformedRecord"));
    }

    #[test]
    fn test_error_all_variants_debug() {
        let variants: Vec<Error> = vec![
            Error::MalformedRecord("record".to_string()),
            Error::InvalidEntity("entity".to_string()),
            Error::StoreUnavailable("store".to_string()),
            Error::ProviderUnavailable("provider".to_string()),
            Error::Timeout {
                operation: "op".to_string(),
                elapsed_ms: 1,
            },
            Error::SerializationError("serial".to_string()),
            Error::ConfigError("config".to_string()),
            Error::InvalidArgument("arg".to_string()),
            Error::Unknown("unknown".to_string()),
        ];

        for err in variants {
            let debug_str = format!("{:?}", err);
            assert!(!debug_str.is_empty());
        }
    }

    #[test]
    fn test_result_type_err() {
        let result: Result<i32> = Err(Error::Unknown("test".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_result_map() {
        let result: Result<i32> = Ok(10);
        let mapped = result.map(|x| x * 2);
        assert_eq!(mapped.unwrap(), 20);
    }

    #[test]
    fn test_error_from_io_various_kinds() {
        let kinds = [
            std::io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::ConnectionRefused,
            std::io::ErrorKind::TimedOut,
        ];

        for kind in kinds {
            let io_err = std::io::Error::new(kind, "test");
            let err: Error = io_err.into();
            assert!(matches!(err, Error::IoError(_)));
        }
    }
}
