//! Error types shared by transports and configuration resolution.

/// Errors raised by [`Queue`](crate::queue::Queue) implementations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue '{uri}' has been disposed")]
    Disposed { uri: String },
    #[error("unknown acknowledgement token {token} on queue '{uri}'")]
    UnknownToken { uri: String, token: u64 },
    #[error("transport failure on queue '{uri}': {source}")]
    Transport {
        uri: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Errors detected while resolving configuration into live components.
///
/// These are fatal at startup: a bus never starts with an unresolved route or queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid scheme: expected '{supported_scheme}' but got uri '{uri}'")]
    InvalidScheme { supported_scheme: String, uri: String },
    #[error(
        "no queue factory registered for scheme '{}' (uri '{}'); supported schemes: [{}]",
        .scheme,
        .uri,
        .supported.join(", ")
    )]
    UnsupportedScheme {
        scheme: String,
        uri: String,
        /// Schemes the resolver does have factories for, sorted.
        supported: Vec<String>,
    },
    #[error("invalid queue uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("unknown specification '{name}'")]
    UnknownSpecification { name: String },
    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("thread count for '{queue}' must be at least 1")]
    InvalidThreadCount { queue: String },
    #[error("missing setting '{key}'")]
    MissingSetting { key: String },
    #[error("invalid settings: {reason}")]
    InvalidSettings { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_scheme_names_both_scheme_and_uri() {
        let err = ConfigurationError::InvalidScheme {
            supported_scheme: "memory".to_string(),
            uri: "msmq://./inbox".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("memory"));
        assert!(text.contains("msmq://./inbox"));
    }

    #[test]
    fn unsupported_scheme_lists_supported_schemes() {
        let err = ConfigurationError::UnsupportedScheme {
            scheme: "msmq".to_string(),
            uri: "msmq://./inbox".to_string(),
            supported: vec!["memory".to_string(), "sql".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "no queue factory registered for scheme 'msmq' (uri 'msmq://./inbox'); \
             supported schemes: [memory, sql]"
        );
    }

    #[test]
    fn configuration_error_converts_into_queue_error() {
        let err: QueueError = ConfigurationError::MissingSetting {
            key: "inbox.work_queue_uri".to_string(),
        }
        .into();
        assert!(matches!(err, QueueError::Configuration(_)));
    }
}
