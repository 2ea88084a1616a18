//! Error types for Flotilla operations

use std::time::Duration;

use thiserror::Error;

/// Main error type for fleet, cluster, queue, and issuance operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid or missing required options
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A cluster descriptor could not be resolved into a client configuration
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// An API call exceeded its configured bound
    #[error("{op} timed out after {after:?}")]
    Timeout {
        /// Operation that was cut off
        op: &'static str,
        /// The bound that was exceeded
        after: Duration,
    },

    /// `start` was invoked a second time on the same instance
    #[error("{0} can't repeat start")]
    AlreadyStarted(String),

    /// No live client is registered under the requested cluster name
    #[error("cluster [{0}] not exist")]
    ClusterNotFound(String),

    /// The requested cluster exists but its health probe reports disconnected
    #[error("cluster [{0}] disconnected")]
    ClusterDisconnected(String),

    /// Metric registration or lookup failure
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Certificate or key handling error
    #[error("pki error: {0}")]
    Pki(String),

    /// The API server reported a terminal Failed condition for a CSR
    #[error("certificate signing request failed: {0}")]
    CsrFailed(String),

    /// No webhook entry matched the given service reference
    #[error("webhook configuration mismatch: {0}")]
    NoMatchingWebhook(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a kubeconfig resolution error with the given message
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig(msg.into())
    }

    /// Create a metrics error with the given message
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_lookup_errors_carry_the_name() {
        let err = Error::ClusterNotFound("edge-eu-1".to_string());
        assert_eq!(err.to_string(), "cluster [edge-eu-1] not exist");

        let err = Error::ClusterDisconnected("edge-eu-1".to_string());
        assert_eq!(err.to_string(), "cluster [edge-eu-1] disconnected");
    }

    #[test]
    fn helper_constructors_accept_str_and_string() {
        let err = Error::configuration("cluster name is empty");
        assert!(err.to_string().contains("cluster name is empty"));

        let name = "meta";
        let err = Error::kubeconfig(format!("cluster {} has no kubeconfig", name));
        assert!(err.to_string().contains("meta"));
    }

    #[test]
    fn timeout_reports_operation_and_bound() {
        let err = Error::Timeout {
            op: "get",
            after: Duration::from_secs(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("get"));
        assert!(msg.contains("5s"));
    }
}
