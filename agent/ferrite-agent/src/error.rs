//! Error types for the update agent.

use thiserror::Error;

/// Errors produced by agent operations.
///
/// Every error carries a severity: transient errors are retriable and
/// feed the backoff schedules, fatal errors are not. [`AgentError::DeploymentAborted`]
/// is a distinguished value meaning the server cancelled the deployment
/// currently being applied; it rewires the flow wherever it shows up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// Retriable failure (network flake, server 5xx, temporary I/O).
    #[error("{0}")]
    Transient(String),

    /// Non-retriable failure.
    #[error("{0}")]
    Fatal(String),

    /// The server cancelled the deployment.
    #[error("deployment was aborted at the backend")]
    DeploymentAborted,
}

impl AgentError {
    /// Wrap any error as transient.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        AgentError::Transient(err.to_string())
    }

    /// Wrap any error as fatal.
    pub fn fatal(err: impl std::fmt::Display) -> Self {
        AgentError::Fatal(err.to_string())
    }

    /// Whether retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Fatal(_) | AgentError::DeploymentAborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert!(!AgentError::transient("flaky network").is_fatal());
        assert!(AgentError::fatal("bricked install step").is_fatal());
        assert!(AgentError::DeploymentAborted.is_fatal());
    }

    #[test]
    fn test_display_keeps_message() {
        let err = AgentError::transient(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connection timed out",
        ));
        assert_eq!(err.to_string(), "connection timed out");
    }
}
