use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration from '{path}'")]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration '{path}'")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Marker error: the server terminated the deployment. Always fatal, and the
/// state machine must proceed through rollback when it sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deployment was aborted on the server")]
pub struct DeploymentAborted;

/// How a failure should be treated by the update state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Worth retrying within the current state.
    Transient,
    /// Surfaced to the state machine to roll back or abort.
    Fatal,
}

/// A failure as seen by the update state machine: a cause chain plus the
/// severity that decides between in-state retry and the error path.
#[derive(Debug)]
pub struct UpdateError {
    severity: Severity,
    cause: anyhow::Error,
}

impl UpdateError {
    pub fn transient(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            severity: Severity::Transient,
            cause: cause.into(),
        }
    }

    pub fn fatal(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            severity: Severity::Fatal,
            cause: cause.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::fatal(DeploymentAborted)
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    pub fn is_aborted(&self) -> bool {
        self.cause.chain().any(|e| e.is::<DeploymentAborted>())
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Transient => write!(f, "transient error: {:#}", self.cause),
            Severity::Fatal => write!(f, "fatal error: {:#}", self.cause),
        }
    }
}

/// Severity-tagging shorthand for plumbing anyhow results into the FSM.
pub trait SeverityResultExt<T> {
    fn or_transient(self) -> Result<T, UpdateError>;
    fn or_fatal(self) -> Result<T, UpdateError>;
}

impl<T, E: Into<anyhow::Error>> SeverityResultExt<T> for Result<T, E> {
    fn or_transient(self) -> Result<T, UpdateError> {
        self.map_err(UpdateError::transient)
    }

    fn or_fatal(self) -> Result<T, UpdateError> {
        self.map_err(UpdateError::fatal)
    }
}
