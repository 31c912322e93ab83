use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FleetError {
    #[error("instance {id} not found")]
    NotFound { id: String },

    #[error("failed to decode {context}: {message}")]
    Decode { context: String, message: String },

    #[error("instance {id} is not ready: {message}")]
    Unready { id: String, message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("`{command}` timed out after {secs}s")]
    #[diagnostic(help("raise timing.command_timeout_secs in config.toml"))]
    Timeout { command: String, secs: u64 },

    #[error("failed to parse state file {path}: {message}")]
    StateParse { path: String, message: String },

    #[error("cluster {name} is locked by another invocation")]
    #[diagnostic(help("lock file: {path}"))]
    Locked { name: String, path: String },

    #[error("ssh {target}: {message}")]
    Ssh { target: String, message: String },
}

impl FleetError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound { .. })
    }

    /// Malformed output and bad configuration do not fix themselves.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FleetError::Decode { .. } | FleetError::Configuration { .. }
        )
    }
}

/// One failed target inside a fan-out group.
#[derive(Debug)]
pub struct TargetFailure {
    pub target: String,
    pub error: FleetError,
}

/// Every failure collected from a fan-out group, one entry per target.
#[derive(Debug, Diagnostic)]
pub struct AggregateError {
    pub failures: Vec<TargetFailure>,
}

impl AggregateError {
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.target.as_str())
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} target(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{}: {}", failure.target, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_keeps_each_target() {
        let err = AggregateError {
            failures: vec![
                TargetFailure {
                    target: "a-node-0".into(),
                    error: FleetError::NotFound { id: "a-node-0".into() },
                },
                TargetFailure {
                    target: "a-node-1".into(),
                    error: FleetError::Unready {
                        id: "a-node-1".into(),
                        message: "Stopped".into(),
                    },
                },
            ],
        };
        assert_eq!(err.targets().collect::<Vec<_>>(), ["a-node-0", "a-node-1"]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 target(s) failed: a-node-0: instance a-node-0 not found"));
        assert!(msg.contains("; a-node-1: instance a-node-1 is not ready: Stopped"));
    }
}
