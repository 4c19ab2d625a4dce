//! Errors produced while an engine evaluates a plan

use std::time::Duration;

use thiserror::Error;

/// An error raised by an [`Engine`](crate::Engine) while evaluating a container, file or
/// service.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A step ran before any `From` step selected an image
    #[error("container has no base image; add a `from` step first")]
    NoImage,
    /// A path that a step reads from does not exist
    #[error("no such file: {}", path)]
    NotFound {
        /// The path inside the container
        path: String,
    },
    /// A `WaitForFile` step gave up after its deadline
    #[error("timed out after {:?} waiting for {}", waited, path)]
    Timeout {
        /// The path that never appeared
        path: String,
        /// How long the step waited
        waited: Duration,
    },
    /// A `Substitute` step carried a pattern that does not compile
    #[error("invalid substitution pattern {:?}: {}", pattern, source)]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// The regex error
        source: regex::Error,
    },
    /// The engine could not execute a command
    #[error("exec {:?} failed: {}", args, message)]
    Exec {
        /// The command that failed
        args: Vec<String>,
        /// What the engine reported
        message: String,
    },
    /// Any other failure from the backing engine
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
