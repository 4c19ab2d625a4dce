use container_spec::ParseError;
use thiserror::Error;

use crate::port::AllocationError;

/// Errors that abort construction of a [`Session`](crate::Session).
///
/// None of these are retried. A failed construction leaves nothing behind.
#[derive(Debug, Error)]
pub enum Error {
    /// The cluster name cannot key cache volumes
    #[error("invalid cluster name {:?}: {}", name, reason)]
    InvalidName {
        /// The rejected name
        name: String,
        /// What is wrong with it
        reason: &'static str,
    },
    /// An image reference did not parse
    #[error("invalid image reference {:?}: {}", image, source)]
    InvalidImage {
        /// The rejected reference
        image: String,
        /// Why parsing failed
        source: ParseError,
    },
    /// No cluster name was given
    #[error("a cluster name is required")]
    MissingName,
    /// Polling for the kubeconfig would never sleep
    #[error("the kubeconfig poll interval must be greater than zero")]
    InvalidPollInterval,
    /// No port could be allocated for the API server
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}
