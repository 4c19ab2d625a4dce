//! Allocation of the port the cluster API server listens on.

use std::net::{Ipv4Addr, TcpListener};

use thiserror::Error;
use tracing::info;

/// The operating system would not hand out a port.
#[derive(Debug, Error)]
#[error("unable to allocate a free TCP port: {source}")]
pub struct AllocationError {
    #[from]
    source: std::io::Error,
}

/// Returns a TCP port that was free when this function ran.
///
/// The OS picks the port for a throwaway listener which is closed again before
/// returning. Nothing reserves the port afterwards, so another process can
/// take it before the cluster binds it. Pin a port through
/// [`Config::port`](crate::config::Config::port) where that matters.
pub fn allocate() -> Result<u16, AllocationError> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    info!(port, "First available port");
    Ok(port)
}
