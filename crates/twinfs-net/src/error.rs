use thiserror::Error;
use twinfs_proto::RemoteError;

/// Errors that can occur talking to a metadata server.
#[derive(Debug, Error)]
pub enum NetError {
    /// The connection was refused by the remote peer.
    #[error("connection refused")]
    ConnectionRefused,

    /// No route to the remote host.
    #[error("no route to host")]
    NoRouteToHost,

    /// ICMP port-unreachable from the remote host.
    #[error("port unreachable")]
    PortUnreachable,

    /// The host name did not resolve.
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// A connect or read timed out.
    #[error("timeout")]
    Timeout,

    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error from the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A tagged error returned by the metadata server itself.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The local side is shutting down and refuses new calls.
    #[error("shutting down")]
    ShuttingDown,
}

impl NetError {
    /// Whether this error belongs to the unreachable class that should make
    /// the caller re-resolve the endpoint's addresses before retrying.
    pub fn needs_resolve(&self) -> bool {
        matches!(
            self,
            NetError::ConnectionRefused
                | NetError::NoRouteToHost
                | NetError::PortUnreachable
                | NetError::UnknownHost(_)
        )
    }

    /// Whether this is a timeout, retryable without touching the addresses.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Timeout)
    }

    /// The remote error, if this wraps one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            NetError::Remote(e) => Some(e),
            _ => None,
        }
    }

    /// Classify a raw I/O error into the matching variant where one exists.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            ErrorKind::HostUnreachable => NetError::NoRouteToHost,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => NetError::Timeout,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                NetError::ConnectionClosed
            }
            _ => NetError::Io(err),
        }
    }
}

/// Convenience result type.
pub type NetResult<T> = std::result::Result<T, NetError>;
