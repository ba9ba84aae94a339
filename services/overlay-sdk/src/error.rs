//! Error taxonomy for identity acquisition, resolution and transport
//!
//! Every variant maps to the [`Stage`] that failed so an operator can tell
//! "no credential" apart from "no network access" and "service not granted".

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle stage an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    IdentityLoad,
    Enrollment,
    Authentication,
    Resolution,
    Dial,
    Bind,
    Protocol,
    Shutdown,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::IdentityLoad => write!(f, "identity load"),
            Stage::Enrollment => write!(f, "enrollment"),
            Stage::Authentication => write!(f, "authentication"),
            Stage::Resolution => write!(f, "resolution"),
            Stage::Dial => write!(f, "dial"),
            Stage::Bind => write!(f, "bind"),
            Stage::Protocol => write!(f, "application protocol"),
            Stage::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Errors that can occur anywhere in the overlay SDK
#[derive(Debug, Error)]
pub enum OverlayError {
    /// No identity file at the given path
    #[error("Identity file not found: {}", .0.display())]
    IdentityNotFound(PathBuf),

    /// Identity file exists but is not a valid credential bundle
    #[error("Identity file {} is corrupt: {reason}", path.display())]
    IdentityCorrupt { path: PathBuf, reason: String },

    /// Identity file could not be read or written
    #[error("Storage error on {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Enrollment broker answered with a non-success status
    #[error("Broker returned {status}: {body}")]
    Broker { status: u16, body: String },

    /// Enrollment broker could not be reached or answered garbage
    #[error("Broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// Token rejected or the cryptographic exchange failed
    #[error("Enrollment failed: {0}")]
    Enrollment(String),

    /// Enrollment token expired before the exchange started
    #[error("Enrollment token expired at {0}")]
    TokenExpired(chrono::DateTime<chrono::Utc>),

    /// Identity rejected by the controller
    #[error("Authentication failed for identity {identity}: {reason}")]
    Auth { identity: String, reason: String },

    /// Operation requires an authenticated context
    #[error("Context for identity {0} is not authenticated")]
    NotAuthenticated(String),

    /// Catalog refresh against the controller failed
    #[error("Controller request failed: {0}")]
    Controller(String),

    /// No registered context grants the service
    #[error("Service [{0}] is not available by any overlay context")]
    NoSuchService(String),

    /// Service is not in this context's catalog, or lacks the permission
    #[error("Service [{0}] is not available to this identity")]
    ServiceUnavailable(String),

    /// Nothing is accepting connections for the service
    #[error("Connection refused by service [{0}]")]
    ConnectionRefused(String),

    /// Transport-level dial failure
    #[error("Dial to service [{service}] failed: {reason}")]
    Dial { service: String, reason: String },

    /// Transport-level listen failure
    #[error("Bind of service [{service}] failed: {reason}")]
    Bind { service: String, reason: String },

    /// A deadline elapsed
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Shutdown was requested while the operation was outstanding
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    /// Malformed or oversized application protocol frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Stream-level IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OverlayError {
    /// The lifecycle stage this error belongs to
    pub fn stage(&self) -> Stage {
        match self {
            OverlayError::IdentityNotFound(_)
            | OverlayError::IdentityCorrupt { .. }
            | OverlayError::Storage { .. } => Stage::IdentityLoad,
            OverlayError::Broker { .. }
            | OverlayError::BrokerUnreachable(_)
            | OverlayError::Enrollment(_)
            | OverlayError::TokenExpired(_) => Stage::Enrollment,
            OverlayError::Auth { .. } | OverlayError::NotAuthenticated(_) => {
                Stage::Authentication
            }
            OverlayError::NoSuchService(_)
            | OverlayError::ServiceUnavailable(_)
            | OverlayError::Controller(_) => Stage::Resolution,
            OverlayError::ConnectionRefused(_) | OverlayError::Dial { .. } => Stage::Dial,
            OverlayError::Bind { .. } => Stage::Bind,
            OverlayError::Timeout { .. } | OverlayError::Protocol(_) | OverlayError::Io(_) => {
                Stage::Protocol
            }
            OverlayError::Cancelled => Stage::Shutdown,
        }
    }

    /// Whether the caller may carry on (feature unavailable, close one
    /// connection) instead of aborting the run
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OverlayError::NoSuchService(_)
                | OverlayError::ServiceUnavailable(_)
                | OverlayError::Controller(_)
                | OverlayError::ConnectionRefused(_)
                | OverlayError::Dial { .. }
                | OverlayError::Timeout { .. }
                | OverlayError::Protocol(_)
                | OverlayError::Io(_)
        )
    }

    pub(crate) fn timeout(operation: &'static str, after: Duration) -> Self {
        OverlayError::Timeout { operation, after }
    }
}

pub type Result<T, E = OverlayError> = std::result::Result<T, E>;
