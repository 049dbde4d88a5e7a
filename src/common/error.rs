//! Error types for fleetmgr

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Placement Errors ===
    /// No host is currently able to accept a new entity.
    #[error("No hosts available")]
    NoHostsAvailable,

    /// Every candidate host has been over the configured load level for
    /// longer than the tolerance window.
    #[error("Fleet overloaded: best load {best_load:.2} > overload level {level:.2}")]
    FleetOverloaded { best_load: f32, level: f32 },

    // === Transport Errors ===
    #[error("Transport timeout talking to {0}")]
    TransportTimeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // === Topology Errors ===
    /// A backup transition was superseded before the owning host
    /// acknowledged it. Logged as a warning, never fatal.
    #[error("Backup transition for {0} abandoned in favour of a newer one")]
    TransitionAbandoned(String),

    /// Internal bookkeeping reached a state that should be impossible
    /// (duplicate host id, unknown address in a committed hash, ...).
    /// The registry is left in the best consistent state achievable.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a failure the caller may usefully retry?
    ///
    /// Transport failures mark the peer as suspect rather than being retried
    /// blindly, but a caller-side retry against a different host is fine.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportTimeout(_)
                | Error::Transport(_)
                | Error::NoHostsAvailable
                | Error::FleetOverloaded { .. }
        )
    }

    /// Convert to an HTTP status code for the admin/RPC surface.
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NoHostsAvailable | Error::FleetOverloaded { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::TransportTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
