use thiserror::Error;

/// Failures reported by a presence store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store operation timed out")]
    Timeout,
    #[error("store rejected the request: permission denied")]
    PermissionDenied,
    #[error("store unreachable: network unavailable")]
    NetworkUnavailable,
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed => StoreError::NetworkUnavailable,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return StoreError::Timeout;
        }
        if err.is_connect() || err.is_request() {
            return StoreError::NetworkUnavailable;
        }
        match err.status().map(|s| s.as_u16()) {
            Some(401) | Some(403) => StoreError::PermissionDenied,
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("presence write failed: {0}")]
    Write(#[source] StoreError),
    #[error("matching session has ended")]
    SessionEnded,
    #[error("connectivity is suspended")]
    ConnectivitySuspended,
    #[error("no location fix available")]
    NoLocationFix,
    #[error("invalid location")]
    InvalidLocation,
    #[error("presence manager stopped")]
    ManagerStopped,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("subscription failed: {0}")]
    Store(#[from] StoreError),
    #[error("change feed ended")]
    FeedEnded,
}
