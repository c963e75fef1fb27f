use thiserror::Error;

/// Transport-level failure. Never propagated to a caller directly — the
/// engine swallows it, reconnects, and replays the pending list.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("tls handshake failed: {0}")]
    Handshake(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection")]
    Closed,
    #[error("handshake did not complete before the deadline")]
    HandshakeTimedOut,
    #[error(transparent)]
    Invalid(#[from] InvalidFrame),
    #[error("no free transaction ids, treating as transport back-pressure")]
    BackPressure,
}

/// Outcome of a request whose reply may never arrive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UplinkError {
    #[error("server rejected the data stream")]
    SyncFailed,
    #[error("connection abandoned, operation will not complete")]
    Abandoned,
    #[error("no free transaction ids available")]
    NoFreeIds,
}

/// Malformed wire data: a frame whose header or length prefix can't be
/// trusted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidFrame {
    #[error("frame payload length {0} exceeds the configured maximum")]
    TooLarge(u32),
}

/// Errors surfaced while resolving a device's identity from its certificate.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("couldn't parse certificate: {0}")]
    Malformed(String),
    #[error("DeviceID extension (1.3.6.1.4.1.55338.0.0) not present")]
    MissingDeviceId,
    #[error("Environment extension (1.3.6.1.4.1.55338.0.1) not present")]
    MissingEnvironment,
    #[error("couldn't decode DeviceID extension value")]
    BadDeviceId,
    #[error("couldn't decode Environment extension value")]
    BadEnvironment,
}

/// Builder misuse — missing files, unreadable keys, and similar setup
/// mistakes caught before a worker thread is ever spawned.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("couldn't read {what} at {path}: {source}")]
    Unreadable { what: &'static str, path: String, source: std::io::Error },
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("no order callback was configured")]
    MissingOrderCallback,
}
