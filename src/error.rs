//! Unified error type.

/// The error type returned by gatehouse's fallible operations.
///
/// Application-level errors (403, 404, 500, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// infrastructure and configuration failures: binding to a port, accepting a
/// connection, or a missing secure random source at startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid socket address `{0}`")]
    InvalidAddress(String),

    /// The operating system's random source could not be read. Token
    /// issuance is impossible without it, so this is fatal at startup.
    #[error("secure random source is unavailable: {0}")]
    Randomness(#[from] rand::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
