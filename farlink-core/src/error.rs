//! Defines error types.

pub type Result<T> = core::result::Result<T, Error>;

/// Crate-wide error type.
///
/// Errors raised while executing a remote invocation are shipped back to the
/// calling side as exception frames and resurface there as one of these
/// variants, depending on the recorded kind.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("proxy management error: {0}")]
    ProxyManagement(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("remote side raised {type_name}: {message}")]
    Remote { type_name: String, message: String },

    #[error("other error: {0}")]
    Other(String),
}
