//! Crate-wide error type
//!
//! Every fallible public operation in this crate returns [`Error`]. The
//! variants follow the taxonomy of validation / protocol / transport / timer
//! / internal errors: validation errors are the caller's mistake and never
//! mutate state, protocol errors are the peer's mistake and the offending
//! message is dropped, transport errors carry enough detail to build an
//! `IOException` event for the upper layer.

use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("dialog error: {0} ({1})")]
    DialogError(String, DialogId),

    #[error("transaction error: {0} ({1})")]
    TransactionError(String, TransactionKey),

    #[error("sequence error: {0}")]
    SequenceError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("timeout: {0}")]
    TimeoutError(String),

    #[error("{0}")]
    Error(String),

    #[error(transparent)]
    RsipError(#[from] rsip::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Error(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Error(s.to_string())
    }
}
