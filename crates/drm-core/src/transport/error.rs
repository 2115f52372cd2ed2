//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transmit rejected: {0}")]
    Rejected(String),

    #[error("Transmission failed")]
    TxFailed,

    #[error("Reception failed")]
    RxFailed,

    #[error("Transport timeout")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,
}

/// Buffer request outcome returned to transport callbacks
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufReqError {
    /// The request cannot be served; the transport should abort
    #[error("Buffer request not accepted")]
    NotOk,

    /// The data does not fit the channel buffer
    #[error("Buffer overflow")]
    Overflow,
}
