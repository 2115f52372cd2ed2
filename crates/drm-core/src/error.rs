//! Request manager errors
//!
//! Admission errors are returned synchronously and never retried by the
//! manager. Protocol outcomes are not errors: they travel in
//! [`ResponseCode`](crate::ResponseCode) through the notification callback.

use thiserror::Error;

use crate::det::DevError;
use crate::types::DrmMode;

/// Why a request was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("No free channel for this request class")]
    NoChannel,

    #[error("Connection already has a request in progress")]
    ConnectionBusy,

    #[error("External tester present")]
    TesterActive,

    #[error("Functional request in progress")]
    FunctionalActive,

    #[error("ECU discovery in progress")]
    DiscoveryActive,

    #[error("Service 0x{0:02X} blocked by firewall")]
    FirewallBlocked(u8),

    #[error("Response buffer smaller than a negative response")]
    BufferTooSmall,

    #[error("Request rejected: {0}")]
    Rejected(#[from] DevError),
}

/// Why a functional result could not be fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("No result stored for this connection yet")]
    NotReady,

    #[error("Destination buffer too small: need {needed} bytes")]
    BufferTooSmall { needed: usize },

    #[error("Fetch rejected: {0}")]
    Rejected(#[from] DevError),
}

/// Why a cancellation was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("No channel assigned to this connection")]
    NotAssigned,

    #[error("Cancel rejected: {0}")]
    Rejected(#[from] DevError),
}

/// Why discovery could not be started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("ECU discovery is disabled in the configuration")]
    Disabled,

    #[error("Discovery requires run mode (current: {0:?})")]
    NotRunMode(DrmMode),

    #[error("Discovery already running")]
    AlreadyRunning,

    #[error("Discovery rejected: {0}")]
    Rejected(#[from] DevError),
}
