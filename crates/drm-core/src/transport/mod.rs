//! Transport boundary
//!
//! The manager drives a PDU-router style transport. Outgoing calls go
//! through the [`Transport`] trait and are only ever made outside the
//! channel manager lock. The transport calls back into the manager through
//! the `start_of_reception` / `copy_rx_data` / `rx_indication` /
//! `copy_tx_data` / `tx_confirmation` entry points on
//! [`RequestManager`](crate::RequestManager).
//!
//! # Example
//!
//! ```ignore
//! use drm_core::transport::mock::RecordingTransport;
//!
//! let transport = Arc::new(RecordingTransport::new());
//! let drm = RequestManager::new(config, transport.clone())?;
//! drm.tick();
//! let sent = transport.transmissions();
//! ```

pub mod error;
pub mod mock;

pub use error::{BufReqError, TransportError};

use crate::types::PduId;

/// Outgoing transport interface
pub trait Transport: Send + Sync {
    /// Request transmission of `length` bytes on `pdu`.
    ///
    /// The data is pulled afterwards through `copy_tx_data`, and completion
    /// is reported through `tx_confirmation`. Both callbacks may arrive
    /// before this call returns.
    fn transmit(&self, pdu: PduId, length: usize) -> Result<(), TransportError>;

    /// Abort an ongoing transmission
    fn cancel_transmit(&self, pdu: PduId) -> Result<(), TransportError>;

    /// Abort an ongoing reception
    fn cancel_receive(&self, pdu: PduId) -> Result<(), TransportError>;
}
