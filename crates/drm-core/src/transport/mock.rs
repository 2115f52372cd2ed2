//! Recording transport for testing

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{Transport, TransportError};
use crate::types::PduId;

/// A call made by the manager into the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCall {
    Transmit { pdu: PduId, length: usize },
    CancelTransmit(PduId),
    CancelReceive(PduId),
}

/// Transport that records every call and never moves data by itself.
///
/// Tests play the bus side by calling the manager's callback entry points.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    fail_transmit: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `transmit` calls fail
    pub fn set_fail_transmit(&self, fail: bool) {
        self.fail_transmit.store(fail, Ordering::SeqCst);
    }

    /// All recorded calls, oldest first
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Drain the recorded calls
    pub fn take_calls(&self) -> Vec<TransportCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    /// Recorded transmit requests as `(pdu, length)`
    pub fn transmissions(&self) -> Vec<(PduId, usize)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Transmit { pdu, length } => Some((*pdu, *length)),
                _ => None,
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn transmit(&self, pdu: PduId, length: usize) -> Result<(), TransportError> {
        self.calls.lock().push(TransportCall::Transmit { pdu, length });
        if self.fail_transmit.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("mock transmit failure".to_string()));
        }
        tracing::debug!(%pdu, length, "Mock transport: transmit requested");
        Ok(())
    }

    fn cancel_transmit(&self, pdu: PduId) -> Result<(), TransportError> {
        self.calls.lock().push(TransportCall::CancelTransmit(pdu));
        Ok(())
    }

    fn cancel_receive(&self, pdu: PduId) -> Result<(), TransportError> {
        self.calls.lock().push(TransportCall::CancelReceive(pdu));
        Ok(())
    }
}
