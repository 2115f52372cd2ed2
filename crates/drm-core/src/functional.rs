//! Functional response pool
//!
//! A functional request is sent once on a broadcast connection; every ECU
//! answers on its own physical connection. Each physical answer is received
//! on a channel bound to one pool buffer and stored there when that channel
//! closes. The application fetches the stored results per connection.

use crate::error::FetchError;
use crate::types::{ConnectionId, ResponseCode};

/// Outcome of a successful fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalResult {
    pub code: ResponseCode,
    /// Bytes copied into the destination buffer
    pub length: usize,
}

#[derive(Debug, Clone, Default)]
struct FunctionalBuffer {
    /// `None` marks an unused buffer
    connection: Option<ConnectionId>,
    /// `None` while the bound channel is still receiving
    code: Option<ResponseCode>,
    payload: Vec<u8>,
    delivered: bool,
}

impl FunctionalBuffer {
    fn is_reusable(&self) -> bool {
        self.connection.is_none() || self.delivered
    }
}

#[derive(Debug)]
pub(crate) struct FunctionalPool {
    buffers: Vec<FunctionalBuffer>,
    buffer_size: usize,
}

impl FunctionalPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        Self {
            buffers: vec![FunctionalBuffer::default(); count],
            buffer_size,
        }
    }

    /// Payload capacity of one buffer
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Forget every stored result (new functional request)
    pub fn clear(&mut self) {
        self.buffers
            .iter_mut()
            .for_each(|buf| *buf = FunctionalBuffer::default());
    }

    /// Reserve a buffer for a physical sub-response of `connection`.
    ///
    /// A buffer already keyed by the connection is reused so a connection
    /// never owns two buffers. Otherwise the first unused or already
    /// delivered buffer is taken.
    pub fn bind(&mut self, connection: ConnectionId) -> Option<usize> {
        let slot = self
            .buffers
            .iter()
            .position(|buf| buf.connection == Some(connection))
            .or_else(|| self.buffers.iter().position(FunctionalBuffer::is_reusable))?;

        let buffer = &mut self.buffers[slot];
        buffer.connection = Some(connection);
        buffer.code = None;
        buffer.payload.clear();
        buffer.delivered = false;
        Some(slot)
    }

    /// Store the final outcome of the channel bound to `slot`
    pub fn complete(&mut self, slot: usize, code: ResponseCode, payload: &[u8]) {
        if let Some(buffer) = self.buffers.get_mut(slot) {
            let len = payload.len().min(self.buffer_size);
            buffer.code = Some(code);
            buffer.payload.clear();
            buffer.payload.extend_from_slice(&payload[..len]);
        }
    }

    /// Copy the stored result for `connection` into `into`.
    ///
    /// Fetching again after delivery returns the same content until the
    /// buffer is reused.
    pub fn fetch(
        &mut self,
        connection: ConnectionId,
        into: &mut [u8],
    ) -> Result<FunctionalResult, FetchError> {
        let buffer = self
            .buffers
            .iter_mut()
            .find(|buf| buf.connection == Some(connection))
            .ok_or(FetchError::NotReady)?;
        let code = buffer.code.ok_or(FetchError::NotReady)?;

        let length = buffer.payload.len();
        if into.len() < length {
            return Err(FetchError::BufferTooSmall { needed: length });
        }
        into[..length].copy_from_slice(&buffer.payload);
        buffer.delivered = true;
        Ok(FunctionalResult { code, length })
    }
}
