//! ECU discovery
//!
//! A background scan probes every physical connection once through the
//! reserved discovery channel and records whether the ECU answered. Results
//! are kept as 2-bit values, four connections per byte, which is also the
//! persisted block layout: connection `i` lives in byte `i / 4`, bits
//! `2 * (i % 4)` and up.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::allocator::Requester;
use crate::channel::Client;
use crate::error::DiscoveryError;
use crate::protocol::Admission;
use crate::state::{Deferred, DrmState};
use crate::types::{ChannelId, ConnectionId, DrmMode, ResponseCode};

/// Request sent to every probed ECU: TesterPresent without suppression
pub const DISCOVERY_REQUEST: [u8; 2] = [0x3E, 0x00];

/// Response capacity of the discovery channel
pub(crate) const DISCOVERY_RESPONSE_CAPACITY: usize = 8;

/// Discovery outcome of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EcuStatus {
    #[default]
    NotDiscovered = 0,
    Available = 1,
    NotAvailable = 2,
}

impl EcuStatus {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            1 => Self::Available,
            2 => Self::NotAvailable,
            _ => Self::NotDiscovered,
        }
    }

    /// Interpret the outcome of a discovery probe.
    ///
    /// Any answer from the ECU, negative or not, means it is present. Only a
    /// timeout marks it absent; transport errors and aborted probes leave the
    /// entry undiscovered.
    pub fn from_outcome(code: ResponseCode) -> Option<Self> {
        match code {
            ResponseCode::Timeout => Some(Self::NotAvailable),
            ResponseCode::TxError | ResponseCode::RxError | ResponseCode::ChannelsClosed => None,
            _ => Some(Self::Available),
        }
    }
}

/// Packed 2-bit-per-connection discovery results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryTable {
    len: usize,
    bytes: Vec<u8>,
}

impl DiscoveryTable {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bytes: vec![0; len.div_ceil(4)],
        }
    }

    /// Rebuild a table from a persisted block.
    ///
    /// A block of the wrong size (connection table changed) yields a table
    /// with every entry undiscovered.
    pub fn from_block(len: usize, block: &[u8]) -> Option<Self> {
        let table = Self::new(len);
        if block.len() != table.bytes.len() {
            return None;
        }
        let mut table = Self {
            len,
            bytes: block.to_vec(),
        };
        // Drop bits past the last connection
        if len % 4 != 0 {
            if let Some(last) = table.bytes.last_mut() {
                *last &= (1u8 << ((len % 4) * 2)) - 1;
            }
        }
        Some(table)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, connection: ConnectionId) -> Option<EcuStatus> {
        let index = connection.index();
        if index >= self.len {
            return None;
        }
        let shift = (index % 4) * 2;
        Some(EcuStatus::from_bits(self.bytes[index / 4] >> shift))
    }

    pub fn set(&mut self, connection: ConnectionId, status: EcuStatus) {
        let index = connection.index();
        if index >= self.len {
            return;
        }
        let shift = (index % 4) * 2;
        let byte = &mut self.bytes[index / 4];
        *byte = (*byte & !(0b11 << shift)) | ((status as u8) << shift);
    }

    pub fn reset(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }

    /// Packed block as persisted
    pub fn as_block(&self) -> &[u8] {
        &self.bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, EcuStatus)> + '_ {
        (0..self.len).map(move |i| {
            let id = ConnectionId(i as u16);
            (id, self.get(id).unwrap_or_default())
        })
    }
}

/// Discovery scan state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    Idle,
    /// Waiting to probe the connection at the cursor
    Ready,
    /// A probe is in flight on the discovery channel
    Busy,
    /// Scan complete, block being written to the store
    PersistingResult,
    Finished,
}

impl DiscoveryState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Ready | Self::Busy | Self::PersistingResult)
    }
}

/// Callback invoked with the final table when a scan completes
pub type DiscoveryFn = Arc<dyn Fn(&DiscoveryTable) + Send + Sync>;

/// Scan bookkeeping owned by the manager state
#[derive(Debug)]
pub(crate) struct DiscoveryEngine {
    pub state: DiscoveryState,
    pub cursor: usize,
    pub table: DiscoveryTable,
    /// Connection currently being probed
    pub probing: Option<ConnectionId>,
    /// Probe outcome waiting to be applied by the next tick
    pub pending: Option<(ConnectionId, ResponseCode)>,
}

impl DiscoveryEngine {
    pub fn new(table: DiscoveryTable) -> Self {
        Self {
            state: DiscoveryState::Idle,
            cursor: 0,
            table,
            probing: None,
            pending: None,
        }
    }

    /// Reset table and cursor for a new scan
    pub fn restart(&mut self) {
        self.table.reset();
        self.cursor = 0;
        self.probing = None;
        self.pending = None;
        self.state = DiscoveryState::Ready;
    }

    /// Record the outcome of the probe that just closed
    pub fn probe_closed(&mut self, connection: ConnectionId, code: ResponseCode) {
        if self.state == DiscoveryState::Busy && self.probing == Some(connection) {
            self.pending = Some((connection, code));
        }
    }

    /// Apply a queued probe outcome; returns the status written, if any
    pub fn apply_pending(&mut self) -> Option<(ConnectionId, Option<EcuStatus>)> {
        let (connection, code) = self.pending.take()?;
        let status = EcuStatus::from_outcome(code);
        if let Some(status) = status {
            self.table.set(connection, status);
        }
        self.probing = None;
        self.state = DiscoveryState::Ready;
        Some((connection, status))
    }
}

impl DrmState {
    pub fn start_discovery(&mut self) -> Result<(), DiscoveryError> {
        if self.layout.discovery.is_none() {
            return Err(DiscoveryError::Disabled);
        }
        if self.mode != DrmMode::Run {
            return Err(DiscoveryError::NotRunMode(self.mode));
        }
        if self.discovery.state.is_running() {
            return Err(DiscoveryError::AlreadyRunning);
        }
        self.discovery.restart();
        info!(connections = self.connections.len(), "ECU discovery started");
        Ok(())
    }

    /// Abort a scan; an in-flight probe is cancelled
    pub fn stop_discovery(&mut self, outbox: &mut Vec<Deferred>) {
        if self.discovery.state == DiscoveryState::Busy {
            if let Some(slot) = self.layout.discovery {
                self.cancel_channel(
                    ChannelId(slot as u8),
                    ResponseCode::ChannelsClosed,
                    outbox,
                );
            }
        }
        if self.discovery.state != DiscoveryState::Idle {
            info!("ECU discovery stopped");
        }
        self.discovery.state = DiscoveryState::Idle;
        self.discovery.probing = None;
        self.discovery.pending = None;
    }

    /// Fold the outcome of the last probe into the table
    pub fn apply_discovery_result(&mut self) {
        if let Some((connection, status)) = self.discovery.apply_pending() {
            match status {
                Some(status) => debug!(%connection, ?status, "ECU probed"),
                None => debug!(%connection, "ECU probe inconclusive"),
            }
        }
    }

    /// Probe the next connection, or hand the finished table to the store
    pub fn discovery_step(&mut self, outbox: &mut Vec<Deferred>) {
        if self.discovery.state != DiscoveryState::Ready {
            return;
        }
        let count = self.connections.len();

        while self.discovery.cursor < count {
            let connection = ConnectionId(self.discovery.cursor as u16);
            self.discovery.cursor += 1;

            let conn = self.connection(connection);
            // Only statically addressed physical targets can be probed
            if conn.functional || conn.is_dynamic() {
                continue;
            }
            let admitted = self.admit(Admission {
                connection,
                requester: Requester::Discovery,
                service_id: DISCOVERY_REQUEST[0],
                suppress_positive_response: false,
                header: &DISCOVERY_REQUEST,
                data: &[],
                response_capacity: DISCOVERY_RESPONSE_CAPACITY,
                metadata: None,
                client: Client::Discovery,
            });
            match admitted {
                Ok(channel) => {
                    debug!(%connection, %channel, "Probing ECU");
                    self.discovery.probing = Some(connection);
                    self.discovery.state = DiscoveryState::Busy;
                }
                Err(error) => debug!(%connection, %error, "ECU probe skipped"),
            }
            return;
        }

        self.discovery.state = DiscoveryState::PersistingResult;
        info!("ECU discovery complete, persisting result");
        outbox.push(Deferred::Persist(self.discovery.table.as_block().to_vec()));
    }

    /// The store finished writing; returns the table for the listener
    pub fn discovery_persisted(&mut self, stored: bool) -> Option<DiscoveryTable> {
        if self.discovery.state != DiscoveryState::PersistingResult {
            return None;
        }
        if !stored {
            warn!("Discovery result not persisted");
        }
        self.discovery.state = DiscoveryState::Finished;
        Some(self.discovery.table.clone())
    }
}
