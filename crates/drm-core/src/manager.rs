//! Request manager
//!
//! [`RequestManager`] is the public face of the engine. Task-context calls
//! (`submit`, `cancel`, `tick`, ...) and transport callbacks share a single
//! channel manager lock around [`DrmState`]. Work that leaves the engine
//! (transport calls, notifications, the persisted-block write) is collected
//! while the lock is held and carried out after it is released, so
//! callbacks may re-enter the manager.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::allocator::Requester;
use crate::channel::{Client, INLINE_CAPACITY};
use crate::config::{ConfigError, Connection, DrmConfig};
use crate::det::{ApiId, DevError, DevErrorSink, TracingErrorSink};
use crate::discovery::{DiscoveryFn, DiscoveryState, DiscoveryTable, EcuStatus};
use crate::error::{CancelError, DiscoveryError, FetchError, SubmitError};
use crate::functional::FunctionalResult;
use crate::protocol::Admission;
use crate::state::{Deferred, DrmState};
use crate::store::{DiscoveryStore, MemoryStore};
use crate::transport::{BufReqError, Transport, TransportError};
use crate::types::{ChannelId, ChannelState, ConnectionId, DrmMode, NotifyFn, PduId, ResponseCode};
use crate::uds::NEGATIVE_RESPONSE_LEN;

/// Response capacity used when the caller does not pick one
pub const DEFAULT_RESPONSE_CAPACITY: usize = 256;

/// A diagnostic request for [`RequestManager::submit`].
///
/// The bytes are copied into the channel on admission. `header` carries up
/// to four protocol bytes (service id, sub-function, identifier) sent ahead
/// of `data`; either may be empty but not both. The service id is the first
/// byte of the request.
#[derive(Debug, Clone, Copy)]
pub struct DiagRequest<'a> {
    pub connection: ConnectionId,
    pub suppress_positive_response: bool,
    pub header: &'a [u8],
    pub data: &'a [u8],
    pub response_capacity: usize,
    /// Addressing metadata, required on dynamic connections
    pub metadata: Option<&'a [u8]>,
}

impl<'a> DiagRequest<'a> {
    pub fn new(connection: ConnectionId, data: &'a [u8]) -> Self {
        Self {
            connection,
            suppress_positive_response: false,
            header: &[],
            data,
            response_capacity: DEFAULT_RESPONSE_CAPACITY,
            metadata: None,
        }
    }

    pub fn with_header(mut self, header: &'a [u8]) -> Self {
        self.header = header;
        self
    }

    pub fn suppress_positive_response(mut self, suppress: bool) -> Self {
        self.suppress_positive_response = suppress;
        self
    }

    pub fn response_capacity(mut self, capacity: usize) -> Self {
        self.response_capacity = capacity;
        self
    }

    pub fn metadata(mut self, metadata: &'a [u8]) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn service_id(&self) -> Option<u8> {
        self.header.first().or(self.data.first()).copied()
    }
}

impl DrmState {
    /// Free every channel that asked to be closed.
    ///
    /// Runs under the channel manager lock, which also serializes every
    /// transport callback, so a channel is closed and notified once.
    fn close_pass(&mut self, outbox: &mut Vec<Deferred>) {
        for index in 0..self.channels.len() {
            if self.channels[index].state == ChannelState::CloseChannel {
                self.finish_channel(ChannelId(index as u8), outbox);
            }
        }
    }

    /// Leave external tester mode once the tester is gone and every channel closed
    fn arbitrate_tester_mode(&mut self) {
        if self.mode == DrmMode::ExternalTesterPresent
            && self.tester_absent_requested
            && self.active_channels == 0
        {
            self.mode = DrmMode::Run;
            self.tester_absent_requested = false;
            info!("External tester gone, back to run mode");
        }
    }

    fn cancel_all(&mut self, outbox: &mut Vec<Deferred>) {
        for index in 0..self.channels.len() {
            self.cancel_channel(ChannelId(index as u8), ResponseCode::ChannelsClosed, outbox);
        }
    }

    /// Channel currently sending on `connection`
    fn transmitting(&self, connection: ConnectionId) -> Option<ChannelId> {
        [false, true]
            .into_iter()
            .filter_map(|tester_present| self.assigned(connection, tester_present))
            .find(|id| self.channels[id.index()].state == ChannelState::RequestProcessing)
    }
}

/// Diagnostic request manager
pub struct RequestManager {
    state: Mutex<DrmState>,
    initialized: AtomicBool,
    connections: Arc<[Connection]>,
    rx_routes: HashMap<PduId, ConnectionId>,
    tx_routes: HashMap<PduId, ConnectionId>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DiscoveryStore>,
    error_sink: Arc<dyn DevErrorSink>,
    discovery_listener: Option<DiscoveryFn>,
}

impl RequestManager {
    /// Validate the configuration and initialise the manager
    pub fn new(config: DrmConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        let connections: Arc<[Connection]> = config.validate()?.into();
        let table = DiscoveryTable::new(connections.len());
        let state = DrmState::new(&config, connections.clone(), table);
        let channel_count = state.channels.len();

        let tx_routes = connections.iter().map(|c| (c.tx_pdu, c.id)).collect();
        let rx_routes = connections
            .iter()
            .filter_map(|c| c.rx_pdu.map(|pdu| (pdu, c.id)))
            .collect();

        info!(
            connections = connections.len(),
            channels = channel_count,
            tick_ms = config.tick_ms,
            "Diagnostic request manager initialized"
        );

        Ok(Self {
            state: Mutex::new(state),
            initialized: AtomicBool::new(true),
            connections,
            rx_routes,
            tx_routes,
            transport,
            store: Arc::new(MemoryStore::new()),
            error_sink: Arc::new(TracingErrorSink),
            discovery_listener: None,
        })
    }

    /// Use `store` for discovery results and restore the table it holds
    pub fn with_store(mut self, store: Arc<dyn DiscoveryStore>) -> Self {
        match store.load() {
            Ok(Some(block)) => match DiscoveryTable::from_block(self.connections.len(), &block) {
                Some(table) => {
                    debug!(block = %hex::encode(&block), "Discovery table restored");
                    self.state.get_mut().discovery.table = table;
                }
                None => warn!(len = block.len(), "Stored discovery table does not match connections, ignored"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load discovery table"),
        }
        self.store = store;
        self
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn DevErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// Called with the final table whenever a discovery scan completes
    pub fn with_discovery_listener(mut self, listener: DiscoveryFn) -> Self {
        self.discovery_listener = Some(listener);
        self
    }

    fn report(&self, api: ApiId, error: DevError) -> DevError {
        self.error_sink.report(api, error);
        error
    }

    fn check_init(&self, api: ApiId) -> Result<(), DevError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(self.report(api, DevError::Uninit))
        }
    }

    fn check_connection(&self, api: ApiId, connection: ConnectionId) -> Result<&Connection, DevError> {
        self.connections
            .get(connection.index())
            .ok_or_else(|| self.report(api, DevError::InvalidConnection))
    }

    fn route(&self, api: ApiId, pdu: PduId, rx: bool) -> Result<ConnectionId, DevError> {
        self.check_init(api)?;
        let routes = if rx { &self.rx_routes } else { &self.tx_routes };
        routes
            .get(&pdu)
            .copied()
            .ok_or_else(|| self.report(api, DevError::InvalidPduId))
    }

    // ========================================================================
    // Driver
    // ========================================================================

    /// Periodic driver; call once per configured tick
    pub fn tick(&self) {
        if self.check_init(ApiId::Tick).is_err() {
            return;
        }
        let mut outbox = Vec::new();
        {
            let mut st = self.state.lock();
            st.arbitrate_tester_mode();
            st.apply_discovery_result();
            st.run_timers();
            if st.active_channels > 0 {
                st.sweep_requests(&mut outbox);
            }
            st.discovery_step(&mut outbox);
            st.close_pass(&mut outbox);
        }
        self.flush(outbox);
    }

    /// Carry out deferred work with the lock released
    fn flush(&self, outbox: Vec<Deferred>) {
        let mut queue = VecDeque::from(outbox);
        while let Some(action) = queue.pop_front() {
            match action {
                Deferred::Transmit {
                    channel,
                    generation,
                    pdu,
                    length,
                } => {
                    let result = self.transport.transmit(pdu, length);
                    let mut follow_up = Vec::new();
                    self.state
                        .lock()
                        .after_transmit(channel, generation, result, &mut follow_up);
                    queue.extend(follow_up);
                }
                Deferred::CancelTransmit(pdu) => {
                    if let Err(e) = self.transport.cancel_transmit(pdu) {
                        warn!(%pdu, error = %e, "Cancel transmit failed");
                    }
                }
                Deferred::CancelReceive(pdu) => {
                    if let Err(e) = self.transport.cancel_receive(pdu) {
                        warn!(%pdu, error = %e, "Cancel receive failed");
                    }
                }
                Deferred::Notify(notify, notification) => notify(&notification),
                Deferred::Persist(block) => {
                    let stored = match self.store.store(&block) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(error = %e, "Failed to store discovery table");
                            false
                        }
                    };
                    let table = self.state.lock().discovery_persisted(stored);
                    if let (Some(table), Some(listener)) = (table, &self.discovery_listener) {
                        listener(&table);
                    }
                }
            }
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Queue a request. The channel starts on a later tick; the outcome is
    /// reported through `notify` exactly once.
    pub fn submit(&self, request: DiagRequest<'_>, notify: NotifyFn) -> Result<ChannelId, SubmitError> {
        self.check_init(ApiId::Submit)?;
        let conn = self.check_connection(ApiId::Submit, request.connection)?;
        let Some(service_id) = request.service_id() else {
            return Err(self.report(ApiId::Submit, DevError::EmptyBuffer).into());
        };
        if request.header.len() > INLINE_CAPACITY {
            return Err(self.report(ApiId::Submit, DevError::InvalidHeader).into());
        }
        let metadata_ok = match request.metadata {
            Some(meta) => conn.is_dynamic() && meta.len() == conn.metadata_len,
            None => !conn.is_dynamic(),
        };
        if !metadata_ok {
            return Err(self.report(ApiId::Submit, DevError::InvalidMetadata).into());
        }
        if request.response_capacity < NEGATIVE_RESPONSE_LEN {
            return Err(SubmitError::BufferTooSmall);
        }

        let result = self.state.lock().admit(Admission {
            connection: request.connection,
            requester: Requester::Application,
            service_id,
            suppress_positive_response: request.suppress_positive_response,
            header: request.header,
            data: request.data,
            response_capacity: request.response_capacity,
            metadata: request.metadata,
            client: Client::Application(notify),
        });
        match &result {
            Ok(channel) => debug!(%channel, connection = %request.connection, service_id, "Request accepted"),
            Err(error) => debug!(connection = %request.connection, service_id, %error, "Request rejected"),
        }
        result
    }

    /// Close whatever runs on `connection`; the submitter gets `ChannelsClosed`
    pub fn cancel(&self, connection: ConnectionId) -> Result<(), CancelError> {
        self.check_init(ApiId::Cancel)?;
        self.check_connection(ApiId::Cancel, connection)?;

        let mut outbox = Vec::new();
        {
            let mut st = self.state.lock();
            let assigned: Vec<ChannelId> = [false, true]
                .into_iter()
                .filter_map(|tester_present| st.assigned(connection, tester_present))
                .collect();
            if assigned.is_empty() {
                return Err(CancelError::NotAssigned);
            }
            for id in assigned {
                st.cancel_channel(id, ResponseCode::ChannelsClosed, &mut outbox);
            }
        }
        self.flush(outbox);
        Ok(())
    }

    /// Copy the stored outcome of a functional sub-response into `into`
    pub fn fetch_functional_result(
        &self,
        connection: ConnectionId,
        into: &mut [u8],
    ) -> Result<FunctionalResult, FetchError> {
        self.check_init(ApiId::FetchFunctional)?;
        self.check_connection(ApiId::FetchFunctional, connection)?;
        self.state.lock().functional.fetch(connection, into)
    }

    // ========================================================================
    // Modes
    // ========================================================================

    /// An external tester appeared on or left the bus.
    ///
    /// Presence takes effect at once and closes every channel. Absence is
    /// applied by a later tick once no channel is active any more.
    pub fn set_external_tester_present(&self, present: bool) {
        if self.check_init(ApiId::ExternalTester).is_err() {
            return;
        }
        let mut outbox = Vec::new();
        {
            let mut st = self.state.lock();
            if present {
                st.tester_absent_requested = false;
                if st.mode != DrmMode::ExternalTesterPresent {
                    info!(active = st.active_channels, "External tester present, closing channels");
                    st.mode = DrmMode::ExternalTesterPresent;
                    st.functional_service = None;
                }
                st.stop_discovery(&mut outbox);
                st.cancel_all(&mut outbox);
            } else if st.mode == DrmMode::ExternalTesterPresent {
                debug!("External tester absent, leaving tester mode when idle");
                st.tester_absent_requested = true;
            }
        }
        self.flush(outbox);
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Start a scan over every physical connection
    pub fn start_discovery(&self) -> Result<(), DiscoveryError> {
        self.check_init(ApiId::StartDiscovery)?;
        self.state.lock().start_discovery()
    }

    pub fn stop_discovery(&self) {
        if self.check_init(ApiId::StopDiscovery).is_err() {
            return;
        }
        let mut outbox = Vec::new();
        self.state.lock().stop_discovery(&mut outbox);
        self.flush(outbox);
    }

    pub fn discovery_status(&self, connection: ConnectionId) -> Result<EcuStatus, DevError> {
        self.check_init(ApiId::DiscoveryStatus)?;
        self.check_connection(ApiId::DiscoveryStatus, connection)?;
        Ok(self
            .state
            .lock()
            .discovery
            .table
            .get(connection)
            .unwrap_or_default())
    }

    pub fn discovery_state(&self) -> Result<DiscoveryState, DevError> {
        self.check_init(ApiId::DiscoveryStatus)?;
        Ok(self.state.lock().discovery.state)
    }

    pub fn discovery_table(&self) -> Result<DiscoveryTable, DevError> {
        self.check_init(ApiId::DiscoveryStatus)?;
        Ok(self.state.lock().discovery.table.clone())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn mode(&self) -> Result<DrmMode, DevError> {
        self.check_init(ApiId::Mode)?;
        Ok(self.state.lock().mode)
    }

    pub fn channel_state(&self, channel: ChannelId) -> Result<ChannelState, DevError> {
        self.check_init(ApiId::ChannelState)?;
        self.state
            .lock()
            .channels
            .get(channel.index())
            .map(|ch| ch.state)
            .ok_or_else(|| self.report(ApiId::ChannelState, DevError::InvalidChannel))
    }

    /// Channel serving regular requests on `connection`
    pub fn assigned_channel(&self, connection: ConnectionId) -> Option<ChannelId> {
        let st = self.state.lock();
        (connection.index() < self.connections.len())
            .then(|| st.assigned(connection, false))
            .flatten()
    }

    pub fn active_channels(&self) -> Result<usize, DevError> {
        self.check_init(ApiId::ChannelState)?;
        Ok(self.state.lock().active_channels)
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Close every channel with `ChannelsClosed` and de-initialise
    pub fn shutdown(&self) {
        if self.check_init(ApiId::Shutdown).is_err() {
            return;
        }
        let mut outbox = Vec::new();
        {
            let mut st = self.state.lock();
            st.stop_discovery(&mut outbox);
            st.cancel_all(&mut outbox);
            st.close_pass(&mut outbox);
            st.mode = DrmMode::Run;
            st.tester_absent_requested = false;
            self.initialized.store(false, Ordering::Release);
        }
        self.flush(outbox);
        info!("Diagnostic request manager shut down");
    }

    // ========================================================================
    // Transport callbacks
    // ========================================================================

    /// A response starts arriving on `pdu`; returns the buffer space available
    pub fn start_of_reception(&self, pdu: PduId, sdu_length: usize) -> Result<usize, BufReqError> {
        let connection = self
            .route(ApiId::StartOfReception, pdu, true)
            .map_err(|_| BufReqError::NotOk)?;
        let mut st = self.state.lock();
        let id = match st.assigned(connection, false) {
            Some(id) => id,
            None if st.mode == DrmMode::FunctionalRequestActive => st
                .bind_functional_response(connection)
                .ok_or(BufReqError::NotOk)?,
            None => {
                debug!(%connection, sdu_length, "Unexpected response ignored");
                return Err(BufReqError::NotOk);
            }
        };
        st.on_start_of_reception(id, sdu_length)
    }

    pub fn copy_rx_data(&self, pdu: PduId, data: &[u8]) -> Result<usize, BufReqError> {
        let connection = self
            .route(ApiId::CopyRxData, pdu, true)
            .map_err(|_| BufReqError::NotOk)?;
        let mut st = self.state.lock();
        let id = st.assigned(connection, false).ok_or(BufReqError::NotOk)?;
        st.on_copy_rx(id, data)
    }

    pub fn rx_indication(&self, pdu: PduId, result: Result<(), TransportError>) {
        let Ok(connection) = self.route(ApiId::RxIndication, pdu, true) else {
            return;
        };
        let mut outbox = Vec::new();
        {
            let mut st = self.state.lock();
            let Some(id) = st.assigned(connection, false) else {
                return;
            };
            st.on_rx_indication(id, result, &mut outbox);
        }
        self.flush(outbox);
    }

    /// The transport pulls the next `dest.len()` request bytes; returns the
    /// bytes still left
    pub fn copy_tx_data(&self, pdu: PduId, dest: &mut [u8]) -> Result<usize, BufReqError> {
        let connection = self
            .route(ApiId::CopyTxData, pdu, false)
            .map_err(|_| BufReqError::NotOk)?;
        let mut st = self.state.lock();
        let id = st.transmitting(connection).ok_or(BufReqError::NotOk)?;
        st.on_copy_tx(id, dest)
    }

    pub fn tx_confirmation(&self, pdu: PduId, result: Result<(), TransportError>) {
        let Ok(connection) = self.route(ApiId::TxConfirmation, pdu, false) else {
            return;
        };
        let mut outbox = Vec::new();
        {
            let mut st = self.state.lock();
            let Some(id) = st.transmitting(connection) else {
                debug!(%connection, "Unexpected transmit confirmation");
                return;
            };
            st.on_tx_confirmation(id, result, &mut outbox);
        }
        self.flush(outbox);
    }
}
