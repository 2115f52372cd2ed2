//! Demo scenario driven by the simulator loop
//!
//! 1. Scan every physical connection for an ECU.
//! 2. Read the VIN (DID 0xF190) of every ECU that answered, retrying while
//!    the channel pool is exhausted.
//! 3. Send one functional VIN read plus a suppressed functional
//!    TesterPresent, then fetch the collected physical responses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use drm_core::{
    ConnectionId, DiscoveryState, DrmMode, EcuStatus, FetchError, Notification,
    NotificationKind, NotifyFn, RequestManager, ResponseCode, SubmitError,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

const DID_VIN: u16 = 0xF190;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovery,
    ReadIdentification,
    Functional,
    Done,
}

/// Final outcome of one request as seen by the scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub connection: ConnectionId,
    pub service_id: u8,
    pub code: ResponseCode,
    pub response: Vec<u8>,
}

pub struct Scenario {
    phase: Phase,
    discovery_started: bool,
    queue: VecDeque<ConnectionId>,
    functional: Option<ConnectionId>,
    functional_sent: bool,
    outstanding: Arc<AtomicUsize>,
    outcomes: Arc<Mutex<Vec<Outcome>>>,
}

impl Scenario {
    pub fn new(drm: &RequestManager, skip_discovery: bool) -> Self {
        let functional = drm
            .connections()
            .iter()
            .find(|conn| conn.functional)
            .map(|conn| conn.id);
        let mut scenario = Self {
            phase: Phase::Discovery,
            discovery_started: false,
            queue: VecDeque::new(),
            functional,
            functional_sent: false,
            outstanding: Arc::new(AtomicUsize::new(0)),
            outcomes: Arc::new(Mutex::new(Vec::new())),
        };
        if skip_discovery {
            scenario.enter_read_identification(drm, false);
        }
        scenario
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Finished requests, in completion order
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().clone()
    }

    /// Advance the scenario after a tick
    pub fn step(&mut self, drm: &RequestManager) -> Phase {
        match self.phase {
            Phase::Discovery => self.step_discovery(drm),
            Phase::ReadIdentification => {
                self.submit_queued(drm);
                if self.queue.is_empty() && self.outstanding() == 0 {
                    info!("Identification read complete");
                    self.phase = Phase::Functional;
                }
            }
            Phase::Functional => self.step_functional(drm),
            Phase::Done => {}
        }
        self.phase
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn step_discovery(&mut self, drm: &RequestManager) {
        if !self.discovery_started {
            match drm.start_discovery() {
                Ok(()) => {
                    info!("ECU discovery started");
                    self.discovery_started = true;
                }
                Err(e) => {
                    warn!(error = %e, "Discovery not started, reading all connections");
                    self.enter_read_identification(drm, false);
                }
            }
            return;
        }

        match drm.discovery_state() {
            Ok(DiscoveryState::Finished) => {
                if let Ok(table) = drm.discovery_table() {
                    for (id, status) in table.iter() {
                        debug!(connection = %id, ?status, "Discovery result");
                    }
                }
                self.enter_read_identification(drm, true);
            }
            // Stopped from outside
            Ok(DiscoveryState::Idle) => self.enter_read_identification(drm, false),
            _ => {}
        }
    }

    fn enter_read_identification(&mut self, drm: &RequestManager, only_available: bool) {
        self.queue = drm
            .connections()
            .iter()
            .filter(|conn| !conn.functional)
            .filter(|conn| {
                !only_available
                    || matches!(drm.discovery_status(conn.id), Ok(EcuStatus::Available))
            })
            .map(|conn| conn.id)
            .collect();
        info!(connections = self.queue.len(), "Reading identification");
        self.phase = Phase::ReadIdentification;
    }

    fn submit_queued(&mut self, drm: &RequestManager) {
        while let Some(&connection) = self.queue.front() {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            match drm.read_data_by_identifier(connection, DID_VIN, self.notifier()) {
                Ok(channel) => {
                    debug!(%connection, %channel, "VIN read submitted");
                    self.queue.pop_front();
                }
                Err(SubmitError::NoChannel | SubmitError::ConnectionBusy) => {
                    // Retry on a later tick
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
                Err(e) => {
                    warn!(%connection, error = %e, "VIN read rejected");
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    self.queue.pop_front();
                }
            }
        }
    }

    fn step_functional(&mut self, drm: &RequestManager) {
        let Some(functional) = self.functional else {
            info!("No functional connection configured");
            self.phase = Phase::Done;
            return;
        };

        if !self.functional_sent {
            self.functional_sent = true;
            self.submit_functional(drm, functional);
            return;
        }

        if self.outstanding() > 0 || drm.mode() != Ok(DrmMode::Run) {
            return;
        }

        let mut buf = [0u8; 64];
        for conn in drm.connections().iter().filter(|conn| !conn.functional) {
            match drm.fetch_functional_result(conn.id, &mut buf) {
                Ok(result) => info!(
                    connection = %conn.name,
                    code = %result.code,
                    response = %hex::encode(&buf[..result.length]),
                    "Functional response"
                ),
                Err(FetchError::NotReady) => {
                    info!(connection = %conn.name, "No functional response")
                }
                Err(e) => warn!(connection = %conn.name, error = %e, "Fetch failed"),
            }
        }
        self.phase = Phase::Done;
    }

    fn submit_functional(&mut self, drm: &RequestManager, functional: ConnectionId) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = drm.read_data_by_identifier(functional, DID_VIN, self.notifier()) {
            warn!(error = %e, "Functional read rejected");
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        // Accepted alongside the running functional request
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = drm.tester_present(functional, true, self.notifier()) {
            warn!(error = %e, "Functional TesterPresent rejected");
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn notifier(&self) -> NotifyFn {
        let outstanding = Arc::clone(&self.outstanding);
        let outcomes = Arc::clone(&self.outcomes);
        Arc::new(move |n: &Notification| match &n.kind {
            NotificationKind::TransmissionComplete => {
                trace!(connection = %n.connection, "Request transmitted")
            }
            NotificationKind::ResponsePending => {
                debug!(connection = %n.connection, "Response pending")
            }
            NotificationKind::Final { code, response, .. } => {
                info!(
                    connection = %n.connection,
                    service = format_args!("0x{:02X}", n.service_id),
                    %code,
                    response = %hex::encode(response),
                    "Request finished"
                );
                outcomes.lock().push(Outcome {
                    connection: n.connection,
                    service_id: n.service_id,
                    code: *code,
                    response: response.clone(),
                });
                outstanding.fetch_sub(1, Ordering::AcqRel);
            }
        })
    }
}
