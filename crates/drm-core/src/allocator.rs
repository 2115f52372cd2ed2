//! Channel allocator
//!
//! The channel array is split into fixed slot ranges: the application pool,
//! then the reserved functional, forced-TesterPresent and discovery slots.
//! Admission checks mode, firewall and connection occupancy before a free
//! slot of the right class is handed out.

use std::ops::Range;

use tracing::{debug, trace};

use crate::channel::ChannelClass;
use crate::error::SubmitError;
use crate::firewall;
use crate::state::DrmState;
use crate::types::{ChannelId, ConnectionId, DrmMode};
use crate::uds::service_id::TESTER_PRESENT;

/// Slot ranges of the channel array
#[derive(Debug, Clone)]
pub(crate) struct ChannelLayout {
    application: Range<usize>,
    pub functional: Option<usize>,
    pub tester_present: Option<usize>,
    pub discovery: Option<usize>,
    total: usize,
}

impl ChannelLayout {
    pub fn new(application: usize, functional: bool, discovery: bool) -> Self {
        let mut next = application;
        let mut reserve = |enabled: bool| {
            enabled.then(|| {
                let slot = next;
                next += 1;
                slot
            })
        };
        let functional_slot = reserve(functional);
        let tester_present = reserve(functional);
        let discovery = reserve(discovery);

        Self {
            application: 0..application,
            functional: functional_slot,
            tester_present,
            discovery,
            total: next,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn slots(&self, class: ChannelClass) -> Range<usize> {
        let single = |slot: Option<usize>| slot.map_or(0..0, |s| s..s + 1);
        match class {
            ChannelClass::Application => self.application.clone(),
            ChannelClass::Functional => single(self.functional),
            ChannelClass::TesterPresent => single(self.tester_present),
            ChannelClass::Discovery => single(self.discovery),
        }
    }
}

/// Who asks for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Requester {
    Application,
    Discovery,
}

/// Index into the assignment table. Forced TesterPresent channels use the
/// upper half so they can coexist with a regular request on the same
/// functional connection.
pub(crate) fn assignment_key(connection: ConnectionId, tester_present: bool, connections: usize) -> usize {
    if tester_present {
        connections + connection.index()
    } else {
        connection.index()
    }
}

/// Forced functional TesterPresent: `3E` with SPRMIB on a functional connection
pub(crate) fn is_forced_tester_present(service_id: u8, suppress: bool, functional: bool) -> bool {
    service_id == TESTER_PRESENT && suppress && functional
}

impl DrmState {
    /// Channel class a request gets, or why it is refused
    pub fn check_admission(
        &self,
        connection: ConnectionId,
        requester: Requester,
        service_id: u8,
        suppress: bool,
    ) -> Result<ChannelClass, SubmitError> {
        let conn = self.connection(connection);

        if requester == Requester::Discovery {
            return match self.mode {
                DrmMode::Run => Ok(ChannelClass::Discovery),
                DrmMode::ExternalTesterPresent => Err(SubmitError::TesterActive),
                DrmMode::FunctionalRequestActive => Err(SubmitError::FunctionalActive),
            };
        }

        let forced_tp = is_forced_tester_present(service_id, suppress, conn.functional);
        let class = if forced_tp {
            ChannelClass::TesterPresent
        } else if conn.functional {
            ChannelClass::Functional
        } else {
            ChannelClass::Application
        };

        match self.mode {
            DrmMode::ExternalTesterPresent => return Err(SubmitError::TesterActive),
            DrmMode::FunctionalRequestActive if !forced_tp => {
                return Err(SubmitError::FunctionalActive)
            }
            _ => {}
        }
        if class == ChannelClass::Functional && self.discovery.state.is_running() {
            return Err(SubmitError::DiscoveryActive);
        }
        if !firewall::is_permitted(self.settings.firewall, conn.services, service_id) {
            return Err(SubmitError::FirewallBlocked(service_id));
        }
        Ok(class)
    }

    /// Admit a request and assign a free channel to the connection
    pub fn acquire(
        &mut self,
        connection: ConnectionId,
        requester: Requester,
        service_id: u8,
        suppress: bool,
    ) -> Result<(ChannelId, ChannelClass), SubmitError> {
        let class = self.check_admission(connection, requester, service_id, suppress)?;

        let key = assignment_key(
            connection,
            class == ChannelClass::TesterPresent,
            self.connections.len(),
        );
        if self.assignments[key].is_some() {
            return Err(SubmitError::ConnectionBusy);
        }
        let id = self.free_slot(class).ok_or(SubmitError::NoChannel)?;

        self.assignments[key] = Some(id);
        self.active_channels += 1;
        debug!(channel = %id, %connection, ?class, active = self.active_channels, "Channel acquired");
        Ok((id, class))
    }

    pub fn free_slot(&self, class: ChannelClass) -> Option<ChannelId> {
        self.layout
            .slots(class)
            .find(|&slot| !self.channels[slot].state.is_active())
            .map(|slot| ChannelId(slot as u8))
    }

    /// Unassign a channel from its connection
    pub fn release(&mut self, id: ChannelId) {
        let ch = &self.channels[id.index()];
        let key = assignment_key(
            ch.connection,
            ch.class == ChannelClass::TesterPresent,
            self.connections.len(),
        );
        if self.assignments[key] == Some(id) {
            self.assignments[key] = None;
        }
        self.active_channels = self.active_channels.saturating_sub(1);
        trace!(channel = %id, active = self.active_channels, "Channel released");
    }

    /// Channel assigned to a connection, regular or forced TesterPresent
    pub fn assigned(&self, connection: ConnectionId, tester_present: bool) -> Option<ChannelId> {
        self.assignments
            .get(assignment_key(connection, tester_present, self.connections.len()))
            .copied()
            .flatten()
    }
}
