//! Timer engine
//!
//! All timers count driver ticks. Request delay timers hold channels in
//! `WaitDelay`; P2 timers bound the wait for a response. A running
//! functional request shares one P2 window across every active channel so
//! the broadcast closes only after the slowest ECU.

use tracing::debug;

use crate::state::{DelayPolicy, DrmState};
use crate::types::{ChannelId, ChannelState, ConnectionId, DrmMode, ResponseCode};

/// Request delay counters
#[derive(Debug)]
pub(crate) struct TimerBank {
    /// Per connection, separation-time scheme
    pub separation: Vec<u32>,
    /// Per connection, functional-only delay
    pub functional: Vec<u32>,
    /// Shared counter of the global scheme
    pub global: u32,
    /// Round-robin position of the global scheme over assignment keys
    pub next_key: usize,
}

impl TimerBank {
    pub fn new(connections: usize) -> Self {
        Self {
            separation: vec![0; connections],
            functional: vec![0; connections],
            global: 0,
            next_key: 0,
        }
    }
}

fn count_down(timer: &mut u32) -> bool {
    *timer = timer.saturating_sub(1);
    *timer == 0
}

impl DrmState {
    /// Connection gated by the functional-only delay instead of the physical scheme
    fn functional_gated(&self, connection: ConnectionId) -> bool {
        self.settings.functional_delay.is_some() && self.connection(connection).functional
    }

    /// State a freshly admitted channel starts in
    pub fn initial_state(&self, connection: ConnectionId) -> ChannelState {
        if self.functional_gated(connection) {
            return ChannelState::WaitDelay;
        }
        match self.settings.delay {
            DelayPolicy::None => ChannelState::RequestStart,
            DelayPolicy::SeparationTime | DelayPolicy::Global { .. } => ChannelState::WaitDelay,
        }
    }

    pub fn run_timers(&mut self) {
        self.run_delay_timers();
        self.run_p2_timers();
    }

    fn run_delay_timers(&mut self) {
        if self.settings.functional_delay.is_some() {
            for index in 0..self.connections.len() {
                if self.connections[index].functional && count_down(&mut self.timers.functional[index]) {
                    self.release_waiting(ConnectionId(index as u16));
                }
            }
        }

        match self.settings.delay {
            DelayPolicy::None => {}
            DelayPolicy::SeparationTime => {
                for index in 0..self.connections.len() {
                    let connection = ConnectionId(index as u16);
                    if !self.functional_gated(connection)
                        && count_down(&mut self.timers.separation[index])
                    {
                        self.release_waiting(connection);
                    }
                }
            }
            DelayPolicy::Global { reload } => {
                if count_down(&mut self.timers.global) {
                    if let Some(id) = self.next_waiting() {
                        self.channels[id.index()].state = ChannelState::RequestStart;
                        self.timers.global = reload;
                        debug!(channel = %id, "Global delay elapsed");
                    }
                }
            }
        }
    }

    /// Move every channel of `connection` out of `WaitDelay`
    fn release_waiting(&mut self, connection: ConnectionId) {
        for tester_present in [false, true] {
            if let Some(id) = self.assigned(connection, tester_present) {
                let ch = &mut self.channels[id.index()];
                if ch.state == ChannelState::WaitDelay {
                    ch.state = ChannelState::RequestStart;
                }
            }
        }
    }

    /// Next waiting channel in round-robin order, global scheme only
    fn next_waiting(&mut self) -> Option<ChannelId> {
        let keys = self.assignments.len();
        for step in 0..keys {
            let key = (self.timers.next_key + step) % keys;
            let Some(id) = self.assignments[key] else {
                continue;
            };
            let ch = &self.channels[id.index()];
            if ch.state == ChannelState::WaitDelay && !self.functional_gated(ch.connection) {
                self.timers.next_key = (key + 1) % keys;
                return Some(id);
            }
        }
        None
    }

    fn run_p2_timers(&mut self) {
        for (index, ch) in self.channels.iter_mut().enumerate() {
            if ch.state != ChannelState::WaitResponse {
                continue;
            }
            if !count_down(&mut ch.p2_timer) {
                continue;
            }
            let conn = &self.connections[ch.connection.index()];
            // A suppressed positive response never arrives; silence until
            // P2 is success as long as no response pending came in between.
            let silent_success = ch.suppress_positive_response
                && ch.rcrrp_counter == conn.max_rcrrp
                && !conn.functional;
            if !silent_success {
                ch.response_code = ResponseCode::Timeout;
            }
            ch.state = ChannelState::CloseChannel;
            debug!(channel = index, connection = %ch.connection, code = %ch.response_code, "P2 expired");
        }
    }

    /// Restart P2 after a request left the transport or a response pending.
    ///
    /// During a functional request every active channel is reloaded with the
    /// same value, P2* if any of them has seen a response pending.
    pub fn reload_p2(&mut self, id: ChannelId, response_pending: bool) {
        if self.mode != DrmMode::FunctionalRequestActive {
            let ch = &mut self.channels[id.index()];
            let conn = &self.connections[ch.connection.index()];
            ch.p2_timer = if response_pending { conn.p2_extended } else { conn.p2 };
            return;
        }

        let extended = response_pending
            || self.channels.iter().any(|ch| {
                ch.state.is_active()
                    && ch.rcrrp_counter != self.connections[ch.connection.index()].max_rcrrp
            });
        for ch in self.channels.iter_mut().filter(|ch| ch.state.is_active()) {
            let conn = &self.connections[ch.connection.index()];
            ch.p2_timer = if extended { conn.p2_extended } else { conn.p2 };
        }
    }

    /// Restart the request delay of a connection whose channel just closed
    pub fn reload_delay(&mut self, connection: ConnectionId) {
        let index = connection.index();
        if self.functional_gated(connection) {
            self.timers.functional[index] = self.settings.functional_delay.unwrap_or(0);
        } else if self.settings.delay == DelayPolicy::SeparationTime {
            self.timers.separation[index] = self.connections[index].separation;
        }
    }

    /// A request left the transport: the global gap starts now
    pub fn arm_request_delay(&mut self) {
        if let DelayPolicy::Global { reload } = self.settings.delay {
            self.timers.global = reload;
        }
    }
}
