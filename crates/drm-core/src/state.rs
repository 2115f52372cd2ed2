//! State guarded by the channel manager lock
//!
//! Everything that task-context API calls and transport callbacks both
//! touch lives in [`DrmState`]: the channel array, the connection to channel
//! assignment table, the active channel counter, the global mode, timers,
//! the functional pool and the discovery scan. The allocator, timer engine,
//! state machine and discovery driver extend it from their own modules.

use std::sync::Arc;

use crate::allocator::ChannelLayout;
use crate::channel::Channel;
use crate::config::{Connection, DrmConfig, RequestDelay};
use crate::discovery::{DiscoveryEngine, DiscoveryTable};
use crate::functional::FunctionalPool;
use crate::timer::TimerBank;
use crate::types::{ChannelId, ConnectionId, DrmMode, Notification, NotifyFn, PduId};

/// Request delay scheme with durations in ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DelayPolicy {
    None,
    SeparationTime,
    Global { reload: u32 },
}

/// Behaviour switches chosen once at construction
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settings {
    pub firewall: bool,
    pub forward_response_pending: bool,
    pub notify_transmission_complete: bool,
    pub delay: DelayPolicy,
    /// Functional-only request delay in ticks
    pub functional_delay: Option<u32>,
}

/// Work produced under the lock and carried out after it is released
pub(crate) enum Deferred {
    Transmit {
        channel: ChannelId,
        generation: u32,
        pdu: PduId,
        length: usize,
    },
    CancelTransmit(PduId),
    CancelReceive(PduId),
    Notify(NotifyFn, Notification),
    Persist(Vec<u8>),
}

pub(crate) struct DrmState {
    pub mode: DrmMode,
    /// External tester left; switch back to run once every channel closed
    pub tester_absent_requested: bool,
    pub connections: Arc<[Connection]>,
    pub settings: Settings,
    pub layout: ChannelLayout,
    pub channels: Vec<Channel>,
    /// One entry per connection, then one per connection for the forced
    /// functional TesterPresent channel
    pub assignments: Vec<Option<ChannelId>>,
    pub active_channels: usize,
    pub timers: TimerBank,
    pub functional: FunctionalPool,
    /// Service id of the functional request currently collecting responses
    pub functional_service: Option<u8>,
    pub discovery: DiscoveryEngine,
}

impl DrmState {
    pub fn new(config: &DrmConfig, connections: Arc<[Connection]>, table: DiscoveryTable) -> Self {
        let layout = ChannelLayout::new(
            config.application_channels,
            config.functional_requests,
            config.discovery,
        );
        let delay = match config.delay {
            RequestDelay::None => DelayPolicy::None,
            RequestDelay::SeparationTime => DelayPolicy::SeparationTime,
            RequestDelay::Global { delay_ms } => DelayPolicy::Global {
                reload: config.ticks(delay_ms),
            },
        };
        let settings = Settings {
            firewall: config.firewall,
            forward_response_pending: config.forward_response_pending,
            notify_transmission_complete: config.notify_transmission_complete,
            delay,
            functional_delay: config.functional_delay_ms.map(|ms| config.ticks(ms)),
        };
        let count = connections.len();

        Self {
            mode: DrmMode::Run,
            tester_absent_requested: false,
            settings,
            channels: (0..layout.total()).map(|_| Channel::new()).collect(),
            layout,
            assignments: vec![None; count * 2],
            active_channels: 0,
            timers: TimerBank::new(count),
            functional: FunctionalPool::new(config.functional_buffers, config.functional_buffer_size),
            functional_service: None,
            discovery: DiscoveryEngine::new(table),
            connections,
        }
    }

    pub fn connection(&self, id: ConnectionId) -> &Connection {
        &self.connections[id.index()]
    }
}
