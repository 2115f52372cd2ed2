//! Shared harness for the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use drm_core::config::ConnectionConfig;
use drm_core::transport::mock::RecordingTransport;
use drm_core::{
    BufReqError, ConnectionId, DiscoveryStore, DrmConfig, Notification, NotificationKind,
    NotifyFn, PduId, RequestManager, ResponseCode,
};
use parking_lot::Mutex;

pub const ENGINE: ConnectionId = ConnectionId(0);
pub const TRANSMISSION: ConnectionId = ConnectionId(1);
pub const BODY: ConnectionId = ConnectionId(2);
pub const ALL: ConnectionId = ConnectionId(3);

static TRACING: Once = Once::new();

/// Log to the test output when `RUST_LOG` is set
pub fn init_tracing() {
    TRACING.call_once(|| {
        if std::env::var_os("RUST_LOG").is_some() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        }
    });
}

/// Three physical ECUs and one functional target, 10 ms ticks.
///
/// P2 is 5 ticks and P2* 10 ticks on every connection.
pub fn vehicle_config() -> DrmConfig {
    let connection = |mut cfg: ConnectionConfig| {
        cfg.p2_ms = 50;
        cfg.p2_extended_ms = 100;
        cfg
    };
    DrmConfig {
        tick_ms: 10,
        application_channels: 3,
        connections: vec![
            connection(ConnectionConfig::physical("engine", 0x10, 0x20)),
            connection(ConnectionConfig::physical("transmission", 0x11, 0x21)),
            connection(ConnectionConfig::physical("body", 0x12, 0x22)),
            connection(ConnectionConfig::functional("all", 0x1F)),
        ],
        ..Default::default()
    }
}

/// Collects the notifications of one or more requests
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) -> NotifyFn {
        let seen = Arc::clone(&self.seen);
        Arc::new(move |n: &Notification| seen.lock().push(n.clone()))
    }

    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    pub fn finals(&self) -> Vec<Notification> {
        self.seen.lock().iter().filter(|n| n.is_final()).cloned().collect()
    }

    pub fn codes(&self) -> Vec<ResponseCode> {
        self.seen.lock().iter().filter_map(Notification::code).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|n| n.kind == NotificationKind::ResponsePending)
            .count()
    }
}

/// Request manager on a recording transport, with the test as the bus
pub struct TestBus {
    pub drm: RequestManager,
    pub transport: Arc<RecordingTransport>,
    handled: AtomicUsize,
}

impl TestBus {
    pub fn new(config: DrmConfig) -> Self {
        init_tracing();
        let transport = Arc::new(RecordingTransport::new());
        let drm = RequestManager::new(config, transport.clone()).expect("valid config");
        Self {
            drm,
            transport,
            handled: AtomicUsize::new(0),
        }
    }

    pub fn with_store(config: DrmConfig, store: Arc<dyn DiscoveryStore>) -> Self {
        let mut bus = Self::new(config);
        bus.drm = bus.drm.with_store(store);
        bus
    }

    pub fn tick(&self) {
        self.drm.tick();
    }

    pub fn ticks(&self, count: usize) {
        for _ in 0..count {
            self.drm.tick();
        }
    }

    fn connection_of_tx(&self, pdu: PduId) -> ConnectionId {
        self.drm
            .connections()
            .iter()
            .find(|c| c.tx_pdu == pdu)
            .map(|c| c.id)
            .expect("known tx pdu")
    }

    fn rx_pdu(&self, connection: ConnectionId) -> PduId {
        self.drm.connections()[connection.index()]
            .rx_pdu
            .expect("connection has an rx pdu")
    }

    /// Pull and confirm every request handed to the transport since the
    /// last call
    pub fn take_sent(&self) -> Vec<(ConnectionId, Vec<u8>)> {
        let transmissions = self.transport.transmissions();
        let start = self.handled.swap(transmissions.len(), Ordering::SeqCst);
        transmissions[start..]
            .iter()
            .map(|&(pdu, length)| {
                let mut request = vec![0u8; length];
                self.drm
                    .copy_tx_data(pdu, &mut request)
                    .expect("request copied");
                self.drm.tx_confirmation(pdu, Ok(()));
                (self.connection_of_tx(pdu), request)
            })
            .collect()
    }

    /// Deliver a complete response on the rx pdu of `connection`
    pub fn respond(&self, connection: ConnectionId, response: &[u8]) -> Result<(), BufReqError> {
        let pdu = self.rx_pdu(connection);
        self.drm.start_of_reception(pdu, response.len())?;
        self.drm.copy_rx_data(pdu, response)?;
        self.drm.rx_indication(pdu, Ok(()));
        Ok(())
    }

    /// Tick until `done` holds, answering every request with `ecu`.
    ///
    /// Returns the number of ticks run, or `None` if `max_ticks` passed.
    pub fn run_until(
        &self,
        max_ticks: usize,
        mut ecu: impl FnMut(ConnectionId, &[u8]) -> Option<Vec<u8>>,
        done: impl Fn(&RequestManager) -> bool,
    ) -> Option<usize> {
        for tick in 1..=max_ticks {
            self.tick();
            for (connection, request) in self.take_sent() {
                if let Some(response) = ecu(connection, &request) {
                    let _ = self.respond(connection, &response);
                }
            }
            if done(&self.drm) {
                return Some(tick);
            }
        }
        None
    }
}
