//! ECU discovery and the persisted discovery table

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{vehicle_config, Recorder, TestBus, ALL, BODY, ENGINE, TRANSMISSION};
use drm_core::{
    ConnectionId, DiscoveryError, DiscoveryState, DiscoveryTable, DrmMode, EcuStatus,
    MemoryStore, SubmitError,
};
use pretty_assertions::assert_eq;

/// Engine answers positively, transmission negatively, body never
fn ecus(connection: ConnectionId, request: &[u8]) -> Option<Vec<u8>> {
    assert_eq!(request, &[0x3E, 0x00]);
    match connection {
        ENGINE => Some(vec![0x7E, 0x00]),
        TRANSMISSION => Some(vec![0x7F, 0x3E, 0x11]),
        _ => None,
    }
}

fn finished(drm: &drm_core::RequestManager) -> bool {
    drm.discovery_state() == Ok(DiscoveryState::Finished)
}

#[test]
fn test_discovery_scan_persists_table() {
    let store = Arc::new(MemoryStore::new());
    let bus = TestBus::with_store(vehicle_config(), store.clone());

    bus.drm.start_discovery().unwrap();
    assert_eq!(bus.drm.start_discovery(), Err(DiscoveryError::AlreadyRunning));
    bus.tick();
    assert_eq!(bus.drm.discovery_state(), Ok(DiscoveryState::Busy));
    assert_eq!(bus.drm.start_discovery(), Err(DiscoveryError::AlreadyRunning));

    // An answering ECU costs three ticks (probe, send, close) and a silent
    // one waits P2 (5 ticks) after sending. The last tick persists.
    let ticks = 1 + bus.run_until(100, ecus, finished).unwrap();
    assert_eq!(ticks, 3 + 3 + (2 + 5) + 1);

    assert_eq!(bus.drm.discovery_status(ENGINE), Ok(EcuStatus::Available));
    // Any answer counts, even a negative one
    assert_eq!(bus.drm.discovery_status(TRANSMISSION), Ok(EcuStatus::Available));
    assert_eq!(bus.drm.discovery_status(BODY), Ok(EcuStatus::NotAvailable));
    // Functional targets are never probed
    assert_eq!(bus.drm.discovery_status(ALL), Ok(EcuStatus::NotDiscovered));

    // Two bits per connection, connection 0 in the low bits
    assert_eq!(store.block(), Some(vec![0b0010_0101]));
    assert_eq!(store.write_count(), 1);
    assert_eq!(bus.drm.active_channels(), Ok(0));
}

#[test]
fn test_discovery_listener_gets_final_table() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = TestBus::new(vehicle_config());
    bus.drm = bus.drm.with_discovery_listener({
        let calls = calls.clone();
        Arc::new(move |table: &DiscoveryTable| {
            assert_eq!(table.get(ENGINE), Some(EcuStatus::Available));
            calls.fetch_add(1, Ordering::SeqCst);
        })
    });

    bus.drm.start_discovery().unwrap();
    bus.run_until(100, ecus, finished).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A finished scan can be repeated
    bus.drm.start_discovery().unwrap();
    bus.run_until(100, ecus, finished).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_table_restored_from_store() {
    let store = Arc::new(MemoryStore::with_block(vec![0b0010_0101]));
    let bus = TestBus::with_store(vehicle_config(), store);
    assert_eq!(bus.drm.discovery_status(ENGINE), Ok(EcuStatus::Available));
    assert_eq!(bus.drm.discovery_status(BODY), Ok(EcuStatus::NotAvailable));
}

#[test]
fn test_mismatched_block_is_ignored() {
    let store = Arc::new(MemoryStore::with_block(vec![0b0101_0101, 0x01]));
    let bus = TestBus::with_store(vehicle_config(), store);
    assert_eq!(bus.drm.discovery_status(ENGINE), Ok(EcuStatus::NotDiscovered));
}

#[test]
fn test_functional_request_waits_for_discovery() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm.start_discovery().unwrap();
    assert_eq!(
        bus.drm.read_data_by_identifier(ALL, 0xF190, rec.notify()),
        Err(SubmitError::DiscoveryActive)
    );

    bus.run_until(100, ecus, finished).unwrap();
    bus.drm
        .read_data_by_identifier(ALL, 0xF190, rec.notify())
        .unwrap();
    assert_eq!(bus.drm.mode(), Ok(DrmMode::FunctionalRequestActive));
}

#[test]
fn test_discovery_needs_run_mode() {
    let bus = TestBus::new(vehicle_config());
    bus.drm.set_external_tester_present(true);
    assert_eq!(
        bus.drm.start_discovery(),
        Err(DiscoveryError::NotRunMode(DrmMode::ExternalTesterPresent))
    );
}

#[test]
fn test_discovery_disabled() {
    let mut config = vehicle_config();
    config.discovery = false;
    let bus = TestBus::new(config);
    assert_eq!(bus.drm.start_discovery(), Err(DiscoveryError::Disabled));
}

#[test]
fn test_external_tester_stops_discovery() {
    let bus = TestBus::new(vehicle_config());
    bus.drm.start_discovery().unwrap();
    bus.tick();
    bus.tick();
    assert_eq!(bus.take_sent(), vec![(ENGINE, vec![0x3E, 0x00])]);

    bus.drm.set_external_tester_present(true);
    assert_eq!(bus.drm.discovery_state(), Ok(DiscoveryState::Idle));
    bus.tick();
    assert_eq!(bus.drm.active_channels(), Ok(0));
    assert_eq!(bus.drm.discovery_status(ENGINE), Ok(EcuStatus::NotDiscovered));
}
