//! Mode arbitration, cancellation, firewall and the channel pool

mod common;

use std::collections::HashSet;

use common::{vehicle_config, Recorder, TestBus, ALL, BODY, ENGINE, TRANSMISSION};
use drm_core::config::ConnectionConfig;
use drm_core::transport::mock::TransportCall;
use drm_core::{
    BufReqError, CancelError, ChannelState, ConnectionId, DrmConfig, DrmMode, PduId,
    ResponseCode, SubmitError,
};
use pretty_assertions::assert_eq;

#[test]
fn test_external_tester_closes_channels() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    bus.drm.set_external_tester_present(true);
    assert_eq!(bus.drm.mode(), Ok(DrmMode::ExternalTesterPresent));
    assert_eq!(
        bus.drm.read_data_by_identifier(BODY, 0xF190, rec.notify()),
        Err(SubmitError::TesterActive)
    );

    bus.tick();
    assert_eq!(rec.codes(), vec![ResponseCode::ChannelsClosed]);
    // The ECU answer arrives too late
    assert_eq!(
        bus.respond(ENGINE, &[0x62, 0xF1, 0x90]),
        Err(BufReqError::NotOk)
    );
}

#[test]
fn test_tester_absence_waits_for_idle_channels() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();

    bus.drm.set_external_tester_present(true);
    bus.drm.set_external_tester_present(false);
    assert_eq!(bus.drm.mode(), Ok(DrmMode::ExternalTesterPresent));

    // The closed channel is only freed at the end of this tick
    bus.tick();
    assert_eq!(bus.drm.mode(), Ok(DrmMode::ExternalTesterPresent));
    bus.tick();
    assert_eq!(bus.drm.mode(), Ok(DrmMode::Run));

    bus.drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
}

#[test]
fn test_tester_presence_cancels_absence_request() {
    let bus = TestBus::new(vehicle_config());
    bus.drm.set_external_tester_present(true);
    bus.drm.set_external_tester_present(false);
    bus.drm.set_external_tester_present(true);
    bus.ticks(3);
    assert_eq!(bus.drm.mode(), Ok(DrmMode::ExternalTesterPresent));
}

#[test]
fn test_cancel_aborts_transmission() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    let channel = bus
        .drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
    bus.tick();
    assert_eq!(bus.drm.channel_state(channel), Ok(ChannelState::RequestProcessing));

    bus.drm.cancel(ENGINE).unwrap();
    assert!(bus
        .transport
        .calls()
        .contains(&TransportCall::CancelTransmit(PduId(0x10))));
    assert_eq!(bus.drm.copy_tx_data(PduId(0x10), &mut [0u8; 3]), Err(BufReqError::NotOk));

    bus.tick();
    assert_eq!(rec.codes(), vec![ResponseCode::ChannelsClosed]);
    assert_eq!(bus.drm.cancel(ENGINE), Err(CancelError::NotAssigned));
}

#[test]
fn test_cancel_before_transmission() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .read_data_by_identifier(TRANSMISSION, 0xF190, rec.notify())
        .unwrap();
    bus.drm.cancel(TRANSMISSION).unwrap();
    bus.tick();

    assert!(bus.transport.calls().is_empty());
    assert_eq!(rec.codes(), vec![ResponseCode::ChannelsClosed]);
}

#[test]
fn test_firewall_blocks_unlisted_services() {
    let mut config = vehicle_config();
    config.firewall = true;
    config.connections[2].allowed_services = Some(vec![0x10, 0x22, 0x3E]);
    let bus = TestBus::new(config);
    let rec = Recorder::new();

    assert_eq!(
        bus.drm.ecu_reset(BODY, 0x01, false, rec.notify()),
        Err(SubmitError::FirewallBlocked(0x11))
    );
    bus.drm
        .read_data_by_identifier(BODY, 0xF190, rec.notify())
        .unwrap();
    // Unrestricted connections accept every known service
    bus.drm.ecu_reset(ENGINE, 0x01, false, rec.notify()).unwrap();
}

#[test]
fn test_firewall_off_ignores_service_lists() {
    let mut config = vehicle_config();
    config.connections[2].allowed_services = Some(vec![0x22]);
    let bus = TestBus::new(config);
    let rec = Recorder::new();
    bus.drm.ecu_reset(BODY, 0x01, false, rec.notify()).unwrap();
}

#[test]
fn test_channel_pool_limits() {
    let mut config = vehicle_config();
    config.application_channels = 2;
    let bus = TestBus::new(config);
    let rec = Recorder::new();

    bus.drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
    assert_eq!(
        bus.drm.read_data_by_identifier(ENGINE, 0xF190, rec.notify()),
        Err(SubmitError::ConnectionBusy)
    );
    bus.drm
        .read_data_by_identifier(TRANSMISSION, 0xF190, rec.notify())
        .unwrap();
    assert_eq!(
        bus.drm.read_data_by_identifier(BODY, 0xF190, rec.notify()),
        Err(SubmitError::NoChannel)
    );

    // Functional requests have their own channel
    bus.drm
        .read_data_by_identifier(ALL, 0xF190, rec.notify())
        .unwrap();
    assert_eq!(bus.drm.active_channels(), Ok(3));
}

const ECU_COUNT: u16 = 8;

/// Eight physical ECUs with a channel each
fn eight_ecu_bus() -> TestBus {
    let connections: Vec<ConnectionConfig> = (0..ECU_COUNT)
        .map(|i| ConnectionConfig::physical(&format!("ecu{i}"), 0x100 + i, 0x200 + i))
        .collect();
    TestBus::new(DrmConfig {
        application_channels: ECU_COUNT as usize,
        connections,
        ..Default::default()
    })
}

/// Submit a read on every ECU and put the requests on the wire
fn read_all(bus: &TestBus, rec: &Recorder) {
    for i in 0..ECU_COUNT {
        bus.drm
            .read_data_by_identifier(ConnectionId(i), 0xF190, rec.notify())
            .unwrap();
    }
    bus.tick();
    assert_eq!(bus.take_sent().len(), ECU_COUNT as usize);
}

/// Every request got exactly one final notification with an allowed code
fn assert_one_final_each(rec: &Recorder, allowed: &[ResponseCode]) {
    let finals = rec.finals();
    for i in 0..ECU_COUNT {
        let mine: Vec<_> = finals.iter().filter(|n| n.connection == ConnectionId(i)).collect();
        assert_eq!(mine.len(), 1, "ecu{i}");
        let code = mine[0].code().unwrap();
        assert!(allowed.contains(&code), "ecu{i} closed with {code:?}");
    }
}

#[test]
fn test_cancel_races_completion() {
    let bus = eight_ecu_bus();
    let rec = Recorder::new();
    read_all(&bus, &rec);

    std::thread::scope(|s| {
        for i in 0..ECU_COUNT {
            let bus = &bus;
            s.spawn(move || {
                let _ = bus.respond(ConnectionId(i), &[0x62, 0xF1, 0x90, i as u8]);
            });
            s.spawn(move || {
                let _ = bus.drm.cancel(ConnectionId(i));
            });
        }
        s.spawn(|| bus.ticks(3));
    });

    bus.tick();
    assert_one_final_each(&rec, &[ResponseCode::Positive, ResponseCode::ChannelsClosed]);
    assert_eq!(bus.drm.active_channels(), Ok(0));

    // No connection is left holding a channel
    for i in 0..ECU_COUNT {
        assert_eq!(bus.drm.assigned_channel(ConnectionId(i)), None);
    }
    let again = Recorder::new();
    read_all(&bus, &again);
}

#[test]
fn test_external_tester_races_completion() {
    let bus = eight_ecu_bus();
    let rec = Recorder::new();
    read_all(&bus, &rec);

    std::thread::scope(|s| {
        for i in 0..ECU_COUNT {
            let bus = &bus;
            s.spawn(move || {
                let _ = bus.respond(ConnectionId(i), &[0x62, 0xF1, 0x90, i as u8]);
            });
        }
        s.spawn(|| bus.drm.set_external_tester_present(true));
    });

    bus.tick();
    assert_one_final_each(&rec, &[ResponseCode::Positive, ResponseCode::ChannelsClosed]);
    assert_eq!(bus.drm.active_channels(), Ok(0));
    assert_eq!(bus.drm.mode(), Ok(DrmMode::ExternalTesterPresent));

    // Nothing is reported twice on later ticks
    bus.ticks(10);
    assert_eq!(rec.finals().len(), ECU_COUNT as usize);
}

#[test]
fn test_concurrent_submission_and_callbacks() {
    let bus = eight_ecu_bus();
    let rec = Recorder::new();

    let channels: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let (drm, notify) = (&bus.drm, rec.notify());
                s.spawn(move || drm.read_data_by_identifier(ConnectionId(i), 0xF190, notify))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    });
    let distinct: HashSet<_> = channels.iter().collect();
    assert_eq!(distinct.len(), 8);

    bus.tick();
    assert_eq!(bus.transport.transmissions().len(), 8);

    std::thread::scope(|s| {
        for i in 0..8u16 {
            let drm = &bus.drm;
            s.spawn(move || {
                let (tx, rx) = (PduId(0x100 + i), PduId(0x200 + i));
                let mut request = [0u8; 3];
                drm.copy_tx_data(tx, &mut request).unwrap();
                drm.tx_confirmation(tx, Ok(()));
                let response = [0x62, 0xF1, 0x90, i as u8];
                drm.start_of_reception(rx, response.len()).unwrap();
                drm.copy_rx_data(rx, &response).unwrap();
                drm.rx_indication(rx, Ok(()));
            });
        }
    });

    bus.tick();
    let finals = rec.finals();
    assert_eq!(finals.len(), 8);
    for n in &finals {
        assert_eq!(n.code(), Some(ResponseCode::Positive));
        assert_eq!(n.response()[3], n.connection.0 as u8);
    }
    assert_eq!(bus.drm.active_channels(), Ok(0));
}
