//! Physical request protocol: timing, response pending and response decoding

mod common;

use common::{vehicle_config, Recorder, TestBus, BODY, ENGINE};
use drm_core::{
    BufReqError, ChannelState, DiagRequest, NegativeResponseCode, NotificationKind, PduId,
    ResponseCode,
};
use pretty_assertions::assert_eq;
use rstest::rstest;

#[test]
fn test_read_vin_round_trip() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    let channel = bus
        .drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();

    bus.tick();
    assert_eq!(bus.take_sent(), vec![(ENGINE, vec![0x22, 0xF1, 0x90])]);
    assert_eq!(bus.drm.channel_state(channel), Ok(ChannelState::WaitResponse));

    let vin = b"WVGZZZ1KZBW000001";
    let mut response = vec![0x62, 0xF1, 0x90];
    response.extend_from_slice(vin);
    bus.respond(ENGINE, &response).unwrap();
    bus.tick();

    let finals = rec.finals();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].connection, ENGINE);
    assert_eq!(finals[0].service_id, 0x22);
    assert_eq!(finals[0].code(), Some(ResponseCode::Positive));
    assert_eq!(&finals[0].response()[3..], vin);
    assert_eq!(bus.drm.active_channels(), Ok(0));
}

#[test]
fn test_silence_times_out_after_p2() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    bus.ticks(4);
    assert!(rec.finals().is_empty());
    bus.tick();
    assert_eq!(rec.codes(), vec![ResponseCode::Timeout]);
}

#[test]
fn test_response_pending_extends_to_p2_star() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .routine_control(ENGINE, 0x01, 0xFF00, &[], false, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    bus.ticks(3);
    bus.respond(ENGINE, &[0x7F, 0x31, 0x78]).unwrap();
    assert_eq!(rec.pending_count(), 1);

    // P2* (10 ticks) now bounds the wait
    bus.ticks(9);
    assert!(rec.finals().is_empty());
    bus.respond(ENGINE, &[0x71, 0x01, 0xFF, 0x00, 0x00]).unwrap();
    bus.tick();
    assert_eq!(rec.codes(), vec![ResponseCode::Positive]);
}

#[test]
fn test_response_pending_budget() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    // Default budget is two retries
    bus.respond(ENGINE, &[0x7F, 0x22, 0x78]).unwrap();
    bus.respond(ENGINE, &[0x7F, 0x22, 0x78]).unwrap();
    assert_eq!(rec.pending_count(), 2);
    bus.respond(ENGINE, &[0x7F, 0x22, 0x78]).unwrap();
    bus.tick();

    assert_eq!(rec.codes(), vec![ResponseCode::RcrrpLimitReached]);
    assert_eq!(rec.pending_count(), 2);
}

#[test]
fn test_response_pending_disabled() {
    let mut config = vehicle_config();
    config.connections[0].max_rcrrp = 0;
    let bus = TestBus::new(config);
    let rec = Recorder::new();
    bus.drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    bus.respond(ENGINE, &[0x7F, 0x22, 0x78]).unwrap();
    bus.tick();
    assert_eq!(rec.codes(), vec![ResponseCode::RcrrpLimitReached]);
    assert_eq!(rec.pending_count(), 0);
}

#[test]
fn test_pending_not_forwarded_when_disabled() {
    let mut config = vehicle_config();
    config.forward_response_pending = false;
    let bus = TestBus::new(config);
    let rec = Recorder::new();
    bus.drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    bus.respond(ENGINE, &[0x7F, 0x22, 0x78]).unwrap();
    bus.respond(ENGINE, &[0x62, 0xF1, 0x90, 0x00]).unwrap();
    bus.tick();
    assert_eq!(rec.all().len(), 1);
    assert_eq!(rec.codes(), vec![ResponseCode::Positive]);
}

#[test]
fn test_transmission_complete_notification() {
    let mut config = vehicle_config();
    config.notify_transmission_complete = true;
    let bus = TestBus::new(config);
    let rec = Recorder::new();
    bus.drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    assert_eq!(rec.all()[0].kind, NotificationKind::TransmissionComplete);
}

#[test]
fn test_suppressed_positive_response_silence_is_success() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .diagnostic_session_control(ENGINE, 0x03, true, rec.notify())
        .unwrap();
    bus.tick();
    assert_eq!(bus.take_sent(), vec![(ENGINE, vec![0x10, 0x83])]);

    bus.ticks(5);
    let finals = rec.finals();
    assert_eq!(finals[0].code(), Some(ResponseCode::Positive));
    assert!(finals[0].response().is_empty());
}

#[test]
fn test_suppressed_request_still_reports_negative() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .diagnostic_session_control(ENGINE, 0x02, true, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    bus.respond(ENGINE, &[0x7F, 0x10, 0x22]).unwrap();
    bus.tick();
    assert_eq!(
        rec.codes(),
        vec![ResponseCode::Negative(NegativeResponseCode::CONDITIONS_NOT_CORRECT)]
    );
}

#[test]
fn test_suppressed_request_after_pending_needs_an_answer() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .ecu_reset(ENGINE, 0x01, true, rec.notify())
        .unwrap();
    bus.tick();
    assert_eq!(bus.take_sent(), vec![(ENGINE, vec![0x11, 0x81])]);

    bus.respond(ENGINE, &[0x7F, 0x11, 0x78]).unwrap();
    bus.ticks(10);
    assert_eq!(rec.codes(), vec![ResponseCode::Timeout]);
}

#[rstest]
#[case::negative(&[0x7F, 0x22, 0x31], ResponseCode::Negative(NegativeResponseCode::REQUEST_OUT_OF_RANGE))]
#[case::nrc_too_long(&[0x7F, 0x22, 0x31, 0x00], ResponseCode::InvalidNrcLength)]
#[case::nrc_for_other_service(&[0x7F, 0x2E, 0x31], ResponseCode::WrongService)]
#[case::unexpected_service(&[0x6E, 0xF1, 0x90], ResponseCode::WrongService)]
fn test_response_decoding(#[case] response: &[u8], #[case] expected: ResponseCode) {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .read_data_by_identifier(BODY, 0xF190, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    bus.respond(BODY, response).unwrap();
    bus.tick();
    assert_eq!(rec.codes(), vec![expected]);
}

#[test]
fn test_response_larger_than_buffer() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    let request = DiagRequest::new(ENGINE, &[0xF1, 0x90])
        .with_header(&[0x22])
        .response_capacity(4);
    bus.drm.submit(request, rec.notify()).unwrap();
    bus.tick();
    bus.take_sent();

    assert_eq!(
        bus.respond(ENGINE, &[0x62, 0xF1, 0x90, 0x01, 0x02]),
        Err(BufReqError::Overflow)
    );
    bus.tick();
    assert_eq!(rec.codes(), vec![ResponseCode::BufferTooSmall]);
}

#[test]
fn test_late_response_is_ignored() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();
    bus.ticks(5);
    assert_eq!(rec.codes(), vec![ResponseCode::Timeout]);

    assert_eq!(
        bus.respond(ENGINE, &[0x62, 0xF1, 0x90]),
        Err(BufReqError::NotOk)
    );
    assert_eq!(rec.finals().len(), 1);
}

#[test]
fn test_empty_reception_closes_at_once() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    let channel = bus
        .drm
        .read_data_by_identifier(ENGINE, 0xF190, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    assert_eq!(
        bus.drm.start_of_reception(PduId(0x20), 0),
        Err(BufReqError::NotOk)
    );
    assert_eq!(bus.drm.channel_state(channel), Ok(ChannelState::CloseChannel));
    bus.tick();
    assert_eq!(rec.codes(), vec![ResponseCode::Timeout]);
    assert_eq!(bus.drm.active_channels(), Ok(0));
}

#[test]
fn test_empty_reception_keeps_suppressed_outcome() {
    let bus = TestBus::new(vehicle_config());
    let rec = Recorder::new();
    bus.drm
        .ecu_reset(ENGINE, 0x01, true, rec.notify())
        .unwrap();
    bus.tick();
    bus.take_sent();

    bus.respond(ENGINE, &[0x7F, 0x11, 0x78]).unwrap();
    assert_eq!(
        bus.drm.start_of_reception(PduId(0x20), 0),
        Err(BufReqError::NotOk)
    );
    bus.tick();
    assert_eq!(rec.codes(), vec![ResponseCode::Positive]);
    assert_eq!(rec.pending_count(), 1);
}
