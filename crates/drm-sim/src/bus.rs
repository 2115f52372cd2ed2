//! Simulated diagnostic bus
//!
//! Implements the transport side of the request manager in-process. Requests
//! handed to `transmit` are pulled and confirmed on the next pump; every
//! addressed ECU then schedules its answer frames, which are delivered
//! through the reception callbacks once they are due.

use std::collections::{HashMap, HashSet, VecDeque};

use drm_core::transport::{Transport, TransportError};
use drm_core::uds::{positive_response_sid, service_id, SUPPRESS_POSITIVE_RESPONSE};
use drm_core::{PduId, RequestManager};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::{Behaviour, SimConfig};

/// Services whose second byte is a sub-function carrying the SPRMIB
fn has_sub_function(sid: u8) -> bool {
    matches!(
        sid,
        service_id::DIAGNOSTIC_SESSION_CONTROL
            | service_id::ECU_RESET
            | service_id::READ_DTC_INFO
            | service_id::SECURITY_ACCESS
            | service_id::COMMUNICATION_CONTROL
            | service_id::ROUTINE_CONTROL
            | service_id::TESTER_PRESENT
            | service_id::CONTROL_DTC_SETTING
    )
}

/// Negative responses an ECU keeps to itself for functionally addressed requests
fn is_quiet_when_functional(nrc: u8) -> bool {
    matches!(nrc, 0x11 | 0x12 | 0x31 | 0x7E | 0x7F)
}

#[derive(Debug, Clone)]
struct SimulatedEcu {
    name: String,
    rx_pdu: PduId,
    behaviour: Behaviour,
    delay_ticks: u64,
    data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    due: u64,
    rx_pdu: PduId,
    bytes: Vec<u8>,
}

impl SimulatedEcu {
    fn positive_response(&self, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        let mut response = Vec::with_capacity(request.len() + self.data.len());
        response.push(positive_response_sid(sid));
        response.extend_from_slice(&request[1..]);
        if has_sub_function(sid) {
            if let Some(sub) = response.get_mut(1) {
                *sub &= !SUPPRESS_POSITIVE_RESPONSE;
            }
        }
        response.extend_from_slice(&self.data);
        response
    }

    /// Frames the ECU sends in reply to `request`, received at tick `now`
    fn answer(&self, request: &[u8], now: u64, functional: bool) -> Vec<Frame> {
        let Some(&sid) = request.first() else {
            return Vec::new();
        };
        let suppressed = has_sub_function(sid)
            && request
                .get(1)
                .is_some_and(|sub| sub & SUPPRESS_POSITIVE_RESPONSE != 0);
        let frame = |step: u64, bytes: Vec<u8>| Frame {
            due: now + step * self.delay_ticks,
            rx_pdu: self.rx_pdu,
            bytes,
        };

        match self.behaviour {
            Behaviour::Silent => Vec::new(),
            Behaviour::Respond | Behaviour::Pending { .. } if suppressed => Vec::new(),
            Behaviour::Negative { nrc } if functional && is_quiet_when_functional(nrc) => {
                Vec::new()
            }
            Behaviour::Respond => vec![frame(1, self.positive_response(request))],
            Behaviour::Pending { count } => {
                let count = u64::from(count);
                (1..=count)
                    .map(|step| frame(step, vec![service_id::NEGATIVE_RESPONSE, sid, 0x78]))
                    .chain(std::iter::once(frame(
                        count + 1,
                        self.positive_response(request),
                    )))
                    .collect()
            }
            Behaviour::Negative { nrc } => {
                vec![frame(1, vec![service_id::NEGATIVE_RESPONSE, sid, nrc])]
            }
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    now: u64,
    outgoing: VecDeque<(PduId, usize)>,
    scheduled: Vec<Frame>,
}

/// In-process bus with scripted ECUs
pub struct SimulatedBus {
    state: Mutex<BusState>,
    /// ECUs keyed by the transmit PDU of their connection
    ecus: HashMap<PduId, SimulatedEcu>,
    functional_pdus: HashSet<PduId>,
}

impl SimulatedBus {
    pub fn new(config: &SimConfig) -> Self {
        let tick_ms = config.drm.tick_ms.max(1);
        let ecus = config
            .ecus
            .iter()
            .filter_map(|ecu| {
                let conn = config
                    .drm
                    .connections
                    .iter()
                    .find(|c| c.name == ecu.connection)?;
                let rx_pdu = PduId(conn.rx_pdu?);
                let sim = SimulatedEcu {
                    name: ecu.connection.clone(),
                    rx_pdu,
                    behaviour: ecu.behaviour,
                    delay_ticks: ecu.response_delay_ms.div_ceil(tick_ms).max(1),
                    data: hex::decode(&ecu.data).unwrap_or_default(),
                };
                Some((PduId(conn.tx_pdu), sim))
            })
            .collect();
        let functional_pdus = config
            .drm
            .connections
            .iter()
            .filter(|c| c.functional)
            .map(|c| PduId(c.tx_pdu))
            .collect();

        Self {
            state: Mutex::new(BusState::default()),
            ecus,
            functional_pdus,
        }
    }

    /// Number of frames waiting to be delivered
    pub fn pending_frames(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    /// Advance the bus by one tick: move queued requests and due responses
    pub fn pump(&self, drm: &RequestManager) {
        let outgoing: Vec<_> = {
            let mut st = self.state.lock();
            st.now += 1;
            st.outgoing.drain(..).collect()
        };

        for (pdu, length) in outgoing {
            let mut request = vec![0u8; length];
            if let Err(e) = drm.copy_tx_data(pdu, &mut request) {
                warn!(%pdu, error = %e, "Request could not be copied");
                drm.tx_confirmation(pdu, Err(TransportError::TxFailed));
                continue;
            }
            drm.tx_confirmation(pdu, Ok(()));
            trace!(%pdu, request = %hex::encode(&request), "Request on bus");

            let functional = self.functional_pdus.contains(&pdu);
            let targets: Vec<&SimulatedEcu> = if functional {
                self.ecus.values().collect()
            } else {
                self.ecus.get(&pdu).into_iter().collect()
            };
            let mut st = self.state.lock();
            let now = st.now;
            for ecu in targets {
                let frames = ecu.answer(&request, now, functional);
                debug!(ecu = %ecu.name, frames = frames.len(), "ECU answering");
                st.scheduled.extend(frames);
            }
        }

        let due: Vec<Frame> = {
            let mut st = self.state.lock();
            let now = st.now;
            let (due, later): (Vec<Frame>, Vec<Frame>) = std::mem::take(&mut st.scheduled)
                .into_iter()
                .partition(|frame| frame.due <= now);
            st.scheduled = later;
            due
        };
        for frame in due {
            deliver(drm, frame);
        }
    }
}

fn deliver(drm: &RequestManager, frame: Frame) {
    match drm.start_of_reception(frame.rx_pdu, frame.bytes.len()) {
        Ok(_) => {
            let result = drm
                .copy_rx_data(frame.rx_pdu, &frame.bytes)
                .map(|_| ())
                .map_err(|_| TransportError::RxFailed);
            trace!(pdu = %frame.rx_pdu, response = %hex::encode(&frame.bytes), "Response on bus");
            drm.rx_indication(frame.rx_pdu, result);
        }
        Err(e) => debug!(pdu = %frame.rx_pdu, error = %e, "Response not accepted"),
    }
}

impl Transport for SimulatedBus {
    fn transmit(&self, pdu: PduId, length: usize) -> Result<(), TransportError> {
        self.state.lock().outgoing.push_back((pdu, length));
        Ok(())
    }

    fn cancel_transmit(&self, pdu: PduId) -> Result<(), TransportError> {
        debug!(%pdu, "Transmission cancelled");
        self.state.lock().outgoing.retain(|(queued, _)| *queued != pdu);
        Ok(())
    }

    fn cancel_receive(&self, pdu: PduId) -> Result<(), TransportError> {
        debug!(%pdu, "Reception cancelled");
        self.state.lock().scheduled.retain(|frame| frame.rx_pdu != pdu);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ecu(behaviour: Behaviour) -> SimulatedEcu {
        SimulatedEcu {
            name: "engine".to_string(),
            rx_pdu: PduId(0x20),
            behaviour,
            delay_ticks: 2,
            data: vec![0xAB],
        }
    }

    #[test]
    fn test_positive_answer_echoes_request() {
        let frames = ecu(Behaviour::Respond).answer(&[0x22, 0xF1, 0x90], 10, false);
        assert_eq!(
            frames,
            vec![Frame {
                due: 12,
                rx_pdu: PduId(0x20),
                bytes: vec![0x62, 0xF1, 0x90, 0xAB],
            }]
        );
    }

    #[test]
    fn test_suppressed_request_gets_no_answer() {
        assert!(ecu(Behaviour::Respond).answer(&[0x3E, 0x80], 0, false).is_empty());
        // a negative response is still sent
        let frames = ecu(Behaviour::Negative { nrc: 0x22 }).answer(&[0x3E, 0x80], 0, false);
        assert_eq!(frames[0].bytes, vec![0x7F, 0x3E, 0x22]);
    }

    #[test]
    fn test_functional_request_out_of_range_stays_quiet() {
        let ecu = ecu(Behaviour::Negative { nrc: 0x31 });
        assert!(ecu.answer(&[0x22, 0xF1, 0x90], 0, true).is_empty());
        assert_eq!(ecu.answer(&[0x22, 0xF1, 0x90], 0, false).len(), 1);
    }

    #[test]
    fn test_pending_then_positive() {
        let frames = ecu(Behaviour::Pending { count: 2 }).answer(&[0x31, 0x01, 0xFF, 0x00], 0, false);
        let dues: Vec<u64> = frames.iter().map(|f| f.due).collect();
        assert_eq!(dues, vec![2, 4, 6]);
        assert_eq!(frames[0].bytes, vec![0x7F, 0x31, 0x78]);
        assert_eq!(frames[2].bytes, vec![0x71, 0x01, 0xFF, 0x00, 0xAB]);
    }
}
