//! Channel protocol state machine
//!
//! Transport callbacks and the driver tick move channels through
//! `WaitDelay -> RequestStart -> RequestProcessing -> WaitResponse ->
//! ResponseProcessing -> CloseChannel -> Inactive`. Every handler here runs
//! under the channel manager lock; anything that must reach the outside
//! world is pushed as [`Deferred`] work.

use tracing::{debug, info, trace, warn};

use crate::allocator::{self, Requester};
use crate::channel::{ChannelClass, ChannelSetup, Client};
use crate::error::SubmitError;
use crate::state::{Deferred, DrmState};
use crate::transport::{BufReqError, TransportError};
use crate::types::{
    ChannelId, ChannelState, ConnectionId, DrmMode, Notification, NotificationKind, ResponseCode,
};
use crate::uds::service_id::NEGATIVE_RESPONSE;
use crate::uds::{positive_response_sid, NegativeResponseCode, NEGATIVE_RESPONSE_LEN};

/// How a complete response is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Evaluation {
    Final(ResponseCode),
    /// Negative response `78`: keep waiting with P2*
    Pending,
}

/// Judge a complete UDS response to a request for `service_id`
pub(crate) fn evaluate_response(service_id: u8, response: &[u8]) -> Evaluation {
    match response.first() {
        Some(&NEGATIVE_RESPONSE) => {
            if response.len() != NEGATIVE_RESPONSE_LEN {
                return Evaluation::Final(ResponseCode::InvalidNrcLength);
            }
            if response[1] != service_id {
                return Evaluation::Final(ResponseCode::WrongService);
            }
            let nrc = NegativeResponseCode(response[2]);
            if nrc.is_response_pending() {
                Evaluation::Pending
            } else {
                Evaluation::Final(ResponseCode::Negative(nrc))
            }
        }
        Some(&sid) if sid == positive_response_sid(service_id) => {
            Evaluation::Final(ResponseCode::Positive)
        }
        _ => Evaluation::Final(ResponseCode::WrongService),
    }
}

/// A request about to be loaded into a channel
pub(crate) struct Admission<'a> {
    pub connection: ConnectionId,
    pub requester: Requester,
    pub service_id: u8,
    pub suppress_positive_response: bool,
    pub header: &'a [u8],
    pub data: &'a [u8],
    pub response_capacity: usize,
    pub metadata: Option<&'a [u8]>,
    pub client: Client,
}

impl DrmState {
    /// Allocate a channel and load the request into it
    pub fn admit(&mut self, request: Admission<'_>) -> Result<ChannelId, SubmitError> {
        let (id, class) = self.acquire(
            request.connection,
            request.requester,
            request.service_id,
            request.suppress_positive_response,
        )?;
        let conn = &self.connections[request.connection.index()];
        let (max_rcrrp, p2) = (conn.max_rcrrp, conn.p2);

        self.channels[id.index()].setup(ChannelSetup {
            connection: request.connection,
            class,
            service_id: request.service_id,
            suppress_positive_response: request.suppress_positive_response,
            header: request.header,
            data: request.data,
            response_capacity: request.response_capacity,
            metadata: request.metadata,
            max_rcrrp,
            p2,
            client: request.client,
        });

        if class == ChannelClass::Functional {
            self.functional.clear();
            self.functional_service = Some(request.service_id);
            self.mode = DrmMode::FunctionalRequestActive;
            info!(connection = %request.connection, service_id = request.service_id, "Functional request active");
        }
        self.channels[id.index()].state = self.initial_state(request.connection);
        Ok(id)
    }

    /// Hand every ready request to the transport.
    ///
    /// Only one channel may transmit on a connection at a time; a forced
    /// TesterPresent stays in `RequestStart` while the functional request
    /// of the same connection is still being sent.
    pub fn sweep_requests(&mut self, outbox: &mut Vec<Deferred>) {
        for index in 0..self.channels.len() {
            if self.channels[index].state != ChannelState::RequestStart {
                continue;
            }
            let connection = self.channels[index].connection;
            let transmitting = self.channels.iter().enumerate().any(|(other, ch)| {
                other != index
                    && ch.connection == connection
                    && ch.state == ChannelState::RequestProcessing
            });
            if transmitting {
                trace!(channel = index, %connection, "Transmission deferred, connection busy");
                continue;
            }

            let pdu = self.connections[connection.index()].tx_pdu;
            let ch = &mut self.channels[index];
            ch.state = ChannelState::RequestProcessing;
            ch.current_message_index = 0;
            ch.message_length = ch.request_length();
            ch.transmit_in_flight = true;
            debug!(channel = index, %connection, length = ch.message_length, "Transmitting request");
            outbox.push(Deferred::Transmit {
                channel: ChannelId(index as u8),
                generation: ch.generation,
                pdu,
                length: ch.message_length,
            });
        }
    }

    /// Outcome of a `transmit` call made outside the lock
    pub fn after_transmit(
        &mut self,
        id: ChannelId,
        generation: u32,
        result: Result<(), TransportError>,
        outbox: &mut Vec<Deferred>,
    ) {
        let pdu = {
            let ch = &self.channels[id.index()];
            self.connections[ch.connection.index()].tx_pdu
        };
        let ch = &mut self.channels[id.index()];
        if ch.generation != generation {
            return;
        }
        ch.transmit_in_flight = false;
        match result {
            Ok(()) => {
                // Closed while the transport was accepting the request
                if matches!(ch.state, ChannelState::CloseChannel | ChannelState::Inactive) {
                    outbox.push(Deferred::CancelTransmit(pdu));
                }
            }
            Err(error) => {
                if ch.state == ChannelState::RequestProcessing {
                    warn!(channel = %id, %pdu, %error, "Transmit rejected");
                    ch.response_code = ResponseCode::TxError;
                    ch.state = ChannelState::CloseChannel;
                }
            }
        }
    }

    pub fn on_copy_tx(&mut self, id: ChannelId, dest: &mut [u8]) -> Result<usize, BufReqError> {
        let ch = &mut self.channels[id.index()];
        if ch.state != ChannelState::RequestProcessing {
            return Err(BufReqError::NotOk);
        }
        ch.copy_tx(dest).ok_or(BufReqError::NotOk)
    }

    pub fn on_tx_confirmation(
        &mut self,
        id: ChannelId,
        result: Result<(), TransportError>,
        outbox: &mut Vec<Deferred>,
    ) {
        let p2 = {
            let ch = &self.channels[id.index()];
            self.connections[ch.connection.index()].p2
        };
        let notify_tx = self.settings.notify_transmission_complete;
        let ch = &mut self.channels[id.index()];
        if ch.state != ChannelState::RequestProcessing {
            return;
        }
        if let Err(error) = result {
            warn!(channel = %id, connection = %ch.connection, %error, "Transmission failed");
            ch.response_code = ResponseCode::TxError;
            ch.state = ChannelState::CloseChannel;
            return;
        }
        if ch.is_tester_present_functional {
            // Nobody answers a suppressed broadcast TesterPresent
            ch.response_code = ResponseCode::Timeout;
            ch.state = ChannelState::CloseChannel;
            trace!(channel = %id, "Functional TesterPresent sent");
            return;
        }

        ch.message_length = 0;
        ch.current_message_index = 0;
        ch.p2_timer = p2;
        ch.state = ChannelState::WaitResponse;
        debug!(channel = %id, connection = %ch.connection, "Request sent, waiting for response");
        if notify_tx {
            if let Some(notify) = ch.notify_fn() {
                outbox.push(Deferred::Notify(
                    notify,
                    Notification {
                        connection: ch.connection,
                        service_id: ch.service_id,
                        kind: NotificationKind::TransmissionComplete,
                    },
                ));
            }
        }
        if self.mode == DrmMode::FunctionalRequestActive {
            self.reload_p2(id, false);
        }
        self.arm_request_delay();
    }

    /// Bind a physical response arriving during a functional request to a
    /// collector channel of the application pool
    pub fn bind_functional_response(&mut self, connection: ConnectionId) -> Option<ChannelId> {
        let conn = &self.connections[connection.index()];
        if conn.functional || self.assigned(connection, false).is_some() {
            return None;
        }
        let (p2, max_rcrrp, metadata_len) = (conn.p2, conn.max_rcrrp, conn.metadata_len);
        let service_id = self.functional_service?;
        let Some(id) = self.free_slot(ChannelClass::Application) else {
            warn!(%connection, "No channel left for functional response");
            return None;
        };

        let key = allocator::assignment_key(connection, false, self.connections.len());
        self.assignments[key] = Some(id);
        self.active_channels += 1;

        let zeros = [0u8; crate::config::MAX_METADATA_LEN];
        let buffer_size = self.functional.buffer_size();
        let slot = self.functional.bind(connection);
        let ch = &mut self.channels[id.index()];
        ch.setup(ChannelSetup {
            connection,
            class: ChannelClass::Application,
            service_id,
            suppress_positive_response: false,
            header: &[],
            data: &[],
            response_capacity: buffer_size,
            metadata: (metadata_len > 0).then(|| &zeros[..metadata_len]),
            max_rcrrp,
            p2,
            client: Client::FunctionalCollector,
        });
        match slot {
            Some(slot) => {
                ch.functional_slot = Some(slot);
                ch.state = ChannelState::WaitResponse;
                debug!(channel = %id, %connection, slot, "Functional response bound");
            }
            None => {
                warn!(%connection, "Functional response pool full");
                ch.response_code = ResponseCode::BufferFull;
                ch.state = ChannelState::CloseChannel;
            }
        }
        self.reload_p2(id, false);
        Some(id)
    }

    pub fn on_start_of_reception(
        &mut self,
        id: ChannelId,
        sdu_length: usize,
    ) -> Result<usize, BufReqError> {
        let ch = &mut self.channels[id.index()];
        if ch.state != ChannelState::WaitResponse {
            return Err(BufReqError::NotOk);
        }
        let payload = ch.payload_length(sdu_length);
        if payload == 0 {
            debug!(channel = %id, code = %ch.response_code, "Empty response, closing");
            ch.state = ChannelState::CloseChannel;
            return Err(BufReqError::NotOk);
        }
        if payload > ch.response_capacity() {
            warn!(channel = %id, payload, capacity = ch.response_capacity(), "Response does not fit");
            ch.response_code = ResponseCode::BufferTooSmall;
            ch.state = ChannelState::CloseChannel;
            return Err(BufReqError::Overflow);
        }
        ch.begin_reception(sdu_length);
        ch.state = ChannelState::ResponseProcessing;
        trace!(channel = %id, sdu_length, "Reception started");
        Ok(ch.rx_available())
    }

    pub fn on_copy_rx(&mut self, id: ChannelId, data: &[u8]) -> Result<usize, BufReqError> {
        let ch = &mut self.channels[id.index()];
        if ch.state != ChannelState::ResponseProcessing {
            return Err(BufReqError::NotOk);
        }
        ch.copy_rx(data).ok_or(BufReqError::Overflow)
    }

    pub fn on_rx_indication(
        &mut self,
        id: ChannelId,
        result: Result<(), TransportError>,
        outbox: &mut Vec<Deferred>,
    ) {
        let forward_pending = self.settings.forward_response_pending;
        let ch = &mut self.channels[id.index()];
        if ch.state != ChannelState::ResponseProcessing {
            return;
        }
        if let Err(error) = result {
            warn!(channel = %id, connection = %ch.connection, %error, "Reception failed");
            ch.response_code = ResponseCode::RxError;
            ch.state = ChannelState::CloseChannel;
            return;
        }
        if ch.current_message_index < ch.message_length {
            warn!(channel = %id, received = ch.current_message_index, expected = ch.message_length, "Incomplete response");
            ch.response_code = ResponseCode::RxError;
            ch.state = ChannelState::CloseChannel;
            return;
        }

        match evaluate_response(ch.service_id, ch.response()) {
            Evaluation::Final(code) => {
                debug!(channel = %id, connection = %ch.connection, %code, "Response received");
                ch.response_code = code;
                ch.state = ChannelState::CloseChannel;
            }
            Evaluation::Pending if ch.rcrrp_counter == 0 => {
                warn!(channel = %id, connection = %ch.connection, "Response pending limit reached");
                ch.response_code = ResponseCode::RcrrpLimitReached;
                ch.state = ChannelState::CloseChannel;
            }
            Evaluation::Pending => {
                ch.rcrrp_counter -= 1;
                ch.discard_response();
                ch.state = ChannelState::WaitResponse;
                debug!(channel = %id, connection = %ch.connection, left = ch.rcrrp_counter, "Response pending");
                if forward_pending {
                    if let Some(notify) = ch.notify_fn() {
                        outbox.push(Deferred::Notify(
                            notify,
                            Notification {
                                connection: ch.connection,
                                service_id: ch.service_id,
                                kind: NotificationKind::ResponsePending,
                            },
                        ));
                    }
                }
                self.reload_p2(id, true);
            }
        }
    }

    /// Request closing; the transport is told to abort what is in flight
    pub fn cancel_channel(&mut self, id: ChannelId, code: ResponseCode, outbox: &mut Vec<Deferred>) {
        let ch = &self.channels[id.index()];
        let conn = &self.connections[ch.connection.index()];
        match ch.state {
            ChannelState::Inactive | ChannelState::CloseChannel => return,
            ChannelState::RequestProcessing if !ch.transmit_in_flight => {
                outbox.push(Deferred::CancelTransmit(conn.tx_pdu));
            }
            ChannelState::ResponseProcessing => {
                if let Some(rx) = conn.rx_pdu {
                    outbox.push(Deferred::CancelReceive(rx));
                }
            }
            _ => {}
        }
        debug!(channel = %id, connection = %ch.connection, %code, "Channel cancelled");
        let ch = &mut self.channels[id.index()];
        ch.response_code = code;
        ch.state = ChannelState::CloseChannel;
    }

    /// Free a channel, store or notify its outcome and update the mode
    pub fn finish_channel(&mut self, id: ChannelId, outbox: &mut Vec<Deferred>) {
        let ch = &self.channels[id.index()];
        if !ch.state.is_active() {
            return;
        }
        let (connection, service_id, code, slot) =
            (ch.connection, ch.service_id, ch.response_code, ch.functional_slot);

        self.release(id);
        self.reload_delay(connection);
        let (client, response, metadata) = self.channels[id.index()].clear();
        if let Some(slot) = slot {
            self.functional.complete(slot, code, &response);
        }
        debug!(channel = %id, %connection, %code, "Channel closed");

        if self.mode == DrmMode::FunctionalRequestActive && self.active_channels == 0 {
            self.mode = DrmMode::Run;
            self.functional_service = None;
            info!("Functional request complete");
        }

        match client {
            Some(Client::Application(notify)) => outbox.push(Deferred::Notify(
                notify,
                Notification {
                    connection,
                    service_id,
                    kind: NotificationKind::Final {
                        code,
                        response,
                        metadata,
                    },
                },
            )),
            Some(Client::Discovery) => self.discovery.probe_closed(connection, code),
            Some(Client::FunctionalCollector) | None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case::positive(0x22, &[0x62, 0xF1, 0x90, 0x01], Evaluation::Final(ResponseCode::Positive))]
    #[case::negative(0x22, &[0x7F, 0x22, 0x31], Evaluation::Final(ResponseCode::Negative(NegativeResponseCode::REQUEST_OUT_OF_RANGE)))]
    #[case::pending(0x31, &[0x7F, 0x31, 0x78], Evaluation::Pending)]
    #[case::nrc_too_long(0x22, &[0x7F, 0x22, 0x31, 0x00], Evaluation::Final(ResponseCode::InvalidNrcLength))]
    #[case::nrc_too_short(0x22, &[0x7F, 0x22], Evaluation::Final(ResponseCode::InvalidNrcLength))]
    #[case::nrc_other_service(0x22, &[0x7F, 0x2E, 0x31], Evaluation::Final(ResponseCode::WrongService))]
    #[case::unexpected_sid(0x22, &[0x6E, 0xF1, 0x90], Evaluation::Final(ResponseCode::WrongService))]
    #[case::empty(0x22, &[], Evaluation::Final(ResponseCode::WrongService))]
    fn test_evaluate_response(
        #[case] service_id: u8,
        #[case] response: &[u8],
        #[case] expected: Evaluation,
    ) {
        assert_eq!(evaluate_response(service_id, response), expected);
    }
}
