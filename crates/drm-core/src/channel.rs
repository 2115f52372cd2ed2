//! Channel record
//!
//! A channel is one in-flight request/response exchange. The channel owns a
//! copy of the request, the response buffer and the small fixed scratch
//! arrays for inline protocol bytes and addressing metadata.

use crate::config::MAX_METADATA_LEN;
use crate::types::{ChannelState, ConnectionId, NotifyFn, ResponseCode};

/// Largest inline protocol header (service id, sub-function, identifier)
pub const INLINE_CAPACITY: usize = 4;

/// Which slot range of the channel array a channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelClass {
    Application,
    Functional,
    /// Forced functional TesterPresent with suppressed response
    TesterPresent,
    Discovery,
}

/// Who hears about the channel closing
#[derive(Clone)]
pub(crate) enum Client {
    Application(NotifyFn),
    /// Physical sub-response of a functional request, stored in the pool
    FunctionalCollector,
    Discovery,
}

pub(crate) struct Channel {
    pub state: ChannelState,
    /// Bumped on every allocation; deferred work for an older generation is dropped
    pub generation: u32,
    pub class: ChannelClass,
    pub connection: ConnectionId,
    pub service_id: u8,
    /// Bytes to transmit, or bytes announced by the current reception
    pub message_length: usize,
    pub current_message_index: usize,
    pub response_code: ResponseCode,
    pub p2_timer: u32,
    pub rcrrp_counter: u8,
    pub suppress_positive_response: bool,
    pub is_tester_present_functional: bool,
    pub uses_dynamic_metadata: bool,
    pub uses_inline_buffer: bool,
    /// A `transmit` call for this channel has not returned yet
    pub transmit_in_flight: bool,
    inline: [u8; INLINE_CAPACITY],
    inline_len: usize,
    request: Vec<u8>,
    response: Vec<u8>,
    response_capacity: usize,
    tx_metadata: [u8; MAX_METADATA_LEN],
    rx_metadata: [u8; MAX_METADATA_LEN],
    metadata_len: usize,
    /// Functional pool buffer receiving this channel's outcome
    pub functional_slot: Option<usize>,
    pub client: Option<Client>,
}

/// Request contents copied into a channel at allocation
pub(crate) struct ChannelSetup<'a> {
    pub connection: ConnectionId,
    pub class: ChannelClass,
    pub service_id: u8,
    pub suppress_positive_response: bool,
    pub header: &'a [u8],
    pub data: &'a [u8],
    pub response_capacity: usize,
    pub metadata: Option<&'a [u8]>,
    pub max_rcrrp: u8,
    pub p2: u32,
    pub client: Client,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Inactive,
            generation: 0,
            class: ChannelClass::Application,
            connection: ConnectionId(0),
            service_id: 0,
            message_length: 0,
            current_message_index: 0,
            response_code: ResponseCode::Timeout,
            p2_timer: 0,
            rcrrp_counter: 0,
            suppress_positive_response: false,
            is_tester_present_functional: false,
            uses_dynamic_metadata: false,
            uses_inline_buffer: false,
            transmit_in_flight: false,
            inline: [0; INLINE_CAPACITY],
            inline_len: 0,
            request: Vec::new(),
            response: Vec::new(),
            response_capacity: 0,
            tx_metadata: [0; MAX_METADATA_LEN],
            rx_metadata: [0; MAX_METADATA_LEN],
            metadata_len: 0,
            functional_slot: None,
            client: None,
        }
    }

    /// Load a new request. The caller sets the initial state.
    pub fn setup(&mut self, setup: ChannelSetup<'_>) {
        self.generation = self.generation.wrapping_add(1);
        self.class = setup.class;
        self.connection = setup.connection;
        self.service_id = setup.service_id;
        self.suppress_positive_response = setup.suppress_positive_response;
        self.is_tester_present_functional = setup.class == ChannelClass::TesterPresent;
        // With suppression the request succeeds unless the ECU objects
        self.response_code = if setup.suppress_positive_response {
            ResponseCode::Positive
        } else {
            ResponseCode::Timeout
        };
        self.rcrrp_counter = setup.max_rcrrp;
        self.p2_timer = setup.p2;

        self.inline_len = setup.header.len().min(INLINE_CAPACITY);
        self.inline[..self.inline_len].copy_from_slice(&setup.header[..self.inline_len]);
        self.uses_inline_buffer = self.inline_len > 0;

        self.request.clear();
        self.request.extend_from_slice(setup.data);
        self.response = Vec::with_capacity(setup.response_capacity);
        self.response_capacity = setup.response_capacity;

        match setup.metadata {
            Some(meta) => {
                self.metadata_len = meta.len().min(MAX_METADATA_LEN);
                self.tx_metadata[..self.metadata_len].copy_from_slice(&meta[..self.metadata_len]);
                self.uses_dynamic_metadata = true;
            }
            None => {
                self.metadata_len = 0;
                self.uses_dynamic_metadata = false;
            }
        }

        self.message_length = self.request_length();
        self.current_message_index = 0;
        self.functional_slot = None;
        self.transmit_in_flight = false;
        self.client = Some(setup.client);
    }

    /// Return to `Inactive`, handing back the client and received bytes
    pub fn clear(&mut self) -> (Option<Client>, Vec<u8>, Vec<u8>) {
        let client = self.client.take();
        let response = std::mem::take(&mut self.response);
        let metadata = self.rx_metadata().to_vec();
        self.state = ChannelState::Inactive;
        self.request = Vec::new();
        self.response_capacity = 0;
        self.message_length = 0;
        self.current_message_index = 0;
        self.inline_len = 0;
        self.metadata_len = 0;
        self.uses_inline_buffer = false;
        self.uses_dynamic_metadata = false;
        self.is_tester_present_functional = false;
        self.functional_slot = None;
        (client, response, metadata)
    }

    fn metadata_prefix(&self) -> usize {
        if self.uses_dynamic_metadata {
            self.metadata_len
        } else {
            0
        }
    }

    fn inline_bytes(&self) -> &[u8] {
        if self.uses_inline_buffer {
            &self.inline[..self.inline_len]
        } else {
            &[]
        }
    }

    /// Total bytes handed to the transport: metadata, inline header, data
    pub fn request_length(&self) -> usize {
        self.metadata_prefix() + self.inline_bytes().len() + self.request.len()
    }

    /// Copy the next `dest.len()` request bytes.
    ///
    /// Returns the bytes still left afterwards, or `None` when `dest` asks
    /// for more than remains.
    pub fn copy_tx(&mut self, dest: &mut [u8]) -> Option<usize> {
        let remaining = self.message_length.checked_sub(self.current_message_index)?;
        if dest.len() > remaining {
            return None;
        }

        let meta_len = self.metadata_prefix();
        let segments: [&[u8]; 3] = [
            &self.tx_metadata[..meta_len],
            self.inline_bytes(),
            &self.request,
        ];

        let mut pos = self.current_message_index;
        let mut written = 0;
        let mut offset = 0;
        for segment in segments {
            let end = offset + segment.len();
            if pos < end && written < dest.len() {
                let start = pos - offset;
                let n = (segment.len() - start).min(dest.len() - written);
                dest[written..written + n].copy_from_slice(&segment[start..start + n]);
                written += n;
                pos += n;
            }
            offset = end;
        }

        self.current_message_index = pos;
        Some(self.message_length - pos)
    }

    /// Payload capacity available to a reception of `sdu_length` bytes
    pub fn payload_length(&self, sdu_length: usize) -> usize {
        sdu_length.saturating_sub(self.metadata_prefix())
    }

    pub fn response_capacity(&self) -> usize {
        self.response_capacity
    }

    /// Prepare for a reception of `sdu_length` bytes
    pub fn begin_reception(&mut self, sdu_length: usize) {
        self.message_length = sdu_length;
        self.current_message_index = 0;
        self.response.clear();
    }

    /// Buffer space left for the current reception
    pub fn rx_available(&self) -> usize {
        let meta_len = self.metadata_prefix();
        let meta_left = meta_len - self.current_message_index.min(meta_len);
        meta_left + self.response_capacity.saturating_sub(self.response.len())
    }

    /// Copy received bytes: addressing metadata first, then the response.
    ///
    /// Returns `None` when the data runs past the announced length.
    pub fn copy_rx(&mut self, data: &[u8]) -> Option<usize> {
        if self.current_message_index + data.len() > self.message_length {
            return None;
        }
        let meta_len = self.metadata_prefix();
        let mut rest = data;
        if self.current_message_index < meta_len {
            let n = (meta_len - self.current_message_index).min(rest.len());
            let start = self.current_message_index;
            self.rx_metadata[start..start + n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
        }
        if self.response.len() + rest.len() > self.response_capacity {
            return None;
        }
        self.response.extend_from_slice(rest);
        self.current_message_index += data.len();
        Some(self.rx_available())
    }

    /// Drop a partially received response (response pending restart)
    pub fn discard_response(&mut self) {
        self.response.clear();
        self.message_length = 0;
        self.current_message_index = 0;
    }

    pub fn response(&self) -> &[u8] {
        &self.response
    }

    pub fn rx_metadata(&self) -> &[u8] {
        &self.rx_metadata[..self.metadata_prefix()]
    }

    pub fn notify_fn(&self) -> Option<NotifyFn> {
        match &self.client {
            Some(Client::Application(notify)) => Some(notify.clone()),
            _ => None,
        }
    }
}
