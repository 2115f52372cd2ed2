//! Identifiers, states and protocol outcomes shared across the manager

use std::fmt;
use std::sync::Arc;

use crate::uds::NegativeResponseCode;

/// Index of a configured connection (physical or functional target)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u16);

impl ConnectionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Index into the fixed channel array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl ChannelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// Transport PDU identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PduId(pub u16);

impl fmt::Display for PduId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pdu 0x{:04X}", self.0)
    }
}

/// Channel protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Inactive,
    /// Closing requested; the next close pass notifies and frees the channel
    CloseChannel,
    /// Waiting for the request delay timer of the connection
    WaitDelay,
    /// Ready to hand the request to the transport
    RequestStart,
    /// Transmission in progress
    RequestProcessing,
    /// Request sent, P2 running
    WaitResponse,
    /// Response reception in progress
    ResponseProcessing,
}

impl ChannelState {
    pub fn is_active(self) -> bool {
        self != Self::Inactive
    }
}

/// Process-wide manager mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrmMode {
    #[default]
    Run,
    /// An external tester owns the bus; no requests are accepted
    ExternalTesterPresent,
    /// A functional request is collecting physical responses
    FunctionalRequestActive,
}

/// Final outcome of a request, delivered exactly once per accepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Positive,
    Negative(NegativeResponseCode),
    /// Response service id matched neither the positive id nor `0x7F`
    WrongService,
    /// Negative response with a length other than three bytes
    InvalidNrcLength,
    /// Response pending received after the retry budget was spent
    RcrrpLimitReached,
    Timeout,
    /// Declared response length exceeds the response buffer
    BufferTooSmall,
    /// No functional response buffer left for a physical sub-response
    BufferFull,
    TxError,
    RxError,
    /// Closed by cancellation, external tester or shutdown
    ChannelsClosed,
}

impl ResponseCode {
    pub fn is_positive(self) -> bool {
        self == Self::Positive
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positive => write!(f, "Positive"),
            Self::Negative(nrc) => write!(f, "Negative: {}", nrc),
            Self::WrongService => write!(f, "WrongService"),
            Self::InvalidNrcLength => write!(f, "InvalidNrcLength"),
            Self::RcrrpLimitReached => write!(f, "RcrrpLimitReached"),
            Self::Timeout => write!(f, "Timeout"),
            Self::BufferTooSmall => write!(f, "BufferTooSmall"),
            Self::BufferFull => write!(f, "BufferFull"),
            Self::TxError => write!(f, "TxError"),
            Self::RxError => write!(f, "RxError"),
            Self::ChannelsClosed => write!(f, "ChannelsClosed"),
        }
    }
}

/// Event reported to the submitter of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub connection: ConnectionId,
    pub service_id: u8,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// The request left the transport (opt-in)
    TransmissionComplete,
    /// The ECU answered with response pending; the channel stays open
    ResponsePending,
    /// The channel closed. `response` holds the received UDS bytes and is
    /// only meaningful for [`ResponseCode::Positive`].
    Final {
        code: ResponseCode,
        response: Vec<u8>,
        metadata: Vec<u8>,
    },
}

impl Notification {
    pub fn is_final(&self) -> bool {
        matches!(self.kind, NotificationKind::Final { .. })
    }

    /// Final response code, `None` for transient events
    pub fn code(&self) -> Option<ResponseCode> {
        match &self.kind {
            NotificationKind::Final { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Received response bytes of a final notification
    pub fn response(&self) -> &[u8] {
        match &self.kind {
            NotificationKind::Final { response, .. } => response,
            _ => &[],
        }
    }
}

/// Per-request notification callback.
///
/// Always invoked outside the channel manager lock, so it may call back into
/// the manager (e.g. to submit a follow-up request).
pub type NotifyFn = Arc<dyn Fn(&Notification) + Send + Sync>;
