//! Development error reporting
//!
//! Programming and precondition errors (uninitialised module, out-of-range
//! ids, missing buffers) are not protocol outcomes. They are handed to a
//! [`DevErrorSink`] and the offending call becomes a no-op.

use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DevError {
    #[error("module not initialized")]
    Uninit,

    #[error("connection id out of range")]
    InvalidConnection,

    #[error("PDU id not configured")]
    InvalidPduId,

    #[error("channel id out of range")]
    InvalidChannel,

    #[error("request buffer is empty")]
    EmptyBuffer,

    #[error("inline protocol header too long")]
    InvalidHeader,

    #[error("addressing metadata does not match the connection")]
    InvalidMetadata,
}

/// API entry point that detected a development error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiId {
    Tick,
    Submit,
    Cancel,
    ExternalTester,
    StartDiscovery,
    StopDiscovery,
    DiscoveryStatus,
    FetchFunctional,
    ChannelState,
    Mode,
    Shutdown,
    StartOfReception,
    CopyRxData,
    RxIndication,
    CopyTxData,
    TxConfirmation,
}

impl ApiId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Submit => "submit",
            Self::Cancel => "cancel",
            Self::ExternalTester => "set_external_tester_present",
            Self::StartDiscovery => "start_discovery",
            Self::StopDiscovery => "stop_discovery",
            Self::DiscoveryStatus => "discovery_status",
            Self::FetchFunctional => "fetch_functional_result",
            Self::ChannelState => "channel_state",
            Self::Mode => "mode",
            Self::Shutdown => "shutdown",
            Self::StartOfReception => "start_of_reception",
            Self::CopyRxData => "copy_rx_data",
            Self::RxIndication => "rx_indication",
            Self::CopyTxData => "copy_tx_data",
            Self::TxConfirmation => "tx_confirmation",
        }
    }
}

/// Receiver of development errors
pub trait DevErrorSink: Send + Sync {
    fn report(&self, api: ApiId, error: DevError);
}

/// Default sink: logs every development error
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl DevErrorSink for TracingErrorSink {
    fn report(&self, api: ApiId, error: DevError) {
        error!(api = api.as_str(), %error, "Development error");
    }
}
