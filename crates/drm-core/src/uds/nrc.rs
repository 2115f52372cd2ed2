//! UDS Negative Response Codes (NRC)

use std::fmt;

/// A negative response code as echoed in byte 2 of a `0x7F` response.
///
/// Kept as a transparent byte so manufacturer-specific codes survive the
/// round trip into notifications and functional result buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NegativeResponseCode(pub u8);

impl NegativeResponseCode {
    pub const GENERAL_REJECT: Self = Self(0x10);
    pub const SERVICE_NOT_SUPPORTED: Self = Self(0x11);
    pub const SUB_FUNCTION_NOT_SUPPORTED: Self = Self(0x12);
    pub const INCORRECT_MESSAGE_LENGTH_OR_FORMAT: Self = Self(0x13);
    pub const RESPONSE_TOO_LONG: Self = Self(0x14);
    pub const BUSY_REPEAT_REQUEST: Self = Self(0x21);
    pub const CONDITIONS_NOT_CORRECT: Self = Self(0x22);
    pub const REQUEST_SEQUENCE_ERROR: Self = Self(0x24);
    pub const NO_RESPONSE_FROM_SUBNET: Self = Self(0x25);
    pub const FAILURE_PREVENTS_EXECUTION: Self = Self(0x26);
    pub const REQUEST_OUT_OF_RANGE: Self = Self(0x31);
    pub const SECURITY_ACCESS_DENIED: Self = Self(0x33);
    pub const INVALID_KEY: Self = Self(0x35);
    pub const EXCEEDED_NUMBER_OF_ATTEMPTS: Self = Self(0x36);
    pub const REQUIRED_TIME_DELAY_NOT_EXPIRED: Self = Self(0x37);
    pub const UPLOAD_DOWNLOAD_NOT_ACCEPTED: Self = Self(0x70);
    pub const TRANSFER_DATA_SUSPENDED: Self = Self(0x71);
    pub const GENERAL_PROGRAMMING_FAILURE: Self = Self(0x72);
    pub const WRONG_BLOCK_SEQUENCE_COUNTER: Self = Self(0x73);
    /// Request correctly received, response pending (RCRRP)
    pub const RESPONSE_PENDING: Self = Self(0x78);
    pub const SUB_FUNCTION_NOT_SUPPORTED_IN_ACTIVE_SESSION: Self = Self(0x7E);
    pub const SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION: Self = Self(0x7F);

    /// Whether this code asks the tester to keep waiting.
    pub fn is_response_pending(self) -> bool {
        self == Self::RESPONSE_PENDING
    }

    /// ISO 14229-1 name of the code, if it is one of the common ones.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0x10 => "GeneralReject",
            0x11 => "ServiceNotSupported",
            0x12 => "SubFunctionNotSupported",
            0x13 => "IncorrectMessageLengthOrFormat",
            0x14 => "ResponseTooLong",
            0x21 => "BusyRepeatRequest",
            0x22 => "ConditionsNotCorrect",
            0x24 => "RequestSequenceError",
            0x25 => "NoResponseFromSubnet",
            0x26 => "FailurePreventsExecution",
            0x31 => "RequestOutOfRange",
            0x33 => "SecurityAccessDenied",
            0x35 => "InvalidKey",
            0x36 => "ExceededNumberOfAttempts",
            0x37 => "RequiredTimeDelayNotExpired",
            0x70 => "UploadDownloadNotAccepted",
            0x71 => "TransferDataSuspended",
            0x72 => "GeneralProgrammingFailure",
            0x73 => "WrongBlockSequenceCounter",
            0x78 => "ResponsePending",
            0x7E => "SubFunctionNotSupportedInActiveSession",
            0x7F => "ServiceNotSupportedInActiveSession",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        nrc.0
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:02X})", name, self.0),
            None => write!(f, "NRC 0x{:02X}", self.0),
        }
    }
}
