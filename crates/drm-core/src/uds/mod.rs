//! UDS (ISO 14229) protocol constants used by the request manager
//!
//! Only the fixed header fields are interpreted here: service ids, the
//! negative response marker and the suppress-positive-response bit. Payloads
//! beyond those bytes are passed through untouched.

mod nrc;

pub use nrc::NegativeResponseCode;

/// Offset added to a request service id to form its positive response id
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Suppress Positive Response Message Indication Bit (SPRMIB) in a sub-function byte
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// Smallest response a channel must be able to hold (`7F <sid> <nrc>`)
pub const NEGATIVE_RESPONSE_LEN: usize = 3;

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const READ_DATA_BY_PERIODIC_ID: u8 = 0x2A;
    pub const DYNAMICALLY_DEFINE_DATA_ID: u8 = 0x2C;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const IO_CONTROL_BY_ID: u8 = 0x2F;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const REQUEST_UPLOAD: u8 = 0x35;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const RESPONSE_ON_EVENT: u8 = 0x86;
    pub const LINK_CONTROL: u8 = 0x87;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// DiagnosticSessionControl (0x10) session types
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    /// Hard reset - complete shutdown and restart of ECU
    pub const HARD_RESET: u8 = 0x01;
    /// Key off/on reset - simulate ignition cycle
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
    /// Soft reset - application-level restart
    pub const SOFT_RESET: u8 = 0x03;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
    pub const STOP_ROUTINE: u8 = 0x02;
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// ControlDTCSetting (0x85) setting types
pub mod dtc_setting_type {
    pub const ON: u8 = 0x01;
    pub const OFF: u8 = 0x02;
}

/// Positive response service id for a request service id
pub fn positive_response_sid(service_id: u8) -> u8 {
    service_id | POSITIVE_RESPONSE_OFFSET
}

/// Apply the SPRMIB to a sub-function byte when suppression is requested
pub fn sub_function(value: u8, suppress_positive_response: bool) -> u8 {
    if suppress_positive_response {
        value | SUPPRESS_POSITIVE_RESPONSE
    } else {
        value & !SUPPRESS_POSITIVE_RESPONSE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_response_sid() {
        assert_eq!(positive_response_sid(service_id::READ_DATA_BY_ID), 0x62);
        assert_eq!(positive_response_sid(service_id::TESTER_PRESENT), 0x7E);
    }

    #[test]
    fn test_sub_function_sprmib() {
        assert_eq!(sub_function(0x00, true), 0x80);
        assert_eq!(sub_function(0x83, false), 0x03);
    }
}
