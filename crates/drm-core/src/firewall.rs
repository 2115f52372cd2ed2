//! Per-connection service access control
//!
//! Each connection carries a bitmask with one bit per service id the manager
//! knows about. A request passes the firewall only when the bit for its
//! service id is set; unknown service ids never pass.

use crate::uds::service_id;

/// Service ids addressable by the firewall, in bit order
const FIREWALL_SERVICES: [u8; 22] = [
    service_id::DIAGNOSTIC_SESSION_CONTROL,
    service_id::ECU_RESET,
    service_id::CLEAR_DIAGNOSTIC_INFO,
    service_id::READ_DTC_INFO,
    service_id::READ_DATA_BY_ID,
    service_id::READ_MEMORY_BY_ADDRESS,
    service_id::SECURITY_ACCESS,
    service_id::COMMUNICATION_CONTROL,
    service_id::READ_DATA_BY_PERIODIC_ID,
    service_id::DYNAMICALLY_DEFINE_DATA_ID,
    service_id::WRITE_DATA_BY_ID,
    service_id::IO_CONTROL_BY_ID,
    service_id::ROUTINE_CONTROL,
    service_id::REQUEST_DOWNLOAD,
    service_id::REQUEST_UPLOAD,
    service_id::TRANSFER_DATA,
    service_id::REQUEST_TRANSFER_EXIT,
    service_id::WRITE_MEMORY_BY_ADDRESS,
    service_id::TESTER_PRESENT,
    service_id::CONTROL_DTC_SETTING,
    service_id::RESPONSE_ON_EVENT,
    service_id::LINK_CONTROL,
];

/// Bitmask of permitted service ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceMask(u32);

impl ServiceMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self((1 << FIREWALL_SERVICES.len()) - 1);

    /// Build a mask from a list of service ids.
    ///
    /// Returns the first service id the firewall cannot represent.
    pub fn from_services(services: &[u8]) -> Result<Self, u8> {
        services.iter().try_fold(Self::NONE, |mask, &sid| {
            service_bit(sid).map(|bit| Self(mask.0 | bit)).ok_or(sid)
        })
    }

    pub fn permits(self, service_id: u8) -> bool {
        service_bit(service_id).is_some_and(|bit| self.0 & bit != 0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl Default for ServiceMask {
    fn default() -> Self {
        Self::ALL
    }
}

fn service_bit(service_id: u8) -> Option<u32> {
    FIREWALL_SERVICES
        .iter()
        .position(|&sid| sid == service_id)
        .map(|pos| 1 << pos)
}

/// Whether the firewall lets `service_id` through for a connection mask
pub fn is_permitted(enabled: bool, mask: ServiceMask, service_id: u8) -> bool {
    !enabled || mask.permits(service_id)
}
