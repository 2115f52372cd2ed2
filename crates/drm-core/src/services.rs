//! UDS service requests
//!
//! Thin builders over [`RequestManager::submit`]: each one lays out the
//! fixed protocol header of its service and passes caller data through.
//! Sub-function services set the SPRMIB when suppression is requested.

use crate::error::SubmitError;
use crate::manager::{DiagRequest, RequestManager};
use crate::types::{ChannelId, ConnectionId, NotifyFn};
use crate::uds::{service_id, sub_function};

impl RequestManager {
    fn submit_service(
        &self,
        connection: ConnectionId,
        header: &[u8],
        data: &[u8],
        suppress_positive_response: bool,
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let request = DiagRequest::new(connection, data)
            .with_header(header)
            .suppress_positive_response(suppress_positive_response);
        self.submit(request, notify)
    }

    /// DiagnosticSessionControl (0x10)
    pub fn diagnostic_session_control(
        &self,
        connection: ConnectionId,
        session: u8,
        suppress_positive_response: bool,
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let header = [
            service_id::DIAGNOSTIC_SESSION_CONTROL,
            sub_function(session, suppress_positive_response),
        ];
        self.submit_service(connection, &header, &[], suppress_positive_response, notify)
    }

    /// ECUReset (0x11)
    pub fn ecu_reset(
        &self,
        connection: ConnectionId,
        reset_type: u8,
        suppress_positive_response: bool,
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let header = [
            service_id::ECU_RESET,
            sub_function(reset_type, suppress_positive_response),
        ];
        self.submit_service(connection, &header, &[], suppress_positive_response, notify)
    }

    /// ClearDiagnosticInformation (0x14); `group` is a 3-byte DTC group
    pub fn clear_diagnostic_information(
        &self,
        connection: ConnectionId,
        group: u32,
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let group = group.to_be_bytes();
        let header = [service_id::CLEAR_DIAGNOSTIC_INFO, group[1], group[2], group[3]];
        self.submit_service(connection, &header, &[], false, notify)
    }

    /// ReadDTCInformation (0x19)
    pub fn read_dtc_information(
        &self,
        connection: ConnectionId,
        report_type: u8,
        params: &[u8],
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let header = [service_id::READ_DTC_INFO, report_type];
        self.submit_service(connection, &header, params, false, notify)
    }

    /// ReadDataByIdentifier (0x22)
    pub fn read_data_by_identifier(
        &self,
        connection: ConnectionId,
        did: u16,
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let did = did.to_be_bytes();
        let header = [service_id::READ_DATA_BY_ID, did[0], did[1]];
        self.submit_service(connection, &header, &[], false, notify)
    }

    /// SecurityAccess (0x27): odd levels request a seed, even levels send `key`
    pub fn security_access(
        &self,
        connection: ConnectionId,
        access_type: u8,
        key: &[u8],
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let header = [service_id::SECURITY_ACCESS, access_type];
        self.submit_service(connection, &header, key, false, notify)
    }

    /// CommunicationControl (0x28)
    pub fn communication_control(
        &self,
        connection: ConnectionId,
        control_type: u8,
        communication_type: u8,
        suppress_positive_response: bool,
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let header = [
            service_id::COMMUNICATION_CONTROL,
            sub_function(control_type, suppress_positive_response),
            communication_type,
        ];
        self.submit_service(connection, &header, &[], suppress_positive_response, notify)
    }

    /// WriteDataByIdentifier (0x2E)
    pub fn write_data_by_identifier(
        &self,
        connection: ConnectionId,
        did: u16,
        data: &[u8],
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let did = did.to_be_bytes();
        let header = [service_id::WRITE_DATA_BY_ID, did[0], did[1]];
        self.submit_service(connection, &header, data, false, notify)
    }

    /// InputOutputControlByIdentifier (0x2F); `control` starts with the
    /// control parameter
    pub fn input_output_control_by_identifier(
        &self,
        connection: ConnectionId,
        did: u16,
        control: &[u8],
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let did = did.to_be_bytes();
        let header = [service_id::IO_CONTROL_BY_ID, did[0], did[1]];
        self.submit_service(connection, &header, control, false, notify)
    }

    /// RoutineControl (0x31)
    pub fn routine_control(
        &self,
        connection: ConnectionId,
        control_type: u8,
        routine_id: u16,
        params: &[u8],
        suppress_positive_response: bool,
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let id = routine_id.to_be_bytes();
        let header = [
            service_id::ROUTINE_CONTROL,
            sub_function(control_type, suppress_positive_response),
            id[0],
            id[1],
        ];
        self.submit_service(connection, &header, params, suppress_positive_response, notify)
    }

    /// TesterPresent (0x3E). With suppression on a functional connection the
    /// request takes the reserved TesterPresent channel and is accepted even
    /// while a functional request is running.
    pub fn tester_present(
        &self,
        connection: ConnectionId,
        suppress_positive_response: bool,
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let header = [
            service_id::TESTER_PRESENT,
            sub_function(0x00, suppress_positive_response),
        ];
        self.submit_service(connection, &header, &[], suppress_positive_response, notify)
    }

    /// ControlDTCSetting (0x85)
    pub fn control_dtc_setting(
        &self,
        connection: ConnectionId,
        setting_type: u8,
        suppress_positive_response: bool,
        notify: NotifyFn,
    ) -> Result<ChannelId, SubmitError> {
        let header = [
            service_id::CONTROL_DTC_SETTING,
            sub_function(setting_type, suppress_positive_response),
        ];
        self.submit_service(connection, &header, &[], suppress_positive_response, notify)
    }
}
