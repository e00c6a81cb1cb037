//! Typed DIMSE command sets.
//!
//! A DIMSE command is a small DICOM data set
//! encoded in Implicit VR Little Endian,
//! always preceded by a command group length element.
//! [`CommandSet`] is the typed record for such a data set:
//! only the fields meaningful for its command field are filled in.
use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use snafu::{OptionExt, ResultExt};

use crate::{Error, Result};

/// The command field codes of the DIMSE services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    /// Interpret a command field code.
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0100 => CommandField::NEventReportRq,
            0x8100 => CommandField::NEventReportRsp,
            0x0110 => CommandField::NGetRq,
            0x8110 => CommandField::NGetRsp,
            0x0120 => CommandField::NSetRq,
            0x8120 => CommandField::NSetRsp,
            0x0130 => CommandField::NActionRq,
            0x8130 => CommandField::NActionRsp,
            0x0140 => CommandField::NCreateRq,
            0x8140 => CommandField::NCreateRsp,
            0x0150 => CommandField::NDeleteRq,
            0x8150 => CommandField::NDeleteRsp,
            0x0FFF => CommandField::CCancelRq,
            _ => return None,
        })
    }

    /// The command field code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether this command field identifies a response message.
    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }
}

/// The priority of a composite service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

impl Priority {
    fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            0x0002 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// The value of the command data set type element
/// indicating that no data set is present.
const NO_DATA_SET: u16 = 0x0101;

/// A typed DIMSE command set.
///
/// Only the fields required by the
/// [command field](CommandField) are meaningful;
/// the rest stay `None` and are not encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    pub field: CommandField,
    pub message_id: Option<u16>,
    pub message_id_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub requested_sop_class_uid: Option<String>,
    pub requested_sop_instance_uid: Option<String>,
    pub priority: Option<Priority>,
    /// Whether a data set follows this command
    pub has_data_set: bool,
    pub status: Option<u16>,
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
    pub event_type_id: Option<u16>,
    pub action_type_id: Option<u16>,
    pub attribute_identifier_list: Option<Vec<Tag>>,
    pub remaining_suboperations: Option<u16>,
    pub completed_suboperations: Option<u16>,
    pub failed_suboperations: Option<u16>,
    pub warning_suboperations: Option<u16>,
}

impl CommandSet {
    fn empty(field: CommandField) -> Self {
        CommandSet {
            field,
            message_id: None,
            message_id_responded_to: None,
            affected_sop_class_uid: None,
            affected_sop_instance_uid: None,
            requested_sop_class_uid: None,
            requested_sop_instance_uid: None,
            priority: None,
            has_data_set: false,
            status: None,
            move_originator_ae_title: None,
            move_originator_message_id: None,
            event_type_id: None,
            action_type_id: None,
            attribute_identifier_list: None,
            remaining_suboperations: None,
            completed_suboperations: None,
            failed_suboperations: None,
            warning_suboperations: None,
        }
    }

    /// Create a C-STORE request command
    /// for the given SOP instance.
    pub fn c_store_rq(
        message_id: u16,
        affected_sop_class_uid: &str,
        affected_sop_instance_uid: &str,
        priority: Priority,
    ) -> Self {
        CommandSet {
            message_id: Some(message_id),
            affected_sop_class_uid: Some(affected_sop_class_uid.to_string()),
            affected_sop_instance_uid: Some(affected_sop_instance_uid.to_string()),
            priority: Some(priority),
            has_data_set: true,
            ..CommandSet::empty(CommandField::CStoreRq)
        }
    }

    /// Create a C-STORE response command
    /// answering the given request.
    pub fn c_store_rsp(request: &CommandSet, status: u16) -> Self {
        CommandSet {
            message_id_responded_to: request.message_id,
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            affected_sop_instance_uid: request.affected_sop_instance_uid.clone(),
            status: Some(status),
            ..CommandSet::empty(CommandField::CStoreRsp)
        }
    }

    /// Create a C-ECHO request command.
    pub fn c_echo_rq(message_id: u16) -> Self {
        CommandSet {
            message_id: Some(message_id),
            affected_sop_class_uid: Some(dicom_dictionary_std::uids::VERIFICATION.to_string()),
            ..CommandSet::empty(CommandField::CEchoRq)
        }
    }

    /// Create a C-ECHO response command
    /// answering the given request.
    pub fn c_echo_rsp(request: &CommandSet, status: u16) -> Self {
        CommandSet {
            message_id_responded_to: request.message_id,
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            status: Some(status),
            ..CommandSet::empty(CommandField::CEchoRsp)
        }
    }

    /// Build the DICOM command object for this command set,
    /// with the command group length computed up front.
    pub fn to_object(&self) -> InMemDicomObject {
        let mut elements = vec![DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [self.field.code()]),
        )];

        if let Some(v) = self.message_id {
            elements.push(DataElement::new(
                tags::MESSAGE_ID,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.message_id_responded_to {
            elements.push(DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = &self.affected_sop_class_uid {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, v.as_str()),
            ));
        }
        if let Some(v) = &self.affected_sop_instance_uid {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, v.as_str()),
            ));
        }
        if let Some(v) = &self.requested_sop_class_uid {
            elements.push(DataElement::new(
                tags::REQUESTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, v.as_str()),
            ));
        }
        if let Some(v) = &self.requested_sop_instance_uid {
            elements.push(DataElement::new(
                tags::REQUESTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, v.as_str()),
            ));
        }
        if let Some(v) = self.priority {
            elements.push(DataElement::new(
                tags::PRIORITY,
                VR::US,
                dicom_value!(U16, [v as u16]),
            ));
        }
        elements.push(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [if self.has_data_set { 0x0001 } else { NO_DATA_SET }]),
        ));
        if let Some(v) = self.status {
            elements.push(DataElement::new(
                tags::STATUS,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = &self.move_originator_ae_title {
            elements.push(DataElement::new(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                VR::AE,
                dicom_value!(Str, v.as_str()),
            ));
        }
        if let Some(v) = self.move_originator_message_id {
            elements.push(DataElement::new(
                tags::MOVE_ORIGINATOR_MESSAGE_ID,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.event_type_id {
            elements.push(DataElement::new(
                tags::EVENT_TYPE_ID,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.action_type_id {
            elements.push(DataElement::new(
                tags::ACTION_TYPE_ID,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(list) = &self.attribute_identifier_list {
            elements.push(DataElement::new(
                tags::ATTRIBUTE_IDENTIFIER_LIST,
                VR::AT,
                PrimitiveValue::Tags(list.iter().copied().collect()),
            ));
        }
        if let Some(v) = self.remaining_suboperations {
            elements.push(DataElement::new(
                tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.completed_suboperations {
            elements.push(DataElement::new(
                tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.failed_suboperations {
            elements.push(DataElement::new(
                tags::NUMBER_OF_FAILED_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }
        if let Some(v) = self.warning_suboperations {
            elements.push(DataElement::new(
                tags::NUMBER_OF_WARNING_SUBOPERATIONS,
                VR::US,
                dicom_value!(U16, [v]),
            ));
        }

        InMemDicomObject::command_from_element_iter(elements)
    }

    /// Encode this command set in Implicit VR Little Endian.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let obj = self.to_object();
        let mut buffer = Vec::with_capacity(128);
        obj.write_dataset_with_ts(
            &mut buffer,
            &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .whatever_context("could not encode command object")?;
        Ok(buffer)
    }

    /// Decode a command set from Implicit VR Little Endian bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let obj = InMemDicomObject::read_dataset_with_ts(
            data,
            &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .whatever_context("could not decode command object")?;
        Self::from_object(&obj)
    }

    /// Read the command set from a decoded DICOM command object.
    pub fn from_object(obj: &InMemDicomObject) -> Result<Self> {
        let code = obj
            .element(tags::COMMAND_FIELD)
            .ok()
            .and_then(|e| e.uint16().ok())
            .whatever_context::<_, Error>("missing or invalid command field")?;
        let field = CommandField::from_code(code)
            .whatever_context::<_, Error>("unrecognized command field")?;

        let read_u16 = |tag| obj.element(tag).ok().and_then(|e| e.uint16().ok());
        let read_str = |tag| {
            obj.element(tag).ok().and_then(|e| {
                e.to_str()
                    .ok()
                    .map(|s| {
                        s.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                            .to_string()
                    })
            })
        };

        let data_set_type = read_u16(tags::COMMAND_DATA_SET_TYPE).unwrap_or(NO_DATA_SET);
        let attribute_identifier_list = obj
            .element(tags::ATTRIBUTE_IDENTIFIER_LIST)
            .ok()
            .and_then(|e| match e.value() {
                dicom_core::value::Value::Primitive(PrimitiveValue::Tags(tags)) => {
                    Some(tags.to_vec())
                }
                _ => None,
            });

        Ok(CommandSet {
            field,
            message_id: read_u16(tags::MESSAGE_ID),
            message_id_responded_to: read_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO),
            affected_sop_class_uid: read_str(tags::AFFECTED_SOP_CLASS_UID),
            affected_sop_instance_uid: read_str(tags::AFFECTED_SOP_INSTANCE_UID),
            requested_sop_class_uid: read_str(tags::REQUESTED_SOP_CLASS_UID),
            requested_sop_instance_uid: read_str(tags::REQUESTED_SOP_INSTANCE_UID),
            priority: read_u16(tags::PRIORITY).and_then(Priority::from_code),
            has_data_set: data_set_type != NO_DATA_SET,
            status: read_u16(tags::STATUS),
            move_originator_ae_title: read_str(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE),
            move_originator_message_id: read_u16(tags::MOVE_ORIGINATOR_MESSAGE_ID),
            event_type_id: read_u16(tags::EVENT_TYPE_ID),
            action_type_id: read_u16(tags::ACTION_TYPE_ID),
            attribute_identifier_list,
            remaining_suboperations: read_u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed_suboperations: read_u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed_suboperations: read_u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning_suboperations: read_u16(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
        })
    }
}

/// The broad classes of a DIMSE status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Warning,
    Pending,
    Cancelled,
    Failure,
}

/// Classify a DIMSE status code.
pub fn status_class(status: u16) -> StatusClass {
    match status {
        0x0000 => StatusClass::Success,
        0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusClass::Warning,
        0xFF00 | 0xFF01 => StatusClass::Pending,
        0xFE00 => StatusClass::Cancelled,
        _ => StatusClass::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_store_rq_roundtrip() {
        let cmd = CommandSet::c_store_rq(
            7,
            "1.2.840.10008.5.1.4.1.1.2",
            "1.2.3.4.5.6",
            Priority::Medium,
        );
        let bytes = cmd.encode().unwrap();
        let decoded = CommandSet::decode(&bytes).unwrap();

        assert_eq!(decoded.field, CommandField::CStoreRq);
        assert_eq!(decoded.message_id, Some(7));
        assert_eq!(
            decoded.affected_sop_class_uid.as_deref(),
            Some("1.2.840.10008.5.1.4.1.1.2")
        );
        assert_eq!(decoded.affected_sop_instance_uid.as_deref(), Some("1.2.3.4.5.6"));
        assert_eq!(decoded.priority, Some(Priority::Medium));
        assert!(decoded.has_data_set);
        assert_eq!(decoded.status, None);
    }

    #[test]
    fn c_store_rsp_roundtrip() {
        let rq = CommandSet::c_store_rq(3, "1.2.840.10008.5.1.4.1.1.4", "9.8.7", Priority::High);
        let rsp = CommandSet::c_store_rsp(&rq, 0x0000);
        let decoded = CommandSet::decode(&rsp.encode().unwrap()).unwrap();

        assert_eq!(decoded.field, CommandField::CStoreRsp);
        assert!(decoded.field.is_response());
        assert_eq!(decoded.message_id_responded_to, Some(3));
        assert!(!decoded.has_data_set);
        assert_eq!(decoded.status, Some(0x0000));
    }

    #[test]
    fn c_echo_roundtrip() {
        let rq = CommandSet::c_echo_rq(1);
        let decoded = CommandSet::decode(&rq.encode().unwrap()).unwrap();
        assert_eq!(decoded.field, CommandField::CEchoRq);
        assert!(!decoded.has_data_set);

        let rsp = CommandSet::c_echo_rsp(&decoded, 0x0000);
        let decoded = CommandSet::decode(&rsp.encode().unwrap()).unwrap();
        assert_eq!(decoded.field, CommandField::CEchoRsp);
        assert_eq!(decoded.message_id_responded_to, Some(1));
        assert_eq!(decoded.status, Some(0x0000));
    }

    #[test]
    fn status_codes_are_classified() {
        assert_eq!(status_class(0x0000), StatusClass::Success);
        assert_eq!(status_class(0xB007), StatusClass::Warning);
        assert_eq!(status_class(0xFF00), StatusClass::Pending);
        assert_eq!(status_class(0xFE00), StatusClass::Cancelled);
        assert_eq!(status_class(0xA700), StatusClass::Failure);
        assert_eq!(status_class(0x0122), StatusClass::Failure);
    }
}
