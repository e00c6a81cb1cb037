//! PDU writer module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{SpecificCharacterSet, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write PDU field `{}`: {}", field, source))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write {} reserved bytes: {}", bytes, source))]
    WriteReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not encode text field `{}`: {}", field, source))]
    EncodeText {
        field: &'static str,
        source: dicom_encoding::text::EncodeTextError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

fn write_chunk_u32<F>(writer: &mut dyn Write, field: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;

    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteFieldSnafu { field })?;
    writer.write_all(&data).context(WriteFieldSnafu { field })?;

    Ok(())
}

fn write_chunk_u16<F>(writer: &mut dyn Write, field: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;

    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteFieldSnafu { field })?;
    writer.write_all(&data).context(WriteFieldSnafu { field })?;

    Ok(())
}

/// Write an AE title as 16 characters padded with spaces.
fn write_ae_title(
    writer: &mut dyn Write,
    ae_title: &str,
    field: &'static str,
    codec: &dyn TextCodec,
) -> Result<()> {
    let mut bytes = codec.encode(ae_title).context(EncodeTextSnafu { field })?;
    bytes.resize(16, b' ');
    writer.write_all(&bytes).context(WriteFieldSnafu { field })
}

/// Serialize a PDU into its big-endian wire form.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = SpecificCharacterSet::ISO_IR_6;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // 1 - PDU-type - 01H
            writer
                .write_u8(0x01)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, "PDU-length", |writer| {
                // 7-8 - Protocol-version
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                // 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 11-26 - Called-AE-title
                write_ae_title(writer, called_ae_title, "Called-AE-title", &codec)?;

                // 27-42 - Calling-AE-title
                write_ae_title(writer, calling_ae_title, "Calling-AE-title", &codec)?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0_u8; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                // 75-xxx - Variable items
                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // 1 - PDU-type - 02H
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, "PDU-length", |writer| {
                // 7-8 - Protocol-version
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                // 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 11-26, 27-42 - echoes of the request's AE title fields,
                // not significant on the receiving end
                write_ae_title(writer, called_ae_title, "Called-AE-title", &codec)?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title", &codec)?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0_u8; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                // 75-xxx - Variable items
                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // 1 - PDU-type - 03H
            writer
                .write_u8(0x03)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, "PDU-length", |writer| {
                // 7 - Reserved
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;

                // 8 - Result
                writer
                    .write_u8(*result as u8)
                    .context(WriteFieldSnafu { field: "Result" })?;

                // 9 - Source, 10 - Reason/Diag
                let (source_value, reason_value) = match source {
                    AssociationRJSource::ServiceUser(reason) => {
                        let reason = match reason {
                            AssociationRJServiceUserReason::NoReasonGiven => 1,
                            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                            AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                            AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                            AssociationRJServiceUserReason::Reserved(x) => *x,
                        };
                        (1, reason)
                    }
                    AssociationRJSource::ServiceProviderAsce(reason) => {
                        let reason = match reason {
                            AssociationRJServiceProviderAsceReason::NoReasonGiven => 1,
                            AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => {
                                2
                            }
                        };
                        (2, reason)
                    }
                    AssociationRJSource::ServiceProviderPresentation(reason) => {
                        let reason = match reason {
                            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                                1
                            }
                            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                            AssociationRJServiceProviderPresentationReason::Reserved(x) => *x,
                        };
                        (3, reason)
                    }
                };
                writer
                    .write_u8(source_value)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer
                    .write_u8(reason_value)
                    .context(WriteFieldSnafu {
                        field: "Reason/Diag",
                    })?;

                Ok(())
            })
        }
        Pdu::PData { data } => {
            // 1 - PDU-type - 04H
            writer
                .write_u8(0x04)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, "PDU-length", |writer| {
                for value in data {
                    // 1-4 - Item-length
                    writer
                        .write_u32::<BigEndian>(value.data.len() as u32 + 2)
                        .context(WriteFieldSnafu {
                            field: "Item-length",
                        })?;

                    // 5 - Presentation-context-ID
                    writer
                        .write_u8(value.presentation_context_id)
                        .context(WriteFieldSnafu {
                            field: "Presentation-context-ID",
                        })?;

                    // 6 - Message control header
                    let mut header = 0x00;
                    if value.value_type == PDataValueType::Command {
                        header |= 0x01;
                    }
                    if value.is_last {
                        header |= 0x02;
                    }
                    writer.write_u8(header).context(WriteFieldSnafu {
                        field: "Message Control Header",
                    })?;

                    // 7-xxx - Presentation-data-value
                    writer.write_all(&value.data).context(WriteFieldSnafu {
                        field: "Presentation-data-value",
                    })?;
                }
                Ok(())
            })
        }
        Pdu::ReleaseRQ => {
            // 1 - PDU-type - 05H
            writer
                .write_u8(0x05)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, "PDU-length", |writer| {
                // 7-10 - Reserved
                writer
                    .write_u32::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 4_u32 })?;
                Ok(())
            })
        }
        Pdu::ReleaseRP => {
            // 1 - PDU-type - 06H
            writer
                .write_u8(0x06)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, "PDU-length", |writer| {
                // 7-10 - Reserved
                writer
                    .write_u32::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 4_u32 })?;
                Ok(())
            })
        }
        Pdu::AbortRQ { source } => {
            // 1 - PDU-type - 07H
            writer
                .write_u8(0x07)
                .context(WriteFieldSnafu { field: "PDU-type" })?;

            // 2 - Reserved
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;

            write_chunk_u32(writer, "PDU-length", |writer| {
                // 7, 8 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 9 - Source, 10 - Reason/Diag
                let (source_value, reason_value) = match source {
                    AbortRQSource::ServiceUser => (0, 0),
                    AbortRQSource::Reserved => (1, 0),
                    AbortRQSource::ServiceProvider(reason) => {
                        let reason = match reason {
                            AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                            AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                            AbortRQServiceProviderReason::UnexpectedPdu => 2,
                            AbortRQServiceProviderReason::Reserved => 3,
                            AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                            AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                            AbortRQServiceProviderReason::InvalidPduParameterValue => 6,
                        };
                        (2, reason)
                    }
                };
                writer
                    .write_u8(source_value)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer
                    .write_u8(reason_value)
                    .context(WriteFieldSnafu {
                        field: "Reason/Diag",
                    })?;

                Ok(())
            })
        }
        Pdu::Unknown { pdu_type, data } => {
            // write the PDU back as it came in
            writer
                .write_u8(*pdu_type)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            write_chunk_u32(writer, "PDU-length", |writer| {
                writer
                    .write_all(data)
                    .context(WriteFieldSnafu { field: "Unknown" })?;
                Ok(())
            })
        }
    }
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type - 10H
    writer
        .write_u8(0x10)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, "Item-length", |writer| {
        let bytes = codec
            .encode(application_context_name)
            .context(EncodeTextSnafu {
                field: "Application-context-name",
            })?;
        writer.write_all(&bytes).context(WriteFieldSnafu {
            field: "Application-context-name",
        })
    })
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type - 20H
    writer
        .write_u8(0x20)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, "Item-length", |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6, 7, 8 - Reserved
        writer
            .write_all(&[0_u8; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        // Abstract Syntax Sub-Item
        writer
            .write_u8(0x30)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        write_chunk_u16(writer, "Item-length", |writer| {
            let bytes = codec
                .encode(&presentation_context.abstract_syntax)
                .context(EncodeTextSnafu {
                    field: "Abstract-syntax-name",
                })?;
            writer.write_all(&bytes).context(WriteFieldSnafu {
                field: "Abstract-syntax-name",
            })
        })?;

        // Transfer Syntax Sub-Items
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            writer
                .write_u8(0x40)
                .context(WriteFieldSnafu { field: "Item-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteReservedSnafu { bytes: 1_u32 })?;
            write_chunk_u16(writer, "Item-length", |writer| {
                let bytes = codec.encode(transfer_syntax).context(EncodeTextSnafu {
                    field: "Transfer-syntax-name",
                })?;
                writer.write_all(&bytes).context(WriteFieldSnafu {
                    field: "Transfer-syntax-name",
                })
            })?;
        }

        Ok(())
    })
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    // 1 - Item-type - 21H
    writer
        .write_u8(0x21)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, "Item-length", |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6 - Reserved
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // 7 - Result/Reason
        writer
            .write_u8(presentation_context.reason as u8)
            .context(WriteFieldSnafu {
                field: "Result/Reason",
            })?;

        // 8 - Reserved
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // Transfer Syntax Sub-Item
        writer
            .write_u8(0x40)
            .context(WriteFieldSnafu { field: "Item-type" })?;
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;
        write_chunk_u16(writer, "Item-length", |writer| {
            let bytes = codec
                .encode(&presentation_context.transfer_syntax)
                .context(EncodeTextSnafu {
                    field: "Transfer-syntax-name",
                })?;
            writer.write_all(&bytes).context(WriteFieldSnafu {
                field: "Transfer-syntax-name",
            })
        })
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // 1 - Item-type - 50H
    writer
        .write_u8(0x50)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, "Item-length", |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    // Maximum Length Sub-Item - 51H
                    writer
                        .write_u8(0x51)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, "Item-length", |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })?;
                }
                UserVariableItem::ImplementationClassUID(implementation_class_uid) => {
                    // Implementation Class UID Sub-Item - 52H
                    writer
                        .write_u8(0x52)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, "Item-length", |writer| {
                        let bytes =
                            codec
                                .encode(implementation_class_uid)
                                .context(EncodeTextSnafu {
                                    field: "Implementation-class-uid",
                                })?;
                        writer.write_all(&bytes).context(WriteFieldSnafu {
                            field: "Implementation-class-uid",
                        })
                    })?;
                }
                UserVariableItem::ImplementationVersionName(implementation_version_name) => {
                    // Implementation Version Name Sub-Item - 55H
                    writer
                        .write_u8(0x55)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, "Item-length", |writer| {
                        let bytes = codec.encode(implementation_version_name).context(
                            EncodeTextSnafu {
                                field: "Implementation-version-name",
                            },
                        )?;
                        writer.write_all(&bytes).context(WriteFieldSnafu {
                            field: "Implementation-version-name",
                        })
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    // User Identity Sub-Item - 58H
                    writer
                        .write_u8(0x58)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, "Item-length", |writer| {
                        writer
                            .write_u8(user_identity.identity_type() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-identity-type",
                            })?;
                        writer
                            .write_u8(user_identity.positive_response_requested() as u8)
                            .context(WriteFieldSnafu {
                                field: "Positive-response-requested",
                            })?;
                        writer
                            .write_u16::<BigEndian>(user_identity.primary_field().len() as u16)
                            .context(WriteFieldSnafu {
                                field: "Primary-field-length",
                            })?;
                        writer
                            .write_all(user_identity.primary_field())
                            .context(WriteFieldSnafu {
                                field: "Primary-field",
                            })?;
                        writer
                            .write_u16::<BigEndian>(user_identity.secondary_field().len() as u16)
                            .context(WriteFieldSnafu {
                                field: "Secondary-field-length",
                            })?;
                        writer
                            .write_all(user_identity.secondary_field())
                            .context(WriteFieldSnafu {
                                field: "Secondary-field",
                            })
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    writer
                        .write_u8(*item_type)
                        .context(WriteFieldSnafu { field: "Item-type" })?;
                    writer
                        .write_u8(0x00)
                        .context(WriteReservedSnafu { bytes: 1_u32 })?;
                    write_chunk_u16(writer, "Item-length", |writer| {
                        writer
                            .write_all(data)
                            .context(WriteFieldSnafu { field: "Unknown" })
                    })?;
                }
            }
        }
        Ok(())
    })
}
