//! Routing of completed inbound DIMSE messages to service handlers.
//!
//! Handlers are selected by command field;
//! any command field without a handler makes the node
//! abort the association,
//! so a deliberately narrow node stays predictable.
use std::io::{Read, Write};

use courier_ul::association::{Association, SessionSocket};
use courier_ul::pdu::{PDataValue, PDataValueType, Pdu};
use courier_ul::ServerAssociation;
use tracing::{debug, info, warn};

use crate::command::{CommandField, CommandSet};
use crate::dimse::{DimseAssembler, DimseMessage, DimsePayload};
use crate::{Error, Result};

/// What to do after an inbound DIMSE message was handled.
#[derive(Debug)]
pub enum ServiceReply {
    /// Nothing to send back
    None,
    /// Answer with this command set (carrying no data set)
    Command(CommandSet),
    /// Abort the association
    Abort,
}

/// The service handlers of a DICOM node.
///
/// Each method handles one inbound command field
/// and decides what goes back to the peer.
/// The default C-ECHO request handler answers with success;
/// every other default declines by aborting the association,
/// except for responses, which are ignored.
#[allow(unused_variables)]
pub trait ServiceHandlers {
    /// Handle a C-ECHO request.
    fn on_c_echo_rq(&mut self, command: &CommandSet) -> ServiceReply {
        ServiceReply::Command(CommandSet::c_echo_rsp(command, 0x0000))
    }

    /// Handle a C-ECHO response.
    fn on_c_echo_rsp(&mut self, command: &CommandSet) -> ServiceReply {
        ServiceReply::None
    }

    /// Handle a C-STORE request.
    ///
    /// The data set is provided either in memory
    /// or as the path of a file it was spilled to;
    /// a spill file owned by the assembler is deleted
    /// once this handler returns.
    fn on_c_store_rq(
        &mut self,
        command: &CommandSet,
        dataset: Option<&DimsePayload>,
    ) -> ServiceReply {
        ServiceReply::Abort
    }

    /// Handle a C-STORE response.
    fn on_c_store_rsp(&mut self, command: &CommandSet) -> ServiceReply {
        ServiceReply::None
    }
}

/// Route one completed DIMSE message
/// to the matching service handler.
///
/// Command fields with no specialized handler
/// resolve to [`ServiceReply::Abort`].
pub fn dispatch(handlers: &mut dyn ServiceHandlers, message: &DimseMessage) -> ServiceReply {
    match message.command.field {
        CommandField::CEchoRq => handlers.on_c_echo_rq(&message.command),
        CommandField::CEchoRsp => handlers.on_c_echo_rsp(&message.command),
        CommandField::CStoreRq => {
            handlers.on_c_store_rq(&message.command, message.dataset.as_ref())
        }
        CommandField::CStoreRsp => handlers.on_c_store_rsp(&message.command),
        field => {
            debug!("no handler for command field {:04X}H", field.code());
            ServiceReply::Abort
        }
    }
}

/// Drive an accepted association until it is released,
/// aborted, or lost,
/// assembling inbound messages and dispatching them
/// to the given handlers.
///
/// The assembler decides where inbound data sets go
/// (memory, a spill file, or a pre-announced destination file);
/// spill files owned by the assembler are deleted
/// after the handler consumed the message.
pub fn serve<S>(
    mut association: ServerAssociation<S>,
    handlers: &mut dyn ServiceHandlers,
    mut assembler: DimseAssembler,
) -> Result<()>
where
    S: Read + Write + SessionSocket,
{
    loop {
        let pdu = association.receive().map_err(Error::from_association)?;
        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    let message =
                        match assembler.feed(pdv, association.presentation_contexts(), &()) {
                            Ok(None) => continue,
                            Ok(Some(message)) => message,
                            Err(e) => {
                                warn!("discarding broken DIMSE exchange: {}", e);
                                let _ = association.abort();
                                return Err(e);
                            }
                        };

                    let reply = dispatch(handlers, &message);
                    if let Some(dataset) = &message.dataset {
                        dataset.cleanup();
                    }
                    match reply {
                        ServiceReply::None => {}
                        ServiceReply::Command(command) => {
                            let data = command.encode()?;
                            association
                                .send(&Pdu::PData {
                                    data: vec![PDataValue {
                                        presentation_context_id: message.presentation_context_id,
                                        value_type: PDataValueType::Command,
                                        is_last: true,
                                        data,
                                    }],
                                })
                                .map_err(Error::from_association)?;
                        }
                        ServiceReply::Abort => {
                            let _ = association.abort();
                            return Ok(());
                        }
                    }
                }
            }
            Pdu::ReleaseRQ => {
                association.respond_release().map_err(Error::from_association)?;
                info!("released association with {}", association.client_ae_title());
                return Ok(());
            }
            // every other PDU was screened out by `receive`
            pdu => {
                debug!("ignoring {}", pdu.short_description());
            }
        }
    }
}
