//! Reassembly of inbound DIMSE messages
//! from presentation data value fragments.
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use courier_ul::pdu::{PDataValue, PDataValueType, PresentationContextNegotiated};
use dicom_object::FileMetaTableBuilder;
use snafu::{whatever, OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::command::{CommandField, CommandSet};
use crate::{Error, Result};

use super::{DimseMessage, DimseMonitor, DimsePayload};

/// A function which picks a destination file
/// for an announced inbound C-STORE data set.
///
/// It is consulted once the C-STORE request command is complete
/// but before any data set bytes arrive;
/// returning a path makes the assembler write a DICOM file header
/// and stream the data set bytes directly into that file.
pub type DestinationPicker = Box<dyn Fn(&CommandSet) -> Option<PathBuf> + Send>;

/// Configuration for the DIMSE assembler.
#[derive(Debug, Default)]
pub struct AssemblerOptions {
    /// Spill inbound data sets to a scratch file
    /// instead of collecting them in memory.
    pub use_file_buffer: bool,
    /// Where to put the spill files;
    /// the system temporary directory when unset.
    pub spill_directory: Option<PathBuf>,
}

/// The assembly state of one inbound DIMSE message.
#[derive(Debug)]
struct DimseExchange {
    presentation_context_id: u8,
    command_buffer: Vec<u8>,
    command: Option<CommandSet>,
    sink: Option<DatasetSink>,
    bytes_transferred: u64,
}

#[derive(Debug)]
enum DatasetSink {
    Memory(Vec<u8>),
    File {
        path: PathBuf,
        file: File,
        owned: bool,
    },
}

/// An assembler of inbound DIMSE messages.
///
/// Presentation data values are fed one by one;
/// once the fragments of a command (and its data set, when announced)
/// are all in, a complete [`DimseMessage`] comes out.
/// A decoding failure discards the exchange
/// and removes any scratch file created for it.
pub struct DimseAssembler {
    options: AssemblerOptions,
    destination_picker: Option<DestinationPicker>,
    exchange: Option<DimseExchange>,
}

impl DimseAssembler {
    pub fn new(options: AssemblerOptions) -> Self {
        DimseAssembler {
            options,
            destination_picker: None,
            exchange: None,
        }
    }

    /// Install a hook which may pick the destination file
    /// for inbound C-STORE data sets.
    pub fn with_destination_picker(mut self, picker: DestinationPicker) -> Self {
        self.destination_picker = Some(picker);
        self
    }

    /// Whether a message is partially assembled.
    pub fn in_progress(&self) -> bool {
        self.exchange.is_some()
    }

    /// Feed one presentation data value into the assembler.
    ///
    /// Returns the completed message once its last fragment is consumed.
    pub fn feed(
        &mut self,
        pdv: PDataValue,
        contexts: &[PresentationContextNegotiated],
        monitor: &dyn DimseMonitor,
    ) -> Result<Option<DimseMessage>> {
        match self.feed_impl(pdv, contexts, monitor) {
            Ok(out) => Ok(out),
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    /// Drop the exchange in progress,
    /// removing any scratch file created for it.
    pub fn discard(&mut self) {
        if let Some(exchange) = self.exchange.take() {
            if let Some(DatasetSink::File { path, file, owned }) = exchange.sink {
                drop(file);
                if owned {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("could not remove spill file {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    fn feed_impl(
        &mut self,
        pdv: PDataValue,
        contexts: &[PresentationContextNegotiated],
        monitor: &dyn DimseMonitor,
    ) -> Result<Option<DimseMessage>> {
        match &self.exchange {
            Some(exchange) => {
                if exchange.presentation_context_id != pdv.presentation_context_id {
                    whatever!(
                        "interleaved presentation context {} in exchange on context {}",
                        pdv.presentation_context_id,
                        exchange.presentation_context_id
                    );
                }
            }
            None => {
                monitor.on_receive_begin(pdv.presentation_context_id);
                self.exchange = Some(DimseExchange {
                    presentation_context_id: pdv.presentation_context_id,
                    command_buffer: Vec::new(),
                    command: None,
                    sink: None,
                    bytes_transferred: 0,
                });
            }
        }

        {
            let exchange = self.exchange.as_mut().expect("exchange was just ensured");
            exchange.bytes_transferred += pdv.data.len() as u64;
            monitor.on_receive_progress(pdv.presentation_context_id, exchange.bytes_transferred);
        }

        match pdv.value_type {
            PDataValueType::Command => {
                {
                    let exchange = self.exchange.as_mut().expect("exchange was just ensured");
                    if exchange.command.is_some() {
                        whatever!("command fragment after the command was complete");
                    }
                    exchange.command_buffer.extend(pdv.data);
                    if !pdv.is_last {
                        return Ok(None);
                    }
                }

                let command = {
                    let exchange = self.exchange.as_ref().expect("exchange was just ensured");
                    CommandSet::decode(&exchange.command_buffer)?
                };
                debug!(
                    "received command {:?} on context {}",
                    command.field, pdv.presentation_context_id
                );
                if command.has_data_set {
                    // a data set follows, set up its destination now
                    let sink = self.prepare_sink(&command, contexts, pdv.presentation_context_id)?;
                    let exchange = self.exchange.as_mut().expect("exchange was just ensured");
                    exchange.sink = Some(sink);
                    exchange.command = Some(command);
                    Ok(None)
                } else {
                    let exchange = self.exchange.take().expect("exchange was just ensured");
                    monitor.on_receive_complete(
                        exchange.presentation_context_id,
                        exchange.bytes_transferred,
                    );
                    Ok(Some(DimseMessage {
                        presentation_context_id: exchange.presentation_context_id,
                        command,
                        dataset: None,
                        bytes_transferred: exchange.bytes_transferred,
                    }))
                }
            }
            PDataValueType::Data => {
                let exchange = self.exchange.as_mut().expect("exchange was just ensured");
                if exchange.command.is_none() {
                    whatever!("data set fragment before the command was complete");
                }
                match exchange
                    .sink
                    .as_mut()
                    .expect("a sink exists whenever a data set was announced")
                {
                    DatasetSink::Memory(buffer) => buffer.extend(pdv.data),
                    DatasetSink::File { file, path, .. } => {
                        // append-only; the file is reopened for reading
                        // after the exchange completes
                        file.write_all(&pdv.data).with_whatever_context(|_| {
                            format!("could not write to spill file {}", path.display())
                        })?;
                    }
                }
                if !pdv.is_last {
                    return Ok(None);
                }

                let exchange = self.exchange.take().expect("exchange was just ensured");
                let dataset = match exchange.sink {
                    Some(DatasetSink::Memory(buffer)) => DimsePayload::InMemory(buffer),
                    Some(DatasetSink::File {
                        path,
                        mut file,
                        owned,
                    }) => {
                        file.flush().with_whatever_context(|_| {
                            format!("could not flush spill file {}", path.display())
                        })?;
                        drop(file);
                        DimsePayload::Spilled { path, owned }
                    }
                    None => unreachable!("a sink exists whenever a data set was announced"),
                };
                monitor.on_receive_complete(
                    exchange.presentation_context_id,
                    exchange.bytes_transferred,
                );
                Ok(Some(DimseMessage {
                    presentation_context_id: exchange.presentation_context_id,
                    command: exchange
                        .command
                        .expect("data set fragments only follow a complete command"),
                    dataset: Some(dataset),
                    bytes_transferred: exchange.bytes_transferred,
                }))
            }
        }
    }

    /// Decide where the announced data set goes:
    /// a file picked by the application,
    /// a scratch file, or memory.
    fn prepare_sink(
        &self,
        command: &CommandSet,
        contexts: &[PresentationContextNegotiated],
        presentation_context_id: u8,
    ) -> Result<DatasetSink> {
        if command.field == CommandField::CStoreRq {
            if let Some(picker) = &self.destination_picker {
                if let Some(path) = picker(command) {
                    let mut file = File::create(&path).with_whatever_context(|_| {
                        format!("could not create destination file {}", path.display())
                    })?;
                    write_file_header(&mut file, &path, command, contexts, presentation_context_id)?;
                    return Ok(DatasetSink::File {
                        path,
                        file,
                        owned: false,
                    });
                }
            }
        }

        if self.options.use_file_buffer {
            let dir = self
                .options
                .spill_directory
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            let (mut file, path) = tempfile::Builder::new()
                .prefix("courier-dimse-")
                .suffix(".dcm")
                .tempfile_in(&dir)
                .whatever_context("could not create spill file")?
                .keep()
                .whatever_context("could not persist spill file")?;
            if let Err(e) =
                write_file_header(&mut file, &path, command, contexts, presentation_context_id)
            {
                drop(file);
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
            Ok(DatasetSink::File {
                path,
                file,
                owned: true,
            })
        } else {
            Ok(DatasetSink::Memory(Vec::new()))
        }
    }
}

/// Remove any scratch file of an abandoned exchange.
impl Drop for DimseAssembler {
    fn drop(&mut self) {
        self.discard();
    }
}

/// Write the 128-byte preamble and a synthetic file meta group
/// derived from the command and the accepted presentation context.
fn write_file_header(
    file: &mut File,
    path: &std::path::Path,
    command: &CommandSet,
    contexts: &[PresentationContextNegotiated],
    presentation_context_id: u8,
) -> Result<()> {
    let context = contexts
        .iter()
        .find(|pc| pc.id == presentation_context_id)
        .whatever_context::<_, Error>("no presentation context for inbound data set")?;
    let sop_class_uid = command
        .affected_sop_class_uid
        .as_deref()
        .whatever_context::<_, Error>("C-STORE request misses the affected SOP class UID")?;
    let sop_instance_uid = command
        .affected_sop_instance_uid
        .as_deref()
        .whatever_context::<_, Error>("C-STORE request misses the affected SOP instance UID")?;

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(&context.transfer_syntax)
        .build()
        .whatever_context("could not build file meta information")?;

    file.write_all(&[0_u8; 128])
        .with_whatever_context(|_| format!("could not write preamble to {}", path.display()))?;
    meta.write(&mut *file)
        .with_whatever_context(|_| {
            format!("could not write file meta group to {}", path.display())
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_ul::pdu::PresentationContextResultReason;
    use dicom_dictionary_std::uids;

    fn contexts() -> Vec<PresentationContextNegotiated> {
        vec![PresentationContextNegotiated {
            id: 1,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            abstract_syntax: uids::CT_IMAGE_STORAGE.to_string(),
        }]
    }

    fn command_pdvs(command: &CommandSet) -> Vec<PDataValue> {
        let bytes = command.encode().unwrap();
        let cut = bytes.len() / 2;
        vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: false,
                data: bytes[..cut].to_vec(),
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: bytes[cut..].to_vec(),
            },
        ]
    }

    #[test]
    fn assembles_command_without_data_set() {
        let mut assembler = DimseAssembler::new(AssemblerOptions::default());
        let rq = CommandSet::c_echo_rq(5);

        let mut message = None;
        for pdv in command_pdvs(&rq) {
            message = assembler.feed(pdv, &contexts(), &()).unwrap();
        }
        let message = message.expect("message should be complete");
        assert_eq!(message.command, rq);
        assert!(message.dataset.is_none());
        assert!(!assembler.in_progress());
    }

    #[test]
    fn assembles_command_and_fragmented_data_set() {
        let mut assembler = DimseAssembler::new(AssemblerOptions::default());
        let rq = CommandSet::c_store_rq(
            1,
            uids::CT_IMAGE_STORAGE,
            "1.2.3.4",
            crate::command::Priority::Medium,
        );

        let mut total = 0u64;
        for pdv in command_pdvs(&rq) {
            total += pdv.data.len() as u64;
            assert!(assembler.feed(pdv, &contexts(), &()).unwrap().is_none());
        }
        assert!(assembler.in_progress());

        let payload: Vec<u8> = (0..10_000u32).map(|x| x as u8).collect();
        let mut message = None;
        for (i, chunk) in payload.chunks(4000).enumerate() {
            total += chunk.len() as u64;
            message = assembler
                .feed(
                    PDataValue {
                        presentation_context_id: 1,
                        value_type: PDataValueType::Data,
                        is_last: i == 2,
                        data: chunk.to_vec(),
                    },
                    &contexts(),
                    &(),
                )
                .unwrap();
        }

        let message = message.expect("message should be complete");
        assert_eq!(message.bytes_transferred, total);
        match message.dataset {
            Some(DimsePayload::InMemory(data)) => assert_eq!(data, payload),
            other => panic!("expected in-memory data set, got {:?}", other),
        }
    }

    #[test]
    fn spills_data_set_to_file_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut assembler = DimseAssembler::new(AssemblerOptions {
            use_file_buffer: true,
            spill_directory: Some(dir.path().to_path_buf()),
        });
        let rq = CommandSet::c_store_rq(
            1,
            uids::CT_IMAGE_STORAGE,
            "1.2.3.4",
            crate::command::Priority::Medium,
        );

        for pdv in command_pdvs(&rq) {
            assembler.feed(pdv, &contexts(), &()).unwrap();
        }
        let payload = vec![0xAB_u8; 2048];
        let message = assembler
            .feed(
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: payload.clone(),
                },
                &contexts(),
                &(),
            )
            .unwrap()
            .expect("message should be complete");

        let payload_out = match &message.dataset {
            Some(p @ DimsePayload::Spilled { path, owned: true }) => {
                let bytes = std::fs::read(path).unwrap();
                // preamble, magic code, meta group, then the payload
                assert_eq!(&bytes[128..132], b"DICM");
                assert!(bytes.ends_with(&payload));
                p
            }
            other => panic!("expected spilled data set, got {:?}", other),
        };

        // consuming the message removes the scratch file
        let path = payload_out.path().unwrap().to_path_buf();
        payload_out.cleanup();
        assert!(!path.exists());
    }

    #[test]
    fn streams_into_pre_announced_destination_file() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("incoming-1.2.3.4.dcm");
        let picked = destination.clone();
        let mut assembler = DimseAssembler::new(AssemblerOptions::default())
            .with_destination_picker(Box::new(move |command| {
                command
                    .affected_sop_instance_uid
                    .as_deref()
                    .map(|_| picked.clone())
            }));
        let rq = CommandSet::c_store_rq(
            1,
            uids::CT_IMAGE_STORAGE,
            "1.2.3.4",
            crate::command::Priority::Medium,
        );

        for pdv in command_pdvs(&rq) {
            assembler.feed(pdv, &contexts(), &()).unwrap();
        }
        let payload = vec![0x5A_u8; 512];
        let message = assembler
            .feed(
                PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: payload.clone(),
                },
                &contexts(),
                &(),
            )
            .unwrap()
            .expect("message should be complete");

        match &message.dataset {
            Some(p @ DimsePayload::Spilled { path, owned: false }) => {
                assert_eq!(path, &destination);
                let bytes = std::fs::read(path).unwrap();
                assert_eq!(&bytes[128..132], b"DICM");
                assert!(bytes.ends_with(&payload));
                // a user-picked destination survives the cleanup post-hook
                p.cleanup();
                assert!(destination.exists());
            }
            other => panic!("expected a destination file, got {:?}", other),
        }
    }

    #[test]
    fn decode_error_discards_spill_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut assembler = DimseAssembler::new(AssemblerOptions {
            use_file_buffer: true,
            spill_directory: Some(dir.path().to_path_buf()),
        });

        // garbage bytes are not a DICOM command
        let result = assembler.feed(
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0xFF; 32],
            },
            &contexts(),
            &(),
        );
        assert!(result.is_err());
        assert!(!assembler.in_progress());
        // no stray spill files
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
