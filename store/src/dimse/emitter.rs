//! Emission of outbound DIMSE messages
//! as fragmented P-DATA-TF PDUs.
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use courier_ul::association::{Association, SessionSocket};
use courier_ul::pdu::{PDataValue, PDataValueType, Pdu, PDU_HEADER_SIZE};
use courier_ul::ClientAssociation;
use dicom_object::meta::FileMetaTable;
use snafu::ResultExt;

use crate::command::CommandSet;
use crate::{CancelledSnafu, Error, Result};

use super::DimseMonitor;

/// How many payload bytes go through the fragmenter at once;
/// the cancellation flag is observed between chunks.
const CHUNK_SIZE: usize = 8 * 1024;

/// The source of the data set accompanying an outbound DIMSE message.
#[derive(Debug)]
pub enum PayloadSource<'a> {
    /// An already-encoded data set,
    /// in the transfer syntax of the presentation context
    Bytes(&'a [u8]),
    /// A DICOM file whose data set portion is streamed as-is,
    /// skipping the preamble and file meta group;
    /// the file's own encoding must match the presentation context
    File(&'a Path),
}

/// Send one DIMSE message over an established association.
///
/// The command set is emitted first, as command fragments;
/// the data set (when given) follows as data fragments,
/// re-fragmented to the effective maximum PDU length.
/// Small messages are packed into a single P-DATA-TF PDU.
///
/// `cancel` is observed between fragments on the data set path;
/// once raised, emission stops with
/// [`Cancelled`](crate::Error::Cancelled)
/// and the association must be aborted by the caller,
/// as the peer was left with an incomplete message.
///
/// Returns the number of body bytes handed to the transport.
pub fn send_dimse<S>(
    association: &mut ClientAssociation<S>,
    presentation_context_id: u8,
    command: &CommandSet,
    payload: Option<PayloadSource<'_>>,
    monitor: &dyn DimseMonitor,
    cancel: Option<&AtomicBool>,
) -> Result<u64>
where
    S: Read + Write + SessionSocket,
{
    let cmd_data = command.encode()?;

    let payload_length = match &payload {
        None => 0,
        Some(PayloadSource::Bytes(data)) => data.len() as u64,
        Some(PayloadSource::File(path)) => {
            // measured while sending; estimate from the file size
            std::fs::metadata(path)
                .map(|m| m.len())
                .unwrap_or_default()
        }
    };
    let total_estimate = cmd_data.len() as u64 + payload_length;
    monitor.on_send_begin(presentation_context_id, total_estimate);

    let small_pdu_limit = association
        .effective_send_pdu_length()
        .saturating_sub(2 * PDU_HEADER_SIZE) as u64;

    let mut bytes_sent;
    match payload {
        // data set small enough to ride along in the same PDU
        Some(PayloadSource::Bytes(data))
            if cmd_data.len() as u64 + data.len() as u64 <= small_pdu_limit =>
        {
            bytes_sent = cmd_data.len() as u64 + data.len() as u64;
            association
                .send(&Pdu::PData {
                    data: vec![
                        PDataValue {
                            presentation_context_id,
                            value_type: PDataValueType::Command,
                            is_last: true,
                            data: cmd_data,
                        },
                        PDataValue {
                            presentation_context_id,
                            value_type: PDataValueType::Data,
                            is_last: true,
                            data: data.to_vec(),
                        },
                    ],
                })
                .map_err(Error::from_association)?;
            monitor.on_send_progress(presentation_context_id, bytes_sent);
        }
        payload => {
            bytes_sent = cmd_data.len() as u64;
            association
                .send(&Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: cmd_data,
                    }],
                })
                .map_err(Error::from_association)?;
            monitor.on_send_progress(presentation_context_id, bytes_sent);

            match payload {
                None => {}
                Some(PayloadSource::Bytes(data)) => {
                    bytes_sent += stream_chunks(
                        association,
                        presentation_context_id,
                        &mut std::io::Cursor::new(data),
                        bytes_sent,
                        monitor,
                        cancel,
                    )?;
                }
                Some(PayloadSource::File(path)) => {
                    let mut file = open_data_set(path)?;
                    bytes_sent += stream_chunks(
                        association,
                        presentation_context_id,
                        &mut file,
                        bytes_sent,
                        monitor,
                        cancel,
                    )?;
                }
            }
        }
    }

    monitor.on_send_complete(presentation_context_id, bytes_sent);
    Ok(bytes_sent)
}

/// Stream data set bytes through the P-Data fragmenter,
/// observing the cancellation flag between chunks.
fn stream_chunks<S, R>(
    association: &mut ClientAssociation<S>,
    presentation_context_id: u8,
    source: &mut R,
    sent_before: u64,
    monitor: &dyn DimseMonitor,
    cancel: Option<&AtomicBool>,
) -> Result<u64>
where
    S: Read + Write + SessionSocket,
    R: Read,
{
    let mut writer = association.send_pdata(presentation_context_id);
    let mut buffer = [0_u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        if cancel.map(|c| c.load(Ordering::Relaxed)).unwrap_or(false) {
            // do not finish the stream: the peer must not take
            // the truncated data set for a complete one
            writer.abandon();
            return CancelledSnafu.fail();
        }
        let n = source
            .read(&mut buffer)
            .whatever_context("could not read data set bytes")?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer[..n])
            .context(courier_ul::association::WireSendSnafu)
            .map_err(Error::from_association)?;
        sent += n as u64;
        monitor.on_send_progress(presentation_context_id, sent_before + sent);
    }
    writer
        .finish()
        .context(courier_ul::association::WireSendSnafu)
        .map_err(Error::from_association)?;
    Ok(sent)
}

/// Open a DICOM file and position the reader
/// at the start of its data set,
/// past the preamble and the file meta group.
fn open_data_set(path: &Path) -> Result<File> {
    let mut file = File::open(path)
        .with_whatever_context(|_| format!("could not open DICOM file {}", path.display()))?;
    let mut preamble = [0_u8; 128];
    file.read_exact(&mut preamble)
        .with_whatever_context(|_| format!("could not read preamble of {}", path.display()))?;
    FileMetaTable::from_reader(&mut file)
        .with_whatever_context(|_| {
            format!("could not read file meta group of {}", path.display())
        })?;
    // the reader now sits at the first data set byte
    Ok(file)
}
