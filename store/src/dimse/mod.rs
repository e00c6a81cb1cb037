//! DIMSE message assembly and emission.
//!
//! A DIMSE message is a command set plus an optional data set,
//! interleaved over presentation data value fragments.
//! The [`assembler`] reconstructs inbound messages from fragments,
//! optionally spilling large data sets to a file;
//! the [`emitter`] fragments outbound messages
//! to the negotiated maximum PDU length.
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::command::CommandSet;

pub mod assembler;
pub mod emitter;

pub use assembler::{AssemblerOptions, DimseAssembler};
pub use emitter::{send_dimse, PayloadSource};

/// Observer of DIMSE transfer progress.
///
/// All methods default to no-ops;
/// implementations must not block,
/// as the callbacks run on the session's own thread.
#[allow(unused_variables)]
pub trait DimseMonitor {
    /// An inbound message started arriving on this presentation context.
    fn on_receive_begin(&self, presentation_context_id: u8) {}

    /// More bytes of the inbound message arrived.
    fn on_receive_progress(&self, presentation_context_id: u8, bytes_transferred: u64) {}

    /// The inbound message is complete.
    fn on_receive_complete(&self, presentation_context_id: u8, bytes_transferred: u64) {}

    /// An outbound message is about to be sent;
    /// `total_bytes` estimates the full body length.
    fn on_send_begin(&self, presentation_context_id: u8, total_bytes: u64) {}

    /// More bytes of the outbound message were handed to the transport.
    fn on_send_progress(&self, presentation_context_id: u8, bytes_sent: u64) {}

    /// The outbound message was fully sent.
    fn on_send_complete(&self, presentation_context_id: u8, bytes_sent: u64) {}
}

/// The no-op monitor.
impl DimseMonitor for () {}

/// A fully assembled inbound DIMSE message.
#[derive(Debug)]
pub struct DimseMessage {
    /// The presentation context the message arrived on
    pub presentation_context_id: u8,
    /// The decoded command set
    pub command: CommandSet,
    /// The data set that followed the command, if any
    pub dataset: Option<DimsePayload>,
    /// Total payload bytes received for this message,
    /// command and data set fragments combined
    pub bytes_transferred: u64,
}

/// The data set portion of an assembled DIMSE message.
#[derive(Debug)]
pub enum DimsePayload {
    /// The data set bytes, in the transfer syntax
    /// of the accepted presentation context
    InMemory(Vec<u8>),
    /// The data set was written to a DICOM file
    /// with a file meta group for the accepted presentation context
    Spilled {
        path: PathBuf,
        /// Whether the file is a scratch file owned by the assembler,
        /// to be deleted after the message is consumed
        owned: bool,
    },
}

impl DimsePayload {
    /// The path of the spilled file, if the data set was spilled.
    pub fn path(&self) -> Option<&Path> {
        match self {
            DimsePayload::Spilled { path, .. } => Some(path),
            DimsePayload::InMemory(_) => None,
        }
    }

    /// Remove the backing scratch file if the assembler owns one.
    pub(crate) fn cleanup(&self) {
        if let DimsePayload::Spilled { path, owned: true } = self {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("could not remove spill file {}: {}", path.display(), e);
            }
        }
    }
}
