//! DIMSE messaging and C-STORE SCU orchestration
//! for the Courier DICOM agent.
//!
//! This crate builds the message layer of the DICOM network protocol
//! on top of the upper layer engine in [`courier_ul`]:
//!
//! - The [`command`] module provides the typed DIMSE command set record
//!   and its encoding as a DICOM data set in Implicit VR Little Endian.
//! - The [`dimse`] module assembles inbound DIMSE messages from
//!   presentation data value fragments (optionally spilling large data sets
//!   to a file) and emits outbound messages fragmented to the
//!   negotiated maximum PDU length.
//! - The [`service`] module routes completed inbound messages
//!   to service handlers selected by command field.
//! - The [`store`] module drives the C-STORE service class user role:
//!   a request queue with background preloading, per-request transfer
//!   syntax resolution and transcoding, a send loop with linger,
//!   and reconnect semantics on transport loss.
//! - The [`codec`] module names the capability expected from
//!   pixel data codec collaborators, with a default implementation
//!   backed by the transfer syntax registry.

pub mod codec;
pub mod command;
pub mod dimse;
pub mod service;
pub mod store;

use snafu::Snafu;

pub use codec::{CodecParams, PixelDataCodec, RegistryCodec};
pub use command::{status_class, CommandField, CommandSet, Priority, StatusClass};
pub use dimse::{DimseMessage, DimsePayload, DimseMonitor};
pub use service::{dispatch, ServiceHandlers, ServiceReply};
pub use store::{
    CStoreRequest, CancelHandle, RequestStatus, StoreClient, StoreClientOptions, StoreObserver,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The errors of the DIMSE and store layers.
///
/// Variants are grouped by how they propagate:
/// [`ProtocolViolation`](Error::ProtocolViolation),
/// [`NetworkError`](Error::NetworkError) and
/// [`DimseTimeout`](Error::DimseTimeout) terminate the association;
/// [`NegotiationFailure`](Error::NegotiationFailure) means that
/// no association came to be;
/// the remaining variants concern a single request
/// and leave the association intact.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// a PDU was structurally invalid or unexpected for the session state
    #[snafu(display("protocol violation: {}", source))]
    ProtocolViolation {
        source: courier_ul::association::Error,
    },

    /// the proposed association was not accepted
    #[snafu(display("association negotiation failed: {}", source))]
    NegotiationFailure {
        source: courier_ul::association::Error,
    },

    /// the transport failed beneath the association
    #[snafu(display("network error: {}", source))]
    NetworkError {
        source: courier_ul::association::Error,
    },

    /// inbound traffic stayed quiet beyond the DIMSE timeout
    #[snafu(display("DIMSE timeout: {}", source))]
    DimseTimeout {
        source: courier_ul::association::Error,
    },

    /// pixel data transcoding failed
    #[snafu(display("codec failure: {}", message))]
    CodecError { message: String },

    /// the association offers no usable presentation context
    /// for the request's SOP class
    #[snafu(display("no accepted presentation context for SOP class {}", sop_class_uid))]
    NoAcceptedContext { sop_class_uid: String },

    /// the remote node answered with a non-success status
    #[snafu(display("service responded with status {:04X}H", status))]
    ServiceStatus { status: u16 },

    /// an inbound DIMSE message did not belong to the running exchange
    #[snafu(display("unexpected DIMSE message (command field {:04X}H)", field))]
    UnexpectedDimse { field: u16 },

    /// the operation was cancelled locally
    #[snafu(display("operation cancelled"))]
    Cancelled,

    #[snafu(whatever, display("{}", message))]
    Other {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync + 'static>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

impl Error {
    /// Whether the error terminated (or prevented) the association,
    /// as opposed to failing a single request.
    pub fn ends_association(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation { .. }
                | Error::NegotiationFailure { .. }
                | Error::NetworkError { .. }
                | Error::DimseTimeout { .. }
                | Error::UnexpectedDimse { .. }
        )
    }

    /// Classify an upper layer association error
    /// into this crate's taxonomy.
    pub fn from_association(e: courier_ul::association::Error) -> Self {
        use courier_ul::association::Error as E;
        match &e {
            E::Rejected { .. }
            | E::NoAcceptedPresentationContexts { .. }
            | E::ProtocolVersionMismatch { .. } => Error::NegotiationFailure { source: e },
            E::DimseTimeout { .. } => Error::DimseTimeout { source: e },
            E::ToAddress { .. } | E::SetReadTimeout { .. } | E::SetWriteTimeout { .. } => {
                Error::NetworkError { source: e }
            }
            _ if e.is_transport() => Error::NetworkError { source: e },
            _ => Error::ProtocolViolation { source: e },
        }
    }
}
