//! The C-STORE service class user role.
//!
//! [`StoreClient`] owns a queue of file-backed store requests
//! and drives the whole lifecycle on a background session thread:
//! association negotiation with presentation contexts derived
//! from the queued files, per-request transfer syntax resolution
//! and transcoding, one C-STORE exchange in flight at a time,
//! a linger window before release, and reconnection on transport loss.
use std::time::Duration;

use courier_ul::pdu::DEFAULT_MAX_PDU;

use crate::codec::CodecParams;
use crate::Error;

pub mod client;
pub(crate) mod queue;
pub mod request;

pub use client::{CancelHandle, StoreClient};
pub use request::{CStoreRequest, RequestHandle, RequestStatus};

/// Configuration of a [`StoreClient`].
#[derive(Debug, Clone)]
pub struct StoreClientOptions {
    /// The AE title of this node
    pub calling_ae_title: String,
    /// The AE title of the peer;
    /// overrides the one in the target address
    pub called_ae_title: Option<String>,
    /// The maximum PDU length admitted for receiving;
    /// 0 proposes an unbounded length
    pub max_pdu_length: u32,
    /// A transfer syntax to propose first for every SOP class
    pub preferred_transfer_syntax: Option<String>,
    /// Encoder parameters applied when transcoding
    /// into the preferred transfer syntax
    pub preferred_transfer_syntax_params: Option<CodecParams>,
    /// Propose one presentation context per
    /// (abstract syntax, transfer syntax) pair,
    /// each carrying a single transfer syntax
    pub serialized_presentation_contexts: bool,
    /// Offer Explicit VR Little Endian in every proposal
    pub offer_explicit_syntax: bool,
    /// Always load and re-serialize data sets,
    /// even when the accepted transfer syntax
    /// matches the file's own
    pub disable_file_streaming: bool,
    /// How many queued requests the background preloader
    /// keeps loaded ahead of the sender
    pub preload_count: usize,
    /// For how long to keep the association open
    /// after the queue drains
    pub linger: Duration,
    /// Spill inbound data sets to a scratch file
    /// (server-side receive)
    pub use_file_buffer: bool,
    /// Bound on TCP connection establishment
    pub connect_timeout: Duration,
    /// Bound on individual socket operations
    pub socket_timeout: Duration,
    /// Bound on the quiet gap between inbound DIMSE messages
    pub dimse_timeout: Duration,
    /// Outbound throttling in bytes per second
    pub throttle_speed: Option<u32>,
}

impl Default for StoreClientOptions {
    fn default() -> Self {
        StoreClientOptions {
            calling_ae_title: "COURIER-SCU".to_string(),
            called_ae_title: None,
            max_pdu_length: DEFAULT_MAX_PDU,
            preferred_transfer_syntax: None,
            preferred_transfer_syntax_params: None,
            serialized_presentation_contexts: false,
            offer_explicit_syntax: true,
            disable_file_streaming: false,
            preload_count: 1,
            linger: Duration::ZERO,
            use_file_buffer: false,
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(30),
            dimse_timeout: Duration::from_secs(180),
            throttle_speed: None,
        }
    }
}

/// Observer of the store client lifecycle.
///
/// All methods default to no-ops.
/// The callbacks run on the session thread and must not block;
/// in particular, do not join the session from a callback.
#[allow(unused_variables)]
pub trait StoreObserver: Send + Sync {
    /// A request is about to be sent.
    fn on_request_begin(&self, request: &CStoreRequest) {}

    /// More bytes of the request were handed to the transport.
    fn on_request_progress(&self, request: &CStoreRequest, bytes_sent: u64) {}

    /// The request was stored by the peer
    /// (status success or warning).
    fn on_request_complete(&self, request: &CStoreRequest) {}

    /// The request failed and will not be retried.
    fn on_request_failed(&self, request: &CStoreRequest) {}

    /// A C-STORE response arrived for the request.
    fn on_response(&self, request: &CStoreRequest, status: u16) {}

    /// The queue was fully drained and the session is over.
    fn on_complete(&self) {}

    /// An association was closed;
    /// `closed_on_error` tells an orderly release
    /// apart from an errored teardown.
    fn on_closed(&self, closed_on_error: bool) {}

    /// The transport failed; a reconnect may follow.
    fn on_network_error(&self, error: &Error) {}
}

/// The no-op observer.
impl StoreObserver for () {}
