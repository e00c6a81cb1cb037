//! DICOM association module
//!
//! This module contains the utilities for establishing associations
//! between DICOM nodes via TCP/IP.
//!
//! As an association requester, often in the role of a service class user
//! (SCU), a new association is started via [`ClientAssociationOptions`].
//! The minimum required properties are the proposed presentation contexts
//! and the socket address of the target node.
//!
//! As an association acceptor, usually a service class provider (SCP),
//! a newly accepted [TCP stream][std::net::TcpStream] is passed to a
//! previously prepared [`ServerAssociationOptions`].
pub mod client;
pub mod server;

pub(crate) mod pdata;
mod throttle;
mod uid;

use std::{
    io::{BufRead, BufReader, Cursor, Read},
    time::Duration,
};

use bytes::{Buf, BytesMut};
use snafu::{ensure, Backtrace, ResultExt, Snafu};

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use pdata::{PDataReader, PDataWriter};
pub use server::{ServerAssociation, ServerAssociationOptions};
pub use throttle::ThrottledWriter;

use crate::pdu::{
    self, AssociationRJ, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE, Pdu, PresentationContextNegotiated,
    UserVariableItem,
};
use crate::write_pdu;

type Result<T, E = Error> = std::result::Result<T, E>;

/// The interval at which an established association polls its socket
/// for incoming bytes while waiting for a DIMSE message.
pub(crate) const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("application entity title `{}` is too long", ae_title))]
    InvalidAeTitle {
        ae_title: String,
        backtrace: Backtrace,
    },

    /// could not convert to socket address
    ToAddress {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not connect to server
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// Could not set tcp read timeout
    SetReadTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// Could not set tcp write timeout
    SetWriteTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to send PDU
    #[snafu(display("failed to send pdu: {}", source))]
    SendPdu {
        #[snafu(backtrace)]
        source: crate::pdu::WriteError,
    },

    /// failed to receive PDU
    #[snafu(display("failed to receive pdu: {}", source))]
    ReceivePdu {
        #[snafu(backtrace)]
        source: crate::pdu::ReadError,
    },

    #[snafu(display("unexpected PDU from peer `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedPdu {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
    },

    #[snafu(display("unknown PDU from peer `{:?}`", pdu))]
    #[non_exhaustive]
    UnknownPdu {
        /// the PDU obtained from the peer, of variant Unknown
        pdu: Box<Pdu>,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    /// association rejected by the peer
    #[snafu(display("association rejected {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// association aborted by the peer
    Aborted { backtrace: Backtrace },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    /// failed to send PDU message on wire
    #[non_exhaustive]
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to read PDU message from wire
    #[non_exhaustive]
    WireRead {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("no DIMSE message within {:?}", timeout))]
    #[non_exhaustive]
    DimseTimeout {
        timeout: Duration,
        backtrace: Backtrace,
    },

    /// the receive operation was interrupted locally
    Interrupted { backtrace: Backtrace },

    #[snafu(display("failed to close connection: {}", source))]
    Close {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "PDU is too large ({} bytes) to be sent to the remote application entity",
        length
    ))]
    #[non_exhaustive]
    SendTooLongPdu { length: usize, backtrace: Backtrace },

    #[snafu(display("connection closed by peer"))]
    ConnectionClosed,

    /// TLS configuration is required but not provided
    #[cfg(feature = "tls")]
    TlsConfigMissing { backtrace: Backtrace },

    /// Invalid server name for TLS connection
    #[cfg(feature = "tls")]
    InvalidServerName {
        source: rustls::pki_types::InvalidDnsNameError,
        backtrace: Backtrace,
    },

    /// Failed to establish TLS connection
    #[cfg(feature = "tls")]
    #[snafu(display("failed to establish TLS connection: {}", source))]
    TlsConnection {
        source: rustls::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Whether this error put the transport out of service,
    /// as opposed to a negotiation or protocol level outcome
    /// that leaves the connection intact.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::WireSend { .. }
                | Error::WireRead { .. }
                | Error::DimseTimeout { .. }
                | Error::ConnectionClosed
                | Error::Close { .. }
        )
    }
}

/// The lifecycle phase of an upper layer session,
/// after the A-ASSOCIATE negotiation has concluded.
///
/// The connect and negotiation phases (`IDLE` through `AWAIT_AC`
/// in the standard's state tables) are driven by the options builders,
/// so an association value begins its life in [`Established`](Self::Established).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Data transfer is possible in both directions.
    Established,
    /// An A-RELEASE-RQ was sent; waiting for the peer's reply.
    AwaitingRelease,
    /// The session is over and the socket is no longer usable.
    Closed,
}

/// Socket-level configuration for associations.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
    /// Timeout for individual socket read operations
    pub read_timeout: Option<Duration>,
    /// Timeout for individual socket write operations
    pub write_timeout: Option<Duration>,
    /// Timeout for connection establishment
    pub connection_timeout: Option<Duration>,
}

/// The socket capabilities required of a stream
/// backing an established association.
pub trait SessionSocket {
    /// Shut down the connection in both directions.
    fn close(&mut self) -> std::io::Result<()>;

    /// Adjust the read timeout of the underlying socket.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl SessionSocket for std::net::TcpStream {
    fn close(&mut self) -> std::io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        std::net::TcpStream::set_read_timeout(self, timeout)
    }
}

#[cfg(feature = "tls")]
impl SessionSocket for rustls::StreamOwned<rustls::ClientConnection, std::net::TcpStream> {
    fn close(&mut self) -> std::io::Result<()> {
        self.get_ref().shutdown(std::net::Shutdown::Both)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.get_ref().set_read_timeout(timeout)
    }
}

#[cfg(feature = "tls")]
impl SessionSocket for rustls::StreamOwned<rustls::ServerConnection, std::net::TcpStream> {
    fn close(&mut self) -> std::io::Result<()> {
        self.get_ref().shutdown(std::net::Shutdown::Both)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.get_ref().set_read_timeout(timeout)
    }
}

/// Common read-only properties of an established association,
/// regardless of the role taken in its negotiation.
pub trait Association {
    /// Obtain the remote DICOM node's application entity title.
    fn peer_ae_title(&self) -> &str;

    /// Retrieve the maximum PDU length admitted by the peer.
    ///
    /// A value of `u32::MAX` means that the peer did not specify a bound.
    fn peer_max_pdu_length(&self) -> u32;

    /// Retrieve the maximum PDU length
    /// that this application entity is expecting to receive.
    fn this_max_pdu_length(&self) -> u32;

    /// Obtain a view of the negotiated presentation contexts.
    fn presentation_contexts(&self) -> &[PresentationContextNegotiated];

    /// Retrieve the user variables received from the peer.
    fn user_variables(&self) -> &[UserVariableItem];

    /// The current phase of the session.
    fn state(&self) -> SessionState;

    /// Whether the session was closed by an I/O or protocol error
    /// rather than an orderly release.
    fn closed_on_error(&self) -> bool;

    /// The effective maximum length for the body of an outgoing PDU.
    ///
    /// When the peer did not bound its PDU length,
    /// a conservative internal cap is applied.
    fn effective_send_pdu_length(&self) -> u32 {
        let peer_max = self.peer_max_pdu_length();
        if peer_max == 0 || peer_max == u32::MAX {
            pdu::DEFAULT_MAX_PDU
        } else {
            peer_max.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE)
        }
    }
}

/// Encode a PDU into the given buffer,
/// guarding against PDUs too long for the peer.
pub(crate) fn encode_pdu(buffer: &mut Vec<u8>, pdu: &Pdu, peer_max_pdu_length: u32) -> Result<()> {
    write_pdu(buffer, pdu).context(SendPduSnafu)?;
    ensure!(
        buffer.len() <= peer_max_pdu_length.saturating_add(pdu::PDU_HEADER_SIZE) as usize,
        SendTooLongPduSnafu {
            length: buffer.len()
        }
    );
    Ok(())
}

/// Fetch a full PDU from a reader.
///
/// Chunks of data are kept in `read_buffer` between calls,
/// so the same buffer must be passed to subsequent calls
/// reading from the same stream.
pub(crate) fn read_pdu_from_wire<R>(
    reader: &mut R,
    read_buffer: &mut BytesMut,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Pdu>
where
    R: Read,
{
    let max_pdu_length = max_pdu_length.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE);
    let mut reader = BufReader::new(reader);
    let msg = loop {
        let mut buf = Cursor::new(&read_buffer[..]);
        // try to parse a PDU from what is already buffered
        match pdu::read_pdu(&mut buf, max_pdu_length, strict).context(ReceivePduSnafu)? {
            Some(pdu) => {
                read_buffer.advance(buf.position() as usize);
                break pdu;
            }
            None => {
                // the PDU is incomplete, fetch more bytes
            }
        }
        let recv = reader.fill_buf().context(WireReadSnafu)?;
        let bytes_read = recv.len();
        read_buffer.extend_from_slice(recv);
        reader.consume(bytes_read);
        ensure!(bytes_read != 0, ConnectionClosedSnafu);
    };
    Ok(msg)
}
