//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity is the one requesting the association.
//! See [`ClientAssociationOptions`]
//! for details and examples on how to create an association.
use bytes::BytesMut;
use std::{
    borrow::Cow,
    convert::TryInto,
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

use snafu::{ensure, ResultExt};

use crate::{
    pdu::{
        AbortRQServiceProviderReason, AbortRQSource, AssociationRQ, Pdu,
        PresentationContextNegotiated, PresentationContextProposed,
        PresentationContextResultReason, UserIdentity, UserIdentityType, UserVariableItem,
        DEFAULT_MAX_PDU, PDU_HEADER_SIZE,
    },
    AeAddr, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

use super::{
    encode_pdu, read_pdu_from_wire,
    uid::trim_uid,
    Association, Result, SessionSocket, SessionState, SocketOptions, ThrottledWriter,
    READ_POLL_INTERVAL,
};
use super::{PDataReader, PDataWriter};

#[cfg(feature = "tls")]
pub type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Helper function to establish a TCP client connection
fn tcp_connection<T>(ae_address: &AeAddr<T>, opts: &SocketOptions) -> Result<TcpStream>
where
    T: ToSocketAddrs,
{
    // NOTE: TcpStream::connect_timeout needs a single SocketAddr,
    // whereas TcpStream::connect can take multiple
    let conn_result: Result<TcpStream> = if let Some(timeout) = opts.connection_timeout {
        let addresses = ae_address.to_socket_addrs().context(super::ToAddressSnafu)?;
        let mut result = Err(std::io::Error::from(std::io::ErrorKind::AddrNotAvailable));
        for address in addresses {
            result = TcpStream::connect_timeout(&address, timeout);
            if result.is_ok() {
                break;
            }
        }
        result.context(super::ConnectSnafu)
    } else {
        TcpStream::connect(ae_address).context(super::ConnectSnafu)
    };

    let socket = conn_result?;
    socket
        .set_read_timeout(opts.read_timeout)
        .context(super::SetReadTimeoutSnafu)?;
    socket
        .set_write_timeout(opts.write_timeout)
        .context(super::SetWriteTimeoutSnafu)?;

    Ok(socket)
}

/// Helper function to establish a TLS client connection.
/// The TLS handshake happens before any PDU bytes flow.
#[cfg(feature = "tls")]
fn tls_connection<T>(
    ae_address: &AeAddr<T>,
    server_name: &str,
    opts: &SocketOptions,
    tls_config: std::sync::Arc<rustls::ClientConfig>,
) -> Result<TlsStream>
where
    T: ToSocketAddrs,
{
    use std::convert::TryFrom;

    let socket = tcp_connection(ae_address, opts)?;
    let server_name = rustls::pki_types::ServerName::try_from(server_name.to_string())
        .context(super::InvalidServerNameSnafu)?;

    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .context(super::TlsConnectionSnafu)?;

    Ok(rustls::StreamOwned::new(conn, socket))
}

/// Negotiated options of an accepted association.
struct NegotiatedOptions {
    peer_max_pdu_length: u32,
    user_variables: Vec<UserVariableItem>,
    presentation_contexts: Vec<PresentationContextNegotiated>,
    peer_ae_title: String,
}

/// A DICOM association builder for a client node.
/// The final outcome is a [`ClientAssociation`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// ## Basic usage
///
/// ```no_run
/// # use courier_ul::association::ClientAssociationOptions;
/// # use std::time::Duration;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .with_presentation_context(
///        "1.2.840.10008.1.1",
///        vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
///    )
///    .establish("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// ## Presentation contexts
///
/// At least one presentation context must be specified,
/// with [`with_presentation_context`](Self::with_presentation_context)
/// supplying both an abstract syntax and a list of transfer syntaxes,
/// or with the [`with_abstract_syntax`](Self::with_abstract_syntax) helper,
/// which includes the transfer syntaxes
/// _Implicit VR Little Endian_ and _Explicit VR Little Endian_.
///
/// ## Timeouts
///
/// Unless overridden,
/// connection establishment is bounded by a 10 second timeout,
/// individual socket operations by a 30 second timeout,
/// and the quiet gap between inbound DIMSE messages
/// by a 180 second timeout.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title, overriding the one in the target address
    called_ae_title: Option<Cow<'a, str>>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of requested presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// user identity username
    username: Option<Cow<'a, str>>,
    /// user identity password
    password: Option<Cow<'a, str>>,
    /// socket options for the TCP connection
    socket_options: SocketOptions,
    /// maximum quiet time between inbound DIMSE messages
    dimse_timeout: Option<Duration>,
    /// outbound throttling in bytes per second
    throttle_speed: Option<u32>,
    /// TLS configuration to use for the connection
    #[cfg(feature = "tls")]
    tls_config: Option<std::sync::Arc<rustls::ClientConfig>>,
    /// server name for TLS
    #[cfg(feature = "tls")]
    server_name: Option<String>,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "COURIER-SCU".into(),
            called_ae_title: None,
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            username: None,
            password: None,
            socket_options: SocketOptions {
                read_timeout: Some(Duration::from_secs(30)),
                write_timeout: Some(Duration::from_secs(30)),
                connection_timeout: Some(Duration::from_secs(10)),
            },
            dimse_timeout: Some(Duration::from_secs(180)),
            throttle_speed: None,
            #[cfg(feature = "tls")]
            tls_config: None,
            #[cfg(feature = "tls")]
            server_name: None,
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `COURIER-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    /// Passing an empty string resets the AE title to the default
    /// (or to the one in the address passed to
    /// [`establish_with`](ClientAssociationOptions::establish_with)).
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let cae = called_ae_title.into();
        if cae.is_empty() {
            self.called_ae_title = None;
        } else {
            self.called_ae_title = Some(cae);
        }
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_uid(t.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    ///
    /// A value of 0 proposes an unbounded maximum length to the peer.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the user identity username.
    pub fn username<T>(mut self, username: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let username = username.into();
        self.username = Some(username).filter(|u| !u.is_empty());
        self
    }

    /// Set the user identity password.
    pub fn password<T>(mut self, password: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let password = password.into();
        self.password = Some(password).filter(|p| !p.is_empty());
        self
    }

    /// Set the read timeout for the underlying TCP socket.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout for the underlying TCP socket.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.write_timeout = Some(timeout);
        self
    }

    /// Set the timeout for establishing the TCP connection.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.socket_options.connection_timeout = Some(timeout);
        self
    }

    /// Set the maximum quiet time admitted
    /// between inbound DIMSE messages.
    ///
    /// While waiting for a message,
    /// the association polls the socket every 500 milliseconds;
    /// once no read progress is made for this long,
    /// receiving fails with
    /// [`DimseTimeout`](crate::association::Error::DimseTimeout)
    /// and the association is closed.
    pub fn dimse_timeout(mut self, timeout: Duration) -> Self {
        self.dimse_timeout = Some(timeout);
        self
    }

    /// Remove the bound on the quiet time
    /// between inbound DIMSE messages.
    pub fn no_dimse_timeout(mut self) -> Self {
        self.dimse_timeout = None;
        self
    }

    /// Cap the outbound transfer rate, in bytes per second.
    pub fn throttle_speed(mut self, bytes_per_second: u32) -> Self {
        self.throttle_speed = Some(bytes_per_second).filter(|rate| *rate > 0);
        self
    }

    /// Set the TLS configuration to use for the connection.
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: impl Into<std::sync::Arc<rustls::ClientConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Set the server name to use for the TLS connection.
    #[cfg(feature = "tls")]
    pub fn server_name(mut self, server_name: &str) -> Self {
        self.server_name = Some(server_name.to_string());
        self
    }

    /// Initiate a plain TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation<TcpStream>> {
        let addr = AeAddr::new_socket_addr(address);
        let socket = tcp_connection(&addr, &self.socket_options)?;
        self.establish_impl(addr, socket)
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    ///
    /// This method accepts the called AE title
    /// alongside the socket address,
    /// in the syntax accepted by [`AeAddr`](crate::AeAddr)
    /// (`AE-TITLE@host:port`).
    /// The AE title in the address is overridden
    /// by any `called_ae_title` option previously set.
    pub fn establish_with(self, ae_address: &str) -> Result<ClientAssociation<TcpStream>> {
        match ae_address.try_into() {
            Ok(ae_address) => {
                let socket = tcp_connection(&ae_address, &self.socket_options)?;
                self.establish_impl(ae_address, socket)
            }
            Err(_) => {
                let addr = AeAddr::new_socket_addr(ae_address);
                let socket = tcp_connection(&addr, &self.socket_options)?;
                self.establish_impl(addr, socket)
            }
        }
    }

    /// Initiate a TLS connection to the given address
    /// and request a new DICOM association.
    ///
    /// The TLS handshake is carried out before any PDU bytes flow.
    /// Requires [`tls_config`](Self::tls_config)
    /// and [`server_name`](Self::server_name) to be set.
    #[cfg(feature = "tls")]
    pub fn establish_tls<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation<TlsStream>> {
        match (&self.tls_config, &self.server_name) {
            (Some(tls_config), Some(server_name)) => {
                let addr = AeAddr::new_socket_addr(address);
                let socket =
                    tls_connection(&addr, server_name, &self.socket_options, tls_config.clone())?;
                self.establish_impl(addr, socket)
            }
            _ => super::TlsConfigMissingSnafu.fail(),
        }
    }

    /// Construct the A-ASSOCIATE-RQ PDU given the options and the AE title.
    fn create_a_associate_req(
        &self,
        ae_title: Option<&str>,
    ) -> Result<(Vec<PresentationContextProposed>, Pdu)> {
        // presentation contexts represent intent,
        // they must not be omitted by the user
        ensure!(
            !self.presentation_contexts.is_empty(),
            super::MissingAbstractSyntaxSnafu
        );

        ensure!(
            self.calling_ae_title.len() <= 16,
            super::InvalidAeTitleSnafu {
                ae_title: self.calling_ae_title.to_string()
            }
        );

        // choose called AE title
        let called_ae_title: &str = match (&self.called_ae_title, ae_title) {
            (Some(aec), Some(aet)) => {
                if aec != aet {
                    tracing::warn!(
                        "Option `called_ae_title` overrides the AE title from `{aet}` to `{aec}`"
                    );
                }
                aec
            }
            (Some(aec), None) => aec,
            (None, Some(aet)) => aet,
            (None, None) => "ANY-SCP",
        };
        ensure!(
            called_ae_title.len() <= 16,
            super::InvalidAeTitleSnafu {
                ae_title: called_ae_title.to_string()
            }
        );

        let presentation_contexts_proposed: Vec<_> = self
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, presentation_context)| PresentationContextProposed {
                id: (2 * i + 1) as u8,
                abstract_syntax: presentation_context.0.to_string(),
                transfer_syntaxes: presentation_context
                    .1
                    .iter()
                    .map(|uid| uid.to_string())
                    .collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];

        if let Some(user_identity) =
            Self::determine_user_identity(self.username.as_deref(), self.password.as_deref())
        {
            user_variables.push(UserVariableItem::UserIdentityItem(user_identity));
        }

        Ok((
            presentation_contexts_proposed.clone(),
            Pdu::AssociationRQ(AssociationRQ {
                protocol_version: self.protocol_version,
                calling_ae_title: self.calling_ae_title.to_string(),
                called_ae_title: called_ae_title.to_string(),
                application_context_name: self.application_context_name.to_string(),
                presentation_contexts: presentation_contexts_proposed,
                user_variables,
            }),
        ))
    }

    /// Process the A-ASSOCIATE response received from the peer.
    fn process_a_associate_resp(
        &self,
        msg: Pdu,
        presentation_contexts_proposed: &[PresentationContextProposed],
    ) -> Result<NegotiatedOptions> {
        match msg {
            Pdu::AssociationAC(ac) => {
                ensure!(
                    self.protocol_version == ac.protocol_version,
                    super::ProtocolVersionMismatchSnafu {
                        expected: self.protocol_version,
                        got: ac.protocol_version,
                    }
                );

                let peer_max_pdu_length = ac
                    .user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(len) => Some(*len),
                        _ => None,
                    })
                    .unwrap_or(DEFAULT_MAX_PDU);

                // treat 0 as practically unlimited
                let peer_max_pdu_length = if peer_max_pdu_length == 0 {
                    u32::MAX
                } else {
                    peer_max_pdu_length
                };

                let presentation_contexts: Vec<_> = ac
                    .presentation_contexts
                    .into_iter()
                    .filter_map(|c| {
                        if c.reason != PresentationContextResultReason::Acceptance {
                            return None;
                        }
                        let proposed = presentation_contexts_proposed
                            .iter()
                            .find(|p| p.id == c.id)?;
                        Some(PresentationContextNegotiated {
                            id: c.id,
                            reason: c.reason,
                            transfer_syntax: c.transfer_syntax,
                            abstract_syntax: proposed.abstract_syntax.clone(),
                        })
                    })
                    .collect();
                if presentation_contexts.is_empty() {
                    return super::NoAcceptedPresentationContextsSnafu.fail();
                }
                Ok(NegotiatedOptions {
                    presentation_contexts,
                    peer_max_pdu_length,
                    user_variables: ac.user_variables,
                    peer_ae_title: ac.called_ae_title,
                })
            }
            Pdu::AssociationRJ(association_rj) => {
                super::RejectedSnafu { association_rj }.fail()
            }
            pdu @ Pdu::AbortRQ { .. }
            | pdu @ Pdu::ReleaseRQ
            | pdu @ Pdu::AssociationRQ { .. }
            | pdu @ Pdu::PData { .. }
            | pdu @ Pdu::ReleaseRP => super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
            pdu @ Pdu::Unknown { .. } => super::UnknownPduSnafu { pdu: Box::new(pdu) }.fail(),
        }
    }

    /// Establish the association over the given connected socket.
    fn establish_impl<T, S>(self, ae_address: AeAddr<T>, mut socket: S) -> Result<ClientAssociation<S>>
    where
        T: ToSocketAddrs,
        S: Read + Write + SessionSocket,
    {
        let (pc_proposed, a_associate) = self.create_a_associate_req(ae_address.ae_title())?;

        let mut write_buffer: Vec<u8> = Vec::with_capacity(DEFAULT_MAX_PDU as usize);
        crate::write_pdu(&mut write_buffer, &a_associate).context(super::SendPduSnafu)?;
        socket
            .write_all(&write_buffer)
            .context(super::WireSendSnafu)?;
        write_buffer.clear();

        let mut read_buffer = BytesMut::with_capacity(
            (self.max_pdu_length.max(DEFAULT_MAX_PDU) + PDU_HEADER_SIZE) as usize,
        );
        let resp = read_pdu_from_wire(
            &mut socket,
            &mut read_buffer,
            self.max_pdu_length,
            self.strict,
        )?;

        match self.process_a_associate_resp(resp, &pc_proposed) {
            Err(e) => {
                // tell the peer that the outcome was not accepted,
                // then drop the connection
                let _ = crate::write_pdu(
                    &mut write_buffer,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceUser,
                    },
                );
                let _ = socket.write_all(&write_buffer);
                let _ = socket.close();
                Err(e)
            }
            Ok(NegotiatedOptions {
                presentation_contexts,
                peer_max_pdu_length,
                user_variables,
                peer_ae_title,
            }) => Ok(ClientAssociation {
                presentation_contexts,
                this_max_pdu_length: self.max_pdu_length,
                peer_max_pdu_length,
                socket,
                write_buffer,
                read_buffer,
                strict: self.strict,
                read_timeout: self.socket_options.read_timeout,
                dimse_timeout: self.dimse_timeout,
                throttle_speed: self.throttle_speed,
                session_state: SessionState::Established,
                closed_on_error: false,
                user_variables,
                peer_ae_title,
            }),
        }
    }

    fn determine_user_identity(
        username: Option<&str>,
        password: Option<&str>,
    ) -> Option<UserIdentity> {
        match (username, password) {
            (Some(username), Some(password)) => Some(UserIdentity::new(
                false,
                UserIdentityType::UsernamePassword,
                username.as_bytes().to_vec(),
                password.as_bytes().to_vec(),
            )),
            (Some(username), None) => Some(UserIdentity::new(
                false,
                UserIdentityType::Username,
                username.as_bytes().to_vec(),
                vec![],
            )),
            _ => None,
        }
    }
}

/// A DICOM upper layer association from the perspective
/// of a requesting application entity.
///
/// The most common operations of an established association
/// are [`send`](Self::send) and [`receive`](Self::receive).
/// Sending large P-Data fragments may be easier
/// through the P-Data sender abstraction
/// (see [`send_pdata`](Self::send_pdata)).
///
/// The association tracks its own [session phase](SessionState):
/// a PDU which is not legal in the current phase
/// is answered with an A-ABORT to the peer
/// and closes the session with
/// [`closed_on_error`](Association::closed_on_error) set.
///
/// When the value falls out of scope
/// while the session is still established,
/// the program will automatically try to release the association
/// through a standard A-RELEASE exchange,
/// then shut down the underlying TCP connection.
#[derive(Debug)]
pub struct ClientAssociation<S>
where
    S: Read + Write + SessionSocket,
{
    /// The accorded presentation contexts, without the rejected ones
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// The maximum PDU length that this node is expecting to receive
    this_max_pdu_length: u32,
    /// The maximum PDU length that the peer admits
    /// (`u32::MAX` if unbounded)
    peer_max_pdu_length: u32,
    /// The connection to the peer
    socket: S,
    /// Buffer to assemble PDUs before sending them on the wire
    write_buffer: Vec<u8>,
    /// Buffer for incoming wire bytes pending PDU assembly
    read_buffer: BytesMut,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// timeout for individual socket reads
    read_timeout: Option<Duration>,
    /// maximum quiet time between inbound DIMSE messages
    dimse_timeout: Option<Duration>,
    /// outbound throttling in bytes per second
    throttle_speed: Option<u32>,
    /// the current phase of the session
    session_state: SessionState,
    /// whether the session was terminated by an error
    closed_on_error: bool,
    /// user variables received from the peer
    user_variables: Vec<UserVariableItem>,
    /// the AE title of the peer
    peer_ae_title: String,
}

impl<S> Association for ClientAssociation<S>
where
    S: Read + Write + SessionSocket,
{
    fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    fn this_max_pdu_length(&self) -> u32 {
        self.this_max_pdu_length
    }

    fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    fn user_variables(&self) -> &[UserVariableItem] {
        &self.user_variables
    }

    fn state(&self) -> SessionState {
        self.session_state
    }

    fn closed_on_error(&self) -> bool {
        self.closed_on_error
    }
}

impl<S> ClientAssociation<S>
where
    S: Read + Write + SessionSocket,
{
    /// Send a PDU message to the peer.
    ///
    /// Only legal while the session is established;
    /// a transport failure closes the session.
    pub fn send(&mut self, pdu: &Pdu) -> Result<()> {
        ensure!(
            self.session_state == SessionState::Established,
            super::ConnectionClosedSnafu
        );
        self.send_unchecked(pdu)
    }

    /// Read a PDU message from the peer.
    ///
    /// Polls the socket every 500 milliseconds;
    /// when no read progress happens within the DIMSE timeout,
    /// fails with [`DimseTimeout`](super::Error::DimseTimeout)
    /// and closes the session.
    ///
    /// An inbound A-ABORT or a PDU which is illegal
    /// in the current session phase also ends the session;
    /// the latter is answered with an A-ABORT
    /// (service provider, unexpected PDU).
    pub fn receive(&mut self) -> Result<Pdu> {
        self.receive_interruptible(None)
    }

    /// Like [`receive`](Self::receive),
    /// but gives up as soon as the given flag is raised,
    /// aborting the association
    /// and failing with [`Interrupted`](super::Error::Interrupted).
    ///
    /// The flag is observed at every poll interval,
    /// so interruption takes at most 500 milliseconds.
    pub fn receive_interruptible(
        &mut self,
        interrupt: Option<&std::sync::atomic::AtomicBool>,
    ) -> Result<Pdu> {
        ensure!(
            self.session_state != SessionState::Closed,
            super::ConnectionClosedSnafu
        );

        self.socket
            .set_read_timeout(Some(READ_POLL_INTERVAL))
            .context(super::SetReadTimeoutSnafu)?;
        let mut quiet_since = Instant::now();
        let mut buffered = self.read_buffer.len();
        let result = loop {
            if interrupt
                .map(|flag| flag.load(std::sync::atomic::Ordering::Relaxed))
                .unwrap_or(false)
            {
                let _ = self.send_unchecked(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                });
                break super::InterruptedSnafu.fail();
            }
            match read_pdu_from_wire(
                &mut self.socket,
                &mut self.read_buffer,
                self.this_max_pdu_length,
                self.strict,
            ) {
                Ok(pdu) => break Ok(pdu),
                Err(super::Error::WireRead { source, .. }) if is_idle_wakeup(&source) => {
                    // partial progress counts as activity
                    if self.read_buffer.len() != buffered {
                        buffered = self.read_buffer.len();
                        quiet_since = Instant::now();
                    }
                    if let Some(timeout) = self.dimse_timeout {
                        if quiet_since.elapsed() >= timeout {
                            break super::DimseTimeoutSnafu { timeout }.fail();
                        }
                    }
                }
                Err(e) => break Err(e),
            }
        };
        let _ = self.socket.set_read_timeout(self.read_timeout);

        match result {
            Ok(pdu) => self.screen_inbound(pdu),
            Err(e @ super::Error::ReceivePdu { .. }) => {
                // the byte stream is structurally broken;
                // give up on the association
                let _ = self
                    .send_raw_abort(AbortRQServiceProviderReason::InvalidPduParameterValue);
                self.shutdown_on_error();
                Err(e)
            }
            Err(e) => {
                self.shutdown_on_error();
                Err(e)
            }
        }
    }

    /// Gracefully terminate the association
    /// by exchanging an A-RELEASE request and reply,
    /// then shutting down the TCP connection.
    pub fn release(mut self) -> Result<()> {
        self.release_impl()
    }

    /// Send an A-ABORT and shut down the TCP connection,
    /// terminating the association immediately.
    pub fn abort(mut self) -> Result<()> {
        let out = self.send_unchecked(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        });
        let _ = self.socket.close();
        self.session_state = SessionState::Closed;
        out
    }

    /// Prepare a P-Data writer for sending
    /// one or more data item PDUs.
    ///
    /// Returns a writer which automatically
    /// splits the inner data into separate PDUs if necessary,
    /// and applies the configured outbound throttling.
    pub fn send_pdata(
        &mut self,
        presentation_context_id: u8,
    ) -> PDataWriter<ThrottledWriter<&mut S>> {
        let max_pdu_length = self.effective_send_pdu_length();
        PDataWriter::new(
            ThrottledWriter::new(&mut self.socket, self.throttle_speed),
            presentation_context_id,
            max_pdu_length,
        )
    }

    /// Prepare a P-Data reader for receiving
    /// one or more data item PDUs.
    ///
    /// Returns a reader which automatically
    /// receives more data PDUs once the bytes collected are consumed.
    pub fn receive_pdata(&mut self) -> PDataReader<'_, &mut S> {
        PDataReader::new(
            &mut self.socket,
            self.this_max_pdu_length,
            &mut self.read_buffer,
        )
    }

    /// Obtain access to the inner stream connected to the peer.
    ///
    /// Reading and writing should be done with care
    /// to avoid inconsistencies in the session state:
    /// do not call `send` and `receive` while not in a PDU boundary.
    pub fn inner_stream(&mut self) -> &mut S {
        &mut self.socket
    }

    fn send_unchecked(&mut self, pdu: &Pdu) -> Result<()> {
        self.write_buffer.clear();
        encode_pdu(&mut self.write_buffer, pdu, self.peer_max_pdu_length)?;
        let write_result = {
            let mut writer = ThrottledWriter::new(&mut self.socket, self.throttle_speed);
            writer
                .write_all(&self.write_buffer)
                .and_then(|_| writer.flush())
        };
        write_result.context(super::WireSendSnafu).map_err(|e| {
            self.shutdown_on_error();
            e
        })
    }

    /// Check an inbound PDU against the current session phase.
    fn screen_inbound(&mut self, pdu: Pdu) -> Result<Pdu> {
        match pdu {
            Pdu::PData { .. } => Ok(pdu),
            // peer-initiated release, surfaced to the caller
            Pdu::ReleaseRQ if self.session_state == SessionState::Established => Ok(pdu),
            Pdu::ReleaseRP if self.session_state == SessionState::AwaitingRelease => Ok(pdu),
            Pdu::AbortRQ { .. } => {
                let _ = self.socket.close();
                self.session_state = SessionState::Closed;
                self.closed_on_error = true;
                super::AbortedSnafu.fail()
            }
            pdu @ Pdu::Unknown { .. } => {
                let _ = self.send_raw_abort(AbortRQServiceProviderReason::UnrecognizedPdu);
                self.shutdown_on_error();
                super::UnknownPduSnafu { pdu: Box::new(pdu) }.fail()
            }
            pdu => {
                let _ = self.send_raw_abort(AbortRQServiceProviderReason::UnexpectedPdu);
                self.shutdown_on_error();
                super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }

    fn send_raw_abort(&mut self, reason: AbortRQServiceProviderReason) -> Result<()> {
        self.write_buffer.clear();
        encode_pdu(
            &mut self.write_buffer,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(reason),
            },
            self.peer_max_pdu_length,
        )?;
        self.socket
            .write_all(&self.write_buffer)
            .context(super::WireSendSnafu)
    }

    fn shutdown_on_error(&mut self) {
        let _ = self.socket.close();
        self.session_state = SessionState::Closed;
        self.closed_on_error = true;
    }

    fn release_impl(&mut self) -> Result<()> {
        self.send_unchecked(&Pdu::ReleaseRQ)?;
        self.session_state = SessionState::AwaitingRelease;
        loop {
            match self.receive()? {
                Pdu::ReleaseRP => break,
                // late data arriving during release is discarded
                Pdu::PData { .. } => continue,
                // any other PDU was already screened out by receive
                pdu => return super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
            }
        }
        self.session_state = SessionState::Closed;
        self.socket.close().context(super::CloseSnafu)?;
        Ok(())
    }
}

/// Automatically release the association and shut down the connection.
impl<S> Drop for ClientAssociation<S>
where
    S: Read + Write + SessionSocket,
{
    fn drop(&mut self) {
        if self.session_state != SessionState::Closed {
            let _ = self.release_impl();
        }
    }
}

/// Whether the I/O error is just the socket read timing out,
/// which wakes up the polling loop without any data.
fn is_idle_wakeup(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
