//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to accept an association.
use std::{borrow::Cow, io::Write, net::TcpStream, time::Duration};

use bytes::BytesMut;
use snafu::{ensure, ResultExt};

use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, Pdu,
    PresentationContextNegotiated, PresentationContextResult, PresentationContextResultReason,
    UserIdentity, UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::{
    encode_pdu, read_pdu_from_wire,
    uid::trim_uid,
    Association, PDataReader, PDataWriter, Result, SessionSocket, SessionState,
};

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl {
    /// Decide whether to accept an incoming association request
    /// based on the recorded application entity titles and user identity.
    ///
    /// Returns Ok(()) if the requesting node should be given clearance.
    /// Otherwise, a concrete rejection reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// whose called AE title matches the node's own AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// A DICOM association builder for an acceptor DICOM node,
/// often taking the role of a service class provider (SCP).
///
/// This is the standard way of negotiating and establishing
/// an association with a requesting node.
/// The outcome is a [`ServerAssociation`].
/// Unlike [`ClientAssociationOptions`](super::ClientAssociationOptions),
/// a value of this type can be reused for multiple connections.
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use courier_ul::association::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// # let tcp_listener: TcpListener = unimplemented!();
/// let scp_options = ServerAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .with_transfer_syntax("1.2.840.10008.1.2.1");
///
/// let (stream, _address) = tcp_listener.accept()?;
/// scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
///
/// When no transfer syntaxes are specified,
/// the acceptor admits
/// _Implicit VR Little Endian_ and _Explicit VR Little Endian_.
///
/// Access control logic is also available:
/// by default the node accepts requests from anyone ([`AcceptAny`]);
/// to only accept requests with a matching called AE title,
/// add a call to [`accept_called_ae_title`](Self::accept_called_ae_title);
/// any other policy can be implemented through the [`AccessControl`] trait.
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the expected application context name
    application_context_name: Cow<'a, str>,
    /// the list of supported abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the list of supported transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// timeout for individual socket operations
    timeout: Option<Duration>,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "COURIER-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            timeout: None,
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    /// Create a new set of options for accepting an association.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessControl,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            ae_access_control: _,
            timeout,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            timeout,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `COURIER-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the list of accepted abstract syntaxes.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Include this transfer syntax
    /// in the list of accepted transfer syntaxes.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Override the maximum expected PDU length.
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

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Set the timeout for individual socket operations.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Negotiate an association with the given TCP stream.
    pub fn establish(&self, mut socket: TcpStream) -> Result<ServerAssociation<TcpStream>> {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            super::MissingAbstractSyntaxSnafu
        );

        socket
            .set_read_timeout(self.timeout)
            .context(super::SetReadTimeoutSnafu)?;
        socket
            .set_write_timeout(self.timeout)
            .context(super::SetWriteTimeoutSnafu)?;

        let max_pdu_length = self.max_pdu_length;
        let mut read_buffer = BytesMut::with_capacity((DEFAULT_MAX_PDU + PDU_HEADER_SIZE) as usize);
        let mut write_buffer: Vec<u8> = Vec::with_capacity(max_pdu_length as usize);

        let msg = read_pdu_from_wire(&mut socket, &mut read_buffer, MAXIMUM_PDU_SIZE, self.strict)?;
        match msg {
            Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                calling_ae_title,
                called_ae_title,
                application_context_name,
                presentation_contexts,
                user_variables,
            }) => {
                if protocol_version != self.protocol_version {
                    reject(
                        &mut socket,
                        &mut write_buffer,
                        AssociationRJSource::ServiceProviderAsce(
                            crate::pdu::AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
                        ),
                    )?;
                    return super::RejectedSnafu {
                        association_rj: AssociationRJ {
                            result: AssociationRJResult::Permanent,
                            source: AssociationRJSource::ServiceProviderAsce(
                                crate::pdu::AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
                            ),
                        },
                    }
                    .fail();
                }

                if application_context_name != self.application_context_name {
                    let source = AssociationRJSource::ServiceUser(
                        AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                    );
                    reject(&mut socket, &mut write_buffer, source.clone())?;
                    return super::RejectedSnafu {
                        association_rj: AssociationRJ {
                            result: AssociationRJResult::Permanent,
                            source,
                        },
                    }
                    .fail();
                }

                if let Err(reason) = self.ae_access_control.check_access(
                    &self.ae_title,
                    &calling_ae_title,
                    &called_ae_title,
                    user_variables
                        .iter()
                        .find_map(|user_variable| match user_variable {
                            UserVariableItem::UserIdentityItem(user_identity) => {
                                Some(user_identity)
                            }
                            _ => None,
                        }),
                ) {
                    let source = AssociationRJSource::ServiceUser(reason);
                    reject(&mut socket, &mut write_buffer, source.clone())?;
                    return super::RejectedSnafu {
                        association_rj: AssociationRJ {
                            result: AssociationRJResult::Permanent,
                            source,
                        },
                    }
                    .fail();
                }

                // fetch the maximum PDU length the requestor admits
                let requestor_max_pdu_length = user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(len) => Some(*len),
                        _ => None,
                    })
                    .unwrap_or(DEFAULT_MAX_PDU);

                // treat 0 as practically unlimited
                let requestor_max_pdu_length = if requestor_max_pdu_length == 0 {
                    u32::MAX
                } else {
                    requestor_max_pdu_length
                };

                let presentation_contexts: Vec<_> = presentation_contexts
                    .into_iter()
                    .map(|pc| {
                        if !self
                            .abstract_syntax_uids
                            .contains(&trim_uid(Cow::from(pc.abstract_syntax.clone())))
                            && !self.promiscuous
                        {
                            return PresentationContextNegotiated {
                                id: pc.id,
                                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                                transfer_syntax: "1.2.840.10008.1.2".to_string(),
                                abstract_syntax: pc.abstract_syntax,
                            };
                        }

                        let (transfer_syntax, reason) = self
                            .choose_ts(&pc.transfer_syntaxes)
                            .map(|ts| (ts, PresentationContextResultReason::Acceptance))
                            .unwrap_or_else(|| {
                                (
                                    "1.2.840.10008.1.2".to_string(),
                                    PresentationContextResultReason::TransferSyntaxesNotSupported,
                                )
                            });

                        PresentationContextNegotiated {
                            id: pc.id,
                            reason,
                            transfer_syntax,
                            abstract_syntax: pc.abstract_syntax,
                        }
                    })
                    .collect();

                let ac = AssociationAC {
                    protocol_version: self.protocol_version,
                    application_context_name,
                    called_ae_title: called_ae_title.clone(),
                    calling_ae_title: calling_ae_title.clone(),
                    presentation_contexts: presentation_contexts
                        .iter()
                        .map(|pc| PresentationContextResult {
                            id: pc.id,
                            reason: pc.reason,
                            transfer_syntax: pc.transfer_syntax.clone(),
                        })
                        .collect(),
                    user_variables: vec![
                        UserVariableItem::MaxLength(max_pdu_length),
                        UserVariableItem::ImplementationClassUID(
                            IMPLEMENTATION_CLASS_UID.to_string(),
                        ),
                        UserVariableItem::ImplementationVersionName(
                            IMPLEMENTATION_VERSION_NAME.to_string(),
                        ),
                    ],
                };
                encode_pdu(&mut write_buffer, &Pdu::AssociationAC(ac), u32::MAX)?;
                socket
                    .write_all(&write_buffer)
                    .context(super::WireSendSnafu)?;
                write_buffer.clear();

                Ok(ServerAssociation {
                    presentation_contexts,
                    this_max_pdu_length: max_pdu_length,
                    peer_max_pdu_length: requestor_max_pdu_length,
                    socket,
                    write_buffer,
                    read_buffer,
                    strict: self.strict,
                    session_state: SessionState::Established,
                    closed_on_error: false,
                    user_variables,
                    peer_ae_title: calling_ae_title,
                })
            }
            pdu @ Pdu::AssociationAC { .. }
            | pdu @ Pdu::AssociationRJ { .. }
            | pdu @ Pdu::PData { .. }
            | pdu @ Pdu::ReleaseRQ
            | pdu @ Pdu::ReleaseRP
            | pdu @ Pdu::AbortRQ { .. } => {
                // send abort and refuse
                let _ = encode_pdu(
                    &mut write_buffer,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnexpectedPdu,
                        ),
                    },
                    u32::MAX,
                );
                let _ = socket.write_all(&write_buffer);
                let _ = socket.close();
                super::UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail()
            }
            pdu @ Pdu::Unknown { .. } => {
                let _ = encode_pdu(
                    &mut write_buffer,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnrecognizedPdu,
                        ),
                    },
                    u32::MAX,
                );
                let _ = socket.write_all(&write_buffer);
                let _ = socket.close();
                super::UnknownPduSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }

    /// Pick the first proposed transfer syntax
    /// which this node supports.
    fn choose_ts(&self, proposed: &[String]) -> Option<String> {
        if self.transfer_syntax_uids.is_empty() {
            // accept the uncompressed little endian syntaxes by default
            proposed
                .iter()
                .find(|ts| {
                    let ts = ts.trim_end_matches(|c: char| c.is_whitespace() || c == '\0');
                    ts == "1.2.840.10008.1.2" || ts == "1.2.840.10008.1.2.1"
                })
                .cloned()
        } else {
            proposed
                .iter()
                .find(|ts| {
                    self.transfer_syntax_uids
                        .contains(&trim_uid(Cow::from(ts.as_str())))
                })
                .cloned()
        }
    }
}

/// Send an association rejection message to the peer.
fn reject(
    socket: &mut TcpStream,
    write_buffer: &mut Vec<u8>,
    source: AssociationRJSource,
) -> Result<()> {
    encode_pdu(
        write_buffer,
        &Pdu::AssociationRJ(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source,
        }),
        u32::MAX,
    )?;
    let out = socket.write_all(write_buffer).context(super::WireSendSnafu);
    write_buffer.clear();
    let _ = socket.close();
    out
}

/// A DICOM upper layer association from the perspective
/// of an accepting application entity.
///
/// The most common operations of an established association
/// are [`send`](Self::send) and [`receive`](Self::receive).
///
/// All the negotiated presentation contexts are available,
/// including the ones which were not accepted;
/// filter by [`reason`](PresentationContextNegotiated::reason)
/// when looking up a context for data transfer.
#[derive(Debug)]
pub struct ServerAssociation<S>
where
    S: std::io::Read + Write + SessionSocket,
{
    /// The negotiated presentation contexts, with their outcomes
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// The maximum PDU length that this node is expecting to receive
    this_max_pdu_length: u32,
    /// The maximum PDU length that the peer admits
    peer_max_pdu_length: u32,
    /// The connection to the peer
    socket: S,
    /// Buffer to assemble PDUs before sending them on the wire
    write_buffer: Vec<u8>,
    /// Buffer for incoming wire bytes pending PDU assembly
    read_buffer: BytesMut,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// the current phase of the session
    session_state: SessionState,
    /// whether the session was terminated by an error
    closed_on_error: bool,
    /// user variables received from the peer
    user_variables: Vec<UserVariableItem>,
    /// the AE title of the peer (the calling AE title)
    peer_ae_title: String,
}

impl<S> Association for ServerAssociation<S>
where
    S: std::io::Read + Write + SessionSocket,
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

impl<S> ServerAssociation<S>
where
    S: std::io::Read + Write + SessionSocket,
{
    /// Obtain the requesting node's application entity title.
    pub fn client_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    /// Send a PDU message to the peer.
    pub fn send(&mut self, pdu: &Pdu) -> Result<()> {
        ensure!(
            self.session_state == SessionState::Established,
            super::ConnectionClosedSnafu
        );
        self.write_buffer.clear();
        encode_pdu(&mut self.write_buffer, pdu, self.peer_max_pdu_length)?;
        self.socket
            .write_all(&self.write_buffer)
            .context(super::WireSendSnafu)
            .map_err(|e| {
                self.shutdown_on_error();
                e
            })
    }

    /// Read a PDU message from the peer.
    ///
    /// An inbound A-ABORT or a PDU which is illegal
    /// while the session is established
    /// ends the session;
    /// the latter is answered with an A-ABORT
    /// (service provider, unexpected PDU).
    ///
    /// A release request is passed through to the caller,
    /// which should answer it via
    /// [`respond_release`](Self::respond_release).
    pub fn receive(&mut self) -> Result<Pdu> {
        ensure!(
            self.session_state != SessionState::Closed,
            super::ConnectionClosedSnafu
        );

        let result = read_pdu_from_wire(
            &mut self.socket,
            &mut self.read_buffer,
            self.this_max_pdu_length,
            self.strict,
        );

        match result {
            Ok(pdu) => match pdu {
                Pdu::PData { .. } | Pdu::ReleaseRQ => Ok(pdu),
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
            },
            Err(e @ super::Error::ReceivePdu { .. }) => {
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

    /// Answer a release request from the peer
    /// and shut down the connection,
    /// terminating the association normally.
    pub fn respond_release(&mut self) -> Result<()> {
        self.send(&Pdu::ReleaseRP)?;
        self.session_state = SessionState::Closed;
        self.socket.close().context(super::CloseSnafu)?;
        Ok(())
    }

    /// Send a provider initiated abort message
    /// and shut down the TCP connection,
    /// terminating the association.
    pub fn abort(mut self) -> Result<()> {
        let out = self.send_raw_abort(AbortRQServiceProviderReason::ReasonNotSpecified);
        let _ = self.socket.close();
        self.session_state = SessionState::Closed;
        out
    }

    /// Prepare a P-Data writer for sending
    /// one or more data item PDUs.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut S> {
        let max_pdu_length = self.effective_send_pdu_length();
        PDataWriter::new(&mut self.socket, presentation_context_id, max_pdu_length)
    }

    /// Prepare a P-Data reader for receiving
    /// one or more data item PDUs.
    pub fn receive_pdata(&mut self) -> PDataReader<'_, &mut S> {
        PDataReader::new(
            &mut self.socket,
            self.this_max_pdu_length,
            &mut self.read_buffer,
        )
    }

    /// Obtain access to the inner stream connected to the peer.
    pub fn inner_stream(&mut self) -> &mut S {
        &mut self.socket
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
}
