//! Protocol data unit module
//!
//! This module provides the data structures for the seven protocol data
//! units (PDUs) of the DICOM upper layer (PS3.8),
//! plus a structural reader and writer for their big-endian wire form.
//! Semantic checks, such as whether a PDU is legal in the current phase of
//! the association, are left to the [`association`](crate::association)
//! module.

pub mod reader;
pub mod writer;

pub use reader::{read_pdu, Error as ReadError};
pub use writer::{write_pdu, Error as WriteError};

/// The default maximum PDU length, in bytes.
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The smallest maximum PDU length admitted by this implementation.
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The largest maximum PDU length admitted by this implementation.
/// Also used as the inbound bound when the reader is not strict.
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The overhead of a single presentation data value item
/// within the body of a P-DATA-TF PDU:
/// item length, presentation context ID,
/// and message control header.
/// Coincides with the size of the PDU prefix on the wire
/// (PDU type, reserved byte, and PDU length).
pub const PDU_HEADER_SIZE: u32 = 6;

/// An upper layer protocol data unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ (PDU-type 01H)
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC (PDU-type 02H)
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ (PDU-type 03H)
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF (PDU-type 04H)
    PData { data: Vec<PDataValue> },
    /// A-RELEASE-RQ (PDU-type 05H)
    ReleaseRQ,
    /// A-RELEASE-RP (PDU-type 06H)
    ReleaseRP,
    /// A-ABORT (PDU-type 07H)
    AbortRQ { source: AbortRQSource },
    /// Any PDU with an unrecognized type tag
    Unknown { pdu_type: u8, data: Vec<u8> },
}

impl Pdu {
    /// A short description of the PDU for logging purposes.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
            Pdu::Unknown { .. } => "unknown PDU",
        }
    }
}

/// The body of an association request.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// The body of an association acknowledgement.
///
/// The AE title fields are echoed from the corresponding request
/// and are not significant on their own.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// The body of an association rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// A proposed presentation context,
/// carrying one abstract syntax and one or more transfer syntaxes.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContextProposed {
    /// Presentation context identifier: an odd integer between 1 and 255
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome of the negotiation of a single presentation context,
/// as encoded in an A-ASSOCIATE-AC.
///
/// The transfer syntax field is only significant
/// when the reason is [`Acceptance`](PresentationContextResultReason::Acceptance).
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: String,
}

/// A fully negotiated presentation context,
/// joining the acceptor's result with the abstract syntax
/// from the corresponding proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContextNegotiated {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: String,
    pub abstract_syntax: String,
}

/// The reason field of a presentation context result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// The result field of an association rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJResult {
    Permanent = 1,
    Transient = 2,
}

impl AssociationRJResult {
    fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source and reason of an association rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAsce(AssociationRJServiceProviderAsceReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            )),
            (1, x @ 4..=6) | (1, x @ 8..=10) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(x),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, x @ 0) | (3, x @ 3..=7) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(x),
            )),
            _ => None,
        }
    }
}

impl std::fmt::Display for AssociationRJSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJSource::ServiceUser(r) => write!(f, "by the service user: {:?}", r),
            AssociationRJSource::ServiceProviderAsce(r) => {
                write!(f, "by the service provider (ACSE): {:?}", r)
            }
            AssociationRJSource::ServiceProviderPresentation(r) => {
                write!(f, "by the service provider (presentation): {:?}", r)
            }
        }
    }
}

/// Rejection reasons attributed to the service user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

/// Rejection reasons attributed to the service provider (ACSE related).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceProviderAsceReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

/// Rejection reasons attributed to the service provider (presentation related).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// A single presentation data value item of a P-DATA-TF PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Whether a presentation data value fragment
/// carries command or data set bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source and reason of an A-ABORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameterValue,
            )),
            _ => None,
        }
    }
}

/// Abort reasons attributed to the service provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameterValue,
}

/// A variable item in the body of an association PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Debug, Clone, PartialEq)]
pub enum UserVariableItem {
    /// Maximum-length-received (sub-item 51H);
    /// 0 means that no maximum length is specified
    MaxLength(u32),
    /// Implementation-class-uid (sub-item 52H)
    ImplementationClassUID(String),
    /// Implementation-version-name (sub-item 55H)
    ImplementationVersionName(String),
    /// User-identity (sub-item 58H)
    UserIdentityItem(UserIdentity),
    /// Any other sub-item, kept as raw bytes
    Unknown(u8, Vec<u8>),
}

/// A user identity negotiation sub-item.
#[derive(Debug, Clone, PartialEq)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    /// The primary field (user name, Kerberos ticket, and so on).
    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    /// The secondary field; only meaningful for the username+password type.
    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// The kind of a user identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIdentityType {
    Username = 1,
    UsernamePassword = 2,
    KerberosServiceTicket = 3,
    SamlAssertion = 4,
    Jwt = 5,
}

impl UserIdentityType {
    fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(UserIdentityType::Username),
            2 => Some(UserIdentityType::UsernamePassword),
            3 => Some(UserIdentityType::KerberosServiceTicket),
            4 => Some(UserIdentityType::SamlAssertion),
            5 => Some(UserIdentityType::Jwt),
            _ => None,
        }
    }
}
