//! DICOM upper layer protocol engine for the Courier DICOM agent.
//!
//! This crate contains the types and methods needed to talk to other
//! DICOM nodes over the upper layer protocol by TCP,
//! serving as a base for concrete service class users (SCUs)
//! and service class providers (SCPs).
//!
//! - The [`address`] module
//!   provides an abstraction for compound addresses
//!   referring to application entities in a network.
//! - The [`pdu`] module
//!   provides the data structures representing _protocol data units_
//!   and their structural reader and writer.
//! - The [`association`] module
//!   comprises the abstractions for establishing, negotiating,
//!   and driving associations between application entities,
//!   in either the requestor or the acceptor role.
//!
//! ## Features
//! * `tls`: enables associations over TLS via `rustls`.

pub mod address;
pub mod association;
pub mod pdu;

/// The implementation class UID generically referring to Courier.
///
/// Generated as per the standard, part 5, section B.2.
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.304980316577889466130722985508347856621";

/// The implementation version name generically referring to Courier.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "COURIER-0.1";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::server::{ServerAssociation, ServerAssociationOptions};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
