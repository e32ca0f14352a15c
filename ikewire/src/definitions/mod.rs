//! High-level definitions of the IKEv2 payloads used in CHILD_SA negotiation

pub mod header;
mod impls;
pub mod params;

use std::net::IpAddr;

use serde::Deserialize;
use serde::Serialize;

use self::params::EncryptionAlgorithm;
use self::params::IntegrityAlgorithm;
use self::params::KeyExchangeMethod;
use self::params::NotifyError;
use self::params::NotifyStatus;
use self::params::SecurityProtocol;
use self::params::SequenceNumbers;
use self::params::TsType;

/// When parsing a parameter from u8, there are several "regions" in the definitions
/// that can't be defined by Rusts enum. Typically, the last two regions of the
/// parameter definitions are unassigned and/or reserved for private use.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UnparseableParameter {
    /// The parameter is reserved and must not be used, as it may conflict with older standards
    Reserved,
    /// The parameter has no recognized meaning by any known standard
    Unassigned,
    /// The parameter is reserved for Private Use by proprietary implementations
    /// and not part of a standard
    PrivateUse,
    /// The parameter can not reach the value this resolves to,
    /// as such the packet where it originates from must be invalid
    OutOfRange,
}

/// Number of additional key exchange transform types defined by RFC 9370
pub const ADDITIONAL_KEY_EXCHANGES: usize = 7;

/// Selection flag: ignore the key exchange transform groups entirely,
/// used for exchanges that carry no KE payload
pub const SELECT_SKIP_KE: u8 = 0x01;
/// Selection flag: skip transforms whose IDs lie in the private-use region
pub const SELECT_SKIP_PRIVATE: u8 = 0x02;
/// Selection flag: let the supplied (peer) preference order win over the
/// configured order
pub const SELECT_PREFER_SUPPLIED: u8 = 0x04;

/// A single transform offered inside a [Proposal]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    /// Encryption algorithm with an optional key length attribute in bits
    Encryption(EncryptionAlgorithm, Option<u16>),
    /// Integrity algorithm
    Integrity(IntegrityAlgorithm),
    /// Primary key exchange method
    KeyExchange(KeyExchangeMethod),
    /// Additional key exchange method for the given slot (1..=7)
    AdditionalKeyExchange(u8, KeyExchangeMethod),
    /// Extended sequence number support
    SequenceNumbers(SequenceNumbers),
}

/// Attributes of a [Transform]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// Key length of the encryption algorithm in bits
    KeyLength(u16),
}

/// A cryptographic suite offered or accepted for a single protocol,
/// with transforms grouped by their transform type
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Proposal {
    /// Protocol the proposal applies to, ESP or AH for CHILD_SAs
    pub protocol: SecurityProtocol,
    /// SPI of the sending entity, always 4 octets on the wire for ESP/AH
    pub spi: Option<u32>,
    /// Offered encryption algorithms with their optional key lengths
    pub encryption_algorithms: Vec<(EncryptionAlgorithm, Option<u16>)>,
    /// Offered integrity algorithms
    pub integrity_algorithms: Vec<IntegrityAlgorithm>,
    /// Offered primary key exchange methods
    pub key_exchange_methods: Vec<KeyExchangeMethod>,
    /// Offered additional key exchange methods, one group per ADDKE slot
    pub additional_key_exchanges: [Vec<KeyExchangeMethod>; ADDITIONAL_KEY_EXCHANGES],
    /// Offered sequence number modes
    pub sequence_numbers: Vec<SequenceNumbers>,
}

/// The Security Association payload, an ordered list of proposals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAssociation {
    /// Proposals in preference order of the sender
    pub proposals: Vec<Proposal>,
}

/// The Key Exchange payload carrying one ephemeral public value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangePayload {
    /// Method the public value belongs to
    pub method: KeyExchangeMethod,
    /// The ephemeral public value
    pub data: Vec<u8>,
}

/// A single traffic selector bounding protected flows
///
/// Start and end address must belong to the same family, which also
/// determines the selector type on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSelector {
    /// Wire type of the selector, derived from the address family
    pub ts_type: TsType,
    /// IP protocol the selector is limited to, zero for any
    pub protocol: u8,
    /// First port of the matched range
    pub start_port: u16,
    /// Last port of the matched range
    pub end_port: u16,
    /// First address of the matched range
    pub start_addr: IpAddr,
    /// Last address of the matched range
    pub end_addr: IpAddr,
}

/// Contents of a TSi or TSr payload: the selector list plus an optional
/// security label applying to the whole list (RFC 9478)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TsPayload {
    /// Traffic selectors in preference order of the sender
    pub selectors: Vec<TrafficSelector>,
    /// Security label covering the selector list, if any
    pub label: Option<Vec<u8>>,
}

/// Classified notify message type, keeping unrecognized values around
///
/// Unrecognized error types make the referring request fail entirely, so
/// the receiver must be able to see them; unrecognized status types are
/// ignored but logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyType {
    /// A recognized error type
    Error(NotifyError),
    /// A recognized status type
    Status(NotifyStatus),
    /// An unrecognized type from the error region (below 16384)
    UnknownError(u16),
    /// An unrecognized type from the status region
    UnknownStatus(u16),
}

/// The Notify payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The notify message type
    pub variant: NotifyType,
    /// Protocol of the SA the notification concerns, [SecurityProtocol::Reserved]
    /// when no SPI is carried
    pub protocol: SecurityProtocol,
    /// SPI of the SA the notification concerns
    pub spi: Option<u32>,
    /// Type-specific notification data
    pub data: Vec<u8>,
}

/// The Delete payload listing SPIs of SAs being torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    /// Protocol of the SAs being deleted
    pub protocol: SecurityProtocol,
    /// The inbound SPIs of the sending entity
    pub spis: Vec<u32>,
}

/// One payload of a message, the closed set used by CHILD_SA negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Security Association payload
    SecurityAssociation(SecurityAssociation),
    /// Key Exchange payload
    KeyExchange(KeyExchangePayload),
    /// Nonce payload
    Nonce(Vec<u8>),
    /// Traffic selectors of the negotiation initiator
    TrafficSelectorInitiator(TsPayload),
    /// Traffic selectors of the negotiation responder
    TrafficSelectorResponder(TsPayload),
    /// Notify payload
    Notify(Notification),
    /// Delete payload
    Delete(Delete),
}
