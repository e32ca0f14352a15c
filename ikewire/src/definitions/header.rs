//! Module containing network level header structs for pieces of the protocol

use zerocopy::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::params::NOTIFY_STATUS_FLOOR;

/// Header prepended to every payload in a message
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Next Payload  |C|  RESERVED   |         Payload Length        |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The critical bit is never set by this implementation and ignored on
/// receipt for the payload types it knows.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct GenericPayloadHeader {
    /// Type of the payload following this one, 0 if none does
    pub next_payload: u8,
    /// Critical flag plus reserved bits, must be zero for the payloads used here
    pub reserved: u8,
    /// Length in octets of the payload, including this header
    pub payload_length: U16,
}

/// Protocol header for a Proposal substructure of a Security Association
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Last Substruc |   RESERVED    |         Proposal Length       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Proposal Num  |  Protocol ID  |    SPI Size   |Num  Transforms|
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     ~                        SPI (variable)                         ~
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                        <Transforms>                           ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct ProposalHeader {
    /// Whether the Proposal is the last of the Security Association, value 0
    /// for the last and value 2 for any other
    pub last_substruct: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the current Proposal, including the header itself
    pub proposal_length: U16,
    /// Number of this Proposal in the Security Association; it must be 1 for
    /// the first Proposal and increment by 1 for each following one; a
    /// receiver accepting a proposal echoes exactly this number
    pub proposal_num: u8,
    /// Identifier for the protocol inside the Proposal, ESP or AH for
    /// CHILD_SA proposals; see `SecurityProtocol`
    pub protocol_id: u8,
    /// Size of the SPI in octets, 4 for ESP and AH
    pub spi_size: u8,
    /// Number of transform substructures following the SPI
    pub num_transforms: u8,
}

/// Protocol header for a Transform substructure
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Last Substruc |   RESERVED    |        Transform Length       |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |Transform Type |   RESERVED    |          Transform ID         |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                      Transform Attributes                     ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The transform attributes are not part of the header and thus not included
/// in the struct.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TransformHeader {
    /// Whether the Transform is the last of the Proposal, value 0 for the
    /// last and value 3 for any other
    pub last_substruct: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the current Transform, including the header itself
    pub transform_length: U16,
    /// Type of transformation found in the body of this payload;
    /// see RFC 7296, section 3.3.2; also see `TransformType`
    pub transform_type: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved2: u8,
    /// Identifier of the algorithm, interpreted per transform type
    pub transform_id: U16,
}

/// Protocol field for fixed-length (TV) attributes of a Transform as per
/// RFC 7296, section 3.3.5
///
///                         1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |A|       Attribute Type        |    AF=0  Attribute Length     |
///     |F|                             |    AF=1  Attribute Value      |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// Only the fixed-length variant occurs in CHILD_SA proposals (the key
/// length attribute); the variable-length variant is not modelled.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct AttributeHeaderTV {
    /// Type of the attribute with the top bit set to mark the TV format
    pub attribute_type: U16,
    /// Fixed-length attribute value, the key length in bits
    pub attribute_value: U16,
}

/// Protocol header for key exchange payloads
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |   Key Exchange Method ID      |           RESERVED            |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                       Key Exchange Data                       ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The method field was called "Diffie-Hellman Group Num" before RFC 9370.
/// It must match a key exchange method of a proposal in the SA payload sent
/// in the same message. The key exchange data is not part of the header.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct KeyExchangeHeader {
    /// Key exchange method ID as per `KeyExchangeMethod`
    pub ke_method: U16,
    /// Ignored but must be set to 0
    pub reserved: U16,
}

/// Protocol header for notify payloads
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Protocol ID  |   SPI Size    |      Notify Message Type      |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                Security Parameter Index (SPI)                 ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                       Notification Data                       ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// Neither the SPI nor the notification data is part of the header. The
/// meaning of the data is specific to each notify message type.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct NotifyHeader {
    /// Protocol of the SA the notification concerns, ESP or AH for CHILD_SA
    /// scoped notifications carrying an SPI, zero otherwise
    pub protocol_id: u8,
    /// Length in octets of the SPI, zero if no SPI is applicable
    pub spi_size: u8,
    /// Notify message type; types below 16384 report errors, the rest
    /// report status. Unrecognized error types in a response mean the
    /// corresponding request failed entirely; unrecognized status types
    /// must be ignored and should be logged.
    pub notify_message_type: U16,
}

impl NotifyHeader {
    /// Whether the carried type falls into the error region of the registry
    pub fn is_error(&self) -> bool {
        self.notify_message_type.get() < NOTIFY_STATUS_FLOOR
    }
}

/// Protocol header for delete payloads
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |  Protocol ID  |   SPI Size    |          Num of SPIs          |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~               Security Parameter Index(es) (SPI)              ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct DeleteHeader {
    /// Protocol of the SAs being deleted, ESP or AH here
    pub protocol_id: u8,
    /// Length in octets of a single SPI, 4 for ESP and AH
    pub spi_size: u8,
    /// Number of SPIs following the header
    pub num_spis: U16,
}

/// Protocol header for the TSi and TSr payloads
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     | Number of TSs |                 RESERVED                      |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                       <Traffic Selectors>                     ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TsPayloadHeader {
    /// Number of traffic selector substructures, a security label counts
    pub num_ts: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: [u8; 3],
}

/// Substructure header for an address-range traffic selector (types 7 and 8)
///
///                          1                   2                   3
///      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |   TS Type     |IP Protocol ID*|       Selector Length         |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |           Start Port*         |           End Port*           |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                         Starting Address*                     ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///     |                                                               |
///     ~                         Ending Address*                       ~
///     |                                                               |
///     +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// The addresses are not part of the header; their width follows from the
/// TS type.
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TsEntryHeader {
    /// Traffic selector type, see `TsType`
    pub ts_type: u8,
    /// IP protocol (e.g. UDP, TCP, ICMP) the selector is limited to,
    /// zero to match any protocol
    pub ip_protocol_id: u8,
    /// Length in octets of the substructure, including this header
    pub selector_length: U16,
    /// First port of the matched range, zero for any
    pub start_port: U16,
    /// Last port of the matched range, 65535 for any
    pub end_port: U16,
}

/// Substructure header for a security label traffic selector (type 10,
/// RFC 9478); the label bytes follow the header
#[derive(Debug, FromBytes, FromZeroes, AsBytes, Unaligned, Copy, Clone)]
#[repr(C, packed)]
pub struct TsLabelHeader {
    /// Traffic selector type, always TS_SECLABEL
    pub ts_type: u8,
    /// Reserved, must be zero and must be ignored on receipt
    pub reserved: u8,
    /// Length in octets of the substructure, including this header
    pub selector_length: U16,
}
