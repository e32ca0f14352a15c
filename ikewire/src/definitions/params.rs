//! IKEv2 parameters and their parsers as defined in the IANA IKEv2 list
//! found at https://www.iana.org/assignments/ikev2-parameters/ikev2-parameters.xhtml

use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;
use strum::IntoEnumIterator;

use super::UnparseableParameter;

/// Flag bit marking a transform attribute as fixed-length (TV format)
pub const FLAG_ATTRIBUTE_FORMAT: u16 = 0x8000;

/// Transform IDs at or above this value are reserved for private use
pub const PRIVATE_USE_TRANSFORM_ID: u16 = 1024;

/// Notify message types below this value report errors, the rest report status
pub const NOTIFY_STATUS_FLOOR: u16 = 16384;

/// Type of the exchange being used
///
/// This constrains the payloads sent in each message of an exchange.
/// Values 0-33 are reserved, 45-239 are currently unassigned and
/// 240-255 reserved for private use. Also see [UnparseableParameter].
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ExchangeType {
    // RFC 7296
    IkeSaInit = 34,
    // RFC 7296
    IkeAuth = 35,
    // RFC 7296
    CreateChildSa = 36,
    // RFC 7296
    Informational = 37,
    // RFC 9242
    IkeIntermediate = 43,
    // RFC 9370
    IkeFollowupKeyExchange = 44,
}

impl TryFrom<u8> for ExchangeType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0..=33 => Err(UnparseableParameter::Reserved),
            34 => Ok(ExchangeType::IkeSaInit),
            35 => Ok(ExchangeType::IkeAuth),
            36 => Ok(ExchangeType::CreateChildSa),
            37 => Ok(ExchangeType::Informational),
            38..=42 => Err(UnparseableParameter::Unassigned),
            43 => Ok(ExchangeType::IkeIntermediate),
            44 => Ok(ExchangeType::IkeFollowupKeyExchange),
            45..=239 => Err(UnparseableParameter::Unassigned),
            240..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of a payload inside a message
///
/// Only the payloads that can occur in a CHILD_SA negotiation are
/// represented by name; everything else falls into the unassigned or
/// private regions on conversion. Also see [UnparseableParameter].
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum PayloadType {
    // RFC 7296, terminates the payload chain
    NoNextPayload = 0,
    // RFC 7296
    SecurityAssociation = 33,
    // RFC 7296
    KeyExchange = 34,
    // RFC 7296
    Nonce = 40,
    // RFC 7296
    Notify = 41,
    // RFC 7296
    Delete = 42,
    // RFC 7296
    VendorID = 43,
    // RFC 7296
    TrafficSelectorInitiator = 44,
    // RFC 7296
    TrafficSelectorResponder = 45,
    // RFC 7296
    EncryptedAndAuthenticated = 46,
}

impl TryFrom<u8> for PayloadType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadType::NoNextPayload),
            1..=32 => Err(UnparseableParameter::Reserved),
            33 => Ok(PayloadType::SecurityAssociation),
            34 => Ok(PayloadType::KeyExchange),
            35..=39 => Err(UnparseableParameter::Unassigned),
            40 => Ok(PayloadType::Nonce),
            41 => Ok(PayloadType::Notify),
            42 => Ok(PayloadType::Delete),
            43 => Ok(PayloadType::VendorID),
            44 => Ok(PayloadType::TrafficSelectorInitiator),
            45 => Ok(PayloadType::TrafficSelectorResponder),
            46 => Ok(PayloadType::EncryptedAndAuthenticated),
            47..=127 => Err(UnparseableParameter::Unassigned),
            128..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Security protocol negotiated by a proposal or referenced by a notify
///
/// The value 0 is only valid where the field is explicitly unused, for
/// example in a notify payload that carries no SPI.
#[derive(Debug, Default, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum SecurityProtocol {
    #[default]
    Reserved = 0,
    InternetKeyExchange = 1,
    AuthenticationHeader = 2,
    EncapsulatingSecurityPayload = 3,
}

impl TryFrom<u8> for SecurityProtocol {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SecurityProtocol::Reserved),
            1 => Ok(SecurityProtocol::InternetKeyExchange),
            2 => Ok(SecurityProtocol::AuthenticationHeader),
            3 => Ok(SecurityProtocol::EncapsulatingSecurityPayload),
            4..=200 => Err(UnparseableParameter::Unassigned),
            201..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Type of the transform being used
///
/// Value 0 is reserved, 15-240 is unassigned and 241-255 is
/// reserved for private use. Also see [UnparseableParameter].
///
/// The "Key Exchange Method (KE)" transform type was originally
/// named "Diffie-Hellman Group (D-H)" and was referenced by
/// that name in a number of RFCs published prior
/// to RFC 9370, which gave it the current title.
///
/// All "Additional Key Exchange (ADDKE)" entries use the same
/// "Transform Type 4 - Key Exchange Method Transform IDs"
/// registry as the "Key Exchange Method (KE)" entry.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, EnumIter)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TransformType {
    EncryptionAlgorithm = 1,
    PseudoRandomFunction = 2,
    IntegrityAlgorithm = 3,
    KeyExchangeMethod = 4,
    SequenceNumbers = 5,
    AdditionalKeyExchange1 = 6,
    AdditionalKeyExchange2 = 7,
    AdditionalKeyExchange3 = 8,
    AdditionalKeyExchange4 = 9,
    AdditionalKeyExchange5 = 10,
    AdditionalKeyExchange6 = 11,
    AdditionalKeyExchange7 = 12,
}

impl TryFrom<u8> for TransformType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(TransformType::EncryptionAlgorithm),
            2 => Ok(TransformType::PseudoRandomFunction),
            3 => Ok(TransformType::IntegrityAlgorithm),
            4 => Ok(TransformType::KeyExchangeMethod),
            5 => Ok(TransformType::SequenceNumbers),
            6 => Ok(TransformType::AdditionalKeyExchange1),
            7 => Ok(TransformType::AdditionalKeyExchange2),
            8 => Ok(TransformType::AdditionalKeyExchange3),
            9 => Ok(TransformType::AdditionalKeyExchange4),
            10 => Ok(TransformType::AdditionalKeyExchange5),
            11 => Ok(TransformType::AdditionalKeyExchange6),
            12 => Ok(TransformType::AdditionalKeyExchange7),
            13..=240 => Err(UnparseableParameter::Unassigned),
            241..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

impl TransformType {
    /// Slot index (1..=7) of an additional key exchange transform type,
    /// `None` for every other transform type
    pub fn additional_index(&self) -> Option<usize> {
        match self {
            TransformType::AdditionalKeyExchange1 => Some(1),
            TransformType::AdditionalKeyExchange2 => Some(2),
            TransformType::AdditionalKeyExchange3 => Some(3),
            TransformType::AdditionalKeyExchange4 => Some(4),
            TransformType::AdditionalKeyExchange5 => Some(5),
            TransformType::AdditionalKeyExchange6 => Some(6),
            TransformType::AdditionalKeyExchange7 => Some(7),
            _ => None,
        }
    }

    /// Iterate the seven additional key exchange transform types in slot order
    pub fn additional() -> impl Iterator<Item = TransformType> {
        Self::iter().filter(|t| t.additional_index().is_some())
    }
}

/// Transform Type 1 - Encryption Algorithm Transform IDs
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum EncryptionAlgorithm {
    TripleDes = 3,
    Null = 11,
    AesCbc = 12,
    AesCtr = 13,
    AesGcm8 = 18,
    AesGcm12 = 19,
    AesGcm16 = 20,
    ChaCha20Poly1305 = 28,
}

impl TryFrom<u16> for EncryptionAlgorithm {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            3 => Ok(EncryptionAlgorithm::TripleDes),
            11 => Ok(EncryptionAlgorithm::Null),
            12 => Ok(EncryptionAlgorithm::AesCbc),
            13 => Ok(EncryptionAlgorithm::AesCtr),
            18 => Ok(EncryptionAlgorithm::AesGcm8),
            19 => Ok(EncryptionAlgorithm::AesGcm12),
            20 => Ok(EncryptionAlgorithm::AesGcm16),
            28 => Ok(EncryptionAlgorithm::ChaCha20Poly1305),
            1024..=u16::MAX => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// Transform Type 3 - Integrity Algorithm Transform IDs
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum IntegrityAlgorithm {
    None = 0,
    HmacSha1_96 = 2,
    AesXcbc96 = 5,
    HmacSha2_256_128 = 12,
    HmacSha2_384_192 = 13,
    HmacSha2_512_256 = 14,
}

impl TryFrom<u16> for IntegrityAlgorithm {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IntegrityAlgorithm::None),
            2 => Ok(IntegrityAlgorithm::HmacSha1_96),
            5 => Ok(IntegrityAlgorithm::AesXcbc96),
            12 => Ok(IntegrityAlgorithm::HmacSha2_256_128),
            13 => Ok(IntegrityAlgorithm::HmacSha2_384_192),
            14 => Ok(IntegrityAlgorithm::HmacSha2_512_256),
            1024..=u16::MAX => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// Transform Type 4 - Key Exchange Method Transform IDs
///
/// The two entries above 1024 are the private-use methods strongSwan
/// registers; [KeyExchangeMethod::is_private] reports them as such.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize, strum::Display)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum KeyExchangeMethod {
    None = 0,
    ModP768 = 1,
    ModP1024 = 2,
    ModP1536 = 5,
    ModP2048 = 14,
    ModP3072 = 15,
    ModP4096 = 16,
    ModP6144 = 17,
    ModP8192 = 18,
    EcP256 = 19,
    EcP384 = 20,
    EcP521 = 21,
    Curve25519 = 31,
    Curve448 = 32,
    MlKem512 = 35,
    MlKem768 = 36,
    MlKem1024 = 37,
    ModPNull = 1025,
    ModPCustom = 1026,
}

impl TryFrom<u16> for KeyExchangeMethod {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyExchangeMethod::None),
            1 => Ok(KeyExchangeMethod::ModP768),
            2 => Ok(KeyExchangeMethod::ModP1024),
            5 => Ok(KeyExchangeMethod::ModP1536),
            14 => Ok(KeyExchangeMethod::ModP2048),
            15 => Ok(KeyExchangeMethod::ModP3072),
            16 => Ok(KeyExchangeMethod::ModP4096),
            17 => Ok(KeyExchangeMethod::ModP6144),
            18 => Ok(KeyExchangeMethod::ModP8192),
            19 => Ok(KeyExchangeMethod::EcP256),
            20 => Ok(KeyExchangeMethod::EcP384),
            21 => Ok(KeyExchangeMethod::EcP521),
            31 => Ok(KeyExchangeMethod::Curve25519),
            32 => Ok(KeyExchangeMethod::Curve448),
            35 => Ok(KeyExchangeMethod::MlKem512),
            36 => Ok(KeyExchangeMethod::MlKem768),
            37 => Ok(KeyExchangeMethod::MlKem1024),
            1025 => Ok(KeyExchangeMethod::ModPNull),
            1026 => Ok(KeyExchangeMethod::ModPCustom),
            1024..=u16::MAX => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

impl KeyExchangeMethod {
    /// Whether the method ID lies in the private-use region of the registry
    pub fn is_private(&self) -> bool {
        *self as u16 >= PRIVATE_USE_TRANSFORM_ID
    }
}

/// Transform Type 5 - Sequence Numbers Transform IDs
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum SequenceNumbers {
    None = 0,
    Extended = 1,
}

impl TryFrom<u16> for SequenceNumbers {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SequenceNumbers::None),
            1 => Ok(SequenceNumbers::Extended),
            1024..=u16::MAX => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// IKEv2 Transform Attribute Types
///
/// The key length is the only attribute defined by RFC 7296.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum AttributeType {
    KeyLength = 14,
}

/// IKEv2 Traffic Selector Types
///
/// Values 0-6 are reserved, 9 is unassigned and 241-255 are reserved
/// for private use. TS_SECLABEL is defined by RFC 9478.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TsType {
    Ipv4AddrRange = 7,
    Ipv6AddrRange = 8,
    SecLabel = 10,
}

impl TryFrom<u8> for TsType {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0..=6 => Err(UnparseableParameter::Reserved),
            7 => Ok(TsType::Ipv4AddrRange),
            8 => Ok(TsType::Ipv6AddrRange),
            9 => Err(UnparseableParameter::Unassigned),
            10 => Ok(TsType::SecLabel),
            11..=240 => Err(UnparseableParameter::Unassigned),
            241..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// IKEv2 Notification IPCOMP Transform IDs, carried in the
/// IPCOMP_SUPPORTED notify after the CPI
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum IpcompTransform {
    Oui = 1,
    Deflate = 2,
    Lzs = 3,
    Lzjh = 4,
}

impl TryFrom<u8> for IpcompTransform {
    type Error = UnparseableParameter;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Err(UnparseableParameter::Reserved),
            1 => Ok(IpcompTransform::Oui),
            2 => Ok(IpcompTransform::Deflate),
            3 => Ok(IpcompTransform::Lzs),
            4 => Ok(IpcompTransform::Lzjh),
            5..=240 => Err(UnparseableParameter::Unassigned),
            241..=255 => Err(UnparseableParameter::PrivateUse),
        }
    }
}

/// Notify message types reporting an error (values below 16384)
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, strum::Display)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum NotifyError {
    UnsupportedCriticalPayload = 1,
    InvalidIkeSpi = 4,
    InvalidMajorVersion = 5,
    InvalidSyntax = 7,
    InvalidMessageId = 9,
    InvalidSpi = 11,
    NoProposalChosen = 14,
    InvalidKePayload = 17,
    AuthenticationFailed = 24,
    SinglePairRequired = 34,
    NoAdditionalSas = 35,
    InternalAddressFailure = 36,
    FailedCpRequired = 37,
    TsUnacceptable = 38,
    InvalidSelectors = 39,
    TemporaryFailure = 43,
    ChildSaNotFound = 44,
    StateNotFound = 47,
}

impl TryFrom<u16> for NotifyError {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(NotifyError::UnsupportedCriticalPayload),
            4 => Ok(NotifyError::InvalidIkeSpi),
            5 => Ok(NotifyError::InvalidMajorVersion),
            7 => Ok(NotifyError::InvalidSyntax),
            9 => Ok(NotifyError::InvalidMessageId),
            11 => Ok(NotifyError::InvalidSpi),
            14 => Ok(NotifyError::NoProposalChosen),
            17 => Ok(NotifyError::InvalidKePayload),
            24 => Ok(NotifyError::AuthenticationFailed),
            34 => Ok(NotifyError::SinglePairRequired),
            35 => Ok(NotifyError::NoAdditionalSas),
            36 => Ok(NotifyError::InternalAddressFailure),
            37 => Ok(NotifyError::FailedCpRequired),
            38 => Ok(NotifyError::TsUnacceptable),
            39 => Ok(NotifyError::InvalidSelectors),
            43 => Ok(NotifyError::TemporaryFailure),
            44 => Ok(NotifyError::ChildSaNotFound),
            47 => Ok(NotifyError::StateNotFound),
            8192..=16383 => Err(UnparseableParameter::PrivateUse),
            16384..=u16::MAX => Err(UnparseableParameter::OutOfRange),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}

/// Notify message types reporting status (values 16384 and above)
///
/// USE_BEET_MODE lives in the private-use region; it is the value
/// strongSwan picked for its proprietary BEET mode extension.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, strum::Display)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum NotifyStatus {
    InitialContact = 16384,
    AdditionalTsPossible = 16386,
    IpcompSupported = 16387,
    UseTransportMode = 16391,
    RekeySa = 16393,
    EspTfcPaddingNotSupported = 16394,
    ChildlessIkev2Supported = 16418,
    AdditionalKeyExchange = 16441,
    UseBeetMode = 40961,
}

impl TryFrom<u16> for NotifyStatus {
    type Error = UnparseableParameter;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0..=16383 => Err(UnparseableParameter::OutOfRange),
            16384 => Ok(NotifyStatus::InitialContact),
            16386 => Ok(NotifyStatus::AdditionalTsPossible),
            16387 => Ok(NotifyStatus::IpcompSupported),
            16391 => Ok(NotifyStatus::UseTransportMode),
            16393 => Ok(NotifyStatus::RekeySa),
            16394 => Ok(NotifyStatus::EspTfcPaddingNotSupported),
            16418 => Ok(NotifyStatus::ChildlessIkev2Supported),
            16441 => Ok(NotifyStatus::AdditionalKeyExchange),
            40961 => Ok(NotifyStatus::UseBeetMode),
            40960..=u16::MAX => Err(UnparseableParameter::PrivateUse),
            _ => Err(UnparseableParameter::Unassigned),
        }
    }
}
