use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::TransformHeader;
use crate::definitions::params::TransformType;

/// Encode a single transform substructure
///
/// The argument `last` defines if any transform is following this transform
/// (false) or if this transform is the last one in the proposal (true).
pub(crate) fn build_transform(
    ttype: TransformType,
    id: u16,
    attributes: &[u8],
    last: bool,
) -> Vec<u8> {
    let packet_length = size_of::<TransformHeader>() as u16 + attributes.len() as u16;
    let header = TransformHeader {
        last_substruct: if last { 0 } else { 3 },
        reserved: 0,
        transform_length: U16::from(packet_length),
        transform_type: ttype as u8,
        reserved2: 0,
        transform_id: U16::from(id),
    };

    let mut packet = Vec::with_capacity(packet_length as usize);
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(attributes);
    packet
}

#[cfg(test)]
mod tests {
    use super::build_transform;
    use crate::definitions::params::KeyExchangeMethod;
    use crate::definitions::params::TransformType;
    use crate::definitions::Attribute;

    #[test]
    fn key_exchange() {
        assert_eq!(
            build_transform(
                TransformType::KeyExchangeMethod,
                KeyExchangeMethod::Curve25519 as u16,
                &[],
                true
            ),
            vec![0x00, 0x00, 0x00, 0x08, 0x04, 0x00, 0x00, 0x1f]
        );
        assert_eq!(
            build_transform(
                TransformType::AdditionalKeyExchange1,
                KeyExchangeMethod::MlKem768 as u16,
                &[],
                false
            ),
            vec![0x03, 0x00, 0x00, 0x08, 0x06, 0x00, 0x00, 0x24]
        );
    }

    #[test]
    fn encryption_with_key_length() {
        assert_eq!(
            build_transform(
                TransformType::EncryptionAlgorithm,
                12,
                &Attribute::KeyLength(128).build(),
                false
            ),
            vec![0x03, 0x00, 0x00, 0x0c, 0x01, 0x00, 0x00, 0x0c, 0x80, 0x0e, 0x00, 0x80]
        );
    }
}
