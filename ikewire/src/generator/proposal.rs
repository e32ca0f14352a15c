use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::ProposalHeader;
use crate::definitions::params::TransformType;
use crate::definitions::Attribute;
use crate::definitions::Proposal;
use crate::generator::transform::build_transform;
use crate::generator::GeneratorError;

impl Proposal {
    /// Flatten the transform groups into wire order:
    /// encryption, integrity, KE, ADDKE1..7, sequence numbers
    pub(crate) fn wire_transforms(&self) -> Vec<(TransformType, u16, Vec<u8>)> {
        let mut transforms = Vec::with_capacity(self.len());
        for (algorithm, key_length) in &self.encryption_algorithms {
            let attributes = match key_length {
                None => vec![],
                Some(bits) => Attribute::KeyLength(*bits).build(),
            };
            transforms.push((
                TransformType::EncryptionAlgorithm,
                *algorithm as u16,
                attributes,
            ));
        }
        for algorithm in &self.integrity_algorithms {
            transforms.push((TransformType::IntegrityAlgorithm, *algorithm as u16, vec![]));
        }
        for method in &self.key_exchange_methods {
            transforms.push((TransformType::KeyExchangeMethod, *method as u16, vec![]));
        }
        for (ttype, group) in TransformType::additional().zip(&self.additional_key_exchanges) {
            for method in group {
                transforms.push((ttype, *method as u16, vec![]));
            }
        }
        for mode in &self.sequence_numbers {
            transforms.push((TransformType::SequenceNumbers, *mode as u16, vec![]));
        }
        transforms
    }

    /// Convert a [Proposal] into a network-level vector of bytes
    ///
    /// The argument `num` defines the number of the proposal in the list of
    /// proposals in a Security Association.
    ///
    /// The argument `last` defines if any proposal is following this proposal
    /// (false) or if this proposal is the last one of the payload (true).
    pub fn try_build(&self, num: u8, last: bool) -> Result<Vec<u8>, GeneratorError> {
        let wire = self.wire_transforms();
        if wire.len() > 255 {
            return Err(GeneratorError::TooManyTransforms);
        }
        let mut transforms = Vec::with_capacity(12 * wire.len());
        for (i, (ttype, id, attributes)) in wire.iter().enumerate() {
            transforms.extend(build_transform(
                *ttype,
                *id,
                attributes,
                i == wire.len() - 1,
            ));
        }

        let spi = self.spi.map(u32::to_be_bytes);
        let spi_size = spi.map(|s| s.len()).unwrap_or(0);
        let packet_length = size_of::<ProposalHeader>() + spi_size + transforms.len();
        let header = ProposalHeader {
            last_substruct: if last { 0 } else { 2 },
            reserved: 0,
            proposal_length: U16::from(packet_length as u16),
            proposal_num: num,
            protocol_id: self.protocol as u8,
            spi_size: spi_size as u8,
            num_transforms: wire.len() as u8,
        };

        let mut packet = Vec::with_capacity(packet_length);
        packet.extend_from_slice(header.as_bytes());
        if let Some(spi) = spi {
            packet.extend_from_slice(&spi);
        }
        packet.extend(transforms);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use crate::definitions::params::EncryptionAlgorithm;
    use crate::definitions::params::KeyExchangeMethod;
    use crate::definitions::params::SecurityProtocol;
    use crate::definitions::Proposal;
    use crate::definitions::Transform;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn empty() {
        assert_eq!(
            Proposal::new_empty(SecurityProtocol::EncapsulatingSecurityPayload, None)
                .try_build(1, true)
                .unwrap(),
            vec![0x00, 0x00, 0x00, 0x08, 0x01, 0x03, 0x00, 0x00]
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn esp_with_spi() {
        let mut p = Proposal::new_empty(
            SecurityProtocol::EncapsulatingSecurityPayload,
            Some(0x13371337),
        );
        p.add(vec![
            Transform::Encryption(EncryptionAlgorithm::AesGcm16, Some(256)),
            Transform::KeyExchange(KeyExchangeMethod::Curve25519),
            Transform::AdditionalKeyExchange(1, KeyExchangeMethod::MlKem768),
        ]);
        assert_eq!(
            p.try_build(1, true).unwrap(),
            vec![
                0x00, 0x00, 0x00, 0x28, 0x01, 0x03, 0x04, 0x03, // Proposal header
                0x13, 0x37, 0x13, 0x37, // SPI
                0x03, 0x00, 0x00, 0x0c, 0x01, 0x00, 0x00, 0x14, // Transform 1, encryption
                0x80, 0x0e, 0x01, 0x00, // Transform 1, key length attribute
                0x03, 0x00, 0x00, 0x08, 0x04, 0x00, 0x00, 0x1f, // Transform 2, KE
                0x00, 0x00, 0x00, 0x08, 0x06, 0x00, 0x00, 0x24, // Transform 3, ADDKE1
            ]
        );
    }
}
