use log::warn;
use zerocopy::FromBytes;

use crate::definitions::header::AttributeHeaderTV;
use crate::definitions::header::ProposalHeader;
use crate::definitions::header::TransformHeader;
use crate::definitions::params::AttributeType;
use crate::definitions::params::EncryptionAlgorithm;
use crate::definitions::params::IntegrityAlgorithm;
use crate::definitions::params::KeyExchangeMethod;
use crate::definitions::params::SecurityProtocol;
use crate::definitions::params::SequenceNumbers;
use crate::definitions::params::TransformType;
use crate::definitions::params::FLAG_ATTRIBUTE_FORMAT;
use crate::definitions::Proposal;
use crate::definitions::Transform;
use crate::parser::ParserError;

impl Proposal {
    /// Parse one proposal substructure, starting at its header. The buffer
    /// may extend beyond the proposal; the consumed size is bounded by the
    /// header's length field.
    pub(crate) fn try_parse(buf: &[u8]) -> Result<Self, ParserError> {
        let header = ProposalHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
        let header_len = size_of::<ProposalHeader>();
        let spi_len = header.spi_size as usize;
        let total = header.proposal_length.get() as usize;
        if total < header_len + spi_len || total > buf.len() {
            return Err(ParserError::InvalidLength);
        }
        let spi = match spi_len {
            0 => None,
            4 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&buf[header_len..header_len + 4]);
                Some(u32::from_be_bytes(raw))
            }
            _ => return Err(ParserError::ProtocolViolation),
        };
        let protocol = SecurityProtocol::try_from(header.protocol_id)?;

        let mut proposal = Proposal::new_empty(protocol, spi);
        let mut offset = header_len + spi_len;
        for _ in 0..header.num_transforms {
            let transform =
                TransformHeader::ref_from_prefix(&buf[offset..]).ok_or(ParserError::BufferTooSmall)?;
            let length = transform.transform_length.get() as usize;
            if length < size_of::<TransformHeader>() || offset + length > total {
                return Err(ParserError::InvalidLength);
            }
            let attributes = &buf[offset + size_of::<TransformHeader>()..offset + length];
            if let Some(parsed) = parse_transform(transform, attributes)? {
                proposal.add(vec![parsed]);
            }
            offset += length;
        }
        Ok(proposal)
    }
}

/// Interpret a single transform; unrecognized transform types and IDs are
/// skipped so that selection simply never matches them
fn parse_transform(
    header: &TransformHeader,
    attributes: &[u8],
) -> Result<Option<Transform>, ParserError> {
    let id = header.transform_id.get();
    let ttype = match TransformType::try_from(header.transform_type) {
        Ok(t) => t,
        Err(region) => {
            warn!(
                "Skipping transform of unrecognized type {} ({region:?})",
                header.transform_type
            );
            return Ok(None);
        }
    };
    let transform = match ttype {
        TransformType::EncryptionAlgorithm => {
            let Ok(algorithm) = EncryptionAlgorithm::try_from(id) else {
                warn!("Skipping unrecognized encryption algorithm {id}");
                return Ok(None);
            };
            Transform::Encryption(algorithm, parse_key_length(attributes)?)
        }
        TransformType::IntegrityAlgorithm => {
            let Ok(algorithm) = IntegrityAlgorithm::try_from(id) else {
                warn!("Skipping unrecognized integrity algorithm {id}");
                return Ok(None);
            };
            Transform::Integrity(algorithm)
        }
        TransformType::KeyExchangeMethod => {
            let Ok(method) = KeyExchangeMethod::try_from(id) else {
                warn!("Skipping unrecognized key exchange method {id}");
                return Ok(None);
            };
            Transform::KeyExchange(method)
        }
        TransformType::SequenceNumbers => {
            let Ok(mode) = SequenceNumbers::try_from(id) else {
                warn!("Skipping unrecognized sequence number mode {id}");
                return Ok(None);
            };
            Transform::SequenceNumbers(mode)
        }
        TransformType::PseudoRandomFunction => {
            // a PRF has no business in an ESP or AH proposal
            warn!("Skipping pseudo-random function transform in CHILD_SA proposal");
            return Ok(None);
        }
        other => match other.additional_index() {
            Some(slot) => {
                let Ok(method) = KeyExchangeMethod::try_from(id) else {
                    warn!("Skipping unrecognized additional key exchange method {id}");
                    return Ok(None);
                };
                Transform::AdditionalKeyExchange(slot as u8, method)
            }
            None => return Ok(None),
        },
    };
    Ok(Some(transform))
}

/// Extract the key length attribute of an encryption transform, if present
fn parse_key_length(attributes: &[u8]) -> Result<Option<u16>, ParserError> {
    if attributes.is_empty() {
        return Ok(None);
    }
    let header =
        AttributeHeaderTV::ref_from_prefix(attributes).ok_or(ParserError::BufferTooSmall)?;
    let raw_type = header.attribute_type.get();
    if raw_type & FLAG_ATTRIBUTE_FORMAT == 0 {
        // variable-length attributes are not used by any known transform
        return Err(ParserError::ProtocolViolation);
    }
    if raw_type & !FLAG_ATTRIBUTE_FORMAT != AttributeType::KeyLength as u16 {
        warn!("Ignoring unrecognized transform attribute {raw_type:#x}");
        return Ok(None);
    }
    Ok(Some(header.attribute_value.get()))
}

#[cfg(test)]
mod tests {
    use crate::definitions::params::EncryptionAlgorithm;
    use crate::definitions::params::KeyExchangeMethod;
    use crate::definitions::Proposal;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn parse_esp_proposal() {
        let buf = vec![
            0x00, 0x00, 0x00, 0x28, 0x01, 0x03, 0x04, 0x03, // Proposal header
            0x13, 0x37, 0x13, 0x37, // SPI
            0x03, 0x00, 0x00, 0x0c, 0x01, 0x00, 0x00, 0x14, // encryption
            0x80, 0x0e, 0x01, 0x00, // key length attribute
            0x03, 0x00, 0x00, 0x08, 0x04, 0x00, 0x00, 0x1f, // KE
            0x00, 0x00, 0x00, 0x08, 0x06, 0x00, 0x00, 0x24, // ADDKE1
        ];
        let proposal = Proposal::try_parse(&buf).unwrap();
        assert_eq!(proposal.spi, Some(0x13371337));
        assert_eq!(
            proposal.encryption_algorithms,
            vec![(EncryptionAlgorithm::AesGcm16, Some(256))]
        );
        assert_eq!(proposal.first_ke_method(), Some(KeyExchangeMethod::Curve25519));
        assert_eq!(
            proposal.additional_key_exchanges[0],
            vec![KeyExchangeMethod::MlKem768]
        );
    }
}
