use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::GenericPayloadHeader;
use crate::definitions::params::PayloadType;
use crate::definitions::SecurityAssociation;
use crate::generator::GeneratorError;
use crate::generator::ESTIMATED_PROPOSAL_LENGTH;

impl SecurityAssociation {
    /// Build a network-level packet from a [SecurityAssociation]
    ///
    /// This might fail if the payload would not conform to the standard,
    /// for example if too many proposals or transforms are present.
    pub fn try_build(&self, next_payload: PayloadType) -> Result<Vec<u8>, GeneratorError> {
        if self.proposals.len() >= 255 {
            return Err(GeneratorError::TooManyProposals);
        }
        let mut proposals = Vec::with_capacity(ESTIMATED_PROPOSAL_LENGTH * self.proposals.len());
        for (i, proposal) in self.proposals.iter().enumerate() {
            proposals.extend(proposal.try_build(i as u8 + 1, i == self.proposals.len() - 1)?);
        }

        let packet_length = size_of::<GenericPayloadHeader>() + proposals.len();
        let header = GenericPayloadHeader {
            next_payload: next_payload as u8,
            reserved: 0,
            payload_length: U16::from(packet_length as u16),
        };
        let mut packet = Vec::with_capacity(packet_length);
        packet.extend_from_slice(header.as_bytes());
        packet.extend(proposals);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use crate::definitions::params::PayloadType;
    use crate::definitions::SecurityAssociation;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn empty() {
        assert_eq!(
            SecurityAssociation { proposals: vec![] }
                .try_build(PayloadType::NoNextPayload)
                .unwrap(),
            vec![0x00, 0x00, 0x00, 0x04]
        )
    }
}
