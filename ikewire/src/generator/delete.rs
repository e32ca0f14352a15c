use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::DeleteHeader;
use crate::definitions::header::GenericPayloadHeader;
use crate::definitions::params::PayloadType;
use crate::definitions::Delete;

impl Delete {
    /// Convert a [Delete] into a network-level vector of bytes
    pub fn build(&self, next_payload: PayloadType) -> Vec<u8> {
        let length =
            size_of::<GenericPayloadHeader>() + size_of::<DeleteHeader>() + 4 * self.spis.len();
        let generic_header = GenericPayloadHeader {
            next_payload: next_payload as u8,
            reserved: 0,
            payload_length: U16::from(length as u16),
        };
        let delete_header = DeleteHeader {
            protocol_id: self.protocol as u8,
            spi_size: 4,
            num_spis: U16::from(self.spis.len() as u16),
        };
        let mut packet = Vec::with_capacity(length);
        packet.extend_from_slice(generic_header.as_bytes());
        packet.extend_from_slice(delete_header.as_bytes());
        for spi in &self.spis {
            packet.extend_from_slice(&spi.to_be_bytes());
        }
        packet
    }
}

#[cfg(test)]
mod tests {
    use crate::definitions::params::PayloadType;
    use crate::definitions::params::SecurityProtocol;
    use crate::definitions::Delete;

    #[test]
    fn single_esp_spi() {
        assert_eq!(
            Delete {
                protocol: SecurityProtocol::EncapsulatingSecurityPayload,
                spis: vec![0xdeadbeef],
            }
            .build(PayloadType::NoNextPayload),
            vec![
                0x00, 0x00, 0x00, 0x0c, // Generic payload header
                0x03, 0x04, 0x00, 0x01, // Delete header
                0xde, 0xad, 0xbe, 0xef, // SPI
            ]
        );
    }
}
