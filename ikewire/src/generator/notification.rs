use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::GenericPayloadHeader;
use crate::definitions::header::NotifyHeader;
use crate::definitions::params::PayloadType;
use crate::definitions::Notification;

impl Notification {
    /// Convert a [Notification] into a network-level vector of bytes
    pub fn build(&self, next_payload: PayloadType) -> Vec<u8> {
        let spi = self.spi.map(u32::to_be_bytes);
        let spi_size = spi.map(|s| s.len()).unwrap_or(0);
        let length =
            size_of::<GenericPayloadHeader>() + size_of::<NotifyHeader>() + spi_size + self.data.len();
        let generic_header = GenericPayloadHeader {
            next_payload: next_payload as u8,
            reserved: 0,
            payload_length: U16::from(length as u16),
        };
        let notify_header = NotifyHeader {
            protocol_id: if spi.is_none() { 0 } else { self.protocol as u8 },
            spi_size: spi_size as u8,
            notify_message_type: U16::from(self.variant.value()),
        };

        let mut packet = Vec::with_capacity(length);
        packet.extend_from_slice(generic_header.as_bytes());
        packet.extend_from_slice(notify_header.as_bytes());
        if let Some(spi) = spi {
            packet.extend_from_slice(&spi);
        }
        packet.extend_from_slice(&self.data);
        packet
    }
}

#[cfg(test)]
mod tests {
    use crate::definitions::params::NotifyError;
    use crate::definitions::params::NotifyStatus;
    use crate::definitions::params::PayloadType;
    use crate::definitions::params::SecurityProtocol;
    use crate::definitions::Notification;

    #[test]
    fn invalid_ke_with_suggested_method() {
        // the data carries the expected method as big-endian u16, ecp256 here
        assert_eq!(
            Notification::error(NotifyError::InvalidKePayload)
                .with_data(vec![0x00, 0x13])
                .build(PayloadType::NoNextPayload),
            vec![
                0x00, 0x00, 0x00, 0x0a, // Generic payload header
                0x00, 0x00, 0x00, 0x11, // Notify header
                0x00, 0x13, // data
            ]
        );
    }

    #[test]
    fn rekey_sa_with_spi() {
        assert_eq!(
            Notification::status(NotifyStatus::RekeySa)
                .with_spi(SecurityProtocol::EncapsulatingSecurityPayload, 0x00010203)
                .build(PayloadType::Notify),
            vec![
                0x29, 0x00, 0x00, 0x0c, // Generic payload header
                0x03, 0x04, 0x40, 0x09, // Notify header
                0x00, 0x01, 0x02, 0x03, // SPI
            ]
        );
    }
}
