use zerocopy::FromBytes;

use crate::definitions::header::NotifyHeader;
use crate::definitions::params::SecurityProtocol;
use crate::definitions::Notification;
use crate::definitions::NotifyType;
use crate::parser::ParserError;

impl Notification {
    /// Parses a buffer into a [Notification]. The buffer must not contain
    /// the generic payload header. Unrecognized notify message types are
    /// kept as their raw value so the consumer can apply the mandated
    /// fail-or-ignore handling.
    pub(crate) fn try_parse(buf: &[u8]) -> Result<Self, ParserError> {
        let header = NotifyHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
        let spi_size = header.spi_size as usize;
        if buf.len() < size_of::<NotifyHeader>() + spi_size {
            return Err(ParserError::BufferTooSmall);
        }
        let variant = NotifyType::from_value(header.notify_message_type.get());
        let protocol = SecurityProtocol::try_from(header.protocol_id)?;

        if spi_size > 0 && protocol == SecurityProtocol::InternetKeyExchange {
            // It is not legal to have both an SPI and use IKE
            return Err(ParserError::ProtocolViolation);
        } else if spi_size == 0 && protocol != SecurityProtocol::Reserved {
            // If the SPI is not sent, the protocol ID must be 0 (=reserved)
            return Err(ParserError::ProtocolViolation);
        }

        let spi = match spi_size {
            0 => None,
            4 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&buf[size_of::<NotifyHeader>()..size_of::<NotifyHeader>() + 4]);
                Some(u32::from_be_bytes(raw))
            }
            _ => return Err(ParserError::ProtocolViolation),
        };

        Ok(Self {
            variant,
            protocol,
            spi,
            data: buf[size_of::<NotifyHeader>() + spi_size..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::definitions::params::NotifyStatus;
    use crate::definitions::Notification;
    use crate::definitions::NotifyType;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn parse_ipcomp_supported() {
        // CPI 0x4321, transform DEFLATE
        let buf = vec![0x00, 0x00, 0x40, 0x03, 0x43, 0x21, 0x02];
        let notify = Notification::try_parse(&buf).unwrap();
        assert_eq!(
            notify.variant,
            NotifyType::Status(NotifyStatus::IpcompSupported)
        );
        assert_eq!(notify.data, vec![0x43, 0x21, 0x02]);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn unknown_types_are_kept_raw() {
        let buf = vec![0x00, 0x00, 0x00, 0x63]; // error region, unassigned
        let notify = Notification::try_parse(&buf).unwrap();
        assert_eq!(notify.variant, NotifyType::UnknownError(0x63));
        assert!(notify.variant.is_error());

        let buf = vec![0x00, 0x00, 0x42, 0x00]; // status region, unassigned
        let notify = Notification::try_parse(&buf).unwrap();
        assert_eq!(notify.variant, NotifyType::UnknownStatus(0x4200));
        assert!(!notify.variant.is_error());
    }
}
