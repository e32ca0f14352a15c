use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::GenericPayloadHeader;
use crate::definitions::header::TsEntryHeader;
use crate::definitions::header::TsLabelHeader;
use crate::definitions::header::TsPayloadHeader;
use crate::definitions::params::PayloadType;
use crate::definitions::params::TsType;
use crate::definitions::TrafficSelector;
use crate::definitions::TsPayload;
use crate::generator::GeneratorError;
use std::net::IpAddr;

fn push_addr(packet: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => packet.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => packet.extend_from_slice(&v6.octets()),
    }
}

impl TrafficSelector {
    pub(crate) fn build(&self) -> Vec<u8> {
        let addr_len = match self.ts_type {
            TsType::Ipv6AddrRange => 16,
            _ => 4,
        };
        let length = size_of::<TsEntryHeader>() + 2 * addr_len;
        let header = TsEntryHeader {
            ts_type: self.ts_type as u8,
            ip_protocol_id: self.protocol,
            selector_length: U16::from(length as u16),
            start_port: U16::from(self.start_port),
            end_port: U16::from(self.end_port),
        };
        let mut packet = Vec::with_capacity(length);
        packet.extend_from_slice(header.as_bytes());
        push_addr(&mut packet, &self.start_addr);
        push_addr(&mut packet, &self.end_addr);
        packet
    }
}

impl TsPayload {
    /// Convert a [TsPayload] into a network-level vector of bytes; a
    /// security label counts as one more selector on the wire
    pub fn try_build(&self, next_payload: PayloadType) -> Result<Vec<u8>, GeneratorError> {
        let num_ts = self.selectors.len() + usize::from(self.label.is_some());
        if num_ts > 255 {
            return Err(GeneratorError::TooManySelectors);
        }

        let mut entries = vec![];
        for selector in &self.selectors {
            entries.extend(selector.build());
        }
        if let Some(label) = &self.label {
            let header = TsLabelHeader {
                ts_type: TsType::SecLabel as u8,
                reserved: 0,
                selector_length: U16::from((size_of::<TsLabelHeader>() + label.len()) as u16),
            };
            entries.extend_from_slice(header.as_bytes());
            entries.extend_from_slice(label);
        }

        let length =
            size_of::<GenericPayloadHeader>() + size_of::<TsPayloadHeader>() + entries.len();
        let generic_header = GenericPayloadHeader {
            next_payload: next_payload as u8,
            reserved: 0,
            payload_length: U16::from(length as u16),
        };
        let ts_header = TsPayloadHeader {
            num_ts: num_ts as u8,
            reserved: [0; 3],
        };
        let mut packet = Vec::with_capacity(length);
        packet.extend_from_slice(generic_header.as_bytes());
        packet.extend_from_slice(ts_header.as_bytes());
        packet.extend(entries);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::net::Ipv4Addr;

    use crate::definitions::params::PayloadType;
    use crate::definitions::TrafficSelector;
    use crate::definitions::TsPayload;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn subnet_selector() {
        let payload = TsPayload {
            selectors: vec![TrafficSelector::from_subnet(
                IpAddr::V4(Ipv4Addr::new(10, 1, 0, 0)),
                16,
                0,
                0,
                65535,
            )],
            label: None,
        };
        assert_eq!(
            payload.try_build(PayloadType::NoNextPayload).unwrap(),
            vec![
                0x00, 0x00, 0x00, 0x18, // Generic payload header
                0x01, 0x00, 0x00, 0x00, // TS payload header
                0x07, 0x00, 0x00, 0x10, // TS entry header
                0x00, 0x00, 0xff, 0xff, // port range
                0x0a, 0x01, 0x00, 0x00, // start address
                0x0a, 0x01, 0xff, 0xff, // end address
            ]
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn label_counts_as_selector() {
        let payload = TsPayload {
            selectors: vec![],
            label: Some(b"system_u".to_vec()),
        };
        assert_eq!(
            payload.try_build(PayloadType::NoNextPayload).unwrap(),
            vec![
                0x00, 0x00, 0x00, 0x14, // Generic payload header
                0x01, 0x00, 0x00, 0x00, // TS payload header
                0x0a, 0x00, 0x00, 0x0c, // TS_SECLABEL entry header
                b's', b'y', b's', b't', b'e', b'm', b'_', b'u',
            ]
        );
    }
}
