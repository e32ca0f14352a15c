use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::GenericPayloadHeader;
use crate::definitions::header::KeyExchangeHeader;
use crate::definitions::params::PayloadType;
use crate::definitions::KeyExchangePayload;

impl KeyExchangePayload {
    /// Convert a [KeyExchangePayload] into a network-level vector of bytes
    pub fn build(&self, next_payload: PayloadType) -> Vec<u8> {
        let length = size_of::<GenericPayloadHeader>() + size_of::<KeyExchangeHeader>() + self.data.len();
        let generic_header = GenericPayloadHeader {
            next_payload: next_payload as u8,
            reserved: 0,
            payload_length: U16::from(length as u16),
        };
        let key_exchange_header = KeyExchangeHeader {
            ke_method: U16::from(self.method as u16),
            reserved: U16::from(0),
        };
        let mut packet = Vec::with_capacity(length);
        packet.extend_from_slice(generic_header.as_bytes());
        packet.extend_from_slice(key_exchange_header.as_bytes());
        packet.extend_from_slice(&self.data);
        packet
    }
}
