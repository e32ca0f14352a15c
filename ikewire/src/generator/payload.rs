use zerocopy::network_endian::U16;
use zerocopy::AsBytes;

use crate::definitions::header::GenericPayloadHeader;
use crate::definitions::params::PayloadType;
use crate::definitions::Payload;
use crate::generator::GeneratorError;
use crate::generator::ESTIMATED_PAYLOAD_LENGTH;

impl Payload {
    pub(crate) fn try_build(&self, next_payload: PayloadType) -> Result<Vec<u8>, GeneratorError> {
        if let Payload::Nonce(v) = self {
            if v.len() < 16 || v.len() > 256 {
                return Err(GeneratorError::InvalidNonceLength);
            }
        }
        match self {
            Payload::SecurityAssociation(v) => v.try_build(next_payload),
            Payload::KeyExchange(v) => Ok(v.build(next_payload)),
            Payload::Notify(v) => Ok(v.build(next_payload)),
            Payload::Delete(v) => Ok(v.build(next_payload)),
            Payload::TrafficSelectorInitiator(v) | Payload::TrafficSelectorResponder(v) => {
                v.try_build(next_payload)
            }
            Payload::Nonce(v) => Ok(build_generic(next_payload, v)),
        }
    }
}

#[inline]
fn build_generic(next_payload: PayloadType, data: &[u8]) -> Vec<u8> {
    let header = GenericPayloadHeader {
        next_payload: next_payload as u8,
        reserved: 0,
        payload_length: U16::from(data.len() as u16 + 4),
    };
    let mut packet = Vec::with_capacity(data.len() + 4);
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(data);
    packet
}

/// Encode a payload chain into a byte buffer
///
/// Each payload's header names the type of the following payload; the
/// returned [PayloadType] is the type of the first payload, to be placed
/// in the message header by the caller owning the framing.
pub fn build_payloads(payloads: &[Payload]) -> Result<(PayloadType, Vec<u8>), GeneratorError> {
    let first = payloads
        .first()
        .map(Payload::payload_type)
        .unwrap_or(PayloadType::NoNextPayload);
    let mut buf = Vec::with_capacity(ESTIMATED_PAYLOAD_LENGTH * payloads.len());
    for (i, payload) in payloads.iter().enumerate() {
        let next = payloads
            .get(i + 1)
            .map(Payload::payload_type)
            .unwrap_or(PayloadType::NoNextPayload);
        buf.extend(payload.try_build(next)?);
    }
    Ok((first, buf))
}
