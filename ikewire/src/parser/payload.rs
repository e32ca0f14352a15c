use log::warn;
use zerocopy::FromBytes;

use crate::definitions::header::GenericPayloadHeader;
use crate::definitions::params::PayloadType;
use crate::definitions::Delete;
use crate::definitions::KeyExchangePayload;
use crate::definitions::Notification;
use crate::definitions::Payload;
use crate::definitions::SecurityAssociation;
use crate::definitions::TsPayload;
use crate::parser::ParserError;

/// Parse a payload chain into the payloads it contains
///
/// The type of the first payload comes from the message header, which is
/// owned by the caller doing the framing. Payload types that cannot occur
/// in a CHILD_SA negotiation are skipped with a warning; the chain itself
/// is still followed through them.
pub fn parse_payloads(first: PayloadType, buf: &[u8]) -> Result<Vec<Payload>, ParserError> {
    let mut next = first as u8;
    let mut offset = 0;
    let mut payloads = vec![];
    while next != PayloadType::NoNextPayload as u8 {
        let header =
            GenericPayloadHeader::ref_from_prefix(&buf[offset..]).ok_or(ParserError::BufferTooSmall)?;
        let length = header.payload_length.get() as usize;
        if length < size_of::<GenericPayloadHeader>() || offset + length > buf.len() {
            return Err(ParserError::InvalidLength);
        }
        let body = &buf[offset + size_of::<GenericPayloadHeader>()..offset + length];
        match PayloadType::try_from(next) {
            Ok(PayloadType::SecurityAssociation) => payloads.push(Payload::SecurityAssociation(
                SecurityAssociation::try_parse(body)?,
            )),
            Ok(PayloadType::KeyExchange) => {
                payloads.push(Payload::KeyExchange(KeyExchangePayload::try_parse(body)?))
            }
            Ok(PayloadType::Nonce) => payloads.push(Payload::Nonce(body.to_vec())),
            Ok(PayloadType::Notify) => {
                payloads.push(Payload::Notify(Notification::try_parse(body)?))
            }
            Ok(PayloadType::Delete) => payloads.push(Payload::Delete(Delete::try_parse(body)?)),
            Ok(PayloadType::TrafficSelectorInitiator) => {
                payloads.push(Payload::TrafficSelectorInitiator(TsPayload::try_parse(body)?))
            }
            Ok(PayloadType::TrafficSelectorResponder) => {
                payloads.push(Payload::TrafficSelectorResponder(TsPayload::try_parse(body)?))
            }
            Ok(other) => {
                warn!("Ignoring payload type {other:#?} in CHILD_SA negotiation");
            }
            Err(region) => {
                warn!("Ignoring unknown payload type {next} ({region:?})");
            }
        }
        next = header.next_payload;
        offset += length;
    }
    if offset != buf.len() {
        warn!("Trailing bytes after the last payload of the chain");
    }
    Ok(payloads)
}
