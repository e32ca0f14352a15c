use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use log::warn;
use zerocopy::FromBytes;

use crate::definitions::header::TsEntryHeader;
use crate::definitions::header::TsLabelHeader;
use crate::definitions::header::TsPayloadHeader;
use crate::definitions::params::TsType;
use crate::definitions::TrafficSelector;
use crate::definitions::TsPayload;
use crate::parser::ParserError;

impl TsPayload {
    /// Parses a buffer into a [TsPayload]. The buffer must not contain the
    /// generic payload header. At most one security label substructure is
    /// accepted per payload.
    pub(crate) fn try_parse(buf: &[u8]) -> Result<Self, ParserError> {
        let header = TsPayloadHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
        let num_ts = header.num_ts as usize;
        let mut payload = TsPayload::default();
        let mut offset = size_of::<TsPayloadHeader>();
        for _ in 0..num_ts {
            // both substructure layouts carry their length at the same spot
            let common =
                TsLabelHeader::ref_from_prefix(&buf[offset..]).ok_or(ParserError::BufferTooSmall)?;
            let length = common.selector_length.get() as usize;
            if length < size_of::<TsLabelHeader>() || offset + length > buf.len() {
                return Err(ParserError::InvalidLength);
            }
            let entry = &buf[offset..offset + length];
            match TsType::try_from(common.ts_type) {
                Ok(TsType::Ipv4AddrRange) => {
                    payload.selectors.push(parse_addr_range(entry, false)?);
                }
                Ok(TsType::Ipv6AddrRange) => {
                    payload.selectors.push(parse_addr_range(entry, true)?);
                }
                Ok(TsType::SecLabel) => {
                    if payload.label.is_some() {
                        return Err(ParserError::ProtocolViolation);
                    }
                    let label = entry[size_of::<TsLabelHeader>()..].to_vec();
                    if label.is_empty() {
                        return Err(ParserError::ProtocolViolation);
                    }
                    payload.label = Some(label);
                }
                Err(region) => {
                    warn!(
                        "Skipping traffic selector of unrecognized type {} ({region:?})",
                        common.ts_type
                    );
                }
            }
            offset += length;
        }
        Ok(payload)
    }
}

fn parse_addr_range(entry: &[u8], v6: bool) -> Result<TrafficSelector, ParserError> {
    let header = TsEntryHeader::ref_from_prefix(entry).ok_or(ParserError::BufferTooSmall)?;
    let addr_len = if v6 { 16 } else { 4 };
    if entry.len() != size_of::<TsEntryHeader>() + 2 * addr_len {
        return Err(ParserError::InvalidLength);
    }
    let addrs = &entry[size_of::<TsEntryHeader>()..];
    let (start_addr, end_addr) = if v6 {
        let mut start = [0u8; 16];
        let mut end = [0u8; 16];
        start.copy_from_slice(&addrs[..16]);
        end.copy_from_slice(&addrs[16..]);
        (
            IpAddr::V6(Ipv6Addr::from(start)),
            IpAddr::V6(Ipv6Addr::from(end)),
        )
    } else {
        let mut start = [0u8; 4];
        let mut end = [0u8; 4];
        start.copy_from_slice(&addrs[..4]);
        end.copy_from_slice(&addrs[4..]);
        (
            IpAddr::V4(Ipv4Addr::from(start)),
            IpAddr::V4(Ipv4Addr::from(end)),
        )
    };
    Ok(TrafficSelector {
        ts_type: if v6 {
            TsType::Ipv6AddrRange
        } else {
            TsType::Ipv4AddrRange
        },
        protocol: header.ip_protocol_id,
        start_port: header.start_port.get(),
        end_port: header.end_port.get(),
        start_addr,
        end_addr,
    })
}
