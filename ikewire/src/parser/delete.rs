use zerocopy::FromBytes;

use crate::definitions::header::DeleteHeader;
use crate::definitions::params::SecurityProtocol;
use crate::definitions::Delete;
use crate::parser::ParserError;

impl Delete {
    /// Parses a buffer into a [Delete]. The buffer must not contain the
    /// generic payload header.
    pub(crate) fn try_parse(buf: &[u8]) -> Result<Self, ParserError> {
        let header = DeleteHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
        let protocol = SecurityProtocol::try_from(header.protocol_id)?;
        if header.spi_size != 4 {
            return Err(ParserError::ProtocolViolation);
        }
        let count = header.num_spis.get() as usize;
        let body = &buf[size_of::<DeleteHeader>()..];
        if body.len() != count * 4 {
            return Err(ParserError::InvalidLength);
        }
        let mut spis = Vec::with_capacity(count);
        for chunk in body.chunks_exact(4) {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(chunk);
            spis.push(u32::from_be_bytes(raw));
        }
        Ok(Self { protocol, spis })
    }
}
