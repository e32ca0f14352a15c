use zerocopy::FromBytes;

use crate::definitions::header::KeyExchangeHeader;
use crate::definitions::params::KeyExchangeMethod;
use crate::definitions::KeyExchangePayload;
use crate::parser::ParserError;

impl KeyExchangePayload {
    /// Parses a buffer into a [KeyExchangePayload]. The buffer must not
    /// contain the generic payload header.
    pub(crate) fn try_parse(buf: &[u8]) -> Result<Self, ParserError> {
        let header =
            KeyExchangeHeader::ref_from_prefix(buf).ok_or(ParserError::BufferTooSmall)?;
        let method = KeyExchangeMethod::try_from(header.ke_method.get())?;
        Ok(Self {
            method,
            data: buf[size_of::<KeyExchangeHeader>()..].to_vec(),
        })
    }
}
