use zerocopy::FromBytes;

use crate::definitions::header::ProposalHeader;
use crate::definitions::Proposal;
use crate::definitions::SecurityAssociation;
use crate::parser::ParserError;

impl SecurityAssociation {
    /// Parses a buffer into a [SecurityAssociation]. The buffer must not
    /// contain the generic payload header.
    pub(crate) fn try_parse(buf: &[u8]) -> Result<Self, ParserError> {
        let mut proposals = vec![];
        let mut offset = 0;
        while offset < buf.len() {
            let header =
                ProposalHeader::ref_from_prefix(&buf[offset..]).ok_or(ParserError::BufferTooSmall)?;
            let length = header.proposal_length.get() as usize;
            if length < size_of::<ProposalHeader>() || offset + length > buf.len() {
                return Err(ParserError::InvalidLength);
            }
            if proposals.is_empty() && header.proposal_num != 1 {
                return Err(ParserError::InvalidProposalNumberingStart);
            }
            if header.proposal_num as usize != proposals.len() + 1 {
                return Err(ParserError::InvalidProposalNumbering);
            }
            proposals.push(Proposal::try_parse(&buf[offset..offset + length])?);
            let last = header.last_substruct == 0;
            offset += length;
            if last {
                break;
            }
        }
        Ok(Self { proposals })
    }
}
