//! Parser functionality to convert network-level bytes into payload structs
//!
//! Use [parse_payloads] as an entrypoint for a whole payload chain, or the
//! `try_parse` associated functions of the individual payload types.

mod delete;
mod key_exchange;
mod notification;
mod payload;
mod proposal;
mod security_association;
mod traffic_selector;

pub use self::payload::parse_payloads;

use thiserror::Error;

use crate::definitions::UnparseableParameter;

/// Failure while parsing a payload from network-level byte representation
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ParserError {
    #[error("Buffer too small to parse the payload")]
    BufferTooSmall,
    #[error("Parameter could not be parsed: {0:#?}")]
    UnparseableParameter(UnparseableParameter),
    #[error("Proposal numbering doesn't start at 1")]
    InvalidProposalNumberingStart,
    #[error("Proposal numbering doesn't increment by 1")]
    InvalidProposalNumbering,
    #[error("Length field contradicts the structure it describes")]
    InvalidLength,
    #[error("Payload violates a protocol rule")]
    ProtocolViolation,
}

impl From<UnparseableParameter> for ParserError {
    fn from(value: UnparseableParameter) -> Self {
        Self::UnparseableParameter(value)
    }
}
