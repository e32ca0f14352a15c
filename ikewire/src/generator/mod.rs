//! Implementations for the associated `build` functions of the IKEv2 payload
//! types that convert high-level Rust structs into network-encoded byte arrays

mod attribute;
mod delete;
mod key_exchange;
mod notification;
mod payload;
mod proposal;
mod security_association;
mod traffic_selector;
mod transform;

pub use self::payload::build_payloads;

use thiserror::Error;

/// Rough per-proposal size estimate used to preallocate buffers
pub(crate) const ESTIMATED_PROPOSAL_LENGTH: usize = 48;
/// Rough per-payload size estimate used to preallocate buffers
pub(crate) const ESTIMATED_PAYLOAD_LENGTH: usize = 40;

/// Failure while encoding a payload into its network-level byte representation
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum GeneratorError {
    #[error("A Security Association can hold at most 255 proposals")]
    TooManyProposals,
    #[error("A Proposal can hold at most 255 transforms")]
    TooManyTransforms,
    #[error("A traffic selector payload can hold at most 255 selectors")]
    TooManySelectors,
    #[error("Nonce length must be between 16 and 256 octets")]
    InvalidNonceLength,
}
