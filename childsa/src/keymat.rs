//! Key material derivation for CHILD_SAs

use ikewire::definitions::Proposal;
use thiserror::Error;
use zeroize::Zeroize;
use zeroize::ZeroizeOnDrop;

use crate::keyexchange::KeError;
use crate::keyexchange::KeyExchangeSession;

/// Failure while deriving CHILD_SA key material
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum KeymatError {
    #[error("A key exchange session has no shared secret yet: {0}")]
    MissingSecret(#[from] KeError),
}

/// The four keying chunks of a CHILD_SA pair, wiped when dropped
#[derive(ZeroizeOnDrop)]
pub struct ChildKeys {
    /// Encryption key for traffic sent by the initiator
    pub encr_i: Vec<u8>,
    /// Integrity key for traffic sent by the initiator
    pub integ_i: Vec<u8>,
    /// Encryption key for traffic sent by the responder
    pub encr_r: Vec<u8>,
    /// Integrity key for traffic sent by the responder
    pub integ_r: Vec<u8>,
}

/// Derives CHILD_SA keys from the negotiated secrets; owned by the IKE_SA,
/// since the derivation is seeded from its SK_d
pub trait ChildKeymat: Send {
    /// Derive the keying chunks from the selected proposal, the completed
    /// key exchange sessions in slot order, and the two nonces. The
    /// argument order (initiator nonce first) is invariant across roles.
    fn derive_child_keys(
        &self,
        proposal: &Proposal,
        sessions: &[Box<dyn KeyExchangeSession>],
        nonce_i: &[u8],
        nonce_r: &[u8],
    ) -> Result<ChildKeys, KeymatError>;
}

/// A structure-preserving keymat without real cryptography: the shared
/// secrets are concatenated in session order with both nonces and folded
/// into the four chunks with distinct tags. Both peers derive identical
/// keys, and any reordering of sessions or nonces changes them. Do not use
/// outside of tests.
pub struct StubKeymat;

impl StubKeymat {
    fn fold(seed: &[u8], tag: u8) -> Vec<u8> {
        let mut out = vec![tag; 32];
        for (i, byte) in seed.iter().enumerate() {
            out[i % 32] = out[i % 32].wrapping_add(*byte).rotate_left(3);
        }
        out
    }
}

impl ChildKeymat for StubKeymat {
    fn derive_child_keys(
        &self,
        _proposal: &Proposal,
        sessions: &[Box<dyn KeyExchangeSession>],
        nonce_i: &[u8],
        nonce_r: &[u8],
    ) -> Result<ChildKeys, KeymatError> {
        let mut seed = vec![];
        for session in sessions {
            seed.extend(session.shared_secret()?);
        }
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);
        let keys = ChildKeys {
            encr_i: Self::fold(&seed, 1),
            integ_i: Self::fold(&seed, 2),
            encr_r: Self::fold(&seed, 3),
            integ_r: Self::fold(&seed, 4),
        };
        seed.zeroize();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikewire::definitions::params::SecurityProtocol;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn derivation_depends_on_nonce_order() {
        let proposal = Proposal::new_empty(SecurityProtocol::EncapsulatingSecurityPayload, None);
        let keymat = StubKeymat;
        let a = keymat
            .derive_child_keys(&proposal, &[], b"nonce-one-nonce-", b"nonce-two-nonce-")
            .unwrap();
        let b = keymat
            .derive_child_keys(&proposal, &[], b"nonce-two-nonce-", b"nonce-one-nonce-")
            .unwrap();
        assert_ne!(a.encr_i, b.encr_i);
    }
}
