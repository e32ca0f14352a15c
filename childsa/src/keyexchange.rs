//! Ephemeral key exchange sessions and the per-negotiation execution plan

use ikewire::definitions::params::KeyExchangeMethod;
use ikewire::definitions::params::TransformType;
use ikewire::definitions::Proposal;
use thiserror::Error;

/// Upper bound of additional key exchanges a negotiation may carry
pub const MAX_ADDITIONAL_KEY_EXCHANGES: usize = 7;
/// Upper bound of key exchanges per negotiation, primary included
pub const MAX_KEY_EXCHANGES: usize = MAX_ADDITIONAL_KEY_EXCHANGES + 1;

/// Failure inside a key exchange session
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum KeError {
    #[error("The peer's public value is not valid for this method")]
    InvalidPublicValue,
    #[error("No peer public value has been applied yet")]
    Incomplete,
}

/// One ephemeral key exchange: holds a local secret, accepts the peer's
/// public value and yields a shared secret
pub trait KeyExchangeSession: Send {
    /// The method this session executes
    fn method(&self) -> KeyExchangeMethod;
    /// Our public value to put on the wire
    fn public_key(&self) -> Vec<u8>;
    /// Apply the public value received from the peer
    fn set_public_key(&mut self, value: &[u8]) -> Result<(), KeError>;
    /// The shared secret, available once both sides contributed
    fn shared_secret(&self) -> Result<Vec<u8>, KeError>;
}

/// Factory for key exchange sessions, implemented by the crypto backend
pub trait CryptoProvider: Send + Sync {
    /// Instantiate a session for the method, `None` if unsupported locally
    fn create_ke(&self, method: KeyExchangeMethod) -> Option<Box<dyn KeyExchangeSession>>;
}

/// Malformed key exchange plan in a selected proposal
#[derive(Debug, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PlanError {
    #[error("Additional key exchanges require a primary key exchange method")]
    MissingPrimary,
    #[error("Additional key exchange slots must form a gapless prefix")]
    NonContiguous,
}

/// One slot of the execution plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeSlot {
    /// Transform type the method was negotiated under
    pub transform: TransformType,
    /// The method to execute
    pub method: KeyExchangeMethod,
    /// Whether the exchange has completed
    pub done: bool,
}

/// The ordered list of key exchanges a negotiation has to run: the primary
/// method first, then the additional methods in slot order. Each method is
/// executed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KePlan {
    slots: Vec<KeSlot>,
}

impl KePlan {
    /// Derive the plan from a selected proposal, where every transform
    /// group holds at most one method
    ///
    /// A proposal without any primary key exchange method yields an empty
    /// plan (no PFS), unless additional methods are present, which is
    /// malformed. The additional slots must be densely packed starting at
    /// slot 1. KE_NONE entries are skipped; they mean the slot negotiated
    /// to nothing.
    pub fn from_proposal(proposal: &Proposal) -> Result<Self, PlanError> {
        let primary = proposal.first_ke_method();
        let mut additional = vec![];
        let mut gap = false;
        for group in &proposal.additional_key_exchanges {
            match group.first() {
                None => gap = true,
                Some(method) => {
                    if gap {
                        return Err(PlanError::NonContiguous);
                    }
                    additional.push(*method);
                }
            }
        }
        if !additional.is_empty() && !matches!(primary, Some(m) if m != KeyExchangeMethod::None) {
            return Err(PlanError::MissingPrimary);
        }

        let mut slots = Vec::with_capacity(MAX_KEY_EXCHANGES);
        if let Some(method) = primary {
            if method != KeyExchangeMethod::None {
                slots.push(KeSlot {
                    transform: TransformType::KeyExchangeMethod,
                    method,
                    done: false,
                });
            }
        }
        for (transform, method) in TransformType::additional().zip(additional) {
            if method != KeyExchangeMethod::None {
                slots.push(KeSlot {
                    transform,
                    method,
                    done: false,
                });
            }
        }
        Ok(Self { slots })
    }

    /// The next slot still to be executed
    pub fn pending(&self) -> Option<&KeSlot> {
        self.slots.iter().find(|slot| !slot.done)
    }

    /// Mark the next pending slot as completed
    pub fn complete(&mut self) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| !slot.done) {
            slot.done = true;
        }
    }

    /// Number of exchanges still to be executed
    pub fn remaining(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.done).count()
    }

    /// Whether the plan contains no exchanges at all (no PFS)
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All slots in execution order
    pub fn slots(&self) -> &[KeSlot] {
        &self.slots
    }
}

/// Deterministic, non-cryptographic sessions for tests and simulation
///
/// The "public value" is the local secret itself; the shared secret is the
/// byte-wise XOR of both sides' values, which both peers compute equally.
/// Do not use outside of tests.
pub mod stub {
    use rand::RngCore;

    use super::CryptoProvider;
    use super::KeError;
    use super::KeyExchangeMethod;
    use super::KeyExchangeSession;

    /// A stub session; see the module docs
    pub struct StubSession {
        method: KeyExchangeMethod,
        local: Vec<u8>,
        peer: Option<Vec<u8>>,
    }

    impl StubSession {
        /// Create a session with a random local value
        pub fn new(method: KeyExchangeMethod) -> Self {
            let mut local = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut local);
            Self {
                method,
                local,
                peer: None,
            }
        }
    }

    impl KeyExchangeSession for StubSession {
        fn method(&self) -> KeyExchangeMethod {
            self.method
        }

        fn public_key(&self) -> Vec<u8> {
            self.local.clone()
        }

        fn set_public_key(&mut self, value: &[u8]) -> Result<(), KeError> {
            if value.len() != self.local.len() {
                return Err(KeError::InvalidPublicValue);
            }
            self.peer = Some(value.to_vec());
            Ok(())
        }

        fn shared_secret(&self) -> Result<Vec<u8>, KeError> {
            let peer = self.peer.as_ref().ok_or(KeError::Incomplete)?;
            Ok(self
                .local
                .iter()
                .zip(peer)
                .map(|(a, b)| a ^ b)
                .collect())
        }
    }

    /// Provider handing out [StubSession]s for every method except the
    /// ones listed as unsupported
    #[derive(Default)]
    pub struct StubProvider {
        /// Methods the provider pretends not to support
        pub unsupported: Vec<KeyExchangeMethod>,
    }

    impl CryptoProvider for StubProvider {
        fn create_ke(&self, method: KeyExchangeMethod) -> Option<Box<dyn KeyExchangeSession>> {
            if self.unsupported.contains(&method) {
                return None;
            }
            Some(Box::new(StubSession::new(method)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikewire::definitions::params::SecurityProtocol;
    use ikewire::definitions::Transform;

    fn proposal(primary: Option<KeyExchangeMethod>, additional: &[(u8, KeyExchangeMethod)]) -> Proposal {
        let mut p = Proposal::new_empty(SecurityProtocol::EncapsulatingSecurityPayload, None);
        if let Some(m) = primary {
            p.add(vec![Transform::KeyExchange(m)]);
        }
        p.add(
            additional
                .iter()
                .map(|(slot, m)| Transform::AdditionalKeyExchange(*slot, *m))
                .collect(),
        );
        p
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn plan_orders_slots() {
        let p = proposal(
            Some(KeyExchangeMethod::Curve25519),
            &[(1, KeyExchangeMethod::MlKem768), (2, KeyExchangeMethod::EcP256)],
        );
        let mut plan = KePlan::from_proposal(&p).unwrap();
        assert_eq!(plan.remaining(), 3);
        assert_eq!(plan.pending().unwrap().method, KeyExchangeMethod::Curve25519);
        plan.complete();
        assert_eq!(plan.pending().unwrap().method, KeyExchangeMethod::MlKem768);
        plan.complete();
        assert_eq!(plan.pending().unwrap().method, KeyExchangeMethod::EcP256);
        plan.complete();
        assert!(plan.pending().is_none());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn plan_without_pfs_is_empty() {
        assert!(KePlan::from_proposal(&proposal(None, &[])).unwrap().is_empty());
        assert!(KePlan::from_proposal(&proposal(Some(KeyExchangeMethod::None), &[]))
            .unwrap()
            .is_empty());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn additional_without_primary_is_rejected() {
        let p = proposal(None, &[(1, KeyExchangeMethod::MlKem768)]);
        assert_eq!(KePlan::from_proposal(&p), Err(PlanError::MissingPrimary));
        let p = proposal(
            Some(KeyExchangeMethod::None),
            &[(1, KeyExchangeMethod::MlKem768)],
        );
        assert_eq!(KePlan::from_proposal(&p), Err(PlanError::MissingPrimary));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn gaps_are_rejected() {
        let p = proposal(
            Some(KeyExchangeMethod::Curve25519),
            &[(1, KeyExchangeMethod::MlKem768), (3, KeyExchangeMethod::EcP256)],
        );
        assert_eq!(KePlan::from_proposal(&p), Err(PlanError::NonContiguous));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn stub_sessions_agree() {
        use super::stub::StubSession;
        let mut a = StubSession::new(KeyExchangeMethod::Curve25519);
        let mut b = StubSession::new(KeyExchangeMethod::Curve25519);
        a.set_public_key(&b.public_key()).unwrap();
        b.set_public_key(&a.public_key()).unwrap();
        assert_eq!(a.shared_secret().unwrap(), b.shared_secret().unwrap());
    }
}
