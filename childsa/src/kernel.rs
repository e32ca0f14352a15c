//! Interface to the kernel IPsec backend plus an in-memory implementation

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use ikewire::definitions::params::IpcompTransform;
use ikewire::definitions::params::SecurityProtocol;
use ikewire::definitions::TrafficSelector;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::config::Mode;
use crate::host::Host;
use crate::label::SecurityLabel;

/// Feature bit: the backend supports ESPv3 TFC padding
pub const FEATURE_ESP_V3_TFC: u32 = 0x01;

/// A packet mark/mask pair applied to SAs and policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mark {
    /// Mark value
    pub value: u32,
    /// Bits of the value that are significant
    pub mask: u32,
}

/// Failure reported by the kernel backend
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum KernelError {
    #[error("No such reqid is allocated")]
    UnknownReqid,
    #[error("The backend rejected the SA")]
    SaRejected,
    #[error("The backend rejected the policies")]
    PolicyRejected,
}

/// Everything the backend needs to install one SA of the pair
#[derive(Debug, Clone)]
pub struct SaParams<'a> {
    /// Protocol of the SA
    pub protocol: SecurityProtocol,
    /// SPI identifying the SA
    pub spi: u32,
    /// CPI when IPComp is negotiated, zero otherwise
    pub cpi: u16,
    /// IPComp transform when negotiated
    pub ipcomp: Option<IpcompTransform>,
    /// Source address of the protected traffic
    pub src: Host,
    /// Destination address of the protected traffic
    pub dst: Host,
    /// Encryption key
    pub encr: &'a [u8],
    /// Integrity key
    pub integ: &'a [u8],
    /// IPsec mode
    pub mode: Mode,
    /// UDP-encapsulate the SA (NAT traversal)
    pub encap: bool,
    /// Use extended sequence numbers
    pub esn: bool,
    /// Reqid grouping the SA pair under its policies
    pub reqid: u32,
    /// Packet mark of the SA
    pub mark: Mark,
    /// Interface ID of the SA
    pub if_id: u32,
    /// Whether this is the inbound SA of the pair
    pub inbound: bool,
    /// Announce ESPv3 TFC padding support on the SA
    pub tfc_v3: bool,
}

/// Everything the backend needs to install the flow policies
#[derive(Debug, Clone)]
pub struct PolicyParams<'a> {
    /// Reqid the policies refer to
    pub reqid: u32,
    /// Local traffic selectors
    pub my_ts: &'a [TrafficSelector],
    /// Remote traffic selectors
    pub other_ts: &'a [TrafficSelector],
    /// IPsec mode
    pub mode: Mode,
    /// Inbound packet mark
    pub mark_in: Mark,
    /// Outbound packet mark
    pub mark_out: Mark,
    /// Inbound interface ID
    pub if_id_in: u32,
    /// Outbound interface ID
    pub if_id_out: u32,
    /// Security label restricting the policies
    pub label: Option<&'a SecurityLabel>,
}

/// The kernel IPsec backend as seen by the negotiation engine
///
/// All calls are bounded, synchronous operations; SPI, CPI and reqid come
/// from process-wide allocators behind this interface.
pub trait Kernel: Send + Sync {
    /// Feature bitset of the backend
    fn features(&self) -> u32;
    /// Allocate an SPI for the protocol, zero on failure
    fn alloc_spi(&self, protocol: SecurityProtocol) -> u32;
    /// Allocate a CPI, zero on failure
    fn alloc_cpi(&self) -> u16;
    /// Reference the reqid (allocating a new one if zero is passed) and
    /// return it
    fn ref_reqid(&self, reqid: u32) -> Result<u32, KernelError>;
    /// Drop one reference of the reqid
    fn release_reqid(&self, reqid: u32) -> Result<(), KernelError>;
    /// Install one SA
    fn install_sa(&self, sa: &SaParams) -> Result<(), KernelError>;
    /// Pre-register the outbound SA without activating it (used while the
    /// replaced SA of a rekey is still in place)
    fn register_outbound(&self, sa: &SaParams) -> Result<(), KernelError>;
    /// Install the flow policies
    fn install_policies(&self, policies: &PolicyParams) -> Result<(), KernelError>;
}

/// A record of one SA handed to the [MemoryKernel]
#[derive(Debug, Clone)]
pub struct InstalledSa {
    /// Protocol of the SA
    pub protocol: SecurityProtocol,
    /// SPI of the SA
    pub spi: u32,
    /// CPI of the SA
    pub cpi: u16,
    /// Whether it is the inbound SA
    pub inbound: bool,
    /// Whether it was only registered, not activated
    pub registered: bool,
    /// IPsec mode
    pub mode: Mode,
    /// Encryption key as installed
    pub encr: Vec<u8>,
    /// Integrity key as installed
    pub integ: Vec<u8>,
    /// UDP encapsulation flag
    pub encap: bool,
}

/// In-memory backend with atomic allocators, for tests and simulation
pub struct MemoryKernel {
    features: u32,
    next_spi: AtomicU32,
    next_cpi: AtomicU16,
    next_reqid: AtomicU32,
    reqids: Mutex<HashMap<u32, u32>>,
    fail_sa_installs: AtomicBool,
    fail_policy_installs: AtomicBool,
    /// Every SA passed to [Kernel::install_sa] or [Kernel::register_outbound]
    pub sas: Mutex<Vec<InstalledSa>>,
    /// Reqids of every policy set passed to [Kernel::install_policies]
    pub policies: Mutex<Vec<u32>>,
}

impl MemoryKernel {
    /// A backend with the given feature bitset
    pub fn new(features: u32) -> Self {
        Self {
            features,
            next_spi: AtomicU32::new(0xc0000001),
            next_cpi: AtomicU16::new(0x4000),
            next_reqid: AtomicU32::new(1),
            reqids: Mutex::new(HashMap::new()),
            fail_sa_installs: AtomicBool::new(false),
            fail_policy_installs: AtomicBool::new(false),
            sas: Mutex::new(vec![]),
            policies: Mutex::new(vec![]),
        }
    }

    /// Make subsequent SA installs fail
    pub fn fail_sa_installs(&self, fail: bool) {
        self.fail_sa_installs.store(fail, Ordering::Relaxed);
    }

    /// Make subsequent policy installs fail
    pub fn fail_policy_installs(&self, fail: bool) {
        self.fail_policy_installs.store(fail, Ordering::Relaxed);
    }

    /// Reference count of a reqid, zero if unknown
    pub fn reqid_refs(&self, reqid: u32) -> u32 {
        self.reqids
            .lock()
            .map(|map| map.get(&reqid).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn record(&self, sa: &SaParams, registered: bool) {
        if let Ok(mut sas) = self.sas.lock() {
            sas.push(InstalledSa {
                protocol: sa.protocol,
                spi: sa.spi,
                cpi: sa.cpi,
                inbound: sa.inbound,
                registered,
                mode: sa.mode,
                encr: sa.encr.to_vec(),
                integ: sa.integ.to_vec(),
                encap: sa.encap,
            });
        }
    }
}

impl Default for MemoryKernel {
    fn default() -> Self {
        Self::new(FEATURE_ESP_V3_TFC)
    }
}

impl Kernel for MemoryKernel {
    fn features(&self) -> u32 {
        self.features
    }

    fn alloc_spi(&self, _protocol: SecurityProtocol) -> u32 {
        self.next_spi.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_cpi(&self) -> u16 {
        self.next_cpi.fetch_add(1, Ordering::Relaxed)
    }

    fn ref_reqid(&self, reqid: u32) -> Result<u32, KernelError> {
        let mut map = self.reqids.lock().map_err(|_| KernelError::UnknownReqid)?;
        let reqid = if reqid == 0 {
            self.next_reqid.fetch_add(1, Ordering::Relaxed)
        } else {
            reqid
        };
        *map.entry(reqid).or_insert(0) += 1;
        Ok(reqid)
    }

    fn release_reqid(&self, reqid: u32) -> Result<(), KernelError> {
        let mut map = self.reqids.lock().map_err(|_| KernelError::UnknownReqid)?;
        match map.get_mut(&reqid) {
            Some(refs) if *refs > 1 => {
                *refs -= 1;
                Ok(())
            }
            Some(_) => {
                map.remove(&reqid);
                Ok(())
            }
            None => Err(KernelError::UnknownReqid),
        }
    }

    fn install_sa(&self, sa: &SaParams) -> Result<(), KernelError> {
        if self.fail_sa_installs.load(Ordering::Relaxed) {
            return Err(KernelError::SaRejected);
        }
        self.record(sa, false);
        Ok(())
    }

    fn register_outbound(&self, sa: &SaParams) -> Result<(), KernelError> {
        if self.fail_sa_installs.load(Ordering::Relaxed) {
            return Err(KernelError::SaRejected);
        }
        self.record(sa, true);
        Ok(())
    }

    fn install_policies(&self, policies: &PolicyParams) -> Result<(), KernelError> {
        if self.fail_policy_installs.load(Ordering::Relaxed) {
            return Err(KernelError::PolicyRejected);
        }
        if let Ok(mut list) = self.policies.lock() {
            list.push(policies.reqid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reqids_are_reference_counted() {
        let kernel = MemoryKernel::default();
        let reqid = kernel.ref_reqid(0).unwrap();
        assert_eq!(kernel.ref_reqid(reqid).unwrap(), reqid);
        assert_eq!(kernel.reqid_refs(reqid), 2);
        kernel.release_reqid(reqid).unwrap();
        kernel.release_reqid(reqid).unwrap();
        assert_eq!(kernel.reqid_refs(reqid), 0);
        assert!(kernel.release_reqid(reqid).is_err());
    }

    #[test]
    fn spis_are_unique() {
        let kernel = MemoryKernel::default();
        let a = kernel.alloc_spi(SecurityProtocol::EncapsulatingSecurityPayload);
        let b = kernel.alloc_spi(SecurityProtocol::EncapsulatingSecurityPayload);
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }
}
