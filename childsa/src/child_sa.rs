//! The CHILD_SA object: SPIs, selectors and lifecycle, plus the install
//! primitives towards the kernel backend

use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ikewire::definitions::params::IpcompTransform;
use ikewire::definitions::params::SecurityProtocol;
use ikewire::definitions::params::SequenceNumbers;
use ikewire::definitions::Proposal;
use ikewire::definitions::TrafficSelector;
use tracing::debug;

use crate::config::ChildConfig;
use crate::config::Mode;
use crate::host::Host;
use crate::kernel::Kernel;
use crate::kernel::KernelError;
use crate::kernel::Mark;
use crate::kernel::PolicyParams;
use crate::kernel::SaParams;
use crate::label::SecurityLabel;

static NEXT_CHILD_SA_ID: AtomicU32 = AtomicU32::new(1);

/// Lifecycle state of a CHILD_SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSaState {
    /// Object exists, nothing negotiated yet
    Created,
    /// Keys derived, SAs being handed to the kernel
    Installing,
    /// SA pair and policies are in place
    Installed,
    /// Negotiation is being retried with another key exchange method
    Retrying,
    /// SA pair is being torn down
    Deleting,
}

impl fmt::Display for ChildSaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildSaState::Created => write!(f, "CREATED"),
            ChildSaState::Installing => write!(f, "INSTALLING"),
            ChildSaState::Installed => write!(f, "INSTALLED"),
            ChildSaState::Retrying => write!(f, "RETRYING"),
            ChildSaState::Deleting => write!(f, "DELETING"),
        }
    }
}

/// State of the outbound half of the SA pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSaOutbound {
    /// Not touched yet
    None,
    /// Pre-registered in the kernel, not activated (rekey in progress)
    Registered,
    /// Fully installed
    Installed,
}

/// One IPsec SA pair under construction or in use
pub struct ChildSa {
    unique_id: u32,
    config: Arc<ChildConfig>,
    kernel: Arc<dyn Kernel>,
    state: ChildSaState,
    outbound: ChildSaOutbound,
    protocol: SecurityProtocol,
    my_spi: u32,
    other_spi: u32,
    my_cpi: u16,
    other_cpi: u16,
    ipcomp: Option<IpcompTransform>,
    mode: Mode,
    encap: bool,
    reqid: u32,
    reqid_allocated: bool,
    mark_in: Mark,
    mark_out: Mark,
    if_id_in: u32,
    if_id_out: u32,
    proposal: Option<Proposal>,
    my_ts: Vec<TrafficSelector>,
    other_ts: Vec<TrafficSelector>,
    label: Option<SecurityLabel>,
    my_host: Host,
    other_host: Host,
}

impl ChildSa {
    /// Allocate a fresh CHILD_SA for the given configuration
    pub fn new(
        config: Arc<ChildConfig>,
        kernel: Arc<dyn Kernel>,
        my_host: Host,
        other_host: Host,
    ) -> Self {
        Self {
            unique_id: NEXT_CHILD_SA_ID.fetch_add(1, Ordering::Relaxed),
            protocol: SecurityProtocol::EncapsulatingSecurityPayload,
            config,
            kernel,
            state: ChildSaState::Created,
            outbound: ChildSaOutbound::None,
            my_spi: 0,
            other_spi: 0,
            my_cpi: 0,
            other_cpi: 0,
            ipcomp: None,
            mode: Mode::Tunnel,
            encap: false,
            reqid: 0,
            reqid_allocated: false,
            mark_in: Mark::default(),
            mark_out: Mark::default(),
            if_id_in: 0,
            if_id_out: 0,
            proposal: None,
            my_ts: vec![],
            other_ts: vec![],
            label: None,
            my_host,
            other_host,
        }
    }

    /// Process-unique ID of this CHILD_SA
    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    /// Name of the configuration this CHILD_SA was created from
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration this CHILD_SA was created from
    pub fn config(&self) -> &Arc<ChildConfig> {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChildSaState {
        self.state
    }

    /// Move to another lifecycle state
    pub fn set_state(&mut self, state: ChildSaState) {
        debug!(child = self.unique_id, "{} -> {}", self.state, state);
        self.state = state;
    }

    /// State of the outbound half
    pub fn outbound_state(&self) -> ChildSaOutbound {
        self.outbound
    }

    /// Protocol of the SA pair
    pub fn protocol(&self) -> SecurityProtocol {
        self.protocol
    }

    /// Set the protocol of the SA pair
    pub fn set_protocol(&mut self, protocol: SecurityProtocol) {
        self.protocol = protocol;
    }

    /// Our inbound SPI
    pub fn my_spi(&self) -> u32 {
        self.my_spi
    }

    /// The peer's SPI
    pub fn other_spi(&self) -> u32 {
        self.other_spi
    }

    /// Record the peer's SPI
    pub fn set_other_spi(&mut self, spi: u32) {
        self.other_spi = spi;
    }

    /// Our inbound CPI
    pub fn my_cpi(&self) -> u16 {
        self.my_cpi
    }

    /// The peer's CPI
    pub fn other_cpi(&self) -> u16 {
        self.other_cpi
    }

    /// Record the peer's CPI
    pub fn set_other_cpi(&mut self, cpi: u16) {
        self.other_cpi = cpi;
    }

    /// Negotiated IPsec mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Set the negotiated IPsec mode
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Set the negotiated IPComp transform, `None` disables compression
    pub fn set_ipcomp(&mut self, ipcomp: Option<IpcompTransform>) {
        self.ipcomp = ipcomp;
        if ipcomp.is_none() {
            self.my_cpi = 0;
            self.other_cpi = 0;
        }
    }

    /// Negotiated IPComp transform
    pub fn ipcomp(&self) -> Option<IpcompTransform> {
        self.ipcomp
    }

    /// Set packet marks
    pub fn set_marks(&mut self, mark_in: Mark, mark_out: Mark) {
        self.mark_in = mark_in;
        self.mark_out = mark_out;
    }

    /// Packet marks (inbound, outbound)
    pub fn marks(&self) -> (Mark, Mark) {
        (self.mark_in, self.mark_out)
    }

    /// Set interface IDs
    pub fn set_if_ids(&mut self, if_id_in: u32, if_id_out: u32) {
        self.if_id_in = if_id_in;
        self.if_id_out = if_id_out;
    }

    /// Interface IDs (inbound, outbound)
    pub fn if_ids(&self) -> (u32, u32) {
        (self.if_id_in, self.if_id_out)
    }

    /// Set the security label
    pub fn set_label(&mut self, label: Option<SecurityLabel>) {
        self.label = label;
    }

    /// The security label
    pub fn label(&self) -> Option<&SecurityLabel> {
        self.label.as_ref()
    }

    /// Set the selected proposal
    pub fn set_proposal(&mut self, proposal: Proposal) {
        self.protocol = proposal.protocol;
        self.proposal = Some(proposal);
    }

    /// The selected proposal
    pub fn proposal(&self) -> Option<&Proposal> {
        self.proposal.as_ref()
    }

    /// Set the narrowed selector pair as the policies of this CHILD_SA
    pub fn set_policies(&mut self, my_ts: Vec<TrafficSelector>, other_ts: Vec<TrafficSelector>) {
        self.my_ts = my_ts;
        self.other_ts = other_ts;
    }

    /// Local traffic selectors
    pub fn my_ts(&self) -> &[TrafficSelector] {
        &self.my_ts
    }

    /// Remote traffic selectors
    pub fn other_ts(&self) -> &[TrafficSelector] {
        &self.other_ts
    }

    /// Update the endpoint addresses to the current IKE endpoints, which
    /// may have moved since the negotiation started
    pub fn update_hosts(&mut self, my_host: Host, other_host: Host, encap: bool) {
        self.my_host = my_host;
        self.other_host = other_host;
        self.encap = encap;
    }

    /// Allocate our inbound SPI from the kernel, zero on failure
    pub fn alloc_spi(&mut self) -> u32 {
        self.my_spi = self.kernel.alloc_spi(self.protocol);
        self.my_spi
    }

    /// Allocate our inbound CPI from the kernel, zero on failure
    pub fn alloc_cpi(&mut self) -> u16 {
        self.my_cpi = self.kernel.alloc_cpi();
        self.my_cpi
    }

    /// Reference the reqid this CHILD_SA installs under: the given one if
    /// non-zero, otherwise the configured one, otherwise a fresh dynamic
    /// reqid. Any previously held reqid is released first.
    pub fn acquire_reqid(&mut self, requested: u32) -> Result<u32, KernelError> {
        let wanted = if requested != 0 {
            requested
        } else {
            self.config.reqid
        };
        let reqid = self.kernel.ref_reqid(wanted)?;
        if self.reqid_allocated {
            let _ = self.kernel.release_reqid(self.reqid);
        }
        self.reqid = reqid;
        self.reqid_allocated = true;
        Ok(reqid)
    }

    /// The reqid this CHILD_SA installs under
    pub fn reqid(&self) -> u32 {
        self.reqid
    }

    fn sa_params<'a>(
        &'a self,
        encr: &'a [u8],
        integ: &'a [u8],
        spi: u32,
        cpi: u16,
        inbound: bool,
        tfc_v3: bool,
    ) -> SaParams<'a> {
        let esn = self
            .proposal
            .as_ref()
            .map(|p| p.sequence_numbers.contains(&SequenceNumbers::Extended))
            .unwrap_or(false);
        SaParams {
            protocol: self.protocol,
            spi,
            cpi,
            ipcomp: if cpi != 0 { self.ipcomp } else { None },
            src: if inbound { self.other_host } else { self.my_host },
            dst: if inbound { self.my_host } else { self.other_host },
            encr,
            integ,
            mode: self.mode,
            encap: self.encap,
            esn,
            reqid: self.reqid,
            mark: if inbound { self.mark_in } else { self.mark_out },
            if_id: if inbound { self.if_id_in } else { self.if_id_out },
            inbound,
            tfc_v3,
        }
    }

    /// Install one SA of the pair into the kernel
    pub fn install(
        &mut self,
        encr: &[u8],
        integ: &[u8],
        spi: u32,
        cpi: u16,
        inbound: bool,
        tfc_v3: bool,
    ) -> Result<(), KernelError> {
        let params = self.sa_params(encr, integ, spi, cpi, inbound, tfc_v3);
        self.kernel.install_sa(&params)?;
        if !inbound {
            self.outbound = ChildSaOutbound::Installed;
        }
        Ok(())
    }

    /// Pre-register the outbound SA without activating it; used while the
    /// SA this one replaces still carries traffic
    pub fn register_outbound(
        &mut self,
        encr: &[u8],
        integ: &[u8],
        spi: u32,
        cpi: u16,
        tfc_v3: bool,
    ) -> Result<(), KernelError> {
        let params = self.sa_params(encr, integ, spi, cpi, false, tfc_v3);
        self.kernel.register_outbound(&params)?;
        self.outbound = ChildSaOutbound::Registered;
        Ok(())
    }

    /// Install the flow policies for the narrowed selector pair
    pub fn install_policies(&self) -> Result<(), KernelError> {
        self.kernel.install_policies(&PolicyParams {
            reqid: self.reqid,
            my_ts: &self.my_ts,
            other_ts: &self.other_ts,
            mode: self.mode,
            mark_in: self.mark_in,
            mark_out: self.mark_out,
            if_id_in: self.if_id_in,
            if_id_out: self.if_id_out,
            label: self.label.as_ref(),
        })
    }
}

impl Drop for ChildSa {
    fn drop(&mut self) {
        if self.reqid_allocated {
            let _ = self.kernel.release_reqid(self.reqid);
        }
    }
}

impl fmt::Debug for ChildSa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSa")
            .field("unique_id", &self.unique_id)
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("my_spi", &self.my_spi)
            .field("other_spi", &self.other_spi)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::net::Ipv4Addr;

    use super::*;
    use crate::kernel::MemoryKernel;

    fn hosts() -> (Host, Host) {
        (
            Host::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 500),
            Host::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)), 500),
        )
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn reqid_is_released_exactly_once_on_drop() {
        let kernel = Arc::new(MemoryKernel::default());
        let config = Arc::new(ChildConfig::new("net", vec![]));
        let (me, other) = hosts();
        let reqid;
        {
            let mut child = ChildSa::new(config, kernel.clone(), me, other);
            reqid = child.acquire_reqid(0).unwrap();
            assert_eq!(kernel.reqid_refs(reqid), 1);
            // re-acquiring with an explicit reqid swaps the reference
            let swapped = child.acquire_reqid(reqid).unwrap();
            assert_eq!(swapped, reqid);
            assert_eq!(kernel.reqid_refs(reqid), 1);
        }
        assert_eq!(kernel.reqid_refs(reqid), 0);
    }

    #[test]
    fn unique_ids_differ() {
        let kernel = Arc::new(MemoryKernel::default());
        let config = Arc::new(ChildConfig::new("net", vec![]));
        let (me, other) = hosts();
        let a = ChildSa::new(config.clone(), kernel.clone(), me, other);
        let b = ChildSa::new(config, kernel, me, other);
        assert_ne!(a.unique_id(), b.unique_id());
    }
}
