//! The parent IKE_SA as the CHILD_SA tasks see it
//!
//! A task never owns the IKE_SA; it receives a borrow for the duration of
//! one build or process round.

use std::net::IpAddr;
use std::sync::Arc;

use ikewire::definitions::TrafficSelector;

use crate::bus::EventBus;
use crate::child_sa::ChildSa;
use crate::config::ChildConfig;
use crate::config::ChildlessPolicy;
use crate::config::Settings;
use crate::host::Host;
use crate::kernel::Kernel;
use crate::keyexchange::CryptoProvider;
use crate::keymat::ChildKeymat;
use crate::sched::Scheduler;
use crate::selector::compose_ts;
use crate::selector::narrow;

/// Peer extension: the peer identified itself as strongSwan, enabling
/// proprietary extensions like BEET mode
pub const EXT_STRONGSWAN: u32 = 0x01;
/// Peer extension: the peer supports childless IKE_SA initiation (RFC 6023)
pub const EXT_CHILDLESS: u32 = 0x02;

/// The services a negotiation needs from the daemon
pub struct Services {
    /// Kernel IPsec backend
    pub kernel: Arc<dyn Kernel>,
    /// Daemon-wide event bus
    pub bus: Arc<dyn EventBus>,
    /// Delayed job scheduler
    pub sched: Arc<dyn Scheduler>,
    /// Key exchange backend
    pub crypto: Arc<dyn CryptoProvider>,
    /// CHILD_SA key derivation, seeded from this IKE_SA's SK_d
    pub keymat: Box<dyn ChildKeymat>,
    /// Deployment settings
    pub settings: Arc<Settings>,
}

/// The parent security association and its service handles
pub struct IkeSa {
    /// Process-unique ID of the IKE_SA
    pub unique_id: u32,
    /// Our IKE endpoint
    pub my_host: Host,
    /// The peer's IKE endpoint
    pub other_host: Host,
    /// A NAT was detected in front of us
    pub nat_here: bool,
    /// A NAT was detected in front of the peer
    pub nat_there: bool,
    /// Virtual IPs are requested for this IKE_SA (they may not be
    /// assigned yet)
    pub vip_requested: bool,
    /// Childless policy of the IKE configuration
    pub childless: ChildlessPolicy,
    /// Default interface IDs (inbound, outbound) for new CHILD_SAs
    pub if_ids: (u32, u32),
    /// Virtual IPs assigned to us
    pub my_vips: Vec<IpAddr>,
    /// Virtual IPs assigned to the peer
    pub other_vips: Vec<IpAddr>,
    /// Child configurations the peer may negotiate (responder side)
    pub peer_configs: Vec<Arc<ChildConfig>>,
    /// Service handles
    pub services: Services,
    extensions: u32,
    children: Vec<ChildSa>,
}

impl IkeSa {
    /// Set up the IKE_SA view with its endpoints and services
    pub fn new(unique_id: u32, my_host: Host, other_host: Host, services: Services) -> Self {
        Self {
            unique_id,
            my_host,
            other_host,
            nat_here: false,
            nat_there: false,
            vip_requested: false,
            childless: ChildlessPolicy::Never,
            if_ids: (0, 0),
            my_vips: vec![],
            other_vips: vec![],
            peer_configs: vec![],
            services,
            extensions: 0,
            children: vec![],
        }
    }

    /// Record that the peer announced an extension
    pub fn enable_extension(&mut self, extension: u32) {
        self.extensions |= extension;
    }

    /// Whether the peer announced the extension
    pub fn supports(&self, extension: u32) -> bool {
        self.extensions & extension == extension
    }

    /// Whether any NAT condition is present on this IKE_SA
    pub fn nat_any(&self) -> bool {
        self.nat_here || self.nat_there
    }

    /// The dynamic addresses of one side: the virtual IPs when assigned,
    /// the IKE endpoint otherwise
    pub fn dynamic_hosts(&self, local: bool) -> Vec<IpAddr> {
        let (vips, host) = if local {
            (&self.my_vips, &self.my_host)
        } else {
            (&self.other_vips, &self.other_host)
        };
        if vips.is_empty() {
            vec![host.addr]
        } else {
            vips.clone()
        }
    }

    /// Register an established CHILD_SA, taking ownership from the task
    pub fn add_child(&mut self, child: ChildSa) {
        self.children.push(child);
    }

    /// The registered CHILD_SAs
    pub fn children(&self) -> &[ChildSa] {
        &self.children
    }

    /// Pick the child configuration matching the received selectors, hosts
    /// and labels best: the first one whose templates leave something of
    /// both received lists
    pub fn select_child_config(
        &self,
        received_tsi: &[TrafficSelector],
        received_tsr: &[TrafficSelector],
        label_hint: Option<&[u8]>,
    ) -> Option<Arc<ChildConfig>> {
        self.peer_configs
            .iter()
            .find(|config| {
                if config.has_generic_label_only() && label_hint.is_none() {
                    return false;
                }
                let local = compose_ts(&config.local_ts, &self.dynamic_hosts(true), false);
                let remote = compose_ts(&config.remote_ts, &self.dynamic_hosts(false), false);
                !narrow(received_tsr, &local).is_empty()
                    && !narrow(received_tsi, &remote).is_empty()
            })
            .cloned()
    }
}
