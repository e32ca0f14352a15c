//! Immutable policy records a CHILD_SA is negotiated from

use std::fmt;
use std::time::Duration;

use ikewire::definitions::params::KeyExchangeMethod;
use ikewire::definitions::Proposal;
use ikewire::definitions::TrafficSelector;
use serde::Deserialize;
use serde::Serialize;

use crate::label::LabelMode;
use crate::label::SecurityLabel;

/// IPsec mode of the negotiated SAs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Full IP-in-IP encapsulation
    #[default]
    Tunnel,
    /// Protection of the payload only, between the IKE endpoints
    Transport,
    /// Bound end-to-end tunnel, host-to-host with tunnel encapsulation
    Beet,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Tunnel => write!(f, "TUNNEL"),
            Mode::Transport => write!(f, "TRANSPORT"),
            Mode::Beet => write!(f, "BEET"),
        }
    }
}

/// Whether the IKE_SA may or must come up without a CHILD_SA in IKE_AUTH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChildlessPolicy {
    /// Always piggyback the first CHILD_SA onto IKE_AUTH
    #[default]
    Never,
    /// Accept a childless peer but piggyback when initiating
    Allow,
    /// Initiate childless if the peer supports it, creating the CHILD_SA
    /// in a separate CREATE_CHILD_SA exchange
    Prefer,
    /// Require childless initiation, failing the IKE_SA against peers
    /// that don't support it
    Force,
}

/// Immutable configuration a single CHILD_SA is negotiated from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildConfig {
    /// Name of the configuration, for logging and lookups
    pub name: String,
    /// Proposals offered or matched against, in preference order, with
    /// their key exchange transforms included
    pub proposals: Vec<Proposal>,
    /// Requested IPsec mode
    pub mode: Mode,
    /// Traffic selector templates for the local side; an empty list means
    /// the dynamic IKE endpoint (or the virtual IPs once assigned)
    pub local_ts: Vec<TrafficSelector>,
    /// Traffic selector templates for the remote side; an empty list means
    /// the remote IKE endpoint
    pub remote_ts: Vec<TrafficSelector>,
    /// Propose IPComp compression for this CHILD_SA
    pub ipcomp: bool,
    /// Accept TRANSPORT mode selectors not matching the IKE endpoints
    /// (proxy mode)
    pub proxy_mode: bool,
    /// Tear the CHILD_SA down after this much inactivity
    pub inactivity: Option<Duration>,
    /// Static reqid to install the SAs under, zero to allocate dynamically
    pub reqid: u32,
    /// Security label for the CHILD_SA, interpreted per `label_mode`
    pub label: Option<SecurityLabel>,
    /// How the configured label is applied
    pub label_mode: LabelMode,
}

impl ChildConfig {
    /// A minimal configuration with the given name and proposals
    pub fn new(name: impl Into<String>, proposals: Vec<Proposal>) -> Self {
        Self {
            name: name.into(),
            proposals,
            mode: Mode::Tunnel,
            local_ts: vec![],
            remote_ts: vec![],
            ipcomp: false,
            proxy_mode: false,
            inactivity: None,
            reqid: 0,
            label: None,
            label_mode: LabelMode::Simple,
        }
    }

    /// The configured proposals, with the key exchange transform groups
    /// stripped when the exchange cannot carry a KE payload
    pub fn proposals(&self, with_ke: bool) -> Vec<Proposal> {
        let mut proposals = self.proposals.clone();
        if !with_ke {
            for proposal in &mut proposals {
                proposal.key_exchange_methods.clear();
                for group in &mut proposal.additional_key_exchanges {
                    group.clear();
                }
            }
        }
        proposals
    }

    /// The preferred primary key exchange method, taken from the most
    /// preferred proposal offering one
    pub fn preferred_ke_method(&self) -> Option<KeyExchangeMethod> {
        self.proposals.iter().find_map(Proposal::first_ke_method)
    }

    /// Whether this configuration only knows a generic SELinux context, so
    /// that CHILD_SAs must wait for acquire-specific labels
    pub fn has_generic_label_only(&self) -> bool {
        self.label_mode == LabelMode::Selinux && self.label.is_some()
    }
}

/// Tunables read from the deployment's settings backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Accept proposals containing private-use algorithm IDs even from
    /// peers not known to interpret them the same way
    pub accept_private_algs: bool,
    /// Prefer the configured proposal order over the peer-supplied one
    pub prefer_configured_proposals: bool,
    /// Tear down the IKE_SA when the first CHILD_SA of IKE_AUTH fails
    pub close_ike_on_child_failure: bool,
    /// Also close the IKE_SA when an inactivity timeout hits its last
    /// CHILD_SA
    pub inactivity_close_ike: bool,
    /// Base delay before retrying after TEMPORARY_FAILURE, in seconds
    pub retry_interval: u64,
    /// Random subtrahend applied to the retry delay, in seconds
    pub retry_jitter: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            accept_private_algs: false,
            prefer_configured_proposals: true,
            close_ike_on_child_failure: false,
            inactivity_close_ike: false,
            retry_interval: 15,
            retry_jitter: 10,
        }
    }
}
