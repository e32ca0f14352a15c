//! The CHILD_SA creation task
//!
//! One instance drives one CHILD_SA negotiation through its exchanges:
//! nonce piggyback on IKE_SA_INIT, the substantive round inside IKE_AUTH
//! or CREATE_CHILD_SA, and any number of IKE_FOLLOWUP_KE rounds for
//! hybrid key exchanges. The initiator variant is created with a child
//! configuration; the responder variant selects one from the received
//! selectors.

use std::sync::Arc;
use std::time::Duration;

use ikewire::definitions::params::ExchangeType;
use ikewire::definitions::params::IpcompTransform;
use ikewire::definitions::params::KeyExchangeMethod;
use ikewire::definitions::params::NotifyError;
use ikewire::definitions::params::NotifyStatus;
use ikewire::definitions::params::SecurityProtocol;
use ikewire::definitions::params::TransformType;
use ikewire::definitions::Delete;
use ikewire::definitions::KeyExchangePayload;
use ikewire::definitions::Notification;
use ikewire::definitions::NotifyType;
use ikewire::definitions::Payload;
use ikewire::definitions::Proposal;
use ikewire::definitions::SecurityAssociation;
use ikewire::definitions::TrafficSelector;
use ikewire::definitions::TsPayload;
use rand::RngCore;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::bus::Alert;
use crate::bus::NarrowPhase;
use crate::child_sa::ChildSa;
use crate::child_sa::ChildSaState;
use crate::config::ChildConfig;
use crate::config::ChildlessPolicy;
use crate::config::Mode;
use crate::host::Host;
use crate::ikesa::IkeSa;
use crate::ikesa::EXT_CHILDLESS;
use crate::ikesa::EXT_STRONGSWAN;
use crate::kernel::Kernel;
use crate::kernel::Mark;
use crate::kernel::FEATURE_ESP_V3_TFC;
use crate::keyexchange::KePlan;
use crate::keyexchange::KeyExchangeSession;
use crate::label::select_label;
use crate::label::SecurityLabel;
use crate::sched::Job;
use crate::selector::accept_beet;
use crate::selector::accept_transport;
use crate::selector::compose_ts;
use crate::selector::narrow;
use crate::selector::substitute_host;
use crate::tasks::Message;
use crate::tasks::Task;
use crate::tasks::TaskStatus;

use ikewire::definitions::SELECT_PREFER_SUPPLIED;
use ikewire::definitions::SELECT_SKIP_KE;
use ikewire::definitions::SELECT_SKIP_PRIVATE;

/// Nonce size used for CHILD_SA negotiations
const NONCE_SIZE: usize = 32;

/// Delay before deleting the IKE_SA after a failed first CHILD_SA, long
/// enough to let the outbound IKE_AUTH response drain
const IKE_DELETE_DELAY: Duration = Duration::from_millis(100);

/// The error notifies that abandon the CHILD_SA but keep the IKE_SA
const CHILD_SCOPED_ERRORS: [NotifyError; 7] = [
    NotifyError::NoProposalChosen,
    NotifyError::SinglePairRequired,
    NotifyError::NoAdditionalSas,
    NotifyError::InternalAddressFailure,
    NotifyError::FailedCpRequired,
    NotifyError::TsUnacceptable,
    NotifyError::InvalidSelectors,
];

/// The CHILD_SA creation task; see the module docs
pub struct ChildCreate {
    initiator: bool,
    config: Option<Arc<ChildConfig>>,
    kernel: Arc<dyn Kernel>,
    rekey: bool,
    packet_ts: Option<(TrafficSelector, TrafficSelector)>,

    my_nonce: Vec<u8>,
    other_nonce: Vec<u8>,
    proposals: Vec<Proposal>,
    selected: Option<Proposal>,
    mode: Mode,

    ipcomp_proposed: bool,
    ipcomp_received: Option<(u16, u8)>,
    my_cpi: u16,
    other_cpi: u16,

    ke_method: KeyExchangeMethod,
    ke: Option<Box<dyn KeyExchangeSession>>,
    plan: KePlan,
    completed: Vec<Box<dyn KeyExchangeSession>>,
    link_token: Option<Vec<u8>>,
    retried: bool,
    deferred: bool,

    my_ts: Vec<TrafficSelector>,
    other_ts: Vec<TrafficSelector>,

    child: Option<ChildSa>,
    other_spi: u32,
    reqid: u32,
    reqid_allocated: bool,
    marks: (Mark, Mark),
    if_ids: (u32, u32),
    if_ids_set: bool,
    label: Option<SecurityLabel>,
    established: bool,
    aborted: bool,
    tfc_v3: bool,

    // responder state collected between process and build
    received_sa: Vec<Proposal>,
    received_ke: Option<KeyExchangePayload>,
    received_tsi: Option<TsPayload>,
    received_tsr: Option<TsPayload>,
    transport_requested: bool,
    beet_requested: bool,
    followup_error: Option<NotifyError>,
}

impl ChildCreate {
    fn new(initiator: bool, config: Option<Arc<ChildConfig>>, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            initiator,
            config,
            kernel,
            rekey: false,
            packet_ts: None,
            my_nonce: vec![],
            other_nonce: vec![],
            proposals: vec![],
            selected: None,
            mode: Mode::Tunnel,
            ipcomp_proposed: false,
            ipcomp_received: None,
            my_cpi: 0,
            other_cpi: 0,
            ke_method: KeyExchangeMethod::None,
            ke: None,
            plan: KePlan::default(),
            completed: vec![],
            link_token: None,
            retried: false,
            deferred: false,
            my_ts: vec![],
            other_ts: vec![],
            child: None,
            other_spi: 0,
            reqid: 0,
            reqid_allocated: false,
            marks: (Mark::default(), Mark::default()),
            if_ids: (0, 0),
            if_ids_set: false,
            label: None,
            established: false,
            aborted: false,
            tfc_v3: true,
            received_sa: vec![],
            received_ke: None,
            received_tsi: None,
            received_tsr: None,
            transport_requested: false,
            beet_requested: false,
            followup_error: None,
        }
    }

    /// A task initiating a CHILD_SA from the given configuration
    pub fn initiator(config: Arc<ChildConfig>, kernel: Arc<dyn Kernel>) -> Self {
        Self::new(true, Some(config), kernel)
    }

    /// A task answering a peer-initiated CHILD_SA; the configuration is
    /// selected from the received selectors
    pub fn responder(kernel: Arc<dyn Kernel>) -> Self {
        Self::new(false, None, kernel)
    }

    /// Restrict the offer to the traffic selectors of the packet that
    /// triggered this negotiation (they are prepended to the TS lists)
    pub fn use_packet_ts(&mut self, local: TrafficSelector, remote: TrafficSelector) {
        self.packet_ts = Some((local, remote));
    }

    /// Mark this negotiation as the create half of a rekeying; suppresses
    /// duplicate checks, wildcard selectors, delayed retries, and defers
    /// activation of the outbound SA
    pub fn use_rekey(&mut self) {
        self.rekey = true;
    }

    /// Reserve the given reqid for the CHILD_SA. A reqid of zero drops any
    /// previous reservation; a failing reservation is silently ignored.
    pub fn use_reqid(&mut self, reqid: u32) {
        if self.reqid_allocated {
            let _ = self.kernel.release_reqid(self.reqid);
            self.reqid = 0;
            self.reqid_allocated = false;
        }
        if reqid == 0 {
            return;
        }
        match self.kernel.ref_reqid(reqid) {
            Ok(reqid) => {
                self.reqid = reqid;
                self.reqid_allocated = true;
            }
            Err(_) => debug!("Unable to reserve reqid {reqid}, ignoring the request"),
        }
    }

    /// Override the default packet marks
    pub fn use_marks(&mut self, mark_in: Mark, mark_out: Mark) {
        self.marks = (mark_in, mark_out);
    }

    /// Override the interface IDs; the IKE_SA's IDs are the defaults
    pub fn use_if_ids(&mut self, if_id_in: u32, if_id_out: u32) {
        self.if_ids = (if_id_in, if_id_out);
        self.if_ids_set = if_id_in != 0 || if_id_out != 0;
    }

    /// Bind the CHILD_SA to a security label, replacing any previous one
    pub fn use_label(&mut self, label: &SecurityLabel) {
        self.label = Some(label.clone());
    }

    /// Force the primary key exchange method, used to retry after
    /// INVALID_KE_PAYLOAD
    pub fn use_ke_method(&mut self, method: KeyExchangeMethod) {
        self.ke_method = method;
    }

    /// Install the child configuration (responder path after selection)
    pub fn set_config(&mut self, config: Arc<ChildConfig>) {
        self.config = Some(config);
    }

    /// Cooperatively cancel the task; observed on the next round, where a
    /// DELETE is sent for any SPI already allocated
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// The CHILD_SA under construction, if already allocated
    pub fn get_child(&self) -> Option<&ChildSa> {
        self.child.as_ref()
    }

    /// The peer's SPI, once negotiated
    pub fn get_other_spi(&self) -> u32 {
        self.other_spi
    }

    /// Whether the negotiated CHILD_SA was established and handed over
    pub fn established(&self) -> bool {
        self.established
    }

    /// The lexicographically smaller of the two nonces, compared over the
    /// byte prefix both have; ties go to our own nonce
    pub fn get_lower_nonce(&self) -> &[u8] {
        let len = self.my_nonce.len().min(self.other_nonce.len());
        if self.my_nonce[..len] <= self.other_nonce[..len] {
            &self.my_nonce
        } else {
            &self.other_nonce
        }
    }

    fn generate_nonce(&mut self) -> Result<(), ()> {
        let mut nonce = vec![0u8; NONCE_SIZE];
        rand::thread_rng()
            .try_fill_bytes(&mut nonce)
            .map_err(|_| ())?;
        self.my_nonce = nonce;
        Ok(())
    }

    fn select_flags(&self, ike: &IkeSa, no_ke: bool) -> u8 {
        let mut flags = 0;
        if no_ke {
            flags |= SELECT_SKIP_KE;
        }
        if !ike.supports(EXT_STRONGSWAN) && !ike.services.settings.accept_private_algs {
            flags |= SELECT_SKIP_PRIVATE;
        }
        if !ike.services.settings.prefer_configured_proposals {
            flags |= SELECT_PREFER_SUPPLIED;
        }
        flags
    }

    /// Record the notifies relevant to the CHILD_SA negotiation
    fn collect_notifies(&mut self, ike: &IkeSa, msg: &Message) {
        for notify in msg.notifies() {
            let NotifyType::Status(status) = notify.variant else {
                continue;
            };
            match status {
                NotifyStatus::UseTransportMode => self.transport_requested = true,
                NotifyStatus::UseBeetMode => {
                    if ike.supports(EXT_STRONGSWAN) {
                        self.beet_requested = true;
                    } else {
                        warn!("Ignoring USE_BEET_MODE of a peer not known to support it");
                    }
                }
                NotifyStatus::IpcompSupported => {
                    if notify.data.len() == 3 {
                        let cpi = u16::from_be_bytes([notify.data[0], notify.data[1]]);
                        self.ipcomp_received = Some((cpi, notify.data[2]));
                    } else {
                        warn!("Ignoring malformed IPCOMP_SUPPORTED notify");
                    }
                }
                NotifyStatus::EspTfcPaddingNotSupported => self.tfc_v3 = false,
                NotifyStatus::AdditionalKeyExchange => {
                    if self.initiator {
                        self.link_token = Some(notify.data.clone());
                    }
                }
                _ => {}
            }
        }
    }

    /// Assign our SPI to every proposal; with a fixed KE method, promote
    /// it in each proposal offering it and move the rest to the back.
    /// False if no proposal offers the method.
    fn update_and_check_proposals(&mut self, spi: u32) -> bool {
        for proposal in &mut self.proposals {
            proposal.set_spi(spi);
        }
        if self.ke_method == KeyExchangeMethod::None {
            return true;
        }
        let id = self.ke_method as u16;
        let (mut with, without): (Vec<Proposal>, Vec<Proposal>) = self
            .proposals
            .drain(..)
            .partition(|p| p.has_transform(TransformType::KeyExchangeMethod, id));
        if with.is_empty() {
            self.proposals = without;
            return false;
        }
        for proposal in &mut with {
            proposal.promote_transform(TransformType::KeyExchangeMethod, id);
        }
        with.extend(without);
        self.proposals = with;
        true
    }

    /// A CHILD_SA is a duplicate of an installed one with the same config,
    /// marks, interface IDs, labels, and either no static reqid on both
    /// sides or matching ones
    fn find_duplicate(&self, ike: &IkeSa, config: &ChildConfig) -> Option<u32> {
        let my_static = if self.reqid != 0 {
            self.reqid
        } else {
            config.reqid
        };
        ike.children()
            .iter()
            .find(|child| {
                child.state() == ChildSaState::Installed
                    && *child.config().as_ref() == *config
                    && child.marks() == self.marks
                    && child.if_ids() == self.if_ids
                    && child.label() == self.label.as_ref()
                    && ((my_static == 0 && child.config().reqid == 0)
                        || (my_static != 0 && my_static == child.reqid()))
            })
            .map(|child| child.unique_id())
    }

    /// Narrow the peer's selector pair against the configuration,
    /// substituting the IKE endpoints for NAT'ed transport negotiations
    fn narrow_ts_pair(
        &self,
        ike: &IkeSa,
        config: &ChildConfig,
        peer_my_side: &[TrafficSelector],
        peer_other_side: &[TrafficSelector],
        transport: bool,
    ) -> (Vec<TrafficSelector>, Vec<TrafficSelector>) {
        let substituted = |list: &[TrafficSelector], nat: bool, host: &Host| {
            if transport && nat {
                match substitute_host(list, host) {
                    Ok(rewritten) => return rewritten,
                    Err(err) => debug!("Not substituting NAT'ed selectors: {err}"),
                }
            }
            list.to_vec()
        };
        let my_input = substituted(peer_my_side, ike.nat_here, &ike.my_host);
        let other_input = substituted(peer_other_side, ike.nat_there, &ike.other_host);
        let local = compose_ts(&config.local_ts, &ike.dynamic_hosts(true), false);
        let remote = compose_ts(&config.remote_ts, &ike.dynamic_hosts(false), false);
        (narrow(&my_input, &local), narrow(&other_input, &remote))
    }

    /// Check the peer's claimed mode against the narrowed selectors
    fn verify_mode(&self, ike: &IkeSa, config: &ChildConfig, claimed: Mode) -> bool {
        match claimed {
            Mode::Tunnel => true,
            Mode::Transport => {
                config.mode == Mode::Transport
                    && accept_transport(
                        &self.my_ts,
                        &self.other_ts,
                        &ike.my_host,
                        &ike.other_host,
                        config.proxy_mode,
                    )
            }
            Mode::Beet => config.mode == Mode::Beet && accept_beet(&self.my_ts, &self.other_ts),
        }
    }

    /// Move the active key exchange into the completion list, in slot order
    fn complete_current_ke(&mut self) {
        if let Some(ke) = self.ke.take() {
            self.completed.push(ke);
            self.plan.complete();
        }
    }

    /// Abandon the CHILD_SA but keep the IKE_SA; for a failed first
    /// CHILD_SA of IKE_AUTH, the IKE_SA delete may be scheduled instead
    fn handle_child_failure(&mut self, ike: &mut IkeSa, msg: &Message, value: u16) -> TaskStatus {
        info!("Peer rejected the CHILD_SA with notify {value}, abandoning it");
        ike.services.bus.alert(Alert::PeerChildError(value));
        if msg.exchange == Some(ExchangeType::IkeAuth)
            && ike.services.settings.close_ike_on_child_failure
        {
            ike.services.sched.schedule(
                Job::DeleteIkeSa {
                    ike_id: ike.unique_id,
                },
                IKE_DELETE_DELAY,
            );
        }
        TaskStatus::Success
    }

    /// Queue a fresh, delayed child-create carrying over this task's
    /// identity-relevant settings
    fn schedule_retry(&self, ike: &IkeSa) {
        let Some(config) = &self.config else {
            return;
        };
        let settings = &ike.services.settings;
        let jitter = if settings.retry_jitter > 0 {
            use rand::Rng;
            rand::thread_rng().gen_range(0..settings.retry_jitter)
        } else {
            0
        };
        let delay = Duration::from_secs(settings.retry_interval.saturating_sub(jitter));
        info!(
            "Received TEMPORARY_FAILURE, retrying CHILD_SA {} in {}s",
            config.name,
            delay.as_secs()
        );
        ike.services.sched.schedule(
            Job::RetryChildCreate {
                config: config.clone(),
                reqid: self.reqid,
                marks: self.marks,
                if_ids: self.if_ids,
                label: self.label.clone(),
            },
            delay,
        );
    }

    /// React to INVALID_KE_PAYLOAD: retry once with the suggested method
    fn handle_invalid_ke(&mut self, ike: &mut IkeSa, msg: &Message, data: &[u8]) -> TaskStatus {
        if self.retried {
            warn!("Peer sent a second INVALID_KE_PAYLOAD, giving up on the CHILD_SA");
            return self.handle_child_failure(ike, msg, NotifyError::InvalidKePayload as u16);
        }
        if data.len() != 2 {
            warn!("Ignoring INVALID_KE_PAYLOAD with malformed data");
            return self.handle_child_failure(ike, msg, NotifyError::InvalidKePayload as u16);
        }
        let suggested = u16::from_be_bytes([data[0], data[1]]);
        let Ok(method) = KeyExchangeMethod::try_from(suggested) else {
            warn!("Peer requested an unknown key exchange method {suggested}");
            return self.handle_child_failure(ike, msg, NotifyError::InvalidKePayload as u16);
        };
        let offered = self
            .config
            .as_ref()
            .map(|c| {
                c.proposals
                    .iter()
                    .any(|p| p.has_transform(TransformType::KeyExchangeMethod, suggested))
            })
            .unwrap_or(false);
        if !offered {
            warn!("Peer requested {method}, which none of our proposals offers");
            return self.handle_child_failure(ike, msg, NotifyError::InvalidKePayload as u16);
        }
        info!(
            "Peer didn't accept key exchange method {}, retrying with {}",
            self.ke_method, method
        );
        self.retried = true;
        self.ke_method = method;
        if let Some(child) = &mut self.child {
            child.set_state(ChildSaState::Retrying);
        }
        self.reset_for_retry();
        TaskStatus::NeedMore
    }

    /// Forget the failed round, keeping config, reqid, marks, interface
    /// IDs, label and the forced KE method; the task re-enters the queue
    /// and starts over on the next build
    fn reset_for_retry(&mut self) {
        self.child = None;
        self.proposals.clear();
        self.selected = None;
        self.ke = None;
        self.plan = KePlan::default();
        self.completed.clear();
        self.my_nonce.clear();
        self.other_nonce.clear();
        self.my_ts.clear();
        self.other_ts.clear();
        self.ipcomp_proposed = false;
        self.ipcomp_received = None;
        self.my_cpi = 0;
        self.other_cpi = 0;
        self.other_spi = 0;
        self.link_token = None;
        self.transport_requested = false;
        self.beet_requested = false;
    }

    /// Suppress the outgoing message; used for local transient failures
    /// where the negotiation is abandoned without telling the peer
    fn suppress(&self, msg: &mut Message) -> TaskStatus {
        msg.exchange = None;
        TaskStatus::Success
    }

    /// Answer the request with a single error notify and conclude
    fn reply_error(&self, msg: &mut Message, error: NotifyError) -> TaskStatus {
        msg.add(Payload::Notify(Notification::error(error)));
        TaskStatus::Success
    }

    fn build_abort(&mut self, msg: &mut Message) -> TaskStatus {
        let spi = self.child.as_ref().map(ChildSa::my_spi).unwrap_or(0);
        if spi == 0 {
            return self.suppress(msg);
        }
        let protocol = self
            .child
            .as_ref()
            .map(ChildSa::protocol)
            .unwrap_or(SecurityProtocol::EncapsulatingSecurityPayload);
        msg.exchange = Some(ExchangeType::Informational);
        msg.add(Payload::Delete(Delete {
            protocol,
            spis: vec![spi],
        }));
        TaskStatus::Success
    }

    // ---- initiator ----

    fn build_i(&mut self, ike: &mut IkeSa, msg: &mut Message) -> TaskStatus {
        if self.aborted {
            return self.build_abort(msg);
        }
        match msg.exchange {
            Some(ExchangeType::IkeSaInit) => {
                if self.generate_nonce().is_err() {
                    return self.suppress(msg);
                }
                msg.add(Payload::Nonce(self.my_nonce.clone()));
                TaskStatus::NeedMore
            }
            Some(ExchangeType::IkeAuth) => {
                if ike.childless == ChildlessPolicy::Force && !ike.supports(EXT_CHILDLESS) {
                    warn!("Peer does not support childless initiation, but it is enforced");
                    return TaskStatus::DestroyMe;
                }
                let prefer_childless = matches!(
                    ike.childless,
                    ChildlessPolicy::Prefer | ChildlessPolicy::Force
                );
                let generic_selinux = self
                    .config
                    .as_ref()
                    .map(|c| c.has_generic_label_only() && self.label.is_none())
                    .unwrap_or(false);
                if (prefer_childless && ike.supports(EXT_CHILDLESS)) || generic_selinux {
                    debug!("Deferring CHILD_SA creation to a later CREATE_CHILD_SA");
                    self.deferred = true;
                    return TaskStatus::NeedMore;
                }
                self.build_offer(ike, msg, false)
            }
            Some(ExchangeType::CreateChildSa) => {
                if self.my_nonce.is_empty() && self.generate_nonce().is_err() {
                    return self.suppress(msg);
                }
                self.build_offer(ike, msg, true)
            }
            Some(ExchangeType::IkeFollowupKeyExchange) => self.build_i_followup(ike, msg),
            _ => TaskStatus::Failed,
        }
    }

    /// Compose the initiator's offer: SA, nonce, KE, TS pair and the
    /// notifies describing mode, compression and padding support
    fn build_offer(&mut self, ike: &mut IkeSa, msg: &mut Message, create_child: bool) -> TaskStatus {
        let Some(config) = self.config.clone() else {
            return self.suppress(msg);
        };

        let wildcard = ike.vip_requested && !self.rekey;
        let mut tsi = compose_ts(&config.local_ts, &ike.dynamic_hosts(true), wildcard);
        let mut tsr = compose_ts(&config.remote_ts, &ike.dynamic_hosts(false), false);
        if let Some((local, remote)) = &self.packet_ts {
            tsi.insert(0, local.clone());
            tsr.insert(0, remote.clone());
        }

        if self.label.is_none() && !config.has_generic_label_only() {
            self.label = config.label.clone();
        }

        self.proposals = config.proposals(create_child);
        if self.proposals.is_empty() {
            warn!("CHILD_SA configuration {} has no proposals", config.name);
            return self.suppress(msg);
        }

        self.mode = config.mode;
        if !self.if_ids_set {
            self.if_ids = ike.if_ids;
        }

        if create_child && !self.rekey {
            if config.has_generic_label_only() && self.label.is_none() {
                debug!("Not creating a CHILD_SA from a generic SELinux label");
                return self.suppress(msg);
            }
            if let Some(duplicate) = self.find_duplicate(ike, &config) {
                info!(
                    "Not establishing CHILD_SA {}, a duplicate of CHILD_SA #{duplicate}",
                    config.name
                );
                return self.suppress(msg);
            }
        }

        let mut child = ChildSa::new(
            config.clone(),
            self.kernel.clone(),
            ike.my_host,
            ike.other_host,
        );
        child.set_marks(self.marks.0, self.marks.1);
        child.set_if_ids(self.if_ids.0, self.if_ids.1);
        child.set_label(self.label.clone());
        child.update_hosts(ike.my_host, ike.other_host, ike.nat_any());
        if let Some(protocol) = self.proposals.first().map(|p| p.protocol) {
            child.set_protocol(protocol);
        }

        let my_spi = child.alloc_spi();
        if my_spi == 0 {
            warn!("Unable to allocate an SPI from the kernel");
            return self.suppress(msg);
        }

        if create_child {
            if self.ke_method == KeyExchangeMethod::None {
                self.ke_method = config
                    .preferred_ke_method()
                    .unwrap_or(KeyExchangeMethod::None);
            }
        } else {
            self.ke_method = KeyExchangeMethod::None;
        }

        if !self.update_and_check_proposals(my_spi) {
            warn!(
                "Key exchange method {} not contained in any of our proposals",
                self.ke_method
            );
            return self.suppress(msg);
        }

        if self.ke_method != KeyExchangeMethod::None {
            match ike.services.crypto.create_ke(self.ke_method) {
                Some(ke) => self.ke = Some(ke),
                None => {
                    warn!("Key exchange method {} not supported locally", self.ke_method);
                    return self.suppress(msg);
                }
            }
        }

        if config.ipcomp {
            let cpi = child.alloc_cpi();
            if cpi == 0 {
                warn!("IPComp requested, but the kernel failed to allocate a CPI");
            } else {
                self.ipcomp_proposed = true;
                self.my_cpi = cpi;
            }
        }
        self.child = Some(child);

        ike.services
            .bus
            .narrow(NarrowPhase::InitiatorPreAuth, &tsi, &tsr);

        msg.add(Payload::SecurityAssociation(SecurityAssociation {
            proposals: self.proposals.clone(),
        }));
        if create_child {
            msg.add(Payload::Nonce(self.my_nonce.clone()));
        }
        if let Some(ke) = &self.ke {
            msg.add(Payload::KeyExchange(KeyExchangePayload {
                method: ke.method(),
                data: ke.public_key(),
            }));
        }
        let label = self.label.as_ref().map(|l| l.as_bytes().to_vec());
        msg.add(Payload::TrafficSelectorInitiator(TsPayload {
            selectors: tsi.clone(),
            label: label.clone(),
        }));
        msg.add(Payload::TrafficSelectorResponder(TsPayload {
            selectors: tsr.clone(),
            label,
        }));
        match self.mode {
            Mode::Transport => msg.add(Payload::Notify(Notification::status(
                NotifyStatus::UseTransportMode,
            ))),
            Mode::Beet => msg.add(Payload::Notify(Notification::status(
                NotifyStatus::UseBeetMode,
            ))),
            Mode::Tunnel => {}
        }
        if self.ipcomp_proposed {
            msg.add(Payload::Notify(ipcomp_notify(self.my_cpi)));
        }
        if ike.services.kernel.features() & FEATURE_ESP_V3_TFC == 0 {
            msg.add(Payload::Notify(Notification::status(
                NotifyStatus::EspTfcPaddingNotSupported,
            )));
        }
        self.my_ts = tsi;
        self.other_ts = tsr;
        TaskStatus::NeedMore
    }

    fn process_i(&mut self, ike: &mut IkeSa, msg: &Message) -> TaskStatus {
        match msg.exchange {
            Some(ExchangeType::IkeSaInit) => {
                if let Some(nonce) = msg.nonce() {
                    self.other_nonce = nonce.clone();
                }
                TaskStatus::NeedMore
            }
            Some(ExchangeType::IkeAuth) | Some(ExchangeType::CreateChildSa) => {
                self.process_i_response(ike, msg)
            }
            Some(ExchangeType::IkeFollowupKeyExchange) => self.process_i_followup(ike, msg),
            _ => TaskStatus::Failed,
        }
    }

    fn process_i_response(&mut self, ike: &mut IkeSa, msg: &Message) -> TaskStatus {
        if self.deferred {
            self.deferred = false;
            return TaskStatus::NeedMore;
        }

        if msg.find_error(NotifyError::TemporaryFailure).is_some() {
            if !self.rekey && !self.aborted {
                self.schedule_retry(ike);
            }
            return TaskStatus::Success;
        }
        for notify in msg.notifies() {
            match &notify.variant {
                NotifyType::Error(NotifyError::InvalidKePayload) => {}
                NotifyType::Error(error) if CHILD_SCOPED_ERRORS.contains(error) => {
                    return self.handle_child_failure(ike, msg, *error as u16);
                }
                NotifyType::UnknownError(value) => {
                    return self.handle_child_failure(ike, msg, *value);
                }
                NotifyType::UnknownStatus(value) => {
                    debug!("Ignoring unknown status notify {value}");
                }
                _ => {}
            }
        }
        if let Some(notify) = msg.find_error(NotifyError::InvalidKePayload) {
            let data = notify.data.clone();
            return self.handle_invalid_ke(ike, msg, &data);
        }

        self.collect_notifies(ike, msg);

        let create_child = msg.exchange == Some(ExchangeType::CreateChildSa);
        if create_child {
            match msg.nonce() {
                Some(nonce) => self.other_nonce = nonce.clone(),
                None => {
                    warn!("Peer response misses the nonce payload");
                    return TaskStatus::Failed;
                }
            }
        }

        let Some(config) = self.config.clone() else {
            return TaskStatus::Failed;
        };
        let Some(sa) = msg.sa() else {
            warn!("Peer response misses the SA payload");
            return TaskStatus::Failed;
        };
        let flags = self.select_flags(ike, !create_child);
        let Some(mut selected) = sa.select(&self.proposals, flags) else {
            warn!("Peer selected a proposal we never offered");
            ike.services.bus.alert(Alert::ProposalMismatchChild);
            return TaskStatus::Failed;
        };
        let Some(other_spi) = selected.spi else {
            warn!("Peer proposal carries no SPI");
            return TaskStatus::Failed;
        };
        self.other_spi = other_spi;
        let my_spi = self.child.as_ref().map(ChildSa::my_spi).unwrap_or(0);
        selected.set_spi(my_spi);
        if let Some(child) = &mut self.child {
            child.set_other_spi(other_spi);
        }

        match (self.ipcomp_proposed, self.ipcomp_received) {
            (false, Some(_)) => {
                warn!("Peer accepted IPComp, but we never proposed it");
                return TaskStatus::Failed;
            }
            (true, Some((_, transform))) if transform != IpcompTransform::Deflate as u8 => {
                warn!("Peer selected IPComp transform {transform}, not DEFLATE");
                return TaskStatus::Failed;
            }
            (true, Some((cpi, _))) => {
                self.other_cpi = cpi;
            }
            (true, None) => {
                debug!("Peer did not accept IPComp, disabling it");
                self.ipcomp_proposed = false;
                self.my_cpi = 0;
            }
            (false, None) => {}
        }

        if selected.has_ke() {
            let expected = selected.first_ke_method().unwrap_or(KeyExchangeMethod::None);
            let Some(ke_payload) = msg.ke() else {
                warn!("Peer response misses the KE payload");
                return TaskStatus::Failed;
            };
            if ke_payload.method != expected {
                warn!(
                    "Peer used key exchange method {}, expected {expected}",
                    ke_payload.method
                );
                return TaskStatus::Failed;
            }
            match &mut self.ke {
                Some(ke) => {
                    if ke.set_public_key(&ke_payload.data).is_err() {
                        warn!("Applying the peer's public key failed");
                        return TaskStatus::Failed;
                    }
                }
                None => return TaskStatus::Failed,
            }
        } else {
            // the selected proposal has no KE; any received payload and any
            // earlier KE failure are irrelevant
            self.ke = None;
            self.ke_method = KeyExchangeMethod::None;
        }

        let plan = match KePlan::from_proposal(&selected) {
            Ok(plan) => plan,
            Err(err) => {
                warn!("Peer selected a malformed key exchange plan: {err}");
                return TaskStatus::Failed;
            }
        };

        let (Some(tsi), Some(tsr)) = (msg.tsi(), msg.tsr()) else {
            warn!("Peer response misses a TS payload");
            return TaskStatus::Failed;
        };
        match select_label(
            tsi.label.as_deref(),
            tsr.label.as_deref(),
            config.label.as_ref(),
        ) {
            Ok(selected_label) => {
                if let (Some(bound), Some(chosen)) = (&self.label, &selected_label) {
                    if bound != chosen {
                        warn!("Peer answered with a different security label");
                        ike.services.bus.alert(Alert::TsMismatchChild);
                        return TaskStatus::Failed;
                    }
                }
                if self.label.is_none() {
                    self.label = selected_label;
                }
            }
            Err(err) => {
                warn!("Security label selection failed: {err}");
                ike.services.bus.alert(Alert::TsMismatchChild);
                return TaskStatus::Failed;
            }
        }

        let (my_ts, other_ts) = self.narrow_ts_pair(
            ike,
            &config,
            &tsi.selectors,
            &tsr.selectors,
            self.transport_requested,
        );
        if my_ts.is_empty() || other_ts.is_empty() {
            warn!("The peer's narrowed selectors leave nothing acceptable");
            ike.services.bus.alert(Alert::TsMismatchChild);
            return TaskStatus::Failed;
        }
        self.my_ts = my_ts;
        self.other_ts = other_ts;
        ike.services
            .bus
            .narrow(NarrowPhase::InitiatorPostAuth, &self.my_ts, &self.other_ts);

        let claimed = if self.transport_requested {
            Mode::Transport
        } else if self.beet_requested {
            Mode::Beet
        } else {
            Mode::Tunnel
        };
        if !self.verify_mode(ike, &config, claimed) {
            warn!("Unable to verify the peer's claimed {claimed} mode");
            return TaskStatus::Failed;
        }
        self.mode = claimed;

        self.selected = Some(selected);
        self.plan = plan;
        self.complete_current_ke();

        if self.plan.remaining() > 0 {
            if self.link_token.is_none() {
                warn!("Peer requires more key exchanges but sent no link token");
                return TaskStatus::Failed;
            }
            return TaskStatus::NeedMore;
        }
        self.install_child(ike)
    }

    fn build_i_followup(&mut self, ike: &mut IkeSa, msg: &mut Message) -> TaskStatus {
        let Some(slot) = self.plan.pending() else {
            return TaskStatus::Failed;
        };
        let method = slot.method;
        if self.ke.is_none() {
            match ike.services.crypto.create_ke(method) {
                Some(ke) => self.ke = Some(ke),
                None => {
                    warn!("Key exchange method {method} not supported locally");
                    return TaskStatus::Failed;
                }
            }
        }
        let Some(token) = &self.link_token else {
            return TaskStatus::Failed;
        };
        msg.add(Payload::Notify(
            Notification::status(NotifyStatus::AdditionalKeyExchange).with_data(token.clone()),
        ));
        if let Some(ke) = &self.ke {
            msg.add(Payload::KeyExchange(KeyExchangePayload {
                method: ke.method(),
                data: ke.public_key(),
            }));
        }
        TaskStatus::NeedMore
    }

    fn process_i_followup(&mut self, ike: &mut IkeSa, msg: &Message) -> TaskStatus {
        for notify in msg.notifies() {
            match &notify.variant {
                NotifyType::Error(error) => {
                    warn!("Follow-up key exchange failed with {error}");
                    ike.services.bus.alert(Alert::PeerChildError(*error as u16));
                    return TaskStatus::Failed;
                }
                NotifyType::UnknownError(value) => {
                    ike.services.bus.alert(Alert::PeerChildError(*value));
                    return TaskStatus::Failed;
                }
                NotifyType::Status(NotifyStatus::AdditionalKeyExchange) => {
                    self.link_token = Some(notify.data.clone());
                }
                _ => {}
            }
        }
        let Some(slot) = self.plan.pending() else {
            return TaskStatus::Failed;
        };
        let Some(ke_payload) = msg.ke() else {
            warn!("Follow-up response misses the KE payload");
            return TaskStatus::Failed;
        };
        if ke_payload.method != slot.method {
            warn!(
                "Peer used key exchange method {}, expected {}",
                ke_payload.method, slot.method
            );
            return TaskStatus::Failed;
        }
        match &mut self.ke {
            Some(ke) => {
                if ke.set_public_key(&ke_payload.data).is_err() {
                    warn!("Applying the peer's public key failed");
                    return TaskStatus::Failed;
                }
            }
            None => return TaskStatus::Failed,
        }
        self.complete_current_ke();
        if self.plan.remaining() > 0 {
            return TaskStatus::NeedMore;
        }
        self.install_child(ike)
    }

    // ---- responder ----

    fn process_r(&mut self, ike: &mut IkeSa, msg: &Message) -> TaskStatus {
        match msg.exchange {
            Some(ExchangeType::IkeSaInit) => {
                if let Some(nonce) = msg.nonce() {
                    self.other_nonce = nonce.clone();
                }
                TaskStatus::NeedMore
            }
            Some(ExchangeType::IkeAuth) | Some(ExchangeType::CreateChildSa) => {
                self.process_request(ike, msg)
            }
            Some(ExchangeType::IkeFollowupKeyExchange) => self.process_r_followup(ike, msg),
            _ => TaskStatus::Failed,
        }
    }

    fn process_request(&mut self, ike: &mut IkeSa, msg: &Message) -> TaskStatus {
        self.received_sa = msg.sa().map(|sa| sa.proposals.clone()).unwrap_or_default();
        if msg.exchange == Some(ExchangeType::CreateChildSa) {
            if let Some(nonce) = msg.nonce() {
                self.other_nonce = nonce.clone();
            }
        }
        self.received_ke = msg.ke().cloned();
        self.received_tsi = msg.tsi().cloned();
        self.received_tsr = msg.tsr().cloned();
        self.collect_notifies(ike, msg);

        if self.config.is_none() {
            self.select_config(ike);
        }
        TaskStatus::NeedMore
    }

    /// Pick the child configuration for the received selectors, retrying
    /// with NAT-substituted selectors for transport mode
    fn select_config(&mut self, ike: &IkeSa) {
        let tsi: Vec<TrafficSelector> = self
            .received_tsi
            .as_ref()
            .map(|ts| ts.selectors.clone())
            .unwrap_or_default();
        let tsr: Vec<TrafficSelector> = self
            .received_tsr
            .as_ref()
            .map(|ts| ts.selectors.clone())
            .unwrap_or_default();
        let hint = self
            .received_tsi
            .as_ref()
            .and_then(|ts| ts.label.as_deref());

        if let Some(config) = ike.select_child_config(&tsi, &tsr, hint) {
            self.config = Some(config);
            return;
        }
        if self.transport_requested && ike.nat_any() {
            let tsi_sub = if ike.nat_there {
                substitute_host(&tsi, &ike.other_host).ok()
            } else {
                Some(tsi)
            };
            let tsr_sub = if ike.nat_here {
                substitute_host(&tsr, &ike.my_host).ok()
            } else {
                Some(tsr)
            };
            if let (Some(tsi_sub), Some(tsr_sub)) = (tsi_sub, tsr_sub) {
                if let Some(config) = ike.select_child_config(&tsi_sub, &tsr_sub, hint) {
                    if config.mode == Mode::Transport {
                        self.config = Some(config);
                    } else {
                        debug!(
                            "Rejecting config {} matched via NAT substitution, it is not transport mode",
                            config.name
                        );
                    }
                }
            }
        }
    }

    fn build_r(&mut self, ike: &mut IkeSa, msg: &mut Message) -> TaskStatus {
        if self.aborted {
            return self.build_abort(msg);
        }
        match msg.exchange {
            Some(ExchangeType::IkeSaInit) => {
                if self.generate_nonce().is_err() {
                    return self.suppress(msg);
                }
                msg.add(Payload::Nonce(self.my_nonce.clone()));
                TaskStatus::NeedMore
            }
            Some(ExchangeType::IkeAuth) | Some(ExchangeType::CreateChildSa) => {
                self.build_response(ike, msg)
            }
            Some(ExchangeType::IkeFollowupKeyExchange) => self.build_r_followup(ike, msg),
            _ => TaskStatus::Failed,
        }
    }

    fn build_response(&mut self, ike: &mut IkeSa, msg: &mut Message) -> TaskStatus {
        let create_child = msg.exchange == Some(ExchangeType::CreateChildSa);
        if self.received_sa.is_empty() && !create_child {
            // childless IKE_AUTH, nothing for us to answer
            return TaskStatus::Success;
        }
        if create_child && self.my_nonce.is_empty() && self.generate_nonce().is_err() {
            return self.reply_error(msg, NotifyError::NoProposalChosen);
        }
        let Some(config) = self.config.clone() else {
            info!("No child configuration matches the received traffic selectors");
            ike.services.bus.alert(Alert::TsMismatchChild);
            return self.reply_error(msg, NotifyError::TsUnacceptable);
        };

        let configured = config.proposals(create_child);
        let flags = self.select_flags(ike, !create_child);
        let received = SecurityAssociation {
            proposals: self.received_sa.clone(),
        };
        let Some(mut selected) = received.select(&configured, flags) else {
            info!("No acceptable proposal in the peer's offer");
            ike.services.bus.alert(Alert::ProposalMismatchChild);
            return self.reply_error(msg, NotifyError::NoProposalChosen);
        };
        let Some(other_spi) = selected.spi else {
            warn!("Peer proposal carries no SPI");
            return self.reply_error(msg, NotifyError::NoProposalChosen);
        };
        self.other_spi = other_spi;

        // key exchange method resolution with the asymmetric responder rules
        match selected.first_ke_method() {
            None | Some(KeyExchangeMethod::None) => {
                // no PFS in the selected proposal: a received KE payload is
                // simply discarded and earlier KE trouble is forgiven
                self.ke = None;
                self.ke_method = KeyExchangeMethod::None;
            }
            Some(expected) => {
                let received_method = self.received_ke.as_ref().map(|ke| ke.method);
                if received_method != Some(expected) {
                    info!(
                        "Peer sent key exchange method {:?}, expected {expected}",
                        received_method
                    );
                    msg.add(Payload::Notify(
                        Notification::error(NotifyError::InvalidKePayload)
                            .with_data((expected as u16).to_be_bytes().to_vec()),
                    ));
                    return TaskStatus::Success;
                }
                self.ke_method = expected;
                let Some(mut ke) = ike.services.crypto.create_ke(expected) else {
                    warn!("Key exchange method {expected} not supported locally");
                    return self.reply_error(msg, NotifyError::NoProposalChosen);
                };
                let data = self
                    .received_ke
                    .as_ref()
                    .map(|p| p.data.clone())
                    .unwrap_or_default();
                if ke.set_public_key(&data).is_err() {
                    warn!("Applying the peer's public key failed");
                    return self.reply_error(msg, NotifyError::InvalidSyntax);
                }
                self.ke = Some(ke);
            }
        }

        let plan = match KePlan::from_proposal(&selected) {
            Ok(plan) => plan,
            Err(err) => {
                warn!("Peer offered a malformed key exchange plan: {err}");
                return self.reply_error(msg, NotifyError::InvalidSyntax);
            }
        };

        let tsi_hint = self
            .received_tsi
            .as_ref()
            .and_then(|ts| ts.label.as_deref());
        let tsr_hint = self
            .received_tsr
            .as_ref()
            .and_then(|ts| ts.label.as_deref());
        match select_label(tsi_hint, tsr_hint, config.label.as_ref()) {
            Ok(selected_label) => {
                if let (Some(bound), Some(chosen)) = (&self.label, &selected_label) {
                    if bound != chosen {
                        info!("Received labels do not match the label this SA is bound to");
                        return self.reply_error(msg, NotifyError::TsUnacceptable);
                    }
                }
                if self.label.is_none() {
                    self.label = selected_label;
                }
            }
            Err(err) => {
                info!("Security label selection failed: {err}");
                return self.reply_error(msg, NotifyError::TsUnacceptable);
            }
        }

        let peer_tsi: Vec<TrafficSelector> = self
            .received_tsi
            .as_ref()
            .map(|ts| ts.selectors.clone())
            .unwrap_or_default();
        let peer_tsr: Vec<TrafficSelector> = self
            .received_tsr
            .as_ref()
            .map(|ts| ts.selectors.clone())
            .unwrap_or_default();
        let (my_ts, other_ts) =
            self.narrow_ts_pair(ike, &config, &peer_tsr, &peer_tsi, self.transport_requested);
        if my_ts.is_empty() || other_ts.is_empty() {
            info!("The received selectors leave nothing acceptable");
            ike.services.bus.alert(Alert::TsMismatchChild);
            return self.reply_error(msg, NotifyError::TsUnacceptable);
        }
        self.my_ts = my_ts;
        self.other_ts = other_ts;
        ike.services
            .bus
            .narrow(NarrowPhase::Responder, &self.my_ts, &self.other_ts);

        // a responder that cannot accept the requested mode silently
        // downgrades to tunnel
        self.mode = Mode::Tunnel;
        if self.transport_requested && self.verify_mode(ike, &config, Mode::Transport) {
            self.mode = Mode::Transport;
        } else if self.beet_requested && self.verify_mode(ike, &config, Mode::Beet) {
            self.mode = Mode::Beet;
        }

        let mut child = ChildSa::new(
            config.clone(),
            self.kernel.clone(),
            ike.my_host,
            ike.other_host,
        );
        child.set_marks(self.marks.0, self.marks.1);
        if !self.if_ids_set {
            self.if_ids = ike.if_ids;
        }
        child.set_if_ids(self.if_ids.0, self.if_ids.1);
        child.set_label(self.label.clone());
        child.set_protocol(selected.protocol);
        child.set_other_spi(other_spi);
        child.update_hosts(ike.my_host, ike.other_host, ike.nat_any());
        let my_spi = child.alloc_spi();
        if my_spi == 0 {
            warn!("Unable to allocate an SPI from the kernel");
            return self.reply_error(msg, NotifyError::NoProposalChosen);
        }
        selected.set_spi(my_spi);

        if let Some((cpi, transform)) = self.ipcomp_received {
            if transform != IpcompTransform::Deflate as u8 {
                warn!("Peer proposed IPComp transform {transform}, only DEFLATE is accepted");
            } else if config.ipcomp {
                let my_cpi = child.alloc_cpi();
                if my_cpi == 0 {
                    warn!("IPComp requested, but the kernel failed to allocate a CPI");
                } else {
                    self.my_cpi = my_cpi;
                    self.other_cpi = cpi;
                    msg.add(Payload::Notify(ipcomp_notify(my_cpi)));
                }
            }
        }
        self.child = Some(child);

        msg.add(Payload::SecurityAssociation(SecurityAssociation {
            proposals: vec![selected.clone()],
        }));
        if create_child {
            msg.add(Payload::Nonce(self.my_nonce.clone()));
        }
        if let Some(ke) = &self.ke {
            msg.add(Payload::KeyExchange(KeyExchangePayload {
                method: ke.method(),
                data: ke.public_key(),
            }));
        }
        let label = self.label.as_ref().map(|l| l.as_bytes().to_vec());
        msg.add(Payload::TrafficSelectorInitiator(TsPayload {
            selectors: self.other_ts.clone(),
            label: label.clone(),
        }));
        msg.add(Payload::TrafficSelectorResponder(TsPayload {
            selectors: self.my_ts.clone(),
            label,
        }));
        match self.mode {
            Mode::Transport => msg.add(Payload::Notify(Notification::status(
                NotifyStatus::UseTransportMode,
            ))),
            Mode::Beet => msg.add(Payload::Notify(Notification::status(
                NotifyStatus::UseBeetMode,
            ))),
            Mode::Tunnel => {}
        }
        if ike.services.kernel.features() & FEATURE_ESP_V3_TFC == 0 {
            msg.add(Payload::Notify(Notification::status(
                NotifyStatus::EspTfcPaddingNotSupported,
            )));
        }

        self.selected = Some(selected);
        self.plan = plan;
        self.complete_current_ke();

        if self.plan.remaining() > 0 {
            let token = self
                .link_token
                .get_or_insert_with(|| vec![0x42])
                .clone();
            msg.add(Payload::Notify(
                Notification::status(NotifyStatus::AdditionalKeyExchange).with_data(token),
            ));
            return TaskStatus::NeedMore;
        }
        self.install_child(ike)
    }

    fn process_r_followup(&mut self, ike: &mut IkeSa, msg: &Message) -> TaskStatus {
        let token = msg
            .find_status(NotifyStatus::AdditionalKeyExchange)
            .map(|n| n.data.clone());
        match (&self.link_token, token) {
            (Some(ours), Some(theirs)) if *ours == theirs => {}
            _ => {
                warn!("Follow-up key exchange carries a wrong or missing link token");
                self.followup_error = Some(NotifyError::StateNotFound);
                return TaskStatus::NeedMore;
            }
        }
        let Some(slot) = self.plan.pending() else {
            self.followup_error = Some(NotifyError::InvalidSyntax);
            return TaskStatus::NeedMore;
        };
        let method = slot.method;
        let Some(ke_payload) = msg.ke() else {
            self.followup_error = Some(NotifyError::InvalidSyntax);
            return TaskStatus::NeedMore;
        };
        if ke_payload.method != method {
            info!(
                "Peer sent key exchange method {}, expected {method}",
                ke_payload.method
            );
            self.followup_error = Some(NotifyError::InvalidKePayload);
            return TaskStatus::NeedMore;
        }
        let Some(mut ke) = ike.services.crypto.create_ke(method) else {
            self.followup_error = Some(NotifyError::NoProposalChosen);
            return TaskStatus::NeedMore;
        };
        if ke.set_public_key(&ke_payload.data).is_err() {
            warn!("Applying the peer's public key failed");
            self.followup_error = Some(NotifyError::InvalidSyntax);
            return TaskStatus::NeedMore;
        }
        self.ke = Some(ke);
        TaskStatus::NeedMore
    }

    fn build_r_followup(&mut self, ike: &mut IkeSa, msg: &mut Message) -> TaskStatus {
        if let Some(error) = self.followup_error.take() {
            if error == NotifyError::InvalidKePayload {
                let expected = self
                    .plan
                    .pending()
                    .map(|slot| slot.method as u16)
                    .unwrap_or(0);
                msg.add(Payload::Notify(
                    Notification::error(error).with_data(expected.to_be_bytes().to_vec()),
                ));
                return TaskStatus::Success;
            }
            return self.reply_error(msg, error);
        }
        let Some(token) = &self.link_token else {
            return TaskStatus::Failed;
        };
        msg.add(Payload::Notify(
            Notification::status(NotifyStatus::AdditionalKeyExchange).with_data(token.clone()),
        ));
        if let Some(ke) = &self.ke {
            msg.add(Payload::KeyExchange(KeyExchangePayload {
                method: ke.method(),
                data: ke.public_key(),
            }));
        }
        self.complete_current_ke();
        if self.plan.remaining() > 0 {
            return TaskStatus::NeedMore;
        }
        self.install_child(ike)
    }

    // ---- installation ----

    /// Derive the keys and install the SA pair plus policies; see the
    /// key symmetry rule in the module docs of `keymat`
    fn install_child(&mut self, ike: &mut IkeSa) -> TaskStatus {
        let Some(mut child) = self.child.take() else {
            return TaskStatus::Failed;
        };
        let Some(selected) = self.selected.clone() else {
            return TaskStatus::Failed;
        };
        let (nonce_i, nonce_r) = if self.initiator {
            (self.my_nonce.clone(), self.other_nonce.clone())
        } else {
            (self.other_nonce.clone(), self.my_nonce.clone())
        };
        let keys = match ike.services.keymat.derive_child_keys(
            &selected,
            &self.completed,
            &nonce_i,
            &nonce_r,
        ) {
            Ok(keys) => keys,
            Err(err) => {
                warn!("Deriving CHILD_SA keys failed: {err}");
                return TaskStatus::Failed;
            }
        };
        ike.services.bus.child_derived_keys(child.unique_id());

        child.set_proposal(selected);
        child.set_mode(self.mode);
        child.set_state(ChildSaState::Installing);
        child.update_hosts(ike.my_host, ike.other_host, ike.nat_any());
        child.set_policies(self.my_ts.clone(), self.other_ts.clone());
        child.set_label(self.label.clone());
        if child.acquire_reqid(self.reqid).is_err() {
            ike.services.bus.alert(Alert::InstallChildSaFailed);
            return TaskStatus::Failed;
        }

        let (my_cpi, other_cpi) = if self.my_cpi == 0 || self.other_cpi == 0 {
            child.set_ipcomp(None);
            (0, 0)
        } else {
            child.set_ipcomp(Some(IpcompTransform::Deflate));
            child.set_other_cpi(self.other_cpi);
            (self.my_cpi, self.other_cpi)
        };

        // the inbound SA uses the keys the peer encrypts with, the
        // outbound SA the keys we encrypt with
        let (encr_in, integ_in, encr_out, integ_out) = if self.initiator {
            (&keys.encr_r, &keys.integ_r, &keys.encr_i, &keys.integ_i)
        } else {
            (&keys.encr_i, &keys.integ_i, &keys.encr_r, &keys.integ_r)
        };
        let tfc = self.tfc_v3 && ike.services.kernel.features() & FEATURE_ESP_V3_TFC != 0;

        let my_spi = child.my_spi();
        if child
            .install(encr_in, integ_in, my_spi, my_cpi, true, tfc)
            .is_err()
        {
            warn!("Installing the inbound SA failed");
            ike.services.bus.alert(Alert::InstallChildSaFailed);
            return TaskStatus::Failed;
        }
        let outbound = if self.rekey {
            child.register_outbound(encr_out, integ_out, self.other_spi, other_cpi, tfc)
        } else {
            child.install(encr_out, integ_out, self.other_spi, other_cpi, false, tfc)
        };
        if outbound.is_err() {
            warn!("Installing the outbound SA failed");
            ike.services.bus.alert(Alert::InstallChildSaFailed);
            return TaskStatus::Failed;
        }
        ike.services.bus.child_keys(child.unique_id(), self.initiator);

        if child.install_policies().is_err() {
            warn!("Installing the flow policies failed");
            ike.services.bus.alert(Alert::InstallChildPolicyFailed);
            return TaskStatus::NotFound;
        }

        child.set_state(ChildSaState::Installed);
        self.established = true;
        let child_id = child.unique_id();
        info!(
            "CHILD_SA {}#{child_id} established with SPIs {:08x}(in) {:08x}(out)",
            child.name(),
            my_spi,
            self.other_spi,
        );
        if let Some(timeout) = child.config().inactivity {
            ike.services.sched.schedule(
                Job::InactivityCheck {
                    child_id,
                    timeout,
                    close_ike: ike.services.settings.inactivity_close_ike,
                },
                timeout,
            );
        }
        ike.add_child(child);
        ike.services.bus.child_updown(child_id, true);
        TaskStatus::Success
    }
}

fn ipcomp_notify(cpi: u16) -> Notification {
    let mut data = cpi.to_be_bytes().to_vec();
    data.push(IpcompTransform::Deflate as u8);
    Notification::status(NotifyStatus::IpcompSupported).with_data(data)
}

impl Task for ChildCreate {
    #[instrument(skip_all, fields(ike = ike.unique_id, initiator = self.initiator))]
    fn build(&mut self, ike: &mut IkeSa, msg: &mut Message) -> TaskStatus {
        if self.initiator {
            self.build_i(ike, msg)
        } else {
            self.build_r(ike, msg)
        }
    }

    #[instrument(skip_all, fields(ike = ike.unique_id, initiator = self.initiator))]
    fn process(&mut self, ike: &mut IkeSa, msg: &Message) -> TaskStatus {
        if self.initiator {
            self.process_i(ike, msg)
        } else {
            self.process_r(ike, msg)
        }
    }
}

impl Drop for ChildCreate {
    fn drop(&mut self) {
        if self.reqid_allocated {
            let _ = self.kernel.release_reqid(self.reqid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;

    fn task() -> ChildCreate {
        ChildCreate::responder(Arc::new(MemoryKernel::default()))
    }

    #[test]
    fn lower_nonce_prefers_smaller_prefix() {
        let mut t = task();
        t.my_nonce = vec![0x01, 0x02, 0x03];
        t.other_nonce = vec![0x01, 0x02, 0x04];
        assert_eq!(t.get_lower_nonce(), &[0x01, 0x02, 0x03]);

        t.my_nonce = vec![0x05];
        t.other_nonce = vec![0x01, 0x02];
        assert_eq!(t.get_lower_nonce(), &[0x01, 0x02]);
    }

    #[test]
    fn lower_nonce_tie_goes_to_mine() {
        let mut t = task();
        t.my_nonce = vec![0x01, 0x02];
        t.other_nonce = vec![0x01, 0x02, 0xff];
        // the common prefix is equal, so our nonce wins regardless of length
        assert_eq!(t.get_lower_nonce(), &[0x01, 0x02]);
    }

    #[test]
    fn abort_without_spi_is_silent() {
        let mut t = task();
        t.abort();
        let mut msg = Message::new(ExchangeType::Informational, true);
        let status = t.build_abort(&mut msg);
        assert_eq!(status, TaskStatus::Success);
        assert_eq!(msg.exchange, None);
        assert!(msg.payloads.is_empty());
    }

    #[test]
    fn reqid_reservation_is_swapped_and_released() {
        let kernel = Arc::new(MemoryKernel::default());
        {
            let mut t = ChildCreate::responder(kernel.clone());
            t.use_reqid(13);
            assert_eq!(kernel.reqid_refs(13), 1);
            t.use_reqid(14);
            assert_eq!(kernel.reqid_refs(13), 0);
            assert_eq!(kernel.reqid_refs(14), 1);
        }
        assert_eq!(kernel.reqid_refs(14), 0);
    }
}
