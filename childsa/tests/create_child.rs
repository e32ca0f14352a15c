//! End-to-end negotiations between an initiator and a responder task,
//! exchanging payload-level messages like the IKE engine would

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use childsa::bus::BusEvent;
use childsa::bus::RecordingBus;
use childsa::config::ChildConfig;
use childsa::config::ChildlessPolicy;
use childsa::config::Mode;
use childsa::config::Settings;
use childsa::host::Host;
use childsa::ikesa::IkeSa;
use childsa::ikesa::Services;
use childsa::ikesa::EXT_CHILDLESS;
use childsa::kernel::Kernel;
use childsa::kernel::MemoryKernel;
use childsa::keyexchange::stub::StubProvider;
use childsa::keymat::StubKeymat;
use childsa::sched::Job;
use childsa::sched::RecordingScheduler;
use childsa::tasks::Message;
use childsa::ChildCreate;
use childsa::Task;
use childsa::TaskStatus;
use ikewire::definitions::params::EncryptionAlgorithm;
use ikewire::definitions::params::ExchangeType;
use ikewire::definitions::params::IntegrityAlgorithm;
use ikewire::definitions::params::KeyExchangeMethod;
use ikewire::definitions::params::NotifyError;
use ikewire::definitions::params::NotifyStatus;
use ikewire::definitions::params::SecurityProtocol;
use ikewire::definitions::Notification;
use ikewire::definitions::Payload;
use ikewire::definitions::Proposal;
use ikewire::definitions::TrafficSelector;
use ikewire::definitions::Transform;

struct Peer {
    ike: IkeSa,
    kernel: Arc<MemoryKernel>,
    bus: Arc<RecordingBus>,
    sched: Arc<RecordingScheduler>,
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

fn peer(id: u32, me: Host, other: Host) -> Peer {
    let kernel = Arc::new(MemoryKernel::default());
    let bus = Arc::new(RecordingBus::default());
    let sched = Arc::new(RecordingScheduler::default());
    let services = Services {
        kernel: kernel.clone(),
        bus: bus.clone(),
        sched: sched.clone(),
        crypto: Arc::new(StubProvider::default()),
        keymat: Box::new(StubKeymat),
        settings: Arc::new(Settings::default()),
    };
    Peer {
        ike: IkeSa::new(id, me, other, services),
        kernel,
        bus,
        sched,
    }
}

fn default_peers() -> (Peer, Peer) {
    let host_i = Host::new(v4(198, 51, 100, 1), 500);
    let host_r = Host::new(v4(203, 0, 113, 1), 500);
    (peer(1, host_i, host_r), peer(2, host_r, host_i))
}

fn esp_proposal(ke: &[KeyExchangeMethod], addke: &[(u8, KeyExchangeMethod)]) -> Proposal {
    let mut p = Proposal::new_empty(SecurityProtocol::EncapsulatingSecurityPayload, None);
    p.add(vec![
        Transform::Encryption(EncryptionAlgorithm::AesCbc, Some(128)),
        Transform::Integrity(IntegrityAlgorithm::HmacSha2_256_128),
    ]);
    p.add(ke.iter().map(|m| Transform::KeyExchange(*m)).collect());
    p.add(
        addke
            .iter()
            .map(|(slot, m)| Transform::AdditionalKeyExchange(*slot, *m))
            .collect(),
    );
    p
}

fn subnet_config(
    name: &str,
    proposal: Proposal,
    local: (IpAddr, u8),
    remote: (IpAddr, u8),
) -> ChildConfig {
    let mut config = ChildConfig::new(name, vec![proposal]);
    config.local_ts = vec![TrafficSelector::from_subnet(local.0, local.1, 0, 0, u16::MAX)];
    config.remote_ts = vec![TrafficSelector::from_subnet(remote.0, remote.1, 0, 0, u16::MAX)];
    config
}

/// Run one request/response round of the given exchange between the tasks
fn round(
    exchange: ExchangeType,
    initiator: &mut ChildCreate,
    ike_i: &mut IkeSa,
    responder: &mut ChildCreate,
    ike_r: &mut IkeSa,
) -> (TaskStatus, TaskStatus, Message, Message) {
    let mut request = Message::new(exchange, true);
    let build_i = initiator.build(ike_i, &mut request);
    assert_ne!(build_i, TaskStatus::Failed, "initiator build failed");
    responder.process(ike_r, &request);
    let mut response = Message::new(exchange, false);
    let build_r = responder.build(ike_r, &mut response);
    let process_i = initiator.process(ike_i, &response);
    (build_r, process_i, request, response)
}

fn updowns(bus: &RecordingBus) -> Vec<bool> {
    bus.snapshot()
        .into_iter()
        .filter_map(|e| match e {
            BusEvent::Updown(_, up) => Some(up),
            _ => None,
        })
        .collect()
}

#[test]
fn ike_auth_piggyback_without_pfs() {
    let (mut a, mut b) = default_peers();
    let config_i = Arc::new(subnet_config(
        "net-net",
        esp_proposal(&[], &[]),
        (v4(10, 1, 0, 0), 16),
        (v4(10, 2, 0, 0), 16),
    ));
    let config_r = Arc::new(subnet_config(
        "net-net",
        esp_proposal(&[], &[]),
        (v4(10, 2, 0, 0), 16),
        (v4(10, 1, 0, 0), 16),
    ));
    b.ike.peer_configs.push(config_r);

    let mut init = ChildCreate::initiator(config_i, a.kernel.clone());
    let mut resp = ChildCreate::responder(b.kernel.clone());

    // nonce piggyback on IKE_SA_INIT
    let (build_r, process_i, _, _) =
        round(ExchangeType::IkeSaInit, &mut init, &mut a.ike, &mut resp, &mut b.ike);
    assert_eq!(build_r, TaskStatus::NeedMore);
    assert_eq!(process_i, TaskStatus::NeedMore);

    let (build_r, process_i, request, _) =
        round(ExchangeType::IkeAuth, &mut init, &mut a.ike, &mut resp, &mut b.ike);
    assert_eq!(build_r, TaskStatus::Success);
    assert_eq!(process_i, TaskStatus::Success);
    // IKE_AUTH carries neither nonce nor KE payloads for the child
    assert!(request.nonce().is_none());
    assert!(request.ke().is_none());

    for peer in [&a, &b] {
        let sas = peer.kernel.sas.lock().unwrap();
        assert_eq!(sas.len(), 2);
        assert!(sas.iter().any(|sa| sa.inbound));
        assert!(sas.iter().any(|sa| !sa.inbound));
        assert!(sas.iter().all(|sa| !sa.registered));
        assert_eq!(updowns(&peer.bus), vec![true]);
    }
    assert!(init.established() && resp.established());
    assert_eq!(a.ike.children().len(), 1);
    // the installed inbound SPI is the one the kernel allocated (non-zero)
    let child = &a.ike.children()[0];
    assert_ne!(child.my_spi(), 0);
    assert_eq!(child.other_spi(), b.ike.children()[0].my_spi());
}

#[test]
fn create_child_with_pfs() {
    let (mut a, mut b) = default_peers();
    let config_i = Arc::new(subnet_config(
        "pfs",
        esp_proposal(&[KeyExchangeMethod::ModP3072], &[]),
        (v4(10, 1, 0, 0), 16),
        (v4(10, 2, 0, 0), 16),
    ));
    let config_r = Arc::new(subnet_config(
        "pfs",
        esp_proposal(&[KeyExchangeMethod::ModP3072], &[]),
        (v4(10, 2, 0, 0), 16),
        (v4(10, 1, 0, 0), 16),
    ));
    b.ike.peer_configs.push(config_r);

    // skew the responder's allocator so the SPIs of both sides differ
    for _ in 0..3 {
        b.kernel
            .alloc_spi(SecurityProtocol::EncapsulatingSecurityPayload);
    }

    let mut init = ChildCreate::initiator(config_i, a.kernel.clone());
    let mut resp = ChildCreate::responder(b.kernel.clone());

    let (build_r, process_i, request, response) = round(
        ExchangeType::CreateChildSa,
        &mut init,
        &mut a.ike,
        &mut resp,
        &mut b.ike,
    );
    assert_eq!(build_r, TaskStatus::Success);
    assert_eq!(process_i, TaskStatus::Success);
    assert_eq!(request.ke().map(|ke| ke.method), Some(KeyExchangeMethod::ModP3072));
    assert_eq!(response.ke().map(|ke| ke.method), Some(KeyExchangeMethod::ModP3072));

    // the SA pairs mirror across the peers: what one installs inbound the
    // other installs outbound, with the same SPI and keys
    let sas_a = a.kernel.sas.lock().unwrap();
    let sas_b = b.kernel.sas.lock().unwrap();
    let in_a = sas_a.iter().find(|sa| sa.inbound).unwrap();
    let out_b = sas_b.iter().find(|sa| !sa.inbound).unwrap();
    assert_eq!(in_a.spi, out_b.spi);
    assert_eq!(in_a.encr, out_b.encr);
    assert_eq!(in_a.integ, out_b.integ);
    let out_a = sas_a.iter().find(|sa| !sa.inbound).unwrap();
    let in_b = sas_b.iter().find(|sa| sa.inbound).unwrap();
    assert_eq!(out_a.spi, in_b.spi);
    assert_eq!(out_a.encr, in_b.encr);
}

#[test]
fn hybrid_post_quantum_needs_followup_round() {
    let (mut a, mut b) = default_peers();
    let proposal = esp_proposal(
        &[KeyExchangeMethod::Curve25519],
        &[(1, KeyExchangeMethod::MlKem768)],
    );
    let config_i = Arc::new(subnet_config(
        "hybrid",
        proposal.clone(),
        (v4(10, 1, 0, 0), 16),
        (v4(10, 2, 0, 0), 16),
    ));
    let config_r = Arc::new(subnet_config(
        "hybrid",
        proposal,
        (v4(10, 2, 0, 0), 16),
        (v4(10, 1, 0, 0), 16),
    ));
    b.ike.peer_configs.push(config_r);

    let mut init = ChildCreate::initiator(config_i, a.kernel.clone());
    let mut resp = ChildCreate::responder(b.kernel.clone());

    let (build_r, process_i, _, response) = round(
        ExchangeType::CreateChildSa,
        &mut init,
        &mut a.ike,
        &mut resp,
        &mut b.ike,
    );
    assert_eq!(build_r, TaskStatus::NeedMore);
    assert_eq!(process_i, TaskStatus::NeedMore);
    // the responder links the follow-up exchanges with its token
    let token = response
        .find_status(NotifyStatus::AdditionalKeyExchange)
        .map(|n| n.data.clone())
        .unwrap();
    assert_eq!(token, vec![0x42]);
    // nothing is installed until all exchanges completed
    assert!(a.kernel.sas.lock().unwrap().is_empty());
    assert!(b.kernel.sas.lock().unwrap().is_empty());

    let (build_r, process_i, followup, _) = round(
        ExchangeType::IkeFollowupKeyExchange,
        &mut init,
        &mut a.ike,
        &mut resp,
        &mut b.ike,
    );
    assert_eq!(build_r, TaskStatus::Success);
    assert_eq!(process_i, TaskStatus::Success);
    // the initiator echoed the token bit for bit
    assert_eq!(
        followup
            .find_status(NotifyStatus::AdditionalKeyExchange)
            .map(|n| n.data.clone()),
        Some(token)
    );
    assert_eq!(
        followup.ke().map(|ke| ke.method),
        Some(KeyExchangeMethod::MlKem768)
    );
    assert_eq!(a.kernel.sas.lock().unwrap().len(), 2);
    assert_eq!(b.kernel.sas.lock().unwrap().len(), 2);
}

#[test]
fn invalid_ke_payload_triggers_exactly_one_retry() {
    let (mut a, mut b) = default_peers();
    // we prefer modp3072, the responder only accepts ecp256
    let config_i = Arc::new(subnet_config(
        "retry",
        esp_proposal(&[KeyExchangeMethod::ModP3072, KeyExchangeMethod::EcP256], &[]),
        (v4(10, 1, 0, 0), 16),
        (v4(10, 2, 0, 0), 16),
    ));
    let config_r = Arc::new(subnet_config(
        "retry",
        esp_proposal(&[KeyExchangeMethod::EcP256], &[]),
        (v4(10, 2, 0, 0), 16),
        (v4(10, 1, 0, 0), 16),
    ));
    b.ike.peer_configs.push(config_r);

    let mut init = ChildCreate::initiator(config_i, a.kernel.clone());
    let mut resp = ChildCreate::responder(b.kernel.clone());

    let (build_r, process_i, request, response) = round(
        ExchangeType::CreateChildSa,
        &mut init,
        &mut a.ike,
        &mut resp,
        &mut b.ike,
    );
    assert_eq!(request.ke().map(|ke| ke.method), Some(KeyExchangeMethod::ModP3072));
    assert_eq!(build_r, TaskStatus::Success);
    let notify = response.find_error(NotifyError::InvalidKePayload).unwrap();
    assert_eq!(notify.data, vec![0x00, 0x13]);
    // the initiator migrates back into the queue for another round
    assert_eq!(process_i, TaskStatus::NeedMore);

    // second attempt with the suggested method succeeds against a fresh
    // responder task
    let mut resp = ChildCreate::responder(b.kernel.clone());
    let (build_r, process_i, request, _) = round(
        ExchangeType::CreateChildSa,
        &mut init,
        &mut a.ike,
        &mut resp,
        &mut b.ike,
    );
    assert_eq!(request.ke().map(|ke| ke.method), Some(KeyExchangeMethod::EcP256));
    assert_eq!(build_r, TaskStatus::Success);
    assert_eq!(process_i, TaskStatus::Success);
    assert!(init.established());
}

#[test]
fn second_invalid_ke_payload_abandons_the_child() {
    let (mut a, _) = default_peers();
    let config_i = Arc::new(subnet_config(
        "retry",
        esp_proposal(&[KeyExchangeMethod::ModP3072, KeyExchangeMethod::EcP256], &[]),
        (v4(10, 1, 0, 0), 16),
        (v4(10, 2, 0, 0), 16),
    ));
    let mut init = ChildCreate::initiator(config_i, a.kernel.clone());

    let invalid_ke = |method: KeyExchangeMethod| {
        let mut response = Message::new(ExchangeType::CreateChildSa, false);
        response.add(Payload::Notify(
            Notification::error(NotifyError::InvalidKePayload)
                .with_data((method as u16).to_be_bytes().to_vec()),
        ));
        response
    };

    let mut request = Message::new(ExchangeType::CreateChildSa, true);
    assert_eq!(init.build(&mut a.ike, &mut request), TaskStatus::NeedMore);
    assert_eq!(
        init.process(&mut a.ike, &invalid_ke(KeyExchangeMethod::EcP256)),
        TaskStatus::NeedMore
    );

    let mut request = Message::new(ExchangeType::CreateChildSa, true);
    assert_eq!(init.build(&mut a.ike, &mut request), TaskStatus::NeedMore);
    assert_eq!(
        init.process(&mut a.ike, &invalid_ke(KeyExchangeMethod::ModP3072)),
        TaskStatus::Success
    );
    assert!(!init.established());
    assert!(a.ike.children().is_empty());
}

#[test]
fn transport_mode_with_nat_substitutes_the_endpoint() {
    // the initiator sits behind a NAT: it knows itself as 10.0.0.5, the
    // responder sees 192.0.2.7
    let inside = Host::new(v4(10, 0, 0, 5), 4500);
    let outside = Host::new(v4(192, 0, 2, 7), 4500);
    let responder_host = Host::new(v4(198, 51, 100, 1), 4500);

    let mut a = peer(1, inside, responder_host);
    a.ike.nat_here = true;
    let mut b = peer(2, responder_host, outside);
    b.ike.nat_there = true;

    let mut config_i = ChildConfig::new("host-host", vec![esp_proposal(&[], &[])]);
    config_i.mode = Mode::Transport;
    let mut config_r = ChildConfig::new("host-host", vec![esp_proposal(&[], &[])]);
    config_r.mode = Mode::Transport;
    b.ike.peer_configs.push(Arc::new(config_r));

    let mut init = ChildCreate::initiator(Arc::new(config_i), a.kernel.clone());
    let mut resp = ChildCreate::responder(b.kernel.clone());

    round(ExchangeType::IkeSaInit, &mut init, &mut a.ike, &mut resp, &mut b.ike);
    let (build_r, process_i, _, _) =
        round(ExchangeType::IkeAuth, &mut init, &mut a.ike, &mut resp, &mut b.ike);
    assert_eq!(build_r, TaskStatus::Success);
    assert_eq!(process_i, TaskStatus::Success);

    for peer in [&a, &b] {
        let sas = peer.kernel.sas.lock().unwrap();
        assert_eq!(sas.len(), 2);
        assert!(sas.iter().all(|sa| sa.mode == Mode::Transport));
    }
    // the responder's policies name the outside address, not 10.0.0.5
    let child = &b.ike.children()[0];
    assert!(child.other_ts().iter().all(|ts| ts.is_host(Some(outside.addr))));
}

#[test]
fn temporary_failure_schedules_a_delayed_retry() {
    let (mut a, _) = default_peers();
    let config = Arc::new(subnet_config(
        "retry-later",
        esp_proposal(&[], &[]),
        (v4(10, 1, 0, 0), 16),
        (v4(10, 2, 0, 0), 16),
    ));
    let mut init = ChildCreate::initiator(config.clone(), a.kernel.clone());
    init.use_reqid(9);

    let mut request = Message::new(ExchangeType::CreateChildSa, true);
    assert_eq!(init.build(&mut a.ike, &mut request), TaskStatus::NeedMore);

    let mut response = Message::new(ExchangeType::CreateChildSa, false);
    response.add(Payload::Notify(Notification::error(
        NotifyError::TemporaryFailure,
    )));
    assert_eq!(init.process(&mut a.ike, &response), TaskStatus::Success);
    assert!(!init.established());

    let settings = Settings::default();
    let jobs = a.sched.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    let (job, delay) = &jobs[0];
    match job {
        Job::RetryChildCreate {
            config: carried,
            reqid,
            ..
        } => {
            assert_eq!(carried.name, config.name);
            assert_eq!(*reqid, 9);
        }
        other => panic!("unexpected job {other:?}"),
    }
    let min = Duration::from_secs(settings.retry_interval - settings.retry_jitter);
    let max = Duration::from_secs(settings.retry_interval);
    assert!(*delay >= min && *delay <= max);
}

#[test]
fn duplicate_child_suppresses_the_exchange() {
    let (mut a, mut b) = default_peers();
    let config_i = Arc::new(subnet_config(
        "dup",
        esp_proposal(&[], &[]),
        (v4(10, 1, 0, 0), 16),
        (v4(10, 2, 0, 0), 16),
    ));
    let config_r = Arc::new(subnet_config(
        "dup",
        esp_proposal(&[], &[]),
        (v4(10, 2, 0, 0), 16),
        (v4(10, 1, 0, 0), 16),
    ));
    b.ike.peer_configs.push(config_r);

    let mut init = ChildCreate::initiator(config_i.clone(), a.kernel.clone());
    let mut resp = ChildCreate::responder(b.kernel.clone());
    let (build_r, process_i, _, _) = round(
        ExchangeType::CreateChildSa,
        &mut init,
        &mut a.ike,
        &mut resp,
        &mut b.ike,
    );
    assert_eq!((build_r, process_i), (TaskStatus::Success, TaskStatus::Success));
    assert_eq!(a.ike.children().len(), 1);

    // a second task for the same config does not go on the wire
    let mut again = ChildCreate::initiator(config_i, a.kernel.clone());
    let mut request = Message::new(ExchangeType::CreateChildSa, true);
    assert_eq!(again.build(&mut a.ike, &mut request), TaskStatus::Success);
    assert_eq!(request.exchange, None);
    assert!(request.payloads.is_empty());
    assert_eq!(a.ike.children().len(), 1);
}

#[test]
fn childless_policies_on_ike_auth() {
    let (mut a, _) = default_peers();
    let config = Arc::new(subnet_config(
        "childless",
        esp_proposal(&[], &[]),
        (v4(10, 1, 0, 0), 16),
        (v4(10, 2, 0, 0), 16),
    ));

    // FORCE against a peer without the extension tears the IKE_SA down
    a.ike.childless = ChildlessPolicy::Force;
    let mut init = ChildCreate::initiator(config.clone(), a.kernel.clone());
    let mut msg = Message::new(ExchangeType::IkeAuth, true);
    assert_eq!(init.build(&mut a.ike, &mut msg), TaskStatus::DestroyMe);

    // PREFER against a supporting peer defers to CREATE_CHILD_SA
    a.ike.childless = ChildlessPolicy::Prefer;
    a.ike.enable_extension(EXT_CHILDLESS);
    let mut init = ChildCreate::initiator(config, a.kernel.clone());
    let mut msg = Message::new(ExchangeType::IkeAuth, true);
    assert_eq!(init.build(&mut a.ike, &mut msg), TaskStatus::NeedMore);
    assert!(msg.payloads.is_empty());
}

#[test]
fn abort_sends_a_delete_for_allocated_spis() {
    let (mut a, _) = default_peers();
    let config = Arc::new(subnet_config(
        "abort",
        esp_proposal(&[], &[]),
        (v4(10, 1, 0, 0), 16),
        (v4(10, 2, 0, 0), 16),
    ));
    let mut init = ChildCreate::initiator(config, a.kernel.clone());

    let mut request = Message::new(ExchangeType::CreateChildSa, true);
    assert_eq!(init.build(&mut a.ike, &mut request), TaskStatus::NeedMore);
    let spi = init.get_child().unwrap().my_spi();
    assert_ne!(spi, 0);

    init.abort();
    let mut next = Message::new(ExchangeType::CreateChildSa, true);
    assert_eq!(init.build(&mut a.ike, &mut next), TaskStatus::Success);
    assert_eq!(next.exchange, Some(ExchangeType::Informational));
    let delete = next
        .payloads
        .iter()
        .find_map(|p| match p {
            Payload::Delete(d) => Some(d),
            _ => None,
        })
        .unwrap();
    assert_eq!(delete.spis, vec![spi]);
    assert_eq!(delete.protocol, SecurityProtocol::EncapsulatingSecurityPayload);
}
