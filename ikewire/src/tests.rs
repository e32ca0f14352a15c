use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use crate::definitions::params::EncryptionAlgorithm;
use crate::definitions::params::IntegrityAlgorithm;
use crate::definitions::params::KeyExchangeMethod;
use crate::definitions::params::NotifyError;
use crate::definitions::params::NotifyStatus;
use crate::definitions::params::PayloadType;
use crate::definitions::params::SecurityProtocol;
use crate::definitions::params::SequenceNumbers;
use crate::definitions::Delete;
use crate::definitions::KeyExchangePayload;
use crate::definitions::Notification;
use crate::definitions::Payload;
use crate::definitions::Proposal;
use crate::definitions::SecurityAssociation;
use crate::definitions::TrafficSelector;
use crate::definitions::Transform;
use crate::definitions::TsPayload;
use crate::generator::build_payloads;
use crate::parser::parse_payloads;

fn hybrid_esp_proposal() -> Proposal {
    let mut p = Proposal::new_empty(
        SecurityProtocol::EncapsulatingSecurityPayload,
        Some(0xc0fe1337),
    );
    p.add(vec![
        Transform::Encryption(EncryptionAlgorithm::AesGcm16, Some(256)),
        Transform::Integrity(IntegrityAlgorithm::HmacSha2_256_128),
        Transform::KeyExchange(KeyExchangeMethod::Curve25519),
        Transform::AdditionalKeyExchange(1, KeyExchangeMethod::MlKem768),
        Transform::SequenceNumbers(SequenceNumbers::None),
    ]);
    p
}

#[test]
#[allow(clippy::unwrap_used)]
fn generate_and_parse_sa() {
    let sa = SecurityAssociation {
        proposals: vec![hybrid_esp_proposal()],
    };
    let generated = sa.try_build(PayloadType::NoNextPayload).unwrap();
    let parsed = SecurityAssociation::try_parse(&generated[4..]).unwrap();
    assert_eq!(sa, parsed);
}

#[test]
#[allow(clippy::unwrap_used)]
fn generate_and_parse_sa_with_many_proposals() {
    let mut sa = SecurityAssociation { proposals: vec![] };
    for i in 0..100u32 {
        sa.proposals.push(Proposal::new_empty(
            SecurityProtocol::EncapsulatingSecurityPayload,
            Some(i + 1),
        ));
    }
    let generated = sa.try_build(PayloadType::NoNextPayload).unwrap();
    let parsed = SecurityAssociation::try_parse(&generated[4..]).unwrap();
    assert_eq!(sa, parsed);
    for (i, proposal) in parsed.proposals.iter().enumerate() {
        assert_eq!(proposal.spi, Some(i as u32 + 1));
    }
}

#[test]
#[allow(clippy::unwrap_used)]
fn generate_and_parse_payload_chain() {
    let nonce = vec![0x13; 32];
    let payloads = vec![
        Payload::SecurityAssociation(SecurityAssociation {
            proposals: vec![hybrid_esp_proposal()],
        }),
        Payload::Nonce(nonce.clone()),
        Payload::KeyExchange(KeyExchangePayload {
            method: KeyExchangeMethod::Curve25519,
            data: vec![0x42; 32],
        }),
        Payload::TrafficSelectorInitiator(TsPayload {
            selectors: vec![TrafficSelector::from_subnet(
                IpAddr::V4(Ipv4Addr::new(10, 1, 0, 0)),
                16,
                0,
                0,
                65535,
            )],
            label: None,
        }),
        Payload::TrafficSelectorResponder(TsPayload {
            selectors: vec![TrafficSelector::from_subnet(
                IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0)),
                64,
                0,
                0,
                65535,
            )],
            label: Some(b"system_u:object_r:ipsec_spd_t:s0".to_vec()),
        }),
        Payload::Notify(
            Notification::status(NotifyStatus::AdditionalKeyExchange).with_data(vec![0x42]),
        ),
        Payload::Delete(Delete {
            protocol: SecurityProtocol::EncapsulatingSecurityPayload,
            spis: vec![1, 2, 3],
        }),
    ];
    let (first, buf) = build_payloads(&payloads).unwrap();
    assert_eq!(first, PayloadType::SecurityAssociation);
    let parsed = parse_payloads(first, &buf).unwrap();
    assert_eq!(payloads, parsed);
}

#[test]
#[allow(clippy::unwrap_used)]
fn notify_known_bytes() {
    let notify = Notification::error(NotifyError::TemporaryFailure);
    let built = notify.build(PayloadType::NoNextPayload);
    assert_eq!(built, vec![0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x2b]);
    let parsed = Notification::try_parse(&built[4..]).unwrap();
    assert_eq!(notify, parsed);
}

#[test]
#[allow(clippy::unwrap_used)]
fn empty_chain() {
    let (first, buf) = build_payloads(&[]).unwrap();
    assert_eq!(first, PayloadType::NoNextPayload);
    assert!(buf.is_empty());
    assert!(parse_payloads(first, &buf).unwrap().is_empty());
}
