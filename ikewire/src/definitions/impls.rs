use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use crate::definitions::params::KeyExchangeMethod;
use crate::definitions::params::NotifyError;
use crate::definitions::params::NotifyStatus;
use crate::definitions::params::PayloadType;
use crate::definitions::params::SecurityProtocol;
use crate::definitions::params::TransformType;
use crate::definitions::params::TsType;
use crate::definitions::params::NOTIFY_STATUS_FLOOR;
use crate::definitions::Notification;
use crate::definitions::NotifyType;
use crate::definitions::Payload;
use crate::definitions::Proposal;
use crate::definitions::SecurityAssociation;
use crate::definitions::TrafficSelector;
use crate::definitions::Transform;
use crate::definitions::ADDITIONAL_KEY_EXCHANGES;
use crate::definitions::SELECT_PREFER_SUPPLIED;
use crate::definitions::SELECT_SKIP_KE;
use crate::definitions::SELECT_SKIP_PRIVATE;

impl Proposal {
    /// Easily construct a new empty [Proposal] with the supplied protocol and SPI
    pub fn new_empty(protocol: SecurityProtocol, spi: Option<u32>) -> Self {
        Self {
            protocol,
            spi,
            ..Default::default()
        }
    }

    /// Return the length of the [Proposal] as sum of the number of all its transforms
    pub fn len(&self) -> usize {
        self.encryption_algorithms.len()
            + self.integrity_algorithms.len()
            + self.key_exchange_methods.len()
            + self
                .additional_key_exchanges
                .iter()
                .map(Vec::len)
                .sum::<usize>()
            + self.sequence_numbers.len()
    }

    /// Check whether the [Proposal] has no transforms at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a number of transforms to the [Proposal], grouping by the correct
    /// transform type; additional key exchanges with a slot outside 1..=7
    /// are dropped
    pub fn add(&mut self, transforms: Vec<Transform>) {
        for transform in transforms {
            match transform {
                Transform::Encryption(a, k) => self.encryption_algorithms.push((a, k)),
                Transform::Integrity(i) => self.integrity_algorithms.push(i),
                Transform::KeyExchange(m) => self.key_exchange_methods.push(m),
                Transform::AdditionalKeyExchange(slot, m) => {
                    if (1..=ADDITIONAL_KEY_EXCHANGES as u8).contains(&slot) {
                        self.additional_key_exchanges[slot as usize - 1].push(m);
                    }
                }
                Transform::SequenceNumbers(s) => self.sequence_numbers.push(s),
            }
        }
    }

    /// Replace the SPI of the proposal
    pub fn set_spi(&mut self, spi: u32) {
        self.spi = Some(spi);
    }

    /// Compare protocol and all transform groups, ignoring the SPIs
    pub fn equals_transforms(&self, other: &Self) -> bool {
        self.protocol == other.protocol
            && self.encryption_algorithms == other.encryption_algorithms
            && self.integrity_algorithms == other.integrity_algorithms
            && self.key_exchange_methods == other.key_exchange_methods
            && self.additional_key_exchanges == other.additional_key_exchanges
            && self.sequence_numbers == other.sequence_numbers
    }

    /// The most preferred primary key exchange method, if any is offered
    pub fn first_ke_method(&self) -> Option<KeyExchangeMethod> {
        self.key_exchange_methods.first().copied()
    }

    /// Whether the proposal offers a primary key exchange at all
    pub fn has_ke(&self) -> bool {
        !self.key_exchange_methods.is_empty()
    }

    /// Whether the proposal carries the given transform
    pub fn has_transform(&self, ttype: TransformType, id: u16) -> bool {
        match ttype {
            TransformType::EncryptionAlgorithm => self
                .encryption_algorithms
                .iter()
                .any(|(a, _)| *a as u16 == id),
            TransformType::IntegrityAlgorithm => {
                self.integrity_algorithms.iter().any(|a| *a as u16 == id)
            }
            TransformType::KeyExchangeMethod => {
                self.key_exchange_methods.iter().any(|m| *m as u16 == id)
            }
            TransformType::SequenceNumbers => {
                self.sequence_numbers.iter().any(|s| *s as u16 == id)
            }
            other => match other.additional_index() {
                Some(i) => self.additional_key_exchanges[i - 1]
                    .iter()
                    .any(|m| *m as u16 == id),
                None => false,
            },
        }
    }

    /// Move the transform with the given type and ID to the front of its
    /// group, making it the most preferred one. Returns false if the
    /// proposal does not offer that transform.
    pub fn promote_transform(&mut self, ttype: TransformType, id: u16) -> bool {
        fn promote<T: Copy>(group: &mut Vec<T>, matches: impl Fn(&T) -> bool) -> bool {
            match group.iter().position(matches) {
                Some(pos) => {
                    let transform = group.remove(pos);
                    group.insert(0, transform);
                    true
                }
                None => false,
            }
        }
        match ttype {
            TransformType::EncryptionAlgorithm => {
                promote(&mut self.encryption_algorithms, |(a, _)| *a as u16 == id)
            }
            TransformType::IntegrityAlgorithm => {
                promote(&mut self.integrity_algorithms, |a| *a as u16 == id)
            }
            TransformType::KeyExchangeMethod => {
                promote(&mut self.key_exchange_methods, |m| *m as u16 == id)
            }
            TransformType::SequenceNumbers => {
                promote(&mut self.sequence_numbers, |s| *s as u16 == id)
            }
            other => match other.additional_index() {
                Some(i) => promote(&mut self.additional_key_exchanges[i - 1], |m| {
                    *m as u16 == id
                }),
                None => false,
            },
        }
    }

    /// Intersect this (configured) proposal with a supplied peer proposal
    ///
    /// On a match, the result contains exactly one transform per offered
    /// group and carries the supplied proposal's SPI. The configured
    /// preference order decides unless [SELECT_PREFER_SUPPLIED] is set.
    /// [SELECT_SKIP_KE] drops the key exchange groups from consideration,
    /// [SELECT_SKIP_PRIVATE] hides private-use methods from the
    /// intersection.
    pub fn select(&self, supplied: &Proposal, flags: u8) -> Option<Proposal> {
        if self.protocol != supplied.protocol {
            return None;
        }
        let prefer_supplied = flags & SELECT_PREFER_SUPPLIED != 0;
        let skip_private = flags & SELECT_SKIP_PRIVATE != 0;
        let mut selected = Proposal::new_empty(self.protocol, supplied.spi);

        match pick(
            &self.encryption_algorithms,
            &supplied.encryption_algorithms,
            prefer_supplied,
            |_| false,
        ) {
            Ok(Some(e)) => selected.encryption_algorithms.push(e),
            Ok(None) => {}
            Err(()) => return None,
        }
        match pick(
            &self.integrity_algorithms,
            &supplied.integrity_algorithms,
            prefer_supplied,
            |_| false,
        ) {
            Ok(Some(i)) => selected.integrity_algorithms.push(i),
            Ok(None) => {}
            Err(()) => return None,
        }
        if flags & SELECT_SKIP_KE == 0 {
            let hidden = |m: &KeyExchangeMethod| skip_private && m.is_private();
            match pick(
                &self.key_exchange_methods,
                &supplied.key_exchange_methods,
                prefer_supplied,
                hidden,
            ) {
                Ok(Some(m)) => selected.key_exchange_methods.push(m),
                Ok(None) => {}
                Err(()) => return None,
            }
            for slot in 0..ADDITIONAL_KEY_EXCHANGES {
                match pick(
                    &self.additional_key_exchanges[slot],
                    &supplied.additional_key_exchanges[slot],
                    prefer_supplied,
                    hidden,
                ) {
                    Ok(Some(m)) => selected.additional_key_exchanges[slot].push(m),
                    Ok(None) => {}
                    Err(()) => return None,
                }
            }
        }
        match pick(
            &self.sequence_numbers,
            &supplied.sequence_numbers,
            prefer_supplied,
            |_| false,
        ) {
            Ok(Some(s)) => selected.sequence_numbers.push(s),
            Ok(None) => {}
            Err(()) => return None,
        }
        Some(selected)
    }
}

/// Pick the first transform present on both sides, honoring the preference
/// order of one side. `Ok(None)` means the group is absent on both sides,
/// `Err` that the sides cannot agree on it.
fn pick<T: Copy + PartialEq>(
    configured: &[T],
    supplied: &[T],
    prefer_supplied: bool,
    hidden: impl Fn(&T) -> bool,
) -> Result<Option<T>, ()> {
    let cfg: Vec<T> = configured.iter().copied().filter(|t| !hidden(t)).collect();
    let sup: Vec<T> = supplied.iter().copied().filter(|t| !hidden(t)).collect();
    if cfg.is_empty() && sup.is_empty() {
        return Ok(None);
    }
    let (preferred, other) = if prefer_supplied {
        (&sup, &cfg)
    } else {
        (&cfg, &sup)
    };
    for transform in preferred {
        if other.contains(transform) {
            return Ok(Some(*transform));
        }
    }
    Err(())
}

impl SecurityAssociation {
    /// Select a proposal from this (received) SA against the configured
    /// proposal list; see [Proposal::select] for the flag semantics
    pub fn select(&self, configured: &[Proposal], flags: u8) -> Option<Proposal> {
        if flags & SELECT_PREFER_SUPPLIED != 0 {
            for supplied in &self.proposals {
                for cfg in configured {
                    if let Some(p) = cfg.select(supplied, flags) {
                        return Some(p);
                    }
                }
            }
        } else {
            for cfg in configured {
                for supplied in &self.proposals {
                    if let Some(p) = cfg.select(supplied, flags) {
                        return Some(p);
                    }
                }
            }
        }
        None
    }
}

fn ts_type_of(addr: &IpAddr) -> TsType {
    match addr {
        IpAddr::V4(_) => TsType::Ipv4AddrRange,
        IpAddr::V6(_) => TsType::Ipv6AddrRange,
    }
}

fn addr_key(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn key_addr(v4: bool, key: u128) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(key as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(key))
    }
}

impl TrafficSelector {
    /// Selector covering a whole subnet given as address and prefix length
    pub fn from_subnet(addr: IpAddr, prefix: u8, protocol: u8, start_port: u16, end_port: u16) -> Self {
        let (start, end) = match addr {
            IpAddr::V4(v4) => {
                let base = u32::from(v4);
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix.min(32)) };
                (
                    IpAddr::V4(Ipv4Addr::from(base & mask)),
                    IpAddr::V4(Ipv4Addr::from(base | !mask)),
                )
            }
            IpAddr::V6(v6) => {
                let base = u128::from(v6);
                let mask = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefix.min(128) as u32)
                };
                (
                    IpAddr::V6(Ipv6Addr::from(base & mask)),
                    IpAddr::V6(Ipv6Addr::from(base | !mask)),
                )
            }
        };
        Self {
            ts_type: ts_type_of(&addr),
            protocol,
            start_port,
            end_port,
            start_addr: start,
            end_addr: end,
        }
    }

    /// Selector matching exactly one address; a port of zero matches any port
    pub fn host(addr: IpAddr, protocol: u8, port: u16) -> Self {
        let (start_port, end_port) = if port == 0 { (0, u16::MAX) } else { (port, port) };
        Self {
            ts_type: ts_type_of(&addr),
            protocol,
            start_port,
            end_port,
            start_addr: addr,
            end_addr: addr,
        }
    }

    /// Selector over an explicit address range; both addresses must belong
    /// to the same family
    pub fn range(
        start_addr: IpAddr,
        end_addr: IpAddr,
        protocol: u8,
        start_port: u16,
        end_port: u16,
    ) -> Self {
        Self {
            ts_type: ts_type_of(&start_addr),
            protocol,
            start_port,
            end_port,
            start_addr,
            end_addr,
        }
    }

    /// Whether the selector matches exactly one address, and that address
    /// is `host` if one is given
    pub fn is_host(&self, host: Option<IpAddr>) -> bool {
        self.start_addr == self.end_addr
            && match host {
                None => true,
                Some(h) => h == self.start_addr,
            }
    }

    /// The lowest CIDR subnet enclosing the address range
    pub fn to_subnet(&self) -> (IpAddr, u8) {
        match (self.start_addr, self.end_addr) {
            (IpAddr::V4(s), IpAddr::V4(e)) => {
                let (s, e) = (u32::from(s), u32::from(e));
                let prefix = (s ^ e).leading_zeros().min(32) as u8;
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                (IpAddr::V4(Ipv4Addr::from(s & mask)), prefix)
            }
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                let (s, e) = (u128::from(s), u128::from(e));
                let prefix = (s ^ e).leading_zeros().min(128) as u8;
                let mask = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefix as u32)
                };
                (IpAddr::V6(Ipv6Addr::from(s & mask)), prefix)
            }
            (s, _) => (s, 0),
        }
    }

    /// Collapse the selector to the single given address, keeping the
    /// protocol and port range
    pub fn set_address(&mut self, addr: IpAddr) {
        self.ts_type = ts_type_of(&addr);
        self.start_addr = addr;
        self.end_addr = addr;
    }

    /// Whether this selector fully covers the other
    pub fn contains(&self, other: &Self) -> bool {
        self.ts_type == other.ts_type
            && (self.protocol == 0 || self.protocol == other.protocol)
            && self.start_port <= other.start_port
            && self.end_port >= other.end_port
            && addr_key(&self.start_addr) <= addr_key(&other.start_addr)
            && addr_key(&self.end_addr) >= addr_key(&other.end_addr)
    }

    /// The largest selector covered by both inputs, or `None` when the
    /// protocols conflict or the port or address ranges do not overlap
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        if self.ts_type != other.ts_type {
            return None;
        }
        let protocol = match (self.protocol, other.protocol) {
            (0, p) | (p, 0) => p,
            (a, b) if a == b => a,
            _ => return None,
        };
        let start_port = self.start_port.max(other.start_port);
        let end_port = self.end_port.min(other.end_port);
        if start_port > end_port {
            return None;
        }
        let start = addr_key(&self.start_addr).max(addr_key(&other.start_addr));
        let end = addr_key(&self.end_addr).min(addr_key(&other.end_addr));
        if start > end {
            return None;
        }
        let v4 = self.ts_type == TsType::Ipv4AddrRange;
        Some(Self {
            ts_type: self.ts_type,
            protocol,
            start_port,
            end_port,
            start_addr: key_addr(v4, start),
            end_addr: key_addr(v4, end),
        })
    }
}

impl NotifyType {
    /// The raw notify message type value
    pub fn value(&self) -> u16 {
        match self {
            NotifyType::Error(e) => *e as u16,
            NotifyType::Status(s) => *s as u16,
            NotifyType::UnknownError(v) | NotifyType::UnknownStatus(v) => *v,
        }
    }

    /// Classify a raw notify message type value
    pub fn from_value(value: u16) -> Self {
        if value < NOTIFY_STATUS_FLOOR {
            match NotifyError::try_from(value) {
                Ok(e) => NotifyType::Error(e),
                Err(_) => NotifyType::UnknownError(value),
            }
        } else {
            match NotifyStatus::try_from(value) {
                Ok(s) => NotifyType::Status(s),
                Err(_) => NotifyType::UnknownStatus(value),
            }
        }
    }

    /// Whether the type falls into the error region of the registry
    pub fn is_error(&self) -> bool {
        self.value() < NOTIFY_STATUS_FLOOR
    }
}

impl Notification {
    /// A plain error notification without SPI or data
    pub fn error(error: NotifyError) -> Self {
        Self {
            variant: NotifyType::Error(error),
            protocol: SecurityProtocol::Reserved,
            spi: None,
            data: vec![],
        }
    }

    /// A plain status notification without SPI or data
    pub fn status(status: NotifyStatus) -> Self {
        Self {
            variant: NotifyType::Status(status),
            protocol: SecurityProtocol::Reserved,
            spi: None,
            data: vec![],
        }
    }

    /// Attach notification data
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Scope the notification to an SA via protocol and SPI
    pub fn with_spi(mut self, protocol: SecurityProtocol, spi: u32) -> Self {
        self.protocol = protocol;
        self.spi = Some(spi);
        self
    }
}

impl Payload {
    /// The wire payload type of this payload
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::SecurityAssociation(_) => PayloadType::SecurityAssociation,
            Payload::KeyExchange(_) => PayloadType::KeyExchange,
            Payload::Nonce(_) => PayloadType::Nonce,
            Payload::TrafficSelectorInitiator(_) => PayloadType::TrafficSelectorInitiator,
            Payload::TrafficSelectorResponder(_) => PayloadType::TrafficSelectorResponder,
            Payload::Notify(_) => PayloadType::Notify,
            Payload::Delete(_) => PayloadType::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::net::Ipv4Addr;

    use crate::definitions::params::EncryptionAlgorithm;
    use crate::definitions::params::IntegrityAlgorithm;
    use crate::definitions::params::KeyExchangeMethod;
    use crate::definitions::params::SecurityProtocol;
    use crate::definitions::params::TransformType;
    use crate::definitions::Proposal;
    use crate::definitions::SecurityAssociation;
    use crate::definitions::TrafficSelector;
    use crate::definitions::Transform;
    use crate::definitions::SELECT_PREFER_SUPPLIED;
    use crate::definitions::SELECT_SKIP_KE;
    use crate::definitions::SELECT_SKIP_PRIVATE;

    fn esp_proposal(ke: &[KeyExchangeMethod]) -> Proposal {
        let mut p = Proposal::new_empty(SecurityProtocol::EncapsulatingSecurityPayload, None);
        p.add(vec![
            Transform::Encryption(EncryptionAlgorithm::AesCbc, Some(128)),
            Transform::Integrity(IntegrityAlgorithm::HmacSha2_256_128),
        ]);
        p.add(ke.iter().map(|m| Transform::KeyExchange(*m)).collect());
        p
    }

    #[test]
    fn promote_moves_to_front() {
        let mut p = esp_proposal(&[KeyExchangeMethod::ModP3072, KeyExchangeMethod::EcP256]);
        assert!(p.promote_transform(
            TransformType::KeyExchangeMethod,
            KeyExchangeMethod::EcP256 as u16
        ));
        assert_eq!(p.first_ke_method(), Some(KeyExchangeMethod::EcP256));
        assert!(!p.promote_transform(
            TransformType::KeyExchangeMethod,
            KeyExchangeMethod::Curve448 as u16
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn select_prefers_configured_by_default() {
        let cfg = esp_proposal(&[KeyExchangeMethod::ModP3072, KeyExchangeMethod::EcP256]);
        let sup = esp_proposal(&[KeyExchangeMethod::EcP256, KeyExchangeMethod::ModP3072]);
        let sa = SecurityAssociation {
            proposals: vec![sup.clone()],
        };
        let selected = sa.select(&[cfg.clone()], 0).unwrap();
        assert_eq!(selected.first_ke_method(), Some(KeyExchangeMethod::ModP3072));
        let selected = sa.select(&[cfg], SELECT_PREFER_SUPPLIED).unwrap();
        assert_eq!(selected.first_ke_method(), Some(KeyExchangeMethod::EcP256));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn select_skips_ke_and_private() {
        let cfg = esp_proposal(&[KeyExchangeMethod::ModPNull]);
        let sup = esp_proposal(&[KeyExchangeMethod::ModPNull]);
        let sa = SecurityAssociation {
            proposals: vec![sup],
        };
        // with private methods hidden both KE groups collapse to nothing in common
        assert!(sa.select(&[cfg.clone()], SELECT_SKIP_PRIVATE).is_none());
        // skipping KE entirely still yields the symmetric ciphers
        let selected = sa.select(&[cfg], SELECT_SKIP_KE).unwrap();
        assert!(!selected.has_ke());
        assert_eq!(selected.encryption_algorithms.len(), 1);
    }

    #[test]
    fn select_mismatch_fails() {
        let cfg = esp_proposal(&[KeyExchangeMethod::ModP3072]);
        let sup = esp_proposal(&[KeyExchangeMethod::Curve25519]);
        let sa = SecurityAssociation {
            proposals: vec![sup],
        };
        assert!(sa.select(&[cfg], 0).is_none());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn intersect_and_subnet() {
        let a = TrafficSelector::from_subnet(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 0)), 16, 0, 0, 65535);
        let b = TrafficSelector::from_subnet(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 0)), 24, 17, 0, 65535);
        let i = a.intersect(&b).unwrap();
        assert_eq!(i.protocol, 17);
        assert_eq!(i.start_addr, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 0)));
        assert_eq!(i.end_addr, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 255)));
        assert_eq!(i.to_subnet(), (IpAddr::V4(Ipv4Addr::new(10, 1, 2, 0)), 24));

        let host = TrafficSelector::host(IpAddr::V4(Ipv4Addr::new(10, 2, 0, 1)), 0, 0);
        assert!(a.intersect(&host).is_none());
        assert!(host.is_host(Some(IpAddr::V4(Ipv4Addr::new(10, 2, 0, 1)))));
        assert!(!host.is_host(Some(IpAddr::V4(Ipv4Addr::new(10, 2, 0, 2)))));
    }

    #[test]
    fn set_address_keeps_ports() {
        let mut ts = TrafficSelector::from_subnet(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)),
            24,
            6,
            8080,
            8080,
        );
        ts.set_address(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
        assert!(ts.is_host(Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)))));
        assert_eq!((ts.start_port, ts.end_port, ts.protocol), (8080, 8080, 6));
    }
}
