//! Traffic selector narrowing against local policy and hosts

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use ikewire::definitions::TrafficSelector;
use itertools::Itertools;
use thiserror::Error;

use crate::host::Host;

/// Failure while rewriting traffic selectors for NAT transport mode
#[derive(Debug, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SubstituteError {
    #[error("Selector list is empty")]
    Empty,
    #[error("Not all selectors name the same single host address")]
    NotASingleHost,
}

/// Resolve traffic selector templates against the dynamic hosts
///
/// Concrete templates are used as they are. An empty template list stands
/// for the dynamic side: it resolves to one single-host selector per host,
/// or to the full address ranges of both families when `wildcard` is set
/// (virtual IPs are expected but not assigned yet, so the peer is asked to
/// narrow).
pub fn compose_ts(
    templates: &[TrafficSelector],
    hosts: &[IpAddr],
    wildcard: bool,
) -> Vec<TrafficSelector> {
    if !templates.is_empty() {
        return templates.to_vec();
    }
    if wildcard {
        return vec![
            TrafficSelector::from_subnet(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0, 0, u16::MAX),
            TrafficSelector::from_subnet(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0, 0, 0, u16::MAX),
        ];
    }
    hosts
        .iter()
        .map(|addr| TrafficSelector::host(*addr, 0, 0))
        .collect()
}

/// Intersect the peer's offered selectors with the local templates
///
/// The offered order is kept as the preference order of the result.
/// Selectors already covered by an earlier result are dropped, which also
/// makes the operation idempotent in its first argument.
pub fn narrow(offered: &[TrafficSelector], templates: &[TrafficSelector]) -> Vec<TrafficSelector> {
    let mut intersected: Vec<TrafficSelector> = Vec::new();
    for (offer, template) in offered.iter().cartesian_product(templates.iter()) {
        if let Some(ts) = offer.intersect(template) {
            if !intersected.contains(&ts) {
                intersected.push(ts);
            }
        }
    }
    let covered: Vec<bool> = intersected
        .iter()
        .enumerate()
        .map(|(i, ts)| {
            intersected
                .iter()
                .enumerate()
                .any(|(j, other)| i != j && other.contains(ts))
        })
        .collect();
    intersected
        .into_iter()
        .zip(covered)
        .filter_map(|(ts, covered)| (!covered).then_some(ts))
        .collect()
}

/// Rewrite peer selectors for NAT'ed transport mode
///
/// All selectors must name the same single host address (the peer behind
/// the NAT); that address is replaced with the IKE endpoint seen on the
/// outside, keeping ports and protocols. The caller feeds the result into
/// narrowing only and keeps the original list for mismatch reporting.
pub fn substitute_host(
    selectors: &[TrafficSelector],
    host: &Host,
) -> Result<Vec<TrafficSelector>, SubstituteError> {
    let first = selectors.first().ok_or(SubstituteError::Empty)?;
    if !first.is_host(None) {
        return Err(SubstituteError::NotASingleHost);
    }
    let original = first.start_addr;
    let mut rewritten = Vec::with_capacity(selectors.len());
    for selector in selectors {
        if !selector.is_host(Some(original)) {
            return Err(SubstituteError::NotASingleHost);
        }
        let mut ts = selector.clone();
        ts.set_address(host.addr);
        rewritten.push(ts);
    }
    Ok(rewritten)
}

/// Whether TRANSPORT mode is acceptable for the narrowed selector pair:
/// either proxy mode is allowed, or every selector names exactly the
/// corresponding IKE endpoint
pub fn accept_transport(
    my_ts: &[TrafficSelector],
    other_ts: &[TrafficSelector],
    me: &Host,
    other: &Host,
    proxy_mode: bool,
) -> bool {
    if proxy_mode {
        return !my_ts.is_empty() && !other_ts.is_empty();
    }
    !my_ts.is_empty()
        && !other_ts.is_empty()
        && my_ts.iter().all(|ts| ts.is_host(Some(me.addr)))
        && other_ts.iter().all(|ts| ts.is_host(Some(other.addr)))
}

/// Whether BEET mode is acceptable: every selector on both sides must be a
/// single-host selector
pub fn accept_beet(my_ts: &[TrafficSelector], other_ts: &[TrafficSelector]) -> bool {
    !my_ts.is_empty()
        && !other_ts.is_empty()
        && my_ts.iter().all(|ts| ts.is_host(None))
        && other_ts.iter().all(|ts| ts.is_host(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn narrow_prefers_offered_order() {
        let offered = vec![
            TrafficSelector::from_subnet(v4(10, 1, 2, 0), 24, 0, 0, 65535),
            TrafficSelector::from_subnet(v4(10, 1, 0, 0), 16, 0, 0, 65535),
        ];
        let templates = vec![TrafficSelector::from_subnet(v4(10, 1, 0, 0), 16, 0, 0, 65535)];
        let narrowed = narrow(&offered, &templates);
        // the /24 is covered by the /16 that also survives
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0], templates[0]);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn narrow_is_idempotent() {
        let offered = vec![TrafficSelector::range(
            v4(10, 0, 0, 0),
            v4(10, 0, 0, 10),
            0,
            0,
            65535,
        )];
        let templates = vec![
            TrafficSelector::range(v4(10, 0, 0, 0), v4(10, 0, 0, 5), 0, 0, 65535),
            TrafficSelector::range(v4(10, 0, 0, 3), v4(10, 0, 0, 8), 0, 0, 65535),
        ];
        let once = narrow(&offered, &templates);
        let twice = narrow(&once, &templates);
        assert_eq!(once, twice);
    }

    #[test]
    fn narrow_empty_when_disjoint() {
        let offered = vec![TrafficSelector::from_subnet(v4(10, 1, 0, 0), 16, 0, 0, 65535)];
        let templates = vec![TrafficSelector::from_subnet(v4(10, 2, 0, 0), 16, 0, 0, 65535)];
        assert!(narrow(&offered, &templates).is_empty());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn substitution_commutes_with_narrowing_for_single_hosts() {
        let nat_inside = v4(192, 168, 1, 7);
        let outside = Host::new(v4(203, 0, 113, 7), 4500);
        let offered = vec![
            TrafficSelector::host(nat_inside, 17, 500),
            TrafficSelector::host(nat_inside, 17, 4500),
        ];
        let templates = vec![TrafficSelector::host(nat_inside, 0, 0)];

        let narrow_then_sub =
            substitute_host(&narrow(&offered, &templates), &outside).unwrap();
        let sub_then_narrow = narrow(
            &substitute_host(&offered, &outside).unwrap(),
            &substitute_host(&templates, &outside).unwrap(),
        );
        assert_eq!(narrow_then_sub, sub_then_narrow);
        assert_eq!(sub_then_narrow.len(), 2);
        assert!(sub_then_narrow.iter().all(|ts| ts.is_host(Some(outside.addr))));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn substitution_rejects_mixed_hosts() {
        let outside = Host::new(v4(203, 0, 113, 7), 4500);
        let offered = vec![
            TrafficSelector::host(v4(192, 168, 1, 7), 0, 0),
            TrafficSelector::host(v4(192, 168, 1, 8), 0, 0),
        ];
        assert_eq!(
            substitute_host(&offered, &outside),
            Err(SubstituteError::NotASingleHost)
        );
        assert_eq!(substitute_host(&[], &outside), Err(SubstituteError::Empty));
    }

    #[test]
    fn transport_acceptance() {
        let me = Host::new(v4(198, 51, 100, 1), 500);
        let other = Host::new(v4(203, 0, 113, 1), 500);
        let mine = vec![TrafficSelector::host(me.addr, 0, 0)];
        let theirs = vec![TrafficSelector::host(other.addr, 0, 0)];
        assert!(accept_transport(&mine, &theirs, &me, &other, false));

        let subnet = vec![TrafficSelector::from_subnet(v4(10, 0, 0, 0), 8, 0, 0, 65535)];
        assert!(!accept_transport(&subnet, &theirs, &me, &other, false));
        // proxy mode is host-agnostic
        assert!(accept_transport(&subnet, &theirs, &me, &other, true));
    }
}
