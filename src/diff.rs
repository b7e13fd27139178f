//! Material comparison of peer records.

use crate::types::PeerNode;

/// Reports whether `candidate` differs materially from `existing`.
///
/// Name, address and the sorted pod ranges are compared. The tunnel name is
/// derived state and never takes part.
pub fn has_updates(candidate: Option<&PeerNode>, existing: Option<&PeerNode>) -> bool {
    let (candidate, existing) = match (candidate, existing) {
        (None, None) => return false,
        (Some(c), Some(e)) => (c, e),
        _ => return true,
    };
    if candidate.name != existing.name {
        return true;
    }
    // v4-mapped v6 addresses compare equal to their v4 form.
    if candidate.ip.to_canonical() != existing.ip.to_canonical() {
        return true;
    }
    if candidate.pod_cidrs.len() != existing.pod_cidrs.len() {
        return true;
    }
    candidate
        .pod_cidrs
        .iter()
        .zip(&existing.pod_cidrs)
        .any(|(a, b)| a.to_string() != b.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_cidrs;

    fn peer(name: &str, ip: &str, cidrs: &[&str], tunnel: &str) -> PeerNode {
        PeerNode {
            name: name.into(),
            ip: ip.parse().unwrap(),
            pod_cidrs: parse_cidrs(cidrs.iter().copied()).unwrap(),
            tunnel: tunnel.into(),
        }
    }

    #[test]
    fn both_absent_is_no_update() {
        assert!(!has_updates(None, None));
    }

    #[test]
    fn one_side_absent_is_update() {
        let a = peer("w1", "10.0.0.5", &["10.1.0.0/24"], "cni.1");
        assert!(has_updates(Some(&a), None));
        assert!(has_updates(None, Some(&a)));
    }

    #[test]
    fn tunnel_is_ignored() {
        let a = peer("w1", "10.0.0.5", &["10.1.0.0/24"], "cni.1");
        let b = peer("w1", "10.0.0.5", &["10.1.0.0/24"], "cni.2");
        assert!(!has_updates(Some(&a), Some(&b)));
    }

    #[test]
    fn name_ip_and_cidrs_are_compared() {
        let base = peer("w1", "10.0.0.5", &["10.1.0.0/24"], "cni.1");
        let renamed = peer("w2", "10.0.0.5", &["10.1.0.0/24"], "cni.1");
        let moved = peer("w1", "10.0.0.6", &["10.1.0.0/24"], "cni.1");
        let grown = peer("w1", "10.0.0.5", &["10.1.0.0/24", "10.1.1.0/24"], "cni.1");
        let shifted = peer("w1", "10.0.0.5", &["10.1.1.0/24"], "cni.1");
        for other in [&renamed, &moved, &grown, &shifted] {
            assert!(has_updates(Some(other), Some(&base)), "{other:?}");
        }
    }

    #[test]
    fn mapped_address_equals_v4() {
        let a = peer("w1", "10.0.0.5", &[], "cni.1");
        let b = peer("w1", "::ffff:10.0.0.5", &[], "cni.1");
        assert!(!has_updates(Some(&a), Some(&b)));
    }
}
