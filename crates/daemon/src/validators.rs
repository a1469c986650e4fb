//! Validator registry (C6, §4.6).
//!
//! Caches the last-known validator list pushed by the upstream neuron
//! (`tpn-daemon::neuron`), with a hard-coded fallback for bootstrap.
//! `0.0.0.0` entries are patched from the fallback; testnet entries (`uid:
//! None`) are retained for [`ValidatorRegistry::is_validator`] but excluded
//! from [`ValidatorRegistry::validator_count`].

use parking_lot::RwLock;
use std::net::IpAddr;
use tpn_common::ValidatorDescriptor;

/// Bootstrap validator set used when the neuron-published list is empty or
/// stale (§9 Design Notes "Fallback validators").
fn fallback_validators() -> Vec<ValidatorDescriptor> {
    vec![
        ValidatorDescriptor {
            uid: None,
            ip: "198.51.100.1".parse().unwrap(),
        },
        ValidatorDescriptor {
            uid: None,
            ip: "198.51.100.2".parse().unwrap(),
        },
    ]
}

const UNSET_IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);

pub struct ValidatorRegistry {
    validators: RwLock<Vec<ValidatorDescriptor>>,
    fallback: Vec<ValidatorDescriptor>,
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        let fallback = fallback_validators();
        Self {
            validators: RwLock::new(fallback.clone()),
            fallback,
        }
    }

    pub fn with_fallback(fallback: Vec<ValidatorDescriptor>) -> Self {
        Self {
            validators: RwLock::new(fallback.clone()),
            fallback,
        }
    }

    /// Replace the cached list (pushed by the neuron, §1). Any entry whose
    /// `ip` is `0.0.0.0` is patched from the fallback list by position,
    /// falling back to leaving it as-is if the fallback is shorter.
    pub fn update(&self, mut incoming: Vec<ValidatorDescriptor>) {
        for (i, entry) in incoming.iter_mut().enumerate() {
            if entry.ip == UNSET_IP {
                if let Some(patch) = self.fallback.get(i) {
                    entry.ip = patch.ip;
                }
            }
        }
        *self.validators.write() = incoming;
    }

    pub fn validator_ips(&self) -> Vec<IpAddr> {
        self.validators.read().iter().map(|v| v.ip).collect()
    }

    /// Mainnet validators only (§4.6: testnet null-uid entries excluded).
    pub fn validator_count(&self) -> usize {
        self.validators.read().iter().filter(|v| v.is_mainnet()).count()
    }

    /// Matches `remote_ip` (already extracted via [`unspoofable_remote_ip`])
    /// against the cache; testnet entries are retained here even though
    /// they're excluded from `validator_count`.
    pub fn is_validator(&self, remote_ip: IpAddr) -> Option<ValidatorDescriptor> {
        self.validators.read().iter().find(|v| v.ip == remote_ip).cloned()
    }
}

/// Extracts the unspoofable remote address for [`ValidatorRegistry::is_validator`]
/// (§4.6, §8 invariant 6): strips the IPv4-mapped-IPv6 prefix. Spoofable
/// headers (`X-Forwarded-For`) are never consulted here — the caller must not
/// pass anything derived from request headers into this function.
pub fn unspoofable_remote_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_validator_matches_exactly() {
        let registry = ValidatorRegistry::with_fallback(vec![ValidatorDescriptor {
            uid: Some(7),
            ip: "203.0.113.5".parse().unwrap(),
        }]);
        assert!(registry.is_validator("203.0.113.5".parse().unwrap()).is_some());
        assert!(registry.is_validator("203.0.113.6".parse().unwrap()).is_none());
    }

    #[test]
    fn zero_ip_entries_are_patched_from_fallback() {
        let registry = ValidatorRegistry::with_fallback(vec![ValidatorDescriptor {
            uid: Some(1),
            ip: "203.0.113.10".parse().unwrap(),
        }]);
        registry.update(vec![ValidatorDescriptor {
            uid: Some(1),
            ip: "0.0.0.0".parse().unwrap(),
        }]);
        assert_eq!(registry.validator_ips(), vec!["203.0.113.10".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn testnet_entries_excluded_from_count_but_kept_for_lookup() {
        let registry = ValidatorRegistry::with_fallback(vec![]);
        registry.update(vec![
            ValidatorDescriptor { uid: Some(1), ip: "203.0.113.1".parse().unwrap() },
            ValidatorDescriptor { uid: None, ip: "203.0.113.2".parse().unwrap() },
        ]);
        assert_eq!(registry.validator_count(), 1);
        assert!(registry.is_validator("203.0.113.2".parse().unwrap()).is_some());
    }

    #[test]
    fn unspoofable_ip_strips_v4_mapped_prefix() {
        let mapped: IpAddr = "::ffff:203.0.113.9".parse().unwrap();
        assert_eq!(unspoofable_remote_ip(mapped), "203.0.113.9".parse::<IpAddr>().unwrap());
    }
}
