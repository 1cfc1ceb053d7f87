//! Last-applied `clearId` per feature group.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::invalidation::FeatureGroup;
use crate::types::{ClearPolicy, ServerConfig};

/// Every feature group `config` carries, with its clear policy.
pub(super) fn clear_policies(config: &ServerConfig) -> Vec<(FeatureGroup, ClearPolicy)> {
    let mut policies = Vec::new();
    if let Some(region) = &config.region {
        policies.push((FeatureGroup::Region, region.clear));
    }
    if let Some(dns) = &config.dns {
        policies.push((FeatureGroup::Dns, dns.clear));
        if let Some(udp) = &dns.udp {
            policies.push((FeatureGroup::UdpDns, udp.clear));
        }
        if let Some(doh) = &dns.doh {
            policies.push((FeatureGroup::DohDns, doh.clear));
        }
    }
    if let Some(check) = &config.connect_check {
        policies.push((FeatureGroup::ConnectCheck, check.clear));
    }
    policies
}

/// Tracks the highest `clearId` seen for each feature group.
///
/// Every group starts at 0, or at the ids of a persisted snapshot passed to
/// [`ClearLedger::seed`]. The first push carrying a higher `clearId` with
/// `clearCache` set clears. Equal or lower ids never clear, which makes a
/// replayed or reordered push harmless.
#[derive(Debug, Default)]
pub struct ClearLedger {
    last_applied: Mutex<HashMap<FeatureGroup, i64>>,
}

impl ClearLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `clear_id` for `group` and report whether the group's cache
    /// should be cleared now.
    pub fn observe(&self, group: FeatureGroup, clear_id: i64, clear_cache: bool) -> bool {
        let mut last_applied = self
            .last_applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let last = last_applied.entry(group).or_insert(0);
        let advanced = clear_id > *last;
        if advanced {
            *last = clear_id;
        }
        advanced && clear_cache
    }

    /// Record the ids of an already-applied config without clearing
    /// anything. Used for the snapshot persisted by a previous process.
    pub fn seed(&self, config: &ServerConfig) {
        let mut last_applied = self
            .last_applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (group, policy) in clear_policies(config) {
            let last = last_applied.entry(group).or_insert(0);
            *last = (*last).max(policy.clear_id);
        }
    }

    pub fn last_applied(&self, group: FeatureGroup) -> i64 {
        self.last_applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clears_only_on_advance() {
        let ledger = ClearLedger::new();
        let cleared: Vec<i64> = [1, 1, 3, 2, 5]
            .into_iter()
            .filter(|&id| ledger.observe(FeatureGroup::Region, id, true))
            .collect();

        assert_eq!(cleared, vec![1, 3, 5]);
        assert_eq!(ledger.last_applied(FeatureGroup::Region), 5);
    }

    #[test]
    fn test_advance_recorded_without_clear_flag() {
        let ledger = ClearLedger::new();
        assert!(!ledger.observe(FeatureGroup::Dns, 4, false));
        assert_eq!(ledger.last_applied(FeatureGroup::Dns), 4);

        // Same id with the flag set is a replay, not an advance.
        assert!(!ledger.observe(FeatureGroup::Dns, 4, true));
        assert!(ledger.observe(FeatureGroup::Dns, 5, true));
    }

    #[test]
    fn test_groups_are_independent() {
        let ledger = ClearLedger::new();
        assert!(ledger.observe(FeatureGroup::UdpDns, 2, true));
        assert!(ledger.observe(FeatureGroup::DohDns, 1, true));
        assert_eq!(ledger.last_applied(FeatureGroup::UdpDns), 2);
        assert_eq!(ledger.last_applied(FeatureGroup::ConnectCheck), 0);
    }

    #[test]
    fn test_zero_and_negative_ids_never_clear() {
        let ledger = ClearLedger::new();
        assert!(!ledger.observe(FeatureGroup::Region, 0, true));
        assert!(!ledger.observe(FeatureGroup::Region, -3, true));
        assert_eq!(ledger.last_applied(FeatureGroup::Region), 0);
    }

    #[test]
    fn test_seed_suppresses_replayed_clear() {
        use crate::types::ConfigDocument;

        let persisted = ServerConfig::from_json(serde_json::json!({
            "region": {"clearId": 7, "clearCache": true},
            "dns": {"clearId": 2, "clearCache": true, "doh": {"clearId": 4}}
        }))
        .unwrap();

        let ledger = ClearLedger::new();
        ledger.seed(&persisted);
        assert_eq!(ledger.last_applied(FeatureGroup::Region), 7);
        assert_eq!(ledger.last_applied(FeatureGroup::Dns), 2);
        assert_eq!(ledger.last_applied(FeatureGroup::DohDns), 4);
        assert_eq!(ledger.last_applied(FeatureGroup::UdpDns), 0);

        assert!(!ledger.observe(FeatureGroup::Region, 7, true));
        assert!(ledger.observe(FeatureGroup::Region, 8, true));
    }

    #[test]
    fn test_seed_never_lowers() {
        use crate::types::ConfigDocument;

        let ledger = ClearLedger::new();
        assert!(ledger.observe(FeatureGroup::Region, 9, true));

        let older = ServerConfig::from_json(serde_json::json!({
            "region": {"clearId": 3, "clearCache": true}
        }))
        .unwrap();
        ledger.seed(&older);
        assert_eq!(ledger.last_applied(FeatureGroup::Region), 9);
    }
}
