//! Region/host topology descriptors.
//!
//! A [`ZoneDescriptor`] is an immutable snapshot of the upload endpoints for
//! one region, ordered by failover precedence (accelerate, main, legacy),
//! with a TTL-based validity window. [`ZoneDirectory`] holds the current
//! descriptor per key; refreshing swaps the `Arc`, it never mutates a
//! descriptor other threads may be reading.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{ResilienceError, ResilienceResult};
use crate::invalidation::{CacheInvalidator, FeatureGroup};

/// Region id used when the document or caller does not name one.
pub const UNKNOWN_REGION_ID: &str = "unknown";

/// TTL assigned to locally synthesized descriptors (one day).
pub const LOCAL_ZONE_TTL_SECS: i64 = 86_400;

/// Timestamps below this are not epoch seconds and are replaced with "now".
const MIN_PLAUSIBLE_TIMESTAMP: i64 = 100;

/// Region/host topology snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneDescriptor {
    ttl_secs: i64,
    build_timestamp: DateTime<Utc>,
    region_id: String,
    accelerate_domains: Vec<String>,
    main_domains: Vec<String>,
    legacy_domains: Vec<String>,
    all_hosts: Vec<String>,
    http3_enabled: bool,
    ipv6_enabled: bool,
    raw_payload: Value,
}

impl ZoneDescriptor {
    /// Synthesize a descriptor from explicit host lists.
    ///
    /// Fails only when both `accelerate_hosts` and `main_hosts` are absent,
    /// or when neither holds a non-blank host.
    pub fn build(
        accelerate_hosts: Option<Vec<String>>,
        main_hosts: Option<Vec<String>>,
        legacy_hosts: Option<Vec<String>>,
        region_id: Option<&str>,
    ) -> ResilienceResult<Self> {
        if accelerate_hosts.is_none() && main_hosts.is_none() {
            return Err(ResilienceError::invalid_document(
                "either accelerate or main hosts are required",
            ));
        }

        let mut up = Map::new();
        if let Some(hosts) = accelerate_hosts {
            up.insert("acc_domains".to_string(), json!(hosts));
        }
        if let Some(hosts) = main_hosts {
            up.insert("domains".to_string(), json!(hosts));
        }
        if let Some(hosts) = legacy_hosts {
            up.insert("old".to_string(), json!(hosts));
        }

        let document = json!({
            "ttl": LOCAL_ZONE_TTL_SECS,
            "region": region_id.unwrap_or(UNKNOWN_REGION_ID),
            "up": Value::Object(up),
        });

        Self::parse(&document)
    }

    /// Descriptor with only main hosts.
    pub fn from_main_hosts(main_hosts: Vec<String>, region_id: Option<&str>) -> ResilienceResult<Self> {
        Self::build(None, Some(main_hosts), None, region_id)
    }

    /// Descriptor with main and legacy hosts.
    pub fn from_main_and_legacy(
        main_hosts: Vec<String>,
        legacy_hosts: Vec<String>,
        region_id: Option<&str>,
    ) -> ResilienceResult<Self> {
        Self::build(None, Some(main_hosts), Some(legacy_hosts), region_id)
    }

    /// Parse a topology document.
    ///
    /// ```json
    /// {"ttl": 86400, "timestamp": 1700000000, "region": "z0",
    ///  "features": {"http3": {"enabled": true}, "ipv6": {"enabled": false}},
    ///  "up": {"acc_domains": [], "domains": ["up.example.com"], "old": []}}
    /// ```
    ///
    /// Blank hosts are dropped. Fails when `up` is missing or when both the
    /// accelerate and main tiers end up empty.
    pub fn parse(document: &Value) -> ResilienceResult<Self> {
        let obj = document
            .as_object()
            .ok_or_else(|| ResilienceError::invalid_document("topology is not an object"))?;

        let ttl_secs = obj.get("ttl").and_then(Value::as_i64).unwrap_or(0);

        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_i64)
            .filter(|ts| *ts >= MIN_PLAUSIBLE_TIMESTAMP)
            .unwrap_or_else(|| Utc::now().timestamp());

        let feature_enabled = |name: &str| {
            obj.get("features")
                .and_then(|f| f.get(name))
                .and_then(|f| f.get("enabled"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        let http3_enabled = feature_enabled("http3");
        let ipv6_enabled = feature_enabled("ipv6");

        let region_id = obj
            .get("region")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_REGION_ID)
            .to_string();

        let up = obj
            .get("up")
            .and_then(Value::as_object)
            .ok_or_else(|| ResilienceError::invalid_document("topology has no `up` section"))?;

        let accelerate_domains = domain_tier(up, "acc_domains");
        let main_domains = domain_tier(up, "domains");
        let legacy_domains = domain_tier(up, "old");

        if accelerate_domains.is_empty() && main_domains.is_empty() {
            return Err(ResilienceError::invalid_document(
                "topology has neither accelerate nor main domains",
            ));
        }

        let build_timestamp = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| ResilienceError::invalid_document("timestamp out of range"))?;

        let mut raw_payload = document.clone();
        if let Some(raw) = raw_payload.as_object_mut() {
            raw.insert("timestamp".to_string(), json!(timestamp));
        }

        let all_hosts = accelerate_domains
            .iter()
            .chain(main_domains.iter())
            .chain(legacy_domains.iter())
            .cloned()
            .collect();

        Ok(Self {
            ttl_secs,
            build_timestamp,
            region_id,
            accelerate_domains,
            main_domains,
            legacy_domains,
            all_hosts,
            http3_enabled,
            ipv6_enabled,
            raw_payload,
        })
    }

    /// Whether the descriptor is still inside its TTL window.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Whether the descriptor is inside its TTL window at `now`.
    ///
    /// Compared in whole seconds; a zero or negative TTL is never valid.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.timestamp() - self.build_timestamp.timestamp();
        self.ttl_secs > elapsed
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    pub fn build_timestamp(&self) -> DateTime<Utc> {
        self.build_timestamp
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn accelerate_domains(&self) -> &[String] {
        &self.accelerate_domains
    }

    pub fn main_domains(&self) -> &[String] {
        &self.main_domains
    }

    pub fn legacy_domains(&self) -> &[String] {
        &self.legacy_domains
    }

    /// Every host in failover order: accelerate, then main, then legacy.
    pub fn all_hosts(&self) -> &[String] {
        &self.all_hosts
    }

    pub fn http3_enabled(&self) -> bool {
        self.http3_enabled
    }

    pub fn ipv6_enabled(&self) -> bool {
        self.ipv6_enabled
    }

    /// The source document, with the effective timestamp written back.
    pub fn raw_payload(&self) -> &Value {
        &self.raw_payload
    }
}

impl fmt::Display for ZoneDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = json!({ "ttl": self.ttl_secs, "allHosts": self.all_hosts });
        write!(f, "{}", summary)
    }
}

fn domain_tier(up: &Map<String, Value>, field: &str) -> Vec<String> {
    up.get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|host| !host.trim().is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Current zone descriptors, keyed by caller-chosen key (usually a bucket
/// or token scope).
#[derive(Debug, Default)]
pub struct ZoneDirectory {
    entries: RwLock<HashMap<String, Arc<ZoneDescriptor>>>,
}

impl ZoneDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valid descriptor for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Arc<ZoneDescriptor>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(zone) if zone.is_valid() => {
                debug!(key, region = zone.region_id(), "zone cache hit");
                Some(Arc::clone(zone))
            }
            Some(_) => {
                debug!(key, "zone cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Descriptor for `key` even if expired. Callers fall back to this when
    /// a refresh fails.
    pub fn get_any(&self, key: &str) -> Option<Arc<ZoneDescriptor>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    /// Replace the descriptor for `key`.
    pub fn insert(&self, key: impl Into<String>, zone: ZoneDescriptor) -> Arc<ZoneDescriptor> {
        let zone = Arc::new(zone);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.into(), Arc::clone(&zone));
        zone
    }

    pub fn remove(&self, key: &str) -> Option<Arc<ZoneDescriptor>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key)
    }

    /// Drop every descriptor.
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInvalidator for ZoneDirectory {
    fn invalidate(&self, group: FeatureGroup) {
        let dropped = self.len();
        self.clear();
        info!(group = %group, dropped, "cleared zone directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn hosts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn document(acc: &[&str], main: &[&str], old: &[&str]) -> Value {
        json!({
            "ttl": 86400,
            "timestamp": 1_700_000_000,
            "region": "z0",
            "features": {"http3": {"enabled": true}, "ipv6": {"enabled": true}},
            "up": {"acc_domains": acc, "domains": main, "old": old},
        })
    }

    #[test]
    fn test_parse_full_document() {
        let zone = ZoneDescriptor::parse(&document(
            &["acc.example.com"],
            &["up.example.com", "upload.example.com"],
            &["old.example.com"],
        ))
        .unwrap();

        assert_eq!(zone.ttl_secs(), 86400);
        assert_eq!(zone.region_id(), "z0");
        assert!(zone.http3_enabled());
        assert!(zone.ipv6_enabled());
        assert_eq!(zone.build_timestamp().timestamp(), 1_700_000_000);
        assert_eq!(
            zone.all_hosts(),
            &hosts(&[
                "acc.example.com",
                "up.example.com",
                "upload.example.com",
                "old.example.com"
            ])[..]
        );
    }

    #[test]
    fn test_parse_empty_main_and_accelerate_fails() {
        let result = ZoneDescriptor::parse(&document(&[], &[], &["old.example.com"]));
        assert!(matches!(
            result,
            Err(ResilienceError::InvalidDocument { .. })
        ));
    }

    #[test]
    fn test_parse_blank_hosts_filtered() {
        let zone =
            ZoneDescriptor::parse(&document(&["", "  "], &["", "up.example.com"], &[""])).unwrap();
        assert!(zone.accelerate_domains().is_empty());
        assert_eq!(zone.main_domains(), &hosts(&["up.example.com"])[..]);
        assert!(zone.legacy_domains().is_empty());

        let only_blank = ZoneDescriptor::parse(&document(&[" "], &[""], &[]));
        assert!(only_blank.is_err());
    }

    #[test]
    fn test_parse_missing_up_section_fails() {
        let result = ZoneDescriptor::parse(&json!({"ttl": 10, "region": "z0"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_missing_timestamp_uses_now() {
        let before = Utc::now().timestamp();
        let zone =
            ZoneDescriptor::parse(&json!({"ttl": 60, "up": {"domains": ["up.example.com"]}}))
                .unwrap();
        let after = Utc::now().timestamp();

        let built = zone.build_timestamp().timestamp();
        assert!(built >= before && built <= after);
        assert_eq!(zone.region_id(), UNKNOWN_REGION_ID);
        assert!(!zone.http3_enabled());
        assert_eq!(zone.raw_payload()["timestamp"], json!(built));
    }

    #[test]
    fn test_parse_implausible_timestamp_uses_now() {
        let before = Utc::now().timestamp();
        let zone = ZoneDescriptor::parse(&json!({
            "ttl": 60,
            "timestamp": 99,
            "up": {"acc_domains": ["acc.example.com"]}
        }))
        .unwrap();
        assert!(zone.build_timestamp().timestamp() >= before);
        assert!(zone.is_valid());
    }

    #[test]
    fn test_is_valid_window() {
        let zone = ZoneDescriptor::parse(&json!({
            "ttl": 100,
            "timestamp": 1_700_000_000,
            "up": {"domains": ["up.example.com"]}
        }))
        .unwrap();
        let built = zone.build_timestamp();

        assert!(zone.is_valid_at(built + Duration::seconds(50)));
        assert!(!zone.is_valid_at(built + Duration::seconds(100)));
        assert!(!zone.is_valid_at(built + Duration::seconds(150)));
    }

    #[test]
    fn test_zero_ttl_is_immediately_invalid() {
        let zone = ZoneDescriptor::parse(&json!({"ttl": 0, "up": {"domains": ["a.example.com"]}}))
            .unwrap();
        assert!(!zone.is_valid_at(zone.build_timestamp()));

        let negative =
            ZoneDescriptor::parse(&json!({"ttl": -5, "up": {"domains": ["a.example.com"]}}))
                .unwrap();
        assert!(!negative.is_valid());
    }

    #[test]
    fn test_all_hosts_order_for_tier_combinations() {
        let acc = ["a1", "a2"];
        let main = ["m1", "m2"];
        let old = ["o1"];
        let empty: [&str; 0] = [];

        for (a, m, o) in [
            (&acc[..], &main[..], &old[..]),
            (&acc[..], &empty[..], &old[..]),
            (&empty[..], &main[..], &old[..]),
            (&acc[..], &main[..], &empty[..]),
            (&empty[..], &main[..], &empty[..]),
        ] {
            let zone = ZoneDescriptor::parse(&document(a, m, o)).unwrap();
            let expected: Vec<String> = a.iter().chain(m).chain(o).map(|s| s.to_string()).collect();
            assert_eq!(zone.all_hosts(), &expected[..]);
        }
    }

    #[test]
    fn test_build_requires_accelerate_or_main() {
        assert!(ZoneDescriptor::build(None, None, Some(hosts(&["old.example.com"])), None).is_err());
    }

    #[test]
    fn test_build_defaults() {
        let zone = ZoneDescriptor::build(
            Some(hosts(&["acc.example.com"])),
            Some(hosts(&["up.example.com"])),
            Some(hosts(&["old.example.com"])),
            None,
        )
        .unwrap();

        assert_eq!(zone.ttl_secs(), LOCAL_ZONE_TTL_SECS);
        assert_eq!(zone.region_id(), UNKNOWN_REGION_ID);
        assert!(zone.is_valid());
        assert_eq!(
            zone.all_hosts(),
            &hosts(&["acc.example.com", "up.example.com", "old.example.com"])[..]
        );
    }

    #[test]
    fn test_build_with_region_and_helpers() {
        let zone = ZoneDescriptor::from_main_hosts(hosts(&["up.example.com"]), Some("z2")).unwrap();
        assert_eq!(zone.region_id(), "z2");

        let zone = ZoneDescriptor::from_main_and_legacy(
            hosts(&["up.example.com"]),
            hosts(&["old.example.com"]),
            None,
        )
        .unwrap();
        assert_eq!(zone.legacy_domains(), &hosts(&["old.example.com"])[..]);
    }

    #[test]
    fn test_clone_preserves_build_time() {
        let zone = ZoneDescriptor::parse(&json!({
            "ttl": 100,
            "timestamp": 1_700_000_000,
            "up": {"domains": ["up.example.com"]}
        }))
        .unwrap();
        let copy = zone.clone();
        assert_eq!(copy.build_timestamp(), zone.build_timestamp());
        assert!(!copy.is_valid());
    }

    #[test]
    fn test_display_summary() {
        let zone = ZoneDescriptor::from_main_hosts(hosts(&["up.example.com"]), None).unwrap();
        let rendered: Value = serde_json::from_str(&zone.to_string()).unwrap();
        assert_eq!(rendered["ttl"], json!(LOCAL_ZONE_TTL_SECS));
        assert_eq!(rendered["allHosts"], json!(["up.example.com"]));
    }

    #[test]
    fn test_directory_returns_only_valid() {
        let directory = ZoneDirectory::new();
        directory.insert(
            "fresh",
            ZoneDescriptor::from_main_hosts(hosts(&["up.example.com"]), None).unwrap(),
        );
        directory.insert(
            "stale",
            ZoneDescriptor::parse(&json!({
                "ttl": 10,
                "timestamp": 1_700_000_000,
                "up": {"domains": ["up.example.com"]}
            }))
            .unwrap(),
        );

        assert!(directory.get("fresh").is_some());
        assert!(directory.get("stale").is_none());
        assert!(directory.get_any("stale").is_some());
        assert!(directory.get("missing").is_none());
    }

    #[test]
    fn test_directory_swap_keeps_old_reference_intact() {
        let directory = ZoneDirectory::new();
        directory.insert(
            "bucket",
            ZoneDescriptor::from_main_hosts(hosts(&["a.example.com"]), None).unwrap(),
        );
        let held = directory.get("bucket").unwrap();

        directory.insert(
            "bucket",
            ZoneDescriptor::from_main_hosts(hosts(&["b.example.com"]), None).unwrap(),
        );

        assert_eq!(held.main_domains(), &hosts(&["a.example.com"])[..]);
        assert_eq!(
            directory.get("bucket").unwrap().main_domains(),
            &hosts(&["b.example.com"])[..]
        );
    }

    #[test]
    fn test_directory_invalidate_clears() {
        let directory = ZoneDirectory::new();
        directory.insert(
            "bucket",
            ZoneDescriptor::from_main_hosts(hosts(&["a.example.com"]), None).unwrap(),
        );
        assert_eq!(directory.len(), 1);

        directory.invalidate(FeatureGroup::Region);
        assert!(directory.is_empty());
    }
}
