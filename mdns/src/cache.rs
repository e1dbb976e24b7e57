//! Record cache: one bucket per lowercased name, one record per
//! `(name, type, class)` with ANY wildcarding, TTL-driven expiry.

use std::time::{Duration, Instant};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::records::{lowercase_name, DnsClass, DnsRecord, RecordType};

pub struct RecordCache {
    buckets: RwLock<FxHashMap<String, Vec<DnsRecord>>>,
    expiry_ttl: Duration,
}

impl RecordCache {
    pub fn new(expiry_ttl: Duration) -> Self {
        Self {
            buckets: RwLock::new(FxHashMap::default()),
            expiry_ttl,
        }
    }

    /// Replaces any record matching `(name, type, class)` (ANY wildcarding
    /// either side); otherwise inserts.
    pub async fn add(&self, record: DnsRecord) {
        let key = lowercase_name(record.name());
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(key).or_default();
        if let Some(slot) = bucket
            .iter_mut()
            .find(|r| r.same_identity(record.name(), record.rtype(), record.class()))
        {
            *slot = record;
        } else {
            bucket.push(record);
        }
    }

    /// Sets the TTL of every record matching `(name, type, class)` to the
    /// configured expiry TTL, so the reaper removes it shortly after.
    pub async fn expire(&self, name: &str, rtype: RecordType, class: DnsClass) {
        let key = lowercase_name(name);
        let mut buckets = self.buckets.write().await;
        let Some(bucket) = buckets.get_mut(&key) else {
            return;
        };
        let now = Instant::now();
        for record in bucket.iter_mut() {
            if record.same_identity(name, rtype, class) {
                record.creation_time = now;
                record.ttl = self.expiry_ttl;
            }
        }
    }

    /// First record matching `(name, type, class)`, wildcarding either side.
    pub async fn get(&self, name: &str, rtype: RecordType, class: DnsClass) -> Option<DnsRecord> {
        let key = lowercase_name(name);
        let buckets = self.buckets.read().await;
        buckets
            .get(&key)?
            .iter()
            .find(|r| r.same_identity(name, rtype, class))
            .cloned()
    }

    /// All records under `name` (case-insensitive), regardless of type/class.
    pub async fn entries(&self, name: &str) -> Vec<DnsRecord> {
        let key = lowercase_name(name);
        let buckets = self.buckets.read().await;
        buckets.get(&key).cloned().unwrap_or_default()
    }

    pub async fn remove_all(&self, name: &str) {
        let key = lowercase_name(name);
        self.buckets.write().await.remove(&key);
    }

    /// Removes expired records and empty buckets.
    pub async fn clean(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.write().await;
        let mut removed = 0;
        buckets.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|r| !r.expired(now));
            removed += before - bucket.len();
            !bucket.is_empty()
        });
        removed
    }

    pub async fn clear(&self) {
        self.buckets.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.buckets.read().await.values().map(Vec::len).sum()
    }
}

/// Periodically calls `clean` until cancelled (used by the engine's reaper,
/// §6 `reaper.interval`).
pub async fn run_reaper(cache: std::sync::Arc<RecordCache>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let removed = cache.clean(Instant::now()).await;
                if removed > 0 {
                    tracing::debug!(removed, "cache reaper swept expired records");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{DnsEntry, RData};
    use std::net::Ipv4Addr;

    fn a_record(name: &str, ip: Ipv4Addr, ttl: Duration, now: Instant) -> DnsRecord {
        DnsRecord::new(
            DnsEntry::new(name, RecordType::A, DnsClass::IN),
            ttl,
            now,
            RData::Address(ip.into()),
        )
    }

    #[tokio::test]
    async fn add_replaces_matching_identity() {
        let cache = RecordCache::new(Duration::from_secs(1));
        let now = Instant::now();
        cache.add(a_record("host.local.", Ipv4Addr::new(1, 1, 1, 1), Duration::from_secs(60), now)).await;
        cache.add(a_record("host.local.", Ipv4Addr::new(2, 2, 2, 2), Duration::from_secs(60), now)).await;

        let got = cache.get("host.local.", RecordType::A, DnsClass::IN).await.unwrap();
        assert_eq!(got.rdata, RData::Address(Ipv4Addr::new(2, 2, 2, 2).into()));
        assert_eq!(cache.entries("host.local.").await.len(), 1);
    }

    #[tokio::test]
    async fn get_is_case_insensitive_and_wildcards_type_and_class() {
        let cache = RecordCache::new(Duration::from_secs(1));
        let now = Instant::now();
        cache.add(a_record("Host.Local.", Ipv4Addr::new(1, 1, 1, 1), Duration::from_secs(60), now)).await;

        assert!(cache.get("host.local.", RecordType::Any, DnsClass::IN).await.is_some());
        assert!(cache.get("host.local.", RecordType::A, DnsClass::ANY).await.is_some());
    }

    #[tokio::test]
    async fn expire_sets_short_ttl_then_clean_removes() {
        let cache = RecordCache::new(Duration::from_millis(1));
        let now = Instant::now();
        cache.add(a_record("host.local.", Ipv4Addr::new(1, 1, 1, 1), Duration::from_secs(3600), now)).await;

        cache.expire("host.local.", RecordType::A, DnsClass::IN).await;
        let expired_at = cache.get("host.local.", RecordType::A, DnsClass::IN).await.unwrap();
        assert!(expired_at.remaining_ttl(Instant::now() + Duration::from_millis(5)).is_zero());

        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.clean(Instant::now()).await;
        assert!(cache.get("host.local.", RecordType::A, DnsClass::IN).await.is_none());
    }

    #[tokio::test]
    async fn remove_all_drops_bucket() {
        let cache = RecordCache::new(Duration::from_secs(1));
        let now = Instant::now();
        cache.add(a_record("host.local.", Ipv4Addr::new(1, 1, 1, 1), Duration::from_secs(60), now)).await;
        cache.remove_all("host.local.").await;
        assert!(cache.entries("host.local.").await.is_empty());
    }
}
