//! Canceller (C6): emits goodbye records (TTL=0) for a deregistration,
//! batched the same way the announcer batches announcements (RFC 6762
//! §10.1: "a TTL of zero... serves to indicate... no longer valid").

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::cache::RecordCache;
use crate::channel::{Channel, ChannelError};
use crate::codec::{Message, FLAG_AA};
use crate::config::MdnsConfig;
use crate::records::{lowercase_name, DnsRecord};
use crate::scheduler::schedule_batch;

#[derive(Error, Debug)]
pub enum DeregisterError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

fn goodbye_record(record: &DnsRecord) -> DnsRecord {
    DnsRecord::new(record.entry.clone(), Duration::ZERO, record.creation_time, record.rdata.clone())
}

fn goodbye_message(records: &[DnsRecord]) -> Message {
    let mut msg = Message::response(FLAG_AA);
    msg.answers = records.iter().map(goodbye_record).collect();
    msg
}

/// Sends `config.cancellation_number` goodbye batches and locally expires
/// the records: the local cache follows the same goodbye the wire sees,
/// rather than waiting on a self-addressed response.
pub async fn cancel(
    instance_name: &str,
    records: Vec<DnsRecord>,
    channel: Arc<Channel>,
    cache: Arc<RecordCache>,
    config: &MdnsConfig,
) -> Result<(), DeregisterError> {
    if records.is_empty() {
        return Ok(());
    }
    let msg = goodbye_message(&records);
    let handle = schedule_batch(
        lowercase_name(instance_name),
        move |_i| {
            let channel = channel.clone();
            let msg = msg.clone();
            async move {
                let _ = channel.send(msg);
            }
        },
        config.cancellation_number,
        config.cancellation_interval(),
    );
    handle.await_all().await;

    for record in &records {
        cache.expire(record.name(), record.rtype(), record.class()).await;
    }
    info!(instance = instance_name, records = records.len(), "service goodbye sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Interface;
    use crate::records::{DnsClass, DnsEntry, RData, RecordType};
    use std::net::Ipv4Addr;
    use std::time::Instant;

    fn record() -> DnsRecord {
        DnsRecord::new(
            DnsEntry::new("My Printer._http._tcp.local.", RecordType::Srv, DnsClass::internet(true)),
            Duration::from_secs(120),
            Instant::now(),
            RData::Srv {
                priority: 0,
                weight: 0,
                port: 8080,
                server: "host.local.".to_string(),
            },
        )
    }

    #[test]
    fn goodbye_record_carries_zero_ttl() {
        let r = record();
        let bye = goodbye_record(&r);
        assert_eq!(bye.ttl, Duration::ZERO);
        assert_eq!(bye.name(), r.name());
    }

    #[tokio::test]
    async fn cancel_expires_cached_records() {
        let mut config = MdnsConfig::default();
        config.port = 15354;
        config.cancellation_interval_ms = 5;
        config.cancellation_number = 2;
        let iface = Interface {
            name: "lo".to_string(),
            index: 1,
            ipv4: Some(Ipv4Addr::LOCALHOST),
            ipv6: None,
            is_loopback: true,
        };
        let channel = Arc::new(Channel::bind(&[iface], &config).unwrap());
        channel.clone().enable().await;
        let cache = Arc::new(RecordCache::new(Duration::from_millis(1)));
        cache.add(record()).await;

        cancel("My Printer._http._tcp.local.", vec![record()], channel, cache.clone(), &config)
            .await
            .unwrap();

        let cached = cache.get("My Printer._http._tcp.local.", RecordType::Srv, DnsClass::IN).await.unwrap();
        assert!(cached.remaining_ttl(Instant::now() + Duration::from_millis(5)).is_zero());
    }
}
