//! Announcer (C5): probe then announce a new registration (RFC 6762 §§8.1,
//! 8.3), detecting name conflicts during the probe window.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::info;

use crate::cache::RecordCache;
use crate::channel::{Channel, ChannelError, Received};
use crate::codec::{Message, FLAG_AA};
use crate::config::MdnsConfig;
use crate::records::{lowercase_name, DnsClass, DnsEntry, DnsRecord, RecordType};
use crate::scheduler::schedule_batch;

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("name {0} is already in use on the network")]
    NameConflict(String),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("{0} is not a registered service")]
    NotRegistered(String),
}

/// The records describing one service instance, probed and announced as a
/// unit: a registration groups its SRV/TXT/address records under one
/// probe/announce lifecycle.
#[derive(Debug, Clone)]
pub struct Registration {
    pub instance_name: String,
    pub records: Vec<DnsRecord>,
}

impl Registration {
    pub fn new(instance_name: impl Into<String>, records: Vec<DnsRecord>) -> Self {
        Self {
            instance_name: instance_name.into(),
            records,
        }
    }

    /// RFC 6762 §8.1: an ANY query per owner name, proposed records carried
    /// in the Authority section for simultaneous-probe tie-breaking.
    fn probe_message(&self) -> Message {
        let mut msg = Message::query(0);
        let mut seen = Vec::new();
        for record in &self.records {
            if !seen.contains(&record.name()) {
                msg.questions.push(DnsEntry::new(record.name(), RecordType::Any, DnsClass::IN));
                seen.push(record.name());
            }
        }
        msg.authorities = self.records.clone();
        msg
    }

    /// RFC 6762 §8.3: an unsolicited response carrying every record,
    /// authoritative, with the cache-flush bit expected to already be set
    /// on each record's class.
    fn announce_message(&self) -> Message {
        let mut msg = Message::response(FLAG_AA);
        msg.answers = self.records.clone();
        msg
    }
}

fn conflicts(registration: &Registration, received: &Received) -> bool {
    received.message.all_records().any(|incoming| {
        registration
            .records
            .iter()
            .any(|ours| ours.same_identity(incoming.name(), incoming.rtype(), incoming.class()) && incoming.rdata != ours.rdata)
    })
}

async fn probe(registration: &Registration, channel: &Arc<Channel>, config: &MdnsConfig) -> Result<(), RegisterError> {
    if registration.records.is_empty() {
        return Ok(());
    }
    let mut inbound = channel.subscribe();
    let probe_msg = registration.probe_message();

    for _ in 0..config.probing_number {
        channel.send(probe_msg.clone())?;
        let wait_until = Instant::now() + config.probing_interval();
        loop {
            let now = Instant::now();
            if now >= wait_until {
                break;
            }
            match tokio::time::timeout(wait_until - now, inbound.recv()).await {
                Ok(Ok(received)) => {
                    if conflicts(registration, &received) {
                        return Err(RegisterError::NameConflict(registration.instance_name.clone()));
                    }
                }
                Ok(Err(_)) => continue,
                Err(_) => break,
            }
        }
    }
    Ok(())
}

/// Runs the full probe-then-announce lifecycle and seeds the cache with the
/// registration's own records on success.
pub async fn announce(
    registration: Registration,
    channel: Arc<Channel>,
    cache: Arc<RecordCache>,
    config: &MdnsConfig,
) -> Result<Registration, RegisterError> {
    probe(&registration, &channel, config).await?;

    let announce_msg = registration.announce_message();
    let announce_channel = channel.clone();
    let handle = schedule_batch(
        lowercase_name(&registration.instance_name),
        move |_i| {
            let channel = announce_channel.clone();
            let msg = announce_msg.clone();
            async move {
                let _ = channel.send(msg);
            }
        },
        config.announcement_number,
        config.announcement_interval(),
    );
    handle.await_all().await;

    for record in &registration.records {
        cache.add(record.clone()).await;
    }
    info!(instance = %registration.instance_name, records = registration.records.len(), "service announced");
    Ok(registration)
}

/// Re-announces a registration whose attributes changed: unlike `announce`,
/// probing is skipped entirely and only the first announcement in the batch
/// is awaited before returning, matching the lighter-weight re-announce path
/// RFC 6762 expects for already-owned names.
pub async fn reannounce(
    registration: &Registration,
    channel: Arc<Channel>,
    cache: Arc<RecordCache>,
    config: &MdnsConfig,
) -> Result<(), RegisterError> {
    let announce_msg = registration.announce_message();
    let announce_channel = channel.clone();
    let handle = schedule_batch(
        lowercase_name(&registration.instance_name),
        move |_i| {
            let channel = announce_channel.clone();
            let msg = announce_msg.clone();
            async move {
                let _ = channel.send(msg);
            }
        },
        config.announcement_number,
        config.announcement_interval(),
    );
    handle.await_first().await;

    for record in &registration.records {
        cache.add(record.clone()).await;
    }
    info!(instance = %registration.instance_name, "service attributes changed, re-announced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Interface;
    use crate::records::RData;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn registration() -> Registration {
        Registration::new(
            "My Printer._http._tcp.local.",
            vec![DnsRecord::new(
                DnsEntry::new("My Printer._http._tcp.local.", RecordType::Srv, DnsClass::internet(true)),
                Duration::from_secs(120),
                Instant::now(),
                RData::Srv {
                    priority: 0,
                    weight: 0,
                    port: 8080,
                    server: "host.local.".to_string(),
                },
            )],
        )
    }

    fn loopback_config() -> (Channel, MdnsConfig) {
        let mut config = MdnsConfig::default();
        config.port = 15353;
        config.probing_interval_ms = 5;
        config.probing_number = 2;
        config.announcement_interval_ms = 5;
        config.announcement_number = 2;
        let iface = Interface {
            name: "lo".to_string(),
            index: 1,
            ipv4: Some(Ipv4Addr::LOCALHOST),
            ipv6: None,
            is_loopback: true,
        };
        let channel = Channel::bind(&[iface], &config).unwrap();
        (channel, config)
    }

    #[tokio::test]
    async fn announce_with_no_conflicts_seeds_cache() {
        let (channel, config) = loopback_config();
        let channel = Arc::new(channel);
        channel.clone().enable().await;
        let cache = Arc::new(RecordCache::new(Duration::from_secs(1)));

        let result = announce(registration(), channel, cache.clone(), &config).await;
        assert!(result.is_ok());
        assert_eq!(cache.entries("My Printer._http._tcp.local.").await.len(), 1);
    }
}
