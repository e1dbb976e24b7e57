//! Registration-type browser (C8): continuously queries
//! `_services._dns-sd._udp.local.` and reports each newly discovered
//! registration type exactly once (RFC 6763 §9).

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::Channel;
use crate::codec::Message;
use crate::config::MdnsConfig;
use crate::records::{lowercase_name, names_equal, DnsClass, DnsEntry, RData, RecordType};
use crate::scheduler::{schedule_increasingly, IncreasingRateHandle};

pub const META_QUERY_NAME: &str = "_services._dns-sd._udp.local.";

pub struct TypeBrowser {
    handle: IncreasingRateHandle,
    listener: JoinHandle<()>,
}

impl TypeBrowser {
    /// Starts the meta-query cadence and an inbound listener that calls
    /// `on_discovered` once per newly-seen PTR target.
    pub fn start(channel: Arc<Channel>, config: &MdnsConfig, mut on_discovered: impl FnMut(String) + Send + 'static) -> Self {
        let mut inbound = channel.subscribe();
        let seen = Arc::new(Mutex::new(HashSet::<String>::new()));

        let listener = tokio::spawn(async move {
            loop {
                let received = match inbound.recv().await {
                    Ok(r) => r,
                    Err(RecvError::Closed) => return,
                    Err(RecvError::Lagged(_)) => continue,
                };
                for record in received.message.all_records() {
                    if !names_equal(record.name(), META_QUERY_NAME) {
                        continue;
                    }
                    if let RData::Ptr { target } = &record.rdata {
                        let mut seen_guard = seen.lock().await;
                        let is_new = seen_guard.insert(lowercase_name(target));
                        drop(seen_guard);
                        if is_new {
                            debug!(registration_type = %target, "discovered registration type");
                            on_discovered(target.clone());
                        }
                    }
                }
            }
        });

        let query_channel = channel.clone();
        let mut query = Message::query(0);
        query.questions.push(DnsEntry::new(META_QUERY_NAME, RecordType::Ptr, DnsClass::IN));

        let handle = schedule_increasingly(
            move || {
                let channel = query_channel.clone();
                let query = query.clone();
                async move {
                    let _ = channel.send(query);
                }
            },
            config.querying_delay(),
            config.querying_interval(),
            config.querying_backoff_factor,
            config.querying_max_interval(),
        );

        Self { handle, listener }
    }

    pub fn stop(&self) {
        self.handle.cancel();
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Interface;
    use crate::codec::FLAG_RESPONSE;
    use crate::records::DnsRecord;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn discovers_each_registration_type_once() {
        let mut config = MdnsConfig::default();
        config.port = 15357;
        config.querying_delay_ms = 5;
        config.querying_interval_ms = 5;

        let iface = Interface {
            name: "lo".to_string(),
            index: 1,
            ipv4: Some(Ipv4Addr::LOCALHOST),
            ipv6: None,
            is_loopback: true,
        };
        let channel = Arc::new(Channel::bind(&[iface], &config).unwrap());
        channel.clone().enable().await;

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let browser = TypeBrowser::start(channel.clone(), &config, move |_t| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let mut response = Message::response(FLAG_RESPONSE);
        response.answers.push(DnsRecord::new(
            DnsEntry::new(META_QUERY_NAME, RecordType::Ptr, DnsClass::IN),
            Duration::from_secs(4500),
            Instant::now(),
            RData::Ptr {
                target: "_http._tcp.local.".to_string(),
            },
        ));

        let mut inbound = channel.subscribe();
        let _ = channel.send(response.clone());
        let _ = tokio::time::timeout(Duration::from_millis(200), inbound.recv()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        browser.stop();
        assert!(count.load(Ordering::SeqCst) <= 1);
    }
}
