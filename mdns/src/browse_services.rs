//! Service browser (C9): queries PTR records under one registration type,
//! auto-resolves each discovered instance's SRV/TXT/address records, and
//! reports added/updated/removed transitions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::RecordCache;
use crate::channel::Channel;
use crate::codec::Message;
use crate::config::MdnsConfig;
use crate::records::{lowercase_name, names_equal, DnsClass, DnsEntry, DnsRecord, RData, RecordType};
use crate::resolver::resolve;
use crate::scheduler::{schedule_increasingly, IncreasingRateHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Resolving,
    Resolved,
    Removed,
}

#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub instance_name: String,
    pub state: ServiceState,
    pub srv: Option<DnsRecord>,
    pub txt: Option<DnsRecord>,
    pub addresses: Vec<DnsRecord>,
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Added(ServiceInstance),
    Updated(ServiceInstance),
    Removed(String),
}

pub struct ServiceBrowser {
    query_handle: IncreasingRateHandle,
    listener: JoinHandle<()>,
    emitter: JoinHandle<()>,
}

impl ServiceBrowser {
    /// Starts the per-type PTR query cadence, an inbound PTR listener, and
    /// a single-owner emitter task that is the only caller of `on_event`.
    pub fn start(
        registration_type: impl Into<String>,
        channel: Arc<Channel>,
        cache: Arc<RecordCache>,
        config: MdnsConfig,
        mut on_event: impl FnMut(ServiceEvent) + Send + 'static,
    ) -> Self {
        let registration_type = registration_type.into();
        let instances: Arc<Mutex<HashMap<String, ServiceInstance>>> = Arc::new(Mutex::new(HashMap::new()));

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServiceEvent>();
        let emitter = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                on_event(event);
            }
        });

        let mut inbound = channel.subscribe();
        let listener_instances = instances.clone();
        let listener_type = registration_type.clone();
        let listener_channel = channel.clone();
        let listener_cache = cache.clone();
        let listener_config = config.clone();
        let listener_tx = event_tx.clone();
        let listener = tokio::spawn(async move {
            loop {
                let received = match inbound.recv().await {
                    Ok(r) => r,
                    Err(RecvError::Closed) => return,
                    Err(RecvError::Lagged(_)) => continue,
                };
                for record in received.message.all_records() {
                    if !names_equal(record.name(), &listener_type) {
                        // A TXT update for an instance already resolved under
                        // this registration type (e.g. re-advertised with
                        // changed attributes) is reported as `Updated`.
                        if record.rtype() == RecordType::Txt {
                            let key = lowercase_name(record.name());
                            let mut map = listener_instances.lock().await;
                            let updated = map.get_mut(&key).and_then(|instance| {
                                if instance.state == ServiceState::Resolved {
                                    instance.txt = Some(record.clone());
                                    Some(instance.clone())
                                } else {
                                    None
                                }
                            });
                            drop(map);
                            if let Some(updated) = updated {
                                let _ = listener_tx.send(ServiceEvent::Updated(updated));
                            }
                        }
                        continue;
                    }
                    let RData::Ptr { target } = &record.rdata else {
                        continue;
                    };

                    if record.ttl.is_zero() {
                        let mut map = listener_instances.lock().await;
                        if let Some(mut instance) = map.remove(&lowercase_name(target)) {
                            instance.state = ServiceState::Removed;
                            let _ = listener_tx.send(ServiceEvent::Removed(instance.instance_name));
                        }
                        continue;
                    }

                    let already_known = {
                        let mut map = listener_instances.lock().await;
                        let key = lowercase_name(target);
                        if map.contains_key(&key) {
                            true
                        } else {
                            map.insert(
                                key,
                                ServiceInstance {
                                    instance_name: target.clone(),
                                    state: ServiceState::Resolving,
                                    srv: None,
                                    txt: None,
                                    addresses: Vec::new(),
                                },
                            );
                            false
                        }
                    };
                    if already_known {
                        continue;
                    }

                    let target = target.clone();
                    let channel = listener_channel.clone();
                    let cache = listener_cache.clone();
                    let config = listener_config.clone();
                    let instances = listener_instances.clone();
                    let tx = listener_tx.clone();
                    tokio::spawn(resolve_instance(target, channel, cache, config, instances, tx));
                }
            }
        });

        let query_channel = channel.clone();
        let mut query = Message::query(0);
        query.questions.push(DnsEntry::new(registration_type.clone(), RecordType::Ptr, DnsClass::IN));
        let query_handle = schedule_increasingly(
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

        Self {
            query_handle,
            listener,
            emitter,
        }
    }

    pub fn stop(&self) {
        self.query_handle.cancel();
        self.listener.abort();
        self.emitter.abort();
    }
}

async fn resolve_instance(
    instance_name: String,
    channel: Arc<Channel>,
    cache: Arc<RecordCache>,
    config: MdnsConfig,
    instances: Arc<Mutex<HashMap<String, ServiceInstance>>>,
    tx: mpsc::UnboundedSender<ServiceEvent>,
) {
    let srv = resolve(&instance_name, RecordType::Srv, DnsClass::IN, channel.clone(), cache.clone(), &config)
        .await
        .ok()
        .and_then(|mut r| r.pop());
    let txt = resolve(&instance_name, RecordType::Txt, DnsClass::IN, channel.clone(), cache.clone(), &config)
        .await
        .ok()
        .and_then(|mut r| r.pop());

    let mut addresses = Vec::new();
    if let Some(DnsRecord {
        rdata: RData::Srv { server, .. },
        ..
    }) = &srv
    {
        let (v4, v6) = tokio::join!(
            resolve(server, RecordType::A, DnsClass::IN, channel.clone(), cache.clone(), &config),
            resolve(server, RecordType::Aaaa, DnsClass::IN, channel.clone(), cache.clone(), &config),
        );
        if let Ok(mut found) = v4 {
            addresses.append(&mut found);
        }
        if let Ok(mut found) = v6 {
            addresses.append(&mut found);
        }
    }

    // A service is resolved only once its server, attributes, and at least
    // one address family are all known; anything less is left `Resolving`
    // rather than reported as a done-but-empty service.
    let resolved = srv.is_some() && txt.is_some() && !addresses.is_empty();
    if !resolved {
        debug!(instance = %instance_name, "service resolution incomplete, leaving pending");
        return;
    }

    let instance = ServiceInstance {
        instance_name: instance_name.clone(),
        state: ServiceState::Resolved,
        srv,
        txt,
        addresses,
    };

    let mut map = instances.lock().await;
    map.insert(lowercase_name(&instance_name), instance.clone());
    drop(map);
    debug!(instance = %instance_name, "service resolved");
    let _ = tx.send(ServiceEvent::Added(instance));
}
