//! Engine facade (C10): register/deregister/resolve/browse/close, the
//! inbound query responder, and unique-name renaming on probe conflict.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::announcer::{announce, reannounce, Registration};
pub use crate::announcer::RegisterError;
use crate::browse_services::{ServiceBrowser, ServiceEvent};
use crate::browse_types::{TypeBrowser, META_QUERY_NAME};
use crate::cache::{run_reaper, RecordCache};
use crate::canceller::cancel;
pub use crate::canceller::DeregisterError;
use crate::channel::{Channel, ChannelError, Interface};
use crate::codec::{AnswerBuilder, Message, FLAG_AA};
use crate::config::MdnsConfig;
use crate::records::{lowercase_name, names_equal, Attributes, DnsClass, DnsEntry, DnsRecord, RData, RecordType};
pub use crate::resolver::ResolvedService;

pub struct Engine {
    channel: Arc<Channel>,
    cache: Arc<RecordCache>,
    config: MdnsConfig,
    registrations: Arc<Mutex<HashMap<String, Registration>>>,
    responder: JoinHandle<()>,
    cacher: JoinHandle<()>,
    reaper_shutdown: watch::Sender<bool>,
    reaper: JoinHandle<()>,
}

impl Engine {
    /// Binds the channel, starts the cache reaper, the inbound cacher, and
    /// the inbound query responder, and returns a ready-to-use engine
    /// handle.
    pub async fn start(interfaces: &[Interface], config: MdnsConfig) -> Result<Arc<Self>, ChannelError> {
        let channel = Arc::new(Channel::bind(interfaces, &config)?);
        channel.clone().enable().await;
        let cache = Arc::new(RecordCache::new(config.ttl_expiry()));
        let registrations: Arc<Mutex<HashMap<String, Registration>>> = Arc::new(Mutex::new(HashMap::new()));

        let (reaper_shutdown, shutdown_rx) = watch::channel(false);
        let reaper = tokio::spawn(run_reaper(cache.clone(), config.reaper_interval(), shutdown_rx));
        let cacher = tokio::spawn(cache_inbound_records(channel.clone(), cache.clone()));
        let responder = tokio::spawn(respond_to_queries(channel.clone(), registrations.clone(), config.ttl_default()));

        Ok(Arc::new(Self {
            channel,
            cache,
            config,
            registrations,
            responder,
            cacher,
            reaper_shutdown,
            reaper,
        }))
    }

    /// Registers a service, probing for conflicts first. On conflict the
    /// instance name is retried with a numeric suffix ("Name (2)", "Name
    /// (3)", ...) a bounded number of times before giving up. Returns the
    /// name the service was actually registered under.
    pub async fn register(&self, instance_name: &str, records: Vec<DnsRecord>) -> Result<String, RegisterError> {
        const MAX_ATTEMPTS: u32 = 10;
        let mut candidate = instance_name.to_string();

        for attempt in 1..=MAX_ATTEMPTS {
            let renamed_records = rename_records(&records, instance_name, &candidate);
            let registration = Registration::new(candidate.clone(), renamed_records);
            match announce(registration, self.channel.clone(), self.cache.clone(), &self.config).await {
                Ok(registration) => {
                    self.registrations.lock().await.insert(lowercase_name(&candidate), registration);
                    return Ok(candidate);
                }
                Err(RegisterError::NameConflict(_)) if attempt < MAX_ATTEMPTS => {
                    candidate = format!("{instance_name} ({})", attempt + 1);
                    warn!(attempt, candidate = %candidate, "name conflict during probe, retrying with suffix");
                }
                Err(e) => return Err(e),
            }
        }
        Err(RegisterError::NameConflict(instance_name.to_string()))
    }

    pub async fn deregister(&self, instance_name: &str) -> Result<(), DeregisterError> {
        let registration = self.registrations.lock().await.remove(&lowercase_name(instance_name));
        let Some(registration) = registration else {
            return Ok(());
        };
        cancel(
            &registration.instance_name,
            registration.records,
            self.channel.clone(),
            self.cache.clone(),
            &self.config,
        )
        .await
    }

    pub async fn deregister_all(&self) -> Result<(), DeregisterError> {
        let all: Vec<Registration> = self.registrations.lock().await.drain().map(|(_, v)| v).collect();
        for registration in all {
            cancel(
                &registration.instance_name,
                registration.records,
                self.channel.clone(),
                self.cache.clone(),
                &self.config,
            )
            .await?;
        }
        Ok(())
    }

    /// Resolves one service instance of `service_type` (e.g. `"_music._tcp."`)
    /// into its server, port, attributes, and addresses. Cleans expired
    /// cache entries first, then composes SRV+TXT+A+AAAA from cache and, if
    /// needed, the network, bounded by `timeout` (defaults to
    /// `config.resolution_timeout()`).
    pub async fn resolve(&self, instance_name: &str, service_type: &str, timeout: Option<Duration>) -> Option<ResolvedService> {
        self.cache.clean(Instant::now()).await;
        let timeout = timeout.unwrap_or_else(|| self.config.resolution_timeout());
        let qualified = qualify(instance_name, service_type);
        crate::resolver::resolve_service(&qualified, self.channel.clone(), self.cache.clone(), &self.config, timeout).await
    }

    /// Mutates a registered service's TXT attributes and re-announces it:
    /// probing is skipped, and only the first announcement in the batch is
    /// awaited before returning.
    pub async fn change_attributes(&self, instance_name: &str, attributes: Attributes) -> Result<(), RegisterError> {
        let mut registrations = self.registrations.lock().await;
        let Some(registration) = registrations.get_mut(&lowercase_name(instance_name)) else {
            return Err(RegisterError::NotRegistered(instance_name.to_string()));
        };
        for record in registration.records.iter_mut() {
            if let RData::Txt { .. } = &record.rdata {
                record.rdata = RData::Txt {
                    attributes: attributes.clone(),
                };
            }
        }
        let snapshot = registration.clone();
        drop(registrations);

        reannounce(&snapshot, self.channel.clone(), self.cache.clone(), &self.config).await
    }

    pub fn browse_types(&self, on_discovered: impl FnMut(String) + Send + 'static) -> TypeBrowser {
        TypeBrowser::start(self.channel.clone(), &self.config, on_discovered)
    }

    pub fn browse_services(
        &self,
        registration_type: impl Into<String>,
        on_event: impl FnMut(ServiceEvent) + Send + 'static,
    ) -> ServiceBrowser {
        ServiceBrowser::start(registration_type, self.channel.clone(), self.cache.clone(), self.config.clone(), on_event)
    }

    /// Sends goodbyes for every live registration, then tears down
    /// background tasks and sockets.
    pub async fn close(&self) {
        if let Err(e) = self.deregister_all().await {
            warn!(error = %e, "error sending goodbyes during close");
        }
        let _ = self.reaper_shutdown.send(true);
        self.responder.abort();
        self.cacher.abort();
        self.reaper.abort();
        self.channel.close().await;
        info!("mdns engine closed");
    }
}

/// Joins an instance name and a (possibly trailing-dot) registration type
/// into a qualified `.local.` service name, e.g. `("LivingRoom",
/// "_music._tcp.")` → `"LivingRoom._music._tcp.local."`.
fn qualify(instance_name: &str, service_type: &str) -> String {
    let service_type = service_type.trim_end_matches('.');
    format!("{instance_name}.{service_type}.local.")
}

/// Renames the owner name of every record (and any self-referential PTR
/// target) from `old_name` to `new_name`; used when a probe conflict forces
/// a numeric-suffix rename.
fn rename_records(records: &[DnsRecord], old_name: &str, new_name: &str) -> Vec<DnsRecord> {
    if names_equal(old_name, new_name) {
        return records.to_vec();
    }
    records
        .iter()
        .map(|r| {
            let mut entry = r.entry.clone();
            if names_equal(&entry.name, old_name) {
                entry.name = new_name.to_string();
            }
            let rdata = match &r.rdata {
                RData::Ptr { target } if names_equal(target, old_name) => RData::Ptr {
                    target: new_name.to_string(),
                },
                other => other.clone(),
            };
            DnsRecord::new(entry, r.ttl, r.creation_time, rdata)
        })
        .collect()
}

/// Ingests every record carried by inbound responses into the shared cache:
/// live records are added, TTL=0 goodbyes expire the matching cache entry
/// instead. Queries are not cached — only answer/authority/additional
/// records from responses are, matching RFC 6762's cache-update rule.
async fn cache_inbound_records(channel: Arc<Channel>, cache: Arc<RecordCache>) {
    let mut inbound = channel.subscribe();
    loop {
        let received = match inbound.recv().await {
            Ok(r) => r,
            Err(RecvError::Closed) => return,
            Err(RecvError::Lagged(_)) => continue,
        };
        if !received.message.is_response() {
            continue;
        }
        for record in received.message.all_records() {
            if record.ttl.is_zero() {
                cache.expire(record.name(), record.rtype(), record.class()).await;
            } else {
                cache.add(record.clone()).await;
            }
        }
    }
}

/// One PTR answer per distinct registration type this engine currently owns
/// a registration under, answering the DNS-SD meta-query (RFC 6763 §9).
fn meta_answers(registrations: &HashMap<String, Registration>, ttl_default: Duration, now: Instant) -> Vec<DnsRecord> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for registration in registrations.values() {
        for record in &registration.records {
            if record.rtype() != RecordType::Ptr {
                continue;
            }
            let registration_type = record.name().to_string();
            if seen.insert(lowercase_name(&registration_type)) {
                out.push(DnsRecord::new(
                    DnsEntry::new(META_QUERY_NAME, RecordType::Ptr, DnsClass::IN),
                    ttl_default,
                    now,
                    RData::Ptr { target: registration_type },
                ));
            }
        }
    }
    out
}

/// The engine's own responder: answers inbound queries about this engine's
/// own registrations, applying known-answer suppression against the query
/// itself. Two cases: the DNS-SD meta-query answers one PTR per
/// registration type; everything else answers only from the engine's own
/// registered records, attaching A/AAAA as additionals when answering an
/// exact (non-ANY) SRV question.
async fn respond_to_queries(channel: Arc<Channel>, registrations: Arc<Mutex<HashMap<String, Registration>>>, ttl_default: Duration) {
    let mut inbound = channel.subscribe();
    loop {
        let received = match inbound.recv().await {
            Ok(r) => r,
            Err(RecvError::Closed) => return,
            Err(RecvError::Lagged(_)) => continue,
        };
        if received.message.is_response() {
            continue;
        }

        let now = Instant::now();
        let regs = registrations.lock().await;
        let mut builder = AnswerBuilder::new(Some(&received.message));
        let mut additionals: Vec<DnsRecord> = Vec::new();

        for question in &received.message.questions {
            if names_equal(&question.name, META_QUERY_NAME)
                && question.rtype.matches(RecordType::Ptr)
                && DnsClass::IN.matches(question.class)
            {
                for answer in meta_answers(&regs, ttl_default, now) {
                    builder.add_stamped(&answer, now);
                }
                continue;
            }

            for registration in regs.values() {
                for candidate in &registration.records {
                    if !candidate.same_identity(&question.name, question.rtype, question.class) {
                        continue;
                    }
                    builder.add_stamped(candidate, now);

                    if candidate.rtype() != RecordType::Srv || question.rtype != RecordType::Srv {
                        continue;
                    }
                    let RData::Srv { server, .. } = &candidate.rdata else {
                        continue;
                    };
                    for other in &registration.records {
                        let is_address = matches!(other.rtype(), RecordType::A | RecordType::Aaaa);
                        if is_address && names_equal(other.name(), server) {
                            if let Some(stamped) = other.stamped(now) {
                                additionals.push(stamped);
                            }
                        }
                    }
                }
            }
        }
        drop(regs);

        if builder.is_empty() {
            continue;
        }

        let mut response = Message::response(FLAG_AA);
        response.answers = builder.into_answers();
        response.additionals = additionals;
        let _ = channel.send(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DnsEntry;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn loopback() -> Vec<Interface> {
        vec![Interface {
            name: "lo".to_string(),
            index: 1,
            ipv4: Some(Ipv4Addr::LOCALHOST),
            ipv6: None,
            is_loopback: true,
        }]
    }

    fn srv_record(instance: &str) -> DnsRecord {
        DnsRecord::new(
            DnsEntry::new(instance, RecordType::Srv, DnsClass::internet(true)),
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

    #[tokio::test]
    async fn register_and_deregister_round_trip() {
        let mut config = MdnsConfig::default();
        config.port = 15359;
        config.probing_interval_ms = 5;
        config.probing_number = 1;
        config.announcement_interval_ms = 5;
        config.announcement_number = 1;
        config.cancellation_interval_ms = 5;
        config.cancellation_number = 1;

        let engine = Engine::start(&loopback(), config).await.unwrap();
        let name = engine.register("My Printer._http._tcp.local.", vec![srv_record("My Printer._http._tcp.local.")]).await.unwrap();
        assert_eq!(name, "My Printer._http._tcp.local.");

        engine.deregister(&name).await.unwrap();
        engine.close().await;
    }

    #[test]
    fn rename_records_updates_owner_and_ptr_target() {
        let records = vec![srv_record("My Printer._http._tcp.local.")];
        let renamed = rename_records(&records, "My Printer._http._tcp.local.", "My Printer (2)._http._tcp.local.");
        assert_eq!(renamed[0].name(), "My Printer (2)._http._tcp.local.");
    }

    #[test]
    fn qualify_builds_service_name() {
        assert_eq!(qualify("LivingRoom", "_music._tcp."), "LivingRoom._music._tcp.local.");
    }

    #[test]
    fn meta_answers_one_ptr_per_registration_type() {
        let mut regs = HashMap::new();
        regs.insert(
            "my printer._http._tcp.local.".to_string(),
            Registration::new(
                "My Printer._http._tcp.local.",
                vec![
                    DnsRecord::new(
                        DnsEntry::new("_http._tcp.local.", RecordType::Ptr, DnsClass::IN),
                        Duration::from_secs(4500),
                        Instant::now(),
                        RData::Ptr {
                            target: "My Printer._http._tcp.local.".to_string(),
                        },
                    ),
                    srv_record("My Printer._http._tcp.local."),
                ],
            ),
        );

        let answers = meta_answers(&regs, Duration::from_secs(4500), Instant::now());
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].name(), META_QUERY_NAME);
        assert!(matches!(&answers[0].rdata, RData::Ptr { target } if names_equal(target, "_http._tcp.local.")));
    }

    #[tokio::test]
    async fn cache_inbound_records_caches_response_answers() {
        let mut config = MdnsConfig::default();
        config.port = 15362;
        let channel = Arc::new(Channel::bind(&loopback(), &config).unwrap());
        channel.clone().enable().await;
        let cache = Arc::new(RecordCache::new(Duration::from_millis(1)));
        let task = tokio::spawn(cache_inbound_records(channel.clone(), cache.clone()));

        let mut inbound = channel.subscribe();
        let mut response = Message::response(FLAG_AA);
        response.answers.push(srv_record("My Printer._http._tcp.local."));
        let _ = channel.send(response);
        let _ = tokio::time::timeout(Duration::from_millis(200), inbound.recv()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.entries("My Printer._http._tcp.local.").await.len(), 1);
        task.abort();
    }

    #[tokio::test]
    async fn change_attributes_reannounces_without_probing() {
        let mut config = MdnsConfig::default();
        config.port = 15363;
        config.probing_interval_ms = 5;
        config.probing_number = 1;
        config.announcement_interval_ms = 5;
        config.announcement_number = 1;

        let engine = Engine::start(&loopback(), config).await.unwrap();
        let instance = "My Printer._http._tcp.local.";
        let records = vec![
            srv_record(instance),
            DnsRecord::new(
                DnsEntry::new(instance, RecordType::Txt, DnsClass::internet(true)),
                Duration::from_secs(4500),
                Instant::now(),
                RData::Txt {
                    attributes: Attributes::new(),
                },
            ),
        ];
        engine.register(instance, records).await.unwrap();

        let mut attrs = Attributes::new();
        attrs.insert("ready", None);
        engine.change_attributes(instance, attrs).await.unwrap();

        let cached = engine.cache.get(instance, RecordType::Txt, DnsClass::IN).await.unwrap();
        let RData::Txt { attributes } = cached.rdata else {
            panic!("expected txt record");
        };
        assert!(attributes.contains_key("ready"));

        engine.close().await;
    }

    #[tokio::test]
    async fn change_attributes_errors_for_unknown_instance() {
        let mut config = MdnsConfig::default();
        config.port = 15364;
        let engine = Engine::start(&loopback(), config).await.unwrap();

        let result = engine.change_attributes("Nobody._http._tcp.local.", Attributes::new()).await;
        assert!(matches!(result, Err(RegisterError::NotRegistered(_))));
        engine.close().await;
    }
}
