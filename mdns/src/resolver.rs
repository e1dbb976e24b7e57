//! Resolver (C7): cache-first resolution of a single `(name, type, class)`,
//! falling back to the network with an increasing query rate (RFC 6762
//! §5.2) when nothing is cached yet.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;

use crate::cache::RecordCache;
use crate::channel::Channel;
use crate::codec::Message;
use crate::config::MdnsConfig;
use crate::records::{names_equal, Attributes, DnsClass, DnsEntry, DnsRecord, RData, RecordType};
use crate::scheduler::schedule_increasingly;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("resolution timed out after {0:?}")]
    Timeout(Duration),
}

fn query_message(name: &str, rtype: RecordType, class: DnsClass) -> Message {
    let mut msg = Message::query(0);
    msg.questions.push(DnsEntry::new(name, rtype, class));
    msg
}

async fn matching(cache: &RecordCache, name: &str, rtype: RecordType, class: DnsClass) -> Vec<DnsRecord> {
    cache
        .entries(name)
        .await
        .into_iter()
        .filter(|r| r.same_identity(name, rtype, class))
        .collect()
}

/// Resolves `(name, rtype, class)`, preferring whatever is already cached.
/// `config.querying_number` is a hint only; the increasing-rate sender runs,
/// uncapped in iteration count, until the overall `resolution_timeout`
/// fires or a cache hit cancels it early.
pub async fn resolve(
    name: &str,
    rtype: RecordType,
    class: DnsClass,
    channel: Arc<Channel>,
    cache: Arc<RecordCache>,
    config: &MdnsConfig,
) -> Result<Vec<DnsRecord>, ResolveError> {
    let cached = matching(&cache, name, rtype, class).await;
    if !cached.is_empty() {
        return Ok(cached);
    }

    let query = query_message(name, rtype, class);
    let delay_ceiling = config.querying_delay_ms.max(20);
    let initial_delay = Duration::from_millis(rand::rng().random_range(20..=delay_ceiling));

    let send_channel = channel.clone();
    let handle = schedule_increasingly(
        move || {
            let channel = send_channel.clone();
            let query = query.clone();
            async move {
                let _ = channel.send(query);
            }
        },
        initial_delay,
        config.querying_interval(),
        config.querying_backoff_factor,
        config.querying_max_interval(),
    );

    let name_owned = name.to_string();
    let cache_poll = cache.clone();
    let poll = async move {
        loop {
            let found = matching(&cache_poll, &name_owned, rtype, class).await;
            if !found.is_empty() {
                return found;
            }
            tokio::time::sleep(config.resolution_interval()).await;
        }
    };

    let result = tokio::time::timeout(config.resolution_timeout(), poll).await;
    handle.cancel();

    result.map_err(|_| ResolveError::Timeout(config.resolution_timeout()))
}

// ---------------------------------------------------------------------
// Service-level resolution
// ---------------------------------------------------------------------

/// A fully resolved service instance: server, port, attributes, and at
/// least one of its addresses.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub instance_name: String,
    pub server: String,
    pub port: u16,
    pub attributes: Attributes,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

#[derive(Default)]
struct PartialService {
    server: Option<String>,
    port: Option<u16>,
    srv_record: Option<DnsRecord>,
    attributes: Option<Attributes>,
    txt_record: Option<DnsRecord>,
    ipv4: Vec<Ipv4Addr>,
    ipv4_records: Vec<DnsRecord>,
    ipv6: Vec<Ipv6Addr>,
    ipv6_records: Vec<DnsRecord>,
}

impl PartialService {
    fn is_resolved(&self) -> bool {
        self.server.is_some() && self.attributes.is_some() && (!self.ipv4.is_empty() || !self.ipv6.is_empty())
    }

    fn into_resolved(self, instance_name: &str) -> ResolvedService {
        ResolvedService {
            instance_name: instance_name.to_string(),
            server: self.server.unwrap_or_default(),
            port: self.port.unwrap_or_default(),
            attributes: self.attributes.unwrap_or_default(),
            ipv4: self.ipv4,
            ipv6: self.ipv6,
        }
    }

    /// Builds the known-answer hints to attach to the next resolution query:
    /// whatever of SRV/TXT/A/AAAA is already known.
    fn known_answers(&self) -> Vec<DnsRecord> {
        let mut out = Vec::new();
        out.extend(self.srv_record.clone());
        out.extend(self.txt_record.clone());
        out.extend(self.ipv4_records.iter().cloned());
        out.extend(self.ipv6_records.iter().cloned());
        out
    }
}

/// Applies the record-update rule: a record whose name matches the
/// qualified service name feeds SRV/TXT; a record whose name matches the
/// already-known server feeds A/AAAA. Expired records are ignored.
fn apply_record(state: &mut PartialService, instance_name: &str, record: &DnsRecord, now: Instant) {
    if record.expired(now) {
        return;
    }
    if names_equal(record.name(), instance_name) {
        match &record.rdata {
            RData::Srv { port, server, .. } => {
                state.port = Some(*port);
                state.server = Some(server.clone());
                state.srv_record = Some(record.clone());
            }
            RData::Txt { attributes } => {
                state.attributes = Some(attributes.clone());
                state.txt_record = Some(record.clone());
            }
            _ => {}
        }
    }
    let Some(server) = state.server.clone() else {
        return;
    };
    if !names_equal(record.name(), &server) {
        return;
    }
    match record.rdata {
        RData::Address(IpAddr::V4(ip)) if record.rtype() == RecordType::A => {
            if !state.ipv4.contains(&ip) {
                state.ipv4.push(ip);
                state.ipv4_records.push(record.clone());
            }
        }
        RData::Address(IpAddr::V6(ip)) if record.rtype() == RecordType::Aaaa => {
            if !state.ipv6.contains(&ip) {
                state.ipv6.push(ip);
                state.ipv6_records.push(record.clone());
            }
        }
        _ => {}
    }
}

async fn gather_from_cache(cache: &RecordCache, instance_name: &str, now: Instant) -> PartialService {
    let mut state = PartialService::default();
    for record in cache.entries(instance_name).await {
        apply_record(&mut state, instance_name, &record, now);
    }
    if let Some(server) = state.server.clone() {
        for record in cache.entries(&server).await {
            apply_record(&mut state, instance_name, &record, now);
        }
    }
    state
}

fn resolution_query(instance_name: &str, state: &PartialService) -> Message {
    let mut msg = Message::query(0);
    msg.questions.push(DnsEntry::new(instance_name, RecordType::Srv, DnsClass::IN));
    msg.questions.push(DnsEntry::new(instance_name, RecordType::Txt, DnsClass::IN));
    if let Some(server) = &state.server {
        msg.questions.push(DnsEntry::new(server, RecordType::A, DnsClass::IN));
        msg.questions.push(DnsEntry::new(server, RecordType::Aaaa, DnsClass::IN));
    }
    msg.answers = state.known_answers();
    msg
}

/// Resolves `instance_name` (already qualified, e.g.
/// `"LivingRoom._music._tcp.local."`) into server/port/attributes/addresses,
/// composing cached and then network SRV+TXT+A+AAAA records.
///
/// Step 1/2: populate from cache and return immediately if already
/// resolved. Step 3: compute the resolution delay schedule, starting at
/// `config.resolution_interval()` and doubling each step until the
/// cumulative total would exceed `timeout` (the last step is the
/// remainder). Step 4: for each delay, send a composed query with
/// known-answer hints and wait for the state to become resolved, bounded by
/// the delay. Step 5: return resolved-or-none.
pub async fn resolve_service(
    instance_name: &str,
    channel: Arc<Channel>,
    cache: Arc<RecordCache>,
    config: &MdnsConfig,
    timeout: Duration,
) -> Option<ResolvedService> {
    let now = Instant::now();
    let mut state = gather_from_cache(&cache, instance_name, now).await;
    if state.is_resolved() {
        return Some(state.into_resolved(instance_name));
    }

    let interval = config.resolution_interval();
    if timeout <= interval {
        return None;
    }

    let mut delays = Vec::new();
    let mut delay = interval;
    let mut elapsed = Duration::ZERO;
    while elapsed + delay < timeout {
        delays.push(delay);
        elapsed += delay;
        delay = delay.saturating_mul(2);
    }
    let remainder = timeout.saturating_sub(elapsed);
    if !remainder.is_zero() {
        delays.push(remainder);
    }

    let mut inbound = channel.subscribe();
    for step_delay in delays {
        let query = resolution_query(instance_name, &state);
        let _ = channel.send(query);

        let deadline = tokio::time::sleep(step_delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                received = inbound.recv() => {
                    match received {
                        Ok(r) if r.message.is_response() => {
                            let now = Instant::now();
                            for record in r.message.all_records() {
                                apply_record(&mut state, instance_name, record, now);
                            }
                            if state.is_resolved() {
                                break;
                            }
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        if state.is_resolved() {
            return Some(state.into_resolved(instance_name));
        }
    }

    None
}
