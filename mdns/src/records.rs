//! Core data model: record types, classes, attributes, and the record/entry
//! shapes carried through the codec, cache, and engine.

use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// DNS resource record type. Only the types this engine speaks on the wire
/// are named explicitly; anything else round-trips as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ptr,
    Txt,
    Aaaa,
    Srv,
    Any,
    Unknown(u16),
}

impl RecordType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => Self::A,
            12 => Self::Ptr,
            16 => Self::Txt,
            28 => Self::Aaaa,
            33 => Self::Srv,
            255 => Self::Any,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ptr => 12,
            Self::Txt => 16,
            Self::Aaaa => 28,
            Self::Srv => 33,
            Self::Any => 255,
            Self::Unknown(v) => v,
        }
    }

    /// Wildcard-aware type comparison: ANY matches anything, either side.
    pub fn matches(self, other: Self) -> bool {
        self == Self::Any || other == Self::Any || self == other
    }
}

#[allow(unreachable_patterns)]
impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::Ptr => write!(f, "PTR"),
            Self::Txt => write!(f, "TXT"),
            Self::Aaaa => write!(f, "AAAA"),
            Self::Srv => write!(f, "SRV"),
            Self::Any => write!(f, "ANY"),
            Self::Unknown(v) => write!(f, "TYPE{v}"),
        }
    }
}

/// Record class index (low 15 bits of the wire class field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassIndex {
    Internet,
    Any,
    Unknown(u16),
}

impl ClassIndex {
    fn from_u16(v: u16) -> Self {
        match v {
            1 => Self::Internet,
            255 => Self::Any,
            other => Self::Unknown(other),
        }
    }

    fn to_u16(self) -> u16 {
        match self {
            Self::Internet => 1,
            Self::Any => 255,
            Self::Unknown(v) => v,
        }
    }

    fn matches(self, other: Self) -> bool {
        self == Self::Any || other == Self::Any || self == other
    }
}

/// The 16-bit class field: a class index plus the high-bit cache-flush
/// ("unique") flag used by mDNS responses (RFC 6762 §10.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsClass {
    index: ClassIndex,
    cache_flush: bool,
}

const CACHE_FLUSH_BIT: u16 = 0x8000;

impl DnsClass {
    pub const IN: Self = Self {
        index: ClassIndex::Internet,
        cache_flush: false,
    };
    pub const ANY: Self = Self {
        index: ClassIndex::Any,
        cache_flush: false,
    };

    pub fn internet(unique: bool) -> Self {
        Self {
            index: ClassIndex::Internet,
            cache_flush: unique,
        }
    }

    pub fn from_u16(v: u16) -> Self {
        Self {
            index: ClassIndex::from_u16(v & !CACHE_FLUSH_BIT),
            cache_flush: v & CACHE_FLUSH_BIT != 0,
        }
    }

    pub fn to_u16(self) -> u16 {
        self.index.to_u16() | if self.cache_flush { CACHE_FLUSH_BIT } else { 0 }
    }

    pub fn cache_flush(self) -> bool {
        self.cache_flush
    }

    pub fn with_cache_flush(mut self, flush: bool) -> Self {
        self.cache_flush = flush;
        self
    }

    /// Wildcard-aware match on the class index alone; the cache-flush bit
    /// never participates in identity comparisons.
    pub fn matches(self, other: Self) -> bool {
        self.index.matches(other.index)
    }
}

/// Case-insensitive name/suffix comparison, ASCII-only.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

pub fn lowercase_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Base entry shared by questions and records: name + type + class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsEntry {
    pub name: String,
    pub rtype: RecordType,
    pub class: DnsClass,
}

impl DnsEntry {
    pub fn new(name: impl Into<String>, rtype: RecordType, class: DnsClass) -> Self {
        Self {
            name: name.into(),
            rtype,
            class,
        }
    }

    pub fn same_name(&self, other: &str) -> bool {
        names_equal(&self.name, other)
    }
}

pub type DnsQuestion = DnsEntry;

/// RFC 6763 TXT attribute value: present-with-value, present-without-value.
/// Absence is represented by the key simply not being in `Attributes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    NoValue,
    Value(Vec<u8>),
}

/// Ordered set of TXT key/value pairs. Duplicate and empty keys are dropped
/// on insert; first write for a given key wins, key comparison is
/// case-insensitive per RFC 6763 §6.4.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    entries: Vec<(String, AttributeValue)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key with either a value or no value. Returns `false` (and
    /// does nothing) if the key is empty or already present.
    pub fn insert(&mut self, key: impl Into<String>, value: Option<Vec<u8>>) -> bool {
        let key = key.into();
        if key.is_empty() || self.get(&key).is_some() {
            return false;
        }
        let value = match value {
            Some(v) => AttributeValue::Value(v),
            None => AttributeValue::NoValue,
        };
        self.entries.push((key, value));
        true
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, AttributeValue)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Encode as a sequence of length-prefixed `key` / `key=value` strings.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.entries.is_empty() {
            // RFC 6763 §6.1: a TXT record with no attributes is encoded as
            // a single zero-length string.
            out.push(0);
            return out;
        }
        for (key, value) in &self.entries {
            let mut s = key.clone().into_bytes();
            if let AttributeValue::Value(v) = value {
                s.push(b'=');
                s.extend_from_slice(v);
            }
            let len = s.len().min(255);
            out.push(len as u8);
            out.extend_from_slice(&s[..len]);
        }
        out
    }

    /// Decode from the wire format. Strings without `=` are valid key-only
    /// entries. Malformed length bytes truncate parsing rather than
    /// erroring, matching a lenient RFC 6763 decoder.
    pub fn decode(mut data: &[u8]) -> Self {
        let mut attrs = Self::new();
        while !data.is_empty() {
            let len = data[0] as usize;
            data = &data[1..];
            if len > data.len() {
                break;
            }
            let s = &data[..len];
            data = &data[len..];
            if s.is_empty() {
                continue;
            }
            match s.iter().position(|&b| b == b'=') {
                Some(eq) => {
                    let key = String::from_utf8_lossy(&s[..eq]).into_owned();
                    attrs.insert(key, Some(s[eq + 1..].to_vec()));
                }
                None => {
                    let key = String::from_utf8_lossy(s).into_owned();
                    attrs.insert(key, None);
                }
            }
        }
        attrs
    }
}

/// Type-specific resource record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    Address(IpAddr),
    Ptr { target: String },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        server: String,
    },
    Txt { attributes: Attributes },
    /// Anything this engine doesn't interpret, kept so `rdlen` framing can
    /// still be preserved when re-emitting unrelated records verbatim.
    Unknown(Vec<u8>),
}

/// A full resource record: entry header + TTL/creation bookkeeping + payload.
///
/// Immutable except through `RecordCache::expire`, which owns the only
/// legitimate TTL mutation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub entry: DnsEntry,
    pub ttl: Duration,
    pub creation_time: Instant,
    pub rdata: RData,
}

impl DnsRecord {
    pub fn new(entry: DnsEntry, ttl: Duration, creation_time: Instant, rdata: RData) -> Self {
        Self {
            entry,
            ttl,
            creation_time,
            rdata,
        }
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn rtype(&self) -> RecordType {
        self.entry.rtype
    }

    pub fn class(&self) -> DnsClass {
        self.entry.class
    }

    pub fn expiration(&self) -> Instant {
        self.creation_time + self.ttl
    }

    /// `max(0, expiration - now)`.
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expiration().saturating_duration_since(now)
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.remaining_ttl(now).is_zero()
    }

    /// Wildcard-aware identity match used by the cache and suppression
    /// logic: same name (case-insensitive), same type, same class.
    pub fn same_identity(&self, name: &str, rtype: RecordType, class: DnsClass) -> bool {
        self.entry.same_name(name) && self.entry.rtype.matches(rtype) && self.entry.class.matches(class)
    }

    /// A clone with `ttl` replaced by the remaining TTL at `stamp`, or
    /// `None` if already expired.
    pub fn stamped(&self, stamp: Instant) -> Option<Self> {
        let remaining = self.remaining_ttl(stamp);
        if remaining.is_zero() {
            return None;
        }
        Some(Self {
            ttl: remaining,
            ..self.clone()
        })
    }
}
