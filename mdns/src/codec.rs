//! DNS wire codec: message framing, RFC 1035 §4.1.4 name compression, and
//! answer-suppression helpers.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::records::{Attributes, DnsClass, DnsEntry, DnsQuestion, DnsRecord, RData, RecordType};

pub const MAX_MESSAGE_SIZE: usize = 65_536;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("message exceeds {MAX_MESSAGE_SIZE} bytes")]
    TooLarge,
    #[error("buffer truncated at offset {0}")]
    Truncated(usize),
    #[error("malformed name at offset {0}")]
    MalformedName(usize),
}

pub const FLAG_QUERY: u16 = 0x0000;
pub const FLAG_RESPONSE: u16 = 0x8000;
pub const FLAG_QR_MASK: u16 = 0x8000;
pub const FLAG_AA: u16 = 0x0400;

/// Fold a base flag value with caller-provided extras (e.g. `FLAG_RESPONSE | FLAG_AA`).
pub fn build_flags(base: u16, extra: u16) -> u16 {
    base | extra
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl Message {
    pub fn query(flags_extra: u16) -> Self {
        Self {
            flags: build_flags(FLAG_QUERY, flags_extra),
            ..Default::default()
        }
    }

    pub fn response(flags_extra: u16) -> Self {
        Self {
            flags: build_flags(FLAG_RESPONSE, flags_extra),
            ..Default::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR_MASK != 0
    }

    pub fn is_authoritative(&self) -> bool {
        self.flags & FLAG_AA != 0
    }

    pub fn all_records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
    }

    pub fn has_answers(&self) -> bool {
        !self.answers.is_empty()
    }
}

// ---------------------------------------------------------------------
// Name compression
// ---------------------------------------------------------------------

fn split_labels(name: &str) -> Vec<&str> {
    if name.is_empty() {
        Vec::new()
    } else {
        name.split('.').filter(|l| !l.is_empty()).collect()
    }
}

struct NameEncoder {
    // lowercased remaining-suffix -> offset in the message this suffix was
    // first written at (RFC 1035 §4.1.4).
    suffixes: HashMap<String, u16>,
}

impl NameEncoder {
    fn new() -> Self {
        Self {
            suffixes: HashMap::new(),
        }
    }

    fn encode(&mut self, name: &str, buf: &mut Vec<u8>) {
        let labels = split_labels(name);
        for i in 0..labels.len() {
            let suffix = labels[i..].join(".").to_ascii_lowercase();
            if let Some(&offset) = self.suffixes.get(&suffix) {
                let ptr = 0xC000u16 | offset;
                buf.extend_from_slice(&ptr.to_be_bytes());
                return;
            }
            let offset = buf.len();
            if offset <= 0x3FFF {
                self.suffixes.insert(suffix, offset as u16);
            }
            let label = labels[i].as_bytes();
            let len = label.len().min(63);
            buf.push(len as u8);
            buf.extend_from_slice(&label[..len]);
        }
        buf.push(0);
    }
}

const MAX_POINTER_JUMPS: usize = 16;

fn decode_name(buf: &[u8], mut offset: usize) -> Result<(String, usize), CodecError> {
    let mut labels: Vec<String> = Vec::new();
    let mut jumped = false;
    let mut end_offset = 0usize;
    let mut jumps = 0usize;

    loop {
        if offset >= buf.len() {
            return Err(CodecError::Truncated(offset));
        }
        let len = buf[offset] as usize;

        if len & 0xC0 == 0xC0 {
            if offset + 1 >= buf.len() {
                return Err(CodecError::Truncated(offset));
            }
            if !jumped {
                end_offset = offset + 2;
            }
            offset = ((len & 0x3F) << 8) | (buf[offset + 1] as usize);
            jumped = true;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(CodecError::MalformedName(offset));
            }
            continue;
        }

        if len == 0 {
            if !jumped {
                end_offset = offset + 1;
            }
            break;
        }

        if len > 63 {
            return Err(CodecError::MalformedName(offset));
        }
        offset += 1;
        if offset + len > buf.len() {
            return Err(CodecError::Truncated(offset));
        }
        let label = String::from_utf8_lossy(&buf[offset..offset + len]).into_owned();
        labels.push(label);
        offset += len;
    }

    Ok((labels.join("."), end_offset))
}

// ---------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------

struct Counts {
    qd: u16,
    an: u16,
    ns: u16,
    ar: u16,
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, CodecError> {
    buf.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(CodecError::Truncated(at))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, CodecError> {
    buf.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(CodecError::Truncated(at))
}

// ---------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------

pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(512);
    // 12-byte header; transaction id is ignored for mDNS, emitted as 0.
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&message.flags.to_be_bytes());
    buf.extend_from_slice(&(message.questions.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(message.answers.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(message.authorities.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(message.additionals.len() as u16).to_be_bytes());

    let mut names = NameEncoder::new();

    for q in &message.questions {
        names.encode(&q.name, &mut buf);
        buf.extend_from_slice(&q.rtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&q.class.to_u16().to_be_bytes());
    }

    for section in [&message.answers, &message.authorities, &message.additionals] {
        for record in section.iter() {
            encode_record(record, &mut names, &mut buf);
        }
    }

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge);
    }
    Ok(buf)
}

fn encode_record(record: &DnsRecord, names: &mut NameEncoder, buf: &mut Vec<u8>) {
    names.encode(&record.entry.name, buf);
    buf.extend_from_slice(&record.entry.rtype.to_u16().to_be_bytes());
    buf.extend_from_slice(&record.entry.class.to_u16().to_be_bytes());
    buf.extend_from_slice(&(record.ttl.as_secs() as u32).to_be_bytes());

    let rdlen_at = buf.len();
    buf.extend_from_slice(&0u16.to_be_bytes());
    let rdata_start = buf.len();

    match &record.rdata {
        RData::Address(std::net::IpAddr::V4(ip)) => buf.extend_from_slice(&ip.octets()),
        RData::Address(std::net::IpAddr::V6(ip)) => buf.extend_from_slice(&ip.octets()),
        RData::Ptr { target } => names.encode(target, buf),
        RData::Srv {
            priority: _,
            weight: _,
            port,
            server,
        } => {
            // priority/weight are always emitted as 0 (§3: "carried as 0 on emit").
            buf.extend_from_slice(&0u16.to_be_bytes());
            buf.extend_from_slice(&0u16.to_be_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
            names.encode(server, buf);
        }
        RData::Txt { attributes } => buf.extend_from_slice(&attributes.encode()),
        RData::Unknown(raw) => buf.extend_from_slice(raw),
    }

    let rdlen = (buf.len() - rdata_start) as u16;
    buf[rdlen_at..rdlen_at + 2].copy_from_slice(&rdlen.to_be_bytes());
}

// ---------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------

pub fn decode(buf: &[u8], now: Instant) -> Result<Message, CodecError> {
    if buf.len() < 12 {
        return Err(CodecError::Truncated(buf.len()));
    }
    let flags = read_u16(buf, 2)?;
    let counts = Counts {
        qd: read_u16(buf, 4)?,
        an: read_u16(buf, 6)?,
        ns: read_u16(buf, 8)?,
        ar: read_u16(buf, 10)?,
    };

    let mut offset = 12usize;
    let mut questions = Vec::with_capacity(counts.qd as usize);
    for _ in 0..counts.qd {
        let (name, next) = decode_name(buf, offset)?;
        offset = next;
        let rtype = RecordType::from_u16(read_u16(buf, offset)?);
        let class = DnsClass::from_u16(read_u16(buf, offset + 2)?);
        offset += 4;
        questions.push(DnsEntry::new(name, rtype, class));
    }

    let mut message = Message {
        flags,
        questions,
        ..Default::default()
    };

    for (count, section) in [
        (counts.an, &mut message.answers),
        (counts.ns, &mut message.authorities),
        (counts.ar, &mut message.additionals),
    ] {
        for _ in 0..count {
            let (record, next) = decode_record(buf, offset, now)?;
            offset = next;
            section.push(record);
        }
    }

    Ok(message)
}

fn decode_record(buf: &[u8], offset: usize, now: Instant) -> Result<(DnsRecord, usize), CodecError> {
    let (name, mut offset) = decode_name(buf, offset)?;
    let rtype = RecordType::from_u16(read_u16(buf, offset)?);
    let class = DnsClass::from_u16(read_u16(buf, offset + 2)?);
    let ttl = read_u32(buf, offset + 4)?;
    let rdlen = read_u16(buf, offset + 8)? as usize;
    offset += 10;

    let rdata_start = offset;
    let rdata_end = rdata_start
        .checked_add(rdlen)
        .filter(|&end| end <= buf.len())
        .ok_or(CodecError::Truncated(rdata_start))?;
    let rdata_buf = &buf[rdata_start..rdata_end];

    let rdata = match rtype {
        RecordType::A => {
            if rdata_buf.len() != 4 {
                RData::Unknown(rdata_buf.to_vec())
            } else {
                RData::Address(Ipv4Addr::new(rdata_buf[0], rdata_buf[1], rdata_buf[2], rdata_buf[3]).into())
            }
        }
        RecordType::Aaaa => {
            if rdata_buf.len() != 16 {
                RData::Unknown(rdata_buf.to_vec())
            } else {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata_buf);
                RData::Address(Ipv6Addr::from(octets).into())
            }
        }
        RecordType::Ptr => {
            let (target, _) = decode_name(buf, rdata_start)?;
            RData::Ptr { target }
        }
        RecordType::Srv => {
            if rdata_buf.len() < 6 {
                RData::Unknown(rdata_buf.to_vec())
            } else {
                let priority = u16::from_be_bytes([rdata_buf[0], rdata_buf[1]]);
                let weight = u16::from_be_bytes([rdata_buf[2], rdata_buf[3]]);
                let port = u16::from_be_bytes([rdata_buf[4], rdata_buf[5]]);
                let (server, _) = decode_name(buf, rdata_start + 6)?;
                RData::Srv {
                    priority,
                    weight,
                    port,
                    server,
                }
            }
        }
        RecordType::Txt => RData::Txt {
            attributes: Attributes::decode(rdata_buf),
        },
        // Unknown types are skipped by rdlen, preserving parser position.
        RecordType::Any | RecordType::Unknown(_) => RData::Unknown(rdata_buf.to_vec()),
    };

    let record = DnsRecord::new(
        DnsEntry::new(name, rtype, class),
        Duration::from_secs(ttl as u64),
        now,
        rdata,
    );
    Ok((record, rdata_end))
}

// ---------------------------------------------------------------------
// Answer suppression & building (§4.1)
// ---------------------------------------------------------------------

/// An answer is suppressed iff the query's answers/authorities/additionals
/// contain a record with the same name (case-insensitive), type, and class
/// whose TTL is at least half of the candidate's TTL.
pub fn is_suppressed(query: &Message, candidate: &DnsRecord) -> bool {
    query.all_records().any(|known| {
        known.same_identity(&candidate.entry.name, candidate.entry.rtype, candidate.entry.class)
            && known.ttl.as_secs_f64() >= candidate.ttl.as_secs_f64() / 2.0
    })
}

/// Accumulates answers for a response, applying known-answer suppression
/// against an optional query and the two TTL-emission modes from §4.1.
pub struct AnswerBuilder<'a> {
    query: Option<&'a Message>,
    out: Vec<DnsRecord>,
}

impl<'a> AnswerBuilder<'a> {
    pub fn new(query: Option<&'a Message>) -> Self {
        Self {
            query,
            out: Vec::new(),
        }
    }

    fn suppressed(&self, record: &DnsRecord) -> bool {
        self.query.is_some_and(|q| is_suppressed(q, record))
    }

    /// Stamped mode: drop if already expired at `stamp`; emit with remaining TTL.
    pub fn add_stamped(&mut self, record: &DnsRecord, stamp: Instant) -> bool {
        let Some(stamped) = record.stamped(stamp) else {
            return false;
        };
        if self.suppressed(&stamped) {
            return false;
        }
        self.out.push(stamped);
        true
    }

    /// Unstamped mode: emitted verbatim with its own TTL.
    pub fn add_unstamped(&mut self, record: DnsRecord) -> bool {
        if self.suppressed(&record) {
            return false;
        }
        self.out.push(record);
        true
    }

    pub fn into_answers(self) -> Vec<DnsRecord> {
        self.out
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{DnsClass, RecordType};
    use std::net::Ipv4Addr;

    fn addr_record(name: &str, ip: Ipv4Addr, ttl_secs: u64, now: Instant) -> DnsRecord {
        DnsRecord::new(
            DnsEntry::new(name, RecordType::A, DnsClass::IN),
            Duration::from_secs(ttl_secs),
            now,
            RData::Address(ip.into()),
        )
    }

    #[test]
    fn encode_decode_roundtrip_names_types_classes() {
        let now = Instant::now();
        let mut msg = Message::response(FLAG_AA);
        msg.answers.push(addr_record("host.local.", Ipv4Addr::new(10, 0, 0, 1), 120, now));
        msg.answers.push(DnsRecord::new(
            DnsEntry::new("_http._tcp.local.", RecordType::Ptr, DnsClass::IN),
            Duration::from_secs(4500),
            now,
            RData::Ptr {
                target: "Instance._http._tcp.local.".to_string(),
            },
        ));

        let bytes = encode(&msg).unwrap();
        let decoded = decode(&bytes, now).unwrap();

        assert_eq!(decoded.answers.len(), 2);
        assert!(decoded.is_response());
        assert!(decoded.is_authoritative());
        assert_eq!(decoded.answers[0].name(), "host.local.");
        assert_eq!(decoded.answers[0].rtype(), RecordType::A);
        if let RData::Ptr { target } = &decoded.answers[1].rdata {
            assert!(crate::records::names_equal(target, "Instance._http._tcp.local."));
        } else {
            panic!("expected PTR");
        }
    }

    #[test]
    fn compression_round_trip_with_recurring_suffix() {
        let now = Instant::now();
        let mut msg = Message::query(0);
        msg.answers.push(DnsRecord::new(
            DnsEntry::new("a.example.local.", RecordType::A, DnsClass::IN),
            Duration::from_secs(1),
            now,
            RData::Address(Ipv4Addr::new(1, 1, 1, 1).into()),
        ));
        msg.answers.push(DnsRecord::new(
            DnsEntry::new("b.example.local.", RecordType::A, DnsClass::IN),
            Duration::from_secs(1),
            now,
            RData::Address(Ipv4Addr::new(2, 2, 2, 2).into()),
        ));

        let bytes = encode(&msg).unwrap();
        // The second name should compress down to a 2-byte pointer for the
        // shared "example.local." suffix, keeping the message small.
        assert!(bytes.len() < 70);

        let decoded = decode(&bytes, now).unwrap();
        assert_eq!(decoded.answers[0].name(), "a.example.local.");
        assert_eq!(decoded.answers[1].name(), "b.example.local.");
    }

    #[test]
    fn too_large_message_errors() {
        let now = Instant::now();
        let mut msg = Message::response(0);
        for i in 0..5000 {
            msg.answers.push(addr_record(&format!("h{i}.local."), Ipv4Addr::new(1, 2, 3, 4), 120, now));
        }
        assert!(matches!(encode(&msg), Err(CodecError::TooLarge)));
    }

    #[test]
    fn truncated_buffer_errors() {
        let now = Instant::now();
        assert!(matches!(decode(&[0u8; 4], now), Err(CodecError::Truncated(_))));
    }

    #[test]
    fn suppression_law() {
        let now = Instant::now();
        let mut query = Message::query(0);
        query.answers.push(addr_record("host.local.", Ipv4Addr::new(1, 1, 1, 1), 120, now));

        let candidate = addr_record("host.local.", Ipv4Addr::new(1, 1, 1, 1), 100, now);
        assert!(is_suppressed(&query, &candidate));

        let mut builder = AnswerBuilder::new(Some(&query));
        assert!(!builder.add_unstamped(candidate));
        assert!(builder.is_empty());
    }

    #[test]
    fn suppression_requires_half_ttl() {
        let now = Instant::now();
        let mut query = Message::query(0);
        query.answers.push(addr_record("host.local.", Ipv4Addr::new(1, 1, 1, 1), 50, now));

        let candidate = addr_record("host.local.", Ipv4Addr::new(1, 1, 1, 1), 120, now);
        assert!(!is_suppressed(&query, &candidate));
    }

    #[test]
    fn stamped_answers_drop_when_expired() {
        let now = Instant::now();
        let record = addr_record("host.local.", Ipv4Addr::new(1, 1, 1, 1), 1, now);
        let mut builder = AnswerBuilder::new(None);
        assert!(!builder.add_stamped(&record, now + Duration::from_secs(2)));
        assert!(builder.add_stamped(&record, now));
    }
}
