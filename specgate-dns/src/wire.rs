//! RFC 1035 wire format: query encoding, response decoding, name
//! compression and the case-randomization spoof guard.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::Rng;

use crate::error::DnsError;

pub const CLASS_INET: u16 = 1;

/// Record types the resolver consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RecordType {
    A = 1,
    Ptr = 12,
    Aaaa = 28,
}

impl RecordType {
    pub fn from_u16(value: u16) -> Option<RecordType> {
        match value {
            1 => Some(RecordType::A),
            12 => Some(RecordType::Ptr),
            28 => Some(RecordType::Aaaa),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Ptr => "PTR",
            RecordType::Aaaa => "AAAA",
        }
    }
}

/// One parsed answer record of the requested type.
#[derive(Debug, Clone)]
pub enum Record {
    Addr(IpAddr),
    Name(String),
}

/// A decoded response.
#[derive(Debug)]
pub struct Response {
    pub id: u16,
    pub rcode: u8,
    /// Question name exactly as it appeared in the response.
    pub question: String,
    pub records: Vec<Record>,
    /// TTL of the last matching record, seconds.
    pub ttl: u32,
}

/// Randomize the letter case of a query name.
///
/// The response question must echo the exact case; comparing it
/// case-sensitively rejects blind spoof attempts (RFC draft "0x20").
pub fn randomize_case<R: Rng>(name: &str, rng: &mut R) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphabetic() && rng.gen::<bool>() {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect()
}

/// Encode a standard recursive query for `name`.
pub fn encode_query(id: u16, qtype: RecordType, name: &str) -> Result<Vec<u8>, DnsError> {
    if 255 < name.len() {
        return Err(DnsError::Parse(format!("name too long: {name}")));
    }

    let mut buf = Vec::with_capacity(17 + name.len());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // recursion desired
    buf.extend_from_slice(&1u16.to_be_bytes()); // one question
    buf.extend_from_slice(&[0; 6]); // ancount, nscount, arcount

    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        if 63 < label.len() {
            return Err(DnsError::Parse(format!("label too long: {label}")));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);

    buf.extend_from_slice(&(qtype as u16).to_be_bytes());
    buf.extend_from_slice(&CLASS_INET.to_be_bytes());

    Ok(buf)
}

fn read_u16(packet: &[u8], offset: usize) -> Result<u16, DnsError> {
    packet
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| DnsError::Parse("truncated packet".into()))
}

fn read_u32(packet: &[u8], offset: usize) -> Result<u32, DnsError> {
    packet
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| DnsError::Parse("truncated packet".into()))
}

/// Parse a possibly compressed name starting at `*offset`.
///
/// `*offset` advances past the name in the uncompressed stream. The
/// number of pointer hops is bounded by the packet length, which
/// rejects pointer loops.
pub fn parse_name(packet: &[u8], offset: &mut usize) -> Result<String, DnsError> {
    let mut i = *offset;
    let mut hops = 0usize;
    let mut name = String::new();

    loop {
        let len = *packet
            .get(i)
            .ok_or_else(|| DnsError::Parse("name overruns packet".into()))? as usize;
        i += 1;

        if len == 0 {
            break;
        }

        if len & 0xc0 == 0xc0 {
            let low = *packet
                .get(i)
                .ok_or_else(|| DnsError::Parse("name pointer overflow".into()))?
                as usize;
            i += 1;
            let ptr = ((len & 0x3f) << 8) | low;
            if packet.len() <= ptr {
                return Err(DnsError::Parse("invalid name pointer".into()));
            }
            if hops == 0 {
                *offset = i;
            }
            hops += 1;
            if packet.len() < hops {
                return Err(DnsError::Parse("name pointer loop".into()));
            }
            i = ptr;
            continue;
        }

        if 63 < len {
            return Err(DnsError::Parse("label too long".into()));
        }
        let bytes = packet
            .get(i..i + len)
            .ok_or_else(|| DnsError::Parse("label overruns packet".into()))?;
        if !name.is_empty() {
            name.push('.');
        }
        if 255 < name.len() + len {
            return Err(DnsError::Parse("name too long".into()));
        }
        name.push_str(&String::from_utf8_lossy(bytes));
        i += len;
    }

    if hops == 0 {
        *offset = i;
    }
    Ok(name)
}

/// Decode a response packet received from `peer`.
///
/// Only records matching `qtype` and `CLASS_INET` are collected.
pub fn decode_response(
    packet: &[u8],
    qtype: RecordType,
    peer: SocketAddr,
    expected_peer: SocketAddr,
) -> Result<Response, DnsError> {
    if peer != expected_peer {
        return Err(DnsError::Parse(format!("response from unexpected address {peer}")));
    }
    if packet.len() < 12 {
        return Err(DnsError::Parse("short packet".into()));
    }

    let id = read_u16(packet, 0)?;
    let flags = read_u16(packet, 2)?;
    let questions = read_u16(packet, 4)?;
    let answers = read_u16(packet, 6)?;

    if flags & 0x8000 == 0 {
        return Err(DnsError::Parse("response is not an answer".into()));
    }
    if questions != 1 {
        return Err(DnsError::Parse("expected one question".into()));
    }

    let mut offset = 12;
    let question = parse_name(packet, &mut offset)?;
    offset += 4; // question type and class

    let mut records = Vec::new();
    let mut ttl = 0;

    for _ in 0..answers {
        parse_name(packet, &mut offset)?; // owner name, unused
        let rtype = read_u16(packet, offset)?;
        let class = read_u16(packet, offset + 2)?;
        let rttl = read_u32(packet, offset + 4)?;
        let rdlen = read_u16(packet, offset + 8)? as usize;
        offset += 10;

        if packet.len() < offset + rdlen {
            return Err(DnsError::Parse("record data overruns packet".into()));
        }

        if class == CLASS_INET && rtype == qtype as u16 {
            ttl = rttl;
            match qtype {
                RecordType::A => {
                    if rdlen != 4 {
                        return Err(DnsError::Parse("invalid A record length".into()));
                    }
                    let b = &packet[offset..offset + 4];
                    records.push(Record::Addr(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))));
                }
                RecordType::Aaaa => {
                    if rdlen != 16 {
                        return Err(DnsError::Parse("invalid AAAA record length".into()));
                    }
                    let mut b = [0u8; 16];
                    b.copy_from_slice(&packet[offset..offset + 16]);
                    records.push(Record::Addr(IpAddr::V6(Ipv6Addr::from(b))));
                }
                RecordType::Ptr => {
                    let mut o = offset;
                    records.push(Record::Name(parse_name(packet, &mut o)?));
                }
            }
        }

        offset += rdlen;
    }

    Ok(Response { id, rcode: (flags & 0xf) as u8, question, records, ttl })
}

/// The reverse-lookup name for an address: `d.d.d.d.in-addr.arpa` or the
/// 32-nibble `ip6.arpa` form.
pub fn reverse_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(73);
            for byte in v6.octets().iter().rev() {
                name.push(char::from_digit((byte & 0xf) as u32, 16).unwrap());
                name.push('.');
                name.push(char::from_digit((byte >> 4) as u32, 16).unwrap());
                name.push('.');
            }
            name.push_str("ip6.arpa");
            name
        }
    }
}
