use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Upper bound on compression pointers followed while reading one name
const MAX_POINTER_JUMPS: usize = 16;
const MAX_LABEL_LEN: usize = 63;

/// DNS Question Section
/// Format: QNAME + QTYPE (2 bytes) + QCLASS (2 bytes)
///
/// Equality and hashing are structural, so a question doubles as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsQuestion {
    pub name: String, // Fully-qualified domain name (e.g., "example.com.")
    pub qtype: u16,   // Query type (A, AAAA, CNAME, etc.)
    pub qclass: u16,  // Query class (usually IN for Internet)
}

/// Answer, authority or additional entry
/// Format: NAME + TYPE (2 bytes) + CLASS (2 bytes) + TTL (4 bytes) + RDLENGTH (2 bytes) + RDATA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32, // Seconds
    pub rdata: Vec<u8>,
}

/// Common DNS record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A = 1,     // IPv4 address
    NS = 2,    // Name server
    CNAME = 5, // Canonical name
    SOA = 6,   // Start of authority
    PTR = 12,  // Pointer record
    MX = 15,   // Mail exchange
    TXT = 16,  // Text record
    AAAA = 28, // IPv6 address
    OPT = 41,  // EDNS0 option
}

impl RecordType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(RecordType::A),
            2 => Some(RecordType::NS),
            5 => Some(RecordType::CNAME),
            6 => Some(RecordType::SOA),
            12 => Some(RecordType::PTR),
            15 => Some(RecordType::MX),
            16 => Some(RecordType::TXT),
            28 => Some(RecordType::AAAA),
            41 => Some(RecordType::OPT),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
pub const CLASS_IN: u16 = 1;

impl DnsQuestion {
    #[cfg(test)]
    pub fn new(name: impl Into<String>, qtype: u16, qclass: u16) -> Self {
        DnsQuestion {
            name: name.into(),
            qtype,
            qclass,
        }
    }

    /// Parse a DNS question from bytes starting at the given offset
    /// Returns the question and the offset right after it
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<(Self, usize), WireError> {
        let (name, new_offset) = parse_domain_name(bytes, offset)?;

        if new_offset + 4 > bytes.len() {
            return Err(WireError::Truncated("question type and class"));
        }

        let qtype = u16::from_be_bytes([bytes[new_offset], bytes[new_offset + 1]]);
        let qclass = u16::from_be_bytes([bytes[new_offset + 2], bytes[new_offset + 3]]);

        Ok((
            DnsQuestion {
                name,
                qtype,
                qclass,
            },
            new_offset + 4,
        ))
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        encode_domain_name(&self.name, buf)?;
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
        Ok(())
    }

    /// Short form for log lines, e.g. `example.com. A`
    pub fn describe(&self) -> String {
        match RecordType::from_u16(self.qtype) {
            Some(rtype) => format!("{} {:?}", self.name, rtype),
            None => format!("{} TYPE{}", self.name, self.qtype),
        }
    }
}

impl ResourceRecord {
    #[cfg(test)]
    pub fn new(name: impl Into<String>, rtype: u16, rclass: u16, ttl: u32, rdata: Vec<u8>) -> Self {
        ResourceRecord {
            name: name.into(),
            rtype,
            rclass,
            ttl,
            rdata,
        }
    }

    #[cfg(test)]
    pub fn new_a_record(name: impl Into<String>, ttl: u32, ip: [u8; 4]) -> Self {
        Self::new(name, RecordType::A.to_u16(), CLASS_IN, ttl, ip.to_vec())
    }

    /// Parse a resource record from bytes starting at the given offset
    /// Returns the record and the offset right after its RDATA
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<(Self, usize), WireError> {
        let (name, new_offset) = parse_domain_name(bytes, offset)?;

        if new_offset + 10 > bytes.len() {
            return Err(WireError::Truncated("resource record fields"));
        }

        let rtype = u16::from_be_bytes([bytes[new_offset], bytes[new_offset + 1]]);
        let rclass = u16::from_be_bytes([bytes[new_offset + 2], bytes[new_offset + 3]]);
        let ttl = u32::from_be_bytes([
            bytes[new_offset + 4],
            bytes[new_offset + 5],
            bytes[new_offset + 6],
            bytes[new_offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([bytes[new_offset + 8], bytes[new_offset + 9]]) as usize;

        let data_offset = new_offset + 10;
        if data_offset + rdlength > bytes.len() {
            return Err(WireError::Truncated("RDATA"));
        }

        let rdata = bytes[data_offset..data_offset + rdlength].to_vec();

        Ok((
            ResourceRecord {
                name,
                rtype,
                rclass,
                ttl,
                rdata,
            },
            data_offset + rdlength,
        ))
    }

    /// RDLENGTH is derived from the stored data, never kept separately
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        let rdlength = u16::try_from(self.rdata.len())
            .map_err(|_| WireError::Truncated("RDATA longer than 65535 bytes"))?;

        encode_domain_name(&self.name, buf)?;
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);
        buf.put_u16(rdlength);
        buf.put_slice(&self.rdata);
        Ok(())
    }
}

/// Parse a domain name from DNS message format
/// Follows compression pointers; the result is always fully qualified ("example.com.")
/// Label bytes are kept in escaped presentation form, so every wire name maps to
/// exactly one string and back.
/// Returns the parsed name and the offset right after it in the original position
pub fn parse_domain_name(bytes: &[u8], mut offset: usize) -> Result<(String, usize), WireError> {
    let start = offset;
    let mut name = String::new();
    let mut resume_offset = None;
    let mut jumps = 0;

    loop {
        let length = *bytes
            .get(offset)
            .ok_or(WireError::Truncated("domain name"))?;

        match length & 0xC0 {
            0x00 => {}
            // Two high bits set: the next 14 bits are an offset to the rest of the name
            0xC0 => {
                let low = *bytes
                    .get(offset + 1)
                    .ok_or(WireError::Truncated("compression pointer"))?;

                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(WireError::PointerLoop(start));
                }

                resume_offset.get_or_insert(offset + 2);
                offset = u16::from_be_bytes([length & 0x3F, low]) as usize;
                continue;
            }
            _ => return Err(WireError::ReservedLabelType(length)),
        }

        offset += 1;

        if length == 0 {
            break;
        }

        let end = offset + length as usize;
        let label = bytes
            .get(offset..end)
            .ok_or(WireError::Truncated("domain label"))?;
        push_escaped_label(&mut name, label);
        name.push('.');
        offset = end;
    }

    if name.is_empty() {
        name.push('.');
    }

    Ok((name, resume_offset.unwrap_or(offset)))
}

/// `.` and `\` are backslash-escaped, bytes outside printable ASCII become `\DDD`
fn push_escaped_label(name: &mut String, label: &[u8]) {
    for &byte in label {
        match byte {
            b'.' | b'\\' => {
                name.push('\\');
                name.push(byte as char);
            }
            0x21..=0x7E => name.push(byte as char),
            _ => name.push_str(&format!("\\{:03}", byte)),
        }
    }
}

/// Encode a domain name as length-prefixed labels terminated with a null byte
/// Example: "example.com." -> [7]example[3]com[0]
/// Accepts the escapes produced by `parse_domain_name`. Compression is never produced.
pub fn encode_domain_name(name: &str, buf: &mut BytesMut) -> Result<(), WireError> {
    if name.is_empty() || name == "." {
        buf.put_u8(0);
        return Ok(());
    }

    let mut label = Vec::new();
    let mut rest = name.bytes();

    while let Some(byte) = rest.next() {
        match byte {
            b'.' => {
                if label.is_empty() {
                    return Err(WireError::InvalidName(name.to_string()));
                }
                write_label(&label, buf)?;
                label.clear();
            }
            b'\\' => label.push(unescape(&mut rest, name)?),
            _ => label.push(byte),
        }
    }

    // last label of a name written without the trailing dot
    if !label.is_empty() {
        write_label(&label, buf)?;
    }

    buf.put_u8(0);
    Ok(())
}

fn write_label(label: &[u8], buf: &mut BytesMut) -> Result<(), WireError> {
    if label.len() > MAX_LABEL_LEN {
        return Err(WireError::LabelTooLong(
            String::from_utf8_lossy(label).into_owned(),
        ));
    }
    buf.put_u8(label.len() as u8);
    buf.put_slice(label);
    Ok(())
}

/// Byte for the escape sequence following a backslash: `\DDD` or `\<char>`
fn unescape(rest: &mut std::str::Bytes<'_>, name: &str) -> Result<u8, WireError> {
    let invalid = || WireError::InvalidName(name.to_string());

    let first = rest.next().ok_or_else(invalid)?;
    if !first.is_ascii_digit() {
        return Ok(first);
    }

    let mut value = u16::from(first - b'0');
    for _ in 0..2 {
        let digit = rest.next().filter(u8::is_ascii_digit).ok_or_else(invalid)?;
        value = value * 10 + u16::from(digit - b'0');
    }
    u8::try_from(value).map_err(|_| invalid())
}
