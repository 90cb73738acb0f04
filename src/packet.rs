//! DNS wire format: encoding / decoding packets to and from the fixed
//! 512-byte UDP buffer, including name compression on write and
//! jump-following on read.

use std::collections::BTreeMap;
use std::fmt;

use crate::errors::DnsError;

/// Both requests and responses are exactly one UDP datagram of this size.
pub const PACKET_SIZE: usize = 512;

/// A name may chain at most this many compression pointers before the
/// decoder gives up on it.
const MAX_JUMPS: usize = 5;

/// Cursor over an immutable packet buffer. Reads are big-endian; any read
/// that would run past the end of the buffer fails as malformed.
pub struct BufferReader<'a> {
    bytes: &'a [u8; PACKET_SIZE],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(bytes: &'a [u8; PACKET_SIZE]) -> Self {
        Self::new_at(bytes, 0)
    }

    pub fn new_at(bytes: &'a [u8; PACKET_SIZE], pos: usize) -> Self {
        Self { bytes, pos }
    }

    pub fn read_u8(&mut self) -> Result<u8, DnsError> {
        if self.pos >= PACKET_SIZE {
            return Err(DnsError::Malformed(
                "attempted to read beyond the packet buffer".to_string(),
            ));
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, DnsError> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(((hi as u16) << 8) | lo as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32, DnsError> {
        let hi = self.read_u16()?;
        let lo = self.read_u16()?;
        Ok(((hi as u32) << 16) | lo as u32)
    }

    /// Reads a length-prefixed label sequence, following compression
    /// pointers into the same buffer. The main cursor only consumes the
    /// two pointer bytes; the remainder of the name is read by a fresh
    /// reader positioned at the pointer target.
    pub fn read_qname(&mut self) -> Result<String, DnsError> {
        self.read_qname_guarded(0)
    }

    fn read_qname_guarded(&mut self, num_jumps: usize) -> Result<String, DnsError> {
        if num_jumps > MAX_JUMPS {
            return Err(DnsError::Malformed(
                "compression jump limit exceeded".to_string(),
            ));
        }

        let mut labels: Vec<String> = Vec::new();
        loop {
            let chunk = self.read_u8()?;

            // 0b11xxxxxx: two-byte pointer, rest of the name lives at the offset.
            if chunk & 0xc0 == 0xc0 {
                let low = self.read_u8()?;
                let offset = (((chunk as u16) << 8) | low as u16) ^ 0xc000;
                let mut jumped = BufferReader::new_at(self.bytes, offset as usize);
                labels.push(jumped.read_qname_guarded(num_jumps + 1)?);
                return Ok(labels.join("."));
            }

            // Zero byte terminates the label list.
            if chunk == 0 {
                break;
            }

            let mut label = String::with_capacity(chunk as usize);
            for _ in 0..chunk {
                label.push(self.read_u8()? as char);
            }
            labels.push(label);
        }
        Ok(labels.join("."))
    }
}

/// Cursor over a mutable packet buffer, with a per-packet compression table
/// mapping already-written name suffixes to their offsets. Writing past the
/// buffer end is an internal error, not a client-visible one.
pub struct BufferWriter<'a> {
    bytes: &'a mut [u8; PACKET_SIZE],
    pos: usize,
    label_map: BTreeMap<String, u16>,
}

impl<'a> BufferWriter<'a> {
    pub fn new(bytes: &'a mut [u8; PACKET_SIZE]) -> Self {
        Self {
            bytes,
            pos: 0,
            label_map: BTreeMap::new(),
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn write_u8(&mut self, x: u8) -> Result<(), DnsError> {
        if self.pos >= PACKET_SIZE {
            return Err(DnsError::Internal(
                "attempted to write beyond the packet buffer".to_string(),
            ));
        }
        self.bytes[self.pos] = x;
        self.pos += 1;
        Ok(())
    }

    pub fn write_u16(&mut self, x: u16) -> Result<(), DnsError> {
        self.write_u8((x >> 8) as u8)?;
        self.write_u8(x as u8)?;
        Ok(())
    }

    pub fn write_u32(&mut self, x: u32) -> Result<(), DnsError> {
        self.write_u16((x >> 16) as u16)?;
        self.write_u16(x as u16)?;
        Ok(())
    }

    /// Overwrites two bytes at an already-written position. Used to backfill
    /// RDLENGTH once a variable-length payload has been emitted.
    pub fn set_u16(&mut self, pos: usize, x: u16) -> Result<(), DnsError> {
        if pos + 1 >= PACKET_SIZE {
            return Err(DnsError::Internal(
                "attempted to write beyond the packet buffer".to_string(),
            ));
        }
        self.bytes[pos] = (x >> 8) as u8;
        self.bytes[pos + 1] = x as u8;
        Ok(())
    }

    /// Writes a name, emitting a compression pointer for the first suffix
    /// that has been written before. Returns the number of bytes emitted.
    pub fn write_qname(&mut self, qname: &str) -> Result<u16, DnsError> {
        let labels: Vec<&str> = qname.split('.').collect();
        let mut length: u16 = 0;
        let mut jumped = false;

        for i in 0..labels.len() {
            let suffix = labels[i..].join(".");
            if let Some(&offset) = self.label_map.get(&suffix) {
                self.write_u16(0xc000 | offset)?;
                length += 2;
                jumped = true;
                break;
            }
            self.label_map.insert(suffix, self.pos as u16);
            self.write_u8(labels[i].len() as u8)?;
            for c in labels[i].bytes() {
                self.write_u8(c)?;
            }
            length += labels[i].len() as u16 + 1;
        }
        if !jumped {
            self.write_u8(0)?;
            length += 1;
        }
        Ok(length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResponseCode {
    /// Out-of-range wire values are normalized to NOERROR.
    pub fn from_num(x: u8) -> ResponseCode {
        match x {
            1 => ResponseCode::FORMERR,
            2 => ResponseCode::SERVFAIL,
            3 => ResponseCode::NXDOMAIN,
            4 => ResponseCode::NOTIMP,
            5 => ResponseCode::REFUSED,
            _ => ResponseCode::NOERROR,
        }
    }

    pub fn to_num(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponseCode::NOERROR => "NOERROR",
            ResponseCode::FORMERR => "FORMERR",
            ResponseCode::SERVFAIL => "SERVFAIL",
            ResponseCode::NXDOMAIN => "NXDOMAIN",
            ResponseCode::NOTIMP => "NOTIMP",
            ResponseCode::REFUSED => "REFUSED",
        }
    }
}

// NOTE: query types this server does not interpret are preserved as UNKNOWN
// with their raw code so that upstream answers for them still round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    UNKNOWN(u16),
    A,
    NS,
    CNAME,
    MX,
    AAAA,
}

impl QueryType {
    pub fn from_num(x: u16) -> QueryType {
        match x {
            1 => QueryType::A,
            2 => QueryType::NS,
            5 => QueryType::CNAME,
            15 => QueryType::MX,
            28 => QueryType::AAAA,
            _ => QueryType::UNKNOWN(x),
        }
    }

    pub fn to_num(self) -> u16 {
        match self {
            QueryType::UNKNOWN(x) => x,
            QueryType::A => 1,
            QueryType::NS => 2,
            QueryType::CNAME => 5,
            QueryType::MX => 15,
            QueryType::AAAA => 28,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::UNKNOWN(_) => "UNKNOWN",
            QueryType::A => "A",
            QueryType::NS => "NS",
            QueryType::CNAME => "CNAME",
            QueryType::MX => "MX",
            QueryType::AAAA => "AAAA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    pub recursion_desired: bool,
    pub truncated_message: bool,
    pub authoritative_answer: bool,
    pub op_code: u8,
    pub query_response: bool,
    pub response_code: ResponseCode,
    pub checking_disabled: bool,
    pub authed_data: bool,
    pub z: bool,
    pub recursion_available: bool,
    pub question_count: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
}

impl Header {
    pub fn from_bytes(reader: &mut BufferReader) -> Result<Header, DnsError> {
        let mut header = Header {
            id: reader.read_u16()?,
            ..Header::default()
        };
        {
            let chunk = reader.read_u8()?;
            header.recursion_desired = chunk & 0b1 != 0;
            header.truncated_message = chunk >> 1 & 0b1 != 0;
            header.authoritative_answer = chunk >> 2 & 0b1 != 0;
            header.op_code = chunk >> 3 & 0b1111;
            header.query_response = chunk >> 7 & 0b1 != 0;
        }
        {
            let chunk = reader.read_u8()?;
            header.response_code = ResponseCode::from_num(chunk & 0b1111);
            header.checking_disabled = chunk >> 4 & 0b1 != 0;
            header.authed_data = chunk >> 5 & 0b1 != 0;
            header.z = chunk >> 6 & 0b1 != 0;
            header.recursion_available = chunk >> 7 & 0b1 != 0;
        }
        header.question_count = reader.read_u16()?;
        header.answer_count = reader.read_u16()?;
        header.authority_count = reader.read_u16()?;
        header.additional_count = reader.read_u16()?;
        Ok(header)
    }

    pub fn to_bytes(&self, writer: &mut BufferWriter) -> Result<(), DnsError> {
        writer.write_u16(self.id)?;
        {
            let mut chunk = 0u8;
            chunk |= self.recursion_desired as u8;
            chunk |= (self.truncated_message as u8) << 1;
            chunk |= (self.authoritative_answer as u8) << 2;
            chunk |= self.op_code << 3;
            chunk |= (self.query_response as u8) << 7;
            writer.write_u8(chunk)?;
        }
        {
            let mut chunk = 0u8;
            chunk |= self.response_code.to_num();
            chunk |= (self.checking_disabled as u8) << 4;
            chunk |= (self.authed_data as u8) << 5;
            chunk |= (self.z as u8) << 6;
            chunk |= (self.recursion_available as u8) << 7;
            writer.write_u8(chunk)?;
        }
        writer.write_u16(self.question_count)?;
        writer.write_u16(self.answer_count)?;
        writer.write_u16(self.authority_count)?;
        writer.write_u16(self.additional_count)?;
        Ok(())
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ id: {:#06x} qr: {} op_code: {} rd: {} ra: {} rcode: {} \
             counts: {}/{}/{}/{} }}",
            self.id,
            self.query_response,
            self.op_code,
            self.recursion_desired,
            self.recursion_available,
            self.response_code.as_str(),
            self.question_count,
            self.answer_count,
            self.authority_count,
            self.additional_count,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub qname: String,
    pub qtype: QueryType,
    pub dns_class: u16,
}

impl Question {
    pub fn new(qname: impl Into<String>, qtype: QueryType) -> Self {
        Self {
            qname: qname.into(),
            qtype,
            dns_class: 1,
        }
    }

    pub fn from_bytes(reader: &mut BufferReader) -> Result<Question, DnsError> {
        Ok(Question {
            qname: reader.read_qname()?,
            qtype: QueryType::from_num(reader.read_u16()?),
            dns_class: reader.read_u16()?,
        })
    }

    pub fn to_bytes(&self, writer: &mut BufferWriter) -> Result<(), DnsError> {
        writer.write_qname(&self.qname)?;
        writer.write_u16(self.qtype.to_num())?;
        writer.write_u16(self.dns_class)?;
        Ok(())
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ qname: {} qtype: {} class: {} }}",
            self.qname,
            self.qtype.as_str(),
            self.dns_class
        )
    }
}

/// Payload of a record, tagged by its query type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    UNKNOWN { bytes: Vec<u8> },
    A { addr: [u8; 4] },
    NS { host: String },
    CNAME { host: String },
    MX { priority: u16, host: String },
    AAAA { addr: [u16; 8] },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub qname: String,
    pub qtype: QueryType,
    pub dns_class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl Record {
    pub fn from_bytes(reader: &mut BufferReader) -> Result<Record, DnsError> {
        let qname = reader.read_qname()?;
        let qtype = QueryType::from_num(reader.read_u16()?);
        let dns_class = reader.read_u16()?;
        let ttl = reader.read_u32()?;
        let length = reader.read_u16()?;

        let data = match qtype {
            QueryType::A => {
                if length != 4 {
                    tracing::warn!("Unexpected RDLENGTH for type A. Expected 4, got: {}", length);
                }
                RecordData::A {
                    addr: [
                        reader.read_u8()?,
                        reader.read_u8()?,
                        reader.read_u8()?,
                        reader.read_u8()?,
                    ],
                }
            }
            QueryType::NS => RecordData::NS {
                host: reader.read_qname()?,
            },
            QueryType::CNAME => RecordData::CNAME {
                host: reader.read_qname()?,
            },
            QueryType::MX => RecordData::MX {
                priority: reader.read_u16()?,
                host: reader.read_qname()?,
            },
            QueryType::AAAA => {
                if length != 16 {
                    tracing::warn!(
                        "Unexpected RDLENGTH for type AAAA. Expected 16, got: {}",
                        length
                    );
                }
                let mut addr = [0u16; 8];
                for group in addr.iter_mut() {
                    *group = reader.read_u16()?;
                }
                RecordData::AAAA { addr }
            }
            QueryType::UNKNOWN(_) => {
                // Preserve the payload verbatim so the record re-encodes
                // byte-for-byte even though we cannot interpret it.
                let mut bytes = Vec::with_capacity(length as usize);
                for _ in 0..length {
                    bytes.push(reader.read_u8()?);
                }
                RecordData::UNKNOWN { bytes }
            }
        };

        Ok(Record {
            qname,
            qtype,
            dns_class,
            ttl,
            data,
        })
    }

    pub fn to_bytes(&self, writer: &mut BufferWriter) -> Result<(), DnsError> {
        writer.write_qname(&self.qname)?;
        writer.write_u16(self.qtype.to_num())?;
        writer.write_u16(self.dns_class)?;
        writer.write_u32(self.ttl)?;

        match &self.data {
            RecordData::A { addr } => {
                writer.write_u16(4)?;
                for octet in addr {
                    writer.write_u8(*octet)?;
                }
            }
            RecordData::NS { host } => {
                // RDLENGTH depends on compression, backfill once known.
                let len_pos = writer.pos();
                writer.write_u16(0)?;
                let len = writer.write_qname(host)?;
                writer.set_u16(len_pos, len)?;
            }
            RecordData::CNAME { host } => {
                let len_pos = writer.pos();
                writer.write_u16(0)?;
                let len = writer.write_qname(host)?;
                writer.set_u16(len_pos, len)?;
            }
            RecordData::MX { priority, host } => {
                let len_pos = writer.pos();
                writer.write_u16(0)?;
                writer.write_u16(*priority)?;
                let len = writer.write_qname(host)?;
                writer.set_u16(len_pos, 2 + len)?;
            }
            RecordData::AAAA { addr } => {
                writer.write_u16(16)?;
                for group in addr {
                    writer.write_u16(*group)?;
                }
            }
            RecordData::UNKNOWN { bytes } => {
                writer.write_u16(bytes.len() as u16)?;
                for byte in bytes {
                    writer.write_u8(*byte)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ qname: {} qtype: {} ttl: {} ",
            self.qname,
            self.qtype.as_str(),
            self.ttl
        )?;
        match &self.data {
            RecordData::A { addr } => {
                write!(f, "IPv4: {}.{}.{}.{} ", addr[0], addr[1], addr[2], addr[3])?;
            }
            RecordData::NS { host } => write!(f, "NS host: {} ", host)?,
            RecordData::CNAME { host } => write!(f, "CNAME host: {} ", host)?,
            RecordData::MX { priority, host } => {
                write!(f, "MX priority: {} host: {} ", priority, host)?;
            }
            RecordData::AAAA { addr } => {
                write!(
                    f,
                    "IPv6: {:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x} ",
                    addr[0], addr[1], addr[2], addr[3], addr[4], addr[5], addr[6], addr[7]
                )?;
            }
            RecordData::UNKNOWN { bytes } => write!(f, "opaque: {} bytes ", bytes.len())?,
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DnsPacket {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additional: Vec<Record>,
}

impl DnsPacket {
    pub fn from_bytes(bytes: &[u8; PACKET_SIZE]) -> Result<DnsPacket, DnsError> {
        let mut reader = BufferReader::new(bytes);
        let header = Header::from_bytes(&mut reader)?;

        let mut packet = DnsPacket {
            header,
            questions: Vec::with_capacity(header.question_count as usize),
            answers: Vec::with_capacity(header.answer_count as usize),
            authorities: Vec::with_capacity(header.authority_count as usize),
            additional: Vec::with_capacity(header.additional_count as usize),
        };

        for _ in 0..header.question_count {
            packet.questions.push(Question::from_bytes(&mut reader)?);
        }
        for _ in 0..header.answer_count {
            packet.answers.push(Record::from_bytes(&mut reader)?);
        }
        for _ in 0..header.authority_count {
            packet.authorities.push(Record::from_bytes(&mut reader)?);
        }
        for _ in 0..header.additional_count {
            packet.additional.push(Record::from_bytes(&mut reader)?);
        }
        Ok(packet)
    }

    /// Recovers just the transaction id. Used to answer requests that fail
    /// to decode: the first two bytes are always present in the fixed-size
    /// buffer even when the rest is garbage.
    pub fn id_only(bytes: &[u8; PACKET_SIZE]) -> u16 {
        ((bytes[0] as u16) << 8) | bytes[1] as u16
    }

    /// Encodes the packet. The section counts in the emitted header are
    /// recomputed from the section vectors, not taken from `self.header`.
    pub fn to_bytes(&self) -> Result<[u8; PACKET_SIZE], DnsError> {
        let mut bytes = [0u8; PACKET_SIZE];
        let mut writer = BufferWriter::new(&mut bytes);

        let mut header = self.header;
        header.question_count = self.questions.len() as u16;
        header.answer_count = self.answers.len() as u16;
        header.authority_count = self.authorities.len() as u16;
        header.additional_count = self.additional.len() as u16;
        header.to_bytes(&mut writer)?;

        for question in &self.questions {
            question.to_bytes(&mut writer)?;
        }
        for record in &self.answers {
            record.to_bytes(&mut writer)?;
        }
        for record in &self.authorities {
            record.to_bytes(&mut writer)?;
        }
        for record in &self.additional {
            record.to_bytes(&mut writer)?;
        }
        Ok(bytes)
    }
}

impl fmt::Display for DnsPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ Header: {} Questions: [ ", self.header)?;
        for question in &self.questions {
            write!(f, "{} ", question)?;
        }
        write!(f, "] Answers: [ ")?;
        for record in &self.answers {
            write!(f, "{} ", record)?;
        }
        write!(f, "] Authorities: [ ")?;
        for record in &self.authorities {
            write!(f, "{} ", record)?;
        }
        write!(f, "] Additional: [ ")?;
        for record in &self.additional {
            write!(f, "{} ", record)?;
        }
        write!(f, "] }}")
    }
}
