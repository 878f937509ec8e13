use bytes::{Bytes, BytesMut};

use crate::dns_header::{DnsFlags, DnsHeader, HEADER_LEN};
use crate::dns_question_and_answer::{DnsQuestion, ResourceRecord};
use crate::error::WireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Query,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Query = 0,
    IQuery = 1,
    Status = 2,
    Notify = 4,
    Update = 5,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(Opcode::Query),
            1 => Ok(Opcode::IQuery),
            2 => Ok(Opcode::Status),
            4 => Ok(Opcode::Notify),
            5 => Ok(Opcode::Update),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError = 0,
    FormatError = 1,
    ServerFailure = 2,
    NameError = 3,
    NotImplemented = 4,
    Refused = 5,
}

impl ResponseCode {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(ResponseCode::NoError),
            1 => Ok(ResponseCode::FormatError),
            2 => Ok(ResponseCode::ServerFailure),
            3 => Ok(ResponseCode::NameError),
            4 => Ok(ResponseCode::NotImplemented),
            5 => Ok(ResponseCode::Refused),
            other => Err(WireError::UnknownResponseCode(other)),
        }
    }
}

/// Answer, authority and additional records, in that order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSets {
    pub answer: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl RecordSets {
    /// Append another triplet section by section, keeping order
    pub fn extend(&mut self, other: RecordSets) {
        self.answer.extend(other.answer);
        self.authority.extend(other.authority);
        self.additional.extend(other.additional);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.answer
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
    }
}

/// A complete DNS message. Header counts are not stored; they are derived
/// from the section lengths every time the message is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub kind: MessageKind,
    pub opcode: Opcode,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub response_code: ResponseCode,
    pub questions: Vec<DnsQuestion>,
    pub records: RecordSets,
}

impl Message {
    /// Decode a full message. Every section is read back-to-back starting right
    /// after the previous entry.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        let header = DnsHeader::from_bytes(buf)?;
        let flags = DnsFlags::from_u16(header.flags);

        let mut offset = HEADER_LEN;

        let mut questions = Vec::with_capacity(header.question_count as usize);
        for _ in 0..header.question_count {
            let (question, new_offset) = DnsQuestion::from_bytes(buf, offset)?;
            questions.push(question);
            offset = new_offset;
        }

        let mut read_records = |count: u16| -> Result<Vec<ResourceRecord>, WireError> {
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (record, new_offset) = ResourceRecord::from_bytes(buf, offset)?;
                records.push(record);
                offset = new_offset;
            }
            Ok(records)
        };

        let answer = read_records(header.answer_count)?;
        let authority = read_records(header.authority_count)?;
        let additional = read_records(header.additional_count)?;

        Ok(Message {
            id: header.id,
            kind: if flags.qr { MessageKind::Response } else { MessageKind::Query },
            opcode: Opcode::from_u8(flags.opcode)?,
            authoritative: flags.aa,
            truncated: flags.tc,
            recursion_desired: flags.rd,
            recursion_available: flags.ra,
            response_code: ResponseCode::from_u8(flags.rcode)?,
            questions,
            records: RecordSets {
                answer,
                authority,
                additional,
            },
        })
    }

    /// Encode in the fixed order question, answer, authority, additional
    pub fn to_bytes(&self) -> Result<Bytes, WireError> {
        let count = |len: usize| u16::try_from(len).map_err(|_| WireError::TooManyEntries(len));

        let flags = DnsFlags {
            qr: self.kind == MessageKind::Response,
            opcode: self.opcode as u8,
            aa: self.authoritative,
            tc: self.truncated,
            rd: self.recursion_desired,
            ra: self.recursion_available,
            rcode: self.response_code as u8,
        };

        let header = DnsHeader {
            id: self.id,
            flags: flags.to_u16(),
            question_count: count(self.questions.len())?,
            answer_count: count(self.records.answer.len())?,
            authority_count: count(self.records.authority.len())?,
            additional_count: count(self.records.additional.len())?,
        };

        let mut buf = BytesMut::with_capacity(512);
        header.write_to(&mut buf);

        for question in &self.questions {
            question.write_to(&mut buf)?;
        }
        for record in self.records.iter() {
            record.write_to(&mut buf)?;
        }

        Ok(buf.freeze())
    }

    /// Build a recursive standard query with a fresh random id
    pub fn query(questions: Vec<DnsQuestion>) -> Self {
        Message {
            id: fastrand::u16(..),
            kind: MessageKind::Query,
            opcode: Opcode::Query,
            authoritative: false,
            truncated: false,
            recursion_desired: true,
            recursion_available: false,
            response_code: ResponseCode::NoError,
            questions,
            records: RecordSets::default(),
        }
    }

    /// Build the reply to `query`: id, questions, opcode and RD are echoed back
    pub fn response_to(query: &Message, records: RecordSets, response_code: ResponseCode) -> Self {
        Message {
            id: query.id,
            kind: MessageKind::Response,
            opcode: query.opcode,
            authoritative: false,
            truncated: false,
            recursion_desired: query.recursion_desired,
            recursion_available: true,
            response_code,
            questions: query.questions.clone(),
            records,
        }
    }

    /// Take the answer/authority/additional sections out of a decoded reply
    pub fn into_records(self) -> RecordSets {
        self.records
    }
}
