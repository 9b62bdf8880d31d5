//! DNSBL wire protocol: turns one query datagram into one reply datagram.
//!
//! Standard DNSBL pattern: reverse the IP octets and query under the zone.
//! Checking 192.0.2.1 against `bl.example.org` queries
//! `1.2.0.192.bl.example.org`.
//!
//! - Listed: A record (127.0.0.X) and, for TXT/ANY queries, the TXT reason
//! - Not listed: NXDOMAIN
//! - Zone apex: NOERROR with no answers
//! - Outside every zone: REFUSED
//!
//! Datagrams that are not parseable queries get no reply at all.

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::trace;

use crate::zone::ZoneSnapshot;
use crate::SrvError;

/// Default TTL of answer records, in seconds.
pub const DEFAULT_TTL: u32 = 2048;

/// Longest character-string a TXT record can carry.
pub const MAX_TXT_LEN: usize = 255;

/// What was asked and how it was answered, for the query log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySummary {
    pub qname: String,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    pub rcode: ResponseCode,
    pub answers: usize,
}

impl fmt::Display for QuerySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {}/{}",
            self.qname,
            self.qtype,
            self.qclass,
            rcode_name(self.rcode),
            self.answers
        )
    }
}

/// An encoded reply plus its summary.
#[derive(Debug, Clone)]
pub struct Reply {
    pub bytes: Vec<u8>,
    pub summary: QuerySummary,
}

/// Builds replies from raw query bytes against a dataset snapshot.
pub trait Responder: Send + Sync {
    /// `None` means the datagram is malformed or unanswerable; send nothing.
    fn build_reply(&self, query: &[u8], snapshot: &ZoneSnapshot) -> Option<Reply>;
}

/// Responder for ip4set DNSBL zones.
#[derive(Debug, Clone, Copy)]
pub struct DnsblResponder {
    ttl: u32,
}

impl Default for DnsblResponder {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl DnsblResponder {
    #[must_use]
    pub const fn new(ttl: u32) -> Self {
        Self { ttl }
    }
}

impl Responder for DnsblResponder {
    fn build_reply(&self, query: &[u8], snapshot: &ZoneSnapshot) -> Option<Reply> {
        match self.respond(query, snapshot) {
            Ok(reply) => Some(reply),
            Err(e) => {
                trace!(error = %e, len = query.len(), "dropping datagram");
                None
            }
        }
    }
}

impl DnsblResponder {
    fn respond(&self, query: &[u8], snapshot: &ZoneSnapshot) -> crate::Result<Reply> {
        let request =
            Message::from_vec(query).map_err(|e| SrvError::Protocol(format!("parse: {e}")))?;
        if request.message_type() != MessageType::Query {
            return Err(SrvError::Protocol("not a query".into()));
        }

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired());

        let question = match request.queries() {
            [q] => q.clone(),
            _ => {
                response.set_response_code(ResponseCode::FormErr);
                return encode(response, "-", RecordType::Unknown(0), DNSClass::IN);
            }
        };
        let qtype = question.query_type();
        let qclass = question.query_class();
        let qname = question.name().clone();
        response.add_query(question);

        if request.op_code() != OpCode::Query {
            response.set_response_code(ResponseCode::NotImp);
        } else if qclass != DNSClass::IN && qclass != DNSClass::ANY {
            response.set_response_code(ResponseCode::Refused);
        } else if let Some(zone) = snapshot.find_zone(&qname) {
            response.set_authoritative(true);
            // Same label count as the origin means the query is for the apex.
            if qname.num_labels() != zone.origin.num_labels() {
                let listed = reversed_ipv4(&qname, zone.origin.num_labels())
                    .and_then(|addr| zone.data.lookup(addr).map(|v| (addr, v)));
                match listed {
                    Some((addr, value)) => {
                        if matches!(qtype, RecordType::A | RecordType::ANY) {
                            response.add_answer(Record::from_rdata(
                                qname.clone(),
                                self.ttl,
                                RData::A(A::from(value.a)),
                            ));
                        }
                        if matches!(qtype, RecordType::TXT | RecordType::ANY) {
                            if let Some(txt) = value.render_txt(addr) {
                                response.add_answer(Record::from_rdata(
                                    qname.clone(),
                                    self.ttl,
                                    RData::TXT(TXT::new(vec![fit_txt(txt)])),
                                ));
                            }
                        }
                    }
                    None => {
                        response.set_response_code(ResponseCode::NXDomain);
                    }
                }
            }
        } else {
            response.set_response_code(ResponseCode::Refused);
        }

        encode(response, &qname.to_string(), qtype, qclass)
    }
}

fn encode(
    response: Message,
    qname: &str,
    qtype: RecordType,
    qclass: DNSClass,
) -> crate::Result<Reply> {
    let summary = QuerySummary {
        qname: qname.to_string(),
        qtype,
        qclass,
        rcode: response.response_code(),
        answers: response.answers().len(),
    };
    let bytes = response
        .to_vec()
        .map_err(|e| SrvError::Protocol(format!("encode: {e}")))?;
    Ok(Reply { bytes, summary })
}

/// Cut `text` to what one TXT string can hold, on a character boundary.
fn fit_txt(mut text: String) -> String {
    if text.len() > MAX_TXT_LEN {
        let mut end = MAX_TXT_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Extract the listed address from `d.c.b.a.<zone>`.
///
/// `zone_labels` is the label count of the zone origin; exactly four numeric
/// labels must precede it.
#[must_use]
pub fn reversed_ipv4(qname: &Name, zone_labels: u8) -> Option<Ipv4Addr> {
    if qname.num_labels().checked_sub(zone_labels)? != 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (i, label) in qname.iter().take(4).enumerate() {
        let text = std::str::from_utf8(label).ok()?;
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        octets[3 - i] = text.parse().ok()?;
    }
    Some(Ipv4Addr::from(octets))
}

/// Mnemonic for the query log.
#[must_use]
pub fn rcode_name(rcode: ResponseCode) -> String {
    match rcode {
        ResponseCode::NoError => "NOERROR".to_string(),
        ResponseCode::FormErr => "FORMERR".to_string(),
        ResponseCode::ServFail => "SERVFAIL".to_string(),
        ResponseCode::NXDomain => "NXDOMAIN".to_string(),
        ResponseCode::NotImp => "NOTIMP".to_string(),
        ResponseCode::Refused => "REFUSED".to_string(),
        other => format!("RCODE{}", u16::from(other)),
    }
}
