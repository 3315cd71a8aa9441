//! DoH JSON API
//!
//! The `/resolve` route speaks the de-facto Google DoH JSON shape:
//! requests carry query parameters (`name`, `type`, `cd`, `do`), and
//! responses serialize the header flags plus the question and answer
//! sections.
//!
//! The response content type is the historical `application/x-javascript`;
//! compatibility requires the legacy value.

use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RecordType};
use serde::Serialize;

use crate::error::{DnsError, DnsResult};

/// One question in the JSON response
#[derive(Debug, Serialize)]
pub struct JsonQuestion {
    /// Query name
    pub name: String,
    /// Query type value
    #[serde(rename = "type")]
    pub qtype: u16,
}

/// One answer record in the JSON response
#[derive(Debug, Serialize)]
pub struct JsonAnswer {
    /// Record name
    pub name: String,
    /// Record type value
    #[serde(rename = "type")]
    pub qtype: u16,
    /// Record TTL in seconds
    #[serde(rename = "TTL")]
    pub ttl: u32,
    /// Record data in presentation format
    pub data: String,
}

/// The JSON response shape
#[derive(Debug, Serialize)]
pub struct JsonMsg {
    /// Response code
    #[serde(rename = "Status")]
    pub status: u16,
    /// Truncated flag
    #[serde(rename = "TC")]
    pub tc: bool,
    /// Recursion desired flag
    #[serde(rename = "RD")]
    pub rd: bool,
    /// Recursion available flag
    #[serde(rename = "RA")]
    pub ra: bool,
    /// Authenticated data flag
    #[serde(rename = "AD")]
    pub ad: bool,
    /// Checking disabled flag
    #[serde(rename = "CD")]
    pub cd: bool,
    /// Question section
    #[serde(rename = "Question")]
    pub question: Vec<JsonQuestion>,
    /// Answer section
    #[serde(rename = "Answer")]
    pub answer: Vec<JsonAnswer>,
}

/// Serialize a DNS response into the JSON API shape
///
/// # Errors
///
/// Returns `DnsError::SerializeError` when JSON encoding fails.
pub fn msg_to_json(resp: &Message) -> DnsResult<Vec<u8>> {
    let question = resp
        .queries()
        .iter()
        .map(|q| JsonQuestion {
            name: q.name().to_string(),
            qtype: q.query_type().into(),
        })
        .collect();

    let answer = resp
        .answers()
        .iter()
        .filter_map(|record| {
            let data = record.data()?.to_string();
            Some(JsonAnswer {
                name: record.name().to_string(),
                qtype: record.record_type().into(),
                ttl: record.ttl(),
                data,
            })
        })
        .collect();

    let json = JsonMsg {
        status: u16::from(resp.response_code()),
        tc: resp.truncated(),
        rd: resp.recursion_desired(),
        ra: resp.recursion_available(),
        ad: resp.authentic_data(),
        cd: resp.checking_disabled(),
        question,
        answer,
    };

    serde_json::to_vec(&json).map_err(|e| DnsError::serialize(format!("encoding json response: {e}")))
}

/// Build a DNS query from `/resolve` query parameters
///
/// `name` is required; `type` accepts a numeric value or a mnemonic and
/// defaults to A; `cd` and `do` are boolean flags.
///
/// # Errors
///
/// Returns `DnsError::ParseError` for a missing name or an unparseable
/// type.
pub fn msg_from_params(query: Option<&str>) -> DnsResult<Message> {
    let mut name: Option<String> = None;
    let mut qtype = RecordType::A;
    let mut cd = false;
    let mut do_bit = false;

    for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        match key.as_ref() {
            "name" => name = Some(value.into_owned()),
            "type" => qtype = parse_qtype(&value)?,
            "cd" => cd = parse_flag(&value),
            "do" => do_bit = parse_flag(&value),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| DnsError::parse("no 'name' parameter"))?;
    let mut qname = Name::from_ascii(&name)
        .map_err(|e| DnsError::parse(format!("bad name {name:?}: {e}")))?;
    if !qname.is_fqdn() {
        qname.set_fqdn(true);
    }

    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_recursion_desired(true)
        .set_checking_disabled(cd)
        .add_query(hickory_proto::op::Query::query(qname, qtype));

    if do_bit {
        let mut edns = hickory_proto::op::Edns::new();
        edns.set_max_payload(1232);
        edns.set_dnssec_ok(true);
        *msg.extensions_mut() = Some(edns);
    }

    Ok(msg)
}

/// Parse the `type` parameter, numeric or mnemonic
fn parse_qtype(value: &str) -> DnsResult<RecordType> {
    if let Ok(num) = value.parse::<u16>() {
        return Ok(RecordType::from(num));
    }

    value
        .to_uppercase()
        .parse::<RecordType>()
        .map_err(|_| DnsError::parse(format!("bad query type {value:?}")))
}

/// Parse a boolean query parameter
fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}
