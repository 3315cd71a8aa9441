//! DNS message helpers
//!
//! Thin utilities over the wire codec: response synthesis, TTL scanning,
//! hop-to-hop data removal, and response validation.  The EDNS Client
//! Subnet option lives in [`ecs`].
//!
//! Hop-to-hop data is whatever must not survive caching: the OPT record
//! and the AD header bit.  [`strip_hop_to_hop`] removes both;
//! [`set_resp_ad`] re-applies the AD bit on the way out for requesters
//! that asked for it (AD set or DO set, RFC 6840 §5.7).

pub mod ecs;

use std::time::Duration;

use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};

/// Check the DO (DNSSEC OK) bit of a message's EDNS OPT record
#[must_use]
pub fn is_do(msg: &Message) -> bool {
    msg.extensions().as_ref().map_or(false, Edns::dnssec_ok)
}

/// Minimum TTL across the answer section
///
/// An empty answer section yields zero.
#[must_use]
pub fn minimal_ttl(msg: &Message) -> Duration {
    let min = msg.answers().iter().map(hickory_proto::rr::Record::ttl).min();
    Duration::from_secs(u64::from(min.unwrap_or(0)))
}

/// Remove hop-to-hop data from a response
///
/// Drops the OPT record entirely and clears the AD bit.  Used to produce
/// cache values and to scrub responses before transport-specific EDNS is
/// re-applied.
pub fn strip_hop_to_hop(msg: &mut Message) {
    *msg.extensions_mut() = None;
    msg.set_authentic_data(false);
}

/// Clear the AD bit unless the requester is AD-aware
///
/// A requester is AD-aware when it set the AD bit or the DO bit in the
/// query.
pub fn set_resp_ad(resp: &mut Message, req_ad: bool, req_do: bool) {
    if !req_ad && !req_do {
        resp.set_authentic_data(false);
    }
}

/// Synthesize a SERVFAIL response for a request
#[must_use]
pub fn servfail(req: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(req.op_code())
        .set_recursion_desired(req.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::ServFail);

    for q in req.queries() {
        resp.add_query(q.clone());
    }

    resp
}

/// Normalize a response about to leave the server
///
/// The response ID must echo the request ID regardless of what the
/// upstream or the cache produced.
pub fn normalize(req: &Message, resp: &mut Message) {
    resp.set_id(req.id());
}

/// Check that a response plausibly answers a query
///
/// The ID must match and the first question must agree on name and type.
/// Responses failing this check are discarded as spoofed or misrouted.
#[must_use]
pub fn validate_response(query: &Message, response: &Message) -> bool {
    if query.id() != response.id() {
        return false;
    }

    match (query.queries().first(), response.queries().first()) {
        (Some(q), Some(r)) => {
            q.query_type() == r.query_type()
                && q.name().to_lowercase() == r.name().to_lowercase()
        }
        // A response without a question section is accepted as long as
        // the ID matched; some servers echo none on failures.
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    fn test_query(host: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id).set_recursion_desired(true);
        let name = Name::from_str(host).unwrap();
        msg.add_query(Query::query(name, RecordType::A));
        msg
    }

    fn test_response(req: &Message, addr: Ipv4Addr, ttl: u32) -> Message {
        let mut resp = Message::new();
        resp.set_id(req.id())
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NoError);

        let query = req.queries().first().unwrap().clone();
        let name = query.name().clone();
        resp.add_query(query);
        resp.add_answer(Record::from_rdata(name, ttl, RData::A(A(addr))));
        resp
    }

    // ========================================================================
    // TTL Tests
    // ========================================================================

    #[test]
    fn test_minimal_ttl_single_answer() {
        let req = test_query("example.com.", 1);
        let resp = test_response(&req, Ipv4Addr::new(93, 184, 216, 34), 60);
        assert_eq!(minimal_ttl(&resp), Duration::from_secs(60));
    }

    #[test]
    fn test_minimal_ttl_picks_minimum() {
        let req = test_query("example.com.", 1);
        let mut resp = test_response(&req, Ipv4Addr::new(1, 2, 3, 4), 300);
        let name = Name::from_str("example.com.").unwrap();
        resp.add_answer(Record::from_rdata(
            name,
            30,
            RData::A(A(Ipv4Addr::new(5, 6, 7, 8))),
        ));

        assert_eq!(minimal_ttl(&resp), Duration::from_secs(30));
    }

    #[test]
    fn test_minimal_ttl_empty_answers_is_zero() {
        let req = test_query("example.com.", 1);
        assert_eq!(minimal_ttl(&req), Duration::ZERO);
    }

    // ========================================================================
    // Hop-to-Hop Tests
    // ========================================================================

    #[test]
    fn test_strip_hop_to_hop() {
        let req = test_query("example.com.", 7);
        let mut resp = test_response(&req, Ipv4Addr::new(1, 2, 3, 4), 60);
        resp.set_authentic_data(true);
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        *resp.extensions_mut() = Some(edns);

        strip_hop_to_hop(&mut resp);

        assert!(resp.extensions().is_none());
        assert!(!resp.authentic_data());
        // Answers survive.
        assert_eq!(resp.answers().len(), 1);
    }

    #[test]
    fn test_set_resp_ad() {
        let req = test_query("example.com.", 7);

        let mut resp = test_response(&req, Ipv4Addr::new(1, 2, 3, 4), 60);
        resp.set_authentic_data(true);
        set_resp_ad(&mut resp, false, false);
        assert!(!resp.authentic_data());

        let mut resp = test_response(&req, Ipv4Addr::new(1, 2, 3, 4), 60);
        resp.set_authentic_data(true);
        set_resp_ad(&mut resp, false, true);
        assert!(resp.authentic_data());
    }

    // ========================================================================
    // Response Synthesis Tests
    // ========================================================================

    #[test]
    fn test_servfail_echoes_request() {
        let req = test_query("example.com.", 0x1234);
        let resp = servfail(&req);

        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert_eq!(resp.queries().len(), 1);
    }

    #[test]
    fn test_normalize_sets_id() {
        let req = test_query("example.com.", 42);
        let mut resp = test_response(&req, Ipv4Addr::new(1, 2, 3, 4), 60);
        resp.set_id(9999);

        normalize(&req, &mut resp);
        assert_eq!(resp.id(), 42);
    }

    // ========================================================================
    // Validation Tests
    // ========================================================================

    #[test]
    fn test_validate_response_matches() {
        let req = test_query("example.com.", 10);
        let resp = test_response(&req, Ipv4Addr::new(1, 2, 3, 4), 60);
        assert!(validate_response(&req, &resp));
    }

    #[test]
    fn test_validate_response_id_mismatch() {
        let req = test_query("example.com.", 10);
        let mut resp = test_response(&req, Ipv4Addr::new(1, 2, 3, 4), 60);
        resp.set_id(11);
        assert!(!validate_response(&req, &resp));
    }

    #[test]
    fn test_validate_response_name_mismatch() {
        let req = test_query("example.com.", 10);
        let other = test_query("other.com.", 10);
        let resp = test_response(&other, Ipv4Addr::new(1, 2, 3, 4), 60);
        assert!(!validate_response(&req, &resp));
    }

    #[test]
    fn test_validate_response_case_insensitive() {
        let req = test_query("EXAMPLE.com.", 10);
        let lower = test_query("example.com.", 10);
        let resp = test_response(&lower, Ipv4Addr::new(1, 2, 3, 4), 60);
        assert!(validate_response(&req, &resp));
    }

    // ========================================================================
    // Wire Round-Trip Tests
    // ========================================================================

    #[test]
    fn test_pack_unpack_roundtrip() {
        let req = test_query("example.com.", 0xABCD);
        let resp = test_response(&req, Ipv4Addr::new(93, 184, 216, 34), 60);

        let bytes = resp.to_vec().unwrap();
        let reparsed = Message::from_vec(&bytes).unwrap();
        let bytes2 = reparsed.to_vec().unwrap();

        assert_eq!(bytes, bytes2);
        assert_eq!(reparsed.id(), 0xABCD);
        assert_eq!(reparsed.answers().len(), 1);
        assert_eq!(reparsed.answers()[0].ttl(), 60);
    }
}
