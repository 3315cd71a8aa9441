//! Cache entry
//!
//! The stored message is a clone of the upstream response with all
//! hop-to-hop data removed: no OPT record, no AD bit.  What the origin
//! reported (its ECS scope, whether it set AD) is remembered alongside so
//! the output path can reconstruct a correct response per client.

use std::time::Duration;

use hickory_proto::op::Message;

/// A cached response
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The stripped response
    msg: Message,
    /// Lifetime, the minimum TTL across the stored answer section
    ttl: Duration,
    /// Scope prefix the origin reported
    scope: u8,
    /// Whether the origin had set the AD bit
    had_ad: bool,
    /// Whether the origin honors ECS
    ecs_honoring: bool,
}

impl CacheEntry {
    /// Create an entry from an already stripped response
    #[must_use]
    pub fn new(msg: Message, ttl: Duration, scope: u8, had_ad: bool, ecs_honoring: bool) -> Self {
        Self {
            msg,
            ttl,
            scope,
            had_ad,
            ecs_honoring,
        }
    }

    /// The entry's lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The scope prefix the origin reported
    #[must_use]
    pub fn scope(&self) -> u8 {
        self.scope
    }

    /// Whether the origin honors ECS
    #[must_use]
    pub fn ecs_honoring(&self) -> bool {
        self.ecs_honoring
    }

    /// Build a response for a request
    ///
    /// Clones the stored message, echoes the request ID, and sets the AD
    /// bit only when the origin had it set and the requester is AD-aware.
    #[must_use]
    pub fn response_for(&self, req_id: u16, req_ad: bool, req_do: bool) -> Message {
        let mut resp = self.msg.clone();
        resp.set_id(req_id);
        resp.set_authentic_data(self.had_ad && (req_ad || req_do));
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    fn stripped_response() -> Message {
        let mut resp = Message::new();
        let name = Name::from_str("example.com.").unwrap();
        resp.set_id(1)
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NoError);
        resp.add_query(Query::query(name.clone(), RecordType::A));
        resp.add_answer(Record::from_rdata(
            name,
            60,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
        ));
        resp
    }

    #[test]
    fn test_response_for_echoes_id() {
        let entry = CacheEntry::new(stripped_response(), Duration::from_secs(60), 0, false, false);
        let resp = entry.response_for(0x4242, false, false);

        assert_eq!(resp.id(), 0x4242);
        assert_eq!(resp.answers().len(), 1);
    }

    #[test]
    fn test_ad_applied_only_for_ad_aware_requesters() {
        let entry = CacheEntry::new(stripped_response(), Duration::from_secs(60), 24, true, true);

        assert!(!entry.response_for(1, false, false).authentic_data());
        assert!(entry.response_for(1, true, false).authentic_data());
        assert!(entry.response_for(1, false, true).authentic_data());
    }

    #[test]
    fn test_ad_never_fabricated() {
        let entry = CacheEntry::new(stripped_response(), Duration::from_secs(60), 0, false, false);
        assert!(!entry.response_for(1, true, true).authentic_data());
    }
}
