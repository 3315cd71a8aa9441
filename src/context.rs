//! Request context carried through the handler pipeline
//!
//! Every query travels with an explicit context assembled by the
//! transport before the first handler runs: which server accepted it,
//! who sent it, and what was parsed out of it.  Handlers receive the
//! context by reference and never mutate it.

use std::net::SocketAddr;
use std::time::Instant;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;

use crate::config::Protocol;
use crate::device::DeviceId;
use crate::error::{DnsError, DnsResult};
use crate::geoip::Location;
use crate::msg;
use crate::msg::ecs::EcsOption;

/// Identity of the server that accepted a query
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Configured server name
    pub name: String,
    /// Bound listener address
    pub addr: SocketAddr,
    /// Transport protocol
    pub proto: Protocol,
}

/// Identity of the client that sent a query
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    /// TLS SNI sent in the client hello, lowercased; `None` for plain
    /// transports or when the client sent no server name
    pub tls_server_name: Option<String>,
    /// Path of the request URL for DoH
    pub url_path: Option<String>,
}

/// Facts parsed out of a query
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Query name, lowercased
    pub host: String,
    /// Query type
    pub qtype: RecordType,
    /// DO (DNSSEC OK) bit of the query
    pub do_bit: bool,
    /// AD bit of the query header
    pub ad_bit: bool,
    /// Parsed ECS option, if the query carried one
    pub ecs: Option<EcsOption>,
    /// GeoIP location of the effective client
    ///
    /// The effective client is the ECS subnet address when the query
    /// carried ECS, the remote address otherwise.
    pub location: Option<Location>,
    /// Extracted device ID, if any
    pub device_id: Option<DeviceId>,
}

impl RequestInfo {
    /// Parse request facts from a query message
    ///
    /// Location and device ID start empty; the transport fills them in
    /// before dispatch.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ParseError` when the message has no question
    /// or carries a malformed ECS option.
    pub fn from_msg(req: &Message) -> DnsResult<Self> {
        let query = req
            .queries()
            .first()
            .ok_or_else(|| DnsError::parse("no question section"))?;

        Ok(Self {
            host: query.name().to_string().to_lowercase(),
            qtype: query.query_type(),
            do_bit: msg::is_do(req),
            ad_bit: req.authentic_data(),
            ecs: msg::ecs::ecs_from_msg(req)?,
            location: None,
            device_id: None,
        })
    }
}

/// Context for one query, passed to every handler
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The server that accepted the query
    pub server: ServerInfo,
    /// The client that sent it
    pub client: ClientInfo,
    /// The client's remote address
    pub remote_addr: SocketAddr,
    /// Facts parsed from the query
    pub request: RequestInfo,
    /// Deadline for producing a response
    pub deadline: Option<Instant>,
}

impl RequestContext {
    /// Time remaining until the deadline
    ///
    /// `None` when no deadline is set; zero when it has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|dl| dl.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use ipnet::IpNet;

    use crate::msg::ecs::set_ecs;

    fn query_msg(host: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x0101);
        msg.add_query(Query::query(Name::from_str(host).unwrap(), RecordType::A));
        msg
    }

    #[test]
    fn test_request_info_from_msg() {
        let req = query_msg("Example.COM.");
        let ri = RequestInfo::from_msg(&req).unwrap();

        assert_eq!(ri.host, "example.com.");
        assert_eq!(ri.qtype, RecordType::A);
        assert!(!ri.do_bit);
        assert!(ri.ecs.is_none());
        assert!(ri.device_id.is_none());
    }

    #[test]
    fn test_request_info_requires_question() {
        let msg = Message::new();
        let err = RequestInfo::from_msg(&msg).unwrap_err();
        assert!(err.is_parse_error());
    }

    #[test]
    fn test_request_info_parses_ecs() {
        let mut req = query_msg("example.com.");
        let ecs = EcsOption::new(IpNet::from_str("198.51.100.0/24").unwrap(), 0);
        set_ecs(&mut req, &ecs);

        let ri = RequestInfo::from_msg(&req).unwrap();
        assert_eq!(ri.ecs, Some(ecs));
    }

    #[test]
    fn test_remaining_saturates() {
        let req = query_msg("example.com.");
        let ctx = RequestContext {
            server: ServerInfo {
                name: "udp-main".into(),
                addr: "127.0.0.1:53".parse().unwrap(),
                proto: Protocol::Udp,
            },
            client: ClientInfo::default(),
            remote_addr: "127.0.0.1:4242".parse().unwrap(),
            request: RequestInfo::from_msg(&req).unwrap(),
            deadline: Some(Instant::now() - std::time::Duration::from_secs(1)),
        };

        assert_eq!(ctx.remaining(), Some(std::time::Duration::ZERO));
    }
}
