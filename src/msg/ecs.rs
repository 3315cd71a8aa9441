//! EDNS Client Subnet option codec (RFC 7871)
//!
//! The ECS option carries a client-approximated subnet in queries and a
//! scope prefix in responses indicating how much of the subnet the origin
//! actually used.  A scope of zero means the origin is not ECS-aware.
//!
//! # Wire Format
//!
//! ```text
//! Family (2 bytes)          1 = IPv4, 2 = IPv6
//! Source Prefix (1 byte)    bits of address the sender provided
//! Scope Prefix (1 byte)     bits the origin used, 0 in queries
//! Address (variable)        ceil(source / 8) bytes, masked
//! ```
//!
//! Only the IPv4 and IPv6 families are accepted; anything else on the
//! wire is rejected at parse time.

use std::net::IpAddr;

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{DnsError, DnsResult};

/// EDNS payload size advertised when this crate creates the OPT record
const ADVERTISED_UDP_PAYLOAD: u16 = 1232;

/// ECS address family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    /// No family; used for cleared ECS data
    None,
    /// IPv4, wire value 1
    Ipv4,
    /// IPv6, wire value 2
    Ipv6,
}

impl AddrFamily {
    /// The wire value of this family
    #[must_use]
    pub fn wire(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Ipv4 => 1,
            Self::Ipv6 => 2,
        }
    }

    /// The family of an IP address
    #[must_use]
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

/// The zero subnet for a family (`0.0.0.0/0` or `::/0`)
///
/// Zero subnets keep their family, so the IPv4 zero and the IPv6 zero
/// never compare equal.
#[must_use]
pub fn zero_subnet(family: AddrFamily) -> IpNet {
    match family {
        AddrFamily::Ipv6 => IpNet::V6(Ipv6Net::default()),
        _ => IpNet::V4(Ipv4Net::default()),
    }
}

/// A parsed EDNS Client Subnet option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsOption {
    /// The client subnet, masked to its prefix length
    pub subnet: IpNet,
    /// The scope prefix length
    pub scope: u8,
}

impl EcsOption {
    /// Create an ECS option, masking the subnet to its prefix
    #[must_use]
    pub fn new(subnet: IpNet, scope: u8) -> Self {
        Self {
            subnet: subnet.trunc(),
            scope,
        }
    }

    /// The address family of the subnet
    #[must_use]
    pub fn family(&self) -> AddrFamily {
        AddrFamily::of(self.subnet.addr())
    }

    /// Check whether the subnet is the zero subnet of its family
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.subnet.prefix_len() == 0
    }
}

/// Parse an ECS option body
fn parse_ecs_data(data: &[u8]) -> DnsResult<EcsOption> {
    if data.len() < 4 {
        return Err(DnsError::parse(format!(
            "ecs option too short: {} bytes",
            data.len()
        )));
    }

    let family = u16::from_be_bytes([data[0], data[1]]);
    let source = data[2];
    let scope = data[3];
    let addr_bytes = &data[4..];

    let want_len = usize::from(source).div_ceil(8);
    if addr_bytes.len() != want_len {
        return Err(DnsError::parse(format!(
            "ecs address length {} does not match prefix {source}",
            addr_bytes.len()
        )));
    }

    let subnet = match family {
        1 => {
            if source > 32 {
                return Err(DnsError::parse(format!("bad ipv4 ecs prefix {source}")));
            }

            let mut octets = [0u8; 4];
            octets[..addr_bytes.len()].copy_from_slice(addr_bytes);
            let net = Ipv4Net::new(octets.into(), source)
                .map_err(|e| DnsError::parse(format!("bad ipv4 ecs subnet: {e}")))?;
            IpNet::V4(net)
        }
        2 => {
            if source > 128 {
                return Err(DnsError::parse(format!("bad ipv6 ecs prefix {source}")));
            }

            let mut octets = [0u8; 16];
            octets[..addr_bytes.len()].copy_from_slice(addr_bytes);
            let net = Ipv6Net::new(octets.into(), source)
                .map_err(|e| DnsError::parse(format!("bad ipv6 ecs subnet: {e}")))?;
            IpNet::V6(net)
        }
        other => {
            return Err(DnsError::parse(format!(
                "unsupported ecs address family {other}"
            )));
        }
    };

    Ok(EcsOption::new(subnet, scope))
}

/// Serialize an ECS option body
fn pack_ecs_data(ecs: &EcsOption) -> Vec<u8> {
    let source = ecs.subnet.prefix_len();
    let addr_len = usize::from(source).div_ceil(8);

    let mut data = Vec::with_capacity(4 + addr_len);
    data.extend_from_slice(&ecs.family().wire().to_be_bytes());
    data.push(source);
    data.push(ecs.scope);

    match ecs.subnet.network() {
        IpAddr::V4(v4) => data.extend_from_slice(&v4.octets()[..addr_len]),
        IpAddr::V6(v6) => data.extend_from_slice(&v6.octets()[..addr_len]),
    }

    data
}

/// Extract the ECS option from a message, if any
///
/// # Errors
///
/// Returns `DnsError::ParseError` for a malformed option body or an
/// unsupported address family.
pub fn ecs_from_msg(msg: &Message) -> DnsResult<Option<EcsOption>> {
    let Some(edns) = msg.extensions().as_ref() else {
        return Ok(None);
    };

    match edns.options().get(EdnsCode::Subnet) {
        None => Ok(None),
        Some(EdnsOption::Unknown(_, data)) => parse_ecs_data(data).map(Some),
        Some(other) => Err(DnsError::parse(format!(
            "unexpected ecs option representation: {other:?}"
        ))),
    }
}

/// Set the ECS option on a message, creating the OPT record if needed
pub fn set_ecs(msg: &mut Message, ecs: &EcsOption) {
    let payload = pack_ecs_data(ecs);

    let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
    if edns.max_payload() < 512 {
        edns.set_max_payload(ADVERTISED_UDP_PAYLOAD);
    }

    edns.options_mut()
        .insert(EdnsOption::Unknown(EdnsCode::Subnet.into(), payload));
}

/// Remove the ECS option from a message, keeping the OPT record
pub fn clear_ecs(msg: &mut Message) {
    if let Some(edns) = msg.extensions_mut().as_mut() {
        edns.options_mut().remove(EdnsCode::Subnet);
    }
}
