//! Cache key
//!
//! A response is indexed by what the client asked and by the subnet the
//! answer was tailored for.  Keys in the ECS-honoring cache carry the
//! location subnet; keys in the other cache carry the family's zero
//! subnet.  Zero subnets keep their family, so an IPv4 zero key and an
//! IPv6 zero key never alias.

use hickory_proto::rr::RecordType;
use ipnet::IpNet;

/// Lookup key for a cached response
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Query name, lowercased
    host: String,
    /// Query type
    qtype: RecordType,
    /// DO bit of the query
    do_bit: bool,
    /// Location subnet, or the family's zero subnet
    subnet: IpNet,
}

impl CacheKey {
    /// Create a cache key
    ///
    /// The host is lowercased and the subnet masked to its prefix.
    #[must_use]
    pub fn new(host: &str, qtype: RecordType, do_bit: bool, subnet: IpNet) -> Self {
        Self {
            host: host.to_lowercase(),
            qtype,
            do_bit,
            subnet: subnet.trunc(),
        }
    }

    /// The query name
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The query type
    #[must_use]
    pub fn qtype(&self) -> RecordType {
        self.qtype
    }

    /// The DO bit
    #[must_use]
    pub fn do_bit(&self) -> bool {
        self.do_bit
    }

    /// The subnet component
    #[must_use]
    pub fn subnet(&self) -> IpNet {
        self.subnet
    }
}
