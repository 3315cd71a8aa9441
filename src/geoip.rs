//! GeoIP interface consumed by the cache middleware
//!
//! The service does not ship a GeoIP database; it consumes one through
//! [`GeoIp`].  The cache middleware needs two lookups: the location of an
//! effective client IP, and a representative subnet for a location, used
//! as the outgoing ECS value and the per-location cache key.
//!
//! A zero-value subnet is a legal answer and maps to the non-ECS cache
//! keyspace.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::msg::ecs::{zero_subnet, AddrFamily};

/// Location of a client, as resolved by the GeoIP database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    /// ISO 3166-1 alpha-2 country code, empty when unknown
    pub country: String,
    /// Autonomous system number, zero when unknown
    pub asn: u32,
}

impl Location {
    /// Create a location
    #[must_use]
    pub fn new(country: impl Into<String>, asn: u32) -> Self {
        Self {
            country: country.into(),
            asn,
        }
    }
}

/// GeoIP database interface
pub trait GeoIp: Send + Sync {
    /// A representative subnet for a location and family
    ///
    /// Returns the family's zero subnet when the database has no better
    /// answer.
    fn subnet_by_location(&self, country: &str, asn: u32, family: AddrFamily) -> IpNet;

    /// Resolve the location of an IP address
    fn location_for(&self, ip: IpAddr) -> Option<Location>;
}

/// GeoIP implementation over static in-memory tables
///
/// Suitable for tests and for deployments that pre-resolve a small,
/// fixed set of locations.  Lookups not present in the tables fall back
/// to zero subnets and unknown locations.
#[derive(Debug, Default)]
pub struct StaticGeoIp {
    subnets_v4: HashMap<String, IpNet>,
    subnets_v6: HashMap<String, IpNet>,
    locations: Vec<(IpNet, Location)>,
}

impl StaticGeoIp {
    /// Create an empty database
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a representative subnet for a country
    #[must_use]
    pub fn with_subnet(mut self, country: impl Into<String>, subnet: IpNet) -> Self {
        let country = country.into();
        match subnet {
            IpNet::V4(_) => self.subnets_v4.insert(country, subnet.trunc()),
            IpNet::V6(_) => self.subnets_v6.insert(country, subnet.trunc()),
        };
        self
    }

    /// Register a location for a client network
    #[must_use]
    pub fn with_location(mut self, network: IpNet, location: Location) -> Self {
        self.locations.push((network, location));
        self
    }
}

impl GeoIp for StaticGeoIp {
    fn subnet_by_location(&self, country: &str, _asn: u32, family: AddrFamily) -> IpNet {
        let table = match family {
            AddrFamily::Ipv6 => &self.subnets_v6,
            _ => &self.subnets_v4,
        };

        table
            .get(country)
            .copied()
            .unwrap_or_else(|| zero_subnet(family))
    }

    fn location_for(&self, ip: IpAddr) -> Option<Location> {
        self.locations
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, loc)| loc.clone())
    }
}
