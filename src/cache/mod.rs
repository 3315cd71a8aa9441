//! ECS-aware response cache middleware
//!
//! Two LRU maps of bounded capacity, one for hosts known to honor ECS and
//! one for hosts known not to.  The keyspaces differ in their subnet
//! component:
//!
//! - ECS-honoring host: key carries the location subnet, so clients from
//!   different locations get separately cached answers;
//! - non-honoring host: key carries the family's zero subnet, so all
//!   locations share one entry.
//!
//! A cold host is first probed in the ECS map with the location subnet,
//! then in the non-ECS map with the zero key.  After the upstream
//! answers, the response's scope decides the map: a non-zero scope means
//! the origin used the subnet.
//!
//! ```text
//! Query ──▶ ecs map (host, qtype, DO, loc subnet)
//!             │ miss
//!             ▼
//!           no-ecs map (host, qtype, DO, zero subnet)
//!             │ miss
//!             ▼
//!           clone + set ECS(loc subnet, scope 0) ──▶ next handler
//!             │
//!             ▼
//!           strip OPT/AD ──▶ insert by scope ──▶ re-apply AD/ECS ──▶ write
//! ```
//!
//! There is no single-flight coalescing: concurrent misses for one key
//! each query the upstream, and the last writer wins the slot.

pub mod entry;
pub mod key;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use ipnet::IpNet;
use moka::sync::Cache;
use moka::Expiry;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::context::{RequestContext, RequestInfo};
use crate::error::DnsResult;
use crate::geoip::GeoIp;
use crate::handler::{Handler, Middleware};
use crate::msg;
use crate::msg::ecs::{self, zero_subnet, AddrFamily, EcsOption};
use crate::writer::{NonWriter, ResponseWriter};

pub use entry::CacheEntry;
pub use key::CacheKey;

/// Cache statistics
///
/// Hits and misses are broken down by whether the host was known to honor
/// ECS, mirroring the two keyspaces.
#[derive(Debug, Default)]
pub struct EcsCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    has_support_hits: AtomicU64,
    no_support_hits: AtomicU64,
}

impl EcsCacheStats {
    /// Total hits
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total misses
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Total insertions
    #[must_use]
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Hits in the ECS-honoring map
    #[must_use]
    pub fn has_support_hits(&self) -> u64 {
        self.has_support_hits.load(Ordering::Relaxed)
    }

    /// Hits in the non-honoring map
    #[must_use]
    pub fn no_support_hits(&self) -> u64 {
        self.no_support_hits.load(Ordering::Relaxed)
    }
}

/// Expiry policy taking each entry's TTL
struct EntryExpiry;

impl Expiry<CacheKey, Arc<CacheEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Arc<CacheEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl())
    }
}

/// The two LRU maps and the GeoIP database they key by
pub struct EcsCache {
    /// Entries for hosts that do not honor ECS
    cache: Cache<CacheKey, Arc<CacheEntry>>,
    /// Entries for hosts that honor ECS
    ecs_cache: Cache<CacheKey, Arc<CacheEntry>>,
    /// Used to get subnets for locations
    geoip: Arc<dyn GeoIp>,
    stats: EcsCacheStats,
}

impl EcsCache {
    /// Create the cache pair with the configured bounds
    #[must_use]
    pub fn new(conf: &CacheConfig, geoip: Arc<dyn GeoIp>) -> Arc<Self> {
        Arc::new(Self {
            cache: Cache::builder()
                .max_capacity(conf.size)
                .expire_after(EntryExpiry)
                .build(),
            ecs_cache: Cache::builder()
                .max_capacity(conf.ecs_size)
                .expire_after(EntryExpiry)
                .build(),
            geoip: Arc::clone(&geoip),
            stats: EcsCacheStats::default(),
        })
    }

    /// Cache statistics
    #[must_use]
    pub fn stats(&self) -> &EcsCacheStats {
        &self.stats
    }

    /// Look a query up in both keyspaces
    ///
    /// Returns the entry and whether it came from the ECS-honoring map.
    fn lookup(
        &self,
        host: &str,
        qtype: RecordType,
        do_bit: bool,
        loc_subnet: IpNet,
        fam: AddrFamily,
    ) -> Option<(Arc<CacheEntry>, bool)> {
        let ecs_key = CacheKey::new(host, qtype, do_bit, loc_subnet);
        if let Some(entry) = self.ecs_cache.get(&ecs_key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.stats.has_support_hits.fetch_add(1, Ordering::Relaxed);
            return Some((entry, true));
        }

        let zero_key = CacheKey::new(host, qtype, do_bit, zero_subnet(fam));
        if let Some(entry) = self.cache.get(&zero_key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.stats.no_support_hits.fetch_add(1, Ordering::Relaxed);
            return Some((entry, false));
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert an entry into the map matching the origin's ECS support
    fn insert(&self, key: CacheKey, entry: Arc<CacheEntry>, host_has_ecs: bool) {
        if host_has_ecs {
            self.ecs_cache.insert(key, entry);
        } else {
            self.cache.insert(key, entry);
        }

        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
    }
}

impl Middleware for Arc<EcsCache> {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(EcsCacheHandler {
            cache: Arc::clone(self),
            next,
        })
    }
}

/// The ECS address family of the outgoing request
///
/// The request's own ECS option decides when present; otherwise the
/// family of the real client address, per RFC 7871 §7.1.1.
fn ecs_family(ri: &RequestInfo, remote_ip: std::net::IpAddr) -> AddrFamily {
    match &ri.ecs {
        Some(ecs) => ecs.family(),
        None => AddrFamily::of(remote_ip),
    }
}

/// Handler produced by wrapping the next handler with the cache
struct EcsCacheHandler {
    cache: Arc<EcsCache>,
    next: Arc<dyn Handler>,
}

impl EcsCacheHandler {
    /// Serve a hit, re-applying the client's ECS data when the origin
    /// honors it
    async fn write_cached(
        &self,
        ctx: &RequestContext,
        rw: &mut dyn ResponseWriter,
        req: &Message,
        cached: &CacheEntry,
        host_has_ecs: bool,
    ) -> DnsResult<()> {
        let ri = &ctx.request;
        let mut resp = cached.response_for(req.id(), ri.ad_bit, ri.do_bit);

        if host_has_ecs {
            // Only set the ECS info if the request had it originally; the
            // cached scope is what the origin reported.
            if let Some(req_ecs) = &ri.ecs {
                ecs::set_ecs(&mut resp, &EcsOption::new(req_ecs.subnet, cached.scope()));
            }
        }

        trace!(host = ri.host, host_has_ecs, "cache hit");

        rw.write_msg(ctx, req, &resp).await
    }

    /// Forward on a miss, cache the stripped response, and write the
    /// reconstructed one
    async fn write_upstream(
        &self,
        ctx: &RequestContext,
        rw: &mut dyn ResponseWriter,
        req: &Message,
        loc_subnet: IpNet,
        fam: AddrFamily,
    ) -> DnsResult<()> {
        let ri = &ctx.request;

        let mut up_req = req.clone();
        if fam == AddrFamily::None {
            ecs::clear_ecs(&mut up_req);
        } else {
            ecs::set_ecs(&mut up_req, &EcsOption::new(loc_subnet, 0));
        }

        let mut nrw = NonWriter::new(rw.local_addr(), rw.remote_addr());
        self.next.handle(ctx, &mut nrw, &up_req).await?;

        let Some(mut resp) = nrw.take_msg() else {
            return Ok(());
        };

        let resp_ecs = ecs::ecs_from_msg(&resp)?;
        let scope = resp_ecs.as_ref().map_or(0, |e| e.scope);
        let host_has_ecs = resp_ecs.is_some() && scope != 0;
        let had_ad = resp.authentic_data();

        debug!(host = ri.host, scope, host_has_ecs, "caching upstream response");

        msg::strip_hop_to_hop(&mut resp);
        let ttl = msg::minimal_ttl(&resp);

        let key_subnet = if host_has_ecs {
            loc_subnet
        } else {
            zero_subnet(fam)
        };
        let key = CacheKey::new(&ri.host, ri.qtype, ri.do_bit, key_subnet);
        let cache_entry = Arc::new(CacheEntry::new(
            resp.clone(),
            ttl,
            scope,
            had_ad,
            host_has_ecs,
        ));
        self.cache.insert(key, cache_entry, host_has_ecs);

        // Reconstruct the outbound copy now that the stripped clone is in
        // the cache.
        resp.set_authentic_data(had_ad && (ri.ad_bit || ri.do_bit));
        if host_has_ecs {
            if let Some(req_ecs) = &ri.ecs {
                ecs::set_ecs(&mut resp, &EcsOption::new(req_ecs.subnet, scope));
            }
        }

        rw.write_msg(ctx, req, &resp).await
    }
}

#[async_trait]
impl Handler for EcsCacheHandler {
    async fn handle(
        &self,
        ctx: &RequestContext,
        rw: &mut dyn ResponseWriter,
        req: &Message,
    ) -> DnsResult<()> {
        let ri = &ctx.request;

        let fam = ecs_family(ri, ctx.remote_addr.ip());
        let (country, asn) = ri
            .location
            .as_ref()
            .map_or(("", 0), |loc| (loc.country.as_str(), loc.asn));
        let loc_subnet = self.cache.geoip.subnet_by_location(country, asn, fam).trunc();

        trace!(host = ri.host, country, asn, subnet = %loc_subnet, "cache lookup");

        match self
            .cache
            .lookup(&ri.host, ri.qtype, ri.do_bit, loc_subnet, fam)
        {
            Some((cached, host_has_ecs)) => {
                self.write_cached(ctx, rw, req, &cached, host_has_ecs).await
            }
            None => self.write_upstream(ctx, rw, req, loc_subnet, fam).await,
        }
    }
}
