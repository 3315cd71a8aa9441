//! Upstream forwarder
//!
//! Forwards each query to the configured primary upstream and falls back
//! to the configured fallbacks, in declared order, when the primary times
//! out or errors.  The first successful reply wins; when every upstream
//! fails the forwarder returns an error and the pipeline owes the client
//! a SERVFAIL.
//!
//! When a healthcheck is configured, a periodic probe drives the
//! [`health::UpstreamHealth`] state machine; while the primary is marked
//! down, all traffic bypasses straight to the fallbacks.
//!
//! Upstream exchanges are single-shot UDP: an ephemeral socket per query,
//! a fresh query ID, and source/ID/QNAME validation on the reply.

pub mod health;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::{HealthcheckConfig, UpstreamConfig};
use crate::context::RequestContext;
use crate::error::{DnsError, DnsResult};
use crate::handler::Handler;
use crate::msg;
use crate::refresh::Refresher;
use crate::writer::ResponseWriter;

pub use health::{HealthStats, UpstreamHealth};

/// Receive buffer size for upstream replies, large enough for EDNS0
const UPSTREAM_RECV_BUFFER_SIZE: usize = 4096;

/// Placeholder replaced with a random token in probe domain templates
const RANDOM_PLACEHOLDER: &str = "${RANDOM}";

/// Forwarder statistics
#[derive(Debug, Default)]
pub struct ForwarderStats {
    /// Queries answered by the primary
    primary_answers: AtomicU64,
    /// Queries answered by a fallback
    fallback_answers: AtomicU64,
    /// Queries where every upstream failed
    failures: AtomicU64,
}

impl ForwarderStats {
    /// Queries answered by the primary
    #[must_use]
    pub fn primary_answers(&self) -> u64 {
        self.primary_answers.load(Ordering::Relaxed)
    }

    /// Queries answered by a fallback
    #[must_use]
    pub fn fallback_answers(&self) -> u64 {
        self.fallback_answers.load(Ordering::Relaxed)
    }

    /// Queries where every upstream failed
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Forwarding handler with primary-plus-fallback failover
#[derive(Debug)]
pub struct Forwarder {
    primary: SocketAddr,
    fallbacks: Vec<SocketAddr>,
    timeout: Duration,
    healthcheck: Option<HealthcheckConfig>,
    health: Option<Arc<UpstreamHealth>>,
    stats: ForwarderStats,
}

impl Forwarder {
    /// Build a forwarder from an upstream configuration
    ///
    /// The configuration is assumed validated.  The health state machine
    /// exists only when the healthcheck is enabled; without it the
    /// primary is always tried first.
    #[must_use]
    pub fn from_config(conf: &UpstreamConfig) -> Self {
        let healthcheck = conf.healthcheck.clone().filter(|hc| hc.enabled);
        let health = healthcheck
            .as_ref()
            .map(|hc| Arc::new(UpstreamHealth::new(hc.backoff_duration())));

        Self {
            primary: conf.server,
            fallbacks: conf.fallback.clone(),
            timeout: conf.timeout(),
            healthcheck,
            health,
            stats: ForwarderStats::default(),
        }
    }

    /// The primary upstream address
    #[must_use]
    pub fn primary(&self) -> SocketAddr {
        self.primary
    }

    /// The health state machine, when a healthcheck is configured
    #[must_use]
    pub fn health(&self) -> Option<&Arc<UpstreamHealth>> {
        self.health.as_ref()
    }

    /// The healthcheck configuration, when enabled
    #[must_use]
    pub fn healthcheck(&self) -> Option<&HealthcheckConfig> {
        self.healthcheck.as_ref()
    }

    /// Forwarder statistics
    #[must_use]
    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    /// Whether the forward path currently uses the primary
    fn use_primary(&self) -> bool {
        self.health.as_ref().map_or(true, |h| h.is_healthy())
    }

    /// Forward a query, trying the primary and then the fallbacks
    ///
    /// The outgoing query is a clone with a fresh ID; the reply is
    /// restored to the request ID before it is returned.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::UpstreamError` when every upstream failed.
    pub async fn forward(&self, req: &Message) -> DnsResult<Message> {
        let mut up_req = req.clone();
        up_req.set_id(rand::random());

        let use_primary = self.use_primary();
        let primary = use_primary.then_some(self.primary);
        let order = primary.iter().chain(self.fallbacks.iter());

        let mut last_err = DnsError::upstream(self.primary.to_string(), "no upstream tried");
        for (i, addr) in order.enumerate() {
            match exchange(*addr, &up_req, self.timeout).await {
                Ok(mut resp) => {
                    if use_primary && i == 0 {
                        self.stats.primary_answers.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.stats.fallback_answers.fetch_add(1, Ordering::Relaxed);
                    }

                    resp.set_id(req.id());
                    return Ok(resp);
                }
                Err(err) => {
                    debug!(upstream = %addr, error = %err, "upstream attempt failed");
                    last_err = DnsError::upstream(addr.to_string(), err.to_string());
                }
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);

        Err(last_err)
    }

    /// Probe the primary upstream once and feed the health state machine
    ///
    /// Sends an A query for a template-derived domain straight to the
    /// primary with the probe timeout, regardless of the current health
    /// state.
    ///
    /// # Errors
    ///
    /// Returns the probe failure; callers report it as a routine error.
    pub async fn probe(&self) -> DnsResult<()> {
        let (Some(hc), Some(health)) = (&self.healthcheck, &self.health) else {
            return Ok(());
        };

        let token = format!("{:08x}", rand::random::<u32>());
        let domain = hc.domain_template.replace(RANDOM_PLACEHOLDER, &token);
        let name = Name::from_ascii(&domain)
            .map_err(|e| DnsError::config(format!("bad probe domain {domain:?}: {e}")))?;

        let mut probe_req = Message::new();
        probe_req
            .set_id(rand::random())
            .set_recursion_desired(true)
            .add_query(Query::query(name, RecordType::A));

        match exchange(self.primary, &probe_req, hc.timeout()).await {
            Ok(_) => {
                trace!(upstream = %self.primary, domain, "healthcheck probe succeeded");
                health.record_probe_success();
                Ok(())
            }
            Err(err) => {
                debug!(upstream = %self.primary, domain, error = %err, "healthcheck probe failed");
                health.record_probe_failure();
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Handler for Forwarder {
    async fn handle(
        &self,
        ctx: &RequestContext,
        rw: &mut dyn ResponseWriter,
        req: &Message,
    ) -> DnsResult<()> {
        let resp = self.forward(req).await?;
        rw.write_msg(ctx, req, &resp).await
    }
}

#[async_trait]
impl Refresher for Forwarder {
    async fn refresh(&self) -> DnsResult<()> {
        self.probe().await
    }
}

/// Perform one UDP exchange with an upstream
///
/// Binds an ephemeral socket, sends the query, and waits for a reply
/// that comes from the right source and validates against the query.
async fn exchange(addr: SocketAddr, req: &Message, dur: Duration) -> DnsResult<Message> {
    let req_bytes = req
        .to_vec()
        .map_err(|e| DnsError::serialize(format!("packing upstream query: {e}")))?;

    let bind_addr: SocketAddr = if addr.is_ipv6() {
        "[::]:0".parse().map_err(|e| DnsError::internal(format!("bind addr: {e}")))?
    } else {
        "0.0.0.0:0".parse().map_err(|e| DnsError::internal(format!("bind addr: {e}")))?
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| DnsError::network_io("binding upstream socket", e))?;

    socket
        .send_to(&req_bytes, addr)
        .await
        .map_err(|e| DnsError::network_io(format!("sending query to {addr}"), e))?;

    let exchange = async {
        let mut buf = vec![0u8; UPSTREAM_RECV_BUFFER_SIZE];
        loop {
            let (len, src) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| DnsError::network_io(format!("receiving reply from {addr}"), e))?;

            if src != addr {
                trace!(src = %src, expected = %addr, "dropping reply from unexpected source");
                continue;
            }

            let resp = match Message::from_vec(&buf[..len]) {
                Ok(resp) => resp,
                Err(e) => {
                    trace!(src = %src, error = %e, "dropping unparseable reply");
                    continue;
                }
            };

            if !msg::validate_response(req, &resp) {
                trace!(src = %src, "dropping reply failing validation");
                continue;
            }

            return Ok(resp);
        }
    };

    timeout(dur, exchange)
        .await
        .map_err(|_| DnsError::timeout(format!("query to {addr}"), dur))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::AtomicUsize;

    use hickory_proto::op::{MessageType, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record};

    use crate::config::HealthcheckConfig;

    /// Spawn a mock upstream answering every A query with a fixed address
    async fn mock_upstream(answer: Ipv4Addr) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let task_hits = Arc::clone(&hits);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                task_hits.fetch_add(1, Ordering::SeqCst);

                let Ok(req) = Message::from_vec(&buf[..len]) else {
                    continue;
                };

                let mut resp = Message::new();
                resp.set_id(req.id())
                    .set_message_type(MessageType::Response)
                    .set_response_code(ResponseCode::NoError);
                if let Some(q) = req.queries().first() {
                    resp.add_query(q.clone());
                    resp.add_answer(Record::from_rdata(
                        q.name().clone(),
                        60,
                        RData::A(A(answer)),
                    ));
                }

                let _ = socket.send_to(&resp.to_vec().unwrap(), src).await;
            }
        });

        (addr, hits)
    }

    /// An address that will not answer: bound, then immediately dropped
    async fn dead_addr() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.local_addr().unwrap()
    }

    fn a_query(host: &str) -> Message {
        let mut req = Message::new();
        req.set_id(0x2222).set_recursion_desired(true);
        req.add_query(Query::query(Name::from_str(host).unwrap(), RecordType::A));
        req
    }

    fn upstream_conf(primary: SocketAddr, fallback: SocketAddr) -> UpstreamConfig {
        UpstreamConfig::new(primary)
            .with_fallback(fallback)
            .with_timeout(Duration::from_millis(250))
    }

    #[tokio::test]
    async fn test_forward_uses_primary() {
        let (primary, primary_hits) = mock_upstream(Ipv4Addr::new(1, 1, 1, 1)).await;
        let (fallback, fallback_hits) = mock_upstream(Ipv4Addr::new(2, 2, 2, 2)).await;

        let forwarder = Forwarder::from_config(&upstream_conf(primary, fallback));
        let resp = forwarder.forward(&a_query("example.com.")).await.unwrap();

        assert_eq!(resp.id(), 0x2222);
        assert_eq!(resp.answers().len(), 1);
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 0);
        assert_eq!(forwarder.stats().primary_answers(), 1);
    }

    #[tokio::test]
    async fn test_forward_falls_back_on_primary_failure() {
        let primary = dead_addr().await;
        let (fallback, fallback_hits) = mock_upstream(Ipv4Addr::new(2, 2, 2, 2)).await;

        let forwarder = Forwarder::from_config(&upstream_conf(primary, fallback));
        let resp = forwarder.forward(&a_query("example.com.")).await.unwrap();

        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);
        assert_eq!(forwarder.stats().fallback_answers(), 1);
    }

    #[tokio::test]
    async fn test_forward_total_failure() {
        let primary = dead_addr().await;
        let fallback = dead_addr().await;

        let forwarder = Forwarder::from_config(&upstream_conf(primary, fallback));
        let err = forwarder.forward(&a_query("example.com.")).await.unwrap_err();

        assert!(err.is_upstream_error());
        assert_eq!(forwarder.stats().failures(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_primary_is_bypassed() {
        let (primary, primary_hits) = mock_upstream(Ipv4Addr::new(1, 1, 1, 1)).await;
        let (fallback, fallback_hits) = mock_upstream(Ipv4Addr::new(2, 2, 2, 2)).await;

        let mut conf = upstream_conf(primary, fallback);
        conf.healthcheck = Some(HealthcheckConfig {
            enabled: true,
            domain_template: "${RANDOM}-probe.example.com".into(),
            interval_ms: 100,
            timeout_ms: 100,
            backoff_duration_ms: 60_000,
        });

        let forwarder = Forwarder::from_config(&conf);
        forwarder.health().unwrap().record_probe_failure();

        let resp = forwarder.forward(&a_query("example.com.")).await.unwrap();
        assert_eq!(resp.answers().len(), 1);

        // The primary answers probes only; the query went to the fallback.
        assert_eq!(primary_hits.load(Ordering::SeqCst), 0);
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_drives_health() {
        let (primary, _) = mock_upstream(Ipv4Addr::new(1, 1, 1, 1)).await;
        let fallback = dead_addr().await;

        let mut conf = upstream_conf(primary, fallback);
        conf.healthcheck = Some(HealthcheckConfig {
            enabled: true,
            domain_template: "${RANDOM}-probe.example.com".into(),
            interval_ms: 100,
            timeout_ms: 250,
            backoff_duration_ms: 1,
        });

        let forwarder = Forwarder::from_config(&conf);
        forwarder.probe().await.unwrap();
        assert_eq!(forwarder.health().unwrap().stats().probes, 1);
        assert!(forwarder.health().unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_probe_failure_marks_unhealthy() {
        let primary = dead_addr().await;
        let (fallback, _) = mock_upstream(Ipv4Addr::new(2, 2, 2, 2)).await;

        let mut conf = upstream_conf(primary, fallback);
        conf.healthcheck = Some(HealthcheckConfig {
            enabled: true,
            domain_template: "${RANDOM}-probe.example.com".into(),
            interval_ms: 100,
            timeout_ms: 100,
            backoff_duration_ms: 60_000,
        });

        let forwarder = Forwarder::from_config(&conf);
        assert!(forwarder.probe().await.is_err());
        assert!(!forwarder.health().unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_exchange_validates_source_and_id() {
        // A mock that answers with a wrong ID first never satisfies the
        // exchange; the call times out instead of returning bad data.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            if let Ok((len, src)) = socket.recv_from(&mut buf).await {
                if let Ok(req) = Message::from_vec(&buf[..len]) {
                    let mut resp = Message::new();
                    resp.set_id(req.id().wrapping_add(1))
                        .set_message_type(MessageType::Response);
                    let _ = socket.send_to(&resp.to_vec().unwrap(), src).await;
                }
            }
        });

        let err = exchange(addr, &a_query("example.com."), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
