//! Service composition
//!
//! Builds the running service out of the configuration tree: one
//! forwarder, one ECS cache, and one handler pipeline per server group,
//! shared by every listener in the group; one listener per configured
//! bind address.  Start and shutdown fan out across all listeners, and
//! the upstream healthcheck runs on a refresh worker owned by its group.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::cache::EcsCache;
use crate::config::{Config, Protocol, ServerConfig, ServerGroupConfig};
use crate::errcoll::ErrorCollector;
use crate::error::{DnsError, DnsResult};
use crate::forward::Forwarder;
use crate::geoip::GeoIp;
use crate::handler::{Handler, Middleware};
use crate::refresh::RefreshWorker;
use crate::server::https::{HttpsServer, HttpsServerConfig, NonDnsHandler};
use crate::server::tls::{tls_acceptor, ALPN_DOH, ALPN_DOT};
use crate::server::{DnsServer, Pipeline, TcpServer, TcpServerConfig, UdpServer, UdpServerConfig};

/// One composed server group
pub struct ServerGroup {
    name: String,
    servers: Vec<Arc<dyn DnsServer>>,
    forwarder: Arc<Forwarder>,
    cache: Arc<EcsCache>,
    health_worker: Mutex<Option<RefreshWorker>>,
}

impl ServerGroup {
    /// The group name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group's listeners
    #[must_use]
    pub fn servers(&self) -> &[Arc<dyn DnsServer>] {
        &self.servers
    }

    /// The group's forwarder
    #[must_use]
    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    /// The group's cache
    #[must_use]
    pub fn cache(&self) -> &Arc<EcsCache> {
        &self.cache
    }
}

/// The composed DNS service
pub struct DnsService {
    groups: Vec<ServerGroup>,
    errcoll: Arc<dyn ErrorCollector>,
}

impl DnsService {
    /// Build the service from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for protocols the runtime does
    /// not serve, missing TLS material, and bind failures.
    pub async fn build(
        config: &Config,
        geoip: Arc<dyn GeoIp>,
        errcoll: Arc<dyn ErrorCollector>,
        non_dns: Option<Arc<dyn NonDnsHandler>>,
    ) -> DnsResult<Self> {
        let mut groups = Vec::with_capacity(config.server_groups.len());
        for group_conf in &config.server_groups {
            groups.push(
                build_group(config, group_conf, &geoip, &errcoll, non_dns.clone()).await?,
            );
        }

        Ok(Self { groups, errcoll })
    }

    /// The composed groups
    #[must_use]
    pub fn groups(&self) -> &[ServerGroup] {
        &self.groups
    }

    /// All listeners with their bound addresses
    #[must_use]
    pub fn server_addrs(&self) -> Vec<(String, Protocol, SocketAddr)> {
        self.groups
            .iter()
            .flat_map(|g| g.servers.iter())
            .map(|s| (s.name().to_string(), s.proto(), s.local_addr()))
            .collect()
    }

    /// Start every listener and the healthcheck workers
    ///
    /// On failure, everything already started is shut down again.
    ///
    /// # Errors
    ///
    /// Returns the first start error.
    pub async fn start(&self) -> DnsResult<()> {
        for group in &self.groups {
            for server in &group.servers {
                if let Err(err) = server.start().await {
                    warn!(group = group.name, server = server.name(), error = %err, "start failed, rolling back");
                    let _ = self.shutdown(Duration::from_secs(5)).await;
                    return Err(err);
                }
            }

            if let Some(hc) = group.forwarder.healthcheck() {
                let worker = RefreshWorker::start(
                    format!("{} upstream healthcheck", group.name),
                    hc.interval(),
                    hc.timeout() * 2,
                    Arc::clone(&group.forwarder) as Arc<dyn crate::refresh::Refresher>,
                    Arc::clone(&self.errcoll),
                );
                *group.health_worker.lock() = Some(worker);
            }

            info!(group = group.name, servers = group.servers.len(), "server group started");
        }

        Ok(())
    }

    /// Stop the healthcheck workers and every listener
    ///
    /// # Errors
    ///
    /// Returns the first shutdown error; the fan-out still reaches every
    /// listener.
    pub async fn shutdown(&self, timeout: Duration) -> DnsResult<()> {
        let mut first_err = None;

        for group in &self.groups {
            // The guard must not be held across the await below.
            let worker = group.health_worker.lock().take();
            if let Some(worker) = worker {
                worker.shutdown().await;
            }

            for server in &group.servers {
                if let Err(err) = server.shutdown(timeout).await {
                    // A listener that never started reports NotStarted
                    // here; that is not a shutdown failure.
                    if !matches!(err, DnsError::NotStarted { .. }) && first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }

            info!(group = group.name, "server group stopped");
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Compose one server group
async fn build_group(
    config: &Config,
    group_conf: &ServerGroupConfig,
    geoip: &Arc<dyn GeoIp>,
    errcoll: &Arc<dyn ErrorCollector>,
    non_dns: Option<Arc<dyn NonDnsHandler>>,
) -> DnsResult<ServerGroup> {
    let forwarder = Arc::new(Forwarder::from_config(&group_conf.upstream));
    let cache = EcsCache::new(&config.cache, Arc::clone(geoip));
    let handler = cache.wrap(Arc::clone(&forwarder) as Arc<dyn Handler>);

    let pipeline = Arc::new(Pipeline {
        handler,
        errcoll: Arc::clone(errcoll),
        geoip: Arc::clone(geoip),
        wildcards: group_conf.device_id_wildcards.clone(),
    });

    let mut servers: Vec<Arc<dyn DnsServer>> = Vec::new();
    for server_conf in &group_conf.servers {
        for (i, addr) in server_conf.bind_addresses.iter().enumerate() {
            let name = if server_conf.bind_addresses.len() > 1 {
                format!("{}-{i}", server_conf.name)
            } else {
                server_conf.name.clone()
            };

            servers.push(build_server(server_conf, name, *addr, &pipeline, non_dns.clone()).await?);
        }
    }

    Ok(ServerGroup {
        name: group_conf.name.clone(),
        servers,
        forwarder,
        cache,
        health_worker: Mutex::new(None),
    })
}

/// Construct one listener
async fn build_server(
    conf: &ServerConfig,
    name: String,
    addr: SocketAddr,
    pipeline: &Arc<Pipeline>,
    non_dns: Option<Arc<dyn NonDnsHandler>>,
) -> DnsResult<Arc<dyn DnsServer>> {
    let tls_files = conf.tls.as_ref();

    match conf.protocol {
        Protocol::Udp => {
            let server = UdpServer::bind(UdpServerConfig::new(name, addr), Arc::clone(pipeline)).await?;
            Ok(Arc::new(server))
        }
        Protocol::Tcp => {
            let server = TcpServer::bind(TcpServerConfig::new(name, addr), Arc::clone(pipeline)).await?;
            Ok(Arc::new(server))
        }
        Protocol::Tls => {
            let files = tls_files.ok_or_else(|| {
                DnsError::config_field(format!("server {name}: tls requires material"), "server.tls")
            })?;
            let acceptor = tls_acceptor(files, ALPN_DOT)?;
            let server = TcpServer::bind(
                TcpServerConfig::new(name, addr).with_tls(acceptor),
                Arc::clone(pipeline),
            )
            .await?;
            Ok(Arc::new(server))
        }
        Protocol::Https => {
            let files = tls_files.ok_or_else(|| {
                DnsError::config_field(format!("server {name}: https requires material"), "server.tls")
            })?;
            let acceptor = tls_acceptor(files, ALPN_DOH)?;
            let server = HttpsServer::bind(
                HttpsServerConfig::new(name, addr).with_tls(acceptor),
                Arc::clone(pipeline),
                non_dns,
            )
            .await?;
            Ok(Arc::new(server))
        }
        proto @ (Protocol::Quic | Protocol::DnscryptUdp | Protocol::DnscryptTcp) => {
            Err(DnsError::config_field(
                format!("server {name}: protocol {proto} is not served by this runtime"),
                "server.protocol",
            ))
        }
    }
}
