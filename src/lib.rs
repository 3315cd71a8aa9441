//! dnsgate: forwarding DNS service with encrypted transports
//!
//! A recursive-capable forwarding DNS service exposing plain DNS
//! (UDP/TCP), DNS-over-TLS, and DNS-over-HTTPS (wireformat and the JSON
//! API), forwarding every resolved query to a configured upstream with
//! automatic failover to fallbacks.
//!
//! # Features
//!
//! - **Multiple transports**: UDP, TCP, DoT, and DoH listeners sharing
//!   one handler pipeline per server group
//! - **Failover**: primary-then-fallback forwarding with a healthcheck
//!   backoff state machine over primary liveness
//! - **ECS-aware caching**: two LRU keyspaces, split by whether the
//!   origin honors EDNS Client Subnet
//! - **Device identity**: device IDs extracted from TLS SNI wildcards
//!   and DoH URL paths
//!
//! # Architecture
//!
//! ```text
//! transport accepts ──▶ decode ──▶ request context
//!                                   (server, client, device id,
//!                                    location, parsed ECS)
//!                                        │
//!                                        ▼
//!                                  ECS cache middleware
//!                                        │ miss
//!                                        ▼
//!                                  forwarder ──▶ primary ──▶ fallbacks
//!                                        │
//!                                        ▼
//!                                  response writer per transport
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dnsgate::config::load_config;
//! use dnsgate::errcoll::LogCollector;
//! use dnsgate::geoip::StaticGeoIp;
//! use dnsgate::service::DnsService;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/dnsgate/config.json")?;
//!
//! let service = DnsService::build(
//!     &config,
//!     Arc::new(StaticGeoIp::new()),
//!     Arc::new(LogCollector::new()),
//!     None,
//! )
//! .await?;
//!
//! service.start().await?;
//! // ... run until a shutdown signal ...
//! service.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: configuration types and loading
//! - [`context`]: the request context carried through the pipeline
//! - [`cache`]: the ECS-aware response cache middleware
//! - [`device`]: device-ID extraction from SNI and DoH paths
//! - [`forward`]: the upstream forwarder and health state machine
//! - [`msg`]: DNS message helpers and the ECS option codec
//! - [`server`]: the UDP/TCP/TLS/HTTPS listeners
//! - [`service`]: composition of groups into a running service

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod cache;
pub mod config;
pub mod context;
pub mod device;
pub mod errcoll;
pub mod error;
pub mod forward;
pub mod geoip;
pub mod handler;
pub mod io;
pub mod msg;
pub mod refresh;
pub mod server;
pub mod service;
pub mod writer;

// Re-export commonly used types at the crate root
pub use cache::{CacheEntry, CacheKey, EcsCache};
pub use config::{
    load_config, load_config_str, CacheConfig, Config, HealthcheckConfig, Protocol, ServerConfig,
    ServerGroupConfig, UpstreamConfig,
};
pub use context::{ClientInfo, RequestContext, RequestInfo, ServerInfo};
pub use device::{DeviceId, DeviceIdError, DeviceIdSource};
pub use errcoll::{ErrorCollector, LogCollector};
pub use error::{DnsError, DnsResult};
pub use forward::{Forwarder, UpstreamHealth};
pub use geoip::{GeoIp, Location, StaticGeoIp};
pub use handler::{Handler, Middleware};
pub use server::{DnsServer, HttpsServer, Pipeline, TcpServer, UdpServer};
pub use service::DnsService;
pub use writer::{NonWriter, ResponseWriter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
