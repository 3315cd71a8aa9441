//! Server runtime
//!
//! Every listener implements [`DnsServer`]: `start` spawns the accept or
//! read loop, `shutdown` stops it and drains in-flight work, and
//! `local_addr` reports the bound address.  The per-protocol modules own
//! protocol-specific state:
//!
//! - [`udp`]: datagram read loop with pooled buffers
//! - [`tcp`]: framed stream server, also carrying the TLS variant
//! - [`tls`]: TLS acceptor construction from PEM material
//! - [`https`]: DoH server with the wireformat and JSON routes
//!
//! # Lifecycle
//!
//! A server moves NotStarted → Running → Stopped, guarded by a started
//! flag under a lock; it never restarts.  Shutdown flips the flag, wakes
//! the loops, releases blocked connection reads through the registry, and
//! waits for task drain bounded by the caller's timeout.
//!
//! # Panic policy
//!
//! An accept-loop panic is fatal: losing a listener silently would
//! degrade service, so the monitor aborts the process.  A per-query
//! handler panic is isolated to that query, reported to the error
//! collector, and the server keeps going.

pub mod https;
pub mod json;
pub mod tcp;
pub mod tls;
pub mod udp;

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::Protocol;
use crate::context::{ClientInfo, RequestContext, RequestInfo, ServerInfo};
use crate::device;
use crate::errcoll::ErrorCollector;
use crate::error::{DnsError, DnsResult};
use crate::geoip::GeoIp;
use crate::handler::Handler;
use crate::msg;
use crate::writer::ResponseWriter;

pub use https::{HttpsServer, HttpsServerConfig, NonDnsHandler};
pub use tcp::{TcpServer, TcpServerConfig};
pub use udp::{UdpServer, UdpServerConfig};

/// Default read timeout for datagram and stream reads
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Default write timeout for responses
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default TCP idle timeout between queries on one connection
///
/// RFC 7766 recommends an idle period in the order of seconds.
pub const DEFAULT_TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// A running DNS listener
#[async_trait]
pub trait DnsServer: Send + Sync {
    /// Configured server name
    fn name(&self) -> &str;

    /// Transport protocol
    fn proto(&self) -> Protocol;

    /// Bound listener address
    fn local_addr(&self) -> SocketAddr;

    /// Start serving
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::AlreadyStarted`] when called twice.
    async fn start(&self) -> DnsResult<()>;

    /// Stop serving and wait for in-flight work, bounded by `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::NotStarted`] when the server is not running
    /// and [`DnsError::TimeoutError`] when draining exceeds the bound.
    async fn shutdown(&self, timeout: Duration) -> DnsResult<()>;
}

/// What every transport needs to dispatch a query
///
/// Shared by reference between all listeners of a server group.
pub struct Pipeline {
    /// The handler chain
    pub handler: Arc<dyn Handler>,
    /// Error sink
    pub errcoll: Arc<dyn ErrorCollector>,
    /// GeoIP database for client locations
    pub geoip: Arc<dyn GeoIp>,
    /// Device-ID wildcards of the group
    pub wildcards: Vec<String>,
}

impl Pipeline {
    /// Build the request context for a parsed query
    ///
    /// Resolves the effective client location (the ECS subnet address
    /// when present, the remote address otherwise) and extracts the
    /// device ID.  Device-ID errors are collected and the context is
    /// built without one.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ParseError` for a query without a question or
    /// with a malformed ECS option.
    pub fn build_context(
        &self,
        server: ServerInfo,
        client: ClientInfo,
        remote_addr: SocketAddr,
        req: &Message,
        deadline: Option<Instant>,
    ) -> DnsResult<RequestContext> {
        let mut request = RequestInfo::from_msg(req)?;

        let effective_ip = request
            .ecs
            .as_ref()
            .map_or(remote_addr.ip(), |ecs| ecs.subnet.addr());
        request.location = self.geoip.location_for(effective_ip);

        match device::extract_device_id(
            server.proto,
            client.url_path.as_deref(),
            client.tls_server_name.as_deref(),
            &self.wildcards,
        ) {
            Ok(id) => request.device_id = id,
            Err(err) => self.errcoll.collect(&server.name, &err.into()),
        }

        Ok(RequestContext {
            server,
            client,
            remote_addr,
            request,
            deadline,
        })
    }

    /// Run one query through the handler chain
    ///
    /// A handler error is collected and, when nothing has been written
    /// yet, answered with SERVFAIL; a response is owed wherever one can
    /// still be delivered.
    pub async fn serve(&self, ctx: &RequestContext, rw: &mut dyn ResponseWriter, req: &Message) {
        if let Err(err) = self.handler.handle(ctx, rw, req).await {
            self.errcoll.collect(&ctx.server.name, &err);

            if !rw.written() {
                let resp = msg::servfail(req);
                if let Err(write_err) = rw.write_msg(ctx, req, &resp).await {
                    debug!(server = ctx.server.name, error = %write_err, "writing servfail failed");
                }
            }
        }
    }
}

/// Counter of live tasks, awaited on shutdown
#[derive(Debug)]
pub(crate) struct WaitGroup {
    count: watch::Sender<usize>,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    /// Track one task; the returned guard releases it on drop
    pub(crate) fn guard(self: &Arc<Self>) -> WaitGroupGuard {
        self.count.send_modify(|c| *c += 1);
        WaitGroupGuard {
            wg: Arc::clone(self),
        }
    }

    /// Wait until every tracked task has finished
    pub(crate) async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The result is only an error when the sender is dropped, which
        // cannot happen while `self` is alive.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

/// RAII release for a [`WaitGroup`] slot
#[derive(Debug)]
pub(crate) struct WaitGroupGuard {
    wg: Arc<WaitGroup>,
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        self.wg.count.send_modify(|c| *c = c.saturating_sub(1));
    }
}

/// Lifecycle state shared by the server implementations
#[derive(Debug)]
pub(crate) struct ServeState {
    /// Started flag, the NotStarted/Running/Stopped guard
    started: Mutex<bool>,
    /// Set once shutdown begins; loops poll it at their tops
    stopping: AtomicBool,
    /// Wakes loops blocked in socket reads
    shutdown: Notify,
    /// Tracks the serve loops and in-flight queries
    pub(crate) tasks: Arc<WaitGroup>,
}

impl ServeState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Mutex::new(false),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            tasks: Arc::new(WaitGroup::new()),
        })
    }

    /// Transition NotStarted → Running
    pub(crate) fn begin_start(&self, name: &str) -> DnsResult<()> {
        let mut started = self.started.lock();
        if *started {
            return Err(DnsError::already_started(name));
        }

        *started = true;

        Ok(())
    }

    /// Transition Running → Stopped and wake blocked loops
    pub(crate) fn begin_shutdown(&self, name: &str) -> DnsResult<()> {
        {
            let mut started = self.started.lock();
            if !*started {
                return Err(DnsError::not_started(name));
            }

            *started = false;
        }

        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        Ok(())
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// A future that resolves when shutdown begins
    pub(crate) fn stopped(&self) -> tokio::sync::futures::Notified<'_> {
        self.shutdown.notified()
    }

    /// Wait for task drain, bounded by `timeout`
    pub(crate) async fn wait_drain(&self, name: &str, timeout: Duration) -> DnsResult<()> {
        tokio::time::timeout(timeout, self.tasks.wait())
            .await
            .map_err(|_| DnsError::timeout(format!("shutting down server {name}"), timeout))
    }
}

/// Watch the accept-loop task and abort the process if it panics
///
/// Losing the listener silently would degrade service; an accept-loop
/// panic is fatal by design.
pub(crate) fn monitor_accept_task(name: String, handle: JoinHandle<()>) {
    tokio::spawn(async move {
        if let Err(err) = handle.await {
            if err.is_panic() {
                error!(server = name, "accept loop panicked, aborting process");
                std::process::abort();
            }
        }
    });
}

/// Report an isolated handler panic to the error collector
pub(crate) fn report_handler_panic(
    errcoll: &Arc<dyn ErrorCollector>,
    server_name: &str,
    context: &str,
) {
    errcoll.collect(server_name, &DnsError::handler_panic(context.to_string()));
}
