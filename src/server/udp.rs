//! UDP DNS server
//!
//! A single datagram loop: read one packet into a pooled buffer, parse
//! it, hand the parsed message to a concurrent query task, and return
//! the buffer to the pool.  Replies may reorder freely between queries.
//!
//! Oversized or otherwise malformed datagrams are silently dropped and
//! counted as invalid messages.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::{
    monitor_accept_task, DnsServer, Pipeline, ServeState, DEFAULT_WRITE_TIMEOUT,
};
use crate::config::{Protocol, DEFAULT_MSG_BUFFER_SIZE};
use crate::context::{ClientInfo, RequestContext, ServerInfo};
use crate::error::{DnsError, DnsResult};
use crate::io::BufferPool;
use crate::msg;
use crate::writer::ResponseWriter;

/// Buffers kept in the UDP read pool
const UDP_POOL_CAPACITY: usize = 256;

/// Smallest payload size a client can advertise via EDNS
const MIN_UDP_PAYLOAD: u16 = 512;

/// UDP server statistics
#[derive(Debug, Default)]
pub struct UdpServerStats {
    /// Datagrams received
    packets_received: AtomicU64,
    /// Responses sent
    packets_sent: AtomicU64,
    /// Datagrams that did not parse as DNS
    invalid_msgs: AtomicU64,
    /// Responses dropped on write errors
    dropped: AtomicU64,
}

impl UdpServerStats {
    /// Datagrams received
    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Responses sent
    #[must_use]
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Datagrams that did not parse as DNS
    #[must_use]
    pub fn invalid_msgs(&self) -> u64 {
        self.invalid_msgs.load(Ordering::Relaxed)
    }

    /// Responses dropped on write errors
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// UDP server configuration
#[derive(Debug, Clone)]
pub struct UdpServerConfig {
    /// Server name
    pub name: String,
    /// Address to bind
    pub addr: SocketAddr,
    /// Read buffer size
    pub udp_size: usize,
    /// Response write timeout
    pub write_timeout: Duration,
}

impl UdpServerConfig {
    /// Create a configuration with the defaults
    #[must_use]
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            udp_size: DEFAULT_MSG_BUFFER_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Shared parts of the UDP server, cloned into its tasks
struct UdpInner {
    name: String,
    local_addr: SocketAddr,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    pipeline: Arc<Pipeline>,
    pool: Arc<BufferPool>,
    write_timeout: Duration,
    state: Arc<ServeState>,
    stats: UdpServerStats,
}

/// Plain DNS-over-UDP listener
pub struct UdpServer {
    inner: Arc<UdpInner>,
}

impl UdpServer {
    /// Bind the socket and construct the server
    ///
    /// # Errors
    ///
    /// Returns a network error when the socket cannot be bound.
    pub async fn bind(conf: UdpServerConfig, pipeline: Arc<Pipeline>) -> DnsResult<Self> {
        let socket = UdpSocket::bind(conf.addr)
            .await
            .map_err(|e| DnsError::network_io(format!("binding udp {}", conf.addr), e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| DnsError::network_io("getting local udp address", e))?;

        info!(server = conf.name, addr = %local_addr, "udp server bound");

        Ok(Self {
            inner: Arc::new(UdpInner {
                name: conf.name,
                local_addr,
                socket: Mutex::new(Some(Arc::new(socket))),
                pipeline,
                pool: Arc::new(BufferPool::new(UDP_POOL_CAPACITY, conf.udp_size)),
                write_timeout: conf.write_timeout,
                state: ServeState::new(),
                stats: UdpServerStats::default(),
            }),
        })
    }

    /// Server statistics
    #[must_use]
    pub fn stats(&self) -> &UdpServerStats {
        &self.inner.stats
    }
}

#[async_trait]
impl DnsServer for UdpServer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn proto(&self) -> Protocol {
        Protocol::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    async fn start(&self) -> DnsResult<()> {
        self.inner.state.begin_start(&self.inner.name)?;

        let socket = self
            .inner
            .socket
            .lock()
            .clone()
            .ok_or_else(|| DnsError::internal("udp socket already taken"))?;

        info!(server = self.inner.name, addr = %self.inner.local_addr, "udp server starting");

        let inner = Arc::clone(&self.inner);
        let loop_guard = inner.state.tasks.guard();
        let handle = tokio::spawn(async move {
            let _guard = loop_guard;
            serve_loop(inner, socket).await;
        });

        monitor_accept_task(self.inner.name.clone(), handle);

        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> DnsResult<()> {
        self.inner.state.begin_shutdown(&self.inner.name)?;

        // Drop the server's own reference so the port is released as
        // soon as the loop and in-flight writers finish.
        self.inner.socket.lock().take();

        let result = self.inner.state.wait_drain(&self.inner.name, timeout).await;
        info!(server = self.inner.name, "udp server stopped");

        result
    }
}

/// The datagram read loop
async fn serve_loop(inner: Arc<UdpInner>, socket: Arc<UdpSocket>) {
    loop {
        if inner.state.is_stopping() {
            break;
        }

        let mut buf = inner.pool.get();
        let received = tokio::select! {
            _ = inner.state.stopped() => continue,
            r = socket.recv_from(&mut buf) => r,
        };

        let (len, src) = match received {
            Ok(pair) => pair,
            Err(e) => {
                debug!(server = inner.name, error = %e, "udp receive failed");
                continue;
            }
        };

        inner.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        trace!(server = inner.name, src = %src, len, "received udp packet");

        let req = match Message::from_vec(&buf[..len]) {
            Ok(req) => req,
            Err(e) => {
                inner.stats.invalid_msgs.fetch_add(1, Ordering::Relaxed);
                debug!(server = inner.name, src = %src, error = %e, "dropping invalid udp message");
                continue;
            }
        };

        // The task owns the parsed message; the buffer goes back to the
        // pool here.
        drop(buf);

        let task_inner = Arc::clone(&inner);
        let task_socket = Arc::clone(&socket);
        let guard = inner.state.tasks.guard();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            serve_query(task_inner, task_socket, req, src).await;
        });

        let watch_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    super::report_handler_panic(
                        &watch_inner.pipeline.errcoll,
                        &watch_inner.name,
                        "serving udp query",
                    );
                }
            }
        });
    }

    debug!(server = inner.name, "udp serve loop finished");
}

/// Handle one parsed query
async fn serve_query(inner: Arc<UdpInner>, socket: Arc<UdpSocket>, req: Message, src: SocketAddr) {
    let server_info = ServerInfo {
        name: inner.name.clone(),
        addr: inner.local_addr,
        proto: Protocol::Udp,
    };

    // The write deadline is taken at write time, not at dispatch.
    let ctx = match inner.pipeline.build_context(
        server_info,
        ClientInfo::default(),
        src,
        &req,
        None,
    ) {
        Ok(ctx) => ctx,
        Err(err) => {
            inner.stats.invalid_msgs.fetch_add(1, Ordering::Relaxed);
            debug!(server = inner.name, src = %src, error = %err, "dropping unusable udp query");
            return;
        }
    };

    let mut rw = UdpResponseWriter {
        socket,
        local_addr: inner.local_addr,
        remote_addr: src,
        write_timeout: inner.write_timeout,
        stats: &inner.stats,
        written: false,
    };

    inner.pipeline.serve(&ctx, &mut rw, &req).await;
}

/// Writer that sends a datagram back to the client
struct UdpResponseWriter<'a> {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    write_timeout: Duration,
    stats: &'a UdpServerStats,
    written: bool,
}

/// The payload size the client advertised, or the protocol minimum
fn client_payload_size(req: &Message) -> usize {
    let advertised = req
        .extensions()
        .as_ref()
        .map_or(MIN_UDP_PAYLOAD, hickory_proto::op::Edns::max_payload);

    usize::from(advertised.max(MIN_UDP_PAYLOAD))
}

#[async_trait]
impl ResponseWriter for UdpResponseWriter<'_> {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn written(&self) -> bool {
        self.written
    }

    async fn write_msg(
        &mut self,
        ctx: &RequestContext,
        req: &Message,
        resp: &Message,
    ) -> DnsResult<()> {
        if self.written {
            return Err(DnsError::AlreadyWritten);
        }

        let mut out = resp.clone();
        msg::normalize(req, &mut out);

        let mut bytes = out
            .to_vec()
            .map_err(|e| DnsError::serialize(format!("packing udp response: {e}")))?;

        // Truncate for clients that cannot take the full response.
        let max_size = client_payload_size(req);
        if bytes.len() > max_size {
            debug!(
                len = bytes.len(),
                max_size,
                "response exceeds client payload size, truncating"
            );

            out.set_truncated(true);
            out.take_answers();
            out.take_name_servers();
            out.take_additionals();
            bytes = out
                .to_vec()
                .map_err(|e| DnsError::serialize(format!("packing truncated response: {e}")))?;
        }

        let dur = ctx.remaining().unwrap_or(self.write_timeout);
        let sent = timeout(dur, self.socket.send_to(&bytes, self.remote_addr))
            .await
            .map_err(|_| DnsError::timeout("udp response write", dur))?;

        match sent {
            Ok(_) => {
                self.written = true;
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(DnsError::network_io("sending udp response", e))
            }
        }
    }
}
