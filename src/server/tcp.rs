//! TCP and DNS-over-TLS server
//!
//! The accept loop spawns a task per connection.  A connection reads
//! length-prefixed messages (2-byte big-endian length) until the idle
//! timeout elapses or shutdown begins, dispatches each query, and writes
//! the length-prefixed reply within the write timeout.  Replies on one
//! connection are serialized in request order because the handler is
//! awaited before the next read.
//!
//! Every accepted connection registers in the connection registry before
//! its read loop starts and removes itself on any exit path; shutdown
//! walks the registry to release reads blocked on idle clients.
//!
//! The TLS variant is the same server with the accepted streams wrapped
//! by an acceptor; the client's SNI is captured for device-ID
//! extraction.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_proto::op::Message;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

use super::{
    monitor_accept_task, DnsServer, Pipeline, ServeState, DEFAULT_READ_TIMEOUT,
    DEFAULT_TCP_IDLE_TIMEOUT, DEFAULT_WRITE_TIMEOUT,
};
use crate::config::{Protocol, DEFAULT_MSG_BUFFER_SIZE};
use crate::context::{ClientInfo, RequestContext, ServerInfo};
use crate::error::{DnsError, DnsResult};
use crate::io::BufferPool;
use crate::msg;
use crate::writer::ResponseWriter;

/// Buffers kept in the TCP read pool
const TCP_POOL_CAPACITY: usize = 128;

/// Maximum DNS message size over TCP
const MAX_TCP_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Registry of live connections
///
/// Between accept and close every connection holds exactly one entry,
/// keyed by an atomically assigned connection id.  Shutdown walks the
/// entries and wakes each connection's read loop, standing in for the
/// immediately-expired read deadline of blocking runtimes.
#[derive(Debug, Default)]
pub struct ConnRegistry {
    conns: DashMap<u64, Arc<Notify>>,
    next_id: AtomicU64,
}

impl ConnRegistry {
    /// Register a connection, returning its id and wake handle
    pub(crate) fn register(&self) -> (u64, Arc<Notify>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());
        self.conns.insert(id, Arc::clone(&notify));
        (id, notify)
    }

    /// Remove a connection
    pub(crate) fn remove(&self, id: u64) {
        self.conns.remove(&id);
    }

    /// Number of live connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Wake every connection blocked in a read
    pub(crate) fn unblock_all(&self) {
        for entry in &self.conns {
            entry.value().notify_waiters();
        }
    }
}

/// Removes the registry entry on any exit path
struct ConnGuard<'a> {
    registry: &'a ConnRegistry,
    id: u64,
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

/// TCP server statistics
#[derive(Debug, Default)]
pub struct TcpServerStats {
    /// Connections accepted
    connections_accepted: AtomicU64,
    /// Queries processed
    queries: AtomicU64,
    /// Messages that did not parse as DNS
    invalid_msgs: AtomicU64,
    /// TLS handshakes that failed
    handshake_failures: AtomicU64,
}

impl TcpServerStats {
    /// Connections accepted
    #[must_use]
    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Queries processed
    #[must_use]
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Messages that did not parse as DNS
    #[must_use]
    pub fn invalid_msgs(&self) -> u64 {
        self.invalid_msgs.load(Ordering::Relaxed)
    }

    /// TLS handshakes that failed
    #[must_use]
    pub fn handshake_failures(&self) -> u64 {
        self.handshake_failures.load(Ordering::Relaxed)
    }
}

/// TCP server configuration
#[derive(Clone)]
pub struct TcpServerConfig {
    /// Server name
    pub name: String,
    /// Address to bind
    pub addr: SocketAddr,
    /// TLS acceptor; present for DNS-over-TLS
    pub tls: Option<TlsAcceptor>,
    /// Read buffer size; larger messages allocate outside the pool
    pub tcp_size: usize,
    /// Timeout for reading a message body after its length prefix
    pub read_timeout: Duration,
    /// Response write timeout
    pub write_timeout: Duration,
    /// Idle timeout between queries on one connection
    pub idle_timeout: Duration,
}

impl TcpServerConfig {
    /// Create a plain TCP configuration with the defaults
    #[must_use]
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            tls: None,
            tcp_size: DEFAULT_MSG_BUFFER_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            idle_timeout: DEFAULT_TCP_IDLE_TIMEOUT,
        }
    }

    /// Wrap accepted connections with the given TLS acceptor
    #[must_use]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }
}

/// Shared parts of the TCP server, cloned into its tasks
struct TcpInner {
    name: String,
    proto: Protocol,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    tls: Option<TlsAcceptor>,
    pipeline: Arc<Pipeline>,
    pool: Arc<BufferPool>,
    read_timeout: Duration,
    write_timeout: Duration,
    idle_timeout: Duration,
    state: Arc<ServeState>,
    registry: ConnRegistry,
    stats: TcpServerStats,
}

/// DNS-over-TCP listener, also serving DNS-over-TLS when an acceptor is
/// configured
pub struct TcpServer {
    inner: Arc<TcpInner>,
}

impl TcpServer {
    /// Bind the listener and construct the server
    ///
    /// # Errors
    ///
    /// Returns a network error when the listener cannot be bound.
    pub async fn bind(conf: TcpServerConfig, pipeline: Arc<Pipeline>) -> DnsResult<Self> {
        let listener = TcpListener::bind(conf.addr)
            .await
            .map_err(|e| DnsError::network_io(format!("binding tcp {}", conf.addr), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DnsError::network_io("getting local tcp address", e))?;

        let proto = if conf.tls.is_some() {
            Protocol::Tls
        } else {
            Protocol::Tcp
        };

        info!(server = conf.name, addr = %local_addr, proto = %proto, "tcp server bound");

        Ok(Self {
            inner: Arc::new(TcpInner {
                name: conf.name,
                proto,
                local_addr,
                listener: Mutex::new(Some(listener)),
                tls: conf.tls,
                pipeline,
                pool: Arc::new(BufferPool::new(TCP_POOL_CAPACITY, conf.tcp_size)),
                read_timeout: conf.read_timeout,
                write_timeout: conf.write_timeout,
                idle_timeout: conf.idle_timeout,
                state: ServeState::new(),
                registry: ConnRegistry::default(),
                stats: TcpServerStats::default(),
            }),
        })
    }

    /// Server statistics
    #[must_use]
    pub fn stats(&self) -> &TcpServerStats {
        &self.inner.stats
    }

    /// The connection registry
    #[must_use]
    pub fn registry(&self) -> &ConnRegistry {
        &self.inner.registry
    }
}

#[async_trait]
impl DnsServer for TcpServer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn proto(&self) -> Protocol {
        self.inner.proto
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    async fn start(&self) -> DnsResult<()> {
        self.inner.state.begin_start(&self.inner.name)?;

        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or_else(|| DnsError::internal("tcp listener already taken"))?;

        info!(server = self.inner.name, addr = %self.inner.local_addr, "tcp server starting");

        let inner = Arc::clone(&self.inner);
        let loop_guard = inner.state.tasks.guard();
        let handle = tokio::spawn(async move {
            let _guard = loop_guard;
            accept_loop(inner, listener).await;
        });

        monitor_accept_task(self.inner.name.clone(), handle);

        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> DnsResult<()> {
        self.inner.state.begin_shutdown(&self.inner.name)?;

        // Release reads blocked inside live connections.
        self.inner.registry.unblock_all();

        let result = self.inner.state.wait_drain(&self.inner.name, timeout).await;
        info!(server = self.inner.name, "tcp server stopped");

        result
    }
}

/// The accept loop; the listener is dropped when it returns
async fn accept_loop(inner: Arc<TcpInner>, listener: TcpListener) {
    loop {
        if inner.state.is_stopping() {
            break;
        }

        let accepted = tokio::select! {
            _ = inner.state.stopped() => continue,
            r = listener.accept() => r,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                // An accept failure after start terminates the listener
                // task; the server transitions to stopped implicitly.
                debug!(server = inner.name, error = %e, "accept failed, stopping listener");
                break;
            }
        };

        inner.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        trace!(server = inner.name, peer = %peer, "accepted connection");

        let conn_inner = Arc::clone(&inner);
        let guard = inner.state.tasks.guard();
        tokio::spawn(async move {
            let _guard = guard;
            serve_connection(conn_inner, stream, peer).await;
        });
    }

    debug!(server = inner.name, "tcp accept loop finished");
}

/// Perform the optional TLS handshake, then run the connection loop
async fn serve_connection(inner: Arc<TcpInner>, stream: TcpStream, peer: SocketAddr) {
    match inner.tls.clone() {
        Some(acceptor) => {
            let handshake = timeout(inner.read_timeout, acceptor.accept(stream)).await;
            let tls_stream = match handshake {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    inner.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(server = inner.name, peer = %peer, error = %e, "tls handshake failed");
                    return;
                }
                Err(_) => {
                    inner.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(server = inner.name, peer = %peer, "tls handshake timed out");
                    return;
                }
            };

            let server_name = tls_stream
                .get_ref()
                .1
                .server_name()
                .map(str::to_lowercase);

            connection_loop(inner, tls_stream, peer, server_name).await;
        }
        None => connection_loop(inner, stream, peer, None).await,
    }
}

/// Read and serve queries on one connection until it goes idle, errors,
/// or shutdown begins
async fn connection_loop<S>(
    inner: Arc<TcpInner>,
    stream: S,
    peer: SocketAddr,
    tls_server_name: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    // Registered before the first read, removed on every exit path.
    let (conn_id, conn_notify) = inner.registry.register();
    let _conn_guard = ConnGuard {
        registry: &inner.registry,
        id: conn_id,
    };

    let (mut rd, wr) = tokio::io::split(stream);
    let wr = Arc::new(tokio::sync::Mutex::new(wr));

    loop {
        if inner.state.is_stopping() {
            break;
        }

        // The idle timeout applies to waiting for the next length
        // prefix; shutdown wakes the wait through the registry.
        let mut len_buf = [0u8; 2];
        let prefix = tokio::select! {
            _ = conn_notify.notified() => break,
            r = timeout(inner.idle_timeout, rd.read_exact(&mut len_buf)) => r,
        };

        match prefix {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                trace!(server = inner.name, peer = %peer, error = %e, "connection closed");
                break;
            }
            Err(_) => {
                trace!(server = inner.name, peer = %peer, "connection idle, closing");
                break;
            }
        }

        let msg_len = usize::from(u16::from_be_bytes(len_buf));

        // Messages beyond the pool's buffer size are read into a fresh
        // allocation that is not returned to the pool.
        let mut pooled;
        let mut oversize;
        let body: &mut [u8] = if msg_len <= inner.pool.buf_size() {
            pooled = inner.pool.get();
            &mut pooled[..msg_len]
        } else {
            oversize = vec![0u8; msg_len];
            &mut oversize[..]
        };

        let read = timeout(inner.read_timeout, rd.read_exact(body)).await;
        match read {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(server = inner.name, peer = %peer, error = %e, "reading message body failed");
                break;
            }
            Err(_) => {
                debug!(server = inner.name, peer = %peer, "reading message body timed out");
                break;
            }
        }

        let req = match Message::from_vec(body) {
            Ok(req) => req,
            Err(e) => {
                // The message is dropped; the connection survives.
                inner.stats.invalid_msgs.fetch_add(1, Ordering::Relaxed);
                debug!(server = inner.name, peer = %peer, error = %e, "dropping invalid tcp message");
                continue;
            }
        };

        inner.stats.queries.fetch_add(1, Ordering::Relaxed);

        // Dispatch in a task for panic isolation, but await it so
        // replies on this connection keep request order.
        let task_inner = Arc::clone(&inner);
        let task_wr = Arc::clone(&wr);
        let task_sni = tls_server_name.clone();
        let handle = tokio::spawn(async move {
            serve_stream_query(task_inner, task_wr, req, peer, task_sni).await;
        });

        if let Err(err) = handle.await {
            if err.is_panic() {
                super::report_handler_panic(
                    &inner.pipeline.errcoll,
                    &inner.name,
                    "serving tcp query",
                );
                // A panicked handler leaves the stream state unknown.
                break;
            }
        }
    }

    trace!(server = inner.name, peer = %peer, "connection finished");
}

/// Handle one parsed query on a stream connection
async fn serve_stream_query<W>(
    inner: Arc<TcpInner>,
    wr: Arc<tokio::sync::Mutex<WriteHalf<W>>>,
    req: Message,
    peer: SocketAddr,
    tls_server_name: Option<String>,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let server_info = ServerInfo {
        name: inner.name.clone(),
        addr: inner.local_addr,
        proto: inner.proto,
    };
    let client_info = ClientInfo {
        tls_server_name,
        url_path: None,
    };

    // The write deadline is taken at write time, not at dispatch.
    let ctx = match inner.pipeline.build_context(server_info, client_info, peer, &req, None) {
        Ok(ctx) => ctx,
        Err(err) => {
            inner.stats.invalid_msgs.fetch_add(1, Ordering::Relaxed);
            debug!(server = inner.name, peer = %peer, error = %err, "dropping unusable tcp query");
            return;
        }
    };

    let mut rw = StreamResponseWriter {
        wr,
        local_addr: inner.local_addr,
        remote_addr: peer,
        write_timeout: inner.write_timeout,
        written: false,
    };

    inner.pipeline.serve(&ctx, &mut rw, &req).await;
}

/// Writer that frames a response onto a stream
struct StreamResponseWriter<W> {
    wr: Arc<tokio::sync::Mutex<WriteHalf<W>>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    write_timeout: Duration,
    written: bool,
}

#[async_trait]
impl<W> ResponseWriter for StreamResponseWriter<W>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
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

        let body = out
            .to_vec()
            .map_err(|e| DnsError::serialize(format!("packing tcp response: {e}")))?;
        if body.len() > MAX_TCP_MESSAGE_SIZE {
            return Err(DnsError::serialize(format!(
                "tcp response too large: {} bytes",
                body.len()
            )));
        }

        let mut framed = Vec::with_capacity(2 + body.len());
        framed.extend_from_slice(&(body.len() as u16).to_be_bytes());
        framed.extend_from_slice(&body);

        let dur = ctx.remaining().unwrap_or(self.write_timeout);
        let write = async {
            let mut wr = self.wr.lock().await;
            wr.write_all(&framed).await?;
            wr.flush().await
        };

        timeout(dur, write)
            .await
            .map_err(|_| DnsError::timeout("tcp response write", dur))?
            .map_err(|e| DnsError::network_io("writing tcp response", e))?;

        self.written = true;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};

    use crate::errcoll::testing::RecordingCollector;
    use crate::geoip::StaticGeoIp;
    use crate::handler::testing::StaticHandler;

    fn pipeline() -> Arc<Pipeline> {
        let req = a_query(0);
        let resp = crate::msg::servfail(&req);
        Arc::new(Pipeline {
            handler: Arc::new(StaticHandler::new(resp)),
            errcoll: Arc::new(RecordingCollector::new()),
            geoip: Arc::new(StaticGeoIp::new()),
            wildcards: Vec::new(),
        })
    }

    fn a_query(id: u16) -> Message {
        let mut req = Message::new();
        req.set_id(id).set_recursion_desired(true);
        req.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        req
    }

    async fn bound_server() -> TcpServer {
        let conf = TcpServerConfig::new("tcp-test", "127.0.0.1:0".parse().unwrap());
        TcpServer::bind(conf, pipeline()).await.unwrap()
    }

    async fn send_query(stream: &mut TcpStream, req: &Message) -> Message {
        let body = req.to_vec().unwrap();
        let mut framed = (body.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        stream.write_all(&framed).await.unwrap();

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let mut resp_buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
        stream.read_exact(&mut resp_buf).await.unwrap();

        Message::from_vec(&resp_buf).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let server = bound_server().await;
        assert_eq!(server.proto(), Protocol::Tcp);

        server.start().await.unwrap();
        assert!(matches!(
            server.start().await.unwrap_err(),
            DnsError::AlreadyStarted { .. }
        ));

        server.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            server.shutdown(Duration::from_secs(1)).await.unwrap_err(),
            DnsError::NotStarted { .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_releases_port() {
        let server = bound_server().await;
        let addr = server.local_addr();

        server.start().await.unwrap();
        server.shutdown(Duration::from_secs(1)).await.unwrap();

        TcpListener::bind(addr).await.expect("port must be released");
    }

    #[tokio::test]
    async fn test_serves_sequential_queries_in_order() {
        let server = bound_server().await;
        let addr = server.local_addr();
        server.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();

        let first = send_query(&mut stream, &a_query(0x0001)).await;
        assert_eq!(first.id(), 0x0001);

        let second = send_query(&mut stream, &a_query(0x0002)).await;
        assert_eq!(second.id(), 0x0002);

        assert_eq!(server.stats().queries(), 2);

        drop(stream);
        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_tracks_connection_lifetime() {
        let server = bound_server().await;
        let addr = server.local_addr();
        server.start().await.unwrap();

        assert!(server.registry().is_empty());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = send_query(&mut stream, &a_query(1)).await;
        assert_eq!(server.registry().len(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.registry().is_empty());

        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_idle_connection() {
        let server = bound_server().await;
        let addr = server.local_addr();
        server.start().await.unwrap();

        // An idle connection sits blocked in the length-prefix read.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = send_query(&mut stream, &a_query(1)).await;

        // Shutdown must not wait for the 30 s idle timeout.
        tokio::time::timeout(
            Duration::from_secs(2),
            server.shutdown(Duration::from_secs(1)),
        )
        .await
        .expect("shutdown must unblock the idle connection")
        .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_message_keeps_connection_alive() {
        let server = bound_server().await;
        let addr = server.local_addr();
        server.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();

        // A framed garbage message.
        let garbage = [0x00, 0x03, 0xde, 0xad, 0xbf];
        stream.write_all(&garbage).await.unwrap();

        // The connection survives and serves the next query.
        let resp = send_query(&mut stream, &a_query(0x0042)).await;
        assert_eq!(resp.id(), 0x0042);
        assert_eq!(server.stats().invalid_msgs(), 1);

        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
