//! DNS-over-HTTPS server
//!
//! Serves HTTP/1.1 and HTTP/2 over the TLS-wrapped listener (ALPN
//! prefers `h2`); without TLS material it runs plain HTTP, which the
//! tests use.  Two routes resolve DNS:
//!
//! - `/dns-query`: wireformat, GET with a base64url-unpadded `dns`
//!   parameter or POST with the message as the body;
//! - `/resolve`: the JSON API, with the `ct` parameter forcing
//!   wireformat output within the same route.
//!
//! Routing matches the path-cleaned first segment by suffix, the
//! historical behavior this service is compatible with, so a device-ID
//! segment (`/dns-query/<id>`) routes the same and the ID is picked up
//! during context building.
//!
//! Any other path goes to the optional non-DNS handler, else 404.  The
//! response carries the content type, a `Cache-Control: max-age` derived
//! from the minimal answer TTL, and an explicit `Content-Length`.
//!
//! The remote address comes from the accepted socket and is a valid
//! `ip:port` by construction.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

use super::tcp::ConnRegistry;
use super::{monitor_accept_task, DnsServer, Pipeline, ServeState};
use crate::config::Protocol;
use crate::context::{ClientInfo, ServerInfo};
use crate::device::clean_path;
use crate::error::{DnsError, DnsResult};
use crate::msg;
use crate::server::json;
use hickory_proto::op::Message;

/// Path accepting DoH wireformat requests
pub const PATH_DOH: &str = "/dns-query";

/// Path accepting DoH JSON requests
pub const PATH_JSON: &str = "/resolve";

/// Content type of DoH wireformat requests and responses
pub const MIME_DOH: &str = "application/dns-message";

/// Content type of DoH JSON responses
///
/// Historical and non-standard; compatibility requires it.
pub const MIME_JSON: &str = "application/x-javascript";

/// HTTP read and header timeout
pub const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP write timeout, also the per-request handler deadline
pub const HTTP_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP idle connection timeout
pub const HTTP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Handler for requests outside the DNS routes
#[async_trait]
pub trait NonDnsHandler: Send + Sync {
    /// Produce the response for a non-DNS request
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>>;
}

/// HTTPS server statistics
#[derive(Debug, Default)]
pub struct HttpsServerStats {
    /// Requests that resolved DNS
    queries: AtomicU64,
    /// Requests that were not valid DNS requests
    invalid_msgs: AtomicU64,
}

impl HttpsServerStats {
    /// Requests that resolved DNS
    #[must_use]
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Requests that were not valid DNS requests
    #[must_use]
    pub fn invalid_msgs(&self) -> u64 {
        self.invalid_msgs.load(Ordering::Relaxed)
    }
}

/// HTTPS server configuration
#[derive(Clone)]
pub struct HttpsServerConfig {
    /// Server name
    pub name: String,
    /// Address to bind
    pub addr: SocketAddr,
    /// TLS acceptor; plain HTTP without one
    pub tls: Option<TlsAcceptor>,
}

impl HttpsServerConfig {
    /// Create a configuration
    #[must_use]
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            tls: None,
        }
    }

    /// Serve over the given TLS acceptor
    #[must_use]
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }
}

/// Shared parts of the HTTPS server
struct HttpsInner {
    name: String,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    tls: Option<TlsAcceptor>,
    pipeline: Arc<Pipeline>,
    non_dns: Option<Arc<dyn NonDnsHandler>>,
    state: Arc<ServeState>,
    registry: ConnRegistry,
    stats: HttpsServerStats,
}

/// DNS-over-HTTPS listener
pub struct HttpsServer {
    inner: Arc<HttpsInner>,
}

impl HttpsServer {
    /// Bind the listener and construct the server
    ///
    /// # Errors
    ///
    /// Returns a network error when the listener cannot be bound.
    pub async fn bind(
        conf: HttpsServerConfig,
        pipeline: Arc<Pipeline>,
        non_dns: Option<Arc<dyn NonDnsHandler>>,
    ) -> DnsResult<Self> {
        let listener = TcpListener::bind(conf.addr)
            .await
            .map_err(|e| DnsError::network_io(format!("binding https {}", conf.addr), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DnsError::network_io("getting local https address", e))?;

        info!(server = conf.name, addr = %local_addr, "https server bound");

        Ok(Self {
            inner: Arc::new(HttpsInner {
                name: conf.name,
                local_addr,
                listener: Mutex::new(Some(listener)),
                tls: conf.tls,
                pipeline,
                non_dns,
                state: ServeState::new(),
                registry: ConnRegistry::default(),
                stats: HttpsServerStats::default(),
            }),
        })
    }

    /// Server statistics
    #[must_use]
    pub fn stats(&self) -> &HttpsServerStats {
        &self.inner.stats
    }
}

#[async_trait]
impl DnsServer for HttpsServer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn proto(&self) -> Protocol {
        Protocol::Https
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
            .ok_or_else(|| DnsError::internal("https listener already taken"))?;

        info!(server = self.inner.name, addr = %self.inner.local_addr, "https server starting");

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
        self.inner.registry.unblock_all();

        let result = self.inner.state.wait_drain(&self.inner.name, timeout).await;
        info!(server = self.inner.name, "https server stopped");

        result
    }
}

/// The accept loop; the listener is dropped when it returns
async fn accept_loop(inner: Arc<HttpsInner>, listener: TcpListener) {
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
                debug!(server = inner.name, error = %e, "accept failed, stopping listener");
                break;
            }
        };

        trace!(server = inner.name, peer = %peer, "accepted https connection");

        let conn_inner = Arc::clone(&inner);
        let guard = inner.state.tasks.guard();
        tokio::spawn(async move {
            let _guard = guard;
            serve_connection(conn_inner, stream, peer).await;
        });
    }

    debug!(server = inner.name, "https accept loop finished");
}

/// Perform the optional TLS handshake, then serve HTTP on the stream
async fn serve_connection(inner: Arc<HttpsInner>, stream: TcpStream, peer: SocketAddr) {
    match inner.tls.clone() {
        Some(acceptor) => {
            let handshake = timeout(HTTP_READ_TIMEOUT, acceptor.accept(stream)).await;
            let tls_stream = match handshake {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    debug!(server = inner.name, peer = %peer, error = %e, "tls handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(server = inner.name, peer = %peer, "tls handshake timed out");
                    return;
                }
            };

            let server_name = tls_stream
                .get_ref()
                .1
                .server_name()
                .map(str::to_lowercase);

            serve_http(inner, tls_stream, peer, server_name).await;
        }
        None => serve_http(inner, stream, peer, None).await,
    }
}

/// Serve HTTP/1.1 or HTTP/2 on one connection
async fn serve_http<S>(
    inner: Arc<HttpsInner>,
    stream: S,
    peer: SocketAddr,
    tls_server_name: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (conn_id, conn_notify) = inner.registry.register();

    let svc_inner = Arc::clone(&inner);
    let service = service_fn(move |req: Request<Incoming>| {
        let inner = Arc::clone(&svc_inner);
        let sni = tls_server_name.clone();
        async move { Ok::<_, Infallible>(handle_request(inner, req, peer, sni).await) }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HTTP_READ_TIMEOUT);

    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                debug!(server = inner.name, peer = %peer, error = %e, "http connection error");
            }
        }
        _ = conn_notify.notified() => {
            trace!(server = inner.name, peer = %peer, "http connection released for shutdown");
        }
        () = tokio::time::sleep(HTTP_IDLE_TIMEOUT) => {
            trace!(server = inner.name, peer = %peer, "http connection lifetime exceeded");
        }
    }

    inner.registry.remove(conn_id);
}

/// How a DNS request entered the HTTP layer
enum DohRoute {
    /// `/dns-query` wireformat
    Wire,
    /// `/resolve` JSON parameters
    Json,
}

/// Classify a request path, returning the route and response content
/// type
///
/// The first path segment is matched by suffix against the DNS paths,
/// preserving the historical behavior where shortened roots such as
/// `query` are accepted too.
fn classify(path: &str, query: Option<&str>) -> Option<(DohRoute, &'static str)> {
    let cleaned = clean_path(path);
    let first = cleaned
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("");

    if first.is_empty() {
        return None;
    }

    if PATH_DOH.ends_with(first) {
        return Some((DohRoute::Wire, MIME_DOH));
    }

    if PATH_JSON.ends_with(first) {
        let force_wire = query_values(query, "ct").next().map(|v| v == MIME_DOH);
        let ct = if force_wire == Some(true) { MIME_DOH } else { MIME_JSON };
        return Some((DohRoute::Json, ct));
    }

    None
}

/// Iterate the values of one query parameter
fn query_values<'a>(query: Option<&'a str>, name: &'a str) -> impl Iterator<Item = String> + 'a {
    url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .filter(move |(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// A plain-status response
fn status_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp
}

/// Extract the DNS request message from the HTTP request
async fn dns_msg_from_request(
    route: &DohRoute,
    req: Request<Incoming>,
) -> DnsResult<Message> {
    match route {
        DohRoute::Json => json::msg_from_params(req.uri().query()),
        DohRoute::Wire if *req.method() == Method::GET => {
            let mut values = query_values(req.uri().query(), "dns");
            let b64 = values
                .next()
                .ok_or_else(|| DnsError::parse("no 'dns' query parameter"))?;
            if values.next().is_some() {
                return Err(DnsError::parse("multiple 'dns' query parameters"));
            }

            let bytes = URL_SAFE_NO_PAD
                .decode(b64.as_bytes())
                .map_err(|e| DnsError::parse(format!("bad 'dns' parameter: {e}")))?;

            Message::from_vec(&bytes).map_err(|e| DnsError::parse(format!("bad dns message: {e}")))
        }
        DohRoute::Wire if *req.method() == Method::POST => {
            let body = req
                .into_body()
                .collect()
                .await
                .map_err(|e| DnsError::parse(format!("reading request body: {e}")))?
                .to_bytes();

            Message::from_vec(&body).map_err(|e| DnsError::parse(format!("bad dns message: {e}")))
        }
        DohRoute::Wire => Err(DnsError::parse(format!(
            "method not allowed: {}",
            req.method()
        ))),
    }
}

/// Handle one HTTP request
async fn handle_request(
    inner: Arc<HttpsInner>,
    req: Request<Incoming>,
    peer: SocketAddr,
    tls_server_name: Option<String>,
) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    trace!(server = inner.name, peer = %peer, path, "received https request");

    let Some((route, ct)) = classify(&path, req.uri().query()) else {
        if let Some(non_dns) = &inner.non_dns {
            return non_dns.handle(req).await;
        }

        inner.stats.invalid_msgs.fetch_add(1, Ordering::Relaxed);
        return status_response(StatusCode::NOT_FOUND, "");
    };

    let dns_req = match dns_msg_from_request(&route, req).await {
        Ok(msg) => msg,
        Err(err) => {
            inner.stats.invalid_msgs.fetch_add(1, Ordering::Relaxed);
            debug!(server = inner.name, peer = %peer, error = %err, "bad doh request");
            return status_response(StatusCode::BAD_REQUEST, "bad request");
        }
    };

    let server_info = ServerInfo {
        name: inner.name.clone(),
        addr: inner.local_addr,
        proto: Protocol::Https,
    };
    let client_info = ClientInfo {
        tls_server_name,
        url_path: Some(path),
    };
    let deadline = Instant::now() + HTTP_WRITE_TIMEOUT;

    let ctx = match inner.pipeline.build_context(
        server_info,
        client_info,
        peer,
        &dns_req,
        Some(deadline),
    ) {
        Ok(ctx) => ctx,
        Err(err) => {
            inner.stats.invalid_msgs.fetch_add(1, Ordering::Relaxed);
            debug!(server = inner.name, peer = %peer, error = %err, "unusable doh query");
            return status_response(StatusCode::BAD_REQUEST, "bad request");
        }
    };

    inner.stats.queries.fetch_add(1, Ordering::Relaxed);

    // The handler runs in its own task so a panic turns into a 500
    // instead of tearing the connection down.
    let local_addr = inner.local_addr;
    let task_pipeline = Arc::clone(&inner.pipeline);
    let task_req = dns_req.clone();
    let handle = tokio::spawn(async move {
        let mut nrw = crate::writer::NonWriter::new(local_addr, peer);
        task_pipeline.serve(&ctx, &mut nrw, &task_req).await;
        nrw
    });

    let mut nrw = match handle.await {
        Ok(nrw) => nrw,
        Err(err) => {
            if err.is_panic() {
                super::report_handler_panic(
                    &inner.pipeline.errcoll,
                    &inner.name,
                    "serving doh query",
                );
            }
            return status_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let Some(mut resp) = nrw.take_msg() else {
        debug!(server = inner.name, "no response written by the handler");
        return status_response(StatusCode::INTERNAL_SERVER_ERROR, "no response");
    };

    msg::normalize(&dns_req, &mut resp);

    write_dns_response(&resp, ct)
}

/// Serialize the DNS response into the HTTP response
fn write_dns_response(resp: &Message, ct: &'static str) -> Response<Full<Bytes>> {
    let body = if ct == MIME_DOH {
        resp.to_vec()
            .map_err(|e| DnsError::serialize(format!("packing doh response: {e}")))
    } else {
        json::msg_to_json(resp)
    };

    let body = match body {
        Ok(body) => body,
        Err(err) => {
            debug!(error = %err, "serializing doh response failed");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    // DoH servers should assign an explicit freshness lifetime
    // (RFC 8484 §5.1); the minimal answer TTL is the safe one.
    let max_age = msg::minimal_ttl(resp).as_secs_f64();
    let content_length = body.len();

    let mut http_resp = Response::new(Full::new(Bytes::from(body)));
    let headers = http_resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(ct));
    if let Ok(value) = HeaderValue::from_str(&format!("max-age={max_age:.6}")) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));

    http_resp
}
