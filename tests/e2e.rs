//! End-to-end tests
//!
//! Each test builds a full service from configuration, binds listeners
//! on `127.0.0.1:0`, and resolves against in-process mock upstreams.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dnsgate::config::{
    CacheConfig, Config, Protocol, ServerConfig, ServerGroupConfig, UpstreamConfig,
};
use dnsgate::errcoll::LogCollector;
use dnsgate::geoip::StaticGeoIp;
use dnsgate::service::DnsService;

/// Spawn a mock upstream answering every query with a fixed A record
async fn mock_upstream(answer: Ipv4Addr, ttl: u32) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let task_hits = Arc::clone(&hits);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            task_hits.fetch_add(1, Ordering::SeqCst);
            let Ok(req) = Message::from_vec(&buf[..len]) else {
                continue;
            };

            let mut resp = Message::new();
            resp.set_id(req.id())
                .set_message_type(MessageType::Response)
                .set_recursion_available(true)
                .set_response_code(ResponseCode::NoError);
            if let Some(q) = req.queries().first() {
                resp.add_query(q.clone());
                resp.add_answer(Record::from_rdata(q.name().clone(), ttl, RData::A(A(answer))));
            }
            let _ = socket.send_to(&resp.to_vec().unwrap(), src).await;
        }
    });

    (addr, hits)
}

/// An upstream address that never answers
async fn dead_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap()
}

fn config_for(upstream: SocketAddr, fallback: SocketAddr) -> Config {
    Config {
        server_groups: vec![ServerGroupConfig {
            name: "e2e".into(),
            upstream: UpstreamConfig::new(upstream)
                .with_fallback(fallback)
                .with_timeout(Duration::from_millis(300)),
            servers: vec![
                ServerConfig::new("udp-e2e", Protocol::Udp, vec!["127.0.0.1:0".parse().unwrap()]),
                ServerConfig::new("tcp-e2e", Protocol::Tcp, vec!["127.0.0.1:0".parse().unwrap()]),
            ],
            device_id_wildcards: vec![],
        }],
        cache: CacheConfig::default(),
    }
}

async fn start_service(config: &Config) -> DnsService {
    let service = DnsService::build(
        config,
        Arc::new(StaticGeoIp::new()),
        Arc::new(LogCollector::new()),
        None,
    )
    .await
    .unwrap();
    service.start().await.unwrap();
    service
}

fn addr_of(service: &DnsService, proto: Protocol) -> SocketAddr {
    service
        .server_addrs()
        .into_iter()
        .find(|(_, p, _)| *p == proto)
        .map(|(_, _, a)| a)
        .expect("listener for protocol")
}

fn a_query(host: &str, id: u16) -> Message {
    let mut req = Message::new();
    req.set_id(id).set_recursion_desired(true);
    req.add_query(Query::query(Name::from_str(host).unwrap(), RecordType::A));
    req
}

async fn udp_resolve(server: SocketAddr, req: &Message) -> Message {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&req.to_vec().unwrap(), server).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("response in time")
        .unwrap();

    Message::from_vec(&buf[..len]).unwrap()
}

async fn tcp_resolve(server: SocketAddr, req: &Message) -> Message {
    let mut stream = TcpStream::connect(server).await.unwrap();

    let body = req.to_vec().unwrap();
    let mut framed = (body.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(&body);
    stream.write_all(&framed).await.unwrap();

    let mut len_buf = [0u8; 2];
    timeout(Duration::from_secs(2), stream.read_exact(&mut len_buf))
        .await
        .expect("length prefix in time")
        .unwrap();
    let mut resp_buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
    stream.read_exact(&mut resp_buf).await.unwrap();

    Message::from_vec(&resp_buf).unwrap()
}

#[tokio::test]
async fn udp_resolve_cache_miss_then_hit() {
    let (upstream, hits) = mock_upstream(Ipv4Addr::new(93, 184, 216, 34), 60).await;
    let (fallback, fallback_hits) = mock_upstream(Ipv4Addr::new(9, 9, 9, 9), 60).await;
    let service = start_service(&config_for(upstream, fallback)).await;
    let addr = addr_of(&service, Protocol::Udp);

    let first = udp_resolve(addr, &a_query("example.com.", 0x0001)).await;
    assert_eq!(first.response_code(), ResponseCode::NoError);
    assert_eq!(first.answers().len(), 1);
    let RData::A(A(answer)) = first.answers()[0].data().unwrap() else {
        panic!("expected an A record");
    };
    assert_eq!(*answer, Ipv4Addr::new(93, 184, 216, 34));

    // The identical query is served from the cache.
    let second = udp_resolve(addr, &a_query("example.com.", 0x0002)).await;
    assert_eq!(second.id(), 0x0002);
    assert_eq!(second.answers().len(), 1);

    assert_eq!(hits.load(Ordering::SeqCst), 1, "upstream must be hit once");
    assert_eq!(fallback_hits.load(Ordering::SeqCst), 0);

    service.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn tcp_and_udp_share_one_cache() {
    let (upstream, hits) = mock_upstream(Ipv4Addr::new(198, 51, 100, 7), 60).await;
    let (fallback, _) = mock_upstream(Ipv4Addr::new(9, 9, 9, 9), 60).await;
    let service = start_service(&config_for(upstream, fallback)).await;

    let udp_addr = addr_of(&service, Protocol::Udp);
    let tcp_addr = addr_of(&service, Protocol::Tcp);

    let first = udp_resolve(udp_addr, &a_query("shared.example.", 0x0010)).await;
    assert_eq!(first.answers().len(), 1);

    let second = tcp_resolve(tcp_addr, &a_query("shared.example.", 0x0011)).await;
    assert_eq!(second.id(), 0x0011);
    assert_eq!(second.answers().len(), 1);

    assert_eq!(hits.load(Ordering::SeqCst), 1, "both transports share the cache");

    service.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn primary_failure_uses_fallback_without_servfail() {
    let primary = dead_upstream().await;
    let (fallback, fallback_hits) = mock_upstream(Ipv4Addr::new(203, 0, 113, 5), 60).await;
    let service = start_service(&config_for(primary, fallback)).await;
    let addr = addr_of(&service, Protocol::Udp);

    let resp = udp_resolve(addr, &a_query("failover.example.", 0x0042)).await;

    assert_eq!(resp.response_code(), ResponseCode::NoError, "no servfail");
    assert_eq!(resp.answers().len(), 1);
    assert!(fallback_hits.load(Ordering::SeqCst) >= 1);

    service.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn total_upstream_failure_yields_servfail() {
    let primary = dead_upstream().await;
    let fallback = dead_upstream().await;
    let service = start_service(&config_for(primary, fallback)).await;
    let addr = addr_of(&service, Protocol::Udp);

    let resp = udp_resolve(addr, &a_query("down.example.", 0x0099)).await;

    assert_eq!(resp.id(), 0x0099);
    assert_eq!(resp.response_code(), ResponseCode::ServFail);

    service.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn shutdown_releases_every_port() {
    let (upstream, _) = mock_upstream(Ipv4Addr::new(1, 2, 3, 4), 60).await;
    let (fallback, _) = mock_upstream(Ipv4Addr::new(5, 6, 7, 8), 60).await;
    let service = start_service(&config_for(upstream, fallback)).await;

    let udp_addr = addr_of(&service, Protocol::Udp);
    let tcp_addr = addr_of(&service, Protocol::Tcp);

    service.shutdown(Duration::from_secs(2)).await.unwrap();

    UdpSocket::bind(udp_addr).await.expect("udp port released");
    tokio::net::TcpListener::bind(tcp_addr)
        .await
        .expect("tcp port released");
}

#[tokio::test]
async fn healthcheck_backoff_keeps_primary_bypassed() {
    // Probes run every 100 ms with a 500 ms backoff.  The primary fails
    // probes at first, so the forward path must bypass it; once it comes
    // back, traffic stays on the fallbacks until the backoff elapses.
    let (fallback, _) = mock_upstream(Ipv4Addr::new(9, 9, 9, 9), 60).await;

    // The primary starts dead.
    let primary_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let primary = primary_socket.local_addr().unwrap();
    drop(primary_socket);

    let mut config = config_for(primary, fallback);
    config.server_groups[0].upstream.healthcheck = Some(dnsgate::config::HealthcheckConfig {
        enabled: true,
        domain_template: "${RANDOM}-probe.example.com".into(),
        interval_ms: 100,
        timeout_ms: 100,
        backoff_duration_ms: 500,
    });

    let service = start_service(&config).await;
    let health = Arc::clone(
        service.groups()[0]
            .forwarder()
            .health()
            .expect("healthcheck configured"),
    );

    // Wait for the first failed probe to mark the primary down.
    timeout(Duration::from_secs(2), async {
        while health.is_healthy() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("primary must be marked down");

    // Bring the primary back on its original port; probes now succeed,
    // but the backoff keeps the state down until 500 ms after the last
    // failure.
    let primary_socket = UdpSocket::bind(primary).await.unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((len, src)) = primary_socket.recv_from(&mut buf).await {
            let Ok(req) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            let mut resp = Message::new();
            resp.set_id(req.id())
                .set_message_type(MessageType::Response)
                .set_response_code(ResponseCode::NoError);
            if let Some(q) = req.queries().first() {
                resp.add_query(q.clone());
            }
            let _ = primary_socket.send_to(&resp.to_vec().unwrap(), src).await;
        }
    });

    // Shortly after revival the state must still be down.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!health.is_healthy(), "backoff must keep the primary bypassed");

    // Eventually a probe lands past the backoff window and recovers it.
    timeout(Duration::from_secs(3), async {
        while !health.is_healthy() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("primary must recover after the backoff");

    service.shutdown(Duration::from_secs(2)).await.unwrap();
}
