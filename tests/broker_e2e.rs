//! End-to-end tests against a scripted mock broker.
//!
//! The mock listens on loopback, decodes real request frames with
//! kafka-protocol, and replies per api key with configurable quirks:
//! ApiVersions v0 downgrades, SASL lifetimes, throttle values, wrong
//! correlation ids, HTTP garbage, or silence. Each test drives the
//! client through one scenario and asserts on responses plus hook
//! counters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::api_versions_response::ApiVersion;
use kafka_protocol::messages::{
    ApiKey, ApiVersionsResponse, FetchRequest, MetadataRequest, MetadataResponse, ProduceRequest,
    ProduceResponse, RequestHeader, ResponseHeader, SaslAuthenticateResponse,
    SaslHandshakeResponse,
};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use kaflink::hooks::E2e;
use kaflink::sasl::{Mechanism, Plain};
use kaflink::{
    Acks, BrokerMetadata, Client, ClientConfig, Hook, KaflinkError, ReadSizeError, RequestContext,
    VersionPins,
};

/// Initialize test logging
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("kaflink=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

// ── Mock broker ─────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct MockCfg {
    /// Reply to ApiVersions v1+ with the raw v0 UNSUPPORTED_VERSION body.
    api_versions_downgrade: bool,
    /// (api_key, min, max) triples advertised in ApiVersions responses.
    advertise: Vec<(i16, i16, i16)>,
    /// Session lifetime returned in SaslAuthenticate responses.
    sasl_lifetime_ms: i64,
    /// First connection gets an HTTP response instead of Kafka frames.
    http_first_connection: bool,
    /// Never reply to produce requests.
    silent_produce: bool,
    /// Throttle value stamped on the first produce response only.
    produce_throttle_ms_once: Option<i32>,
    /// Corrupt the correlation id of the first produce response.
    wrong_corr_id_once: bool,
}

fn default_advertise() -> Vec<(i16, i16, i16)> {
    vec![
        (0, 0, 9),   // Produce
        (1, 0, 12),  // Fetch
        (3, 0, 12),  // Metadata
        (17, 0, 1),  // SaslHandshake
        (18, 0, 3),  // ApiVersions
        (19, 0, 7),  // CreateTopics
        (36, 0, 2),  // SaslAuthenticate
    ]
}

#[derive(Default)]
struct MockState {
    cfg: MockCfg,
    connections: AtomicUsize,
    auths: AtomicUsize,
    api_versions_seen: Mutex<Vec<i16>>,
    produce_corr_ids: Mutex<Vec<i32>>,
    throttle_used: AtomicUsize,
    wrong_corr_used: AtomicUsize,
}

struct MockBroker {
    addr: String,
    state: Arc<MockState>,
}

async fn spawn_mock(cfg: MockCfg) -> MockBroker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let state = Arc::new(MockState { cfg, ..Default::default() });

    let accept_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let index = accept_state.connections.fetch_add(1, Ordering::SeqCst);
            let conn_state = Arc::clone(&accept_state);
            tokio::spawn(async move {
                let _ = handle_conn(stream, conn_state, index).await;
            });
        }
    });

    MockBroker { addr, state }
}

async fn handle_conn(stream: TcpStream, state: Arc<MockState>, index: usize) -> std::io::Result<()> {
    if state.cfg.http_first_connection && index == 0 {
        let (_, mut writer) = stream.into_split();
        writer
            .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\n\r\n")
            .await?;
        return Ok(());
    }

    let (mut reader, mut writer) = stream.into_split();
    loop {
        let mut size_buf = [0u8; 4];
        if reader.read_exact(&mut size_buf).await.is_err() {
            return Ok(()); // client hung up
        }
        let size = i32::from_be_bytes(size_buf) as usize;
        let mut payload = vec![0u8; size];
        reader.read_exact(&mut payload).await?;

        let mut buf = Bytes::from(payload);
        let key = i16::from_be_bytes([buf[0], buf[1]]);
        let version = i16::from_be_bytes([buf[2], buf[3]]);
        let api_key = ApiKey::try_from(key).unwrap();
        let header = RequestHeader::decode(&mut buf, api_key.request_header_version(version)).unwrap();
        let corr_id = header.correlation_id;

        match api_key {
            ApiKey::ApiVersionsKey => {
                state.api_versions_seen.lock().push(version);
                if state.cfg.api_versions_downgrade && version > 0 {
                    write_raw_frame(&mut writer, corr_id, &[0, 0x23, 0, 0, 0, 0]).await?;
                    continue;
                }
                let advertise = if state.cfg.advertise.is_empty() {
                    default_advertise()
                } else {
                    state.cfg.advertise.clone()
                };
                let resp = ApiVersionsResponse::default().with_api_keys(
                    advertise
                        .into_iter()
                        .map(|(k, min, max)| {
                            ApiVersion::default()
                                .with_api_key(k)
                                .with_min_version(min)
                                .with_max_version(max)
                        })
                        .collect(),
                );
                respond(&mut writer, api_key, version, corr_id, &resp).await?;
            }
            ApiKey::SaslHandshakeKey => {
                let resp = SaslHandshakeResponse::default()
                    .with_error_code(0)
                    .with_mechanisms(vec![StrBytes::from_static_str("PLAIN")]);
                respond(&mut writer, api_key, version, corr_id, &resp).await?;
            }
            ApiKey::SaslAuthenticateKey => {
                state.auths.fetch_add(1, Ordering::SeqCst);
                let resp = SaslAuthenticateResponse::default()
                    .with_session_lifetime_ms(state.cfg.sasl_lifetime_ms);
                respond(&mut writer, api_key, version, corr_id, &resp).await?;
            }
            ApiKey::ProduceKey => {
                state.produce_corr_ids.lock().push(corr_id);
                if state.cfg.silent_produce {
                    continue;
                }
                let mut resp = ProduceResponse::default();
                if let Some(throttle) = state.cfg.produce_throttle_ms_once {
                    if state.throttle_used.fetch_add(1, Ordering::SeqCst) == 0 {
                        resp = resp.with_throttle_time_ms(throttle);
                    }
                }
                let reply_corr = if state.cfg.wrong_corr_id_once
                    && state.wrong_corr_used.fetch_add(1, Ordering::SeqCst) == 0
                {
                    corr_id + 100
                } else {
                    corr_id
                };
                respond(&mut writer, api_key, version, reply_corr, &resp).await?;
            }
            ApiKey::MetadataKey => {
                respond(&mut writer, api_key, version, corr_id, &MetadataResponse::default())
                    .await?;
            }
            other => panic!("mock broker got unexpected api key {other:?}"),
        }
    }
}

async fn respond<T: Encodable>(
    writer: &mut OwnedWriteHalf,
    api_key: ApiKey,
    version: i16,
    corr_id: i32,
    body: &T,
) -> std::io::Result<()> {
    let header_version = api_key.response_header_version(version);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[0, 0, 0, 0]);
    ResponseHeader::default()
        .with_correlation_id(corr_id)
        .encode(&mut buf, header_version)
        .unwrap();
    body.encode(&mut buf, version).unwrap();
    let len = (buf.len() - 4) as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    writer.write_all(&buf).await
}

async fn write_raw_frame(
    writer: &mut OwnedWriteHalf,
    corr_id: i32,
    body: &[u8],
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    buf.extend_from_slice(&corr_id.to_be_bytes());
    buf.extend_from_slice(body);
    writer.write_all(&buf).await
}

// ── Hook counters ───────────────────────────────────────────────────────

#[derive(Default)]
struct CountingHook {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    produce_e2es: AtomicUsize,
    throttles: AtomicUsize,
    produce_bytes_written: AtomicUsize,
}

impl Hook for CountingHook {
    fn on_broker_connect(
        &self,
        _meta: &BrokerMetadata,
        _dial: Duration,
        err: Option<&KaflinkError>,
    ) {
        if err.is_none() {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_broker_disconnect(&self, _meta: &BrokerMetadata) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_broker_e2e(&self, _meta: &BrokerMetadata, key: i16, e2e: &E2e, err: Option<&KaflinkError>) {
        if key == 0 && err.is_none() {
            self.produce_e2es.fetch_add(1, Ordering::SeqCst);
            self.produce_bytes_written
                .fetch_add(e2e.bytes_written, Ordering::SeqCst);
        }
    }

    fn on_broker_throttle(&self, _meta: &BrokerMetadata, _interval: Duration, after: bool) {
        if after {
            self.throttles.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn client_for(mock: &MockBroker, hook: Arc<CountingHook>) -> Client {
    Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_timeouts(Duration::from_millis(500), Duration::from_millis(500))
            .with_hook(hook),
    )
    .unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_produce_acks_leader() {
    init_logging();

    let mock = spawn_mock(MockCfg::default()).await;
    let hook = Arc::new(CountingHook::default());
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_acks(Acks::Leader)
            .with_hook(hook.clone()),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);

    // Load versions over the normal connection so the produce connection
    // skips negotiation and the produce frame itself gets correlation 0.
    seed.request(MetadataRequest::default()).await.unwrap();

    seed.request(ProduceRequest::default()).await.unwrap();

    assert_eq!(*mock.state.produce_corr_ids.lock(), vec![0]);
    assert_eq!(hook.produce_e2es.load(Ordering::SeqCst), 1);
    assert!(hook.produce_bytes_written.load(Ordering::SeqCst) > 0);
    // Normal connection + produce connection.
    assert_eq!(hook.connects.load(Ordering::SeqCst), 2);
    client.close();
}

#[tokio::test]
async fn acks_zero_produce_is_fire_and_forget() {
    init_logging();

    let mock = spawn_mock(MockCfg {
        silent_produce: true,
        ..Default::default()
    })
    .await;
    let hook = Arc::new(CountingHook::default());
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_acks(Acks::None)
            .with_timeouts(Duration::from_millis(100), Duration::from_millis(200))
            .with_hook(hook.clone()),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);

    let start = Instant::now();
    seed.request(ProduceRequest::default()).await.unwrap();
    // The promise fires on write completion, long before any timeout.
    assert!(start.elapsed() < Duration::from_millis(150));
    assert_eq!(mock.state.produce_corr_ids.lock().len(), 1);

    // Outlive the discard worker's first-read deadline
    // (3 * overhead + produce timeout = 500ms): a silent broker must exit
    // the worker cleanly without killing the connection.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(hook.disconnects.load(Ordering::SeqCst), 0);

    seed.request(ProduceRequest::default()).await.unwrap();
    assert_eq!(hook.connects.load(Ordering::SeqCst), 1, "no redial after discard exit");
    client.close();
}

#[tokio::test]
async fn api_versions_downgrades_to_v0() {
    init_logging();

    let mock = spawn_mock(MockCfg {
        api_versions_downgrade: true,
        ..Default::default()
    })
    .await;
    let hook = Arc::new(CountingHook::default());
    let client = client_for(&mock, hook);
    let seed = Arc::clone(&client.seed_brokers()[0]);

    seed.request(MetadataRequest::default()).await.unwrap();
    assert_eq!(*mock.state.api_versions_seen.lock(), vec![3, 0]);

    // A second request reuses the negotiated table: no third ApiVersions.
    seed.request(MetadataRequest::default()).await.unwrap();
    assert_eq!(mock.state.api_versions_seen.lock().len(), 2);
    client.close();
}

#[tokio::test]
async fn api_versions_pin_skips_negotiation_above_v0() {
    init_logging();

    let mock = spawn_mock(MockCfg {
        api_versions_downgrade: true,
        ..Default::default()
    })
    .await;
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_max_versions(VersionPins::new().pin(18, 0).pin(3, 12)),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);

    // With ApiVersions pinned to v0 the first request already goes out at
    // v0 and no downgrade round trip happens.
    seed.request(MetadataRequest::default()).await.unwrap();
    assert_eq!(*mock.state.api_versions_seen.lock(), vec![0]);
    client.close();
}

#[tokio::test]
async fn http_port_mistake_gets_a_hint_and_a_fresh_dial() {
    init_logging();

    let mock = spawn_mock(MockCfg {
        http_first_connection: true,
        ..Default::default()
    })
    .await;
    let hook = Arc::new(CountingHook::default());
    let client = client_for(&mock, hook.clone());
    let seed = Arc::clone(&client.seed_brokers()[0]);

    let err = seed.request(MetadataRequest::default()).await.unwrap_err();
    assert!(matches!(
        err,
        KaflinkError::InvalidResponseSize(ReadSizeError::LooksLikeHttp { .. })
    ));
    assert!(err.to_string().contains("is your broker port correct?"));

    // The failed connection is gone; the next request dials fresh.
    seed.request(MetadataRequest::default()).await.unwrap();
    assert_eq!(hook.connects.load(Ordering::SeqCst), 2);
    client.close();
}

#[tokio::test]
async fn correlation_mismatch_kills_the_connection() {
    init_logging();

    let mock = spawn_mock(MockCfg {
        wrong_corr_id_once: true,
        ..Default::default()
    })
    .await;
    let hook = Arc::new(CountingHook::default());
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_acks(Acks::Leader)
            .with_hook(hook.clone()),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);
    seed.request(MetadataRequest::default()).await.unwrap();

    let err = seed.request(ProduceRequest::default()).await.unwrap_err();
    assert!(matches!(err, KaflinkError::CorrelationIdMismatch { expected: 0, got: 100 }));
    assert_eq!(hook.disconnects.load(Ordering::SeqCst), 1);

    // Next produce opens a fresh connection and starts at correlation 0.
    seed.request(ProduceRequest::default()).await.unwrap();
    assert_eq!(*mock.state.produce_corr_ids.lock(), vec![0, 0]);
    assert_eq!(hook.connects.load(Ordering::SeqCst), 3);
    client.close();
}

#[tokio::test]
async fn throttle_delays_the_next_write_and_cancel_leaves_the_connection_alive() {
    init_logging();

    let mock = spawn_mock(MockCfg {
        produce_throttle_ms_once: Some(400),
        ..Default::default()
    })
    .await;
    let hook = Arc::new(CountingHook::default());
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_acks(Acks::Leader)
            .with_hook(hook.clone()),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);
    seed.request(MetadataRequest::default()).await.unwrap();

    // First produce arms throttle_until = now + 400ms (v9 throttles after
    // the response).
    let throttled_at = Instant::now();
    seed.request(ProduceRequest::default()).await.unwrap();
    assert_eq!(hook.throttles.load(Ordering::SeqCst), 1);

    // A cancelled request during the throttle wait fails with the
    // context error and leaves the connection alive.
    let ctx = RequestContext::new();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
    });
    let err = seed
        .request_with(ctx, ProduceRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KaflinkError::Cancelled));
    assert_eq!(hook.disconnects.load(Ordering::SeqCst), 0);

    // The next write begins no earlier than the throttle deadline.
    seed.request(ProduceRequest::default()).await.unwrap();
    assert!(
        throttled_at.elapsed() >= Duration::from_millis(350),
        "write went out before the throttle expired"
    );
    // Still the same two connections (normal + produce).
    assert_eq!(hook.connects.load(Ordering::SeqCst), 2);
    client.close();
}

#[tokio::test]
async fn sasl_plain_reauth_loop_is_bounded() {
    init_logging();

    let mock = spawn_mock(MockCfg {
        sasl_lifetime_ms: 1000,
        ..Default::default()
    })
    .await;
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_sasls(vec![Arc::new(Plain::new("user", "pass")) as Arc<dyn Mechanism>]),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);

    // A 1s lifetime minus the 2.5s latency floor goes negative: every
    // authenticate leaves the session immediately expired (after a 100ms
    // anti-spin sleep), so one dispatch reauthenticates 15 times and the
    // 16th attempt fails the request and kills the connection.
    let start = Instant::now();
    let err = seed.request(MetadataRequest::default()).await.unwrap_err();
    assert!(matches!(err, KaflinkError::SaslReauthLoop), "got {err}");
    // 1 init auth + 15 reauths, each with its anti-spin sleep.
    assert_eq!(mock.state.auths.load(Ordering::SeqCst), 16);
    assert!(start.elapsed() >= Duration::from_millis(1500));
    client.close();
}

#[tokio::test]
async fn sasl_plain_without_lifetime_authenticates_once() {
    init_logging();

    let mock = spawn_mock(MockCfg::default()).await;
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_sasls(vec![Arc::new(Plain::new("user", "pass")) as Arc<dyn Mechanism>]),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);

    seed.request(MetadataRequest::default()).await.unwrap();
    seed.request(MetadataRequest::default()).await.unwrap();
    assert_eq!(mock.state.auths.load(Ordering::SeqCst), 1);
    client.close();
}

#[tokio::test]
async fn idle_connections_are_reaped() {
    init_logging();

    let mock = spawn_mock(MockCfg::default()).await;
    let hook = Arc::new(CountingHook::default());
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_conn_idle_timeout(Duration::from_millis(150))
            .with_hook(hook.clone()),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);

    seed.request(MetadataRequest::default()).await.unwrap();
    assert_eq!(hook.connects.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(hook.disconnects.load(Ordering::SeqCst), 1, "reaper should have fired");

    seed.request(MetadataRequest::default()).await.unwrap();
    assert_eq!(hook.connects.load(Ordering::SeqCst), 2);
    client.close();
}

#[tokio::test]
async fn correlation_ids_are_monotonic_under_pipelining() {
    init_logging();

    let mock = spawn_mock(MockCfg::default()).await;
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()]).with_acks(Acks::Leader),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);
    seed.request(MetadataRequest::default()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let seed = Arc::clone(&seed);
        handles.push(tokio::spawn(async move {
            seed.request(ProduceRequest::default()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let corr_ids = mock.state.produce_corr_ids.lock().clone();
    assert_eq!(corr_ids, vec![0, 1, 2, 3, 4]);
    client.close();
}

#[tokio::test]
async fn version_pins_gate_requests() {
    init_logging();

    let mock = spawn_mock(MockCfg {
        // No Fetch in the advertised table.
        advertise: vec![(0, 0, 9), (3, 0, 12), (18, 0, 3)],
        ..Default::default()
    })
    .await;
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_min_versions(VersionPins::new().pin(3, 99)),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);

    // The broker never advertised Fetch.
    let err = seed.request(FetchRequest::default()).await.unwrap_err();
    assert!(matches!(err, KaflinkError::BrokerTooOld { key: 1 }));

    // Metadata is advertised, but below our configured floor.
    let err = seed.request(MetadataRequest::default()).await.unwrap_err();
    assert!(matches!(err, KaflinkError::BrokerTooOld { key: 3 }));
    client.close();
}

#[tokio::test]
async fn excluded_keys_fail_before_writing() {
    init_logging();

    let mock = spawn_mock(MockCfg::default()).await;
    let client = Client::new(
        ClientConfig::new([mock.addr.clone()])
            .with_max_versions(VersionPins::new().pin(18, 3)),
    )
    .unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);

    let err = seed.request(MetadataRequest::default()).await.unwrap_err();
    assert!(matches!(err, KaflinkError::UnknownRequestKey(3)));
    client.close();
}

#[tokio::test]
async fn close_fails_queued_requests_with_broker_dead() {
    init_logging();

    let mock = spawn_mock(MockCfg::default()).await;
    let client = Client::new(ClientConfig::new([mock.addr.clone()])).unwrap();
    let seed = Arc::clone(&client.seed_brokers()[0]);
    seed.request(MetadataRequest::default()).await.unwrap();

    client.close();
    let err = seed.request(MetadataRequest::default()).await.unwrap_err();
    assert!(matches!(err, KaflinkError::ChosenBrokerDead));
}
