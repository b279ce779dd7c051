//! One TCP connection to a broker
//!
//! A connection owns its socket halves and the FIFO of responses still
//! owed to it. Exactly one task writes (the broker's request pump) and
//! exactly one task reads (this connection's response worker, or the
//! ack-0 discard worker on a fire-and-forget produce connection), so the
//! halves sit behind async mutexes that are never contended in steady
//! state.
//!
//! Every blocking read or write races four outcomes: the I/O completing
//! within its deadline, the request context cancelling, the client
//! shutting down, and the connection dying. Cancelled in-flight I/O is
//! always followed by connection death, because a half-written or
//! half-read frame leaves the stream unusable.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes};
use kafka_protocol::messages::{
    ApiVersionsRequest, ApiVersionsResponse, SaslAuthenticateRequest, SaslAuthenticateResponse,
    SaslHandshakeRequest, SaslHandshakeResponse,
};
use kafka_protocol::protocol::{Decodable, Message, StrBytes};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientCore;
use crate::config::Acks;
use crate::error::{KaflinkError, Result};
use crate::hooks::E2e;
use crate::protocol::request::{AnyRequest, ErasedRequest, RequestContext, ThrottleHint};
use crate::protocol::versions::{BrokerVersions, VersionsSlot};
use crate::protocol::{
    frame, ERROR_UNSUPPORTED_SASL_MECHANISM, ERROR_UNSUPPORTED_VERSION, KEY_API_VERSIONS,
    KEY_SASL_AUTHENTICATE, KEY_SASL_HANDSHAKE,
};
use crate::sasl::Mechanism;

use super::queue::{DispatchQueue, NextOutcome, PushOutcome};
use super::{BrokerMetadata, ResponsePromise};

/// Raw v0 ApiVersionsResponse bodies brokers send for an
/// UNSUPPORTED_VERSION reply to a v1+ request.
const API_VERSIONS_V0_DOWNGRADE: &[u8] = &[0, 0x23, 0, 0, 0, 0];
/// Azure EventHubs erroneously replies with a v1 body instead.
const API_VERSIONS_V0_DOWNGRADE_EVENTHUBS: &[u8] = &[0, 0x23, 0, 0, 0, 0, 0, 0, 0, 0];

/// Scratch size for the ack-0 discard worker; produce responses are small
/// so a few reads drain one.
const DISCARD_SCRATCH_BYTES: usize = 256;

/// Timings of one successful frame write.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteMetrics {
    pub(crate) bytes_written: usize,
    pub(crate) write_wait: Duration,
    pub(crate) time_to_write: Duration,
    pub(crate) read_enqueued_at: Instant,
}

impl WriteMetrics {
    fn empty() -> Self {
        Self {
            bytes_written: 0,
            write_wait: Duration::ZERO,
            time_to_write: Duration::ZERO,
            read_enqueued_at: Instant::now(),
        }
    }
}

/// A successful request write: the correlation id it was stamped with and
/// its timings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteOutcome {
    pub(crate) corr_id: i32,
    pub(crate) metrics: WriteMetrics,
}

/// A failed request write, split by whether socket I/O was attempted.
/// Failures before any I/O (throttle-wait cancellation, encode errors)
/// leave the connection alive; failures during I/O require killing it.
#[derive(Debug)]
pub(crate) enum WriteError {
    BeforeIo(KaflinkError),
    DuringIo(KaflinkError),
}

impl WriteError {
    pub(crate) fn into_inner(self) -> KaflinkError {
        match self {
            WriteError::BeforeIo(e) | WriteError::DuringIo(e) => e,
        }
    }
}

struct ReadMetrics {
    bytes_read: usize,
    read_wait: Duration,
    time_to_read: Duration,
}

/// A request awaiting its reply on a connection's response queue.
pub(crate) struct PendingResponse {
    pub(crate) ctx: RequestContext,
    pub(crate) corr_id: i32,
    /// Whether the response header carries a tag block. This is NOT the
    /// request's flexibility bit: ApiVersions responses use a
    /// non-flexible header even when the body is flexible, so clients can
    /// parse the v0 fallback before negotiation.
    pub(crate) flexible_header: bool,
    pub(crate) request: Box<dyn AnyRequest>,
    pub(crate) version: i16,
    pub(crate) promise: ResponsePromise,
    pub(crate) read_timeout: Duration,
    pub(crate) write: WriteMetrics,
}

/// One live connection to a broker.
pub(crate) struct BrokerCxn {
    core: Arc<ClientCore>,
    meta: BrokerMetadata,
    addr: String,
    versions: Arc<VersionsSlot>,

    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,

    corr_id: AtomicI32,

    mechanism: Mutex<Option<Arc<dyn Mechanism>>>,
    /// Next SASL reauthentication deadline; `None` means the session is
    /// not lifetime-bounded.
    expiry: Mutex<Option<Instant>>,

    /// Earliest instant the next write may start, in nanos on the client
    /// clock.
    throttle_until: AtomicI64,

    // Reap bookkeeping.
    last_write: AtomicI64,
    last_read: AtomicI64,
    writing: AtomicBool,
    reading: AtomicBool,

    successes: AtomicU64,

    resps: DispatchQueue<PendingResponse>,
    dead: AtomicBool,
    dead_token: CancellationToken,
}

impl BrokerCxn {
    pub(crate) fn new(
        core: Arc<ClientCore>,
        meta: BrokerMetadata,
        addr: String,
        versions: Arc<VersionsSlot>,
        stream: TcpStream,
    ) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let now = core.nanos_since_start();
        Arc::new(Self {
            core,
            meta,
            addr,
            versions,
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            corr_id: AtomicI32::new(0),
            mechanism: Mutex::new(None),
            expiry: Mutex::new(None),
            throttle_until: AtomicI64::new(0),
            last_write: AtomicI64::new(now),
            last_read: AtomicI64::new(now),
            writing: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            successes: AtomicU64::new(0),
            resps: DispatchQueue::default(),
            dead: AtomicBool::new(false),
            dead_token: CancellationToken::new(),
        })
    }

    /// Negotiate api versions (first connection to this broker only),
    /// authenticate, and start the ack-0 discard worker when called for.
    /// Any failure leaves the socket for the caller to kill.
    pub(crate) async fn init(self: &Arc<Self>, is_produce_cxn: bool, request_id: &str) -> Result<()> {
        if self.versions.load().is_none() {
            let negotiate = self
                .core
                .cfg
                .max_versions
                .as_ref()
                .map_or(true, |pins| pins.has_key(KEY_API_VERSIONS));
            if negotiate {
                if let Err(e) = self.request_api_versions().await {
                    if !e.is_client_closed() {
                        warn!(
                            broker = %self.meta.log_id(),
                            err = %e,
                            request_id,
                            "unable to request api versions"
                        );
                    }
                    return Err(e);
                }
            } else {
                // The user's pins exclude ApiVersions entirely; store the
                // all-unknown sentinel so request version picks fall back
                // to the request's own maximum.
                self.versions.store(BrokerVersions::unknown());
            }
        }

        if let Err(e) = self.sasl(request_id).await {
            if !e.is_client_closed() {
                warn!(
                    broker = %self.meta.log_id(),
                    err = %e,
                    request_id,
                    "unable to initialize sasl"
                );
            }
            return Err(e);
        }

        if is_produce_cxn && self.core.cfg.acks == Acks::None {
            let cxn = Arc::clone(self);
            tokio::spawn(cxn.discard());
        }
        Ok(())
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn expiry(&self) -> Option<Instant> {
        *self.expiry.lock()
    }

    pub(crate) fn last_write_nanos(&self) -> i64 {
        self.last_write.load(Ordering::Acquire)
    }

    pub(crate) fn last_read_nanos(&self) -> i64 {
        self.last_read.load(Ordering::Acquire)
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Kill this connection: fail everything still awaiting a response,
    /// wake every waiter, and send FIN once the writer is free.
    /// Idempotent.
    pub(crate) fn die(self: &Arc<Self>) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dead_token.cancel();
        for pr in self.resps.die() {
            self.fail_pending(pr, KaflinkError::ChosenBrokerDead);
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let cxn = Arc::clone(self);
            handle.spawn(async move {
                let mut writer = cxn.writer.lock().await;
                let _ = writer.shutdown().await;
            });
        }
        self.core.each_hook(|h| h.on_broker_disconnect(&self.meta));
        debug!(addr = %self.addr, broker = %self.meta.log_id(), "killed connection");
    }

    /// Fail one pending response, firing the E2E hook with whatever write
    /// timings it accumulated.
    pub(crate) fn fail_pending(&self, pr: PendingResponse, err: KaflinkError) {
        let e2e = E2e {
            bytes_written: pr.write.bytes_written,
            write_wait: pr.write.write_wait,
            time_to_write: pr.write.time_to_write,
            ..Default::default()
        };
        self.core
            .each_hook(|h| h.on_broker_e2e(&self.meta, pr.request.api_key(), &e2e, Some(&err)));
        let _ = pr.promise.send(Err(err));
    }

    pub(crate) fn hook_write_e2e(&self, key: i16, metrics: WriteMetrics, err: Option<&KaflinkError>) {
        let e2e = E2e {
            bytes_written: metrics.bytes_written,
            write_wait: metrics.write_wait,
            time_to_write: metrics.time_to_write,
            ..Default::default()
        };
        self.core.each_hook(|h| h.on_broker_e2e(&self.meta, key, &e2e, err));
    }

    // ── Writing ─────────────────────────────────────────────────────────

    /// Serialize and write one request, stamping it with the next
    /// correlation id. The counter advances only on success, so a failed
    /// write never burns an id.
    ///
    /// A `None` context marks an internal request (version negotiation,
    /// SASL) that is immune to throttling.
    pub(crate) async fn write_request(
        &self,
        ctx: Option<&RequestContext>,
        enqueued_at: Instant,
        req: &dyn AnyRequest,
        version: i16,
    ) -> std::result::Result<WriteOutcome, WriteError> {
        if let Some(ctx) = ctx {
            self.await_throttle(ctx).await.map_err(WriteError::BeforeIo)?;
        }

        let key = req.api_key();
        let mut buf = self.core.buf_pool.get().await;
        if let Err(e) = frame::append_request(
            &mut buf,
            req,
            version,
            self.corr_id.load(Ordering::Relaxed),
            self.core.cfg.client_id.as_deref(),
        ) {
            self.core.buf_pool.put(buf).await;
            return Err(WriteError::BeforeIo(e));
        }

        let write_timeout = self.core.cfg.request_timeout_overhead;
        let result = self.write_conn(ctx, &buf, write_timeout, enqueued_at).await;
        self.core.buf_pool.put(buf).await;

        match result {
            Ok(metrics) => {
                self.core.each_hook(|h| {
                    h.on_broker_write(
                        &self.meta,
                        key,
                        metrics.bytes_written,
                        metrics.write_wait,
                        metrics.time_to_write,
                        None,
                    )
                });
                debug!(
                    broker = %self.meta.log_id(),
                    key,
                    version,
                    bytes_written = metrics.bytes_written,
                    write_wait = ?metrics.write_wait,
                    time_to_write = ?metrics.time_to_write,
                    "wrote request"
                );
                let corr_id = self.corr_id.fetch_add(1, Ordering::Relaxed);
                Ok(WriteOutcome { corr_id, metrics })
            }
            Err(e) => {
                let write_wait = enqueued_at.elapsed();
                self.core.each_hook(|h| {
                    h.on_broker_write(&self.meta, key, 0, write_wait, Duration::ZERO, Some(&e))
                });
                self.hook_write_e2e(
                    key,
                    WriteMetrics { write_wait, ..WriteMetrics::empty() },
                    Some(&e),
                );
                debug!(broker = %self.meta.log_id(), key, version, err = %e, "write failed");
                Err(WriteError::DuringIo(e))
            }
        }
    }

    /// Sleep out any broker-imposed throttle, unless the request is
    /// cancelled, the client closes, or the connection dies first. No I/O
    /// happens here, so a cancelled wait leaves the connection alive.
    async fn await_throttle(&self, ctx: &RequestContext) -> Result<()> {
        let until = self.throttle_until.load(Ordering::Acquire);
        let now = self.core.nanos_since_start();
        if now >= until {
            return Ok(());
        }
        let sleep = Duration::from_nanos((until - now) as u64);
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(KaflinkError::Cancelled),
            _ = self.core.shutdown.cancelled() => Err(KaflinkError::ClientClosed),
            _ = self.dead_token.cancelled() => Err(KaflinkError::ChosenBrokerDead),
            _ = tokio::time::sleep(sleep) => Ok(()),
        }
    }

    async fn write_conn(
        &self,
        ctx: Option<&RequestContext>,
        buf: &[u8],
        timeout: Duration,
        enqueued_at: Instant,
    ) -> Result<WriteMetrics> {
        self.writing.store(true, Ordering::Release);
        let write_start = Instant::now();
        let result = {
            let mut writer = self.writer.lock().await;
            tokio::select! {
                biased;
                _ = Self::ctx_cancelled(ctx) => Err(KaflinkError::Cancelled),
                _ = self.core.shutdown.cancelled() => Err(KaflinkError::ClientClosed),
                _ = self.dead_token.cancelled() => Err(KaflinkError::ChosenBrokerDead),
                io = tokio::time::timeout(timeout, writer.write_all(buf)) => match io {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(KaflinkError::Timeout("writing a request")),
                },
            }
        };
        let read_enqueued_at = Instant::now();
        self.last_write
            .store(self.core.nanos_since_start(), Ordering::Release);
        self.writing.store(false, Ordering::Release);

        result.map(|()| WriteMetrics {
            bytes_written: buf.len(),
            write_wait: write_start.saturating_duration_since(enqueued_at),
            time_to_write: read_enqueued_at.saturating_duration_since(write_start),
            read_enqueued_at,
        })
    }

    // ── Reading ─────────────────────────────────────────────────────────

    async fn read_conn(
        &self,
        ctx: Option<&RequestContext>,
        timeout: Duration,
        enqueued_at: Instant,
    ) -> Result<(Bytes, ReadMetrics)> {
        self.reading.store(true, Ordering::Release);
        let read_start = Instant::now();
        let max_size = self.core.cfg.max_broker_read_bytes;
        let result = {
            let mut reader = self.reader.lock().await;
            let io = async {
                let mut size_buf = [0u8; 4];
                reader.read_exact(&mut size_buf).await?;
                let size = frame::parse_read_size(size_buf, max_size)?;
                let mut payload = vec![0u8; size as usize];
                reader.read_exact(&mut payload).await?;
                Ok::<Bytes, KaflinkError>(Bytes::from(payload))
            };
            tokio::select! {
                biased;
                _ = Self::ctx_cancelled(ctx) => Err(KaflinkError::Cancelled),
                _ = self.core.shutdown.cancelled() => Err(KaflinkError::ClientClosed),
                _ = self.dead_token.cancelled() => Err(KaflinkError::ChosenBrokerDead),
                io = tokio::time::timeout(timeout, io) => match io {
                    Ok(res) => res,
                    Err(_) => Err(KaflinkError::Timeout("reading a response")),
                },
            }
        };
        let time_to_read = read_start.elapsed();
        self.last_read
            .store(self.core.nanos_since_start(), Ordering::Release);
        self.reading.store(false, Ordering::Release);

        result.map(|payload| {
            let metrics = ReadMetrics {
                bytes_read: payload.len() + 4,
                read_wait: read_start.saturating_duration_since(enqueued_at),
                time_to_read,
            };
            (payload, metrics)
        })
    }

    /// Read one full response frame, verify its correlation id, and strip
    /// the header (including the tag block on flexible headers).
    pub(crate) async fn read_response(
        &self,
        ctx: Option<&RequestContext>,
        key: i16,
        version: i16,
        corr_id: i32,
        flexible_header: bool,
        timeout: Duration,
        write: WriteMetrics,
    ) -> Result<Bytes> {
        let result = self.read_conn(ctx, timeout, write.read_enqueued_at).await;

        let (bytes_read, read_wait, time_to_read, err) = match &result {
            Ok((_, m)) => (m.bytes_read, m.read_wait, m.time_to_read, None),
            Err(e) => (0, Duration::ZERO, Duration::ZERO, Some(e)),
        };
        let e2e = E2e {
            bytes_written: write.bytes_written,
            bytes_read,
            write_wait: write.write_wait,
            time_to_write: write.time_to_write,
            read_wait,
            time_to_read,
        };
        self.core.each_hook(|h| {
            h.on_broker_read(&self.meta, key, bytes_read, read_wait, time_to_read, err);
            h.on_broker_e2e(&self.meta, key, &e2e, err);
        });
        debug!(
            broker = %self.meta.log_id(),
            key,
            version,
            bytes_read,
            read_wait = ?read_wait,
            time_to_read = ?time_to_read,
            ok = err.is_none(),
            "read response"
        );

        let (payload, _) = result?;
        frame::strip_response_header(payload, corr_id, flexible_header)
    }

    async fn ctx_cancelled(ctx: Option<&RequestContext>) {
        match ctx {
            Some(ctx) => ctx.cancelled().await,
            None => std::future::pending().await,
        }
    }

    // ── Version negotiation ─────────────────────────────────────────────

    /// Negotiate api versions, starting at v3 (or the user's cap) and
    /// falling back to v0 when the broker answers a newer request with a
    /// raw UNSUPPORTED_VERSION v0 body.
    async fn request_api_versions(&self) -> Result<()> {
        let mut max_version: i16 = 3;
        if let Some(pins) = &self.core.cfg.max_versions {
            if let Some(user_max) = pins.lookup(KEY_API_VERSIONS) {
                if user_max >= 0 {
                    max_version = user_max;
                }
            }
        }

        loop {
            let mut request = ApiVersionsRequest::default();
            if max_version >= 3 {
                request = request
                    .with_client_software_name(StrBytes::from_string(
                        self.core.cfg.software_name.clone(),
                    ))
                    .with_client_software_version(StrBytes::from_string(
                        self.core.cfg.software_version.clone(),
                    ));
            }
            let req = ErasedRequest::new(request);
            debug!(broker = %self.meta.log_id(), version = max_version, "issuing api versions request");

            let out = self
                .write_request(None, Instant::now(), &req, max_version)
                .await
                .map_err(WriteError::into_inner)?;
            let read_timeout = self.core.cfg.request_timeout_overhead;
            // ApiVersions never uses a flexible response header.
            let raw = self
                .read_response(
                    None,
                    KEY_API_VERSIONS,
                    max_version,
                    out.corr_id,
                    false,
                    read_timeout,
                    out.metrics,
                )
                .await?;

            if raw.len() < 2 {
                return Err(KaflinkError::protocol_msg(format!(
                    "invalid length {} short response from ApiVersions request",
                    raw.len()
                )));
            }

            let mut decode_version = max_version;
            if raw[1] == ERROR_UNSUPPORTED_VERSION as u8 {
                // UNSUPPORTED_VERSION. Pre-2.4 brokers reply with a v0
                // body and expect us to retry at v0; newer brokers reply
                // at v0 but with all their versions attached.
                if max_version == 0 {
                    return Err(KaflinkError::protocol_msg(
                        "broker replied with UNSUPPORTED_VERSION to an ApiVersions request of version 0",
                    ));
                }
                if raw[..] == *API_VERSIONS_V0_DOWNGRADE
                    || raw[..] == *API_VERSIONS_V0_DOWNGRADE_EVENTHUBS
                {
                    debug!(
                        broker = %self.meta.log_id(),
                        "broker does not know our ApiVersions version, downgrading to version 0 and retrying"
                    );
                    max_version = 0;
                    continue;
                }
                decode_version = 0;
            }

            let mut body = raw;
            let resp = ApiVersionsResponse::decode(&mut body, decode_version)
                .map_err(|e| KaflinkError::protocol("decode ApiVersions response", e.to_string()))?;
            if resp.api_keys.is_empty() {
                return Err(KaflinkError::protocol_msg(
                    "ApiVersions response invalidly contained no api keys",
                ));
            }
            self.versions.store(BrokerVersions::from_response(&resp));
            return Ok(());
        }
    }

    // ── SASL ────────────────────────────────────────────────────────────

    /// Authenticate on this socket. A no-op without configured
    /// mechanisms. Also the reauthentication entry point: calling it
    /// again on a live connection runs the whole flow on the same socket.
    pub(crate) async fn sasl(&self, request_id: &str) -> Result<()> {
        if self.core.cfg.sasls.is_empty() {
            return Ok(());
        }
        let mut mechanism = Arc::clone(&self.core.cfg.sasls[0]);
        let mut retried = false;
        let mut authenticate = false;
        let versions = self
            .versions
            .load()
            .unwrap_or_else(|| Arc::new(BrokerVersions::unknown()));

        'handshake: loop {
            let handshake_max = versions.get(KEY_SASL_HANDSHAKE);
            if mechanism.name() != "GSSAPI" && handshake_max >= 0 {
                let version = handshake_max.min(<SaslHandshakeRequest as Message>::VERSIONS.max);
                let req = ErasedRequest::new(
                    SaslHandshakeRequest::default()
                        .with_mechanism(StrBytes::from_string(mechanism.name().to_string())),
                );
                debug!(
                    broker = %self.meta.log_id(),
                    mechanism = mechanism.name(),
                    request_id,
                    "issuing SaslHandshakeRequest"
                );
                let out = self
                    .write_request(None, Instant::now(), &req, version)
                    .await
                    .map_err(WriteError::into_inner)?;
                let raw = self
                    .read_response(
                        None,
                        KEY_SASL_HANDSHAKE,
                        version,
                        out.corr_id,
                        frame::response_header_is_flexible(KEY_SASL_HANDSHAKE, version),
                        self.core.cfg.request_timeout_overhead,
                        out.metrics,
                    )
                    .await?;
                let mut body = raw;
                let resp = SaslHandshakeResponse::decode(&mut body, version).map_err(|e| {
                    KaflinkError::protocol("decode SaslHandshake response", e.to_string())
                })?;

                if resp.error_code != 0 {
                    if !retried && resp.error_code == ERROR_UNSUPPORTED_SASL_MECHANISM {
                        for ours in &self.core.cfg.sasls[1..] {
                            for supported in &resp.mechanisms {
                                if supported.as_str() == ours.name() {
                                    mechanism = Arc::clone(ours);
                                    retried = true;
                                    continue 'handshake;
                                }
                            }
                        }
                    }
                    return Err(KaflinkError::sasl(format!(
                        "broker rejected sasl handshake for {} with error code {}",
                        mechanism.name(),
                        resp.error_code
                    )));
                }
                authenticate = version >= 1;
            }

            debug!(
                broker = %self.meta.log_id(),
                mechanism = mechanism.name(),
                authenticate,
                "beginning sasl authentication"
            );
            *self.mechanism.lock() = Some(Arc::clone(&mechanism));
            return self.do_sasl(authenticate, &mechanism, request_id).await;
        }
    }

    /// Run the challenge/response loop. With `authenticate` the bytes
    /// travel in SaslAuthenticate requests (handshake v1+); without it
    /// they go raw and length-prefixed on the socket (handshake v0 or
    /// skipped).
    async fn do_sasl(
        &self,
        authenticate: bool,
        mechanism: &Arc<dyn Mechanism>,
        request_id: &str,
    ) -> Result<()> {
        let (mut session, mut client_write) = mechanism.authenticate(&self.addr).await?;
        if client_write.is_empty() {
            return Err(KaflinkError::sasl(format!(
                "unexpected server-write sasl with mechanism {}",
                mechanism.name()
            )));
        }

        let overhead = self.core.cfg.request_timeout_overhead;
        let auth_version = {
            let broker_max = self
                .versions
                .load()
                .map(|v| v.get(KEY_SASL_AUTHENTICATE))
                .unwrap_or(-1);
            broker_max
                .min(<SaslAuthenticateRequest as Message>::VERSIONS.max)
                .max(0)
        };

        let mut prereq = Instant::now();
        let mut lifetime_millis: i64 = 0;
        let mut step = 0u32;
        let mut done = false;

        // Loop until the session is done AND there is nothing left to
        // write; some mechanisms finish with a write that expects no
        // reply.
        while !done || !client_write.is_empty() {
            let challenge: Vec<u8>;

            if !authenticate {
                let mut buf = self.core.buf_pool.get().await;
                buf.put_u32(client_write.len() as u32);
                buf.extend_from_slice(&client_write);
                debug!(broker = %self.meta.log_id(), step, request_id, "issuing raw sasl authenticate");
                let res = self.write_conn(None, &buf, overhead, Instant::now()).await;
                self.core.buf_pool.put(buf).await;
                res?;
                if !done {
                    let (payload, _) = self.read_conn(None, overhead, Instant::now()).await?;
                    challenge = payload.to_vec();
                } else {
                    challenge = Vec::new();
                }
            } else {
                let req = ErasedRequest::new(
                    SaslAuthenticateRequest::default()
                        .with_auth_bytes(Bytes::from(client_write.clone())),
                );
                debug!(
                    broker = %self.meta.log_id(),
                    version = auth_version,
                    step,
                    request_id,
                    "issuing SaslAuthenticateRequest"
                );
                // The broker computes our session lifetime before it
                // writes its response; stamp the clock before our write
                // so the lifetime haircut covers the full round trip.
                prereq = Instant::now();
                let out = self
                    .write_request(None, Instant::now(), &req, auth_version)
                    .await
                    .map_err(WriteError::into_inner)?;
                if !done {
                    let raw = self
                        .read_response(
                            None,
                            KEY_SASL_AUTHENTICATE,
                            auth_version,
                            out.corr_id,
                            frame::response_header_is_flexible(KEY_SASL_AUTHENTICATE, auth_version),
                            overhead,
                            out.metrics,
                        )
                        .await?;
                    let mut body = raw;
                    let resp =
                        SaslAuthenticateResponse::decode(&mut body, auth_version).map_err(|e| {
                            KaflinkError::protocol("decode SaslAuthenticate response", e.to_string())
                        })?;
                    if resp.error_code != 0 {
                        let detail = match &resp.error_message {
                            Some(msg) => format!("{} (error code {})", msg.as_str(), resp.error_code),
                            None => format!("error code {}", resp.error_code),
                        };
                        return Err(KaflinkError::sasl(detail));
                    }
                    challenge = resp.auth_bytes.to_vec();
                    lifetime_millis = resp.session_lifetime_ms;
                } else {
                    self.hook_write_e2e(KEY_SASL_AUTHENTICATE, out.metrics, None);
                    challenge = Vec::new();
                }
            }

            client_write.clear();
            if !done {
                let (finished, next_write) = session.challenge(&challenge)?;
                done = finished;
                client_write = next_write;
            }
            step += 1;
        }

        if lifetime_millis > 0 {
            // Pessimistic haircut: the broker may have computed the
            // lifetime well before its reply reached us. Take off the
            // observed round trip x1.1, floored at 2.5s.
            let mut latency = (prereq.elapsed().as_millis() as f64 * 1.1) as i64;
            if latency < 2500 {
                latency = 2500;
            }
            let use_lifetime = lifetime_millis - latency;
            let now = Instant::now();
            let expiry = if use_lifetime > 0 {
                now + Duration::from_millis(use_lifetime as u64)
            } else {
                now
            };
            *self.expiry.lock() = Some(expiry);
            debug!(
                broker = %self.meta.log_id(),
                reauthenticate_in = ?expiry.saturating_duration_since(now),
                request_id,
                "sasl has a limited lifetime"
            );
            if use_lifetime < 0 {
                info!(
                    broker = %self.meta.log_id(),
                    session_lifetime_millis = lifetime_millis,
                    latency_lower_bound_millis = latency,
                    request_id,
                    "sasl lifetime minus latency lower bound results in immediate reauthentication, sleeping 100ms to avoid a spin loop"
                );
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(())
    }

    // ── Response worker ─────────────────────────────────────────────────

    /// Enqueue a response awaiter; the push that finds the queue idle
    /// starts this connection's response worker.
    pub(crate) fn wait_resp(self: &Arc<Self>, pr: PendingResponse) {
        match self.resps.push(pr) {
            PushOutcome::Started(pr) => {
                let cxn = Arc::clone(self);
                tokio::spawn(async move { cxn.handle_resps(pr).await });
            }
            PushOutcome::Enqueued => {}
            PushOutcome::Dead(pr) => self.fail_pending(pr, KaflinkError::ChosenBrokerDead),
        }
    }

    async fn handle_resps(self: Arc<Self>, first: PendingResponse) {
        let mut pr = first;
        loop {
            self.handle_resp(pr).await;
            match self.resps.next() {
                NextOutcome::Item(next) => pr = next,
                NextOutcome::Idle => return,
                NextOutcome::Dead(drained) => {
                    for pr in drained {
                        self.fail_pending(pr, KaflinkError::ChosenBrokerDead);
                    }
                    return;
                }
            }
        }
    }

    /// Read, match, and decode one response. The queue is FIFO and the
    /// wire is in-order, so the head of the queue names the correlation
    /// id the next frame must carry; any other id kills the connection.
    async fn handle_resp(self: &Arc<Self>, pr: PendingResponse) {
        let raw = self
            .read_response(
                Some(&pr.ctx),
                pr.request.api_key(),
                pr.version,
                pr.corr_id,
                pr.flexible_header,
                pr.read_timeout,
                pr.write,
            )
            .await;

        let mut body = match raw {
            Err(e) => {
                if !e.is_cancellation() {
                    let successes = self.successes.load(Ordering::Relaxed);
                    if successes > 0 || !self.core.cfg.sasls.is_empty() {
                        debug!(
                            addr = %self.addr,
                            broker = %self.meta.log_id(),
                            successful_reads = successes,
                            err = %e,
                            request_id = pr.ctx.request_id(),
                            "read from broker errored, killing connection"
                        );
                    } else {
                        warn!(
                            addr = %self.addr,
                            broker = %self.meta.log_id(),
                            err = %e,
                            request_id = pr.ctx.request_id(),
                            "read from broker errored, killing connection after 0 successful responses (is sasl missing?)"
                        );
                    }
                }
                let _ = pr.promise.send(Err(e));
                self.die();
                return;
            }
            Ok(body) => body,
        };

        self.successes.fetch_add(1, Ordering::Relaxed);
        match pr.request.decode_response(&mut body, pr.version) {
            Ok((resp, throttle)) => {
                if let Some(hint) = throttle {
                    self.apply_throttle(hint);
                }
                let _ = pr.promise.send(Ok(resp));
            }
            Err(e) => {
                debug!(
                    addr = %self.addr,
                    broker = %self.meta.log_id(),
                    err = %e,
                    request_id = pr.ctx.request_id(),
                    "response body failed to decode"
                );
                let _ = pr.promise.send(Err(e));
            }
        }
    }

    /// Arm the throttle deadline (monotonic max) when the broker expects
    /// the client to delay, and fire the hook either way.
    fn apply_throttle(&self, hint: ThrottleHint) {
        if hint.after_response {
            let until = self.core.nanos_since_start() + i64::from(hint.millis) * 1_000_000;
            let mut current = self.throttle_until.load(Ordering::Relaxed);
            while until > current {
                match self.throttle_until.compare_exchange_weak(
                    current,
                    until,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
        self.core.each_hook(|h| {
            h.on_broker_throttle(
                &self.meta,
                Duration::from_millis(hint.millis.max(0) as u64),
                hint.after_response,
            )
        });
    }

    // ── Ack-0 discard worker ────────────────────────────────────────────

    /// Drain replies on an acks=0 produce connection. Kafka proper never
    /// replies, but some hosted implementations do, and unread replies
    /// would eventually fill kernel buffers and wedge the broker.
    ///
    /// The first read gets an ample deadline covering our own write; if
    /// it expires the broker is well-behaved and silent, and the worker
    /// exits without touching the connection. After a first reply is
    /// seen, frame gaps get no deadline (replies arrive only as fast as
    /// we produce) and any error kills the connection.
    pub(crate) async fn discard(self: Arc<Self>) {
        let mut first_timeout = false;
        let result = self.discard_loop(&mut first_timeout).await;
        if first_timeout {
            debug!(
                addr = %self.addr,
                broker = %self.meta.log_id(),
                "produce acks=0 discard worker exiting; this broker correctly does not reply to acks=0 produce requests"
            );
            return;
        }
        if let Err(e) = &result {
            debug!(
                addr = %self.addr,
                broker = %self.meta.log_id(),
                err = %e,
                "produce acks=0 discard worker errored"
            );
        }
        self.die();
    }

    async fn discard_loop(&self, first_timeout: &mut bool) -> Result<()> {
        let first_deadline =
            3 * self.core.cfg.request_timeout_overhead + self.core.cfg.produce_timeout;
        let max_size = self.core.cfg.max_broker_read_bytes;
        let mut scratch = [0u8; DISCARD_SCRATCH_BYTES];
        let mut reader = self.reader.lock().await;

        let mut iteration = 0u64;
        loop {
            let mut size_buf = [0u8; 4];
            {
                let read_size = reader.read_exact(&mut size_buf);
                tokio::pin!(read_size);
                let res = tokio::select! {
                    biased;
                    _ = self.core.shutdown.cancelled() => return Ok(()),
                    _ = self.dead_token.cancelled() => return Ok(()),
                    res = async {
                        if iteration == 0 {
                            tokio::time::timeout(first_deadline, &mut read_size).await
                        } else {
                            Ok(read_size.await)
                        }
                    } => res,
                };
                match res {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_elapsed) => {
                        *first_timeout = true;
                        return Ok(());
                    }
                }
            }

            self.reading.store(true, Ordering::Release);
            let read_start = Instant::now();
            let drain_result = async {
                let size = frame::parse_read_size(size_buf, max_size)?;
                let mut remaining = size as usize;
                let drain = async {
                    while remaining > 0 {
                        let take = remaining.min(DISCARD_SCRATCH_BYTES);
                        let n = reader.read(&mut scratch[..take]).await?;
                        if n == 0 {
                            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
                        }
                        remaining -= n;
                    }
                    Ok::<(), std::io::Error>(())
                };
                match tokio::time::timeout(self.core.cfg.produce_timeout, drain).await {
                    Ok(Ok(())) => Ok(4 + size as usize),
                    Ok(Err(e)) => Err(KaflinkError::from(e)),
                    Err(_) => Err(KaflinkError::Timeout("discarding an acks=0 produce reply")),
                }
            }
            .await;
            self.last_read
                .store(self.core.nanos_since_start(), Ordering::Release);
            self.reading.store(false, Ordering::Release);

            let (nread, err) = match &drain_result {
                Ok(n) => (*n, None),
                Err(e) => (4, Some(e)),
            };
            let time_to_read = read_start.elapsed();
            self.core.each_hook(|h| {
                h.on_broker_read(&self.meta, 0, nread, Duration::ZERO, time_to_read, err)
            });
            drain_result?;
            iteration += 1;
        }
    }
}
