//! Brokers and the per-broker request pump
//!
//! A [`Broker`] owns up to five typed connections to one broker identity
//! (normal, produce, fetch, group, slow) plus a serial request queue.
//! The pump worker processes queued requests one at a time: resolve or
//! lazily dial the right typed connection, pick the wire version, gate on
//! SASL reauthentication, rewrite produce acks, write the frame, and hand
//! the promise to the connection's response worker (or fulfill it
//! immediately for acks=0 produces).

pub(crate) mod cxn;
pub(crate) mod queue;

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kafka_protocol::messages::{ProduceRequest, ProduceResponse};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::client::ClientCore;
use crate::error::{KaflinkError, Result};
use crate::protocol::request::{AnyRequest, ClientRequest, ErasedRequest, RequestContext};
use crate::protocol::versions::VersionsSlot;
use crate::protocol::{
    frame, KEY_FETCH, KEY_JOIN_GROUP, KEY_PRODUCE, KEY_SYNC_GROUP, MAX_API_KEY,
};

use cxn::{BrokerCxn, PendingResponse, WriteError};
use queue::{DispatchQueue, NextOutcome, PushOutcome};

/// Node id Kafka uses for an unknown controller.
pub const UNKNOWN_CONTROLLER_ID: i32 = -1;

/// Synthesize the node id for seed broker `index`.
///
/// Real broker ids are non-negative and Kafka reserves `-1` for unknown
/// controllers, so seeds count up from `i32::MIN` where they can never
/// collide.
pub fn unknown_seed_id(index: usize) -> i32 {
    i32::MIN.wrapping_add(index as i32)
}

/// Identity of one broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    /// Node id; non-negative for real brokers, `i32::MIN + index` for
    /// seeds, `-1` for an unknown controller.
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    /// Rack, when the broker advertises one. Seeds never have a rack.
    pub rack: Option<String>,
}

impl BrokerMetadata {
    pub fn new(node_id: i32, host: impl Into<String>, port: i32, rack: Option<String>) -> Self {
        Self {
            node_id,
            host: host.into(),
            port,
            rack,
        }
    }

    /// Identity for seed broker `index`.
    pub fn seed(index: usize, host: impl Into<String>, port: i32) -> Self {
        Self::new(unknown_seed_id(index), host, port, None)
    }

    /// `host:port` dial address
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Render the node id for log lines; seed ids print as their index.
    pub fn log_id(&self) -> String {
        if self.node_id >= -10 {
            self.node_id.to_string()
        } else {
            format!("seed {}", i64::from(self.node_id) - i64::from(i32::MIN))
        }
    }
}

pub(crate) type ResponsePromise = oneshot::Sender<Result<Box<dyn Any + Send>>>;

/// A request waiting in a broker's pump queue.
pub(crate) struct PendingRequest {
    pub(crate) ctx: RequestContext,
    pub(crate) req: Box<dyn AnyRequest>,
    pub(crate) promise: ResponsePromise,
    pub(crate) enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CxnKind {
    Normal,
    Produce,
    Fetch,
    Group,
    Slow,
}

#[derive(Default)]
struct CxnSlots {
    normal: Option<Arc<BrokerCxn>>,
    produce: Option<Arc<BrokerCxn>>,
    fetch: Option<Arc<BrokerCxn>>,
    group: Option<Arc<BrokerCxn>>,
    slow: Option<Arc<BrokerCxn>>,
}

impl CxnSlots {
    fn get(&self, kind: CxnKind) -> Option<&Arc<BrokerCxn>> {
        match kind {
            CxnKind::Normal => self.normal.as_ref(),
            CxnKind::Produce => self.produce.as_ref(),
            CxnKind::Fetch => self.fetch.as_ref(),
            CxnKind::Group => self.group.as_ref(),
            CxnKind::Slow => self.slow.as_ref(),
        }
    }

    fn set(&mut self, kind: CxnKind, cxn: Arc<BrokerCxn>) {
        let slot = match kind {
            CxnKind::Normal => &mut self.normal,
            CxnKind::Produce => &mut self.produce,
            CxnKind::Fetch => &mut self.fetch,
            CxnKind::Group => &mut self.group,
            CxnKind::Slow => &mut self.slow,
        };
        *slot = Some(cxn);
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<BrokerCxn>> {
        [&self.normal, &self.produce, &self.fetch, &self.group, &self.slow]
            .into_iter()
            .flatten()
    }
}

/// Which typed connection a request rides on.
fn route(req: &dyn AnyRequest) -> CxnKind {
    match req.api_key() {
        KEY_PRODUCE => CxnKind::Produce,
        KEY_FETCH => CxnKind::Fetch,
        KEY_JOIN_GROUP | KEY_SYNC_GROUP => CxnKind::Group,
        _ if req.is_timeout_request() => CxnKind::Slow,
        _ => CxnKind::Normal,
    }
}

/// One broker endpoint and its typed connections.
pub struct Broker {
    core: Arc<ClientCore>,
    meta: BrokerMetadata,
    addr: String,

    /// Negotiated version table, loaded once and shared by every
    /// connection to this broker.
    versions: Arc<VersionsSlot>,

    /// Connection slots; the mutex is held only while swapping slots and
    /// while the reaper walks them.
    cxns: Mutex<CxnSlots>,

    reqs: DispatchQueue<PendingRequest>,
    dead: AtomicBool,
}

impl Broker {
    pub(crate) fn new(core: Arc<ClientCore>, meta: BrokerMetadata) -> Arc<Self> {
        Arc::new(Self {
            core,
            addr: meta.addr(),
            meta,
            versions: Arc::new(VersionsSlot::default()),
            cxns: Mutex::new(CxnSlots::default()),
            reqs: DispatchQueue::default(),
            dead: AtomicBool::new(false),
        })
    }

    /// This broker's identity.
    pub fn metadata(&self) -> &BrokerMetadata {
        &self.meta
    }

    /// Issue `req` and await its typed response.
    pub async fn request<R>(self: &Arc<Self>, req: R) -> Result<R::Response>
    where
        R: ClientRequest,
        R::Response: Send + 'static,
    {
        self.request_with(RequestContext::new(), req).await
    }

    /// Issue `req` under a caller-supplied context (cancellation and
    /// request-id tracing) and await its typed response.
    pub async fn request_with<R>(self: &Arc<Self>, ctx: RequestContext, req: R) -> Result<R::Response>
    where
        R: ClientRequest,
        R::Response: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(PendingRequest {
            ctx,
            req: Box::new(ErasedRequest::new(req)),
            promise: tx,
            enqueued_at: Instant::now(),
        });
        let boxed = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(KaflinkError::ChosenBrokerDead),
        };
        boxed
            .downcast::<R::Response>()
            .map(|resp| *resp)
            .map_err(|_| KaflinkError::Internal("response type mismatch".to_string()))
    }

    /// Enqueue a request; the push that finds the queue idle starts this
    /// broker's pump worker.
    pub(crate) fn dispatch(self: &Arc<Self>, pr: PendingRequest) {
        match self.reqs.push(pr) {
            PushOutcome::Started(pr) => {
                let broker = Arc::clone(self);
                tokio::spawn(async move { broker.handle_reqs(pr).await });
            }
            PushOutcome::Enqueued => {}
            PushOutcome::Dead(pr) => {
                let _ = pr.promise.send(Err(KaflinkError::ChosenBrokerDead));
            }
        }
    }

    async fn handle_reqs(self: Arc<Self>, first: PendingRequest) {
        let mut pr = first;
        loop {
            self.handle_req(pr).await;
            match self.reqs.next() {
                NextOutcome::Item(next) => pr = next,
                NextOutcome::Idle => return,
                NextOutcome::Dead(drained) => {
                    for pr in drained {
                        let _ = pr.promise.send(Err(KaflinkError::ChosenBrokerDead));
                    }
                    return;
                }
            }
        }
    }

    async fn handle_req(&self, mut pr: PendingRequest) {
        let request_id = pr.ctx.request_id().to_string();

        let cxn = match self.load_connection(&pr.ctx, pr.req.as_ref()).await {
            Ok(cxn) => cxn,
            Err(e) => {
                debug!(broker = %self.meta.log_id(), err = %e, request_id, "connection load failed");
                let _ = pr.promise.send(Err(e));
                return;
            }
        };

        let versions = match self.versions.load() {
            Some(v) => v,
            // init always stores a table before publishing a connection.
            None => {
                let _ = pr
                    .promise
                    .send(Err(KaflinkError::Internal("versions missing after init".to_string())));
                return;
            }
        };

        let key = pr.req.api_key();
        let user_excluded = self
            .core
            .cfg
            .max_versions
            .as_ref()
            .is_some_and(|pins| !pins.has_key(key));
        if key < 0 || key > MAX_API_KEY || user_excluded {
            let _ = pr.promise.send(Err(KaflinkError::UnknownRequestKey(key)));
            return;
        }

        // A negotiated table with a negative entry means the broker
        // really cannot handle this key; an all-unknown sentinel table
        // means we never asked.
        if versions.is_negotiated() && versions.get(key) < 0 {
            let _ = pr.promise.send(Err(KaflinkError::BrokerTooOld { key }));
            return;
        }

        let mut our_max = pr.req.max_version();
        if let Some(pins) = &self.core.cfg.max_versions {
            if let Some(user_max) = pins.lookup(key) {
                if user_max < our_max {
                    our_max = user_max;
                }
            }
        }
        let mut version = our_max;
        let broker_max = versions.get(key);
        if broker_max >= 0 && broker_max < our_max {
            version = broker_max;
        }
        if let Some(pins) = &self.core.cfg.min_versions {
            if let Some(min) = pins.lookup(key) {
                if version < min {
                    let _ = pr.promise.send(Err(KaflinkError::BrokerTooOld { key }));
                    return;
                }
            }
        }

        // KIP-368: a lifetime-bounded session must reauthenticate before
        // the next write once its expiry passes. Short lifetimes can
        // expire again during the reauth itself; cap the attempts and
        // force a fresh connection past the cap.
        let mut reauthentications = 0u32;
        loop {
            match cxn.expiry() {
                None => break,
                Some(expiry) if Instant::now() <= expiry => break,
                Some(_) => {}
            }
            reauthentications += 1;
            if reauthentications > 15 {
                warn!(
                    broker = %self.meta.log_id(),
                    request_id,
                    "the broker has repeatedly given us short sasl lifetimes, killing the connection to retry on a new connection"
                );
                let _ = pr.promise.send(Err(KaflinkError::SaslReauthLoop));
                cxn.die();
                return;
            }
            debug!(broker = %self.meta.log_id(), request_id, "sasl expiry limit reached, reauthenticating");
            if let Err(e) = cxn.sasl(&request_id).await {
                cxn.die();
                let _ = pr.promise.send(Err(e));
                return;
            }
        }

        // The request may have waited in the queue or behind reauth;
        // check cancellation just before committing to the write.
        if pr.ctx.is_cancelled() {
            let _ = pr.promise.send(Err(KaflinkError::Cancelled));
            return;
        }

        // Produce requests carry the client's acks; with acks=0 no
        // response will ever arrive, so the promise is fulfilled with an
        // empty shell right after the write.
        let mut no_response = false;
        if key == KEY_PRODUCE {
            if let Some(produce) = pr.req.inner_any_mut().downcast_mut::<ProduceRequest>() {
                produce.acks = self.core.cfg.acks.to_i16();
                produce.timeout_ms = self.core.cfg.produce_timeout.as_millis() as i32;
                no_response = produce.acks == 0;
            }
        }

        let read_timeout = self.core.cfg.request_timeout_overhead
            + pr.req
                .timeout_millis()
                .map(|ms| Duration::from_millis(ms.max(0) as u64))
                .unwrap_or_default();

        match cxn
            .write_request(Some(&pr.ctx), pr.enqueued_at, pr.req.as_ref(), version)
            .await
        {
            Err(WriteError::BeforeIo(e)) => {
                // Nothing touched the socket (throttle-wait cancellation
                // or an encode failure); the connection stays alive.
                let _ = pr.promise.send(Err(e));
            }
            Err(WriteError::DuringIo(e)) => {
                let _ = pr.promise.send(Err(e));
                cxn.die();
            }
            Ok(out) => {
                if no_response {
                    cxn.hook_write_e2e(KEY_PRODUCE, out.metrics, None);
                    let _ = pr
                        .promise
                        .send(Ok(Box::new(ProduceResponse::default()) as Box<dyn Any + Send>));
                } else {
                    cxn.wait_resp(PendingResponse {
                        flexible_header: frame::response_header_is_flexible(key, version),
                        ctx: pr.ctx,
                        corr_id: out.corr_id,
                        request: pr.req,
                        version,
                        promise: pr.promise,
                        read_timeout,
                        write: out.metrics,
                    });
                }
            }
        }
    }

    /// Resolve the typed connection for `req`, dialing and initializing a
    /// fresh one when the slot is empty or its connection died.
    async fn load_connection(
        &self,
        ctx: &RequestContext,
        req: &dyn AnyRequest,
    ) -> Result<Arc<BrokerCxn>> {
        let kind = route(req);
        if let Some(cxn) = self.cxns.lock().get(kind) {
            if !cxn.is_dead() {
                return Ok(Arc::clone(cxn));
            }
        }

        let stream = self.connect(ctx).await?;
        let cxn = BrokerCxn::new(
            Arc::clone(&self.core),
            self.meta.clone(),
            self.addr.clone(),
            Arc::clone(&self.versions),
            stream,
        );
        if let Err(e) = cxn.init(kind == CxnKind::Produce, ctx.request_id()).await {
            debug!(
                addr = %self.addr,
                broker = %self.meta.log_id(),
                err = %e,
                request_id = ctx.request_id(),
                "connection initialization failed"
            );
            cxn.die();
            return Err(e);
        }

        if self.dead.load(Ordering::Acquire) {
            cxn.die();
            return Err(KaflinkError::ChosenBrokerDead);
        }
        self.cxns.lock().set(kind, Arc::clone(&cxn));
        Ok(cxn)
    }

    async fn connect(&self, ctx: &RequestContext) -> Result<TcpStream> {
        debug!(
            addr = %self.addr,
            broker = %self.meta.log_id(),
            request_id = ctx.request_id(),
            "opening connection to broker"
        );
        let start = Instant::now();
        let dial = async {
            match &self.core.cfg.dial_fn {
                Some(dial) => dial(self.addr.clone()).await,
                None => TcpStream::connect(&self.addr).await,
            }
        };
        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(KaflinkError::Cancelled),
            _ = self.core.shutdown.cancelled() => Err(KaflinkError::ClientClosed),
            io = tokio::time::timeout(self.core.cfg.dial_timeout, dial) => match io {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(KaflinkError::Timeout("dialing the broker")),
            },
        };
        let elapsed = start.elapsed();
        self.core
            .each_hook(|h| h.on_broker_connect(&self.meta, elapsed, result.as_ref().err()));

        match result {
            Ok(stream) => {
                debug!(addr = %self.addr, broker = %self.meta.log_id(), "connection opened to broker");
                Ok(stream)
            }
            Err(e) => {
                if !e.is_cancellation() {
                    warn!(
                        addr = %self.addr,
                        broker = %self.meta.log_id(),
                        err = %e,
                        "unable to open connection to broker"
                    );
                }
                Err(e)
            }
        }
    }

    /// Permanently disable this broker: fail everything queued, kill
    /// every connection. Idempotent.
    pub(crate) fn stop_forever(&self) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        for pr in self.reqs.die() {
            let _ = pr.promise.send(Err(KaflinkError::ChosenBrokerDead));
        }
        let slots = self.cxns.lock();
        for cxn in slots.iter() {
            cxn.die();
        }
    }

    /// Kill connections idle in both directions past `idle_timeout` with
    /// no I/O in flight. Produce connections can be write-busy with no
    /// reads and fetch connections read-pending with no writes, so both
    /// directions must be idle before reaping.
    pub(crate) fn reap_connections(&self, idle_timeout: Duration) -> usize {
        let now = self.core.nanos_since_start();
        let idle = idle_timeout.as_nanos() as i64;
        let slots = self.cxns.lock();
        let mut total = 0;
        for cxn in slots.iter() {
            if cxn.is_dead() {
                continue;
            }
            let write_idle = now - cxn.last_write_nanos() > idle && !cxn.is_writing();
            let read_idle = now - cxn.last_read_nanos() > idle && !cxn.is_reading();
            if write_idle && read_idle {
                cxn.die();
                total += 1;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::request::ErasedRequest;
    use kafka_protocol::messages::{
        CreateTopicsRequest, FetchRequest, JoinGroupRequest, MetadataRequest, SyncGroupRequest,
    };

    #[test]
    fn seed_ids_never_collide_with_real_ids() {
        assert_eq!(unknown_seed_id(0), i32::MIN);
        assert_eq!(unknown_seed_id(3), i32::MIN + 3);
        assert!(unknown_seed_id(1000) < UNKNOWN_CONTROLLER_ID);
    }

    #[test]
    fn log_id_renders_seeds() {
        assert_eq!(BrokerMetadata::new(3, "b", 9092, None).log_id(), "3");
        assert_eq!(
            BrokerMetadata::new(UNKNOWN_CONTROLLER_ID, "b", 9092, None).log_id(),
            "-1"
        );
        assert_eq!(BrokerMetadata::seed(2, "b", 9092).log_id(), "seed 2");
    }

    #[test]
    fn metadata_addr() {
        let meta = BrokerMetadata::new(0, "broker.example", 19092, None);
        assert_eq!(meta.addr(), "broker.example:19092");
    }

    #[test]
    fn routing_by_key_and_timeout_flag() {
        let produce = ErasedRequest::new(ProduceRequest::default());
        assert_eq!(route(&produce), CxnKind::Produce);

        let fetch = ErasedRequest::new(FetchRequest::default());
        assert_eq!(route(&fetch), CxnKind::Fetch);

        let join = ErasedRequest::new(JoinGroupRequest::default());
        assert_eq!(route(&join), CxnKind::Group);

        let sync = ErasedRequest::new(SyncGroupRequest::default());
        assert_eq!(route(&sync), CxnKind::Group);

        let create = ErasedRequest::new(CreateTopicsRequest::default());
        assert_eq!(route(&create), CxnKind::Slow);

        let metadata = ErasedRequest::new(MetadataRequest::default());
        assert_eq!(route(&metadata), CxnKind::Normal);
    }
}
