//! Client: broker registry, shutdown, and the connection reaper
//!
//! The client owns what every broker connection shares: configuration,
//! the shutdown signal, the frame-buffer pool, and a monotonic clock the
//! atomic reap/throttle timestamps count against. It also runs the single
//! reaper task that sweeps idle connections across all brokers.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::{Broker, BrokerMetadata};
use crate::config::ClientConfig;
use crate::error::{KaflinkError, Result};
use crate::hooks::Hook;
use crate::pool::BufferPool;

/// State shared by the client, its brokers, and their connections.
pub(crate) struct ClientCore {
    pub(crate) cfg: ClientConfig,
    pub(crate) shutdown: CancellationToken,
    pub(crate) buf_pool: BufferPool,
    clock: Instant,
}

impl ClientCore {
    fn new(cfg: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            shutdown: CancellationToken::new(),
            buf_pool: BufferPool::default(),
            clock: Instant::now(),
        })
    }

    /// Nanoseconds since client creation; the epoch for every atomic
    /// timestamp (reap bookkeeping, throttle deadlines).
    pub(crate) fn nanos_since_start(&self) -> i64 {
        self.clock.elapsed().as_nanos() as i64
    }

    /// Fire-and-forget hook dispatch.
    pub(crate) fn each_hook(&self, f: impl Fn(&dyn Hook)) {
        for hook in &self.cfg.hooks {
            f(hook.as_ref());
        }
    }
}

/// A Kafka client's broker connection layer.
///
/// Must be created inside a Tokio runtime; the reaper task is spawned at
/// construction.
pub struct Client {
    core: Arc<ClientCore>,
    brokers: Arc<Mutex<Vec<Arc<Broker>>>>,
    seeds: Vec<Arc<Broker>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build a client from `cfg`, creating one broker handle per seed
    /// address.
    pub fn new(cfg: ClientConfig) -> Result<Self> {
        let seed_addrs = cfg.seed_brokers.clone();
        let core = ClientCore::new(cfg);

        let mut seeds = Vec::with_capacity(seed_addrs.len());
        for (index, addr) in seed_addrs.iter().enumerate() {
            let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
                KaflinkError::Config(format!("seed broker {addr:?} is not host:port"))
            })?;
            let port: i32 = port.parse().map_err(|_| {
                KaflinkError::Config(format!("seed broker {addr:?} has an invalid port"))
            })?;
            seeds.push(Broker::new(
                Arc::clone(&core),
                BrokerMetadata::seed(index, host, port),
            ));
        }

        let brokers = Arc::new(Mutex::new(seeds.clone()));
        let reaper = tokio::spawn(reap_connections_loop(
            Arc::clone(&core),
            Arc::clone(&brokers),
        ));

        Ok(Self {
            core,
            brokers,
            seeds,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// The seed brokers, in configuration order.
    pub fn seed_brokers(&self) -> &[Arc<Broker>] {
        &self.seeds
    }

    /// The broker handle for `meta`, creating it on first use. Callers
    /// discover metadata through their own metadata layer and hand
    /// identities down here.
    pub fn broker(&self, meta: BrokerMetadata) -> Arc<Broker> {
        let mut brokers = self.brokers.lock();
        if let Some(existing) = brokers
            .iter()
            .find(|b| b.metadata().node_id == meta.node_id)
        {
            return Arc::clone(existing);
        }
        let broker = Broker::new(Arc::clone(&self.core), meta);
        brokers.push(Arc::clone(&broker));
        broker
    }

    /// Shut the client down: cancel everything in flight, fail queued
    /// requests with `ChosenBrokerDead`, and stop the reaper. Idempotent.
    pub fn close(&self) {
        if self.core.shutdown.is_cancelled() {
            return;
        }
        self.core.shutdown.cancel();
        for broker in self.brokers.lock().iter() {
            broker.stop_forever();
        }
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wake every `conn_idle_timeout` and kill connections that have been
/// idle in both directions past the threshold.
async fn reap_connections_loop(core: Arc<ClientCore>, brokers: Arc<Mutex<Vec<Arc<Broker>>>>) {
    let idle_timeout = core.cfg.conn_idle_timeout;
    if idle_timeout.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(idle_timeout);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // completes immediately
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let start = Instant::now();
                let snapshot: Vec<Arc<Broker>> = brokers.lock().clone();
                let mut reaped = 0;
                for broker in snapshot {
                    reaped += broker.reap_connections(idle_timeout);
                }
                if reaped > 0 {
                    debug!(num_reaped = reaped, reap_dur = ?start.elapsed(), "reaped connections");
                }
            }
        }
    }
}
