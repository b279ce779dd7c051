//! Observability hooks
//!
//! Hooks are optional callbacks fired at connection and request
//! boundaries: dial, disconnect, per-frame write/read, end-to-end request
//! timings, and broker-signalled throttling. Every invocation is
//! fire-and-forget from inside a pump or response worker, so
//! implementations must return quickly and must not block.

use std::time::Duration;

use crate::broker::BrokerMetadata;
use crate::error::KaflinkError;

/// End-to-end timings and byte counts for one request.
///
/// `write_wait` is the time a request spent queued before its socket write
/// began; `read_wait` is the time between the write finishing and the
/// response read beginning.
#[derive(Debug, Default, Clone, Copy)]
pub struct E2e {
    pub bytes_written: usize,
    pub bytes_read: usize,
    pub write_wait: Duration,
    pub time_to_write: Duration,
    pub read_wait: Duration,
    pub time_to_read: Duration,
}

/// Callbacks observing broker connection activity.
///
/// All methods have no-op defaults; implement only the ones you need.
pub trait Hook: Send + Sync {
    /// A dial attempt finished, successfully or not.
    fn on_broker_connect(
        &self,
        _meta: &BrokerMetadata,
        _dial_duration: Duration,
        _err: Option<&KaflinkError>,
    ) {
    }

    /// A connection was closed.
    fn on_broker_disconnect(&self, _meta: &BrokerMetadata) {}

    /// A request frame was written (or the write failed).
    fn on_broker_write(
        &self,
        _meta: &BrokerMetadata,
        _key: i16,
        _bytes_written: usize,
        _write_wait: Duration,
        _time_to_write: Duration,
        _err: Option<&KaflinkError>,
    ) {
    }

    /// A response frame was read (or the read failed).
    fn on_broker_read(
        &self,
        _meta: &BrokerMetadata,
        _key: i16,
        _bytes_read: usize,
        _read_wait: Duration,
        _time_to_read: Duration,
        _err: Option<&KaflinkError>,
    ) {
    }

    /// A request finished its full write/read round trip (or died trying).
    fn on_broker_e2e(&self, _meta: &BrokerMetadata, _key: i16, _e2e: &E2e, _err: Option<&KaflinkError>) {
    }

    /// The broker asked us to throttle. When `throttled_after_response` is
    /// true the client delays its next write on that connection; otherwise
    /// the broker already applied the delay itself.
    fn on_broker_throttle(
        &self,
        _meta: &BrokerMetadata,
        _interval: Duration,
        _throttled_after_response: bool,
    ) {
    }
}
