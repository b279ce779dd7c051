//! Broker-advertised api version tables
//!
//! Each broker advertises, per api key, the maximum version it speaks.
//! The table is loaded at most once per broker identity, on the first
//! connection's init, and shared by every connection to that broker.
//! Concurrent first connections may each load and store a table; the
//! contents are equivalent so the last writer wins harmlessly.

use kafka_protocol::messages::ApiVersionsResponse;
use parking_lot::RwLock;
use std::sync::Arc;

/// Highest api key tracked in a version table.
pub const MAX_API_KEY: i16 = 69;

/// Per-key broker maximum versions; `-1` means the broker does not
/// support (or never advertised) that key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerVersions {
    versions: [i16; (MAX_API_KEY + 1) as usize],
}

impl BrokerVersions {
    /// A table with every key unknown. Stored as-is when version
    /// negotiation is disabled by the user's version pins.
    pub fn unknown() -> Self {
        Self {
            versions: [-1; (MAX_API_KEY + 1) as usize],
        }
    }

    /// Build a table from an ApiVersions response, ignoring advertised
    /// keys outside `[0, MAX_API_KEY]`.
    pub fn from_response(resp: &ApiVersionsResponse) -> Self {
        let mut v = Self::unknown();
        for key in &resp.api_keys {
            if key.api_key < 0 || key.api_key > MAX_API_KEY {
                continue;
            }
            v.versions[key.api_key as usize] = key.max_version;
        }
        v
    }

    /// The broker's maximum version for `key`, or `-1` when unknown.
    pub fn get(&self, key: i16) -> i16 {
        if key < 0 || key > MAX_API_KEY {
            return -1;
        }
        self.versions[key as usize]
    }

    /// Whether negotiation actually ran. Key 0 (Produce) is advertised by
    /// every real broker, so a `-1` there means the table is the unknown
    /// sentinel.
    pub fn is_negotiated(&self) -> bool {
        self.versions[0] >= 0
    }

    #[cfg(test)]
    pub(crate) fn set(&mut self, key: i16, version: i16) {
        self.versions[key as usize] = version;
    }
}

/// The broker's shared version slot: empty until the first connection
/// negotiates (or stores the unknown sentinel).
#[derive(Debug, Default)]
pub(crate) struct VersionsSlot {
    inner: RwLock<Option<Arc<BrokerVersions>>>,
}

impl VersionsSlot {
    pub(crate) fn load(&self) -> Option<Arc<BrokerVersions>> {
        self.inner.read().clone()
    }

    pub(crate) fn store(&self, versions: BrokerVersions) {
        *self.inner.write() = Some(Arc::new(versions));
    }
}
