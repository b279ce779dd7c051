//! Kafka wire protocol adapter
//!
//! Message bodies are encoded and decoded by the `kafka-protocol` crate;
//! this module owns everything around them: request framing, the response
//! length prefix (with hints for HTTP/TLS port mistakes), the flexible
//! response-header quirk, typed-request erasure for the pump, and the
//! per-broker negotiated version table.

pub mod frame;
pub mod request;
pub mod versions;

pub use request::{ClientRequest, RequestContext};
pub use versions::{BrokerVersions, MAX_API_KEY};

/// Api key of the Produce request
pub(crate) const KEY_PRODUCE: i16 = 0;
/// Api key of the Fetch request
pub(crate) const KEY_FETCH: i16 = 1;
/// Api key of the JoinGroup request
pub(crate) const KEY_JOIN_GROUP: i16 = 11;
/// Api key of the SyncGroup request
pub(crate) const KEY_SYNC_GROUP: i16 = 14;
/// Api key of the SaslHandshake request
pub(crate) const KEY_SASL_HANDSHAKE: i16 = 17;
/// Api key of the ApiVersions request
pub(crate) const KEY_API_VERSIONS: i16 = 18;
/// Api key of the SaslAuthenticate request
pub(crate) const KEY_SASL_AUTHENTICATE: i16 = 36;

/// Kafka error code for UNSUPPORTED_VERSION
pub(crate) const ERROR_UNSUPPORTED_VERSION: i16 = 35;
/// Kafka error code for UNSUPPORTED_SASL_MECHANISM
pub(crate) const ERROR_UNSUPPORTED_SASL_MECHANISM: i16 = 33;
