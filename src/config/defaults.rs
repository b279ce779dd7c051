//! Default values for client configuration

use std::time::Duration;

/// Client id reported in request headers
pub const DEFAULT_CLIENT_ID: &str = "kaflink";

/// Software name reported in ApiVersionsRequest v3+
pub const DEFAULT_SOFTWARE_NAME: &str = "kaflink";

/// Software version reported in ApiVersionsRequest v3+
pub const DEFAULT_SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time allowed for a dial to complete
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Overhead granted on top of a request's own timeout for reads, and the
/// write deadline for every request
pub const DEFAULT_REQUEST_TIMEOUT_OVERHEAD: Duration = Duration::from_secs(10);

/// Timeout written into produce requests
pub const DEFAULT_PRODUCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle threshold after which the reaper closes a connection
pub const DEFAULT_CONN_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Ceiling on a single response frame (100 MiB)
pub const DEFAULT_MAX_BROKER_READ_BYTES: i32 = 100 * 1024 * 1024;
