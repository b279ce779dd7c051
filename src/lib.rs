#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # kaflink
//!
//! The broker connection core of a Kafka protocol client: this crate
//! owns TCP connections to individual brokers, pipelines requests over
//! them with correlation-id matching, negotiates api versions, performs
//! SASL authentication with lifetime-driven reauthentication, honors
//! broker throttling, and reaps idle connections.
//!
//! It deliberately stops there. Record batching, partitioning, metadata
//! management, and consumer group coordination live in higher layers;
//! failures here surface upward for those layers to retry. Message
//! bodies are encoded and decoded by the `kafka-protocol` crate.
//!
//! ## Quick start
//!
//! ```no_run
//! use kaflink::{Client, ClientConfig};
//! use kafka_protocol::messages::MetadataRequest;
//!
//! #[tokio::main]
//! async fn main() -> kaflink::Result<()> {
//!     let client = Client::new(ClientConfig::new(["localhost:9092"]))?;
//!
//!     let seed = &client.seed_brokers()[0];
//!     let metadata = seed.request(MetadataRequest::default()).await?;
//!     println!("cluster has {} brokers", metadata.brokers.len());
//!
//!     client.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`client`]: broker registry, shutdown signal, idle-connection reaper
//! - [`broker`]: one request pump per broker, five typed connections,
//!   the connection itself (framed I/O, version negotiation, SASL,
//!   response matching, ack-0 discard)
//! - [`protocol`]: request framing, size-prefix validation, typed-request
//!   erasure, negotiated version tables
//! - [`sasl`]: PLAIN and SCRAM-SHA-256/512 client mechanisms
//! - [`hooks`]: connect/disconnect/read/write/E2E/throttle observability
//! - [`config`]: tunables and their defaults
//! - [`error`]: error types and the [`Result`] alias
//!
//! Ordering guarantees: within one connection, write order equals
//! correlation-id order equals response order, and any out-of-order
//! reply kills that connection. Across a broker's five connections, and
//! across brokers, there is no ordering.

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod pool;
pub mod protocol;
pub mod sasl;

pub use broker::{unknown_seed_id, Broker, BrokerMetadata, UNKNOWN_CONTROLLER_ID};
pub use client::Client;
pub use config::{Acks, ClientConfig, DialFn, VersionPins};
pub use error::{KaflinkError, ProtocolError, ReadSizeError, Result};
pub use hooks::{E2e, Hook};
pub use protocol::{BrokerVersions, ClientRequest, RequestContext, MAX_API_KEY};
