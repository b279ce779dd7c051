//! Client-side SASL mechanisms
//!
//! A [`Mechanism`] produces a [`Session`] and the first client-write
//! bytes; the connection then shuttles challenge/response bytes until the
//! session reports completion. Whether those bytes travel inside
//! SASLAuthenticate requests or as raw length-prefixed frames is the
//! connection's concern, not the mechanism's.

mod plain;
mod scram;

pub use plain::Plain;
pub use scram::Scram;

use async_trait::async_trait;

use crate::error::Result;

/// An in-progress authentication exchange.
pub trait Session: Send {
    /// Process a server challenge, returning whether the exchange is done
    /// and the next client write (possibly empty).
    fn challenge(&mut self, challenge: &[u8]) -> Result<(bool, Vec<u8>)>;
}

/// A SASL mechanism the client can offer.
#[async_trait]
pub trait Mechanism: Send + Sync {
    /// Mechanism name as advertised to the broker (e.g. `PLAIN`,
    /// `SCRAM-SHA-256`).
    fn name(&self) -> &'static str;

    /// Begin authentication against `addr`, returning the session and the
    /// first client-write bytes.
    async fn authenticate(&self, addr: &str) -> Result<(Box<dyn Session>, Vec<u8>)>;
}
