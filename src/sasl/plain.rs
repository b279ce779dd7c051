//! SASL/PLAIN
//!
//! Single-shot mechanism: the whole credential travels in the first
//! client write as `\0username\0password`. The password is held in a
//! `Zeroizing` wrapper so it is erased once the mechanism is dropped.

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::Result;

use super::{Mechanism, Session};

/// SASL/PLAIN credentials.
pub struct Plain {
    username: String,
    password: Zeroizing<String>,
}

impl Plain {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }
}

struct PlainSession;

impl Session for PlainSession {
    fn challenge(&mut self, _challenge: &[u8]) -> Result<(bool, Vec<u8>)> {
        Ok((true, Vec::new()))
    }
}

#[async_trait]
impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    async fn authenticate(&self, _addr: &str) -> Result<(Box<dyn Session>, Vec<u8>)> {
        let mut first = Vec::with_capacity(2 + self.username.len() + self.password.len());
        first.push(0); // authzid left empty
        first.extend_from_slice(self.username.as_bytes());
        first.push(0);
        first.extend_from_slice(self.password.as_bytes());
        Ok((Box::new(PlainSession), first))
    }
}
