//! SASL/SCRAM-SHA-256 and SCRAM-SHA-512 (RFC 5802)
//!
//! Three-leg client flow: client-first carries the username and a fresh
//! nonce; the server-first challenge returns the combined nonce, salt,
//! and iteration count; client-final carries the proof computed from the
//! PBKDF2-salted password; the server-final message is verified against
//! the expected server signature before the session reports done.
//!
//! Channel binding is not negotiated (`n,,` / `c=biws`).

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{digest::KeyInit, Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::{KaflinkError, Result};

use super::{Mechanism, Session};

/// Smallest iteration count we will accept from a broker.
const MIN_ITERATIONS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScramHash {
    Sha256,
    Sha512,
}

/// SCRAM credentials for one of the two SHA-2 mechanisms.
pub struct Scram {
    username: String,
    password: Zeroizing<String>,
    hash: ScramHash,
}

impl Scram {
    /// SCRAM-SHA-256 credentials
    pub fn sha256(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
            hash: ScramHash::Sha256,
        }
    }

    /// SCRAM-SHA-512 credentials
    pub fn sha512(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
            hash: ScramHash::Sha512,
        }
    }

    fn start(&self, nonce: String) -> (ScramSession, Vec<u8>) {
        let bare = format!("n={},r={}", saslname(&self.username), nonce);
        let first = format!("n,,{bare}");
        let session = ScramSession {
            hash: self.hash,
            password: self.password.clone(),
            state: State::ClientFirstSent { bare, nonce },
        };
        (session, first.into_bytes())
    }
}

#[async_trait]
impl Mechanism for Scram {
    fn name(&self) -> &'static str {
        match self.hash {
            ScramHash::Sha256 => "SCRAM-SHA-256",
            ScramHash::Sha512 => "SCRAM-SHA-512",
        }
    }

    async fn authenticate(&self, _addr: &str) -> Result<(Box<dyn Session>, Vec<u8>)> {
        let mut raw = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut raw);
        let (session, first) = self.start(URL_SAFE_NO_PAD.encode(raw));
        Ok((Box::new(session), first))
    }
}

enum State {
    ClientFirstSent { bare: String, nonce: String },
    AwaitingServerFinal { expected_signature: Vec<u8> },
    Done,
}

struct ScramSession {
    hash: ScramHash,
    password: Zeroizing<String>,
    state: State,
}

impl Session for ScramSession {
    fn challenge(&mut self, challenge: &[u8]) -> Result<(bool, Vec<u8>)> {
        match std::mem::replace(&mut self.state, State::Done) {
            State::ClientFirstSent { bare, nonce } => {
                let (reply, expected_signature) = self.client_final(&bare, &nonce, challenge)?;
                self.state = State::AwaitingServerFinal { expected_signature };
                Ok((false, reply))
            }
            State::AwaitingServerFinal { expected_signature } => {
                verify_server_final(challenge, &expected_signature)?;
                Ok((true, Vec::new()))
            }
            State::Done => Err(KaflinkError::sasl("challenge after scram exchange completed")),
        }
    }
}

impl ScramSession {
    fn client_final(
        &self,
        bare: &str,
        client_nonce: &str,
        challenge: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let server_first = std::str::from_utf8(challenge)
            .map_err(|_| KaflinkError::sasl("server-first message is not UTF-8"))?;

        let mut combined_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for field in server_first.split(',') {
            match field.split_once('=') {
                Some(("r", v)) => combined_nonce = Some(v.to_string()),
                Some(("s", v)) => {
                    salt = Some(BASE64.decode(v).map_err(|_| {
                        KaflinkError::sasl("server-first salt is not valid base64")
                    })?)
                }
                Some(("i", v)) => {
                    iterations = Some(v.parse::<u32>().map_err(|_| {
                        KaflinkError::sasl("server-first iteration count is not a number")
                    })?)
                }
                _ => {}
            }
        }
        let combined_nonce = combined_nonce
            .ok_or_else(|| KaflinkError::sasl("server-first message missing nonce"))?;
        let salt = salt.ok_or_else(|| KaflinkError::sasl("server-first message missing salt"))?;
        let iterations = iterations
            .ok_or_else(|| KaflinkError::sasl("server-first message missing iterations"))?;

        if !combined_nonce.starts_with(client_nonce) {
            return Err(KaflinkError::sasl("server nonce does not extend client nonce"));
        }
        if iterations < MIN_ITERATIONS {
            return Err(KaflinkError::sasl(format!(
                "server requested {iterations} iterations, below the minimum {MIN_ITERATIONS}"
            )));
        }

        let without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!("{bare},{server_first},{without_proof}");

        let (proof, server_signature) = match self.hash {
            ScramHash::Sha256 => {
                let mut salted = vec![0u8; 32];
                pbkdf2_hmac::<Sha256>(self.password.as_bytes(), &salt, iterations, &mut salted);
                proof_and_server_signature::<Sha256, Hmac<Sha256>>(&salted, &auth_message)?
            }
            ScramHash::Sha512 => {
                let mut salted = vec![0u8; 64];
                pbkdf2_hmac::<Sha512>(self.password.as_bytes(), &salt, iterations, &mut salted);
                proof_and_server_signature::<Sha512, Hmac<Sha512>>(&salted, &auth_message)?
            }
        };

        let reply = format!("{without_proof},p={}", BASE64.encode(proof));
        Ok((reply.into_bytes(), server_signature))
    }
}

fn verify_server_final(challenge: &[u8], expected: &[u8]) -> Result<()> {
    let server_final = std::str::from_utf8(challenge)
        .map_err(|_| KaflinkError::sasl("server-final message is not UTF-8"))?;
    if let Some(err) = server_final.strip_prefix("e=") {
        return Err(KaflinkError::sasl(format!("server rejected authentication: {err}")));
    }
    let signature = server_final
        .strip_prefix("v=")
        .ok_or_else(|| KaflinkError::sasl("server-final message missing signature"))?;
    let signature = BASE64
        .decode(signature)
        .map_err(|_| KaflinkError::sasl("server signature is not valid base64"))?;
    if signature != expected {
        return Err(KaflinkError::sasl("server signature verification failed"));
    }
    Ok(())
}

/// ClientKey → StoredKey → ClientProof, plus the ServerSignature we expect
/// back in the server-final message.
fn proof_and_server_signature<D: Digest, M: Mac + KeyInit>(
    salted: &[u8],
    auth_message: &str,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let client_key = mac_over::<M>(salted, b"Client Key")?;
    let stored_key = D::digest(&client_key);
    let client_signature = mac_over::<M>(stored_key.as_slice(), auth_message.as_bytes())?;
    let proof: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(k, s)| k ^ s)
        .collect();

    let server_key = mac_over::<M>(salted, b"Server Key")?;
    let server_signature = mac_over::<M>(&server_key, auth_message.as_bytes())?;
    Ok((proof, server_signature))
}

fn mac_over<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| KaflinkError::sasl("invalid hmac key length"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Escape `=` and `,` in a saslname per RFC 5802.
fn saslname(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '=' => out.push_str("=3D"),
            ',' => out.push_str("=2C"),
            _ => out.push(c),
        }
    }
    out
}
