// src/core/protocol/scram.rs

//! Client side of SCRAM-SHA-256 (RFC 5802 / RFC 7677) without channel binding.

use crate::core::PoolError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// base64("n,,"): no channel binding, no authzid.
const CHANNEL_BINDING: &str = "biws";
const NONCE_LEN: usize = 18;

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], PoolError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| PoolError::Protocol(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// PBKDF2-HMAC-SHA256 with a single output block, which is all SCRAM needs.
fn salted_password(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32], PoolError> {
    let mut first = Vec::with_capacity(salt.len() + 4);
    first.extend_from_slice(salt);
    first.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac(password, &first)?;
    let mut out = u;
    for _ in 1..iterations {
        u = hmac(password, &u)?;
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    Ok(out)
}

#[derive(Debug)]
enum Stage {
    Initial,
    /// Waiting for the server's final message.
    Final { server_signature: [u8; 32] },
    Done,
}

/// Drives one SCRAM-SHA-256 exchange.
#[derive(Debug)]
pub struct ScramClient {
    password: String,
    client_first_bare: String,
    nonce: String,
    stage: Stage,
}

impl ScramClient {
    /// Starts an exchange with a random nonce. The server takes the user name from the
    /// startup packet, so it is left empty in the SCRAM messages.
    pub fn new(password: &str) -> Self {
        let mut raw = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        Self::with_nonce("", password, &STANDARD.encode(raw))
    }

    pub fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_first_bare: format!("n={user},r={nonce}"),
            nonce: nonce.to_string(),
            stage: Stage::Initial,
        }
    }

    /// The `client-first-message`.
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consumes the `server-first-message` and returns the `client-final-message`.
    pub fn handle_server_first(&mut self, message: &[u8]) -> Result<Vec<u8>, PoolError> {
        if !matches!(self.stage, Stage::Initial) {
            return Err(PoolError::Protocol("unexpected SCRAM server-first message".into()));
        }
        let server_first = std::str::from_utf8(message)
            .map_err(|_| PoolError::Protocol("SCRAM server-first is not UTF-8".into()))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            match part.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(v),
                Some(("i", v)) => iterations = v.parse::<u32>().ok(),
                _ => {}
            }
        }
        let (Some(nonce), Some(salt), Some(iterations)) = (nonce, salt, iterations) else {
            return Err(PoolError::Protocol(format!(
                "malformed SCRAM server-first message '{server_first}'"
            )));
        };
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(PoolError::Protocol("SCRAM server nonce mismatch".into()));
        }
        if iterations == 0 {
            return Err(PoolError::Protocol("SCRAM iteration count is zero".into()));
        }
        let salt = STANDARD
            .decode(salt)
            .map_err(|e| PoolError::Protocol(format!("SCRAM salt is not base64: {e}")))?;

        let salted = salted_password(self.password.as_bytes(), &salt, iterations)?;
        let client_key = hmac(&salted, b"Client Key")?;
        let mut stored_key = [0u8; 32];
        stored_key.copy_from_slice(&Sha256::digest(client_key));

        let without_proof = format!("c={CHANNEL_BINDING},r={nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        let server_key = hmac(&salted, b"Server Key")?;
        let server_signature = hmac(&server_key, auth_message.as_bytes())?;
        self.stage = Stage::Final { server_signature };

        Ok(format!("{without_proof},p={}", STANDARD.encode(proof)).into_bytes())
    }

    /// Verifies the `server-final-message`.
    pub fn handle_server_final(&mut self, message: &[u8]) -> Result<(), PoolError> {
        let Stage::Final { server_signature } = self.stage else {
            return Err(PoolError::Protocol("unexpected SCRAM server-final message".into()));
        };
        let server_final = std::str::from_utf8(message)
            .map_err(|_| PoolError::Protocol("SCRAM server-final is not UTF-8".into()))?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(PoolError::Connect(format!("SCRAM authentication failed: {err}")));
        }
        let verifier = server_final
            .strip_prefix("v=")
            .and_then(|v| STANDARD.decode(v.split(',').next().unwrap_or(v)).ok())
            .ok_or_else(|| PoolError::Protocol("malformed SCRAM server-final message".into()))?;
        if verifier != server_signature {
            return Err(PoolError::Connect("SCRAM server signature mismatch".into()));
        }
        self.stage = Stage::Done;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        matches!(self.stage, Stage::Done)
    }
}
