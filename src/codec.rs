//! JSON frame codec: `SESSION_INIT` handshake frames and `SECURE_MSG` encrypted envelopes.
//!
//! Grounded on the teacher's `EcnpCodec`: a constructor-free unit struct namespacing
//! `encode`/`decode` associated functions, each returning `Result<_, ChatError>`. The wire
//! shape itself is JSON rather than ECNP's binary TLV, since the spec mandates JSON frames.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::NONCE_LEN;
use crate::error::ChatError;

/// Hard cap on outbound frame size, per spec §6.
pub const MAX_FRAME_BYTES: usize = 60 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "SESSION_INIT")]
    SessionInit(SessionInitFrame),
    #[serde(rename = "SECURE_MSG")]
    SecureMsg(SecureMsgFrame),
    /// Unsolicited, unencrypted error — used only for `NO_SESSION` (spec §4.3 step 1), where by
    /// definition there is no session key to encrypt a reply with.
    #[serde(rename = "ERROR")]
    ClearError(ClearErrorFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearErrorFrame {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionInitFrame {
    Client {
        client_key: String,
    },
    Server {
        session_id: String,
        encrypted_key: String,
        signature: String,
        server_pubkey: String,
        fingerprint: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureMsgFrame {
    pub session_id: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Inner plaintext payload, carried inside a `SECURE_MSG` envelope once AEAD-opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_data")]
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
}

fn default_data() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl InnerPayload {
    pub fn new(kind: &str, data: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            msg_id: None,
        }
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }
}

/// Wire codec for the two outer frame shapes. Stateless; all functions are associated.
pub struct FrameCodec;

impl FrameCodec {
    /// Parse one datagram's worth of bytes into a `Frame`. Rejects frames over the 60 KiB cap.
    pub fn decode(data: &[u8]) -> Result<Frame, ChatError> {
        if data.len() > MAX_FRAME_BYTES {
            return Err(ChatError::Protocol("frame exceeds 60 KiB cap".into()));
        }
        serde_json::from_slice(data).map_err(ChatError::from)
    }

    pub fn encode(frame: &Frame) -> Result<Vec<u8>, ChatError> {
        let bytes = serde_json::to_vec(frame).map_err(ChatError::from)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ChatError::Protocol("encoded frame exceeds 60 KiB cap".into()));
        }
        Ok(bytes)
    }

    pub fn decode_inner(plaintext: &[u8]) -> Result<InnerPayload, ChatError> {
        serde_json::from_slice(plaintext).map_err(ChatError::from)
    }

    pub fn encode_inner(payload: &InnerPayload) -> Result<Vec<u8>, ChatError> {
        serde_json::to_vec(payload).map_err(ChatError::from)
    }

    /// Build a `SECURE_MSG` frame: seal `inner` with `key`/`nonce`, hex-encode both nonce and
    /// ciphertext‖tag.
    pub fn build_secure_msg(
        session_id: &str,
        key: &[u8; crate::crypto::SESSION_KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        inner: &InnerPayload,
    ) -> Result<Frame, ChatError> {
        let plaintext = Self::encode_inner(inner)?;
        let sealed = crate::crypto::aead_seal(key, nonce, &plaintext)?;
        Ok(Frame::SecureMsg(SecureMsgFrame {
            session_id: session_id.to_string(),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(sealed),
        }))
    }

    /// Open a `SECURE_MSG` frame's ciphertext with `key`, returning the inner payload.
    pub fn open_secure_msg(
        frame: &SecureMsgFrame,
        key: &[u8; crate::crypto::SESSION_KEY_LEN],
    ) -> Result<(InnerPayload, [u8; NONCE_LEN]), ChatError> {
        let nonce_bytes = hex::decode(&frame.nonce).map_err(|_| ChatError::Crypto)?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| ChatError::Protocol("nonce must be 12 bytes".into()))?;
        let ciphertext = hex::decode(&frame.ciphertext).map_err(|_| ChatError::Crypto)?;
        let plaintext = crate::crypto::aead_open(key, &nonce, &ciphertext)?;
        let inner = Self::decode_inner(&plaintext)?;
        Ok((inner, nonce))
    }
}

/// Build an outbound nonce: 8 bytes big-endian nanosecond timestamp || 4 bytes randomness.
pub fn new_outbound_nonce() -> [u8; NONCE_LEN] {
    let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    crate::crypto::build_nonce(now_ns)
}

/// Generate an opaque random `msg_id` for reliable-dispatch bookkeeping.
pub fn new_msg_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
