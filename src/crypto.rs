//! RSA handshake primitives, AES-256-GCM sealing, and SPKI fingerprinting.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::pss::{SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::ChatError;

const RSA_BITS: usize = 2048;
pub const SESSION_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Server identity: RSA keypair loaded (or generated and persisted) at startup, plus the
/// derived SPKI fingerprint clients pin on first use.
pub struct ServerIdentity {
    private_key: RsaPrivateKey,
    public_der: Vec<u8>,
    pub fingerprint: String,
}

impl ServerIdentity {
    /// Load the keypair from `key_dir`, generating and persisting a fresh 2048-bit RSA
    /// keypair if none exists yet. Mirrors the teacher's `IdentityManager::generate_identity`
    /// load-or-create shape.
    pub fn load_or_generate(key_dir: &str) -> Result<Self, ChatError> {
        let dir = Path::new(key_dir);
        std::fs::create_dir_all(dir).map_err(|e| ChatError::Fatal(e.to_string()))?;
        let priv_path = dir.join("rsa_private.der");
        let pub_path = dir.join("rsa_public.der");

        let private_key = if priv_path.exists() {
            let bytes = std::fs::read(&priv_path).map_err(|e| ChatError::Fatal(e.to_string()))?;
            let key = RsaPrivateKey::from_pkcs8_der(&bytes)
                .map_err(|e| ChatError::Fatal(format!("invalid stored RSA key: {e}")))?;
            tracing::info!(key_dir = %key_dir, "loaded existing RSA keypair");
            key
        } else {
            let key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
                .map_err(|e| ChatError::Fatal(format!("RSA keygen failed: {e}")))?;
            let der = key
                .to_pkcs8_der()
                .map_err(|e| ChatError::Fatal(e.to_string()))?;
            std::fs::write(&priv_path, der.as_bytes()).map_err(|e| ChatError::Fatal(e.to_string()))?;
            tracing::info!(key_dir = %key_dir, "generated new RSA keypair");
            key
        };

        let public_key = RsaPublicKey::from(&private_key);
        let public_der = public_key
            .to_public_key_der()
            .map_err(|e| ChatError::Fatal(e.to_string()))?
            .as_bytes()
            .to_vec();
        if !pub_path.exists() {
            std::fs::write(&pub_path, &public_der).map_err(|e| ChatError::Fatal(e.to_string()))?;
        }

        let fingerprint = fingerprint_of(&public_der);
        Ok(Self {
            private_key,
            public_der,
            fingerprint,
        })
    }

    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    /// RSA-OAEP(SHA-256) decrypt, used to unwrap nothing server-side today (the server only
    /// ever *wraps*, never receives wrapped data) but kept symmetric with `oaep_encrypt` for
    /// completeness and testability.
    pub fn oaep_decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ChatError> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|_| ChatError::Crypto)
    }

    /// RSA-PSS(SHA-256, salt 32) sign over the raw session key bytes.
    pub fn pss_sign(&self, message: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signing_key.sign_with_rng(&mut OsRng, message);
        signature.to_bytes().to_vec()
    }
}

/// RSA-OAEP(SHA-256) encrypt `plaintext` to the holder of `client_key_der` (a DER-encoded
/// SubjectPublicKeyInfo, as received in a `SESSION_INIT` frame's `client_key`).
pub fn oaep_encrypt(client_key_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, ChatError> {
    let public_key =
        RsaPublicKey::from_public_key_der(client_key_der).map_err(|_| ChatError::Crypto)?;
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|_| ChatError::Crypto)
}

/// Verify an RSA-PSS(SHA-256) signature against a DER-encoded SubjectPublicKeyInfo. Exposed
/// mainly for tests that play the client role end-to-end.
pub fn pss_verify(server_pubkey_der: &[u8], message: &[u8], signature: &[u8]) -> Result<(), ChatError> {
    let public_key =
        RsaPublicKey::from_public_key_der(server_pubkey_der).map_err(|_| ChatError::Crypto)?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = rsa::pss::Signature::try_from(signature).map_err(|_| ChatError::Crypto)?;
    verifying_key
        .verify(message, &sig)
        .map_err(|_| ChatError::Crypto)
}

/// Lowercase hex SHA-256 of a DER-encoded SubjectPublicKeyInfo.
pub fn fingerprint_of(public_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_der);
    hex::encode(hasher.finalize())
}

/// Generate a fresh random 32-byte session key.
pub fn generate_session_key() -> [u8; SESSION_KEY_LEN] {
    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Build an outbound nonce: 8 bytes big-endian nanosecond timestamp || 4 bytes of randomness.
pub fn build_nonce(now_ns: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&now_ns.to_be_bytes());
    OsRng.fill_bytes(&mut nonce[8..]);
    nonce
}

/// AES-256-GCM seal; returns ciphertext with the 16-byte tag appended.
pub fn aead_seal(
    key: &[u8; SESSION_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, ChatError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(ChatError::from)
}

/// AES-256-GCM open; fails with `ChatError::Crypto` on tag mismatch.
pub fn aead_open(
    key: &[u8; SESSION_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, ChatError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(ChatError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aead_round_trip() {
        let key = generate_session_key();
        let nonce = build_nonce(12345);
        let plaintext = b"HELLO";

        let sealed = aead_seal(&key, &nonce, plaintext).unwrap();
        let opened = aead_open(&key, &nonce, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_aead_tamper_fails() {
        let key = generate_session_key();
        let nonce = build_nonce(1);
        let mut sealed = aead_seal(&key, &nonce, b"hi").unwrap();
        *sealed.last_mut().unwrap() ^= 0xFF;
        assert!(aead_open(&key, &nonce, &sealed).is_err());
    }

    #[test]
    fn test_handshake_round_trip() {
        let tmp = tempdir();
        let server = ServerIdentity::load_or_generate(tmp.to_str().unwrap()).unwrap();

        // Simulate a client keypair to wrap to.
        let client_priv = RsaPrivateKey::new(&mut OsRng, RSA_BITS).unwrap();
        let client_pub = RsaPublicKey::from(&client_priv);
        let client_pub_der = client_pub.to_public_key_der().unwrap().as_bytes().to_vec();

        let session_key = generate_session_key();
        let wrapped = oaep_encrypt(&client_pub_der, &session_key).unwrap();
        let signature = server.pss_sign(&session_key);

        // Client side: unwrap with its own private key, verify signature against server's pubkey.
        let unwrapped = client_priv
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .unwrap();
        assert_eq!(unwrapped, session_key);

        pss_verify(server.public_der(), &session_key, &signature).unwrap();

        let fp = fingerprint_of(server.public_der());
        assert_eq!(fp, server.fingerprint);
        assert_eq!(fp.len(), 64);
    }

    #[test]
    fn test_signature_rejects_tampered_message() {
        let tmp = tempdir();
        let server = ServerIdentity::load_or_generate(tmp.to_str().unwrap()).unwrap();
        let session_key = generate_session_key();
        let signature = server.pss_sign(&session_key);

        let mut other_key = session_key;
        other_key[0] ^= 1;
        assert!(pss_verify(server.public_der(), &other_key, &signature).is_err());
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "chat-core-test-{}-{}",
            std::process::id(),
            OsRng.next_u64()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
