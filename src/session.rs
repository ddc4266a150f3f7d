//! Handshake-and-session state machine (C4): HANDSHAKEN/ACTIVE/EXPIRED, session index,
//! replay-nonce admission, idle sweeper, session merge.
//!
//! Direct generalization of the teacher's `SessionManager` in `session.rs`: same
//! `HashMap`-keyed-by-session-id shape, same `SessionState` enum pattern, same
//! `tracing::info!` instrumentation on transitions — but handshake key agreement is RSA-OAEP
//! wrap instead of X25519 ECDH, and replay protection is the persisted `(session_id, nonce)`
//! table (C2) instead of a monotonic AEAD counter.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::codec::{Frame, FrameCodec, SecureMsgFrame, SessionInitFrame};
use crate::crypto::{self, ServerIdentity, SESSION_KEY_LEN};
use crate::error::ChatError;
use crate::repo::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaken,
    Active,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Handshaken => write!(f, "handshaken"),
            SessionState::Active => write!(f, "active"),
        }
    }
}

/// In-memory session record. The persistent `sessions` row (C2) remains the system of record
/// for `user_id`/`session_key`/timestamps; this struct caches the decoded key and the
/// handshake-state for fast path admission without round-tripping to SQLite per frame.
#[derive(Clone)]
pub struct Session {
    pub db_id: i64,
    pub session_id: String,
    pub user_id: Option<i64>,
    pub session_key: [u8; SESSION_KEY_LEN],
    pub remote_addr: String,
    pub state: SessionState,
    /// The room this session last joined/created, for `STATUS{user,room}` replies. Ephemeral —
    /// not persisted, since it is a view convenience rather than an owned entity.
    pub current_room: Option<String>,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    repo: Arc<Repository>,
    identity: Arc<ServerIdentity>,
}

impl SessionManager {
    pub fn new(repo: Arc<Repository>, identity: Arc<ServerIdentity>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            repo,
            identity,
        }
    }

    /// Handle a client `SESSION_INIT{client_key}`: mint a session key, wrap+sign it, persist
    /// the session row, and build the server's reply frame.
    pub async fn handshake(
        &self,
        client_key_b64: &str,
        remote_addr: &str,
    ) -> Result<Frame, ChatError> {
        use base64::Engine;
        let client_key_der = base64::engine::general_purpose::STANDARD
            .decode(client_key_b64)
            .map_err(|_| ChatError::Protocol("invalid base64 client_key".into()))?;

        let session_key = crypto::generate_session_key();
        let encrypted_key = crypto::oaep_encrypt(&client_key_der, &session_key)?;
        let signature = self.identity.pss_sign(&session_key);

        let session_id = uuid::Uuid::new_v4().to_string();
        let key_hex = hex::encode(session_key);
        let row = self
            .repo
            .create_session(&session_id, &key_hex, remote_addr)?;

        let session = Session {
            db_id: row.id,
            session_id: session_id.clone(),
            user_id: None,
            session_key,
            remote_addr: remote_addr.to_string(),
            state: SessionState::Handshaken,
            current_room: None,
        };
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session);

        tracing::info!(session_id = %session_id, remote_addr = %remote_addr, "session handshaken");

        Ok(Frame::SessionInit(SessionInitFrame::Server {
            session_id,
            encrypted_key: hex::encode(encrypted_key),
            signature: hex::encode(signature),
            server_pubkey: hex::encode(self.identity.public_der()),
            fingerprint: self.identity.fingerprint.clone(),
        }))
    }

    /// Admit a `SECURE_MSG` frame per §4.3: session lookup, nonce insert, AEAD open. Returns
    /// the decrypted inner payload plus the admitting session's current snapshot. Never
    /// returns `CryptoError`/`ReplayError` details beyond the variant — callers must not reply.
    pub async fn admit(
        &self,
        frame: &SecureMsgFrame,
        remote_addr: &str,
    ) -> Result<(crate::codec::InnerPayload, Session), ChatError> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&frame.session_id)
                .cloned()
                .ok_or_else(|| ChatError::NotFound("no such session".into()))?
        };

        if !self.repo.insert_nonce(session.db_id, &frame.nonce)? {
            return Err(ChatError::Replay);
        }

        let (inner, _nonce) = FrameCodec::open_secure_msg(frame, &session.session_key)?;

        self.repo.touch_session(&session.session_id, remote_addr)?;
        {
            let mut sessions = self.sessions.write().await;
            if let Some(s) = sessions.get_mut(&frame.session_id) {
                s.remote_addr = remote_addr.to_string();
                s.state = SessionState::Active;
            }
        }

        tracing::debug!(session_id = %session.session_id, kind = %inner.kind, "frame admitted");
        Ok((inner, session))
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn bind_user(&self, session_id: &str, user_id: i64) -> Result<(), ChatError> {
        self.repo.bind_user(session_id, user_id)?;
        if let Some(s) = self.sessions.write().await.get_mut(session_id) {
            s.user_id = Some(user_id);
        }
        Ok(())
    }

    pub async fn clear_user(&self, session_id: &str) -> Result<(), ChatError> {
        self.repo.clear_user(session_id)?;
        if let Some(s) = self.sessions.write().await.get_mut(session_id) {
            s.user_id = None;
        }
        Ok(())
    }

    /// Record the room this session most recently joined/created, for `STATUS` replies.
    pub async fn set_current_room(&self, session_id: &str, room_id: &str) {
        if let Some(s) = self.sessions.write().await.get_mut(session_id) {
            s.current_room = Some(room_id.to_string());
        }
    }

    /// Clear the current-room marker if it pointed at `room_id` (called on `LEAVE_ROOM`).
    pub async fn clear_current_room(&self, session_id: &str, room_id: &str) {
        if let Some(s) = self.sessions.write().await.get_mut(session_id) {
            if s.current_room.as_deref() == Some(room_id) {
                s.current_room = None;
            }
        }
    }

    /// Find a live session currently bound to `remote_addr`, regardless of which `session_id`
    /// a frame named. Used only to decide whether a `NO_SESSION` error is worth sending back to
    /// an address that still has some other valid session (spec §4.3 step 1).
    pub async fn session_for_addr(&self, remote_addr: &str) -> Option<Session> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.remote_addr == remote_addr)
            .cloned()
    }

    /// Find every session currently bound to `user_id` — a user may hold more than one live
    /// session (multiple devices); broadcasts (C7) fan out to each.
    pub async fn sessions_for_user(&self, user_id: i64) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == Some(user_id))
            .cloned()
            .collect()
    }

    /// `MERGE_SESSION{old_session_id, old_session_key}`: transfer the old session's user
    /// binding onto `new_session_id` if the presented key matches, then delete the old session.
    pub async fn merge(
        &self,
        new_session_id: &str,
        old_session_id: &str,
        old_session_key_hex: &str,
    ) -> Result<bool, ChatError> {
        let old_row = self.repo.find_session(old_session_id)?;
        let Some(old_row) = old_row else {
            return Ok(false);
        };
        if old_row.session_key_hex != old_session_key_hex {
            return Ok(false);
        }

        if let Some(old_user) = old_row.user_id {
            self.bind_user(new_session_id, old_user).await?;
        }
        let old_room = self
            .sessions
            .read()
            .await
            .get(old_session_id)
            .and_then(|s| s.current_room.clone());
        if let Some(room_id) = old_room {
            self.set_current_room(new_session_id, &room_id).await;
        }
        self.repo.delete_session(old_session_id)?;
        self.sessions.write().await.remove(old_session_id);

        tracing::info!(
            new_session_id = %new_session_id,
            old_session_id = %old_session_id,
            "session merged"
        );
        Ok(true)
    }

    /// Purge sessions idle for longer than `idle_timeout_sec`. Run periodically by the
    /// `Server`'s sweeper task — generalized from the teacher's `PeerManager::cleanup_stale`.
    pub async fn sweep_idle(&self, idle_timeout_sec: u64) -> Result<u32, ChatError> {
        let idle = self.repo.idle_sessions(idle_timeout_sec)?;
        let mut sessions = self.sessions.write().await;
        for session_id in &idle {
            self.repo.delete_session(session_id)?;
            sessions.remove(session_id);
            tracing::info!(session_id = %session_id, "session expired (idle)");
        }
        Ok(idle.len() as u32)
    }

    /// Best-effort synchronous remote-address lookup for the dispatcher's retry loop, which
    /// needs somewhere to retransmit without awaiting the session index's lock. Returns `None`
    /// if the index is momentarily write-locked (a handshake or admit in flight) — the next
    /// retry tick will find it.
    pub fn current_addr(&self, session_id: &str) -> Option<std::net::SocketAddr> {
        self.sessions
            .try_read()
            .ok()?
            .get(session_id)?
            .remote_addr
            .parse()
            .ok()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn authenticated_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
    use rsa::RsaPrivateKey;

    fn identity() -> Arc<ServerIdentity> {
        let dir = std::env::temp_dir().join(format!(
            "chat-core-session-test-{}-{}",
            std::process::id(),
            rand::random::<u64>()
        ));
        Arc::new(ServerIdentity::load_or_generate(dir.to_str().unwrap()).unwrap())
    }

    fn client_key_b64() -> String {
        use base64::Engine;
        let client_priv = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        let client_pub = rsa::RsaPublicKey::from(&client_priv);
        let der = client_pub.to_public_key_der().unwrap();
        base64::engine::general_purpose::STANDARD.encode(der.as_bytes())
    }

    #[tokio::test]
    async fn test_handshake_creates_session() {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let mgr = SessionManager::new(repo, identity());
        let frame = mgr.handshake(&client_key_b64(), "1.2.3.4:5").await.unwrap();
        match frame {
            Frame::SessionInit(SessionInitFrame::Server { session_id, .. }) => {
                assert!(mgr.get(&session_id).await.is_some());
            }
            _ => panic!("wrong frame"),
        }
    }

    #[tokio::test]
    async fn test_session_for_addr_finds_live_session_by_remote_addr() {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let mgr = SessionManager::new(repo, identity());
        let frame = mgr.handshake(&client_key_b64(), "9.9.9.9:9").await.unwrap();
        let session_id = match frame {
            Frame::SessionInit(SessionInitFrame::Server { session_id, .. }) => session_id,
            _ => unreachable!(),
        };

        let found = mgr.session_for_addr("9.9.9.9:9").await.unwrap();
        assert_eq!(found.session_id, session_id);
        assert!(mgr.session_for_addr("1.1.1.1:1").await.is_none());
    }

    #[tokio::test]
    async fn test_replay_rejected() {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let mgr = SessionManager::new(repo, identity());
        let frame = mgr.handshake(&client_key_b64(), "1.2.3.4:5").await.unwrap();
        let session_id = match frame {
            Frame::SessionInit(SessionInitFrame::Server { session_id, .. }) => session_id,
            _ => unreachable!(),
        };
        let session = mgr.get(&session_id).await.unwrap();

        let inner = crate::codec::InnerPayload::new("HELLO", serde_json::json!({}));
        let nonce = crate::codec::new_outbound_nonce();
        let secure = match FrameCodec::build_secure_msg(&session_id, &session.session_key, &nonce, &inner)
            .unwrap()
        {
            Frame::SecureMsg(f) => f,
            _ => unreachable!(),
        };

        mgr.admit(&secure, "1.2.3.4:5").await.unwrap();
        let err = mgr.admit(&secure, "1.2.3.4:5").await.unwrap_err();
        assert!(matches!(err, ChatError::Replay));
    }

    #[tokio::test]
    async fn test_merge_transfers_user() {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let mgr = SessionManager::new(repo.clone(), identity());

        let old_frame = mgr.handshake(&client_key_b64(), "1.1.1.1:1").await.unwrap();
        let old_session_id = match old_frame {
            Frame::SessionInit(SessionInitFrame::Server { session_id, .. }) => session_id,
            _ => unreachable!(),
        };
        let user = repo.create_user("u1", "a@x.com", None, None).unwrap();
        mgr.bind_user(&old_session_id, user.id).await.unwrap();
        let old_key_hex = mgr.get(&old_session_id).await.unwrap().session_key;
        let old_key_hex = hex::encode(old_key_hex);

        let new_frame = mgr.handshake(&client_key_b64(), "2.2.2.2:2").await.unwrap();
        let new_session_id = match new_frame {
            Frame::SessionInit(SessionInitFrame::Server { session_id, .. }) => session_id,
            _ => unreachable!(),
        };

        let merged = mgr
            .merge(&new_session_id, &old_session_id, &old_key_hex)
            .await
            .unwrap();
        assert!(merged);
        assert_eq!(mgr.get(&new_session_id).await.unwrap().user_id, Some(user.id));
        assert!(mgr.get(&old_session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_merge_fails_on_wrong_key() {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let mgr = SessionManager::new(repo, identity());
        let old_frame = mgr.handshake(&client_key_b64(), "1.1.1.1:1").await.unwrap();
        let old_session_id = match old_frame {
            Frame::SessionInit(SessionInitFrame::Server { session_id, .. }) => session_id,
            _ => unreachable!(),
        };
        let new_frame = mgr.handshake(&client_key_b64(), "2.2.2.2:2").await.unwrap();
        let new_session_id = match new_frame {
            Frame::SessionInit(SessionInitFrame::Server { session_id, .. }) => session_id,
            _ => unreachable!(),
        };

        let merged = mgr
            .merge(&new_session_id, &old_session_id, "wrong")
            .await
            .unwrap();
        assert!(!merged);
    }
}
