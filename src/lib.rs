//! Secure real-time group-chat backend: RSA handshake, AES-GCM encrypted sessions, reliable
//! delivery over UDP, and a room/chat state machine.
//!
//! `Server` is the top-level struct constructed once at startup; it owns the UDP socket, the
//! session index, the repository handle, the retry queue, and the metrics registry, and wires
//! them together into the receive loop, writer loop, retry loop, and idle sweeper. Grounded on
//! the teacher's `EdgeClawEngine`: one struct holding every manager behind an `Arc`, built by a
//! single fallible constructor. Tracing setup lives in `main`, per the teacher's split between
//! library logic and binary bootstrap.

pub mod ai;
pub mod chat;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod repo;
pub mod router;
pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use ai::AiBridge;
use chat::ChatService;
use codec::{Frame, FrameCodec, InnerPayload, SessionInitFrame, MAX_FRAME_BYTES};
use config::Config;
use crypto::ServerIdentity;
use dispatch::{Dispatcher, RetryPolicy};
use error::ChatError;
use metrics::Metrics;
use repo::Repository;
use router::Router;
use session::{Session, SessionManager};

/// How often the idle sweeper checks for expired sessions, independent of `idle_timeout_sec`.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A queue of decrypted inner payloads belonging to one session, drained strictly in order by
/// a single dedicated task — this is what gives each session its FIFO processing guarantee
/// while letting unrelated sessions proceed concurrently.
type WorkerHandle = mpsc::UnboundedSender<(Session, InnerPayload)>;

pub struct Server {
    config: Config,
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionManager>,
    chat: Arc<ChatService>,
    dispatcher: Arc<Dispatcher>,
    router: Arc<Router>,
    metrics: Arc<Metrics>,
    workers: AsyncMutex<HashMap<String, WorkerHandle>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Build every component and bind the UDP socket. Fails fast (and loudly) on any setup
    /// error — a bad bind address, an unreadable key directory, a broken database URL are all
    /// `ChatError::Fatal` and should abort startup rather than run degraded.
    pub async fn bind(config: Config) -> Result<Arc<Self>, ChatError> {
        let repo = Arc::new(Repository::open(&config.db_url)?);
        let identity = Arc::new(ServerIdentity::load_or_generate(&config.key_dir)?);
        let sessions = Arc::new(SessionManager::new(repo.clone(), identity));
        let chat = Arc::new(ChatService::new(repo));
        let metrics = Arc::new(Metrics::new());

        let ai_backend = ai::backend_from_name(&config.ai_backend);
        let ai = Arc::new(AiBridge::new(ai_backend, 4));

        let socket = UdpSocket::bind(&config.bind_addr)
            .await
            .map_err(|e| ChatError::Fatal(format!("failed to bind {}: {e}", config.bind_addr)))?;
        tracing::info!(bind_addr = %config.bind_addr, ai_backend = %config.ai_backend, "chat server bound");
        let socket = Arc::new(socket);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let sessions_for_addr = sessions.clone();
        let addr_of: Arc<dyn Fn(&str) -> Option<SocketAddr> + Send + Sync> =
            Arc::new(move |session_id: &str| sessions_for_addr.current_addr(session_id));

        let policy = RetryPolicy {
            base_rto: Duration::from_millis(config.rto_base_ms),
            max_rto: Duration::from_millis(config.rto_max_ms),
            max_attempts: config.max_attempts,
        };
        let dispatcher = Arc::new(Dispatcher::new(policy, outbound_tx, metrics.clone(), addr_of));

        let router = Arc::new(Router::new(
            sessions.clone(),
            chat.clone(),
            dispatcher.clone(),
            ai,
            metrics.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = Arc::new(Self {
            config,
            socket: socket.clone(),
            sessions,
            chat,
            dispatcher,
            router,
            metrics,
            workers: AsyncMutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
        });

        tokio::spawn(writer_task(socket, outbound_rx));

        Ok(server)
    }

    /// Run every background task and the receive loop until a shutdown signal arrives.
    pub async fn run(self: Arc<Self>) -> Result<(), ChatError> {
        let retry_task = tokio::spawn(self.dispatcher.clone().run(self.shutdown_rx.clone()));
        let sweeper_task = tokio::spawn(self.clone().idle_sweeper());

        let metrics_addr: SocketAddr = self
            .config
            .metrics_addr
            .parse()
            .map_err(|_| ChatError::Fatal(format!("invalid METRICS_ADDR: {}", self.config.metrics_addr)))?;
        let metrics_task = tokio::spawn(metrics::serve(metrics_addr, self.metrics.clone()));
        tracing::info!(metrics_addr = %metrics_addr, "metrics endpoint listening");

        self.receive_loop().await;

        let _ = self.shutdown_tx.send(true);
        let _ = retry_task.await;
        sweeper_task.abort();
        metrics_task.abort();
        tracing::info!("server shut down cleanly");
        Ok(())
    }

    /// Trigger graceful shutdown; used by the signal handler in `main`.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn receive_loop(&self) {
        let mut buf = vec![0u8; MAX_FRAME_BYTES];
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, remote_addr)) => {
                            self.metrics.bytes_in.add(len as u64);
                            self.handle_datagram(&buf[..len], remote_addr).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "UDP recv_from failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], remote_addr: SocketAddr) {
        let frame = match FrameCodec::decode(data) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(error = %e, remote_addr = %remote_addr, "dropped malformed frame");
                return;
            }
        };

        match frame {
            Frame::SessionInit(SessionInitFrame::Client { client_key }) => {
                self.metrics.frames_received_handshake.inc();
                self.handle_handshake(&client_key, remote_addr).await;
            }
            Frame::SessionInit(SessionInitFrame::Server { .. }) => {
                // A server-shaped frame arriving inbound is either a misbehaving client or a
                // reflected packet; never produced by a legitimate client.
                tracing::debug!(remote_addr = %remote_addr, "dropped server-shaped SESSION_INIT from client");
            }
            Frame::SecureMsg(secure) => {
                self.metrics.frames_received_secure.inc();
                self.handle_secure_msg(secure, remote_addr).await;
            }
            Frame::ClearError(_) => {
                // Server-originated only; never legitimately sent by a client.
                tracing::debug!(remote_addr = %remote_addr, "dropped client-sent ERROR frame");
            }
        }
    }

    async fn handle_handshake(&self, client_key_b64: &str, remote_addr: SocketAddr) {
        match self.sessions.handshake(client_key_b64, &remote_addr.to_string()).await {
            Ok(frame) => match FrameCodec::encode(&frame) {
                Ok(bytes) => {
                    self.metrics.frames_sent_handshake.inc();
                    self.dispatcher.send_best_effort(remote_addr, bytes);
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode handshake reply"),
            },
            Err(e) => {
                tracing::debug!(error = %e, remote_addr = %remote_addr, "handshake rejected");
            }
        }
    }

    async fn handle_secure_msg(&self, secure: codec::SecureMsgFrame, remote_addr: SocketAddr) {
        match self.sessions.admit(&secure, &remote_addr.to_string()).await {
            Ok((inner, session)) => self.dispatch_to_worker(session, inner).await,
            Err(ChatError::Replay) => {
                self.metrics.replay_rejections.inc();
                tracing::debug!(session_id = %secure.session_id, "replayed nonce rejected");
            }
            Err(ChatError::NotFound(_)) => {
                self.metrics.decrypt_failures.inc();
                tracing::debug!(session_id = %secure.session_id, "secure_msg admission failed: no such session");
                self.maybe_send_no_session(&remote_addr).await;
            }
            Err(ChatError::Crypto) => {
                self.metrics.decrypt_failures.inc();
                tracing::debug!(session_id = %secure.session_id, "secure_msg admission failed");
            }
            Err(e) => {
                tracing::warn!(error = %e, session_id = %secure.session_id, "unexpected admission error");
            }
        }
    }

    /// Spec §4.3 step 1: a frame named an unknown `session_id`. Drop silently unless this
    /// address still has some other live session, in which case let it know via an unsolicited,
    /// unencrypted `ERROR{code:"NO_SESSION"}` — there is no session key to encrypt a reply with.
    async fn maybe_send_no_session(&self, remote_addr: &SocketAddr) {
        if self.sessions.session_for_addr(&remote_addr.to_string()).await.is_none() {
            return;
        }
        let frame = Frame::ClearError(codec::ClearErrorFrame {
            code: "NO_SESSION".to_string(),
        });
        match FrameCodec::encode(&frame) {
            Ok(bytes) => self.dispatcher.send_best_effort(*remote_addr, bytes),
            Err(e) => tracing::warn!(error = %e, "failed to encode NO_SESSION error"),
        }
    }

    /// Hand `(session, inner)` to the dedicated per-session worker task, spawning one on first
    /// use. Ordering within a session is preserved because each worker drains its own channel
    /// one message at a time; different sessions run on different tasks concurrently.
    async fn dispatch_to_worker(&self, session: Session, inner: InnerPayload) {
        let session_id = session.session_id.clone();
        let mut workers = self.workers.lock().await;
        let send_failed = if let Some(handle) = workers.get(&session_id) {
            handle.send((session, inner)).is_err()
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(worker_task(self.router.clone(), rx));
            let _ = tx.send((session, inner));
            workers.insert(session_id.clone(), tx);
            false
        };
        if send_failed {
            // Worker task died (should not happen outside a panic); drop and let the next
            // datagram for this session spawn a fresh one.
            workers.remove(&session_id);
        }
    }

    async fn idle_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sessions.sweep_idle(self.config.idle_timeout_sec).await {
                        Ok(n) if n > 0 => tracing::info!(expired = n, "idle sessions swept"),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "idle sweep failed"),
                    }
                    self.metrics.active_sessions.set(self.sessions.active_count().await as u64);
                    self.metrics
                        .authenticated_sessions
                        .set(self.sessions.authenticated_count().await as u64);
                    if let Ok(rooms) = self.chat.list_rooms() {
                        self.metrics.rooms.set(rooms.len() as u64);
                        let members: usize = rooms
                            .iter()
                            .filter_map(|r| self.chat.list_members(r).ok())
                            .map(|m| m.len())
                            .sum();
                        self.metrics.members.set(members as u64);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

async fn writer_task(socket: Arc<UdpSocket>, mut outbound_rx: mpsc::UnboundedReceiver<dispatch::Outbound>) {
    while let Some(out) = outbound_rx.recv().await {
        if let Err(e) = socket.send_to(&out.bytes, out.remote_addr).await {
            tracing::warn!(error = %e, remote_addr = %out.remote_addr, "UDP send_to failed");
        }
    }
}

async fn worker_task(router: Arc<Router>, mut rx: mpsc::UnboundedReceiver<(Session, InnerPayload)>) {
    while let Some((session, payload)) = rx.recv().await {
        router.handle(session, payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(bind_addr: &str, db_path: &std::path::Path, key_dir: &std::path::Path) -> Config {
        Config {
            bind_addr: bind_addr.to_string(),
            idle_timeout_sec: 600,
            rto_base_ms: 1000,
            rto_max_ms: 8000,
            max_attempts: 5,
            key_dir: key_dir.to_str().unwrap().to_string(),
            db_url: db_path.to_str().unwrap().to_string(),
            ai_backend: "none".to_string(),
            metrics_addr: "127.0.0.1:0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_bind_constructs_server() {
        let dir = std::env::temp_dir().join(format!("chat-core-lib-test-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        let db_path = dir.join("chat.db");
        let key_dir = dir.join("keys");

        let server = Server::bind(test_config("127.0.0.1:0", &db_path, &key_dir))
            .await
            .unwrap();
        assert_eq!(server.sessions.active_count().await, 0);
    }
}
