//! Registry of connected daemons.
//!
//! Each accepted connection becomes a `Session` owning the socket's write
//! half, the identity the daemon presented, a last-heard-from clock, and the
//! table of in-flight commands awaiting results. Correlation is by
//! `command_id` only; commands may complete out of order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use alfred_protocol::{self as protocol, Frame, FrameError, Heartbeat, Params, Registration};

/// A daemon is reported offline when nothing has been heard for twice the
/// heartbeat interval.
pub const OFFLINE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("daemon {0} is not connected")]
    NotConnected(String),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("daemon disconnected before responding")]
    Disconnected,
    #[error("failed to send command: {0}")]
    Transport(#[from] FrameError),
}

/// Identity a daemon presented at registration.
#[derive(Debug, Clone)]
pub struct DaemonIdentity {
    pub name: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub is_soul_daemon: bool,
    pub alfred_root: Option<String>,
}

impl From<Registration> for DaemonIdentity {
    fn from(reg: Registration) -> Self {
        Self {
            name: reg.name,
            hostname: reg.hostname,
            capabilities: reg.capabilities,
            is_soul_daemon: reg.is_soul_daemon,
            alfred_root: reg.alfred_root,
        }
    }
}

/// Live statistics from the latest heartbeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub active_tasks: u32,
}

pub struct Session {
    pub daemon_id: String,
    pub identity: DaemonIdentity,
    pub connected_at: DateTime<Utc>,
    writer: TokioMutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<String, oneshot::Sender<Params>>>,
    last_seen: Mutex<Instant>,
    stats: Mutex<SessionStats>,
}

impl Session {
    /// Encode and write a frame under the session's send lock.
    pub async fn send(&self, frame: &Frame) -> Result<(), FrameError> {
        let buf = protocol::encode_frame(frame)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn is_offline(&self) -> bool {
        self.last_seen.lock().unwrap().elapsed() > OFFLINE_AFTER
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.lock().unwrap()
    }
}

pub struct DaemonRegistry {
    registration_key: String,
    command_timeout: Duration,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    counter: AtomicU64,
}

impl DaemonRegistry {
    pub fn new(registration_key: impl Into<String>, command_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registration_key: registration_key.into(),
            command_timeout,
            sessions: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
        })
    }

    /// The auth gate: a registration is admitted only with the configured
    /// shared secret.
    pub fn key_matches(&self, registration_key: &str) -> bool {
        registration_key == self.registration_key
    }

    /// Record a session for an authenticated registration, minting a fresh
    /// daemon id. Ids are not stable across reconnects; daemons accept a new
    /// assignment on every registration.
    pub fn admit(&self, identity: DaemonIdentity, writer: OwnedWriteHalf) -> Arc<Session> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let daemon_id = format!("daemon-{n:04}");

        let session = Arc::new(Session {
            daemon_id: daemon_id.clone(),
            connected_at: Utc::now(),
            writer: TokioMutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Instant::now()),
            stats: Mutex::new(SessionStats::default()),
            identity,
        });
        self.sessions
            .write()
            .unwrap()
            .insert(daemon_id.clone(), session.clone());

        info!(
            daemon_id = %daemon_id,
            name = %session.identity.name,
            hostname = %session.identity.hostname,
            soul = session.identity.is_soul_daemon,
            "daemon registered"
        );
        session
    }

    /// Remove a session and fail all of its outstanding awaiters with a
    /// disconnect error.
    pub fn unregister(&self, daemon_id: &str) {
        let Some(session) = self.sessions.write().unwrap().remove(daemon_id) else {
            return;
        };
        let pending: Vec<_> = session
            .pending
            .lock()
            .unwrap()
            .drain()
            .map(|(command_id, _sender)| command_id)
            .collect();
        // Dropping the senders resolves every awaiter as disconnected.
        info!(
            daemon_id = %daemon_id,
            name = %session.identity.name,
            outstanding = pending.len(),
            "daemon unregistered"
        );
    }

    pub fn get(&self, daemon_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(daemon_id).cloned()
    }

    /// Resolve a daemon id or a (case-insensitive) daemon name.
    pub fn resolve(&self, id_or_name: &str) -> Option<Arc<Session>> {
        if id_or_name.starts_with("daemon-") {
            return self.get(id_or_name);
        }
        self.sessions
            .read()
            .unwrap()
            .values()
            .find(|session| session.identity.name.eq_ignore_ascii_case(id_or_name))
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    /// Send a command to a daemon and await its result, with the registry's
    /// default deadline.
    pub async fn send_command(
        &self,
        daemon_id: &str,
        kind: &str,
        params: Params,
    ) -> Result<Params, CommandError> {
        self.send_command_with_timeout(daemon_id, kind, params, self.command_timeout)
            .await
    }

    /// Send a command with an explicit deadline. Fails synchronously when the
    /// daemon is unknown; on timeout the in-flight entry is removed.
    pub async fn send_command_with_timeout(
        &self,
        daemon_id: &str,
        kind: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Params, CommandError> {
        let session = self
            .get(daemon_id)
            .ok_or_else(|| CommandError::NotConnected(daemon_id.to_string()))?;

        let command_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        session
            .pending
            .lock()
            .unwrap()
            .insert(command_id.clone(), tx);

        let mut frame = Frame::with_body(kind.to_string(), params);
        frame.command_id = Some(command_id.clone());
        if let Err(e) = session.send(&frame).await {
            session.pending.lock().unwrap().remove(&command_id);
            return Err(CommandError::Transport(e));
        }
        debug!(daemon_id = %daemon_id, command_id = %command_id, kind = %kind, "command dispatched");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => {
                session.pending.lock().unwrap().remove(&command_id);
                warn!(daemon_id = %daemon_id, command_id = %command_id, "command timed out");
                Err(CommandError::Timeout(timeout))
            }
        }
    }

    /// Resolve an in-flight command with its result frame. A result for an
    /// unknown or already-resolved command id is dropped.
    pub fn handle_result(&self, daemon_id: &str, frame: Frame) {
        let Some(session) = self.get(daemon_id) else {
            warn!(daemon_id = %daemon_id, "result from unknown daemon");
            return;
        };
        session.touch();

        let Some(command_id) = frame.command_id else {
            warn!(daemon_id = %daemon_id, "result without command_id");
            return;
        };
        let sender = session.pending.lock().unwrap().remove(&command_id);
        match sender {
            Some(sender) => {
                debug!(daemon_id = %daemon_id, command_id = %command_id, "command completed");
                let _ = sender.send(frame.body);
            }
            None => warn!(
                daemon_id = %daemon_id,
                command_id = %command_id,
                "dropping result for unknown or already-resolved command"
            ),
        }
    }

    /// Update liveness and stats from a heartbeat.
    pub fn handle_heartbeat(&self, daemon_id: &str, heartbeat: &Heartbeat) {
        let Some(session) = self.get(daemon_id) else {
            return;
        };
        session.touch();
        *session.stats.lock().unwrap() = SessionStats {
            cpu_percent: heartbeat.cpu_percent,
            memory_percent: heartbeat.memory_percent,
            disk_percent: heartbeat.disk_percent,
            active_tasks: heartbeat.active_tasks,
        };
        debug!(
            daemon_id = %daemon_id,
            cpu = heartbeat.cpu_percent,
            mem = heartbeat.memory_percent,
            "heartbeat"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};

    fn identity(name: &str) -> DaemonIdentity {
        DaemonIdentity {
            name: name.into(),
            hostname: format!("{name}.local"),
            capabilities: vec!["shell".into()],
            is_soul_daemon: false,
            alfred_root: None,
        }
    }

    /// A connected socket pair; the server side's write half backs sessions.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn registry() -> Arc<DaemonRegistry> {
        DaemonRegistry::new("secret", Duration::from_secs(5))
    }

    // -----------------------------------------------------------------------
    // Admission and lookup
    // -----------------------------------------------------------------------

    #[test]
    fn key_gate() {
        let registry = registry();
        assert!(registry.key_matches("secret"));
        assert!(!registry.key_matches("wrong"));
        assert!(!registry.key_matches(""));
    }

    #[tokio::test]
    async fn admit_mints_sequential_ids() {
        let registry = registry();
        let (_c1, s1) = socket_pair().await;
        let (_c2, s2) = socket_pair().await;

        let first = registry.admit(identity("alpha"), s1.into_split().1);
        let second = registry.admit(identity("beta"), s2.into_split().1);
        assert_eq!(first.daemon_id, "daemon-0001");
        assert_eq!(second.daemon_id, "daemon-0002");
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn resolve_by_id_and_name() {
        let registry = registry();
        let (_client, server) = socket_pair().await;
        let session = registry.admit(identity("MacBook"), server.into_split().1);

        assert!(registry.resolve(&session.daemon_id).is_some());
        assert!(registry.resolve("macbook").is_some());
        assert!(registry.resolve("MACBOOK").is_some());
        assert!(registry.resolve("daemon-9999").is_none());
        assert!(registry.resolve("toaster").is_none());
    }

    // -----------------------------------------------------------------------
    // Command correlation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn send_command_to_unknown_daemon_fails_synchronously() {
        let registry = registry();
        let err = registry
            .send_command("daemon-0042", "ping", Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotConnected(_)));
    }

    #[tokio::test]
    async fn result_resolves_awaiter_and_duplicate_is_dropped() {
        let registry = registry();
        let (mut client, server) = socket_pair().await;
        let session = registry.admit(identity("alpha"), server.into_split().1);
        let daemon_id = session.daemon_id.clone();

        let send = {
            let registry = registry.clone();
            let daemon_id = daemon_id.clone();
            tokio::spawn(async move {
                registry
                    .send_command(&daemon_id, "ping", Params::new())
                    .await
            })
        };

        // Read the request off the wire and answer it twice.
        let request = protocol::read_frame(&mut client).await.unwrap();
        assert_eq!(request.kind, "ping");
        let command_id = request.command_id.clone().unwrap();

        let mut result = Frame::new(protocol::kind::RESULT);
        result.command_id = Some(command_id.clone());
        result.body.insert("success".into(), json!(true));
        result.body.insert("output".into(), json!("pong"));
        registry.handle_result(&daemon_id, result.clone());
        registry.handle_result(&daemon_id, result); // duplicate: dropped

        let outcome = send.await.unwrap().unwrap();
        assert_eq!(outcome["output"], json!("pong"));
    }

    #[tokio::test]
    async fn command_times_out_and_clears_the_entry() {
        let registry = registry();
        let (_client, server) = socket_pair().await;
        let session = registry.admit(identity("alpha"), server.into_split().1);

        let err = registry
            .send_command_with_timeout(
                &session.daemon_id,
                "ping",
                Params::new(),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
        assert!(session.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_fails_outstanding_commands() {
        let registry = registry();
        let (_client, server) = socket_pair().await;
        let session = registry.admit(identity("alpha"), server.into_split().1);
        let daemon_id = session.daemon_id.clone();

        let send = {
            let registry = registry.clone();
            let daemon_id = daemon_id.clone();
            tokio::spawn(async move {
                registry
                    .send_command(&daemon_id, "ping", Params::new())
                    .await
            })
        };

        // Let the command land in the pending table before tearing down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.unregister(&daemon_id);

        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Disconnected));
        assert!(registry.get(&daemon_id).is_none());
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn heartbeat_updates_stats_and_liveness() {
        let registry = registry();
        let (_client, server) = socket_pair().await;
        let session = registry.admit(identity("alpha"), server.into_split().1);

        let heartbeat = Heartbeat {
            daemon_id: session.daemon_id.clone(),
            cpu_percent: 42.0,
            memory_percent: 50.0,
            disk_percent: 60.0,
            active_tasks: 3,
        };
        registry.handle_heartbeat(&session.daemon_id, &heartbeat);

        let stats = session.stats();
        assert!((stats.cpu_percent - 42.0).abs() < f64::EPSILON);
        assert_eq!(stats.active_tasks, 3);
        assert!(!session.is_offline());
    }
}
