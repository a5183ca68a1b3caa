//! The daemon side of the Prime link.
//!
//! The daemon dials out to Prime, registers, then serves: one reader
//! dispatching inbound commands, one heartbeater, and one forwarder draining
//! emitter events, all sharing the socket through a single send lock. Any
//! failure tears the connection down and the client reconnects with
//! exponential backoff, forever.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use alfred_protocol::{
    self as protocol, kind, Event, Frame, FrameError, Heartbeat, Params, Registration,
    RegistrationAck,
};

use crate::config::Config;
use crate::handlers::Registry;
use crate::stats::{self, CpuSampler};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Idle read deadline; expiry just re-arms the read, it is not fatal.
const READ_DEADLINE: Duration = Duration::from_secs(60);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Reconnect backoff: 1 s after a fresh failure, doubling per consecutive
/// failure up to 60 s, reset on every successful registration.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay: INITIAL_BACKOFF,
        }
    }

    /// The wait to apply after the latest failure.
    pub fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.delay = INITIAL_BACKOFF;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PrimeClient {
    config: Config,
    registry: Arc<Registry>,
    daemon_id: std::sync::RwLock<Option<String>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<mpsc::UnboundedReceiver<Event>>,
    /// Commands currently being handled; reported in heartbeats.
    active_tasks: Arc<AtomicU32>,
}

impl PrimeClient {
    pub fn new(config: Config, registry: Arc<Registry>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            registry,
            daemon_id: std::sync::RwLock::new(None),
            events_tx,
            events_rx: Mutex::new(events_rx),
            active_tasks: Arc::new(AtomicU32::new(0)),
        })
    }

    /// The id Prime assigned at the most recent registration.
    pub fn daemon_id(&self) -> Option<String> {
        self.daemon_id.read().unwrap().clone()
    }

    /// Queue an event for upstream delivery. Never blocks; events raised
    /// while disconnected are delivered once the link is back.
    pub fn send_event(
        &self,
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: Params,
    ) {
        self.forward_event(Event::now(source, event_type, payload));
    }

    /// Forward an already-built event; this is the emitter-manager callback.
    pub fn forward_event(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    /// Maintain the Prime connection until cancelled, reconnecting with
    /// backoff. Loss of the connection is never fatal.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::new();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.connect_once(&cancel, &mut backoff).await {
                Ok(()) => return, // cancelled
                Err(e) => warn!(error = %e, "prime connection ended"),
            }

            let delay = backoff.next();
            info!(delay_secs = delay.as_secs(), "reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One dial/register/serve cycle. `Ok(())` means cancellation; `Err`
    /// means the attempt failed and the caller should back off.
    async fn connect_once(&self, cancel: &CancellationToken, backoff: &mut Backoff) -> Result<()> {
        info!(address = %self.config.prime_address, "connecting to prime");
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = TcpStream::connect(&self.config.prime_address) => {
                result.with_context(|| format!("dial {} failed", self.config.prime_address))?
            }
        };

        let (mut read, write) = stream.into_split();
        let writer = Arc::new(Mutex::new(write));

        let daemon_id = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = self.register(&mut read, &writer) => result?,
        };
        *self.daemon_id.write().unwrap() = Some(daemon_id.clone());
        info!(daemon_id = %daemon_id, name = %self.config.name, "registered with prime");
        backoff.reset();

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested, closing prime link");
                Ok(())
            }
            result = self.read_loop(&mut read, &writer, &daemon_id) => result,
            result = self.heartbeat_loop(&writer, &daemon_id) => result,
            result = self.event_loop(&writer, &daemon_id) => result,
        }
    }

    /// Send the registration frame and wait for exactly one ack.
    async fn register(
        &self,
        read: &mut OwnedReadHalf,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
    ) -> Result<String> {
        let registration = Registration {
            registration_key: self.config.registration_key.clone(),
            name: self.config.name.clone(),
            hostname: self.config.hostname.clone(),
            capabilities: self.config.capabilities.clone(),
            is_soul_daemon: self.config.is_soul_daemon,
            alfred_root: self.config.alfred_root.clone(),
        };
        let frame = Frame::from_payload(kind::REGISTRATION, &registration)?;
        send_frame(writer, &frame).await?;

        let ack_frame = tokio::time::timeout(REGISTRATION_TIMEOUT, protocol::read_frame(read))
            .await
            .context("timed out waiting for registration ack")??;
        if ack_frame.kind != kind::REGISTRATION_ACK {
            bail!("unexpected reply to registration: {}", ack_frame.kind);
        }
        let ack: RegistrationAck = ack_frame.payload()?;
        if !ack.success {
            bail!(
                "registration rejected: {}",
                ack.message.unwrap_or_else(|| "no reason given".into())
            );
        }
        ack.daemon_id.context("registration ack missing daemon_id")
    }

    /// Decode inbound frames and dispatch each to the registry in its own
    /// task, so one slow handler never blocks the others.
    async fn read_loop(
        &self,
        read: &mut OwnedReadHalf,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        daemon_id: &str,
    ) -> Result<()> {
        loop {
            // The deadline applies to the idle wait only; once bytes are
            // pending the frame is read without risking a partial drop.
            if tokio::time::timeout(READ_DEADLINE, read.readable())
                .await
                .is_err()
            {
                debug!("no traffic within read deadline, re-arming");
                continue;
            }

            match protocol::read_frame(read).await {
                Ok(frame) => self.dispatch(frame, writer, daemon_id),
                Err(e) if e.is_peer_closed() => {
                    info!("prime closed the connection");
                    bail!("connection closed by prime");
                }
                Err(e) => {
                    warn!(error = %e, "read failed");
                    bail!("read failed: {e}");
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame, writer: &Arc<Mutex<OwnedWriteHalf>>, daemon_id: &str) {
        let command_kind = frame.kind.clone();
        let command_id = frame.command_id.clone();

        // The whole frame is the handler's parameter record.
        let mut params = frame.body;
        if let Some(id) = &command_id {
            params.insert("command_id".into(), serde_json::Value::String(id.clone()));
        }

        debug!(kind = %command_kind, command_id = command_id.as_deref().unwrap_or(""), "dispatching command");

        let registry = self.registry.clone();
        let writer = writer.clone();
        let daemon_id = daemon_id.to_string();
        let active = self.active_tasks.clone();

        active.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let result = registry.handle(&command_kind, params).await;
            active.fetch_sub(1, Ordering::Relaxed);

            let mut reply = Frame::with_body(kind::RESULT, result);
            reply.command_id = command_id;
            reply.daemon_id = Some(daemon_id);
            if let Err(e) = send_frame(&writer, &reply).await {
                // The connection died while the handler ran; the result is
                // discarded.
                debug!(error = %e, "failed to send result");
            }
        });
    }

    async fn heartbeat_loop(
        &self,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        daemon_id: &str,
    ) -> Result<()> {
        let mut sampler = CpuSampler::new();
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        // Consume the immediate first tick so the cadence starts 30 s in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let heartbeat = Heartbeat {
                daemon_id: daemon_id.to_string(),
                cpu_percent: sampler.sample(),
                memory_percent: stats::memory_percent(),
                disk_percent: stats::disk_percent(std::path::Path::new("/")),
                active_tasks: self.active_tasks.load(Ordering::Relaxed),
            };
            let frame = Frame::from_payload(kind::HEARTBEAT, &heartbeat)?;
            send_frame(writer, &frame)
                .await
                .context("heartbeat send failed")?;
            debug!(
                cpu = heartbeat.cpu_percent,
                mem = heartbeat.memory_percent,
                "heartbeat sent"
            );
        }
    }

    /// Drain emitter events and serialize them onto the link.
    async fn event_loop(
        &self,
        writer: &Arc<Mutex<OwnedWriteHalf>>,
        daemon_id: &str,
    ) -> Result<()> {
        let mut events = self.events_rx.lock().await;
        loop {
            let Some(event) = events.recv().await else {
                return Ok(());
            };
            let mut frame = Frame::from_payload(kind::EVENT, &event)?;
            frame.daemon_id = Some(daemon_id.to_string());
            send_frame(writer, &frame)
                .await
                .context("event send failed")?;
            debug!(event_type = %event.event_type, "event forwarded");
        }
    }
}

/// Encode and write a frame under the shared send lock. All three writer
/// roles go through here, which keeps every frame's bytes contiguous.
async fn send_frame(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    frame: &Frame,
) -> Result<(), FrameError> {
    let buf = protocol::encode_frame(frame)?;
    let mut guard = writer.lock().await;
    guard.write_all(&buf).await?;
    guard.flush().await?;
    Ok(())
}
