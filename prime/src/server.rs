//! The TCP link endpoint: accepts daemon connections, gates them on the
//! registration secret, then routes inbound frames by type.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use alfred_protocol::{
    self as protocol, kind, Event, Frame, Heartbeat, RegistrationAck,
};

use crate::events::{BusEvent, EventBus, Priority};
use crate::registry::DaemonRegistry;

/// How long a fresh connection gets to present its registration.
const REGISTRATION_DEADLINE: Duration = Duration::from_secs(10);

/// Accept daemon connections until cancelled, one task per connection.
pub async fn run(
    listener: TcpListener,
    registry: Arc<DaemonRegistry>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("link endpoint stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                debug!(peer = %peer, "connection accepted");
                let registry = registry.clone();
                let bus = bus.clone();
                tokio::spawn(async move {
                    handle_connection(stream, registry, bus).await;
                });
            }
        }
    }
}

/// Drive one daemon connection from registration to teardown.
async fn handle_connection(stream: TcpStream, registry: Arc<DaemonRegistry>, bus: Arc<EventBus>) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let (mut read, mut write) = stream.into_split();

    // The first frame must be a valid, authenticated registration; nothing
    // else is ever admitted from the connection.
    let first = match tokio::time::timeout(REGISTRATION_DEADLINE, protocol::read_frame(&mut read))
        .await
    {
        Err(_) => {
            warn!(peer = %peer, "no registration within deadline, closing");
            return;
        }
        Ok(Err(e)) if e.is_peer_closed() => {
            info!(peer = %peer, "closed before registering");
            return;
        }
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "failed to read registration");
            return;
        }
        Ok(Ok(frame)) => frame,
    };

    if first.kind != kind::REGISTRATION {
        warn!(peer = %peer, kind = %first.kind, "first frame was not a registration");
        refuse(&mut write, "expected registration").await;
        return;
    }
    let registration: protocol::Registration = match first.payload() {
        Ok(registration) => registration,
        Err(e) => {
            warn!(peer = %peer, error = %e, "malformed registration");
            refuse(&mut write, "malformed registration").await;
            return;
        }
    };
    if !registry.key_matches(&registration.registration_key) {
        warn!(peer = %peer, name = %registration.name, "invalid registration key");
        refuse(&mut write, "invalid registration key").await;
        return;
    }

    let session = registry.admit(registration.into(), write);
    let daemon_id = session.daemon_id.clone();

    let ack = RegistrationAck {
        success: true,
        daemon_id: Some(daemon_id.clone()),
        message: Some(format!("welcome, {}", session.identity.name)),
    };
    let ack_sent = match Frame::from_payload(kind::REGISTRATION_ACK, &ack) {
        Ok(frame) => session.send(&frame).await,
        Err(e) => Err(e),
    };
    if let Err(e) = ack_sent {
        warn!(daemon_id = %daemon_id, error = %e, "failed to ack registration");
        registry.unregister(&daemon_id);
        return;
    }

    // Read loop: route frames by type until the session ends.
    loop {
        match protocol::read_frame(&mut read).await {
            Ok(frame) => route(frame, &session.daemon_id, &registry, &bus),
            Err(e) if e.is_peer_closed() => {
                info!(daemon_id = %daemon_id, "daemon disconnected");
                break;
            }
            Err(e) => {
                warn!(daemon_id = %daemon_id, error = %e, "session error");
                break;
            }
        }
    }
    registry.unregister(&daemon_id);
}

/// Send a failure ack to an unauthenticated connection before closing it.
async fn refuse(write: &mut tokio::net::tcp::OwnedWriteHalf, message: &str) {
    let ack = RegistrationAck {
        success: false,
        daemon_id: None,
        message: Some(message.to_string()),
    };
    let Ok(frame) = Frame::from_payload(kind::REGISTRATION_ACK, &ack) else {
        return;
    };
    if let Err(e) = protocol::write_frame(write, &frame).await {
        debug!(error = %e, "failed to send refusal ack");
    }
}

fn route(frame: Frame, daemon_id: &str, registry: &DaemonRegistry, bus: &EventBus) {
    match frame.kind.as_str() {
        kind::HEARTBEAT => match frame.payload::<Heartbeat>() {
            Ok(heartbeat) => registry.handle_heartbeat(daemon_id, &heartbeat),
            Err(e) => warn!(daemon_id = %daemon_id, error = %e, "malformed heartbeat"),
        },
        kind::RESULT => registry.handle_result(daemon_id, frame),
        kind::EVENT => match frame.payload::<Event>() {
            Ok(event) => {
                info!(
                    daemon_id = %daemon_id,
                    source = %event.source,
                    event_type = %event.event_type,
                    "daemon event"
                );
                bus.publish(BusEvent {
                    daemon_id: daemon_id.to_string(),
                    source: event.source,
                    event_type: event.event_type,
                    payload: event.payload,
                    timestamp: event.timestamp,
                    priority: Priority::Normal,
                });
            }
            Err(e) => warn!(daemon_id = %daemon_id, error = %e, "malformed event"),
        },
        kind::ALERT => {
            // Alerts are loosely structured; publish what was sent, flagged
            // high priority.
            let event_type = frame
                .body
                .get("alert_type")
                .and_then(|v| v.as_str())
                .unwrap_or("alert")
                .to_string();
            let session_name = registry
                .get(daemon_id)
                .map(|s| s.identity.name.clone())
                .unwrap_or_else(|| daemon_id.to_string());
            warn!(daemon_id = %daemon_id, alert_type = %event_type, "daemon alert");
            bus.publish(BusEvent {
                daemon_id: daemon_id.to_string(),
                source: format!("daemon:{session_name}"),
                event_type,
                payload: frame.body,
                timestamp: Utc::now(),
                priority: Priority::High,
            });
        }
        other => debug!(daemon_id = %daemon_id, kind = %other, "discarding unexpected frame"),
    }
}
