use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// TCP port Prime listens on for daemon connections by default.
pub const DEFAULT_PRIME_PORT: u16 = 50051;

/// Maximum frame size (64 MiB). An oversized frame terminates the session.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Framing: each frame is a 4-byte big-endian length prefix followed by that
/// many bytes of UTF-8 JSON encoding a single JSON object. The prefix counts
/// the JSON payload only (not itself).

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// The closed set of control frame `type` values. Request frames additionally
/// use any registered handler name (`shell`, `read_file`, ...) as their type.
pub mod kind {
    pub const REGISTRATION: &str = "registration";
    pub const REGISTRATION_ACK: &str = "registration_ack";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const PING: &str = "ping";
    pub const RESULT: &str = "result";
    pub const EVENT: &str = "event";
    pub const ALERT: &str = "alert";
}

/// Free-form payload fields of a frame, keyed by field name.
pub type Params = Map<String, Value>;

/// The universal unit on the wire.
///
/// Every frame is self-describing: `type` selects the payload shape,
/// `daemon_id` identifies the sending/receiving agent once assigned, and
/// `command_id` correlates a request with its eventual `result`. All other
/// fields live in `body` and are interpreted per `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(flatten)]
    pub body: Params,
}

impl Frame {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            daemon_id: None,
            command_id: None,
            body: Params::new(),
        }
    }

    pub fn with_body(kind: impl Into<String>, body: Params) -> Self {
        Self {
            kind: kind.into(),
            daemon_id: None,
            command_id: None,
            body,
        }
    }

    /// Build a frame from a typed payload. The payload must serialize to a
    /// JSON object; its fields become the frame body.
    pub fn from_payload<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, FrameError> {
        let value = serde_json::to_value(payload)?;
        let body = match value {
            Value::Object(map) => map,
            other => {
                return Err(FrameError::Decode(serde::ser::Error::custom(format!(
                    "payload must serialize to a JSON object, got {}",
                    json_type_name(&other)
                ))))
            }
        };
        Ok(Self::with_body(kind, body))
    }

    /// Decode the frame into a typed payload, with a descriptive error when a
    /// required field is missing or mistyped. Envelope fields (`daemon_id`,
    /// `command_id`) are visible to the payload type as well.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Registration, the first frame a daemon sends on every new connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub registration_key: String,
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub is_soul_daemon: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alfred_root: Option<String>,
}

/// Prime's reply to a registration frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Periodic liveness report from a daemon. Advisory: a missed heartbeat is
/// never fatal; Prime uses them to drive its last-heard-from clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub daemon_id: String,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub disk_percent: f64,
    #[serde(default)]
    pub active_tasks: u32,
}

/// A proactive notification originating on a daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Origin tag, e.g. `daemon:macbook`.
    pub source: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: Params,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn now(source: impl Into<String>, event_type: impl Into<String>, payload: Params) -> Self {
        Self {
            source: source.into(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Framing codec
// ---------------------------------------------------------------------------

/// Why a read or write on the framed stream failed. Everything except a clean
/// `PeerClosed` ends the session and is logged at warning by the caller.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the connection cleanly at a frame boundary.
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("frame i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("oversized frame: {len} bytes (cap {cap})")]
    Oversize { len: usize, cap: usize },
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FrameError {
    /// True for the clean end-of-stream case, which callers log at info
    /// rather than warning.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, FrameError::PeerClosed)
    }
}

/// Encode a frame as length-prefixed bytes. The caller writes the returned
/// buffer with a single `write_all` under its send lock, which keeps the
/// prefix and payload contiguous on the wire.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(frame)?;
    if json.len() > MAX_FRAME_SIZE as usize {
        return Err(FrameError::Oversize {
            len: json.len(),
            cap: MAX_FRAME_SIZE as usize,
        });
    }
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Read one frame from the stream.
///
/// EOF before the first prefix byte is a clean `PeerClosed`; EOF anywhere
/// else means the peer died mid-frame and surfaces as an i/o error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut prefix = [0u8; 4];
    let n = reader.read(&mut prefix[..1]).await?;
    if n == 0 {
        return Err(FrameError::PeerClosed);
    }
    reader.read_exact(&mut prefix[1..]).await?;

    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::Oversize {
            len: len as usize,
            cap: MAX_FRAME_SIZE as usize,
        });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let buf = encode_frame(frame)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Envelope round-trips
    // -----------------------------------------------------------------------

    #[test]
    fn frame_roundtrip_preserves_extra_fields() {
        let mut body = Params::new();
        body.insert("command".into(), Value::String("echo hi".into()));
        body.insert("timeout".into(), Value::from(30));
        let mut frame = Frame::with_body("shell", body);
        frame.command_id = Some("c-2".into());

        let json = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
        assert_eq!(back.body["command"], "echo hi");
    }

    #[test]
    fn frame_omits_absent_ids() {
        let frame = Frame::new("heartbeat");
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("daemon_id"));
        assert!(!json.contains("command_id"));
    }

    #[test]
    fn frame_tolerates_unknown_fields() {
        let json = r#"{"type":"ping","command_id":"c-1","someday":"maybe"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.kind, "ping");
        assert_eq!(frame.command_id.as_deref(), Some("c-1"));
        assert_eq!(frame.body["someday"], "maybe");
    }

    // -----------------------------------------------------------------------
    // Typed payloads
    // -----------------------------------------------------------------------

    #[test]
    fn registration_payload_roundtrip() {
        let reg = Registration {
            registration_key: "secret".into(),
            name: "macbook".into(),
            hostname: "mac.local".into(),
            capabilities: vec!["shell".into(), "files".into()],
            is_soul_daemon: true,
            alfred_root: Some("/opt/alfred".into()),
        };
        let frame = Frame::from_payload(kind::REGISTRATION, &reg).unwrap();
        assert_eq!(frame.kind, "registration");
        assert_eq!(frame.body["name"], "macbook");

        let back: Registration = frame.payload().unwrap();
        assert_eq!(back.name, "macbook");
        assert!(back.is_soul_daemon);
        assert_eq!(back.alfred_root.as_deref(), Some("/opt/alfred"));
    }

    #[test]
    fn payload_reports_missing_required_field() {
        let frame = Frame::new(kind::REGISTRATION);
        let err = frame.payload::<Registration>().unwrap_err();
        assert!(err.to_string().contains("registration_key"), "{err}");
    }

    #[test]
    fn heartbeat_payload_sees_envelope_daemon_id() {
        let mut frame = Frame::new(kind::HEARTBEAT);
        frame.daemon_id = Some("daemon-0001".into());
        frame.body.insert("cpu_percent".into(), Value::from(12.5));

        let hb: Heartbeat = frame.payload().unwrap();
        assert_eq!(hb.daemon_id, "daemon-0001");
        assert!((hb.cpu_percent - 12.5).abs() < f64::EPSILON);
        assert_eq!(hb.active_tasks, 0);
    }

    #[test]
    fn registration_ack_defaults() {
        let json =
            r#"{"type":"registration_ack","success":false,"message":"invalid registration key"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        let ack: RegistrationAck = frame.payload().unwrap();
        assert!(!ack.success);
        assert!(ack.daemon_id.is_none());
        assert_eq!(ack.message.as_deref(), Some("invalid registration key"));
    }

    #[test]
    fn event_timestamp_is_rfc3339() {
        let event = Event::now("daemon:macbook", "cpu_high", Params::new());
        let frame = Frame::from_payload(kind::EVENT, &event).unwrap();
        let ts = frame.body["timestamp"].as_str().unwrap();
        assert!(ts.contains('T'), "timestamp not RFC 3339: {ts}");
        let back: Event = frame.payload().unwrap();
        assert_eq!(back.event_type, "cpu_high");
    }

    #[test]
    fn from_payload_rejects_non_object() {
        let err = Frame::from_payload("oops", &42u32).unwrap_err();
        assert!(err.to_string().contains("JSON object"), "{err}");
    }

    // -----------------------------------------------------------------------
    // Framing
    // -----------------------------------------------------------------------

    #[test]
    fn encode_prefixes_payload_length() {
        let frame = Frame::new(kind::PING);
        let buf = encode_frame(&frame).unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len() - 4);
    }

    #[tokio::test]
    async fn framing_roundtrip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut frame = Frame::new("shell");
        frame.command_id = Some("c-1".into());
        frame
            .body
            .insert("command".into(), Value::String("echo hi".into()));

        write_frame(&mut client, &frame).await.unwrap();
        let back = read_frame(&mut server).await.unwrap();
        assert_eq!(back, frame);
    }

    #[tokio::test]
    async fn stream_of_frames_decodes_in_order() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        for i in 0..10 {
            let mut frame = Frame::new(kind::PING);
            frame.command_id = Some(format!("c-{i}"));
            write_frame(&mut client, &frame).await.unwrap();
        }
        drop(client);

        for i in 0..10 {
            let frame = read_frame(&mut server).await.unwrap();
            assert_eq!(frame.command_id.as_deref(), Some(format!("c-{i}").as_str()));
        }
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn clean_eof_is_peer_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(err.is_peer_closed(), "got {err:?}");
    }

    #[tokio::test]
    async fn eof_mid_prefix_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_all(&[0, 0]).await.unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected_without_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::Oversize { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn malformed_json_is_decode_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let junk = b"not json at all";
        client
            .write_all(&(junk.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(junk).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)), "got {err:?}");
    }
}
