//! Pose Stream Wire Protocol
//!
//! This crate defines the messages exchanged between the pose camera app and
//! the session server. Every datagram in either direction is a single UTF-8
//! JSON object.
//!
//! # Message Categories
//!
//! - **Control plane**: the client's hello (carries `sessionUUID`), the
//!   server's `HANDSHAKE` reply, and the server's `REQUESTS` disconnect.
//! - **Data plane**: stream payloads (pose frames). Their schema is opaque to
//!   this crate; they are any object without a `sessionUUID` key.
//!
//! Both planes share one socket, so [`classify`] is the single decision point
//! between them.

#![deny(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Key whose presence marks a datagram as a handshake request.
pub const SESSION_ID_FIELD: &str = "sessionUUID";

/// Optional display name sent by the app alongside the hello.
pub const USER_NAME_FIELD: &str = "userName";

/// Optional app version sent alongside the hello (`major.minor.patch`).
pub const APP_VERSION_FIELD: &str = "version";

/// Optional device model sent alongside the hello.
pub const DEVICE_NAME_FIELD: &str = "deviceName";

/// Fields whose presence marks a stream payload as pose frame data.
pub const FRAME_DATA_FIELDS: [&str; 3] = ["Body", "LeftHand", "RightHand"];

/// Largest datagram the server reads in one receive.
pub const MAX_DATAGRAM_SIZE: usize = 65304;

/// Request asking the app to stop streaming and drop the session.
pub const DISCONNECT_REQUEST: &str = r#"{"REQUESTS":["DISCONNECT"]}"#;

// ============================================================================
// Errors
// ============================================================================

/// A datagram that could not be turned into a [`ParsedMessage`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("datagram is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Invalid handshake configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("handshake name must not be empty")]
    EmptyName,

    #[error("camera FPS must be greater than zero")]
    ZeroCameraFps,

    #[error("unknown rig {0:?} (expected UE4 or Mixamo)")]
    UnknownRig(String),

    #[error(
        "unknown tracking mode {0:?} (expected Room, Desktop, Portrait, RoomBodyOnly or PortraitBodyOnly)"
    )]
    UnknownMode(String),

    #[error("failed to serialize handshake: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Version string that is not `major[.minor[.patch]]` with numeric parts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid app version {0:?}")]
pub struct ParseVersionError(pub String);

// ============================================================================
// Inbound Messages
// ============================================================================

/// A datagram that decoded to a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    fields: Map<String, Value>,
}

impl ParsedMessage {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

impl From<Map<String, Value>> for ParsedMessage {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// Client hello: registers (or re-registers) a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub session_id: String,
    pub user_name: Option<String>,
    pub app_version: Option<String>,
    pub device_name: Option<String>,
}

/// Streamed data from an app. The schema belongs to downstream consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPayload {
    pub fields: Map<String, Value>,
}

impl StreamPayload {
    /// True if the payload carries body or hand data.
    pub fn is_frame_data(&self) -> bool {
        FRAME_DATA_FIELDS
            .iter()
            .any(|key| self.fields.contains_key(*key))
    }

    /// App-side capture timestamp, if present.
    pub fn timestamp(&self) -> Option<f64> {
        self.fields.get("Timestamp").and_then(Value::as_f64)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Classified inbound datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    HandshakeRequest(HandshakeRequest),
    StreamPayload(StreamPayload),
}

impl InboundMessage {
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::HandshakeRequest(_))
    }
}

/// Decode raw datagram bytes into a JSON object.
pub fn decode(bytes: &[u8]) -> Result<ParsedMessage, DecodeError> {
    let text = std::str::from_utf8(bytes)?;
    match serde_json::from_str::<Value>(text)? {
        Value::Object(fields) => Ok(ParsedMessage { fields }),
        other => Err(DecodeError::NotAnObject(value_kind(&other))),
    }
}

/// Split a parsed message into control plane or data plane.
///
/// Total: every parsed message is exactly one of the two variants, decided
/// only by the presence of [`SESSION_ID_FIELD`].
pub fn classify(message: ParsedMessage) -> InboundMessage {
    let mut fields = message.fields;
    let Some(id) = fields.remove(SESSION_ID_FIELD) else {
        return InboundMessage::StreamPayload(StreamPayload { fields });
    };

    let session_id = match id {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let string_field = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_owned);

    InboundMessage::HandshakeRequest(HandshakeRequest {
        user_name: string_field(USER_NAME_FIELD),
        app_version: string_field(APP_VERSION_FIELD),
        device_name: string_field(DEVICE_NAME_FIELD),
        session_id,
    })
}

/// [`decode`] followed by [`classify`].
pub fn decode_message(bytes: &[u8]) -> Result<InboundMessage, DecodeError> {
    decode(bytes).map(classify)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============================================================================
// Handshake Configuration
// ============================================================================

/// Skeleton naming convention the app streams in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rig {
    #[serde(rename = "UE4")]
    Ue4,
    Mixamo,
}

impl Rig {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ue4 => "UE4",
            Self::Mixamo => "Mixamo",
        }
    }
}

impl fmt::Display for Rig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ue4" => Ok(Self::Ue4),
            "mixamo" => Ok(Self::Mixamo),
            _ => Err(ConfigError::UnknownRig(s.to_string())),
        }
    }
}

/// Camera framing / tracking mode requested from the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingMode {
    Room,
    Desktop,
    Portrait,
    RoomBodyOnly,
    PortraitBodyOnly,
}

impl TrackingMode {
    pub const ALL: [TrackingMode; 5] = [
        Self::Room,
        Self::Desktop,
        Self::Portrait,
        Self::RoomBodyOnly,
        Self::PortraitBodyOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Room => "Room",
            Self::Desktop => "Desktop",
            Self::Portrait => "Portrait",
            Self::RoomBodyOnly => "RoomBodyOnly",
            Self::PortraitBodyOnly => "PortraitBodyOnly",
        }
    }

    /// Body-only modes do not stream hands.
    pub fn includes_hands(&self) -> bool {
        !matches!(self, Self::RoomBodyOnly | Self::PortraitBodyOnly)
    }
}

impl fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::UnknownMode(s.to_string()))
    }
}

/// Configuration pushed to every app that says hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Shown in the app.
    pub name: String,
    pub rig: Rig,
    pub mode: TrackingMode,
    pub mirror: bool,
    /// App smooths output to this rate. 0 selects async mode.
    pub sync_fps: u32,
    /// Requested camera capture rate.
    pub camera_fps: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            name: "PoseStream".to_string(),
            rig: Rig::Ue4,
            mode: TrackingMode::Desktop,
            mirror: true,
            sync_fps: 60,
            camera_fps: 60,
        }
    }
}

impl HandshakeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.camera_fps == 0 {
            return Err(ConfigError::ZeroCameraFps);
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "UPPERCASE")]
enum YesNo {
    Yes,
    No,
}

#[derive(Serialize)]
struct HandshakeEnvelope<'a> {
    #[serde(rename = "HANDSHAKE")]
    handshake: HandshakeBody<'a>,
}

// Field order here is the byte order on the wire.
#[derive(Serialize)]
struct HandshakeBody<'a> {
    name: &'a str,
    rig: Rig,
    mode: TrackingMode,
    mirror: YesNo,
    #[serde(rename = "syncFPS")]
    sync_fps: u32,
    #[serde(rename = "cameraFPS")]
    camera_fps: u32,
}

/// Serialize the `HANDSHAKE` reply for `config`.
///
/// Output is byte-identical for equal configurations.
pub fn encode_handshake(config: &HandshakeConfig) -> Result<Bytes, ConfigError> {
    config.validate()?;
    let envelope = HandshakeEnvelope {
        handshake: HandshakeBody {
            name: &config.name,
            rig: config.rig,
            mode: config.mode,
            mirror: if config.mirror { YesNo::Yes } else { YesNo::No },
            sync_fps: config.sync_fps,
            camera_fps: config.camera_fps,
        },
    };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

/// Handshake reply serialized once and shared by every session.
#[derive(Debug, Clone)]
pub struct EncodedHandshake {
    config: HandshakeConfig,
    bytes: Bytes,
}

impl EncodedHandshake {
    pub fn new(config: HandshakeConfig) -> Result<Self, ConfigError> {
        let bytes = encode_handshake(&config)?;
        Ok(Self { config, bytes })
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    /// Cached reply bytes. Cloning is a reference count bump.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

/// Bytes of [`DISCONNECT_REQUEST`].
pub fn encode_disconnect() -> Bytes {
    Bytes::from_static(DISCONNECT_REQUEST.as_bytes())
}

// ============================================================================
// App Version
// ============================================================================

/// App version reported in the hello, compared component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl AppVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for AppVersion {
    type Err = ParseVersionError;

    /// Missing minor/patch components count as zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_string());
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(err());
        }

        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| err())?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_request_classified() {
        let msg = decode_message(br#"{"sessionUUID":"abc-123"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::HandshakeRequest(HandshakeRequest {
                session_id: "abc-123".to_string(),
                user_name: None,
                app_version: None,
                device_name: None,
            })
        );
    }

    #[test]
    fn test_handshake_request_optional_fields() {
        let msg = decode_message(
            br#"{"sessionUUID":"s1","userName":"Ana","version":"1.2.5","deviceName":"iPhone12,1"}"#,
        )
        .unwrap();
        let InboundMessage::HandshakeRequest(req) = msg else {
            panic!("expected handshake request");
        };
        assert_eq!(req.user_name.as_deref(), Some("Ana"));
        assert_eq!(req.app_version.as_deref(), Some("1.2.5"));
        assert_eq!(req.device_name.as_deref(), Some("iPhone12,1"));
    }

    #[test]
    fn test_non_string_session_id_still_handshake() {
        let msg = decode_message(br#"{"sessionUUID":42}"#).unwrap();
        let InboundMessage::HandshakeRequest(req) = msg else {
            panic!("expected handshake request");
        };
        assert_eq!(req.session_id, "42");
    }

    #[test]
    fn test_stream_payload_classified() {
        let msg = decode_message(br#"{"pose":[1,2,3]}"#).unwrap();
        let InboundMessage::StreamPayload(payload) = msg else {
            panic!("expected stream payload");
        };
        assert_eq!(payload.get("pose"), Some(&serde_json::json!([1, 2, 3])));
        assert!(!payload.is_frame_data());
    }

    /// Classification is decided by the session key alone.
    #[test]
    fn test_classification_totality() {
        let samples: [&[u8]; 6] = [
            br#"{}"#,
            br#"{"sessionUUID":null}"#,
            br#"{"SESSIONUUID":"x"}"#,
            br#"{"Body":{},"sessionUUID":"x"}"#,
            br#"{"nested":{"sessionUUID":"x"}}"#,
            br#"{"sessionUUID":""}"#,
        ];
        for bytes in samples {
            let parsed = decode(bytes).unwrap();
            let has_key = parsed.fields().contains_key(SESSION_ID_FIELD);
            assert_eq!(classify(parsed).is_handshake(), has_key);
        }
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(matches!(
            decode(b"not json"),
            Err(DecodeError::InvalidJson(_))
        ));
        assert!(matches!(decode(b""), Err(DecodeError::InvalidJson(_))));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        assert!(matches!(
            decode(&[0x7b, 0xff, 0xfe, 0x7d]),
            Err(DecodeError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert!(matches!(
            decode(b"[1,2,3]"),
            Err(DecodeError::NotAnObject("an array"))
        ));
        assert!(matches!(
            decode(br#""sessionUUID""#),
            Err(DecodeError::NotAnObject("a string"))
        ));
    }

    #[test]
    fn test_frame_data_detection() {
        for key in FRAME_DATA_FIELDS {
            let json = format!(r#"{{"{key}":{{}},"Timestamp":12.5}}"#);
            let InboundMessage::StreamPayload(payload) = decode_message(json.as_bytes()).unwrap()
            else {
                panic!("expected stream payload");
            };
            assert!(payload.is_frame_data());
            assert_eq!(payload.timestamp(), Some(12.5));
        }
    }

    #[test]
    fn test_default_handshake_bytes() {
        let bytes = encode_handshake(&HandshakeConfig::default()).unwrap();
        assert_eq!(
            &bytes[..],
            br#"{"HANDSHAKE":{"name":"PoseStream","rig":"UE4","mode":"Desktop","mirror":"YES","syncFPS":60,"cameraFPS":60}}"#
        );
    }

    #[test]
    fn test_handshake_async_unmirrored() {
        let config = HandshakeConfig {
            name: "Studio".to_string(),
            rig: Rig::Mixamo,
            mode: TrackingMode::PortraitBodyOnly,
            mirror: false,
            sync_fps: 0,
            camera_fps: 30,
        };
        let bytes = encode_handshake(&config).unwrap();
        assert_eq!(
            &bytes[..],
            br#"{"HANDSHAKE":{"name":"Studio","rig":"Mixamo","mode":"PortraitBodyOnly","mirror":"NO","syncFPS":0,"cameraFPS":30}}"#
        );
    }

    #[test]
    fn test_handshake_determinism() {
        let config = HandshakeConfig {
            mode: TrackingMode::Room,
            ..Default::default()
        };
        let first = encode_handshake(&config).unwrap();
        for _ in 0..10 {
            assert_eq!(encode_handshake(&config.clone()).unwrap(), first);
        }
        assert_eq!(EncodedHandshake::new(config).unwrap().bytes(), first);
    }

    #[test]
    fn test_handshake_config_validation() {
        let config = HandshakeConfig {
            camera_fps: 0,
            ..Default::default()
        };
        assert!(matches!(
            EncodedHandshake::new(config),
            Err(ConfigError::ZeroCameraFps)
        ));

        let config = HandshakeConfig {
            name: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            encode_handshake(&config),
            Err(ConfigError::EmptyName)
        ));
    }

    #[test]
    fn test_handshake_is_valid_json() {
        let bytes = encode_handshake(&HandshakeConfig::default()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["HANDSHAKE"]["syncFPS"], 60);
        assert_eq!(value["HANDSHAKE"]["mirror"], "YES");
    }

    #[test]
    fn test_rig_and_mode_parsing() {
        assert_eq!("ue4".parse::<Rig>().unwrap(), Rig::Ue4);
        assert_eq!("MIXAMO".parse::<Rig>().unwrap(), Rig::Mixamo);
        assert!("unity".parse::<Rig>().is_err());

        for mode in TrackingMode::ALL {
            assert_eq!(mode.as_str().parse::<TrackingMode>().unwrap(), mode);
        }
        assert_eq!(
            "roombodyonly".parse::<TrackingMode>().unwrap(),
            TrackingMode::RoomBodyOnly
        );
        assert!(!TrackingMode::RoomBodyOnly.includes_hands());
        assert!(TrackingMode::Portrait.includes_hands());
        assert!("Landscape".parse::<TrackingMode>().is_err());
    }

    #[test]
    fn test_disconnect_request() {
        let value: Value = serde_json::from_slice(&encode_disconnect()).unwrap();
        assert_eq!(value, serde_json::json!({"REQUESTS": ["DISCONNECT"]}));
        // The app must never mistake it for a hello.
        assert!(!decode_message(&encode_disconnect()).unwrap().is_handshake());
    }

    #[test]
    fn test_app_version_parse_and_order() {
        let v: AppVersion = "1.2.5".parse().unwrap();
        assert_eq!(v, AppVersion::new(1, 2, 5));
        assert_eq!("2".parse::<AppVersion>().unwrap(), AppVersion::new(2, 0, 0));
        assert_eq!(
            " 1.10 ".parse::<AppVersion>().unwrap(),
            AppVersion::new(1, 10, 0)
        );
        assert!("1.2.x".parse::<AppVersion>().is_err());
        assert!("1.2.3.4".parse::<AppVersion>().is_err());
        assert!("".parse::<AppVersion>().is_err());

        assert!(AppVersion::new(1, 10, 0) > AppVersion::new(1, 2, 5));
        assert!(AppVersion::new(1, 2, 4) < AppVersion::new(1, 2, 5));
        assert_eq!(v.to_string(), "1.2.5");
    }
}
