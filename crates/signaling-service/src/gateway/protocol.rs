//! Gateway wire protocol.
//!
//! JSON messages exchanged with a Janus gateway over its WebSocket
//! transport. Every request carries a `transaction`; replies come back as
//! `ack`, `success` or `error` with the same transaction, and asynchronous
//! events are addressed to a plugin handle through `sender`.

use common::types::{FeedId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// WebSocket subprotocol the gateway requires.
pub const SUBPROTOCOL: &str = "janus-protocol";

/// Plugin every publisher and subscriber handle attaches to.
pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// Gateway control-session identifier.
pub type SessionId = u64;

/// Plugin handle identifier.
pub type HandleId = u64;

/// SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl Jsep {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// Trickle ICE candidate, or the end-of-candidates marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceCandidate {
    #[serde(rename_all = "camelCase")]
    Candidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_m_line_index: Option<u32>,
    },
    Completed { completed: bool },
}

impl IceCandidate {
    /// The end-of-candidates marker.
    #[must_use]
    pub fn completed() -> Self {
        IceCandidate::Completed { completed: true }
    }
}

/// `plugindata` block of a plugin reply or event.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginData {
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub data: Value,
}

/// `error` block of a core error reply.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

/// `data` block of a core success reply (`create`, `attach`).
#[derive(Debug, Clone, Deserialize)]
pub struct SuccessData {
    pub id: u64,
}

/// Messages received from the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum GatewayMessage {
    Ack {
        transaction: Option<String>,
    },
    Success {
        transaction: Option<String>,
        data: Option<SuccessData>,
        plugindata: Option<PluginData>,
    },
    Error {
        transaction: Option<String>,
        error: ErrorDetail,
    },
    #[serde(rename = "server_info")]
    ServerInfo {
        transaction: Option<String>,
    },
    Event {
        sender: HandleId,
        transaction: Option<String>,
        plugindata: Option<PluginData>,
        jsep: Option<Jsep>,
    },
    Webrtcup {
        sender: HandleId,
    },
    Media {
        sender: HandleId,
        #[serde(rename = "type")]
        kind: Option<String>,
        receiving: Option<bool>,
    },
    Slowlink {
        sender: HandleId,
        #[serde(default)]
        uplink: bool,
    },
    Hangup {
        sender: HandleId,
        reason: Option<String>,
    },
    Detached {
        sender: HandleId,
    },
    Trickle {
        sender: HandleId,
        candidate: IceCandidate,
    },
    Timeout {
        session_id: SessionId,
    },
    #[serde(other)]
    Other,
}

impl GatewayMessage {
    /// Transaction this message answers, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<&str> {
        match self {
            GatewayMessage::Ack { transaction }
            | GatewayMessage::Success { transaction, .. }
            | GatewayMessage::Error { transaction, .. }
            | GatewayMessage::ServerInfo { transaction }
            | GatewayMessage::Event { transaction, .. } => transaction.as_deref(),
            _ => None,
        }
    }
}

/// One entry of a publisher list announced by the videoroom plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherInfo {
    pub id: FeedId,
    #[serde(default)]
    pub display: Option<String>,
}

/// Room entry of a videoroom `list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomDetails {
    pub room: RoomId,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub num_participants: Option<u64>,
    #[serde(default)]
    pub max_publishers: Option<u64>,
    #[serde(default)]
    pub pin_required: Option<bool>,
}

/// Videoroom plugin payload (`plugindata.data`).
///
/// `leaving` and `unpublished` carry either a feed ID or the string `"ok"`
/// (the reply to the participant's own leave/unpublish), so they stay raw.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoRoomData {
    pub videoroom: Option<String>,
    pub id: Option<FeedId>,
    pub room: Option<RoomId>,
    pub publishers: Option<Vec<PublisherInfo>>,
    pub leaving: Option<Value>,
    pub unpublished: Option<Value>,
    pub error_code: Option<i64>,
    pub error: Option<String>,
    pub list: Option<Vec<RoomDetails>>,
}

impl VideoRoomData {
    /// Parse a plugin payload, tolerating unexpected shapes.
    #[must_use]
    pub fn from_value(data: &Value) -> Self {
        serde_json::from_value(data.clone()).unwrap_or_default()
    }

    /// Feed that left the room, ignoring the `"ok"` acknowledgement.
    #[must_use]
    pub fn leaving_feed(&self) -> Option<FeedId> {
        self.leaving.as_ref().and_then(feed_from_value)
    }

    /// Feed that stopped publishing, ignoring the `"ok"` acknowledgement.
    #[must_use]
    pub fn unpublished_feed(&self) -> Option<FeedId> {
        self.unpublished.as_ref().and_then(feed_from_value)
    }
}

fn feed_from_value(value: &Value) -> Option<FeedId> {
    match value {
        Value::String(s) if s == "ok" => None,
        other => serde_json::from_value(other.clone()).ok(),
    }
}

/// JSON form of a room ID in gateway requests.
///
/// With string IDs enabled the gateway expects strings; otherwise numeric
/// rooms must be sent as numbers.
#[must_use]
pub fn room_value(room: &RoomId, string_ids: bool) -> Value {
    match (string_ids, room.as_numeric()) {
        (false, Some(n)) => Value::from(n),
        _ => Value::from(room.as_str()),
    }
}

/// JSON form of a feed ID in gateway requests.
#[must_use]
pub fn feed_value(feed: &FeedId) -> Value {
    match feed {
        FeedId::Numeric(n) => Value::from(*n),
        FeedId::Text(s) => Value::from(s.as_str()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ack_and_success() {
        let ack: GatewayMessage =
            serde_json::from_value(json!({"janus": "ack", "session_id": 1, "transaction": "t1"}))
                .unwrap();
        assert_eq!(ack.transaction(), Some("t1"));

        let success: GatewayMessage = serde_json::from_value(json!({
            "janus": "success",
            "transaction": "t2",
            "data": {"id": 8_812_345}
        }))
        .unwrap();
        match success {
            GatewayMessage::Success { data, .. } => assert_eq!(data.unwrap().id, 8_812_345),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_event_with_jsep() {
        let msg: GatewayMessage = serde_json::from_value(json!({
            "janus": "event",
            "session_id": 1,
            "sender": 77,
            "transaction": "t3",
            "plugindata": {
                "plugin": "janus.plugin.videoroom",
                "data": {"videoroom": "joined", "room": "R1", "id": 5, "publishers": []}
            },
            "jsep": {"type": "answer", "sdp": "v=0"}
        }))
        .unwrap();

        match msg {
            GatewayMessage::Event {
                sender,
                plugindata,
                jsep,
                ..
            } => {
                assert_eq!(sender, 77);
                assert_eq!(jsep, Some(Jsep::answer("v=0")));
                let data = VideoRoomData::from_value(&plugindata.unwrap().data);
                assert_eq!(data.videoroom.as_deref(), Some("joined"));
                assert_eq!(data.id, Some(FeedId::Numeric(5)));
                assert_eq!(data.room, Some(RoomId::new("R1")));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_janus_type_is_other() {
        let msg: GatewayMessage =
            serde_json::from_value(json!({"janus": "something-new", "sender": 1})).unwrap();
        assert!(matches!(msg, GatewayMessage::Other));
    }

    #[test]
    fn test_trickle_candidate_forms() {
        let candidate: IceCandidate = serde_json::from_value(json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();
        assert!(matches!(candidate, IceCandidate::Candidate { sdp_m_line_index: Some(0), .. }));

        let completed: IceCandidate = serde_json::from_value(json!({"completed": true})).unwrap();
        assert_eq!(completed, IceCandidate::completed());
    }

    #[test]
    fn test_leaving_ok_is_not_a_feed() {
        let own = VideoRoomData::from_value(&json!({"videoroom": "event", "leaving": "ok"}));
        assert_eq!(own.leaving_feed(), None);

        let other = VideoRoomData::from_value(&json!({"videoroom": "event", "leaving": 42}));
        assert_eq!(other.leaving_feed(), Some(FeedId::Numeric(42)));

        let unpublished = VideoRoomData::from_value(&json!({"videoroom": "event", "unpublished": 9}));
        assert_eq!(unpublished.unpublished_feed(), Some(FeedId::Numeric(9)));
    }

    #[test]
    fn test_room_value_respects_string_ids() {
        let numeric = RoomId::new("9999");
        assert_eq!(room_value(&numeric, false), json!(9999));
        assert_eq!(room_value(&numeric, true), json!("9999"));

        let generated = RoomId::new("a1b2c3");
        assert_eq!(room_value(&generated, false), json!("a1b2c3"));
    }
}
