//! Client-facing signaling messages.
//!
//! Inbound frames are `{"type": ..., "data": {...}}`. Outbound frames use
//! the same envelope, except `error`, which is flat
//! (`{"type":"error","code":...,"message":...}`), and `connection-ready`,
//! which carries no `data`.

use crate::gateway::protocol::{IceCandidate, Jsep};
use crate::registry::ParticipantInfo;

use common::types::{FeedId, RoomId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Which peer connection a JSEP or candidate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Usage {
    Publish,
    Subscribe,
}

/// Message received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Offer to publish the participant's own media.
    Publish { jsep: Jsep },
    Subscribe { target_feed_id: FeedId },
    /// Answer to a subscription offer.
    SdpAnswer { target_feed_id: FeedId, jsep: Jsep },
    IceCandidate {
        usage: Usage,
        target_feed_id: Option<FeedId>,
        candidate: IceCandidate,
    },
    /// Chat text; `None` when absent or not a string.
    SendMessage { text: Option<String> },
    AiQuery { query: String },
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct PublishData {
    jsep: Jsep,
}

#[derive(Deserialize)]
struct SdpOfferData {
    usage: Usage,
    jsep: Jsep,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeData {
    target_feed_id: FeedId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SdpAnswerData {
    target_feed_id: FeedId,
    jsep: Jsep,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceCandidateData {
    usage: Usage,
    #[serde(default)]
    target_feed_id: Option<FeedId>,
    candidate: IceCandidate,
}

#[derive(Deserialize)]
struct AiQueryData {
    query: String,
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, ParseError> {
    serde_json::from_value(data).map_err(|e| ParseError::Malformed(format!("{kind}: {e}")))
}

impl ClientMessage {
    /// Parse one text frame.
    ///
    /// # Errors
    ///
    /// `Malformed` for invalid JSON or a payload missing required fields,
    /// `UnknownType` for a well-formed envelope with an unrecognized `type`.
    pub fn parse(frame: &str) -> Result<Self, ParseError> {
        let Envelope { kind, data } =
            serde_json::from_str(frame).map_err(|e| ParseError::Malformed(e.to_string()))?;

        match kind.as_str() {
            "publish" => {
                let PublishData { jsep } = payload(&kind, data)?;
                Ok(ClientMessage::Publish { jsep })
            }
            // Browsers send their publish offer as `sdp-offer` with usage=publish
            "sdp-offer" => match payload::<SdpOfferData>(&kind, data)? {
                SdpOfferData {
                    usage: Usage::Publish,
                    jsep,
                } => Ok(ClientMessage::Publish { jsep }),
                SdpOfferData {
                    usage: Usage::Subscribe,
                    ..
                } => Err(ParseError::Malformed(
                    "sdp-offer: subscribe offers come from the server".to_string(),
                )),
            },
            "subscribe" => {
                let SubscribeData { target_feed_id } = payload(&kind, data)?;
                Ok(ClientMessage::Subscribe { target_feed_id })
            }
            "sdp-answer" => {
                let SdpAnswerData {
                    target_feed_id,
                    jsep,
                } = payload(&kind, data)?;
                Ok(ClientMessage::SdpAnswer {
                    target_feed_id,
                    jsep,
                })
            }
            "ice-candidate" => {
                let IceCandidateData {
                    usage,
                    target_feed_id,
                    candidate,
                } = payload(&kind, data)?;
                Ok(ClientMessage::IceCandidate {
                    usage,
                    target_feed_id,
                    candidate,
                })
            }
            "send-message" => Ok(ClientMessage::SendMessage {
                text: data
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            "ai-query" => {
                let AiQueryData { query } = payload(&kind, data)?;
                Ok(ClientMessage::AiQuery { query })
            }
            _ => Err(ParseError::UnknownType(kind)),
        }
    }

    /// Metric label for this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Publish { .. } => "publish",
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::SdpAnswer { .. } => "sdp-answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::SendMessage { .. } => "send-message",
            ClientMessage::AiQuery { .. } => "ai-query",
        }
    }
}

/// One entry of `joined.participants`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantEntry {
    pub feed_id: FeedId,
    pub user_info: ParticipantInfo,
}

/// Identity shown for a feed announced by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncedUser {
    pub display_name: Option<String>,
}

/// `user` field of `participant-joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum JoinedUser {
    Registered(ParticipantInfo),
    Announced(AnnouncedUser),
}

/// Message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    ConnectionReady,
    #[serde(rename_all = "camelCase")]
    Joined {
        room_id: RoomId,
        feed_id: FeedId,
        participants: Vec<ParticipantEntry>,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        room_id: RoomId,
        feed_id: FeedId,
        user: JoinedUser,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        room_id: RoomId,
        user_id: Option<String>,
        feed_id: Option<FeedId>,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    SdpOffer {
        usage: Usage,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_feed_id: Option<FeedId>,
        jsep: Jsep,
    },
    SdpAnswer {
        usage: Usage,
        jsep: Jsep,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        usage: Usage,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_feed_id: Option<FeedId>,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: RoomId,
        from: ParticipantInfo,
        text: String,
        timestamp: String,
    },
    AiError {
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// Flat `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "error")]
pub struct ErrorMessage {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorMessage {
    #[must_use]
    pub fn new(code: impl Into<String>, message: Option<String>) -> Self {
        Self {
            code: code.into(),
            message,
        }
    }

    #[must_use]
    pub fn unknown_type() -> Self {
        Self::new("UNKNOWN_MESSAGE_TYPE", None)
    }
}
