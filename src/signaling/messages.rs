//! Message Types für das Signaling-Protokoll
//!
//! Ausgehend: `{ action, data, requestId? }`.
//! Eingehend: Antworten `{ action, success, data?, error?, requestId? }` oder
//! Events `{ type, data }`.

use crate::call_engine::{IceCandidate, MediaKind, SessionDescription};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// ACTION NAMES
// ============================================================================

pub mod actions {
    pub const CALL_OFFER: &str = "call:offer";
    pub const CALL_ANSWER: &str = "call:answer";
    pub const CALL_ICE_CANDIDATE: &str = "call:ice_candidate";
    pub const CALL_REJECT: &str = "call:reject";
    pub const CALL_END: &str = "call:end";

    pub const PING: &str = "ping";
    pub const JOIN_ROOM: &str = "join_room";
    pub const LEAVE_ROOM: &str = "leave_room";
}

// ============================================================================
// CLIENT → SERVER
// ============================================================================

/// Umschlag für alle ausgehenden Nachrichten
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub action: String,
    pub data: Value,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            data,
            request_id: None,
        }
    }

    pub fn request(action: impl Into<String>, data: Value, request_id: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            data,
            request_id: Some(request_id.into()),
        }
    }

    pub fn ping() -> Self {
        Self::new(actions::PING, Value::Object(Default::default()))
    }

    pub fn join_room(room: &str) -> Self {
        Self::new(actions::JOIN_ROOM, serde_json::json!({ "room": room }))
    }

    pub fn leave_room(room: &str) -> Self {
        Self::new(actions::LEAVE_ROOM, serde_json::json!({ "room": room }))
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// SERVER → CLIENT
// ============================================================================

/// Eingehende Nachricht (Event oder korrelierte Antwort)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type", default)]
    pub msg_type: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
}

impl InboundMessage {
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// Logischer Event-Typ: `type` hat Vorrang vor `action`
    pub fn event_type(&self) -> Option<&str> {
        self.msg_type.as_deref().or(self.action.as_deref())
    }

    /// Antwort auf einen `request()`-Aufruf?
    pub fn is_response(&self) -> bool {
        self.request_id.is_some() || self.success.is_some()
    }

    /// Fehlermeldung, falls die Antwort einen Fehler meldet
    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            Some(Value::Null) | None => {}
            Some(Value::String(message)) => return Some(message.clone()),
            Some(Value::Object(obj)) => {
                if let Some(Value::String(message)) = obj.get("message") {
                    return Some(message.clone());
                }
                return Some(Value::Object(obj.clone()).to_string());
            }
            Some(other) => return Some(other.to_string()),
        }

        if self.success == Some(false) {
            return Some("request failed".to_string());
        }
        None
    }

    /// Deserialisiert `data` in ein konkretes Payload
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

// ============================================================================
// CALL SIGNALING PAYLOADS
// ============================================================================

/// `call:offer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferSignal {
    #[serde(alias = "receiverId", default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(alias = "callerId", alias = "senderId", default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    pub call_id: String,
    pub call_type: MediaKind,
    pub offer: SessionDescription,
}

impl OfferSignal {
    pub fn new(target_user_id: String, call_id: String, call_type: MediaKind, offer: SessionDescription) -> Self {
        Self {
            target_user_id: Some(target_user_id),
            from_user_id: None,
            from_name: None,
            call_id,
            call_type,
            offer,
        }
    }
}

/// `call:answer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSignal {
    #[serde(alias = "receiverId", default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(alias = "callerId", alias = "senderId", default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub answer: SessionDescription,
}

impl AnswerSignal {
    pub fn new(target_user_id: String, call_id: String, answer: SessionDescription) -> Self {
        Self {
            target_user_id: Some(target_user_id),
            from_user_id: None,
            call_id: Some(call_id),
            answer,
        }
    }
}

/// `call:ice_candidate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateSignal {
    #[serde(alias = "receiverId", default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(alias = "callerId", alias = "senderId", default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub candidate: IceCandidate,
}

impl IceCandidateSignal {
    pub fn new(target_user_id: String, call_id: String, candidate: IceCandidate) -> Self {
        Self {
            target_user_id: Some(target_user_id),
            from_user_id: None,
            call_id: Some(call_id),
            candidate,
        }
    }
}

/// `call:reject` und `call:end` teilen sich dasselbe Format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HangupSignal {
    #[serde(alias = "receiverId", default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(alias = "callerId", alias = "senderId", default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HangupSignal {
    pub fn new(target_user_id: String, call_id: String, reason: Option<String>) -> Self {
        Self {
            target_user_id: Some(target_user_id),
            from_user_id: None,
            call_id: Some(call_id),
            reason,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::SdpType;
    use serde_json::json;

    #[test]
    fn test_outbound_request_shape() {
        let msg = OutboundMessage::request("orders:lock", json!({ "orderId": 42 }), "req-1");
        let value: Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "action": "orders:lock", "data": { "orderId": 42 }, "requestId": "req-1" })
        );

        let ping: Value = serde_json::from_str(&OutboundMessage::ping().to_frame().unwrap()).unwrap();
        assert_eq!(ping, json!({ "action": "ping", "data": {} }));
    }

    #[test]
    fn test_event_type_prefers_type_field() {
        let event = InboundMessage::parse(r#"{"type":"machine:status","data":{"id":3}}"#).unwrap();
        assert_eq!(event.event_type(), Some("machine:status"));
        assert!(!event.is_response());

        let response =
            InboundMessage::parse(r#"{"action":"orders:lock","success":true,"data":{}}"#).unwrap();
        assert_eq!(response.event_type(), Some("orders:lock"));
        assert!(response.is_response());
        assert_eq!(response.error_message(), None);
    }

    #[test]
    fn test_error_message_variants() {
        let plain = InboundMessage::parse(r#"{"action":"a","success":false,"error":"locked"}"#).unwrap();
        assert_eq!(plain.error_message().as_deref(), Some("locked"));

        let nested =
            InboundMessage::parse(r#"{"action":"a","error":{"code":409,"message":"conflict"}}"#).unwrap();
        assert_eq!(nested.error_message().as_deref(), Some("conflict"));

        let bare = InboundMessage::parse(r#"{"action":"a","success":false}"#).unwrap();
        assert_eq!(bare.error_message().as_deref(), Some("request failed"));
    }

    #[test]
    fn test_offer_signal_accepts_sender_aliases() {
        let msg = InboundMessage::parse(
            r#"{"type":"call:offer","data":{"callerId":"u-7","fromName":"Line 3","callId":"c-1",
                "callType":"video","offer":{"type":"offer","sdp":"v=0"}}}"#,
        )
        .unwrap();
        let offer: OfferSignal = msg.payload().unwrap();
        assert_eq!(offer.from_user_id.as_deref(), Some("u-7"));
        assert_eq!(offer.call_type, MediaKind::Video);
        assert_eq!(offer.offer.sdp_type, SdpType::Offer);
    }

    #[test]
    fn test_candidate_signal_wire_names() {
        let signal = IceCandidateSignal::new(
            "u-2".to_string(),
            "c-1".to_string(),
            IceCandidate {
                candidate: "candidate:1 1 UDP 1 10.0.0.2 5000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        );
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["targetUserId"], "u-2");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(value["candidate"]["sdpMid"], "0");

        let receiver_alias: HangupSignal =
            serde_json::from_value(json!({ "receiverId": "u-9", "reason": "busy" })).unwrap();
        assert_eq!(receiver_alias.target_user_id.as_deref(), Some("u-9"));
    }
}
