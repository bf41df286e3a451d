//! Signaling messages carried over the room event bus.
//!
//! Every payload that arrives from the bus is untrusted. The `is_*`
//! validators and `parse_*` helpers never panic and never produce an error:
//! anything that does not match the expected shape is reported as `false` /
//! `None` and the caller drops it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// STUN servers handed to every new native peer connection.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferType {
    #[serde(rename = "offer")]
    Offer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerType {
    #[serde(rename = "answer")]
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferMessage {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: OfferType,
}

impl OfferMessage {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: OfferType::Offer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerMessage {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: AnswerType,
}

impl AnswerMessage {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: AnswerType::Answer,
        }
    }
}

/// A trickled ICE candidate. `candidate: None` is the end-of-candidates
/// marker and must never reach the native add-candidate call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceMessage {
    pub candidate: Option<String>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceMessage {
    pub fn candidate(
        candidate: impl Into<String>,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Self {
        Self {
            candidate: Some(candidate.into()),
            sdp_mid,
            sdp_mline_index,
        }
    }

    pub fn end_of_candidates() -> Self {
        Self {
            candidate: None,
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StopMessage {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

/// An outbound signaling message produced by one of the cores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(OfferMessage),
    Answer(AnswerMessage),
    Ice(IceMessage),
    Stop(StopMessage),
}

impl Signal {
    /// The bus action used to ask the room to relay this message.
    pub fn request_action(&self) -> Action {
        match self {
            Signal::Offer(_) => Action::OfferRequest,
            Signal::Answer(_) => Action::AnswerRequest,
            Signal::Ice(_) => Action::IceRequest,
            Signal::Stop(_) => Action::StopRequest,
        }
    }

    pub fn to_payload(&self) -> Value {
        let encoded = match self {
            Signal::Offer(m) => serde_json::to_value(m),
            Signal::Answer(m) => serde_json::to_value(m),
            Signal::Ice(m) => serde_json::to_value(m),
            Signal::Stop(m) => serde_json::to_value(m),
        };
        // Plain structs of strings and integers always encode.
        encoded.unwrap_or(Value::Null)
    }
}

/// Bus action names. Outgoing requests and relayed deliveries use distinct
/// names even though their payloads share a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    OfferRequest,
    Offer,
    AnswerRequest,
    Answer,
    IceRequest,
    Ice,
    StopRequest,
    Stop,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::OfferRequest,
        Action::Offer,
        Action::AnswerRequest,
        Action::Answer,
        Action::IceRequest,
        Action::Ice,
        Action::StopRequest,
        Action::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::OfferRequest => "offer-request",
            Action::Offer => "offer",
            Action::AnswerRequest => "answer-request",
            Action::Answer => "answer",
            Action::IceRequest => "ice-request",
            Action::Ice => "ice",
            Action::StopRequest => "stop-request",
            Action::Stop => "stop",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Action::OfferRequest | Action::AnswerRequest | Action::IceRequest | Action::StopRequest
        )
    }

    /// The name a relay delivers a request under. Relayed names map to
    /// themselves.
    pub fn relayed(&self) -> Action {
        match self {
            Action::OfferRequest => Action::Offer,
            Action::AnswerRequest => Action::Answer,
            Action::IceRequest => Action::Ice,
            Action::StopRequest => Action::Stop,
            other => *other,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown bus action '{}'", self.0)
    }
}

impl std::error::Error for UnknownAction {}

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

fn has_sdp_with_type(value: &Value, expected: &str) -> bool {
    match value.as_object() {
        Some(obj) => {
            obj.get("sdp").map_or(false, Value::is_string)
                && obj.get("type").and_then(Value::as_str) == Some(expected)
        }
        None => false,
    }
}

pub fn is_offer(value: &Value) -> bool {
    has_sdp_with_type(value, "offer")
}

pub fn is_answer(value: &Value) -> bool {
    has_sdp_with_type(value, "answer")
}

/// Only the presence of the `candidate` key is required; `null` is valid.
pub fn is_ice(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => matches!(obj.get("candidate"), Some(Value::String(_)) | Some(Value::Null)),
        None => false,
    }
}

/// Any object is a stop, `{}` included.
pub fn is_stop(value: &Value) -> bool {
    value.is_object()
}

pub fn parse_offer(value: &Value) -> Option<OfferMessage> {
    if !is_offer(value) {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

pub fn parse_answer(value: &Value) -> Option<AnswerMessage> {
    if !is_answer(value) {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

pub fn parse_ice(value: &Value) -> Option<IceMessage> {
    if !is_ice(value) {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

/// A non-string `reason` is ignored rather than rejecting the stop.
pub fn parse_stop(value: &Value) -> Option<StopMessage> {
    if !is_stop(value) {
        return None;
    }
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(StopMessage { reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_and_answer_require_discriminant() {
        assert!(is_offer(&json!({"sdp": "v=0", "type": "offer"})));
        assert!(!is_offer(&json!({"sdp": "v=0", "type": "answer"})));
        assert!(!is_offer(&json!({"sdp": "v=0"})));
        assert!(!is_offer(&json!({"type": "offer"})));
        assert!(!is_offer(&json!({"sdp": 42, "type": "offer"})));
        assert!(is_answer(&json!({"sdp": "v=0", "type": "answer"})));
        assert!(!is_answer(&json!({"sdp": "v=0", "type": "offer"})));
    }

    #[test]
    fn test_validators_reject_non_objects() {
        for value in [json!(null), json!("offer"), json!(7), json!([1, 2]), json!(true)] {
            assert!(!is_offer(&value));
            assert!(!is_answer(&value));
            assert!(!is_ice(&value));
            assert!(!is_stop(&value));
        }
    }

    #[test]
    fn test_ice_permits_null_candidate() {
        assert!(is_ice(&json!({"candidate": null})));
        assert!(is_ice(&json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host"})));
        assert!(!is_ice(&json!({"sdpMid": "0"})));
        assert!(!is_ice(&json!({"candidate": 5})));

        let parsed = parse_ice(&json!({"candidate": null})).expect("null candidate parses");
        assert_eq!(parsed, IceMessage::end_of_candidates());
    }

    #[test]
    fn test_parse_ice_reads_camel_case_fields() {
        let parsed = parse_ice(&json!({
            "candidate": "candidate:1",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();
        assert_eq!(parsed.candidate.as_deref(), Some("candidate:1"));
        assert_eq!(parsed.sdp_mid.as_deref(), Some("0"));
        assert_eq!(parsed.sdp_mline_index, Some(0));

        // Wrongly typed optional fields are discarded, not coerced.
        assert!(parse_ice(&json!({"candidate": "c", "sdpMLineIndex": "zero"})).is_none());
    }

    #[test]
    fn test_stop_accepts_any_object() {
        assert_eq!(parse_stop(&json!({})), Some(StopMessage::default()));
        assert_eq!(
            parse_stop(&json!({"reason": "user"})),
            Some(StopMessage::with_reason("user"))
        );
        assert_eq!(parse_stop(&json!({"reason": 3})), Some(StopMessage::default()));
        assert_eq!(parse_stop(&json!(null)), None);
    }

    #[test]
    fn test_signal_payload_matches_wire_shape() {
        let offer = Signal::Offer(OfferMessage::new("X"));
        assert_eq!(offer.request_action(), Action::OfferRequest);
        assert_eq!(offer.to_payload(), json!({"sdp": "X", "type": "offer"}));

        let ice = Signal::Ice(IceMessage::candidate("c", Some("0".into()), Some(0)));
        assert_eq!(
            ice.to_payload(),
            json!({"candidate": "c", "sdpMid": "0", "sdpMLineIndex": 0})
        );

        let stop = Signal::Stop(StopMessage::default());
        assert_eq!(stop.to_payload(), json!({}));
    }

    #[test]
    fn test_action_names() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>(), Ok(action));
            if action.is_request() {
                assert_eq!(format!("{}-request", action.relayed()), action.as_str());
            } else {
                assert_eq!(action.relayed(), action);
            }
        }
        assert!("offer-requested".parse::<Action>().is_err());
    }
}
