//! Control and telemetry message shapes.
//!
//! Client -> server control: `{"client_id": "...", "action": "100"|"600"|"800"}`.
//! Server -> client acks: `{"msg": "100_1"|"600_1"|"800_1"}`.
//! Anything else a client sends is a telemetry object, opaque to the registry.
//!
//! Inbound payloads are validated before any field is used; a bad payload is a
//! `ProtocolError`, never a panic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "100")]
    Register,
    #[serde(rename = "600")]
    Reconnect,
    #[serde(rename = "800")]
    Disconnect,
}

impl Action {
    pub fn code(self) -> &'static str {
        match self {
            Action::Register => "100",
            Action::Reconnect => "600",
            Action::Disconnect => "800",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "100" => Some(Action::Register),
            "600" => Some(Action::Reconnect),
            "800" => Some(Action::Disconnect),
            _ => None,
        }
    }

    /// The acknowledgement the server answers this action with.
    pub fn ack(self) -> AckCode {
        match self {
            Action::Register => AckCode::RegisterAck,
            Action::Reconnect => AckCode::ReconnectAck,
            Action::Disconnect => AckCode::DisconnectAck,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckCode {
    #[serde(rename = "100_1")]
    RegisterAck,
    #[serde(rename = "600_1")]
    ReconnectAck,
    #[serde(rename = "800_1")]
    DisconnectAck,
}

impl AckCode {
    pub fn code(self) -> &'static str {
        match self {
            AckCode::RegisterAck => "100_1",
            AckCode::ReconnectAck => "600_1",
            AckCode::DisconnectAck => "800_1",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "100_1" => Some(AckCode::RegisterAck),
            "600_1" => Some(AckCode::ReconnectAck),
            "800_1" => Some(AckCode::DisconnectAck),
            _ => None,
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(alias = "id")]
    pub client_id: String,
    pub action: Action,
}

impl ControlRequest {
    pub fn new(client_id: &str, action: Action) -> Self {
        Self {
            client_id: client_id.to_string(),
            action,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub msg: AckCode,
}

impl Ack {
    pub fn new(msg: AckCode) -> Self {
        Self { msg }
    }
}

/// A message received by the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Control(ControlRequest),
    Telemetry(Value),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not JSON, or not a JSON object.
    Malformed(String),
    /// `action` or `msg` carries a code this protocol does not define.
    UnknownCode(String),
    MissingField(&'static str),
    /// A single message exceeded the frame limit (bytes).
    Oversized(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(reason) => write!(f, "malformed message: {}", reason),
            ProtocolError::UnknownCode(code) => write!(f, "unknown code {:?}", code),
            ProtocolError::MissingField(field) => write!(f, "missing field '{}'", field),
            ProtocolError::Oversized(limit) => {
                write!(f, "message exceeds {} byte frame limit", limit)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Classify one inbound client line.
///
/// An object with an `action` key is a control message and must be complete;
/// any other object is telemetry.
pub fn parse_client_message(line: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let value: Value =
        serde_json::from_slice(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let Value::Object(map) = &value else {
        return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
    };
    let Some(action) = map.get("action") else {
        return Ok(ClientMessage::Telemetry(value));
    };
    let code = action
        .as_str()
        .ok_or_else(|| ProtocolError::Malformed("action must be a string".to_string()))?;
    let action = Action::from_code(code).ok_or_else(|| ProtocolError::UnknownCode(code.to_string()))?;
    let client_id = map
        .get("client_id")
        .or_else(|| map.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .ok_or(ProtocolError::MissingField("client_id"))?;
    Ok(ClientMessage::Control(ControlRequest::new(client_id, action)))
}

/// Parse one inbound server line.
pub fn parse_server_message(line: &[u8]) -> Result<Ack, ProtocolError> {
    let value: Value =
        serde_json::from_slice(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let msg = value
        .get("msg")
        .ok_or(ProtocolError::MissingField("msg"))?
        .as_str()
        .ok_or_else(|| ProtocolError::Malformed("msg must be a string".to_string()))?;
    let code = AckCode::from_code(msg).ok_or_else(|| ProtocolError::UnknownCode(msg.to_string()))?;
    Ok(Ack::new(code))
}

/// Serialise a message as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut line =
        serde_json::to_vec(message).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_wire_shape() {
        let line = encode_line(&ControlRequest::new("edge-1", Action::Register)).expect("encode");
        assert_eq!(line, b"{\"client_id\":\"edge-1\",\"action\":\"100\"}\n".to_vec());
    }

    #[test]
    fn ack_wire_shape() {
        let line = encode_line(&Ack::new(AckCode::RegisterAck)).expect("encode");
        assert_eq!(line, b"{\"msg\":\"100_1\"}\n".to_vec());
    }

    #[test]
    fn parses_control_messages() {
        let msg = parse_client_message(br#"{"client_id":"edge-1","action":"100"}"#).expect("parse");
        assert_eq!(
            msg,
            ClientMessage::Control(ControlRequest::new("edge-1", Action::Register))
        );
    }

    #[test]
    fn accepts_id_alias_for_client_id() {
        let msg = parse_client_message(br#"{"id":"edge-2","action":"600"}"#).expect("parse");
        assert_eq!(
            msg,
            ClientMessage::Control(ControlRequest::new("edge-2", Action::Reconnect))
        );
    }

    #[test]
    fn object_without_action_is_telemetry() {
        let msg = parse_client_message(br#"{"id":4,"bbox":[1,2,3,4],"age":48,"class":"car"}"#)
            .expect("parse");
        match msg {
            ClientMessage::Telemetry(value) => assert_eq!(value["class"], "car"),
            other => panic!("expected telemetry, got {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_client_payloads() {
        assert!(matches!(
            parse_client_message(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            parse_client_message(b"[1,2]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            parse_client_message(br#"{"client_id":"a","action":"999"}"#),
            Err(ProtocolError::UnknownCode("999".to_string()))
        );
        assert_eq!(
            parse_client_message(br#"{"action":"100"}"#),
            Err(ProtocolError::MissingField("client_id"))
        );
        assert!(matches!(
            parse_client_message(br#"{"client_id":"a","action":100}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn parses_and_rejects_server_messages() {
        assert_eq!(
            parse_server_message(br#"{"msg":"600_1"}"#),
            Ok(Ack::new(AckCode::ReconnectAck))
        );
        assert_eq!(
            parse_server_message(br#"{"status":"ok"}"#),
            Err(ProtocolError::MissingField("msg"))
        );
        assert_eq!(
            parse_server_message(br#"{"msg":"700_1"}"#),
            Err(ProtocolError::UnknownCode("700_1".to_string()))
        );
    }

    #[test]
    fn every_action_has_matching_ack() {
        for action in [Action::Register, Action::Reconnect, Action::Disconnect] {
            assert_eq!(Action::from_code(action.code()), Some(action));
            assert_eq!(action.ack().code(), format!("{}_1", action.code()));
        }
    }
}
