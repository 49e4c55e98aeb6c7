use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One protocol message. On the wire: `{"m": method, "p": [params], "t": ts}`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    #[serde(rename = "m")]
    pub method: String,

    #[serde(rename = "p", default)]
    pub params: Vec<Value>,

    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl Message {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            timestamp: None,
        }
    }

    /// String parameter at `index`, if present.
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params.get(index).and_then(|v| v.as_str())
    }
}

/// First packet the server sends on a new socket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Handshake {
    pub session_id: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub auth_scheme_vary: Option<String>,
}

/// A decoded, non-heartbeat frame body.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Packet {
    Message(Message),
    Handshake(Handshake),
}
