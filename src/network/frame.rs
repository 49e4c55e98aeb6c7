//! Wire framing: `~m~<len>~m~<body>` segments, several per WebSocket payload.
//!
//! Lengths are UTF-8 byte counts on both the encode and decode side. A body
//! that starts with `~h~` is a heartbeat and must be echoed back untouched.

use tracing::debug;

use crate::model::message::{Message, Packet};

const DELIMITER: &str = "~m~";
const HEARTBEAT_MARKER: &str = "~h~";

/// Everything recovered from one physical frame.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Parsed JSON bodies in arrival order.
    pub packets: Vec<Packet>,
    /// Heartbeat segments including their framing, ready to be echoed.
    pub heartbeats: Vec<String>,
}

impl DecodedFrame {
    /// Only the method-carrying packets.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.packets.iter().filter_map(|p| match p {
            Packet::Message(m) => Some(m),
            Packet::Handshake(_) => None,
        })
    }
}

/// Frame a single protocol message.
pub fn encode(message: &Message) -> String {
    // Serializing a struct of strings and JSON values cannot fail.
    let body = serde_json::to_string(message).unwrap_or_default();
    encode_raw(&body)
}

/// Frame an already serialized body.
pub fn encode_raw(body: &str) -> String {
    format!("{DELIMITER}{}{DELIMITER}{body}", body.len())
}

/// Build a heartbeat segment the way the server sends it.
pub fn heartbeat_frame(n: u64) -> String {
    encode_raw(&format!("{HEARTBEAT_MARKER}{n}"))
}

pub fn is_heartbeat(body: &str) -> bool {
    body.starts_with(HEARTBEAT_MARKER)
}

/// Split a payload into packets and heartbeats.
///
/// Scanning is best effort: it stops at the first segment whose length is not
/// an integer or whose body runs past the end of the payload. Bodies that are
/// not valid JSON are skipped so the rest of the frame still gets through.
pub fn decode(payload: &str) -> DecodedFrame {
    let mut out = DecodedFrame::default();
    let mut rest = payload;

    loop {
        let Some(start) = rest.find(DELIMITER) else {
            break;
        };
        let after_open = &rest[start + DELIMITER.len()..];
        let Some(len_end) = after_open.find(DELIMITER) else {
            break;
        };
        let Ok(len) = after_open[..len_end].parse::<usize>() else {
            debug!("Unparseable frame length: {:?}", &after_open[..len_end]);
            break;
        };

        let body_start = len_end + DELIMITER.len();
        let Some(body_end) = body_start.checked_add(len) else {
            debug!("Frame length out of range: {}", len);
            break;
        };
        let Some(body) = after_open.get(body_start..body_end) else {
            debug!("Truncated frame body (declared {} bytes)", len);
            break;
        };

        if is_heartbeat(body) {
            // Echo the segment exactly as received, length prefix included.
            let segment_end = start + DELIMITER.len() + body_end;
            out.heartbeats.push(rest[start..segment_end].to_string());
        } else {
            match serde_json::from_str::<Packet>(body) {
                Ok(packet) => out.packets.push(packet),
                Err(e) => debug!("Dropping malformed frame body: {}", e),
            }
        }

        rest = &after_open[body_end..];
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let messages = vec![
            Message::new("set_auth_token", vec![json!("unauthorized_user_token")]),
            Message::new(
                "resolve_symbol",
                vec![json!("cs_abc"), json!("sds_sym_1"), json!("={\"symbol\":\"X:AAA\"}")],
            ),
            Message {
                method: "du".to_string(),
                params: vec![json!("cs_abc"), json!({"sds_1": {"s": [{"i": 0, "v": [1.0, 2.0]}]}})],
                timestamp: Some(1700000000.0),
            },
            Message::new("quote_set_fields", vec![json!("qs_ü€"), json!("lp")]),
        ];

        for msg in messages {
            let decoded = decode(&encode(&msg));
            assert_eq!(decoded.packets, vec![Packet::Message(msg)]);
            assert!(decoded.heartbeats.is_empty());
        }
    }

    #[test]
    fn test_heartbeat_isolated() {
        let frame = heartbeat_frame(7);
        assert_eq!(frame, "~m~4~m~~h~7");

        let decoded = decode(&frame);
        assert!(decoded.packets.is_empty());
        assert_eq!(decoded.heartbeats, vec![frame]);
    }

    #[test]
    fn test_multiple_segments() {
        let a = Message::new("a", vec![]);
        let b = Message::new("b", vec![json!(1)]);
        let payload = format!("{}{}{}", encode(&a), heartbeat_frame(12), encode(&b));

        let decoded = decode(&payload);
        let methods: Vec<_> = decoded.messages().map(|m| m.method.as_str()).collect();
        assert_eq!(methods, vec!["a", "b"]);
        assert_eq!(decoded.heartbeats, vec!["~m~5~m~~h~12".to_string()]);
    }

    #[test]
    fn test_malformed_body_does_not_abort_frame() {
        let good = Message::new("ok", vec![]);
        let payload = format!("{}{}", encode_raw("{not json"), encode(&good));

        let decoded = decode(&payload);
        assert_eq!(decoded.packets, vec![Packet::Message(good)]);
    }

    #[test]
    fn test_bad_length_stops_scanning() {
        let good = Message::new("ok", vec![]);
        let payload = format!("~m~abc~m~{{}}{}", encode(&good));
        assert!(decode(&payload).packets.is_empty());

        // Declared length longer than the payload.
        assert!(decode("~m~99~m~{\"m\":\"x\"}").packets.is_empty());
        assert_eq!(decode(""), DecodedFrame::default());
    }

    #[test]
    fn test_huge_length_stops_scanning() {
        let decoded = decode("~m~18446744073709551615~m~{}");
        assert_eq!(decoded, DecodedFrame::default());

        let payload = format!("{}~m~18446744073709551610~m~{{}}", heartbeat_frame(3));
        assert_eq!(decode(&payload).heartbeats, vec!["~m~4~m~~h~3".to_string()]);
    }

    #[test]
    fn test_heartbeat_echoed_verbatim() {
        let decoded = decode("~m~04~m~~h~9");
        assert_eq!(decoded.heartbeats, vec!["~m~04~m~~h~9".to_string()]);
        assert!(decoded.packets.is_empty());
    }

    #[test]
    fn test_length_counts_bytes() {
        let msg = Message::new("é", vec![]);
        let framed = encode(&msg);
        let body = serde_json::to_string(&msg).unwrap();
        assert!(framed.starts_with(&format!("~m~{}~m~", body.len())));
        assert_ne!(body.len(), body.chars().count());
    }
}
