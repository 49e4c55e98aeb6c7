//! Scripted in-process server speaking the chart protocol, for tests.
//!
//! Symbols containing [`INVALID_MARKER`] get a `symbol_error`, ones containing
//! [`SILENT_MARKER`] resolve but never receive data, and ones containing
//! [`CRASH_MARKER`] trigger a `critical_error`. An auth token containing
//! [`REJECT_MARKER`] is answered with a `critical_error` right after the
//! handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::model::Message;
use crate::network::frame::{decode, encode, encode_raw, heartbeat_frame};

pub(crate) const INVALID_MARKER: &str = "INVALID";
pub(crate) const SILENT_MARKER: &str = "SILENT";
pub(crate) const CRASH_MARKER: &str = "CRASH";
pub(crate) const REJECT_MARKER: &str = "REJECT";

#[derive(Default)]
struct Log {
    calls: Vec<Message>,
    heartbeats: Vec<String>,
    connections: usize,
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    log: Arc<Mutex<Log>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Log::default()));
        let tasks = Arc::new(Mutex::new(Vec::new()));

        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&log), Arc::clone(&tasks)));
        tasks.lock().push(accept);

        Self { addr, log, tasks }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Stop accepting and drop every open socket.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn connections(&self) -> usize {
        self.log.lock().connections
    }

    pub fn methods(&self) -> Vec<String> {
        self.log.lock().calls.iter().map(|m| m.method.clone()).collect()
    }

    pub fn calls(&self, method: &str) -> Vec<Message> {
        self.log
            .lock()
            .calls
            .iter()
            .filter(|m| m.method == method)
            .cloned()
            .collect()
    }

    pub fn echoed_heartbeats(&self) -> Vec<String> {
        self.log.lock().heartbeats.clone()
    }

    pub async fn wait_for_method(&self, method: &str, count: usize) {
        for _ in 0..200 {
            if self.calls(method).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never saw {} x{}", method, count);
    }

    pub async fn wait_for_heartbeats(&self, count: usize) {
        for _ in 0..200 {
            if self.echoed_heartbeats().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never saw {} echoed heartbeats", count);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    log: Arc<Mutex<Log>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let index = {
            let mut log = log.lock();
            log.connections += 1;
            log.connections
        };
        let handle = tokio::spawn(serve(stream, Arc::clone(&log), index));
        tasks.lock().push(handle);
    }
}

#[derive(Default)]
struct ConnState {
    symbol: String,
    bars_count: u64,
}

impl ConnState {
    fn serves_data(&self) -> bool {
        ![INVALID_MARKER, SILENT_MARKER, CRASH_MARKER]
            .iter()
            .any(|marker| self.symbol.contains(marker))
    }
}

async fn serve(stream: TcpStream, log: Arc<Mutex<Log>>, index: usize) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    let handshake = json!({
        "session_id": format!("mock_{}", index),
        "timestamp": 1700000000,
        "release": "mock",
        "protocol": "json",
    });
    let greeting = format!("{}{}", encode_raw(&handshake.to_string()), heartbeat_frame(1));
    if write.send(WsMessage::Text(greeting.into())).await.is_err() {
        return;
    }

    let mut state = ConnState::default();
    while let Some(Ok(frame)) = read.next().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let decoded = decode(&text);
        let messages: Vec<Message> = decoded.messages().cloned().collect();
        {
            let mut log = log.lock();
            log.heartbeats.extend(decoded.heartbeats);
            log.calls.extend(messages.iter().cloned());
        }

        for message in &messages {
            for reply in respond(message, &mut state) {
                if write.send(WsMessage::Text(encode(&reply).into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn respond(msg: &Message, state: &mut ConnState) -> Vec<Message> {
    let cs = msg.params.first().cloned().unwrap_or(Value::Null);

    match msg.method.as_str() {
        "set_auth_token" => {
            if msg.param_str(0).map_or(false, |t| t.contains(REJECT_MARKER)) {
                vec![Message::new("critical_error", vec![json!("invalid auth token")])]
            } else {
                Vec::new()
            }
        }
        "resolve_symbol" => {
            let symbol_session = msg.params.get(1).cloned().unwrap_or(Value::Null);
            let descriptor: Value = msg
                .param_str(2)
                .and_then(|d| serde_json::from_str(d.trim_start_matches('=')).ok())
                .unwrap_or(Value::Null);
            state.symbol = descriptor["symbol"].as_str().unwrap_or_default().to_string();

            if state.symbol.contains(CRASH_MARKER) {
                vec![Message::new("critical_error", vec![cs, json!("simulated failure")])]
            } else if state.symbol.contains(INVALID_MARKER) {
                vec![Message::new(
                    "symbol_error",
                    vec![cs, symbol_session, json!("invalid symbol")],
                )]
            } else {
                let info = json!({
                    "name": state.symbol,
                    "description": "Mock instrument",
                    "exchange": "X",
                    "type": "stock",
                    "timezone": "Etc/UTC",
                    "pricescale": 100,
                });
                vec![Message::new("symbol_resolved", vec![cs, symbol_session, info])]
            }
        }
        "create_series" | "modify_series" => {
            if msg.method == "create_series" {
                state.bars_count = msg.params.get(5).and_then(Value::as_u64).unwrap_or(5);
            }
            if !state.serves_data() {
                return Vec::new();
            }
            let turnaround = msg.params.get(2).cloned().unwrap_or(Value::Null);
            let count = state.bars_count.clamp(1, 5);
            let price = 10.0 + state.symbol.bytes().map(f64::from).sum::<f64>() % 100.0;

            // Newest first, so the client has to sort.
            let entries: Vec<Value> = (0..count)
                .rev()
                .map(|i| {
                    let time = 1_700_000_000 + i as i64 * 86_400;
                    json!({"i": i, "v": [time, price, price + 1.0, price - 1.0, price, 1000.0]})
                })
                .collect();

            vec![
                Message::new(
                    "timescale_update",
                    vec![cs.clone(), json!({"sds_1": {"node": "mock", "s": entries, "t": turnaround}})],
                ),
                Message::new(
                    "series_completed",
                    vec![cs, json!("sds_1"), json!("streaming"), turnaround],
                ),
            ]
        }
        "create_study" => {
            if !state.serves_data() {
                return Vec::new();
            }
            let study_id = msg.param_str(1).unwrap_or_default().to_string();
            let mut block = serde_json::Map::new();
            block.insert(
                study_id.clone(),
                json!({"st": [{"i": 0, "v": [1_700_000_000, 1.0, -1.0]}]}),
            );
            vec![
                Message::new("du", vec![cs.clone(), Value::Object(block)]),
                Message::new("study_completed", vec![cs, json!(study_id)]),
            ]
        }
        _ => Vec::new(),
    }
}
