use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::ORIGIN, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::frame;
use crate::error::{ChartError, Result};
use crate::model::message::{Message, Packet};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the transport task reports back to its session.
#[derive(Debug)]
pub enum TransportEvent {
    Packet(Packet),
    /// Socket is gone. Carries the close reason or error text, if any.
    Closed(Option<String>),
}

enum Outbound {
    Frame(String),
    Close,
}

/// One physical socket plus the task that pumps it.
///
/// Heartbeats are answered inside the task, so they keep flowing even while
/// nobody is reading events.
pub struct Connection {
    command_sender: mpsc::Sender<Outbound>,
    event_receiver: mpsc::UnboundedReceiver<TransportEvent>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Open the socket and spawn its pump task.
    pub async fn open(url: &str, origin: &str, connect_timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)?;
        let mut request = url.as_str().into_client_request()?;
        let origin = HeaderValue::from_str(origin)
            .map_err(|e| ChartError::Connection(format!("invalid origin header: {}", e)))?;
        request.headers_mut().insert(ORIGIN, origin);

        info!("Connecting to {}...", url);
        let (ws_stream, _) = timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                ChartError::Connection(format!(
                    "timed out after {}ms connecting to {}",
                    connect_timeout.as_millis(),
                    url
                ))
            })?
            .map_err(|e| ChartError::Connection(e.to_string()))?;
        debug!("Socket open to {}", url);

        let (command_sender, command_receiver) = mpsc::channel(64);
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(ws_stream, command_receiver, event_sender));

        Ok(Self {
            command_sender,
            event_receiver,
            task,
        })
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        trace!("-> {}", message.method);
        self.command_sender
            .send(Outbound::Frame(frame::encode(message)))
            .await
            .map_err(|_| ChartError::ChannelClosed)
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.event_receiver.recv().await
    }

    /// Next already-buffered event, without waiting.
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.event_receiver.try_recv().ok()
    }

    pub fn is_open(&self) -> bool {
        !self.command_sender.is_closed() && !self.task.is_finished()
    }

    pub async fn close(&mut self) {
        if self.command_sender.send(Outbound::Close).await.is_err() {
            // Task already exited.
            return;
        }
        if timeout(Duration::from_secs(2), &mut self.task).await.is_err() {
            warn!("Socket did not close in time, aborting pump task");
            self.task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    ws_stream: WsStream,
    mut command_receiver: mpsc::Receiver<Outbound>,
    event_sender: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let decoded = frame::decode(&text);

                        for heartbeat in decoded.heartbeats {
                            trace!("Echoing heartbeat {}", heartbeat);
                            if let Err(e) = write.send(WsMessage::Text(heartbeat.into())).await {
                                error!("Failed to echo heartbeat: {}", e);
                                let _ = event_sender.send(TransportEvent::Closed(Some(e.to_string())));
                                return;
                            }
                        }

                        for packet in decoded.packets {
                            if event_sender.send(TransportEvent::Packet(packet)).is_err() {
                                return; // session dropped
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(close_frame))) => {
                        let reason = close_frame.map(|f| f.reason.to_string());
                        info!("Server closed socket: {:?}", reason);
                        let _ = event_sender.send(TransportEvent::Closed(reason));
                        return;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        let _ = event_sender.send(TransportEvent::Closed(Some(e.to_string())));
                        return;
                    }
                    None => {
                        warn!("Stream ended unexpectedly");
                        let _ = event_sender.send(TransportEvent::Closed(None));
                        return;
                    }
                }
            }
            cmd = command_receiver.recv() => {
                match cmd {
                    Some(Outbound::Frame(payload)) => {
                        if let Err(e) = write.send(WsMessage::Text(payload.into())).await {
                            error!("Failed to send frame: {}", e);
                            let _ = event_sender.send(TransportEvent::Closed(Some(e.to_string())));
                            return;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!("Closing socket");
                        let _ = write.close().await;
                        return;
                    }
                }
            }
        }
    }
}
