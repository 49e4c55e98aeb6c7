//! Streaming session client: one physical connection, one chart session.
//!
//! A [`ChartSession`] connects, authenticates and sets up its chart and quote
//! sessions once. After that it serves chart requests one at a time, reusing
//! the same series: the first request creates it, later ones modify it.

mod config;
pub mod extract;
mod state;

pub use config::{SessionConfig, SessionConfigBuilder, DEFAULT_ORIGIN, DEFAULT_URL};
pub use state::{ConnectionState, SessionState};

use std::sync::Arc;

use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::{ChartError, Result};
use crate::model::command;
use crate::model::{ChartData, ChartRequest, Message, Packet, ServerEvent, StudyConfig};
use crate::network::{Connection, TransportEvent};

/// Callback invoked with server-reported protocol errors.
pub type ErrorHook = Arc<dyn Fn(&ChartError) + Send + Sync>;

pub struct ChartSession {
    connection: Connection,
    state: SessionState,
    config: SessionConfig,
    status: ConnectionState,
    error_hook: Option<ErrorHook>,
}

impl ChartSession {
    /// Connect, wait for the handshake and set up the chart/quote sessions.
    pub async fn connect(token: &str, config: SessionConfig) -> Result<Self> {
        debug!("Session state: {}", ConnectionState::Connecting);
        let connection = Connection::open(&config.url, &config.origin, config.connect_timeout).await?;

        let mut session = Self {
            connection,
            state: SessionState::new(),
            config,
            status: ConnectionState::Connected,
            error_hook: None,
        };

        if let Err(e) = session.await_handshake().await {
            session.close().await;
            return Err(e);
        }
        if let Err(e) = session.bootstrap(token).await {
            session.close().await;
            return Err(e);
        }

        info!(
            "Session ready (connection {}, chart session {})",
            session.state.connection_id().unwrap_or("?"),
            session.state.chart_session_id()
        );
        Ok(session)
    }

    pub fn set_error_hook(&mut self, hook: ErrorHook) {
        self.error_hook = Some(hook);
    }

    pub fn state(&self) -> ConnectionState {
        self.status
    }

    pub fn request_count(&self) -> u32 {
        self.state.request_count()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.state.connection_id()
    }

    pub fn chart_session_id(&self) -> &str {
        self.state.chart_session_id()
    }

    pub fn is_open(&self) -> bool {
        self.status.is_usable() && self.connection.is_open()
    }

    async fn await_handshake(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.handshake_timeout;

        loop {
            let event = match timeout_at(deadline, self.connection.recv()).await {
                Err(_) => {
                    return Err(ChartError::Connection(format!(
                        "no handshake within {}ms",
                        self.config.handshake_timeout.as_millis()
                    )))
                }
                Ok(None) => return Err(ChartError::Connection("socket closed before handshake".into())),
                Ok(Some(event)) => event,
            };

            match event {
                TransportEvent::Packet(Packet::Handshake(handshake)) => {
                    debug!("Handshake received: {:?}", handshake);
                    self.state.set_connection_id(handshake.session_id);
                    return Ok(());
                }
                TransportEvent::Packet(Packet::Message(msg)) => {
                    if let ServerEvent::Fatal { reason } = ServerEvent::from_message(&msg) {
                        let err = ChartError::Protocol(reason);
                        self.report(&err);
                        return Err(err);
                    }
                    trace!("Ignoring {} before handshake", msg.method);
                }
                TransportEvent::Closed(reason) => {
                    return Err(ChartError::Connection(format!(
                        "socket closed before handshake: {}",
                        reason.unwrap_or_default()
                    )))
                }
            }
        }
    }

    async fn bootstrap(&mut self, token: &str) -> Result<()> {
        self.send(&command::set_auth_token(token)).await?;
        self.status = ConnectionState::Authenticated;

        let cs = self.state.chart_session_id().to_string();
        let qs = self.state.quote_session_id().to_string();
        self.send(&command::chart_create_session(&cs)).await?;
        self.send(&command::switch_timezone(&cs, &self.config.timezone)).await?;
        self.send(&command::quote_create_session(&qs)).await?;
        self.send(&command::quote_set_fields(&qs)).await?;

        self.await_bootstrap_ack().await?;
        self.status = ConnectionState::SessionReady;
        Ok(())
    }

    /// Give the server a short window to reject the token or the session
    /// setup. A fatal message in that window fails the connect; any other
    /// message, or silence, means the session was accepted.
    async fn await_bootstrap_ack(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.bootstrap_grace.min(self.config.handshake_timeout);

        loop {
            let event = match timeout_at(deadline, self.connection.recv()).await {
                Err(_) => return Ok(()),
                Ok(None) => return Err(self.lost(None)),
                Ok(Some(event)) => event,
            };

            match event {
                TransportEvent::Packet(Packet::Message(msg)) => {
                    if let ServerEvent::Fatal { reason } = ServerEvent::from_message(&msg) {
                        let err = ChartError::Protocol(reason);
                        self.report(&err);
                        return Err(err);
                    }
                    trace!("Bootstrap acknowledged by {}", msg.method);
                    return Ok(());
                }
                TransportEvent::Packet(Packet::Handshake(_)) => {}
                TransportEvent::Closed(reason) => return Err(self.lost(reason)),
            }
        }
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.connection.send(message).await
    }

    /// Serve one chart request on this connection.
    ///
    /// `studies` are created alongside the series; ones that never report are
    /// left out of the result rather than failing it. A request that collects
    /// no bars fails with [`ChartError::DataTimeout`].
    pub async fn fetch(&mut self, request: &ChartRequest, studies: &[StudyConfig]) -> Result<ChartData> {
        if !self.is_open() {
            return Err(ChartError::Connection(format!("session is {}", self.status)));
        }
        self.drain_stale_events().await?;

        let stale_studies = self.state.begin_request(&request.symbol, &request.resolution);
        self.status = ConnectionState::Serving;

        let cs = self.state.chart_session_id().to_string();
        let symbol_session = self.state.symbol_session_id();
        let turnaround = self.state.turnaround_id();
        debug!(
            "Request #{} for {} {} ({} bars) on {}",
            self.state.request_count(),
            request.symbol,
            request.resolution,
            request.bars_count,
            cs
        );

        for study_id in &stale_studies {
            self.send(&command::remove_study(&cs, study_id)).await?;
        }

        self.send(&command::resolve_symbol(&cs, &symbol_session, &request.symbol))
            .await?;

        let series_op = if self.state.is_first_request() {
            command::create_series(
                &cs,
                &turnaround,
                &symbol_session,
                &request.resolution,
                request.bars_count,
            )
        } else {
            command::modify_series(&cs, &turnaround, &symbol_session, &request.resolution)
        };
        self.send(&series_op).await?;

        for (index, study) in studies.iter().enumerate() {
            let study_id = self.state.study_id(index);
            self.send(&command::create_study(&cs, &study_id, study)).await?;
            self.state.register_indicator(study_id, study.clone());
        }

        let wait = self.config.data_timeout(request.bars_count, studies.len());
        let completed = self.wait_for_data(wait).await?;
        self.status = ConnectionState::SessionReady;

        if !completed {
            debug!(
                "Wait for {} timed out after {}ms with {} bars",
                request.symbol,
                wait.as_millis(),
                self.state.bar_count()
            );
        }

        let data = self.state.take_result();
        if data.bars.is_empty() {
            return Err(ChartError::DataTimeout {
                symbol: request.symbol.clone(),
            });
        }
        if data.indicators.as_ref().map_or(0, Vec::len) < studies.len() {
            warn!("Some studies for {} produced no values", request.symbol);
        }
        Ok(data)
    }

    /// Wait until the request is complete or `wait` runs out.
    ///
    /// Returns `Ok(true)` on completion and `Ok(false)` on timeout. Symbol
    /// errors and protocol errors end the wait early.
    async fn wait_for_data(&mut self, wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + wait;

        loop {
            if self.state.is_complete() {
                return Ok(true);
            }

            let event = match timeout_at(deadline, self.connection.recv()).await {
                Err(_) => return Ok(false),
                Ok(event) => event,
            };

            match event {
                Some(TransportEvent::Packet(Packet::Message(msg))) => {
                    if let Err(e) = self.handle_message(&msg) {
                        if matches!(e, ChartError::Protocol(_)) {
                            self.report(&e);
                            self.close().await;
                        } else {
                            self.status = ConnectionState::SessionReady;
                        }
                        return Err(e);
                    }
                }
                Some(TransportEvent::Packet(Packet::Handshake(_))) => {}
                Some(TransportEvent::Closed(reason)) => return Err(self.lost(reason)),
                None => return Err(self.lost(None)),
            }
        }
    }

    fn handle_message(&mut self, msg: &Message) -> Result<()> {
        match ServerEvent::from_message(msg) {
            ServerEvent::SymbolResolved {
                symbol_session,
                info,
            } => {
                if symbol_session == self.state.symbol_session_id() {
                    self.state.set_metadata(&info);
                } else {
                    trace!("Ignoring resolution for stale {}", symbol_session);
                }
            }
            ServerEvent::SymbolError {
                symbol_session,
                reason,
            } => {
                if symbol_session == self.state.symbol_session_id() {
                    return Err(ChartError::Symbol {
                        symbol: self.state.symbol().to_string(),
                        reason,
                    });
                }
                trace!("Ignoring symbol error for stale {}", symbol_session);
            }
            ServerEvent::SeriesData { data } => {
                let accepted = self.state.apply_series_data(&data);
                trace!("{} data points accepted", accepted);
            }
            ServerEvent::SeriesError { turnaround, reason } => {
                let current = self.state.turnaround_id();
                if turnaround.as_deref().map_or(true, |t| t == current) {
                    return Err(ChartError::Symbol {
                        symbol: self.state.symbol().to_string(),
                        reason,
                    });
                }
            }
            ServerEvent::SeriesCompleted { turnaround } => {
                trace!("Series completed ({:?})", turnaround);
            }
            ServerEvent::StudyError { study_id, reason } => {
                warn!("Study {} failed: {}", study_id, reason);
                self.state.abandon_indicator(&study_id);
            }
            ServerEvent::StudyCompleted { study_id } => {
                trace!("Study {} completed", study_id);
            }
            ServerEvent::Fatal { reason } => return Err(ChartError::Protocol(reason)),
            ServerEvent::Quote => {}
            ServerEvent::Unknown(method) => trace!("Unhandled method {}", method),
        }
        Ok(())
    }

    /// Throw away anything that arrived between requests. A fatal error or a
    /// closed socket seen here fails the upcoming request.
    async fn drain_stale_events(&mut self) -> Result<()> {
        while let Some(event) = self.connection.try_recv() {
            match event {
                TransportEvent::Packet(Packet::Message(msg)) => {
                    if let ServerEvent::Fatal { reason } = ServerEvent::from_message(&msg) {
                        let err = ChartError::Protocol(reason);
                        self.report(&err);
                        self.close().await;
                        return Err(err);
                    }
                }
                TransportEvent::Packet(Packet::Handshake(_)) => {}
                TransportEvent::Closed(reason) => return Err(self.lost(reason)),
            }
        }
        Ok(())
    }

    fn lost(&mut self, reason: Option<String>) -> ChartError {
        self.status = ConnectionState::Disconnected;
        warn!("Connection lost: {}", reason.as_deref().unwrap_or("stream ended"));
        ChartError::Connection(format!(
            "connection lost: {}",
            reason.unwrap_or_else(|| "stream ended".into())
        ))
    }

    fn report(&self, error: &ChartError) {
        warn!("Protocol error on {}: {}", self.state.chart_session_id(), error);
        if let Some(hook) = &self.error_hook {
            hook(error);
        }
    }

    /// Delete the server-side sessions and close the socket.
    pub async fn close(&mut self) {
        if self.status == ConnectionState::Disconnected {
            return;
        }
        self.status = ConnectionState::Closing;

        if self.connection.is_open() {
            let cs = self.state.chart_session_id().to_string();
            let qs = self.state.quote_session_id().to_string();
            let _ = self.send(&command::chart_delete_session(&cs)).await;
            let _ = self.send(&command::quote_delete_session(&qs)).await;
        }
        self.connection.close().await;

        self.status = ConnectionState::Disconnected;
        info!(
            "Session {} closed after {} requests",
            self.state.chart_session_id(),
            self.state.request_count()
        );
    }
}
