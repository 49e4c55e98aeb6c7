//! The ConnectionPool spreads chart requests over many streaming sessions.
//!
//! A batch is cut into sub-batches of `requests_per_connection`. Each
//! sub-batch runs on its own connection, one request after another, while
//! up to `max_connections` sub-batches run in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Semaphore};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::config::PoolConfig;
use super::pending::{PendingQueue, PendingRequest};
use crate::error::{ChartError, Result};
use crate::indicators::IndicatorConfigSource;
use crate::model::{ChartData, ChartRequest, StudyConfig};
use crate::session::ChartSession;

/// A connection slot. Holding the lock means owning the connection.
type SessionSlot = Arc<AsyncMutex<Option<ChartSession>>>;

/// Outcome for one request of a batch.
#[derive(Debug)]
pub struct BatchResult {
    pub symbol: String,
    pub result: Result<ChartData>,
}

impl BatchResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn data(&self) -> Option<&ChartData> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ChartError> {
        self.result.as_ref().err()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub max_connections: usize,
    pub requests_per_connection: usize,
    pub persistent_mode: bool,
    pub persistent_connection_count: usize,
}

struct PoolInner {
    config: PoolConfig,
    persistent_mode: AtomicBool,
    pending: Mutex<PendingQueue>,
    persistent: Mutex<HashMap<String, Vec<SessionSlot>>>,
    limiter: Arc<Semaphore>,
    indicator_source: Option<Arc<dyn IndicatorConfigSource>>,
    last_activity: Mutex<Instant>,
}

/// Cheap to clone; clones share the same connections and queues.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool in transient mode.
    pub fn new(config: PoolConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a pool that can set up studies through `source`.
    pub fn with_indicator_source(config: PoolConfig, source: Arc<dyn IndicatorConfigSource>) -> Self {
        Self::build(config, Some(source))
    }

    fn build(config: PoolConfig, indicator_source: Option<Arc<dyn IndicatorConfigSource>>) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            inner: Arc::new(PoolInner {
                config,
                persistent_mode: AtomicBool::new(false),
                pending: Mutex::new(PendingQueue::new()),
                persistent: Mutex::new(HashMap::new()),
                limiter,
                indicator_source,
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.persistent_mode.load(Ordering::Relaxed)
    }

    /// Time since a request last succeeded or a connection was (re)opened.
    pub fn idle_for(&self) -> std::time::Duration {
        self.inner.last_activity.lock().elapsed()
    }

    fn touch(&self) {
        *self.inner.last_activity.lock() = Instant::now();
    }

    pub fn stats(&self) -> PoolStats {
        let persistent_connection_count = self
            .inner
            .persistent
            .lock()
            .values()
            .flatten()
            .filter(|slot| match slot.try_lock() {
                Ok(guard) => matches!(&*guard, Some(session) if session.is_open()),
                // Locked means a batch is using it right now.
                Err(_) => true,
            })
            .count();

        PoolStats {
            max_connections: self.inner.config.max_connections,
            requests_per_connection: self.inner.config.requests_per_connection,
            persistent_mode: self.is_persistent(),
            persistent_connection_count,
        }
    }

    pub fn enable_persistence(&self) {
        if !self.inner.persistent_mode.swap(true, Ordering::Relaxed) {
            info!("Connection pool: persistent mode enabled");
        }
    }

    /// Leave persistent mode and close every kept connection.
    pub async fn disable_persistence(&self) {
        if self.inner.persistent_mode.swap(false, Ordering::Relaxed) {
            info!("Connection pool: persistent mode disabled");
        }
        self.close_persistent().await;
    }

    /// Close every kept connection and fail every queued request.
    pub async fn close_all(&self) {
        let dropped = self.inner.pending.lock().clear();
        if dropped > 0 {
            warn!("Dropped {} queued requests on close", dropped);
        }
        self.close_persistent().await;
    }

    async fn close_persistent(&self) {
        let slots: Vec<SessionSlot> = self
            .inner
            .persistent
            .lock()
            .drain()
            .flat_map(|(_, slots)| slots)
            .collect();

        for slot in slots {
            if let Some(mut session) = slot.lock().await.take() {
                session.close().await;
            }
        }
    }

    /// Enter persistent mode and open the first connection for `token`.
    ///
    /// Connection errors are returned to the caller.
    pub async fn initialize(&self, token: &str) -> Result<()> {
        self.enable_persistence();
        let Some(slot) = self.persistent_slots(token, 1).into_iter().next() else {
            return Err(ChartError::Connection("persistent connections disabled (limit 0)".into()));
        };
        let mut guard = slot.lock().await;
        self.ensure_session(token, &mut guard).await?;
        self.touch();
        Ok(())
    }

    /// Replace the kept connections for `token` with one fresh connection.
    pub async fn reconnect(&self, token: &str) -> Result<()> {
        let slots = self
            .inner
            .persistent
            .lock()
            .get(token)
            .cloned()
            .unwrap_or_default();

        for slot in &slots {
            if let Some(mut session) = slot.lock().await.take() {
                session.close().await;
            }
        }
        self.initialize(token).await
    }

    /// Slots for up to `wanted` sub-batches, creating empty ones as needed.
    fn persistent_slots(&self, token: &str, wanted: usize) -> Vec<SessionSlot> {
        let limit = wanted.min(self.inner.config.persistent_connections);
        let mut persistent = self.inner.persistent.lock();
        let slots = persistent.entry(token.to_string()).or_default();
        while slots.len() < limit {
            slots.push(Arc::new(AsyncMutex::new(None)));
        }
        slots.iter().take(limit).cloned().collect()
    }

    /// Queue one request and wait for its result.
    ///
    /// Requests arriving within the debounce window for the same token are
    /// served as one batch.
    pub async fn fetch_chart_data(&self, token: &str, request: ChartRequest) -> Result<ChartData> {
        let (reply, rx) = oneshot::channel();
        let arm_timer = self
            .inner
            .pending
            .lock()
            .push(token, PendingRequest { request, reply });

        if arm_timer {
            let pool = self.clone();
            let token = token.to_string();
            let window = self.inner.config.debounce;
            tokio::spawn(async move {
                sleep(window).await;
                pool.flush_pending(&token).await;
            });
        }

        rx.await.map_err(|_| ChartError::ChannelClosed)?
    }

    async fn flush_pending(&self, token: &str) {
        let queued = self.inner.pending.lock().take(token);
        if queued.is_empty() {
            return;
        }
        debug!("Debounce window closed: {} requests", queued.len());

        let (requests, replies): (Vec<_>, Vec<_>) =
            queued.into_iter().map(|p| (p.request, p.reply)).unzip();
        let results = self.fetch_batch(token, requests).await;

        for (reply, outcome) in replies.into_iter().zip(results) {
            // Caller may have given up.
            let _ = reply.send(outcome.result);
        }
    }

    /// Serve `requests` and return one result per request, in input order.
    pub async fn fetch_batch(&self, token: &str, requests: Vec<ChartRequest>) -> Vec<BatchResult> {
        if requests.is_empty() {
            return Vec::new();
        }

        let total = requests.len();
        let per_connection = self.inner.config.requests_per_connection.max(1);
        let symbols: Vec<String> = requests.iter().map(|r| r.symbol.clone()).collect();

        let mut sub_batches: Vec<Vec<(usize, ChartRequest)>> = Vec::new();
        for (index, request) in requests.into_iter().enumerate() {
            if index % per_connection == 0 {
                sub_batches.push(Vec::with_capacity(per_connection));
            }
            if let Some(current) = sub_batches.last_mut() {
                current.push((index, request));
            }
        }

        let slots = if self.is_persistent() {
            self.persistent_slots(token, sub_batches.len())
        } else {
            Vec::new()
        };
        info!(
            "Batch of {} requests over {} connections ({} persistent)",
            total,
            sub_batches.len(),
            slots.len()
        );

        let tasks = sub_batches.into_iter().enumerate().map(|(i, batch)| {
            let pool = self.clone();
            let token = token.to_string();
            let slot = slots.get(i).cloned();
            tokio::spawn(async move { pool.run_sub_batch(&token, batch, slot).await })
        });

        let mut results: Vec<Option<BatchResult>> = (0..total).map(|_| None).collect();
        for joined in join_all(tasks).await {
            match joined {
                Ok(served) => {
                    for (index, outcome) in served {
                        results[index] = Some(outcome);
                    }
                }
                Err(e) => error!("Sub-batch task failed: {}", e),
            }
        }

        results
            .into_iter()
            .zip(symbols)
            .map(|(outcome, symbol)| {
                outcome.unwrap_or_else(|| BatchResult {
                    symbol,
                    result: Err(ChartError::ChannelClosed),
                })
            })
            .collect()
    }

    async fn run_sub_batch(
        &self,
        token: &str,
        batch: Vec<(usize, ChartRequest)>,
        slot: Option<SessionSlot>,
    ) -> Vec<(usize, BatchResult)> {
        let _permit = match Arc::clone(&self.inner.limiter).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return batch
                    .into_iter()
                    .map(|(index, request)| {
                        (
                            index,
                            BatchResult {
                                symbol: request.symbol,
                                result: Err(ChartError::ChannelClosed),
                            },
                        )
                    })
                    .collect()
            }
        };

        match slot {
            Some(slot) => {
                let mut guard = slot.lock().await;
                self.serve_sequentially(token, &mut guard, batch).await
            }
            None => {
                let mut transient = None;
                let served = self.serve_sequentially(token, &mut transient, batch).await;
                if let Some(mut session) = transient {
                    session.close().await;
                }
                served
            }
        }
    }

    async fn serve_sequentially(
        &self,
        token: &str,
        session: &mut Option<ChartSession>,
        batch: Vec<(usize, ChartRequest)>,
    ) -> Vec<(usize, BatchResult)> {
        let mut served = Vec::with_capacity(batch.len());
        for (index, request) in batch {
            let result = self.serve_one(token, session, &request).await;
            if let Err(e) = &result {
                warn!("Request for {} failed: {}", request.symbol, e);
            }
            served.push((
                index,
                BatchResult {
                    symbol: request.symbol,
                    result,
                },
            ));
        }
        served
    }

    async fn serve_one(
        &self,
        token: &str,
        session: &mut Option<ChartSession>,
        request: &ChartRequest,
    ) -> Result<ChartData> {
        self.ensure_session(token, session).await?;
        let studies = self.resolve_studies(request).await;

        let active = session
            .as_mut()
            .ok_or_else(|| ChartError::Connection("no session available".into()))?;
        let data = active.fetch(request, &studies).await?;
        self.touch();
        Ok(data)
    }

    /// Make sure `session` holds an open connection with request budget left.
    async fn ensure_session(&self, token: &str, session: &mut Option<ChartSession>) -> Result<()> {
        let ceiling = self.inner.config.max_requests_per_connection;

        if let Some(existing) = session.as_mut() {
            if existing.is_open() && existing.request_count() < ceiling {
                return Ok(());
            }
            if existing.is_open() {
                info!(
                    "Refreshing connection after {} requests",
                    existing.request_count()
                );
            } else {
                warn!("Replacing dead connection ({})", existing.state());
            }
            existing.close().await;
            *session = None;
        }

        *session = Some(ChartSession::connect(token, self.inner.config.session.clone()).await?);
        Ok(())
    }

    /// Study definitions for the indicators `request` asks for. Anything
    /// that cannot be looked up is skipped so the bars still come back.
    async fn resolve_studies(&self, request: &ChartRequest) -> Vec<StudyConfig> {
        if request.indicators.is_empty() {
            return Vec::new();
        }
        let Some(source) = &self.inner.indicator_source else {
            warn!("No indicator source configured, skipping indicators for {}", request.symbol);
            return Vec::new();
        };
        let Some(credentials) = &request.credentials else {
            warn!("Indicators for {} need session credentials, skipping", request.symbol);
            return Vec::new();
        };

        let mut studies = Vec::with_capacity(request.indicators.len());
        for name in &request.indicators {
            match source.fetch(name, credentials).await {
                Ok(config) => studies.push(config),
                Err(e) => warn!("Indicator {} unavailable for {}: {}", name, request.symbol, e),
            }
        }
        studies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::StaticIndicatorSource;
    use crate::pool::PoolConfigBuilder;
    use crate::model::Credentials;
    use crate::session::SessionConfig;
    use crate::testing::{MockServer, INVALID_MARKER, REJECT_MARKER};
    use std::time::Duration;

    fn config(server: &MockServer) -> PoolConfigBuilder {
        PoolConfig::builder().session(
            SessionConfig::builder()
                .url(server.url())
                .connect_timeout(Duration::from_secs(2))
                .handshake_timeout(Duration::from_secs(2))
                .build(),
        )
    }

    fn requests(symbols: &[&str]) -> Vec<ChartRequest> {
        symbols.iter().map(|s| ChartRequest::new(*s, "1D", 5)).collect()
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let server = MockServer::start().await;
        let pool = ConnectionPool::new(config(&server).requests_per_connection(2).build());

        let invalid = format!("X:{}", INVALID_MARKER);
        let results = pool
            .fetch_batch("t", requests(&["X:AAA", invalid.as_str(), "X:CCC", "X:DDD"]))
            .await;

        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        assert!(matches!(results[1].error(), Some(ChartError::Symbol { .. })));
        assert!(results[2].is_ok());
        assert!(results[3].is_ok());

        let symbols: Vec<_> = results.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["X:AAA", invalid.as_str(), "X:CCC", "X:DDD"]);
    }

    #[tokio::test]
    async fn test_partitioning() {
        let server = MockServer::start().await;
        let pool = ConnectionPool::new(config(&server).requests_per_connection(3).build());

        let results = pool
            .fetch_batch("t", requests(&["A:1", "A:2", "A:3", "A:4", "A:5", "A:6", "A:7"]))
            .await;
        assert!(results.iter().all(BatchResult::is_ok));

        // ceil(7 / 3) connections, each creating its series once.
        assert_eq!(server.connections(), 3);
        assert_eq!(server.calls("create_series").len(), 3);
        assert_eq!(server.calls("modify_series").len(), 4);
    }

    #[tokio::test]
    async fn test_transient_connections_closed() {
        let server = MockServer::start().await;
        let pool = ConnectionPool::new(config(&server).build());

        pool.fetch_batch("t", requests(&["X:AAA", "X:BBB"])).await;
        server.wait_for_method("chart_delete_session", 1).await;

        let stats = pool.stats();
        assert!(!stats.persistent_mode);
        assert_eq!(stats.persistent_connection_count, 0);
    }

    #[tokio::test]
    async fn test_persistent_connection_reused() {
        let server = MockServer::start().await;
        let pool = ConnectionPool::new(config(&server).build());
        pool.enable_persistence();

        for symbol in ["X:AAA", "X:BBB", "X:CCC"] {
            let results = pool.fetch_batch("t", requests(&[symbol])).await;
            assert!(results[0].is_ok());
        }

        assert_eq!(server.connections(), 1);
        let resolves: Vec<_> = server
            .calls("resolve_symbol")
            .iter()
            .map(|m| m.param_str(1).unwrap().to_string())
            .collect();
        assert_eq!(resolves, vec!["sds_sym_1", "sds_sym_2", "sds_sym_3"]);
        assert_eq!(pool.stats().persistent_connection_count, 1);

        pool.disable_persistence().await;
        assert_eq!(pool.stats().persistent_connection_count, 0);
    }

    #[tokio::test]
    async fn test_refresh_after_request_ceiling() {
        let server = MockServer::start().await;
        let pool = ConnectionPool::new(config(&server).max_requests_per_connection(20).build());
        pool.enable_persistence();

        for i in 0..20 {
            let symbol = format!("X:S{}", i);
            assert!(pool.fetch_batch("t", requests(&[symbol.as_str()])).await[0].is_ok());
        }
        assert_eq!(server.connections(), 1);
        assert_eq!(server.calls("create_series").len(), 1);

        assert!(pool.fetch_batch("t", requests(&["X:S20"])).await[0].is_ok());
        assert_eq!(server.connections(), 2);
        // The replacement starts its own series.
        assert_eq!(server.calls("create_series").len(), 2);
        server.wait_for_method("chart_delete_session", 1).await;
    }

    #[tokio::test]
    async fn test_debounced_requests_share_batch() {
        let server = MockServer::start().await;
        let pool = ConnectionPool::new(config(&server).requests_per_connection(10).build());

        let (a, b, c) = tokio::join!(
            pool.fetch_chart_data("t", ChartRequest::new("X:AAA", "1D", 5)),
            pool.fetch_chart_data("t", ChartRequest::new("X:BBB", "1D", 5)),
            pool.fetch_chart_data("t", ChartRequest::new("X:CCC", "1D", 5)),
        );

        assert_eq!(a.unwrap().metadata.symbol, "X:AAA");
        assert_eq!(b.unwrap().metadata.symbol, "X:BBB");
        assert_eq!(c.unwrap().metadata.symbol, "X:CCC");
        // One batch, one connection.
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn test_debounced_error_reaches_its_caller() {
        let server = MockServer::start().await;
        let pool = ConnectionPool::new(config(&server).build());

        let invalid = format!("X:{}", INVALID_MARKER);
        let (good, bad) = tokio::join!(
            pool.fetch_chart_data("t", ChartRequest::new("X:AAA", "1D", 5)),
            pool.fetch_chart_data("t", ChartRequest::new(invalid.as_str(), "1D", 5)),
        );
        assert!(good.is_ok());
        assert!(matches!(bad, Err(ChartError::Symbol { .. })));
    }

    #[tokio::test]
    async fn test_indicator_without_credentials_returns_bars() {
        let server = MockServer::start().await;
        let source = StaticIndicatorSource::new().with(
            "Volume Delta",
            StudyConfig::new("Volume Delta", "PUB;vd", "1.0", "enc"),
        );
        let pool = ConnectionPool::with_indicator_source(config(&server).build(), Arc::new(source));

        let request = ChartRequest::new("X:AAA", "1D", 5).with_indicator("Volume Delta");
        let results = pool.fetch_batch("t", vec![request.clone()]).await;
        let data = results[0].data().unwrap();
        assert!(!data.bars.is_empty());
        assert!(data.indicators.is_none());
        assert!(server.calls("create_study").is_empty());

        let request = request.with_credentials(Credentials {
            session_id: "sid".into(),
            session_sign: "sign".into(),
        });
        let results = pool.fetch_batch("t", vec![request]).await;
        let indicators = results[0].data().unwrap().indicators.as_ref().unwrap();
        assert_eq!(indicators[0].name, "Volume Delta");
    }

    #[tokio::test]
    async fn test_initialize_propagates_connection_error() {
        let pool = ConnectionPool::new(
            PoolConfig::builder()
                .session(
                    SessionConfig::builder()
                        .url("ws://127.0.0.1:1")
                        .connect_timeout(Duration::from_millis(500))
                        .build(),
                )
                .build(),
        );
        let err = pool.initialize("t").await.unwrap_err();
        assert!(matches!(err, ChartError::Connection(_)));
        assert!(pool.stats().persistent_mode);
    }

    #[tokio::test]
    async fn test_initialize_propagates_rejected_token() {
        let server = MockServer::start().await;
        let pool = ConnectionPool::new(config(&server).build());

        let token = format!("{}-token", REJECT_MARKER);
        let err = pool.initialize(&token).await.unwrap_err();
        assert!(matches!(err, ChartError::Protocol(_)));
        assert_eq!(pool.stats().persistent_connection_count, 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_each_request() {
        let pool = ConnectionPool::new(
            PoolConfig::builder()
                .session(
                    SessionConfig::builder()
                        .url("ws://127.0.0.1:1")
                        .connect_timeout(Duration::from_millis(500))
                        .build(),
                )
                .build(),
        );
        let results = pool.fetch_batch("t", requests(&["X:AAA", "X:BBB"])).await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| matches!(r.error(), Some(ChartError::Connection(_)))));
    }

    #[tokio::test]
    async fn test_stats() {
        let pool = ConnectionPool::new(PoolConfig::builder().max_connections(4).build());
        assert_eq!(
            pool.stats(),
            PoolStats {
                max_connections: 4,
                requests_per_connection: 10,
                persistent_mode: false,
                persistent_connection_count: 0,
            }
        );
    }
}
