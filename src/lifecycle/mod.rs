//! Lifecycle Manager - reference-counted ownership of a persistent pool.
//!
//! Consumers `acquire` before using the pool and `release` when done. The
//! last release arms an idle timer; a background health check reconnects a
//! stale pool with exponential backoff while consumers remain.

mod config;
mod state;

pub use config::{LifecycleConfig, LifecycleConfigBuilder};
pub use state::LifecycleState;

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{ChartError, Result};
use crate::pool::ConnectionPool;

/// Timers and the token the pool was initialized with.
#[derive(Default)]
struct Control {
    token: Option<String>,
    idle_timer: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

pub struct LifecycleManager {
    pool: ConnectionPool,
    config: LifecycleConfig,
    /// Atomic state for lock-free reads
    state: AtomicU8,
    ref_count: AtomicUsize,
    reconnect_attempts: AtomicU32,
    /// Serializes acquire, release and teardown
    control: Mutex<Control>,
}

impl LifecycleManager {
    /// Wrap `pool`. The manager starts `Inactive`; nothing connects until
    /// the first [`acquire`](Self::acquire).
    pub fn new(pool: ConnectionPool, config: LifecycleConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            state: AtomicU8::new(LifecycleState::Inactive.as_u8()),
            ref_count: AtomicUsize::new(0),
            reconnect_attempts: AtomicU32::new(0),
            control: Mutex::new(Control::default()),
        })
    }

    #[inline]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn transition(&self, new: LifecycleState) {
        let old = LifecycleState::from_u8(self.state.swap(new.as_u8(), Ordering::Relaxed));
        if old != new {
            info!("Lifecycle {} -> {}", old, new);
        }
    }

    /// Register a consumer of the pool for `token`.
    ///
    /// The first acquire, a token change, or an acquire while inactive or
    /// degraded (re)initializes the pool in persistent mode. If that fails
    /// the error is returned and the reference is not taken.
    pub async fn acquire(self: &Arc<Self>, token: &str) -> Result<()> {
        let mut control = self.control.lock().await;

        if let Some(timer) = control.idle_timer.take() {
            timer.abort();
            debug!("Idle teardown cancelled");
        }
        let count = self.ref_count.fetch_add(1, Ordering::SeqCst) + 1;

        let token_changed = control.token.as_deref() != Some(token);
        if token_changed || self.state().needs_init() {
            if let Err(e) = self.initialize(&mut control, token).await {
                self.decrement();
                warn!("Pool initialization failed: {}", e);
                return Err(e);
            }
        }

        self.ensure_health_task(&mut control);
        debug!("Acquired (refs: {})", count);
        Ok(())
    }

    async fn initialize(&self, control: &mut Control, token: &str) -> Result<()> {
        if control.token.as_deref().map_or(false, |old| old != token) {
            info!("Token changed, closing previous connections");
            self.pool.disable_persistence().await;
        }

        self.pool.reconnect(token).await?;
        control.token = Some(token.to_string());
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.transition(LifecycleState::Active);
        Ok(())
    }

    /// Drop a consumer. The last release arms the idle timer.
    pub async fn release(self: &Arc<Self>) {
        let mut control = self.control.lock().await;
        let remaining = self.decrement();
        debug!("Released (refs: {})", remaining);

        if remaining > 0 || self.state() == LifecycleState::Inactive {
            return;
        }

        if let Some(timer) = control.idle_timer.take() {
            timer.abort();
        }
        let manager = Arc::downgrade(self);
        let idle_timeout = self.config.idle_timeout;
        control.idle_timer = Some(tokio::spawn(async move {
            sleep(idle_timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.idle_expired().await;
            }
        }));
        debug!("Idle teardown in {}ms", idle_timeout.as_millis());
    }

    async fn idle_expired(&self) {
        let mut control = self.control.lock().await;
        // Detach our own handle so teardown does not abort this task.
        control.idle_timer = None;
        if self.ref_count() > 0 {
            return;
        }
        info!("Idle timeout reached, shutting down pool");
        self.teardown(&mut control).await;
    }

    /// Tear everything down now, ignoring outstanding references and timers.
    pub async fn force_cleanup(&self) {
        let mut control = self.control.lock().await;
        self.ref_count.store(0, Ordering::SeqCst);
        self.teardown(&mut control).await;
    }

    async fn teardown(&self, control: &mut Control) {
        if let Some(timer) = control.idle_timer.take() {
            timer.abort();
        }
        if let Some(task) = control.health_task.take() {
            task.abort();
        }
        self.pool.close_all().await;
        self.pool.disable_persistence().await;
        control.token = None;
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.transition(LifecycleState::Inactive);
    }

    /// Saturating decrement, returns the new count.
    fn decrement(&self) -> usize {
        let previous = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn ensure_health_task(self: &Arc<Self>, control: &mut Control) {
        if control.health_task.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }
        let manager = Arc::downgrade(self);
        let period = self.config.health_check_interval;
        control.health_task = Some(tokio::spawn(health_loop(manager, period)));
    }

    async fn check_health(&self) {
        let state = self.state();
        if state == LifecycleState::Inactive {
            return;
        }

        let idle = self.pool.idle_for();
        if idle <= self.config.stale_threshold {
            if state == LifecycleState::Active {
                self.transition(LifecycleState::Healthy);
            }
            return;
        }

        let stale = ChartError::StaleConnection {
            idle_ms: idle.as_millis(),
        };
        warn!("Health check: {}", stale);
        self.transition(LifecycleState::Degraded);

        if self.ref_count() == 0 {
            debug!("No consumers, not reconnecting");
            return;
        }
        self.reconnect_with_backoff().await;
    }

    async fn reconnect_with_backoff(&self) {
        let max_attempts = self.config.max_reconnect_attempts;

        loop {
            let attempt = self.reconnect_attempts() + 1;
            if attempt > max_attempts {
                warn!(
                    "Reconnect gave up after {} attempts, staying degraded until next acquire",
                    max_attempts
                );
                return;
            }
            self.reconnect_attempts.store(attempt, Ordering::Relaxed);

            let delay = self.config.backoff_delay(attempt);
            info!("Reconnect attempt {}/{} in {}ms", attempt, max_attempts, delay.as_millis());
            sleep(delay).await;

            let control = self.control.lock().await;
            let Some(token) = control.token.clone() else {
                return;
            };
            if self.ref_count() == 0 {
                return;
            }

            match self.pool.reconnect(&token).await {
                Ok(()) => {
                    drop(control);
                    self.reconnect_attempts.store(0, Ordering::Relaxed);
                    self.transition(LifecycleState::Healthy);
                    return;
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }
}

async fn health_loop(manager: Weak<LifecycleManager>, period: std::time::Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.check_health().await;
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        if let Some(timer) = control.idle_timer.take() {
            timer.abort();
        }
        if let Some(task) = control.health_task.take() {
            task.abort();
        }
    }
}
