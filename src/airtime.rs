//! Serialises ownership of the single BLE radio between continuous passive
//! scanning (proxy fan-out) and episodic GATT-central sessions (Renogy
//! polling), per `SPEC_FULL.md` §4.4.
//!
//! The mutex-guarded counter in [`State`] and the RAII [`PauseToken`] it
//! hands back to callers implement the "cancelled task releases its airtime
//! token in its destructor" cancellation guarantee from §5 directly: dropping
//! a token — whether because the holder returned normally or was cancelled —
//! always resumes scanning once it is the last outstanding token.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::sync::{Mutex, Notify};
use tokio::time::interval;

use crate::ble::BleAdapter;

struct State {
    running: bool,
    pause_tokens: u32,
    shutdown: bool,
}

/// Configuration for the duty cycle and health watchdog facilities.
#[derive(Clone, Debug)]
pub struct AirtimeConfig {
    /// `(active, idle)` duty cycle; scanning toggles in this pattern when
    /// both are non-zero, subject to pause tokens.
    pub duty_cycle: Option<(Duration, Duration)>,
    pub settle_time: Duration,
    pub resume_window: Duration,
    pub health_check_interval: Duration,
    pub health_check_threshold: Duration,
    pub health_reset_adapter: bool,
}

impl Default for AirtimeConfig {
    fn default() -> Self {
        Self {
            duty_cycle: None,
            settle_time: Duration::from_millis(400),
            resume_window: Duration::from_secs(3),
            health_check_interval: Duration::from_secs(10),
            health_check_threshold: Duration::from_secs(45),
            health_reset_adapter: true,
        }
    }
}

/// A single outstanding pause request. Scanning resumes once every token
/// handed out by [`AirtimeCoordinator::pause`] has been dropped.
pub struct PauseToken {
    coordinator: Arc<AirtimeCoordinator>,
    released: std::sync::atomic::AtomicBool,
}

impl PauseToken {
    /// Releases the token early instead of waiting for `Drop`. Idempotent.
    pub async fn release(self: Arc<Self>) {
        self.release_inner().await;
    }

    async fn release_inner(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.coordinator.resume_one().await;
        }
    }
}

impl Drop for PauseToken {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            self.released.store(true, Ordering::SeqCst);
            let coordinator = self.coordinator.clone();
            tokio::spawn(async move { coordinator.resume_one().await });
        }
    }
}

/// Shared radio arbiter. Owned by [`crate::service::ProxyService`] and handed
/// to the scanner pump and the [`crate::renogy::client::ModbusGattClient`]
/// alike.
pub struct AirtimeCoordinator {
    adapter: Arc<dyn BleAdapter>,
    state: Mutex<State>,
    config: AirtimeConfig,
    shutdown_notify: Notify,
    cycle_done: Notify,
    last_advertisement: Mutex<Instant>,
    consecutive_watchdog_violations: AtomicU32,
}

impl AirtimeCoordinator {
    pub fn new(adapter: Arc<dyn BleAdapter>, config: AirtimeConfig) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            state: Mutex::new(State {
                running: false,
                pause_tokens: 0,
                shutdown: false,
            }),
            config,
            shutdown_notify: Notify::new(),
            cycle_done: Notify::new(),
            last_advertisement: Mutex::new(Instant::now()),
            consecutive_watchdog_violations: AtomicU32::new(0),
        })
    }

    /// Starts the scanner (if no pause tokens are outstanding) and spawns the
    /// duty-cycle and health-watchdog background tasks.
    pub async fn start(self: &Arc<Self>) {
        self.try_run().await;
        if self.config.duty_cycle.is_some() {
            let this = self.clone();
            tokio::spawn(async move { this.duty_cycle_loop().await });
        }
        let this = self.clone();
        tokio::spawn(async move { this.health_watchdog_loop().await });
    }

    /// Idempotent: forces `running := false`, marks the coordinator as
    /// shutting down, and wakes any background tasks so they exit.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        if state.running {
            let _ = self.adapter.stop_scan().await;
        }
        state.running = false;
        drop(state);
        self.shutdown_notify.notify_waiters();
    }

    /// Call whenever an advertisement is observed, to keep the health
    /// watchdog's idle timer fresh.
    pub async fn record_advertisement(&self) {
        *self.last_advertisement.lock().await = Instant::now();
        self.consecutive_watchdog_violations
            .store(0, Ordering::SeqCst);
    }

    /// Increments the pause counter, stopping the scanner if it was running,
    /// and returns a token that re-arms scanning (once it is the last
    /// outstanding one) when dropped or explicitly released.
    pub async fn pause(self: &Arc<Self>, reason: &str) -> Arc<PauseToken> {
        let mut state = self.state.lock().await;
        state.pause_tokens += 1;
        info!("airtime paused ({reason}), tokens={}", state.pause_tokens);
        if state.running {
            state.running = false;
            drop(state);
            let _ = self.adapter.stop_scan().await;
        }
        Arc::new(PauseToken {
            coordinator: self.clone(),
            released: std::sync::atomic::AtomicBool::new(false),
        })
    }

    async fn resume_one(&self) {
        let mut state = self.state.lock().await;
        state.pause_tokens = state.pause_tokens.saturating_sub(1);
        info!("airtime resume, tokens={}", state.pause_tokens);
        if state.pause_tokens == 0 && !state.shutdown && !state.running {
            state.running = true;
            drop(state);
            let _ = self.adapter.start_scan().await;
        }
    }

    async fn try_run(&self) {
        let mut state = self.state.lock().await;
        if state.pause_tokens == 0 && !state.shutdown && !state.running {
            state.running = true;
            drop(state);
            let _ = self.adapter.start_scan().await;
        }
    }

    async fn try_stop(&self) {
        let mut state = self.state.lock().await;
        if state.running {
            state.running = false;
            drop(state);
            let _ = self.adapter.stop_scan().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn pause_tokens(&self) -> u32 {
        self.state.lock().await.pause_tokens
    }

    /// Called by the Modbus client when a read cycle finishes (success,
    /// failure, or cancellation). Schedules a deferred resume after the
    /// settle time, followed by a resume window during which scanning is
    /// guaranteed active, then signals cycle completion for a
    /// `poll_after_proxy_cycle`-gated [`crate::scheduler::PollScheduler`].
    pub fn on_modbus_cycle_done(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.settle_time).await;
            this.try_run().await;
            tokio::time::sleep(this.config.resume_window).await;
            this.cycle_done.notify_waiters();
        });
    }

    /// Awaits the next proxy-fan-out-cycle-complete signal, or `None` if
    /// `timeout` elapses first (the scheduler's fallback so a stalled proxy
    /// cannot starve a gated poll indefinitely).
    pub async fn wait_for_cycle_done(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.cycle_done.notified() => true,
            _ = tokio::time::sleep(timeout) => false,
        }
    }

    async fn duty_cycle_loop(self: Arc<Self>) {
        let Some((active, idle)) = self.config.duty_cycle else {
            return;
        };
        loop {
            tokio::select! {
                _ = self.shutdown_notify.notified() => return,
                _ = tokio::time::sleep(active) => {
                    self.try_stop().await;
                }
            }
            tokio::select! {
                _ = self.shutdown_notify.notified() => return,
                _ = tokio::time::sleep(idle) => {
                    self.try_run().await;
                }
            }
        }
    }

    async fn health_watchdog_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = self.shutdown_notify.notified() => return,
                _ = ticker.tick() => {}
            }

            let idle_for = self.last_advertisement.lock().await.elapsed();
            if idle_for < self.config.health_check_threshold {
                continue;
            }

            let violations = self
                .consecutive_watchdog_violations
                .fetch_add(1, Ordering::SeqCst)
                + 1;
            warn!(
                "no advertisements for {idle_for:?} (threshold {:?}), kicking scanner",
                self.config.health_check_threshold
            );
            self.try_stop().await;
            self.try_run().await;

            if violations >= 2 && self.config.health_reset_adapter {
                error!("second consecutive health-watchdog violation, power-cycling adapter");
                if let Err(e) = self.adapter.power_cycle().await {
                    error!("adapter power cycle failed: {e}");
                }
                self.consecutive_watchdog_violations.store(0, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{Error, GattSession, MacAddress};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct MockAdapter {
        scanning: AtomicBool,
    }

    #[async_trait]
    impl BleAdapter for MockAdapter {
        async fn start_scan(&self) -> Result<(), Error> {
            self.scanning.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop_scan(&self) -> Result<(), Error> {
            self.scanning.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn is_scanning(&self) -> Result<bool, Error> {
            Ok(self.scanning.load(Ordering::SeqCst))
        }
        async fn connect_gatt(
            &self,
            _mac_address: Option<MacAddress>,
            _alias: &str,
            _discovery_timeout: Duration,
            _retries: u32,
        ) -> Result<Box<dyn GattSession>, Error> {
            unimplemented!("not exercised by airtime tests")
        }
        async fn power_cycle(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fifo_pause_resume_leaves_running_true() {
        let adapter = Arc::new(MockAdapter {
            scanning: AtomicBool::new(false),
        });
        let coordinator = AirtimeCoordinator::new(adapter.clone(), AirtimeConfig::default());
        coordinator.start().await;
        assert!(coordinator.is_running().await);

        let token_a = coordinator.pause("A").await;
        let token_b = coordinator.pause("B").await;
        assert!(!coordinator.is_running().await);
        assert_eq!(coordinator.pause_tokens().await, 2);

        token_a.release().await;
        assert!(!coordinator.is_running().await, "still paused by B");
        assert_eq!(coordinator.pause_tokens().await, 1);

        token_b.release().await;
        // give the coordinator's start_scan call a tick to land
        tokio::task::yield_now().await;
        assert!(coordinator.is_running().await);
        assert_eq!(coordinator.pause_tokens().await, 0);
    }

    #[tokio::test]
    async fn idempotent_shutdown_leaves_scanner_stopped() {
        let adapter = Arc::new(MockAdapter {
            scanning: AtomicBool::new(false),
        });
        let coordinator = AirtimeCoordinator::new(adapter.clone(), AirtimeConfig::default());
        coordinator.start().await;
        assert!(coordinator.is_running().await);

        coordinator.shutdown().await;
        assert!(!coordinator.is_running().await);
        coordinator.shutdown().await;
        assert!(!coordinator.is_running().await);

        let token = coordinator.pause("late").await;
        assert!(!coordinator.is_running().await);
        token.release().await;
        assert!(
            !coordinator.is_running().await,
            "shutdown must not be un-done by a dropped pause token"
        );
    }
}
