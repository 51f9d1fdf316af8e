//! Cross-cutting resilience helpers: retry-with-backoff, periodic
//! watchdog tasks, and a supervised-spawn wrapper that logs task panics.

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Calls `send_fn` with exponential-backoff retries. Returns `true` on the
/// first success, `false` once every attempt has failed.
pub async fn retry_send<F, Fut>(mut send_fn: F, policy: RetryPolicy, label: &str) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let attempts = 1 + policy.max_retries;
    for attempt in 0..attempts {
        if send_fn().await {
            if attempt > 0 {
                debug!(label, attempt = attempt + 1, attempts, "send succeeded after retry");
            }
            return true;
        }

        if attempt < policy.max_retries {
            let delay = policy.delay_for(attempt);
            debug!(label, ?delay, attempt = attempt + 1, attempts, "send failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
    warn!(label, attempts, "send failed after all retries");
    false
}

/// Runs a callback on a fixed interval until cancelled via the shutdown
/// broadcast, logging (not propagating) callback errors.
pub struct Watchdog {
    name: String,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self { name: name.into(), interval, handle: None }
    }

    pub fn start<F, Fut>(&mut self, mut shutdown_rx: broadcast::Receiver<()>, mut callback: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let name = self.name.clone();
        let interval_secs = self.interval;
        self.handle = Some(supervised_task(&format!("watchdog-{name}"), async move {
            let mut ticker = tokio::time::interval(interval_secs);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = callback().await {
                            warn!(watchdog = %name, error = %e, "watchdog callback failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(watchdog = %name, "watchdog stopped");
                        return;
                    }
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns a task whose panics are logged instead of silently dropped.
pub fn supervised_task<F>(name: &str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        let result = tokio::spawn(fut).await;
        if let Err(e) = result {
            if !e.is_cancelled() {
                error!(task = %name, error = %e, "supervised task panicked");
            }
        }
    })
}
