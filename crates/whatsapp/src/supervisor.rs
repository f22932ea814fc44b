//! Restart supervisor: tear down the stale handle, cool down, re-initialize.

use std::{sync::Arc, time::Duration};

use {
    pairgate_config::RestartConfig,
    tokio::{
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
};

use crate::{error::TeardownError, transport::TransportClient};

/// Delay and attempt policy between restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub cooldown: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// `None` keeps restarting forever.
    pub max_attempts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&RestartConfig::default())
    }
}

impl RestartPolicy {
    pub fn from_config(cfg: &RestartConfig) -> Self {
        Self {
            cooldown: Duration::from_millis(cfg.cooldown_ms),
            backoff_factor: cfg.backoff_factor,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            max_attempts: cfg.max_attempts,
        }
    }

    /// Fixed delay, unbounded attempts.
    pub fn fixed(cooldown: Duration) -> Self {
        Self {
            cooldown,
            backoff_factor: 1.0,
            max_delay: cooldown,
            max_attempts: None,
        }
    }

    /// Whether the 1-based `attempt` may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Cool-down before the 1-based `attempt`.
    ///
    /// `cooldown * backoff_factor^(attempt-1)`, never above `max_delay` and
    /// never below `cooldown`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.backoff_factor <= 1.0 || attempt <= 1 {
            return self.cooldown;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let grown = self.cooldown.as_secs_f64() * self.backoff_factor.powi(exponent);
        let cap = self.max_delay.max(self.cooldown).as_secs_f64();
        Duration::from_secs_f64(grown.min(cap))
    }
}

/// Signal posted back to the session when the cool-down has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RestartDue {
    pub generation: u64,
}

/// Destroy `client` within `timeout`.
pub(crate) async fn teardown(
    client: Arc<dyn TransportClient>,
    timeout: Duration,
) -> Result<(), TeardownError> {
    match tokio::time::timeout(timeout, client.destroy()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TeardownError::Destroy(e)),
        Err(_) => Err(TeardownError::Timeout(timeout)),
    }
}

/// A restart cycle running in the background.
pub(crate) struct RestartTask {
    handle: JoinHandle<()>,
    torn_down: oneshot::Receiver<()>,
}

impl RestartTask {
    /// Drop the cycle immediately, teardown included.
    pub(crate) fn abort(&self) {
        self.handle.abort();
    }

    /// Stop the cycle without cutting its teardown short: wait (at most
    /// `timeout`) for the stale handle to be destroyed, then cancel the
    /// cool-down so `RestartDue` is never posted.
    pub(crate) async fn cancel(mut self, timeout: Duration) {
        if tokio::time::timeout(timeout, &mut self.torn_down)
            .await
            .is_err()
        {
            warn!(?timeout, "restart teardown still running, cancelling it");
        }
        self.handle.abort();
    }
}

/// Run one restart cycle in the background.
///
/// The stale handle is destroyed first (failures are logged and ignored),
/// then the cool-down elapses, then `RestartDue` is posted. The session
/// creates the replacement only on receiving it, so the old handle is always
/// gone before the new one exists.
pub(crate) fn spawn_restart(
    stale: Option<Arc<dyn TransportClient>>,
    delay: Duration,
    destroy_timeout: Duration,
    generation: u64,
    due: mpsc::UnboundedSender<RestartDue>,
) -> RestartTask {
    let (torn_down_tx, torn_down) = oneshot::channel();
    let handle = tokio::spawn(async move {
        if let Some(client) = stale {
            match teardown(client, destroy_timeout).await {
                Ok(()) => debug!(generation, "stale transport destroyed"),
                Err(e) => warn!(generation, error = %e, "ignoring transport teardown failure"),
            }
        }
        let _ = torn_down_tx.send(());
        tokio::time::sleep(delay).await;
        info!(generation, "restart cool-down elapsed, re-initializing");
        let _ = due.send(RestartDue { generation });
    });
    RestartTask { handle, torn_down }
}
