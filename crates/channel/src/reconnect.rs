use std::time::Duration;

use tracing::{info, warn};

use filebox_config::ReconnectConfig;

use crate::{ChannelError, Connection};

/// Supervised reconnect schedule.
///
/// Attempt `n` (1-based) waits `backoff * multiplier^(n-1)`, capped at
/// `max_backoff`, then reconnects.  After `max_attempts` failures the
/// connection is reported lost with [`ChannelError::RetriesExhausted`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            backoff: Duration::from_secs(config.backoff_secs),
            multiplier: config.multiplier,
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            max_attempts: config.max_attempts,
        }
    }

    /// One attempt after a fixed ten second pause.
    pub fn single_retry() -> Self {
        Self {
            backoff: Duration::from_secs(10),
            multiplier: 1.0,
            max_backoff: Duration::from_secs(10),
            max_attempts: 1,
        }
    }

    /// Delay before attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff.max(self.backoff);
        }
        Duration::from_secs_f64(secs)
    }

    /// Run the schedule against `conn` until a reconnect succeeds or the
    /// attempts run out.
    pub async fn reconnect<C>(&self, conn: &mut C) -> Result<(), ChannelError>
    where
        C: Connection + ?Sized,
    {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            let delay = self.delay_for(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;
            match conn.reconnect().await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return Ok(());
                }
                Err(err) => warn!(attempt, %err, "reconnect attempt failed"),
            }
        }
        Err(ChannelError::RetriesExhausted { attempts })
    }
}
