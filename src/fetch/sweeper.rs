//! Recurring expiry timer for a connection's fetch registry.
//!
//! The sweeper owns at most one [`tokio::time::Interval`]. The connection
//! polls [`ExpirationSweeper::tick`] from its event loop, so a sweep never
//! runs concurrently with other connection work and there is never more
//! than one pending sweep. Dropping the interval on [`ExpirationSweeper::stop`]
//! cancels the timer deterministically.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Default expiry period, also the fetch time-to-live.
pub const DEFAULT_FETCH_TTL: Duration = Duration::from_secs(900);

/// A stoppable periodic timer.
#[derive(Debug)]
pub struct ExpirationSweeper {
    period: Duration,
    timer: Option<Interval>,
}

impl ExpirationSweeper {
    /// Create a stopped sweeper.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            timer: None,
        }
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start firing every `period`, first one `period` from now.
    ///
    /// Restarting a running sweeper resets its schedule. A zero period leaves
    /// the sweeper stopped.
    pub fn start(&mut self) {
        if self.period.is_zero() {
            tracing::warn!("Fetcher expiration disabled: zero period");
            self.timer = None;
            return;
        }
        let mut timer = interval_at(Instant::now() + self.period, self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);
    }

    /// Stop firing. Stopping a stopped sweeper is a no-op.
    pub fn stop(&mut self) {
        self.timer = None;
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Wait for the next firing. Never resolves while stopped.
    pub async fn tick(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

impl Default for ExpirationSweeper {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_TTL)
    }
}
