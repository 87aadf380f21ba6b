//! Change detection across a project's sources with a quiet period.

use cadence_core::Result;
use cadence_core::build::{BuildProperties, Modification};
use cadence_core::ports::SourceControl;
use cadence_core::time;
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_QUIET_WAIT: Duration = Duration::from_secs(600);

/// Outcome of one modification check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModificationCheck {
    pub modifications: Vec<Modification>,
    /// Side-channel flags reported by the sources.
    pub properties: BuildProperties,
    pub time_of_check: Option<NaiveDateTime>,
}

impl ModificationCheck {
    pub fn is_modified(&self) -> bool {
        !self.modifications.is_empty()
    }
}

pub struct ModificationDetector {
    sources: Vec<Arc<dyn SourceControl>>,
    quiet_period: Duration,
    max_quiet_wait: Duration,
}

impl ModificationDetector {
    pub fn new(sources: Vec<Arc<dyn SourceControl>>) -> Self {
        Self {
            sources,
            quiet_period: DEFAULT_QUIET_PERIOD,
            max_quiet_wait: DEFAULT_MAX_QUIET_WAIT,
        }
    }

    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    pub fn with_max_quiet_wait(mut self, max_quiet_wait: Duration) -> Self {
        self.max_quiet_wait = max_quiet_wait;
        self
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Changes since `since`, re-polled until the newest one is at least a
    /// quiet period old or the quiet wait runs out.
    pub async fn get_modifications(&self, since: NaiveDateTime) -> Result<ModificationCheck> {
        let deadline = Instant::now() + self.max_quiet_wait;
        loop {
            let now = time::now();
            let check = self.collect(since, now).await?;

            let remaining = self.quiet_remaining(&check, now);
            if remaining.is_zero() {
                return Ok(check);
            }

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                warn!(
                    max_wait_secs = self.max_quiet_wait.as_secs(),
                    "Quiet period never elapsed, proceeding with current changes"
                );
                return Ok(check);
            }

            let sleep = remaining.min(left);
            info!(
                sleep_ms = sleep.as_millis() as u64,
                "Modification within quiet period, waiting before re-checking"
            );
            tokio::time::sleep(sleep).await;
        }
    }

    async fn collect(&self, since: NaiveDateTime, now: NaiveDateTime) -> Result<ModificationCheck> {
        let mut check = ModificationCheck {
            time_of_check: Some(now),
            ..Default::default()
        };
        for source in &self.sources {
            let found = source.get_modifications(since, now).await?;
            debug!(source = source.name(), count = found.len(), "Queried source");
            check.modifications.extend(found);
            check.properties.extend(source.properties());
        }
        Ok(check)
    }

    /// How much longer the newest change must age before the quiet period is over.
    fn quiet_remaining(&self, check: &ModificationCheck, now: NaiveDateTime) -> Duration {
        let Some(newest) = check.modifications.iter().map(|m| m.modified_time).max() else {
            return Duration::ZERO;
        };
        let quiet = chrono::Duration::from_std(self.quiet_period)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let age = now - newest;
        if age >= quiet {
            return Duration::ZERO;
        }
        // A change stamped in the future counts as brand new.
        (quiet - age.max(chrono::Duration::zero()))
            .to_std()
            .unwrap_or(self.quiet_period)
    }
}
