//! Watermark persistence and query-window policy.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use tokio::fs;
use tracing::{info, warn};
use wikigaps_core::{iso8601, Checkpoint};

use crate::write_atomic;

/// Overlap and grace settings that turn a stored watermark into a query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkPolicy {
    pub overlap_days: i64,
    pub grace_days: i64,
}

impl Default for WatermarkPolicy {
    fn default() -> Self {
        Self {
            overlap_days: 14,
            grace_days: 7,
        }
    }
}

/// The time range a collection run scans, with the terms that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub checkpoint: DateTime<Utc>,
    pub overlap_start: DateTime<Utc>,
    pub grace_floor: DateTime<Utc>,
    pub since: DateTime<Utc>,
}

impl std::fmt::Display for QueryWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "since {} (checkpoint {}, overlap start {}, grace floor {})",
            iso8601::format(&self.since),
            iso8601::format(&self.checkpoint),
            iso8601::format(&self.overlap_start),
            iso8601::format(&self.grace_floor)
        )
    }
}

impl WatermarkPolicy {
    /// Watermark recorded after a successful run at `now`. It trails `now` by the overlap
    /// so the next run re-scans that span.
    pub fn next_watermark(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let trailing = now - Duration::days(self.overlap_days);
        trailing.with_nanosecond(0).unwrap_or(trailing)
    }

    /// Earliest point any run at `now` may look back to.
    pub fn grace_floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let month_start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .unwrap_or(now);
        month_start - Duration::days(self.grace_days)
    }

    pub fn query_window(&self, watermark: DateTime<Utc>, now: DateTime<Utc>) -> QueryWindow {
        let overlap_start = watermark - Duration::days(self.overlap_days);
        let grace_floor = self.grace_floor(now);
        QueryWindow {
            checkpoint: watermark,
            overlap_start,
            grace_floor,
            since: overlap_start.max(grace_floor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointState {
    Uninitialized,
    Loaded(Checkpoint),
}

/// Owner of the checkpoint file. `load` and `save` are the only state transitions.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: CheckpointState,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: CheckpointState::Uninitialized,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Option<Checkpoint> {
        match self.state {
            CheckpointState::Uninitialized => None,
            CheckpointState::Loaded(checkpoint) => Some(checkpoint),
        }
    }

    /// Stored watermark, if any, without initializing the file or touching the state.
    pub async fn peek(&self) -> Result<Option<Checkpoint>> {
        let exists = fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?;
        if !exists {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let checkpoint = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Read the stored watermark. On first use the project-start default is written
    /// immediately so later runs see a persisted value.
    pub async fn load(&mut self) -> Result<Checkpoint> {
        match self.peek().await? {
            Some(checkpoint) => {
                self.state = CheckpointState::Loaded(checkpoint);
                Ok(checkpoint)
            }
            None => {
                let default = Checkpoint::default();
                warn!(
                    path = %self.path.display(),
                    last_run_ts = %iso8601::format(&default.last_run_ts),
                    "no checkpoint found, initializing"
                );
                self.save(default).await?;
                Ok(default)
            }
        }
    }

    /// Persist the whole record in one atomic write. The in-memory state only changes
    /// once the write succeeded.
    pub async fn save(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&checkpoint).context("serializing checkpoint")?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("saving checkpoint {}", self.path.display()))?;
        self.state = CheckpointState::Loaded(checkpoint);
        Ok(())
    }

    /// Move the watermark forward after a run at `now` completed its writes.
    pub async fn advance(
        &mut self,
        policy: &WatermarkPolicy,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let next = Checkpoint {
            last_run_ts: policy.next_watermark(now),
        };
        if let Some(previous) = self.current() {
            if next.last_run_ts < previous.last_run_ts {
                warn!(
                    previous = %iso8601::format(&previous.last_run_ts),
                    next = %iso8601::format(&next.last_run_ts),
                    "watermark moves backwards; clock skew?"
                );
            }
        }
        self.save(next).await?;
        info!(
            last_run_ts = %iso8601::format(&next.last_run_ts),
            overlap_days = policy.overlap_days,
            "checkpoint advanced"
        );
        Ok(next)
    }
}
