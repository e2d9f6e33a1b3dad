// src/schedule.rs
//! Daily trigger logic.
//!
//! The scheduler wakes once per local day at the configured time, derives the
//! run id from the local date, and hands it to the pipeline. A compare-and-swap
//! guard makes overlapping runs impossible: if the previous run is still going
//! when the next trigger fires, the trigger is skipped and logged.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::persist::DigestStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl RunState {
    fn from_u8(v: u8) -> RunState {
        match v {
            1 => RunState::Running,
            2 => RunState::Completed,
            3 => RunState::Failed,
            _ => RunState::Idle,
        }
    }
}

/// Shared between the scheduler loop and the HTTP status endpoint.
#[derive(Debug, Default)]
pub struct RunGuard {
    state: AtomicU8,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the running slot. Returns false when a run is already active.
    pub fn try_begin(&self) -> bool {
        let current = self.state.load(Ordering::Acquire);
        if current == RunState::Running as u8 {
            return false;
        }
        self.state
            .compare_exchange(
                current,
                RunState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn finish(&self, success: bool) {
        let next = if success {
            RunState::Completed
        } else {
            RunState::Failed
        };
        self.state.store(next as u8, Ordering::Release);
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// What to do on startup when today's digest is missing because the process
/// was down at trigger time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    #[default]
    Skip,
    RunOnceOnStart,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub hour: u32,
    pub minute: u32,
    /// Local timezone as a fixed offset from UTC, e.g. 300 for UTC+5.
    pub utc_offset_minutes: i32,
    pub catch_up: CatchUpPolicy,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hour: 9,
            minute: 0,
            utc_offset_minutes: 0,
            catch_up: CatchUpPolicy::Skip,
        }
    }
}

impl ScheduleConfig {
    fn offset(&self) -> chrono::FixedOffset {
        chrono::FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap())
    }

    /// The local calendar date that `now` falls on.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset()).date_naive()
    }

    /// Next trigger instant strictly after `now`.
    pub fn next_trigger(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = self.offset();
        let local_now = now.with_timezone(&offset);
        let today = local_now
            .date_naive()
            .and_hms_opt(self.hour.min(23), self.minute.min(59), 0)
            .unwrap_or_else(|| local_now.date_naive().and_hms_opt(9, 0, 0).unwrap());
        let candidate = offset
            .from_local_datetime(&today)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        if candidate > now {
            candidate
        } else {
            candidate + ChronoDuration::days(1)
        }
    }

    /// Whether today's trigger instant is already behind `now`, i.e. the
    /// next trigger falls on a later local day.
    pub fn trigger_passed_today(&self, now: DateTime<Utc>) -> bool {
        self.local_date(self.next_trigger(now)) != self.local_date(now)
    }
}

/// Deterministic run id for a local date.
pub fn run_id_for(date: NaiveDate) -> String {
    format!("digest-{}", date.format("%Y-%m-%d"))
}

/// Daily loop. `run` performs one pipeline run for the given run id and
/// reports success; the guard is claimed before and released after each run.
pub async fn run_daily<F, Fut>(
    cfg: ScheduleConfig,
    guard: Arc<RunGuard>,
    store: Arc<dyn DigestStore>,
    run: F,
) where
    F: Fn(String) -> Fut,
    Fut: Future<Output = bool>,
{
    // Catch-up only applies to a trigger that was actually missed: today's
    // trigger time is behind us and no digest exists for the local day.
    let boot = Utc::now();
    if cfg.catch_up == CatchUpPolicy::RunOnceOnStart && cfg.trigger_passed_today(boot) {
        let run_id = run_id_for(cfg.local_date(boot));
        let already_done = matches!(store.read_digest(&run_id).await, Ok(Some(_)));
        if !already_done {
            tracing::info!(run_id = %run_id, "catching up missed run on startup");
            trigger(&guard, &run, run_id).await;
        }
    }

    loop {
        let now = Utc::now();
        let next = cfg.next_trigger(now);
        let wait = (next - now)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1));
        tracing::info!(
            next_trigger = %next,
            wait_secs = wait.as_secs(),
            "scheduler sleeping until next trigger"
        );
        tokio::time::sleep(wait).await;

        let run_id = run_id_for(cfg.local_date(Utc::now()));
        trigger(&guard, &run, run_id).await;
    }
}

async fn trigger<F, Fut>(guard: &RunGuard, run: &F, run_id: String)
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = bool>,
{
    if !guard.try_begin() {
        tracing::warn!(run_id = %run_id, "previous run still active, skipping trigger");
        return;
    }
    let success = run(run_id).await;
    guard.finish(success);
}
