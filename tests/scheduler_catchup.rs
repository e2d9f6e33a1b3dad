// tests/scheduler_catchup.rs
//
// Startup catch-up policy: RunOnceOnStart triggers at boot only when today's
// trigger already passed and the digest is missing; it waits when the trigger
// is still ahead, and Skip never triggers at boot.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use findigest::aggregate::Digest;
use findigest::persist::{DigestStore, FileDigestStore};
use findigest::schedule::{self, CatchUpPolicy, RunGuard, ScheduleConfig};
use tokio::sync::mpsc;

fn empty_digest(run_id: &str) -> Digest {
    Digest {
        run_id: run_id.to_string(),
        generated_at: Utc::now(),
        model_id: "mock".to_string(),
        categories: Vec::new(),
        text: String::new(),
        degraded: false,
    }
}

/// Offset that pins the local wall clock near `target_hour`:00 regardless of
/// the UTC clock, so tests control whether the 09:00 trigger already passed.
fn offset_for_local_hour(target_hour: i32) -> i32 {
    use chrono::Timelike;
    let now = Utc::now();
    let now_min = (now.hour() * 60 + now.minute()) as i32;
    let mut diff = target_hour * 60 - now_min;
    if diff <= -720 {
        diff += 1440;
    } else if diff > 720 {
        diff -= 1440;
    }
    diff
}

/// Local clock near 15:00, trigger at 09:00: today's trigger already passed
/// and the next one is many hours away from the test window.
fn passed_trigger(catch_up: CatchUpPolicy) -> ScheduleConfig {
    ScheduleConfig {
        hour: 9,
        minute: 0,
        utc_offset_minutes: offset_for_local_hour(15),
        catch_up,
    }
}

/// Local clock near 03:00, trigger at 09:00 still ahead.
fn pending_trigger(catch_up: CatchUpPolicy) -> ScheduleConfig {
    ScheduleConfig {
        hour: 9,
        minute: 0,
        utc_offset_minutes: offset_for_local_hour(3),
        catch_up,
    }
}

fn spawn_scheduler(
    cfg: ScheduleConfig,
    store: Arc<dyn DigestStore>,
) -> (mpsc::UnboundedReceiver<String>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let guard = Arc::new(RunGuard::new());
    let handle = tokio::spawn(async move {
        schedule::run_daily(cfg, guard, store, move |run_id| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(run_id);
                true
            }
        })
        .await;
    });
    (rx, handle)
}

#[tokio::test]
async fn run_once_on_start_fires_for_a_missed_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DigestStore> = Arc::new(FileDigestStore::new(dir.path()));
    let cfg = passed_trigger(CatchUpPolicy::RunOnceOnStart);
    let expected = schedule::run_id_for(cfg.local_date(Utc::now()));

    let (mut rx, handle) = spawn_scheduler(cfg, store);
    let run_id = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("catch-up run should trigger at startup")
        .unwrap();
    assert_eq!(run_id, expected);
    handle.abort();
}

#[tokio::test]
async fn run_once_on_start_skips_when_today_exists() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DigestStore> = Arc::new(FileDigestStore::new(dir.path()));
    let cfg = passed_trigger(CatchUpPolicy::RunOnceOnStart);
    let today = schedule::run_id_for(cfg.local_date(Utc::now()));
    store.write_digest(&empty_digest(&today)).await.unwrap();

    let (mut rx, handle) = spawn_scheduler(cfg, store);
    let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(fired.is_err(), "no catch-up when today's digest exists");
    handle.abort();
}

#[tokio::test]
async fn run_once_on_start_waits_when_trigger_has_not_passed() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DigestStore> = Arc::new(FileDigestStore::new(dir.path()));
    let cfg = pending_trigger(CatchUpPolicy::RunOnceOnStart);

    let (mut rx, handle) = spawn_scheduler(cfg, store);
    let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(
        fired.is_err(),
        "nothing was missed while the trigger is still ahead"
    );
    handle.abort();
}

#[tokio::test]
async fn skip_policy_never_triggers_at_boot() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DigestStore> = Arc::new(FileDigestStore::new(dir.path()));

    let (mut rx, handle) = spawn_scheduler(passed_trigger(CatchUpPolicy::Skip), store);
    let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(fired.is_err(), "skip policy must wait for the daily trigger");
    handle.abort();
}
