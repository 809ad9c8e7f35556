use std::sync::Arc;
use std::time::Duration;
use anyhow::{Result, bail};
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::{CycleSummary, PollStats};
use crate::poller::PollCycleRunner;

/// How long `stop` waits for an in-flight cycle before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// `shutdown` has run; this scheduler won't poll again.
    ShutDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// True while a poll loop is alive here or in another process sharing the database.
    pub running: bool,
    pub interval_secs: u64,
    pub active_targets: usize,
    pub last_poll: Option<chrono::DateTime<Utc>>,
    pub last_hour: PollStats,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the periodic poll loop. Manual polls go straight to the runner and
/// may overlap a scheduled cycle.
pub struct Scheduler {
    runner: Arc<PollCycleRunner>,
    interval: Duration,
    shutdown: CancellationToken,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(runner: Arc<PollCycleRunner>, interval: Duration) -> Self {
        Self {
            runner,
            interval,
            shutdown: CancellationToken::new(),
            running: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> StartOutcome {
        if self.shutdown.is_cancelled() {
            return StartOutcome::ShutDown;
        }

        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return StartOutcome::AlreadyRunning;
        }

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(poll_loop(self.runner.clone(), self.interval, cancel.clone()));
        *running = Some(Running { cancel, handle });

        info!("Polling started, every {}s", self.interval.as_secs());
        StartOutcome::Started
    }

    /// Stops the loop, letting the current target finish. Returns false if
    /// it was not running.
    pub async fn stop(&self) -> bool {
        let Some(Running { cancel, mut handle }) = self.running.lock().await.take() else {
            return false;
        };

        cancel.cancel();
        if time::timeout(STOP_GRACE, &mut handle).await.is_err() {
            warn!("Poll loop did not stop within {:?}, aborting it", STOP_GRACE);
            handle.abort();
        }
        if let Err(e) = self.runner.db().clear_heartbeat().await {
            warn!("Could not clear the scheduler heartbeat: {}", e);
        }
        info!("Polling stopped");
        true
    }

    /// Stops the loop and interrupts any manual poll in progress. Final:
    /// later `start` and `poll_now` calls are refused.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop().await;
    }

    /// Runs one cycle now, regardless of the loop.
    pub async fn poll_now(&self) -> Result<CycleSummary> {
        if self.shutdown.is_cancelled() {
            bail!("scheduler has been shut down");
        }
        self.runner.run_cycle(&self.shutdown).await
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        let db = self.runner.db();
        let now = Utc::now();
        let running = self.is_running().await || db.heartbeat().await?.is_some_and(|beat| beat.is_fresh(now));

        Ok(SchedulerStatus {
            running,
            interval_secs: self.interval.as_secs(),
            active_targets: db.list_eligible_targets().await?.len(),
            last_poll: db.last_poll_time().await?,
            last_hour: db.stats_since(now - chrono::Duration::hours(1)).await?,
        })
    }
}

async fn poll_loop(runner: Arc<PollCycleRunner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let interval_secs = interval.as_secs().max(1) as i64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        beat(&runner, interval_secs).await;
        // The registry being unreadable only costs this tick.
        if let Err(e) = runner.run_cycle(&cancel).await {
            error!("Poll cycle failed: {:#}", e);
        }
        beat(&runner, interval_secs).await;
    }
}

async fn beat(runner: &PollCycleRunner, interval_secs: i64) {
    if let Err(e) = runner.db().record_heartbeat(Utc::now(), interval_secs).await {
        warn!("Could not record the scheduler heartbeat: {}", e);
    }
}
