use std::sync::Arc;
use std::time::Duration;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::dispatch::ActionDispatcher;
use crate::error::FeedError;
use crate::feed::FeedSource;
use crate::models::{CycleSummary, Item, MonitorTarget, PollCycleOutcome, PollStatus};

/// Runs poll cycles: fetch every eligible feed, claim new items, fire actions.
///
/// Cycles may overlap (scheduled tick plus a manual poll). Nothing here
/// serializes them; the ledger claim in [`Database::try_claim`] is what keeps
/// an item from firing twice.
pub struct PollCycleRunner {
    db: Database,
    feeds: Arc<dyn FeedSource>,
    dispatcher: ActionDispatcher,
    feed_timeout: Duration,
}

impl PollCycleRunner {
    pub fn new(db: Database, feeds: Arc<dyn FeedSource>, dispatcher: ActionDispatcher, feed_timeout: Duration) -> Self {
        Self {
            db,
            feeds,
            dispatcher,
            feed_timeout,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// One full cycle over the current eligible targets. Only a failure to read
    /// the targets is an error; anything going wrong for a single target ends
    /// up in that target's outcome.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary> {
        let targets = self.db.list_eligible_targets().await?;
        let mut summary = CycleSummary {
            targets_eligible: targets.len(),
            ..CycleSummary::default()
        };
        debug!("Poll cycle started with {} eligible targets", targets.len());

        for target in &targets {
            if cancel.is_cancelled() {
                info!(
                    "Poll cycle cancelled after {} of {} targets",
                    summary.targets_processed,
                    targets.len()
                );
                summary.cancelled = true;
                break;
            }

            let Some(baseline) = target.baseline.filter(|_| target.is_eligible()) else {
                continue;
            };

            let outcome = self.poll_target(target, baseline).await;
            if let Err(e) = self.db.record_outcome(&outcome).await {
                error!("Failed to record poll outcome for '{}': {}", target.name, e);
            }

            summary.targets_processed += 1;
            summary.new_items += outcome.new_items;
            summary.actions_triggered += outcome.actions_triggered;
            if let Some(detail) = &outcome.error {
                summary.errors.push(format!("{}: {}", target.name, detail));
            }
        }

        info!(
            "Poll cycle finished: {} targets, {} new items, {} actions triggered, {} errors",
            summary.targets_processed,
            summary.new_items,
            summary.actions_triggered,
            summary.errors.len()
        );
        Ok(summary)
    }

    async fn poll_target(&self, target: &MonitorTarget, baseline: DateTime<Utc>) -> PollCycleOutcome {
        let items = match self.fetch(&target.feed_url).await {
            Ok(items) => items,
            Err(e) => {
                warn!("Fetching '{}' ({}) failed: {}", target.name, target.feed_url, e);
                return PollCycleOutcome::failed(target.id, e.to_string());
            }
        };

        let items_seen = items.len() as i64;
        let fresh = items_after_baseline(items, baseline);

        let mut new_items = 0;
        let mut actions_triggered = 0;
        let mut claim_error = None;

        for item in &fresh {
            match self.db.try_claim(target.id, &item.guid).await {
                Ok(true) => {
                    new_items += 1;
                    actions_triggered += self.trigger(target, item).await;
                }
                Ok(false) => debug!("'{}': item {} already claimed, skipping", target.name, item.guid),
                Err(e) => {
                    error!("'{}': could not claim item {}: {}", target.name, item.guid, e);
                    claim_error = Some(e.to_string());
                }
            }
        }

        let status = match (&claim_error, new_items) {
            (Some(_), 0) => PollStatus::Error,
            (_, 0) => PollStatus::NoNewItems,
            _ => PollStatus::Success,
        };

        PollCycleOutcome {
            target_id: target.id,
            polled_at: Utc::now(),
            items_seen,
            new_items,
            actions_triggered,
            status,
            error: claim_error,
        }
    }

    /// Fires every active action for a freshly claimed item. Returns how many
    /// succeeded; failures never undo the others.
    async fn trigger(&self, target: &MonitorTarget, item: &Item) -> i64 {
        info!("'{}': new item {} ({})", target.name, item.title, item.link);

        let mut succeeded = 0;
        for action in target.active_actions() {
            if self.dispatcher.dispatch(target.id, item, action).await.is_ok() {
                succeeded += 1;
            }
        }

        if let Err(e) = self.db.record_trigger_count(target.id, &item.guid, succeeded).await {
            warn!("'{}': could not record trigger count for {}: {}", target.name, item.guid, e);
        }
        succeeded
    }

    async fn fetch(&self, url: &str) -> Result<Vec<Item>, FeedError> {
        match timeout(self.feed_timeout, self.feeds.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout(self.feed_timeout)),
        }
    }

    /// Fixes the baseline of a target that has none: the newest publish time
    /// in its feed right now, or the current time for an empty feed. Returns
    /// `None` when a baseline already existed.
    pub async fn establish_baseline(&self, target: &MonitorTarget) -> Result<Option<DateTime<Utc>>> {
        if target.baseline.is_some() {
            return Ok(None);
        }

        let items = self
            .fetch(&target.feed_url)
            .await
            .map_err(|e| anyhow!("could not fetch '{}' for baseline: {}", target.name, e))?;
        let baseline = items
            .iter()
            .filter_map(|item| item.published_at)
            .max()
            .unwrap_or_else(Utc::now);

        if self.db.set_baseline_if_absent(target.id, baseline).await? {
            info!(
                "Baseline for '{}' set to {} ({} existing items)",
                target.name,
                baseline,
                items.len()
            );
            Ok(Some(baseline))
        } else {
            Ok(None)
        }
    }

    /// Baselines every target that has actions but no baseline yet.
    /// Failures are logged; those targets stay ineligible until next time.
    pub async fn establish_missing_baselines(&self) -> Result<usize> {
        let mut established = 0;
        for target in self.db.targets_missing_baseline().await? {
            match self.establish_baseline(&target).await {
                Ok(Some(_)) => established += 1,
                Ok(None) => {}
                Err(e) => warn!("{}", e),
            }
        }
        Ok(established)
    }
}

/// Drops items at or before the baseline, and undated items since they
/// cannot be placed after it. Survivors come back oldest first.
fn items_after_baseline(items: Vec<Item>, baseline: DateTime<Utc>) -> Vec<Item> {
    let mut fresh: Vec<Item> = items
        .into_iter()
        .filter(|item| matches!(item.published_at, Some(published) if published > baseline))
        .collect();
    fresh.sort_by_key(|item| item.published_at);
    fresh
}
