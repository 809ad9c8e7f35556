use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::config::TargetConfig;
use crate::models::{
    Action, CommentConfig, ExecutionRecord, Heartbeat, MonitorTarget, PollCycleOutcome, PollStats, PollStatus,
    ProcessedItem, QuantitySpec,
};

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

/// Counts from one config sync.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl Database {
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("could not open database {}", url))?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// A private in-memory database. The pool keeps its single connection
    /// alive forever, since closing it would drop the data.
    pub async fn memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                feed_url TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                baseline DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                service_id INTEGER NOT NULL,
                service_name TEXT NOT NULL,
                quantity TEXT NOT NULL,
                comments TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (target_id) REFERENCES targets(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // The primary key is the dedup guarantee: one row per (target, guid).
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_items (
                target_id INTEGER NOT NULL,
                guid TEXT NOT NULL,
                claimed_at DATETIME NOT NULL,
                actions_triggered INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (target_id, guid),
                FOREIGN KEY (target_id) REFERENCES targets(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_id INTEGER NOT NULL,
                polled_at DATETIME NOT NULL,
                items_seen INTEGER NOT NULL,
                new_items INTEGER NOT NULL,
                actions_triggered INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                FOREIGN KEY (target_id) REFERENCES targets(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_poll_log_polled_at ON poll_log(polled_at)")
            .execute(&self.pool)
            .await?;

        // Actions are keyed by their place in the target's config so ids survive re-syncs.
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_actions_target_position ON actions(target_id, position)")
            .execute(&self.pool)
            .await?;

        // Single row, written by whichever process runs the poll loop.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduler_heartbeat (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                beat_at DATETIME NOT NULL,
                interval_secs INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                action_id INTEGER NOT NULL,
                service_id INTEGER NOT NULL,
                service_name TEXT NOT NULL,
                item_link TEXT NOT NULL,
                item_title TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                comments TEXT,
                external_id TEXT,
                error TEXT,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---------------------------------------------------------------
    // Monitor targets
    // ---------------------------------------------------------------

    /// Enabled targets with a baseline and at least one active action.
    /// Only active actions are attached to the returned targets.
    pub async fn list_eligible_targets(&self) -> Result<Vec<MonitorTarget>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.name, t.feed_url, t.enabled, t.baseline FROM targets t
            WHERE t.enabled = 1
              AND t.baseline IS NOT NULL
              AND EXISTS (
                  SELECT 1 FROM actions a
                  WHERE a.target_id = t.id AND a.active = 1
              )
            ORDER BY t.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows, true).await
    }

    pub async fn list_targets(&self) -> Result<Vec<MonitorTarget>> {
        let rows = sqlx::query("SELECT id, name, feed_url, enabled, baseline FROM targets ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        self.hydrate(rows, false).await
    }

    pub async fn find_target(&self, name: &str) -> Result<Option<MonitorTarget>> {
        let row = sqlx::query("SELECT id, name, feed_url, enabled, baseline FROM targets WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row], false).await?.pop()),
            None => Ok(None),
        }
    }

    /// Targets that have an active action but were never baselined.
    pub async fn targets_missing_baseline(&self) -> Result<Vec<MonitorTarget>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.name, t.feed_url, t.enabled, t.baseline FROM targets t
            WHERE t.baseline IS NULL
              AND EXISTS (
                  SELECT 1 FROM actions a
                  WHERE a.target_id = t.id AND a.active = 1
              )
            ORDER BY t.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows, false).await
    }

    /// Sets the baseline only if none exists yet. Returns whether it was set.
    pub async fn set_baseline_if_absent(&self, target_id: i64, baseline: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE targets SET baseline = ? WHERE id = ? AND baseline IS NULL")
            .bind(baseline)
            .bind(target_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn hydrate(&self, rows: Vec<SqliteRow>, active_only: bool) -> Result<Vec<MonitorTarget>> {
        let mut targets = Vec::with_capacity(rows.len());

        for row in rows {
            let id: i64 = row.try_get("id")?;
            targets.push(MonitorTarget {
                id,
                name: row.try_get("name")?,
                feed_url: row.try_get("feed_url")?,
                enabled: row.try_get("enabled")?,
                baseline: row.try_get("baseline")?,
                actions: self.actions_for(id, active_only).await?,
            });
        }

        Ok(targets)
    }

    async fn actions_for(&self, target_id: i64, active_only: bool) -> Result<Vec<Action>> {
        let rows = sqlx::query(
            r#"
            SELECT id, service_id, service_name, quantity, comments, active FROM actions
            WHERE target_id = ? AND (? = 0 OR active = 1)
            ORDER BY position
            "#,
        )
        .bind(target_id)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(action_from_row).collect()
    }

    /// Mirrors the configured targets into storage. Baselines are left alone;
    /// targets missing from the config are deleted along with their ledger.
    pub async fn sync_targets(&self, configs: &[TargetConfig]) -> Result<SyncReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = SyncReport::default();

        let existing: HashSet<String> = sqlx::query("SELECT name FROM targets")
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|row| row.get::<String, _>(0))
            .collect();

        for config in configs {
            let target_id: i64 = sqlx::query(
                r#"
                INSERT INTO targets (name, feed_url, enabled)
                VALUES (?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET feed_url = excluded.feed_url, enabled = excluded.enabled
                RETURNING id
                "#,
            )
            .bind(&config.name)
            .bind(&config.feed_url)
            .bind(config.enabled)
            .fetch_one(&mut *tx)
            .await?
            .get(0);

            if existing.contains(&config.name) {
                report.updated += 1;
            } else {
                report.added += 1;
            }

            for (position, action) in config.actions.iter().enumerate() {
                let comments = action.comments.as_ref().map(serde_json::to_string).transpose()?;
                sqlx::query(
                    r#"
                    INSERT INTO actions (target_id, position, service_id, service_name, quantity, comments, active)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(target_id, position) DO UPDATE SET
                        service_id = excluded.service_id,
                        service_name = excluded.service_name,
                        quantity = excluded.quantity,
                        comments = excluded.comments,
                        active = excluded.active
                    "#,
                )
                .bind(target_id)
                .bind(position as i64)
                .bind(action.service_id)
                .bind(&action.service_name)
                .bind(serde_json::to_string(&action.quantity)?)
                .bind(comments)
                .bind(action.active)
                .execute(&mut *tx)
                .await?;
            }

            let dropped = sqlx::query("DELETE FROM actions WHERE target_id = ? AND position >= ?")
                .bind(target_id)
                .bind(config.actions.len() as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if dropped > 0 {
                debug!("Dropped {} actions no longer configured for '{}'", dropped, config.name);
            }
        }

        let configured: HashSet<&str> = configs.iter().map(|c| c.name.as_str()).collect();
        for name in existing.iter().filter(|n| !configured.contains(n.as_str())) {
            sqlx::query("DELETE FROM targets WHERE name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            info!("Removed target '{}' and its processed items", name);
            report.removed += 1;
        }

        tx.commit().await?;
        Ok(report)
    }

    // ---------------------------------------------------------------
    // Processed item ledger
    // ---------------------------------------------------------------

    /// Atomically claims `(target_id, guid)`. Returns true only for the one
    /// caller whose insert created the row; a duplicate is not an error.
    pub async fn try_claim(&self, target_id: i64, guid: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_items (target_id, guid, claimed_at)
            VALUES (?, ?, ?)
            ON CONFLICT (target_id, guid) DO NOTHING
            "#,
        )
        .bind(target_id)
        .bind(guid)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() == 1;
        if !claimed {
            debug!("Item {} of target {} already claimed", guid, target_id);
        }
        Ok(claimed)
    }

    pub async fn record_trigger_count(&self, target_id: i64, guid: &str, count: i64) -> Result<()> {
        sqlx::query("UPDATE processed_items SET actions_triggered = ? WHERE target_id = ? AND guid = ?")
            .bind(count)
            .bind(target_id)
            .bind(guid)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Ledger rows of one target, newest claim first. For display only; the
    /// claim path never reads before inserting.
    pub async fn processed_items(&self, target_id: i64, limit: i64) -> Result<Vec<ProcessedItem>> {
        let rows = sqlx::query(
            r#"
            SELECT target_id, guid, claimed_at, actions_triggered FROM processed_items
            WHERE target_id = ?
            ORDER BY claimed_at DESC
            LIMIT ?
            "#,
        )
        .bind(target_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ProcessedItem {
                    target_id: row.try_get("target_id")?,
                    guid: row.try_get("guid")?,
                    claimed_at: row.try_get("claimed_at")?,
                    actions_triggered: row.try_get("actions_triggered")?,
                })
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // Poll audit log
    // ---------------------------------------------------------------

    pub async fn record_outcome(&self, outcome: &PollCycleOutcome) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO poll_log
            (target_id, polled_at, items_seen, new_items, actions_triggered, status, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(outcome.target_id)
        .bind(outcome.polled_at)
        .bind(outcome.items_seen)
        .bind(outcome.new_items)
        .bind(outcome.actions_triggered)
        .bind(outcome.status.as_str())
        .bind(&outcome.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Newest outcomes first, optionally for a single target.
    pub async fn recent_outcomes(&self, limit: i64, target_id: Option<i64>) -> Result<Vec<PollCycleOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT target_id, polled_at, items_seen, new_items, actions_triggered, status, error
            FROM poll_log
            WHERE (? IS NULL OR target_id = ?)
            ORDER BY polled_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(target_id)
        .bind(target_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(PollCycleOutcome {
                    target_id: row.try_get("target_id")?,
                    polled_at: row.try_get("polled_at")?,
                    items_seen: row.try_get("items_seen")?,
                    new_items: row.try_get("new_items")?,
                    actions_triggered: row.try_get("actions_triggered")?,
                    status: PollStatus::parse(&status).unwrap_or(PollStatus::Error),
                    error: row.try_get("error")?,
                })
            })
            .collect()
    }

    pub async fn last_poll_time(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT polled_at FROM poll_log ORDER BY polled_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("polled_at")?),
            None => None,
        })
    }

    pub async fn stats_since(&self, since: DateTime<Utc>) -> Result<PollStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_polls,
                COALESCE(SUM(new_items), 0) AS new_items,
                COALESCE(SUM(actions_triggered), 0) AS actions_triggered,
                COUNT(CASE WHEN status = 'error' THEN 1 END) AS errors
            FROM poll_log
            WHERE polled_at >= ?
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(PollStats {
            total_polls: row.try_get("total_polls")?,
            new_items: row.try_get("new_items")?,
            actions_triggered: row.try_get("actions_triggered")?,
            errors: row.try_get("errors")?,
        })
    }

    pub async fn prune_outcomes(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM poll_log WHERE polled_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ---------------------------------------------------------------
    // Scheduler heartbeat
    // ---------------------------------------------------------------

    pub async fn record_heartbeat(&self, beat_at: DateTime<Utc>, interval_secs: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_heartbeat (id, beat_at, interval_secs)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET beat_at = excluded.beat_at, interval_secs = excluded.interval_secs
            "#,
        )
        .bind(beat_at)
        .bind(interval_secs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn clear_heartbeat(&self) -> Result<()> {
        sqlx::query("DELETE FROM scheduler_heartbeat").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<Option<Heartbeat>> {
        let row = sqlx::query("SELECT beat_at, interval_secs FROM scheduler_heartbeat WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => Some(Heartbeat {
                beat_at: row.try_get("beat_at")?,
                interval_secs: row.try_get("interval_secs")?,
            }),
            None => None,
        })
    }

    // ---------------------------------------------------------------
    // Execution history
    // ---------------------------------------------------------------

    pub async fn record_execution(&self, record: &ExecutionRecord) -> Result<i64> {
        let comments = record.comments.as_ref().map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            INSERT INTO execution_history
            (source, target_id, action_id, service_id, service_name, item_link, item_title,
             quantity, comments, external_id, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&record.source)
        .bind(record.target_id)
        .bind(record.action_id)
        .bind(record.service_id)
        .bind(&record.service_name)
        .bind(&record.item_link)
        .bind(&record.item_title)
        .bind(record.quantity as i64)
        .bind(comments)
        .bind(&record.external_id)
        .bind(&record.error)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(result.get(0))
    }

    pub async fn recent_executions(&self, limit: i64) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT source, target_id, action_id, service_id, service_name, item_link, item_title,
                   quantity, comments, external_id, error, created_at
            FROM execution_history
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let comments: Option<String> = row.try_get("comments")?;
                let quantity: i64 = row.try_get("quantity")?;
                Ok(ExecutionRecord {
                    source: row.try_get("source")?,
                    target_id: row.try_get("target_id")?,
                    action_id: row.try_get("action_id")?,
                    service_id: row.try_get("service_id")?,
                    service_name: row.try_get("service_name")?,
                    item_link: row.try_get("item_link")?,
                    item_title: row.try_get("item_title")?,
                    quantity: u32::try_from(quantity)?,
                    comments: comments.map(|c| serde_json::from_str(&c)).transpose()?,
                    external_id: row.try_get("external_id")?,
                    error: row.try_get("error")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

fn action_from_row(row: &SqliteRow) -> Result<Action> {
    let quantity: String = row.try_get("quantity")?;
    let comments: Option<String> = row.try_get("comments")?;

    Ok(Action {
        id: row.try_get("id")?,
        service_id: row.try_get("service_id")?,
        service_name: row.try_get("service_name")?,
        quantity: serde_json::from_str::<QuantitySpec>(&quantity)?,
        comments: comments.map(|c| serde_json::from_str::<CommentConfig>(&c)).transpose()?,
        active: row.try_get("active")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    use crate::testing::target_config;

    async fn target_id(db: &Database, name: &str) -> i64 {
        db.find_target(name).await.unwrap().unwrap().id
    }

    #[tokio::test]
    async fn eligible_targets_need_enabled_baseline_and_active_action() {
        let db = Database::memory().await.unwrap();
        db.sync_targets(&[
            target_config("ready", true, &[true, false]),
            target_config("disabled", false, &[true]),
            target_config("no-actions", true, &[]),
            target_config("inactive-actions", true, &[false]),
            target_config("no-baseline", true, &[true]),
        ])
        .await
        .unwrap();

        let now = Utc::now();
        for name in ["ready", "disabled", "no-actions", "inactive-actions"] {
            let id = target_id(&db, name).await;
            assert!(db.set_baseline_if_absent(id, now).await.unwrap());
        }

        let eligible = db.list_eligible_targets().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].name, "ready");
        // Inactive actions are not handed to the poller.
        assert_eq!(eligible[0].actions.len(), 1);
        assert!(eligible[0].actions.iter().all(|a| a.active));
    }

    #[tokio::test]
    async fn baseline_is_set_once_and_never_moved() {
        let db = Database::memory().await.unwrap();
        db.sync_targets(&[target_config("a", true, &[true])]).await.unwrap();
        let id = target_id(&db, "a").await;

        let missing = db.targets_missing_baseline().await.unwrap();
        assert_eq!(missing.len(), 1);

        let first = Utc::now();
        assert!(db.set_baseline_if_absent(id, first).await.unwrap());
        assert!(!db.set_baseline_if_absent(id, first - ChronoDuration::days(30)).await.unwrap());

        let target = db.find_target("a").await.unwrap().unwrap();
        assert_eq!(target.baseline, Some(first));
        assert!(db.targets_missing_baseline().await.unwrap().is_empty());

        // Re-syncing the config keeps the baseline.
        db.sync_targets(&[target_config("a", false, &[true, true])]).await.unwrap();
        let target = db.find_target("a").await.unwrap().unwrap();
        assert_eq!(target.baseline, Some(first));
        assert!(!target.enabled);
        assert_eq!(target.actions.len(), 2);
    }

    #[tokio::test]
    async fn resync_keeps_action_ids_stable() {
        let db = Database::memory().await.unwrap();
        db.sync_targets(&[target_config("a", true, &[true, true, true])]).await.unwrap();
        let before: Vec<i64> = db.find_target("a").await.unwrap().unwrap().actions.iter().map(|a| a.id).collect();

        let mut changed = target_config("a", true, &[false, true]);
        changed.actions[1].quantity = QuantitySpec::Range { min: 5, max: 9 };
        db.sync_targets(&[changed]).await.unwrap();

        let after = db.find_target("a").await.unwrap().unwrap().actions;
        assert_eq!(after.iter().map(|a| a.id).collect::<Vec<_>>(), before[..2].to_vec());
        assert!(!after[0].active);
        assert_eq!(after[1].quantity, QuantitySpec::Range { min: 5, max: 9 });

        // A dropped action's id is not handed out again.
        db.sync_targets(&[target_config("a", true, &[true, true, true])]).await.unwrap();
        let regrown = db.find_target("a").await.unwrap().unwrap().actions;
        assert_eq!(regrown.len(), 3);
        assert_eq!(regrown[..2].iter().map(|a| a.id).collect::<Vec<_>>(), before[..2].to_vec());
        assert_ne!(regrown[2].id, before[2]);
    }

    #[tokio::test]
    async fn heartbeat_is_upserted_and_cleared() {
        let db = Database::memory().await.unwrap();
        assert!(db.heartbeat().await.unwrap().is_none());

        let first = Utc::now() - ChronoDuration::minutes(1);
        db.record_heartbeat(first, 60).await.unwrap();
        let now = Utc::now();
        db.record_heartbeat(now, 30).await.unwrap();
        assert_eq!(db.heartbeat().await.unwrap(), Some(Heartbeat { beat_at: now, interval_secs: 30 }));

        db.clear_heartbeat().await.unwrap();
        assert!(db.heartbeat().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_succeeds_once_per_key() {
        let db = Database::memory().await.unwrap();
        db.sync_targets(&[target_config("a", true, &[true]), target_config("b", true, &[true])])
            .await
            .unwrap();
        let a = target_id(&db, "a").await;
        let b = target_id(&db, "b").await;

        assert!(db.try_claim(a, "guid-1").await.unwrap());
        assert!(!db.try_claim(a, "guid-1").await.unwrap());
        // Same guid on another feed is a different key.
        assert!(db.try_claim(b, "guid-1").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let db = Database::memory().await.unwrap();
        db.sync_targets(&[target_config("a", true, &[true])]).await.unwrap();
        let a = target_id(&db, "a").await;

        let (first, second) = tokio::join!(db.try_claim(a, "race"), db.try_claim(a, "race"));
        let wins = [first.unwrap(), second.unwrap()].iter().filter(|c| **c).count();
        assert_eq!(wins, 1);

        let rows: i64 = sqlx::query("SELECT COUNT(*) FROM processed_items WHERE target_id = ? AND guid = 'race'")
            .bind(a)
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn removing_a_target_cascades_to_its_ledger() {
        let db = Database::memory().await.unwrap();
        db.sync_targets(&[target_config("a", true, &[true]), target_config("b", true, &[true])])
            .await
            .unwrap();
        let a = target_id(&db, "a").await;
        db.try_claim(a, "guid-1").await.unwrap();
        db.record_trigger_count(a, "guid-1", 1).await.unwrap();
        let ledger = db.processed_items(a, 10).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].guid, "guid-1");
        assert_eq!(ledger[0].actions_triggered, 1);

        let report = db.sync_targets(&[target_config("b", true, &[true])]).await.unwrap();
        assert_eq!(report, SyncReport { added: 0, updated: 1, removed: 1 });

        let rows: i64 = sqlx::query("SELECT COUNT(*) FROM processed_items")
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(rows, 0);
        let actions: i64 = sqlx::query("SELECT COUNT(*) FROM actions WHERE target_id = ?")
            .bind(a)
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(actions, 0);
    }

    #[tokio::test]
    async fn audit_log_reads_stats_and_prunes() {
        let db = Database::memory().await.unwrap();
        db.sync_targets(&[target_config("a", true, &[true])]).await.unwrap();
        let a = target_id(&db, "a").await;

        let now = Utc::now();
        let old = PollCycleOutcome {
            target_id: a,
            polled_at: now - ChronoDuration::days(10),
            items_seen: 4,
            new_items: 1,
            actions_triggered: 2,
            status: PollStatus::Success,
            error: None,
        };
        let recent = PollCycleOutcome {
            polled_at: now,
            items_seen: 5,
            new_items: 2,
            actions_triggered: 3,
            ..old.clone()
        };
        let failed = PollCycleOutcome {
            polled_at: now - ChronoDuration::minutes(5),
            ..PollCycleOutcome::failed(a, "boom".to_string())
        };
        for outcome in [&old, &recent, &failed] {
            db.record_outcome(outcome).await.unwrap();
        }

        assert_eq!(db.last_poll_time().await.unwrap(), Some(now));

        let listed = db.recent_outcomes(10, Some(a)).await.unwrap();
        assert_eq!(listed, vec![recent.clone(), failed.clone(), old.clone()]);
        assert_eq!(db.recent_outcomes(1, None).await.unwrap(), vec![recent.clone()]);

        let stats = db.stats_since(now - ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(stats, PollStats { total_polls: 2, new_items: 2, actions_triggered: 3, errors: 1 });

        assert_eq!(db.prune_outcomes(now - ChronoDuration::days(1)).await.unwrap(), 1);
        assert_eq!(db.recent_outcomes(10, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn execution_history_round_trips_failures_too() {
        let db = Database::memory().await.unwrap();
        let record = ExecutionRecord {
            source: crate::models::EXECUTION_SOURCE.to_string(),
            target_id: 1,
            action_id: 2,
            service_id: 3,
            service_name: "comments".to_string(),
            item_link: "https://example.com/post".to_string(),
            item_title: "Post".to_string(),
            quantity: 2,
            comments: Some(vec!["one".to_string(), "two".to_string()]),
            external_id: None,
            error: Some("order rejected: not enough funds".to_string()),
            created_at: Utc::now(),
        };

        db.record_execution(&record).await.unwrap();
        assert_eq!(db.recent_executions(5).await.unwrap(), vec![record]);
    }
}
