use std::sync::Arc;
use clap::{Parser, Subcommand};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use log::{info, warn};

mod comments;
mod config;
mod db;
mod dispatch;
mod error;
mod executor;
mod feed;
mod logger;
mod models;
mod poller;
mod scheduler;
#[cfg(test)]
mod testing;

use crate::comments::{CommentGenerator, HttpCommentGenerator};
use crate::config::Settings;
use crate::dispatch::ActionDispatcher;
use crate::executor::PanelClient;
use crate::feed::HttpFeedSource;
use crate::poller::PollCycleRunner;
use crate::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(author, version, about = "Polls feeds and fires configured actions for new items", long_about = None)]
struct Args {
    /// Path to the YAML settings file
    #[arg(short, long, default_value = "triggerrss.yaml")]
    config: String,

    /// Overrides `database_url` from the settings file
    #[arg(short, long)]
    database: Option<String>,

    /// Overrides the console log level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync targets, then poll on the configured interval until Ctrl-C
    Run,
    /// Run a single poll cycle now
    Poll,
    /// Show scheduler and polling status
    Status,
    /// Write the configured targets to the database and establish baselines
    Sync,
    /// Establish the baseline for one target if it has none
    Baseline { name: String },
    /// Show recent poll outcomes
    Log {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: i64,
        #[arg(short, long)]
        target: Option<String>,
    },
    /// Show the items a target has already fired for
    Processed {
        name: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: i64,
    },
    /// Show recent action executions
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: i64,
    },
    /// Delete poll outcomes older than the given number of days
    Prune {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(&args.config)?;
    if let Some(url) = args.database {
        settings.database_url = url;
    }
    if let Some(level) = args.log_level {
        settings.log.console_level = level;
    }
    logger::init(&settings.log)?;

    let db = db::Database::new(&settings.database_url).await?;
    let runner = Arc::new(build_runner(&settings, db.clone())?);
    let scheduler = Scheduler::new(runner.clone(), settings.poll_interval());

    match args.command {
        Command::Run => {
            sync(&settings, &db, &runner).await?;
            scheduler.start().await;
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            scheduler.shutdown().await;
        }
        Command::Poll => {
            let summary = scheduler.poll_now().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Status => {
            let status = scheduler.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Sync => sync(&settings, &db, &runner).await?,
        Command::Baseline { name } => {
            let target = db
                .find_target(&name)
                .await?
                .ok_or_else(|| anyhow!("no target named '{}'", name))?;
            match runner.establish_baseline(&target).await? {
                Some(baseline) => println!("Baseline for '{}' set to {}", name, baseline),
                None => println!(
                    "'{}' already has a baseline ({})",
                    name,
                    target.baseline.map(|b| b.to_rfc3339()).unwrap_or_default()
                ),
            }
        }
        Command::Log { limit, target } => {
            let target_id = match target {
                Some(name) => Some(
                    db.find_target(&name)
                        .await?
                        .ok_or_else(|| anyhow!("no target named '{}'", name))?
                        .id,
                ),
                None => None,
            };
            for outcome in db.recent_outcomes(limit, target_id).await? {
                println!(
                    "{} target={} status={} seen={} new={} triggered={}{}",
                    outcome.polled_at.format("%Y-%m-%d %H:%M:%S"),
                    outcome.target_id,
                    outcome.status.as_str(),
                    outcome.items_seen,
                    outcome.new_items,
                    outcome.actions_triggered,
                    outcome.error.map(|e| format!(" error={}", e)).unwrap_or_default()
                );
            }
        }
        Command::Processed { name, limit } => {
            let target = db
                .find_target(&name)
                .await?
                .ok_or_else(|| anyhow!("no target named '{}'", name))?;
            for item in db.processed_items(target.id, limit).await? {
                println!(
                    "{} {} triggered={}",
                    item.claimed_at.format("%Y-%m-%d %H:%M:%S"),
                    item.guid,
                    item.actions_triggered
                );
            }
        }
        Command::History { limit } => {
            for record in db.recent_executions(limit).await? {
                println!(
                    "{} {} x{} -> {} [{}]",
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.service_name,
                    record.quantity,
                    record.item_link,
                    record
                        .external_id
                        .map(|id| format!("order {}", id))
                        .or(record.error.map(|e| format!("failed: {}", e)))
                        .unwrap_or_default()
                );
            }
        }
        Command::Prune { days } => {
            let removed = db.prune_outcomes(Utc::now() - chrono::Duration::days(days)).await?;
            println!("Removed {} poll log entries", removed);
        }
    }

    Ok(())
}

fn build_runner(settings: &Settings, db: db::Database) -> Result<PollCycleRunner> {
    let feeds = Arc::new(HttpFeedSource::new(settings.feed_timeout())?);
    let executor = Arc::new(
        PanelClient::new(&settings.executor, settings.dispatch_timeout()).context("could not build order client")?,
    );
    let generator = match &settings.generator {
        Some(config) => Some(Arc::new(HttpCommentGenerator::new(config, settings.generation_timeout())?)
            as Arc<dyn CommentGenerator>),
        None => None,
    };

    let dispatcher = ActionDispatcher::new(
        db.clone(),
        executor,
        generator,
        settings.comment_fill,
        settings.dispatch_timeout(),
        settings.generation_timeout(),
    );
    Ok(PollCycleRunner::new(db, feeds, dispatcher, settings.feed_timeout()))
}

/// Mirrors the configured targets into storage, then baselines new ones.
async fn sync(settings: &Settings, db: &db::Database, runner: &PollCycleRunner) -> Result<()> {
    let report = db.sync_targets(&settings.targets).await?;
    info!(
        "Targets synced: {} added, {} updated, {} removed",
        report.added, report.updated, report.removed
    );

    let established = runner.establish_missing_baselines().await?;
    let missing = db.targets_missing_baseline().await?;
    if missing.is_empty() {
        info!("{} baselines established", established);
    } else {
        warn!(
            "{} baselines established, {} targets still without one and not polled",
            established,
            missing.len()
        );
    }
    Ok(())
}
