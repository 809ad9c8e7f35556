use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use rand::Rng;

/// One feed being watched, together with the actions fired for its new items.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitorTarget {
    pub id: i64,
    pub name: String,
    pub feed_url: String,
    /// Items published at or before this instant are never new.
    pub baseline: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub actions: Vec<Action>,
}

impl MonitorTarget {
    pub fn active_actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.active)
    }

    /// Enabled, baselined and with at least one active action.
    pub fn is_eligible(&self) -> bool {
        self.enabled && self.baseline.is_some() && self.active_actions().next().is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Action {
    pub id: i64,
    pub service_id: i64,
    pub service_name: String,
    pub quantity: QuantitySpec,
    /// Present for comment-style actions.
    pub comments: Option<CommentConfig>,
    pub active: bool,
}

/// How many units an action orders each time it fires.
///
/// In YAML a bare number is `Fixed`, a `{min, max}` map is `Range`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum QuantitySpec {
    Fixed(u32),
    Range { min: u32, max: u32 },
}

impl QuantitySpec {
    /// Draws a fresh value for every call when configured as a range.
    pub fn resolve(&self) -> u32 {
        match *self {
            QuantitySpec::Fixed(n) => n,
            QuantitySpec::Range { min, max } => rand::thread_rng().gen_range(min..=max),
        }
    }

    /// Checks the configured quantity against the service's allowed `[min, max]`.
    pub fn validate(&self, bounds: ServiceBounds) -> Result<(), String> {
        let (lo, hi) = match *self {
            QuantitySpec::Fixed(n) => (n, n),
            QuantitySpec::Range { min, max } => {
                if min > max {
                    return Err(format!("range min {} is greater than max {}", min, max));
                }
                (min, max)
            }
        };

        if lo < bounds.min || hi > bounds.max {
            return Err(format!(
                "quantity {}..={} is outside the service bounds {}..={}",
                lo, hi, bounds.min, bounds.max
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ServiceBounds {
    pub min: u32,
    pub max: u32,
}

impl Default for ServiceBounds {
    fn default() -> Self {
        Self { min: 1, max: 1_000_000 }
    }
}

/// Settings for comment-style actions.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct CommentConfig {
    /// Ask the comment generator for fresh text on every trigger.
    #[serde(default)]
    pub generate: bool,
    #[serde(default)]
    pub directives: String,
    #[serde(default)]
    pub use_hashtags: bool,
    #[serde(default)]
    pub use_emojis: bool,
    /// Static pool used when generation is off or fails.
    #[serde(default)]
    pub manual: Vec<String>,
}

/// An entry from a polled feed. Only `guid` takes part in dedup.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Item {
    pub guid: String,
    pub link: String,
    pub title: String,
    pub content: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl Item {
    /// Text handed to the comment generator.
    pub fn text(&self) -> String {
        match &self.content {
            Some(content) if !content.trim().is_empty() => format!("{}\n\n{}", self.title, content),
            _ => self.title.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProcessedItem {
    pub target_id: i64,
    pub guid: String,
    pub claimed_at: DateTime<Utc>,
    pub actions_triggered: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Success,
    NoNewItems,
    Error,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Success => "success",
            PollStatus::NoNewItems => "no_new_items",
            PollStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(PollStatus::Success),
            "no_new_items" => Some(PollStatus::NoNewItems),
            "error" => Some(PollStatus::Error),
            _ => None,
        }
    }
}

/// Per-target result of one cycle, as written to the audit log.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PollCycleOutcome {
    pub target_id: i64,
    pub polled_at: DateTime<Utc>,
    pub items_seen: i64,
    pub new_items: i64,
    pub actions_triggered: i64,
    pub status: PollStatus,
    pub error: Option<String>,
}

impl PollCycleOutcome {
    pub fn failed(target_id: i64, error: String) -> Self {
        Self {
            target_id,
            polled_at: Utc::now(),
            items_seen: 0,
            new_items: 0,
            actions_triggered: 0,
            status: PollStatus::Error,
            error: Some(error),
        }
    }
}

/// Aggregate returned by one `run_cycle` call.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub targets_eligible: usize,
    pub targets_processed: usize,
    pub new_items: i64,
    pub actions_triggered: i64,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

pub const EXECUTION_SOURCE: &str = "scheduled-trigger";

/// What happened when one action was dispatched for one item.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub source: String,
    pub target_id: i64,
    pub action_id: i64,
    pub service_id: i64,
    pub service_name: String,
    pub item_link: String,
    pub item_title: String,
    pub quantity: u32,
    pub comments: Option<Vec<String>>,
    pub external_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn succeeded(&self) -> bool {
        self.external_id.is_some() && self.error.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PollStats {
    pub total_polls: i64,
    pub new_items: i64,
    pub actions_triggered: i64,
    pub errors: i64,
}

/// Last sign of life from a running poll loop, possibly in another process.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Heartbeat {
    pub beat_at: DateTime<Utc>,
    pub interval_secs: i64,
}

impl Heartbeat {
    /// A loop that has missed two ticks in a row is taken to be gone.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.beat_at <= chrono::Duration::seconds(2 * self.interval_secs.max(1))
    }
}
