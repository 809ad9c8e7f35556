//! Fakes for the external collaborators, shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::comments::{CommentGenerator, CommentRequest};
use crate::config::{ActionConfig, TargetConfig};
use crate::db::Database;
use crate::error::{FeedError, GenerationError, SubmitError};
use crate::executor::{ActionExecutor, OrderRequest};
use crate::feed::FeedSource;
use crate::models::{Item, QuantitySpec, ServiceBounds};

/// Fixed reference instant; item offsets are seconds relative to it.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn item(guid: &str, offset_secs: i64) -> Item {
    Item {
        guid: guid.to_string(),
        link: format!("https://example.com/p/{}", guid),
        title: format!("Post {}", guid),
        content: Some("body".to_string()),
        published_at: Some(t0() + chrono::Duration::seconds(offset_secs)),
    }
}

pub fn feed_url(name: &str) -> String {
    format!("https://feeds.example/{}.xml", name)
}

pub fn target_config(name: &str, enabled: bool, active_actions: &[bool]) -> TargetConfig {
    TargetConfig {
        name: name.to_string(),
        feed_url: feed_url(name),
        enabled,
        actions: active_actions
            .iter()
            .enumerate()
            .map(|(i, active)| ActionConfig {
                service_id: 100 + i as i64,
                service_name: format!("service-{}", i),
                quantity: QuantitySpec::Fixed(10),
                bounds: ServiceBounds::default(),
                comments: None,
                active: *active,
            })
            .collect(),
    }
}

/// Syncs the configs and gives every target the baseline `t0()`.
pub async fn seed(db: &Database, configs: &[TargetConfig]) {
    db.sync_targets(configs).await.unwrap();
    for target in db.list_targets().await.unwrap() {
        db.set_baseline_if_absent(target.id, t0()).await.unwrap();
    }
}

#[derive(Default)]
pub struct FakeFeeds {
    feeds: Mutex<HashMap<String, Vec<Item>>>,
    delays: Mutex<HashMap<String, Duration>>,
    fetches: AtomicUsize,
}

impl FakeFeeds {
    /// Serve `items` at `url`. Unknown urls fail like a dead host.
    pub fn set(&self, url: &str, items: Vec<Item>) {
        self.feeds.lock().unwrap().insert(url.to_string(), items);
    }

    /// Make fetches of `url` sleep for `delay` before answering.
    pub fn set_delay(&self, url: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for FakeFeeds {
    async fn fetch(&self, url: &str) -> Result<Vec<Item>, FeedError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(url).copied();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        match self.feeds.lock().unwrap().get(url) {
            Some(items) => Ok(items.clone()),
            None => Err(FeedError::Status(reqwest::StatusCode::BAD_GATEWAY)),
        }
    }
}

#[derive(Default)]
pub struct FakeExecutor {
    orders: Mutex<Vec<OrderRequest>>,
    failing: Vec<i64>,
    delay: Option<Duration>,
}

impl FakeExecutor {
    pub fn failing_for(service_ids: &[i64]) -> Self {
        Self { failing: service_ids.to_vec(), ..Self::default() }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Self::default() }
    }

    /// Every order that reached the executor, failed ones included.
    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for FakeExecutor {
    async fn submit(&self, order: &OrderRequest) -> Result<String, SubmitError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let id = {
            let mut orders = self.orders.lock().unwrap();
            orders.push(order.clone());
            orders.len()
        };
        if self.failing.contains(&order.service_id) {
            return Err(SubmitError::Rejected("not enough funds".to_string()));
        }
        Ok(format!("order-{}", id))
    }
}

pub struct FakeGenerator {
    reply: Option<Vec<String>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<(String, usize)>>,
}

impl FakeGenerator {
    pub fn returning(comments: &[&str]) -> Self {
        Self {
            reply: Some(comments.iter().map(|c| c.to_string()).collect()),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self { reply: None, delay: None, requests: Mutex::new(Vec::new()) }
    }

    /// Answers like `returning`, but only after `delay`.
    pub fn stalling(delay: Duration, comments: &[&str]) -> Self {
        Self { delay: Some(delay), ..Self::returning(comments) }
    }

    /// `(directives, count)` for each call.
    pub fn requests(&self) -> Vec<(String, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommentGenerator for FakeGenerator {
    async fn generate(&self, request: &CommentRequest<'_>) -> Result<Vec<String>, GenerationError> {
        self.requests
            .lock()
            .unwrap()
            .push((request.directives.to_string(), request.count));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.clone().ok_or(GenerationError::Empty)
    }
}
