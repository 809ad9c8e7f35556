use std::time::Duration;
use async_trait::async_trait;
use feed_rs::parser;
use reqwest::Client;

use crate::error::FeedError;
use crate::models::Item;

/// Anything that can turn a feed endpoint into its current items.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Items may come back in any order.
    async fn fetch(&self, url: &str) -> Result<Vec<Item>, FeedError>;
}

/// Fetches RSS, Atom or JSON feeds over HTTP.
pub struct HttpFeedSource {
    client: Client,
}

impl HttpFeedSource {
    pub fn new(timeout: Duration) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("TriggerRss/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, url: &str) -> Result<Vec<Item>, FeedError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FeedError::Status(response.status()));
        }
        let bytes = response.bytes().await?;
        parse_items(&bytes[..])
    }
}

/// Parses a feed document into items. Entries without a link fall back to
/// their id, which feed-rs derives from the content when the feed has none.
pub fn parse_items(bytes: &[u8]) -> Result<Vec<Item>, FeedError> {
    let feed = parser::parse(bytes)?;

    Ok(feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_else(|| entry.id.clone());
            let content = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content));

            Item {
                guid: entry.id,
                link,
                title: entry.title.map(|t| t.content).unwrap_or_default(),
                content,
                published_at: entry.published.or(entry.updated),
            }
        })
        .collect())
}
