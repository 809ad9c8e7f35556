use std::sync::OnceLock;
use std::time::Duration;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::{CommentFill, EndpointConfig};
use crate::error::GenerationError;
use crate::models::CommentConfig;

/// Upper bound on comments requested per trigger.
pub const MAX_COMMENTS: usize = 100;

/// Last-resort pool when neither generation nor a manual pool is available.
pub const GENERIC_COMMENTS: &[&str] = &[
    "Great post!",
    "Love this!",
    "Amazing content!",
    "So true!",
    "Thanks for sharing!",
    "This is awesome!",
    "Well said!",
    "Really interesting!",
];

#[derive(Debug, Clone, PartialEq)]
pub struct CommentRequest<'a> {
    pub content: &'a str,
    pub directives: &'a str,
    pub count: usize,
    pub use_hashtags: bool,
    pub use_emojis: bool,
}

#[async_trait]
pub trait CommentGenerator: Send + Sync {
    async fn generate(&self, request: &CommentRequest<'_>) -> Result<Vec<String>, GenerationError>;
}

/// Calls an LLM workflow endpoint that answers with `{ "text": ... }`.
pub struct HttpCommentGenerator {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpCommentGenerator {
    pub fn new(config: &EndpointConfig, timeout: Duration) -> Result<Self, GenerationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

#[async_trait]
impl CommentGenerator for HttpCommentGenerator {
    async fn generate(&self, request: &CommentRequest<'_>) -> Result<Vec<String>, GenerationError> {
        let payload = json!({
            "question": "",
            "overrideConfig": {
                "startState": {
                    "startAgentflow_0": [
                        { "key": "caption", "value": request.content },
                        { "key": "comment_count", "value": request.count.to_string() },
                        { "key": "custom_input", "value": request.directives },
                        { "key": "use_hashtags", "value": yes_no(request.use_hashtags) },
                        { "key": "use_emojis", "value": yes_no(request.use_emojis) },
                    ]
                }
            }
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GenerationError::Status(response.status()));
        }

        let reply: Value = response.json().await?;
        let text = reply
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| GenerationError::Malformed("missing 'text' field".to_string()))?;

        let comments = parse_comments(text);
        if comments.is_empty() {
            return Err(GenerationError::Empty);
        }
        Ok(comments)
    }
}

/// Reads a JSON array of strings (optionally inside a code fence), or else
/// one comment per line with list markers stripped.
pub fn parse_comments(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    let json_part = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => "",
    };

    if let Ok(list) = serde_json::from_str::<Vec<String>>(json_part) {
        return list
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
    }

    static MARKER: OnceLock<Regex> = OnceLock::new();
    let marker = MARKER.get_or_init(|| Regex::new(r"^\s*(?:\d+[.)]|[-*•])\s*").expect("valid list marker regex"));
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .map(|line| marker.replace(line, "").trim().trim_matches('"').to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Builds exactly the comments to submit for one trigger.
///
/// `generated` is whatever the generator produced (empty when it failed or
/// was not asked). Gaps are filled from the manual pool, then the generic
/// pool, cycling as needed. With [`CommentFill::AsGenerated`] a non-empty
/// generator result is submitted as is.
pub fn assemble(generated: Vec<String>, config: &CommentConfig, count: usize, fill: CommentFill) -> Vec<String> {
    let count = count.clamp(1, MAX_COMMENTS);
    let mut comments: Vec<String> = generated.into_iter().take(count).collect();

    if !comments.is_empty() && fill == CommentFill::AsGenerated {
        return comments;
    }

    let manual: Vec<&str> = config
        .manual
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();
    let pool: Vec<&str> = if manual.is_empty() { GENERIC_COMMENTS.to_vec() } else { manual };

    let missing = count - comments.len();
    comments.extend(pool.iter().cycle().take(missing).map(|c| c.to_string()));
    comments
}
