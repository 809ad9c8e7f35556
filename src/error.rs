use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feed returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("could not parse feed: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("unexpected reply: {0}")]
    Malformed(String),
    #[error("submission timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("generator returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("unexpected reply: {0}")]
    Malformed(String),
    #[error("generator returned no comments")]
    Empty,
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0} must be at least 1 second")]
    ZeroTimeout(&'static str),
    #[error("target '{0}' is defined more than once")]
    DuplicateTarget(String),
    #[error("target '{target}', service {service_id}: {reason}")]
    InvalidAction {
        target: String,
        service_id: i64,
        reason: String,
    },
}
