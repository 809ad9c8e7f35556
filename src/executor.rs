use std::time::Duration;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::EndpointConfig;
use crate::error::SubmitError;

/// One order to place with the external panel.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub service_id: i64,
    pub link: String,
    pub quantity: u32,
    pub comments: Option<Vec<String>>,
}

/// Places orders. Returns the panel's order identifier.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn submit(&self, order: &OrderRequest) -> Result<String, SubmitError>;
}

/// Client for a panel speaking the common `action=add` form API.
pub struct PanelClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct PanelReply {
    order: Option<Value>,
    error: Option<String>,
}

impl PanelClient {
    pub fn new(config: &EndpointConfig, timeout: Duration) -> Result<Self, SubmitError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn form(&self, order: &OrderRequest) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("key", self.api_key.clone()),
            ("action", "add".to_string()),
            ("service", order.service_id.to_string()),
            ("link", order.link.clone()),
            ("quantity", order.quantity.to_string()),
        ];
        if let Some(comments) = order.comments.as_ref().filter(|c| !c.is_empty()) {
            form.push(("comments", comments.join("\n")));
        }
        form
    }
}

#[async_trait]
impl ActionExecutor for PanelClient {
    async fn submit(&self, order: &OrderRequest) -> Result<String, SubmitError> {
        let reply: Value = self
            .client
            .post(&self.endpoint)
            .form(&self.form(order))
            .send()
            .await?
            .json()
            .await?;

        order_id_from_reply(reply)
    }
}

/// Order ids come back as either numbers or strings.
fn order_id_from_reply(reply: Value) -> Result<String, SubmitError> {
    let parsed: PanelReply =
        serde_json::from_value(reply.clone()).map_err(|_| SubmitError::Malformed(reply.to_string()))?;

    if let Some(error) = parsed.error {
        return Err(SubmitError::Rejected(error));
    }

    match parsed.order {
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(SubmitError::Malformed(reply.to_string())),
    }
}
