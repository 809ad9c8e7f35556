use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use log::{error, info, warn};
use tokio::time::timeout;

use crate::comments::{self, CommentGenerator, CommentRequest, MAX_COMMENTS};
use crate::config::CommentFill;
use crate::db::Database;
use crate::error::{GenerationError, SubmitError};
use crate::executor::{ActionExecutor, OrderRequest};
use crate::models::{Action, CommentConfig, EXECUTION_SOURCE, ExecutionRecord, Item};

/// Executes one action for one item and keeps a record of every attempt.
pub struct ActionDispatcher {
    db: Database,
    executor: Arc<dyn ActionExecutor>,
    generator: Option<Arc<dyn CommentGenerator>>,
    fill: CommentFill,
    submit_timeout: Duration,
    generation_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(
        db: Database,
        executor: Arc<dyn ActionExecutor>,
        generator: Option<Arc<dyn CommentGenerator>>,
        fill: CommentFill,
        submit_timeout: Duration,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            db,
            executor,
            generator,
            fill,
            submit_timeout,
            generation_timeout,
        }
    }

    /// Resolves the quantity, prepares comments if needed and submits the
    /// order. The execution record is written whatever the outcome; only the
    /// submission itself can fail the dispatch.
    pub async fn dispatch(&self, target_id: i64, item: &Item, action: &Action) -> Result<String, SubmitError> {
        let quantity = action.quantity.resolve();

        let comments = match &action.comments {
            Some(config) => Some(self.prepare_comments(item, config, quantity as usize).await),
            None => None,
        };

        let order = OrderRequest {
            service_id: action.service_id,
            link: item.link.clone(),
            quantity,
            comments,
        };

        let result = match timeout(self.submit_timeout, self.executor.submit(&order)).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Timeout(self.submit_timeout)),
        };

        let record = ExecutionRecord {
            source: EXECUTION_SOURCE.to_string(),
            target_id,
            action_id: action.id,
            service_id: action.service_id,
            service_name: action.service_name.clone(),
            item_link: item.link.clone(),
            item_title: item.title.clone(),
            quantity,
            comments: order.comments,
            external_id: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.record_execution(&record).await {
            error!("Failed to record execution of action {} for {}: {}", action.id, item.link, e);
        }

        match &result {
            Ok(order_id) => info!(
                "Triggered {} x{} for {} (order {})",
                action.service_name, quantity, item.link, order_id
            ),
            Err(e) => warn!("Action {} failed for {}: {}", action.id, item.link, e),
        }

        result
    }

    /// Never fails: generator errors fall through to the manual and generic pools.
    async fn prepare_comments(&self, item: &Item, config: &CommentConfig, quantity: usize) -> Vec<String> {
        let count = quantity.clamp(1, MAX_COMMENTS);

        let generated = match (&self.generator, config.generate) {
            (Some(generator), true) => {
                let content = item.text();
                let request = CommentRequest {
                    content: &content,
                    directives: &config.directives,
                    count,
                    use_hashtags: config.use_hashtags,
                    use_emojis: config.use_emojis,
                };
                let result = match timeout(self.generation_timeout, generator.generate(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(GenerationError::Timeout(self.generation_timeout)),
                };
                match result {
                    Ok(comments) => comments,
                    Err(e) => {
                        warn!("Comment generation failed for {}, using fallback comments: {}", item.link, e);
                        Vec::new()
                    }
                }
            }
            (None, true) => {
                warn!("Comment generation requested but no generator is configured");
                Vec::new()
            }
            _ => Vec::new(),
        };

        comments::assemble(generated, config, count, self.fill)
    }
}
