use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

use crate::core::config::{AppConfig, QueueConfig};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Producer side of the delivery queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Returns the queue's message id, or `None` if the queue accepted the
    /// task without naming it.
    async fn enqueue(&self, queue_name: &str, task: &Value) -> Result<Option<String>>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    message_id: Option<String>,
}

/// Publishes tasks through the queue's HTTP publish API, addressed to this
/// service's own intake route.
pub struct QueueProducer {
    publish_url: String,
    token: String,
    public_url: String,
    client: Client,
}

impl QueueProducer {
    pub fn new(cfg: &QueueConfig, public_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(PUBLISH_TIMEOUT).build()?;
        Ok(Self {
            publish_url: cfg.publish_url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            public_url: public_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Self::new(&cfg.queue, &cfg.server.public_url)
    }

    fn destination(&self, queue_name: &str) -> String {
        format!("{}/internal/process-{}", self.public_url, queue_name)
    }
}

#[async_trait]
impl TaskQueue for QueueProducer {
    async fn enqueue(&self, queue_name: &str, task: &Value) -> Result<Option<String>> {
        if self.publish_url.is_empty() {
            return Err(anyhow!("queue publish URL is not configured"));
        }
        let url = format!("{}/{}", self.publish_url, self.destination(queue_name));
        let mut request = self.client.post(&url).json(task);
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.token));
        }
        let res = request
            .send()
            .await
            .map_err(|e| anyhow!("queue publish failed: {}", e))?;
        let status = res.status();
        if !status.is_success() {
            return Err(anyhow!(
                "queue publish rejected {}: {}",
                status,
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: PublishResponse = res.json().await?;
        if let Some(id) = &parsed.message_id {
            info!("Enqueued task on '{}' as message {}", queue_name, id);
        }
        Ok(parsed.message_id)
    }
}
