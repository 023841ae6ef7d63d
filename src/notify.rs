use crate::types::NotificationTask;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Downstream delivery boundary. One call is one attempt; the dispatcher
/// owns retries. Implementations must make failure distinguishable from
/// success and should treat the payload's event key as the consumer-side
/// dedup handle.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, task: &NotificationTask) -> Result<()>;
}

/// Posts the task as JSON to a fixed endpoint. A non-2xx response is a
/// failed attempt.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build notification HTTP client")?;

        Ok(WebhookNotifier {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, task: &NotificationTask) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(task)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.endpoint))?;

        response
            .error_for_status()
            .with_context(|| format!("Endpoint {} rejected notification", self.endpoint))?;
        Ok(())
    }
}

/// Fallback when no endpoint is configured: balance changes only show up in
/// the logs. Useful for dry runs.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, task: &NotificationTask) -> Result<()> {
        info!(
            "Balance change for {:?} ({}): {} -> {}",
            task.address,
            task.asset.encode(),
            task.delta,
            task.new_balance
        );
        Ok(())
    }
}
