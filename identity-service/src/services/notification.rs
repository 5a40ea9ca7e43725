//! Security event notifications.
//!
//! Events are dispatched fire-and-forget: the flow that raises them never
//! waits for delivery and never fails because delivery failed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SecurityEvent {
    UserProvisioned {
        user_id: Uuid,
        organization_id: Option<Uuid>,
        email: String,
        sso_provider: String,
    },
    AccountLocked {
        user_id: Uuid,
        organization_id: Option<Uuid>,
        lockout_until: DateTime<Utc>,
    },
}

impl SecurityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SecurityEvent::UserProvisioned { .. } => "user_provisioned",
            SecurityEvent::AccountLocked { .. } => "account_locked",
        }
    }
}

#[async_trait]
pub trait SecurityNotifier: Send + Sync {
    async fn notify(&self, event: SecurityEvent) -> anyhow::Result<()>;
}

/// Spawn delivery of `event` and return immediately.
pub fn dispatch(notifier: &Arc<dyn SecurityNotifier>, event: SecurityEvent) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        let name = event.name();
        if let Err(e) = notifier.notify(event).await {
            tracing::warn!(error = %e, event = name, "Security notification failed");
        }
    });
}

/// Default notifier: records the event in the structured log only.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl SecurityNotifier for TracingNotifier {
    async fn notify(&self, event: SecurityEvent) -> anyhow::Result<()> {
        tracing::info!(event = event.name(), payload = ?event, "Security event");
        Ok(())
    }
}

/// Posts events as JSON to an operator-configured webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        tracing::info!(url = %url, "Security webhook notifier configured");
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl SecurityNotifier for WebhookNotifier {
    async fn notify(&self, event: SecurityEvent) -> anyhow::Result<()> {
        let response = self.client.post(&self.url).json(&event).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("webhook returned {}", response.status());
        }

        tracing::debug!(event = event.name(), "Security event delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn webhook_posts_tagged_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/security"))
            .and(body_partial_json(serde_json::json!({
                "event": "user_provisioned",
                "email": "new@example.com"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            &format!("{}/hooks/security", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();

        notifier
            .notify(SecurityEvent::UserProvisioned {
                user_id: Uuid::new_v4(),
                organization_id: None,
                email: "new@example.com".to_string(),
                sso_provider: "global_google".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn webhook_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let result = notifier
            .notify(SecurityEvent::AccountLocked {
                user_id: Uuid::new_v4(),
                organization_id: None,
                lockout_until: Utc::now(),
            })
            .await;

        assert!(result.is_err());
    }
}
