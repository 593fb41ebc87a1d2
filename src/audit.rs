use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::config::AuditConfig;
use crate::platform::telegram::Update;

/// One row in the update log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub chat_id: i64,
    pub user_id: u64,
    pub text: String,
    /// The update exactly as it arrived
    pub raw: serde_json::Value,
}

impl AuditRecord {
    /// For button presses `text` is the text of the message the button sits
    /// on, not the callback data. Updates with neither part log zeros.
    pub fn from_update(update: &Update, raw: serde_json::Value) -> Self {
        let (chat_id, user_id, text) = if let Some(msg) = &update.message {
            (
                msg.chat.id,
                msg.from.as_ref().map_or(0, |u| u.id),
                msg.text.clone().unwrap_or_default(),
            )
        } else if let Some((cq, msg)) = update
            .callback_query
            .as_ref()
            .and_then(|cq| cq.message.as_ref().map(|msg| (cq, msg)))
        {
            (msg.chat.id, cq.from.id, msg.text.clone().unwrap_or_default())
        } else {
            (0, 0, String::new())
        };

        Self {
            chat_id,
            user_id,
            text,
            raw,
        }
    }
}

/// Write-only sink for inbound updates. Delivery is best effort.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Inserts records into a Supabase table through its REST interface
pub struct SupabaseAudit {
    client: reqwest::Client,
    endpoint: String,
    service_key: String,
}

impl SupabaseAudit {
    pub fn new(client: reqwest::Client, config: &AuditConfig) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/rest/v1/{}",
                config.supabase_url.trim_end_matches('/'),
                config.table
            ),
            service_key: config.service_key.clone(),
        }
    }
}

#[async_trait]
impl AuditSink for SupabaseAudit {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await
            .context("Failed to send audit record")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Supabase insert failed ({}): {}", status, body);
        }

        Ok(())
    }
}

/// Fallback when no audit store is configured
pub struct TracingAudit;

#[async_trait]
impl AuditSink for TracingAudit {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        debug!(
            "Update from chat {} user {}: {:?}",
            record.chat_id, record.user_id, record.text
        );
        Ok(())
    }
}
