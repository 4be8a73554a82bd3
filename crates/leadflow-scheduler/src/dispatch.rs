//! Alert dispatch: sends alerts to configured targets.
//! Supports: Slack incoming webhook, Discord webhook, Telegram Bot API,
//! generic HTTP webhook.

use std::time::Duration;

use async_trait::async_trait;

use leadflow_core::config::AlertConfig;
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::{AlertSink, SecretSource};

use crate::notify::Alert;

/// Alert target configuration. Credentials come from the secret store.
#[derive(Debug, Clone)]
pub enum AlertTarget {
    Slack { webhook_url: String },
    Discord { webhook_url: String },
    Telegram { bot_token: String, chat_id: String },
    /// Generic HTTP webhook, POST with JSON body.
    Webhook {
        url: String,
        headers: Vec<(String, String)>,
    },
}

impl AlertTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertTarget::Slack { .. } => "slack",
            AlertTarget::Discord { .. } => "discord",
            AlertTarget::Telegram { .. } => "telegram",
            AlertTarget::Webhook { .. } => "webhook",
        }
    }
}

/// Build targets from `[alert] targets`, resolving each target's secrets.
/// A configured target with a missing secret is a startup error.
pub fn targets_from_config(
    config: &AlertConfig,
    secrets: &dyn SecretSource,
) -> Result<Vec<AlertTarget>> {
    let mut targets = Vec::new();
    for name in &config.targets {
        let target = match name.as_str() {
            "slack" => AlertTarget::Slack {
                webhook_url: secrets.get("SLACK_WEBHOOK_URL")?,
            },
            "discord" => AlertTarget::Discord {
                webhook_url: secrets.get("DISCORD_WEBHOOK_URL")?,
            },
            "telegram" => AlertTarget::Telegram {
                bot_token: secrets.get("TELEGRAM_BOT_TOKEN")?,
                chat_id: secrets.get("TELEGRAM_CHAT_ID")?,
            },
            "webhook" => AlertTarget::Webhook {
                url: secrets.get("ALERT_WEBHOOK_URL")?,
                headers: secrets
                    .lookup("ALERT_WEBHOOK_TOKEN")
                    .map(|t| vec![("Authorization".to_string(), format!("Bearer {t}"))])
                    .unwrap_or_default(),
            },
            other => {
                return Err(LeadflowError::Config(format!("Unknown alert target '{other}'")));
            }
        };
        targets.push(target);
    }
    Ok(targets)
}

fn slack_payload(alert: &Alert) -> serde_json::Value {
    serde_json::json!({
        "text": alert.plain_text(),
        "blocks": [
            {"type": "header", "text": {"type": "plain_text", "text": format!("🚨 {}", alert.title)}},
            {"type": "section", "text": {"type": "mrkdwn", "text": alert.body}},
            {"type": "context", "elements": [{"type": "mrkdwn", "text": format!("{} • {}", alert.source, alert.timestamp.format("%Y-%m-%d %H:%M UTC"))}]}
        ]
    })
}

fn discord_payload(alert: &Alert) -> serde_json::Value {
    serde_json::json!({
        "embeds": [{
            "title": alert.title,
            "description": alert.body,
            "color": 0xFF0000,
            "footer": {
                "text": format!("{} • {}", alert.source, alert.timestamp.format("%H:%M:%S UTC"))
            }
        }]
    })
}

fn telegram_payload(chat_id: &str, alert: &Alert) -> serde_json::Value {
    serde_json::json!({
        "chat_id": chat_id,
        "text": format!(
            "🚨 *{}*\n\n{}\n\n_{}_",
            escape_markdown(&alert.title),
            escape_markdown(&alert.body),
            escape_markdown(&alert.source)
        ),
        "parse_mode": "Markdown"
    })
}

fn webhook_payload(alert: &Alert) -> serde_json::Value {
    serde_json::json!({
        "title": alert.title,
        "body": alert.body,
        "source": alert.source,
        "timestamp": alert.timestamp.to_rfc3339(),
    })
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}

/// Send one alert to one target.
pub async fn dispatch(
    client: &reqwest::Client,
    alert: &Alert,
    target: &AlertTarget,
) -> std::result::Result<(), String> {
    let req = match target {
        AlertTarget::Slack { webhook_url } => client.post(webhook_url).json(&slack_payload(alert)),
        AlertTarget::Discord { webhook_url } => {
            client.post(webhook_url).json(&discord_payload(alert))
        }
        AlertTarget::Telegram { bot_token, chat_id } => client
            .post(format!("https://api.telegram.org/bot{bot_token}/sendMessage"))
            .json(&telegram_payload(chat_id, alert)),
        AlertTarget::Webhook { url, headers } => {
            let mut req = client.post(url).json(&webhook_payload(alert));
            for (key, value) in headers {
                req = req.header(key.as_str(), value.as_str());
            }
            req
        }
    };

    let resp = req
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| format!("{} send failed: {e}", target.kind()))?;

    if resp.status().is_success() {
        tracing::info!("✅ {} alert sent: {}", target.kind(), alert.title);
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(format!("{} error {status}: {body}", target.kind()))
    }
}

/// `AlertSink` over every configured target. Succeeds if any target
/// accepted the alert.
pub struct AlertDispatcher {
    targets: Vec<AlertTarget>,
    client: reqwest::Client,
    source: String,
}

impl AlertDispatcher {
    pub fn new(targets: Vec<AlertTarget>, source: &str) -> Self {
        Self {
            targets,
            client: reqwest::Client::new(),
            source: source.to_string(),
        }
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

#[async_trait]
impl AlertSink for AlertDispatcher {
    async fn alert(&self, title: &str, body: &str) -> Result<()> {
        let alert = Alert::new(title, body, &self.source);
        if self.targets.is_empty() {
            tracing::info!("🔕 No alert targets configured, dropping: {title}");
            return Ok(());
        }

        let mut failures = Vec::new();
        for target in &self.targets {
            if let Err(e) = dispatch(&self.client, &alert, target).await {
                tracing::warn!("⚠️ Alert to {} failed: {e}", target.kind());
                failures.push(e);
            }
        }

        if failures.len() == self.targets.len() {
            return Err(LeadflowError::downstream("alert", failures.join("; ")));
        }
        tracing::info!(
            "🚨 Alert delivered to {}/{} target(s): {title}",
            self.targets.len() - failures.len(),
            self.targets.len()
        );
        Ok(())
    }
}
