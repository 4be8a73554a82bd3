//! Email senders: HTTP email API, async SMTP, log-only dry run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use leadflow_core::config::{EmailConfig, expand_path};
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::{EmailSender, SecretSource};
use leadflow_core::types::{DeliveryReceipt, EmailMessage};

use crate::templates::TemplateStore;

/// Pick the sender named by `[email] provider`, resolving its credentials.
pub fn sender_from_config(
    config: &EmailConfig,
    secrets: &dyn SecretSource,
) -> Result<Arc<dyn EmailSender>> {
    let sender: Arc<dyn EmailSender> = match config.provider.as_str() {
        "http" => Arc::new(HttpEmailSender::new(
            &config.api_url,
            &secrets.get("EMAIL_API_KEY")?,
            &from_header(config),
        )),
        "smtp" => {
            let username = config
                .smtp_username
                .clone()
                .unwrap_or_else(|| config.from_address.clone());
            Arc::new(SmtpEmailSender::new(
                &config.smtp_host,
                config.smtp_port,
                &username,
                &secrets.get("SMTP_PASSWORD")?,
                &from_header(config),
                TemplateStore::new(expand_path(&config.templates_dir)),
            )?)
        }
        "log" => Arc::new(LogEmailSender),
        other => {
            return Err(LeadflowError::Config(format!("Unknown email provider '{other}'")));
        }
    };
    tracing::info!("📧 Email provider: {}", sender.name());
    Ok(sender)
}

fn from_header(config: &EmailConfig) -> String {
    match &config.from_name {
        Some(name) if !name.trim().is_empty() => format!("{name} <{}>", config.from_address),
        _ => config.from_address.clone(),
    }
}

// ─── HTTP email API ──────────────────────────────────────

/// Sends through a JSON email API with provider-side templates.
pub struct HttpEmailSender {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl HttpEmailSender {
    pub fn new(api_url: &str, api_key: &str, from: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        }
    }

    fn payload(&self, message: &EmailMessage) -> serde_json::Value {
        serde_json::json!({
            "from": self.from,
            "to": [message.to],
            "template": {
                "id": message.template_id,
                "variables": message.variables,
            },
            "tags": [{"name": "template", "value": message.template_id}],
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, message: &EmailMessage) -> Result<DeliveryReceipt> {
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&self.payload(message))
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| LeadflowError::downstream("email", format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // 429 and 5xx are worth retrying; other 4xx mean the request itself is wrong.
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                LeadflowError::downstream("email", format!("API error {status}: {body}"))
            } else {
                LeadflowError::Validation(format!("email API rejected message ({status}): {body}"))
            });
        }

        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        Ok(DeliveryReceipt {
            provider: "http".into(),
            message_id: body["id"].as_str().map(str::to_string),
            delivered_at: Utc::now(),
        })
    }
}

// ─── SMTP ──────────────────────────────────────

/// Sends rendered template files over SMTP (STARTTLS).
pub struct SmtpEmailSender {
    mailer: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
    from: String,
    templates: TemplateStore,
}

impl SmtpEmailSender {
    pub fn new(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        from: &str,
        templates: TemplateStore,
    ) -> Result<Self> {
        use lettre::transport::smtp::authentication::Credentials;

        let mailer = lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(host)
            .map_err(|e| LeadflowError::Config(format!("SMTP relay: {e}")))?
            .port(port)
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .build();
        Ok(Self {
            mailer,
            from: from.to_string(),
            templates,
        })
    }

    pub async fn build_message(&self, message: &EmailMessage) -> Result<lettre::Message> {
        build_message(&self.from, &self.templates, message).await
    }
}

async fn build_message(
    from: &str,
    templates: &TemplateStore,
    message: &EmailMessage,
) -> Result<lettre::Message> {
    use lettre::message::{Mailbox, header::ContentType};

    let rendered = templates
        .render(&message.template_id, &message.variables)
        .await?;
    let from: Mailbox = from
        .parse()
        .map_err(|e| LeadflowError::Config(format!("Invalid from: {e}")))?;
    let to: Mailbox = message
        .to
        .parse()
        .map_err(|e| LeadflowError::Validation(format!("Invalid to: {e}")))?;

    lettre::Message::builder()
        .from(from)
        .to(to)
        .subject(rendered.subject)
        .header(ContentType::TEXT_PLAIN)
        .body(rendered.body)
        .map_err(|e| LeadflowError::Validation(format!("Build email: {e}")))
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, message: &EmailMessage) -> Result<DeliveryReceipt> {
        use lettre::AsyncTransport;

        let email = self.build_message(message).await?;
        let resp = self
            .mailer
            .send(email)
            .await
            .map_err(|e| LeadflowError::downstream("email", format!("SMTP send: {e}")))?;

        tracing::debug!("📤 SMTP accepted {} for {}", message.template_id, message.to);
        Ok(DeliveryReceipt {
            provider: "smtp".into(),
            message_id: resp.message().next().map(str::to_string),
            delivered_at: Utc::now(),
        })
    }
}

// ─── Log only ──────────────────────────────────────

/// Dry-run sender: logs what would be sent.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &EmailMessage) -> Result<DeliveryReceipt> {
        tracing::info!(
            "📝 [dry run] {} → {} ({} variable(s))",
            message.template_id,
            message.to,
            message.variables.len()
        );
        Ok(DeliveryReceipt {
            provider: "log".into(),
            message_id: Some(format!("log-{}", uuid::Uuid::new_v4())),
            delivered_at: Utc::now(),
        })
    }
}
