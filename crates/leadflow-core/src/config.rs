//! Leadflow configuration system.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LeadflowError, Result};
use crate::retry::RetryPolicy;
use crate::types::{SEQUENCE_LENGTH, Segment};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadflowConfig {
    /// Campaign name echoed back in intake responses.
    #[serde(default = "default_campaign")]
    pub campaign: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Backoff for collaborator calls made during intake.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

fn default_campaign() -> String { "assessment-nurture".into() }

impl Default for LeadflowConfig {
    fn default() -> Self {
        Self {
            campaign: default_campaign(),
            gateway: GatewayConfig::default(),
            sequence: SequenceConfig::default(),
            classifier: ClassifierConfig::default(),
            templates: TemplatesConfig::default(),
            engine: EngineConfig::default(),
            retry: RetryPolicy::default(),
            email: EmailConfig::default(),
            alert: AlertConfig::default(),
            storage: StorageConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

impl LeadflowConfig {
    /// Load config from the default path (~/.leadflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LeadflowError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| LeadflowError::Config(format!("Failed to parse config: {e}")))
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Leadflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".leadflow")
    }

    /// Check the invariants that must hold before the server accepts traffic.
    /// Template totality is checked when the template router is built.
    pub fn validate(&self) -> Result<()> {
        if self.campaign.trim().is_empty() {
            return Err(LeadflowError::Config("campaign must not be empty".into()));
        }
        self.classifier.validate()?;
        self.sequence.scaled_offsets()?;
        if self.engine.tick_secs == 0 {
            return Err(LeadflowError::Config("engine.tick_secs must be >= 1".into()));
        }
        if self.engine.max_attempts == 0 {
            return Err(LeadflowError::Config("engine.max_attempts must be >= 1".into()));
        }
        match self.email.provider.as_str() {
            "http" | "smtp" | "log" => {}
            other => {
                return Err(LeadflowError::Config(format!(
                    "email.provider must be http, smtp or log (got '{other}')"
                )));
            }
        }
        for target in &self.alert.targets {
            if !matches!(target.as_str(), "slack" | "discord" | "telegram" | "webhook") {
                return Err(LeadflowError::Config(format!("Unknown alert target '{target}'")));
            }
        }
        Ok(())
    }
}

/// Expand `~` and env vars in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins; empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 8787 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// Follow-up sequence timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Offset of each step from intake time, in seconds. Must strictly increase.
    #[serde(default = "default_offsets_secs")]
    pub offsets_secs: Vec<u64>,
    /// Compress the whole sequence for non-production testing.
    #[serde(default)]
    pub fast_mode: bool,
    /// Fast mode divides every offset by this factor (1440: a day becomes a minute).
    #[serde(default = "default_fast_mode_divisor")]
    pub fast_mode_divisor: u32,
}

const HOUR: u64 = 3600;

fn default_offsets_secs() -> Vec<u64> {
    vec![0, 24 * HOUR, 72 * HOUR, 120 * HOUR, 168 * HOUR, 240 * HOUR, 336 * HOUR]
}
fn default_fast_mode_divisor() -> u32 { 1440 }

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            offsets_secs: default_offsets_secs(),
            fast_mode: false,
            fast_mode_divisor: default_fast_mode_divisor(),
        }
    }
}

impl SequenceConfig {
    /// Effective per-step offsets, with fast mode applied. Fails unless there is
    /// exactly one offset per step and they strictly increase after scaling.
    pub fn scaled_offsets(&self) -> Result<Vec<Duration>> {
        if self.offsets_secs.len() != SEQUENCE_LENGTH as usize {
            return Err(LeadflowError::Config(format!(
                "sequence.offsets_secs needs {SEQUENCE_LENGTH} entries, got {}",
                self.offsets_secs.len()
            )));
        }
        if self.fast_mode_divisor == 0 {
            return Err(LeadflowError::Config("sequence.fast_mode_divisor must be >= 1".into()));
        }
        let divisor = if self.fast_mode { self.fast_mode_divisor as i64 } else { 1 };
        let offsets: Vec<Duration> = self
            .offsets_secs
            .iter()
            .map(|s| Duration::milliseconds((*s as i64).saturating_mul(1000) / divisor))
            .collect();
        for (i, pair) in offsets.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(LeadflowError::Config(format!(
                    "sequence offsets must strictly increase (step {} -> {})",
                    i + 1,
                    i + 2
                )));
            }
        }
        Ok(offsets)
    }
}

/// Segment thresholds on system-health counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Oranges that make a lead urgent on their own.
    #[serde(default = "default_orange_alone")]
    pub orange_alone: u32,
    /// Oranges that make a lead urgent when paired with enough yellows.
    #[serde(default = "default_orange_paired")]
    pub orange_paired: u32,
    #[serde(default = "default_paired_yellow")]
    pub paired_yellow: u32,
}

fn default_orange_alone() -> u32 { 2 }
fn default_orange_paired() -> u32 { 1 }
fn default_paired_yellow() -> u32 { 2 }

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            orange_alone: default_orange_alone(),
            orange_paired: default_orange_paired(),
            paired_yellow: default_paired_yellow(),
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.orange_alone == 0 || self.orange_paired == 0 {
            return Err(LeadflowError::Config("classifier orange thresholds must be >= 1".into()));
        }
        if self.orange_paired > self.orange_alone {
            return Err(LeadflowError::Config(
                "classifier.orange_paired must not exceed classifier.orange_alone".into(),
            ));
        }
        Ok(())
    }
}

/// Template table: one default per step plus per-segment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesConfig {
    /// Universal template for step 1..N, in order.
    #[serde(default = "default_step_templates")]
    pub defaults: Vec<String>,
    #[serde(default = "default_overrides")]
    pub overrides: Vec<TemplateOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateOverride {
    pub segment: Segment,
    pub step: u8,
    pub template: String,
}

fn default_step_templates() -> Vec<String> {
    [
        "seq-1-assessment-results",
        "seq-2-segment-followup",
        "seq-3-case-study",
        "seq-4-quick-wins",
        "seq-5-revenue-leak-math",
        "seq-6-objections",
        "seq-7-last-call",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_overrides() -> Vec<TemplateOverride> {
    let o = |segment, step, template: &str| TemplateOverride {
        segment,
        step,
        template: template.to_string(),
    };
    vec![
        o(Segment::Critical, 1, "seq-1-critical-results"),
        o(Segment::Urgent, 1, "seq-1-urgent-results"),
        o(Segment::Optimize, 1, "seq-1-optimize-results"),
        o(Segment::Critical, 2, "seq-2-critical-fix-now"),
        o(Segment::Urgent, 2, "seq-2-urgent-before-it-breaks"),
        o(Segment::Optimize, 2, "seq-2-optimize-next-level"),
    ]
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            defaults: default_step_templates(),
            overrides: default_overrides(),
        }
    }
}

/// Delivery engine loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Maximum due tasks claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Delivery attempts per task before it is marked failed.
    #[serde(default = "default_engine_attempts")]
    pub max_attempts: u32,
    /// First re-queue delay after a failed delivery; doubles per attempt.
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
}

fn default_tick_secs() -> u64 { 5 }
fn default_batch_size() -> u32 { 50 }
fn default_engine_attempts() -> u32 { 5 }
fn default_retry_base_secs() -> u64 { 60 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            batch_size: default_batch_size(),
            max_attempts: default_engine_attempts(),
            retry_base_secs: default_retry_base_secs(),
        }
    }
}

/// Email collaborator selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// `http` (email API), `smtp`, or `log` (dry run).
    #[serde(default = "default_email_provider")]
    pub provider: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    /// Directory of `<template_id>.txt` files used by the SMTP sender.
    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,
}

fn default_email_provider() -> String { "log".into() }
fn default_api_url() -> String { "https://api.resend.com/emails".into() }
fn default_from_address() -> String { "hello@example.com".into() }
fn default_smtp_host() -> String { "smtp.gmail.com".into() }
fn default_smtp_port() -> u16 { 587 }
fn default_templates_dir() -> String { "~/.leadflow/templates".into() }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: default_email_provider(),
            api_url: default_api_url(),
            from_address: default_from_address(),
            from_name: None,
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            templates_dir: default_templates_dir(),
        }
    }
}

/// Alert targets. URLs and tokens come from secrets, not from this file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Any of `slack`, `discord`, `telegram`, `webhook`.
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.leadflow/leadflow.db".into() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Optional JSON secrets file, consulted before the environment.
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
}

fn default_env_prefix() -> String { "LEADFLOW_".into() }

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            file: None,
            env_prefix: default_env_prefix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = LeadflowConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.templates.defaults.len(), SEQUENCE_LENGTH as usize);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg = LeadflowConfig::from_toml(
            r#"
            campaign = "spring-audit"
            [gateway]
            port = 9000
            [sequence]
            fast_mode = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.campaign, "spring-audit");
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.gateway.host, "127.0.0.1");
        assert!(cfg.sequence.fast_mode);
        assert_eq!(cfg.email.provider, "log");
    }

    #[test]
    fn test_fast_mode_scales_offsets() {
        let mut seq = SequenceConfig::default();
        let real = seq.scaled_offsets().unwrap();
        assert_eq!(real[1], Duration::hours(24));

        seq.fast_mode = true;
        let fast = seq.scaled_offsets().unwrap();
        assert_eq!(fast[0], Duration::zero());
        assert_eq!(fast[1], Duration::minutes(1));
        assert_eq!(fast[6], Duration::minutes(14));
    }

    #[test]
    fn test_offsets_must_strictly_increase() {
        let seq = SequenceConfig {
            offsets_secs: vec![0, 60, 60, 120, 180, 240, 300],
            ..Default::default()
        };
        assert!(matches!(seq.scaled_offsets(), Err(LeadflowError::Config(_))));

        let short = SequenceConfig {
            offsets_secs: vec![0, 60],
            ..Default::default()
        };
        assert!(short.scaled_offsets().is_err());
    }

    #[test]
    fn test_fast_mode_collapse_is_rejected() {
        // 1s apart becomes 0ms apart once divided by a huge factor.
        let seq = SequenceConfig {
            offsets_secs: vec![0, 1, 2, 3, 4, 5, 6],
            fast_mode: true,
            fast_mode_divisor: 10_000,
        };
        assert!(seq.scaled_offsets().is_err());
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let mut cfg = LeadflowConfig::default();
        cfg.email.provider = "carrier-pigeon".into();
        assert!(cfg.validate().is_err());

        let mut cfg = LeadflowConfig::default();
        cfg.classifier.orange_paired = 3;
        assert!(cfg.validate().is_err());

        let mut cfg = LeadflowConfig::default();
        cfg.alert.targets = vec!["pager".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_template_overrides_parse() {
        let cfg = LeadflowConfig::from_toml(
            r#"
            [[templates.overrides]]
            segment = "critical"
            step = 3
            template = "seq-3-critical-case"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.templates.overrides.len(), 1);
        assert_eq!(cfg.templates.overrides[0].segment, Segment::Critical);
        assert_eq!(cfg.templates.defaults.len(), 7);
    }
}
