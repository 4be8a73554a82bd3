//! Secret sources.
//!
//! Credentials (email API key, SMTP password, alert webhook URLs, the inbound
//! webhook secret) never live in `config.toml`. They come from a JSON secrets
//! file, the environment, or both with the file taking precedence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use leadflow_core::config::{SecretsConfig, expand_path};
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::SecretSource;

/// Environment variables, snapshotted at construction. `NAME` is looked up
/// as `<prefix>NAME` first, then bare `NAME`.
pub struct EnvSecrets {
    prefix: String,
    vars: HashMap<String, String>,
}

impl EnvSecrets {
    pub fn new(prefix: &str) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    pub fn from_vars(prefix: &str, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            prefix: prefix.to_string(),
            vars: vars.into_iter().collect(),
        }
    }
}

impl SecretSource for EnvSecrets {
    fn lookup(&self, name: &str) -> Option<String> {
        self.vars
            .get(&format!("{}{name}", self.prefix))
            .or_else(|| self.vars.get(name))
            .cloned()
    }
}

/// Flat JSON object of `{"NAME": "value"}` on disk.
pub struct FileSecrets {
    secrets: HashMap<String, String>,
    path: PathBuf,
}

impl FileSecrets {
    /// Load from a path. A missing file is an empty store.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut store = Self {
            secrets: HashMap::new(),
            path: path.to_path_buf(),
        };
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            store.secrets = serde_json::from_str(&content)
                .map_err(|e| LeadflowError::Security(format!("Failed to parse secrets: {e}")))?;
            tracing::debug!("Loaded {} secrets from {}", store.secrets.len(), path.display());
        }
        Ok(store)
    }

    /// Save with owner-only permissions on Unix.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.secrets)?;

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)?;
            file.write_all(json.as_bytes())?;
            Ok(())
        }

        #[cfg(not(unix))]
        {
            std::fs::write(&self.path, json)?;
            Ok(())
        }
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.secrets.insert(name.to_string(), value.to_string());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.secrets.remove(name)
    }

    /// Secret names, never values.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.secrets.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        keys
    }
}

impl SecretSource for FileSecrets {
    fn lookup(&self, name: &str) -> Option<String> {
        self.secrets.get(name).cloned()
    }
}

/// First source with a non-blank value wins.
pub struct LayeredSecrets {
    layers: Vec<Box<dyn SecretSource>>,
}

impl LayeredSecrets {
    pub fn new(layers: Vec<Box<dyn SecretSource>>) -> Self {
        Self { layers }
    }
}

impl SecretSource for LayeredSecrets {
    fn lookup(&self, name: &str) -> Option<String> {
        self.layers
            .iter()
            .filter_map(|l| l.lookup(name))
            .find(|v| !v.trim().is_empty())
    }
}

/// `[secrets]` → file (if configured) layered over the environment.
pub fn secrets_from_config(config: &SecretsConfig) -> Result<LayeredSecrets> {
    let mut layers: Vec<Box<dyn SecretSource>> = Vec::new();
    if let Some(file) = &config.file {
        let path = expand_path(file);
        let store = FileSecrets::load_from(&path)?;
        tracing::info!("🔐 Secrets file: {} ({} keys)", path.display(), store.keys().len());
        layers.push(Box::new(store));
    }
    layers.push(Box::new(EnvSecrets::new(&config.env_prefix)));
    Ok(LayeredSecrets::new(layers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvSecrets {
        EnvSecrets::from_vars(
            "LEADFLOW_",
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    #[test]
    fn test_env_prefers_prefixed_name() {
        let secrets = env(&[
            ("LEADFLOW_EMAIL_API_KEY", "prefixed"),
            ("EMAIL_API_KEY", "bare"),
            ("WEBHOOK_SECRET", "shh"),
        ]);
        assert_eq!(secrets.get("EMAIL_API_KEY").unwrap(), "prefixed");
        assert_eq!(secrets.get("WEBHOOK_SECRET").unwrap(), "shh");
        assert!(matches!(secrets.get("SMTP_PASSWORD"), Err(LeadflowError::MissingSecret(_))));
    }

    #[test]
    fn test_file_secrets_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("secrets.json");

        let mut store = FileSecrets::load_from(&path).unwrap();
        assert!(store.keys().is_empty());
        store.set("SLACK_WEBHOOK_URL", "https://hooks.slack.com/x");
        store.set("SMTP_PASSWORD", "pw");
        store.save().unwrap();

        let mut reloaded = FileSecrets::load_from(&path).unwrap();
        assert_eq!(reloaded.keys(), vec!["SLACK_WEBHOOK_URL", "SMTP_PASSWORD"]);
        assert_eq!(reloaded.lookup("SMTP_PASSWORD").as_deref(), Some("pw"));
        assert_eq!(reloaded.remove("SMTP_PASSWORD").as_deref(), Some("pw"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_malformed_file_is_security_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(FileSecrets::load_from(&path), Err(LeadflowError::Security(_))));
    }

    #[test]
    fn test_layered_file_wins_and_blank_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, r#"{"EMAIL_API_KEY": "from-file", "SMTP_PASSWORD": " "}"#).unwrap();

        let layered = LayeredSecrets::new(vec![
            Box::new(FileSecrets::load_from(&path).unwrap()),
            Box::new(env(&[("EMAIL_API_KEY", "from-env"), ("SMTP_PASSWORD", "env-pw")])),
        ]);
        assert_eq!(layered.get("EMAIL_API_KEY").unwrap(), "from-file");
        assert_eq!(layered.get("SMTP_PASSWORD").unwrap(), "env-pw");
        assert!(layered.lookup("NOPE").is_none());
    }
}
