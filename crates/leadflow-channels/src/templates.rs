//! File-based email templates with `{{var}}` substitution.
//!
//! A template lives at `<dir>/<template_id>.txt`. If its first line starts
//! with `Subject:` that line is the subject and the rest (after one optional
//! blank line) is the body; otherwise the template id doubles as the subject.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use leadflow_core::error::{LeadflowError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Template ids are file stems; anything that could escape the directory
    /// is rejected.
    fn path_for(&self, template_id: &str) -> Result<PathBuf> {
        let safe = !template_id.is_empty()
            && template_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(LeadflowError::Config(format!(
                "Invalid template id '{template_id}'"
            )));
        }
        Ok(self.dir.join(format!("{template_id}.txt")))
    }

    pub fn exists(&self, template_id: &str) -> bool {
        self.path_for(template_id).is_ok_and(|p| p.is_file())
    }

    /// Ids from `required` with no file on disk.
    pub fn missing<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        required
            .into_iter()
            .filter(|id| !self.exists(id))
            .map(str::to_string)
            .collect()
    }

    /// Load and render a template.
    pub async fn render(
        &self,
        template_id: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<RenderedEmail> {
        let path = self.path_for(template_id)?;
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            LeadflowError::Config(format!(
                "Template '{template_id}' unreadable at {}: {e}",
                path.display()
            ))
        })?;
        Ok(split_subject(template_id, &render(&raw, vars)))
    }
}

fn split_subject(template_id: &str, text: &str) -> RenderedEmail {
    let mut lines = text.splitn(2, '\n');
    let first = lines.next().unwrap_or_default();
    match first.strip_prefix("Subject:") {
        Some(subject) => {
            let rest = lines.next().unwrap_or_default();
            let body = rest
                .strip_prefix("\r\n")
                .or_else(|| rest.strip_prefix('\n'))
                .unwrap_or(rest);
            RenderedEmail {
                subject: subject.trim().to_string(),
                body: body.to_string(),
            }
        }
        None => RenderedEmail {
            subject: template_id.to_string(),
            body: text.to_string(),
        },
    }
}

/// Replace `{{ name }}` placeholders. Unknown names render as empty.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match vars.get(name) {
                    Some(v) => out.push_str(v),
                    None => tracing::debug!("Template variable '{name}' not provided"),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
