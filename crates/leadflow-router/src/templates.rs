//! Template routing: (segment, step) → template id, plus the alert gate.
//!
//! Lookup order is segment override first, then the universal default for the
//! step. The table is checked once at construction, so every valid
//! (segment, step) pair resolves to a non-empty id at request time.

use std::collections::HashMap;

use leadflow_core::config::TemplatesConfig;
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::types::{SEQUENCE_LENGTH, Segment};

#[derive(Debug, Clone)]
pub struct TemplateRouter {
    defaults: Vec<String>,
    overrides: HashMap<(Segment, u8), String>,
}

impl TemplateRouter {
    /// Build the router, failing on a missing or empty template for any step.
    pub fn from_config(config: &TemplatesConfig) -> Result<Self> {
        if config.defaults.len() != SEQUENCE_LENGTH as usize {
            return Err(LeadflowError::Config(format!(
                "templates.defaults needs {SEQUENCE_LENGTH} entries, got {}",
                config.defaults.len()
            )));
        }
        if let Some(idx) = config.defaults.iter().position(|t| t.trim().is_empty()) {
            return Err(LeadflowError::Config(format!(
                "templates.defaults has an empty template for step {}",
                idx + 1
            )));
        }

        let mut overrides = HashMap::new();
        for o in &config.overrides {
            if o.step == 0 || o.step > SEQUENCE_LENGTH {
                return Err(LeadflowError::Config(format!(
                    "template override for {} targets step {} outside 1..={SEQUENCE_LENGTH}",
                    o.segment, o.step
                )));
            }
            if o.template.trim().is_empty() {
                return Err(LeadflowError::Config(format!(
                    "template override for {} step {} is empty",
                    o.segment, o.step
                )));
            }
            if overrides
                .insert((o.segment, o.step), o.template.trim().to_string())
                .is_some()
            {
                return Err(LeadflowError::Config(format!(
                    "duplicate template override for {} step {}",
                    o.segment, o.step
                )));
            }
        }

        Ok(Self {
            defaults: config.defaults.iter().map(|t| t.trim().to_string()).collect(),
            overrides,
        })
    }

    pub fn steps(&self) -> u8 {
        self.defaults.len() as u8
    }

    /// Template for `step` (1-based). `None` only when `step` is out of range.
    pub fn resolve_template(&self, segment: Segment, step: u8) -> Option<&str> {
        if step == 0 || step > self.steps() {
            return None;
        }
        self.overrides
            .get(&(segment, step))
            .or_else(|| self.defaults.get(step as usize - 1))
            .map(|s| s.as_str())
    }

    /// Whether a lead in `segment` triggers an out-of-band alert.
    pub fn should_alert(&self, segment: Segment) -> bool {
        segment.is_most_severe()
    }

    /// The full template sequence for a segment, in step order.
    pub fn sequence_for(&self, segment: Segment) -> Vec<(u8, &str)> {
        (1..=self.steps())
            .filter_map(|step| self.resolve_template(segment, step).map(|t| (step, t)))
            .collect()
    }
}

impl Default for TemplateRouter {
    fn default() -> Self {
        Self::from_config(&TemplatesConfig::default())
            .unwrap_or_else(|e| unreachable!("built-in template table is invalid: {e}"))
    }
}
