//! Inbound signup payload and its validation into a `Lead`.
//!
//! Form tools are loose about types, so numeric fields accept JSON numbers or
//! numeric strings. Anything else is a validation error naming the field.

use lettre::Address;
use serde::Deserialize;
use serde_json::Value;

use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::types::{Lead, SystemCounts};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignupPayload {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub business_name: Option<String>,
    #[serde(default)]
    pub assessment_score: Option<Value>,
    #[serde(default)]
    pub red_systems: Option<Value>,
    #[serde(default)]
    pub orange_systems: Option<Value>,
    #[serde(default)]
    pub yellow_systems: Option<Value>,
    #[serde(default)]
    pub green_systems: Option<Value>,
    #[serde(default)]
    pub weakest_system_1: Option<String>,
    #[serde(default)]
    pub weakest_system_2: Option<String>,
    #[serde(default)]
    pub revenue_leak_total: Option<Value>,
}

impl SignupPayload {
    pub fn from_json(body: &str) -> Result<Self> {
        serde_json::from_str(body)
            .map_err(|_| LeadflowError::Validation("body is not a JSON object".into()))
    }

    /// Validate shape and ranges. Never touches classification.
    pub fn into_lead(self) -> Result<Lead> {
        let email = self
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| LeadflowError::Validation("email is required".into()))?;
        validate_address(email)?;

        let counts = SystemCounts {
            red: count_field("red_systems", &self.red_systems)?,
            orange: count_field("orange_systems", &self.orange_systems)?,
            yellow: count_field("yellow_systems", &self.yellow_systems)?,
            green: count_field("green_systems", &self.green_systems)?,
        };

        let assessment_score = match &self.assessment_score {
            None | Some(Value::Null) => 0,
            Some(v) => {
                let score = number(v).ok_or_else(|| {
                    LeadflowError::Validation("assessment_score must be a number".into())
                })?;
                if !(0.0..=100.0).contains(&score) {
                    return Err(LeadflowError::Validation(
                        "assessment_score must be between 0 and 100".into(),
                    ));
                }
                score.round() as u8
            }
        };

        let revenue_leak_total = match &self.revenue_leak_total {
            None | Some(Value::Null) => None,
            Some(v) => Some(number(v).ok_or_else(|| {
                LeadflowError::Validation("revenue_leak_total must be a number".into())
            })?),
        };

        let weakest_systems = [self.weakest_system_1, self.weakest_system_2]
            .into_iter()
            .flatten()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Lead {
            email: email.to_string(),
            first_name: self.first_name.unwrap_or_default().trim().to_string(),
            business_name: self.business_name.unwrap_or_default().trim().to_string(),
            assessment_score,
            counts,
            weakest_systems,
            revenue_leak_total,
        })
    }
}

/// The address must parse the same way the SMTP sender will parse it, and
/// name a dotted domain.
fn validate_address(email: &str) -> Result<Address> {
    let address: Address = email
        .parse()
        .map_err(|_| LeadflowError::Validation("email is not a valid address".into()))?;
    let domain = address.domain();
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(LeadflowError::Validation("email is not a valid address".into()));
    }
    Ok(address)
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace([',', '$'], "").parse().ok(),
        _ => None,
    }
}

/// Required non-negative whole count.
fn count_field(name: &str, value: &Option<Value>) -> Result<u32> {
    let v = match value {
        None | Some(Value::Null) => {
            return Err(LeadflowError::Validation(format!("{name} is required")));
        }
        Some(v) => v,
    };
    let n = number(v)
        .ok_or_else(|| LeadflowError::Validation(format!("{name} must be a number")))?;
    if n < 0.0 {
        return Err(LeadflowError::Validation(format!("{name} must not be negative")));
    }
    if n.fract() != 0.0 || n > u32::MAX as f64 {
        return Err(LeadflowError::Validation(format!("{name} must be a whole number")));
    }
    Ok(n as u32)
}
