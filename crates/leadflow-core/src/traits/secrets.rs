//! Secrets capability. Credentials are resolved once at startup.

use crate::error::{LeadflowError, Result};

pub trait SecretSource: Send + Sync {
    /// Look up a secret; `None` when it is not set.
    fn lookup(&self, name: &str) -> Option<String>;

    /// Required secret. Absence is a startup-time fatal error.
    fn get(&self, name: &str) -> Result<String> {
        match self.lookup(name) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(LeadflowError::MissingSecret(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Fixed(HashMap<&'static str, &'static str>);

    impl SecretSource for Fixed {
        fn lookup(&self, name: &str) -> Option<String> {
            self.0.get(name).map(|v| v.to_string())
        }
    }

    #[test]
    fn test_get_fails_on_missing_or_blank() {
        let src = Fixed(HashMap::from([("EMAIL_API_KEY", "re_123"), ("BLANK", "  ")]));
        assert_eq!(src.get("EMAIL_API_KEY").unwrap(), "re_123");
        assert!(matches!(src.get("BLANK"), Err(LeadflowError::MissingSecret(_))));
        assert!(matches!(src.get("NOPE"), Err(LeadflowError::MissingSecret(n)) if n == "NOPE"));
    }
}
