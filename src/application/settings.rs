use crate::error::{BillingError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_API_VERSION: u32 = 3;

/// Tunables recognized at construction.
///
/// Loaded from JSON by the CLI; library users usually start from
/// [`BillingSettings::new`] and override fields.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BillingSettings {
    /// Package the purchases belong to.
    pub package_name: String,
    pub api_version: u32,
    /// Enables receipt signature verification.
    pub license_key: Option<String>,
    /// Enables the merchant-id legitimacy check.
    pub merchant_id: Option<String>,
    /// Freshness window of the purchase cache.
    pub cache_lifetime_ms: u64,
    /// Maximum wait for one bind attempt.
    pub connect_timeout_ms: u64,
    /// Extra bind attempts after a timeout. Rejections are never retried.
    pub connect_retries: u32,
    /// How long an unused connection stays bound.
    pub idle_timeout_ms: u64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            package_name: String::new(),
            api_version: DEFAULT_API_VERSION,
            license_key: None,
            merchant_id: None,
            cache_lifetime_ms: 30 * 60 * 1000,
            connect_timeout_ms: 10_000,
            connect_retries: 1,
            idle_timeout_ms: 10_000,
        }
    }
}

impl BillingSettings {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            ..Self::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&raw)?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.package_name.trim().is_empty() {
            return Err(BillingError::Config("package_name must be set".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(BillingError::Config(
                "connect_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn cache_lifetime(&self) -> Duration {
        Duration::from_millis(self.cache_lifetime_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// License key, ignoring blank values.
    pub fn license_key(&self) -> Option<&str> {
        self.license_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn merchant_id(&self) -> Option<&str> {
        self.merchant_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = BillingSettings::new("com.example.app");
        assert_eq!(settings.api_version, 3);
        assert_eq!(settings.cache_lifetime(), Duration::from_secs(1800));
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
        assert_eq!(settings.connect_retries, 1);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_blank_package_rejected() {
        let settings = BillingSettings::default();
        assert!(matches!(settings.validate(), Err(BillingError::Config(_))));
    }

    #[test]
    fn test_blank_license_key_ignored() {
        let mut settings = BillingSettings::new("pkg");
        settings.license_key = Some("  ".into());
        assert_eq!(settings.license_key(), None);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"package_name": "com.example.app", "merchant_id": "1234", "cache_lifetime_ms": 500}}"#
        )
        .unwrap();

        let settings = BillingSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.package_name, "com.example.app");
        assert_eq!(settings.merchant_id(), Some("1234"));
        assert_eq!(settings.cache_lifetime_ms, 500);
        assert_eq!(settings.connect_timeout_ms, 10_000);
    }
}
