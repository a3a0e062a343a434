use serde::Deserialize;
use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, File, Environment};
use crate::vapid;
use log::{debug, error, warn};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Production,
    Development,
    Testing,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub env: RunMode,
    pub hostname: String,
    pub push_port: u16,
    pub cms_port: u16,
    pub db_path: String,
    pub db_map_size: usize,

    #[serde(default)]
    pub vapid_public_key: String,
    #[serde(default)]
    pub vapid_private_key: String,
    pub vapid_subject: String,

    /// String prefix a bot's source address must start with. Empty rejects every bot.
    #[serde(default)]
    pub allowed_bot_ips: String,
    pub require_bot_jwt: bool,
    #[serde(default)]
    pub bot_jwt_secret: String,
    pub jwt_secret: String,
    #[serde(default)]
    pub jwt_api_key: String,

    pub secret_key: String,
    pub session_ttl_secs: u64,
    #[serde(default)]
    pub supabase_url: String,
    #[serde(default)]
    pub supabase_key: String,
    pub backend_timeout_secs: u64,
    #[serde(default)]
    pub public_base_url: String,
}


fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("env", "development")?
        .set_default("hostname", "0.0.0.0")?
        .set_default("push_port", 3000)?
        .set_default("cms_port", 5000)?
        .set_default("db_path", "db")?
        .set_default("db_map_size", 64 * 1024 * 1024)?
        .set_default("vapid_public_key", "")?
        .set_default("vapid_private_key", "")?
        .set_default("vapid_subject", "mailto:admin@example.com")?
        .set_default("allowed_bot_ips", "")?
        .set_default("require_bot_jwt", false)?
        .set_default("bot_jwt_secret", "")?
        .set_default("jwt_secret", "dummy-secret")?
        .set_default("jwt_api_key", "")?
        .set_default("secret_key", "dev-secret-key")?
        .set_default("session_ttl_secs", 7 * 24 * 60 * 60)?
        .set_default("supabase_url", "")?
        .set_default("supabase_key", "")?
        .set_default("backend_timeout_secs", 10)?
        .set_default("public_base_url", "")
}

impl Settings {
    pub fn is_production(&self) -> bool {
        self.env == RunMode::Production
    }

    pub fn new() -> Result<Self, ConfigError> {
        let s = defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("PCS"));

        let mut settings: Settings = s.build()?.try_deserialize()?;

        if !settings.is_production() {
            warn!("Running in {:?} mode, make sure this is intentional", settings.env);
        }

        if settings.vapid_private_key.is_empty() {
            let (private_key, public_key) = vapid::ensure_vapid_keys()
                .map_err(|e| {
                    error!("Failed to load VAPID keys: {}", e);
                    ConfigError::Message(e.to_string())
                })?;
            settings.vapid_private_key = private_key;
            settings.vapid_public_key = public_key;
        }
        debug!("Loaded VAPID public key: {}", settings.vapid_public_key);

        Ok(settings)
    }

    /// Defaults plus explicit overrides, without touching config files, the
    /// environment or the VAPID key files.
    pub fn with_overrides(overrides: &[(&str, &str)]) -> Result<Self, ConfigError> {
        let mut s = defaults()?;
        for (key, value) in overrides {
            s = s.set_override(*key, *value)?;
        }
        s.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let settings = Settings::with_overrides(&[]).unwrap();
        assert_eq!(settings.env, RunMode::Development);
        assert_eq!(settings.push_port, 3000);
        assert_eq!(settings.hostname, "0.0.0.0");
        assert_eq!(settings.db_path, "db");
        assert!(settings.allowed_bot_ips.is_empty());
        assert!(!settings.require_bot_jwt);
    }

    #[test]
    fn overrides_are_typed() {
        let settings = Settings::with_overrides(&[
            ("env", "production"),
            ("push_port", "4000"),
            ("require_bot_jwt", "true"),
        ]).unwrap();
        assert!(settings.is_production());
        assert_eq!(settings.push_port, 4000);
        assert!(settings.require_bot_jwt);
    }

    #[test]
    fn unknown_run_mode_is_rejected() {
        assert!(Settings::with_overrides(&[("env", "staging")]).is_err());
    }
}
