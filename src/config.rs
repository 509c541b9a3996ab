use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub database_url: String,
    pub operator_username: String,
    pub operator_private_key_path: PathBuf,
    pub operator_public_key_path: PathBuf,
    pub max_concurrent_jobs: usize,
    pub poll_interval_ms: u64,
    pub defer_delay_seconds: u64,
    pub lock_lease_seconds: u64,
    pub ssh_connect_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
    pub deploy_timeout_seconds: u64,
    pub credential_key_bits: usize,
    pub event_retention_days: u32,
}

impl PanelConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("PANEL_DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("PANEL_DATABASE_URL must be set for the panel runtime")?;
        let database_url = normalize_database_url(database_url);

        let operator_username = env_string("PANEL_OPERATOR_USERNAME", "root");
        let operator_private_key_path =
            env_path("PANEL_OPERATOR_KEY_PATH", "/etc/panel/keys/operator")?;
        let pub_default = format!("{}.pub", operator_private_key_path.to_string_lossy());
        let operator_public_key_path = env_path("PANEL_OPERATOR_PUBKEY_PATH", &pub_default)?;

        let max_concurrent_jobs = env_u64("PANEL_MAX_CONCURRENT_JOBS", 4).clamp(1, 32) as usize;
        let poll_interval_ms = env_u64("PANEL_POLL_INTERVAL_MS", 500).clamp(50, 10_000);
        let defer_delay_seconds = env_u64("PANEL_DEFER_DELAY_SECONDS", 15).clamp(1, 300);
        let lock_lease_seconds = env_u64("PANEL_LOCK_LEASE_SECONDS", 900).clamp(60, 3600);
        let ssh_connect_timeout_seconds =
            env_u64("PANEL_SSH_CONNECT_TIMEOUT_SECONDS", 20).clamp(5, 120);
        let command_timeout_seconds = env_u64("PANEL_COMMAND_TIMEOUT_SECONDS", 120).clamp(10, 1800);
        let deploy_timeout_seconds = env_u64("PANEL_DEPLOY_TIMEOUT_SECONDS", 300).clamp(30, 1800);
        let credential_key_bits =
            env_u64("PANEL_CREDENTIAL_KEY_BITS", 4096).clamp(1024, 8192) as usize;
        let event_retention_days = env_u32("PANEL_EVENT_RETENTION_DAYS", 90).max(1);

        let config = Self {
            database_url,
            operator_username,
            operator_private_key_path,
            operator_public_key_path,
            max_concurrent_jobs,
            poll_interval_ms,
            defer_delay_seconds,
            lock_lease_seconds,
            ssh_connect_timeout_seconds,
            command_timeout_seconds,
            deploy_timeout_seconds,
            credential_key_bits,
            event_retention_days,
        };
        config.validate_key_paths()?;

        Ok(config)
    }

    fn validate_key_paths(&self) -> Result<()> {
        validate_key_path(&self.operator_private_key_path, "PANEL_OPERATOR_KEY_PATH")?;
        validate_key_path(&self.operator_public_key_path, "PANEL_OPERATOR_PUBKEY_PATH")?;
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).unwrap_or_else(|| default.to_string());
    let path = PathBuf::from(value);
    if path.as_os_str().is_empty() {
        anyhow::bail!("{key} resolved to an empty path");
    }
    Ok(path)
}

fn validate_key_path(path: &Path, label: &str) -> Result<()> {
    if !path.is_absolute() {
        anyhow::bail!("{label} must be an absolute path");
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            anyhow::bail!("{label} must not contain '..' segments");
        }
    }
    Ok(())
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_or_parent_key_paths() {
        assert!(validate_key_path(Path::new("relative/operator"), "TEST").is_err());
        assert!(validate_key_path(Path::new("/etc/panel/../operator"), "TEST").is_err());
        assert!(validate_key_path(Path::new("/etc/panel/keys/operator"), "TEST").is_ok());
    }

    #[test]
    fn normalizes_sqlalchemy_style_urls() {
        assert_eq!(
            normalize_database_url("postgresql+psycopg://u@h/db".to_string()),
            "postgresql://u@h/db"
        );
        assert_eq!(
            normalize_database_url("postgresql+asyncpg://u@h/db".to_string()),
            "postgresql://u@h/db"
        );
        assert_eq!(
            normalize_database_url("postgres://u@h/db".to_string()),
            "postgres://u@h/db"
        );
    }

    #[test]
    fn env_helpers_fall_back_to_defaults() {
        assert_eq!(env_u64("PANEL_TEST_UNSET_U64", 42), 42);
        assert_eq!(env_u32("PANEL_TEST_UNSET_U32", 7), 7);
        assert_eq!(env_string("PANEL_TEST_UNSET_STRING", "fallback"), "fallback");
        assert!(env_optional_string("PANEL_TEST_UNSET_OPTIONAL").is_none());
    }
}
