use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

use roam_api::state::ServiceSettings;
use roam_api::storage::RetryPolicy;
use roam_types::models::Role;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub blob_dir: PathBuf,
    pub jwt_secret: String,
    pub share_default_role: Role,
    pub storage_timeout: Duration,
    pub storage_retries: u32,
    pub db_timeout: Duration,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = get("ROAM_JWT_SECRET").unwrap_or_default();
        if jwt_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("ROAM_JWT_SECRET is unset or still a placeholder; it must match the identity provider's signing secret");
        }

        let share_default_role = match get("ROAM_SHARE_DEFAULT_ROLE") {
            Some(raw) => {
                let role: Role = raw
                    .parse()
                    .map_err(|_| anyhow::anyhow!("ROAM_SHARE_DEFAULT_ROLE: unknown role {raw:?}"))?;
                if role.is_owner() {
                    bail!("ROAM_SHARE_DEFAULT_ROLE cannot be owner");
                }
                role
            }
            None => Role::Collaborator,
        };

        Ok(Self {
            host: get("ROAM_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "ROAM_PORT", 3000)?,
            db_path: get("ROAM_DB_PATH").unwrap_or_else(|| "roam.db".into()).into(),
            blob_dir: get("ROAM_BLOB_DIR").unwrap_or_else(|| "./blobs".into()).into(),
            jwt_secret,
            share_default_role,
            storage_timeout: Duration::from_millis(parse_or(&get, "ROAM_STORAGE_TIMEOUT_MS", 5000)?),
            storage_retries: parse_or(&get, "ROAM_STORAGE_RETRIES", 3)?,
            db_timeout: Duration::from_millis(parse_or(&get, "ROAM_DB_TIMEOUT_MS", 5000)?),
        })
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            db_timeout: self.db_timeout,
            storage_retry: RetryPolicy {
                timeout: self.storage_timeout,
                retries: self.storage_retries,
                ..RetryPolicy::default()
            },
            share_default_role: self.share_default_role,
        }
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("{key}: invalid value {raw:?}")),
        None => Ok(default),
    }
}
