use std::time::Duration;

use anyhow::{bail, Context};

use crate::{
    auth::password::HashCost,
    storage::container::{ContainerOptions, DEFAULT_CONTAINER_NAME},
};

const MAX_TOKEN_TTL_MINUTES: i64 = 60 * 24 * 366;

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Memory,
    Local {
        root: String,
    },
    S3 {
        endpoint: String,
        bucket: String,
        access_key: String,
        secret_key: String,
        region: String,
    },
    Drive {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub container: ContainerOptions,
    pub op_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: Option<String>,
    pub jwt: JwtConfig,
    pub password: HashCost,
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| get(key).with_context(|| format!("{key} must be set"));
        let parse = |key: &str, default: i64| -> anyhow::Result<i64> {
            match get(key) {
                Some(v) => v
                    .trim()
                    .parse::<i64>()
                    .with_context(|| format!("{key} must be an integer, got {v:?}")),
                None => Ok(default),
            }
        };
        let flag = |key: &str| {
            get(key)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };

        let jwt = JwtConfig {
            secret: require("JWT_SECRET")?,
            issuer: get("JWT_ISSUER").unwrap_or_else(|| "ledgerbook".into()),
            audience: get("JWT_AUDIENCE").unwrap_or_else(|| "ledgerbook-users".into()),
            ttl_minutes: parse("JWT_TTL_MINUTES", 60 * 24 * 7)?,
        };
        if jwt.ttl_minutes <= 0 {
            bail!("JWT_TTL_MINUTES must be positive");
        }
        if jwt.ttl_minutes > MAX_TOKEN_TTL_MINUTES {
            bail!("JWT_TTL_MINUTES must be at most {MAX_TOKEN_TTL_MINUTES} (one year)");
        }

        let defaults = HashCost::default();
        let password = HashCost {
            time_cost: parse("PASSWORD_HASH_TIME_COST", defaults.time_cost as i64)?
                .try_into()
                .context("PASSWORD_HASH_TIME_COST out of range")?,
            memory_kib: parse("PASSWORD_HASH_MEMORY_KIB", defaults.memory_kib as i64)?
                .try_into()
                .context("PASSWORD_HASH_MEMORY_KIB out of range")?,
        };

        let backend = match get("STORAGE_BACKEND")
            .unwrap_or_else(|| "local".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StorageBackend::Memory,
            "local" => StorageBackend::Local {
                root: get("STORAGE_ROOT").unwrap_or_else(|| "./data".into()),
            },
            "s3" => StorageBackend::S3 {
                endpoint: require("S3_ENDPOINT")?,
                bucket: require("S3_BUCKET")?,
                access_key: require("S3_ACCESS_KEY")?,
                secret_key: require("S3_SECRET_KEY")?,
                region: get("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
            },
            "drive" => StorageBackend::Drive {
                client_id: require("GOOGLE_CLIENT_ID")?,
                client_secret: require("GOOGLE_CLIENT_SECRET")?,
                refresh_token: require("GOOGLE_REFRESH_TOKEN")?,
            },
            other => bail!("unknown STORAGE_BACKEND {other:?} (memory, local, s3, drive)"),
        };

        let timeout_secs = parse("STORAGE_TIMEOUT_SECS", 30)?;
        if timeout_secs <= 0 {
            bail!("STORAGE_TIMEOUT_SECS must be positive");
        }

        let storage = StorageConfig {
            backend,
            container: ContainerOptions {
                id: get("STORAGE_CONTAINER_ID"),
                name: get("STORAGE_CONTAINER_NAME")
                    .unwrap_or_else(|| DEFAULT_CONTAINER_NAME.into()),
                recreate_missing: flag("STORAGE_CONTAINER_RECREATE"),
            },
            op_timeout: Duration::from_secs(timeout_secs as u64),
        };

        let port = get("APP_PORT").unwrap_or_else(|| "8080".into());
        Ok(Self {
            host: get("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: port
                .trim()
                .parse()
                .with_context(|| format!("APP_PORT must be a port number, got {port:?}"))?,
            frontend_url: get("FRONTEND_URL"),
            jwt,
            password,
            storage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = load(&[("JWT_SECRET", "s")]).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.jwt.issuer, "ledgerbook");
        assert_eq!(cfg.jwt.ttl_minutes, 60 * 24 * 7);
        assert!(matches!(cfg.storage.backend, StorageBackend::Local { ref root } if root == "./data"));
        assert_eq!(cfg.storage.container.name, DEFAULT_CONTAINER_NAME);
        assert!(cfg.storage.container.id.is_none());
        assert!(!cfg.storage.container.recreate_missing);
        assert_eq!(cfg.storage.op_timeout, Duration::from_secs(30));
    }

    #[test]
    fn jwt_secret_is_required() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn drive_backend_requires_oauth_settings() {
        let err = load(&[("JWT_SECRET", "s"), ("STORAGE_BACKEND", "drive")]).unwrap_err();
        assert!(err.to_string().contains("GOOGLE_CLIENT_ID"));

        let cfg = load(&[
            ("JWT_SECRET", "s"),
            ("STORAGE_BACKEND", "drive"),
            ("GOOGLE_CLIENT_ID", "id"),
            ("GOOGLE_CLIENT_SECRET", "secret"),
            ("GOOGLE_REFRESH_TOKEN", "rt"),
            ("STORAGE_CONTAINER_ID", "folder123"),
            ("STORAGE_CONTAINER_RECREATE", "true"),
        ])
        .unwrap();
        assert!(matches!(cfg.storage.backend, StorageBackend::Drive { .. }));
        assert_eq!(cfg.storage.container.id.as_deref(), Some("folder123"));
        assert!(cfg.storage.container.recreate_missing);
    }

    #[test]
    fn rejects_unknown_backend_and_bad_numbers() {
        assert!(load(&[("JWT_SECRET", "s"), ("STORAGE_BACKEND", "ftp")]).is_err());
        assert!(load(&[("JWT_SECRET", "s"), ("JWT_TTL_MINUTES", "soon")]).is_err());
        assert!(load(&[("JWT_SECRET", "s"), ("APP_PORT", "99999")]).is_err());
    }

    #[test]
    fn token_ttl_is_bounded() {
        let err = load(&[("JWT_SECRET", "s"), ("JWT_TTL_MINUTES", "9223372036854775807")])
            .unwrap_err();
        assert!(err.to_string().contains("at most"));
        assert!(load(&[("JWT_SECRET", "s"), ("JWT_TTL_MINUTES", "0")]).is_err());
        let cfg = load(&[("JWT_SECRET", "s"), ("JWT_TTL_MINUTES", "527040")]).unwrap();
        assert_eq!(cfg.jwt.ttl_minutes, MAX_TOKEN_TTL_MINUTES);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = load(&[("JWT_SECRET", "s"), ("STORAGE_CONTAINER_ID", "  ")]).unwrap();
        assert!(cfg.storage.container.id.is_none());
    }
}
