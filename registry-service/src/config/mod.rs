//! Configuration module for registry-service.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, Secret};
use service_core::config::{self as core_config, env_or, env_parse, env_required};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

/// Placeholder credential meaning "no edge cache configured".
pub const SENTINEL_CREDENTIAL: &str = "dummy";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub edge_cache: EdgeCacheConfig,
    pub directory: DirectoryConfig,
    pub encryption_key: Secret<String>,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct EdgeCacheConfig {
    pub account_id: String,
    pub api_token: Secret<String>,
    pub namespace_id: String,
    pub api_base_url: String,
    pub timeout: Duration,
}

impl EdgeCacheConfig {
    /// False when any credential is empty or the placeholder value.
    pub fn has_credentials(&self) -> bool {
        let usable = |v: &str| !v.trim().is_empty() && v != SENTINEL_CREDENTIAL;
        usable(&self.account_id) && usable(&self.namespace_id) && usable(self.api_token.expose_secret())
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub secret_key: Secret<String>,
    pub api_base_url: String,
    /// PEM file holding the RS256 key that signs session tokens.
    pub jwt_public_key_path: Option<String>,
    /// Prefix of the metadata keys holding roles, e.g. `tokenManager:teamRoles`.
    pub namespace: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub on_startup: bool,
    pub page_size: usize,
    pub entry_timeout: Duration,
}

impl RegistryConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let timeout = Duration::from_secs(env_parse("EXTERNAL_CALL_TIMEOUT_SECONDS", 10u64)?);

        let config = Self {
            common,
            service_name: env_or("SERVICE_NAME", "registry-service"),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env_or("LOG_LEVEL", "info"),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: Secret::new(env_required("DATABASE_URL")?),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            edge_cache: EdgeCacheConfig {
                account_id: env_or("CF_ACCOUNT_ID", SENTINEL_CREDENTIAL),
                api_token: Secret::new(env_or("CF_API_TOKEN", SENTINEL_CREDENTIAL)),
                namespace_id: env_or("CF_KV_NAMESPACE_ID", SENTINEL_CREDENTIAL),
                api_base_url: env_or("CF_API_BASE_URL", "https://api.cloudflare.com/client/v4"),
                timeout,
            },
            directory: DirectoryConfig {
                secret_key: Secret::new(env_or("CLERK_SECRET_KEY", "")),
                api_base_url: env_or("CLERK_API_BASE_URL", "https://api.clerk.com"),
                jwt_public_key_path: env::var("CLERK_JWT_PUBLIC_KEY_PATH").ok(),
                namespace: env_or("IDENTITY_NAMESPACE", "tokenManager"),
                timeout,
            },
            encryption_key: Secret::new(env_required("TOKEN_ENCRYPTION_KEY")?),
            reconcile: ReconcileConfig {
                on_startup: env_parse("RECONCILE_ON_STARTUP", true)?,
                page_size: env_parse("RECONCILE_PAGE_SIZE", 100)?,
                entry_timeout: timeout,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.database.max_connections == 0 || self.database.min_connections > self.database.max_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MIN_CONNECTIONS ({}) must not exceed DATABASE_MAX_CONNECTIONS ({}), which must be positive",
                self.database.min_connections,
                self.database.max_connections
            )));
        }
        if self.edge_cache.timeout.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "EXTERNAL_CALL_TIMEOUT_SECONDS must be greater than zero"
            )));
        }
        if self.reconcile.page_size == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RECONCILE_PAGE_SIZE must be greater than zero"
            )));
        }
        decode_encryption_key(&self.encryption_key)?;
        Ok(())
    }
}

/// Decodes the base64 token encryption key, which must be 32 bytes.
pub fn decode_encryption_key(key: &Secret<String>) -> Result<[u8; 32], AppError> {
    let bytes = STANDARD
        .decode(key.expose_secret().trim())
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("TOKEN_ENCRYPTION_KEY is not base64: {}", e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        AppError::ConfigError(anyhow::anyhow!(
            "TOKEN_ENCRYPTION_KEY must decode to 32 bytes, got {}",
            b.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(account: &str, token: &str, namespace: &str) -> EdgeCacheConfig {
        EdgeCacheConfig {
            account_id: account.to_string(),
            api_token: Secret::new(token.to_string()),
            namespace_id: namespace.to_string(),
            api_base_url: "http://localhost".to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn sentinel_credentials_are_not_usable() {
        assert!(!edge("dummy", "dummy", "dummy").has_credentials());
        assert!(!edge("acct", "", "ns").has_credentials());
        assert!(edge("acct", "tok", "ns").has_credentials());
    }

    #[test]
    fn encryption_key_must_be_32_bytes() {
        let good = Secret::new(STANDARD.encode([7u8; 32]));
        assert_eq!(decode_encryption_key(&good).unwrap(), [7u8; 32]);

        let short = Secret::new(STANDARD.encode([7u8; 16]));
        assert!(matches!(decode_encryption_key(&short), Err(AppError::ConfigError(_))));

        let garbage = Secret::new("not base64!".to_string());
        assert!(decode_encryption_key(&garbage).is_err());
    }
}
