//! Server configuration, loaded from a TOML file and overlaid with
//! environment variables prefixed `CARDSYNC_`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level server configuration.
///
/// No dynamic reload is supported; a changed file takes effect only on
/// the next process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP transport shim binds to.
    pub bind_addr: SocketAddr,

    /// Root directory under which every user's collection subtree lives.
    pub data_dir: PathBuf,

    /// Which identity gateway implementation to use.
    pub identity: IdentityConfig,

    /// Path to the persisted session-registry database.
    pub session_db_path: PathBuf,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Upload size limits, in bytes.
    pub limits: LimitsConfig,
}

/// Selects and parameterizes the identity gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityConfig {
    /// A local argon2-hashed user table stored alongside session data.
    Local { user_db_path: PathBuf },
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "cardsync=debug".
    pub level: String,

    /// Emit JSON-formatted log lines instead of the default human format.
    pub json: bool,
}

/// Request/response body size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum accepted collection upload size, in bytes.
    pub max_collection_upload_bytes: u64,

    /// Maximum accepted media archive size, in bytes.
    pub max_media_archive_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("valid default bind addr"),
            data_dir: PathBuf::from("./data"),
            identity: IdentityConfig::Local {
                user_db_path: PathBuf::from("./data/users.db"),
            },
            session_db_path: PathBuf::from("./data/sessions.db"),
            logging: LoggingConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_collection_upload_bytes: 100 * 1024 * 1024,
            max_media_archive_bytes: 50 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration: built-in defaults, overridden by an optional
    /// TOML file, overridden by `CARDSYNC_*` environment variables.
    pub fn load(toml_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));

        if let Some(path) = toml_path {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("CARDSYNC_").split("__"));

        let config: ServerConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on a configuration that could not possibly run.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_collection_upload_bytes == 0 {
            return Err(Error::Internal(
                "limits.max_collection_upload_bytes must be nonzero".into(),
            ));
        }
        if self.limits.max_media_archive_bytes == 0 {
            return Err(Error::Internal(
                "limits.max_media_archive_bytes must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_upload_limit_is_rejected() {
        let mut config = ServerConfig::default();
        config.limits.max_collection_upload_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_without_file_falls_back_to_defaults() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.bind_addr, ServerConfig::default().bind_addr);
    }

    #[test]
    fn load_from_toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cardsync.toml");
        std::fs::write(&path, "bind_addr = \"127.0.0.1:9000\"\n").unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
    }
}
