use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

use crate::types::ResourceLimits;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub enable_tracing: bool,
}

/// Settings applied to every sandbox the engine provisions.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image to run (default: "node:lts-alpine").
    pub image: String,
    /// Host directory under which each owner gets `<host_root>/<owner>`.
    pub host_root: PathBuf,
    /// Working directory inside the container; the owner directory is
    /// bind-mounted here.
    pub container_workdir: String,
    /// Resource limits applied to each container.
    pub limits: ResourceLimits,
    /// Attach the container to the default bridge network.
    pub network_enabled: bool,
    /// Command started for interactive terminal sessions.
    pub interactive_cmd: Vec<String>,
    /// Value of the `managed-by` label put on every container.
    pub label: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "node:lts-alpine".to_string(),
            host_root: PathBuf::from("/var/repl/users"),
            container_workdir: "/work".to_string(),
            limits: ResourceLimits::default(),
            network_enabled: false,
            interactive_cmd: vec!["sh".to_string()],
            label: "cloudrepl-sandbox".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct IdentityConfig {
    /// Accept any syntactically valid user id.
    pub open: bool,
    /// Known user ids.
    pub users: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("CLOUDREPL_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map APP__SERVER__PORT=3000 to server.port
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.sandbox.container_workdir, "/work");
        assert_eq!(config.sandbox.interactive_cmd, vec!["sh".to_string()]);
        assert!(!config.sandbox.network_enabled);
        assert!(!config.identity.open);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let raw = r#"
            [server]
            port = 8080

            [sandbox]
            image = "python:3.12-alpine"

            [sandbox.limits]
            memory_bytes = 268435456
            cpu_shares = 256
            cpu_quota_micros = 50000
            cpu_period_micros = 100000

            [identity]
            users = ["u1", "u2"]
        "#;
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.sandbox.image, "python:3.12-alpine");
        assert_eq!(config.sandbox.limits.memory_bytes, 268435456);
        assert_eq!(config.sandbox.label, "cloudrepl-sandbox");
        assert_eq!(config.identity.users, vec!["u1", "u2"]);
    }

    #[test]
    fn test_shipped_defaults_are_closed() {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(
                include_str!("../../../config/default.toml"),
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(!config.identity.open);
        assert!(!config.sandbox.network_enabled);
        assert_eq!(config.sandbox.limits, AppConfig::default().sandbox.limits);
    }
}
