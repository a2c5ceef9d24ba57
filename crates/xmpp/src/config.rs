//! Connection configuration loaded from TOML with environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::jid::Jid;
use crate::sasl::Mechanism;
use crate::session::Credentials;

/// Default client-to-server port.
pub const DEFAULT_PORT: u16 = 5222;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to open and negotiate a client session.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Account address; a resource here is used when `resource` is unset
    #[serde(default)]
    pub jid: String,
    #[serde(default)]
    pub password: String,
    /// Host to connect to when it differs from the account domain
    pub server: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Resource to request when binding
    pub resource: Option<String>,
    /// Bounds connect, negotiation, and each synchronous request
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// 0 retries forever
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Upgrade with STARTTLS when the server offers it
    #[serde(default = "default_true")]
    pub starttls: bool,
    /// SASL mechanisms in order of preference
    #[serde(default = "default_mechanisms")]
    pub mechanisms: Vec<String>,
    /// `xml:lang` announced in the stream header
    pub language: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_mechanisms() -> Vec<String> {
    crate::sasl::DEFAULT_MECHANISMS
        .iter()
        .map(|m| m.name().to_string())
        .collect()
}

impl ConnectionConfig {
    /// A configuration with defaults for everything but the account.
    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            password: password.into(),
            server: None,
            port: DEFAULT_PORT,
            resource: None,
            timeout_seconds: default_timeout_seconds(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            starttls: true,
            mechanisms: default_mechanisms(),
            language: None,
        }
    }

    /// The parsed account address.
    pub fn account_jid(&self) -> Result<Jid, ConfigError> {
        let jid = Jid::parse(&self.jid).map_err(|e| ConfigError::InvalidValue {
            field: "jid".to_string(),
            message: e.to_string(),
        })?;
        if jid.node().is_none() {
            return Err(ConfigError::InvalidValue {
                field: "jid".to_string(),
                message: "must include a username (user@domain)".to_string(),
            });
        }
        Ok(jid)
    }

    /// Host to open the TCP connection to.
    pub fn connect_host(&self) -> Result<String, ConfigError> {
        match &self.server {
            Some(server) => Ok(server.clone()),
            None => Ok(self.account_jid()?.host().to_string()),
        }
    }

    /// Resource to request: the explicit setting, else the one in the JID.
    pub fn requested_resource(&self) -> Option<String> {
        self.resource.clone().or_else(|| {
            Jid::parse(&self.jid)
                .ok()
                .and_then(|jid| jid.resource().map(str::to_string))
        })
    }

    /// Login credentials for the account.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let jid = self.account_jid()?;
        let username = jid.node().unwrap_or_default().to_string();
        Ok(Credentials::new(
            username,
            self.password.clone(),
            self.requested_resource(),
        ))
    }

    /// Configured SASL mechanisms, in order.
    pub fn sasl_mechanisms(&self) -> Result<Vec<Mechanism>, ConfigError> {
        self.mechanisms
            .iter()
            .map(|name| {
                Mechanism::from_name(name).ok_or_else(|| ConfigError::InvalidValue {
                    field: "mechanisms".to_string(),
                    message: format!("unsupported SASL mechanism '{}'", name),
                })
            })
            .collect()
    }

    /// Timeout applied to connect, negotiation, and requests.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Check required fields and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.jid.is_empty() {
            missing.push("jid".to_string());
        }
        if self.password.is_empty() {
            missing.push("password".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingRequiredFields { fields: missing });
        }

        self.account_jid()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".to_string(),
                message: "must be between 1 and 65535".to_string(),
            });
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeout_seconds".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.mechanisms.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "mechanisms".to_string(),
                message: "at least one SASL mechanism is required".to_string(),
            });
        }
        self.sasl_mechanisms()?;

        Ok(())
    }
}

#[derive(Debug, Default)]
struct ConfigOverrides {
    jid: Option<String>,
    password: Option<String>,
    server: Option<String>,
}

/// Load configuration from a TOML file, merging environment overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<ConnectionConfig, ConfigError> {
    load_config_from_with_overrides(path.as_ref(), config_overrides_from_env())
}

/// Parse configuration from a TOML string, merging environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<ConnectionConfig, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: &Path,
    overrides: ConfigOverrides,
) -> Result<ConnectionConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<ConnectionConfig, ConfigError> {
    let mut config: ConnectionConfig = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    config.validate()?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        jid: std::env::var("WADDLE_XMPP_JID").ok(),
        password: std::env::var("WADDLE_XMPP_PASSWORD").ok(),
        server: std::env::var("WADDLE_XMPP_SERVER").ok(),
    }
}

fn apply_overrides(config: &mut ConnectionConfig, overrides: ConfigOverrides) {
    if let Some(jid) = overrides.jid {
        config.jid = jid;
    }
    if let Some(password) = overrides.password {
        config.password = password;
    }
    if let Some(server) = overrides.server {
        config.server = Some(server);
    }
}
