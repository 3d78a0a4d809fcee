use home::home_dir;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

use crate::{
    constant::{CONFIG_DIR, CONFIG_ENV, CONFIG_FILE, DB_NAME, LIVENESS_TTL_SECS, STALENESS_FACTOR},
    KudosError, KudosResult,
};

const ADMIN_TOKEN_ENV: &str = "KUDOS_ADMIN_TOKEN";
const TWITCH_CLIENT_ID_ENV: &str = "TWITCH_CLIENT_ID";
const TWITCH_CLIENT_SECRET_ENV: &str = "TWITCH_CLIENT_SECRET";
const TWITCH_USER_LOGIN_ENV: &str = "TWITCH_USER_LOGIN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KudosConfig {
    /// Socket address used to serve. Should be <ip>:<port>
    /// Example: 127.0.0.1:8080
    pub socket: SocketAddr,
    /// Server Certificate file; Should be <name>.pem file.
    /// Plain TCP is served when either this or `pkey` is unset.
    pub cert: Option<PathBuf>,
    /// Server private key used with certificate; Should be <name>.pem file
    pub pkey: Option<PathBuf>,
    /// Path to sqlite Db; a directory gets the default db name appended.
    pub db: PathBuf,
    /// Bearer token accepted for admin operations. Admin is disabled
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    pub liveness: LivenessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// How long a fetched status is served without asking upstream again.
    pub ttl_secs: u64,
    /// After `ttl * staleness_factor` a status is too old even as a fallback.
    pub staleness_factor: u32,
    /// Endpoint answering `{online, title?, broadcaster?}`.
    pub status_url: Option<String>,
    pub twitch: Option<TwitchConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    pub user_login: String,
}

impl Default for KudosConfig {
    fn default() -> Self {
        Self {
            socket: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080),
            cert: None,
            pkey: None,
            db: config_dir().join(DB_NAME),
            admin_token: None,
            liveness: LivenessConfig::default(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ttl_secs: LIVENESS_TTL_SECS,
            staleness_factor: STALENESS_FACTOR,
            status_url: None,
            twitch: None,
        }
    }
}

impl LivenessConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// `~/.kudos`, or `./.kudos` when there is no home directory.
pub fn config_dir() -> PathBuf {
    home_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_default()
        .join(CONFIG_DIR)
}

impl KudosConfig {
    /// Load the config from `path`, else `$KUDOSCONF`, else
    /// `~/.kudos/kudos.toml`. A missing default file means defaults; a
    /// missing explicit file is an error. Environment overrides are applied
    /// last.
    pub fn load(path: Option<PathBuf>) -> KudosResult<Self> {
        let explicit = path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let default_path = config_dir().join(CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> KudosResult<Self> {
        if !path.is_file() {
            return Err(KudosError::config_error(format!(
                "config file {} does not exist",
                path.display()
            ))
            .into());
        }
        info!(config = %path.display(), "Reading config");
        let buf = std::fs::read_to_string(path)?;
        Self::parse(&buf)
    }

    pub fn parse(buf: &str) -> KudosResult<Self> {
        toml::from_str(buf).map_err(|e| KudosError::config_error(e.to_string()).into())
    }

    /// Secrets usually come from the environment rather than the file.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(token) = var(ADMIN_TOKEN_ENV) {
            self.admin_token = Some(token);
        }

        let client_id = var(TWITCH_CLIENT_ID_ENV);
        let client_secret = var(TWITCH_CLIENT_SECRET_ENV);
        let user_login = var(TWITCH_USER_LOGIN_ENV);
        match (&mut self.liveness.twitch, client_id, client_secret, user_login) {
            (Some(twitch), id, secret, login) => {
                if let Some(id) = id {
                    twitch.client_id = id;
                }
                if let Some(secret) = secret {
                    twitch.client_secret = secret;
                }
                if let Some(login) = login {
                    twitch.user_login = login;
                }
            }
            (None, Some(client_id), Some(client_secret), Some(user_login)) => {
                self.liveness.twitch = Some(TwitchConfig {
                    client_id,
                    client_secret,
                    user_login,
                });
            }
            _ => {}
        }
    }

    pub fn validate(&self) -> KudosResult<()> {
        if self.liveness.ttl_secs == 0 {
            return Err(KudosError::config_error("liveness.ttl_secs must be positive").into());
        }
        if self.liveness.staleness_factor == 0 {
            return Err(
                KudosError::config_error("liveness.staleness_factor must be positive").into(),
            );
        }
        if self.cert.is_some() != self.pkey.is_some() {
            return Err(KudosError::config_error("cert and pkey must be set together").into());
        }
        Ok(())
    }

    /// Write the config to path
    pub fn save(&self, path: &Path) -> KudosResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let buf = toml::to_string_pretty(self)?;
        std::fs::write(path, buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::generate_random_db_name;
    use std::collections::HashMap;

    #[test]
    fn parse_with_defaults() {
        let config = KudosConfig::parse(
            r#"
            socket = "0.0.0.0:9000"
            db = "/tmp/kudos"

            [liveness]
            ttl_secs = 30
            status_url = "http://localhost:3000/api/twitch/status"
            "#,
        )
        .unwrap();

        assert_eq!(config.socket.port(), 9000);
        assert_eq!(config.db, PathBuf::from("/tmp/kudos"));
        assert_eq!(config.liveness.ttl(), Duration::from_secs(30));
        assert_eq!(config.liveness.staleness_factor, STALENESS_FACTOR);
        assert!(config.cert.is_none());
        assert!(config.liveness.twitch.is_none());
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = KudosConfig::parse("socket = 12").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KudosError>(),
            Some(KudosError::ConfigError { .. })
        ));
    }

    #[test]
    fn env_overrides_secrets() {
        let env: HashMap<&str, &str> = [
            (ADMIN_TOKEN_ENV, "hunter2"),
            (TWITCH_CLIENT_ID_ENV, "id"),
            (TWITCH_CLIENT_SECRET_ENV, "secret"),
            (TWITCH_USER_LOGIN_ENV, "dev"),
        ]
        .into_iter()
        .collect();
        let mut config = KudosConfig::default();
        config.apply_env(|key| env.get(key).map(|val| val.to_string()));

        assert_eq!(config.admin_token.as_deref(), Some("hunter2"));
        assert_eq!(
            config.liveness.twitch,
            Some(TwitchConfig {
                client_id: "id".into(),
                client_secret: "secret".into(),
                user_login: "dev".into(),
            })
        );

        // Partial twitch credentials are not enough to enable it.
        let mut config = KudosConfig::default();
        config.apply_env(|key| (key == TWITCH_USER_LOGIN_ENV).then(|| "dev".to_string()));
        assert!(config.liveness.twitch.is_none());
    }

    #[test]
    fn validation() {
        let mut config = KudosConfig::default();
        assert!(config.validate().is_ok());
        config.cert = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());
        config.pkey = Some(PathBuf::from("key.pem"));
        assert!(config.validate().is_ok());
        config.liveness.ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_and_load_back() {
        let path = std::env::temp_dir()
            .join(generate_random_db_name())
            .with_extension("toml");
        let mut config = KudosConfig::default();
        config.liveness.status_url = Some("http://localhost/status".into());
        config.save(&path).unwrap();

        let loaded = KudosConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(KudosConfig::load(Some(path.with_extension("missing"))).is_err());

        std::fs::remove_file(path).expect("Config cleanup failed");
    }
}
