use crate::peer::{IceConfig, TurnServer};
use std::env;
use std::num::ParseIntError;
use thiserror::Error;

pub const DEFAULT_ROOM: &str = "karaoke";

#[derive(Debug, Clone)]
pub struct Config {
    pub ice: IceConfig,
    pub room: String,
    pub metrics_port: Option<u16>,
    pub rust_log: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required when TURN_URL is set")]
    MissingVariable(String),
    #[error("METRICS_PORT must be a valid port number (got '{0}': {1})")]
    InvalidPort(String, ParseIntError),
    #[error("METRICS_PORT must be between 1 and 65535 (got {0})")]
    PortOutOfRange(u16),
    #[error("{0} must not be empty")]
    Empty(String),
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Validates environment variables and returns a Config object
/// Returns an error if any variable is present but invalid
pub fn validate_env() -> Result<Config, ConfigError> {
    // Optional: STUN_URLS (comma separated, defaults to the built-in list)
    let mut ice = IceConfig::default();
    if let Ok(raw) = env::var("STUN_URLS") {
        let urls: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();
        if urls.is_empty() {
            return Err(ConfigError::Empty("STUN_URLS".to_string()));
        }
        ice.stun_urls = urls;
    }

    // Optional: TURN_URL, which then requires credentials
    if let Some(url) = non_empty("TURN_URL") {
        let username = non_empty("TURN_USERNAME")
            .ok_or_else(|| ConfigError::MissingVariable("TURN_USERNAME".to_string()))?;
        let credential = non_empty("TURN_CREDENTIAL")
            .ok_or_else(|| ConfigError::MissingVariable("TURN_CREDENTIAL".to_string()))?;
        ice.turn = Some(TurnServer {
            url,
            username,
            credential,
        });
    }

    let room = match env::var("CAMLINK_ROOM") {
        Ok(room) if room.trim().is_empty() => {
            return Err(ConfigError::Empty("CAMLINK_ROOM".to_string()))
        }
        Ok(room) => room,
        Err(_) => DEFAULT_ROOM.to_string(),
    };

    // Optional: METRICS_PORT (metrics endpoint disabled when unset)
    let metrics_port = match env::var("METRICS_PORT") {
        Ok(port_str) => {
            let port: u16 = port_str
                .parse()
                .map_err(|e| ConfigError::InvalidPort(port_str.clone(), e))?;
            if port == 0 {
                return Err(ConfigError::PortOutOfRange(port));
            }
            Some(port)
        }
        Err(_) => None,
    };

    // Optional: RUST_LOG (defaults to "info")
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| {
        tracing::warn!("RUST_LOG not set, using default: info");
        "info".to_string()
    });

    let config = Config {
        ice,
        room,
        metrics_port,
        rust_log,
    };

    tracing::info!(
        stun_servers = config.ice.stun_urls.len(),
        turn = config.ice.turn.is_some(),
        room = %config.room,
        metrics_port = ?config.metrics_port,
        rust_log = %config.rust_log,
        "Configuration"
    );

    Ok(config)
}
