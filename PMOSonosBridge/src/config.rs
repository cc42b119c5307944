//! Bridge configuration.
//!
//! Environment-driven singleton. `PMOSONOS_*` variables take precedence;
//! plain `HOST` / `PORT` are honored too for drop-in deployments.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use tracing::warn;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8257;
const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 1;
const DEFAULT_SOAP_TIMEOUT_SECS: u64 = 5;

lazy_static! {
    static ref CONFIG: Arc<Config> = Arc::new(Config::from_env());
}

/// Returns the global configuration.
pub fn get_config() -> Arc<Config> {
    Arc::clone(&CONFIG)
}

#[derive(Debug)]
pub struct Config {
    host: String,
    port: u16,
    scan_timeout: Duration,
    soap_timeout: Duration,
}

impl Config {
    fn from_env() -> Self {
        let host = env::var("PMOSONOS_HOST")
            .or_else(|_| env::var("HOST"))
            .unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = env::var("PMOSONOS_PORT")
            .or_else(|_| env::var("PORT"))
            .ok()
            .and_then(|raw| parse_or_warn::<u16>("port", &raw))
            .unwrap_or(DEFAULT_PORT);
        let scan_timeout = env_secs("PMOSONOS_SCAN_TIMEOUT_SECS", DEFAULT_SCAN_TIMEOUT_SECS);
        let soap_timeout = env_secs("PMOSONOS_SOAP_TIMEOUT_SECS", DEFAULT_SOAP_TIMEOUT_SECS);

        Self {
            host,
            port,
            scan_timeout,
            soap_timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// SSDP scan window for device discovery.
    pub fn scan_timeout(&self) -> Duration {
        self.scan_timeout
    }

    /// Per-call timeout for SOAP and GENA requests toward a speaker.
    pub fn soap_timeout(&self) -> Duration {
        self.soap_timeout
    }
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|raw| parse_or_warn::<u64>(key, &raw))
        .unwrap_or(default_secs);
    Duration::from_secs(secs.max(1))
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {} value '{}'", key, raw);
            None
        }
    }
}
