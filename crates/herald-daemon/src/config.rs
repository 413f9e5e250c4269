//! Daemon configuration.
//!
//! Loaded from the environment with warn-and-default on anything that does
//! not parse. Durations accept either plain seconds (`30`) or a seconds
//! suffix (`30s`).

use std::path::PathBuf;
use std::time::Duration;

use herald_webhook::WebhookConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the HTTP surface in front of the daemon.
    pub host: String,
    pub port: u16,

    /// Where session.db, app.db, LOCK, and media/ live.
    pub data_dir: PathBuf,

    /// Bearer key the HTTP surface checks; empty disables auth.
    pub api_key: String,

    pub webhook: WebhookConfig,

    pub download_media: bool,
    pub refresh_contacts: bool,
    pub refresh_groups: bool,

    pub shutdown_timeout: Duration,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            data_dir: PathBuf::from("/data"),
            api_key: String::new(),
            webhook: WebhookConfig::default(),
            download_media: true,
            refresh_contacts: true,
            refresh_groups: true,
            shutdown_timeout: Duration::from_secs(30),
            debug: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(p) if p > 0 => config.port = p,
                _ => tracing::warn!(value = %port, "invalid PORT, using default"),
            }
        }
        // HTTP_ADDR=host:port overrides both pieces at once.
        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            match addr.rsplit_once(':').map(|(h, p)| (h, p.parse::<u16>())) {
                Some((host, Ok(port))) if port > 0 => {
                    if !host.is_empty() {
                        config.host = host.to_string();
                    }
                    config.port = port;
                }
                _ => tracing::warn!(value = %addr, "invalid HTTP_ADDR, using default"),
            }
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(key) = std::env::var("API_KEY") {
            config.api_key = key;
        }

        if let Ok(url) = std::env::var("WEBHOOK_URL") {
            config.webhook.url = url;
        }
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            config.webhook.secret = secret;
        }
        if let Ok(retries) = std::env::var("WEBHOOK_RETRIES") {
            match retries.parse::<u32>() {
                Ok(n) => config.webhook.max_retries = n,
                Err(_) => tracing::warn!(value = %retries, "invalid WEBHOOK_RETRIES, using default"),
            }
        }
        if let Ok(timeout) = std::env::var("WEBHOOK_TIMEOUT") {
            match parse_duration(&timeout) {
                Some(d) => config.webhook.request_timeout = d,
                None => tracing::warn!(value = %timeout, "invalid WEBHOOK_TIMEOUT, using default"),
            }
        }

        if let Ok(v) = std::env::var("DOWNLOAD_MEDIA") {
            config.download_media = parse_bool(&v, config.download_media);
        }
        if let Ok(v) = std::env::var("REFRESH_CONTACTS") {
            config.refresh_contacts = parse_bool(&v, config.refresh_contacts);
        }
        if let Ok(v) = std::env::var("REFRESH_GROUPS") {
            config.refresh_groups = parse_bool(&v, config.refresh_groups);
        }

        if let Ok(timeout) = std::env::var("SHUTDOWN_TIMEOUT") {
            match parse_duration(&timeout) {
                Some(d) => config.shutdown_timeout = d,
                None => tracing::warn!(value = %timeout, "invalid SHUTDOWN_TIMEOUT, using default"),
            }
        }
        if let Ok(v) = std::env::var("DEBUG") {
            config.debug = parse_bool(&v, false);
        }

        config
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port must be non-zero".to_string());
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err("data directory is required".to_string());
        }
        Ok(())
    }

    /// Address for the HTTP surface to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_bool(s: &str, default: bool) -> bool {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let secs = s.strip_suffix('s').unwrap_or(s);
    secs.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_contract() {
        let config = Config::default();
        assert_eq!(config.addr(), "0.0.0.0:8080");
        assert_eq!(config.webhook.max_retries, 3);
        assert_eq!(config.webhook.request_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(config.download_media);
        config.validate().unwrap();
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("true", false));
        assert!(parse_bool("YES", false));
        assert!(parse_bool("1", false));
        assert!(!parse_bool("off", true));
        assert!(!parse_bool("0", true));
        assert!(parse_bool("gibberish", true));
    }

    #[test]
    fn duration_parsing_accepts_suffix() {
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("ten"), None);
    }

    #[test]
    fn empty_data_dir_is_rejected() {
        let config = Config {
            data_dir: PathBuf::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
