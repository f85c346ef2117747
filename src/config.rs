//! Server configuration from environment variables.
//!
//! The core has no CLI surface: everything the process needs arrives through
//! the environment. Signer and embedding credentials are zeroized on drop so
//! they do not linger in freed memory.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::warn;
use zeroize::Zeroize;

// Environment keys
const ENV_DB_PATH: &str = "KASSA_DB_PATH";
const ENV_LISTEN_ADDR: &str = "KASSA_LISTEN_ADDR";
const ENV_TSE_URL: &str = "KASSA_TSE_URL";
const ENV_TSE_API_KEY: &str = "KASSA_TSE_API_KEY";
const ENV_TSE_TIMEOUT_SECS: &str = "KASSA_TSE_TIMEOUT_SECS";
const ENV_EMBEDDINGS_URL: &str = "KASSA_EMBEDDINGS_URL";
const ENV_EMBEDDINGS_API_KEY: &str = "KASSA_EMBEDDINGS_API_KEY";
const ENV_EMBEDDINGS_TIMEOUT_SECS: &str = "KASSA_EMBEDDINGS_TIMEOUT_SECS";
const ENV_TAX_RULES: &str = "KASSA_TAX_RULES";

const DEFAULT_DB_FILE: &str = "kassa.db";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7345";
const DEFAULT_TSE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_EMBEDDINGS_TIMEOUT_SECS: u64 = 30;

/// A credential string cleared from memory on drop.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: String) -> Self {
        Secret(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub listen_addr: String,
    pub tse_url: String,
    pub tse_api_key: Secret,
    pub tse_timeout: Duration,
    pub embeddings_url: String,
    pub embeddings_api_key: Secret,
    pub embeddings_timeout: Duration,
    /// Category-type → tax-rate overrides (`{"drink":"19.00", ...}`).
    pub tax_rules: Vec<(String, Decimal)>,
}

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// Missing optional values fall back to defaults; an empty TSE or
    /// embedding endpoint disables the corresponding HTTP client (useful
    /// for tests and offline bring-up, where the in-process fakes run).
    pub fn from_env() -> Self {
        let db_path = std::env::var(ENV_DB_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_FILE));
        let listen_addr =
            std::env::var(ENV_LISTEN_ADDR).unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());

        let tse_url = std::env::var(ENV_TSE_URL)
            .map(|u| normalize_endpoint_url(&u))
            .unwrap_or_default();
        let tse_api_key = Secret::new(std::env::var(ENV_TSE_API_KEY).unwrap_or_default());
        let tse_timeout = env_secs(ENV_TSE_TIMEOUT_SECS, DEFAULT_TSE_TIMEOUT_SECS);

        let embeddings_url = std::env::var(ENV_EMBEDDINGS_URL)
            .map(|u| normalize_endpoint_url(&u))
            .unwrap_or_default();
        let embeddings_api_key =
            Secret::new(std::env::var(ENV_EMBEDDINGS_API_KEY).unwrap_or_default());
        let embeddings_timeout =
            env_secs(ENV_EMBEDDINGS_TIMEOUT_SECS, DEFAULT_EMBEDDINGS_TIMEOUT_SECS);

        let tax_rules = std::env::var(ENV_TAX_RULES)
            .ok()
            .map(|raw| parse_tax_rules(&raw))
            .unwrap_or_default();

        Config {
            db_path,
            listen_addr,
            tse_url,
            tse_api_key,
            tse_timeout,
            embeddings_url,
            embeddings_api_key,
            embeddings_timeout,
            tax_rules,
        }
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

/// Normalise an endpoint URL:
/// - strip trailing slashes
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_endpoint_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Parse a `{"drink":"19.00","food":"7.00"}` style override map.
///
/// Unparseable entries are skipped with a warning rather than failing the
/// whole configuration.
fn parse_tax_rules(raw: &str) -> Vec<(String, Decimal)> {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("Ignoring malformed {ENV_TAX_RULES}: {e}");
            return Vec::new();
        }
    };

    let Some(map) = parsed.as_object() else {
        warn!("Ignoring {ENV_TAX_RULES}: expected a JSON object");
        return Vec::new();
    };

    let mut rules = Vec::with_capacity(map.len());
    for (category_type, rate) in map {
        let rate_str = match rate {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => {
                warn!(category_type, "Skipping non-numeric tax rule");
                continue;
            }
        };
        match rate_str.parse::<Decimal>() {
            Ok(d) => rules.push((category_type.clone(), d)),
            Err(e) => warn!(category_type, error = %e, "Skipping unparseable tax rate"),
        }
    }
    rules
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_normalize_endpoint_url() {
        assert_eq!(
            normalize_endpoint_url("tse.example.com/"),
            "https://tse.example.com"
        );
        assert_eq!(
            normalize_endpoint_url("localhost:9000"),
            "http://localhost:9000"
        );
        assert_eq!(
            normalize_endpoint_url("https://api.example.com///"),
            "https://api.example.com"
        );
        assert_eq!(normalize_endpoint_url(""), "");
    }

    #[test]
    fn test_parse_tax_rules() {
        let rules = parse_tax_rules(r#"{"drink":"19.00","food":7.0,"bogus":[]}"#);
        assert_eq!(rules.len(), 2);
        assert!(rules
            .iter()
            .any(|(k, v)| k == "drink" && *v == Decimal::new(1900, 2)));
    }

    #[test]
    fn test_parse_tax_rules_malformed() {
        assert!(parse_tax_rules("not json").is_empty());
        assert!(parse_tax_rules("[1,2,3]").is_empty());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        std::env::remove_var(ENV_DB_PATH);
        std::env::remove_var(ENV_LISTEN_ADDR);
        std::env::remove_var(ENV_TSE_URL);
        let cfg = Config::from_env();
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(cfg.db_path, PathBuf::from(DEFAULT_DB_FILE));
        assert!(cfg.tse_url.is_empty());
        assert_eq!(cfg.tse_timeout, Duration::from_secs(DEFAULT_TSE_TIMEOUT_SECS));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var(ENV_LISTEN_ADDR, "0.0.0.0:9999");
        std::env::set_var(ENV_TSE_URL, "tse.local:8443/");
        std::env::set_var(ENV_TSE_TIMEOUT_SECS, "3");
        let cfg = Config::from_env();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9999");
        assert_eq!(cfg.tse_url, "https://tse.local:8443");
        assert_eq!(cfg.tse_timeout, Duration::from_secs(3));
        std::env::remove_var(ENV_LISTEN_ADDR);
        std::env::remove_var(ENV_TSE_URL);
        std::env::remove_var(ENV_TSE_TIMEOUT_SECS);
    }
}
