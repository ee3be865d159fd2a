use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Shared secret expected in the `hashcode` field when `SOLVE_HASHCODE` is unset.
pub const DEFAULT_HASHCODE: &str = "melonfromlocalmacandwin";

const DEFAULT_PORT: u16 = 50205;
const DEFAULT_BODY_LIMIT_MB: usize = 5;
const DEFAULT_MODEL_PATH: &str = "./model/captcha.pb";
const DEFAULT_CHARSET_PATH: &str = "./model/charset.txt";
const DEFAULT_INPUT_OP: &str = "input1";
const DEFAULT_OUTPUT_OP: &str = "output";

#[derive(Debug, Error)]
#[error("{var} must be {expected}, got {value:?}")]
pub struct ConfigError {
    var: &'static str,
    value: String,
    expected: &'static str,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub body_limit_bytes: usize,
    pub model_path: PathBuf,
    pub charset_path: PathBuf,
    pub model_url: Option<String>,
    pub charset_url: Option<String>,
    pub input_op: String,
    pub output_op: String,
    pub hashcode: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset or empty keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = parse(&get, "HOST", IpAddr::V4(Ipv4Addr::LOCALHOST), "an IP address")?;
        let port = parse(&get, "PORT", DEFAULT_PORT, "a valid number between 0 and 65535")?;
        let body_limit_mb: usize =
            parse(&get, "BODY_LIMIT_MB", DEFAULT_BODY_LIMIT_MB, "a valid integer")?;

        Ok(Config {
            host,
            port,
            body_limit_bytes: body_limit_mb.saturating_mul(1024 * 1024),
            model_path: get("MODEL_PATH")
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.into())
                .into(),
            charset_path: get("CHARSET_PATH")
                .unwrap_or_else(|| DEFAULT_CHARSET_PATH.into())
                .into(),
            model_url: get("MODEL_URL"),
            charset_url: get("CHARSET_URL"),
            input_op: get("MODEL_INPUT_OP").unwrap_or_else(|| DEFAULT_INPUT_OP.into()),
            output_op: get("MODEL_OUTPUT_OP").unwrap_or_else(|| DEFAULT_OUTPUT_OP.into()),
            hashcode: get("SOLVE_HASHCODE").unwrap_or_else(|| DEFAULT_HASHCODE.into()),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn parse<T, G>(
    get: &G,
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError { var, value, expected }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_listen_on_loopback() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.addr(), "127.0.0.1:50205".parse().unwrap());
        assert_eq!(config.body_limit_bytes, 5 * 1024 * 1024);
        assert_eq!(config.hashcode, DEFAULT_HASHCODE);
        assert_eq!(config.input_op, "input1");
        assert_eq!(config.output_op, "output");
        assert!(config.model_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("HOST", "0.0.0.0"),
            ("PORT", "8080"),
            ("BODY_LIMIT_MB", "1"),
            ("MODEL_PATH", "/models/ocr.pb"),
            ("CHARSET_URL", "https://example.com/charset.json"),
            ("SOLVE_HASHCODE", "letmein"),
        ])
        .unwrap();

        assert_eq!(config.addr(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.body_limit_bytes, 1024 * 1024);
        assert_eq!(config.model_path, PathBuf::from("/models/ocr.pb"));
        assert_eq!(config.charset_url.as_deref(), Some("https://example.com/charset.json"));
        assert_eq!(config.hashcode, "letmein");
    }

    #[test]
    fn empty_values_fall_back_to_defaults() {
        let config = config_from(&[("PORT", ""), ("SOLVE_HASHCODE", "  ")]).unwrap();

        assert_eq!(config.port, 50205);
        assert_eq!(config.hashcode, DEFAULT_HASHCODE);
    }

    #[test]
    fn invalid_port_names_the_variable() {
        let err = config_from(&[("PORT", "70000")]).unwrap_err();

        assert_eq!(err.var, "PORT");
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn invalid_body_limit_is_rejected() {
        assert!(config_from(&[("BODY_LIMIT_MB", "lots")]).is_err());
    }
}
