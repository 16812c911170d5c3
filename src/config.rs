//! Configuration loader and client settings.

use crate::errors::{AppError, Result};
use crate::feed::reconnect::ReconnectConfig;
use std::env::VarError;
use std::time::Duration;
use url::Url;

/// Public guest feed; needs no credentials.
pub const DEFAULT_ENDPOINT: &str = "ws://stream.tradingeconomics.com/?client=guest:guest";
pub const DEFAULT_SYMBOL: &str = "EURUSD:CUR";

/// Consolidated client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket endpoint of the quote stream.
    pub endpoint: String,
    /// Symbol named in the subscribe handshake (e.g., "EURUSD:CUR").
    pub symbol: String,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            symbol: DEFAULT_SYMBOL.to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults
    /// for anything unset.
    ///
    /// `QUOTE_WS_URL`, `QUOTE_SYMBOL`, `CONNECT_TIMEOUT_MS`,
    /// `RECONNECT_BASE_DELAY_MS`, `RECONNECT_MAX_DELAY_MS`, `RECONNECT_MAX_ATTEMPTS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key))
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, VarError>,
    {
        let defaults = Self::default();
        let var = |key: &str| -> Result<Option<String>> {
            match lookup(key) {
                Ok(value) if value.trim().is_empty() => Ok(None),
                Ok(value) => Ok(Some(value.trim().to_string())),
                Err(VarError::NotPresent) => Ok(None),
                Err(e) => Err(e.into()),
            }
        };
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            match var(key)? {
                Some(raw) => Ok(Duration::from_millis(raw.parse()?)),
                None => Ok(default),
            }
        };

        let config = Self {
            endpoint: var("QUOTE_WS_URL")?.unwrap_or(defaults.endpoint),
            symbol: var("QUOTE_SYMBOL")?.unwrap_or(defaults.symbol),
            connect_timeout: millis("CONNECT_TIMEOUT_MS", defaults.connect_timeout)?,
            reconnect: ReconnectConfig {
                base_delay: millis("RECONNECT_BASE_DELAY_MS", defaults.reconnect.base_delay)?,
                max_delay: millis("RECONNECT_MAX_DELAY_MS", defaults.reconnect.max_delay)?,
                max_attempts: match var("RECONNECT_MAX_ATTEMPTS")? {
                    Some(raw) => raw.parse()?,
                    None => defaults.reconnect.max_attempts,
                },
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(AppError::Config(format!(
                "endpoint scheme must be ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.symbol.trim().is_empty() {
            return Err(AppError::Config("symbol must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(AppError::Config("connect timeout must be positive".into()));
        }
        if self.reconnect.base_delay.is_zero() {
            return Err(AppError::Config("reconnect base delay must be positive".into()));
        }
        if self.reconnect.max_delay < self.reconnect.base_delay {
            return Err(AppError::Config(
                "reconnect max delay must not be below the base delay".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(
        vars: &[(&str, &str)],
    ) -> impl Fn(&str) -> std::result::Result<String, VarError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned().ok_or(VarError::NotPresent)
    }

    #[test]
    fn defaults_target_guest_feed() {
        let config = ClientConfig::default();
        assert_eq!(
            config.endpoint,
            "ws://stream.tradingeconomics.com/?client=guest:guest"
        );
        assert_eq!(config.symbol, "EURUSD:CUR");
        assert_eq!(config.reconnect, ReconnectConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("QUOTE_WS_URL", "wss://example.test/stream"),
            ("QUOTE_SYMBOL", " GBPUSD:CUR "),
            ("CONNECT_TIMEOUT_MS", "2500"),
            ("RECONNECT_BASE_DELAY_MS", "250"),
            ("RECONNECT_MAX_DELAY_MS", "2000"),
            ("RECONNECT_MAX_ATTEMPTS", "4"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint, "wss://example.test/stream");
        assert_eq!(config.symbol, "GBPUSD:CUR");
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(2));
        assert_eq!(config.reconnect.max_attempts, 4);
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = ClientConfig::from_lookup(lookup(&[("RECONNECT_MAX_ATTEMPTS", "ten")]));
        assert!(matches!(err, Err(AppError::ParseInt(_))));

        let err = ClientConfig::from_lookup(lookup(&[("QUOTE_WS_URL", "not a url")]));
        assert!(matches!(err, Err(AppError::UrlParse(_))));

        let err = ClientConfig::from_lookup(lookup(&[("QUOTE_WS_URL", "http://example.test")]));
        assert!(matches!(err, Err(AppError::Config(_))));

        let err = ClientConfig::from_lookup(lookup(&[
            ("RECONNECT_BASE_DELAY_MS", "3000"),
            ("RECONNECT_MAX_DELAY_MS", "1000"),
        ]));
        assert!(matches!(err, Err(AppError::Config(_))));
    }

    #[test]
    fn blank_symbol_is_rejected() {
        let config = ClientConfig {
            symbol: "  ".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }
}
