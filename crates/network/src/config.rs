use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TunnelError};
use crate::headers::HeaderList;
use crate::proxy::ProxySpec;

pub const DEFAULT_TIMEOUT_MS: u32 = 30_000;
pub const DEFAULT_PROXY: &str = "socks5h://127.0.0.1:1080";
pub const DEFAULT_PROXY_PORT: u16 = 1080;
pub const DEFAULT_USER_AGENT: &str = concat!("tunnelwire/", env!("CARGO_PKG_VERSION"));

/// Tor Browser listens on 9150, a system Tor daemon on 9050.
pub const DEFAULT_TOR_SOCKS_PORT: u16 = if cfg!(windows) { 9150 } else { 9050 };
pub const DEFAULT_TOR_SOCKS_ADDR: &str = if cfg!(windows) {
    "127.0.0.1:9150"
} else {
    "127.0.0.1:9050"
};

pub const PROXY_ENV: &str = "PROXY";
pub const USER_AGENT_ENV: &str = "USER_AGENT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub proxy: Option<ProxySpec>,
    pub user_agent: Option<String>,
    pub timeout_ms: u32,
    pub verbose: bool,
    /// Sent with every request, ahead of per-request headers
    pub headers: HeaderList,
    pub basic_auth: Option<BasicAuth>,
    /// Fall back to `PROXY` / `USER_AGENT` when nothing was set explicitly
    pub env_defaults: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: None,
            user_agent: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            verbose: false,
            headers: HeaderList::new(),
            basic_auth: None,
            env_defaults: true,
        }
    }
}

impl Config {
    pub fn with_proxy(mut self, proxy: ProxySpec) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_tor(self) -> Self {
        self.with_proxy(ProxySpec::tor())
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Builder form of [`Config::set_timeout_ms`]; zero leaves the timeout unchanged.
    pub fn with_timeout_ms(mut self, ms: u32) -> Self {
        if ms > 0 {
            self.timeout_ms = ms;
        }
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_headers(mut self, headers: HeaderList) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some(BasicAuth {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    pub fn without_env_defaults(mut self) -> Self {
        self.env_defaults = false;
        self
    }

    pub fn set_timeout_ms(&mut self, ms: u32) -> Result<()> {
        if ms == 0 {
            return Err(TunnelError::Config(
                "timeout must be a positive number of milliseconds".to_string(),
            ));
        }
        self.timeout_ms = ms;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms))
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }
}

/// Values picked up from the process environment.
#[derive(Debug, Clone, Default)]
pub(crate) struct EnvDefaults {
    pub proxy: Option<ProxySpec>,
    pub user_agent: Option<String>,
}

impl EnvDefaults {
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var(PROXY_ENV).ok(),
            std::env::var(USER_AGENT_ENV).ok(),
        )
    }

    fn from_values(proxy: Option<String>, user_agent: Option<String>) -> Self {
        let proxy = proxy.filter(|p| !p.is_empty()).and_then(|p| {
            ProxySpec::parse(&p)
                .map_err(|e| warn!("Ignoring {}={:?}: {}", PROXY_ENV, p, e))
                .ok()
        });
        let user_agent = user_agent.filter(|ua| !ua.is_empty());
        Self { proxy, user_agent }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.user_agent().starts_with("tunnelwire/"));
        assert!(config.proxy.is_none());
        assert!(config.env_defaults);
    }

    #[test]
    fn test_zero_timeout_rejected_not_clamped() {
        let mut config = Config::default();
        config.set_timeout_ms(1500).unwrap();
        assert!(config.set_timeout_ms(0).is_err());
        assert_eq!(config.timeout_ms, 1500);
    }

    #[test]
    fn test_builder() {
        let config = Config::default()
            .with_tor()
            .with_user_agent("MyThing/0.1")
            .with_timeout_ms(1800)
            .with_basic_auth("user1", "password321")
            .without_env_defaults();
        assert_eq!(config.proxy.as_ref().map(|p| p.port), Some(DEFAULT_TOR_SOCKS_PORT));
        assert_eq!(config.user_agent(), "MyThing/0.1");
        assert_eq!(config.timeout_ms, 1800);
        assert!(!config.env_defaults);
    }

    #[test]
    fn test_env_values() {
        let env = EnvDefaults::from_values(Some("tor".into()), Some("Env/1.0".into()));
        assert_eq!(env.proxy, Some(ProxySpec::tor()));
        assert_eq!(env.user_agent.as_deref(), Some("Env/1.0"));

        let env = EnvDefaults::from_values(Some("not a proxy".into()), Some(String::new()));
        assert!(env.proxy.is_none());
        assert!(env.user_agent.is_none());
    }

    #[test]
    fn test_tor_addr_matches_port() {
        assert!(DEFAULT_TOR_SOCKS_ADDR.ends_with(&DEFAULT_TOR_SOCKS_PORT.to_string()));
    }
}
