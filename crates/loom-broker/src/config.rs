use std::env;

/// Broker connection configuration.
///
/// Reads `REDIS_HOST`, `REDIS_PORT`, and `REDIS_PASSWORD` from the
/// environment, falling back to `localhost`, `6379`, and an empty password
/// respectively when unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl BrokerConfig {
    pub const DEFAULT_HOST: &str = "localhost";
    pub const DEFAULT_PORT: u16 = 6379;

    /// Build a config purely from the environment.
    pub fn from_env() -> Self {
        let host = env::var("REDIS_HOST").unwrap_or_else(|_| Self::DEFAULT_HOST.to_owned());
        let port = env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(Self::DEFAULT_PORT);
        let password = env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty());
        Self {
            host,
            port,
            password,
        }
    }

    /// Resolve configuration using the chain: CLI flag > env var > default.
    ///
    /// Each `cli_*` argument, when `Some`, wins outright over both the
    /// environment and the built-in default for that field.
    pub fn resolve(
        cli_host: Option<&str>,
        cli_port: Option<u16>,
        cli_password: Option<&str>,
    ) -> Self {
        let env = Self::from_env();
        Self {
            host: cli_host.map(str::to_owned).unwrap_or(env.host),
            port: cli_port.unwrap_or(env.port),
            password: cli_password
                .map(str::to_owned)
                .or(env.password),
        }
    }

    /// Build a config from explicit values (useful for tests).
    pub fn new(host: impl Into<String>, port: u16, password: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password,
        }
    }

    /// The `redis://` connection URL for this configuration.
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{pw}@{}:{}", self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_localhost() {
        let cfg = BrokerConfig::new(BrokerConfig::DEFAULT_HOST, BrokerConfig::DEFAULT_PORT, None);
        assert_eq!(cfg.redis_url(), "redis://localhost:6379");
    }

    #[test]
    fn redis_url_includes_password_when_set() {
        let cfg = BrokerConfig::new("localhost", 6379, Some("secret".to_string()));
        assert_eq!(cfg.redis_url(), "redis://:secret@localhost:6379");
    }

    #[test]
    fn resolve_cli_flag_overrides_everything() {
        let cfg = BrokerConfig::resolve(Some("cli-host"), Some(1234), Some("cli-pass"));
        assert_eq!(cfg.host, "cli-host");
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.password.as_deref(), Some("cli-pass"));
    }

    #[test]
    fn resolve_falls_back_to_defaults_when_nothing_set() {
        // SAFETY: test-only env mutation, no concurrent access to these keys
        // elsewhere in this crate's test binary.
        unsafe {
            env::remove_var("REDIS_HOST");
            env::remove_var("REDIS_PORT");
            env::remove_var("REDIS_PASSWORD");
        }
        let cfg = BrokerConfig::resolve(None, None, None);
        assert_eq!(cfg.host, BrokerConfig::DEFAULT_HOST);
        assert_eq!(cfg.port, BrokerConfig::DEFAULT_PORT);
        assert_eq!(cfg.password, None);
    }
}
