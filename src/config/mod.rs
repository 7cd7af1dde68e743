use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LineConfig {
    pub enabled: bool,
    pub socket_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Limits applied to every session in the room.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub history_limit: usize,
    pub max_message_chars: usize,
    pub outbound_queue_capacity: usize,
    /// Seconds a peer may stay silent before it is dropped. Zero disables the deadline.
    pub idle_timeout_secs: u64,
}

impl ChatConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: 5,
            max_message_chars: 574,
            outbound_queue_capacity: 64,
            idle_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RateConfig {
    pub threshold: u32,
    pub cooldown_secs: u64,
    pub persist_across_sessions: bool,
}

impl RateConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown_secs: 5,
            persist_across_sessions: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub line: LineConfig,
    pub websocket: WebSocketConfig,
    pub chat: ChatConfig,
    pub rate: RateConfig,
    pub cors: CorsConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        Self::with_defaults(Config::builder(), "development")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // E.g., `APP_CHAT__HISTORY_LIMIT=10` would set `Settings.chat.history_limit`
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?
            .try_deserialize()
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        Self::with_defaults(Config::builder(), "test")?
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?
            .try_deserialize()
    }

    fn with_defaults(
        builder: ConfigBuilder<DefaultState>,
        environment: &str,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let chat = ChatConfig::default();
        let rate = RateConfig::default();

        builder
            .set_default("environment", environment)?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.http_port", 8081)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("line.enabled", true)?
            .set_default("line.socket_path", "/tmp/go-server.sock")?
            .set_default("websocket.enabled", true)?
            .set_default("websocket.port", 8080)?
            .set_default("chat.history_limit", chat.history_limit as i64)?
            .set_default("chat.max_message_chars", chat.max_message_chars as i64)?
            .set_default("chat.outbound_queue_capacity", chat.outbound_queue_capacity as i64)?
            .set_default("chat.idle_timeout_secs", chat.idle_timeout_secs as i64)?
            .set_default("rate.threshold", rate.threshold as i64)?
            .set_default("rate.cooldown_secs", rate.cooldown_secs as i64)?
            .set_default("rate.persist_across_sessions", rate.persist_across_sessions)?
            .set_default("cors.enabled", true)?
            .set_default("cors.allow_any_origin", false)?
            .set_default("cors.max_age", 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn cleanup_env() {
        env::remove_var("APP_WEBSOCKET__PORT");
        env::remove_var("APP_CHAT__HISTORY_LIMIT");
        env::remove_var("APP_RATE__PERSIST_ACROSS_SESSIONS");
    }

    // Defaults and overrides share one test so the env mutations never race.
    #[test]
    fn test_settings_defaults_and_environment_override() {
        cleanup_env();
        let settings = Settings::new_for_test().expect("Failed to load settings");
        assert_eq!(settings.environment, "test");
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.workers as usize, num_cpus::get());
        assert_eq!(settings.line.socket_path, "/tmp/go-server.sock");
        assert_eq!(settings.websocket.port, 8080);
        assert_eq!(settings.chat, ChatConfig::default());
        assert_eq!(settings.rate, RateConfig::default());
        assert_eq!(settings.rate.cooldown(), Duration::from_secs(5));

        env::set_var("APP_WEBSOCKET__PORT", "9000");
        env::set_var("APP_CHAT__HISTORY_LIMIT", "10");
        env::set_var("APP_RATE__PERSIST_ACROSS_SESSIONS", "true");

        let settings = Settings::new_for_test().expect("Failed to load settings");
        assert_eq!(settings.websocket.port, 9000);
        assert_eq!(settings.chat.history_limit, 10);
        assert!(settings.rate.persist_across_sessions);

        cleanup_env();
    }

    #[test]
    fn test_idle_timeout_disabled_at_zero() {
        let chat = ChatConfig { idle_timeout_secs: 0, ..ChatConfig::default() };
        assert_eq!(chat.idle_timeout(), None);
        assert_eq!(ChatConfig::default().idle_timeout(), Some(Duration::from_secs(600)));
    }
}
