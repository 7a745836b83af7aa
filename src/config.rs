use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ProxyError;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub port: u16,
    #[serde(default, rename = "healthPort")]
    pub health_port: u16,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default, rename = "type")]
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    #[serde(alias = "")]
    Console,
    Json,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RouteConfig {
    pub forward: String,
    pub provider: String,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelConfig {
    #[serde(default, rename = "maxQueueSize")]
    pub max_queue_size: usize,
    /// Upper bound in seconds on how long a queued request may wait for
    /// capacity before it is shed.
    #[serde(default, rename = "maxQueueWait")]
    pub max_queue_wait: f64,
    #[serde(default)]
    pub rpm: f64,
    #[serde(default)]
    pub tpm: f64,
    /// Accepted for forward compatibility; no scheduler consumes it yet.
    #[serde(default)]
    pub cpm: f64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ProxyError::Config(format!("failed to read config file {}: {err}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|err| {
            ProxyError::Config(format!("failed to parse config file {}: {err}", path.display()))
        })?;
        Ok(config.with_defaults())
    }

    fn with_defaults(mut self) -> Self {
        if self.app.port == 0 {
            self.app.port = 8080;
        }
        if self.app.health_port == 0 {
            self.app.health_port = 8081;
        }
        if self.logging.level.is_empty() {
            self.logging.level = "info".to_string();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, contents: &str) -> std::path::PathBuf {
        let path = dir.join("config.json");
        std::fs::write(&path, contents).expect("write config");
        path
    }

    #[test]
    fn loads_full_config() {
        let dir = std::env::temp_dir().join("llproxy-config-test-full");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = write_config(
            &dir,
            r#"{
                "routes": {
                    "route1": {
                        "forward": "http://forward1.com",
                        "provider": "provider1",
                        "models": {
                            "model1": {
                                "maxQueueSize": 100,
                                "maxQueueWait": 1.5,
                                "rpm": 1000,
                                "tpm": 10000,
                                "cpm": 100000
                            }
                        }
                    }
                }
            }"#,
        );

        let config = Config::load(&path).expect("load config");

        let route1 = config.routes.get("route1").expect("route1");
        assert_eq!(route1.forward, "http://forward1.com");
        assert_eq!(route1.provider, "provider1");

        let model1 = route1.models.get("model1").expect("model1");
        assert_eq!(model1.max_queue_size, 100);
        assert_eq!(model1.max_queue_wait, 1.5);
        assert_eq!(model1.rpm, 1000.0);
        assert_eq!(model1.tpm, 10000.0);
        assert_eq!(model1.cpm, 100000.0);

        // Defaults for absent sections.
        assert_eq!(config.app.port, 8080);
        assert_eq!(config.app.health_port, 8081);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Console);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::load(Path::new("/nonexistent/llproxy.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let dir = std::env::temp_dir().join("llproxy-config-test-bad");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = write_config(&dir, "{not json");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }

    #[test]
    fn unknown_log_format_fails_to_parse() {
        let dir = std::env::temp_dir().join("llproxy-config-test-log");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = write_config(&dir, r#"{"logging": {"type": "syslog"}}"#);
        assert!(Config::load(&path).is_err());
    }
}
