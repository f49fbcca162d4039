use crate::reassembly::{DEFAULT_HANDOFF_CAPACITY, DEFAULT_WINDOW};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub reassembly: ReassemblyConfig,
    pub dispatcher: DispatcherConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Widest span of sequence space buffered ahead of the expected byte.
    pub window: u32,
    /// Drained chunks queued for the reader before the writer waits.
    pub handoff_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub service_port: u16,
    pub capture_response: bool,
    pub announce_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            service_port: 50051,
            capture_response: true,
            announce_capacity: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&content)?;
        log::info!("Loaded configuration from {:?}", path.as_ref());
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(&path, content)?;
        log::info!("Saved configuration to {:?}", path.as_ref());
        Ok(())
    }

    /// Override fields from `REPLAY_CORE_*` environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn load_from_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(window) = var("REPLAY_CORE_WINDOW") {
            match window.parse::<u32>() {
                Ok(window) => self.reassembly.window = window,
                Err(_) => log::warn!("Ignoring invalid REPLAY_CORE_WINDOW: {}", window),
            }
        }

        if let Some(port) = var("REPLAY_CORE_SERVICE_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.dispatcher.service_port = port,
                Err(_) => log::warn!("Ignoring invalid REPLAY_CORE_SERVICE_PORT: {}", port),
            }
        }

        if let Some(capture) = var("REPLAY_CORE_CAPTURE_RESPONSE") {
            match capture.parse::<bool>() {
                Ok(capture) => self.dispatcher.capture_response = capture,
                Err(_) => log::warn!("Ignoring invalid REPLAY_CORE_CAPTURE_RESPONSE: {}", capture),
            }
        }

        if let Some(level) = var("REPLAY_CORE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.reassembly.window == 0 {
            errors.push("Reassembly window cannot be 0".to_string());
        }

        if self.reassembly.handoff_capacity == 0 {
            errors.push("Hand-off queue capacity cannot be 0".to_string());
        }

        if self.dispatcher.queue_capacity == 0 {
            errors.push("Packet queue capacity cannot be 0".to_string());
        }

        if self.dispatcher.announce_capacity == 0 {
            errors.push("Announcement queue capacity cannot be 0".to_string());
        }

        if self.dispatcher.service_port == 0 {
            errors.push("Service port cannot be 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            errors.push(format!(
                "Invalid log level: {}. Valid levels are: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.reassembly.window, 65536);
        assert_eq!(config.dispatcher.service_port, 50051);
        assert!(config.dispatcher.capture_response);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CoreConfig::default();

        config.reassembly.window = 0;
        config.dispatcher.service_port = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);

        let mut config = CoreConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("REPLAY_CORE_WINDOW", "10000"),
            ("REPLAY_CORE_SERVICE_PORT", "not-a-port"),
            ("REPLAY_CORE_CAPTURE_RESPONSE", "false"),
            ("REPLAY_CORE_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = CoreConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.reassembly.window, 10000);
        assert_eq!(config.dispatcher.service_port, 50051);
        assert!(!config.dispatcher.capture_response);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"dispatcher": {"service_port": 9000}}"#).unwrap();
        assert_eq!(config.dispatcher.service_port, 9000);
        assert_eq!(config.dispatcher.queue_capacity, 4096);
        assert_eq!(config.reassembly.window, 65536);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("replay-core-config-{}.json", std::process::id()));
        let mut config = CoreConfig::default();
        config.reassembly.handoff_capacity = 8;

        config.save_to_file(&path).unwrap();
        let loaded = CoreConfig::load_from_file(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.reassembly.handoff_capacity, 8);
        assert!(CoreConfig::load_from_file(&path).is_err());
    }
}
