//! Settings module for runtime configuration.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Split the layer MLPs into this many row chunks to lower peak memory.
    pub save_peak_mem_factor: Option<usize>,

    /// Keep the training rows' representation between calls so test rows can
    /// be evaluated later without resending the training set.
    pub cache_trainset_representation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub inference: InferenceSettings,
}

impl Settings {
    /// Load settings from an optional `tabpfn.{toml,json,yaml}` file and
    /// `TABPFN_` prefixed environment variables, e.g.
    /// `TABPFN_INFERENCE__SAVE_PEAK_MEM_FACTOR=4`.
    pub fn new() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .set_default("inference.cache_trainset_representation", false)?
            .add_source(File::with_name("tabpfn").required(false))
            .add_source(
                Environment::with_prefix("TABPFN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}

/// Global settings instance
static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Get the global settings instance, initializing it if necessary.
pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| {
        Settings::new().unwrap_or_else(|err| {
            log::warn!("falling back to default settings: {err}");
            Settings::default()
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.inference.save_peak_mem_factor, None);
        assert!(!settings.inference.cache_trainset_representation);
    }

    #[test]
    fn test_settings_new_with_defaults() {
        // No settings file and no TABPFN_ variables in the test environment.
        let settings = Settings::new().expect("defaults alone must deserialize");
        assert_eq!(settings.inference.save_peak_mem_factor, None);
    }

    #[test]
    fn test_settings_serialization() {
        let mut settings = Settings::default();
        settings.inference.save_peak_mem_factor = Some(8);

        let json = serde_json::to_string(&settings).expect("Should serialize to JSON");
        assert!(json.contains("save_peak_mem_factor"));
        assert!(json.contains("cache_trainset_representation"));

        let deserialized: Settings =
            serde_json::from_str(&json).expect("Should deserialize from JSON");
        assert_eq!(deserialized, settings);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"inference": {}}"#).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
