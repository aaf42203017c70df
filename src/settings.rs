//! Application settings: `settings.json` in the config directory, then
//! `EDIT_BRIDGE_*` environment overrides, then validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bridge::codec::Framing;
use crate::bridge::CapabilitySet;
use crate::error::AppError;
use crate::project::{read_json, write_json, ProjectError};

// ── LLM provider types ──────────────────────────────────────────

/// Which LLM provider interprets free text when keyword matching fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmProvider {
    Anthropic,
    OpenAiCompatible,
}

/// Full configuration for the chosen LLM provider.
///
/// The `api_key` field is never written to `settings.json`. It is stored in a
/// separate credentials file and loaded/saved via [`load_api_key`]/[`save_api_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub provider: LlmProvider,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Base URL for OpenAI-compatible providers (ignored for Anthropic).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model override. None = use provider default.
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            api_key: None,
            base_url: None,
            model: None,
        }
    }
}

// ── App settings ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,
    /// Sampling temperature for the LLM interpreter, 0 to 1.
    pub temperature: f64,
    pub max_tokens: u32,
    /// Render feedback text after each applied command.
    pub feedback_enabled: bool,
    /// Allow `serve` / `connect`.
    pub protocol_enabled: bool,
    /// What the bridge offers during negotiation.
    pub capabilities: CapabilitySet,
    /// Top two intent confidences closer than this are ambiguous.
    pub ambiguity_tolerance: f64,
    pub call_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub framing: Framing,
    pub llm: Option<LlmProviderConfig>,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

const SETTINGS_VERSION: u32 = 1;

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            temperature: 0.7,
            max_tokens: 1024,
            feedback_enabled: true,
            protocol_enabled: true,
            capabilities: CapabilitySet::RESOURCES | CapabilitySet::TOOLS | CapabilitySet::PROMPTS,
            ambiguity_tolerance: 0.05,
            call_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
            framing: Framing::Lines,
            llm: None,
            log_level: "info".into(),
        }
    }
}

impl Settings {
    /// Read settings from `config_dir`, apply environment overrides and
    /// validate. A missing file yields the defaults.
    pub fn load(config_dir: &Path) -> Result<Self, AppError> {
        let mut settings = load_settings(config_dir)?.unwrap_or_default();
        settings.apply_env(|key| std::env::var(key).ok())?;
        if let Some(llm) = settings.llm.as_mut() {
            if llm.api_key.is_none() {
                llm.api_key = std::env::var("EDIT_BRIDGE_API_KEY")
                    .ok()
                    .filter(|k| !k.is_empty())
                    .or_else(|| load_api_key(config_dir));
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `EDIT_BRIDGE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AppError> {
            value.trim().parse().map_err(|_| AppError::Config {
                message: format!("{key}: cannot parse \"{value}\""),
            })
        }

        if let Some(v) = lookup("EDIT_BRIDGE_TEMPERATURE") {
            self.temperature = parse("EDIT_BRIDGE_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("EDIT_BRIDGE_MAX_TOKENS") {
            self.max_tokens = parse("EDIT_BRIDGE_MAX_TOKENS", &v)?;
        }
        if let Some(v) = lookup("EDIT_BRIDGE_FEEDBACK") {
            self.feedback_enabled = parse_flag("EDIT_BRIDGE_FEEDBACK", &v)?;
        }
        if let Some(v) = lookup("EDIT_BRIDGE_PROTOCOL") {
            self.protocol_enabled = parse_flag("EDIT_BRIDGE_PROTOCOL", &v)?;
        }
        if let Some(v) = lookup("EDIT_BRIDGE_CAPABILITIES") {
            self.capabilities = CapabilitySet::parse_tokens(v.split(','));
        }
        if let Some(v) = lookup("EDIT_BRIDGE_AMBIGUITY_TOLERANCE") {
            self.ambiguity_tolerance = parse("EDIT_BRIDGE_AMBIGUITY_TOLERANCE", &v)?;
        }
        if let Some(v) = lookup("EDIT_BRIDGE_CALL_TIMEOUT_MS") {
            self.call_timeout_ms = parse("EDIT_BRIDGE_CALL_TIMEOUT_MS", &v)?;
        }

        let provider = lookup("EDIT_BRIDGE_LLM_PROVIDER");
        let base_url = lookup("EDIT_BRIDGE_LLM_BASE_URL");
        let model = lookup("EDIT_BRIDGE_LLM_MODEL");
        if provider.is_some() || base_url.is_some() || model.is_some() {
            let llm = self.llm.get_or_insert_with(LlmProviderConfig::default);
            if let Some(p) = provider {
                llm.provider = match p.trim().to_ascii_lowercase().as_str() {
                    "anthropic" => LlmProvider::Anthropic,
                    "openai" | "openai-compatible" => LlmProvider::OpenAiCompatible,
                    other => {
                        return Err(AppError::Config {
                            message: format!("EDIT_BRIDGE_LLM_PROVIDER: unknown provider \"{other}\""),
                        })
                    }
                };
            }
            if base_url.is_some() {
                llm.base_url = base_url;
            }
            if model.is_some() {
                llm.model = model;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let fail = |message: String| Err(AppError::Config { message });
        if !(0.0..=1.0).contains(&self.temperature) {
            return fail(format!("temperature must be between 0 and 1, got {}", self.temperature));
        }
        if self.max_tokens == 0 {
            return fail("max_tokens must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.ambiguity_tolerance) {
            return fail(format!(
                "ambiguity_tolerance must be between 0 and 1, got {}",
                self.ambiguity_tolerance
            ));
        }
        if self.call_timeout_ms == 0 {
            return fail("call_timeout_ms must be greater than 0".into());
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, AppError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::Config {
            message: format!("{key}: expected a boolean, got \"{value}\""),
        }),
    }
}

/// Load the API key from the separate credentials file.
pub fn load_api_key(config_dir: &Path) -> Option<String> {
    let path = crate::paths::credentials_path(config_dir);
    std::fs::read_to_string(path)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

/// Save the API key to the separate credentials file (atomic write).
pub fn save_api_key(config_dir: &Path, key: &str) -> Result<(), ProjectError> {
    std::fs::create_dir_all(config_dir)?;
    let path = crate::paths::credentials_path(config_dir);
    if key.is_empty() {
        let _ = std::fs::remove_file(&path);
    } else {
        crate::project::atomic_write(&path, key.as_bytes())?;
    }
    Ok(())
}

/// Read `settings.json` without overrides. `None` when the file does not exist.
pub fn load_settings(config_dir: &Path) -> Result<Option<Settings>, AppError> {
    let path = crate::paths::settings_path(config_dir);
    if !path.exists() {
        return Ok(None);
    }
    read_json::<Settings>(&path)
        .map(Some)
        .map_err(|e| AppError::Config {
            message: format!("{}: {e}", path.display()),
        })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<(), ProjectError> {
    std::fs::create_dir_all(config_dir)?;
    write_json(&crate::paths::settings_path(config_dir), settings)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn settings_round_trip_without_api_key() {
        let dir = std::env::temp_dir().join("edit_bridge_test_settings");
        let _ = std::fs::remove_dir_all(&dir);

        let settings = Settings {
            llm: Some(LlmProviderConfig {
                api_key: Some("sk-secret".into()),
                ..LlmProviderConfig::default()
            }),
            ..Settings::default()
        };
        save_settings(&dir, &settings).unwrap();
        let raw = std::fs::read_to_string(crate::paths::settings_path(&dir)).unwrap();
        assert!(!raw.contains("sk-secret"));

        let loaded = load_settings(&dir).unwrap().unwrap();
        assert_eq!(loaded.llm.as_ref().unwrap().api_key, None);
        assert_eq!(loaded.call_timeout_ms, 30_000);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join("edit_bridge_test_settings_partial");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            crate::paths::settings_path(&dir),
            r#"{ "feedback_enabled": false, "capabilities": ["tools"] }"#,
        )
        .unwrap();

        let loaded = load_settings(&dir).unwrap().unwrap();
        assert!(!loaded.feedback_enabled);
        assert_eq!(loaded.capabilities, CapabilitySet::TOOLS);
        assert!((loaded.ambiguity_tolerance - 0.05).abs() < 1e-12);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = std::env::temp_dir().join("edit_bridge_test_no_settings");
        let _ = std::fs::remove_dir_all(&dir);
        assert!(load_settings(&dir).unwrap().is_none());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("EDIT_BRIDGE_FEEDBACK", "off"),
            ("EDIT_BRIDGE_CAPABILITIES", "tools, resources, telepathy"),
            ("EDIT_BRIDGE_CALL_TIMEOUT_MS", "250"),
            ("EDIT_BRIDGE_LLM_PROVIDER", "openai"),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::default();
        settings
            .apply_env(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert!(!settings.feedback_enabled);
        assert_eq!(settings.capabilities, CapabilitySet::TOOLS | CapabilitySet::RESOURCES);
        assert_eq!(settings.call_timeout_ms, 250);
        assert_eq!(settings.llm.unwrap().provider, LlmProvider::OpenAiCompatible);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(|k| (k == "EDIT_BRIDGE_MAX_TOKENS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, AppError::Config { .. }));

        settings.temperature = 1.5;
        assert!(matches!(settings.validate(), Err(AppError::Config { .. })));
    }
}
