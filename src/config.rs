use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API key for the Gemini API (falls back to GEMINI_API_KEY env)
    pub api_key: Option<String>,

    /// Model to send completions to
    pub model: String,

    /// Base URL of the generative language API
    pub base_url: String,

    /// Request timeout for the completion call, in seconds
    pub request_timeout_secs: u64,

    /// Safety thresholds forwarded to the provider, one per harm category
    pub safety_settings: Vec<SafetySetting>,
}

/// One harm-category/threshold pair as the Gemini API expects it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_key: None,
            model: "gemini-1.5-pro-latest".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            request_timeout_secs: 300,
            safety_settings: default_safety_settings(),
        }
    }
}

/// The four standard harm categories, all set to BLOCK_NONE
fn default_safety_settings() -> Vec<SafetySetting> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .iter()
    .map(|category| SafetySetting {
        category: category.to_string(),
        threshold: "BLOCK_NONE".to_string(),
    })
    .collect()
}

impl Config {
    /// Load configuration from ~/.gemchat/config.toml, merged with the environment
    pub fn load() -> Result<Self> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        let config_path = home.join(".gemchat").join("config.toml");
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path (missing file yields defaults)
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .context("Failed to read config file")?;
            toml::from_str(&content)
                .context("Failed to parse config file")?
        } else {
            Config::default()
        };

        // Environment takes precedence over the file
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            config.api_key = Some(key);
        }

        Ok(config)
    }

    /// Save configuration to file
    #[allow(dead_code)]
    pub fn save(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        fs::write(config_path, content)
            .context("Failed to write config file")?;
        Ok(())
    }

    /// Check if an API key is available
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Get the API key, if configured
    pub fn get_api_key(&self) -> Option<String> {
        self.api_key.clone()
    }
}
