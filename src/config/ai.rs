// src/config/ai.rs
use serde::{Deserialize, Serialize};

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_daily_limit() -> u32 {
    200
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "openai" | "mock" | "disabled" (case-insensitive)
    #[serde(default = "default_provider")]
    pub provider: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            api_key: String::new(),
            model: default_model(),
            api_base: default_api_base(),
            daily_limit: default_daily_limit(),
        }
    }
}

impl EnrichmentConfig {
    /// Normalize provider name and resolve an "ENV" api key.
    pub fn resolve(&mut self) -> anyhow::Result<()> {
        self.provider = self.provider.trim().to_lowercase();
        if self.provider == "openai" {
            self.api_key = super::resolve_secret(&self.api_key, "OPENAI_API_KEY")?;
        }
        Ok(())
    }

    /// Provider-level problems; empty when usable.
    pub fn problems(&self) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        match self.provider.as_str() {
            "openai" if self.api_key.trim().is_empty() => {
                vec!["enrichment.api_key is required for provider openai".into()]
            }
            "openai" | "mock" | "disabled" => Vec::new(),
            other => vec![format!("unsupported enrichment provider: {other}")],
        }
    }
}
