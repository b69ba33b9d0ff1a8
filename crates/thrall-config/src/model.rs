use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Descriptor for a model reachable over the narrow
/// `classify(system, user) -> json` contract. Local in-process inference is
/// deliberately not a backend here; the runtime lives outside this crate.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDef {
    pub name: String,
    pub backend: Backend,
    pub url: String,
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Vault key holding the bearer token (openai-chat only).
    #[serde(default)]
    pub api_key_vault: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Backend {
    /// Ollama-style `/api/chat` endpoint.
    #[serde(rename = "http-chat")]
    HttpChat,
    /// OpenAI-compatible `/chat/completions` endpoint.
    #[serde(rename = "openai-chat")]
    OpenAiChat,
}

fn default_timeout() -> u64 {
    10
}

fn default_max_tokens() -> u32 {
    128
}

fn default_temperature() -> f32 {
    0.1
}

impl ModelDef {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model descriptor {}", path.display()))?;
        let model: ModelDef = toml::from_str(&raw)
            .with_context(|| format!("failed to parse model descriptor {}", path.display()))?;
        model
            .validate()
            .with_context(|| format!("invalid model descriptor {}", path.display()))?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("model name is empty");
        }
        if self.url.trim().is_empty() {
            bail!("model `{}` has no url", self.name);
        }
        if self.backend == Backend::OpenAiChat && self.api_key_vault.is_none() {
            bail!("model `{}` uses openai-chat without api_key_vault", self.name);
        }
        Ok(())
    }
}
