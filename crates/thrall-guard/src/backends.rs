use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::OnceCell;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thrall_config::{Backend, ModelDef};

/// The narrow contract the guard consumes: two strings in, raw model text
/// out. Implementations block; the evaluator runs them on a worker thread
/// and must never hand them any shared state.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn model_name(&self) -> &str;
    fn classify(&self, system_prompt: &str, user_text: &str) -> Result<String>;
}

/// Build a backend from a model descriptor. Secrets come through the
/// caller-supplied vault closure so this module never sees the host.
pub fn build_backend(
    def: &ModelDef,
    vault: &dyn Fn(&str) -> Option<String>,
) -> Result<Arc<dyn InferenceBackend>> {
    match def.backend {
        Backend::HttpChat => Ok(Arc::new(HttpChatBackend::new(def))),
        Backend::OpenAiChat => {
            let key_name = def
                .api_key_vault
                .as_deref()
                .ok_or_else(|| anyhow!("model `{}` has no api_key_vault", def.name))?;
            let api_key = vault(key_name)
                .ok_or_else(|| anyhow!("vault key `{}` for model `{}` is unset", key_name, def.name))?;
            Ok(Arc::new(OpenAiChatBackend::new(def, api_key)))
        }
    }
}

fn http_client(timeout_seconds: u64) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(concat!("thrall-guard/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(timeout_seconds.max(1)))
        .build()
        .context("failed to build inference http client")
}

/// Ollama-style `/api/chat` backend.
pub struct HttpChatBackend {
    url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout_seconds: u64,
    // built lazily on the worker thread; a blocking client must not be
    // constructed on the event loop
    client: OnceCell<reqwest::blocking::Client>,
}

impl HttpChatBackend {
    fn new(def: &ModelDef) -> Self {
        Self {
            url: def.url.trim_end_matches('/').to_string(),
            model: def.model.clone(),
            temperature: def.temperature,
            max_tokens: def.max_tokens,
            timeout_seconds: def.timeout_seconds,
            client: OnceCell::new(),
        }
    }
}

impl InferenceBackend for HttpChatBackend {
    fn name(&self) -> &'static str {
        "http-chat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn classify(&self, system_prompt: &str, user_text: &str) -> Result<String> {
        let client = self
            .client
            .get_or_try_init(|| http_client(self.timeout_seconds))?;
        let payload = json!({
            "model": self.model,
            "stream": false,
            "format": "json",
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_text},
            ],
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let resp = client
            .post(format!("{}/api/chat", self.url))
            .json(&payload)
            .send()
            .context("chat request failed")?;
        if !resp.status().is_success() {
            bail!("chat backend returned {}", resp.status());
        }
        let body: serde_json::Value = resp.json().context("chat response was not json")?;
        Ok(body
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

/// OpenAI-compatible `/chat/completions` backend.
pub struct OpenAiChatBackend {
    url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout_seconds: u64,
    api_key: String,
    client: OnceCell<reqwest::blocking::Client>,
}

impl OpenAiChatBackend {
    fn new(def: &ModelDef, api_key: String) -> Self {
        Self {
            url: def.url.trim_end_matches('/').to_string(),
            model: def.model.clone(),
            temperature: def.temperature,
            max_tokens: def.max_tokens,
            timeout_seconds: def.timeout_seconds,
            api_key,
            client: OnceCell::new(),
        }
    }
}

impl InferenceBackend for OpenAiChatBackend {
    fn name(&self) -> &'static str {
        "openai-chat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn classify(&self, system_prompt: &str, user_text: &str) -> Result<String> {
        let client = self
            .client
            .get_or_try_init(|| http_client(self.timeout_seconds))?;
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_text},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "response_format": {"type": "json_object"},
        });
        let resp = client
            .post(format!("{}/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .context("chat request failed")?;
        if !resp.status().is_success() {
            bail!("chat backend returned {}", resp.status());
        }
        let body: serde_json::Value = resp.json().context("chat response was not json")?;
        Ok(body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string())
    }
}
