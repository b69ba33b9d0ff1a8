use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Placeholder every classification prompt must reference unless it opts out.
pub const BODY_PLACEHOLDER: &str = "{{envelope.body_text}}";

/// Binding substituted with the resolved trust tier at prompt-assembly time.
pub const TIER_BINDING: &str = "{tier}";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prompt {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Model descriptor this prompt is tuned for.
    pub model: Option<String>,
    pub template: String,
    /// Opt-out for prompts that intentionally classify without the body
    /// (tick-driven recipes, aggregate prompts).
    #[serde(default)]
    pub allow_missing_body: bool,
    #[serde(skip)]
    pub hash: String,
}

fn default_version() -> u32 {
    1
}

/// SHA-256 of the template text, truncated to 16 hex chars. Journal rows
/// record this so classifications stay attributable after prompt pushes.
pub fn prompt_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

impl Prompt {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt {}", path.display()))?;
        let mut prompt: Prompt = toml::from_str(&raw)
            .with_context(|| format!("failed to parse prompt {}", path.display()))?;
        prompt
            .validate()
            .with_context(|| format!("invalid prompt {}", path.display()))?;
        prompt.hash = prompt_hash(&prompt.template);
        Ok(prompt)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("prompt name is empty");
        }
        if self.template.trim().is_empty() {
            bail!("prompt `{}` template is empty", self.name);
        }
        if !self.template.contains(BODY_PLACEHOLDER) && !self.allow_missing_body {
            bail!(
                "prompt `{}` does not reference {} (set allow_missing_body to opt out)",
                self.name,
                BODY_PLACEHOLDER
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn load_prompt(content: &str) -> Result<Prompt> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("triage.toml");
        std::fs::write(&path, content).unwrap();
        Prompt::load(&path)
    }

    #[test]
    fn hash_is_truncated_sha256() {
        let h = prompt_hash("classify this");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, prompt_hash("classify this"));
        assert_ne!(h, prompt_hash("classify that"));
    }

    #[test]
    fn load_and_hash() {
        let prompt = load_prompt(
            r#"
name = "triage"
version = 2
template = "Sender trust: {tier}. Message: {{envelope.body_text}}"
"#,
        )
        .unwrap();
        assert_eq!(prompt.version, 2);
        assert_eq!(prompt.hash, prompt_hash(&prompt.template));
    }

    #[test]
    fn reject_template_without_body_placeholder() {
        let err = load_prompt(
            r#"
name = "triage"
template = "Sender trust: {tier}."
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("allow_missing_body"));
    }

    #[test]
    fn opt_out_allows_bodyless_template() {
        let prompt = load_prompt(
            r#"
name = "errorlog"
template = "Summarize: {{context.recent_errors}}"
allow_missing_body = true
"#,
        )
        .unwrap();
        assert_eq!(prompt.name, "errorlog");
    }
}
