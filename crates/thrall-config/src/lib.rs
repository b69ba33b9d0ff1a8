mod hotwire;
mod model;
mod prompt;
mod recipe;

pub use hotwire::{HotwireRule, HotwireSet};
pub use model::{Backend, ModelDef};
pub use prompt::{prompt_hash, Prompt, BODY_PLACEHOLDER, TIER_BINDING};
pub use recipe::{ActionDef, Evaluate, FilterConfig, Mode, Recipe, Step, Trigger};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Settings from `plugin.toml`. Every knob has the documented default so an
/// absent file yields a working guard.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PluginConfig {
    pub enabled: bool,
    pub ignore_msg_types: Vec<String>,
    pub loop_threshold: u32,
    pub loop_threshold_sessionless: u32,
    pub knock_threshold: u32,
    pub classification_ttl_days: u32,
    pub queue_timeout: f64,
    pub inference_timeout: f64,
    pub action_timeout: f64,
    pub max_body_preview: usize,
    pub max_counter_entries: usize,
    pub reply_window_seconds: u64,
    pub prune_interval_seconds: u64,
    pub max_replies_per_hour_per_node: u32,
    pub trust: TrustTiers,
    pub cockpit: Option<CockpitConfig>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignore_msg_types: vec!["ack".into(), "delivery".into(), "system".into()],
            loop_threshold: 2,
            loop_threshold_sessionless: 5,
            knock_threshold: 10,
            classification_ttl_days: 30,
            queue_timeout: 5.0,
            inference_timeout: 20.0,
            action_timeout: 30.0,
            max_body_preview: 2000,
            max_counter_entries: 10_000,
            reply_window_seconds: 1800,
            prune_interval_seconds: 3600,
            max_replies_per_hour_per_node: 5,
            trust: TrustTiers::default(),
            cockpit: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrustTiers {
    pub team: Vec<String>,
    pub known: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CockpitConfig {
    pub url: String,
    pub token_vault_key: String,
}

impl TrustTiers {
    fn validate(&self) -> Result<()> {
        for (tier, prefixes) in [("team", &self.team), ("known", &self.known)] {
            for p in prefixes {
                if p.len() != 16 || !p.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
                    bail!("trust tier `{tier}` prefix `{p}` is not 16-char lowercase hex");
                }
            }
        }
        Ok(())
    }
}

/// Immutable snapshot of everything loaded from disk. Installed wholesale;
/// in-flight pipelines keep the Arc they captured at entry.
#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    pub plugin: PluginConfig,
    /// Lexical file-name order; the engine runs recipes in this order.
    pub recipes: Vec<Recipe>,
    pub prompts: HashMap<String, Prompt>,
    pub hotwires: HashMap<String, HotwireSet>,
    pub models: HashMap<String, ModelDef>,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self {
            plugin: PluginConfig::default(),
            recipes: Vec::new(),
            prompts: HashMap::new(),
            hotwires: HashMap::new(),
            models: HashMap::new(),
        }
    }
}

impl ConfigRegistry {
    /// Load `plugin.toml` plus the four config directories under `root`.
    /// Any invalid file fails the whole load; the caller keeps the previous
    /// registry on error.
    pub fn load(root: &Path) -> Result<Self> {
        let plugin = load_plugin_config(&root.join("plugin.toml"))?;
        plugin.trust.validate()?;

        let mut recipes = Vec::new();
        for path in sorted_toml_files(&root.join("recipes"))? {
            recipes.push(Recipe::load(&path)?);
        }

        let mut prompts = HashMap::new();
        for path in sorted_toml_files(&root.join("prompts"))? {
            let prompt = Prompt::load(&path)?;
            if prompts.insert(prompt.name.clone(), prompt).is_some() {
                bail!("duplicate prompt name in {}", path.display());
            }
        }

        let mut hotwires = HashMap::new();
        for path in sorted_toml_files(&root.join("hotwires"))? {
            let set = HotwireSet::load(&path)?;
            if hotwires.insert(set.name.clone(), set).is_some() {
                bail!("duplicate hotwire set name in {}", path.display());
            }
        }

        let mut models = HashMap::new();
        for path in sorted_toml_files(&root.join("models"))? {
            let model = ModelDef::load(&path)?;
            if models.insert(model.name.clone(), model).is_some() {
                bail!("duplicate model name in {}", path.display());
            }
        }

        let registry = Self {
            plugin,
            recipes,
            prompts,
            hotwires,
            models,
        };
        registry.validate_references()?;
        Ok(registry)
    }

    fn validate_references(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for recipe in &self.recipes {
            if !seen.insert(recipe.name.as_str()) {
                bail!("duplicate recipe name `{}`", recipe.name);
            }
            match &recipe.evaluate {
                Some(Evaluate::Llm { prompt, model, .. }) => {
                    if !self.prompts.contains_key(prompt) {
                        bail!(
                            "recipe `{}` references unknown prompt `{}`",
                            recipe.name,
                            prompt
                        );
                    }
                    if !self.models.contains_key(model) {
                        bail!(
                            "recipe `{}` references unknown model `{}`",
                            recipe.name,
                            model
                        );
                    }
                }
                Some(Evaluate::Hotwire { rules, .. }) => {
                    if !self.hotwires.contains_key(rules) {
                        bail!(
                            "recipe `{}` references unknown hotwire set `{}`",
                            recipe.name,
                            rules
                        );
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    pub fn recipe(&self, name: &str) -> Option<&Recipe> {
        self.recipes.iter().find(|r| r.name == name)
    }
}

fn load_plugin_config(path: &Path) -> Result<PluginConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "plugin.toml absent; using defaults");
        return Ok(PluginConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn sorted_toml_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("toml") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn seed_valid(root: &Path) {
        write(
            root,
            "plugin.toml",
            r#"
loop_threshold = 3

[trust]
team = ["ad8d21d81a497993"]
known = ["6f5185865618575f"]
"#,
        );
        write(
            root,
            "recipes/02-triage.toml",
            r#"
name = "mail-triage"
mode = "automated"

[trigger]
type = "on_mail"

[evaluate]
type = "llm"
prompt = "triage"
model = "edge"
fallback_action = "drop"

[actions.drop]
steps = [{ type = "drop" }]

[actions.wake]
steps = [{ type = "summon" }]
"#,
        );
        write(
            root,
            "recipes/01-hotwire.toml",
            r#"
name = "spam-gate"

[trigger]
type = "on_mail"

[evaluate]
type = "hotwire"
rules = "spam-rules"
default_action = "pass"

[actions.pass]
steps = [{ type = "log", message = "no hotwire hit" }]
"#,
        );
        write(
            root,
            "prompts/triage.toml",
            r#"
name = "triage"
template = "Trust: {tier}. Message: {{envelope.body_text}}"
"#,
        );
        write(
            root,
            "hotwires/spam.toml",
            r#"
name = "spam-rules"

[[rules]]
field = "body_text"
pattern = "(?i)unsubscribe"
action = "drop"
"#,
        );
        write(
            root,
            "models/edge.toml",
            r#"
name = "edge"
backend = "http-chat"
url = "http://localhost:11434"
model = "gemma3:1b"
"#,
        );
    }

    #[test]
    fn load_full_registry_in_file_order() {
        let dir = tempdir().unwrap();
        seed_valid(dir.path());
        let registry = ConfigRegistry::load(dir.path()).unwrap();
        assert_eq!(registry.plugin.loop_threshold, 3);
        // unset knobs keep their defaults
        assert_eq!(registry.plugin.knock_threshold, 10);
        let names: Vec<_> = registry.recipes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["spam-gate", "mail-triage"]);
        assert!(registry.prompts.contains_key("triage"));
        assert!(registry.models.contains_key("edge"));
    }

    #[test]
    fn defaults_without_plugin_toml() {
        let dir = tempdir().unwrap();
        let registry = ConfigRegistry::load(dir.path()).unwrap();
        assert!(registry.plugin.enabled);
        assert_eq!(registry.plugin.queue_timeout, 5.0);
        assert_eq!(registry.plugin.max_counter_entries, 10_000);
        assert!(registry.recipes.is_empty());
    }

    #[test]
    fn reject_bad_trust_prefix() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "plugin.toml",
            "[trust]\nteam = [\"NOT-HEX-AT-ALL!\"]\n",
        );
        let err = ConfigRegistry::load(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("lowercase hex"));
    }

    #[test]
    fn reject_dangling_prompt_reference() {
        let dir = tempdir().unwrap();
        seed_valid(dir.path());
        std::fs::remove_file(dir.path().join("prompts/triage.toml")).unwrap();
        let err = ConfigRegistry::load(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("unknown prompt `triage`"));
    }

    #[test]
    fn reject_duplicate_recipe_names() {
        let dir = tempdir().unwrap();
        seed_valid(dir.path());
        let dup = std::fs::read_to_string(dir.path().join("recipes/02-triage.toml")).unwrap();
        write(dir.path(), "recipes/03-copy.toml", &dup);
        let err = ConfigRegistry::load(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate recipe name"));
    }
}
