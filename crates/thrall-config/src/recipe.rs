use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// One pipeline recipe: trigger match, filter config, evaluate spec, and the
/// named actions its steps can select.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: Mode,
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub filter: FilterConfig,
    pub evaluate: Option<Evaluate>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionDef>,
    /// Set from the file name at load time; recipes run in lexical file order.
    #[serde(skip)]
    pub source_file: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Manual,
    #[default]
    Supervised,
    Automated,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Manual => "manual",
            Mode::Supervised => "supervised",
            Mode::Automated => "automated",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Trigger {
    /// Mail arrival. Empty `msg_types` matches every type.
    OnMail {
        #[serde(default)]
        msg_types: Vec<String>,
    },
    /// Periodic host tick.
    OnTick,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub trust_bypass: bool,
    pub bypass_action: Option<String>,
    pub cooldown_key: Option<String>,
    pub cooldown_seconds: Option<u64>,
    pub rate_limit_max: Option<u32>,
    #[serde(default = "default_rate_window")]
    pub rate_limit_window: u64,
    pub rate_limit_action: Option<String>,
    /// Seconds a cached eval result stays valid; 0 or absent disables caching.
    #[serde(default)]
    pub cache_ttl: u64,
    #[serde(default)]
    pub context_stitch: bool,
}

fn default_rate_window() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Evaluate {
    Llm {
        prompt: String,
        model: String,
        fallback_action: String,
    },
    Hotwire {
        rules: String,
        default_action: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionDef {
    pub steps: Vec<Step>,
}

/// One executable step inside a named action.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    Log {
        message: String,
    },
    Drop,
    Compile {
        buffer: String,
        #[serde(default)]
        summon_threshold: Option<u32>,
        #[serde(default)]
        summon_keywords: Vec<String>,
        #[serde(default)]
        flush_after_seconds: Option<u64>,
    },
    #[serde(alias = "wake")]
    Summon,
    Reply {
        #[serde(default = "default_reply_type")]
        msg_type: String,
        template: String,
    },
    Act {
        skill: String,
        #[serde(default)]
        input: BTreeMap<String, String>,
        #[serde(default)]
        error_buffer: Option<String>,
    },
    SetContext {
        key: String,
        value: String,
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
    ClearContext,
    SetFlag {
        key: String,
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
    Trigger {
        msg_type: String,
        #[serde(default)]
        body: Option<String>,
    },
}

fn default_reply_type() -> String {
    "text".to_string()
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read recipe {}", path.display()))?;
        let mut recipe: Recipe = toml::from_str(&raw)
            .with_context(|| format!("failed to parse recipe {}", path.display()))?;
        recipe.source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        recipe
            .validate()
            .with_context(|| format!("invalid recipe {}", path.display()))?;
        Ok(recipe)
    }

    /// Structural checks beyond what serde enforces. Referenced prompt /
    /// model / rule names are checked registry-wide by the loader.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("recipe name is empty");
        }
        if self.trigger.is_none() {
            bail!("recipe `{}` is missing [trigger]", self.name);
        }
        for action in [
            self.filter.bypass_action.as_deref(),
            self.filter.rate_limit_action.as_deref(),
            self.fallback_action(),
        ]
        .into_iter()
        .flatten()
        {
            if !self.actions.contains_key(action) {
                bail!(
                    "recipe `{}` references undeclared action `{}`",
                    self.name,
                    action
                );
            }
        }
        if self.filter.trust_bypass && self.filter.bypass_action.is_none() {
            bail!(
                "recipe `{}` sets trust_bypass without a bypass_action",
                self.name
            );
        }
        if self.filter.rate_limit_max.is_some() && self.filter.rate_limit_action.is_none() {
            bail!(
                "recipe `{}` sets rate_limit_max without a rate_limit_action",
                self.name
            );
        }
        if let Some(Evaluate::Hotwire { default_action, .. }) = &self.evaluate {
            if !self.actions.contains_key(default_action) {
                bail!(
                    "recipe `{}` hotwire default_action `{}` is undeclared",
                    self.name,
                    default_action
                );
            }
        }
        Ok(())
    }

    pub fn fallback_action(&self) -> Option<&str> {
        match &self.evaluate {
            Some(Evaluate::Llm {
                fallback_action, ..
            }) => Some(fallback_action),
            _ => None,
        }
    }

    pub fn matches_mail(&self, msg_type: &str) -> bool {
        matches!(&self.trigger, Some(Trigger::OnMail { msg_types })
            if msg_types.is_empty() || msg_types.iter().any(|t| t == msg_type))
    }

    pub fn matches_tick(&self) -> bool {
        matches!(&self.trigger, Some(Trigger::OnTick))
    }
}
