use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

/// A named set of static field-regex rules. First matching rule wins and
/// short-circuits the language model entirely.
#[derive(Debug, Clone)]
pub struct HotwireSet {
    pub name: String,
    pub rules: Vec<HotwireRule>,
}

#[derive(Debug, Clone)]
pub struct HotwireRule {
    pub field: String,
    pub pattern: Regex,
    pub action: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HotwireFile {
    name: String,
    #[serde(default)]
    rules: Vec<HotwireRuleDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HotwireRuleDef {
    field: String,
    pattern: String,
    action: String,
    #[serde(default)]
    reason: Option<String>,
}

impl HotwireSet {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read hotwire set {}", path.display()))?;
        let file: HotwireFile = toml::from_str(&raw)
            .with_context(|| format!("failed to parse hotwire set {}", path.display()))?;
        if file.name.trim().is_empty() {
            bail!("hotwire set {} has an empty name", path.display());
        }
        let mut rules = Vec::with_capacity(file.rules.len());
        for (idx, def) in file.rules.into_iter().enumerate() {
            let pattern = Regex::new(&def.pattern).with_context(|| {
                format!(
                    "hotwire set `{}` rule {} has an invalid pattern",
                    file.name, idx
                )
            })?;
            let reason = def
                .reason
                .unwrap_or_else(|| format!("hotwire rule on {}", def.field));
            rules.push(HotwireRule {
                field: def.field,
                pattern,
                action: def.action,
                reason,
            });
        }
        Ok(Self {
            name: file.name,
            rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn load_set(content: &str) -> Result<HotwireSet> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spam.toml");
        std::fs::write(&path, content).unwrap();
        HotwireSet::load(&path)
    }

    #[test]
    fn load_rules_in_order() {
        let set = load_set(
            r#"
name = "spam-rules"

[[rules]]
field = "body_text"
pattern = "(?i)unsubscribe"
action = "drop"
reason = "list noise"

[[rules]]
field = "msg_type"
pattern = "^probe$"
action = "compile"
"#,
        )
        .unwrap();
        assert_eq!(set.rules.len(), 2);
        assert!(set.rules[0].pattern.is_match("UNSUBSCRIBE me"));
        assert_eq!(set.rules[1].reason, "hotwire rule on msg_type");
    }

    #[test]
    fn reject_invalid_regex() {
        let err = load_set(
            r#"
name = "bad"

[[rules]]
field = "body_text"
pattern = "(unclosed"
action = "drop"
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("invalid pattern"));
    }
}
