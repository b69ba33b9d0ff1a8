//! Fixtures shared by unit and integration tests: an in-memory host, a
//! scripted inference backend, and config builders.

use crate::backends::InferenceBackend;
use crate::host::{HostContext, OutboundMail};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thrall_config::ConfigRegistry;

/// Host double backed by a temp directory. Captures outbound mail instead
/// of sending it.
pub struct MockHost {
    node_id: String,
    dir: tempfile::TempDir,
    sent: Mutex<Vec<OutboundMail>>,
    fail_sends: AtomicBool,
    vault: Mutex<HashMap<String, String>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Self::with_node_id(&"aa".repeat(32))
    }

    pub fn with_node_id(node_id: &str) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.to_string(),
            dir: tempfile::tempdir().expect("temp plugin dir"),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            vault: Mutex::new(HashMap::new()),
        })
    }

    pub fn sent(&self) -> Vec<OutboundMail> {
        self.sent.lock().expect("sent mail mutex poisoned").clone()
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn set_vault(&self, key: &str, value: &str) {
        self.vault
            .lock()
            .expect("vault mutex poisoned")
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl HostContext for MockHost {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn plugin_dir(&self) -> &Path {
        self.dir.path()
    }

    async fn send_mail(&self, mail: OutboundMail) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("send_mail disabled by test");
        }
        self.sent.lock().expect("sent mail mutex poisoned").push(mail);
        Ok(())
    }

    fn vault_get(&self, key: &str) -> Option<String> {
        self.vault
            .lock()
            .expect("vault mutex poisoned")
            .get(key)
            .cloned()
    }
}

/// Backend returning a fixed response after an optional delay. `"ERR"`
/// makes it fail; anything else is returned verbatim.
pub struct ScriptedBackend {
    pub response: String,
    pub delay: Duration,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    fn classify(&self, _system_prompt: &str, _user_text: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.response == "ERR" {
            bail!("scripted backend failure");
        }
        Ok(self.response.clone())
    }
}

/// Registry with a single on-mail recipe named `t` whose [actions] blocks
/// come from `actions_toml`. The recipe evaluates nothing; tests exercising
/// evaluation build full config trees with [`write_config_tree`].
pub fn registry_with_recipe(actions_toml: &str) -> ConfigRegistry {
    let raw = format!(
        r#"
name = "t"

[trigger]
type = "on_mail"

{actions_toml}
"#
    );
    let recipe: thrall_config::Recipe = toml::from_str(&raw).expect("test recipe parses");
    ConfigRegistry {
        recipes: vec![recipe],
        ..ConfigRegistry::default()
    }
}

/// Write a config tree under `root` and load it. `files` maps relative
/// paths (e.g. `recipes/02-triage.toml`) to contents.
pub fn write_config_tree(root: &Path, files: &[(&str, &str)]) -> ConfigRegistry {
    for (rel, content) in files {
        let path: PathBuf = root.join(rel);
        std::fs::create_dir_all(path.parent().expect("config parent")).expect("mkdir");
        std::fs::write(path, content).expect("write config file");
    }
    ConfigRegistry::load(root).expect("test config tree loads")
}
