use crate::breakers::BreakerStore;
use crate::compile::CompileBuffers;
use crate::evaluator::Evaluator;
use crate::event_log::EventLog;
use crate::filter::FilterState;
use crate::host::HostContext;
use crate::loop_guard::{LoopGuard, ReplyRateLimit};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thrall_config::{prompt_hash, ConfigRegistry};
use thrall_kernel::Kernel;

/// Built-in triage prompt, seeded into the prompt table on first start so a
/// bare deployment classifies sensibly. Operators replace it through the
/// prompt-load skill or a prompts/ file.
pub const DEFAULT_TRIAGE_PROMPT: &str = r#"You classify inbound P2P messages. Reply with exactly one JSON object.
Valid actions: drop, wake, reply.
- drop: spam, noise, single-word messages, gibberish,
        AND acknowledgments ("got it", "thanks", "received", "logged",
        "noted", "will do", "cheers") -- these are terminal, no reply needed
- wake: legitimate questions, collaboration requests, technical discussions,
        explicit requests for action
- reply: simple greetings, status checks ("hello", "is your node online?")
Sender trust: {tier}. For unknown senders, prefer drop unless clearly legitimate.

Output format: {"action":"drop"|"wake"|"reply","reason":"brief explanation"}

Examples:
Message: "hey" -> {"action":"drop","reason":"single word, no content"}
Message: "Can you run digest-voice on this topic?" -> {"action":"wake","reason":"skill request"}
Message: "Hello, is your node online?" -> {"action":"reply","reason":"status check greeting"}
Message: "Thanks for the update!" -> {"action":"drop","reason":"acknowledgment, terminal"}
Message: "Received, logged it." -> {"action":"drop","reason":"ack, no reply needed"}

Message: {{envelope.body_text}}"#;

/// The prompt name the built-in mail-triage pipeline evaluates with.
pub const TRIAGE_PROMPT_NAME: &str = "triage";

#[derive(Clone)]
struct PromptOverride {
    content: String,
    hash: String,
    pushed_by: String,
}

/// Everything the pipeline stages share. Lives behind one Arc; in-flight
/// pipelines capture the registry Arc at entry so reloads never tear a run.
pub struct GuardState {
    pub host: Arc<dyn HostContext>,
    pub kernel: Kernel,
    registry: RwLock<Arc<ConfigRegistry>>,
    pub evaluator: Evaluator,
    pub filter: FilterState,
    pub loop_guard: Mutex<LoopGuard>,
    pub reply_rate: Mutex<ReplyRateLimit>,
    pub breakers: BreakerStore,
    pub buffers: CompileBuffers,
    pub event_log: EventLog,
    prompt_overrides: RwLock<HashMap<String, PromptOverride>>,
    shutting_down: AtomicBool,
    inflight: AtomicI64,
    pub last_prune: Mutex<f64>,
}

pub fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl GuardState {
    pub fn new(host: Arc<dyn HostContext>, registry: ConfigRegistry) -> Result<Self> {
        Self::with_evaluator(host, registry, Evaluator::new())
    }

    /// Build with a caller-supplied evaluator: the seam through which the
    /// host (or a test) provides the model runtime.
    pub fn with_evaluator(
        host: Arc<dyn HostContext>,
        registry: ConfigRegistry,
        evaluator: Evaluator,
    ) -> Result<Self> {
        let plugin_dir = host.plugin_dir().to_path_buf();
        let kernel = Kernel::open(&plugin_dir)?;
        let plugin = &registry.plugin;
        let loop_guard = LoopGuard::new(
            plugin.loop_threshold,
            plugin.loop_threshold_sessionless,
            plugin.reply_window_seconds,
            plugin.max_counter_entries,
        );
        let reply_rate = ReplyRateLimit::new(
            plugin.max_replies_per_hour_per_node,
            plugin.max_counter_entries,
        );
        let filter = FilterState::new(plugin.max_counter_entries);

        kernel.seed_prompt_if_absent(
            TRIAGE_PROMPT_NAME,
            DEFAULT_TRIAGE_PROMPT,
            &prompt_hash(DEFAULT_TRIAGE_PROMPT),
            "hardcoded",
        )?;

        let state = Self {
            kernel,
            registry: RwLock::new(Arc::new(registry)),
            evaluator,
            filter,
            loop_guard: Mutex::new(loop_guard),
            reply_rate: Mutex::new(reply_rate),
            breakers: BreakerStore::new(&plugin_dir),
            buffers: CompileBuffers::new(&plugin_dir),
            event_log: EventLog::new(&plugin_dir),
            prompt_overrides: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            inflight: AtomicI64::new(0),
            last_prune: Mutex::new(0.0),
            host,
        };
        state.refresh_prompt_overrides()?;
        Ok(state)
    }

    pub fn registry(&self) -> Arc<ConfigRegistry> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .clone()
    }

    /// Atomically install a freshly loaded registry. In-flight pipelines
    /// keep the snapshot they already captured.
    pub fn install_registry(&self, registry: ConfigRegistry) {
        {
            let mut guard = self.loop_guard.lock().expect("loop guard mutex poisoned");
            *guard = LoopGuard::new(
                registry.plugin.loop_threshold,
                registry.plugin.loop_threshold_sessionless,
                registry.plugin.reply_window_seconds,
                registry.plugin.max_counter_entries,
            );
        }
        {
            let mut rate = self.reply_rate.lock().expect("reply rate mutex poisoned");
            *rate = ReplyRateLimit::new(
                registry.plugin.max_replies_per_hour_per_node,
                registry.plugin.max_counter_entries,
            );
        }
        *self.registry.write().expect("registry lock poisoned") = Arc::new(registry);
    }

    /// Active prompt content + hash for a name. Operator pushes (stored in
    /// the DB with a real sender) win over file prompts; the hardcoded seed
    /// is only the last resort.
    pub fn prompt_for(&self, name: &str, registry: &ConfigRegistry) -> Option<(String, String)> {
        let overrides = self
            .prompt_overrides
            .read()
            .expect("prompt override lock poisoned");
        if let Some(o) = overrides.get(name) {
            if o.pushed_by != "hardcoded" {
                return Some((o.content.clone(), o.hash.clone()));
            }
        }
        if let Some(p) = registry.prompts.get(name) {
            return Some((p.template.clone(), p.hash.clone()));
        }
        overrides.get(name).map(|o| (o.content.clone(), o.hash.clone()))
    }

    /// Re-read active prompts from the DB. Called at startup and by the
    /// admin skill after a push.
    pub fn refresh_prompt_overrides(&self) -> Result<()> {
        let mut map = HashMap::new();
        for row in self.kernel.list_prompts()? {
            if row.active {
                map.insert(
                    row.name.clone(),
                    PromptOverride {
                        content: row.content,
                        hash: row.hash,
                        pushed_by: row.pushed_by,
                    },
                );
            }
        }
        *self
            .prompt_overrides
            .write()
            .expect("prompt override lock poisoned") = map;
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn enter_pipeline(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit_pipeline(&self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockHost;

    #[tokio::test]
    async fn seeds_default_prompt_on_first_open() {
        let host = MockHost::new();
        let state = GuardState::new(host.clone(), ConfigRegistry::default()).unwrap();
        let row = state.kernel.get_prompt(TRIAGE_PROMPT_NAME).unwrap().unwrap();
        assert_eq!(row.pushed_by, "hardcoded");
        assert_eq!(row.hash, prompt_hash(DEFAULT_TRIAGE_PROMPT));
        // the seed is visible as last-resort prompt
        let registry = state.registry();
        let (content, hash) = state.prompt_for(TRIAGE_PROMPT_NAME, &registry).unwrap();
        assert_eq!(content, DEFAULT_TRIAGE_PROMPT);
        assert_eq!(hash, prompt_hash(DEFAULT_TRIAGE_PROMPT));
    }

    #[tokio::test]
    async fn pushed_prompt_wins_over_seed() {
        let host = MockHost::new();
        let state = GuardState::new(host.clone(), ConfigRegistry::default()).unwrap();
        let pushed = "pushed {tier} {{envelope.body_text}}";
        state
            .kernel
            .upsert_prompt(TRIAGE_PROMPT_NAME, pushed, &prompt_hash(pushed), "ad8d21d81a497993")
            .unwrap();
        state.refresh_prompt_overrides().unwrap();
        let registry = state.registry();
        let (content, _) = state.prompt_for(TRIAGE_PROMPT_NAME, &registry).unwrap();
        assert_eq!(content, pushed);
    }
}
