use crate::admin;
use crate::engine;
use crate::envelope::Envelope;
use crate::host::{HostContext, TickInfo};
use crate::state::{now_ts, GuardState};
use crate::trust;
use crate::watcher;
use anyhow::Result;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thrall_config::ConfigRegistry;
use tracing::info;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(15);

/// The guard's hook surface. The host plugin framework calls
/// [`on_mail_received`](Self::on_mail_received) before delivering mail to
/// the agent, [`on_tick`](Self::on_tick) periodically, and
/// [`on_shutdown`](Self::on_shutdown) once at teardown.
pub struct ThrallGuard {
    state: Arc<GuardState>,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ThrallGuard {
    /// Load configuration from the plugin directory and start the guard,
    /// including the reload watcher.
    pub fn start(host: Arc<dyn HostContext>) -> Result<Self> {
        let registry = ConfigRegistry::load(host.plugin_dir())?;
        Self::start_with(host, registry, true)
    }

    /// Start with an explicit registry; tests pass `watch = false`.
    pub fn start_with(
        host: Arc<dyn HostContext>,
        registry: ConfigRegistry,
        watch: bool,
    ) -> Result<Self> {
        Self::start_with_evaluator(host, registry, crate::Evaluator::new(), watch)
    }

    /// Start with an explicit registry and evaluator (the model-runtime
    /// seam).
    pub fn start_with_evaluator(
        host: Arc<dyn HostContext>,
        registry: ConfigRegistry,
        evaluator: crate::Evaluator,
        watch: bool,
    ) -> Result<Self> {
        let recipes = registry.recipes.len();
        let state = Arc::new(GuardState::with_evaluator(host, registry, evaluator)?);
        let watcher = watch.then(|| watcher::start(state.clone()));
        info!(recipes, "thrall guard initialized");
        Ok(Self {
            state,
            watcher: Mutex::new(watcher),
        })
    }

    pub fn state(&self) -> &Arc<GuardState> {
        &self.state
    }

    /// Classify one inbound mail. Invalid sender ids, own-node mail, and
    /// ignored message types are screened out before the pipeline runs.
    pub async fn on_mail_received(
        &self,
        msg_type: &str,
        from_node: &str,
        to_node: &str,
        body: JsonValue,
        session_id: Option<String>,
    ) {
        let registry = self.state.registry();
        if !registry.plugin.enabled || self.state.is_shutting_down() {
            return;
        }

        let Some(prefix) = trust::sanitize_prefix(from_node) else {
            let shown: String = from_node.chars().take(20).collect();
            self.state
                .event_log
                .record("SKIP_INVALID", &shown, "non-hex node ID");
            return;
        };
        if from_node == self.state.host.node_id() {
            return;
        }
        let msg_type = if msg_type.is_empty() { "text" } else { msg_type };
        if registry
            .plugin
            .ignore_msg_types
            .iter()
            .any(|t| t == msg_type)
        {
            return;
        }

        let session_id = session_id.unwrap_or_else(|| format!("resp:{prefix}"));
        let envelope = Envelope::from_mail(
            msg_type,
            from_node,
            to_node,
            body,
            Some(session_id),
            registry.plugin.max_body_preview,
        );
        if envelope.body_text().trim().is_empty() {
            return;
        }

        self.state.enter_pipeline();
        engine::run_trigger(&self.state, envelope, 0).await;
        self.state.exit_pipeline();
    }

    /// Periodic tick: runs on-tick recipes, flushes aged compile buffers,
    /// and prunes stores at most once per `prune_interval`.
    pub async fn on_tick(&self, info: TickInfo) {
        let registry = self.state.registry();
        if !registry.plugin.enabled || self.state.is_shutting_down() {
            return;
        }

        let envelope = Envelope::from_tick(info.tick, info.peer_count, info.uptime_s);
        self.state.enter_pipeline();
        engine::run_trigger(&self.state, envelope, 0).await;
        self.state.exit_pipeline();

        for flush in self.state.buffers.flush_due(now_ts()) {
            self.state.event_log.record(
                "COMPILE_FLUSH",
                "-",
                &format!("buffer={} entries={} trigger={}", flush.buffer, flush.entries, flush.trigger),
            );
        }

        let now = now_ts();
        let due = {
            let last = self.state.last_prune.lock().expect("prune mutex poisoned");
            now - *last >= registry.plugin.prune_interval_seconds as f64
        };
        if due {
            self.prune(now);
        }
    }

    fn prune(&self, now: f64) {
        match self.state.kernel.prune_journal(now) {
            Ok(0) => {}
            Ok(n) => self
                .state
                .event_log
                .record("PRUNE", "-", &format!("removed {n} expired journal rows")),
            Err(err) => tracing::warn!(%err, "journal prune failed"),
        }
        if let Err(err) = self.state.kernel.prune_context(now) {
            tracing::warn!(%err, "context prune failed");
        }
        self.state.breakers.prune(&self.state.event_log);
        self.state.filter.prune(now, 3600);
        self.state
            .loop_guard
            .lock()
            .expect("loop guard mutex poisoned")
            .prune(now);
        self.state
            .reply_rate
            .lock()
            .expect("reply rate mutex poisoned")
            .prune(now);
        *self.state.last_prune.lock().expect("prune mutex poisoned") = now;
    }

    /// Record an outbound send so the sender's replies in this session count
    /// as solicited. The responder plugin must call this; without it every
    /// reply uses the base loop threshold.
    pub fn record_send(&self, to_node: &str, session_id: &str) {
        let Some(prefix) = trust::sanitize_prefix(to_node) else {
            return;
        };
        self.state
            .loop_guard
            .lock()
            .expect("loop guard mutex poisoned")
            .record_send(&prefix, session_id, now_ts());
    }

    /// Entry point for the operator-only `prompt-load` skill.
    pub async fn prompt_load(&self, input: JsonValue) -> JsonValue {
        admin::handle(&self.state, &input).await
    }

    /// Dryrun a journaled envelope through the current pipeline.
    pub async fn replay(&self, journal_id: i64) -> Result<JsonValue> {
        engine::replay(&self.state, journal_id).await
    }

    /// Stop accepting envelopes, wait for in-flight pipelines to reach
    /// their journal write, flush buffers, and stop the watcher.
    pub async fn on_shutdown(&self) {
        self.state.begin_shutdown();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        while self.state.inflight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if let Some(handle) = self.watcher.lock().expect("watcher mutex poisoned").take() {
            handle.abort();
        }
        self.state.buffers.flush_all();
        info!("thrall guard shut down");
    }
}
