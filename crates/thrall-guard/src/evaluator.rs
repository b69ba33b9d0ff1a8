use crate::backends::{build_backend, InferenceBackend};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use thrall_config::ModelDef;

const MAX_REASON: usize = 200;
const MAX_RAW: usize = 1000;

pub type VaultFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
pub type BackendFactory =
    Arc<dyn Fn(&ModelDef, &VaultFn) -> anyhow::Result<Arc<dyn InferenceBackend>> + Send + Sync>;

/// What one evaluation attempt produced. The engine maps everything that is
/// not `Result` onto the recipe's fallback action.
#[derive(Debug, Clone)]
pub enum EvalOutcome {
    /// Parsed JSON object with at least an `action` string.
    Result { value: JsonValue, raw: String },
    /// The single inference slot stayed busy past `queue_timeout`.
    QueueFull,
    /// Backend construction failed earlier; latched until restart.
    Unhealthy { reason: String },
    /// Inference ran but produced nothing usable.
    Failed { reason: String, raw: Option<String> },
}

enum BackendSlot {
    Ready(Arc<dyn InferenceBackend>),
    Failed(String),
}

/// Owns the model lifecycle and serializes inference.
///
/// One permit guards the call: the underlying runtime is not thread-safe,
/// so no second inference may start while one is executing. A waiter that
/// times out falls through to the recipe's fallback; the permit itself is
/// released only when the worker thread finishes, even if the awaiting task
/// gave up.
pub struct Evaluator {
    gate: Arc<Semaphore>,
    backends: Mutex<HashMap<String, BackendSlot>>,
    factory: BackendFactory,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Remove fenced code markers some models wrap around their JSON.
fn strip_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

impl Evaluator {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(|def, vault| {
            let vault = vault.clone();
            build_backend(def, &move |key: &str| (vault.as_ref())(key))
        }))
    }

    /// Inject a backend factory (tests use a scripted backend).
    pub fn with_factory(factory: BackendFactory) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
            backends: Mutex::new(HashMap::new()),
            factory,
        }
    }

    /// True once the named model's backend failed to construct.
    pub fn is_unhealthy(&self, model: &str) -> bool {
        matches!(
            self.backends
                .lock()
                .expect("backend map mutex poisoned")
                .get(model),
            Some(BackendSlot::Failed(_))
        )
    }

    fn ensure_backend(
        &self,
        def: &ModelDef,
        vault: &VaultFn,
    ) -> Result<Arc<dyn InferenceBackend>, String> {
        let mut backends = self.backends.lock().expect("backend map mutex poisoned");
        match backends.get(&def.name) {
            Some(BackendSlot::Ready(backend)) => return Ok(backend.clone()),
            Some(BackendSlot::Failed(reason)) => return Err(reason.clone()),
            None => {}
        }
        match (self.factory.as_ref())(def, vault) {
            Ok(backend) => {
                backends.insert(def.name.clone(), BackendSlot::Ready(backend.clone()));
                Ok(backend)
            }
            Err(err) => {
                let reason = truncate_chars(&format!("{err:#}"), MAX_REASON);
                tracing::warn!(model = %def.name, %reason, "inference backend failed to initialize");
                backends.insert(def.name.clone(), BackendSlot::Failed(reason.clone()));
                Err(reason)
            }
        }
    }

    /// Run one classification. `system_prompt` is fully resolved; `user_text`
    /// is the (already truncated) message body. The worker thread sees only
    /// these two strings.
    pub async fn classify(
        &self,
        def: &ModelDef,
        vault: VaultFn,
        system_prompt: String,
        user_text: String,
        queue_timeout: Duration,
        inference_timeout: Duration,
    ) -> EvalOutcome {
        let backend = match self.ensure_backend(def, &vault) {
            Ok(backend) => backend,
            Err(reason) => return EvalOutcome::Unhealthy { reason },
        };

        let permit = match tokio::time::timeout(queue_timeout, self.gate.clone().acquire_owned())
            .await
        {
            Err(_) => return EvalOutcome::QueueFull,
            Ok(Err(_)) => {
                return EvalOutcome::Failed {
                    reason: "inference gate closed".into(),
                    raw: None,
                }
            }
            Ok(Ok(permit)) => permit,
        };

        let handle = tokio::task::spawn_blocking(move || {
            // the permit rides along so a timed-out waiter cannot start a
            // second inference while this one is still executing
            let _permit = permit;
            backend.classify(&system_prompt, &user_text)
        });

        let raw = match tokio::time::timeout(inference_timeout, handle).await {
            Err(_) => {
                return EvalOutcome::Failed {
                    reason: "inference timeout".into(),
                    raw: None,
                }
            }
            Ok(Err(join_err)) => {
                return EvalOutcome::Failed {
                    reason: truncate_chars(&format!("inference worker died: {join_err}"), MAX_REASON),
                    raw: None,
                }
            }
            Ok(Ok(Err(backend_err))) => {
                return EvalOutcome::Failed {
                    reason: truncate_chars(&format!("backend error: {backend_err:#}"), MAX_REASON),
                    raw: None,
                }
            }
            Ok(Ok(Ok(raw))) => raw,
        };

        let cleaned = strip_fences(&raw);
        let raw_preview = truncate_chars(&raw, MAX_RAW);
        match serde_json::from_str::<JsonValue>(&cleaned) {
            Ok(value) if value.get("action").and_then(|a| a.as_str()).is_some() => {
                EvalOutcome::Result {
                    value,
                    raw: raw_preview,
                }
            }
            Ok(_) => EvalOutcome::Failed {
                reason: "response json has no action field".into(),
                raw: Some(raw_preview),
            },
            Err(err) => EvalOutcome::Failed {
                reason: truncate_chars(&format!("malformed json: {err}"), MAX_REASON),
                raw: Some(raw_preview),
            },
        }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        response: String,
        delay: Duration,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl InferenceBackend for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn classify(&self, _system: &str, _user: &str) -> anyhow::Result<String> {
            let n = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(n, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.response == "ERR" {
                bail!("scripted failure");
            }
            Ok(self.response.clone())
        }
    }

    fn model_def() -> ModelDef {
        toml::from_str(
            "name = \"edge\"\nbackend = \"http-chat\"\nurl = \"http://x\"\nmodel = \"m\"\n",
        )
        .unwrap()
    }

    fn scripted_evaluator(response: &str, delay: Duration) -> (Evaluator, Arc<AtomicUsize>) {
        let response = response.to_string();
        let max_active = Arc::new(AtomicUsize::new(0));
        let max_clone = max_active.clone();
        let active = Arc::new(AtomicUsize::new(0));
        let evaluator = Evaluator::with_factory(Arc::new(move |_, _| {
            Ok(Arc::new(Scripted {
                response: response.clone(),
                delay,
                active: active.clone(),
                max_active: max_clone.clone(),
            }) as Arc<dyn InferenceBackend>)
        }));
        (evaluator, max_active)
    }

    fn no_vault() -> VaultFn {
        Arc::new(|_| None)
    }

    #[tokio::test]
    async fn parses_clean_json() {
        let (evaluator, _) = scripted_evaluator(
            r#"{"action": "wake", "reason": "skill request"}"#,
            Duration::ZERO,
        );
        let outcome = evaluator
            .classify(
                &model_def(),
                no_vault(),
                "sys".into(),
                "user".into(),
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .await;
        match outcome {
            EvalOutcome::Result { value, .. } => assert_eq!(value["action"], "wake"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn strips_code_fences() {
        let (evaluator, _) = scripted_evaluator(
            "```json\n{\"action\": \"drop\", \"reason\": \"noise\"}\n```",
            Duration::ZERO,
        );
        let outcome = evaluator
            .classify(
                &model_def(),
                no_vault(),
                "sys".into(),
                "user".into(),
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(outcome, EvalOutcome::Result { value, .. } if value["action"] == "drop"));
    }

    #[tokio::test]
    async fn malformed_json_reports_parser_error() {
        let (evaluator, _) = scripted_evaluator("not json at all", Duration::ZERO);
        let outcome = evaluator
            .classify(
                &model_def(),
                no_vault(),
                "sys".into(),
                "user".into(),
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .await;
        match outcome {
            EvalOutcome::Failed { reason, raw } => {
                assert!(reason.starts_with("malformed json"));
                assert!(reason.len() <= MAX_REASON + 20);
                assert_eq!(raw.as_deref(), Some("not json at all"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_caller_times_out_in_queue() {
        let (evaluator, max_active) = scripted_evaluator(
            r#"{"action": "wake", "reason": "ok"}"#,
            Duration::from_millis(300),
        );
        let evaluator = Arc::new(evaluator);
        let def = model_def();

        let first = {
            let evaluator = evaluator.clone();
            let def = def.clone();
            tokio::spawn(async move {
                evaluator
                    .classify(
                        &def,
                        no_vault(),
                        "sys".into(),
                        "user".into(),
                        Duration::from_millis(50),
                        Duration::from_secs(2),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = evaluator
            .classify(
                &def,
                no_vault(),
                "sys".into(),
                "user".into(),
                Duration::from_millis(50),
                Duration::from_secs(2),
            )
            .await;
        assert!(matches!(second, EvalOutcome::QueueFull));
        assert!(matches!(
            first.await.unwrap(),
            EvalOutcome::Result { .. }
        ));
        // never more than one inference executing
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_error_maps_to_failed() {
        let (evaluator, _) = scripted_evaluator("ERR", Duration::ZERO);
        let outcome = evaluator
            .classify(
                &model_def(),
                no_vault(),
                "sys".into(),
                "user".into(),
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .await;
        assert!(
            matches!(outcome, EvalOutcome::Failed { ref reason, .. } if reason.contains("scripted failure"))
        );
    }

    #[tokio::test]
    async fn failed_load_latches_unhealthy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let evaluator = Evaluator::with_factory(Arc::new(move |_, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            bail!("no such model file")
        }));
        for _ in 0..3 {
            let outcome = evaluator
                .classify(
                    &model_def(),
                    no_vault(),
                    "sys".into(),
                    "user".into(),
                    Duration::from_secs(1),
                    Duration::from_secs(1),
                )
                .await;
            assert!(matches!(outcome, EvalOutcome::Unhealthy { .. }));
        }
        // load attempted once, then latched
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(evaluator.is_unhealthy("edge"));
    }
}
