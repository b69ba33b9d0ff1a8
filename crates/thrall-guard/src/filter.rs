use crate::breakers::BreakerStore;
use crate::envelope::Envelope;
use crate::event_log::EventLog;
use crate::trust::TrustTier;
use moka::sync::Cache;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thrall_config::Recipe;
use thrall_kernel::Kernel;

/// What the filter stage decided for one recipe run.
#[derive(Debug, Clone)]
pub enum FilterDecision {
    Pass,
    /// Pass with a cached eval result; the evaluate stage is skipped.
    CacheHit { result: JsonValue },
    Drop { reason: String },
    Bypass { action: String, reason: String },
}

pub struct FilterOutcome {
    pub decision: FilterDecision,
    pub filter_json: JsonValue,
    /// Context rows stitched in for the session, exposed as `{{context.*}}`.
    pub context: BTreeMap<String, String>,
    /// Cache key for write-back after a live evaluation.
    pub cache_key: Option<String>,
}

#[derive(Clone)]
struct CachedEval {
    result: JsonValue,
    stored_at: Instant,
    ttl: Duration,
}

/// In-memory filter state. Everything here is read and written on the event
/// loop with no await between the read and the dependent write.
pub struct FilterState {
    rate: Mutex<HashMap<String, Vec<f64>>>,
    cache: Cache<String, CachedEval>,
    max_entries: usize,
}

impl FilterState {
    pub fn new(max_entries: usize) -> Self {
        Self {
            rate: Mutex::new(HashMap::new()),
            cache: Cache::builder()
                .max_capacity(2048)
                .time_to_live(Duration::from_secs(3600))
                .build(),
            max_entries,
        }
    }

    /// Window check without recording, for dryrun replays: reports whether
    /// recording one more event would exceed `max`.
    pub fn peek_rate(&self, prefix: &str, max: u32, window_secs: u64, now: f64) -> bool {
        let rate = self.rate.lock().expect("rate map mutex poisoned");
        let len = rate
            .get(prefix)
            .map(|window| window.iter().filter(|t| now - **t < window_secs as f64).count())
            .unwrap_or(0);
        len + 1 > max as usize
    }

    /// Record one event for the sender and report whether the window now
    /// exceeds `max`. The event is recorded regardless of the outcome.
    pub fn record_and_check_rate(&self, prefix: &str, max: u32, window_secs: u64, now: f64) -> bool {
        let mut rate = self.rate.lock().expect("rate map mutex poisoned");
        let window = rate.entry(prefix.to_string()).or_default();
        window.retain(|t| now - *t < window_secs as f64);
        window.push(now);
        let exceeded = window.len() > max as usize;
        if rate.len() > self.max_entries {
            // evict the entry with the stalest latest event
            if let Some(key) = rate
                .iter()
                .min_by(|a, b| {
                    let la = a.1.last().copied().unwrap_or(0.0);
                    let lb = b.1.last().copied().unwrap_or(0.0);
                    la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(k, _)| k.clone())
            {
                rate.remove(&key);
            }
        }
        exceeded
    }

    pub fn cache_get(&self, key: &str, ttl: Duration) -> Option<JsonValue> {
        let entry = self.cache.get(key)?;
        let effective = entry.ttl.min(ttl);
        if entry.stored_at.elapsed() < effective {
            Some(entry.result)
        } else {
            None
        }
    }

    pub fn cache_put(&self, key: String, result: JsonValue, ttl: Duration) {
        self.cache.insert(
            key,
            CachedEval {
                result,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drop empty rate windows. Runs on the prune tick.
    pub fn prune(&self, now: f64, window_secs: u64) {
        let mut rate = self.rate.lock().expect("rate map mutex poisoned");
        rate.retain(|_, window| {
            window.retain(|t| now - *t < window_secs as f64);
            !window.is_empty()
        });
    }
}

pub fn cache_key(prompt_hash: &str, tier: TrustTier, body_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body_text.as_bytes());
    let body_hash = hex::encode(hasher.finalize());
    format!("{}:{}:{}", prompt_hash, tier.as_str(), &body_hash[..16])
}

pub struct FilterInput<'a> {
    pub recipe: &'a Recipe,
    pub envelope: &'a Envelope,
    pub tier: TrustTier,
    pub prefix: Option<&'a str>,
    pub prompt_hash: Option<&'a str>,
    pub breakers: &'a BreakerStore,
    pub kernel: &'a Kernel,
    pub state: &'a FilterState,
    pub log: &'a EventLog,
    pub now: f64,
    /// Replay mode: read every gate, mutate nothing.
    pub dryrun: bool,
}

/// Run the fixed-order filter checks; first match wins.
pub fn run(input: FilterInput<'_>) -> FilterOutcome {
    let cfg = &input.recipe.filter;
    let tier_str = input.tier.as_str();
    let mut filter_json = json!({ "tier": tier_str, "decision": "pass" });
    let mut context = BTreeMap::new();
    let mut cache_key_out = None;

    // 1. breaker
    if let Some(prefix) = input.prefix {
        if let Some(breaker) = input.breakers.check(prefix, input.log) {
            filter_json["decision"] = json!("drop");
            filter_json["reason"] = json!("breaker_active");
            filter_json["breaker_target"] = json!(breaker.target);
            return FilterOutcome {
                decision: FilterDecision::Drop {
                    reason: "breaker_active".into(),
                },
                filter_json,
                context,
                cache_key: None,
            };
        }
    }

    // 2. trust bypass
    if cfg.trust_bypass && input.tier == TrustTier::Team {
        if let Some(action) = &cfg.bypass_action {
            filter_json["decision"] = json!("bypass");
            filter_json["reason"] = json!("team bypass");
            return FilterOutcome {
                decision: FilterDecision::Bypass {
                    action: action.clone(),
                    reason: "team bypass".into(),
                },
                filter_json,
                context,
                cache_key: None,
            };
        }
    }

    // 3. cooldown
    if let Some(key) = &cfg.cooldown_key {
        if input.kernel.flag_active(key).unwrap_or(false) {
            filter_json["decision"] = json!("drop");
            filter_json["reason"] = json!("cooldown");
            return FilterOutcome {
                decision: FilterDecision::Drop {
                    reason: "cooldown".into(),
                },
                filter_json,
                context,
                cache_key: None,
            };
        }
    }

    // 4. rate limit
    if let (Some(max), Some(prefix)) = (cfg.rate_limit_max, input.prefix) {
        let exceeded = if input.dryrun {
            input
                .state
                .peek_rate(prefix, max, cfg.rate_limit_window, input.now)
        } else {
            input
                .state
                .record_and_check_rate(prefix, max, cfg.rate_limit_window, input.now)
        };
        if exceeded {
            let action = cfg
                .rate_limit_action
                .clone()
                .unwrap_or_else(|| "drop".into());
            filter_json["decision"] = json!("bypass");
            filter_json["reason"] = json!("rate limit");
            return FilterOutcome {
                decision: FilterDecision::Bypass {
                    action,
                    reason: "rate limit".into(),
                },
                filter_json,
                context,
                cache_key: None,
            };
        }
    }

    // 5. eval cache
    if cfg.cache_ttl > 0 {
        if let Some(prompt_hash) = input.prompt_hash {
            let key = cache_key(prompt_hash, input.tier, input.envelope.body_text());
            let ttl = Duration::from_secs(cfg.cache_ttl);
            if let Some(result) = input.state.cache_get(&key, ttl) {
                filter_json["cache_hit"] = json!(true);
                return FilterOutcome {
                    decision: FilterDecision::CacheHit { result },
                    filter_json,
                    context,
                    cache_key: Some(key),
                };
            }
            cache_key_out = Some(key);
        }
    }

    // A passing envelope arms the declarative cooldown so the next one
    // inside the window drops at step 3.
    if !input.dryrun {
        if let (Some(key), Some(secs)) = (&cfg.cooldown_key, cfg.cooldown_seconds) {
            let _ = input
                .kernel
                .set_flag(key, "1", Some(input.now + secs as f64));
        }
    }

    // 6. context stitch
    if cfg.context_stitch {
        if let Some(session_id) = input.envelope.session_id() {
            if let Ok(rows) = input.kernel.session_context(session_id) {
                for row in rows {
                    context.insert(row.key, row.value);
                }
            }
            filter_json["stitched"] = json!(context.len());
        }
    }

    FilterOutcome {
        decision: FilterDecision::Pass,
        filter_json,
        context,
        cache_key: cache_key_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json as j;
    use tempfile::tempdir;

    fn recipe(filter_toml: &str) -> Recipe {
        let raw = format!(
            r#"
name = "t"

[trigger]
type = "on_mail"

{filter_toml}

[actions.wake]
steps = [{{ type = "summon" }}]

[actions.slow]
steps = [{{ type = "drop" }}]
"#
        );
        toml::from_str(&raw).unwrap()
    }

    fn mail(body: &str) -> Envelope {
        Envelope::from_mail(
            "text",
            &"6f5185865618575f".to_string().repeat(4),
            &"cd".repeat(32),
            j!({ "content": body }),
            Some("sess-A".into()),
            2000,
        )
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        kernel: Kernel,
        breakers: BreakerStore,
        state: FilterState,
        log: EventLog,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let breakers = BreakerStore::new(dir.path());
        let log = EventLog::new(dir.path());
        Fixture {
            kernel,
            breakers,
            state: FilterState::new(100),
            log,
            _dir: dir,
        }
    }

    fn run_with<'a>(fx: &'a Fixture, recipe: &'a Recipe, env: &'a Envelope, tier: TrustTier) -> FilterOutcome {
        run(FilterInput {
            recipe,
            envelope: env,
            tier,
            prefix: Some("6f5185865618575f"),
            prompt_hash: Some("abcdef0123456789"),
            breakers: &fx.breakers,
            kernel: &fx.kernel,
            state: &fx.state,
            log: &fx.log,
            now: crate::state::now_ts(),
            dryrun: false,
        })
    }

    #[test]
    fn breaker_wins_over_everything() {
        let fx = fixture();
        fx.breakers
            .trip("node", "6f5185865618575f", "loop", 3600, &fx.log)
            .unwrap();
        let r = recipe("[filter]\ntrust_bypass = true\nbypass_action = \"wake\"");
        let out = run_with(&fx, &r, &mail("hi"), TrustTier::Team);
        assert!(matches!(out.decision, FilterDecision::Drop { ref reason } if reason == "breaker_active"));
    }

    #[test]
    fn team_bypass_routes_to_action() {
        let fx = fixture();
        let r = recipe("[filter]\ntrust_bypass = true\nbypass_action = \"wake\"");
        let out = run_with(&fx, &r, &mail("hi"), TrustTier::Team);
        assert!(matches!(out.decision, FilterDecision::Bypass { ref action, .. } if action == "wake"));
        // known tier does not bypass
        let out = run_with(&fx, &r, &mail("hi"), TrustTier::Known);
        assert!(matches!(out.decision, FilterDecision::Pass));
    }

    #[test]
    fn cooldown_drops_until_flag_expires() {
        let fx = fixture();
        let r = recipe("[filter]\ncooldown_key = \"triage-cool\"");
        fx.kernel.set_flag("triage-cool", "1", None).unwrap();
        let out = run_with(&fx, &r, &mail("hi"), TrustTier::Known);
        assert!(matches!(out.decision, FilterDecision::Drop { ref reason } if reason == "cooldown"));
    }

    #[test]
    fn declarative_cooldown_arms_on_pass() {
        let fx = fixture();
        let r = recipe("[filter]\ncooldown_key = \"triage-cool\"\ncooldown_seconds = 60");
        let out = run_with(&fx, &r, &mail("first"), TrustTier::Known);
        assert!(matches!(out.decision, FilterDecision::Pass));
        let out = run_with(&fx, &r, &mail("second"), TrustTier::Known);
        assert!(matches!(out.decision, FilterDecision::Drop { ref reason } if reason == "cooldown"));
    }

    #[test]
    fn rate_limit_records_then_bypasses() {
        let fx = fixture();
        let r = recipe("[filter]\nrate_limit_max = 2\nrate_limit_action = \"slow\"");
        let env = mail("hi");
        for _ in 0..2 {
            let out = run_with(&fx, &r, &env, TrustTier::Known);
            assert!(matches!(out.decision, FilterDecision::Pass));
        }
        let out = run_with(&fx, &r, &env, TrustTier::Known);
        assert!(matches!(out.decision, FilterDecision::Bypass { ref action, .. } if action == "slow"));
    }

    #[test]
    fn cache_hit_skips_evaluation() {
        let fx = fixture();
        let r = recipe("[filter]\ncache_ttl = 600");
        let env = mail("same body");
        let first = run_with(&fx, &r, &env, TrustTier::Known);
        let key = match first.decision {
            FilterDecision::Pass => first.cache_key.expect("cache key on pass"),
            other => panic!("unexpected: {other:?}"),
        };
        fx.state
            .cache_put(key, j!({"action": "drop", "reason": "noise"}), Duration::from_secs(600));
        let second = run_with(&fx, &r, &env, TrustTier::Known);
        match second.decision {
            FilterDecision::CacheHit { result } => assert_eq!(result["action"], "drop"),
            other => panic!("unexpected: {other:?}"),
        }
        // different tier misses the cache
        let third = run_with(&fx, &r, &env, TrustTier::Unknown);
        assert!(matches!(third.decision, FilterDecision::Pass));
    }

    #[test]
    fn context_stitch_injects_session_rows() {
        let fx = fixture();
        let r = recipe("[filter]\ncontext_stitch = true");
        fx.kernel
            .upsert_context("sess-A", "topic", "digests", None)
            .unwrap();
        fx.kernel
            .upsert_context("sess-B", "topic", "other", None)
            .unwrap();
        let out = run_with(&fx, &r, &mail("hi"), TrustTier::Known);
        assert_eq!(out.context.get("topic").map(String::as_str), Some("digests"));
        assert_eq!(out.context.len(), 1);
    }

    #[test]
    fn rate_map_stays_bounded() {
        let state = FilterState::new(10);
        for i in 0..50 {
            let prefix = format!("{i:016x}");
            state.record_and_check_rate(&prefix, 5, 3600, 1_000.0 + i as f64);
        }
        assert!(state.rate.lock().unwrap().len() <= 11);
    }
}
