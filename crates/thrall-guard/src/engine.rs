use crate::actions::{self, ActionInput};
use crate::envelope::{Envelope, TriggerKind};
use crate::evaluator::EvalOutcome;
use crate::filter::{self, FilterDecision, FilterInput};
use crate::hotwire;
use crate::state::{now_ts, GuardState};
use crate::templates::{self, TemplateCtx};
use crate::trust::{self, TrustTier};
use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thrall_config::{ConfigRegistry, Evaluate, Mode, Recipe, Step};
use thrall_kernel::JournalAppend;

/// Synthetic `trigger` steps may re-enter the engine this many times.
const MAX_TRIGGER_DEPTH: u8 = 3;

/// Bodies are clipped to this many chars before they reach the model.
const MAX_EVAL_BODY: usize = 800;

const BREAKER_EXPIRE_SECS: u64 = 3600;
const KNOCK_FLAG_TTL_SECS: f64 = 3600.0;

/// Dispatch one envelope through every matching recipe, sequentially and in
/// lexical recipe-file order so journal interleaving stays deterministic.
pub async fn run_trigger(state: &Arc<GuardState>, envelope: Envelope, depth: u8) {
    let registry = state.registry();
    for recipe in &registry.recipes {
        if !recipe.enabled {
            continue;
        }
        let matches = match envelope.kind() {
            TriggerKind::OnMail => recipe.matches_mail(envelope.msg_type().unwrap_or("text")),
            TriggerKind::OnTick => recipe.matches_tick(),
        };
        if !matches {
            continue;
        }
        run_recipe(state, &registry, recipe, &envelope, depth).await;
    }
}

struct RecipeRun {
    filter_json: JsonValue,
    eval_type: &'static str,
    eval_result: JsonValue,
    action_name: String,
    action_trace: JsonValue,
    synthetic: Vec<actions::SyntheticTrigger>,
}

async fn run_recipe(
    state: &Arc<GuardState>,
    registry: &Arc<ConfigRegistry>,
    recipe: &Recipe,
    envelope: &Envelope,
    depth: u8,
) {
    let prefix = envelope.from_node().and_then(trust::sanitize_prefix);

    // Pre-gate: an active breaker suppresses all further work, including
    // any model call, until it expires.
    if let Some(prefix) = &prefix {
        if let Some(breaker) = state.breakers.check(prefix, &state.event_log) {
            state.event_log.record(
                "BREAKER_BLOCKED",
                prefix,
                &format!("breaker={}: {}", breaker.target, breaker.reason),
            );
            persist(
                state,
                registry,
                recipe,
                envelope,
                &RecipeRun {
                    filter_json: json!({"decision": "drop", "reason": "breaker_active"}),
                    eval_type: "skip",
                    eval_result: json!({"action": "breaker_blocked", "reason": breaker.reason}),
                    action_name: "breaker_blocked".into(),
                    action_trace: json!([]),
                    synthetic: Vec::new(),
                },
            );
            return;
        }
    }

    let run = match stages(state, registry, recipe, envelope, prefix.as_deref()).await {
        Ok(run) => run,
        Err(err) => {
            tracing::warn!(recipe = %recipe.name, error = ?err, "pipeline stage failed");
            RecipeRun {
                filter_json: json!({}),
                eval_type: "error",
                eval_result: json!({"error": format!("{err:#}")}),
                action_name: "error".into(),
                action_trace: json!([]),
                synthetic: Vec::new(),
            }
        }
    };

    let was_drop = run.action_name == "drop";
    persist(state, registry, recipe, envelope, &run);
    let synthetic = run.synthetic;

    // Knock pattern: sustained drops from one sender raise a single alert
    // per hour without tripping a breaker.
    if was_drop {
        if let Some(prefix) = &prefix {
            check_knock(state, registry, prefix).await;
        }
    }

    // Synthetic envelopes queued by `trigger` steps, bounded in depth.
    if depth < MAX_TRIGGER_DEPTH {
        for syn in synthetic {
            let actions::SyntheticTrigger { msg_type, body } = syn;
            let node_id = state.host.node_id().to_string();
            let syn_env = Envelope::from_mail(
                &msg_type,
                &node_id,
                &node_id,
                body,
                envelope.session_id().map(|s| s.to_string()),
                registry.plugin.max_body_preview,
            );
            Box::pin(run_trigger(state, syn_env, depth + 1)).await;
        }
    }
}

/// Filter, evaluate, and act for one recipe. Every early return still ends
/// in exactly one journal row, written by the caller.
async fn stages(
    state: &Arc<GuardState>,
    registry: &Arc<ConfigRegistry>,
    recipe: &Recipe,
    envelope: &Envelope,
    prefix: Option<&str>,
) -> Result<RecipeRun> {
    let tier = match envelope.from_node() {
        Some(node) => trust::resolve_tier(node, &registry.plugin.trust),
        None => TrustTier::Unknown,
    };
    let prompt = match &recipe.evaluate {
        Some(Evaluate::Llm { prompt, .. }) => state.prompt_for(prompt, registry),
        _ => None,
    };

    let outcome = filter::run(FilterInput {
        recipe,
        envelope,
        tier,
        prefix,
        prompt_hash: prompt.as_ref().map(|(_, h)| h.as_str()),
        breakers: &state.breakers,
        kernel: &state.kernel,
        state: &state.filter,
        log: &state.event_log,
        now: now_ts(),
        dryrun: false,
    });

    let (eval_type, eval_result): (&'static str, JsonValue) = match &outcome.decision {
        FilterDecision::Drop { reason } => {
            return Ok(RecipeRun {
                filter_json: outcome.filter_json,
                eval_type: "skip",
                eval_result: json!({"action": "drop", "reason": reason}),
                action_name: "drop".into(),
                action_trace: json!([]),
                synthetic: Vec::new(),
            });
        }
        FilterDecision::Bypass { action, reason } => (
            "bypass",
            json!({"action": action, "reason": reason}),
        ),
        FilterDecision::CacheHit { result } => ("cache", result.clone()),
        FilterDecision::Pass => match &recipe.evaluate {
            None => (
                "skip",
                json!({"action": "default", "reason": "no evaluate stage"}),
            ),
            Some(Evaluate::Hotwire {
                rules,
                default_action,
            }) => {
                let set = registry
                    .hotwires
                    .get(rules)
                    .ok_or_else(|| anyhow!("hotwire set `{rules}` missing from registry"))?;
                ("hotwire", hotwire::evaluate(set, envelope, default_action))
            }
            Some(Evaluate::Llm {
                model,
                fallback_action,
                ..
            }) => {
                let (prompt_text, prompt_hash) = prompt
                    .clone()
                    .ok_or_else(|| anyhow!("no prompt available for recipe `{}`", recipe.name))?;
                let model_def = registry
                    .models
                    .get(model)
                    .ok_or_else(|| anyhow!("model `{model}` missing from registry"))?;
                let result = llm_evaluate(
                    state,
                    registry,
                    envelope,
                    &outcome.context,
                    &outcome.filter_json,
                    tier,
                    &prompt_text,
                    &prompt_hash,
                    model_def,
                    fallback_action,
                    recipe,
                )
                .await;
                // write-back so an identical envelope inside cache_ttl skips
                // the model entirely
                if let (Some(key), true) = (&outcome.cache_key, result.1) {
                    state.filter.cache_put(
                        key.clone(),
                        result.0.clone(),
                        Duration::from_secs(recipe.filter.cache_ttl.max(1)),
                    );
                }
                ("llm", result.0)
            }
        },
    };

    let requested = eval_result
        .get("action")
        .and_then(|a| a.as_str())
        .unwrap_or("drop")
        .to_string();
    let action_name = if recipe.actions.contains_key(&requested) || requested == "drop" {
        requested.clone()
    } else if let Some(fallback) = recipe.fallback_action() {
        tracing::warn!(recipe = %recipe.name, action = %requested, "unrecognised action; using fallback");
        fallback.to_string()
    } else {
        "drop".to_string()
    };

    if let Some(prefix) = prefix {
        state.event_log.record(
            "TRIAGE",
            prefix,
            &format!(
                "pipeline={} action={} tier={} eval={}",
                recipe.name,
                action_name,
                tier.as_str(),
                eval_type
            ),
        );
    }

    // Loop guard: actions that wake the agent or reply count toward the
    // per-(session, sender) window before anything executes.
    if recipe.mode != Mode::Manual && wakes_or_replies(recipe, &action_name) {
        if let Some(prefix) = prefix {
            let loop_reason = {
                let mut guard = state.loop_guard.lock().expect("loop guard mutex poisoned");
                guard.note_wake(prefix, envelope.session_id(), now_ts())
            };
            if let Some(reason) = loop_reason {
                state.event_log.record("LOOP_DETECTED", prefix, &reason);
                state.breakers.trip(
                    "node",
                    prefix,
                    &reason,
                    BREAKER_EXPIRE_SECS,
                    &state.event_log,
                )?;
                wake_agent(state, "node", prefix, &reason).await;
                return Ok(RecipeRun {
                    filter_json: outcome.filter_json,
                    eval_type,
                    eval_result,
                    action_name: "loop_blocked".into(),
                    action_trace: json!([]),
                    synthetic: Vec::new(),
                });
            }

            // Global per-node reply cap, checked after loop detection and
            // independent of any recipe-level rate limit.
            let allowed = {
                let mut rate = state.reply_rate.lock().expect("reply rate mutex poisoned");
                rate.allow(prefix, now_ts())
            };
            if !allowed {
                state.event_log.record(
                    "SKIP_RATE",
                    prefix,
                    &format!(
                        "rate limit ({}/hr)",
                        registry.plugin.max_replies_per_hour_per_node
                    ),
                );
                return Ok(RecipeRun {
                    filter_json: outcome.filter_json,
                    eval_type,
                    eval_result,
                    action_name: "rate_limited".into(),
                    action_trace: json!([]),
                    synthetic: Vec::new(),
                });
            }
        }
    }

    // Filter-level drop short-circuits never reach here; a `drop` action
    // with no declared steps is terminal with an empty trace.
    if action_name == "drop" && !recipe.actions.contains_key("drop") {
        return Ok(RecipeRun {
            filter_json: outcome.filter_json,
            eval_type,
            eval_result,
            action_name,
            action_trace: json!([]),
            synthetic: Vec::new(),
        });
    }

    if action_name == "default" && !recipe.actions.contains_key("default") {
        return Ok(RecipeRun {
            filter_json: outcome.filter_json,
            eval_type,
            eval_result,
            action_name: "none".into(),
            action_trace: json!([]),
            synthetic: Vec::new(),
        });
    }

    let action_timeout = Duration::from_secs_f64(registry.plugin.action_timeout.max(1.0));
    let execute = recipe.mode != Mode::Manual;
    let action_future = actions::execute(
        state,
        ActionInput {
            registry,
            recipe,
            action_name: &action_name,
            envelope,
            context: &outcome.context,
            llm: Some(&eval_result),
            filter: Some(&outcome.filter_json),
            execute,
        },
    );
    let action_outcome = match tokio::time::timeout(action_timeout, action_future).await {
        Ok(outcome) => outcome,
        Err(_) => actions::ActionOutcome {
            trace: vec![json!({"error": "action timeout"})],
            error: Some("action timeout".into()),
            synthetic: Vec::new(),
        },
    };

    Ok(RecipeRun {
        filter_json: outcome.filter_json,
        eval_type,
        eval_result,
        action_name,
        action_trace: JsonValue::Array(action_outcome.trace),
        synthetic: action_outcome.synthetic,
    })
}

fn wakes_or_replies(recipe: &Recipe, action_name: &str) -> bool {
    recipe
        .actions
        .get(action_name)
        .map(|action| {
            action
                .steps
                .iter()
                .any(|s| matches!(s, Step::Summon | Step::Reply { .. }))
        })
        .unwrap_or(false)
}

#[allow(clippy::too_many_arguments)]
async fn llm_evaluate(
    state: &Arc<GuardState>,
    registry: &Arc<ConfigRegistry>,
    envelope: &Envelope,
    context: &BTreeMap<String, String>,
    filter_json: &JsonValue,
    tier: TrustTier,
    prompt_text: &str,
    prompt_hash: &str,
    model_def: &thrall_config::ModelDef,
    fallback_action: &str,
    recipe: &Recipe,
) -> (JsonValue, bool) {
    let ctx = TemplateCtx {
        envelope,
        context,
        llm: None,
        filter: Some(filter_json),
        kernel: Some(&state.kernel),
    };
    let mut diags = Vec::new();
    let system_prompt =
        templates::resolve(prompt_text, &ctx, &mut diags).replace("{tier}", tier.as_str());
    let user_text: String = envelope.body_text().chars().take(MAX_EVAL_BODY).collect();

    let host = state.host.clone();
    let vault: Arc<dyn Fn(&str) -> Option<String> + Send + Sync> =
        Arc::new(move |key| host.vault_get(key));
    let outcome = state
        .evaluator
        .classify(
            model_def,
            vault,
            system_prompt,
            user_text,
            Duration::from_secs_f64(registry.plugin.queue_timeout.max(0.0)),
            Duration::from_secs_f64(registry.plugin.inference_timeout.max(1.0)),
        )
        .await;

    match outcome {
        EvalOutcome::Result { mut value, raw } => {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("prompt_hash".into(), json!(prompt_hash));
                obj.insert("raw_response".into(), json!(raw));
                if !diags.is_empty() {
                    obj.insert("prompt_diagnostics".into(), json!(diags));
                }
            }
            (value, true)
        }
        EvalOutcome::QueueFull => (
            json!({
                "action": fallback_action,
                "reason": "inference queue full",
                "queue_full": true,
                "prompt_hash": prompt_hash,
            }),
            false,
        ),
        EvalOutcome::Unhealthy { reason } => (
            json!({
                "action": fallback_action,
                "reason": format!("backend unavailable: {reason}"),
                "unhealthy": true,
                "prompt_hash": prompt_hash,
            }),
            false,
        ),
        EvalOutcome::Failed { reason, raw } => {
            tracing::warn!(recipe = %recipe.name, %reason, "evaluation failed; using fallback");
            (
                json!({
                    "action": fallback_action,
                    "reason": reason,
                    "raw_response": raw,
                    "prompt_hash": prompt_hash,
                }),
                false,
            )
        }
    }
}

async fn wake_agent(state: &Arc<GuardState>, breaker_type: &str, target: &str, reason: &str) {
    let node_id = state.host.node_id().to_string();
    let mail = crate::host::OutboundMail {
        to_node: node_id,
        msg_type: "system".into(),
        body: json!({
            "type": "thrall_breaker",
            "wake_agent": true,
            "breaker_type": breaker_type,
            "target": target,
            "reason": reason.chars().take(500).collect::<String>(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
        session_id: Some("thrall:breaker".into()),
        system: true,
    };
    if let Err(err) = state.host.send_mail(mail).await {
        tracing::warn!(%err, "agent wake failed");
        state
            .event_log
            .record("WAKE_FAIL", target, &format!("{err:#}").chars().take(200).collect::<String>());
    }
}

async fn check_knock(state: &Arc<GuardState>, registry: &Arc<ConfigRegistry>, prefix: &str) {
    let cutoff = (Utc::now() - ChronoDuration::hours(1)).to_rfc3339_opts(SecondsFormat::Millis, true);
    let drops = match state.kernel.count_drops_since(prefix, &cutoff) {
        Ok(n) => n,
        Err(err) => {
            tracing::warn!(%err, "knock query failed");
            return;
        }
    };
    if drops < registry.plugin.knock_threshold as i64 {
        return;
    }
    let flag = format!("knock:{prefix}");
    match state.kernel.flag_active(&flag) {
        Ok(true) => return, // already alerted this hour
        Ok(false) => {}
        Err(_) => return,
    }
    if state
        .kernel
        .set_flag(&flag, "1", Some(now_ts() + KNOCK_FLAG_TTL_SECS))
        .is_err()
    {
        return;
    }
    state.event_log.record(
        "KNOCK_ALERT",
        prefix,
        &format!("sustained drops (threshold: {})", registry.plugin.knock_threshold),
    );
    wake_agent(state, "knock", prefix, &format!("sustained drops from {prefix}")).await;
}

fn persist(
    state: &Arc<GuardState>,
    registry: &Arc<ConfigRegistry>,
    recipe: &Recipe,
    envelope: &Envelope,
    run: &RecipeRun,
) {
    let reviewed = match recipe.mode {
        Mode::Manual => -1,
        Mode::Supervised => 0,
        Mode::Automated => 1,
    };
    let ttl = now_ts() + registry.plugin.classification_ttl_days as f64 * 86_400.0;
    let append = JournalAppend {
        pipeline: recipe.name.clone(),
        session_id: envelope.session_id().map(|s| s.to_string()),
        from_node: envelope.from_node().map(|s| s.to_string()),
        envelope: envelope.to_json(),
        filter: run.filter_json.clone(),
        eval_type: run.eval_type.to_string(),
        eval_result: run.eval_result.clone(),
        action_name: run.action_name.clone(),
        action_trace: run.action_trace.clone(),
        wall_ms: envelope.wall_ms(),
        mode: recipe.mode.as_str().to_string(),
        reviewed,
        ttl_expires: ttl,
    };
    if let Err(err) = state.kernel.append_journal(&append) {
        tracing::error!(recipe = %recipe.name, %err, "journal write failed");
    }
}

/// Replay a journaled envelope through the current pipeline as a dryrun:
/// filter and evaluate run against live state, the action plan is reported,
/// nothing executes and nothing is journaled.
pub async fn replay(state: &Arc<GuardState>, journal_id: i64) -> Result<JsonValue> {
    let row = state
        .kernel
        .journal_by_id(journal_id)?
        .ok_or_else(|| anyhow!("journal row {journal_id} not found"))?;
    let registry = state.registry();
    let recipe = registry
        .recipe(&row.pipeline)
        .ok_or_else(|| anyhow!("pipeline `{}` no longer configured", row.pipeline))?;
    let kind = if row.envelope.get("tick").is_some() {
        TriggerKind::OnTick
    } else {
        TriggerKind::OnMail
    };
    let envelope = Envelope::from_journal(kind, &row.envelope);
    let prefix = envelope.from_node().and_then(trust::sanitize_prefix);
    let tier = match envelope.from_node() {
        Some(node) => trust::resolve_tier(node, &registry.plugin.trust),
        None => TrustTier::Unknown,
    };
    let prompt = match &recipe.evaluate {
        Some(Evaluate::Llm { prompt, .. }) => state.prompt_for(prompt, &registry),
        _ => None,
    };

    let outcome = filter::run(FilterInput {
        recipe,
        envelope: &envelope,
        tier,
        prefix: prefix.as_deref(),
        prompt_hash: prompt.as_ref().map(|(_, h)| h.as_str()),
        breakers: &state.breakers,
        kernel: &state.kernel,
        state: &state.filter,
        log: &state.event_log,
        now: now_ts(),
        dryrun: true,
    });

    let (eval_type, eval_result): (&str, JsonValue) = match &outcome.decision {
        FilterDecision::Drop { reason } => {
            ("skip", json!({"action": "drop", "reason": reason}))
        }
        FilterDecision::Bypass { action, reason } => {
            ("bypass", json!({"action": action, "reason": reason}))
        }
        FilterDecision::CacheHit { result } => ("cache", result.clone()),
        FilterDecision::Pass => match &recipe.evaluate {
            None => ("skip", json!({"action": "default", "reason": "no evaluate stage"})),
            Some(Evaluate::Hotwire {
                rules,
                default_action,
            }) => {
                let set = registry
                    .hotwires
                    .get(rules)
                    .ok_or_else(|| anyhow!("hotwire set `{rules}` missing from registry"))?;
                ("hotwire", hotwire::evaluate(set, &envelope, default_action))
            }
            Some(Evaluate::Llm {
                model,
                fallback_action,
                ..
            }) => {
                let (prompt_text, prompt_hash) = prompt
                    .clone()
                    .ok_or_else(|| anyhow!("no prompt available for `{}`", recipe.name))?;
                let model_def = registry
                    .models
                    .get(model)
                    .ok_or_else(|| anyhow!("model `{model}` missing from registry"))?;
                let result = llm_evaluate(
                    state,
                    &registry,
                    &envelope,
                    &outcome.context,
                    &outcome.filter_json,
                    tier,
                    &prompt_text,
                    &prompt_hash,
                    model_def,
                    fallback_action,
                    recipe,
                )
                .await;
                ("llm", result.0)
            }
        },
    };

    let action_plan = eval_result
        .get("action")
        .and_then(|a| a.as_str())
        .unwrap_or("drop")
        .to_string();
    Ok(json!({
        "journal_id": journal_id,
        "pipeline": row.pipeline,
        "filter": outcome.filter_json,
        "eval_type": eval_type,
        "eval_result": eval_result,
        "action_plan": action_plan,
        "dryrun": true,
    }))
}
