use crate::envelope::Envelope;
use crate::host::OutboundMail;
use crate::state::{now_ts, GuardState};
use crate::templates::{self, TemplateCtx};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::time::Duration;
use thrall_config::{ConfigRegistry, Recipe, Step};

static COCKPIT_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent(concat!("thrall-guard/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(3))
        .timeout(Duration::from_secs(20))
        .build()
        .expect("cockpit http client")
});

/// What one action execution produced: a step-by-step trace, the first
/// error (if any), and synthetic envelopes queued by `trigger` steps.
pub struct ActionOutcome {
    pub trace: Vec<JsonValue>,
    pub error: Option<String>,
    pub synthetic: Vec<SyntheticTrigger>,
}

pub struct SyntheticTrigger {
    pub msg_type: String,
    pub body: JsonValue,
}

pub struct ActionInput<'a> {
    pub registry: &'a ConfigRegistry,
    pub recipe: &'a Recipe,
    pub action_name: &'a str,
    pub envelope: &'a Envelope,
    pub context: &'a BTreeMap<String, String>,
    pub llm: Option<&'a JsonValue>,
    pub filter: Option<&'a JsonValue>,
    /// False in manual mode: steps are resolved and traced as
    /// `would_execute` but produce no external effect.
    pub execute: bool,
}

fn resolve_str(
    template: &str,
    input: &ActionInput<'_>,
    state: &GuardState,
    step_trace: &mut JsonValue,
) -> String {
    let ctx = TemplateCtx {
        envelope: input.envelope,
        context: input.context,
        llm: input.llm,
        filter: input.filter,
        kernel: Some(&state.kernel),
    };
    let mut diags = Vec::new();
    let resolved = templates::resolve(template, &ctx, &mut diags);
    if !diags.is_empty() {
        step_trace["diagnostics"] = json!(diags);
    }
    resolved
}

fn session_of(envelope: &Envelope) -> String {
    envelope.session_id().unwrap_or("default").to_string()
}

fn prefix_or_dash(envelope: &Envelope) -> String {
    envelope
        .from_node()
        .and_then(crate::trust::sanitize_prefix)
        .unwrap_or_else(|| "-".to_string())
}

/// Execute (or dry-run) the named action's step sequence. Steps run in
/// order; the first failure aborts the remainder and is reported both in
/// the trace and as `error`.
pub async fn execute(state: &GuardState, input: ActionInput<'_>) -> ActionOutcome {
    let mut outcome = ActionOutcome {
        trace: Vec::new(),
        error: None,
        synthetic: Vec::new(),
    };
    let Some(action) = input.recipe.actions.get(input.action_name) else {
        let msg = format!(
            "recipe `{}` has no action `{}`",
            input.recipe.name, input.action_name
        );
        outcome.trace.push(json!({"error": msg}));
        outcome.error = Some(msg);
        return outcome;
    };

    for step in &action.steps {
        let mut step_trace = json!({});
        if !input.execute {
            step_trace["would_execute"] = json!(true);
        }
        let result = run_step(state, &input, step, &mut step_trace, &mut outcome.synthetic).await;
        let terminal = matches!(step, Step::Drop);
        match result {
            Ok(()) => outcome.trace.push(step_trace),
            Err(err) => {
                let msg = format!("{err:#}");
                step_trace["error"] = json!(msg);
                outcome.trace.push(step_trace);
                state.event_log.record(
                    "ACTION_FAIL",
                    &prefix_or_dash(input.envelope),
                    &format!("{}:{} {}", input.recipe.name, input.action_name, msg),
                );
                outcome.error = Some(msg);
                break;
            }
        }
        if terminal {
            break;
        }
    }
    outcome
}

async fn run_step(
    state: &GuardState,
    input: &ActionInput<'_>,
    step: &Step,
    step_trace: &mut JsonValue,
    synthetic: &mut Vec<SyntheticTrigger>,
) -> Result<()> {
    match step {
        Step::Log { message } => {
            step_trace["step"] = json!("log");
            let message = resolve_str(message, input, state, step_trace);
            step_trace["message"] = json!(message);
            if input.execute {
                state
                    .event_log
                    .record("LOG", &prefix_or_dash(input.envelope), &message);
            }
            Ok(())
        }
        Step::Drop => {
            step_trace["step"] = json!("drop");
            Ok(())
        }
        Step::Compile {
            buffer,
            summon_threshold,
            summon_keywords,
            flush_after_seconds,
        } => {
            step_trace["step"] = json!("compile");
            step_trace["buffer"] = json!(buffer);
            if !input.execute {
                return Ok(());
            }
            let entry = format!(
                "**{}** from `{}` type={}\n\n{}",
                Utc::now().format("%Y-%m-%d %H:%M:%S"),
                prefix_or_dash(input.envelope),
                input.envelope.msg_type().unwrap_or("tick"),
                input.envelope.body_text(),
            );
            let flushed = state.buffers.append(
                buffer,
                entry,
                input.envelope.body_text(),
                *summon_threshold,
                summon_keywords,
                *flush_after_seconds,
                now_ts(),
            )?;
            if let Some(flush) = flushed {
                step_trace["flushed"] = json!({
                    "path": flush.path.display().to_string(),
                    "entries": flush.entries,
                    "trigger": flush.trigger,
                });
            }
            Ok(())
        }
        Step::Summon => {
            step_trace["step"] = json!("summon");
            if !input.execute {
                return Ok(());
            }
            let node_id = state.host.node_id().to_string();
            state
                .host
                .send_mail(OutboundMail {
                    to_node: node_id,
                    msg_type: "system".into(),
                    body: json!({
                        "type": "thrall_summon",
                        "wake_agent": true,
                        "pipeline": input.recipe.name,
                        "envelope": input.envelope.to_json(),
                    }),
                    session_id: Some("thrall:summon".into()),
                    system: true,
                })
                .await
                .context("summon mail failed")
        }
        Step::Reply { msg_type, template } => {
            step_trace["step"] = json!("reply");
            let content = resolve_str(template, input, state, step_trace);
            let to_node = input
                .envelope
                .from_node()
                .ok_or_else(|| anyhow!("reply step without a sender"))?
                .to_string();
            if !input.execute {
                return Ok(());
            }
            state
                .host
                .send_mail(OutboundMail {
                    to_node,
                    msg_type: msg_type.clone(),
                    body: json!({ "content": content }),
                    session_id: input.envelope.session_id().map(|s| s.to_string()),
                    system: false,
                })
                .await
                .context("reply mail failed")
        }
        Step::Act {
            skill,
            input: skill_input,
            error_buffer,
        } => {
            step_trace["step"] = json!("act");
            step_trace["skill"] = json!(skill);
            let mut resolved = serde_json::Map::new();
            for (k, v) in skill_input {
                resolved.insert(k.clone(), json!(resolve_str(v, input, state, step_trace)));
            }
            if !input.execute {
                return Ok(());
            }
            let result = call_cockpit(state, input.registry, skill, JsonValue::Object(resolved)).await;
            if let Err(err) = &result {
                if let Some(buffer) = error_buffer {
                    let entry = format!(
                        "**{}** act `{}` failed\n\n{err:#}",
                        Utc::now().format("%Y-%m-%d %H:%M:%S"),
                        skill,
                    );
                    let _ = state
                        .buffers
                        .append(buffer, entry, "", None, &[], None, now_ts());
                    step_trace["error_buffer"] = json!(buffer);
                }
            }
            result
        }
        Step::SetContext {
            key,
            value,
            ttl_seconds,
        } => {
            step_trace["step"] = json!("set_context");
            let key = resolve_str(key, input, state, step_trace);
            let value = resolve_str(value, input, state, step_trace);
            step_trace["key"] = json!(key);
            if !input.execute {
                return Ok(());
            }
            let expires_at = ttl_seconds.map(|secs| now_ts() + secs as f64);
            state
                .kernel
                .upsert_context(&session_of(input.envelope), &key, &value, expires_at)?;
            Ok(())
        }
        Step::ClearContext => {
            step_trace["step"] = json!("clear_context");
            if !input.execute {
                return Ok(());
            }
            let removed = state.kernel.clear_context(&session_of(input.envelope))?;
            step_trace["removed"] = json!(removed);
            Ok(())
        }
        Step::SetFlag { key, ttl_seconds } => {
            step_trace["step"] = json!("set_flag");
            let key = resolve_str(key, input, state, step_trace);
            step_trace["key"] = json!(key);
            if !input.execute {
                return Ok(());
            }
            let expires_at = ttl_seconds.map(|secs| now_ts() + secs as f64);
            state.kernel.set_flag(&key, "1", expires_at)?;
            Ok(())
        }
        Step::Trigger { msg_type, body } => {
            step_trace["step"] = json!("trigger");
            step_trace["msg_type"] = json!(msg_type);
            let rendered = body
                .as_deref()
                .map(|template| resolve_str(template, input, state, step_trace));
            let body = match rendered {
                Some(raw) => serde_json::from_str(&raw)
                    .unwrap_or_else(|_| json!({ "content": raw })),
                None => input.envelope.to_json(),
            };
            if input.execute {
                synthetic.push(SyntheticTrigger {
                    msg_type: msg_type.clone(),
                    body,
                });
            }
            Ok(())
        }
    }
}

async fn call_cockpit(
    state: &GuardState,
    registry: &ConfigRegistry,
    skill: &str,
    input: JsonValue,
) -> Result<()> {
    let cockpit = registry
        .plugin
        .cockpit
        .as_ref()
        .ok_or_else(|| anyhow!("act step without [cockpit] configured"))?;
    let token = state
        .host
        .vault_get(&cockpit.token_vault_key)
        .ok_or_else(|| anyhow!("cockpit token `{}` unset", cockpit.token_vault_key))?;
    let resp = COCKPIT_CLIENT
        .post(&cockpit.url)
        .bearer_auth(token)
        .json(&json!({ "skill": skill, "input": input }))
        .send()
        .await
        .context("cockpit request failed")?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("cockpit returned {status} for skill `{skill}`");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{registry_with_recipe, MockHost};
    use crate::state::GuardState;
    use serde_json::json as j;

    fn mail_env(body: &str) -> Envelope {
        Envelope::from_mail(
            "text",
            &"6f5185865618575f".repeat(4),
            &"cd".repeat(32),
            j!({ "content": body }),
            Some("sess-A".into()),
            2000,
        )
    }

    const ACTIONS: &str = r#"
[actions.notify]
steps = [
  { type = "log", message = "saw {{envelope.body_text}}" },
  { type = "reply", template = "ack: {{llm.reason}}" },
  { type = "set_context", key = "last_action", value = "notify", ttl_seconds = 60 },
]

[actions.halt]
steps = [
  { type = "drop" },
  { type = "log", message = "unreachable" },
]
"#;

    async fn run_action(
        state: &GuardState,
        action: &str,
        execute: bool,
        llm: Option<&JsonValue>,
    ) -> ActionOutcome {
        let registry = state.registry();
        let recipe = &registry.recipes[0];
        let env = mail_env("please run the digest");
        let context = BTreeMap::new();
        execute_action(state, &registry, recipe, action, &env, &context, llm, execute).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_action(
        state: &GuardState,
        registry: &ConfigRegistry,
        recipe: &Recipe,
        action_name: &str,
        envelope: &Envelope,
        context: &BTreeMap<String, String>,
        llm: Option<&JsonValue>,
        exec: bool,
    ) -> ActionOutcome {
        execute(
            state,
            ActionInput {
                registry,
                recipe,
                action_name,
                envelope,
                context,
                llm,
                filter: None,
                execute: exec,
            },
        )
        .await
    }

    #[tokio::test]
    async fn steps_execute_in_order_with_side_effects() {
        let host = MockHost::new();
        let state = GuardState::new(host.clone(), registry_with_recipe(ACTIONS)).unwrap();
        let llm = j!({"action": "reply", "reason": "greeting"});
        let outcome = run_action(&state, "notify", true, Some(&llm)).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.trace.len(), 3);
        let sent = host.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body["content"], "ack: greeting");
        assert_eq!(sent[0].session_id.as_deref(), Some("sess-A"));
        assert_eq!(
            state.kernel.get_context("sess-A", "last_action").unwrap().as_deref(),
            Some("notify")
        );
    }

    #[tokio::test]
    async fn manual_mode_traces_without_effects() {
        let host = MockHost::new();
        let state = GuardState::new(host.clone(), registry_with_recipe(ACTIONS)).unwrap();
        let outcome = run_action(&state, "notify", false, None).await;
        assert!(outcome.error.is_none());
        assert!(outcome
            .trace
            .iter()
            .all(|s| s["would_execute"] == json!(true)));
        assert!(host.sent().is_empty());
        assert!(state
            .kernel
            .get_context("sess-A", "last_action")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn drop_is_terminal() {
        let host = MockHost::new();
        let state = GuardState::new(host.clone(), registry_with_recipe(ACTIONS)).unwrap();
        let outcome = run_action(&state, "halt", true, None).await;
        assert_eq!(outcome.trace.len(), 1);
        assert_eq!(outcome.trace[0]["step"], "drop");
    }

    #[tokio::test]
    async fn unknown_action_is_an_error() {
        let host = MockHost::new();
        let state = GuardState::new(host.clone(), registry_with_recipe(ACTIONS)).unwrap();
        let outcome = run_action(&state, "missing", true, None).await;
        assert!(outcome.error.unwrap().contains("no action `missing`"));
    }

    #[tokio::test]
    async fn failing_send_aborts_remaining_steps() {
        let host = MockHost::new();
        host.fail_sends();
        let state = GuardState::new(host.clone(), registry_with_recipe(ACTIONS)).unwrap();
        let outcome = run_action(&state, "notify", true, None).await;
        assert!(outcome.error.is_some());
        // log ran, reply failed, set_context never reached
        assert_eq!(outcome.trace.len(), 2);
        assert!(state
            .kernel
            .get_context("sess-A", "last_action")
            .unwrap()
            .is_none());
    }
}
