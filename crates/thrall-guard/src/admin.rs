use crate::state::GuardState;
use serde_json::{json, Value as JsonValue};
use thrall_config::{prompt_hash, TIER_BINDING};

/// The `prompt-load` admin skill: list, get, and push classification
/// prompts. The host only routes calls here for operator-whitelisted
/// senders; that whitelist is opaque to this component.
pub async fn handle(state: &GuardState, input: &JsonValue) -> JsonValue {
    let action = input
        .get("action")
        .and_then(|a| a.as_str())
        .unwrap_or("load");
    let from_node = input
        .get("from_node")
        .and_then(|f| f.as_str())
        .unwrap_or("unknown");
    match action {
        "load" => load_prompt(state, input, from_node),
        "list" => list_prompts(state),
        "get" => get_prompt(state, input),
        other => json!({"status": "error", "error": format!("unknown action: {other}")}),
    }
}

fn load_prompt(state: &GuardState, input: &JsonValue, from_node: &str) -> JsonValue {
    let name = input
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or(crate::state::TRIAGE_PROMPT_NAME);
    let content = input.get("content").and_then(|c| c.as_str()).unwrap_or("");
    if content.trim().is_empty() {
        return json!({"status": "error", "error": "content required"});
    }
    if !content.contains(TIER_BINDING) {
        return json!({
            "status": "error",
            "error": format!("prompt must contain {TIER_BINDING} placeholder"),
        });
    }
    let hash = prompt_hash(content);
    let pushed_by: String = from_node.chars().take(16).collect();
    if let Err(err) = state.kernel.upsert_prompt(name, content, &hash, &pushed_by) {
        return json!({"status": "error", "error": format!("{err:#}")});
    }
    // tell the running engine to pick up the new active prompt
    if let Err(err) = state.refresh_prompt_overrides() {
        return json!({"status": "error", "error": format!("{err:#}")});
    }
    state
        .event_log
        .record("PROMPT_LOAD", &pushed_by, &format!("name={name} hash={hash}"));
    json!({"status": "ok", "prompt": name, "hash": hash})
}

fn list_prompts(state: &GuardState) -> JsonValue {
    match state.kernel.list_prompts() {
        Ok(rows) => {
            let prompts: Vec<JsonValue> = rows
                .into_iter()
                .map(|r| {
                    json!({
                        "name": r.name,
                        "hash": r.hash,
                        "pushed_by": r.pushed_by,
                        "pushed_at": r.pushed_at,
                        "active": r.active,
                    })
                })
                .collect();
            json!({"status": "ok", "prompts": prompts})
        }
        Err(err) => json!({"status": "error", "error": format!("{err:#}")}),
    }
}

fn get_prompt(state: &GuardState, input: &JsonValue) -> JsonValue {
    let name = input
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or(crate::state::TRIAGE_PROMPT_NAME);
    match state.kernel.get_prompt(name) {
        Ok(Some(row)) => json!({
            "status": "ok",
            "name": row.name,
            "content": row.content,
            "hash": row.hash,
            "pushed_by": row.pushed_by,
        }),
        Ok(None) => json!({"status": "error", "error": format!("prompt '{name}' not found")}),
        Err(err) => json!({"status": "error", "error": format!("{err:#}")}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{GuardState, DEFAULT_TRIAGE_PROMPT, TRIAGE_PROMPT_NAME};
    use crate::test_support::MockHost;
    use thrall_config::ConfigRegistry;

    fn state() -> GuardState {
        GuardState::new(MockHost::new(), ConfigRegistry::default()).unwrap()
    }

    #[tokio::test]
    async fn load_requires_tier_binding() {
        let state = state();
        let out = handle(
            &state,
            &serde_json::json!({
                "action": "load",
                "name": "triage",
                "content": "classify {{envelope.body_text}} with no tier",
                "from_node": "ad8d21d81a497993beef",
            }),
        )
        .await;
        assert_eq!(out["status"], "error");
        assert!(out["error"].as_str().unwrap().contains("{tier}"));
        // stored prompt unchanged
        let row = state.kernel.get_prompt(TRIAGE_PROMPT_NAME).unwrap().unwrap();
        assert_eq!(row.content, DEFAULT_TRIAGE_PROMPT);
    }

    #[tokio::test]
    async fn load_upserts_and_reloads_active_prompt() {
        let state = state();
        let content = "Trust {tier}. Classify: {{envelope.body_text}}";
        let out = handle(
            &state,
            &serde_json::json!({
                "action": "load",
                "name": "triage",
                "content": content,
                "from_node": "ad8d21d81a497993beef",
            }),
        )
        .await;
        assert_eq!(out["status"], "ok");
        assert_eq!(out["hash"], prompt_hash(content));
        let row = state.kernel.get_prompt(TRIAGE_PROMPT_NAME).unwrap().unwrap();
        assert_eq!(row.pushed_by, "ad8d21d81a497993");
        // the engine now resolves the pushed prompt
        let registry = state.registry();
        let (active, _) = state.prompt_for(TRIAGE_PROMPT_NAME, &registry).unwrap();
        assert_eq!(active, content);
        // prompt-hash round trip
        assert_eq!(row.hash, prompt_hash(&row.content));
    }

    #[tokio::test]
    async fn list_and_get() {
        let state = state();
        let out = handle(&state, &serde_json::json!({"action": "list"})).await;
        assert_eq!(out["status"], "ok");
        assert_eq!(out["prompts"].as_array().unwrap().len(), 1);

        let out = handle(&state, &serde_json::json!({"action": "get", "name": "triage"})).await;
        assert_eq!(out["status"], "ok");
        assert_eq!(out["content"], DEFAULT_TRIAGE_PROMPT);

        let out = handle(&state, &serde_json::json!({"action": "get", "name": "nope"})).await;
        assert_eq!(out["status"], "error");
    }

    #[tokio::test]
    async fn unknown_action_errors() {
        let state = state();
        let out = handle(&state, &serde_json::json!({"action": "delete"})).await;
        assert_eq!(out["status"], "error");
    }
}
