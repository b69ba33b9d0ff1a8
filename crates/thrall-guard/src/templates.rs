use crate::envelope::Envelope;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use thrall_kernel::Kernel;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*(envelope|context|llm|filter|journal)\.([^{}]+?)\s*\}\}")
        .expect("placeholder regex")
});

static JOURNAL_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^last\(pipeline='([^']*)'\)\.([A-Za-z0-9_.]+)$").expect("journal key regex")
});

/// Everything a placeholder may read from. Namespaces with no data resolve
/// to empty string with a diagnostic, never an error.
pub struct TemplateCtx<'a> {
    pub envelope: &'a Envelope,
    pub context: &'a BTreeMap<String, String>,
    pub llm: Option<&'a JsonValue>,
    pub filter: Option<&'a JsonValue>,
    pub kernel: Option<&'a Kernel>,
}

fn value_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn walk_path<'v>(mut value: &'v JsonValue, path: &str) -> Option<&'v JsonValue> {
    for segment in path.split('.') {
        value = value.as_object()?.get(segment)?;
    }
    Some(value)
}

fn resolve_journal(kernel: Option<&Kernel>, key: &str) -> Option<String> {
    let caps = JOURNAL_KEY_RE.captures(key)?;
    let pipeline = caps.get(1)?.as_str();
    let path = caps.get(2)?.as_str();
    let row = kernel?.last_journal(pipeline).ok()??;
    let row_json = serde_json::to_value(&row).ok()?;
    walk_path(&row_json, path).and_then(value_to_string)
}

fn resolve_one(ns: &str, key: &str, ctx: &TemplateCtx<'_>) -> Option<String> {
    match ns {
        "envelope" => ctx.envelope.lookup(key),
        "context" => ctx.context.get(key).cloned(),
        "llm" => ctx.llm.and_then(|v| walk_path(v, key)).and_then(value_to_string),
        "filter" => ctx
            .filter
            .and_then(|v| walk_path(v, key))
            .and_then(value_to_string),
        "journal" => resolve_journal(ctx.kernel, key),
        _ => None,
    }
}

/// Expand every `{{namespace.key}}` placeholder. Missing keys become the
/// empty string and a line in `diagnostics` so the trace records what went
/// unresolved. No expression language, no conditionals.
pub fn resolve(template: &str, ctx: &TemplateCtx<'_>, diagnostics: &mut Vec<String>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| {
            let ns = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let key = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            match resolve_one(ns, key, ctx) {
                Some(value) => value,
                None => {
                    diagnostics.push(format!("unresolved {{{{{ns}.{key}}}}}"));
                    String::new()
                }
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::from_mail(
            "text",
            &"ab".repeat(32),
            &"cd".repeat(32),
            json!({"content": "need the digest skill"}),
            Some("sess-A".into()),
            2000,
        )
    }

    #[test]
    fn envelope_and_context_namespaces() {
        let env = envelope();
        let mut context = BTreeMap::new();
        context.insert("topic".to_string(), "digests".to_string());
        let ctx = TemplateCtx {
            envelope: &env,
            context: &context,
            llm: None,
            filter: None,
            kernel: None,
        };
        let mut diags = Vec::new();
        let out = resolve(
            "msg={{envelope.body_text}} topic={{context.topic}}",
            &ctx,
            &mut diags,
        );
        assert_eq!(out, "msg=need the digest skill topic=digests");
        assert!(diags.is_empty());
    }

    #[test]
    fn llm_namespace_walks_nested_paths() {
        let env = envelope();
        let context = BTreeMap::new();
        let llm = json!({"action": "wake", "detail": {"confidence": 0.9}});
        let ctx = TemplateCtx {
            envelope: &env,
            context: &context,
            llm: Some(&llm),
            filter: None,
            kernel: None,
        };
        let mut diags = Vec::new();
        let out = resolve("{{llm.action}}/{{llm.detail.confidence}}", &ctx, &mut diags);
        assert_eq!(out, "wake/0.9");
    }

    #[test]
    fn missing_key_is_empty_with_diagnostic() {
        let env = envelope();
        let context = BTreeMap::new();
        let ctx = TemplateCtx {
            envelope: &env,
            context: &context,
            llm: None,
            filter: None,
            kernel: None,
        };
        let mut diags = Vec::new();
        let out = resolve("[{{context.nope}}][{{llm.action}}]", &ctx, &mut diags);
        assert_eq!(out, "[][]");
        assert_eq!(diags.len(), 2);
        assert!(diags[0].contains("context.nope"));
    }

    #[test]
    fn journal_last_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        kernel
            .append_journal(&thrall_kernel::JournalAppend {
                pipeline: "mail-triage".into(),
                session_id: None,
                from_node: Some("ab".repeat(32)),
                envelope: json!({}),
                filter: json!({}),
                eval_type: "llm".into(),
                eval_result: json!({"action": "drop", "reason": "noise"}),
                action_name: "drop".into(),
                action_trace: json!([]),
                wall_ms: 5,
                mode: "automated".into(),
                reviewed: 1,
                ttl_expires: 4_102_444_800.0,
            })
            .unwrap();
        let env = envelope();
        let context = BTreeMap::new();
        let ctx = TemplateCtx {
            envelope: &env,
            context: &context,
            llm: None,
            filter: None,
            kernel: Some(&kernel),
        };
        let mut diags = Vec::new();
        let out = resolve(
            "last={{journal.last(pipeline='mail-triage').eval_result.reason}}",
            &ctx,
            &mut diags,
        );
        assert_eq!(out, "last=noise");
        let out = resolve(
            "{{journal.last(pipeline='absent').action_name}}",
            &ctx,
            &mut diags,
        );
        assert_eq!(out, "");
        assert_eq!(diags.len(), 1);
    }
}
