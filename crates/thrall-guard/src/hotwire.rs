use crate::envelope::Envelope;
use serde_json::{json, Value as JsonValue};
use thrall_config::HotwireSet;

/// Run a hotwire rule set against an envelope. First matching rule wins;
/// no rule matching falls through to the recipe's default action.
pub fn evaluate(set: &HotwireSet, envelope: &Envelope, default_action: &str) -> JsonValue {
    for (idx, rule) in set.rules.iter().enumerate() {
        let Some(value) = envelope.lookup(&rule.field) else {
            continue;
        };
        if rule.pattern.is_match(&value) {
            return json!({
                "action": rule.action,
                "reason": rule.reason,
                "rule_set": set.name,
                "rule_index": idx,
            });
        }
    }
    json!({
        "action": default_action,
        "reason": "no hotwire rule matched",
        "rule_set": set.name,
    })
}
