use serde_json::{Map, Value as JsonValue};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    OnMail,
    OnTick,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::OnMail => "on_mail",
            TriggerKind::OnTick => "on_tick",
        }
    }
}

/// Immutable record of one trigger event. Built once at the trigger stage;
/// downstream stages only read it.
#[derive(Debug, Clone)]
pub struct Envelope {
    kind: TriggerKind,
    fields: Map<String, JsonValue>,
    arrived: Instant,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Normalize an arbitrary body into an object. Strings are parsed as JSON
/// when possible, anything non-object is wrapped, so hostile shapes (numbers,
/// arrays, null) cannot reach field lookups.
fn coerce_body(body: JsonValue) -> Map<String, JsonValue> {
    let body = match body {
        JsonValue::String(s) => match serde_json::from_str::<JsonValue>(&s) {
            Ok(parsed) => parsed,
            Err(_) => {
                let mut m = Map::new();
                m.insert("content".into(), JsonValue::String(s));
                return m;
            }
        },
        other => other,
    };
    match body {
        JsonValue::Object(m) => m,
        JsonValue::Null => Map::new(),
        other => {
            let mut m = Map::new();
            let text = match other {
                JsonValue::String(s) => s,
                v => v.to_string(),
            };
            m.insert("content".into(), JsonValue::String(text));
            m
        }
    }
}

fn body_text_of(body: &Map<String, JsonValue>, max_preview: usize) -> String {
    for key in ["content", "text"] {
        if let Some(JsonValue::String(s)) = body.get(key) {
            if !s.is_empty() {
                return s.clone();
            }
        }
    }
    // No content field: preview the body itself, truncating string fields
    // before serializing so oversized mail never expands in memory.
    let mut preview = Map::new();
    for (k, v) in body.iter().take(10) {
        let trimmed = match v {
            JsonValue::String(s) => JsonValue::String(truncate_chars(s, max_preview)),
            other => other.clone(),
        };
        preview.insert(k.clone(), trimmed);
    }
    if preview.is_empty() {
        String::new()
    } else {
        JsonValue::Object(preview).to_string()
    }
}

impl Envelope {
    pub fn from_mail(
        msg_type: &str,
        from_node: &str,
        to_node: &str,
        body: JsonValue,
        session_id: Option<String>,
        max_body_preview: usize,
    ) -> Self {
        let body = coerce_body(body);
        let body_text = body_text_of(&body, max_body_preview);
        let message_id = body
            .get("_handler_message_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let mut fields = Map::new();
        fields.insert("from_node".into(), JsonValue::String(from_node.into()));
        fields.insert("to_node".into(), JsonValue::String(to_node.into()));
        fields.insert("msg_type".into(), JsonValue::String(msg_type.into()));
        fields.insert("body_text".into(), JsonValue::String(body_text));
        fields.insert("body_json".into(), JsonValue::Object(body));
        fields.insert(
            "session_id".into(),
            session_id.map(JsonValue::String).unwrap_or(JsonValue::Null),
        );
        fields.insert(
            "message_id".into(),
            message_id.map(JsonValue::String).unwrap_or(JsonValue::Null),
        );
        Self {
            kind: TriggerKind::OnMail,
            fields,
            arrived: Instant::now(),
        }
    }

    pub fn from_tick(tick: u64, peer_count: usize, uptime_s: u64) -> Self {
        let mut fields = Map::new();
        fields.insert("tick".into(), JsonValue::from(tick));
        fields.insert("peer_count".into(), JsonValue::from(peer_count));
        fields.insert("uptime_s".into(), JsonValue::from(uptime_s));
        Self {
            kind: TriggerKind::OnTick,
            fields,
            arrived: Instant::now(),
        }
    }

    /// Rebuild an envelope from a journal row for replay. The wall clock
    /// restarts at reconstruction time.
    pub fn from_journal(kind: TriggerKind, stored: &JsonValue) -> Self {
        let fields = stored
            .as_object()
            .cloned()
            .unwrap_or_default();
        Self {
            kind,
            fields,
            arrived: Instant::now(),
        }
    }

    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    pub fn wall_ms(&self) -> i64 {
        self.arrived.elapsed().as_millis() as i64
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key)
    }

    /// String form of a field for template substitution. Scalars render
    /// bare; objects and arrays render as JSON.
    pub fn lookup(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn from_node(&self) -> Option<&str> {
        self.fields.get("from_node").and_then(|v| v.as_str())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.fields.get("session_id").and_then(|v| v.as_str())
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.fields.get("msg_type").and_then(|v| v.as_str())
    }

    pub fn body_text(&self) -> &str {
        self.fields
            .get("body_text")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    pub fn message_id(&self) -> Option<&str> {
        self.fields.get("message_id").and_then(|v| v.as_str())
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }
}
