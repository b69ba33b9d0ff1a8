use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::path::Path;

/// Surface the host node exposes to the guard. The plugin framework hands an
/// implementation to [`crate::ThrallGuard::start`]; tests use the mock in
/// `test_support`.
#[async_trait]
pub trait HostContext: Send + Sync {
    /// Full hex node id of the local node.
    fn node_id(&self) -> &str;

    /// Directory the guard may use for its database, logs, and breakers.
    fn plugin_dir(&self) -> &Path;

    /// Send a mail through the node. `system` marks host-internal mail
    /// (agent wake-ups) that skips the guard on the way back in.
    async fn send_mail(&self, mail: OutboundMail) -> Result<()>;

    /// Read a secret from the host vault.
    fn vault_get(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMail {
    pub to_node: String,
    pub msg_type: String,
    pub body: JsonValue,
    pub session_id: Option<String>,
    pub system: bool,
}

/// Snapshot passed to the periodic tick hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickInfo {
    pub tick: u64,
    pub peer_count: usize,
    pub uptime_s: u64,
}
