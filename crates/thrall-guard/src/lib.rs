//! Edge-resident message classification guard for a peer-to-peer agent
//! node. Intercepts every inbound mail before the agent sees it and decides:
//! forward (wake the agent), auto-reply hint, compile into a buffer, or drop.
//! Every decision lands in an append-only journal that doubles as audit log
//! and regression dataset.

mod actions;
mod admin;
mod backends;
mod breakers;
mod compile;
mod engine;
mod envelope;
mod evaluator;
mod event_log;
mod filter;
mod guard;
mod hotwire;
mod host;
mod loop_guard;
mod state;
mod templates;
mod trust;
mod watcher;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use backends::InferenceBackend;
pub use breakers::{Breaker, BreakerStore};
pub use compile::{CompileBuffers, FlushOutcome};
pub use envelope::{Envelope, TriggerKind};
pub use event_log::EventLog;
pub use filter::{FilterDecision, FilterState};
pub use loop_guard::{LoopGuard, ReplyRateLimit};
pub use evaluator::{BackendFactory, EvalOutcome, Evaluator, VaultFn};
pub use guard::ThrallGuard;
pub use host::{HostContext, OutboundMail, TickInfo};
pub use state::{GuardState, DEFAULT_TRIAGE_PROMPT, TRIAGE_PROMPT_NAME};
pub use trust::{resolve_tier, sanitize_prefix, TrustTier};

/// Initialize tracing with an env-filter default of `info`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
