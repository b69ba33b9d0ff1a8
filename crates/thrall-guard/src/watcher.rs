use crate::state::GuardState;
use std::sync::Arc;
use std::time::SystemTime;
use thrall_config::ConfigRegistry;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Watch the `thrall.reload` sentinel. An mtime change reloads all four
/// config directories and installs the new registry atomically; a bad
/// config keeps the previous registry in place.
pub fn start(state: Arc<GuardState>) -> tokio::task::JoinHandle<()> {
    start_with_interval(state, POLL_INTERVAL)
}

pub fn start_with_interval(
    state: Arc<GuardState>,
    poll: Duration,
) -> tokio::task::JoinHandle<()> {
    let root = state.host.plugin_dir().to_path_buf();
    let sentinel = root.join("thrall.reload");
    tokio::spawn(async move {
        let mut ticker = interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_modified: Option<SystemTime> = None;
        loop {
            ticker.tick().await;
            let modified = match tokio::fs::metadata(&sentinel).await {
                Ok(md) => md.modified().ok(),
                Err(_) => {
                    last_modified = None;
                    continue;
                }
            };
            if modified == last_modified {
                continue;
            }
            let first_sighting = last_modified.is_none();
            last_modified = modified;
            // The sentinel appearing counts as a baseline, not a request.
            if first_sighting {
                continue;
            }
            match ConfigRegistry::load(&root) {
                Ok(registry) => {
                    let recipes = registry.recipes.len();
                    state.install_registry(registry);
                    info!(path = %sentinel.display(), recipes, "config registry reloaded");
                    state.event_log.record("RELOAD", "-", &format!("{recipes} recipes"));
                }
                Err(err) => {
                    warn!(path = %sentinel.display(), err = %format!("{err:#}"), "config reload failed; keeping previous registry");
                    state
                        .event_log
                        .record("RELOAD_FAIL", "-", &format!("{err:#}"));
                }
            }
        }
    })
}
