use crate::event_log::EventLog;
use crate::trust;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CACHE_TTL: Duration = Duration::from_secs(30);

/// A per-sender (or global) block persisted as
/// `breakers/<target>.json`. While active it suppresses all pipeline work
/// for the target, including any model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breaker {
    #[serde(rename = "type")]
    pub breaker_type: String,
    pub target: String,
    pub reason: String,
    pub tripped_at: String,
    pub trip_count: u32,
    pub auto_expire_seconds: u64,
    pub expires_at: Option<String>,
}

pub struct BreakerStore {
    dir: PathBuf,
    // name -> (cached_at, breaker-or-absent); avoids disk reads per message
    cache: Mutex<HashMap<String, (Instant, Option<Breaker>)>>,
}

impl BreakerStore {
    pub fn new(plugin_dir: &std::path::Path) -> Self {
        Self {
            dir: plugin_dir.join("breakers"),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// Breaker currently blocking this sender, if any. Checks `global`
    /// first, then the sender prefix.
    pub fn check(&self, prefix: &str, log: &EventLog) -> Option<Breaker> {
        if !self.dir.exists() {
            return None;
        }
        for name in ["global", prefix] {
            if let Some(b) = self.get_cached(name, log) {
                return Some(b);
            }
        }
        None
    }

    fn get_cached(&self, name: &str, log: &EventLog) -> Option<Breaker> {
        {
            let cache = self.cache.lock().expect("breaker cache mutex poisoned");
            if let Some((cached_at, breaker)) = cache.get(name) {
                if cached_at.elapsed() < CACHE_TTL {
                    return breaker.clone();
                }
            }
        }
        let breaker = self.load(name, log);
        let mut cache = self.cache.lock().expect("breaker cache mutex poisoned");
        cache.insert(name.to_string(), (Instant::now(), breaker.clone()));
        breaker
    }

    /// Read one breaker file, honoring expiry. Unparseable files stay on
    /// disk for the operator to repair; expired files are deleted.
    fn load(&self, name: &str, log: &EventLog) -> Option<Breaker> {
        let path = self.dir.join(format!("{name}.json"));
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        let breaker: Breaker = match serde_json::from_str(&raw) {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "breaker file unparseable; leaving in place");
                return None;
            }
        };
        if let Some(expires_at) = &breaker.expires_at {
            if let Ok(exp) = DateTime::parse_from_rfc3339(expires_at) {
                if Utc::now() > exp.with_timezone(&Utc) {
                    // concurrent deletion is fine; the file being gone is the goal
                    let _ = std::fs::remove_file(&path);
                    log.record(
                        "BREAKER_EXPIRED",
                        name,
                        &format!("auto-expired after {}s", breaker.auto_expire_seconds),
                    );
                    return None;
                }
            }
        }
        Some(breaker)
    }

    /// Write (or re-trip) a breaker. The target must already be validated —
    /// anything that is not `global` or 16-hex is refused, which keeps
    /// hostile node ids out of the filesystem namespace.
    pub fn trip(
        &self,
        breaker_type: &str,
        target: &str,
        reason: &str,
        auto_expire_seconds: u64,
        log: &EventLog,
    ) -> Result<()> {
        if !trust::is_valid_target(target) {
            tracing::warn!(target, "refusing breaker for invalid target");
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let now = Utc::now();
        let reason: String = reason.chars().take(500).collect();
        let expires_at = (auto_expire_seconds > 0)
            .then(|| (now + ChronoDuration::seconds(auto_expire_seconds as i64)).to_rfc3339());
        let path = self.dir.join(format!("{target}.json"));
        let prior_trips = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Breaker>(&raw).ok())
            .map(|b| b.trip_count)
            .unwrap_or(0);

        let breaker = Breaker {
            breaker_type: breaker_type.to_string(),
            target: target.to_string(),
            reason: reason.clone(),
            tripped_at: now.to_rfc3339(),
            trip_count: prior_trips + 1,
            auto_expire_seconds,
            expires_at,
        };
        let body = serde_json::to_string_pretty(&breaker)?;
        std::fs::write(&path, body)
            .with_context(|| format!("failed to write {}", path.display()))?;

        self.cache
            .lock()
            .expect("breaker cache mutex poisoned")
            .remove(target);
        log.record("BREAKER_TRIP", target, &reason.chars().take(200).collect::<String>());
        Ok(())
    }

    /// Delete expired breaker files and reset the read cache. Runs on the
    /// prune tick.
    pub fn prune(&self, log: &EventLog) {
        if self.dir.exists() {
            if let Ok(entries) = std::fs::read_dir(&self.dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let Ok(raw) = std::fs::read_to_string(&path) else {
                        continue;
                    };
                    let Ok(breaker) = serde_json::from_str::<Breaker>(&raw) else {
                        continue;
                    };
                    let Some(expires_at) = breaker.expires_at else {
                        continue;
                    };
                    if let Ok(exp) = DateTime::parse_from_rfc3339(&expires_at) {
                        if Utc::now() > exp.with_timezone(&Utc) {
                            let _ = std::fs::remove_file(&path);
                            let name = path
                                .file_stem()
                                .map(|s| s.to_string_lossy().to_string())
                                .unwrap_or_default();
                            log.record("BREAKER_EXPIRED", &name, "pruned on tick");
                        }
                    }
                }
            }
        }
        self.cache
            .lock()
            .expect("breaker cache mutex poisoned")
            .clear();
    }
}
