use std::collections::HashMap;

const SOLICITED_WINDOW_SECS: f64 = 3600.0;

/// Per-(session, sender) reply accounting with solicited-reply exemptions.
///
/// All mutation happens synchronously on the event loop; there is no await
/// between any read and its dependent write. Both maps are bounded and evict
/// the entry with the stalest latest timestamp once over capacity.
pub struct LoopGuard {
    // (session_or_default, sender_prefix) -> wake timestamps in window
    reply_counter: HashMap<(String, String), Vec<f64>>,
    // (sender_prefix, session) -> last time we sent to them
    solicited: HashMap<(String, String), f64>,
    loop_threshold: u32,
    loop_threshold_sessionless: u32,
    window_secs: u64,
    max_entries: usize,
}

fn evict_stalest<K: Clone + std::hash::Hash + Eq>(map: &mut HashMap<K, Vec<f64>>, cap: usize) {
    while map.len() > cap {
        let Some(key) = map
            .iter()
            .min_by(|a, b| {
                let la = a.1.last().copied().unwrap_or(0.0);
                let lb = b.1.last().copied().unwrap_or(0.0);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(k, _)| k.clone())
        else {
            return;
        };
        map.remove(&key);
    }
}

impl LoopGuard {
    pub fn new(
        loop_threshold: u32,
        loop_threshold_sessionless: u32,
        window_secs: u64,
        max_entries: usize,
    ) -> Self {
        Self {
            reply_counter: HashMap::new(),
            solicited: HashMap::new(),
            loop_threshold,
            loop_threshold_sessionless,
            window_secs,
            max_entries,
        }
    }

    /// Record that we sent mail to `prefix` in `session`. Their replies in
    /// that session count as solicited for the next hour, doubling the loop
    /// threshold.
    pub fn record_send(&mut self, prefix: &str, session_id: &str, now: f64) {
        self.solicited
            .insert((prefix.to_string(), session_id.to_string()), now);
        while self.solicited.len() > self.max_entries {
            let Some(key) = self
                .solicited
                .iter()
                .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.solicited.remove(&key);
        }
    }

    pub fn is_solicited(&self, prefix: &str, session_id: &str, now: f64) -> bool {
        match self
            .solicited
            .get(&(prefix.to_string(), session_id.to_string()))
        {
            Some(ts) => now - *ts <= SOLICITED_WINDOW_SECS,
            None => false,
        }
    }

    /// Record one wake/reply for the sender and return a loop reason once
    /// the windowed count exceeds the effective threshold. Auto-generated
    /// sessions (`resp:` prefix) fall back to the sessionless bucket.
    pub fn note_wake(&mut self, prefix: &str, session_id: Option<&str>, now: f64) -> Option<String> {
        let (key, threshold) = match session_id {
            Some(s) if !s.is_empty() && !s.starts_with("resp:") => {
                ((s.to_string(), prefix.to_string()), self.loop_threshold)
            }
            _ => (
                ("default".to_string(), prefix.to_string()),
                self.loop_threshold_sessionless,
            ),
        };

        let window_secs = self.window_secs as f64;
        let window = self.reply_counter.entry(key.clone()).or_default();
        window.retain(|t| now - *t < window_secs);
        window.push(now);
        let count = window.len();
        evict_stalest(&mut self.reply_counter, self.max_entries);

        let solicited = self.is_solicited(prefix, session_id.unwrap_or(""), now);
        let effective = if solicited { threshold * 2 } else { threshold };

        if count > effective as usize {
            Some(format!(
                "loop detected: {} replies from {} in session '{}' (threshold: {}, solicited: {})",
                count,
                prefix,
                session_id.unwrap_or("default"),
                effective,
                solicited
            ))
        } else {
            None
        }
    }

    /// Drop stale windows and expired solicited entries.
    pub fn prune(&mut self, now: f64) {
        let window_secs = self.window_secs as f64;
        self.reply_counter.retain(|_, window| {
            window.retain(|t| now - *t < window_secs);
            !window.is_empty()
        });
        self.solicited
            .retain(|_, ts| now - *ts <= SOLICITED_WINDOW_SECS);
    }
}

/// Global per-node reply cap, independent of the loop guard and of any
/// recipe-level rate limit: at most `max_per_hour` wake/reply executions
/// per sender prefix, across all sessions and recipes.
pub struct ReplyRateLimit {
    windows: HashMap<String, Vec<f64>>,
    max_per_hour: u32,
    max_entries: usize,
}

const REPLY_RATE_WINDOW_SECS: f64 = 3600.0;

impl ReplyRateLimit {
    pub fn new(max_per_hour: u32, max_entries: usize) -> Self {
        Self {
            windows: HashMap::new(),
            max_per_hour,
            max_entries,
        }
    }

    /// Check the sender's hourly window and, when under the cap, record this
    /// event in the same step. A refused event is not recorded, so a capped
    /// sender is re-admitted as soon as the window slides.
    pub fn allow(&mut self, prefix: &str, now: f64) -> bool {
        let window = self.windows.entry(prefix.to_string()).or_default();
        window.retain(|t| now - *t < REPLY_RATE_WINDOW_SECS);
        if window.len() >= self.max_per_hour as usize {
            return false;
        }
        window.push(now);
        evict_stalest(&mut self.windows, self.max_entries);
        true
    }

    pub fn prune(&mut self, now: f64) {
        self.windows.retain(|_, window| {
            window.retain(|t| now - *t < REPLY_RATE_WINDOW_SECS);
            !window.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "6f5185865618575f";

    fn guard() -> LoopGuard {
        LoopGuard::new(2, 5, 1800, 10_000)
    }

    #[test]
    fn fires_on_threshold_plus_one_not_threshold() {
        let mut g = guard();
        assert!(g.note_wake(PREFIX, Some("sess-A"), 1000.0).is_none());
        assert!(g.note_wake(PREFIX, Some("sess-A"), 1001.0).is_none());
        let reason = g.note_wake(PREFIX, Some("sess-A"), 1002.0);
        assert!(reason.is_some());
        assert!(reason.unwrap().contains("3 replies"));
    }

    #[test]
    fn sessionless_bucket_uses_higher_threshold() {
        let mut g = guard();
        for i in 0..5 {
            assert!(g.note_wake(PREFIX, None, 1000.0 + i as f64).is_none());
        }
        assert!(g.note_wake(PREFIX, None, 1005.0).is_some());
    }

    #[test]
    fn auto_generated_sessions_count_as_sessionless() {
        let mut g = guard();
        for i in 0..5 {
            assert!(g
                .note_wake(PREFIX, Some("resp:6f5185865618575f"), 1000.0 + i as f64)
                .is_none());
        }
        assert!(g
            .note_wake(PREFIX, Some("resp:6f5185865618575f"), 1005.0)
            .is_some());
    }

    #[test]
    fn solicited_doubles_threshold_exactly_within_window() {
        let mut g = guard();
        g.record_send(PREFIX, "sess-A", 1000.0);
        for i in 0..4 {
            assert!(g.note_wake(PREFIX, Some("sess-A"), 1001.0 + i as f64).is_none());
        }
        assert!(g.note_wake(PREFIX, Some("sess-A"), 1005.0).is_some());
    }

    #[test]
    fn solicited_exemption_expires_after_an_hour() {
        let mut g = guard();
        g.record_send(PREFIX, "sess-A", 1000.0);
        assert!(g.is_solicited(PREFIX, "sess-A", 1000.0 + 3600.0));
        assert!(!g.is_solicited(PREFIX, "sess-A", 1000.0 + 3601.0));
        // back to the base threshold once expired
        let late = 1000.0 + 4000.0;
        assert!(g.note_wake(PREFIX, Some("sess-A"), late).is_none());
        assert!(g.note_wake(PREFIX, Some("sess-A"), late + 1.0).is_none());
        assert!(g.note_wake(PREFIX, Some("sess-A"), late + 2.0).is_some());
    }

    #[test]
    fn window_slides_after_thirty_minutes() {
        let mut g = guard();
        g.note_wake(PREFIX, Some("sess-A"), 1000.0);
        g.note_wake(PREFIX, Some("sess-A"), 1001.0);
        // both earlier wakes have aged out of the 30-minute window
        assert!(g.note_wake(PREFIX, Some("sess-A"), 1001.0 + 1800.0).is_none());
    }

    #[test]
    fn sessions_are_independent_buckets() {
        let mut g = guard();
        g.note_wake(PREFIX, Some("sess-A"), 1000.0);
        g.note_wake(PREFIX, Some("sess-A"), 1001.0);
        assert!(g.note_wake(PREFIX, Some("sess-B"), 1002.0).is_none());
    }

    #[test]
    fn counter_map_is_bounded() {
        let mut g = LoopGuard::new(2, 5, 1800, 100);
        for i in 0..500 {
            let prefix = format!("{i:016x}");
            g.note_wake(&prefix, Some("sess"), 1000.0 + i as f64);
        }
        assert!(g.reply_counter.len() <= 100);
    }

    #[test]
    fn prune_clears_stale_state() {
        let mut g = guard();
        g.note_wake(PREFIX, Some("sess-A"), 1000.0);
        g.record_send(PREFIX, "sess-A", 1000.0);
        g.prune(1000.0 + 7200.0);
        assert!(g.reply_counter.is_empty());
        assert!(g.solicited.is_empty());
    }

    #[test]
    fn reply_cap_allows_up_to_max_then_refuses() {
        let mut r = ReplyRateLimit::new(2, 100);
        assert!(r.allow(PREFIX, 1000.0));
        assert!(r.allow(PREFIX, 1001.0));
        assert!(!r.allow(PREFIX, 1002.0));
        // other senders have their own window
        assert!(r.allow("9a9a9a9a9a9a9a9a", 1002.0));
    }

    #[test]
    fn reply_cap_refused_events_are_not_counted() {
        let mut r = ReplyRateLimit::new(1, 100);
        assert!(r.allow(PREFIX, 1000.0));
        for i in 0..10 {
            assert!(!r.allow(PREFIX, 1001.0 + i as f64));
        }
        // the one recorded event ages out after an hour; the refusals never
        // extended the window
        assert!(r.allow(PREFIX, 1000.0 + 3600.0));
    }

    #[test]
    fn reply_cap_window_slides() {
        let mut r = ReplyRateLimit::new(2, 100);
        assert!(r.allow(PREFIX, 1000.0));
        assert!(r.allow(PREFIX, 2000.0));
        assert!(!r.allow(PREFIX, 2500.0));
        // first event falls out of the hour at t=4600
        assert!(r.allow(PREFIX, 4601.0));
    }

    #[test]
    fn reply_cap_map_is_bounded() {
        let mut r = ReplyRateLimit::new(5, 50);
        for i in 0..200 {
            let prefix = format!("{i:016x}");
            r.allow(&prefix, 1000.0 + i as f64);
        }
        assert!(r.windows.len() <= 50);
    }
}
