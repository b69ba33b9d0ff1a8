use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Named compilation buffers. Envelopes accumulate per buffer and flush to
/// `artifacts/<buffer>-<ts>.md` on a size threshold, a keyword hit, or age
/// (checked on tick). The flush write is temp + rename so readers never see
/// a half-written artifact.
pub struct CompileBuffers {
    dir: PathBuf,
    buffers: Mutex<HashMap<String, Buffer>>,
}

struct Buffer {
    entries: Vec<String>,
    opened_at: f64,
    flush_after_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FlushOutcome {
    pub buffer: String,
    pub path: PathBuf,
    pub entries: usize,
    pub trigger: &'static str,
}

impl CompileBuffers {
    pub fn new(plugin_dir: &std::path::Path) -> Self {
        Self {
            dir: plugin_dir.join("artifacts"),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// Append one rendered entry. Returns the flush outcome when this append
    /// crossed a threshold.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        name: &str,
        entry: String,
        body_text: &str,
        summon_threshold: Option<u32>,
        summon_keywords: &[String],
        flush_after_seconds: Option<u64>,
        now: f64,
    ) -> Result<Option<FlushOutcome>> {
        let mut buffers = self.buffers.lock().expect("compile buffers mutex poisoned");
        let buffer = buffers.entry(name.to_string()).or_insert_with(|| Buffer {
            entries: Vec::new(),
            opened_at: now,
            flush_after_seconds,
        });
        buffer.flush_after_seconds = flush_after_seconds.or(buffer.flush_after_seconds);
        buffer.entries.push(entry);

        let body_lower = body_text.to_lowercase();
        let keyword_hit = summon_keywords
            .iter()
            .any(|k| !k.is_empty() && body_lower.contains(&k.to_lowercase()));
        let size_hit = summon_threshold
            .map(|t| buffer.entries.len() >= t as usize)
            .unwrap_or(false);

        if keyword_hit || size_hit {
            let trigger = if keyword_hit { "keyword" } else { "size" };
            let entries = std::mem::take(&mut buffer.entries);
            buffers.remove(name);
            drop(buffers);
            return self.write_artifact(name, entries, trigger).map(Some);
        }
        Ok(None)
    }

    /// Flush buffers whose age crossed their configured limit. Runs on tick.
    pub fn flush_due(&self, now: f64) -> Vec<FlushOutcome> {
        let due: Vec<(String, Vec<String>)> = {
            let mut buffers = self.buffers.lock().expect("compile buffers mutex poisoned");
            let names: Vec<String> = buffers
                .iter()
                .filter(|(_, b)| {
                    b.flush_after_seconds
                        .map(|secs| now - b.opened_at >= secs as f64)
                        .unwrap_or(false)
                })
                .map(|(k, _)| k.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| buffers.remove(&name).map(|b| (name, b.entries)))
                .collect()
        };
        let mut out = Vec::new();
        for (name, entries) in due {
            match self.write_artifact(&name, entries, "time") {
                Ok(outcome) => out.push(outcome),
                Err(err) => {
                    tracing::warn!(buffer = %name, %err, "compile buffer flush failed");
                }
            }
        }
        out
    }

    /// Flush everything regardless of thresholds (shutdown path).
    pub fn flush_all(&self) -> Vec<FlushOutcome> {
        let drained: Vec<(String, Vec<String>)> = {
            let mut buffers = self.buffers.lock().expect("compile buffers mutex poisoned");
            buffers.drain().map(|(k, b)| (k, b.entries)).collect()
        };
        let mut out = Vec::new();
        for (name, entries) in drained {
            if entries.is_empty() {
                continue;
            }
            if let Ok(outcome) = self.write_artifact(&name, entries, "shutdown") {
                out.push(outcome);
            }
        }
        out
    }

    fn write_artifact(
        &self,
        name: &str,
        entries: Vec<String>,
        trigger: &'static str,
    ) -> Result<FlushOutcome> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let ts = Utc::now().format("%Y%m%d-%H%M%S%3f");
        let path = self.dir.join(format!("{name}-{ts}.md"));
        let tmp = self.dir.join(format!(".{name}-{ts}.md.tmp"));

        let mut content = format!("# {name}\n\n");
        let count = entries.len();
        for entry in &entries {
            content.push_str(entry);
            content.push_str("\n\n---\n\n");
        }
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to install {}", path.display()))?;
        Ok(FlushOutcome {
            buffer: name.to_string(),
            path,
            entries: count,
            trigger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn size_threshold_flushes() {
        let dir = tempdir().unwrap();
        let buffers = CompileBuffers::new(dir.path());
        assert!(buffers
            .append("inbox", "one".into(), "one", Some(2), &[], None, 0.0)
            .unwrap()
            .is_none());
        let flush = buffers
            .append("inbox", "two".into(), "two", Some(2), &[], None, 1.0)
            .unwrap()
            .unwrap();
        assert_eq!(flush.trigger, "size");
        assert_eq!(flush.entries, 2);
        let content = std::fs::read_to_string(&flush.path).unwrap();
        assert!(content.contains("# inbox"));
        assert!(content.contains("one"));
        assert!(content.contains("two"));
        // no stray temp files
        let stray: Vec<_> = std::fs::read_dir(buffers.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(stray.is_empty());
    }

    #[test]
    fn keyword_flushes_immediately() {
        let dir = tempdir().unwrap();
        let buffers = CompileBuffers::new(dir.path());
        let keywords = vec!["urgent".to_string()];
        let flush = buffers
            .append(
                "inbox",
                "entry".into(),
                "this is URGENT mail",
                Some(100),
                &keywords,
                None,
                0.0,
            )
            .unwrap()
            .unwrap();
        assert_eq!(flush.trigger, "keyword");
    }

    #[test]
    fn time_flush_on_tick() {
        let dir = tempdir().unwrap();
        let buffers = CompileBuffers::new(dir.path());
        buffers
            .append("slow", "entry".into(), "entry", None, &[], Some(60), 1_000.0)
            .unwrap();
        assert!(buffers.flush_due(1_030.0).is_empty());
        let flushed = buffers.flush_due(1_060.0);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].trigger, "time");
        // flushed buffer starts fresh
        assert!(buffers.flush_due(2_000.0).is_empty());
    }

    #[test]
    fn flush_all_drains_non_empty_buffers() {
        let dir = tempdir().unwrap();
        let buffers = CompileBuffers::new(dir.path());
        buffers
            .append("a", "x".into(), "x", None, &[], None, 0.0)
            .unwrap();
        buffers
            .append("b", "y".into(), "y", None, &[], None, 0.0)
            .unwrap();
        let flushed = buffers.flush_all();
        assert_eq!(flushed.len(), 2);
    }
}
