use chrono::Utc;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

const MAX_DETAIL: usize = 500;

/// Newline-delimited human-readable event log (`thrall.log`). One line per
/// action or event:
///
/// `YYYY-MM-DD HH:MM:SS [<ACTION>] <16-hex-or-dash> <free-text>`
///
/// CR/LF are stripped from both the prefix and the free text so hostile mail
/// cannot forge log lines.
pub struct EventLog {
    path: PathBuf,
    lock: Mutex<()>,
}

fn strip_newlines(s: &str, replace_with_space: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => {
                if replace_with_space {
                    out.push(' ');
                }
            }
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

impl EventLog {
    pub fn new(plugin_dir: &std::path::Path) -> Self {
        Self {
            path: plugin_dir.join("thrall.log"),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one line. Write failures are swallowed; the event log is an
    /// operator convenience, not the audit trail.
    pub fn record(&self, action: &str, node_prefix: &str, detail: &str) {
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let prefix = strip_newlines(node_prefix, false);
        let prefix: String = prefix.chars().take(16).collect();
        let prefix = if prefix.is_empty() { "-".to_string() } else { prefix };
        let detail = strip_newlines(detail, true);
        let detail: String = detail.chars().take(MAX_DETAIL).collect();
        let line = format!("{ts} [{action}] {prefix} {detail}\n");

        let _guard = self.lock.lock().expect("event log mutex poisoned");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(mut f) => {
                if let Err(err) = f.write_all(line.as_bytes()) {
                    tracing::debug!(path = %self.path.display(), %err, "event log write failed");
                }
            }
            Err(err) => {
                tracing::debug!(path = %self.path.display(), %err, "event log open failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn line_format_and_injection_defence() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path());
        log.record("TRIAGE", "6f5185865618575f", "action=wake tier=known");
        log.record("SKIP_INVALID", "bad\nid\rhere", "body\ncontains\r\nnewlines");
        log.record("PRUNE", "", "removed 3 rows");

        let raw = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("[TRIAGE] 6f5185865618575f action=wake tier=known"));
        // prefix newlines dropped, detail newlines become spaces
        assert!(lines[1].contains("[SKIP_INVALID] badidhere body contains newlines"));
        assert!(lines[2].contains("[PRUNE] - removed 3 rows"));
        // timestamp prefix shape
        assert_eq!(&lines[0][4..5], "-");
        assert_eq!(&lines[0][10..11], " ");
    }

    #[test]
    fn detail_is_capped() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path());
        log.record("TRIAGE", "6f5185865618575f", &"x".repeat(2000));
        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(raw.lines().next().unwrap().len() < 600);
    }
}
