use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Reserved context session for persistence flags (cooldown markers,
/// knock-alert dedup). Kept out of normal session namespaces by the colon.
pub const FLAG_SESSION: &str = "thrall:flags";

/// Process-wide store backed by `thrall.db` in the plugin directory.
///
/// A single connection in WAL mode; every mutation happens on the event-loop
/// thread. The inference worker never sees this handle; it returns a value
/// that the event loop writes.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRow {
    pub id: i64,
    pub ts: String,
    pub pipeline: String,
    pub session_id: Option<String>,
    pub from_node: Option<String>,
    pub envelope: JsonValue,
    pub filter: JsonValue,
    pub eval_type: String,
    pub eval_result: JsonValue,
    pub action_name: String,
    pub action_trace: JsonValue,
    pub wall_ms: i64,
    pub mode: String,
    pub reviewed: i64,
    pub correction: Option<JsonValue>,
    pub ttl_expires: f64,
}

/// Fields for one journal append. `ts` is stamped by the kernel.
#[derive(Debug, Clone)]
pub struct JournalAppend {
    pub pipeline: String,
    pub session_id: Option<String>,
    pub from_node: Option<String>,
    pub envelope: JsonValue,
    pub filter: JsonValue,
    pub eval_type: String,
    pub eval_result: JsonValue,
    pub action_name: String,
    pub action_trace: JsonValue,
    pub wall_ms: i64,
    pub mode: String,
    pub reviewed: i64,
    pub ttl_expires: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRow {
    pub name: String,
    pub content: String,
    pub hash: String,
    pub pushed_by: String,
    pub pushed_at: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRow {
    pub session_id: String,
    pub key: String,
    pub value: String,
    pub created_at: f64,
    pub expires_at: Option<f64>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Kernel {
    /// Open (or create) `thrall.db` under `dir` and install the schema.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let db_path = dir.join("thrall.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        Self::apply_pragmas(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS thrall_journal (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              ts TEXT NOT NULL,
              pipeline TEXT NOT NULL,
              session_id TEXT,
              from_node TEXT,
              envelope TEXT NOT NULL,
              filter TEXT NOT NULL,
              eval_type TEXT NOT NULL,
              eval_result TEXT NOT NULL,
              action_name TEXT NOT NULL,
              action_trace TEXT NOT NULL,
              wall_ms INTEGER NOT NULL,
              mode TEXT NOT NULL,
              reviewed INTEGER NOT NULL DEFAULT -1,
              correction TEXT,
              ttl_expires REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_journal_pipeline ON thrall_journal(pipeline, id);
            CREATE INDEX IF NOT EXISTS idx_journal_ts ON thrall_journal(ts);
            CREATE INDEX IF NOT EXISTS idx_journal_ttl ON thrall_journal(ttl_expires);
            CREATE INDEX IF NOT EXISTS idx_journal_node ON thrall_journal(from_node);

            CREATE TABLE IF NOT EXISTS thrall_context (
              session_id TEXT NOT NULL,
              key TEXT NOT NULL,
              value TEXT NOT NULL,
              created_at REAL NOT NULL,
              expires_at REAL,
              PRIMARY KEY (session_id, key)
            );
            CREATE INDEX IF NOT EXISTS idx_context_expiry ON thrall_context(expires_at);

            CREATE TABLE IF NOT EXISTS thrall_prompts (
              name TEXT PRIMARY KEY,
              content TEXT NOT NULL,
              hash TEXT NOT NULL,
              pushed_by TEXT NOT NULL,
              pushed_at REAL NOT NULL,
              active INTEGER NOT NULL DEFAULT 1
            );

            -- Legacy overlay kept for the knock query and operator tooling.
            CREATE VIEW IF NOT EXISTS thrall_classifications AS
              SELECT id, ts, from_node, session_id, eval_type, action_name AS action,
                     eval_result, wall_ms, ttl_expires
              FROM thrall_journal
              WHERE pipeline = 'mail-triage';
            "#,
        )
        .context("failed to install thrall schema")?;
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("kernel connection mutex poisoned")
    }

    // ── Journal ──

    /// Append one pipeline trace. Commits immediately: the journal is the
    /// audit trail and must not lose rows on crash.
    pub fn append_journal(&self, row: &JournalAppend) -> Result<i64> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO thrall_journal
               (ts, pipeline, session_id, from_node, envelope, filter, eval_type,
                eval_result, action_name, action_trace, wall_ms, mode, reviewed, ttl_expires)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )?;
        stmt.execute(params![
            now_rfc3339(),
            row.pipeline,
            row.session_id,
            row.from_node,
            row.envelope.to_string(),
            row.filter.to_string(),
            row.eval_type,
            row.eval_result.to_string(),
            row.action_name,
            row.action_trace.to_string(),
            row.wall_ms,
            row.mode,
            row.reviewed,
            row.ttl_expires,
        ])?;
        Ok(conn.last_insert_rowid())
    }

    fn map_journal_row(row: &rusqlite::Row) -> rusqlite::Result<JournalRow> {
        let envelope: String = row.get(5)?;
        let filter: String = row.get(6)?;
        let eval_result: String = row.get(8)?;
        let action_trace: String = row.get(10)?;
        let correction: Option<String> = row.get(14)?;
        Ok(JournalRow {
            id: row.get(0)?,
            ts: row.get(1)?,
            pipeline: row.get(2)?,
            session_id: row.get(3)?,
            from_node: row.get(4)?,
            envelope: serde_json::from_str(&envelope).unwrap_or(JsonValue::Null),
            filter: serde_json::from_str(&filter).unwrap_or(JsonValue::Null),
            eval_type: row.get(7)?,
            eval_result: serde_json::from_str(&eval_result).unwrap_or(JsonValue::Null),
            action_name: row.get(9)?,
            action_trace: serde_json::from_str(&action_trace).unwrap_or(JsonValue::Null),
            wall_ms: row.get(11)?,
            mode: row.get(12)?,
            reviewed: row.get(13)?,
            correction: correction.and_then(|c| serde_json::from_str(&c).ok()),
            ttl_expires: row.get(15)?,
        })
    }

    const JOURNAL_COLS: &'static str = "id, ts, pipeline, session_id, from_node, envelope, filter, \
         eval_type, eval_result, action_name, action_trace, wall_ms, mode, reviewed, correction, \
         ttl_expires";

    pub fn journal_by_id(&self, id: i64) -> Result<Option<JournalRow>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM thrall_journal WHERE id = ?",
            Self::JOURNAL_COLS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt
            .query_row(params![id], Self::map_journal_row)
            .optional()?)
    }

    /// Most recent journal row for one pipeline (templates use this for
    /// `journal.last(...)` lookups).
    pub fn last_journal(&self, pipeline: &str) -> Result<Option<JournalRow>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM thrall_journal WHERE pipeline = ? ORDER BY id DESC LIMIT 1",
            Self::JOURNAL_COLS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        Ok(stmt
            .query_row(params![pipeline], Self::map_journal_row)
            .optional()?)
    }

    pub fn recent_journal(&self, limit: i64, pipeline: Option<&str>) -> Result<Vec<JournalRow>> {
        let conn = self.conn();
        let mut out = Vec::new();
        if let Some(p) = pipeline {
            let sql = format!(
                "SELECT {} FROM thrall_journal WHERE pipeline = ? ORDER BY id DESC LIMIT ?",
                Self::JOURNAL_COLS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(params![p, limit])?;
            while let Some(row) = rows.next()? {
                out.push(Self::map_journal_row(row)?);
            }
        } else {
            let sql = format!(
                "SELECT {} FROM thrall_journal ORDER BY id DESC LIMIT ?",
                Self::JOURNAL_COLS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(params![limit])?;
            while let Some(row) = rows.next()? {
                out.push(Self::map_journal_row(row)?);
            }
        }
        out.reverse();
        Ok(out)
    }

    pub fn set_reviewed(&self, id: i64, reviewed: i64, correction: Option<&JsonValue>) -> Result<()> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "UPDATE thrall_journal SET reviewed = ?, correction = ? WHERE id = ?",
        )?;
        stmt.execute(params![reviewed, correction.map(|c| c.to_string()), id])?;
        Ok(())
    }

    /// Count drop rows from one sender prefix since `cutoff` (RFC3339).
    ///
    /// Exact prefix match via substr, never LIKE: the prefix is already
    /// validated 16-hex, and LIKE would honor wildcards in hostile input.
    pub fn count_drops_since(&self, prefix: &str, cutoff: &str) -> Result<i64> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT count(*) FROM thrall_journal
             WHERE substr(from_node, 1, 16) = ? AND action_name = 'drop' AND ts > ?",
        )?;
        let n: i64 = stmt.query_row(params![prefix, cutoff], |r| r.get(0))?;
        Ok(n)
    }

    /// Delete journal rows whose TTL has passed. Returns the number removed.
    pub fn prune_journal(&self, now: f64) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "DELETE FROM thrall_journal WHERE ttl_expires < ?",
            params![now],
        )?;
        Ok(n)
    }

    // ── Context ──

    pub fn upsert_context(
        &self,
        session_id: &str,
        key: &str,
        value: &str,
        expires_at: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO thrall_context (session_id, key, value, created_at, expires_at)
             VALUES (?,?,?,?,?)",
        )?;
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        stmt.execute(params![session_id, key, value, now, expires_at])?;
        Ok(())
    }

    pub fn get_context(&self, session_id: &str, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT value FROM thrall_context
             WHERE session_id = ? AND key = ? AND (expires_at IS NULL OR expires_at >= ?)",
        )?;
        Ok(stmt
            .query_row(params![session_id, key, now], |r| r.get(0))
            .optional()?)
    }

    /// All unexpired rows for a session, key-ordered.
    pub fn session_context(&self, session_id: &str) -> Result<Vec<ContextRow>> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT session_id, key, value, created_at, expires_at FROM thrall_context
             WHERE session_id = ? AND (expires_at IS NULL OR expires_at >= ?)
             ORDER BY key",
        )?;
        let mut rows = stmt.query(params![session_id, now])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ContextRow {
                session_id: row.get(0)?,
                key: row.get(1)?,
                value: row.get(2)?,
                created_at: row.get(3)?,
                expires_at: row.get(4)?,
            });
        }
        Ok(out)
    }

    pub fn clear_context(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "DELETE FROM thrall_context WHERE session_id = ?",
            params![session_id],
        )?;
        Ok(n)
    }

    pub fn prune_context(&self, now: f64) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "DELETE FROM thrall_context WHERE expires_at IS NOT NULL AND expires_at < ?",
            params![now],
        )?;
        Ok(n)
    }

    // ── Flags (cooldown markers, alert dedup) ──

    pub fn set_flag(&self, key: &str, value: &str, expires_at: Option<f64>) -> Result<()> {
        self.upsert_context(FLAG_SESSION, key, value, expires_at)
    }

    pub fn flag_active(&self, key: &str) -> Result<bool> {
        Ok(self.get_context(FLAG_SESSION, key)?.is_some())
    }

    // ── Prompts ──

    pub fn upsert_prompt(
        &self,
        name: &str,
        content: &str,
        hash: &str,
        pushed_by: &str,
    ) -> Result<()> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO thrall_prompts (name, content, hash, pushed_by, pushed_at, active)
             VALUES (?,?,?,?,?,1)",
        )?;
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        stmt.execute(params![name, content, hash, pushed_by, now])?;
        Ok(())
    }

    /// Insert only when no prompt with this name exists yet. Used to seed the
    /// built-in triage prompt on first open.
    pub fn seed_prompt_if_absent(
        &self,
        name: &str,
        content: &str,
        hash: &str,
        pushed_by: &str,
    ) -> Result<()> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO thrall_prompts (name, content, hash, pushed_by, pushed_at, active)
             VALUES (?,?,?,?,?,1)",
        )?;
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        stmt.execute(params![name, content, hash, pushed_by, now])?;
        Ok(())
    }

    fn map_prompt_row(row: &rusqlite::Row) -> rusqlite::Result<PromptRow> {
        let active: i64 = row.get(5)?;
        Ok(PromptRow {
            name: row.get(0)?,
            content: row.get(1)?,
            hash: row.get(2)?,
            pushed_by: row.get(3)?,
            pushed_at: row.get(4)?,
            active: active != 0,
        })
    }

    pub fn get_prompt(&self, name: &str) -> Result<Option<PromptRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT name, content, hash, pushed_by, pushed_at, active
             FROM thrall_prompts WHERE name = ?",
        )?;
        Ok(stmt
            .query_row(params![name], Self::map_prompt_row)
            .optional()?)
    }

    pub fn active_prompt(&self, name: &str) -> Result<Option<PromptRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT name, content, hash, pushed_by, pushed_at, active
             FROM thrall_prompts WHERE name = ? AND active = 1",
        )?;
        Ok(stmt
            .query_row(params![name], Self::map_prompt_row)
            .optional()?)
    }

    pub fn list_prompts(&self) -> Result<Vec<PromptRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT name, content, hash, pushed_by, pushed_at, active
             FROM thrall_prompts ORDER BY name",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::map_prompt_row(row)?);
        }
        Ok(out)
    }
}
