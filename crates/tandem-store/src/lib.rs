use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, params};
use std::fs;
use std::path::{Path, PathBuf};
use tandem_core::{ApiMessage, HistoryItem, Message, TaskMetrics, runtime_dir};
use uuid::Uuid;

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS history_items (
        task_id TEXT PRIMARY KEY,
        ts INTEGER NOT NULL,
        goal TEXT NOT NULL,
        tokens_in INTEGER NOT NULL,
        tokens_out INTEGER NOT NULL,
        cache_writes INTEGER NOT NULL,
        cache_reads INTEGER NOT NULL,
        total_cost REAL NOT NULL,
        size_bytes INTEGER NOT NULL,
        last_checkpoint_hash TEXT,
        deleted_range TEXT,
        updated_at TEXT NOT NULL
     );",
)];

const API_HISTORY_FILE: &str = "api_history.json";
const MESSAGES_FILE: &str = "messages.json";

/// Durable storage for per-task conversation records plus a cross-task
/// history index. Task records are JSON files under
/// `.tandem/tasks/<task_id>/`; the index lives in SQLite.
pub struct TaskStore {
    pub root: PathBuf,
    db_path: PathBuf,
    tasks_dir: PathBuf,
}

impl TaskStore {
    pub fn new(workspace: &Path) -> Result<Self> {
        let root = runtime_dir(workspace);
        fs::create_dir_all(&root)?;
        let db_path = root.join("store.sqlite");
        let tasks_dir = root.join("tasks");
        fs::create_dir_all(&tasks_dir)?;
        let store = Self {
            root,
            db_path,
            tasks_dir,
        };
        store.init_db()?;
        Ok(store)
    }

    pub fn db(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.tasks_dir.join(task_id.to_string())
    }

    // ── Per-task records ──

    pub fn save_api_history(&self, task_id: Uuid, history: &[ApiMessage]) -> Result<()> {
        self.write_task_file(task_id, API_HISTORY_FILE, &serde_json::to_vec(history)?)
    }

    pub fn load_api_history(&self, task_id: Uuid) -> Result<Vec<ApiMessage>> {
        let path = self.task_dir(task_id).join(API_HISTORY_FILE);
        if !path.exists() {
            return Ok(vec![]);
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    pub fn save_messages(&self, task_id: Uuid, messages: &[Message]) -> Result<()> {
        self.write_task_file(task_id, MESSAGES_FILE, &serde_json::to_vec(messages)?)
    }

    pub fn load_messages(&self, task_id: Uuid) -> Result<Vec<Message>> {
        let path = self.task_dir(task_id).join(MESSAGES_FILE);
        if !path.exists() {
            return Ok(vec![]);
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    // Write through a temp file and rename so a crash mid-write never leaves
    // a torn record behind.
    fn write_task_file(&self, task_id: Uuid, name: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{name}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, dir.join(name))?;
        Ok(())
    }

    // ── History index ──

    pub fn upsert_history_item(&self, item: &HistoryItem) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT OR REPLACE INTO history_items
             (task_id, ts, goal, tokens_in, tokens_out, cache_writes, cache_reads,
              total_cost, size_bytes, last_checkpoint_hash, deleted_range, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                item.task_id.to_string(),
                item.ts,
                item.goal,
                item.metrics.tokens_in as i64,
                item.metrics.tokens_out as i64,
                item.metrics.cache_writes as i64,
                item.metrics.cache_reads as i64,
                item.metrics.total_cost,
                item.size_bytes as i64,
                item.last_checkpoint_hash,
                item.conversation_history_deleted_range
                    .map(|range| serde_json::to_string(&range))
                    .transpose()?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_history_item(&self, task_id: Uuid) -> Result<Option<HistoryItem>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, ts, goal, tokens_in, tokens_out, cache_writes, cache_reads,
                    total_cost, size_bytes, last_checkpoint_hash, deleted_range
             FROM history_items WHERE task_id = ?1",
        )?;
        let mut rows = stmt.query([task_id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(row_to_history_item(row)?));
        }
        Ok(None)
    }

    pub fn list_history_items(&self) -> Result<Vec<HistoryItem>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, ts, goal, tokens_in, tokens_out, cache_writes, cache_reads,
                    total_cost, size_bytes, last_checkpoint_hash, deleted_range
             FROM history_items ORDER BY ts DESC",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            out.push(row_to_history_item(row)?);
        }
        Ok(out)
    }

    pub fn delete_task(&self, task_id: Uuid) -> Result<()> {
        let dir = self.task_dir(task_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let conn = self.db()?;
        conn.execute(
            "DELETE FROM history_items WHERE task_id = ?1",
            [task_id.to_string()],
        )?;
        Ok(())
    }

    /// On-disk size of a task's records. Measurement failures degrade to
    /// zero; this feeds an informational field only.
    pub fn measure_task_size(&self, task_id: Uuid) -> u64 {
        let dir = self.task_dir(task_id);
        if !dir.exists() {
            return 0;
        }
        walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )?;

        for (version, sql) in MIGRATIONS {
            let already: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [*version],
                |r| r.get(0),
            )?;
            if already == 0 {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }
}

fn row_to_history_item(row: &rusqlite::Row<'_>) -> Result<HistoryItem> {
    Ok(HistoryItem {
        task_id: Uuid::parse_str(row.get::<_, String>(0)?.as_str())?,
        ts: row.get(1)?,
        goal: row.get(2)?,
        metrics: TaskMetrics {
            tokens_in: row.get::<_, i64>(3)? as u64,
            tokens_out: row.get::<_, i64>(4)? as u64,
            cache_writes: row.get::<_, i64>(5)? as u64,
            cache_reads: row.get::<_, i64>(6)? as u64,
            total_cost: row.get(7)?,
        },
        size_bytes: row.get::<_, i64>(8)? as u64,
        last_checkpoint_hash: row.get(9)?,
        conversation_history_deleted_range: row
            .get::<_, Option<String>>(10)?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{ApiBlock, MessageKind, SayKind};

    fn sample_message(ts: i64) -> Message {
        Message {
            ts,
            kind: MessageKind::Say(SayKind::Text),
            text: Some("hello".to_string()),
            images: vec![],
            partial: false,
            last_checkpoint_hash: None,
            conversation_history_index: None,
            conversation_history_deleted_range: None,
        }
    }

    #[test]
    fn task_records_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path()).unwrap();
        let task_id = Uuid::now_v7();

        let history = vec![
            ApiMessage::user(vec![ApiBlock::text("fix the bug")]),
            ApiMessage::assistant_text("on it"),
        ];
        store.save_api_history(task_id, &history).unwrap();
        let loaded = store.load_api_history(task_id).unwrap();
        assert_eq!(loaded.len(), 2);

        let messages = vec![sample_message(1), sample_message(2)];
        store.save_messages(task_id, &messages).unwrap();
        let loaded = store.load_messages(task_id).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].ts, 2);
    }

    #[test]
    fn missing_task_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path()).unwrap();
        let task_id = Uuid::now_v7();
        assert!(store.load_api_history(task_id).unwrap().is_empty());
        assert!(store.load_messages(task_id).unwrap().is_empty());
    }

    #[test]
    fn history_index_upsert_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path()).unwrap();

        let mut item = HistoryItem {
            task_id: Uuid::now_v7(),
            ts: 100,
            goal: "add tests".to_string(),
            metrics: TaskMetrics {
                tokens_in: 10,
                tokens_out: 5,
                cache_writes: 0,
                cache_reads: 0,
                total_cost: 0.001,
            },
            size_bytes: 0,
            last_checkpoint_hash: None,
            conversation_history_deleted_range: Some((2, 6)),
        };
        store.upsert_history_item(&item).unwrap();

        // Upsert replaces rather than duplicates.
        item.metrics.tokens_in = 42;
        store.upsert_history_item(&item).unwrap();

        let listed = store.list_history_items().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metrics.tokens_in, 42);
        assert_eq!(listed[0].conversation_history_deleted_range, Some((2, 6)));

        let loaded = store.load_history_item(item.task_id).unwrap().unwrap();
        assert_eq!(loaded.goal, "add tests");
    }

    #[test]
    fn delete_removes_records_and_index_row() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path()).unwrap();
        let task_id = Uuid::now_v7();
        store.save_messages(task_id, &[sample_message(1)]).unwrap();
        store
            .upsert_history_item(&HistoryItem {
                task_id,
                ts: 1,
                goal: "g".to_string(),
                metrics: TaskMetrics::default(),
                size_bytes: 0,
                last_checkpoint_hash: None,
                conversation_history_deleted_range: None,
            })
            .unwrap();

        store.delete_task(task_id).unwrap();
        assert!(store.load_messages(task_id).unwrap().is_empty());
        assert!(store.load_history_item(task_id).unwrap().is_none());
    }

    #[test]
    fn task_size_measured_after_write() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path()).unwrap();
        let task_id = Uuid::now_v7();
        assert_eq!(store.measure_task_size(task_id), 0);
        store.save_messages(task_id, &[sample_message(1)]).unwrap();
        assert!(store.measure_task_size(task_id) > 0);
    }
}
