use rusqlite::{Connection, Result as SqliteResult};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{LineageSink, LineageWriter};
use crate::error::LineageError;
use crate::models::{DatasetRole, LineageRecord};

/// SQLite storage for extracted lineage records
/// Uses tokio::Mutex for async-friendly locking
#[derive(Clone)]
pub struct SqliteLineageSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLineageSink {
    /// Create a new SQLite sink
    pub async fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            let mut cleaned = path_str.trim_start_matches("sqlite:");
            cleaned = cleaned.trim_start_matches("//");
            cleaned
        } else {
            path_str.as_ref()
        };

        let conn = Connection::open(clean_path)?;
        let sink = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        sink.init_schema().await?;
        Ok(sink)
    }

    async fn init_schema(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS job_execution_lineage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id INTEGER NOT NULL,
                flow_exec_id INTEGER NOT NULL,
                task_name TEXT NOT NULL,
                task_id INTEGER NOT NULL,
                catalog_id INTEGER NOT NULL,
                dataset_path TEXT NOT NULL,
                platform TEXT NOT NULL,
                role TEXT NOT NULL,
                operation TEXT,
                record_count INTEGER NOT NULL DEFAULT 0,
                insert_count INTEGER NOT NULL DEFAULT 0,
                delete_count INTEGER NOT NULL DEFAULT 0,
                update_count INTEGER NOT NULL DEFAULT 0,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                flow_path TEXT NOT NULL,
                loaded_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_lineage_flow ON job_execution_lineage(app_id, flow_exec_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_lineage_dataset ON job_execution_lineage(dataset_path)",
            [],
        )?;

        Ok(())
    }

    /// Records of one flow execution, in insertion order
    pub async fn list_flow_records(
        &self,
        app_id: i32,
        flow_exec_id: i64,
    ) -> SqliteResult<Vec<LineageRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT app_id, flow_exec_id, task_name, task_id, catalog_id, dataset_path, platform, role,
                   operation, record_count, insert_count, delete_count, update_count,
                   start_time, end_time, flow_path
            FROM job_execution_lineage
            WHERE app_id = ?1 AND flow_exec_id = ?2
            ORDER BY id
            "#,
        )?;

        let records = stmt.query_map(rusqlite::params![app_id, flow_exec_id], |row| {
            let role: String = row.get(7)?;
            Ok(LineageRecord {
                app_id: row.get(0)?,
                flow_exec_id: row.get(1)?,
                task_name: row.get(2)?,
                task_id: row.get(3)?,
                catalog_id: row.get(4)?,
                dataset_path: row.get(5)?,
                platform: row.get(6)?,
                role: DatasetRole::from_str(&role).unwrap_or(DatasetRole::Source),
                operation: row.get(8)?,
                record_count: row.get::<_, i64>(9)? as u64,
                insert_count: row.get::<_, i64>(10)? as u64,
                delete_count: row.get::<_, i64>(11)? as u64,
                update_count: row.get::<_, i64>(12)? as u64,
                start_time: row.get(13)?,
                end_time: row.get(14)?,
                flow_path: row.get(15)?,
            })
        })?;

        records.collect()
    }

    pub async fn count_records(&self) -> SqliteResult<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM job_execution_lineage", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl LineageSink for SqliteLineageSink {
    fn writer(&self) -> Box<dyn LineageWriter> {
        Box::new(SqliteLineageWriter {
            conn: self.conn.clone(),
            pending: Vec::new(),
        })
    }
}

/// Buffers one request's records and commits them in a single transaction
struct SqliteLineageWriter {
    conn: Arc<Mutex<Connection>>,
    pending: Vec<LineageRecord>,
}

#[async_trait::async_trait]
impl LineageWriter for SqliteLineageWriter {
    async fn append(&mut self, record: &LineageRecord) -> Result<(), LineageError> {
        self.pending.push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), LineageError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let loaded_at = chrono::Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO job_execution_lineage
                (app_id, flow_exec_id, task_name, task_id, catalog_id, dataset_path, platform, role,
                 operation, record_count, insert_count, delete_count, update_count,
                 start_time, end_time, flow_path, loaded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                "#,
            )?;

            for record in &self.pending {
                stmt.execute(rusqlite::params![
                    record.app_id,
                    record.flow_exec_id,
                    record.task_name,
                    record.task_id,
                    record.catalog_id,
                    record.dataset_path,
                    record.platform,
                    record.role.as_str(),
                    record.operation,
                    record.record_count as i64,
                    record.insert_count as i64,
                    record.delete_count as i64,
                    record.update_count as i64,
                    record.start_time,
                    record.end_time,
                    record.flow_path,
                    &loaded_at,
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!("Committed {} lineage records", self.pending.len());
        self.pending.clear();
        Ok(())
    }
}
