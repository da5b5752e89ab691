use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{parse_numeric, LineageError};

/// Property keys recognized in an extraction request
pub mod keys {
    pub const LOG_REMOTE: &str = "lz.lineage.log.remote";
    pub const LOCAL_LOG_DIR: &str = "lz.lineage.log.default.dir";
    pub const REMOTE_LOG_DIR: &str = "lz.remote.log.dir";
    pub const REMOTE_HOST: &str = "lz.remote.machine";
    pub const REMOTE_PORT: &str = "lz.remote.port";
    pub const REMOTE_USER: &str = "lz.remote.user";
    pub const PRIVATE_KEY: &str = "lz.private.key.location";
    pub const HOST_KEY_POLICY: &str = "lz.remote.host.key.policy";
    pub const KNOWN_HOSTS: &str = "lz.remote.known.hosts";
    pub const REMOTE_TIMEOUT_MS: &str = "lz.remote.timeout.ms";
    pub const DEFAULT_CATALOG_ID: &str = "lz.default.hadoop.database.id";
}

/// One run of a workflow task, as reported by the workflow engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub app_id: i32,
    pub task_type: i32,
    pub task_id: String,
    pub task_name: String,
    pub task_start_time: i64,
    pub task_end_time: i64,
}

impl TaskExecutionRecord {
    /// Location of this run's log relative to a log base directory:
    /// `logtasklog/{task_type}/{task_id}`
    pub fn log_relative_path(&self) -> Result<PathBuf, LineageError> {
        let id = self.task_id.trim();
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(LineageError::LogUnavailable(format!(
                "task id {:?} is not a valid log file name",
                self.task_id
            )));
        }

        Ok(PathBuf::from("logtasklog")
            .join(self.task_type.to_string())
            .join(id))
    }

    pub fn numeric_task_id(&self) -> Result<i64, LineageError> {
        parse_numeric("task_id", &self.task_id)
    }
}

impl fmt::Display for TaskExecutionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "app={} type={} task={} ({})",
            self.app_id, self.task_type, self.task_id, self.task_name
        )
    }
}

/// A unit of work for one dispatch worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRequest {
    #[serde(default = "new_request_id")]
    pub id: String,
    pub record: TaskExecutionRecord,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl ExtractionRequest {
    pub fn new(record: TaskExecutionRecord, properties: BTreeMap<String, String>) -> Self {
        Self {
            id: new_request_id(),
            record,
            properties,
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Fill in every key the request does not set itself
    pub fn with_defaults(mut self, defaults: &BTreeMap<String, String>) -> Self {
        for (key, value) in defaults {
            self.properties
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    pub fn default_catalog_id(&self) -> Result<i32, LineageError> {
        parse_numeric(
            keys::DEFAULT_CATALOG_ID,
            self.property(keys::DEFAULT_CATALOG_ID).unwrap_or_default(),
        )
    }
}

impl fmt::Display for ExtractionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request {} [{}]", self.id, self.record)
    }
}
