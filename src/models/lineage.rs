use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetRole {
    Source,
    Target,
}

impl DatasetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetRole::Source => "source",
            DatasetRole::Target => "target",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "source" => Some(DatasetRole::Source),
            "target" => Some(DatasetRole::Target),
            _ => None,
        }
    }
}

impl fmt::Display for DatasetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One directed edge between a job execution and a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub app_id: i32,
    pub flow_exec_id: i64,
    pub task_name: String,
    pub task_id: i64,
    pub catalog_id: i32,
    pub dataset_path: String,
    /// Storage platform of the dataset, e.g. "hive" or "hdfs"
    pub platform: String,
    pub role: DatasetRole,
    pub operation: Option<String>,
    pub record_count: u64,
    pub insert_count: u64,
    pub delete_count: u64,
    pub update_count: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub flow_path: String,
}
