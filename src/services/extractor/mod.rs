// Task-type specific lineage extraction strategies
pub mod hive2storage;

pub use hive2storage::Hive2StorageExtractor;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::LineageError;
use crate::models::{LineageRecord, TaskExecutionRecord};

/// Stage an extractor has reached within one log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPhase {
    Parsing,
    Analyzing,
    Building,
}

/// Produces lineage records from one task's execution log
pub trait LineageExtractor: Send + Sync {
    fn extract(
        &self,
        log_path: &Path,
        record: &TaskExecutionRecord,
        default_catalog_id: i32,
    ) -> Result<Vec<LineageRecord>, LineageError> {
        self.extract_reporting(log_path, record, default_catalog_id, &|_| {})
    }

    /// Same as `extract`, calling `progress` as each phase begins
    fn extract_reporting(
        &self,
        log_path: &Path,
        record: &TaskExecutionRecord,
        default_catalog_id: i32,
        progress: &dyn Fn(ExtractionPhase),
    ) -> Result<Vec<LineageRecord>, LineageError>;

    fn name(&self) -> &'static str;
}

/// Task types with a built-in extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Hive batch job exporting a query result to the distributed filesystem
    HiveToStorage,
}

impl TaskType {
    pub const ALL: [TaskType; 1] = [TaskType::HiveToStorage];

    pub fn code(&self) -> i32 {
        match self {
            TaskType::HiveToStorage => 72,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::HiveToStorage => "hive2storage",
        }
    }
}

/// Read-only after construction; shared by all workers
pub struct ExtractorRegistry {
    extractors: HashMap<i32, Arc<dyn LineageExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Registry holding every built-in task type
    pub fn with_defaults(target_platform: &str) -> Self {
        let mut registry = Self::new();
        for task_type in TaskType::ALL {
            let extractor: Arc<dyn LineageExtractor> = match task_type {
                TaskType::HiveToStorage => Arc::new(Hive2StorageExtractor::new(target_platform)),
            };
            registry.extractors.insert(task_type.code(), extractor);
        }
        registry
    }

    pub fn register(
        &mut self,
        task_type: i32,
        extractor: Arc<dyn LineageExtractor>,
    ) -> Result<(), LineageError> {
        if self.extractors.contains_key(&task_type) {
            return Err(LineageError::DuplicateExtractor(task_type));
        }
        tracing::info!("Registered extractor {} for task type {}", extractor.name(), task_type);
        self.extractors.insert(task_type, extractor);
        Ok(())
    }

    pub fn get(&self, task_type: i32) -> Result<Arc<dyn LineageExtractor>, LineageError> {
        self.extractors
            .get(&task_type)
            .cloned()
            .ok_or(LineageError::UnsupportedTaskType(task_type))
    }

    /// Registered codes with their extractor names, sorted by code
    pub fn task_types(&self) -> Vec<(i32, &'static str)> {
        let mut types: Vec<(i32, &'static str)> = self
            .extractors
            .iter()
            .map(|(code, extractor)| (*code, extractor.name()))
            .collect();
        types.sort_by_key(|(code, _)| *code);
        types
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults(hive2storage::DEFAULT_TARGET_PLATFORM)
    }
}
