use std::sync::{Arc, Mutex};

use super::{LineageSink, LineageWriter};
use crate::error::LineageError;
use crate::models::LineageRecord;

/// Keeps flushed records in memory; used for dry runs
#[derive(Clone, Default)]
pub struct MemorySink {
    committed: Arc<Mutex<Vec<LineageRecord>>>,
    flushes: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LineageRecord> {
        self.committed.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().map(|n| *n).unwrap_or_default()
    }
}

impl LineageSink for MemorySink {
    fn writer(&self) -> Box<dyn LineageWriter> {
        Box::new(MemoryWriter {
            sink: self.clone(),
            pending: Vec::new(),
        })
    }
}

struct MemoryWriter {
    sink: MemorySink,
    pending: Vec<LineageRecord>,
}

#[async_trait::async_trait]
impl LineageWriter for MemoryWriter {
    async fn append(&mut self, record: &LineageRecord) -> Result<(), LineageError> {
        self.pending.push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), LineageError> {
        let mut committed = self
            .sink
            .committed
            .lock()
            .map_err(|_| LineageError::Sink("memory sink poisoned".to_string()))?;
        committed.append(&mut self.pending);

        let mut flushes = self
            .sink
            .flushes
            .lock()
            .map_err(|_| LineageError::Sink("memory sink poisoned".to_string()))?;
        *flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DatasetRole;

    fn record(path: &str) -> LineageRecord {
        LineageRecord {
            app_id: 31,
            flow_exec_id: 20170401,
            task_name: "t".to_string(),
            task_id: 1,
            catalog_id: 10,
            dataset_path: path.to_string(),
            platform: "hive".to_string(),
            role: DatasetRole::Source,
            operation: None,
            record_count: 0,
            insert_count: 0,
            delete_count: 0,
            update_count: 0,
            start_time: 0,
            end_time: 0,
            flow_path: "hive2storage/t/20170401".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unflushed_writer_persists_nothing() {
        let sink = MemorySink::new();
        {
            let mut writer = sink.writer();
            writer.append(&record("db.a")).await.unwrap();
        }
        assert!(sink.records().is_empty());

        let mut writer = sink.writer();
        writer.append(&record("db.b")).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.flush_count(), 1);
    }
}
