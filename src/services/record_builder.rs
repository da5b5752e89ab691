use crate::models::{DatasetRole, LineageRecord, TaskExecutionRecord};

/// Shared job metadata stamped onto every record of one extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageRecordBuilder {
    app_id: i32,
    flow_exec_id: i64,
    task_name: String,
    task_id: i64,
    catalog_id: i32,
    operation: Option<String>,
    start_time: i64,
    end_time: i64,
    flow_path: String,
}

impl LineageRecordBuilder {
    /// `connector` names the extraction strategy in the flow path
    pub fn new(
        record: &TaskExecutionRecord,
        connector: &str,
        flow_exec_id: i64,
        task_id: i64,
        catalog_id: i32,
    ) -> Self {
        Self {
            app_id: record.app_id,
            flow_exec_id,
            task_name: record.task_name.clone(),
            task_id,
            catalog_id,
            operation: None,
            start_time: record.task_start_time,
            end_time: record.task_end_time,
            flow_path: format!("{}/{}/{}", connector, record.task_name, flow_exec_id),
        }
    }

    pub fn with_operation(mut self, operation: Option<&str>) -> Self {
        self.operation = operation.map(str::to_string);
        self
    }

    pub fn flow_path(&self) -> &str {
        &self.flow_path
    }

    pub fn record(&self, dataset_path: &str, platform: &str, role: DatasetRole) -> LineageRecord {
        // This log format carries no row counts
        LineageRecord {
            app_id: self.app_id,
            flow_exec_id: self.flow_exec_id,
            task_name: self.task_name.clone(),
            task_id: self.task_id,
            catalog_id: self.catalog_id,
            dataset_path: dataset_path.to_string(),
            platform: platform.to_string(),
            role,
            operation: self.operation.clone(),
            record_count: 0,
            insert_count: 0,
            delete_count: 0,
            update_count: 0,
            start_time: self.start_time,
            end_time: self.end_time,
            flow_path: self.flow_path.clone(),
        }
    }

    /// One source record per table, in the given order, then the target record last
    pub fn build(
        &self,
        sources: &[String],
        source_platform: &str,
        target: &str,
        target_platform: &str,
    ) -> Vec<LineageRecord> {
        sources
            .iter()
            .map(|table| self.record(table, source_platform, DatasetRole::Source))
            .chain(std::iter::once(self.record(target, target_platform, DatasetRole::Target)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> LineageRecordBuilder {
        let record = TaskExecutionRecord {
            app_id: 31,
            task_type: 72,
            task_id: "9001".to_string(),
            task_name: "daily_sales_export".to_string(),
            task_start_time: 1491004800,
            task_end_time: 1491008400,
        };
        LineageRecordBuilder::new(&record, "hive2storage", 20170401, 9001, 10)
    }

    #[test]
    fn test_flow_path() {
        assert_eq!(builder().flow_path(), "hive2storage/daily_sales_export/20170401");
    }

    #[test]
    fn test_build_orders_sources_before_target() {
        let sources = vec!["db.orders".to_string(), "db.customers".to_string()];
        let records = builder()
            .with_operation(Some("INSERT"))
            .build(&sources, "hive", "/warehouse/db/sales", "hdfs");

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].dataset_path, "db.orders");
        assert_eq!(records[1].dataset_path, "db.customers");
        assert!(records[..2].iter().all(|r| r.role == DatasetRole::Source && r.platform == "hive"));

        let target = records.last().unwrap();
        assert_eq!(target.role, DatasetRole::Target);
        assert_eq!(target.platform, "hdfs");
        assert_eq!(target.operation.as_deref(), Some("INSERT"));
        assert_eq!(target.record_count + target.insert_count, 0);
        assert_eq!(target.start_time, 1491004800);
    }

    #[test]
    fn test_build_without_sources() {
        let records = builder().build(&[], "hive", "/warehouse/db/sales", "hdfs");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, DatasetRole::Target);
    }
}
