use std::path::Path;

use super::{ExtractionPhase, LineageExtractor};
use crate::analysis::{SqlLineageAnalyzer, SqlOperation};
use crate::error::{parse_numeric, LineageError};
use crate::models::{LineageRecord, TaskExecutionRecord};
use crate::services::log_parser::{XmlLogParser, RUN_DATE_FIELD};
use crate::services::record_builder::LineageRecordBuilder;

pub const CONNECTOR: &str = "hive2storage";
pub const SOURCE_PLATFORM: &str = "hive";
pub const DEFAULT_TARGET_PLATFORM: &str = "hdfs";

/// Lineage of a Hive query whose result is exported to a filesystem path
pub struct Hive2StorageExtractor {
    target_platform: String,
}

impl Hive2StorageExtractor {
    pub fn new(target_platform: &str) -> Self {
        Self {
            target_platform: target_platform.to_string(),
        }
    }
}

impl Default for Hive2StorageExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_PLATFORM)
    }
}

impl LineageExtractor for Hive2StorageExtractor {
    fn extract_reporting(
        &self,
        log_path: &Path,
        record: &TaskExecutionRecord,
        default_catalog_id: i32,
        progress: &dyn Fn(ExtractionPhase),
    ) -> Result<Vec<LineageRecord>, LineageError> {
        progress(ExtractionPhase::Parsing);
        let fields = XmlLogParser::parse_file(log_path)?;

        progress(ExtractionPhase::Analyzing);
        let analysis = SqlLineageAnalyzer::analyze(&fields.sql);

        progress(ExtractionPhase::Building);
        let flow_exec_id: i64 = parse_numeric(
            RUN_DATE_FIELD,
            fields.run_date.as_deref().unwrap_or_default(),
        )?;
        let task_id = record.numeric_task_id()?;

        let operation = match analysis.operation {
            SqlOperation::Unknown => None,
            known => Some(known.as_str()),
        };

        let records = LineageRecordBuilder::new(record, CONNECTOR, flow_exec_id, task_id, default_catalog_id)
            .with_operation(operation)
            .build(
                &analysis.sources,
                SOURCE_PLATFORM,
                &fields.dest_path,
                &self.target_platform,
            );

        tracing::debug!(
            "{} source table(s) and target {} for {}",
            analysis.sources.len(),
            fields.dest_path,
            record
        );
        Ok(records)
    }

    fn name(&self) -> &'static str {
        CONNECTOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DatasetRole;
    use std::io::Write;

    fn record() -> TaskExecutionRecord {
        TaskExecutionRecord {
            app_id: 31,
            task_type: 72,
            task_id: "20170401001".to_string(),
            task_name: "daily_sales_export".to_string(),
            task_start_time: 1491004800,
            task_end_time: 1491008400,
        }
    }

    fn log_file(sql: &str, run_date: &str) -> tempfile::NamedTempFile {
        let xml = format!(
            r#"<taskLog>
  <curRunDate>{}</curRunDate>
  <extProperties>
    <entry><destFilePath>/warehouse/db/sales</destFilePath></entry>
    <entry><filterSQL><![CDATA[{}]]></filterSQL></entry>
  </extProperties>
</taskLog>"#,
            run_date, sql
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(xml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_insert_overwrite_lineage() {
        let log = log_file(
            "INSERT OVERWRITE TABLE db.sales SELECT * FROM db.orders o JOIN db.customers c ON o.cid = c.id",
            "20170401",
        );
        let records = Hive2StorageExtractor::default()
            .extract(log.path(), &record(), 10)
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].dataset_path, "db.orders");
        assert_eq!(records[1].dataset_path, "db.customers");
        assert!(records[..2].iter().all(|r| r.role == DatasetRole::Source && r.platform == "hive"));

        let target = &records[2];
        assert_eq!(target.role, DatasetRole::Target);
        assert_eq!(target.platform, "hdfs");
        assert_eq!(target.dataset_path, "/warehouse/db/sales");
        assert_eq!(target.flow_exec_id, 20170401);
        assert_eq!(target.task_id, 20170401001);
        assert_eq!(target.catalog_id, 10);
        assert_eq!(target.flow_path, "hive2storage/daily_sales_export/20170401");
        assert_eq!(target.operation.as_deref(), Some("INSERT"));
    }

    #[test]
    fn test_directory_export_lineage() {
        let log = log_file(
            "INSERT OVERWRITE DIRECTORY '/warehouse/db/sales' SELECT * FROM db.orders o JOIN db.customers c ON o.cid = c.id",
            "20170401",
        );
        let records = Hive2StorageExtractor::default()
            .extract(log.path(), &record(), 10)
            .unwrap();

        let paths: Vec<&str> = records.iter().map(|r| r.dataset_path.as_str()).collect();
        assert_eq!(paths, vec!["db.orders", "db.customers", "/warehouse/db/sales"]);
        assert_eq!(records[2].role, DatasetRole::Target);
        assert_eq!(records[2].operation.as_deref(), Some("INSERT"));
    }

    #[test]
    fn test_view_definition_lineage() {
        let log = log_file("CREATE VIEW db.v AS SELECT * FROM db.a JOIN db.b ON db.a.id = db.b.id", "20170401");
        let records = Hive2StorageExtractor::default()
            .extract(log.path(), &record(), 10)
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].dataset_path, "db.a");
        assert_eq!(records[1].dataset_path, "db.b");
        assert_eq!(records[2].operation.as_deref(), Some("CREATE_TABLE_AS"));
    }

    #[test]
    fn test_duplicate_sources_collapse() {
        let log = log_file(
            "SELECT a.id FROM db.a a JOIN db.b b ON a.id = b.id JOIN db.a a2 ON a2.id = b.id",
            "20170401",
        );
        let records = Hive2StorageExtractor::default()
            .extract(log.path(), &record(), 10)
            .unwrap();

        let paths: Vec<&str> = records.iter().map(|r| r.dataset_path.as_str()).collect();
        assert_eq!(paths, vec!["db.a", "db.b", "/warehouse/db/sales"]);
    }

    #[test]
    fn test_unparseable_sql_still_yields_target() {
        let log = log_file("NOT A STATEMENT", "20170401");
        let records = Hive2StorageExtractor::default()
            .extract(log.path(), &record(), 10)
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, DatasetRole::Target);
        assert!(records[0].operation.is_none());
    }

    #[test]
    fn test_non_numeric_run_date() {
        let log = log_file("SELECT * FROM db.a", "2017-04-01");
        let result = Hive2StorageExtractor::default().extract(log.path(), &record(), 10);
        assert!(matches!(result, Err(LineageError::NumericField { .. })));
    }

    #[test]
    fn test_non_numeric_task_id() {
        let log = log_file("SELECT * FROM db.a", "20170401");
        let mut rec = record();
        rec.task_id = "task-a".to_string();
        let result = Hive2StorageExtractor::default().extract(log.path(), &rec, 10);
        assert!(matches!(result, Err(LineageError::NumericField { ref field, .. }) if field == "task_id"));
    }

    #[test]
    fn test_phases_reported_in_order() {
        let log = log_file("SELECT * FROM db.a", "20170401");
        let phases = std::sync::Mutex::new(Vec::new());
        Hive2StorageExtractor::default()
            .extract_reporting(log.path(), &record(), 10, &|phase| phases.lock().unwrap().push(phase))
            .unwrap();

        assert_eq!(
            phases.into_inner().unwrap(),
            vec![
                ExtractionPhase::Parsing,
                ExtractionPhase::Analyzing,
                ExtractionPhase::Building
            ]
        );
    }

    #[test]
    fn test_configured_target_platform() {
        let log = log_file("SELECT * FROM db.a", "20170401");
        let records = Hive2StorageExtractor::new("cos")
            .extract(log.path(), &record(), 10)
            .unwrap();
        assert_eq!(records.last().unwrap().platform, "cos");
    }

    #[test]
    fn test_extraction_is_repeatable() {
        let log = log_file(
            "INSERT INTO TABLE db.t SELECT * FROM db.x JOIN db.y ON db.x.k = db.y.k",
            "20170401",
        );
        let extractor = Hive2StorageExtractor::default();
        let first = extractor.extract(log.path(), &record(), 10).unwrap();
        let second = extractor.extract(log.path(), &record(), 10).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }
}
