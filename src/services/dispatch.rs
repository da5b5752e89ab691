use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::LineageError;
use crate::models::{ExtractionRequest, LineageRecord};
use crate::services::extractor::{ExtractionPhase, ExtractorRegistry, LineageExtractor};
use crate::services::log_locator::LogLocator;
use crate::storage::LineageSink;

/// Acknowledgement sent back for every request, whatever its outcome
pub const FINISHED: &str = "finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Received,
    Locating,
    Parsing,
    Analyzing,
    Building,
    Sinking,
    Acknowledged,
    Error,
}

/// Result of one request as reported to its originator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub request_id: String,
    pub task: String,
    pub state: WorkerState,
    /// Stage the request was in when it failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<WorkerState>,
    pub record_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionOutcome {
    fn succeeded(request: &ExtractionRequest, record_count: usize) -> Self {
        Self {
            request_id: request.id.clone(),
            task: request.record.to_string(),
            state: WorkerState::Acknowledged,
            failed_at: None,
            record_count,
            error: None,
        }
    }

    fn failed(request: &ExtractionRequest, stage: WorkerState, error: String) -> Self {
        Self {
            request_id: request.id.clone(),
            task: request.record.to_string(),
            state: WorkerState::Error,
            failed_at: Some(stage),
            record_count: 0,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == WorkerState::Acknowledged
    }

    pub fn ack(&self) -> &'static str {
        FINISHED
    }
}

/// Drives one request through locate, extract and sink
pub struct DispatchWorker {
    registry: Arc<ExtractorRegistry>,
    locator: Arc<LogLocator>,
    sink: Arc<dyn LineageSink>,
}

impl DispatchWorker {
    pub fn new(
        registry: Arc<ExtractorRegistry>,
        locator: Arc<LogLocator>,
        sink: Arc<dyn LineageSink>,
    ) -> Self {
        Self {
            registry,
            locator,
            sink,
        }
    }

    /// Process one request. Failures are logged and reported in the outcome, never returned.
    pub async fn process(&self, request: &ExtractionRequest) -> ExtractionOutcome {
        tracing::debug!("Worker received {}", request);
        let mut state = WorkerState::Received;

        let outcome = match self.run(request, &mut state).await {
            Ok(count) => {
                tracing::info!("{:03} lineage records extracted from [{}]", count, request);
                ExtractionOutcome::succeeded(request, count)
            }
            Err(e) => {
                let report = anyhow::Error::new(e);
                tracing::error!(
                    request = %request,
                    stage = ?state,
                    "Failed to extract lineage: {:?}",
                    report
                );
                ExtractionOutcome::failed(request, state, report.to_string())
            }
        };

        tracing::debug!("Worker finished for {}", request);
        outcome
    }

    async fn run(
        &self,
        request: &ExtractionRequest,
        state: &mut WorkerState,
    ) -> Result<usize, LineageError> {
        let extractor = self.registry.get(request.record.task_type)?;
        let catalog_id = request.default_catalog_id()?;

        advance(state, WorkerState::Locating, request);
        let log_path = self.locator.locate(request).await?;

        advance(state, WorkerState::Parsing, request);
        let phase = Arc::new(Mutex::new(WorkerState::Parsing));
        let extracted = extract_blocking(extractor, log_path, request, catalog_id, phase.clone()).await;
        let reached = phase.lock().map(|reached| *reached).ok();
        if let Some(reached) = reached {
            advance(state, reached, request);
        }
        let records = extracted?;

        advance(state, WorkerState::Sinking, request);
        let mut writer = self.sink.writer();
        for record in &records {
            writer.append(record).await?;
        }
        writer.flush().await?;

        advance(state, WorkerState::Acknowledged, request);
        Ok(records.len())
    }
}

fn advance(state: &mut WorkerState, next: WorkerState, request: &ExtractionRequest) {
    if *state != next {
        tracing::debug!("{:?} -> {:?} for {}", state, next, request);
        *state = next;
    }
}

impl From<ExtractionPhase> for WorkerState {
    fn from(phase: ExtractionPhase) -> Self {
        match phase {
            ExtractionPhase::Parsing => WorkerState::Parsing,
            ExtractionPhase::Analyzing => WorkerState::Analyzing,
            ExtractionPhase::Building => WorkerState::Building,
        }
    }
}

/// The extractor reads files, so it runs on the blocking pool.
/// A panic inside it is resumed on the worker task for the supervisor to report.
async fn extract_blocking(
    extractor: Arc<dyn LineageExtractor>,
    log_path: PathBuf,
    request: &ExtractionRequest,
    catalog_id: i32,
    phase: Arc<Mutex<WorkerState>>,
) -> Result<Vec<LineageRecord>, LineageError> {
    let record = request.record.clone();
    let task = tokio::task::spawn_blocking(move || {
        let progress = |reached: ExtractionPhase| {
            if let Ok(mut current) = phase.lock() {
                *current = reached.into();
            }
        };
        extractor.extract_reporting(&log_path, &record, catalog_id, &progress)
    });

    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(LineageError::LogParse(format!("Extraction task cancelled: {}", e))),
    }
}

struct Envelope {
    request: ExtractionRequest,
    reply: Option<oneshot::Sender<ExtractionOutcome>>,
}

/// Submits requests to a running dispatcher
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Envelope>,
}

impl DispatchHandle {
    /// Submit a request and wait for its acknowledgement
    pub async fn submit(&self, request: ExtractionRequest) -> Result<ExtractionOutcome, LineageError> {
        let (reply, ack) = oneshot::channel();
        self.tx
            .send(Envelope {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| LineageError::Config("Dispatcher is not running".to_string()))?;

        ack.await
            .map_err(|_| LineageError::Config("Dispatcher dropped the request".to_string()))
    }

    /// Submit without waiting; the outcome is only seen on the outcome channel
    pub async fn send(&self, request: ExtractionRequest) -> Result<(), LineageError> {
        self.tx
            .send(Envelope {
                request,
                reply: None,
            })
            .await
            .map_err(|_| LineageError::Config("Dispatcher is not running".to_string()))
    }
}

/// Runs each request as its own supervised task with bounded parallelism
pub struct Dispatcher {
    worker: Arc<DispatchWorker>,
    max_workers: usize,
    queue_capacity: usize,
    outcomes: Option<mpsc::Sender<ExtractionOutcome>>,
}

impl Dispatcher {
    pub fn new(worker: DispatchWorker, max_workers: usize, queue_capacity: usize) -> Self {
        Self {
            worker: Arc::new(worker),
            max_workers: max_workers.max(1),
            queue_capacity: queue_capacity.max(1),
            outcomes: None,
        }
    }

    /// Also publish every outcome on `outcomes`. The channel is bounded;
    /// outcomes that do not fit are dropped with a warning, acks are unaffected.
    pub fn with_outcomes(mut self, outcomes: mpsc::Sender<ExtractionOutcome>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    /// Start the dispatch loop. It ends, after draining in-flight requests,
    /// once every handle has been dropped.
    pub fn start(self) -> (DispatchHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        tracing::info!(
            "Starting lineage dispatcher (workers: {}, queue: {})",
            self.max_workers,
            self.queue_capacity
        );
        let join = tokio::spawn(self.run(rx));

        (DispatchHandle { tx }, join)
    }

    async fn run(self, mut rx: mpsc::Receiver<Envelope>) {
        let permits = Arc::new(Semaphore::new(self.max_workers));
        let mut in_flight = JoinSet::new();

        while let Some(envelope) = rx.recv().await {
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let worker = self.worker.clone();
            let outcomes = self.outcomes.clone();

            in_flight.spawn(async move {
                let Envelope { request, reply } = envelope;
                let task_request = request.clone();
                let task = tokio::spawn(async move { worker.process(&task_request).await });

                let outcome = match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!("Worker for {} aborted: {}", request, e);
                        ExtractionOutcome::failed(&request, WorkerState::Error, format!("Worker aborted: {}", e))
                    }
                };
                drop(permit);

                if let Some(outcomes) = outcomes {
                    publish(&outcomes, &outcome);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            });

            // Reap finished supervisors so the set does not grow unbounded
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        tracing::info!("Lineage dispatcher stopped");
    }
}

fn publish(outcomes: &mpsc::Sender<ExtractionOutcome>, outcome: &ExtractionOutcome) {
    match outcomes.try_send(outcome.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            tracing::warn!("Outcome channel full, dropping outcome of {}", dropped.request_id)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Totals over a stream of outcomes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeTally {
    pub succeeded: usize,
    pub failed: usize,
    pub records: usize,
}

/// Consume outcomes until every publisher is gone, logging each one
pub async fn drain_outcomes(mut outcomes: mpsc::Receiver<ExtractionOutcome>) -> OutcomeTally {
    let mut tally = OutcomeTally::default();
    while let Some(outcome) = outcomes.recv().await {
        if outcome.is_success() {
            tally.succeeded += 1;
            tally.records += outcome.record_count;
        } else {
            tally.failed += 1;
        }
        tracing::debug!(
            "Outcome {} for {}: {:?}",
            outcome.request_id,
            outcome.task,
            outcome.state
        );
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{keys, DatasetRole, TaskExecutionRecord};
    use crate::services::transport::testing::{FetchBehavior, RecordingTransport};
    use crate::storage::MemorySink;
    use std::collections::BTreeMap;
    use std::path::Path;

    const SQL: &str =
        "INSERT OVERWRITE TABLE db.sales SELECT * FROM db.orders o JOIN db.customers c ON o.cid = c.id";

    fn write_log(base: &Path, task_id: &str, sql: &str, run_date: &str) {
        let path = base.join("logtasklog/72").join(task_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let xml = format!(
            "<taskLog><curRunDate>{}</curRunDate><extProperties>\
             <entry><destFilePath>/warehouse/db/sales</destFilePath></entry>\
             <entry><filterSQL><![CDATA[{}]]></filterSQL></entry>\
             </extProperties></taskLog>",
            run_date, sql
        );
        std::fs::write(path, xml).unwrap();
    }

    fn request(task_type: i32, task_id: &str, props: &[(&str, &str)]) -> ExtractionRequest {
        let record = TaskExecutionRecord {
            app_id: 31,
            task_type,
            task_id: task_id.to_string(),
            task_name: "daily_sales_export".to_string(),
            task_start_time: 1491004800,
            task_end_time: 1491008400,
        };
        let mut properties: BTreeMap<String, String> = props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        properties
            .entry(keys::DEFAULT_CATALOG_ID.to_string())
            .or_insert_with(|| "10".to_string());
        ExtractionRequest::new(record, properties)
    }

    fn worker(transport: Arc<RecordingTransport>, sink: &MemorySink) -> DispatchWorker {
        DispatchWorker::new(
            Arc::new(ExtractorRegistry::default()),
            Arc::new(LogLocator::new(transport)),
            Arc::new(sink.clone()),
        )
    }

    fn idle_transport() -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport::new(PathBuf::from("/nonexistent"), FetchBehavior::Succeed))
    }

    #[tokio::test]
    async fn test_local_extraction_sinks_all_records() {
        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "1001", SQL, "20170401");
        let dir = logs.path().to_string_lossy().to_string();

        let sink = MemorySink::new();
        let outcome = worker(idle_transport(), &sink)
            .process(&request(72, "1001", &[(keys::LOCAL_LOG_DIR, &dir)]))
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.record_count, 3);
        assert_eq!(outcome.ack(), "finished");

        let records = sink.records();
        let paths: Vec<&str> = records.iter().map(|r| r.dataset_path.as_str()).collect();
        assert_eq!(paths, vec!["db.orders", "db.customers", "/warehouse/db/sales"]);
        assert_eq!(records.last().unwrap().role, DatasetRole::Target);
        assert_eq!(sink.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_task_type() {
        let sink = MemorySink::new();
        let transport = idle_transport();
        let outcome = worker(transport.clone(), &sink)
            .process(&request(99, "1001", &[(keys::LOG_REMOTE, "true")]))
            .await;

        assert_eq!(outcome.state, WorkerState::Error);
        assert_eq!(outcome.failed_at, Some(WorkerState::Received));
        assert!(outcome.error.unwrap().contains("Unsupported task type: 99"));
        assert!(sink.records().is_empty());
        assert_eq!(transport.opened.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_sinks_nothing() {
        let cache = tempfile::tempdir().unwrap();
        let cache_dir = cache.path().to_string_lossy().to_string();
        let transport = Arc::new(RecordingTransport::new(
            PathBuf::from("/nonexistent"),
            FetchBehavior::MissingRemoteFile,
        ));
        let sink = MemorySink::new();

        let outcome = worker(transport.clone(), &sink)
            .process(&request(
                72,
                "1001",
                &[
                    (keys::LOG_REMOTE, "true"),
                    (keys::LOCAL_LOG_DIR, &cache_dir),
                    (keys::REMOTE_HOST, "runner-01"),
                    (keys::REMOTE_USER, "etl"),
                    (keys::PRIVATE_KEY, "/home/etl/.ssh/id_rsa"),
                ],
            ))
            .await;

        assert_eq!(outcome.failed_at, Some(WorkerState::Locating));
        assert!(outcome.error.unwrap().starts_with("Log unavailable"));
        assert!(sink.records().is_empty());
        assert_eq!(sink.flush_count(), 0);
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_non_numeric_run_date_fails_at_building() {
        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "1001", SQL, "yesterday");
        let dir = logs.path().to_string_lossy().to_string();

        let sink = MemorySink::new();
        let outcome = worker(idle_transport(), &sink)
            .process(&request(72, "1001", &[(keys::LOCAL_LOG_DIR, &dir)]))
            .await;

        assert_eq!(outcome.failed_at, Some(WorkerState::Building));
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_acknowledges_every_request() {
        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "1001", SQL, "20170401");
        write_log(logs.path(), "1002", "SELECT * FROM db.events", "20170402");
        let dir = logs.path().to_string_lossy().to_string();

        let sink = MemorySink::new();
        let (outcome_tx, outcome_rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(worker(idle_transport(), &sink), 2, 8).with_outcomes(outcome_tx);
        let (handle, join) = dispatcher.start();

        let requests = vec![
            request(72, "1001", &[(keys::LOCAL_LOG_DIR, &dir)]),
            request(72, "1002", &[(keys::LOCAL_LOG_DIR, &dir)]),
            request(72, "missing", &[(keys::LOCAL_LOG_DIR, &dir)]),
            request(5, "1001", &[(keys::LOCAL_LOG_DIR, &dir)]),
        ];
        let acks = futures::future::join_all(requests.into_iter().map(|r| {
            let handle = handle.clone();
            async move { handle.submit(r).await.unwrap() }
        }))
        .await;

        assert_eq!(acks.len(), 4);
        assert!(acks.iter().all(|o| o.ack() == FINISHED));
        assert_eq!(acks.iter().filter(|o| o.is_success()).count(), 2);
        assert_eq!(sink.records().len(), 5);

        drop(handle);
        join.await.unwrap();

        let tally = drain_outcomes(outcome_rx).await;
        assert_eq!(
            tally,
            OutcomeTally {
                succeeded: 2,
                failed: 2,
                records: 5
            }
        );
    }

    #[tokio::test]
    async fn test_unread_outcomes_stay_bounded() {
        let sink = MemorySink::new();
        let (outcome_tx, outcome_rx) = mpsc::channel(2);
        let (handle, join) = Dispatcher::new(worker(idle_transport(), &sink), 4, 8)
            .with_outcomes(outcome_tx)
            .start();

        for i in 0..20 {
            let outcome = handle.submit(request(99, &i.to_string(), &[])).await.unwrap();
            assert_eq!(outcome.ack(), FINISHED);
        }
        drop(handle);
        join.await.unwrap();

        assert_eq!(outcome_rx.len(), 2);
    }

    struct PanickingExtractor;

    impl LineageExtractor for PanickingExtractor {
        fn extract_reporting(
            &self,
            _log_path: &Path,
            _record: &TaskExecutionRecord,
            _default_catalog_id: i32,
            _progress: &dyn Fn(ExtractionPhase),
        ) -> Result<Vec<LineageRecord>, LineageError> {
            panic!("extractor bug")
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_panicking_extractor_is_contained() {
        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "1001", SQL, "20170401");
        let dir = logs.path().to_string_lossy().to_string();

        let mut registry = ExtractorRegistry::default();
        registry.register(90, Arc::new(PanickingExtractor)).unwrap();
        let sink = MemorySink::new();
        let worker = DispatchWorker::new(
            Arc::new(registry),
            Arc::new(LogLocator::new(idle_transport())),
            Arc::new(sink.clone()),
        );
        let (handle, join) = Dispatcher::new(worker, 2, 8).start();

        let (panicked, sibling) = tokio::join!(
            handle.submit(request(90, "1001", &[(keys::LOCAL_LOG_DIR, &dir)])),
            handle.submit(request(72, "1001", &[(keys::LOCAL_LOG_DIR, &dir)])),
        );
        let panicked = panicked.unwrap();
        let sibling = sibling.unwrap();

        assert_eq!(panicked.state, WorkerState::Error);
        assert_eq!(panicked.failed_at, Some(WorkerState::Error));
        assert_eq!(panicked.ack(), FINISHED);
        assert!(panicked.error.unwrap().starts_with("Worker aborted"));

        assert!(sibling.is_success());
        assert_eq!(sibling.record_count, 3);
        assert_eq!(sink.records().len(), 3);

        drop(handle);
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let sink = MemorySink::new();
        let (handle, join) = Dispatcher::new(worker(idle_transport(), &sink), 1, 1).start();
        join.abort();
        let _ = join.await;

        let result = handle.submit(request(72, "1", &[])).await;
        assert!(result.is_err());
    }
}
