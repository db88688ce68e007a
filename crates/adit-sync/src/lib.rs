//! Ingestion pipeline orchestration and the single-flight refresh
//! coordinator.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use adit_core::{clean_records, CanonicalRecord};
use adit_scrape::{ScrapeConfig, Scraper};
use adit_store::{AdmissionsStore, WireRecord};

pub const CRATE_NAME: &str = "adit-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub base_url: String,
    pub listing_pages: u32,
    pub workers: usize,
    pub http_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub enrich_url: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/grad_data".to_string()),
            base_url: std::env::var("ADIT_BASE_URL")
                .unwrap_or_else(|_| adit_scrape::DEFAULT_BASE_URL.to_string()),
            listing_pages: std::env::var("ADIT_LISTING_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(adit_scrape::DEFAULT_LISTING_PAGES),
            workers: std::env::var("ADIT_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(adit_scrape::DEFAULT_POOL_SIZE),
            http_timeout_secs: std::env::var("ADIT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            data_dir: std::env::var("ADIT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            enrich_url: std::env::var("ADIT_ENRICH_URL").ok(),
        }
    }

    fn scrape_config(&self) -> ScrapeConfig {
        ScrapeConfig {
            base_url: self.base_url.clone(),
            listing_pages: self.listing_pages,
            workers: self.workers,
            timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

/// The two standardized names the external normalization service returns.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Enrichment {
    #[serde(rename = "llm-generated-program")]
    pub program: String,
    #[serde(rename = "llm-generated-university")]
    pub university: String,
}

/// Boundary to the external program/university normalization service. The
/// pipeline treats it as an opaque per-record call; failures degrade to
/// unenriched fields.
#[async_trait]
pub trait EnrichmentService: Send + Sync {
    async fn enrich(&self, program: &str, university: &str) -> Result<Enrichment>;
}

#[derive(Debug)]
pub struct HttpEnrichmentService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEnrichmentService {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building enrichment client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl EnrichmentService for HttpEnrichmentService {
    async fn enrich(&self, program: &str, university: &str) -> Result<Enrichment> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "program": program,
                "university": university,
            }))
            .send()
            .await
            .context("calling enrichment service")?
            .error_for_status()
            .context("enrichment service returned an error status")?;
        resp.json().await.context("decoding enrichment response")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    NoNew,
    Updated,
}

/// What a completed refresh reports back through the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub status: RefreshStatus,
    pub records: u64,
}

/// The unit of work the coordinator serializes. The pipeline implements it;
/// tests substitute stubs.
#[async_trait]
pub trait RefreshJob: Send + Sync {
    async fn refresh(&self) -> Result<RefreshOutcome>;
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RefreshStatus,
    pub records_scraped: usize,
    pub records_inserted: u64,
}

#[derive(Debug, Clone, Copy)]
enum IngestMode {
    Incremental,
    Backfill,
}

/// Scrape, clean, enrich, persist. One instance is shared across runs; the
/// coordinator guarantees only one run is in flight.
pub struct IngestPipeline {
    config: SyncConfig,
    scraper: Scraper,
    store: AdmissionsStore,
    enrichment: Option<Box<dyn EnrichmentService>>,
}

impl IngestPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let scraper = Scraper::new(config.scrape_config())?;
        let store = AdmissionsStore::connect_lazy(&config.database_url)
            .context("configuring admissions store")?;
        let enrichment: Option<Box<dyn EnrichmentService>> = match &config.enrich_url {
            Some(endpoint) => Some(Box::new(HttpEnrichmentService::new(
                endpoint.clone(),
                Duration::from_secs(config.http_timeout_secs),
            )?)),
            None => None,
        };
        Ok(Self {
            config,
            scraper,
            store,
            enrichment,
        })
    }

    pub fn with_enrichment(mut self, service: Box<dyn EnrichmentService>) -> Self {
        self.enrichment = Some(service);
        self
    }

    pub fn store(&self) -> &AdmissionsStore {
        &self.store
    }

    /// Incremental run: only records above the stored watermark and outside
    /// the known-URL set are scraped and loaded.
    pub async fn run_refresh(&self) -> Result<IngestSummary> {
        self.run(IngestMode::Incremental).await
    }

    /// Full sweep with no incremental bounds. The idempotent loader makes
    /// overlapping re-loads safe.
    pub async fn run_backfill(&self) -> Result<IngestSummary> {
        self.run(IngestMode::Backfill).await
    }

    async fn run(&self, mode: IngestMode) -> Result<IngestSummary> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("ingest_run", %run_id);
        self.run_inner(run_id, mode).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, mode: IngestMode) -> Result<IngestSummary> {
        let started_at = Utc::now();

        let (min_result_id, known_urls) = match mode {
            IngestMode::Incremental => {
                let known = self.store.existing_urls().await;
                let min = self.store.max_result_id().await.map(|max| max + 1);
                (min, known)
            }
            IngestMode::Backfill => (None, HashSet::new()),
        };
        info!(
            ?min_result_id,
            known_urls = known_urls.len(),
            "starting scrape"
        );

        let raw = self.scraper.scrape(min_result_id, &known_urls).await;
        if raw.is_empty() {
            info!("no new records on the board");
            return Ok(IngestSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                status: RefreshStatus::NoNew,
                records_scraped: 0,
                records_inserted: 0,
            });
        }

        let canonical = clean_records(&raw).context("cleaning scraped records")?;
        let wires = self.build_wire_records(&canonical).await;
        let delta_path = self.write_artifacts(&wires).await?;
        let records_inserted = self
            .store
            .load_jsonl(&delta_path)
            .await
            .context("loading records into the admissions store")?;

        Ok(IngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status: RefreshStatus::Updated,
            records_scraped: canonical.len(),
            records_inserted,
        })
    }

    /// Attach enrichment to each cleaned record. A failed service call
    /// leaves that record unenriched and never aborts the batch.
    async fn build_wire_records(&self, records: &[CanonicalRecord]) -> Vec<WireRecord> {
        let mut wires = Vec::with_capacity(records.len());
        for record in records {
            let enrichment = match &self.enrichment {
                Some(service) => match service.enrich(&record.program, &record.university).await {
                    Ok(enrichment) => Some(enrichment),
                    Err(err) => {
                        warn!(url = %record.url, error = %err, "enrichment failed; loading unenriched");
                        None
                    }
                },
                None => None,
            };
            wires.push(wire_from_canonical(record, enrichment));
        }
        wires
    }

    /// Write the delta artifact for this run and append it to the cumulative
    /// dataset, then hand the delta path to the loader.
    async fn write_artifacts(&self, wires: &[WireRecord]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.data_dir)
            .await
            .with_context(|| format!("creating {}", self.config.data_dir.display()))?;

        let mut body = String::new();
        for wire in wires {
            body.push_str(&serde_json::to_string(wire).context("serializing wire record")?);
            body.push('\n');
        }

        let delta_path = self.config.data_dir.join("admissions_new.jsonl");
        tokio::fs::write(&delta_path, &body)
            .await
            .with_context(|| format!("writing {}", delta_path.display()))?;

        let cumulative_path = self.config.data_dir.join("admissions.jsonl");
        let mut cumulative = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cumulative_path)
            .await
            .with_context(|| format!("opening {}", cumulative_path.display()))?;
        cumulative
            .write_all(body.as_bytes())
            .await
            .with_context(|| format!("appending {}", cumulative_path.display()))?;
        cumulative
            .flush()
            .await
            .with_context(|| format!("flushing {}", cumulative_path.display()))?;

        Ok(delta_path)
    }
}

fn wire_from_canonical(record: &CanonicalRecord, enrichment: Option<Enrichment>) -> WireRecord {
    let (llm_program, llm_university) = match enrichment {
        Some(e) => (Some(e.program), Some(e.university)),
        None => (None, None),
    };
    WireRecord {
        university: Some(record.university.clone()),
        program: Some(record.program.clone()),
        comments: record.comments.clone(),
        date_added: Some(record.date_added.clone()),
        url: Some(record.url.clone()),
        status: Some(record.status.clone()),
        status_date: Some(record.status_date.clone()),
        term: Some(record.term.clone()),
        origin: Some(record.origin.clone()),
        gpa: record.gpa.clone(),
        gre_quant: record.gre_quant.clone(),
        gre_verbal: record.gre_verbal.clone(),
        gre_aw: record.gre_aw.clone(),
        degree: Some(record.degree.clone()),
        llm_generated_program: llm_program,
        llm_generated_university: llm_university,
    }
}

#[async_trait]
impl RefreshJob for IngestPipeline {
    async fn refresh(&self) -> Result<RefreshOutcome> {
        let summary = self.run_refresh().await?;
        Ok(RefreshOutcome {
            status: summary.status,
            records: summary.records_inserted,
        })
    }
}

const STARTED_MESSAGE: &str = "Data pull is running. Results will appear once it finishes.";
const BUSY_MESSAGE: &str = "A data pull is already running. Please wait for it to finish.";

#[derive(Debug, Default)]
struct IngestState {
    running: bool,
    pending_info: Option<String>,
    pending_error: Option<String>,
}

/// Status snapshot handed to callers. The info/error fields are one-shot:
/// taking a snapshot clears them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub info_message: Option<String>,
    pub error: Option<String>,
}

/// How a trigger request resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Detached run accepted and spawned.
    Started,
    /// A run was already in flight; nothing was queued.
    Rejected,
    /// Blocking run finished.
    Completed {
        status: RefreshStatus,
        records: u64,
    },
    /// Blocking run failed; the message is returned, not queued.
    Failed { message: String },
}

/// Single-flight gate around the refresh pipeline. All state lives behind
/// one mutex; concurrent triggers are rejected, never queued.
pub struct IngestCoordinator {
    job: Arc<dyn RefreshJob>,
    state: Mutex<IngestState>,
}

impl IngestCoordinator {
    pub fn new(job: Arc<dyn RefreshJob>) -> Self {
        Self {
            job,
            state: Mutex::new(IngestState::default()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, IngestState> {
        self.state.lock().expect("ingest state mutex poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Read the coordinator state, taking the one-shot message/error slots.
    pub fn status(&self) -> StatusSnapshot {
        let mut state = self.lock_state();
        StatusSnapshot {
            running: state.running,
            info_message: state.pending_info.take(),
            error: state.pending_error.take(),
        }
    }

    /// API-style trigger: run the pipeline in-request and report the result
    /// directly. Rejected when a run is already in flight.
    pub async fn trigger_blocking(&self) -> TriggerOutcome {
        {
            let mut state = self.lock_state();
            if state.running {
                return TriggerOutcome::Rejected;
            }
            state.running = true;
        }

        let result = self.job.refresh().await;

        let mut state = self.lock_state();
        state.running = false;
        drop(state);

        match result {
            Ok(outcome) => TriggerOutcome::Completed {
                status: outcome.status,
                records: outcome.records,
            },
            Err(err) => TriggerOutcome::Failed {
                message: format!("Data pull failed: {err:#}"),
            },
        }
    }

    /// Browser-style trigger: spawn the pipeline and return immediately. A
    /// rejected trigger queues the busy message instead of starting a run;
    /// failures are deferred to the next status read.
    pub fn trigger_detached(self: &Arc<Self>) -> TriggerOutcome {
        {
            let mut state = self.lock_state();
            if state.running {
                state.pending_info = Some(BUSY_MESSAGE.to_string());
                return TriggerOutcome::Rejected;
            }
            state.running = true;
            state.pending_info = Some(STARTED_MESSAGE.to_string());
            state.pending_error = None;
        }

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let result = coordinator.job.refresh().await;
            let mut state = coordinator.lock_state();
            if let Err(err) = result {
                warn!(error = %err, "detached data pull failed");
                state.pending_error = Some(format!("Data pull failed: {err:#}"));
            }
            state.running = false;
        });

        TriggerOutcome::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Notify;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct GatedJob {
        release: Notify,
        runs: AtomicU64,
    }

    impl GatedJob {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                runs: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl RefreshJob for GatedJob {
        async fn refresh(&self) -> Result<RefreshOutcome> {
            self.release.notified().await;
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(RefreshOutcome {
                status: RefreshStatus::Updated,
                records: 1,
            })
        }
    }

    struct FailingJob;

    #[async_trait]
    impl RefreshJob for FailingJob {
        async fn refresh(&self) -> Result<RefreshOutcome> {
            anyhow::bail!("connection refused")
        }
    }

    async fn wait_until_idle(coordinator: &IngestCoordinator) {
        for _ in 0..200 {
            if !coordinator.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("coordinator never returned to idle");
    }

    #[tokio::test]
    async fn concurrent_triggers_are_rejected_without_queueing() {
        let job = GatedJob::new();
        let coordinator = Arc::new(IngestCoordinator::new(job.clone()));

        assert_eq!(coordinator.trigger_detached(), TriggerOutcome::Started);
        assert!(coordinator.is_running());

        // while running, both trigger styles are rejected and no run is queued
        assert_eq!(coordinator.trigger_detached(), TriggerOutcome::Rejected);
        assert_eq!(coordinator.trigger_blocking().await, TriggerOutcome::Rejected);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        job.release.notify_one();
        wait_until_idle(&coordinator).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        // once idle, the next trigger goes through
        job.release.notify_one();
        let outcome = coordinator.trigger_blocking().await;
        assert_eq!(
            outcome,
            TriggerOutcome::Completed {
                status: RefreshStatus::Updated,
                records: 1,
            }
        );
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn status_messages_are_one_shot() {
        let job = GatedJob::new();
        let coordinator = Arc::new(IngestCoordinator::new(job.clone()));

        coordinator.trigger_detached();
        let first = coordinator.status();
        assert!(first.running);
        assert_eq!(first.info_message.as_deref(), Some(STARTED_MESSAGE));

        let second = coordinator.status();
        assert_eq!(second.info_message, None);

        coordinator.trigger_detached();
        assert_eq!(
            coordinator.status().info_message.as_deref(),
            Some(BUSY_MESSAGE)
        );

        job.release.notify_one();
        wait_until_idle(&coordinator).await;
    }

    #[tokio::test]
    async fn detached_failures_surface_on_the_next_status_read_only() {
        let coordinator = Arc::new(IngestCoordinator::new(Arc::new(FailingJob)));
        coordinator.trigger_detached();
        wait_until_idle(&coordinator).await;

        let status = coordinator.status();
        assert!(!status.running);
        let error = status.error.expect("pending error");
        assert!(error.contains("connection refused"));

        assert_eq!(coordinator.status().error, None);
    }

    #[tokio::test]
    async fn blocking_failures_return_the_message_directly() {
        let coordinator = Arc::new(IngestCoordinator::new(Arc::new(FailingJob)));
        match coordinator.trigger_blocking().await {
            TriggerOutcome::Failed { message } => assert!(message.contains("connection refused")),
            other => panic!("expected Failed, got {other:?}"),
        }
        // the failure was reported, not queued
        assert_eq!(coordinator.status().error, None);
        assert!(!coordinator.is_running());
    }

    fn canonical(url: &str) -> CanonicalRecord {
        CanonicalRecord {
            url: url.to_string(),
            university: "MIT".into(),
            program: "Computer Science".into(),
            degree: "PhD".into(),
            term: "Fall 2026".into(),
            date_added: "January 1, 2026".into(),
            status: "Accepted".into(),
            status_date: "01/01/2026".into(),
            origin: "International".into(),
            comments: None,
            gpa: Some("3.80".into()),
            gre_quant: Some("165".into()),
            gre_verbal: Some("160".into()),
            gre_aw: Some("4.50".into()),
        }
    }

    fn test_pipeline(enrich_url: Option<String>) -> IngestPipeline {
        IngestPipeline::new(SyncConfig {
            database_url: "postgres://localhost/adit_test".into(),
            base_url: "https://example.test".into(),
            listing_pages: 1,
            workers: 2,
            http_timeout_secs: 2,
            data_dir: PathBuf::from("./data"),
            enrich_url,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn enrichment_round_trip_merges_the_two_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/standardize"))
            .and(body_partial_json(serde_json::json!({
                "program": "Computer Science",
                "university": "MIT",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "llm-generated-program": "Computer Science",
                "llm-generated-university": "Massachusetts Institute of Technology",
            })))
            .mount(&server)
            .await;

        let pipeline = test_pipeline(Some(format!("{}/standardize", server.uri())));
        let wires = pipeline
            .build_wire_records(&[canonical("https://x/result/1")])
            .await;
        assert_eq!(
            wires[0].llm_generated_university.as_deref(),
            Some("Massachusetts Institute of Technology")
        );
        assert_eq!(
            wires[0].llm_generated_program.as_deref(),
            Some("Computer Science")
        );
    }

    #[tokio::test]
    async fn enrichment_failure_degrades_to_unenriched_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let pipeline = test_pipeline(Some(format!("{}/standardize", server.uri())));
        let wires = pipeline
            .build_wire_records(&[canonical("https://x/result/1"), canonical("https://x/result/2")])
            .await;
        assert_eq!(wires.len(), 2);
        assert_eq!(wires[0].llm_generated_program, None);
        assert_eq!(wires[1].llm_generated_university, None);
        // the rest of the record still rides the wire
        assert_eq!(wires[0].university.as_deref(), Some("MIT"));
    }

    #[tokio::test]
    async fn artifacts_write_a_fresh_delta_and_grow_the_cumulative_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = test_pipeline(None);
        pipeline.config.data_dir = dir.path().to_path_buf();

        let first = pipeline
            .build_wire_records(&[canonical("https://x/result/1")])
            .await;
        let second = pipeline
            .build_wire_records(&[canonical("https://x/result/2")])
            .await;

        let delta = pipeline.write_artifacts(&first).await.unwrap();
        pipeline.write_artifacts(&second).await.unwrap();

        let delta_text = std::fs::read_to_string(&delta).unwrap();
        assert_eq!(delta_text.lines().count(), 1);
        assert!(delta_text.contains("/result/2"));

        let cumulative = std::fs::read_to_string(dir.path().join("admissions.jsonl")).unwrap();
        assert_eq!(cumulative.lines().count(), 2);
        assert!(cumulative.contains("/result/1"));
        assert!(cumulative.contains("/result/2"));
    }

    #[tokio::test]
    async fn wire_records_carry_absent_optionals_as_nulls() {
        let pipeline = test_pipeline(None);
        let mut record = canonical("https://x/result/9");
        record.comments = None;
        record.gpa = None;

        let wires = pipeline.build_wire_records(&[record]).await;
        let json = serde_json::to_value(&wires[0]).unwrap();
        assert_eq!(json["comments"], serde_json::Value::Null);
        assert_eq!(json["GPA"], serde_json::Value::Null);
        assert_eq!(json["application status"], "Accepted");
    }
}
