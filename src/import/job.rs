//! Import as a background job with polling progress and cancellation

use super::{run_import, ImportConfig, ImportOptions, ImportProgress, ImportSummary};
use crate::db::Database;
use crate::error::{FailureReport, TreeError, TreeResult};
use crate::source::{source_for, ByteSource, SourceReader};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ImportStatus {
    Running,
    Completed,
    Cancelled,
    Failed { message: String },
}

/// Signals for whoever tells the user how the import went
#[derive(Debug, Clone)]
pub enum ImportEvent {
    Started { job_id: Uuid, definition: String },
    Progress { job_id: Uuid, progress: ImportProgress },
    Failed { job_id: Uuid, report: FailureReport },
    Completed { job_id: Uuid, summary: ImportSummary },
}

struct JobState {
    rows: AtomicU64,
    current: AtomicU64,
    total: AtomicU64,
    cancelled: AtomicBool,
    status: Mutex<ImportStatus>,
}

impl JobState {
    fn record(&self, progress: &ImportProgress) {
        self.rows.store(progress.rows, Ordering::Relaxed);
        // Total first so a concurrent reader never sees current > total
        self.total.fetch_max(progress.total, Ordering::SeqCst);
        self.current.store(progress.current, Ordering::SeqCst);
    }

    fn set_status(&self, status: ImportStatus) {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
    }
}

pub struct ImportJob {
    id: Uuid,
    state: Arc<JobState>,
    handle: JoinHandle<TreeResult<ImportSummary>>,
}

impl ImportJob {
    /// Open `locator` (http(s) URL or file path) and start importing it
    pub fn start(
        db: Arc<Database>,
        config: ImportConfig,
        locator: &str,
        options: ImportOptions,
        events: Option<mpsc::Sender<ImportEvent>>,
    ) -> TreeResult<Self> {
        let source = source_for(locator, options.request_timeout)?;
        Self::spawn(db, config, options, source, events)
    }

    /// Run the import on a tokio task. Must be called inside a runtime.
    pub fn spawn<S: ByteSource + 'static>(
        db: Arc<Database>,
        config: ImportConfig,
        options: ImportOptions,
        source: S,
        events: Option<mpsc::Sender<ImportEvent>>,
    ) -> TreeResult<Self> {
        config.validate()?;
        let delimiter = config.delimiter_byte()?;
        let id = Uuid::new_v4();
        let state = Arc::new(JobState {
            rows: AtomicU64::new(0),
            current: AtomicU64::new(0),
            total: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            status: Mutex::new(ImportStatus::Running),
        });

        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            let state = task_state;
            let mut reader = SourceReader::new(source, delimiter, options.retry.clone());
            tracing::info!(job_id = %id, definition = %config.definition.name, "[Import] Job started");
            if let Some(tx) = &events {
                let _ = tx
                    .send(ImportEvent::Started { job_id: id, definition: config.definition.name.clone() })
                    .await;
            }

            let result = run_import(&db, &config, &options, &mut reader, &state.cancelled, |progress| {
                state.record(&progress);
                if let Some(tx) = &events {
                    // Progress is advisory; drop it when the receiver lags
                    let _ = tx.try_send(ImportEvent::Progress { job_id: id, progress });
                }
            })
            .await;

            match &result {
                Ok(summary) => {
                    state.set_status(ImportStatus::Completed);
                    tracing::info!(job_id = %id, created = summary.nodes_created, "[Import] Job completed");
                    if let Some(tx) = &events {
                        let _ = tx.send(ImportEvent::Completed { job_id: id, summary: summary.clone() }).await;
                    }
                }
                Err(TreeError::Cancelled) => {
                    state.set_status(ImportStatus::Cancelled);
                    tracing::warn!(job_id = %id, "[Import] Job cancelled");
                    if let Some(tx) = &events {
                        let report = FailureReport::from(&TreeError::Cancelled);
                        let _ = tx.send(ImportEvent::Failed { job_id: id, report }).await;
                    }
                }
                Err(e) => {
                    state.set_status(ImportStatus::Failed { message: e.to_string() });
                    tracing::error!(job_id = %id, error = %e, "[Import] Job failed");
                    if let Some(tx) = &events {
                        let _ = tx.send(ImportEvent::Failed { job_id: id, report: FailureReport::from(e) }).await;
                    }
                }
            }
            result
        });

        Ok(Self { id, state, handle })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// (current, total) bytes; total grows as the source size becomes known
    pub fn progress(&self) -> (u64, u64) {
        let current = self.state.current.load(Ordering::SeqCst);
        let total = self.state.total.load(Ordering::SeqCst);
        (current, total.max(current))
    }

    pub fn rows(&self) -> u64 {
        self.state.rows.load(Ordering::Relaxed)
    }

    /// Ask the job to stop; it checks between records
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> ImportStatus {
        self.state.status.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> TreeResult<ImportSummary> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(TreeError::Job(e.to_string())),
        }
    }
}
