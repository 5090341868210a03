//! Tracking of single-shot remote batch operations.
//!
//! The remote service runs a batch as one request/response call. A job is
//! therefore `Running` while that request is in flight and then lands in one
//! terminal state with the final tally.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::types::OverdueReport;
use crate::cache::{CacheDirectory, ResourceType};
use crate::error::ApiError;
use crate::transport::{Request, Response, Transport};

/// Default batch size for bulk categorization.
pub const DEFAULT_CATEGORIZE_LIMIT: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
  /// Id carried by pre-submission placeholders.
  pub const UNASSIGNED: JobId = JobId(0);

  pub fn get(&self) -> u64 {
    self.0
  }
}

impl std::fmt::Display for JobId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "job-{}", self.0)
  }
}

/// Batch operations the remote service offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOperation {
  /// AI-categorize up to `limit` uncategorized transactions.
  CategorizeUncategorized { limit: u32 },
  /// Send reminders for every overdue invoice.
  ProcessOverdueReminders,
}

impl BulkOperation {
  pub fn label(&self) -> &'static str {
    match self {
      BulkOperation::CategorizeUncategorized { .. } => "categorize transactions",
      BulkOperation::ProcessOverdueReminders => "process overdue reminders",
    }
  }

  fn request(&self) -> Request {
    match self {
      BulkOperation::CategorizeUncategorized { limit } => {
        Request::post("categorization/bulk").query("limit", limit)
      }
      BulkOperation::ProcessOverdueReminders => Request::post("reminders/process-overdue"),
    }
  }

  /// Resource types whose cached views are out of date once the batch ran.
  pub fn invalidates(&self) -> &'static [ResourceType] {
    match self {
      BulkOperation::CategorizeUncategorized { .. } => &[
        ResourceType::Transaction,
        ResourceType::CategorizationBreakdown,
      ],
      BulkOperation::ProcessOverdueReminders => &[ResourceType::Invoice, ResourceType::Transaction],
    }
  }

  fn tally(&self, response: &Response) -> Result<Tally, ApiError> {
    match self {
      BulkOperation::CategorizeUncategorized { .. } => {
        let body: CategorizeBulkBody = response.json()?;
        Ok(Tally {
          reported_total: None,
          processed: body.categorized,
          succeeded: body.categorized,
          failed: 0,
        })
      }
      BulkOperation::ProcessOverdueReminders => {
        let report: OverdueReport = response.json()?;
        Ok(Tally {
          reported_total: Some(report.total),
          processed: report.sent + report.failed,
          succeeded: report.sent,
          failed: report.failed,
        })
      }
    }
  }
}

#[derive(Debug, Deserialize)]
struct CategorizeBulkBody {
  categorized: u64,
}

#[derive(Debug, Clone, Copy)]
struct Tally {
  reported_total: Option<u64>,
  processed: u64,
  succeeded: u64,
  failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkStatus {
  /// Placeholder shown before the request is sent.
  Pending,
  Running,
  Completed,
  Failed(ApiError),
}

impl BulkStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, BulkStatus::Completed | BulkStatus::Failed(_))
  }
}

/// Snapshot of one batch job.
///
/// Always `processed <= total_candidates` and `succeeded + failed <= processed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkJob {
  pub id: JobId,
  pub operation: BulkOperation,
  pub submitted_at: DateTime<Utc>,
  pub total_candidates: u64,
  pub processed: u64,
  pub succeeded: u64,
  pub failed: u64,
  pub status: BulkStatus,
}

impl BulkJob {
  /// A not-yet-submitted job, for display before the request starts.
  pub fn placeholder(operation: BulkOperation, total_candidates: u64) -> Self {
    Self {
      id: JobId::UNASSIGNED,
      operation,
      submitted_at: Utc::now(),
      total_candidates,
      processed: 0,
      succeeded: 0,
      failed: 0,
      status: BulkStatus::Pending,
    }
  }

  /// Apply the final tally, clamping counts that would break the invariants.
  fn complete(&mut self, tally: Tally) {
    if let Some(total) = tally.reported_total {
      self.total_candidates = total;
    }
    let processed = tally.processed.min(self.total_candidates);
    let succeeded = tally.succeeded.min(processed);
    let failed = tally.failed.min(processed - succeeded);
    if processed != tally.processed || succeeded != tally.succeeded || failed != tally.failed {
      warn!(
        job = %self.id,
        reported = tally.processed,
        candidates = self.total_candidates,
        "server tally exceeds candidates, clamping"
      );
    }
    self.processed = processed;
    self.succeeded = succeeded;
    self.failed = failed;
    self.status = BulkStatus::Completed;
  }
}

/// Owns every tracked job and runs their requests.
pub struct BulkJobTracker {
  transport: Arc<Transport>,
  cache: Arc<CacheDirectory>,
  jobs: Mutex<HashMap<JobId, Arc<watch::Sender<BulkJob>>>>,
  next_id: AtomicU64,
}

impl BulkJobTracker {
  pub fn new(transport: Arc<Transport>, cache: Arc<CacheDirectory>) -> Self {
    Self {
      transport,
      cache,
      jobs: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
    }
  }

  /// Send the batch request and start tracking it.
  ///
  /// The request runs on its own task; neither dropping observers nor
  /// dismissing the job stops it.
  pub fn submit(&self, operation: BulkOperation, total_candidates: u64) -> BulkJob {
    let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
    let job = BulkJob {
      id,
      status: BulkStatus::Running,
      ..BulkJob::placeholder(operation, total_candidates)
    };

    let (tx, _) = watch::channel(job.clone());
    let tx = Arc::new(tx);
    self
      .jobs
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(id, Arc::clone(&tx));

    info!(job = %id, operation = operation.label(), total_candidates, "bulk job submitted");

    let transport = Arc::clone(&self.transport);
    let cache = Arc::clone(&self.cache);
    tokio::spawn(async move {
      let outcome = match transport.send(operation.request()).await {
        Ok(response) => operation.tally(&response),
        Err(e) => Err(e),
      };

      match outcome {
        Ok(tally) => {
          // Views must see stale entries by the time the job reads Completed
          for kind in operation.invalidates() {
            cache.invalidate(*kind);
          }
          tx.send_modify(|job| job.complete(tally));
          let job = tx.borrow();
          info!(job = %id, processed = job.processed, succeeded = job.succeeded, failed = job.failed, "bulk job completed");
        }
        Err(e) => {
          warn!(job = %id, error = %e, "bulk job failed");
          tx.send_modify(|job| job.status = BulkStatus::Failed(e));
        }
      }
    });

    job
  }

  /// Latest snapshot of a tracked job.
  pub fn snapshot(&self, id: JobId) -> Option<BulkJob> {
    self
      .jobs
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .get(&id)
      .map(|tx| tx.borrow().clone())
  }

  /// Snapshots of every tracked job, oldest first.
  pub fn jobs(&self) -> Vec<BulkJob> {
    let mut jobs: Vec<BulkJob> = self
      .jobs
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .values()
      .map(|tx| tx.borrow().clone())
      .collect();
    jobs.sort_by_key(|job| job.id);
    jobs
  }

  /// Follow a job: yields the current snapshot, then every change, and ends
  /// after the terminal snapshot. `None` for unknown or dismissed jobs.
  pub fn observe(&self, id: JobId) -> Option<impl Stream<Item = BulkJob> + Send + 'static> {
    let rx = self
      .jobs
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .get(&id)?
      .subscribe();

    Some(stream::unfold((Some(rx), true), |(rx, first)| async move {
      let mut rx = rx?;
      if !first && rx.changed().await.is_err() {
        return None;
      }
      let job = rx.borrow_and_update().clone();
      let next = if job.status.is_terminal() { None } else { Some(rx) };
      Some((job, (next, false)))
    }))
  }

  /// Stop tracking a job. The remote operation, if still running, is unaffected.
  pub fn dismiss(&self, id: JobId) -> bool {
    self
      .jobs
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&id)
      .is_some()
  }
}
