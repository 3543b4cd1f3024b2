//! Queued document processing
//!
//! Pulls one `ProcessDocumentMessage` at a time, runs it in its own task under
//! soft and hard time limits, and re-enqueues failures with a fixed delay
//! until the retry budget is spent.

use crate::processor::{DocumentProcessor, ProcessRequest};
use aws_sdk_sqs::types::Message;
use clinforge_common::config::{ProcessingConfig, WorkerConfig};
use clinforge_common::errors::{AppError, Result};
use clinforge_common::metrics;
use clinforge_common::queue::{ProcessDocumentMessage, Queue};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// What to do with a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Re-enqueue as `attempt` after `delay`
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// Fixed-delay retry budget
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: Duration::from_secs(config.retry_delay_secs),
        }
    }

    /// Decision after delivery `attempt` (zero-based) failed with `error`.
    ///
    /// Caller mistakes are never retried.
    pub fn next_action(&self, attempt: u32, error: &AppError) -> RetryAction {
        if error.is_client_error() || attempt >= self.max_retries {
            return RetryAction::GiveUp;
        }
        RetryAction::Retry {
            attempt: attempt + 1,
            delay: self.delay,
        }
    }
}

/// Soft and hard limits for one job
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub soft: Duration,
    pub hard: Duration,
}

impl Timeouts {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            soft: Duration::from_secs(config.soft_timeout_secs),
            hard: Duration::from_secs(config.hard_timeout_secs),
        }
    }
}

pub const TIMED_OUT: &str = "processing timed out";

/// Why a supervised job did not complete
#[derive(Debug)]
pub enum JobFailure {
    /// The job itself returned an error or panicked
    Failed(AppError),
    /// The hard limit passed and the task was aborted
    TimedOut,
}

impl From<JobFailure> for AppError {
    fn from(failure: JobFailure) -> Self {
        match failure {
            JobFailure::Failed(e) => e,
            JobFailure::TimedOut => AppError::Internal {
                message: TIMED_OUT.to_string(),
            },
        }
    }
}

/// Run `job` in its own task.
///
/// `on_soft` fires once when the soft limit passes; at the hard limit the task
/// is aborted, which drops everything it owns.
pub async fn supervise<F, S, SF>(
    job: F,
    timeouts: Timeouts,
    on_soft: S,
) -> std::result::Result<(), JobFailure>
where
    F: Future<Output = Result<()>> + Send + 'static,
    S: FnOnce() -> SF,
    SF: Future<Output = ()>,
{
    let mut task = tokio::spawn(job);
    let abort = task.abort_handle();
    let mut on_soft = Some(on_soft);

    let watched = async {
        let soft = tokio::time::sleep(timeouts.soft);
        tokio::pin!(soft);
        loop {
            tokio::select! {
                joined = &mut task => {
                    let result = joined.unwrap_or_else(|e| {
                        Err(AppError::Internal {
                            message: format!("Processing task failed: {}", e),
                        })
                    });
                    return result.map_err(JobFailure::Failed);
                }
                _ = &mut soft, if on_soft.is_some() => {
                    if let Some(callback) = on_soft.take() {
                        callback().await;
                    }
                }
            }
        }
    };

    match tokio::time::timeout(timeouts.hard, watched).await {
        Ok(result) => result,
        Err(_) => {
            abort.abort();
            Err(JobFailure::TimedOut)
        }
    }
}

/// How a message left the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Retried,
    Released,
    Dropped,
}

impl JobOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Done => "done",
            JobOutcome::Retried => "retried",
            JobOutcome::Released => "released",
            JobOutcome::Dropped => "dropped",
        }
    }
}

/// Queue consumer for the processing pipeline
pub struct Worker {
    queue: Arc<Queue>,
    processor: DocumentProcessor,
    policy: RetryPolicy,
    timeouts: Timeouts,
    max_tasks: u32,
    extract_by_default: bool,
}

impl Worker {
    pub fn new(
        queue: Arc<Queue>,
        processor: DocumentProcessor,
        worker: &WorkerConfig,
        processing: &ProcessingConfig,
    ) -> Self {
        Self {
            queue,
            processor,
            policy: RetryPolicy::from_config(worker),
            timeouts: Timeouts::from_config(worker),
            max_tasks: worker.max_tasks_per_worker,
            extract_by_default: processing.extract_globals,
        }
    }

    /// Poll until `shutdown` resolves or the task budget is used up.
    ///
    /// Returns the number of handled messages.
    pub async fn run<F>(&self, shutdown: F) -> u32
    where
        F: Future<Output = ()>,
    {
        const MAX_FAILURES: u32 = 5;
        const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);

        tokio::pin!(shutdown);
        let mut handled = 0u32;
        let mut consecutive_failures = 0u32;

        loop {
            if consecutive_failures >= MAX_FAILURES {
                warn!(failures = consecutive_failures, "Circuit breaker open, pausing...");
                tokio::time::sleep(CIRCUIT_BREAK_DURATION).await;
                consecutive_failures = 0;
                info!("Circuit breaker reset, resuming...");
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    return handled;
                }
                result = self.queue.receive() => {
                    match result {
                        Ok(messages) => {
                            for message in messages {
                                match self.handle(&message).await {
                                    JobOutcome::Done => consecutive_failures = 0,
                                    _ => consecutive_failures += 1,
                                }
                                handled += 1;
                                if handled >= self.max_tasks {
                                    info!(handled, "Task budget reached, recycling worker");
                                    return handled;
                                }
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            error!(error = %e, "Failed to receive messages from queue");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&self, message: &Message) -> JobOutcome {
        let receipt = message.receipt_handle().map(str::to_string);

        let outcome = match Queue::parse_message::<ProcessDocumentMessage>(message) {
            Ok(job) => self.handle_job(&job, receipt.as_deref()).await,
            Err(e) => {
                error!(error = %e, "Dropping unreadable message");
                JobOutcome::Dropped
            }
        };

        // Released messages reappear once their visibility lapses
        if outcome != JobOutcome::Released {
            if let Some(ref receipt) = receipt {
                if let Err(e) = self.queue.delete(receipt).await {
                    error!(error = %e, "Failed to delete message");
                }
            }
        }

        metrics::record_queue_message(outcome.as_str());
        outcome
    }

    async fn handle_job(&self, job: &ProcessDocumentMessage, receipt: Option<&str>) -> JobOutcome {
        info!(document_id = %job.document_id, attempt = job.attempt, "Received processing job");

        let error = match self.execute(job, receipt).await {
            Ok(()) => return JobOutcome::Done,
            Err(e) => e,
        };

        match self.policy.next_action(job.attempt, &error) {
            RetryAction::Retry { attempt, delay } => {
                warn!(
                    document_id = %job.document_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "Processing failed, scheduling retry"
                );
                match self.queue.send_delayed(&job.next_attempt(), delay.as_secs() as i32).await {
                    Ok(_) => JobOutcome::Retried,
                    Err(e) => {
                        error!(error = %e, "Failed to re-enqueue job, leaving it for redelivery");
                        JobOutcome::Released
                    }
                }
            }
            RetryAction::GiveUp => {
                error!(
                    document_id = %job.document_id,
                    attempt = job.attempt,
                    error = %error,
                    "Processing failed permanently"
                );
                JobOutcome::Dropped
            }
        }
    }

    async fn execute(&self, job: &ProcessDocumentMessage, receipt: Option<&str>) -> Result<()> {
        let request = ProcessRequest::from_message(job, self.extract_by_default)?;
        let document_id = request.document_id;
        let processor = self.processor.clone();

        let extension = (self.timeouts.hard.saturating_sub(self.timeouts.soft) + Duration::from_secs(60))
            .as_secs() as i32;
        let queue = self.queue.clone();
        let receipt = receipt.map(str::to_string);

        let result = supervise(
            async move { processor.process(&request).await.map(|_| ()) },
            self.timeouts,
            || async move {
                warn!(document_id = %document_id, "Soft time limit reached");
                if let Some(receipt) = receipt {
                    if let Err(e) = queue.extend_visibility(&receipt, extension).await {
                        warn!(error = %e, "Failed to extend message visibility");
                    }
                }
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(JobFailure::TimedOut) => {
                self.processor.mark_failed(document_id, TIMED_OUT).await;
                Err(JobFailure::TimedOut.into())
            }
            Err(JobFailure::Failed(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&WorkerConfig::default())
    }

    fn upstream() -> AppError {
        AppError::StorageError {
            message: "503".into(),
        }
    }

    #[test]
    fn test_gives_up_after_three_retries() {
        let policy = policy();
        assert_eq!(
            policy.next_action(0, &upstream()),
            RetryAction::Retry {
                attempt: 1,
                delay: Duration::from_secs(60)
            }
        );
        assert!(matches!(policy.next_action(2, &upstream()), RetryAction::Retry { attempt: 3, .. }));
        assert_eq!(policy.next_action(3, &upstream()), RetryAction::GiveUp);
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        let err = AppError::validation("Either file_url or file_path must be provided");
        assert_eq!(policy().next_action(0, &err), RetryAction::GiveUp);
    }

    fn timeouts(soft_ms: u64, hard_ms: u64) -> Timeouts {
        Timeouts {
            soft: Duration::from_millis(soft_ms),
            hard: Duration::from_millis(hard_ms),
        }
    }

    #[tokio::test]
    async fn test_fast_job_skips_soft_limit() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let result = supervise(async { Ok::<(), AppError>(()) }, timeouts(200, 1000), || async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;
        assert!(result.is_ok());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_soft_limit_warns_and_job_completes() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let result = supervise(
            async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Err::<(), AppError>(upstream())
            },
            timeouts(10, 2000),
            || async move {
                flag.store(true, Ordering::SeqCst);
            },
        )
        .await;
        assert!(matches!(result, Err(JobFailure::Failed(AppError::StorageError { .. }))));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_hard_limit_cancels_and_cleans_scratch() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let result = supervise(
            async move {
                let scratch = tempfile::tempdir()?;
                let _ = tx.send(scratch.path().to_path_buf());
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(scratch);
                Ok::<(), AppError>(())
            },
            timeouts(10, 100),
            || async {},
        )
        .await;

        match result {
            Err(failure @ JobFailure::TimedOut) => match AppError::from(failure) {
                AppError::Internal { message } => assert_eq!(message, TIMED_OUT),
                other => panic!("unexpected error: {:?}", other),
            },
            other => panic!("expected timeout, got {:?}", other),
        }

        let path = rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_job_error_is_not_mistaken_for_timeout() {
        let result = supervise(
            async {
                Err::<(), AppError>(AppError::Internal {
                    message: TIMED_OUT.to_string(),
                })
            },
            timeouts(1000, 2000),
            || async {},
        )
        .await;

        match result {
            Err(JobFailure::Failed(AppError::Internal { message })) => assert_eq!(message, TIMED_OUT),
            other => panic!("expected job failure, got {:?}", other),
        }
    }
}
