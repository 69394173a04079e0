use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Semaphore};
use uuid::Uuid;

use super::{handlers, Job, JobContext, JobError, JobKind, JobOutcome, JobResult};
use crate::config::PipelineOptions;
use crate::error::Result;

/// Executes one job kind. The pipeline's own implementation is [`JobContext`].
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, kind: JobKind) -> Result<JobResult>;
}

#[async_trait]
impl JobHandler for JobContext {
    async fn handle(&self, kind: JobKind) -> Result<JobResult> {
        handlers::run_job(self, kind).await
    }
}

/// Runs each job in its own tokio task, at most `workers` at a time.
///
/// A job that panics, errors or outlives the timeout is reported through its
/// [`JobOutcome`]; nothing it does reaches other jobs or the caller's task.
#[derive(Clone)]
pub struct WorkerPool {
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
    job_timeout: Duration,
}

impl WorkerPool {
    pub fn new(context: JobContext, options: &PipelineOptions) -> Self {
        Self::with_handler(Arc::new(context), options)
    }

    pub fn with_handler(handler: Arc<dyn JobHandler>, options: &PipelineOptions) -> Self {
        Self {
            handler,
            permits: Arc::new(Semaphore::new(options.workers.max(1))),
            job_timeout: options.job_timeout,
        }
    }

    /// Queue a job. Returns immediately; await the ticket for the outcome.
    pub fn submit(&self, job: Job) -> JobTicket {
        let (tx, rx) = oneshot::channel();
        let job_id = job.id;
        let handler = Arc::clone(&self.handler);
        let permits = Arc::clone(&self.permits);
        let job_timeout = self.job_timeout;

        drop(tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => execute(handler, job, job_timeout).await,
                Err(_) => Err(JobError::Lost),
            };
            // The caller may have dropped its ticket; that is fine.
            let _ = tx.send(JobOutcome { job_id, result });
        }));

        JobTicket { job_id, rx }
    }

    /// Submit and wait.
    pub async fn run(&self, job: Job) -> JobOutcome {
        self.submit(job).await
    }
}

async fn execute(
    handler: Arc<dyn JobHandler>,
    job: Job,
    job_timeout: Duration,
) -> std::result::Result<JobResult, JobError> {
    let Job { id, kind } = job;
    let kind_name = kind.name().to_string();
    log::debug!("Job {id} ({kind_name}) started");

    let mut worker = tokio::spawn(async move { handler.handle(kind).await });
    let result = match tokio::time::timeout(job_timeout, &mut worker).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(JobError::Failed(e.to_string())),
        Ok(Err(join)) if join.is_panic() => Err(JobError::Panicked(panic_message(join.into_panic()))),
        Ok(Err(_)) => Err(JobError::Lost),
        Err(_) => {
            worker.abort();
            Err(JobError::TimedOut {
                secs: whole_secs(job_timeout),
            })
        }
    };

    match &result {
        Ok(_) => log::debug!("Job {id} ({kind_name}) finished"),
        Err(e) => log::warn!("Job {id} ({kind_name}) failed: {e}"),
    }
    result
}

/// Seconds rounded up, so a sub-second limit never reports as 0s.
fn whole_secs(limit: Duration) -> u64 {
    limit.as_secs() + u64::from(limit.subsec_nanos() > 0)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a submitted job; resolves to its [`JobOutcome`].
pub struct JobTicket {
    job_id: Uuid,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Future for JobTicket {
    type Output = JobOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let job_id = self.job_id;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(JobOutcome {
                job_id,
                result: Err(JobError::Lost),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::Error;

    /// Test handler driven by the `Unrecognized` kind tag.
    struct Scripted {
        active: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl Scripted {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        async fn handle(&self, kind: JobKind) -> Result<JobResult> {
            let JobKind::Unrecognized { kind, payload } = kind else {
                return Err(Error::Other("unexpected kind".into()));
            };
            match kind.as_str() {
                "panic" => panic!("handler blew up"),
                "fail" => Err(Error::Other("handler failed".into())),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(JobResult::Echo(payload))
                }
                _ => {
                    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    Ok(JobResult::Echo(payload))
                }
            }
        }
    }

    fn job(kind: &str) -> Job {
        Job::new(JobKind::Unrecognized {
            kind: kind.to_string(),
            payload: serde_json::json!({ "tag": kind }),
        })
    }

    fn options(workers: usize, timeout: Duration) -> PipelineOptions {
        PipelineOptions {
            workers,
            job_timeout: timeout,
            ..PipelineOptions::default()
        }
    }

    #[tokio::test]
    async fn test_success_carries_job_id() {
        let pool = WorkerPool::with_handler(Scripted::new(), &options(2, Duration::from_secs(5)));
        let job = job("echo");
        let id = job.id;
        let ticket = pool.submit(job);
        assert_eq!(ticket.job_id(), id);

        let outcome = ticket.await;
        assert_eq!(outcome.job_id, id);
        assert_eq!(
            outcome.result,
            Ok(JobResult::Echo(serde_json::json!({ "tag": "echo" })))
        );
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let pool = WorkerPool::with_handler(Scripted::new(), &options(2, Duration::from_secs(5)));
        let bad = pool.submit(job("panic"));
        let good = pool.submit(job("echo"));

        match bad.await.result {
            Err(JobError::Panicked(msg)) => assert!(msg.contains("handler blew up")),
            other => panic!("expected panic outcome, got {other:?}"),
        }
        assert!(good.await.is_success());

        // The pool keeps working afterwards.
        assert!(pool.run(job("echo")).await.is_success());
    }

    #[tokio::test]
    async fn test_handler_error() {
        let pool = WorkerPool::with_handler(Scripted::new(), &options(1, Duration::from_secs(5)));
        let outcome = pool.run(job("fail")).await;
        assert_eq!(outcome.result, Err(JobError::Failed("handler failed".into())));
    }

    #[test]
    fn test_timeout_rounds_up_to_whole_seconds() {
        assert_eq!(whole_secs(Duration::from_millis(50)), 1);
        assert_eq!(whole_secs(Duration::from_secs(5)), 5);
        assert_eq!(whole_secs(Duration::from_millis(1500)), 2);
    }

    #[tokio::test]
    async fn test_timeout_aborts_job() {
        let pool = WorkerPool::with_handler(Scripted::new(), &options(1, Duration::from_millis(50)));
        let outcome = pool.run(job("hang")).await;
        assert_eq!(outcome.result, Err(JobError::TimedOut { secs: 1 }));

        // The single permit was released.
        assert!(pool.run(job("echo")).await.is_success());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let handler = Scripted::new();
        let pool = WorkerPool::with_handler(handler.clone(), &options(2, Duration::from_secs(5)));

        let tickets: Vec<_> = (0..8).map(|_| pool.submit(job("echo"))).collect();
        for ticket in tickets {
            assert!(ticket.await.is_success());
        }
        let max = handler.max_seen.load(Ordering::SeqCst);
        assert!(max >= 1 && max <= 2, "saw {max} concurrent jobs");
    }
}
