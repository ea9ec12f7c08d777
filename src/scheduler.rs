use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::RunContext;
use crate::queue::JobQueue;
use crate::submission::{AnalysisJob, CompileJob, MetricJob, TestJob};
use crate::{analysis, compile, metric, monitoring, tester};

/// Fixed number of workers servicing each stage
pub const WORKERS_PER_STAGE: usize = 10;

/// The four stage queues. Injected everywhere a job is published so tests
/// can wire their own instance; there is no global channel state.
pub struct Scheduler {
    pub compile: Arc<JobQueue<CompileJob>>,
    pub test: Arc<JobQueue<TestJob>>,
    pub analysis: Arc<JobQueue<AnalysisJob>>,
    pub metric: Arc<JobQueue<MetricJob>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            compile: Arc::new(JobQueue::new()),
            test: Arc::new(JobQueue::new()),
            analysis: Arc::new(JobQueue::new()),
            metric: Arc::new(JobQueue::new()),
        }
    }
}

/// Spawns the fixed-size worker pools for all four stages.
pub fn spawn_workers(
    workers: &mut JoinSet<()>,
    ctx: Arc<RunContext>,
    scheduler: Arc<Scheduler>,
    token: CancellationToken,
) {
    for id in 1..=WORKERS_PER_STAGE {
        {
            let ctx = ctx.clone();
            let sched = scheduler.clone();
            workers.spawn(worker_loop(
                "compile",
                id,
                scheduler.compile.clone(),
                token.clone(),
                move |job| compile::handle(job, ctx.clone(), sched.clone()),
            ));
        }
        {
            let ctx = ctx.clone();
            workers.spawn(worker_loop(
                "test",
                id,
                scheduler.test.clone(),
                token.clone(),
                move |job| tester::handle(job, ctx.clone()),
            ));
        }
        {
            let ctx = ctx.clone();
            workers.spawn(worker_loop(
                "analysis",
                id,
                scheduler.analysis.clone(),
                token.clone(),
                move |job| analysis::handle(job, ctx.clone()),
            ));
        }
        {
            let ctx = ctx.clone();
            workers.spawn(worker_loop(
                "metric",
                id,
                scheduler.metric.clone(),
                token.clone(),
                move |job| metric::handle(job, ctx.clone()),
            ));
        }
    }
}

/// One long-lived stage worker.
///
/// Each job runs in its own task so a panicking handler takes down neither
/// the worker nor the pool. A panic drops the job's reply senders, which
/// the submitting handler observes as a closed channel and converts into an
/// internal-error reply, so no client is left waiting.
async fn worker_loop<T, F, Fut>(
    stage: &'static str,
    id: usize,
    queue: Arc<JobQueue<T>>,
    token: CancellationToken,
    handler: F,
) where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    log::info!("{stage} worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("{stage} worker {id} received shutdown signal, stopping");
                break;
            }

            job = queue.pop() => {
                if let Err(e) = tokio::spawn(handler(job)).await {
                    if e.is_panic() {
                        log::error!("{stage} worker {id}: job handler panicked: {e}");
                        monitoring::inc_error(stage);
                    } else {
                        log::error!("{stage} worker {id}: job handler aborted: {e}");
                    }
                }
            }
        }
    }

    log::info!("{stage} worker {id} has shut down gracefully");
}
