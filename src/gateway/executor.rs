use std::{
    convert::Infallible,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    future::{self, AbortHandle, Abortable, Aborted, BoxFuture},
    FutureExt,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{AcquireError, ExecutorError, JoinError, Limiter, Listener, Outcome};

/// A unit of work run by an [Executor].
pub type Job = BoxFuture<'static, ()>;

/// Runs jobs in the background, e.g. on a pool of workers.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Queue a job to run.
    ///
    /// Fails with [ExecutorError::PoolRejected] if the executor won't take it, e.g. because its
    /// queue is full or it has been shut down.
    fn spawn(&self, job: Job) -> Result<(), ExecutorError>;

    /// Run a batch of jobs, waiting for all of them to finish or for `timeout` to elapse.
    ///
    /// Fails with [ExecutorError::PoolRejected] if any job can't be queued, or with
    /// [ExecutorError::Interrupted] if the executor stops before the batch finishes.
    async fn invoke_all(
        &self,
        jobs: Vec<Job>,
        timeout: Option<Duration>,
    ) -> Result<(), ExecutorError> {
        let mut finished = Vec::with_capacity(jobs.len());
        for job in jobs {
            let (tx, rx) = oneshot::channel();
            self.spawn(Box::pin(async move {
                job.await;
                let _ = tx.send(());
            }))?;
            finished.push(rx);
        }

        let all = future::join_all(finished);
        let results = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, all).await {
                Ok(results) => results,
                Err(_) => {
                    tracing::debug!(?timeout, "timed out waiting for batch");
                    return Ok(());
                }
            },
            None => all.await,
        };

        // A job which was dropped before finishing never reports back.
        if results.iter().any(Result::is_err) {
            Err(ExecutorError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// A fixed number of tokio tasks pulling jobs from a bounded queue.
///
/// Jobs are rejected when the queue is full, or after [shutdown](WorkerPool::shutdown).
#[derive(Debug)]
pub struct WorkerPool {
    queue: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` workers sharing a queue of `queue_capacity` jobs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        assert!(workers > 0);
        assert!(queue_capacity > 0);

        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        Self {
            queue: tx,
            workers: (0..workers)
                .map(|id| tokio::spawn(work(id, Arc::clone(&rx))))
                .collect(),
        }
    }

    /// Stop all workers. Running jobs are cancelled and queued jobs are discarded.
    pub fn shutdown(&self) {
        tracing::debug!(workers = self.workers.len(), "shutting down worker pool");
        for worker in &self.workers {
            worker.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn work(id: usize, queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            return;
        };
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            tracing::warn!(worker = id, "job panicked");
        }
    }
}

#[async_trait]
impl Executor for WorkerPool {
    fn spawn(&self, job: Job) -> Result<(), ExecutorError> {
        self.queue.try_send(job).map_err(|error| {
            match error {
                mpsc::error::TrySendError::Full(_) => tracing::debug!("worker pool queue is full"),
                mpsc::error::TrySendError::Closed(_) => tracing::debug!("worker pool is shut down"),
            }
            ExecutorError::PoolRejected
        })
    }
}

/// The context of a task submitted to a [LimitedExecutor].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskContext {
    name: Option<String>,
}

impl TaskContext {
    /// A task of a given kind, e.g. to partition by.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    /// The task's name, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// A partition key resolver which partitions tasks by name.
    pub fn by_name() -> impl Fn(&TaskContext) -> Option<String> + Send + Sync + 'static {
        |ctx: &TaskContext| ctx.name.clone()
    }
}

/// Applies a [Limiter] to tasks submitted to an [Executor].
///
/// Tasks are only submitted once admitted. A task which finishes with `Ok` counts as a success.
/// Errors, panics and cancellations are ignored. A task admitted by the limiter but refused by the
/// executor counts as dropped.
#[derive(Debug)]
pub struct LimitedExecutor<X, L> {
    executor: X,
    limiter: L,
}

/// The eventual result of a task submitted to a [LimitedExecutor].
#[derive(Debug)]
#[must_use = "the task's result is lost if the handle is dropped"]
pub struct TaskHandle<T, E> {
    result: oneshot::Receiver<Result<Result<T, E>, JoinError>>,
    abort: AbortHandle,
}

/// Shared by a task and its submitter, so whichever finishes with it first reports the outcome.
#[derive(Debug)]
struct ListenerSlot {
    listener: Mutex<Option<Listener>>,
    started: AtomicBool,
}

impl<X, L> LimitedExecutor<X, L>
where
    X: Executor,
    L: Limiter<TaskContext>,
{
    /// Submit tasks admitted by `limiter` to `executor`.
    pub fn new(executor: X, limiter: L) -> Self {
        Self { executor, limiter }
    }

    /// The executor tasks are submitted to.
    pub fn executor(&self) -> &X {
        &self.executor
    }

    /// The limiter tasks are admitted by.
    pub fn limiter(&self) -> &L {
        &self.limiter
    }

    /// Run a task in the background, without waiting for its result.
    pub async fn execute<F>(&self, ctx: &TaskContext, task: F) -> Result<(), ExecutorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(ctx, task.map(Ok::<(), Infallible>))
            .await
            .map(drop)
    }

    /// Run a task in the background, returning a handle to its result.
    pub async fn submit<F, T, E>(
        &self,
        ctx: &TaskContext,
        task: F,
    ) -> Result<TaskHandle<T, E>, ExecutorError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let listener = self
            .limiter
            .acquire(ctx)
            .await
            .map_err(ExecutorError::LimitExceeded)?;

        let slot = ListenerSlot::new(listener);
        let (job, handle) = decorate(Arc::clone(&slot), task);

        if let Err(error) = self.executor.spawn(job) {
            tracing::debug!(%error, "admitted task was not accepted");
            slot.resolve(Outcome::Dropped);
            return Err(error);
        }

        Ok(handle)
    }

    /// Run a batch of tasks, waiting for all of them to finish or for `timeout` to elapse.
    ///
    /// Every task is admitted before any is submitted, so a batch larger than the limit is never
    /// admitted. With a waiting limiter, only the first task waits for capacity. The rest must be
    /// admitted straight away. Tasks still unfinished at the timeout are cancelled.
    ///
    /// If the batch fails, every task is cancelled and its outcome has been reported by the time
    /// the error is returned: ignored on interruption, and on rejection dropped for tasks which
    /// never started and ignored for tasks which did.
    pub async fn invoke_all<I, F, T, E>(
        &self,
        ctx: &TaskContext,
        tasks: I,
        timeout: Option<Duration>,
    ) -> Result<Vec<TaskHandle<T, E>>, ExecutorError>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let tasks: Vec<F> = tasks.into_iter().collect();

        let mut slots = Vec::with_capacity(tasks.len());
        for _ in 0..tasks.len() {
            // Only the first task may wait. The rest would be waiting on capacity this batch holds.
            let acquired = if slots.is_empty() {
                self.limiter.acquire(ctx).await
            } else {
                self.limiter
                    .try_acquire(ctx)
                    .ok_or(AcquireError::Rejected)
            };
            match acquired {
                Ok(listener) => slots.push(ListenerSlot::new(listener)),
                Err(error) => {
                    tracing::debug!(
                        admitted = slots.len(),
                        tasks = tasks.len(),
                        "batch not admitted"
                    );
                    for slot in &slots {
                        slot.resolve(Outcome::Ignore);
                    }
                    return Err(ExecutorError::LimitExceeded(error));
                }
            }
        }

        let (jobs, handles): (Vec<_>, Vec<_>) = slots
            .iter()
            .zip(tasks)
            .map(|(slot, task)| decorate(Arc::clone(slot), task))
            .unzip();

        match self.executor.invoke_all(jobs, timeout).await {
            Ok(()) => {
                // Has no effect on tasks which already finished.
                for handle in &handles {
                    handle.abort();
                }
                Ok(handles)
            }
            Err(error) => {
                tracing::debug!(%error, tasks = slots.len(), "batch failed");
                // Tasks already queued must not run once their outcome has been reported.
                for handle in &handles {
                    handle.abort();
                }
                for slot in &slots {
                    let outcome = match error {
                        ExecutorError::Interrupted => Outcome::Ignore,
                        _ if slot.started() => Outcome::Ignore,
                        _ => Outcome::Dropped,
                    };
                    slot.resolve(outcome);
                }
                Err(error)
            }
        }
    }
}

fn decorate<F, T, E>(slot: Arc<ListenerSlot>, task: F) -> (Job, TaskHandle<T, E>)
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let (abort, registration) = AbortHandle::new_pair();

    let job = async move {
        slot.start();
        let result = match Abortable::new(AssertUnwindSafe(task).catch_unwind(), registration).await
        {
            Ok(Ok(result)) => {
                slot.resolve(if result.is_ok() {
                    Outcome::Success
                } else {
                    Outcome::Ignore
                });
                Ok(result)
            }
            Ok(Err(_panic)) => {
                tracing::warn!("task panicked");
                slot.resolve(Outcome::Ignore);
                Err(JoinError::Panicked)
            }
            Err(Aborted) => {
                slot.resolve(Outcome::Ignore);
                Err(JoinError::Cancelled)
            }
        };
        let _ = tx.send(result);
    };

    (Box::pin(job), TaskHandle { result: rx, abort })
}

impl<T, E> TaskHandle<T, E> {
    /// Cancel the task, if it hasn't finished yet.
    pub fn abort(&self) {
        self.abort.abort();
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = Result<Result<T, E>, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The task was dropped without finishing, e.g. by an executor shutting down.
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(JoinError::Cancelled)))
    }
}

impl ListenerSlot {
    fn new(listener: Listener) -> Arc<Self> {
        Arc::new(Self {
            listener: Mutex::new(Some(listener)),
            started: AtomicBool::new(false),
        })
    }

    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn resolve(&self, outcome: Outcome) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.resolve(outcome);
        }
    }
}

impl Drop for ListenerSlot {
    // Reached when the executor discards a task without running it to completion.
    fn drop(&mut self) {
        let outcome = if *self.started.get_mut() {
            Outcome::Ignore
        } else {
            Outcome::Dropped
        };
        self.resolve(outcome);
    }
}
