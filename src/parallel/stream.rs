use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::engine::{FailMode, ParallelMonitor, ParallelizeCore, ParallelizeOption};
use crate::errors::is_cancellation;

/// Channel capacity between pipeline stages. Keeps memory proportional to
/// the number of items in flight instead of the total item count.
const STREAM_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum ParallelError {
    #[error("max degree of parallelism must be greater than zero")]
    InvalidDegree,

    #[error("{0}")]
    Faulted(Arc<anyhow::Error>),

    #[error("{} operations faulted, first error: {}", .0.len(), .0[0])]
    Aggregate(Vec<Arc<anyhow::Error>>),

    #[error("parallel loop canceled")]
    Canceled,

    #[error("pipeline task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Succeeded,
    Faulted,
    Canceled,
    Pending,
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome<R> {
    Succeeded(R),
    Faulted(Arc<anyhow::Error>),
    Canceled(Arc<anyhow::Error>),
    /// Drained without running because a loop break was requested.
    Pending,
}

/// One element yielded by a parallel stage: the input item and
/// what happened to it.
#[derive(Debug, Clone)]
pub struct StreamedValue<T, R> {
    pub item: T,
    pub outcome: ExecutionOutcome<R>,
}

impl<T, R> StreamedValue<T, R> {
    pub fn status(&self) -> ExecutionStatus {
        match self.outcome {
            ExecutionOutcome::Succeeded(_) => ExecutionStatus::Succeeded,
            ExecutionOutcome::Faulted(_) => ExecutionStatus::Faulted,
            ExecutionOutcome::Canceled(_) => ExecutionStatus::Canceled,
            ExecutionOutcome::Pending => ExecutionStatus::Pending,
        }
    }

    pub fn result(&self) -> Option<&R> {
        match &self.outcome {
            ExecutionOutcome::Succeeded(r) => Some(r),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Arc<anyhow::Error>> {
        match &self.outcome {
            ExecutionOutcome::Faulted(e) | ExecutionOutcome::Canceled(e) => Some(e),
            _ => None,
        }
    }
}

/// A stage of an asynchronous pipeline: a bounded channel of values plus
/// the task producing them.
///
/// Stages chain (`from_iter` → `parallelize` → `for_each`) and are consumed
/// with [`AsyncStream::next`] followed by [`AsyncStream::join`].
pub struct AsyncStream<T> {
    receiver: mpsc::Receiver<T>,
    cancellation: CancellationToken,
    task: JoinHandle<Result<(), ParallelError>>,
}

impl<T: Send + 'static> AsyncStream<T> {
    pub fn new(
        receiver: mpsc::Receiver<T>,
        cancellation: CancellationToken,
        task: JoinHandle<Result<(), ParallelError>>,
    ) -> Self {
        Self {
            receiver,
            cancellation,
            task,
        }
    }

    /// Feeds a synchronous sequence into a stream.
    ///
    /// The producer does not stop on cancellation: consumers decide what a
    /// late item becomes, so every item still reaches the next stage.
    pub fn from_iter<I>(items: I, cancellation: CancellationToken) -> Self
    where
        I: IntoIterator<Item = T> + Send + 'static,
        I::IntoIter: Send,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let task = tokio::spawn(async move {
            for item in items {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
            Ok(())
        });
        Self::new(rx, cancellation, task)
    }

    pub async fn next(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Waits for the producing task. Unread values are dropped.
    pub async fn join(self) -> Result<(), ParallelError> {
        let AsyncStream { receiver, task, .. } = self;
        drop(receiver);
        join_task(task).await
    }

    #[cfg(test)]
    pub async fn collect(mut self) -> Result<Vec<T>, ParallelError> {
        let mut values = Vec::new();
        while let Some(value) = self.receiver.recv().await {
            values.push(value);
        }
        self.join().await.map(|_| values)
    }

    /// Runs `action` on every value and passes the value downstream.
    pub fn for_each<F>(self, mut action: F) -> AsyncStream<T>
    where
        F: FnMut(&T) + Send + 'static,
    {
        let AsyncStream {
            mut receiver,
            cancellation,
            task: upstream,
        } = self;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let task = tokio::spawn(async move {
            while let Some(value) = receiver.recv().await {
                action(&value);
                // keep draining even if nobody reads downstream
                let _ = tx.send(value).await;
            }
            join_task(upstream).await
        });
        AsyncStream::new(rx, cancellation, task)
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncStream<T> {
    #[cfg(test)]
    pub fn parallelize<R, F, Fut>(
        self,
        operation: F,
        option: ParallelizeOption,
    ) -> Result<AsyncStream<StreamedValue<T, R>>, ParallelError>
    where
        R: Send + 'static,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let monitor = Arc::new(ParallelMonitor::new(option.max_degree_of_parallelism)?);
        self.parallelize_with_monitor(operation, option, monitor)
    }

    /// Same as `parallelize`, exposing the active-item
    /// register to the caller.
    pub fn parallelize_with_monitor<R, F, Fut>(
        self,
        operation: F,
        option: ParallelizeOption,
        monitor: Arc<ParallelMonitor<T>>,
    ) -> Result<AsyncStream<StreamedValue<T, R>>, ParallelError>
    where
        R: Send + 'static,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let degree = option.max_degree_of_parallelism;
        if degree == 0 || monitor.capacity() < degree {
            return Err(ParallelError::InvalidDegree);
        }

        let AsyncStream {
            receiver,
            cancellation,
            task: upstream,
        } = self;
        let core = Arc::new(ParallelizeCore::new(cancellation.clone(), option.fail_mode));
        let source = Arc::new(Mutex::new(receiver));
        let operation = Arc::new(operation);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER.max(degree));

        let mut workers = JoinSet::new();
        for index in 0..degree {
            workers.spawn(run_worker(
                index,
                core.clone(),
                source.clone(),
                operation.clone(),
                tx.clone(),
                monitor.clone(),
            ));
        }
        drop(tx);
        drop(source);

        let task = tokio::spawn(async move {
            let mut worker_failure = None;
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    worker_failure = Some(e.to_string());
                }
            }
            let upstream_result = join_task(upstream).await;
            if let Some(failure) = worker_failure {
                return Err(ParallelError::Join(failure));
            }
            upstream_result?;
            match Arc::try_unwrap(core) {
                Ok(core) => core.into_result(),
                Err(_) => Err(ParallelError::Join("parallel core still shared".to_string())),
            }
        });

        Ok(AsyncStream::new(rx, cancellation, task))
    }
}

async fn run_worker<T, R, F, Fut>(
    index: usize,
    core: Arc<ParallelizeCore>,
    source: Arc<Mutex<mpsc::Receiver<T>>>,
    operation: Arc<F>,
    results: mpsc::Sender<StreamedValue<T, R>>,
    monitor: Arc<ParallelMonitor<T>>,
) where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    loop {
        let next = source.lock().await.recv().await;
        let Some(item) = next else {
            break;
        };

        monitor.set_active(index, item.clone());
        if core.is_loop_break_requested() {
            let sent = results
                .send(StreamedValue {
                    item,
                    outcome: ExecutionOutcome::Pending,
                })
                .await;
            monitor.set_inactive(index);
            if sent.is_err() {
                debug!("Worker {} exiting, results no longer read", index);
                return;
            }
            if core.fail_mode() == FailMode::Fast {
                debug!("Worker {} exiting, loop break ({})", index, core.break_reason());
                return;
            }
            continue;
        }

        let outcome = match operation(item.clone(), core.global_token()).await {
            Ok(result) => ExecutionOutcome::Succeeded(result),
            Err(e) if is_cancellation(&e) => ExecutionOutcome::Canceled(Arc::new(e)),
            Err(e) => {
                let e = Arc::new(e);
                core.on_exception(e.clone());
                ExecutionOutcome::Faulted(e)
            }
        };
        let sent = results.send(StreamedValue { item, outcome }).await;
        monitor.set_inactive(index);
        if sent.is_err() {
            debug!("Worker {} exiting, results no longer read", index);
            return;
        }
    }
}

async fn join_task(task: JoinHandle<Result<(), ParallelError>>) -> Result<(), ParallelError> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(ParallelError::Join(e.to_string())),
    }
}
