//! Kernel scheduler - serial FIFO execution with deferred work
//!
//! Every kernel owns one [`KernelScheduler`]. Items run strictly in the
//! order they were scheduled and never overlap: a single worker task drains
//! the queue. Before each item runs, every registered deferred-operation
//! source is asked for work that must happen first (bootstrap code, deferred
//! commands); that work runs through the same operation, in order, ahead of
//! the item.
//!
//! # Failure
//! An operation that fails or panics only fails its own handle. Later items
//! still run.
//!
//! # Cancellation
//! [`KernelScheduler::cancel`] is terminal: the running item and everything
//! still queued fail with [`MeshError::Cancelled`], and the scheduler refuses
//! new work.
//!
//! # Re-entrancy
//! An operation that schedules onto its own scheduler and awaits the handle
//! would wait on itself forever. Such items are executed inline instead.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MeshError, Result};

/// Scope used when the caller does not name one
pub const DEFAULT_SCOPE: &str = "default";

/// Work executed for each scheduled item
pub type Operation<T, U> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<U>> + Send + Sync>;

/// Produces items that must run before `(item, scope)`
pub type DeferredOperationSource<T> = Arc<dyn Fn(&T, &str) -> Vec<T> + Send + Sync>;

/// Build an [`Operation`] from an async closure
pub fn operation<T, U, F, Fut>(f: F) -> Operation<T, U>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U>> + Send + 'static,
{
    Arc::new(move |value| f(value).boxed())
}

tokio::task_local! {
    static RUNNING_ON: u64;
}

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

struct ScheduledOperation<T, U> {
    value: T,
    operation: Operation<T, U>,
    scope: String,
    reply: oneshot::Sender<Result<U>>,
}

struct Worker<T> {
    id: u64,
    deferred_sources: RwLock<Vec<DeferredOperationSource<T>>>,
    cancellation: CancellationToken,
}

/// Serial executor for one kernel
pub struct KernelScheduler<T, U> {
    worker: Arc<Worker<T>>,
    queue: mpsc::UnboundedSender<ScheduledOperation<T, U>>,
}

impl<T, U> Clone for KernelScheduler<T, U> {
    fn clone(&self) -> Self {
        Self {
            worker: Arc::clone(&self.worker),
            queue: self.queue.clone(),
        }
    }
}

impl<T: Send + 'static, U: Send + 'static> Default for KernelScheduler<T, U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static, U: Send + 'static> KernelScheduler<T, U> {
    /// Create a scheduler and spawn its worker on the current runtime
    pub fn new() -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let worker = Arc::new(Worker {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            deferred_sources: RwLock::new(Vec::new()),
            cancellation: CancellationToken::new(),
        });
        tokio::spawn(run_queue(Arc::clone(&worker), receiver));
        Self { worker, queue }
    }

    /// Enqueue `value`; the handle resolves with this item's outcome only
    pub fn schedule(
        &self,
        value: T,
        operation: Operation<T, U>,
        scope: impl Into<String>,
    ) -> ScheduledHandle<U> {
        let scope = scope.into();
        if self.is_cancelled() {
            return ScheduledHandle::failed(MeshError::Cancelled);
        }

        if self.is_current() {
            debug!(scheduler = self.worker.id, scope = %scope, "re-entrant schedule, running inline");
            let worker = Arc::clone(&self.worker);
            return ScheduledHandle::inline(worker.execute(value, operation, scope).boxed());
        }

        let (reply, receiver) = oneshot::channel();
        let scheduled = ScheduledOperation {
            value,
            operation,
            scope,
            reply,
        };
        match self.queue.send(scheduled) {
            Ok(()) => ScheduledHandle::queued(receiver),
            Err(_) => ScheduledHandle::failed(MeshError::Cancelled),
        }
    }

    /// Register a source of work that runs ahead of every scheduled item
    pub fn register_deferred_operation_source<F>(&self, source: F)
    where
        F: Fn(&T, &str) -> Vec<T> + Send + Sync + 'static,
    {
        self.worker.deferred_sources.write().push(Arc::new(source));
    }

    /// Cancel the running item and everything queued; terminal
    pub fn cancel(&self) {
        if !self.worker.cancellation.is_cancelled() {
            debug!(scheduler = self.worker.id, "scheduler cancelled");
        }
        self.worker.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.worker.cancellation.is_cancelled()
    }

    /// True when called from inside one of this scheduler's operations
    pub fn is_current(&self) -> bool {
        RUNNING_ON
            .try_with(|id| *id == self.worker.id)
            .unwrap_or(false)
    }
}

async fn run_queue<T: Send + 'static, U: Send + 'static>(
    worker: Arc<Worker<T>>,
    mut queue: mpsc::UnboundedReceiver<ScheduledOperation<T, U>>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = worker.cancellation.cancelled() => None,
            next = queue.recv() => next,
        };
        let Some(ScheduledOperation {
            value,
            operation,
            scope,
            reply,
        }) = next
        else {
            break;
        };

        let result = RUNNING_ON
            .scope(worker.id, Arc::clone(&worker).execute(value, operation, scope))
            .await;
        if reply.send(result).is_err() {
            debug!(scheduler = worker.id, "scheduled item finished after its handle was dropped");
        }
    }

    queue.close();
    let mut cancelled = 0usize;
    while let Ok(pending) = queue.try_recv() {
        let _ = pending.reply.send(Err(MeshError::Cancelled));
        cancelled += 1;
    }
    if cancelled > 0 {
        debug!(scheduler = worker.id, cancelled, "failed pending items on shutdown");
    }
}

impl<T: Send + 'static> Worker<T> {
    async fn execute<U: Send + 'static>(
        self: Arc<Self>,
        value: T,
        operation: Operation<T, U>,
        scope: String,
    ) -> Result<U> {
        let deferred = self.deferred_for(&value, &scope);
        let run = async move {
            for item in deferred {
                match run_guarded(&operation, item).await {
                    Ok(_) => {}
                    Err(e) if e.is_cancellation() => return Err(e),
                    Err(e) => warn!(scope = %scope, error = %e, "deferred operation failed"),
                }
            }
            run_guarded(&operation, value).await
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(MeshError::Cancelled),
            result = run => result,
        }
    }

    fn deferred_for(&self, value: &T, scope: &str) -> Vec<T> {
        let sources = self.deferred_sources.read().clone();
        let mut deferred = Vec::new();
        for source in sources {
            match std::panic::catch_unwind(AssertUnwindSafe(|| source(value, scope))) {
                Ok(items) => deferred.extend(items),
                Err(panic) => warn!(
                    scope,
                    "deferred operation source panicked: {}",
                    panic_message(panic.as_ref())
                ),
            }
        }
        deferred
    }
}

async fn run_guarded<T, U>(operation: &Operation<T, U>, value: T) -> Result<U> {
    match AssertUnwindSafe(operation(value)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(MeshError::OperationPanicked {
            message: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Outcome of one scheduled item
pub struct ScheduledHandle<U> {
    state: HandleState<U>,
}

enum HandleState<U> {
    Queued(oneshot::Receiver<Result<U>>),
    Inline(BoxFuture<'static, Result<U>>),
    Failed(Option<MeshError>),
}

impl<U> ScheduledHandle<U> {
    fn queued(receiver: oneshot::Receiver<Result<U>>) -> Self {
        Self {
            state: HandleState::Queued(receiver),
        }
    }

    fn inline(future: BoxFuture<'static, Result<U>>) -> Self {
        Self {
            state: HandleState::Inline(future),
        }
    }

    fn failed(error: MeshError) -> Self {
        Self {
            state: HandleState::Failed(Some(error)),
        }
    }
}

impl<U> Unpin for ScheduledHandle<U> {}

impl<U> Future for ScheduledHandle<U> {
    type Output = Result<U>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Queued(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(MeshError::Cancelled))),
            HandleState::Inline(future) => future.as_mut().poll(cx),
            HandleState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(MeshError::Cancelled)))
            }
        }
    }
}
