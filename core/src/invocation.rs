//! Invocation context - per-command execution state
//!
//! Every command that runs gets an [`InvocationContext`]. Contexts nest: a
//! command issued while another command's context is current becomes its
//! child. The current context is task-local; it is entered with
//! [`InvocationContext::scope`] and is never visible to unrelated tasks.
//!
//! # Publication
//! Events published into a context are stamped with every kernel the context
//! passes through (innermost first), buffered, handed to observers and
//! forwarded up the parent chain. Forwarding stops at the first ancestor that
//! has finished and never carries a child's success/failure.
//!
//! # Completion
//! `complete`/`fail` emit exactly one terminal event. A context whose
//! children are still running records the request and finishes when the last
//! child does. A failed child turns its parent's pending success into a
//! failure.

use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::contract::{CommandId, KernelCommand, KernelEvent, KernelUri};

tokio::task_local! {
    static CURRENT: InvocationContext;
}

/// Lifecycle of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    Active,
    Succeeded,
    Failed,
}

impl ContextStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ContextStatus::Active)
    }
}

type EventObserver = Arc<dyn Fn(&KernelEvent) + Send + Sync>;
type Continuation = Box<dyn FnOnce(&InvocationContext) + Send>;

enum CompletionRequest {
    Succeed(KernelCommand),
    Fail(KernelCommand, String),
}

struct ContextState {
    status: ContextStatus,
    requested: Option<CompletionRequest>,
    child_failure: Option<String>,
    active_children: usize,
    events: Vec<KernelEvent>,
    kernel_stamps: Vec<KernelUri>,
    observers: Vec<EventObserver>,
    continuations: Vec<Continuation>,
    disposed: bool,
}

impl ContextState {
    fn accepts_publication(&self) -> bool {
        self.status == ContextStatus::Active && self.requested.is_none()
    }

    fn record(&mut self, mut event: KernelEvent) -> KernelEvent {
        for uri in &self.kernel_stamps {
            event.routing_slip.stamp_if_absent(uri);
        }
        self.events.push(event.clone());
        event
    }
}

fn notify(observers: &[EventObserver], event: &KernelEvent) {
    for observer in observers {
        observer(event);
    }
}

struct ContextInner {
    command: KernelCommand,
    parent: Option<InvocationContext>,
    cancellation: CancellationToken,
    state: Mutex<ContextState>,
    /// Held from recording an event until its observers returned; observers
    /// run without `state` locked and may publish on the same thread
    delivery: ReentrantMutex<()>,
    status: watch::Sender<ContextStatus>,
}

/// Execution context of one command
#[derive(Clone)]
pub struct InvocationContext {
    inner: Arc<ContextInner>,
}

/// Result of [`InvocationContext::establish`]
pub struct Established {
    pub context: InvocationContext,
    /// False when an existing context for the same command was reused
    pub owned: bool,
}

impl InvocationContext {
    /// The context of the command running on this task, if any
    pub fn current() -> Option<InvocationContext> {
        CURRENT
            .try_with(|context| context.clone())
            .ok()
            .filter(|context| !context.is_disposed())
    }

    /// Context for `command`, nested under the current one when possible
    pub fn establish(command: &KernelCommand) -> Established {
        let current = Self::current();
        Self::establish_within(command, current.as_ref())
    }

    /// Context for `command` with an explicit parent candidate
    pub fn establish_within(command: &KernelCommand, parent: Option<&InvocationContext>) -> Established {
        if let Some(existing) = parent {
            if existing.command_id() == &command.id && !existing.is_complete() {
                return Established {
                    context: existing.clone(),
                    owned: false,
                };
            }
        }

        let parent = parent.filter(|candidate| candidate.register_child()).cloned();
        let cancellation = match &parent {
            Some(parent) => parent.inner.cancellation.child_token(),
            None => CancellationToken::new(),
        };
        let (status, _) = watch::channel(ContextStatus::Active);

        trace!(
            command = %command.id,
            nested = parent.is_some(),
            "invocation context established"
        );

        Established {
            context: InvocationContext {
                inner: Arc::new(ContextInner {
                    command: command.clone(),
                    parent,
                    cancellation,
                    state: Mutex::new(ContextState {
                        status: ContextStatus::Active,
                        requested: None,
                        child_failure: None,
                        active_children: 0,
                        events: Vec::new(),
                        kernel_stamps: Vec::new(),
                        observers: Vec::new(),
                        continuations: Vec::new(),
                        disposed: false,
                    }),
                    delivery: ReentrantMutex::new(()),
                    status,
                }),
            },
            owned: true,
        }
    }

    /// Run `future` with this context as the current one
    pub fn scope<F: Future>(&self, future: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(self.clone(), future)
    }

    pub fn command(&self) -> &KernelCommand {
        &self.inner.command
    }

    pub fn command_id(&self) -> &CommandId {
        &self.inner.command.id
    }

    pub fn parent(&self) -> Option<&InvocationContext> {
        self.inner.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    pub fn status(&self) -> ContextStatus {
        self.inner.state.lock().status
    }

    /// Terminal event emitted
    pub fn is_complete(&self) -> bool {
        self.status().is_terminal()
    }

    /// Still accepting publications
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().accepts_publication()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    /// Events published into this context so far
    pub fn events(&self) -> Vec<KernelEvent> {
        self.inner.state.lock().events.clone()
    }

    /// Register a kernel this context's events pass through
    ///
    /// Kernels entered later sit closer to the handler and are stamped first.
    pub fn enter_kernel(&self, uri: &KernelUri) {
        let mut state = self.inner.state.lock();
        if !state.kernel_stamps.contains(uri) {
            state.kernel_stamps.insert(0, uri.clone());
        }
    }

    /// Innermost kernel handling this context
    pub fn handling_kernel_uri(&self) -> Option<KernelUri> {
        self.inner.state.lock().kernel_stamps.first().cloned()
    }

    /// Publish an event; false if the context no longer accepts events
    pub fn publish(&self, event: KernelEvent) -> bool {
        self.deliver(event, false)
    }

    fn deliver(&self, event: KernelEvent, from_child: bool) -> bool {
        let recorded = {
            let _delivery = self.inner.delivery.lock();
            let (recorded, observers) = {
                let mut state = self.inner.state.lock();
                let accepting = if from_child {
                    !state.status.is_terminal()
                } else {
                    state.accepts_publication()
                };
                if !accepting {
                    trace!(
                        command = %self.inner.command.id,
                        event = event.event_type(),
                        "publication on inactive context ignored"
                    );
                    return false;
                }
                (state.record(event), state.observers.clone())
            };
            notify(&observers, &recorded);
            recorded
        };

        if let Some(parent) = &self.inner.parent {
            if !recorded.is_terminal() {
                parent.deliver(recorded, true);
            }
        }
        true
    }

    /// Finish successfully
    pub fn complete(&self, command: &KernelCommand) {
        self.request_completion(CompletionRequest::Succeed(command.clone()));
    }

    /// Finish with a failure
    pub fn fail(&self, command: &KernelCommand, message: impl Into<String>) {
        self.request_completion(CompletionRequest::Fail(command.clone(), message.into()));
    }

    fn request_completion(&self, request: CompletionRequest) {
        let failing = matches!(request, CompletionRequest::Fail(..));
        let ready = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                return;
            }
            // the first failure wins
            if !matches!(state.requested, Some(CompletionRequest::Fail(..))) {
                state.requested = Some(request);
            }
            state.active_children == 0
        };

        if failing {
            self.inner.cancellation.cancel();
        }
        if ready {
            self.finalize();
        }
    }

    fn finalize(&self) {
        let (status, failure, continuations) = {
            let _delivery = self.inner.delivery.lock();
            let (status, terminal, observers, continuations) = {
                let mut state = self.inner.state.lock();
                if state.status.is_terminal() || state.active_children > 0 {
                    return;
                }
                let Some(request) = state.requested.take() else {
                    return;
                };

                let (status, event) = match request {
                    CompletionRequest::Succeed(command) => match state.child_failure.clone() {
                        None => (ContextStatus::Succeeded, KernelEvent::succeeded(&command)),
                        Some(message) => (ContextStatus::Failed, KernelEvent::failed(&command, message)),
                    },
                    CompletionRequest::Fail(command, message) => {
                        (ContextStatus::Failed, KernelEvent::failed(&command, message))
                    }
                };
                let terminal = state.record(event);
                state.status = status;
                (
                    status,
                    terminal,
                    std::mem::take(&mut state.observers),
                    std::mem::take(&mut state.continuations),
                )
            };
            notify(&observers, &terminal);
            (status, terminal.failure_message().map(str::to_string), continuations)
        };

        self.inner.status.send_replace(status);
        debug!(command = %self.inner.command.id, ?status, "invocation context completed");

        for continuation in continuations {
            continuation(self);
        }

        if let Some(parent) = &self.inner.parent {
            if let Some(message) = &failure {
                parent.deliver(
                    KernelEvent::error_produced(&self.inner.command, message.clone()),
                    true,
                );
            }
            parent.child_finished(failure);
        }
    }

    fn register_child(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.active_children += 1;
        true
    }

    /// Forget failures of children that already finished
    pub(crate) fn recover_from_child_failures(&self) {
        self.inner.state.lock().child_failure = None;
    }

    fn child_finished(&self, failure: Option<String>) {
        let ready = {
            let mut state = self.inner.state.lock();
            state.active_children = state.active_children.saturating_sub(1);
            if let Some(message) = failure {
                state.child_failure.get_or_insert(message);
            }
            !state.status.is_terminal() && state.requested.is_some() && state.active_children == 0
        };
        if ready {
            self.finalize();
        }
    }

    /// Wait until the terminal event was emitted
    pub async fn wait_for_completion(&self) -> ContextStatus {
        let mut receiver = self.inner.status.subscribe();
        let status = match receiver.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// Run `continuation` once, after the terminal event
    pub fn on_complete<F>(&self, continuation: F)
    where
        F: FnOnce(&InvocationContext) + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if !state.status.is_terminal() {
                state.continuations.push(Box::new(continuation));
                return;
            }
        }
        continuation(self);
    }

    /// Observe events as they are recorded; observers must not block
    pub fn on_event<F>(&self, observer: F)
    where
        F: Fn(&KernelEvent) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        if !state.status.is_terminal() {
            state.observers.push(Arc::new(observer));
        }
    }

    /// Live stream of this context's events, ending at completion
    pub fn event_stream(&self) -> UnboundedReceiverStream<KernelEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.on_event(move |event| {
            let _ = sender.send(event.clone());
        });
        UnboundedReceiverStream::new(receiver)
    }

    /// Complete if needed and stop being the current context
    pub fn dispose(&self) {
        let complete = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            !state.status.is_terminal() && state.requested.is_none()
        };
        if complete {
            let command = self.inner.command.clone();
            self.complete(&command);
        }
    }

    fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    pub fn same_as(&self, other: &InvocationContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("command", &self.inner.command.id)
            .field("status", &self.status())
            .field("root", &self.is_root())
            .finish()
    }
}
