//! The saga scheduler, installed into a store as middleware.
//!
//! On every dispatched action the scheduler:
//!
//! 1. forwards the action down the chain, so state is updated first
//! 2. resolves every pending `take` the action satisfies
//! 3. starts each registered saga the action matches, in registration order
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//! dispatch ──────►│ SagaMiddleware                               │
//!                 │   next(action) ──► reducer                   │
//!                 │   waiting.drain(action) ──► pending takes    │
//!                 │   for saga in sagas.matching(action):        │
//!                 │       latest? cancel previous token          │
//!                 │       poll handler(env, payload) once inline │
//!                 │       spawn the rest ──► tokio               │
//!                 └──────────────────────────────────────────────┘
//!                                       │ settles
//!                                       ▼
//!                  Completed | Cancelled | Failed ──► error handler
//! ```
//!
//! All bookkeeping (latest tokens, pending takes, in-flight invocations)
//! belongs to one scheduler instance. Independent schedulers never share
//! state.
//!
//! # Example
//!
//! ```ignore
//! let sagas = SagaMiddleware::builder()
//!     .with_saga(fetch_user_saga())
//!     .with_error_handler(|err, action| {
//!         tracing::error!(error = %err, action = ?action, "saga failed");
//!     })
//!     .build();
//!
//! let store = Store::builder(reducer, AppState::default())
//!     .with_middleware(sagas.clone())
//!     .build();
//!
//! store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));
//! sagas.saga_completion().await;
//! ```

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::task::noop_waker_ref;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::cancel::CancellationToken;
use crate::env::{LiveEffects, SagaEnv};
use crate::error::{is_cancellation, SagaError};
use crate::registry::WaitingRegistry;
use crate::saga::{DispatchPolicy, Saga, SagaId};
use crate::store::{Middleware, SharedStore};
use crate::sync::{read, write};

/// Capacity of the settlement broadcast. Slow subscribers see `Lagged`.
const SETTLEMENT_CAPACITY: usize = 1024;

/// Sink for saga failures: the error and the action that triggered the saga.
pub type ErrorHandler = Arc<dyn Fn(&anyhow::Error, Option<&Action>) + Send + Sync>;

// =============================================================================
// Invocations
// =============================================================================

/// Identity of one saga run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationId(Uuid);

impl InvocationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an invocation settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationOutcome {
    /// The handler returned `Ok`.
    Completed,
    /// The handler stopped on a cancelled effect. Not reported as a failure.
    Cancelled,
    /// Any other error or panic. Routed to the error handler.
    Failed,
}

impl fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationOutcome::Completed => write!(f, "completed"),
            InvocationOutcome::Cancelled => write!(f, "cancelled"),
            InvocationOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Broadcast to subscribers each time an invocation settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// The run that settled.
    pub invocation: InvocationId,
    /// The saga definition it belonged to.
    pub saga: SagaId,
    /// Type tag of the action that triggered it.
    pub action_type: &'static str,
    /// How it ended.
    pub outcome: InvocationOutcome,
}

struct InvocationEntry {
    settled: AtomicBool,
    notify: Notify,
}

/// In-flight invocations of one scheduler.
///
/// Entries are removed the moment their invocation settles, so the map only
/// ever holds work that is actually running.
#[derive(Default)]
pub(crate) struct InvocationTracker {
    entries: DashMap<InvocationId, Arc<InvocationEntry>>,
}

impl InvocationTracker {
    /// Track `id` until the returned guard is dropped.
    fn begin(self: &Arc<Self>, id: InvocationId) -> InvocationGuard {
        self.entries.insert(
            id,
            Arc::new(InvocationEntry {
                settled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        );
        InvocationGuard {
            tracker: Arc::clone(self),
            id,
        }
    }

    fn settle(&self, id: InvocationId) {
        if let Some((_, entry)) = self.entries.remove(&id) {
            entry.settled.store(true, Ordering::Release);
            entry.notify.notify_waiters();
        }
    }

    /// Wait for every invocation tracked at the time of the call.
    ///
    /// Invocations that start while waiting are not included.
    async fn wait_current(&self) {
        let snapshot: Vec<Arc<InvocationEntry>> =
            self.entries.iter().map(|e| e.value().clone()).collect();

        for entry in snapshot {
            loop {
                // Register before checking so a concurrent settle() is not missed
                let notified = entry.notify.notified();
                if entry.settled.load(Ordering::Acquire) {
                    break;
                }
                notified.await;
            }
        }
    }

    fn active_count(&self) -> usize {
        self.entries.len()
    }
}

/// Settles its invocation on drop, including when the task is aborted.
struct InvocationGuard {
    tracker: Arc<InvocationTracker>,
    id: InvocationId,
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        self.tracker.settle(self.id);
    }
}

// =============================================================================
// Scheduler
// =============================================================================

struct Scheduler<S> {
    sagas: Vec<Saga<S>>,
    latest: DashMap<SagaId, CancellationToken>,
    waiting: Arc<WaitingRegistry>,
    invocations: Arc<InvocationTracker>,
    error_handler: RwLock<Option<ErrorHandler>>,
    settlements: broadcast::Sender<Settlement>,
}

impl<S: Send + Sync + 'static> Scheduler<S> {
    fn start(self: &Arc<Self>, store: &SharedStore<S>, saga: &Saga<S>, action: &Action) {
        let invocation = InvocationId::new();
        let token = match saga.policy() {
            DispatchPolicy::Latest => Some(self.supersede(saga.id())),
            DispatchPolicy::Every => None,
        };

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                let err = anyhow::Error::new(SagaError::NoRuntime);
                self.finish(saga, invocation, token.as_ref(), Err(err), action);
                return;
            }
        };

        let backend = Arc::new(LiveEffects::new(store.clone(), self.waiting.clone()));
        let env = SagaEnv::new(backend, token.clone());

        // A handler that panics before returning its future fails like any other
        let work: BoxFuture<'static, Result<()>> =
            match catch_unwind(AssertUnwindSafe(|| saga.invoke(env, action))) {
                Ok(work) => work,
                Err(panic) => {
                    let err = anyhow::Error::new(SagaError::from_panic(panic));
                    futures::future::ready(Err(err)).boxed()
                }
            };

        debug!(
            saga = %saga.id(),
            invocation = %invocation,
            action_type = action.action_type(),
            policy = ?saga.policy(),
            "starting saga"
        );

        let guard = self.invocations.begin(invocation);

        // Run the synchronous prefix before dispatch returns, so effects such
        // as `take` are in place for the very next action
        let mut work = work;
        let first = {
            let mut cx = Context::from_waker(noop_waker_ref());
            catch_unwind(AssertUnwindSafe(|| work.as_mut().poll(&mut cx)))
        };
        let result = match first {
            Ok(Poll::Pending) => None,
            Ok(Poll::Ready(result)) => Some(result),
            Err(panic) => Some(Err(SagaError::from_panic(panic).into())),
        };
        if let Some(result) = result {
            self.finish(saga, invocation, token.as_ref(), result, action);
            drop(guard);
            return;
        }

        let scheduler = Arc::clone(self);
        let saga = saga.clone();
        let action = action.clone();

        // The task polls at least once more, re-registering its real waker
        runtime.spawn(async move {
            let _guard = guard;
            let result = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(SagaError::from_panic(panic).into()));
            scheduler.finish(&saga, invocation, token.as_ref(), result, &action);
        });
    }

    /// Cancel the current token of a `latest` saga and install a fresh one.
    fn supersede(&self, saga: SagaId) -> CancellationToken {
        let token = CancellationToken::new();
        match self.latest.entry(saga) {
            Entry::Occupied(mut slot) => {
                slot.get().cancel();
                slot.insert(token.clone());
                debug!(saga = %saga, "superseded previous invocation");
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        token
    }

    fn finish(
        &self,
        saga: &Saga<S>,
        invocation: InvocationId,
        token: Option<&CancellationToken>,
        result: Result<()>,
        action: &Action,
    ) {
        let outcome = match result {
            Ok(()) => InvocationOutcome::Completed,
            Err(e) if is_cancellation(&e) => InvocationOutcome::Cancelled,
            Err(e) => {
                self.report(&e, action, saga.id(), invocation);
                InvocationOutcome::Failed
            }
        };

        if let Some(token) = token {
            self.latest
                .remove_if(&saga.id(), |_, current| current.same_as(token));
        }

        debug!(
            saga = %saga.id(),
            invocation = %invocation,
            outcome = %outcome,
            "saga settled"
        );

        // No subscribers is fine
        let _ = self.settlements.send(Settlement {
            invocation,
            saga: saga.id(),
            action_type: saga.action_type(),
            outcome,
        });
    }

    fn report(&self, err: &anyhow::Error, action: &Action, saga: SagaId, invocation: InvocationId) {
        // Clone out so the handler can replace itself without deadlocking
        let handler = read(&self.error_handler).clone();

        match handler {
            Some(handler) => {
                debug!(saga = %saga, invocation = %invocation, error = %err, "saga failed");
                if catch_unwind(AssertUnwindSafe(|| handler(err, Some(action)))).is_err() {
                    warn!(
                        saga = %saga,
                        invocation = %invocation,
                        error = %err,
                        "saga error handler panicked"
                    );
                }
            }
            None => {
                error!(
                    saga = %saga,
                    invocation = %invocation,
                    action_type = action.action_type(),
                    error = %err,
                    "saga failed with no error handler registered"
                );
            }
        }
    }
}

// =============================================================================
// SagaMiddleware
// =============================================================================

/// Store middleware that runs sagas.
///
/// Clones share one scheduler: install one clone into the store and keep
/// another to await completion or change the error handler.
pub struct SagaMiddleware<S> {
    scheduler: Arc<Scheduler<S>>,
}

impl<S> Clone for SagaMiddleware<S> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<S: Send + Sync + 'static> SagaMiddleware<S> {
    pub fn builder() -> SagaMiddlewareBuilder<S> {
        SagaMiddlewareBuilder::new()
    }

    /// Wait until every invocation running right now has settled.
    ///
    /// Never fails: individual failures go to the error handler. Sagas
    /// started while waiting (for example by an action a running saga
    /// dispatches) are not awaited; call again to wait for them too.
    pub async fn saga_completion(&self) {
        self.scheduler.invocations.wait_current().await;
    }

    /// Replace the error handler.
    ///
    /// A panicking handler is contained and logged.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&anyhow::Error, Option<&Action>) + Send + Sync + 'static,
    {
        *write(&self.scheduler.error_handler) = Some(Arc::new(handler));
    }

    /// Receive a [`Settlement`] for every invocation that settles from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Settlement> {
        self.scheduler.settlements.subscribe()
    }

    /// Number of invocations currently running.
    pub fn active_invocations(&self) -> usize {
        self.scheduler.invocations.active_count()
    }

    /// Number of `take`s currently waiting for an action.
    pub fn pending_takes(&self) -> usize {
        self.scheduler.waiting.len()
    }

    /// The sagas this middleware runs, in registration order.
    pub fn sagas(&self) -> &[Saga<S>] {
        &self.scheduler.sagas
    }
}

impl<S: Send + Sync + 'static> Middleware<S> for SagaMiddleware<S> {
    fn handle(&self, store: &SharedStore<S>, action: Action, next: &dyn Fn(Action)) {
        next(action.clone());

        self.scheduler.waiting.drain(&action);

        for saga in self.scheduler.sagas.iter().filter(|s| s.matches(&action)) {
            self.scheduler.start(store, saga, &action);
        }
    }
}

impl<S> fmt::Debug for SagaMiddleware<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaMiddleware")
            .field("sagas", &self.scheduler.sagas.len())
            .field("active_invocations", &self.scheduler.invocations.active_count())
            .field("pending_takes", &self.scheduler.waiting.len())
            .finish()
    }
}

/// Build a middleware running `sagas`, with no error handler.
pub fn create_saga_middleware<S, I>(sagas: I) -> SagaMiddleware<S>
where
    S: Send + Sync + 'static,
    I: IntoIterator<Item = Saga<S>>,
{
    SagaMiddleware::builder().with_sagas(sagas).build()
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SagaMiddleware`].
pub struct SagaMiddlewareBuilder<S> {
    sagas: Vec<Saga<S>>,
    error_handler: Option<ErrorHandler>,
}

impl<S: Send + Sync + 'static> SagaMiddlewareBuilder<S> {
    pub fn new() -> Self {
        Self {
            sagas: Vec::new(),
            error_handler: None,
        }
    }

    /// Register a saga. Sagas matching the same action start in registration order.
    pub fn with_saga(mut self, saga: Saga<S>) -> Self {
        self.sagas.push(saga);
        self
    }

    pub fn with_sagas<I>(mut self, sagas: I) -> Self
    where
        I: IntoIterator<Item = Saga<S>>,
    {
        self.sagas.extend(sagas);
        self
    }

    /// Set the initial error handler.
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&anyhow::Error, Option<&Action>) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> SagaMiddleware<S> {
        let (settlements, _) = broadcast::channel(SETTLEMENT_CAPACITY);
        SagaMiddleware {
            scheduler: Arc::new(Scheduler {
                sagas: self.sagas,
                latest: DashMap::new(),
                waiting: Arc::new(WaitingRegistry::new()),
                invocations: Arc::new(InvocationTracker::default()),
                error_handler: RwLock::new(self.error_handler),
                settlements,
            }),
        }
    }
}

impl<S: Send + Sync + 'static> Default for SagaMiddlewareBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
