//! The saga environment: every effect a saga performs goes through here.
//!
//! A [`SagaEnv`] is handed to each saga invocation. It exposes the six
//! effects (`dispatch`, `select`, `call`, `run`, `spawn`, `take`) and checks
//! the invocation's [`CancellationToken`] before each one. Cancellation is
//! cooperative: a superseded saga keeps running until its next effect, which
//! then fails with [`SagaError::Cancelled`].
//!
//! Effects are eager. The cancellation check and the start of the effect
//! happen when the method is called, not when the returned future is first
//! polled, so a `take` is registered as soon as the saga asks for it.
//!
//! # Example
//!
//! ```ignore
//! async fn fetch_user(env: SagaEnv<AppState>, selected: UserSelected) -> anyhow::Result<()> {
//!     env.call(&sleep(), 3000).await?;
//!     let user = env.call(&api_get_user(), selected.id).await?;
//!     env.dispatch(USER_LOADED.create(user))?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::action::{Action, ActionCreator, ActionPattern, Payload};
use crate::cancel::CancellationToken;
use crate::effect::{
    downcast_value, AnyFuture, AnyValue, CallFn, Effect, EffectBackend, EffectKey, EffectKind,
    SagaFn, Selector, StateReader,
};
use crate::error::SagaError;
use crate::registry::WaitingRegistry;
use crate::store::SharedStore;

// =============================================================================
// SagaEnv
// =============================================================================

/// Execution context of one saga invocation (or one spawned child).
///
/// Cloning is cheap and clones share the same token. A clone is what
/// [`run`](Self::run) hands to attached children.
pub struct SagaEnv<S> {
    backend: Arc<dyn EffectBackend<S>>,
    token: Option<CancellationToken>,
}

impl<S> Clone for SagaEnv<S> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            token: self.token.clone(),
        }
    }
}

impl<S> std::fmt::Debug for SagaEnv<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaEnv")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl<S: Send + Sync + 'static> SagaEnv<S> {
    pub(crate) fn new(
        backend: Arc<dyn EffectBackend<S>>,
        token: Option<CancellationToken>,
    ) -> Self {
        Self { backend, token }
    }

    fn guard(&self) -> Result<()> {
        match &self.token {
            Some(token) if token.is_cancelled() => Err(SagaError::Cancelled.into()),
            _ => Ok(()),
        }
    }

    /// Whether this environment's token has been cancelled.
    ///
    /// Unlike the effect methods this never fails; it lets a saga skip
    /// expensive pure work once it knows it has been superseded.
    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// The token bound to this environment. `None` for `every` invocations.
    pub fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }

    /// Send `action` to the store.
    pub fn dispatch(&self, action: Action) -> Result<()> {
        self.guard()?;
        self.backend.dispatch(action)
    }

    /// Read from the current state through `selector`.
    pub fn select<A, R>(&self, selector: &Selector<S, A, R>, args: A) -> Result<R>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        self.guard()?;
        let key = selector.key();
        let value = self.backend.select(key, selector.reader(args))?;
        downcast_value(value, key.name())
    }

    /// Invoke a plain async function and resolve to its result.
    pub fn call<A, R>(
        &self,
        f: &CallFn<A, R>,
        args: A,
    ) -> impl Future<Output = Result<R>> + Send + 'static
    where
        A: Payload,
        R: Send + 'static,
    {
        let started = self.start(f.effect(args));
        settle(started, f.key())
    }

    /// Invoke a saga-shaped function with this environment (attached child).
    ///
    /// The child shares this environment's token, so cancelling the caller
    /// also cancels everything reached through `run`.
    pub fn run<A, R>(
        &self,
        f: &SagaFn<S, A, R>,
        args: A,
    ) -> impl Future<Output = Result<R>> + Send + 'static
    where
        A: Payload,
        R: Send + 'static,
    {
        let started = self.start(f.effect(EffectKind::Run, args));
        settle(started, f.key())
    }

    /// Start a saga-shaped function on a fresh token (detached child).
    ///
    /// The child runs as its own tokio task whether or not the returned
    /// [`Task`] is joined. Cancelling this environment does not touch the
    /// child, and cancelling the child does not touch this environment.
    pub fn spawn<A, R>(&self, f: &SagaFn<S, A, R>, args: A) -> Result<Task<R>>
    where
        A: Payload,
        R: Send + 'static,
    {
        self.guard()?;
        let runtime = Handle::try_current().map_err(|_| SagaError::NoRuntime)?;

        let token = CancellationToken::new();
        let child = SagaEnv::new(self.backend.detached(), Some(token.clone()));
        let work = self
            .backend
            .perform(&child, f.effect(EffectKind::Spawn, args))?;

        let name = f.key().name();
        let handle = runtime.spawn(async move {
            let value = work.await?;
            downcast_value::<R>(value, name)
        });

        Ok(Task {
            name,
            handle,
            token,
        })
    }

    /// Wait for the next dispatched action built by `creator` and resolve to its payload.
    ///
    /// Waits indefinitely. Use [`take_with_timeout`](Self::take_with_timeout)
    /// when the action may never come.
    pub fn take<P: Payload>(
        &self,
        creator: ActionCreator<P>,
    ) -> impl Future<Output = Result<P>> + Send + 'static {
        let pending = self.register_take(creator.pattern());
        async move {
            let action = pending?.await?;
            extract_taken(creator, &action)
        }
    }

    /// Like [`take`](Self::take), but fails with [`SagaError::Timeout`] after `duration`.
    ///
    /// On timeout the registration is withdrawn, so a later matching action
    /// does not resolve a waiter nobody is listening to.
    pub fn take_with_timeout<P: Payload>(
        &self,
        creator: ActionCreator<P>,
        duration: Duration,
    ) -> impl Future<Output = Result<P>> + Send + 'static {
        let pending = self.register_take(creator.pattern());
        async move {
            let pending = pending?;
            match tokio::time::timeout(duration, pending).await {
                Ok(taken) => extract_taken(creator, &taken?),
                Err(_) => Err(SagaError::Timeout {
                    action_type: creator.action_type(),
                    duration,
                }
                .into()),
            }
        }
    }

    fn start(&self, effect: Effect<S>) -> Result<AnyFuture> {
        self.guard()?;
        self.backend.perform(self, effect)
    }

    fn register_take(
        &self,
        pattern: ActionPattern,
    ) -> Result<BoxFuture<'static, Result<Action>>> {
        self.guard()?;
        self.backend.take(pattern)
    }
}

async fn settle<R: Send + 'static>(started: Result<AnyFuture>, key: EffectKey) -> Result<R> {
    let value = started?.await?;
    downcast_value(value, key.name())
}

fn extract_taken<P: Payload>(creator: ActionCreator<P>, action: &Action) -> Result<P> {
    creator.extract(action).ok_or_else(|| {
        SagaError::ResultTypeMismatch {
            effect: creator.action_type(),
        }
        .into()
    })
}

// =============================================================================
// Task
// =============================================================================

/// Handle to a child started with [`SagaEnv::spawn`].
pub struct Task<R> {
    name: &'static str,
    handle: JoinHandle<Result<R>>,
    token: CancellationToken,
}

impl<R> Task<R> {
    /// Cancel the child. It stops at its next effect.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the child has settled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// The child's own token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wait for the child to settle and return its result.
    ///
    /// A panic inside the child comes back as [`SagaError::Panicked`].
    pub async fn join(self) -> Result<R> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(SagaError::from_panic(e.into_panic()).into()),
            Err(e) => Err(SagaError::TaskJoin {
                message: format!("{}: {}", self.name, e),
            }
            .into()),
        }
    }
}

impl<R> std::fmt::Debug for Task<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

// =============================================================================
// Live backend
// =============================================================================

/// Backend used by the middleware: real store, real registry, real targets.
pub(crate) struct LiveEffects<S> {
    store: SharedStore<S>,
    waiting: Arc<WaitingRegistry>,
}

impl<S> LiveEffects<S> {
    pub fn new(store: SharedStore<S>, waiting: Arc<WaitingRegistry>) -> Self {
        Self { store, waiting }
    }
}

impl<S: Send + Sync + 'static> EffectBackend<S> for LiveEffects<S> {
    fn dispatch(&self, action: Action) -> Result<()> {
        self.store.dispatch(action);
        Ok(())
    }

    fn select(&self, _key: EffectKey, read: StateReader<'_, S>) -> Result<AnyValue> {
        let state = self.store.state();
        Ok(read(&state))
    }

    fn perform(&self, env: &SagaEnv<S>, effect: Effect<S>) -> Result<AnyFuture> {
        trace!(kind = %effect.kind, effect = %effect.key, "performing effect");
        Ok(effect.perform(env.clone()))
    }

    fn take(&self, pattern: ActionPattern) -> Result<BoxFuture<'static, Result<Action>>> {
        Ok(self.waiting.register(pattern).boxed())
    }

    fn detached(&self) -> Arc<dyn EffectBackend<S>> {
        Arc::new(LiveEffects::new(self.store.clone(), self.waiting.clone()))
    }
}
