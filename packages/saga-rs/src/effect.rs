//! Effect targets and the type-erased effect union.
//!
//! Sagas never touch the outside world directly. They hand a named target
//! plus its arguments to their [`SagaEnv`](crate::SagaEnv):
//!
//! - [`CallFn`] - a plain async function (I/O, timers, clients)
//! - [`SagaFn`] - a saga-shaped function that itself receives an environment
//! - [`Selector`] - a pure read of the current state
//!
//! Every target carries an [`EffectKey`]. The key is the identity the test
//! harness uses to find mocks and check expectations, so two targets with
//! the same name and signature are interchangeable as far as tests go.
//!
//! # Declaring targets
//!
//! ```ignore
//! fn sleep() -> CallFn<u64, ()> {
//!     CallFn::new("sleep", |ms| async move {
//!         tokio::time::sleep(Duration::from_millis(ms)).await;
//!         Ok(())
//!     })
//! }
//!
//! fn count() -> Selector<AppState, (), i64> {
//!     Selector::new("count", |state: &AppState, ()| state.count)
//! }
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::action::{Action, ActionPattern, DynPayload, Payload};
use crate::env::SagaEnv;
use crate::error::SagaError;

pub(crate) type AnyValue = Box<dyn Any + Send>;
pub(crate) type AnyFuture = BoxFuture<'static, Result<AnyValue>>;

/// Recover a concrete effect result from its erased form.
pub(crate) fn downcast_value<R: 'static>(value: AnyValue, effect: &'static str) -> Result<R> {
    value
        .downcast::<R>()
        .map(|boxed| *boxed)
        .map_err(|_| SagaError::ResultTypeMismatch { effect }.into())
}

// =============================================================================
// Effect Key
// =============================================================================

/// Identity of an effect target.
///
/// Made of the name given at declaration and the target's argument and
/// result types. Nothing else is compared: targets built separately with
/// the same name and signature are the same target to mocks and
/// expectations, which is what lets a test build its own `sleep()` to mock
/// the one the saga uses. Names must therefore be unique per signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectKey {
    name: &'static str,
    signature: TypeId,
}

impl EffectKey {
    fn of<Sig: 'static>(name: &'static str) -> Self {
        Self {
            name,
            signature: TypeId::of::<Sig>(),
        }
    }

    /// The declared name of the target.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for EffectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// =============================================================================
// Targets
// =============================================================================

type CallBody<A, R> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// A named async function invoked through [`SagaEnv::call`](crate::SagaEnv::call).
pub struct CallFn<A, R> {
    key: EffectKey,
    f: CallBody<A, R>,
}

impl<A, R> Clone for CallFn<A, R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            f: self.f.clone(),
        }
    }
}

impl<A, R> fmt::Debug for CallFn<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFn").field("name", &self.key.name).finish()
    }
}

impl<A: Payload, R: Send + 'static> CallFn<A, R> {
    /// Wrap `f` under `name`.
    ///
    /// Two `CallFn`s with the same name and types share one [`EffectKey`],
    /// so a mock for one also intercepts the other.
    pub fn new<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self {
            key: EffectKey::of::<fn(A) -> R>(name),
            f: Arc::new(move |args| f(args).boxed()),
        }
    }

    /// The target's identity.
    pub fn key(&self) -> EffectKey {
        self.key
    }

    pub(crate) fn effect<S: 'static>(&self, args: A) -> Effect<S> {
        let f = self.f.clone();
        let name = self.key.name;
        Effect {
            kind: EffectKind::Call,
            key: self.key,
            args: Box::new(args),
            body: Box::new(move |_env: SagaEnv<S>, args: Box<dyn DynPayload>| {
                match unbox_args::<A>(args, name) {
                    Ok(args) => f(args).map(|r| r.map(box_value)).boxed(),
                    Err(e) => futures::future::ready(Err(e)).boxed(),
                }
            }),
        }
    }
}

type SagaBody<S, A, R> = Arc<dyn Fn(SagaEnv<S>, A) -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// A named saga-shaped function: it receives an environment as its first argument.
///
/// Used with [`SagaEnv::run`](crate::SagaEnv::run) (attached, same token) and
/// [`SagaEnv::spawn`](crate::SagaEnv::spawn) (detached, own token).
pub struct SagaFn<S, A, R> {
    key: EffectKey,
    f: SagaBody<S, A, R>,
}

impl<S, A, R> Clone for SagaFn<S, A, R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            f: self.f.clone(),
        }
    }
}

impl<S, A, R> fmt::Debug for SagaFn<S, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaFn").field("name", &self.key.name).finish()
    }
}

impl<S: 'static, A: Payload, R: Send + 'static> SagaFn<S, A, R> {
    /// Wrap `f` under `name`.
    pub fn new<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: Fn(SagaEnv<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self {
            key: EffectKey::of::<fn(SagaEnv<S>, A) -> R>(name),
            f: Arc::new(move |env, args| f(env, args).boxed()),
        }
    }

    /// The target's identity.
    pub fn key(&self) -> EffectKey {
        self.key
    }

    pub(crate) fn effect(&self, kind: EffectKind, args: A) -> Effect<S> {
        let f = self.f.clone();
        let name = self.key.name;
        Effect {
            kind,
            key: self.key,
            args: Box::new(args),
            body: Box::new(move |env: SagaEnv<S>, args: Box<dyn DynPayload>| {
                match unbox_args::<A>(args, name) {
                    Ok(args) => f(env, args).map(|r| r.map(box_value)).boxed(),
                    Err(e) => futures::future::ready(Err(e)).boxed(),
                }
            }),
        }
    }
}

type SelectBody<S, A, R> = Arc<dyn Fn(&S, A) -> R + Send + Sync>;

/// A named pure read of the store state.
pub struct Selector<S, A, R> {
    key: EffectKey,
    f: SelectBody<S, A, R>,
}

impl<S, A, R> Clone for Selector<S, A, R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            f: self.f.clone(),
        }
    }
}

impl<S, A, R> fmt::Debug for Selector<S, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector").field("name", &self.key.name).finish()
    }
}

impl<S: 'static, A: Send + 'static, R: Send + 'static> Selector<S, A, R> {
    /// Wrap `f` under `name`.
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(&S, A) -> R + Send + Sync + 'static,
    {
        Self {
            key: EffectKey::of::<fn(&S, A) -> R>(name),
            f: Arc::new(f),
        }
    }

    /// The target's identity.
    pub fn key(&self) -> EffectKey {
        self.key
    }

    /// Apply the selector directly, outside any environment.
    pub fn apply(&self, state: &S, args: A) -> R {
        (self.f)(state, args)
    }

    pub(crate) fn reader(&self, args: A) -> StateReader<'static, S> {
        let f = self.f.clone();
        Box::new(move |state: &S| box_value(f(state, args)))
    }
}

fn box_value<R: Send + 'static>(value: R) -> AnyValue {
    Box::new(value)
}

fn unbox_args<A: 'static>(args: Box<dyn DynPayload>, effect: &'static str) -> Result<A> {
    args.into_any()
        .downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| SagaError::ResultTypeMismatch { effect }.into())
}

// =============================================================================
// Effect (type-erased)
// =============================================================================

/// How an effect relates to the environment that performs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    /// Plain function call.
    Call,
    /// Saga-shaped function sharing the caller's token.
    Run,
    /// Saga-shaped function on a fresh, detached token.
    Spawn,
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectKind::Call => write!(f, "call"),
            EffectKind::Run => write!(f, "run"),
            EffectKind::Spawn => write!(f, "spawn"),
        }
    }
}

pub(crate) type EffectBody<S> =
    Box<dyn FnOnce(SagaEnv<S>, Box<dyn DynPayload>) -> AnyFuture + Send>;

/// One call/run/spawn request, erased so backends handle all three the same way.
pub(crate) struct Effect<S> {
    pub kind: EffectKind,
    pub key: EffectKey,
    pub args: Box<dyn DynPayload>,
    pub body: EffectBody<S>,
}

impl<S> Effect<S> {
    /// Invoke the real target with the environment it should see.
    pub fn perform(self, env: SagaEnv<S>) -> AnyFuture {
        (self.body)(env, self.args)
    }

    /// Render as `kind(name, args)` for harness reports and mismatch errors.
    #[cfg(any(test, feature = "testing"))]
    pub fn describe(&self) -> String {
        format!("{}({}, {:?})", self.kind, self.key.name, self.args)
    }
}

pub(crate) type StateReader<'a, S> = Box<dyn FnOnce(&S) -> AnyValue + Send + 'a>;

// =============================================================================
// Effect Backend
// =============================================================================

/// What actually carries out effects for a [`SagaEnv`](crate::SagaEnv).
///
/// The live backend talks to the store and the scheduler's waiting registry;
/// the test harness substitutes mocks and ordered expectations. The
/// environment performs the cancellation check before reaching the backend.
pub(crate) trait EffectBackend<S>: Send + Sync {
    /// Send an action to the store.
    fn dispatch(&self, action: Action) -> Result<()>;

    /// Run a selector against the current state.
    fn select(&self, key: EffectKey, read: StateReader<'_, S>) -> Result<AnyValue>;

    /// Start a call/run/spawn effect. `env` is the environment the target
    /// should receive if it really runs.
    fn perform(&self, env: &SagaEnv<S>, effect: Effect<S>) -> Result<AnyFuture>;

    /// Wait for the next action matching `pattern`.
    fn take(&self, pattern: ActionPattern) -> Result<BoxFuture<'static, Result<Action>>>;

    /// Backend for a detached child created by `spawn`.
    fn detached(&self) -> Arc<dyn EffectBackend<S>>;
}
