//! Test harness for sagas.
//!
//! Runs one saga against mocks and an ordered list of expectations instead
//! of the live scheduler. No real timers, network or concurrency are needed:
//! mocked effects resolve immediately, `take` is fed from the expectation
//! list, and dispatches still reach a real reducer so state evolves exactly
//! as it would in production.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! saga = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use saga::testing::{expect_saga, Mock};
//!
//! expect_saga(select_user_saga())
//!     .with_reducer(reducer, AppState::default())
//!     .with_mocks([Mock::call(&sleep(), ())])
//!     .to_call(&sleep(), 3000)
//!     .dispatch(USER_SELECTED.create(UserSelected { id: 2 }))
//!     .to_have_final_state(AppState { count: 1, selected_user: Some(2) })
//!     .run()
//!     .await?;
//! ```
//!
//! # Matching rules
//!
//! Expectations are consumed front to back:
//!
//! - a `dispatch` is checked only when the next expectation is a dispatch of
//!   the same action type; a different payload is a [`DispatchMismatch`]
//! - a `call`/`run`/`spawn` is checked only when the next expectation has
//!   the same kind and target; different arguments are an [`EffectMismatch`]
//! - a `take` must match the next expectation exactly, otherwise
//!   [`UnexpectedTake`]
//!
//! Effects that do not line up with the next expectation pass through
//! unchecked, so a test only has to declare the effects it cares about.
//!
//! [`DispatchMismatch`]: HarnessError::DispatchMismatch
//! [`EffectMismatch`]: HarnessError::EffectMismatch
//! [`UnexpectedTake`]: HarnessError::UnexpectedTake

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::action::{Action, ActionCreator, ActionPattern, DynPayload, Payload};
use crate::cancel::CancellationToken;
use crate::effect::{
    AnyFuture, AnyValue, CallFn, Effect, EffectBackend, EffectKey, EffectKind, SagaFn, Selector,
    StateReader,
};
use crate::env::SagaEnv;
use crate::error::{HarnessError, SagaError};
use crate::saga::Saga;
use crate::store::{Reducer, Store};
use crate::sync::lock;

/// How long [`SagaTest::run`] waits for the saga to settle.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_millis(250);

/// Start describing how `saga` is expected to behave.
pub fn expect_saga<S>(saga: Saga<S>) -> SagaTest<S> {
    SagaTest::new(saga)
}

// =============================================================================
// Mocks
// =============================================================================

type Respond = Arc<dyn Fn(&dyn DynPayload) -> Result<AnyValue> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockTarget {
    Select,
    Effect(EffectKind),
}

/// Canned result for one effect target.
///
/// A mock replaces every use of its target, and must be used at least once
/// or the run fails with [`HarnessError::UnusedMock`].
#[derive(Clone)]
pub struct Mock {
    target: MockTarget,
    key: EffectKey,
    respond: Respond,
}

impl Mock {
    /// Resolve `call(f, ..)` to `value`.
    pub fn call<A, R>(f: &CallFn<A, R>, value: R) -> Self
    where
        A: Payload,
        R: Clone + Send + Sync + 'static,
    {
        Self::returning(MockTarget::Effect(EffectKind::Call), f.key(), value)
    }

    /// Resolve `call(f, args)` to `respond(args)`.
    ///
    /// Use this to fail the call or to answer differently per argument.
    pub fn call_with<A, R, F>(f: &CallFn<A, R>, respond: F) -> Self
    where
        A: Payload,
        R: Send + 'static,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        let key = f.key();
        Self {
            target: MockTarget::Effect(EffectKind::Call),
            key,
            respond: Arc::new(move |args: &dyn DynPayload| {
                let args = args
                    .as_any()
                    .downcast_ref::<A>()
                    .cloned()
                    .ok_or(SagaError::ResultTypeMismatch { effect: key.name() })?;
                let value: AnyValue = Box::new(respond(args)?);
                Ok(value)
            }),
        }
    }

    /// Resolve `run(f, ..)` to `value` without running `f`.
    pub fn run<S, A, R>(f: &SagaFn<S, A, R>, value: R) -> Self
    where
        S: 'static,
        A: Payload,
        R: Clone + Send + Sync + 'static,
    {
        Self::returning(MockTarget::Effect(EffectKind::Run), f.key(), value)
    }

    /// Resolve the task from `spawn(f, ..)` to `value` without running `f`.
    pub fn spawn<S, A, R>(f: &SagaFn<S, A, R>, value: R) -> Self
    where
        S: 'static,
        A: Payload,
        R: Clone + Send + Sync + 'static,
    {
        Self::returning(MockTarget::Effect(EffectKind::Spawn), f.key(), value)
    }

    /// Resolve `select(selector, ..)` to `value` without reading state.
    pub fn select<S, A, R>(selector: &Selector<S, A, R>, value: R) -> Self
    where
        S: 'static,
        A: Send + 'static,
        R: Clone + Send + Sync + 'static,
    {
        Self::returning(MockTarget::Select, selector.key(), value)
    }

    fn returning<R>(target: MockTarget, key: EffectKey, value: R) -> Self
    where
        R: Clone + Send + Sync + 'static,
    {
        Self {
            target,
            key,
            respond: Arc::new(move |_args: &dyn DynPayload| {
                let value: AnyValue = Box::new(value.clone());
                Ok(value)
            }),
        }
    }
}

impl fmt::Debug for Mock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mock")
            .field("target", &self.target)
            .field("effect", &self.key.name())
            .finish()
    }
}

struct MockSlot {
    mock: Mock,
    used: AtomicBool,
}

// =============================================================================
// Expectations
// =============================================================================

enum Expectation {
    Effect {
        kind: EffectKind,
        key: EffectKey,
        args: Box<dyn DynPayload>,
    },
    Dispatch(Action),
    Take {
        pattern: ActionPattern,
        action: Action,
    },
}

impl Expectation {
    fn describe(&self) -> String {
        match self {
            Expectation::Effect { kind, key, args } => format!("{}({}, {:?})", kind, key, args),
            Expectation::Dispatch(action) => format!("dispatch({:?})", action),
            Expectation::Take { pattern, .. } => format!("take({})", pattern.action_type()),
        }
    }
}

// =============================================================================
// SagaTest builder
// =============================================================================

enum StateSource<S> {
    Absent,
    Fixed(S),
    Reduced { reducer: Reducer<S>, initial: S },
}

/// Fluent description of one saga run and what it should do.
pub struct SagaTest<S> {
    saga: Saga<S>,
    state: StateSource<S>,
    mocks: Vec<Mock>,
    expectations: VecDeque<Expectation>,
    action: Option<Action>,
    final_state: Option<S>,
    strict_mocks: bool,
}

impl<S> SagaTest<S> {
    fn new(saga: Saga<S>) -> Self {
        Self {
            saga,
            state: StateSource::Absent,
            mocks: Vec::new(),
            expectations: VecDeque::new(),
            action: None,
            final_state: None,
            strict_mocks: false,
        }
    }

    /// Back `select` and `dispatch` with a real reducer.
    pub fn with_reducer<F>(mut self, reducer: F, initial: S) -> Self
    where
        F: Fn(&S, &Action) -> S + Send + Sync + 'static,
    {
        self.state = StateSource::Reduced {
            reducer: Arc::new(reducer),
            initial,
        };
        self
    }

    /// Back `select` with a fixed state. Dispatches do not change it.
    pub fn with_state(mut self, state: S) -> Self {
        self.state = StateSource::Fixed(state);
        self
    }

    pub fn with_mocks<I>(mut self, mocks: I) -> Self
    where
        I: IntoIterator<Item = Mock>,
    {
        self.mocks.extend(mocks);
        self
    }

    pub fn with_mock(mut self, mock: Mock) -> Self {
        self.mocks.push(mock);
        self
    }

    /// Fail with [`HarnessError::MissingMock`] instead of running an unmocked target.
    pub fn strict_mocks(mut self) -> Self {
        self.strict_mocks = true;
        self
    }

    /// Expect `call(f, args)` next.
    pub fn to_call<A, R>(self, f: &CallFn<A, R>, args: A) -> Self
    where
        A: Payload,
        R: Send + 'static,
    {
        self.expect_effect(EffectKind::Call, f.key(), args)
    }

    /// Expect `run(f, args)` next.
    pub fn to_run<A, R>(self, f: &SagaFn<S, A, R>, args: A) -> Self
    where
        S: 'static,
        A: Payload,
        R: Send + 'static,
    {
        self.expect_effect(EffectKind::Run, f.key(), args)
    }

    /// Expect `spawn(f, args)` next.
    pub fn to_spawn<A, R>(self, f: &SagaFn<S, A, R>, args: A) -> Self
    where
        S: 'static,
        A: Payload,
        R: Send + 'static,
    {
        self.expect_effect(EffectKind::Spawn, f.key(), args)
    }

    /// Expect the saga to dispatch `action` next (compared deeply).
    pub fn to_dispatch(mut self, action: Action) -> Self {
        self.expectations.push_back(Expectation::Dispatch(action));
        self
    }

    /// Expect the saga to `take(creator)` next, and answer it with `payload`.
    pub fn to_take<P: Payload>(mut self, creator: ActionCreator<P>, payload: P) -> Self {
        self.expectations.push_back(Expectation::Take {
            pattern: creator.pattern(),
            action: creator.create(payload),
        });
        self
    }

    /// The action that triggers the saga. It is reduced into state first.
    pub fn dispatch(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    /// Expect this state once the saga has finished.
    pub fn to_have_final_state(mut self, state: S) -> Self {
        self.final_state = Some(state);
        self
    }

    fn expect_effect<A: Payload>(mut self, kind: EffectKind, key: EffectKey, args: A) -> Self {
        self.expectations.push_back(Expectation::Effect {
            kind,
            key,
            args: Box::new(args),
        });
        self
    }
}

impl<S> SagaTest<S>
where
    S: Clone + fmt::Debug + PartialEq + Send + Sync + 'static,
{
    /// Run the saga with [`DEFAULT_RUN_TIMEOUT`].
    pub async fn run(self) -> Result<HarnessReport<S>, HarnessError> {
        self.run_with_timeout(DEFAULT_RUN_TIMEOUT).await
    }

    /// Run the saga and verify every expectation.
    pub async fn run_with_timeout(
        self,
        timeout: Duration,
    ) -> Result<HarnessReport<S>, HarnessError> {
        let action = self.action.ok_or(HarnessError::NoAction)?;
        if !self.saga.matches(&action) {
            return Err(HarnessError::ActionNotMatched {
                action_type: action.action_type(),
            });
        }

        let state = match self.state {
            StateSource::Absent => HarnessState::Absent,
            StateSource::Fixed(state) => HarnessState::Fixed(state),
            StateSource::Reduced { reducer, initial } => {
                let reduce = move |state: &S, action: &Action| reducer(state, action);
                let store = Store::builder(reduce, initial).build();
                store.dispatch(action.clone());
                HarnessState::Store(store)
            }
        };

        let shared = Arc::new(HarnessShared {
            mocks: self
                .mocks
                .into_iter()
                .map(|mock| MockSlot {
                    mock,
                    used: AtomicBool::new(false),
                })
                .collect(),
            strict_mocks: self.strict_mocks,
            state,
            dispatched: Mutex::new(Vec::new()),
            effects: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        });
        let expectations = Arc::new(Mutex::new(self.expectations));
        let backend = Arc::new(HarnessEffects {
            shared: shared.clone(),
            expectations: Some(expectations.clone()),
        });
        let env = SagaEnv::new(backend, Some(CancellationToken::new()));

        debug!(
            saga = %self.saga.id(),
            action_type = action.action_type(),
            "running saga under harness"
        );

        let work: BoxFuture<'static, Result<()>> =
            match catch_unwind(AssertUnwindSafe(|| self.saga.invoke(env, &action))) {
                Ok(work) => work,
                Err(panic) => {
                    let err = anyhow::Error::new(SagaError::from_panic(panic));
                    futures::future::ready(Err(err)).boxed()
                }
            };

        let settled = tokio::time::timeout(timeout, AssertUnwindSafe(work).catch_unwind()).await;
        let result = match settled {
            Err(_) => return Err(HarnessError::Timeout { duration: timeout }),
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(SagaError::from_panic(panic).into()),
        };

        // A mismatch takes precedence: the saga may have swallowed it
        if let Some(failure) = lock(&shared.failure).take() {
            return Err(failure);
        }
        if let Err(e) = result {
            return Err(HarnessError::SagaFailed(e));
        }

        let remaining: Vec<String> = lock(&expectations)
            .iter()
            .map(Expectation::describe)
            .collect();
        if !remaining.is_empty() {
            return Err(HarnessError::UnmetExpectations { remaining });
        }

        if let Some(unused) = shared.mocks.iter().find(|m| !m.used.load(Ordering::Acquire)) {
            return Err(HarnessError::UnusedMock {
                effect: unused.mock.key.name(),
            });
        }

        let final_state = shared.state.snapshot();
        if let Some(expected) = self.final_state {
            match &final_state {
                Some(actual) if *actual == expected => {}
                Some(actual) => {
                    return Err(HarnessError::FinalStateMismatch {
                        expected: format!("{:?}", expected),
                        actual: format!("{:?}", actual),
                    })
                }
                None => return Err(HarnessError::MissingState),
            }
        }

        let dispatched = std::mem::take(&mut *lock(&shared.dispatched));
        let effects = std::mem::take(&mut *lock(&shared.effects));
        Ok(HarnessReport {
            dispatched,
            effects,
            final_state,
        })
    }
}

impl<S> fmt::Debug for SagaTest<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaTest")
            .field("saga", &self.saga)
            .field("mocks", &self.mocks)
            .field("expectations", &self.expectations.len())
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// What a successful harness run observed.
#[derive(Debug, Clone)]
pub struct HarnessReport<S> {
    /// Actions the saga dispatched, in order (the trigger is not included).
    pub dispatched: Vec<Action>,
    /// Every effect the saga performed, described, in order.
    pub effects: Vec<String>,
    /// State after the run, if the harness had any.
    pub final_state: Option<S>,
}

// =============================================================================
// Harness backend
// =============================================================================

enum HarnessState<S> {
    Absent,
    Fixed(S),
    Store(Arc<Store<S>>),
}

impl<S: Clone + Send + Sync + 'static> HarnessState<S> {
    fn snapshot(&self) -> Option<S> {
        match self {
            HarnessState::Absent => None,
            HarnessState::Fixed(state) => Some(state.clone()),
            HarnessState::Store(store) => Some(store.state()),
        }
    }
}

/// State shared by the top-level harness environment and its spawned children.
struct HarnessShared<S> {
    mocks: Vec<MockSlot>,
    strict_mocks: bool,
    state: HarnessState<S>,
    dispatched: Mutex<Vec<Action>>,
    effects: Mutex<Vec<String>>,
    failure: Mutex<Option<HarnessError>>,
}

impl<S> HarnessShared<S> {
    /// Record the first harness failure and hand the saga an equivalent error.
    fn fail(&self, make: impl Fn() -> HarnessError) -> anyhow::Error {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(make());
        }
        make().into()
    }

    fn use_mock(&self, target: MockTarget, key: EffectKey) -> Option<&Mock> {
        let slot = self
            .mocks
            .iter()
            .find(|slot| slot.mock.target == target && slot.mock.key == key)?;
        slot.used.store(true, Ordering::Release);
        Some(&slot.mock)
    }

    fn record(&self, effect: String) {
        lock(&self.effects).push(effect);
    }
}

struct HarnessEffects<S> {
    shared: Arc<HarnessShared<S>>,
    /// `None` for spawned children, which run without expectations.
    expectations: Option<Arc<Mutex<VecDeque<Expectation>>>>,
}

impl<S: Clone + Send + Sync + 'static> EffectBackend<S> for HarnessEffects<S> {
    fn dispatch(&self, action: Action) -> Result<()> {
        self.shared.record(format!("dispatch({:?})", action));
        lock(&self.shared.dispatched).push(action.clone());
        if let HarnessState::Store(store) = &self.shared.state {
            store.dispatch(action.clone());
        }

        let Some(queue) = &self.expectations else {
            return Ok(());
        };
        let expected = {
            let mut queue = lock(queue);
            match queue.front() {
                Some(Expectation::Dispatch(expected))
                    if expected.action_type() == action.action_type() =>
                {
                    let expected = expected.clone();
                    queue.pop_front();
                    expected
                }
                _ => return Ok(()),
            }
        };

        if expected != action {
            let expected = format!("{:?}", expected);
            let actual = format!("{:?}", action);
            return Err(self.shared.fail(|| HarnessError::DispatchMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            }));
        }
        Ok(())
    }

    fn select(&self, key: EffectKey, read: StateReader<'_, S>) -> Result<AnyValue> {
        self.shared.record(format!("select({})", key));
        if let Some(mock) = self.shared.use_mock(MockTarget::Select, key) {
            let no_args: &dyn DynPayload = &();
            return (mock.respond)(no_args);
        }
        match &self.shared.state {
            HarnessState::Store(store) => Ok(read(&store.state())),
            HarnessState::Fixed(state) => Ok(read(state)),
            HarnessState::Absent => Err(self.shared.fail(|| HarnessError::MissingState)),
        }
    }

    fn perform(&self, env: &SagaEnv<S>, effect: Effect<S>) -> Result<AnyFuture> {
        let actual = effect.describe();
        self.shared.record(actual.clone());

        if let Some(queue) = &self.expectations {
            let mut queue = lock(queue);
            let lines_up = matches!(
                queue.front(),
                Some(Expectation::Effect { kind, key, .. })
                    if *kind == effect.kind && *key == effect.key
            );
            if lines_up {
                if let Some(Expectation::Effect { args, .. }) = queue.pop_front() {
                    if !(*args).dyn_eq(&*effect.args) {
                        let expected = format!("{}({}, {:?})", effect.kind, effect.key, args);
                        return Err(self.shared.fail(|| HarnessError::EffectMismatch {
                            expected: expected.clone(),
                            actual: actual.clone(),
                        }));
                    }
                }
            }
        }

        if let Some(mock) = self.shared.use_mock(MockTarget::Effect(effect.kind), effect.key) {
            let value = (mock.respond)(&*effect.args);
            return Ok(futures::future::ready(value).boxed());
        }
        if self.shared.strict_mocks {
            let effect = effect.key.name();
            return Err(self.shared.fail(|| HarnessError::MissingMock { effect }));
        }

        Ok(effect.perform(env.clone()))
    }

    fn take(&self, pattern: ActionPattern) -> Result<BoxFuture<'static, Result<Action>>> {
        let requested = pattern.action_type();
        self.shared.record(format!("take({})", requested));

        let next = match &self.expectations {
            None => "none (spawned child)".to_string(),
            Some(queue) => {
                let mut queue = lock(queue);
                match queue.pop_front() {
                    Some(Expectation::Take {
                        pattern: expected,
                        action,
                    }) if expected == pattern => {
                        return Ok(futures::future::ready(Ok(action)).boxed());
                    }
                    Some(other) => {
                        let next = other.describe();
                        queue.push_front(other);
                        next
                    }
                    None => "none".to_string(),
                }
            }
        };

        Err(self.shared.fail(|| HarnessError::UnexpectedTake {
            requested,
            next: next.clone(),
        }))
    }

    fn detached(&self) -> Arc<dyn EffectBackend<S>> {
        Arc::new(HarnessEffects {
            shared: self.shared.clone(),
            expectations: None,
        })
    }
}
