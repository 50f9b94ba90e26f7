//! # Saga
//!
//! A middleware that runs long-lived, cancellable async workflows ("sagas")
//! in response to actions dispatched to a reducer-based store.
//!
//! ## Architecture
//!
//! ```text
//! dispatch(action)
//!     │
//!     ▼
//! ┌──────────────────────┐
//! │   SagaMiddleware      │
//! │                      │
//! │  1. next(action)     │──▶ reducer updates state
//! │  2. drain takes      │──▶ waiting `take`s resume with the action
//! │  3. start sagas      │──▶ polled once inline, then one tokio task each
//! └──────────────────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐
//! │  SagaEnv (per run)   │
//! │                      │
//! │  select / dispatch   │   every effect checks the run's
//! │  call / run / spawn  │   cancellation token first
//! │  take                │
//! └──────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Action**: a type tag plus a typed payload, built by an [`ActionCreator`]
//! - **Saga**: an action pattern, an async handler and a [`DispatchPolicy`]
//! - **Effect**: a side effect performed through [`SagaEnv`], so tests can mock it
//! - **Latest**: a new trigger cancels the in-flight run of the same saga
//!
//! Cancellation is cooperative. A superseded run is never interrupted in the
//! middle of an awaited operation; it stops at its next effect, which fails
//! with [`SagaError::Cancelled`].
//!
//! ## Example
//!
//! ```ignore
//! use saga::{create_saga_middleware, for_latest, ActionCreator, CallFn, SagaEnv, Store};
//!
//! const USER_SELECTED: ActionCreator<UserSelected> = ActionCreator::new("userSelected");
//! const USER_LOADED: ActionCreator<User> = ActionCreator::new("userLoaded");
//!
//! let load_user = for_latest(USER_SELECTED, |env: SagaEnv<AppState>, selected| async move {
//!     let user = env.call(&api_get_user(), selected.id).await?;
//!     env.dispatch(USER_LOADED.create(user))
//! });
//!
//! let sagas = create_saga_middleware(vec![load_user]);
//! sagas.set_error_handler(|err, action| tracing::error!(?action, "saga failed: {:#}", err));
//!
//! let store = Store::builder(reducer, AppState::default())
//!     .with_middleware(sagas.clone())
//!     .build();
//!
//! store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
//! store.dispatch(USER_SELECTED.create(UserSelected { id: 2 })); // cancels the first load
//! sagas.saga_completion().await;
//! ```
//!
//! ## Testing
//!
//! With the `testing` feature, [`testing::expect_saga`] runs a single saga
//! against mocks and an ordered list of expected effects, without timers or
//! a live scheduler.

// Core modules
mod action;
mod cancel;
mod effect;
mod env;
mod error;
mod middleware;
mod registry;
mod saga;
mod store;
mod sync;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Shared test domain (test-only)
#[cfg(test)]
mod fixtures;

// End-to-end scenario tests (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export action types
pub use crate::action::{Action, ActionCreator, ActionPattern, Payload};

// Re-export cancellation
pub use crate::cancel::CancellationToken;

// Re-export effect descriptors
pub use crate::effect::{CallFn, EffectKey, EffectKind, SagaFn, Selector};

// Re-export saga environment types
pub use crate::env::{SagaEnv, Task};

// Re-export error types
pub use crate::error::{is_cancellation, SagaError};

#[cfg(any(test, feature = "testing"))]
pub use crate::error::HarnessError;

// Re-export saga definitions
pub use crate::saga::{for_every, for_latest, DispatchPolicy, Saga, SagaId};

// Re-export middleware types (primary entry point)
pub use crate::middleware::{
    create_saga_middleware, ErrorHandler, InvocationId, InvocationOutcome, SagaMiddleware,
    SagaMiddlewareBuilder, Settlement,
};

// Re-export store types
pub use crate::store::{Middleware, Reducer, SharedStore, Store, StoreApi, StoreBuilder};
