//! Minimal reducer store the saga middleware plugs into.
//!
//! The runtime only needs two things from a store: a way to dispatch and a
//! way to read the current state ([`StoreApi`]). [`Store`] is a small
//! reference implementation with a middleware chain, used by the test
//! harness and handy for applications that do not bring their own.
//!
//! ```text
//! dispatch(action)
//!     │
//!     ├─► middleware[0].handle(api, action, next)
//!     │       └─► middleware[1].handle(api, action, next)
//!     │               └─► reducer(state, action) -> state
//!     │
//!     └─► (any middleware may call api.dispatch, which re-enters at [0])
//! ```
//!
//! # Example
//!
//! ```ignore
//! let sagas = create_saga_middleware(vec![fetch_user_saga()]);
//!
//! let store = Store::builder(reducer, AppState::default())
//!     .with_middleware(sagas.clone())
//!     .build();
//!
//! store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));
//! sagas.saga_completion().await;
//! ```

use std::sync::{Arc, RwLock, Weak};

use crate::action::Action;
use crate::sync::{read, write};

/// Read/write contract the runtime needs from a store.
pub trait StoreApi<S>: Send + Sync {
    /// Send an action through the store's middleware chain.
    fn dispatch(&self, action: Action);

    /// Snapshot of the current state.
    fn state(&self) -> S;
}

/// Shared handle to a store.
pub type SharedStore<S> = Arc<dyn StoreApi<S>>;

/// Pure state transition.
pub type Reducer<S> = Arc<dyn Fn(&S, &Action) -> S + Send + Sync>;

/// A layer in the store's dispatch chain.
///
/// `next` forwards the action to the rest of the chain (and ultimately the
/// reducer). A middleware that never calls `next` swallows the action.
pub trait Middleware<S>: Send + Sync {
    fn handle(&self, store: &SharedStore<S>, action: Action, next: &dyn Fn(Action));
}

// =============================================================================
// Store
// =============================================================================

/// Reducer store with a middleware chain.
pub struct Store<S> {
    state: RwLock<S>,
    reducer: Reducer<S>,
    middlewares: Vec<Arc<dyn Middleware<S>>>,
    this: Weak<Store<S>>,
}

impl<S> Store<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Start building a store from a reducer and its initial state.
    pub fn builder<F>(reducer: F, initial: S) -> StoreBuilder<S>
    where
        F: Fn(&S, &Action) -> S + Send + Sync + 'static,
    {
        StoreBuilder {
            reducer: Arc::new(reducer),
            initial,
            middlewares: Vec::new(),
        }
    }

    /// Dispatch through the full middleware chain.
    pub fn dispatch(&self, action: Action) {
        match self.this.upgrade() {
            Some(this) => {
                let api: SharedStore<S> = this;
                self.run_chain(&api, 0, action);
            }
            // Only reachable while the store is being torn down
            None => self.reduce(&action),
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> S {
        read(&self.state).clone()
    }

    fn run_chain(&self, api: &SharedStore<S>, index: usize, action: Action) {
        match self.middlewares.get(index) {
            Some(middleware) => {
                let next = |action: Action| self.run_chain(api, index + 1, action);
                middleware.handle(api, action, &next);
            }
            None => self.reduce(&action),
        }
    }

    fn reduce(&self, action: &Action) {
        let mut state = write(&self.state);
        let next = (self.reducer)(&*state, action);
        *state = next;
    }
}

impl<S> StoreApi<S> for Store<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn dispatch(&self, action: Action) {
        Store::dispatch(self, action);
    }

    fn state(&self) -> S {
        Store::state(self)
    }
}

impl<S> std::fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Store`].
pub struct StoreBuilder<S> {
    reducer: Reducer<S>,
    initial: S,
    middlewares: Vec<Arc<dyn Middleware<S>>>,
}

impl<S> StoreBuilder<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Append a middleware. The first one added sees actions first.
    pub fn with_middleware<M>(mut self, middleware: M) -> Self
    where
        M: Middleware<S> + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Build the store.
    pub fn build(self) -> Arc<Store<S>> {
        Arc::new_cyclic(|this| Store {
            state: RwLock::new(self.initial),
            reducer: self.reducer,
            middlewares: self.middlewares,
            this: this.clone(),
        })
    }
}
