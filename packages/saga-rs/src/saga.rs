//! Watcher definitions: which action starts which saga, and under what policy.
//!
//! ```ignore
//! use saga::{for_every, for_latest, SagaEnv};
//!
//! // Every click is logged, even if clicks overlap.
//! let audit = for_every(CLICKED, |env: SagaEnv<AppState>, click| async move {
//!     env.call(&log_click(), click).await
//! });
//!
//! // Only the most recent selection is allowed to finish loading.
//! let loader = for_latest(USER_SELECTED, |env: SagaEnv<AppState>, selected| async move {
//!     let user = env.call(&api_get_user(), selected.id).await?;
//!     env.dispatch(USER_LOADED.create(user))
//! });
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use uuid::Uuid;

use crate::action::{Action, ActionCreator, ActionPattern, Payload};
use crate::env::SagaEnv;
use crate::error::SagaError;

/// Identity of a saga definition.
///
/// Assigned once at definition time and shared by clones, so a cloned
/// `latest` saga still supersedes its own earlier runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SagaId(Uuid);

impl SagaId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happens when a saga is triggered while an earlier run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchPolicy {
    /// Start another independent run; nothing is cancelled.
    Every,
    /// Cancel the earlier run, then start the new one.
    Latest,
}

type Handler<S> = Arc<dyn Fn(SagaEnv<S>, &Action) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A registered saga: action pattern, handler and dispatch policy.
///
/// Built with [`for_every`] or [`for_latest`]; immutable afterwards.
pub struct Saga<S> {
    id: SagaId,
    pattern: ActionPattern,
    policy: DispatchPolicy,
    handler: Handler<S>,
}

impl<S> Clone for Saga<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            pattern: self.pattern,
            policy: self.policy,
            handler: self.handler.clone(),
        }
    }
}

impl<S> fmt::Debug for Saga<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saga")
            .field("id", &self.id)
            .field("action_type", &self.pattern.action_type())
            .field("policy", &self.policy)
            .finish()
    }
}

impl<S> Saga<S> {
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Type tag of the action that triggers this saga.
    pub fn action_type(&self) -> &'static str {
        self.pattern.action_type()
    }

    /// Whether `action` triggers this saga.
    pub fn matches(&self, action: &Action) -> bool {
        self.pattern.matches(action)
    }

    /// Start the handler for `action`.
    ///
    /// The handler is called right away, so a panic in its synchronous
    /// prefix unwinds out of this call. The scheduler guards against that.
    pub(crate) fn invoke(&self, env: SagaEnv<S>, action: &Action) -> BoxFuture<'static, Result<()>> {
        (self.handler)(env, action)
    }
}

/// Start a new, independent run of `handler` for every matching action.
pub fn for_every<S, P, F, Fut>(creator: ActionCreator<P>, handler: F) -> Saga<S>
where
    S: Send + Sync + 'static,
    P: Payload,
    F: Fn(SagaEnv<S>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    define(creator, DispatchPolicy::Every, handler)
}

/// Run `handler` for matching actions, cancelling the previous run each time.
pub fn for_latest<S, P, F, Fut>(creator: ActionCreator<P>, handler: F) -> Saga<S>
where
    S: Send + Sync + 'static,
    P: Payload,
    F: Fn(SagaEnv<S>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    define(creator, DispatchPolicy::Latest, handler)
}

fn define<S, P, F, Fut>(creator: ActionCreator<P>, policy: DispatchPolicy, handler: F) -> Saga<S>
where
    S: Send + Sync + 'static,
    P: Payload,
    F: Fn(SagaEnv<S>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let handler: Handler<S> = Arc::new(move |env: SagaEnv<S>, action: &Action| {
        match creator.extract(action) {
            Some(payload) => handler(env, payload).boxed(),
            None => {
                let err = SagaError::ResultTypeMismatch {
                    effect: creator.action_type(),
                };
                futures::future::ready(Err(err.into())).boxed()
            }
        }
    });

    Saga {
        id: SagaId::new(),
        pattern: creator.pattern(),
        policy,
        handler,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct UserSelected {
        id: i64,
    }

    const USER_SELECTED: ActionCreator<UserSelected> = ActionCreator::new("userSelected");
    const RESET: ActionCreator<()> = ActionCreator::new("reset");

    fn noop_saga(policy: DispatchPolicy) -> Saga<()> {
        let handler = |_env: SagaEnv<()>, _selected: UserSelected| async { Ok(()) };
        match policy {
            DispatchPolicy::Every => for_every(USER_SELECTED, handler),
            DispatchPolicy::Latest => for_latest(USER_SELECTED, handler),
        }
    }

    #[test]
    fn test_policies() {
        assert_eq!(noop_saga(DispatchPolicy::Every).policy(), DispatchPolicy::Every);
        assert_eq!(noop_saga(DispatchPolicy::Latest).policy(), DispatchPolicy::Latest);
    }

    #[test]
    fn test_matches_only_its_creator() {
        let saga = noop_saga(DispatchPolicy::Every);
        assert!(saga.matches(&USER_SELECTED.create(UserSelected { id: 1 })));
        assert!(!saga.matches(&RESET.create(())));
        assert_eq!(saga.action_type(), "userSelected");
    }

    #[test]
    fn test_clones_share_identity() {
        let saga = noop_saga(DispatchPolicy::Latest);
        let clone = saga.clone();
        assert_eq!(saga.id(), clone.id());
        assert_ne!(saga.id(), noop_saga(DispatchPolicy::Latest).id());
    }
}
