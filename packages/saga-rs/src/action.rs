//! Actions and action creators.
//!
//! An [`Action`] is the unit that flows through the store: a static type tag
//! plus a type-erased payload. Sagas never build or inspect actions by hand;
//! they go through an [`ActionCreator`], which both builds actions and
//! recognises the ones it built.
//!
//! ```ignore
//! use saga::ActionCreator;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct SetCount { count: i64 }
//!
//! const SET_COUNT: ActionCreator<SetCount> = ActionCreator::new("setCount");
//!
//! let action = SET_COUNT.create(SetCount { count: 3 });
//! assert!(SET_COUNT.matches(&action));
//! assert_eq!(SET_COUNT.extract(&action), Some(SetCount { count: 3 }));
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Marker for values that can travel as action payloads or effect arguments.
///
/// Equality is needed so the test harness can deep-compare what a saga did
/// against what a test expected; `Debug` is needed to report the difference.
pub trait Payload: Any + Clone + fmt::Debug + PartialEq + Send + Sync {}

impl<T> Payload for T where T: Any + Clone + fmt::Debug + PartialEq + Send + Sync {}

/// Object-safe view of a [`Payload`].
pub(crate) trait DynPayload: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
    fn dyn_eq(&self, other: &dyn DynPayload) -> bool;
}

impl<T: Payload> DynPayload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn dyn_eq(&self, other: &dyn DynPayload) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }
}

// =============================================================================
// Action
// =============================================================================

/// A dispatched action: `{ type, payload }`.
///
/// Cloning is cheap (the payload is shared). Equality is deep: two actions
/// are equal when their tags match and their payloads compare equal.
#[derive(Clone)]
pub struct Action {
    action_type: &'static str,
    payload_type: TypeId,
    payload: Arc<dyn DynPayload>,
}

impl Action {
    /// Build an action directly from a tag and payload.
    ///
    /// Prefer [`ActionCreator::create`], which keeps tag and payload type in sync.
    pub fn new<P: Payload>(action_type: &'static str, payload: P) -> Self {
        Self {
            action_type,
            payload_type: TypeId::of::<P>(),
            payload: Arc::new(payload),
        }
    }

    /// The action's type tag.
    pub fn action_type(&self) -> &'static str {
        self.action_type
    }

    /// Borrow the payload as `P`, if that is its concrete type.
    pub fn payload<P: Payload>(&self) -> Option<&P> {
        self.payload.as_any().downcast_ref::<P>()
    }

    pub(crate) fn payload_type(&self) -> TypeId {
        self.payload_type
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.action_type == other.action_type && (*self.payload).dyn_eq(&*other.payload)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("type", &self.action_type)
            .field("payload", &self.payload)
            .finish()
    }
}

// =============================================================================
// Action Pattern
// =============================================================================

/// What an action must look like to be picked up: tag plus payload type.
///
/// Patterns are what sagas and pending `take`s hold on to. They are `Copy`,
/// so the scheduler can test them against every dispatch without cloning
/// closures around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionPattern {
    action_type: &'static str,
    payload_type: TypeId,
}

impl ActionPattern {
    /// The tag this pattern accepts.
    pub fn action_type(&self) -> &'static str {
        self.action_type
    }

    /// Test an action against this pattern.
    pub fn matches(&self, action: &Action) -> bool {
        self.action_type == action.action_type() && self.payload_type == action.payload_type()
    }
}

// =============================================================================
// Action Creator
// =============================================================================

/// Builds actions of one type and recognises them again.
///
/// Creators are `Copy` and can be declared as constants, which is the
/// expected way to share them between reducers, sagas, and tests.
pub struct ActionCreator<P> {
    action_type: &'static str,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for ActionCreator<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for ActionCreator<P> {}

impl<P> fmt::Debug for ActionCreator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionCreator")
            .field("type", &self.action_type)
            .finish()
    }
}

impl<P> ActionCreator<P> {
    /// Declare a creator for the given type tag.
    pub const fn new(action_type: &'static str) -> Self {
        Self {
            action_type,
            _payload: PhantomData,
        }
    }

    /// The type tag of actions built by this creator.
    pub fn action_type(&self) -> &'static str {
        self.action_type
    }
}

impl<P: Payload> ActionCreator<P> {
    /// Build an action carrying `payload`.
    pub fn create(&self, payload: P) -> Action {
        Action::new(self.action_type, payload)
    }

    /// Whether `action` was built by this creator.
    pub fn matches(&self, action: &Action) -> bool {
        self.pattern().matches(action)
    }

    /// Clone the payload out of `action` if it was built by this creator.
    pub fn extract(&self, action: &Action) -> Option<P> {
        if self.action_type != action.action_type() {
            return None;
        }
        action.payload::<P>().cloned()
    }

    /// The matcher form of this creator.
    pub fn pattern(&self) -> ActionPattern {
        ActionPattern {
            action_type: self.action_type,
            payload_type: TypeId::of::<P>(),
        }
    }
}
