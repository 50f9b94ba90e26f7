//! Waiting registry backing `take`.
//!
//! Each pending `take` is an entry `{ pattern, resolver }`. The scheduler
//! drains the registry on every dispatch, after the reducer has run and
//! before any new saga invocation starts:
//!
//! ```text
//! dispatch(action)
//!     │
//!     ├─► next(action)          (state updated)
//!     ├─► registry.drain(action) ─► resolve every matching take, in order
//!     └─► start matching sagas
//! ```
//!
//! The registry owns no timers. A `take` with a timeout races its
//! [`Registration`] against a timer; whichever side loses is dropped, and
//! dropping a registration removes its entry so a stale resolver can never
//! fire later.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use anyhow::{anyhow, Result};
use tokio::sync::oneshot;
use tracing::trace;

use crate::action::{Action, ActionPattern};
use crate::sync::lock;

struct Waiter {
    id: u64,
    pattern: ActionPattern,
    resolve: oneshot::Sender<Action>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    waiters: Vec<Waiter>,
}

/// Ordered list of sagas blocked in `take`.
#[derive(Default)]
pub(crate) struct WaitingRegistry {
    inner: Mutex<RegistryInner>,
}

impl WaitingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a waiter for `pattern`.
    ///
    /// The returned future resolves with the first matching action dispatched
    /// after this call.
    pub fn register(self: &Arc<Self>, pattern: ActionPattern) -> Registration {
        let (resolve, receiver) = oneshot::channel();
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.waiters.push(Waiter {
            id,
            pattern,
            resolve,
        });
        trace!(id, action_type = pattern.action_type(), "take registered");

        Registration {
            id,
            registry: Arc::clone(self),
            receiver,
        }
    }

    /// Resolve and remove every waiter matching `action`, in insertion order.
    ///
    /// Returns the number of waiters resolved.
    pub fn drain(&self, action: &Action) -> usize {
        let matched: Vec<Waiter> = {
            let mut inner = lock(&self.inner);
            let (matched, kept) = std::mem::take(&mut inner.waiters)
                .into_iter()
                .partition(|w| w.pattern.matches(action));
            inner.waiters = kept;
            matched
        };

        let count = matched.len();
        for waiter in matched {
            // Receiver gone means the take was abandoned between drain and now
            let _ = waiter.resolve.send(action.clone());
        }
        if count > 0 {
            trace!(count, action_type = action.action_type(), "takes resolved");
        }
        count
    }

    fn remove(&self, id: u64) {
        lock(&self.inner).waiters.retain(|w| w.id != id);
    }

    /// Number of takes currently waiting.
    pub fn len(&self) -> usize {
        lock(&self.inner).waiters.len()
    }
}

impl std::fmt::Debug for WaitingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitingRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

/// A pending `take`. Dropping it withdraws the registration.
pub(crate) struct Registration {
    id: u64,
    registry: Arc<WaitingRegistry>,
    receiver: oneshot::Receiver<Action>,
}

impl Future for Registration {
    type Output = Result<Action>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|r| r.map_err(|_| anyhow!("waiting registry closed before action arrived")))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
