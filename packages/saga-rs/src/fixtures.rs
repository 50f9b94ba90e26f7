//! Shared test domain: a counter plus a selected user.

use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::action::{Action, ActionCreator};
use crate::effect::{CallFn, SagaFn, Selector};
use crate::env::SagaEnv;
use crate::saga::{for_latest, Saga};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppState {
    pub count: i64,
    pub selected_user: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetCount {
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserSelected {
    pub id: i64,
}

pub const SET_COUNT: ActionCreator<SetCount> = ActionCreator::new("setCount");
pub const USER_SELECTED: ActionCreator<UserSelected> = ActionCreator::new("userSelected");

pub fn reducer(state: &AppState, action: &Action) -> AppState {
    if let Some(SetCount { count }) = SET_COUNT.extract(action) {
        return AppState {
            count,
            ..state.clone()
        };
    }
    if let Some(UserSelected { id }) = USER_SELECTED.extract(action) {
        return AppState {
            selected_user: Some(id),
            ..state.clone()
        };
    }
    state.clone()
}

pub fn sleep() -> CallFn<u64, ()> {
    CallFn::new("sleep", |ms| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    })
}

pub fn count() -> Selector<AppState, (), i64> {
    Selector::new("count", |state: &AppState, ()| state.count)
}

/// Reads the count and dispatches it plus one.
pub fn increment() -> SagaFn<AppState, (), ()> {
    SagaFn::new("increment", |env: SagaEnv<AppState>, ()| async move {
        let count = env.select(&count(), ())?;
        env.dispatch(SET_COUNT.create(SetCount { count: count + 1 }))
    })
}

/// On user selection: wait three seconds, then bump the counter.
pub fn select_user_saga() -> Saga<AppState> {
    for_latest(
        USER_SELECTED,
        |env: SagaEnv<AppState>, _selected: UserSelected| async move {
            env.call(&sleep(), 3000).await?;
            env.run(&increment(), ()).await
        },
    )
}

/// Route runtime logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "saga=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
