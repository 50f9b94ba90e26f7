//! End-to-end tests: real store, real scheduler, real (paused) timers.
//!
//! These drive the middleware the way an application would and check the
//! cancellation, `take` and failure-routing guarantees from the outside.

#[cfg(test)]
mod scenario_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::fixtures::*;
    use crate::{
        create_saga_middleware, for_every, for_latest, Action, CallFn, CancellationToken,
        InvocationOutcome, SagaEnv, SagaFn, SagaMiddleware, Store,
    };

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn store_with(sagas: &SagaMiddleware<AppState>) -> Arc<Store<AppState>> {
        Store::builder(reducer, AppState::default())
            .with_middleware(sagas.clone())
            .build()
    }

    fn collect_errors(sagas: &SagaMiddleware<AppState>) -> Arc<Mutex<Vec<anyhow::Error>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        sagas.set_error_handler(move |err, _action| {
            sink.lock().unwrap().push(anyhow::anyhow!("{:#}", err));
        });
        errors
    }

    /// A call target that appends to a shared log.
    fn recorder(log: &Arc<Mutex<Vec<String>>>) -> CallFn<String, ()> {
        let log = log.clone();
        CallFn::new("record", move |entry: String| {
            log.lock().unwrap().push(entry);
            async { Ok(()) }
        })
    }

    /// Let a little (paused) time pass so spawned work can make progress.
    async fn settle_spawned() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // ==========================================================================
    // Latest policy
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_latest_only_second_selection_survives() {
        init_tracing();
        let sagas = create_saga_middleware(vec![select_user_saga()]);
        let mut settled = sagas.subscribe();
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));
        sagas.saga_completion().await;

        assert_eq!(
            store.state(),
            AppState {
                count: 1,
                selected_user: Some(2),
            }
        );

        let mut outcomes = vec![
            settled.recv().await.unwrap().outcome,
            settled.recv().await.unwrap().outcome,
        ];
        outcomes.sort_by_key(|o| o.to_string());
        assert_eq!(
            outcomes,
            vec![InvocationOutcome::Cancelled, InvocationOutcome::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_superseded_mid_sleep_stops_at_next_effect() {
        let sagas = create_saga_middleware(vec![select_user_saga()]);
        let errors = collect_errors(&sagas);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        // First run is now parked inside call(sleep, 3000)
        tokio::time::sleep(Duration::from_millis(1000)).await;
        store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));

        sagas.saga_completion().await;

        assert_eq!(store.state().count, 1);
        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(sagas.active_invocations(), 0);
    }

    #[tokio::test]
    async fn test_latest_superseded_at_first_await_observes_cancellation() {
        let saga = for_latest(
            USER_SELECTED,
            |env: SagaEnv<AppState>, _user: UserSelected| async move {
                tokio::task::yield_now().await;
                env.run(&increment(), ()).await
            },
        );
        let sagas = create_saga_middleware(vec![saga]);
        let errors = collect_errors(&sagas);
        let store = store_with(&sagas);

        // The first run is parked at its yield when the second supersedes it
        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));
        sagas.saga_completion().await;

        assert_eq!(store.state().count, 1);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_synchronous_prefix_completes_before_being_superseded() {
        let saga = for_latest(
            USER_SELECTED,
            |env: SagaEnv<AppState>, _user: UserSelected| async move {
                env.run(&increment(), ()).await
            },
        );
        let sagas = create_saga_middleware(vec![saga]);
        let store = store_with(&sagas);

        // Each run finishes inside its own dispatch, so neither is cancelled
        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        assert_eq!(store.state().count, 1);
        store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));
        sagas.saga_completion().await;

        assert_eq!(store.state().count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_live_token_per_latest_saga() {
        let runs: Arc<Mutex<Vec<(CancellationToken, Arc<AtomicBool>)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let saga = {
            let runs = runs.clone();
            for_latest(USER_SELECTED, move |env: SagaEnv<AppState>, user: UserSelected| {
                let runs = runs.clone();
                async move {
                    let running = Arc::new(AtomicBool::new(true));
                    if let Some(token) = env.token() {
                        runs.lock().unwrap().push((token.clone(), running.clone()));
                    }
                    let result = env.call(&sleep(), user.id as u64).await;
                    running.store(false, Ordering::SeqCst);
                    result
                }
            })
        };
        let sagas = create_saga_middleware(vec![saga]);
        let store = store_with(&sagas);

        let live = || {
            runs.lock()
                .unwrap()
                .iter()
                .filter(|(token, running)| running.load(Ordering::SeqCst) && !token.is_cancelled())
                .count()
        };

        let mut rng = fastrand::Rng::with_seed(0x5a6a);
        let mut last = 0;
        for _ in 0..200 {
            last = rng.i64(1..50);
            store.dispatch(USER_SELECTED.create(UserSelected { id: last }));
            if rng.bool() {
                tokio::time::sleep(Duration::from_millis(rng.u64(0..60))).await;
            } else {
                tokio::task::yield_now().await;
            }
            assert!(live() <= 1, "more than one live token for a latest saga");
        }

        sagas.saga_completion().await;
        assert_eq!(live(), 0);
        assert_eq!(store.state().selected_user, Some(last));
    }

    // ==========================================================================
    // Take
    // ==========================================================================

    #[tokio::test]
    async fn test_take_resumes_on_matching_dispatch() {
        let saga = for_latest(
            USER_SELECTED,
            |env: SagaEnv<AppState>, _user: UserSelected| async move {
                let SetCount { count } = env.take(SET_COUNT).await?;
                env.dispatch(SET_COUNT.create(SetCount { count: count + 5 }))
            },
        );
        let sagas = create_saga_middleware(vec![saga]);
        let store = store_with(&sagas);

        // No yield between the trigger and the awaited action
        store.dispatch(USER_SELECTED.create(UserSelected { id: -1 }));
        store.dispatch(SET_COUNT.create(SetCount { count: 3 }));
        sagas.saga_completion().await;

        assert_eq!(store.state().count, 8);
        assert_eq!(sagas.pending_takes(), 0);
    }

    #[tokio::test]
    async fn test_take_is_registered_before_dispatch_returns() {
        let saga = for_latest(
            USER_SELECTED,
            |env: SagaEnv<AppState>, _user: UserSelected| async move {
                let SetCount { count } = env.take(SET_COUNT).await?;
                env.dispatch(SET_COUNT.create(SetCount { count: count + 5 }))
            },
        );
        let sagas = create_saga_middleware(vec![saga]);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: -1 }));
        assert_eq!(sagas.pending_takes(), 1);

        store.dispatch(SET_COUNT.create(SetCount { count: 3 }));
        assert_eq!(sagas.pending_takes(), 0);

        tokio::time::timeout(Duration::from_secs(2), sagas.saga_completion())
            .await
            .expect("saga waiting in take should have resumed");
        assert_eq!(store.state().count, 8);
    }

    #[tokio::test]
    async fn test_one_dispatch_resolves_every_waiting_take() {
        let waiter = |env: SagaEnv<AppState>, _user: UserSelected| async move {
            env.take(SET_COUNT).await?;
            env.run(&increment(), ()).await
        };
        let sagas = create_saga_middleware(vec![
            for_every(USER_SELECTED, waiter),
            for_every(USER_SELECTED, waiter),
        ]);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        assert_eq!(sagas.pending_takes(), 2);

        store.dispatch(SET_COUNT.create(SetCount { count: 10 }));
        sagas.saga_completion().await;

        assert_eq!(sagas.pending_takes(), 0);
        assert_eq!(store.state().count, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_timeout_fails_saga_and_clears_registry() {
        let saga = for_every(
            USER_SELECTED,
            |env: SagaEnv<AppState>, _user: UserSelected| async move {
                env.take_with_timeout(SET_COUNT, Duration::from_millis(500))
                    .await?;
                Ok(())
            },
        );
        let sagas = create_saga_middleware(vec![saga]);
        let errors = collect_errors(&sagas);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        assert_eq!(sagas.pending_takes(), 1);

        sagas.saga_completion().await;

        assert_eq!(sagas.pending_takes(), 0);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("setCount"));

        // A late action no longer has anyone to resolve
        store.dispatch(SET_COUNT.create(SetCount { count: 1 }));
        assert_eq!(store.state().count, 1);
    }

    // ==========================================================================
    // Every policy
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_every_runs_interleave_without_cancelling() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = recorder(&log);

        let saga = for_every(
            USER_SELECTED,
            move |env: SagaEnv<AppState>, user: UserSelected| {
                let record = record.clone();
                async move {
                    env.call(&record, format!("start {}", user.id)).await?;
                    env.call(&sleep(), 100).await?;
                    env.call(&record, format!("end {}", user.id)).await
                }
            },
        );
        let sagas = create_saga_middleware(vec![saga]);
        let mut settled = sagas.subscribe();
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));
        sagas.saga_completion().await;

        let log = log.lock().unwrap().clone();
        assert_eq!(log.len(), 4);
        assert!(log[..2].iter().all(|e| e.starts_with("start")));
        assert!(log[2..].iter().all(|e| e.starts_with("end")));

        assert_eq!(settled.recv().await.unwrap().outcome, InvocationOutcome::Completed);
        assert_eq!(settled.recv().await.unwrap().outcome, InvocationOutcome::Completed);
    }

    #[tokio::test]
    async fn test_matching_sagas_start_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let named = |name: &'static str| {
            let log = log.clone();
            for_every(USER_SELECTED, move |_env: SagaEnv<AppState>, _user: UserSelected| {
                log.lock().unwrap().push(name);
                async { Ok(()) }
            })
        };
        let sagas = create_saga_middleware(vec![named("first"), named("second"), named("third")]);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        sagas.saga_completion().await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    // ==========================================================================
    // Failures
    // ==========================================================================

    #[tokio::test]
    async fn test_synchronous_panic_is_caught_and_reported() {
        let saga = for_every(USER_SELECTED, |_env: SagaEnv<AppState>, user: UserSelected| {
            if user.id > 0 {
                panic!("no awaits, straight panic");
            }
            async { Ok(()) }
        });
        let sagas = create_saga_middleware(vec![saga]);
        let errors = collect_errors(&sagas);
        let mut settled = sagas.subscribe();
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        sagas.saga_completion().await;

        // Dispatch returned normally and the reducer still ran
        assert_eq!(store.state().selected_user, Some(1));
        assert_eq!(settled.recv().await.unwrap().outcome, InvocationOutcome::Failed);

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("no awaits, straight panic"));
    }

    #[tokio::test]
    async fn test_synchronous_error_is_reported() {
        let saga = for_every(
            USER_SELECTED,
            |_env: SagaEnv<AppState>, user: UserSelected| async move {
                anyhow::bail!("user {} rejected", user.id)
            },
        );
        let sagas = create_saga_middleware(vec![saga]);
        let errors = collect_errors(&sagas);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 4 }));
        sagas.saga_completion().await;

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "user 4 rejected");
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_concurrent_invocations() {
        let saga = for_every(
            USER_SELECTED,
            |env: SagaEnv<AppState>, user: UserSelected| async move {
                if user.id < 0 {
                    anyhow::bail!("negative id");
                }
                env.run(&increment(), ()).await
            },
        );
        let sagas = create_saga_middleware(vec![saga]);
        let errors = collect_errors(&sagas);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        store.dispatch(USER_SELECTED.create(UserSelected { id: -1 }));
        store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));
        sagas.saga_completion().await;

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(store.state().count, 2);
    }

    #[tokio::test]
    async fn test_completion_with_nothing_running_is_immediate() {
        let sagas = create_saga_middleware(vec![select_user_saga()]);
        tokio::time::timeout(Duration::from_millis(50), sagas.saga_completion())
            .await
            .expect("saga_completion should resolve immediately");
    }

    // ==========================================================================
    // Attached and detached children
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_spawned_child_outlives_cancelled_parent() {
        let child: SagaFn<AppState, (), ()> =
            SagaFn::new("delayedIncrement", |env: SagaEnv<AppState>, ()| async move {
                env.call(&sleep(), 2000).await?;
                env.run(&increment(), ()).await
            });

        let saga = {
            let child = child.clone();
            for_latest(USER_SELECTED, move |env: SagaEnv<AppState>, _user: UserSelected| {
                let child = child.clone();
                async move {
                    let task = env.spawn(&child, ())?;
                    env.call(&sleep(), 1000).await?;
                    // Only reached if this run was not superseded
                    task.join().await
                }
            })
        };
        let sagas = create_saga_middleware(vec![saga]);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        settle_spawned().await;
        store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));
        sagas.saga_completion().await;

        // Second parent joined its own child; give the orphaned first child time to finish
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(store.state().count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_child_is_cancelled_with_parent() {
        let child: SagaFn<AppState, (), ()> =
            SagaFn::new("slowIncrement", |env: SagaEnv<AppState>, ()| async move {
                env.call(&sleep(), 2000).await?;
                env.run(&increment(), ()).await
            });

        let saga = {
            let child = child.clone();
            for_latest(USER_SELECTED, move |env: SagaEnv<AppState>, user: UserSelected| {
                let child = child.clone();
                async move {
                    if user.id == 1 {
                        env.run(&child, ()).await
                    } else {
                        Ok(())
                    }
                }
            })
        };
        let sagas = create_saga_middleware(vec![saga]);
        let errors = collect_errors(&sagas);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        settle_spawned().await;
        store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));
        sagas.saga_completion().await;
        tokio::time::sleep(Duration::from_millis(5000)).await;

        assert_eq!(store.state().count, 0);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_saga_dispatches_nothing() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let saga = {
            let gate = gate.clone();
            for_latest(USER_SELECTED, move |env: SagaEnv<AppState>, user: UserSelected| {
                let gate = gate.clone();
                async move {
                    if user.id == 1 {
                        gate.notified().await;
                    }
                    env.dispatch(SET_COUNT.create(SetCount { count: user.id * 100 }))
                }
            })
        };
        let sagas = create_saga_middleware(vec![saga]);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 1 }));
        settle_spawned().await;
        store.dispatch(USER_SELECTED.create(UserSelected { id: 2 }));
        settle_spawned().await;
        gate.notify_waiters();
        sagas.saga_completion().await;

        assert_eq!(store.state().count, 200);
    }

    #[tokio::test]
    async fn test_store_actions_flow_through_reducer_before_sagas_read_state() {
        let seen = Arc::new(Mutex::new(None));
        let saga = {
            let seen = seen.clone();
            for_every(USER_SELECTED, move |env: SagaEnv<AppState>, _user: UserSelected| {
                let seen = seen.clone();
                async move {
                    let selected = env.select(
                        &crate::Selector::new("selectedUser", |s: &AppState, ()| s.selected_user),
                        (),
                    )?;
                    *seen.lock().unwrap() = selected;
                    Ok(())
                }
            })
        };
        let sagas = create_saga_middleware(vec![saga]);
        let store = store_with(&sagas);

        store.dispatch(USER_SELECTED.create(UserSelected { id: 9 }));
        sagas.saga_completion().await;

        assert_eq!(*seen.lock().unwrap(), Some(9));
    }

    #[test]
    fn test_action_payload_shape() {
        let action: Action = SET_COUNT.create(SetCount { count: 3 });
        assert_eq!(action.action_type(), "setCount");
        assert_eq!(action.payload::<SetCount>(), Some(&SetCount { count: 3 }));
    }
}
