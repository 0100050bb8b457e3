// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Completion chains: ordering, failure, timeouts, exceptions, waiting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use actorkit_completes::{AsCompletion, Completion, CompletionError, CompletionState, StepGuard};
use actorkit_scheduler::{Scheduler, SchedulerConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn scheduler() -> Arc<Scheduler> {
    init_tracing();
    Arc::new(Scheduler::new(SchedulerConfig::default()).unwrap())
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[test]
fn resolve_sets_outcome() {
    init_tracing();
    let c = Completion::<String>::new();
    c.resolve("done".to_string());

    for _ in 0..3 {
        assert_eq!(c.outcome().as_deref(), Some("done"));
        assert!(c.has_outcome());
    }
    assert!(c.is_completed());
    assert!(!c.has_failed());
    assert_eq!(c.state(), CompletionState::Resolved);
}

#[test]
fn second_resolve_is_ignored() {
    let c = Completion::<i32>::new();
    c.resolve(1).resolve(2);
    assert_eq!(c.outcome(), Some(1));
}

#[test]
fn steps_run_in_registration_order() {
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::new()));
    let c = Completion::<i32>::new();

    let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
    let out = c
        .and_then(move |v| {
            l1.lock().unwrap().push(format!("f1({v})"));
            v + 1
        })
        .and_then(move |v| {
            l2.lock().unwrap().push(format!("f2({v})"));
            v * 10
        })
        .and_then_consume(move |v| l3.lock().unwrap().push(format!("seen({v})")));

    assert!(log.lock().unwrap().is_empty());
    c.resolve(4);

    assert_eq!(out.outcome(), Some(50));
    assert_eq!(*log.lock().unwrap(), vec!["f1(4)", "f2(5)", "seen(50)"]);
}

#[test]
fn late_registration_runs_on_caller() {
    let c = Completion::<i32>::new();
    c.resolve(3);
    let caller = thread::current().id();
    let ran_on = Arc::new(Mutex::new(None));
    let r = ran_on.clone();
    let out = c.and_then(move |v| {
        *r.lock().unwrap() = Some(thread::current().id());
        v * 3
    });
    assert_eq!(out.outcome(), Some(9));
    assert_eq!(*ran_on.lock().unwrap(), Some(caller));
}

#[test]
fn sentinel_fails_chain_and_otherwise_runs_once() {
    init_tracing();
    let later = counter();
    let handled = counter();
    let received = Arc::new(Mutex::new(None));

    let c = Completion::<i32>::new();
    let l = later.clone();
    let (h, rx) = (handled.clone(), received.clone());
    let out = c
        .and_then(|v| v - 10)
        .and_then_guarded(StepGuard::new().failed_outcome(-1), |v| v * 100)
        .and_then(move |v| {
            l.fetch_add(1, Ordering::SeqCst);
            v
        })
        .otherwise(move |v| {
            h.fetch_add(1, Ordering::SeqCst);
            *rx.lock().unwrap() = Some(v);
            0
        })
        .otherwise(|_| 1234);

    c.resolve(9);

    assert!(out.has_failed());
    assert_eq!(out.state(), CompletionState::Failed);
    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(*received.lock().unwrap(), Some(-1));
    assert_eq!(out.outcome(), Some(0));
}

#[test]
fn otherwise_registered_after_failure_runs_immediately() {
    let c = Completion::<i32>::new();
    c.use_failed_outcome_of(-1);
    c.resolve(-1);
    assert!(c.has_failed());

    let out = c.otherwise(|v| v.abs());
    assert_eq!(out.outcome(), Some(1));
}

#[test]
fn otherwise_before_failing_step_still_runs() {
    let handled = counter();
    let h = handled.clone();
    let c = Completion::<i32>::new();
    c.otherwise_consume(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    })
    .and_then_guarded(StepGuard::new().failed_outcome(7), |v| v + 1);

    c.resolve(7);
    assert!(c.has_failed());
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[test]
fn timeout_wins_over_slow_producer() {
    let sched = scheduler();
    let invoked = counter();
    let handled = counter();
    let received = Arc::new(Mutex::new(None));

    let c = Completion::<i32>::pending(sched.clone());
    let i = invoked.clone();
    let (h, rx) = (handled.clone(), received.clone());
    let out = c
        .and_then_timeout(Duration::from_millis(1), move |v| {
            i.fetch_add(1, Ordering::SeqCst);
            v + 1
        })
        .otherwise(move |v| {
            h.fetch_add(1, Ordering::SeqCst);
            *rx.lock().unwrap() = Some(v);
            v * 10
        });

    let producer = {
        let c = c.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            c.resolve(1);
        })
    };
    producer.join().unwrap();

    assert!(out.has_failed());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    // The late value still reaches the otherwise-handler, once.
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(*received.lock().unwrap(), Some(1));
    assert_eq!(out.outcome(), Some(10));

    c.resolve(2);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    sched.close();
}

#[test]
fn timeout_reports_step_sentinel() {
    let sched = scheduler();
    let received = Arc::new(Mutex::new(None));
    let r = received.clone();

    let c = Completion::<i32>::pending(sched.clone());
    c.and_then_guarded(
        StepGuard::new()
            .timeout(Duration::from_millis(5))
            .failed_outcome(-99),
        |v| v,
    )
    .otherwise(move |v| {
        *r.lock().unwrap() = Some(v);
        v
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while received.lock().unwrap().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*received.lock().unwrap(), Some(-99));
    assert!(c.has_failed());
    sched.close();
}

#[test]
fn deadline_loses_to_fast_producer() {
    let sched = scheduler();
    let c = Completion::<i32>::pending(sched.clone());
    let out = c.and_then_timeout(Duration::from_millis(1000), |v| v * 2);

    let producer = {
        let c = c.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            c.resolve(21);
        })
    };
    producer.join().unwrap();

    assert_eq!(out.outcome(), Some(42));
    assert!(!out.has_failed());
    // The losing timer was cancelled.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sched.pending_tasks(), 0);
    sched.close();
}

#[test]
fn panicking_step_routes_to_recover_once() {
    init_tracing();
    let recovered = counter();
    let later = counter();

    let c = Completion::<i32>::new();
    let r = recovered.clone();
    let l = later.clone();
    let out = c
        .and_then(|v| -> i32 {
            if v > 0 {
                panic!("boom");
            }
            v
        })
        .and_then(move |v| {
            l.fetch_add(1, Ordering::SeqCst);
            v
        })
        .recover_from(move |e| {
            r.fetch_add(1, Ordering::SeqCst);
            assert_eq!(e, CompletionError::Panicked("boom".to_string()));
            -7
        })
        .recover_from(|_| 1000);

    c.resolve(1);

    assert!(out.has_failed());
    assert_eq!(out.state(), CompletionState::Errored);
    assert_eq!(recovered.load(Ordering::SeqCst), 1);
    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert_eq!(out.outcome(), Some(-7));
    assert_eq!(
        out.exception(),
        Some(CompletionError::Panicked("boom".to_string()))
    );
}

#[test]
fn exception_does_not_reach_otherwise() {
    let handled = counter();
    let h = handled.clone();
    let c = Completion::<i32>::new();
    let out = c
        .and_then_try(|v| if v == 0 { Err("zero") } else { Ok(v) })
        .otherwise_consume(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
    c.resolve(0);
    assert_eq!(out.state(), CompletionState::Errored);
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[test]
fn unhandled_exception_fails_soft() {
    let c = Completion::<i32>::new();
    let out = c.and_then(|_| -> i32 { panic!("nobody listens") });
    c.resolve(1);
    assert!(out.has_failed());
    assert!(out.is_completed());
}

#[test]
fn flat_map_adopts_completed_inner() {
    let c = Completion::<i32>::new();
    let out = c
        .and_then_to(|v| Completion::resolved(format!("id-{v}")))
        .and_then(|s| s.len());
    c.resolve(42);
    assert_eq!(out.outcome(), Some(5));
}

#[test]
fn flat_map_adopts_inner_failure() {
    let c = Completion::<i32>::new();
    let out = c
        .and_then_to(Completion::failed)
        .and_then(|v| v + 1)
        .otherwise(|v| v * 2);
    c.resolve(8);
    assert!(out.has_failed());
    assert_eq!(out.outcome(), Some(16));
}

#[test]
fn flat_map_resumes_when_inner_resolves_on_another_thread() {
    init_tracing();
    let inner = Completion::<String>::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let c = Completion::<i32>::new();
    let i = inner.clone();
    let l = log.clone();
    let out = c
        .and_then_to(move |_| i.clone())
        .and_then(|s| s.to_uppercase())
        .and_then_consume(move |s| l.lock().unwrap().push(s.clone()));

    c.resolve(1);
    assert!(!out.is_completed());
    assert!(log.lock().unwrap().is_empty());

    let producer = {
        let inner = inner.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            inner.resolve("fan-in".to_string());
        })
    };

    assert_eq!(out.wait(), "FAN-IN");
    producer.join().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["FAN-IN"]);
}

#[test]
fn timed_flat_map_fails_when_inner_is_late() {
    let sched = scheduler();
    let inner = Completion::<i32>::new();
    let c = Completion::<i32>::pending(sched.clone());
    let i = inner.clone();
    let after = counter();
    let a = after.clone();
    let out = c
        .and_then_to_guarded(StepGuard::new().timeout(Duration::from_millis(20)), move |_| {
            i.clone()
        })
        .and_then_consume(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

    c.resolve(1);
    out.wait_timeout(Duration::from_secs(2));
    assert!(out.has_failed());

    inner.resolve(5);
    assert_eq!(after.load(Ordering::SeqCst), 0);
    sched.close();
}

#[test]
fn wait_timeout_on_unresolved_returns_default() {
    let c = Completion::<i32>::new();
    let start = Instant::now();
    assert_eq!(c.wait_timeout(Duration::from_millis(30)), 0);
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(c.has_failed());
    assert!(c.is_completed());
}

#[test]
fn wait_after_expired_wait_returns_immediately() {
    let c = Completion::<i32>::new();
    assert_eq!(c.wait_timeout(Duration::from_millis(10)), 0);

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let c = c.clone();
        thread::spawn(move || {
            let _ = tx.send(c.wait());
        })
    };
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(0));
    waiter.join().unwrap();
}

#[test]
fn expired_wait_hands_late_value_to_otherwise() {
    let c = Completion::<i32>::new();
    let out = c.otherwise(|v| -v);
    assert_eq!(out.wait_timeout(Duration::from_millis(10)), 0);
    assert!(out.has_failed());

    c.resolve(8);
    assert_eq!(out.outcome(), Some(-8));
    assert_eq!(out.wait(), -8);
}

#[test]
fn wait_blocks_until_resolved() {
    let c = Completion::<String>::new();
    let out = c.and_then(|s| format!("{s}!"));
    let producer = {
        let c = c.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            c.resolve("ready".to_string());
        })
    };
    assert_eq!(out.wait(), "ready!");
    producer.join().unwrap();
}

#[test]
fn wait_on_resolved_returns_immediately() {
    let c = Completion::resolved(5u64);
    assert_eq!(c.wait(), 5);
    assert_eq!(c.wait_timeout(Duration::from_millis(1)), 5);
    assert!(!c.has_failed());
}

#[test]
fn concurrent_resolvers_pick_one_outcome() {
    for _ in 0..20 {
        let c = Completion::<usize>::new();
        let runs = counter();
        let r = runs.clone();
        let out = c.and_then(move |v| {
            r.fetch_add(1, Ordering::SeqCst);
            v
        });
        let producers: Vec<_> = (0..4)
            .map(|n| {
                let c = c.clone();
                thread::spawn(move || {
                    c.resolve(n);
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(out.outcome().is_some_and(|v| v < 4));
    }
}

#[test]
fn result_lifts_into_completion() {
    let parsed = "12".parse::<i32>().as_completion().and_then(|v| v + 1);
    assert_eq!(parsed.outcome(), Some(13));

    let failed = "x".parse::<i32>().as_completion().recover_from(|_| -1);
    assert_eq!(failed.outcome(), Some(-1));
    assert!(failed.has_failed());
}
