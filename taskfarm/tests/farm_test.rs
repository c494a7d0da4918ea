//! End-to-end farm scenarios over thread-mode units

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};

use taskfarm::{
    CallContext, ExecutionMode, Farm, FarmError, MethodResult, ModuleError, WorkerModule,
};

/// Shared across module instances so tests can observe worker behavior.
/// Each unit (and each restart) gets its own module instance; the probe is
/// the only thing they share.
#[derive(Default)]
struct Probe {
    instances: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    /// Remaining number of `crash_once` invocations that should panic
    crashes_left: AtomicUsize,
    broadcasts: AtomicUsize,
    /// (key, seq, instance) per `tagged` call, in execution order
    tagged_calls: Mutex<Vec<(String, u64, usize)>>,
}

struct TestModule {
    probe: Arc<Probe>,
    instance: usize,
}

impl TestModule {
    fn mode(probe: &Arc<Probe>) -> ExecutionMode {
        let probe = Arc::clone(probe);
        ExecutionMode::thread(move || TestModule {
            instance: probe.instances.fetch_add(1, Ordering::SeqCst),
            probe: Arc::clone(&probe),
        })
    }
}

impl WorkerModule for TestModule {
    fn methods(&self) -> Vec<&'static str> {
        vec![
            "add",
            "boom",
            "slow_echo",
            "tagged",
            "crash_once",
            "always_crash",
            "nap",
            "progress",
            "broadcasts_seen",
        ]
    }

    fn invoke(&self, method: &str, args: Vec<JsonValue>, ctx: &CallContext) -> MethodResult {
        match method {
            "add" => {
                let a = args.first().and_then(JsonValue::as_i64).unwrap_or(0);
                let b = args.get(1).and_then(JsonValue::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            }
            "boom" => Err(ModuleError::new("boom")),
            "slow_echo" => {
                let now = self.probe.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.probe.max_concurrent.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(40));
                self.probe.concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({
                    "value": args.first().cloned().unwrap_or(JsonValue::Null),
                    "instance": self.instance,
                }))
            }
            "tagged" => {
                let key = args
                    .first()
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                let seq = args.get(1).and_then(JsonValue::as_u64).unwrap_or(0);
                self.probe
                    .tagged_calls
                    .lock()
                    .unwrap()
                    .push((key, seq, self.instance));
                Ok(json!(self.instance))
            }
            "crash_once" => {
                if self
                    .probe
                    .crashes_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    panic!("simulated crash");
                }
                Ok(json!("recovered"))
            }
            "always_crash" => panic!("simulated crash"),
            "nap" => {
                std::thread::sleep(Duration::from_millis(300));
                Ok(json!("rested"))
            }
            "progress" => {
                ctx.emit(json!({"step": 1}));
                ctx.emit(json!({"step": 2}));
                Ok(json!("done"))
            }
            "broadcasts_seen" => Ok(json!(self.probe.broadcasts.load(Ordering::SeqCst))),
            other => Err(ModuleError::named(
                "MethodNotFound",
                format!("unknown method `{}`", other),
            )),
        }
    }

    fn on_message(&self, _payload: &JsonValue) {
        self.probe.broadcasts.fetch_add(1, Ordering::SeqCst);
    }
}

async fn start_farm(probe: &Arc<Probe>, configure: impl FnOnce(taskfarm::FarmBuilder) -> taskfarm::FarmBuilder) -> Farm {
    let farm = configure(Farm::builder().execution(TestModule::mode(probe)))
        .build()
        .expect("farm builds");
    farm.start().await.expect("farm starts");
    farm
}

#[tokio::test]
async fn test_call_returns_result() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(2)).await;

    assert_eq!(farm.call("add", (2, 3)).await.unwrap(), json!(5));

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_application_error_propagates_verbatim() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(1)).await;

    match farm.call("boom", ()).await {
        Err(FarmError::Remote(err)) => {
            assert_eq!(err.message, "boom");
            assert_eq!(err.name, "Error");
        }
        other => panic!("expected remote error, got {:?}", other),
    }

    // An application failure is not a crash: the same unit keeps serving
    assert_eq!(farm.call("add", (1, 1)).await.unwrap(), json!(2));

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_concurrency_capped_at_pool_size() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(2)).await;

    let pending: Vec<_> = (0..5)
        .map(|i| farm.request("slow_echo").args((i,)).send().unwrap())
        .collect();

    let mut instances = HashSet::new();
    for (i, call) in pending.into_iter().enumerate() {
        let output = call.await.unwrap();
        assert_eq!(output["value"], json!(i));
        instances.insert(output["instance"].as_u64().unwrap());
    }

    // Exactly two units exist, so at most two calls ever ran at once
    assert!(probe.max_concurrent.load(Ordering::SeqCst) <= 2);
    assert!(instances.len() <= 2);

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_sticky_key_serializes_on_one_worker_in_order() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| {
        b.workers(3).compute_worker_key(|method, args| {
            (method == "tagged")
                .then(|| args.first()?.as_str().map(str::to_string))
                .flatten()
        })
    })
    .await;

    let mut pending = Vec::new();
    for seq in 0..6u64 {
        pending.push(farm.request("tagged").args(("suite-a", seq)).send().unwrap());
        // Unkeyed noise that may run anywhere
        pending.push(farm.request("add").args((1, 2)).send().unwrap());
    }
    for call in pending {
        call.await.unwrap();
    }

    let calls = probe.tagged_calls.lock().unwrap();
    let suite: Vec<_> = calls.iter().filter(|(k, _, _)| k == "suite-a").collect();
    assert_eq!(suite.len(), 6);

    let owner = suite[0].2;
    for (i, (_, seq, instance)) in suite.iter().enumerate() {
        assert_eq!(*instance, owner, "same-key calls must share a worker");
        assert_eq!(*seq, i as u64, "same-key calls must run in submission order");
    }

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_crash_retries_and_recovers() {
    let probe = Arc::new(Probe::default());
    probe.crashes_left.store(1, Ordering::SeqCst);
    let farm = start_farm(&probe, |b| b.workers(1).max_retries(2)).await;

    // First attempt panics the unit; the retry lands on its replacement
    let output = farm.call("crash_once", ()).await.unwrap();
    assert_eq!(output, json!("recovered"));

    let stats = farm.stats().await.unwrap();
    assert_eq!(stats.len(), 1);
    assert!(stats[0].restart_count >= 1);

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_reject_distinctly_then_slot_recovers() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(1).max_retries(1).max_unit_restarts(5)).await;

    match farm.call("always_crash", ()).await {
        Err(FarmError::CrashExhausted { attempts, .. }) => {
            // maxRetries = 1 means exactly two attempts in total
            assert_eq!(attempts, 2);
        }
        other => panic!("expected crash-exhausted, got {:?}", other),
    }

    // The slot restarted within its own budget and serves new work
    assert_eq!(farm.call("add", (20, 22)).await.unwrap(), json!(42));

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_graceful_end_settles_every_task() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(2)).await;

    let pending: Vec<_> = (0..5)
        .map(|i| farm.request("slow_echo").args((i,)).send().unwrap())
        .collect();

    farm.end(false).await.unwrap();

    for (i, call) in pending.into_iter().enumerate() {
        assert_eq!(call.await.unwrap()["value"], json!(i));
    }

    // Intake is closed afterwards
    assert!(matches!(
        farm.call("add", (1, 1)).await,
        Err(FarmError::Ended)
    ));
}

#[tokio::test]
async fn test_force_end_rejects_outstanding_tasks() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(1)).await;

    let pending: Vec<_> = (0..3)
        .map(|_| farm.request("nap").args(()).send().unwrap())
        .collect();

    farm.end(true).await.unwrap();

    for call in pending {
        assert!(matches!(call.await, Err(FarmError::Ended)));
    }
}

#[tokio::test]
async fn test_timeout_follows_the_crash_path() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| {
        b.workers(1)
            .max_retries(0)
            .call_timeout(Duration::from_millis(50))
    })
    .await;

    match farm.call("nap", ()).await {
        Err(FarmError::CrashExhausted { attempts, last_exit }) => {
            assert_eq!(attempts, 1);
            assert!(last_exit.contains("deadline"), "last_exit: {}", last_exit);
        }
        other => panic!("expected crash-exhausted, got {:?}", other),
    }

    farm.end(true).await.unwrap();
}

#[tokio::test]
async fn test_update_side_channel_streams_to_caller() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(1)).await;

    let updates: Arc<Mutex<Vec<JsonValue>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    let output = farm
        .request("progress")
        .args(())
        .on_update(move |payload| sink.lock().unwrap().push(payload))
        .invoke()
        .await
        .unwrap();

    assert_eq!(output, json!("done"));
    assert_eq!(
        *updates.lock().unwrap(),
        vec![json!({"step": 1}), json!({"step": 2})]
    );

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_live_workers() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(1)).await;

    farm.broadcast(json!({"note": "flush caches"})).await.unwrap();
    assert_eq!(farm.call("broadcasts_seen", ()).await.unwrap(), json!(1));

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_is_a_configuration_error() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(1)).await;

    match farm.call("transmogrify", ()).await {
        Err(FarmError::Config(message)) => assert!(message.contains("transmogrify")),
        other => panic!("expected config error, got {:?}", other),
    }

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_exposed_methods_restrict_the_surface() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(1).exposed_methods(["add"])).await;

    assert_eq!(farm.call("add", (2, 2)).await.unwrap(), json!(4));
    assert!(matches!(
        farm.call("boom", ()).await,
        Err(FarmError::Config(_))
    ));

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_calls_before_start_are_rejected() {
    let probe = Arc::new(Probe::default());
    let farm = Farm::builder()
        .workers(1)
        .execution(TestModule::mode(&probe))
        .build()
        .unwrap();

    assert!(matches!(
        farm.call("add", (1, 1)).await,
        Err(FarmError::Config(_))
    ));

    farm.end(false).await.unwrap();
}

#[tokio::test]
async fn test_stats_track_execution_counts() {
    let probe = Arc::new(Probe::default());
    let farm = start_farm(&probe, |b| b.workers(2)).await;

    farm.call("add", (1, 2)).await.unwrap();
    let _ = farm.call("boom", ()).await;

    let stats = farm.stats().await.unwrap();
    assert_eq!(stats.len(), 2);
    let executed: u64 = stats.iter().map(|s| s.tasks_executed).sum();
    let failed: u64 = stats.iter().map(|s| s.tasks_failed).sum();
    assert_eq!(executed, 2);
    assert_eq!(failed, 1);

    farm.end(false).await.unwrap();
}
