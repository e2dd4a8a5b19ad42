use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use lsphook::{BackendPreference, PRIORITY_DEFAULT, UnhookOutcome};

use crate::test_ctx::{
    SDK_DIRECT, SDK_PROXY_ONLY, add_to_result, call_add, counting, current_rss_kb, env_usize,
    setup,
};

static PERSISTENT_COUNT: AtomicUsize = AtomicUsize::new(0);
static PERF_COUNT: AtomicUsize = AtomicUsize::new(0);

// 动态代理卸载后入口仍指向 trampoline，反复 hook/unhook 期间调用方只会看到两种结果
pub fn scenario_concurrent_hook_churn() {
    let (vm, rt, calc) = setup(SDK_PROXY_ONLY, BackendPreference::Auto);
    let calc = Arc::new(calc);

    let worker_count = env_usize("HOOK_TEST_CONCURRENT_WORKERS", 16);
    let worker_calls = env_usize("HOOK_TEST_CONCURRENT_CALLS", 400);
    let hook_rounds = env_usize("HOOK_TEST_CONCURRENT_ROUNDS", 80);

    let start_barrier = Arc::new(Barrier::new(worker_count + 1));
    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let barrier = Arc::clone(&start_barrier);
        let vm = Arc::clone(&vm);
        let calc = Arc::clone(&calc);
        workers.push(std::thread::spawn(move || {
            barrier.wait();
            for _ in 0..worker_calls {
                let result = call_add(&vm, &calc, 3, 4);
                assert!(
                    matches!(result, Some(7) | Some(1007)),
                    "unexpected result during churn: {result:?}"
                );
            }
        }));
    }

    start_barrier.wait();
    for _ in 0..hook_rounds {
        let unhook = rt
            .hook(&calc.add, add_to_result(1000), PRIORITY_DEFAULT)
            .expect("hook during churn failed");
        std::thread::sleep(Duration::from_millis(1));
        assert!(unhook.unhook());
        assert_eq!(
            rt.unhook_method(calc.add.identity()),
            Ok(UnhookOutcome::DispatchOnly)
        );
    }

    for worker in workers {
        worker.join().expect("concurrent worker panic");
    }
    assert_eq!(vm.hooker_count(), 1, "parked hook was not reused");
}

pub fn scenario_persistent_hook_parallel_stress() {
    let (vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::DirectPatch);
    let calc = Arc::new(calc);
    rt.hook(&calc.add, counting(&PERSISTENT_COUNT), PRIORITY_DEFAULT)
        .expect("hook persistent stress failed");

    let worker_count = env_usize("HOOK_TEST_PERSISTENT_WORKERS", 24);
    let worker_calls = env_usize("HOOK_TEST_PERSISTENT_CALLS", 320);
    let expected = worker_count * worker_calls;
    let start_barrier = Arc::new(Barrier::new(worker_count));
    PERSISTENT_COUNT.store(0, Ordering::Relaxed);

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let barrier = Arc::clone(&start_barrier);
        let vm = Arc::clone(&vm);
        let calc = Arc::clone(&calc);
        workers.push(std::thread::spawn(move || {
            barrier.wait();
            for i in 0..worker_calls as i32 {
                assert_eq!(call_add(&vm, &calc, i, 1), Some(i + 1));
            }
        }));
    }
    for worker in workers {
        worker.join().expect("persistent worker panic");
    }

    let hit_count = PERSISTENT_COUNT.load(Ordering::Relaxed);
    println!("persistent stress: expected={expected} actual={hit_count}");
    assert_eq!(hit_count, expected, "persistent stress lost calls");
}

pub fn scenario_perf_smoke() {
    let (vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::DirectPatch);
    rt.hook(&calc.add, counting(&PERF_COUNT), PRIORITY_DEFAULT)
        .expect("hook perf failed");

    PERF_COUNT.store(0, Ordering::Relaxed);
    let start = Instant::now();
    for _ in 0..1000 {
        call_add(&vm, &calc, 1, 1);
    }
    let elapsed = start.elapsed();
    let count = PERF_COUNT.load(Ordering::Relaxed);
    assert!(count >= 1000, "perf loop hook lost calls: {count}");
    println!("perf smoke: 1000 hooked calls in {:?}", elapsed);
}

pub fn scenario_leak_smoke() {
    let (vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::DirectPatch);
    let rss_before = current_rss_kb();

    let leak_rounds = env_usize("HOOK_TEST_LEAK_ROUNDS", 320);
    for _ in 0..leak_rounds {
        rt.hook(&calc.add, add_to_result(1), PRIORITY_DEFAULT)
            .expect("hook leak failed");
        assert_eq!(call_add(&vm, &calc, 1, 1), Some(3));
        rt.unhook_method(calc.add.identity())
            .expect("unhook leak failed");
    }
    assert_eq!(vm.live_trampolines(), 0, "trampolines leaked");

    let rss_after = current_rss_kb();
    let delta = rss_after.saturating_sub(rss_before);
    println!(
        "leak smoke: rounds={} rss before={}KB after={}KB delta={}KB",
        leak_rounds, rss_before, rss_after, delta
    );
    assert!(delta < 4096, "rss delta too large: {}KB", delta);
}

pub fn scenario_churn_marathon() {
    let (vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::DirectPatch);
    let rounds = env_usize("HOOK_TEST_MARATHON_ROUNDS", 4000);
    let report_step = env_usize("HOOK_TEST_MARATHON_REPORT_STEP", 400);
    let rss_before = current_rss_kb();
    let start = Instant::now();

    for round in 0..rounds {
        rt.hook(&calc.add, add_to_result(1), PRIORITY_DEFAULT)
            .expect("hook churn marathon failed");
        call_add(&vm, &calc, 1, 1);
        rt.unhook_method(calc.add.identity())
            .expect("unhook churn marathon failed");

        if (round + 1) % report_step == 0 {
            println!(
                "churn marathon: round={} rss={}KB elapsed={:?}",
                round + 1,
                current_rss_kb(),
                start.elapsed()
            );
        }
    }
    let delta = current_rss_kb().saturating_sub(rss_before);
    assert!(delta < 8192, "marathon rss delta too large: {}KB", delta);
    assert_eq!(vm.live_trampolines(), 0);
}
