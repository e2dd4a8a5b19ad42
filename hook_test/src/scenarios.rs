mod basic;
mod chain;
mod lifecycle;
mod stress;

use crate::test_ctx::env_flag;

pub fn run_all() {
    run("single-direct-patch", basic::scenario_single_hook_unhook);
    run("dynamic-proxy-receiver", basic::scenario_dynamic_proxy_receiver);
    run("invoke-original", basic::scenario_invoke_original);
    run("records", basic::scenario_records);
    run("priority-chain", chain::scenario_priority_chain);
    run("skip-and-replace", chain::scenario_skip_and_replace);
    run("callback-panic-isolated", chain::scenario_callback_panic_isolated);
    run("app-process-fork", lifecycle::scenario_app_process_fork);
    run("system-server-fork", lifecycle::scenario_system_server_fork);
    run("inlined-caller-deopt", lifecycle::scenario_inlined_caller_deopt);
    run(
        "concurrent-hook-churn",
        stress::scenario_concurrent_hook_churn,
    );
    run(
        "persistent-parallel-stress",
        stress::scenario_persistent_hook_parallel_stress,
    );
    run("perf", stress::scenario_perf_smoke);
    run("leak", stress::scenario_leak_smoke);
    if env_flag("HOOK_TEST_MARATHON") {
        run("churn-marathon", stress::scenario_churn_marathon);
    }
}

fn run(name: &str, scenario: fn()) {
    println!("scenario: {name}");
    scenario();
}
