use std::sync::atomic::{AtomicUsize, Ordering};

use lsphook::{
    AfterDecision, BackendKind, BackendPreference, MethodHook, PRIORITY_DEFAULT,
    RECORD_ITEM_METHOD, RECORD_ITEM_OP, RECORD_ITEM_STATUS, UnhookOutcome, Value, VmBridge,
};
use std::sync::Arc;

use crate::test_ctx::{
    CALC, SDK_DIRECT, SDK_PROXY_ONLY, add_to_result, call_add, counting, setup,
};

static SINGLE_COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn scenario_single_hook_unhook() {
    let (vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::DirectPatch);
    assert_eq!(rt.backend_kind(), Some(BackendKind::DirectPatch));
    let original = vm.read_method(calc.add.handle).expect("read add failed");

    rt.hook(&calc.add, counting(&SINGLE_COUNT), PRIORITY_DEFAULT)
        .expect("hook add failed");
    SINGLE_COUNT.store(0, Ordering::Relaxed);
    assert_eq!(call_add(&vm, &calc, 20, 22), Some(42));
    assert_eq!(SINGLE_COUNT.load(Ordering::Relaxed), 1, "single hook not hit");

    assert_eq!(
        rt.unhook_method(calc.add.identity()),
        Ok(UnhookOutcome::Restored)
    );
    let before = SINGLE_COUNT.load(Ordering::Relaxed);
    assert_eq!(call_add(&vm, &calc, 20, 22), Some(42));
    assert_eq!(
        before,
        SINGLE_COUNT.load(Ordering::Relaxed),
        "single hook still active after unhook"
    );
    assert_eq!(vm.read_method(calc.add.handle).ok(), Some(original));
    assert_eq!(vm.live_trampolines(), 0);
}

pub fn scenario_dynamic_proxy_receiver() {
    let (vm, rt, calc) = setup(SDK_PROXY_ONLY, BackendPreference::Auto);
    assert_eq!(rt.backend_kind(), Some(BackendKind::DynamicProxy));
    let receiver = vm.new_object(CALC);

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_hook = Arc::clone(&seen);
    let hook = MethodHook::new("receiver").after(move |ctx| {
        if let Some(this) = ctx.this() {
            seen_in_hook.store(this.0, Ordering::Relaxed);
        }
        Ok(AfterDecision::Keep)
    });
    rt.hook(&calc.scale, Arc::new(hook), PRIORITY_DEFAULT)
        .expect("hook scale failed");
    assert_eq!(vm.hooker_count(), 1);

    let result = vm.call(calc.scale.handle, Some(receiver), &[Value::Int(21)]);
    assert_eq!(result, Ok(Value::Long(42)));
    assert_eq!(seen.load(Ordering::Relaxed), receiver.0, "receiver lost in proxy");

    // 动态代理不能还原入口，卸载后只停止回调
    assert_eq!(
        rt.unhook_method(calc.scale.identity()),
        Ok(UnhookOutcome::DispatchOnly)
    );
    seen.store(0, Ordering::Relaxed);
    let result = vm.call(calc.scale.handle, Some(receiver), &[Value::Int(21)]);
    assert_eq!(result, Ok(Value::Long(42)));
    assert_eq!(seen.load(Ordering::Relaxed), 0);
}

pub fn scenario_invoke_original() {
    let (vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::Auto);
    rt.hook(&calc.add, add_to_result(1000), PRIORITY_DEFAULT)
        .expect("hook add failed");
    assert_eq!(call_add(&vm, &calc, 1, 2), Some(1003));
    let original = rt
        .invoke_original(calc.add.identity(), None, &[Value::Int(1), Value::Int(2)])
        .expect("invoke original failed");
    assert_eq!(original, Ok(Value::Int(3)));
}

pub fn scenario_records() {
    let (_vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::DirectPatch);
    rt.hook(&calc.add, add_to_result(1), PRIORITY_DEFAULT)
        .expect("hook add failed");
    rt.unhook_method(calc.add.identity())
        .expect("unhook add failed");

    let text = rt
        .records_text(RECORD_ITEM_OP | RECORD_ITEM_METHOD | RECORD_ITEM_STATUS)
        .expect("records empty");
    assert!(text.contains("HOOK,com.example.Calc#add(II)I,0,"), "{text}");
    assert!(text.contains("UNHOOK,com.example.Calc#add(II)I,0,"), "{text}");

    let mut out = Vec::new();
    rt.dump_records(&mut out, RECORD_ITEM_OP)
        .expect("dump records failed");
    assert_eq!(String::from_utf8_lossy(&out), "HOOK,\nUNHOOK,\n");
}
