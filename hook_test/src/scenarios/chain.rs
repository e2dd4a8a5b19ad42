use std::sync::{Arc, Mutex};

use lsphook::{
    AfterDecision, BackendPreference, CallbackError, DispatchDecision, HookCallback,
    InvocationContext, MethodHook, PRIORITY_DEFAULT, PRIORITY_HIGHEST, PRIORITY_LOWEST,
    Throwable, Value,
};

use crate::test_ctx::{SDK_DIRECT, call_add, setup};

fn tracer(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<dyn HookCallback> {
    let before_log = Arc::clone(log);
    let after_log = Arc::clone(log);
    Arc::new(
        MethodHook::new(tag)
            .before(move |_| {
                before_log.lock().unwrap().push(format!("before:{tag}"));
                Ok(DispatchDecision::Continue)
            })
            .after(move |_| {
                after_log.lock().unwrap().push(format!("after:{tag}"));
                Ok(AfterDecision::Keep)
            }),
    )
}

pub fn scenario_priority_chain() {
    let (vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::DirectPatch);
    let log = Arc::new(Mutex::new(Vec::new()));
    rt.hook(&calc.add, tracer(&log, "low"), PRIORITY_LOWEST)
        .expect("hook low failed");
    rt.hook(&calc.add, tracer(&log, "high"), PRIORITY_HIGHEST)
        .expect("hook high failed");
    rt.hook(&calc.add, tracer(&log, "mid"), PRIORITY_DEFAULT)
        .expect("hook mid failed");
    assert_eq!(rt.hooked_count(), 1);

    assert_eq!(call_add(&vm, &calc, 2, 3), Some(5));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "before:high",
            "before:mid",
            "before:low",
            "after:low",
            "after:mid",
            "after:high",
        ]
    );
}

pub fn scenario_skip_and_replace() {
    let (vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::DirectPatch);
    let log = Arc::new(Mutex::new(Vec::new()));
    rt.hook(&calc.add, tracer(&log, "outer"), PRIORITY_HIGHEST)
        .expect("hook outer failed");
    let skip = rt
        .hook_with(
            &calc.add,
            Some(Box::new(
                |_: &mut InvocationContext| -> Result<DispatchDecision, CallbackError> {
                    Ok(DispatchDecision::SkipWithResult(Value::Int(-1)))
                },
            )),
            None,
            PRIORITY_DEFAULT,
        )
        .expect("hook skip failed");
    rt.hook(&calc.add, tracer(&log, "inner"), PRIORITY_LOWEST)
        .expect("hook inner failed");

    // 跳过原方法时，更低优先级的回调完全不运行
    assert_eq!(call_add(&vm, &calc, 2, 3), Some(-1));
    assert_eq!(*log.lock().unwrap(), vec!["before:outer", "after:outer"]);

    assert!(skip.unhook());
    log.lock().unwrap().clear();
    let error_class = "java.lang.UnsupportedOperationException";
    let thrown = Throwable::new(vm.new_object(error_class), error_class, Some("replaced"));
    let expected = thrown.clone();
    rt.hook(
        &calc.add,
        Arc::new(MethodHook::new("throw").after(move |_| {
            Ok(AfterDecision::ReplaceException(thrown.clone()))
        })),
        PRIORITY_DEFAULT,
    )
    .expect("hook throw failed");
    let outcome = vm.call(calc.add.handle, None, &[Value::Int(2), Value::Int(3)]);
    assert_eq!(outcome, Err(expected));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["before:outer", "before:inner", "after:inner", "after:outer"]
    );
}

pub fn scenario_callback_panic_isolated() {
    let (vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::DirectPatch);
    rt.hook(
        &calc.add,
        Arc::new(MethodHook::new("broken").before(|ctx| {
            ctx.set_arg(0, Value::Int(1000));
            panic!("broken module callback");
        })),
        PRIORITY_HIGHEST,
    )
    .expect("hook broken failed");
    // panic 之前对参数的修改被撤销
    assert_eq!(call_add(&vm, &calc, 2, 3), Some(5));
}
