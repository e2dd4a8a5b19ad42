use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lsphook::simulator::SimVm;
use lsphook::{
    AfterDecision, BackendPreference, ClassLoaderRef, DeoptWhitelist, DispatchDecision,
    HookCallback, MethodHook, Modifiers, ObjectRef, Outcome, ResolvedMethod, Runtime,
    RuntimeConfig, Throwable, Value,
};

pub const CALC: &str = "com.example.Calc";
pub const BOOT: ClassLoaderRef = ClassLoaderRef::BOOT;
// 直接改写后端可用的最低版本之前，只能走动态代理
pub const SDK_DIRECT: i32 = 30;
pub const SDK_PROXY_ONLY: i32 = 25;

pub struct Calc {
    pub add: ResolvedMethod,
    pub scale: ResolvedMethod,
}

pub fn config(backend: BackendPreference) -> RuntimeConfig {
    RuntimeConfig {
        backend,
        debug: true,
        recordable: true,
        ..RuntimeConfig::default()
    }
}

pub fn setup(sdk: i32, backend: BackendPreference) -> (Arc<SimVm>, Arc<Runtime>, Calc) {
    let vm = SimVm::new(sdk);
    let calc = define_calc(&vm);
    let rt = Runtime::builder(vm.clone(), vm.clone())
        .config(config(backend))
        .whitelist(DeoptWhitelist::empty())
        .build();
    (vm, rt, calc)
}

pub fn define_calc(vm: &SimVm) -> Calc {
    let add = vm
        .define_method(BOOT, CALC, "add", "(II)I", Modifiers::PUBLIC | Modifiers::STATIC, add_body)
        .expect("define add failed");
    let scale = vm
        .define_method(BOOT, CALC, "scale", "(I)J", Modifiers::PUBLIC, scale_body)
        .expect("define scale failed");
    Calc { add, scale }
}

fn add_body(_: &SimVm, _: Option<ObjectRef>, args: &[Value]) -> Outcome {
    let a = args[0].as_int().unwrap_or(0);
    let b = args[1].as_int().unwrap_or(0);
    Ok(Value::Int(a.wrapping_add(b)))
}

fn scale_body(vm: &SimVm, this: Option<ObjectRef>, args: &[Value]) -> Outcome {
    if this.is_none() {
        let npe = "java.lang.NullPointerException";
        return Err(Throwable::new(vm.new_object(npe), npe, None));
    }
    Ok(Value::Long(i64::from(args[0].as_int().unwrap_or(0)) * 2))
}

pub fn call_add(vm: &SimVm, calc: &Calc, a: i32, b: i32) -> Option<i32> {
    vm.call(calc.add.handle, None, &[Value::Int(a), Value::Int(b)])
        .ok()
        .and_then(|value| value.as_int())
}

// 只计数，不改变调用
pub fn counting(counter: &'static AtomicUsize) -> Arc<dyn HookCallback> {
    Arc::new(MethodHook::new("counting").before(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(DispatchDecision::Continue)
    }))
}

pub fn add_to_result(delta: i32) -> Arc<dyn HookCallback> {
    Arc::new(MethodHook::new(format!("add_{delta}")).after(move |ctx| {
        let value = ctx.result().and_then(Value::as_int).unwrap_or(0);
        Ok(AfterDecision::ReplaceResult(Value::Int(value + delta)))
    }))
}

pub fn current_rss_kb() -> usize {
    let content = fs::read_to_string("/proc/self/status").unwrap_or_default();
    for line in content.lines() {
        if !line.starts_with("VmRSS:") {
            continue;
        }
        return line
            .split_whitespace()
            .nth(1)
            .and_then(|num| num.parse::<usize>().ok())
            .unwrap_or(0);
    }
    0
}

pub fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}
