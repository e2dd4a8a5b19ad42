// 运行时集成测试：在模拟 VM 上走完整的 hook / 派发 / fork 流程
use super::*;
use crate::config::BackendPreference;
use crate::error::{CallbackError, ModuleError, VmError};
use crate::runtime::backend::AccessFlags;
use crate::runtime::chain::{
    AfterDecision, DispatchDecision, HookCallback, InvocationContext, MethodHook, PRIORITY_DEFAULT,
    do_nothing, returns_constant,
};
use crate::runtime::deopt::{DeoptEntry, DeoptReport};
use crate::runtime::record::{RECORD_ITEM_METHOD, RECORD_ITEM_OP, RECORD_ITEM_STATUS};
use crate::runtime::descriptor::Modifiers;
use crate::runtime::lifecycle::bootstrap::{
    ACTIVITY_THREAD, CREATE_CLASS_LOADER_SIG, GET_RESOURCES_SIG, HANDLE_BIND_APPLICATION_SIG,
    LOADED_APK, START_BOOTSTRAP_SERVICES_SIG, SYSTEM_SERVER,
};
use crate::runtime::lifecycle::{ForkPhase, SpecializeArgs};
use crate::runtime::modules::{
    HookModule, ModuleDescriptor, ModuleEvent, ModuleScope, StaticModuleSource,
};
use crate::runtime::value::{ClassLoaderRef, ObjectRef, Outcome, Throwable, Value};
use crate::simulator::{DEFAULT_SDK, SimVm};
use regex::Regex;
use std::sync::atomic::AtomicUsize;
use std::sync::{Barrier, Mutex};
use std::thread;

const CALC: &str = "com.example.Calc";
const BOOT: ClassLoaderRef = ClassLoaderRef::BOOT;

fn config(backend: BackendPreference) -> RuntimeConfig {
    RuntimeConfig {
        backend,
        recordable: true,
        ..RuntimeConfig::default()
    }
}

fn runtime(vm: &Arc<SimVm>, backend: BackendPreference) -> Arc<Runtime> {
    Runtime::builder(vm.clone(), vm.clone())
        .config(config(backend))
        .whitelist(DeoptWhitelist::empty())
        .build()
}

fn add_body(_: &SimVm, _: Option<ObjectRef>, args: &[Value]) -> Outcome {
    Ok(Value::Int(args[0].as_int().unwrap() + args[1].as_int().unwrap()))
}

fn define_add(vm: &SimVm) -> ResolvedMethod {
    vm.define_method(BOOT, CALC, "add", "(II)I", Modifiers::PUBLIC | Modifiers::STATIC, add_body)
        .unwrap()
}

// 实例方法，没有接收者时抛 NPE
fn define_scale(vm: &SimVm) -> ResolvedMethod {
    vm.define_method(BOOT, CALC, "scale", "(I)J", Modifiers::PUBLIC, |vm, this, args| {
        match this {
            Some(_) => Ok(Value::Long(i64::from(args[0].as_int().unwrap()) * 2)),
            None => Err(Throwable::new(
                vm.new_object("java.lang.NullPointerException"),
                "java.lang.NullPointerException",
                None,
            )),
        }
    })
    .unwrap()
}

fn int_args(a: i32, b: i32) -> [Value; 2] {
    [Value::Int(a), Value::Int(b)]
}

fn double_first_arg() -> Arc<dyn HookCallback> {
    Arc::new(MethodHook::new("double").before(|ctx| {
        let first = ctx.arg(0).and_then(Value::as_int).unwrap_or(0);
        ctx.set_arg(0, Value::Int(first * 2));
        Ok(DispatchDecision::Continue)
    }))
}

#[test]
fn hooked_static_method_sees_modified_arguments() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    assert_eq!(rt.backend_kind(), Some(BackendKind::DirectPatch));

    rt.hook(&add, double_first_arg(), PRIORITY_DEFAULT).unwrap();
    assert_eq!(vm.call(add.handle, None, &int_args(3, 4)), Ok(Value::Int(10)));
    assert_eq!(
        rt.invoke_original(add.identity(), None, &int_args(3, 4)),
        Ok(Ok(Value::Int(7)))
    );
}

#[test]
fn invoke_original_checks_arity() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let rt = runtime(&vm, BackendPreference::Auto);
    rt.hook(&add, double_first_arg(), PRIORITY_DEFAULT).unwrap();
    let err = rt
        .invoke_original(add.identity(), None, &[Value::Int(1)])
        .unwrap_err();
    assert!(matches!(err, HookError::SignatureMismatch { role: "invoke", .. }));

    let scale = define_scale(&vm);
    assert_eq!(
        rt.invoke_original(scale.identity(), None, &[Value::Int(1)]),
        Err(HookError::NotHooked(scale.identity().to_string()))
    );
}

#[test]
fn second_hook_reuses_record_and_unhook_removes_one_callback() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let rt = runtime(&vm, BackendPreference::DirectPatch);

    let first = rt.hook(&add, double_first_arg(), PRIORITY_DEFAULT).unwrap();
    let second = rt
        .hook_with(
            &add,
            None,
            Some(Box::new(|ctx: &InvocationContext| -> Result<AfterDecision, CallbackError> {
                let value = ctx.result().and_then(Value::as_int).unwrap_or(0);
                Ok(AfterDecision::ReplaceResult(Value::Int(value + 100)))
            })),
            PRIORITY_DEFAULT,
        )
        .unwrap();
    assert_eq!(first.handle(), second.handle());
    assert_eq!(rt.hooked_count(), 1);
    assert_eq!(vm.live_trampolines(), 1);
    assert_eq!(vm.call(add.handle, None, &int_args(3, 4)), Ok(Value::Int(110)));

    assert!(first.unhook());
    assert!(!first.unhook());
    assert_eq!(vm.call(add.handle, None, &int_args(3, 4)), Ok(Value::Int(107)));
    assert!(rt.is_hooked(add.identity()));
}

#[test]
fn interface_and_abstract_methods_are_rejected() {
    let vm = SimVm::new(DEFAULT_SDK);
    vm.define_class(BOOT, "java.util.List", true);
    let list_add = vm
        .define_method(
            BOOT,
            "java.util.List",
            "add",
            "(Ljava/lang/Object;)Z",
            Modifiers::PUBLIC | Modifiers::ABSTRACT,
            |_, _, _| Ok(Value::Boolean(false)),
        )
        .unwrap();
    let rt = runtime(&vm, BackendPreference::Auto);
    let err = rt.hook(&list_add, double_first_arg(), PRIORITY_DEFAULT).unwrap_err();
    assert!(matches!(
        err,
        HookError::UnhookableTarget {
            reason: "interface method",
            ..
        }
    ));
    assert_eq!(rt.hooked_count(), 0);
    assert_eq!(vm.live_trampolines(), 0);
}

#[test]
fn hook_all_methods_skips_abstract_overloads() {
    let vm = SimVm::new(DEFAULT_SDK);
    define_add(&vm);
    vm.define_method(BOOT, CALC, "add", "(JJ)J", Modifiers::PUBLIC | Modifiers::STATIC, |_, _, args| {
        Ok(Value::Long(args[0].as_long().unwrap() + args[1].as_long().unwrap()))
    })
    .unwrap();
    vm.define_method(BOOT, CALC, "add", "(DD)D", Modifiers::PUBLIC | Modifiers::ABSTRACT, |_, _, _| {
        Ok(Value::Double(0.0))
    })
    .unwrap();
    vm.define_method(BOOT, CALC, "<init>", "()V", Modifiers::PUBLIC, |_, _, _| Ok(Value::Void))
        .unwrap();
    let rt = runtime(&vm, BackendPreference::DirectPatch);

    let unhooks = rt
        .hook_all_methods(BOOT, CALC, "add", returns_constant(Value::Int(1)))
        .unwrap();
    assert_eq!(unhooks.len(), 2);
    let ctors = rt
        .hook_all_constructors(BOOT, CALC, do_nothing())
        .unwrap();
    assert_eq!(ctors.len(), 1);
    assert_eq!(rt.hooked_count(), 3);
}

#[test]
fn find_method_sig_matches_return_type() {
    let vm = SimVm::new(DEFAULT_SDK);
    define_add(&vm);
    let rt = runtime(&vm, BackendPreference::Auto);
    assert!(rt.find_method_sig(BOOT, CALC, "add", "(II)I").is_ok());
    assert!(matches!(
        rt.find_method_sig(BOOT, CALC, "add", "(II)J"),
        Err(HookError::MethodNotFound(_))
    ));
    assert!(matches!(
        rt.find_method_sig(BOOT, "com.example.Missing", "add", "(II)I"),
        Err(HookError::ClassNotFound(_))
    ));
}

#[test]
fn direct_patch_unhook_restores_original_metadata() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let original = vm.read_method(add.handle).unwrap();
    let rt = runtime(&vm, BackendPreference::DirectPatch);

    rt.hook(&add, returns_constant(Value::Int(0)), PRIORITY_DEFAULT).unwrap();
    let patched = vm.read_method(add.handle).unwrap();
    assert!(patched.access_flags.contains(AccessFlags::NATIVE));
    assert_eq!(patched.entry_point, crate::simulator::GENERIC_JNI_TRAMPOLINE);

    assert_eq!(rt.unhook_method(add.identity()), Ok(UnhookOutcome::Restored));
    assert_eq!(vm.read_method(add.handle).unwrap(), original);
    assert_eq!(vm.live_trampolines(), 0);
    assert_eq!(vm.call(add.handle, None, &int_args(3, 4)), Ok(Value::Int(7)));
    assert_eq!(
        rt.unhook_method(add.identity()),
        Err(HookError::NotHooked(add.identity().to_string()))
    );
}

#[test]
fn dynamic_proxy_passes_receiver_and_unhook_only_stops_callbacks() {
    let vm = SimVm::new(25);
    let scale = define_scale(&vm);
    let rt = runtime(&vm, BackendPreference::Auto);
    assert_eq!(rt.backend_kind(), Some(BackendKind::DynamicProxy));

    let receiver = vm.new_object(CALC);
    let callback = Arc::new(MethodHook::new("plus_one").after(move |ctx| {
        if ctx.this() != Some(receiver) {
            return Ok(AfterDecision::Keep);
        }
        let value = ctx.result().and_then(Value::as_long).unwrap_or(0);
        Ok(AfterDecision::ReplaceResult(Value::Long(value + 1)))
    }));
    rt.hook(&scale, callback, PRIORITY_DEFAULT).unwrap();
    assert_eq!(vm.hooker_count(), 1);
    assert_eq!(
        vm.call(scale.handle, Some(receiver), &[Value::Int(3)]),
        Ok(Value::Long(7))
    );

    assert_eq!(rt.unhook_method(scale.identity()), Ok(UnhookOutcome::DispatchOnly));
    assert!(!rt.is_hooked(scale.identity()));
    assert_eq!(vm.live_trampolines(), 1);
    assert_eq!(
        vm.call(scale.handle, Some(receiver), &[Value::Int(3)]),
        Ok(Value::Long(6))
    );

    // 重新 hook 复用已绑定的入口，不再定义新的 hooker
    rt.hook(&scale, returns_constant(Value::Long(-1)), PRIORITY_DEFAULT)
        .unwrap();
    assert_eq!(vm.hooker_count(), 1);
    assert_eq!(
        vm.call(scale.handle, Some(receiver), &[Value::Int(3)]),
        Ok(Value::Long(-1))
    );
}

#[test]
fn callback_exception_reaches_caller_unchanged() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    let thrown = Throwable::new(vm.new_object("java.lang.SecurityException"), "java.lang.SecurityException", Some("denied"));
    let expected = thrown.clone();
    rt.hook(
        &add,
        Arc::new(MethodHook::new("deny").before(move |_| {
            Ok(DispatchDecision::SkipWithException(thrown.clone()))
        })),
        PRIORITY_DEFAULT,
    )
    .unwrap();
    assert_eq!(vm.call(add.handle, None, &int_args(1, 2)), Err(expected));
    // 挂起的异常已被取走，后续调用不受影响
    assert_eq!(rt.invoke_original(add.identity(), None, &int_args(1, 2)), Ok(Ok(Value::Int(3))));
}

#[test]
fn null_result_for_primitive_raises_npe() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    rt.hook(&add, returns_constant(Value::Null), PRIORITY_DEFAULT).unwrap();
    let err = vm.call(add.handle, None, &int_args(1, 2)).unwrap_err();
    assert!(err.is("java.lang.NullPointerException"));
}

#[test]
fn stubs_are_shared_per_shape() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let sub = vm
        .define_method(BOOT, CALC, "sub", "(II)I", Modifiers::PUBLIC | Modifiers::STATIC, |_, _, args| {
            Ok(Value::Int(args[0].as_int().unwrap() - args[1].as_int().unwrap()))
        })
        .unwrap();
    let scale = define_scale(&vm);
    let rt = runtime(&vm, BackendPreference::DirectPatch);

    rt.hook(&add, double_first_arg(), PRIORITY_DEFAULT).unwrap();
    rt.hook(&sub, double_first_arg(), PRIORITY_DEFAULT).unwrap();
    assert_eq!(rt.stub_shape_count(), 1);
    assert_eq!(vm.live_trampolines(), 2);
    rt.hook(&scale, double_first_arg(), PRIORITY_DEFAULT).unwrap();
    assert_eq!(rt.stub_shape_count(), 2);

    assert_eq!(vm.call(sub.handle, None, &int_args(5, 1)), Ok(Value::Int(9)));
    let receiver = vm.new_object(CALC);
    assert_eq!(vm.call(scale.handle, Some(receiver), &[Value::Int(2)]), Ok(Value::Long(8)));
}

#[test]
fn failed_deopt_leaves_target_untouched() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    vm.set_compiled(add.handle, &[]);
    vm.reject_deopt(add.handle);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    let before = vm.read_method(add.handle).unwrap();

    let err = rt.hook(&add, double_first_arg(), PRIORITY_DEFAULT).unwrap_err();
    assert!(matches!(err, HookError::DeoptimizationFailed { .. }));
    assert!(!rt.is_hooked(add.identity()));
    assert_eq!(vm.read_method(add.handle).unwrap(), before);
    assert_eq!(vm.live_trampolines(), 0);
    assert_eq!(vm.call(add.handle, None, &int_args(3, 4)), Ok(Value::Int(7)));
}

#[test]
fn compiled_target_is_deoptimized_before_patch() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    vm.set_compiled(add.handle, &[]);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    rt.hook(&add, double_first_arg(), PRIORITY_DEFAULT).unwrap();
    assert!(!vm.is_compiled(add.handle));
    assert_eq!(vm.deopt_count(add.handle), 1);
}

#[test]
fn inlined_caller_bypasses_hook_until_deoptimized() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let caller = vm
        .define_method(BOOT, CALC, "compute", "()I", Modifiers::PUBLIC | Modifiers::STATIC, |_, _, _| {
            Ok(Value::Int(0))
        })
        .unwrap();
    vm.set_compiled(caller.handle, &[add.handle]);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    rt.hook(&add, returns_constant(Value::Int(42)), PRIORITY_DEFAULT).unwrap();

    assert_eq!(vm.call(add.handle, None, &int_args(3, 4)), Ok(Value::Int(42)));
    assert_eq!(vm.call_from(caller.handle, add.handle, None, &int_args(3, 4)), Ok(Value::Int(7)));
    assert_eq!(rt.deoptimize_method(&caller), Ok(true));
    assert_eq!(rt.deoptimize_method(&caller), Ok(false));
    assert_eq!(vm.call_from(caller.handle, add.handle, None, &int_args(3, 4)), Ok(Value::Int(42)));
}

#[test]
fn recompiled_caller_is_deoptimized_again() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let caller = vm
        .define_method(BOOT, CALC, "compute", "()I", Modifiers::PUBLIC | Modifiers::STATIC, |_, _, _| {
            Ok(Value::Int(0))
        })
        .unwrap();
    vm.set_compiled(caller.handle, &[add.handle]);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    rt.hook(&add, returns_constant(Value::Int(42)), PRIORITY_DEFAULT).unwrap();
    assert_eq!(rt.deoptimize_method(&caller), Ok(true));

    // JIT 再次编译并内联了被 hook 的方法
    vm.set_compiled(caller.handle, &[add.handle]);
    assert_eq!(vm.call_from(caller.handle, add.handle, None, &int_args(3, 4)), Ok(Value::Int(7)));
    assert_eq!(rt.deoptimize_method(&caller), Ok(true));
    assert!(!vm.is_compiled(caller.handle));
    assert_eq!(vm.deopt_count(caller.handle), 2);
    assert_eq!(vm.call_from(caller.handle, add.handle, None, &int_args(3, 4)), Ok(Value::Int(42)));
    assert_eq!(rt.deoptimize_method(&caller), Ok(false));
}

#[test]
fn whitelist_skips_missing_entries() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    vm.set_compiled(add.handle, &[]);
    let whitelist = DeoptWhitelist::empty()
        .with_entry("com.example", DeoptEntry::new("com.example.Gone", "run", "()V"))
        .with_entry("com.example", DeoptEntry::new(CALC, "add", "(II)I"));
    let rt = Runtime::builder(vm.clone(), vm.clone())
        .config(config(BackendPreference::Auto))
        .whitelist(whitelist)
        .build();

    let report = rt.deoptimize_callers("com.example", BOOT);
    assert_eq!(report.deoptimized, 1);
    assert_eq!(report.missing, 1);
    assert_eq!(report.failed, 0);
    assert!(!vm.is_compiled(add.handle));
    assert_eq!(rt.deoptimize_callers("com.example", BOOT).skipped, 1);
    assert_eq!(rt.deoptimize_callers("no.such.key", BOOT), DeoptReport::default());
}

#[test]
fn unsupported_sdk_disables_hooks() {
    let vm = SimVm::new(23);
    let add = define_add(&vm);
    let rt = runtime(&vm, BackendPreference::Auto);
    assert_eq!(rt.backend_kind(), None);
    assert!(rt.hooks_disabled());
    assert_eq!(
        rt.hook(&add, double_first_arg(), PRIORITY_DEFAULT).unwrap_err(),
        HookError::HooksDisabled
    );

    // N 上只有动态代理，强制直接改写同样不可用
    let vm = SimVm::new(25);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    assert!(rt.hooks_disabled());
}

#[test]
fn records_follow_item_mask() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    rt.hook(&add, double_first_arg(), PRIORITY_DEFAULT).unwrap();
    rt.unhook_method(add.identity()).unwrap();

    let text = rt
        .records_text(RECORD_ITEM_OP | RECORD_ITEM_METHOD | RECORD_ITEM_STATUS)
        .unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec![
            "HOOK,com.example.Calc#add(II)I,0,",
            "UNHOOK,com.example.Calc#add(II)I,0,",
        ]
    );
    let mut out = Vec::new();
    rt.dump_records(&mut out, RECORD_ITEM_OP).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "HOOK,\nUNHOOK,\n");

    rt.set_recordable(false);
    assert!(!rt.get_recordable());
    assert_eq!(rt.records_text(RECORD_ITEM_OP), None);
}

// ---- fork 生命周期 ----

struct Framework {
    bind: ResolvedMethod,
    create_loader: ResolvedMethod,
    resources: ResolvedMethod,
    bootstrap_services: ResolvedMethod,
}

fn void_body(_: &SimVm, _: Option<ObjectRef>, _: &[Value]) -> Outcome {
    Ok(Value::Void)
}

fn define_framework(vm: &SimVm) -> Framework {
    Framework {
        bind: vm
            .define_method(BOOT, ACTIVITY_THREAD, "handleBindApplication", HANDLE_BIND_APPLICATION_SIG, Modifiers::PRIVATE, void_body)
            .unwrap(),
        create_loader: vm
            .define_method(BOOT, LOADED_APK, "createOrUpdateClassLoaderLocked", CREATE_CLASS_LOADER_SIG, Modifiers::PRIVATE, void_body)
            .unwrap(),
        resources: vm
            .define_method(BOOT, LOADED_APK, "getResources", GET_RESOURCES_SIG, Modifiers::PUBLIC, |vm, _, _| {
                Ok(Value::Object(vm.new_object("android.content.res.Resources")))
            })
            .unwrap(),
        bootstrap_services: vm
            .define_method(BOOT, SYSTEM_SERVER, "startBootstrapServices", START_BOOTSTRAP_SERVICES_SIG, Modifiers::PRIVATE, void_body)
            .unwrap(),
    }
}

fn loaded_apk(vm: &SimVm, package: &str, include_code: bool) -> ObjectRef {
    let apk = vm.new_object(LOADED_APK);
    let loader = vm.new_object("dalvik.system.PathClassLoader");
    vm.set_field(apk, "mPackageName", Value::Object(vm.new_string(package)));
    vm.set_field(apk, "mClassLoader", Value::Object(loader));
    vm.set_field(apk, "mIncludeCode", Value::Boolean(include_code));
    vm.set_field(apk, "mApplicationInfo", Value::Null);
    apk
}

fn bind_data(vm: &SimVm, package: &str, apk: ObjectRef, instrumented: bool) -> ObjectRef {
    let info = vm.new_object("android.content.pm.ApplicationInfo");
    vm.set_field(info, "packageName", Value::Object(vm.new_string(package)));
    let data = vm.new_object("android.app.ActivityThread$AppBindData");
    vm.set_field(data, "appInfo", Value::Object(info));
    vm.set_field(data, "processName", Value::Object(vm.new_string(package)));
    vm.set_field(data, "info", Value::Object(apk));
    let instrumentation = if instrumented {
        Value::Object(vm.new_object("android.content.ComponentName"))
    } else {
        Value::Null
    };
    vm.set_field(data, "instrumentationName", instrumentation);
    data
}

struct Recorder {
    name: &'static str,
    events: Arc<Mutex<Vec<String>>>,
    panic_on: Option<&'static str>,
}

impl HookModule for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn on_event(&self, _: &Runtime, event: &ModuleEvent) -> Result<(), ModuleError> {
        if self.panic_on == Some(event.name()) {
            panic!("{} crashed", self.name);
        }
        self.events.lock().unwrap().push(format!(
            "{}:{}:{}",
            self.name,
            event.name(),
            event.package_name().unwrap_or("-")
        ));
        Ok(())
    }
}

fn recorder(
    name: &'static str,
    events: &Arc<Mutex<Vec<String>>>,
    panic_on: Option<&'static str>,
) -> Arc<dyn HookModule> {
    Arc::new(Recorder {
        name,
        events: Arc::clone(events),
        panic_on,
    })
}

fn app_args(package: &str) -> SpecializeArgs {
    SpecializeArgs {
        uid: 10123,
        nice_name: package.to_string(),
        app_data_dir: format!("/data/user/0/{package}"),
        is_child_zygote: false,
    }
}

fn module_runtime(vm: &Arc<SimVm>, config: RuntimeConfig, source: StaticModuleSource) -> Arc<Runtime> {
    Runtime::builder(vm.clone(), vm.clone())
        .config(config)
        .whitelist(DeoptWhitelist::empty())
        .module_source(Arc::new(source))
        .build()
}

#[test]
fn app_process_delivers_scoped_package_events() {
    let vm = SimVm::new(DEFAULT_SDK);
    let fw = define_framework(&vm);
    let events = Arc::new(Mutex::new(Vec::new()));
    let source = StaticModuleSource::new()
        .with_module(
            ModuleDescriptor::new("all", "/data/app/all.apk", ModuleScope::All),
            recorder("all", &events, None),
        )
        .with_module(
            ModuleDescriptor::new("only_b", "/data/app/b.apk", ModuleScope::Packages(vec!["com.b".into()])),
            recorder("only_b", &events, None),
        );
    let rt = module_runtime(&vm, config(BackendPreference::DirectPatch), source);

    let args = app_args("com.a");
    rt.on_fork_and_specialize_pre(&args);
    assert_eq!(rt.fork_phase(), ForkPhase::ModulesLoaded);
    assert_eq!(rt.loaded_modules(), vec!["all".to_string(), "only_b".to_string()]);
    rt.on_fork_and_specialize_post(&args);
    assert_eq!(rt.fork_phase(), ForkPhase::ChildEntered);
    assert!(rt.is_fork_completed());
    assert!(!rt.is_system_server());
    assert!(!rt.is_forked_child());
    assert_eq!(rt.bootstrap_install_count(), 1);
    // startBootstrapServices 只在 system_server 中 hook
    assert_eq!(rt.hooked_count(), 3);
    assert_eq!(rt.app_context().uid, 10123);

    let thread = vm.new_object(ACTIVITY_THREAD);
    let apk_a = loaded_apk(&vm, "com.a", true);
    let data = bind_data(&vm, "com.a", apk_a, false);
    assert_eq!(vm.call(fw.bind.handle, Some(thread), &[Value::Object(data)]), Ok(Value::Void));
    assert_eq!(rt.app_context().package_name.as_deref(), Some("com.a"));

    vm.call(fw.create_loader.handle, Some(apk_a), &[Value::Null]).unwrap();
    vm.call(fw.create_loader.handle, Some(apk_a), &[Value::Null]).unwrap();
    let apk_b = loaded_apk(&vm, "com.b", true);
    vm.call(fw.create_loader.handle, Some(apk_b), &[Value::Null]).unwrap();
    let apk_c = loaded_apk(&vm, "com.c", false);
    vm.call(fw.create_loader.handle, Some(apk_c), &[Value::Null]).unwrap();
    let resources = vm.call(fw.resources.handle, Some(apk_a), &[]).unwrap();
    assert!(resources.as_object().is_some());
    vm.call(fw.resources.handle, Some(apk_a), &[]).unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "all:zygote_init:-",
            "only_b:zygote_init:-",
            "all:package_loaded:com.a",
            "all:package_loaded:com.b",
            "only_b:package_loaded:com.b",
            "all:resources_loaded:com.a",
        ]
    );
}

#[test]
fn system_server_announces_android_package() {
    let vm = SimVm::new(DEFAULT_SDK);
    let fw = define_framework(&vm);
    let events = Arc::new(Mutex::new(Vec::new()));
    let source = StaticModuleSource::new().with_module(
        ModuleDescriptor::new("all", "/data/app/all.apk", ModuleScope::All),
        recorder("all", &events, None),
    );
    let rt = module_runtime(&vm, config(BackendPreference::DirectPatch), source);

    rt.on_fork_system_server_pre();
    rt.on_fork_system_server_post();
    assert!(rt.is_system_server());
    assert_eq!(rt.hooked_count(), 4);
    assert_eq!(rt.app_context().uid, 1000);

    let server = vm.new_object(SYSTEM_SERVER);
    vm.call(fw.bootstrap_services.handle, Some(server), &[Value::Null]).unwrap();
    vm.call(fw.bootstrap_services.handle, Some(server), &[Value::Null]).unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        vec!["all:zygote_init:-", "all:package_loaded:android"]
    );
    assert_eq!(rt.app_context().package_name.as_deref(), Some("android"));
}

#[test]
fn panicking_module_does_not_block_others() {
    let vm = SimVm::new(DEFAULT_SDK);
    define_framework(&vm);
    let events = Arc::new(Mutex::new(Vec::new()));
    let source = StaticModuleSource::new()
        .with_module(
            ModuleDescriptor::new("bad", "/data/app/bad.apk", ModuleScope::All),
            recorder("bad", &events, Some("zygote_init")),
        )
        .with_module(
            ModuleDescriptor::new("good", "/data/app/good.apk", ModuleScope::All),
            recorder("good", &events, None),
        );
    let rt = module_runtime(&vm, config(BackendPreference::DirectPatch), source);
    let args = app_args("com.a");
    rt.on_fork_and_specialize_pre(&args);
    rt.on_fork_and_specialize_post(&args);
    assert_eq!(*events.lock().unwrap(), vec!["good:zygote_init:-"]);
    assert!(rt.is_fork_completed());
}

#[test]
fn instrumented_process_disables_hooks() {
    let vm = SimVm::new(DEFAULT_SDK);
    let fw = define_framework(&vm);
    let add = define_add(&vm);
    let events = Arc::new(Mutex::new(Vec::new()));
    let source = StaticModuleSource::new().with_module(
        ModuleDescriptor::new("all", "/data/app/all.apk", ModuleScope::All),
        recorder("all", &events, None),
    );
    let rt = module_runtime(&vm, config(BackendPreference::DirectPatch), source);
    let args = app_args("com.a");
    rt.on_fork_and_specialize_pre(&args);
    rt.on_fork_and_specialize_post(&args);

    let apk = loaded_apk(&vm, "com.a", true);
    let data = bind_data(&vm, "com.a", apk, true);
    let thread = vm.new_object(ACTIVITY_THREAD);
    vm.call(fw.bind.handle, Some(thread), &[Value::Object(data)]).unwrap();
    assert!(rt.hooks_disabled());

    // 已安装的 hook 直接走原方法
    vm.call(fw.create_loader.handle, Some(apk), &[Value::Null]).unwrap();
    assert_eq!(*events.lock().unwrap(), vec!["all:zygote_init:-"]);
    assert_eq!(
        rt.hook(&add, double_first_arg(), PRIORITY_DEFAULT).unwrap_err(),
        HookError::HooksDisabled
    );
}

#[test]
fn denied_or_dataless_process_is_skipped() {
    let vm = SimVm::new(DEFAULT_SDK);
    define_framework(&vm);
    let denying = RuntimeConfig {
        deny_processes: vec![Regex::new(r"^com\.denied").unwrap()],
        ..config(BackendPreference::DirectPatch)
    };
    let rt = module_runtime(&vm, denying, StaticModuleSource::new());

    let args = app_args("com.denied.app");
    rt.on_fork_and_specialize_pre(&args);
    rt.on_fork_and_specialize_post(&args);
    assert!(rt.is_fork_completed());
    assert_eq!(rt.bootstrap_install_count(), 0);
    assert_eq!(rt.hooked_count(), 0);

    let args = SpecializeArgs {
        app_data_dir: String::new(),
        ..app_args("com.isolated")
    };
    rt.on_fork_and_specialize_pre(&args);
    rt.on_fork_and_specialize_post(&args);
    assert_eq!(rt.bootstrap_install_count(), 0);
    assert_eq!(rt.app_context().nice_name, "com.isolated");
}

#[test]
fn bootstrap_hooks_install_once_under_race() {
    let vm = SimVm::new(DEFAULT_SDK);
    define_framework(&vm);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    rt.prepare(false);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let rt = Arc::clone(&rt);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                rt.install_bootstrap_hooks()
            })
        })
        .collect();
    let installed = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .filter(|installed| *installed)
        .count();
    assert_eq!(installed, 1);
    assert_eq!(rt.bootstrap_install_count(), 1);
    assert_eq!(rt.hooked_count(), 3);
    assert_eq!(rt.fork_phase(), ForkPhase::BootstrapHooksInstalled);
}

#[test]
fn hooker_rejection_disables_hooks_in_child() {
    let vm = SimVm::new(25);
    define_framework(&vm);
    vm.set_hookers_supported(false);
    let rt = runtime(&vm, BackendPreference::Auto);
    assert_eq!(rt.backend_kind(), Some(BackendKind::DynamicProxy));

    let err = rt.install_bootstrap_hooks().unwrap_err();
    assert!(matches!(err, HookError::IncompatibleVm(_)));
    assert!(rt.hooks_disabled());
    assert_eq!(rt.hooked_count(), 0);
    assert_eq!(rt.install_bootstrap_hooks(), Ok(false));
}

#[test]
fn entering_child_clears_inherited_hooks() {
    let vm = SimVm::new(DEFAULT_SDK);
    let add = define_add(&vm);
    let rt = runtime(&vm, BackendPreference::DirectPatch);
    rt.hook(&add, returns_constant(Value::Int(0)), PRIORITY_DEFAULT).unwrap();
    rt.app.lock_or_poison().package_name = Some("com.a".into());

    rt.enter_child();
    assert_eq!(rt.hooked_count(), 0);
    assert_eq!(rt.app_context(), AppContext::default());
    assert_eq!(rt.fork_phase(), ForkPhase::Unforked);
    assert_eq!(vm.call(add.handle, None, &int_args(3, 4)), Ok(Value::Int(7)));
    assert_eq!(vm.live_trampolines(), 0);
}

struct CountingSource {
    inner: StaticModuleSource,
    listed: AtomicUsize,
}

impl ModuleSource for CountingSource {
    fn modules(&self) -> Vec<ModuleDescriptor> {
        self.listed.fetch_add(1, Ordering::SeqCst);
        self.inner.modules()
    }

    fn load(&self, descriptor: &ModuleDescriptor) -> Result<Arc<dyn HookModule>, ModuleError> {
        self.inner.load(descriptor)
    }
}

#[test]
fn module_list_is_reread_only_in_dynamic_mode() {
    for (dynamic, expected) in [(false, 1), (true, 2)] {
        let vm = SimVm::new(DEFAULT_SDK);
        define_framework(&vm);
        let events = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(CountingSource {
            inner: StaticModuleSource::new().with_module(
                ModuleDescriptor::new("all", "/data/app/all.apk", ModuleScope::All),
                recorder("all", &events, None),
            ),
            listed: AtomicUsize::new(0),
        });
        let rt = Runtime::builder(vm.clone(), vm.clone())
            .config(RuntimeConfig {
                dynamic_modules: dynamic,
                ..config(BackendPreference::DirectPatch)
            })
            .whitelist(DeoptWhitelist::empty())
            .module_source(source.clone())
            .build();
        let args = app_args("com.a");
        rt.on_fork_and_specialize_pre(&args);
        rt.on_fork_and_specialize_post(&args);
        assert_eq!(source.listed.load(Ordering::SeqCst), expected, "dynamic={dynamic}");
        assert_eq!(rt.loaded_modules(), vec!["all".to_string()]);
        assert_eq!(*events.lock().unwrap(), vec!["all:zygote_init:-"]);
    }
}

#[test]
fn lookup_errors_surface_vm_reasons() {
    let vm = SimVm::new(DEFAULT_SDK);
    let rt = runtime(&vm, BackendPreference::Auto);
    let err = rt.find_method(BOOT, CALC, "add", &[]).unwrap_err();
    assert_eq!(err, HookError::from(VmError::ClassNotFound(CALC.into())));
}

#[test]
fn hook_racing_unhook_never_leaves_stale_callback() {
    let vm = SimVm::new(25);
    let scale = define_scale(&vm);
    let rt = runtime(&vm, BackendPreference::Auto);
    assert_eq!(rt.backend_kind(), Some(BackendKind::DynamicProxy));
    let receiver = vm.new_object(CALC);
    let stale_hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..500 {
        let barrier = Barrier::new(2);
        thread::scope(|scope| {
            scope.spawn(|| {
                let hits = Arc::clone(&stale_hits);
                let stale = MethodHook::new("stale").before(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(DispatchDecision::Continue)
                });
                barrier.wait();
                rt.hook(&scale, Arc::new(stale), PRIORITY_DEFAULT).unwrap();
            });
            scope.spawn(|| {
                barrier.wait();
                let _ = rt.unhook_method(scale.identity());
            });
        });

        // 无论谁先执行，卸载之后复活的记录里只能有新注册的回调
        let _ = rt.unhook_method(scale.identity());
        let fresh = rt.hook(&scale, do_nothing(), PRIORITY_DEFAULT).unwrap();
        assert_eq!(vm.call(scale.handle, Some(receiver), &[Value::Int(2)]), Ok(Value::Long(4)));
        assert!(fresh.unhook());
        assert!(!fresh.unhook());
        assert_eq!(rt.unhook_method(scale.identity()), Ok(UnhookOutcome::DispatchOnly));
    }
    assert_eq!(stale_hits.load(Ordering::SeqCst), 0);
    assert_eq!(vm.hooker_count(), 1);
}

#[test]
fn rejected_hooker_discards_backup() {
    let vm = SimVm::new(25);
    let scale = define_scale(&vm);
    let rt = runtime(&vm, BackendPreference::Auto);
    let original = vm.read_method(scale.handle).unwrap();
    let methods = vm.method_count();

    vm.reject_hookers(Some("verify failed"));
    let err = rt.hook(&scale, do_nothing(), PRIORITY_DEFAULT).unwrap_err();
    assert!(matches!(err, HookError::Vm(VmError::HookerDefinition(_))), "{err}");
    assert!(!rt.hooks_disabled());
    assert!(!rt.is_hooked(scale.identity()));
    assert_eq!(vm.method_count(), methods);
    assert_eq!(vm.live_trampolines(), 0);
    assert_eq!(vm.read_method(scale.handle), Ok(original));

    vm.reject_hookers(None);
    rt.hook(&scale, do_nothing(), PRIORITY_DEFAULT).unwrap();
    // backup 与 hooker 方法各一个
    assert_eq!(vm.method_count(), methods + 2);
}
