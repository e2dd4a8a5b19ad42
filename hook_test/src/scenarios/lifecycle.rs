use std::sync::{Arc, Mutex};

use lsphook::simulator::SimVm;
use lsphook::{
    BackendPreference, DeoptWhitelist, ForkPhase, HookModule, ModuleDescriptor, ModuleError,
    ModuleEvent, ModuleScope, Modifiers, ObjectRef, Outcome, PRIORITY_DEFAULT, ResolvedMethod,
    Runtime, SpecializeArgs, StaticModuleSource, Value, returns_constant,
};

use crate::test_ctx::{BOOT, CALC, SDK_DIRECT, call_add, config, define_calc, setup};

const ACTIVITY_THREAD: &str = "android.app.ActivityThread";
const LOADED_APK: &str = "android.app.LoadedApk";
const SYSTEM_SERVER: &str = "com.android.server.SystemServer";

struct Framework {
    bind: ResolvedMethod,
    create_loader: ResolvedMethod,
    resources: ResolvedMethod,
    bootstrap_services: ResolvedMethod,
}

fn void_body(_: &SimVm, _: Option<ObjectRef>, _: &[Value]) -> Outcome {
    Ok(Value::Void)
}

fn resources_body(vm: &SimVm, _: Option<ObjectRef>, _: &[Value]) -> Outcome {
    Ok(Value::Object(vm.new_object("android.content.res.Resources")))
}

fn define_framework(vm: &SimVm) -> Framework {
    let define = |class: &str, name: &str, sig: &str, body: fn(&SimVm, Option<ObjectRef>, &[Value]) -> Outcome| {
        vm.define_method(BOOT, class, name, sig, Modifiers::PRIVATE, body)
            .unwrap_or_else(|err| panic!("define {class}#{name} failed: {err}"))
    };
    Framework {
        bind: define(
            ACTIVITY_THREAD,
            "handleBindApplication",
            "(Landroid/app/ActivityThread$AppBindData;)V",
            void_body,
        ),
        create_loader: define(
            LOADED_APK,
            "createOrUpdateClassLoaderLocked",
            "(Ljava/util/List;)V",
            void_body,
        ),
        resources: define(
            LOADED_APK,
            "getResources",
            "()Landroid/content/res/Resources;",
            resources_body,
        ),
        bootstrap_services: define(
            SYSTEM_SERVER,
            "startBootstrapServices",
            "(Lcom/android/server/utils/TimingsTraceAndSlog;)V",
            void_body,
        ),
    }
}

fn loaded_apk(vm: &SimVm, package: &str) -> ObjectRef {
    let apk = vm.new_object(LOADED_APK);
    vm.set_field(apk, "mPackageName", Value::Object(vm.new_string(package)));
    vm.set_field(
        apk,
        "mClassLoader",
        Value::Object(vm.new_object("dalvik.system.PathClassLoader")),
    );
    vm.set_field(apk, "mIncludeCode", Value::Boolean(true));
    vm.set_field(apk, "mApplicationInfo", Value::Null);
    apk
}

fn bind_data(vm: &SimVm, package: &str, apk: ObjectRef) -> ObjectRef {
    let info = vm.new_object("android.content.pm.ApplicationInfo");
    vm.set_field(info, "packageName", Value::Object(vm.new_string(package)));
    let data = vm.new_object("android.app.ActivityThread$AppBindData");
    vm.set_field(data, "appInfo", Value::Object(info));
    vm.set_field(data, "processName", Value::Object(vm.new_string(package)));
    vm.set_field(data, "info", Value::Object(apk));
    vm.set_field(data, "instrumentationName", Value::Null);
    data
}

struct EventLog {
    name: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

impl HookModule for EventLog {
    fn name(&self) -> &str {
        self.name
    }

    fn on_event(&self, _: &Runtime, event: &ModuleEvent) -> Result<(), ModuleError> {
        self.events.lock().unwrap().push(format!(
            "{}:{}:{}",
            self.name,
            event.name(),
            event.package_name().unwrap_or("-")
        ));
        Ok(())
    }
}

fn event_runtime(
    vm: &Arc<SimVm>,
    events: &Arc<Mutex<Vec<String>>>,
    scope: ModuleScope,
) -> Arc<Runtime> {
    let source = StaticModuleSource::new().with_module(
        ModuleDescriptor::new("tracker", "/data/app/tracker.apk", scope),
        Arc::new(EventLog {
            name: "tracker",
            events: Arc::clone(events),
        }),
    );
    Runtime::builder(vm.clone(), vm.clone())
        .config(config(BackendPreference::DirectPatch))
        .whitelist(DeoptWhitelist::empty())
        .module_source(Arc::new(source))
        .build()
}

pub fn scenario_app_process_fork() {
    let vm = SimVm::new(SDK_DIRECT);
    let fw = define_framework(&vm);
    let calc = define_calc(&vm);
    let events = Arc::new(Mutex::new(Vec::new()));
    let rt = event_runtime(
        &vm,
        &events,
        ModuleScope::Packages(vec!["com.example.app".into()]),
    );

    let args = SpecializeArgs {
        uid: 10200,
        nice_name: "com.example.app".into(),
        app_data_dir: "/data/user/0/com.example.app".into(),
        is_child_zygote: false,
    };
    rt.on_fork_and_specialize_pre(&args);
    rt.on_fork_and_specialize_post(&args);
    assert_eq!(rt.fork_phase(), ForkPhase::ChildEntered);
    assert!(rt.is_fork_completed());
    assert_eq!(rt.bootstrap_install_count(), 1);

    let thread = vm.new_object(ACTIVITY_THREAD);
    let apk = loaded_apk(&vm, "com.example.app");
    let data = bind_data(&vm, "com.example.app", apk);
    vm.call(fw.bind.handle, Some(thread), &[Value::Object(data)])
        .expect("handleBindApplication failed");
    vm.call(fw.create_loader.handle, Some(apk), &[Value::Null])
        .expect("createOrUpdateClassLoaderLocked failed");
    vm.call(fw.resources.handle, Some(apk), &[])
        .expect("getResources failed");

    let other = loaded_apk(&vm, "com.example.other");
    vm.call(fw.create_loader.handle, Some(other), &[Value::Null])
        .expect("other loader failed");

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "tracker:zygote_init:-",
            "tracker:package_loaded:com.example.app",
            "tracker:resources_loaded:com.example.app",
        ]
    );
    assert_eq!(
        rt.app_context().package_name.as_deref(),
        Some("com.example.app")
    );

    // 子进程里模块照常 hook 应用方法
    rt.hook(&calc.add, returns_constant(Value::Int(99)), PRIORITY_DEFAULT)
        .expect("hook in child failed");
    assert_eq!(call_add(&vm, &calc, 1, 1), Some(99));
}

pub fn scenario_system_server_fork() {
    let vm = SimVm::new(SDK_DIRECT);
    let fw = define_framework(&vm);
    let events = Arc::new(Mutex::new(Vec::new()));
    let rt = event_runtime(&vm, &events, ModuleScope::All);

    rt.on_fork_system_server_pre();
    rt.on_fork_system_server_post();
    assert!(rt.is_system_server());
    assert_eq!(rt.fork_phase(), ForkPhase::ChildEntered);

    let server = vm.new_object(SYSTEM_SERVER);
    vm.call(fw.bootstrap_services.handle, Some(server), &[Value::Null])
        .expect("startBootstrapServices failed");
    assert_eq!(
        *events.lock().unwrap(),
        vec!["tracker:zygote_init:-", "tracker:package_loaded:android"]
    );
}

pub fn scenario_inlined_caller_deopt() {
    let (vm, rt, calc) = setup(SDK_DIRECT, BackendPreference::DirectPatch);
    let caller = vm
        .define_method(
            BOOT,
            CALC,
            "sum",
            "()I",
            Modifiers::PUBLIC | Modifiers::STATIC,
            |_: &SimVm, _: Option<ObjectRef>, _: &[Value]| -> Outcome { Ok(Value::Int(0)) },
        )
        .expect("define caller failed");
    vm.set_compiled(caller.handle, &[calc.add.handle]);
    rt.hook(&calc.add, returns_constant(Value::Int(42)), PRIORITY_DEFAULT)
        .expect("hook add failed");

    let args = [Value::Int(3), Value::Int(4)];
    assert_eq!(vm.call(calc.add.handle, None, &args), Ok(Value::Int(42)));
    // 内联进调用方的副本不经过入口
    assert_eq!(
        vm.call_from(caller.handle, calc.add.handle, None, &args),
        Ok(Value::Int(7))
    );
    assert_eq!(rt.deoptimize_method(&caller), Ok(true));
    assert_eq!(
        vm.call_from(caller.handle, calc.add.handle, None, &args),
        Ok(Value::Int(42))
    );
}
