// 框架自身在每个子进程中安装的 hook，负责把应用启动过程转成模块事件
use crate::error::{CallbackError, HookError, VmError};
use crate::log;
use std::sync::{Arc, Weak};

use crate::runtime::Runtime;
use crate::runtime::chain::{AfterDecision, DispatchDecision, MethodHook, PRIORITY_HIGHEST};
use crate::runtime::modules::{ModuleEvent, PackageLoadedParam, ResourcesLoadedParam};
use crate::runtime::state::MutexPoisonRecover;
use crate::runtime::value::{ClassLoaderRef, ObjectRef, Value};

pub const ACTIVITY_THREAD: &str = "android.app.ActivityThread";
pub const LOADED_APK: &str = "android.app.LoadedApk";
pub const SYSTEM_SERVER: &str = "com.android.server.SystemServer";

pub const HANDLE_BIND_APPLICATION_SIG: &str = "(Landroid/app/ActivityThread$AppBindData;)V";
pub const CREATE_CLASS_LOADER_SIG: &str = "(Ljava/util/List;)V";
pub const GET_RESOURCES_SIG: &str = "()Landroid/content/res/Resources;";
pub const START_BOOTSTRAP_SERVICES_SIG: &str = "(Lcom/android/server/utils/TimingsTraceAndSlog;)V";

const SYSTEM_PACKAGE: &str = "android";

type HookFactory = fn(Weak<Runtime>) -> MethodHook;

struct BootstrapHook {
    class_name: &'static str,
    method_name: &'static str,
    signature: &'static str,
    system_server_only: bool,
    factory: HookFactory,
}

const BOOTSTRAP_HOOKS: &[BootstrapHook] = &[
    BootstrapHook {
        class_name: ACTIVITY_THREAD,
        method_name: "handleBindApplication",
        signature: HANDLE_BIND_APPLICATION_SIG,
        system_server_only: false,
        factory: handle_bind_application,
    },
    BootstrapHook {
        class_name: LOADED_APK,
        method_name: "createOrUpdateClassLoaderLocked",
        signature: CREATE_CLASS_LOADER_SIG,
        system_server_only: false,
        factory: create_class_loader,
    },
    BootstrapHook {
        class_name: LOADED_APK,
        method_name: "getResources",
        signature: GET_RESOURCES_SIG,
        system_server_only: false,
        factory: get_resources,
    },
    BootstrapHook {
        class_name: SYSTEM_SERVER,
        method_name: "startBootstrapServices",
        signature: START_BOOTSTRAP_SERVICES_SIG,
        system_server_only: true,
        factory: start_bootstrap_services,
    },
];

// 类或方法缺失的条目跳过；IncompatibleVm 直接返回
pub(crate) fn install(runtime: &Runtime, is_system_server: bool) -> Result<usize, HookError> {
    let mut installed = 0;
    for hook in BOOTSTRAP_HOOKS {
        if hook.system_server_only && !is_system_server {
            continue;
        }
        let method = match runtime.find_method_sig(
            ClassLoaderRef::BOOT,
            hook.class_name,
            hook.method_name,
            hook.signature,
        ) {
            Ok(method) => method,
            Err(err @ (HookError::ClassNotFound(_) | HookError::MethodNotFound(_))) => {
                log::debug(format_args!("bootstrap skip {}: {err}", hook.method_name));
                continue;
            }
            Err(err) => return Err(err),
        };
        let callback = Arc::new((hook.factory)(runtime.weak()));
        match runtime.hook(&method, callback, PRIORITY_HIGHEST) {
            Ok(_) => installed += 1,
            Err(err @ HookError::IncompatibleVm(_)) => return Err(err),
            Err(err) => log::warn(format_args!("bootstrap hook {} failed: {err}", method.identity())),
        }
    }
    Ok(installed)
}

fn vm_failure(err: VmError) -> CallbackError {
    CallbackError::failed(err.to_string())
}

fn object_field(runtime: &Runtime, object: ObjectRef, field: &str) -> Result<Option<ObjectRef>, VmError> {
    Ok(runtime.bridge().read_field(object, field)?.as_object())
}

fn string_field(runtime: &Runtime, object: ObjectRef, field: &str) -> Result<Option<String>, VmError> {
    match object_field(runtime, object, field)? {
        Some(text) => runtime.bridge().read_string(text).map(Some),
        None => Ok(None),
    }
}

fn deliver(runtime: &Runtime, event: ModuleEvent) {
    let delivered = runtime.modules.dispatch(runtime, &event);
    log::debug(format_args!(
        "{} {:?} delivered to {delivered} modules",
        event.name(),
        event.package_name()
    ));
}

// 记录包名与进程名，带 instrumentation 的进程关闭 hook，随后反优化包内调用方
fn handle_bind_application(weak: Weak<Runtime>) -> MethodHook {
    MethodHook::new("bootstrap:handleBindApplication").before(move |ctx| {
        let Some(runtime) = weak.upgrade() else {
            return Ok(DispatchDecision::Continue);
        };
        let Some(bind_data) = ctx.arg(0).and_then(Value::as_object) else {
            return Err(CallbackError::failed("null AppBindData"));
        };
        let app_info = object_field(&runtime, bind_data, "appInfo").map_err(vm_failure)?;
        let package_name = match app_info {
            Some(info) => string_field(&runtime, info, "packageName").map_err(vm_failure)?,
            None => None,
        };
        let process_name = string_field(&runtime, bind_data, "processName").map_err(vm_failure)?;
        log::debug(format_args!(
            "bind application package={package_name:?} process={process_name:?}"
        ));

        if object_field(&runtime, bind_data, "instrumentationName")
            .map_err(vm_failure)?
            .is_some()
        {
            log::info(format_args!("instrumentation detected, hooks disabled"));
            runtime.disable_hooks();
            return Ok(DispatchDecision::Continue);
        }

        {
            let mut app = runtime.app.lock_or_poison();
            app.package_name = package_name.clone();
            app.process_name = process_name;
        }
        if let Some(package) = package_name.as_deref()
            && runtime.deopter.whitelist().contains_key(package)
        {
            let loader = object_field(&runtime, bind_data, "info")
                .map_err(vm_failure)?
                .map(|apk| object_field(&runtime, apk, "mClassLoader"))
                .transpose()
                .map_err(vm_failure)?
                .flatten()
                .map_or(ClassLoaderRef::BOOT, |loader| ClassLoaderRef(loader.0));
            runtime.deopter.deopt(runtime.bridge(), package, loader);
        }
        Ok(DispatchDecision::Continue)
    })
}

// 只处理首次创建（参数为 null），每个 (包名, 类加载器) 只通知一次
fn create_class_loader(weak: Weak<Runtime>) -> MethodHook {
    MethodHook::new("bootstrap:createOrUpdateClassLoaderLocked").after(move |ctx| {
        let Some(runtime) = weak.upgrade() else {
            return Ok(AfterDecision::Keep);
        };
        if ctx.has_throwable() || !ctx.arg(0).is_some_and(Value::is_null) {
            return Ok(AfterDecision::Keep);
        }
        let Some(loaded_apk) = ctx.this() else {
            return Ok(AfterDecision::Keep);
        };
        let Some(package_name) = string_field(&runtime, loaded_apk, "mPackageName").map_err(vm_failure)? else {
            return Ok(AfterDecision::Keep);
        };
        let Some(loader) = object_field(&runtime, loaded_apk, "mClassLoader").map_err(vm_failure)? else {
            return Ok(AfterDecision::Keep);
        };
        let class_loader = ClassLoaderRef(loader.0);

        let (is_first, process_name, fresh) = {
            let mut app = runtime.app.lock_or_poison();
            let is_first = app.package_name.as_deref() == Some(package_name.as_str());
            let process_name = app
                .process_name
                .clone()
                .unwrap_or_else(|| package_name.clone());
            let fresh = app.mark_package_loaded(&package_name, class_loader);
            (is_first, process_name, fresh)
        };
        if !fresh {
            return Ok(AfterDecision::Keep);
        }
        if !is_first {
            let includes_code = runtime
                .bridge()
                .read_field(loaded_apk, "mIncludeCode")
                .map_err(vm_failure)?
                .as_bool()
                .unwrap_or(false);
            if !includes_code {
                return Ok(AfterDecision::Keep);
            }
        }

        let app_info = object_field(&runtime, loaded_apk, "mApplicationInfo").map_err(vm_failure)?;
        deliver(
            &runtime,
            ModuleEvent::PackageLoaded(PackageLoadedParam {
                package_name,
                process_name,
                class_loader,
                app_info,
                is_first_application: is_first,
            }),
        );
        Ok(AfterDecision::Keep)
    })
}

fn get_resources(weak: Weak<Runtime>) -> MethodHook {
    MethodHook::new("bootstrap:getResources").after(move |ctx| {
        let Some(runtime) = weak.upgrade() else {
            return Ok(AfterDecision::Keep);
        };
        let (Some(loaded_apk), Some(resources)) =
            (ctx.this(), ctx.result().and_then(Value::as_object))
        else {
            return Ok(AfterDecision::Keep);
        };
        let Some(package_name) = string_field(&runtime, loaded_apk, "mPackageName").map_err(vm_failure)? else {
            return Ok(AfterDecision::Keep);
        };
        if !runtime.app.lock_or_poison().mark_resources_loaded(&package_name) {
            return Ok(AfterDecision::Keep);
        }
        deliver(
            &runtime,
            ModuleEvent::ResourcesLoaded(ResourcesLoadedParam {
                package_name,
                resources,
            }),
        );
        Ok(AfterDecision::Keep)
    })
}

// system_server 没有 bindApplication，在系统服务启动前以 android 包名通知模块
fn start_bootstrap_services(weak: Weak<Runtime>) -> MethodHook {
    MethodHook::new("bootstrap:startBootstrapServices").before(move |_| {
        let Some(runtime) = weak.upgrade() else {
            return Ok(DispatchDecision::Continue);
        };
        {
            let mut app = runtime.app.lock_or_poison();
            app.package_name = Some(SYSTEM_PACKAGE.to_string());
            app.process_name = Some(SYSTEM_PACKAGE.to_string());
            if !app.mark_package_loaded(SYSTEM_PACKAGE, ClassLoaderRef::BOOT) {
                return Ok(DispatchDecision::Continue);
            }
        }
        deliver(
            &runtime,
            ModuleEvent::PackageLoaded(PackageLoadedParam {
                package_name: SYSTEM_PACKAGE.to_string(),
                process_name: SYSTEM_PACKAGE.to_string(),
                class_loader: ClassLoaderRef::BOOT,
                app_info: None,
                is_first_application: true,
            }),
        );
        Ok(DispatchDecision::Continue)
    })
}
