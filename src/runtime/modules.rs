// 用户 hook 模块的加载与生命周期事件派发，每个模块的失败都被隔离
use crate::error::ModuleError;
use crate::log;
use regex::Regex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock};

use super::Runtime;
use super::chain::panic_message;
use super::state::{MutexPoisonRecover, RwLockPoisonRecover};
use super::value::{ClassLoaderRef, ObjectRef};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartupParam {
    pub module_path: String,
    pub starts_system_server: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageLoadedParam {
    pub package_name: String,
    pub process_name: String,
    pub class_loader: ClassLoaderRef,
    pub app_info: Option<ObjectRef>,
    pub is_first_application: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourcesLoadedParam {
    pub package_name: String,
    pub resources: ObjectRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleEvent {
    ZygoteInit(StartupParam),
    PackageLoaded(PackageLoadedParam),
    ResourcesLoaded(ResourcesLoadedParam),
}

impl ModuleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ZygoteInit(_) => "zygote_init",
            Self::PackageLoaded(_) => "package_loaded",
            Self::ResourcesLoaded(_) => "resources_loaded",
        }
    }

    // zygote 事件不属于任何包
    pub fn package_name(&self) -> Option<&str> {
        match self {
            Self::ZygoteInit(_) => None,
            Self::PackageLoaded(param) => Some(&param.package_name),
            Self::ResourcesLoaded(param) => Some(&param.package_name),
        }
    }
}

pub trait HookModule: Send + Sync {
    fn name(&self) -> &str;
    fn on_event(&self, runtime: &Runtime, event: &ModuleEvent) -> Result<(), ModuleError>;
}

#[derive(Clone, Debug)]
pub enum ModuleScope {
    All,
    Packages(Vec<String>),
    Patterns(Vec<Regex>),
}

impl ModuleScope {
    pub fn matches(&self, package: &str) -> bool {
        match self {
            Self::All => true,
            Self::Packages(packages) => packages.iter().any(|name| name == package),
            Self::Patterns(patterns) => patterns.iter().any(|pattern| pattern.is_match(package)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModuleDescriptor {
    pub name: String,
    pub path: String,
    pub scope: ModuleScope,
}

impl ModuleDescriptor {
    pub fn new(name: &str, path: &str, scope: ModuleScope) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            scope,
        }
    }
}

// 模块发现与实例化由外部提供
pub trait ModuleSource: Send + Sync {
    fn modules(&self) -> Vec<ModuleDescriptor>;
    fn load(&self, descriptor: &ModuleDescriptor) -> Result<Arc<dyn HookModule>, ModuleError>;
}

// 进程内静态注册的模块
#[derive(Default)]
pub struct StaticModuleSource {
    entries: Vec<(ModuleDescriptor, Arc<dyn HookModule>)>,
}

impl StaticModuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, descriptor: ModuleDescriptor, module: Arc<dyn HookModule>) -> Self {
        self.entries.push((descriptor, module));
        self
    }
}

impl ModuleSource for StaticModuleSource {
    fn modules(&self) -> Vec<ModuleDescriptor> {
        self.entries.iter().map(|(descriptor, _)| descriptor.clone()).collect()
    }

    fn load(&self, descriptor: &ModuleDescriptor) -> Result<Arc<dyn HookModule>, ModuleError> {
        self.entries
            .iter()
            .find(|(d, _)| d.name == descriptor.name)
            .map(|(_, module)| Arc::clone(module))
            .ok_or_else(|| ModuleError::Load {
                name: descriptor.name.clone(),
                reason: "not registered".into(),
            })
    }
}

#[derive(Clone)]
struct LoadedModule {
    descriptor: ModuleDescriptor,
    module: Arc<dyn HookModule>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub failed: usize,
}

pub(crate) struct ModuleManager {
    source: Option<Arc<dyn ModuleSource>>,
    // zygote 中读取的列表，非动态模式下子进程沿用
    cached: Mutex<Option<Vec<ModuleDescriptor>>>,
    loaded: RwLock<Vec<LoadedModule>>,
}

impl ModuleManager {
    pub(crate) fn new(source: Option<Arc<dyn ModuleSource>>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
            loaded: RwLock::new(Vec::new()),
        }
    }

    // refresh 为 true 时忽略缓存重新读取列表
    pub(crate) fn load(&self, refresh: bool) -> LoadReport {
        let Some(source) = &self.source else {
            return LoadReport::default();
        };
        let descriptors = {
            let mut cached = self.cached.lock_or_poison();
            match cached.as_ref() {
                Some(list) if !refresh => list.clone(),
                _ => {
                    let list = source.modules();
                    *cached = Some(list.clone());
                    list
                }
            }
        };

        let mut report = LoadReport::default();
        let mut loaded = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let result = catch_unwind(AssertUnwindSafe(|| source.load(&descriptor)))
                .unwrap_or_else(|payload| {
                    Err(ModuleError::Panicked {
                        name: descriptor.name.clone(),
                        reason: panic_message(payload.as_ref()),
                    })
                });
            match result {
                Ok(module) => {
                    log::info(format_args!("loaded module {} from {}", descriptor.name, descriptor.path));
                    loaded.push(LoadedModule { descriptor, module });
                    report.loaded += 1;
                }
                Err(err) => {
                    log::error(format_args!("{err}"));
                    report.failed += 1;
                }
            }
        }
        *self.loaded.write_or_poison() = loaded;
        report
    }

    fn snapshot(&self) -> Vec<LoadedModule> {
        self.loaded.read_or_poison().clone()
    }

    // 只派发给作用域匹配的模块，返回成功处理的模块数
    pub(crate) fn dispatch(&self, runtime: &Runtime, event: &ModuleEvent) -> usize {
        let mut delivered = 0;
        for loaded in self.snapshot() {
            if let Some(package) = event.package_name()
                && !loaded.descriptor.scope.matches(package)
            {
                continue;
            }
            if deliver(runtime, &loaded, event) {
                delivered += 1;
            }
        }
        delivered
    }

    // ZygoteInit 的参数里带有各模块自己的路径
    pub(crate) fn dispatch_zygote_init(&self, runtime: &Runtime, starts_system_server: bool) -> usize {
        let mut delivered = 0;
        for loaded in self.snapshot() {
            let event = ModuleEvent::ZygoteInit(StartupParam {
                module_path: loaded.descriptor.path.clone(),
                starts_system_server,
            });
            if deliver(runtime, &loaded, &event) {
                delivered += 1;
            }
        }
        delivered
    }

    pub(crate) fn reset(&self) {
        self.loaded.write_or_poison().clear();
    }

    pub(crate) fn loaded_names(&self) -> Vec<String> {
        self.loaded
            .read_or_poison()
            .iter()
            .map(|loaded| loaded.descriptor.name.clone())
            .collect()
    }
}

fn deliver(runtime: &Runtime, loaded: &LoadedModule, event: &ModuleEvent) -> bool {
    let result = catch_unwind(AssertUnwindSafe(|| loaded.module.on_event(runtime, event)))
        .unwrap_or_else(|payload| {
            Err(ModuleError::Panicked {
                name: loaded.descriptor.name.clone(),
                reason: panic_message(payload.as_ref()),
            })
        });
    match result {
        Ok(()) => true,
        Err(err) => {
            log::error(format_args!(
                "module {} failed on {}: {err}",
                loaded.module.name(),
                event.name()
            ));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_matching() {
        assert!(ModuleScope::All.matches("anything"));
        let packages = ModuleScope::Packages(vec!["com.a".into(), "com.b".into()]);
        assert!(packages.matches("com.b"));
        assert!(!packages.matches("com.c"));
        let patterns = ModuleScope::Patterns(vec![Regex::new(r"^com\.google\.").unwrap()]);
        assert!(patterns.matches("com.google.android.gms"));
        assert!(!patterns.matches("android"));
    }

    #[test]
    fn event_names_and_packages() {
        let event = ModuleEvent::ResourcesLoaded(ResourcesLoadedParam {
            package_name: "com.a".into(),
            resources: ObjectRef(1),
        });
        assert_eq!(event.name(), "resources_loaded");
        assert_eq!(event.package_name(), Some("com.a"));
        let zygote = ModuleEvent::ZygoteInit(StartupParam {
            module_path: "/data/app/m.apk".into(),
            starts_system_server: false,
        });
        assert_eq!(zygote.package_name(), None);
    }
}
