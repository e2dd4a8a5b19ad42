// 进程级运行时上下文：VM 桥接、hook 后端、注册表、stub 缓存、fork 状态都挂在 Runtime 上
use crate::config::RuntimeConfig;
use crate::error::HookError;
use crate::log;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub mod backend;
pub mod chain;
pub mod deopt;
pub mod descriptor;
mod dispatch;
pub mod lifecycle;
pub mod modules;
pub mod record;
pub mod registry;
mod state;
pub mod stub;
pub mod value;

#[cfg(test)]
mod tests;

pub(crate) use state::MutexPoisonRecover;
pub use state::AppContext;

use backend::{BackendKind, HookBackend, VmBridge};
use chain::{CallbackChain, CallbackId, HookCallback};
use deopt::{DeoptWhitelist, Deoptimizer};
use descriptor::{AbiDescriptor, MethodIdentity, ResolvedMethod, describe};
use lifecycle::ForkState;
use modules::{ModuleManager, ModuleSource};
use record::{RecordEntry, RecordLog, RecordOp};
use registry::{HookRecord, HookRegistry, UnhookOutcome};
use stub::{CodeSynthesizer, StubDispatch, StubGenerator};

pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) bridge: Arc<dyn VmBridge>,
    // None 表示当前 VM 上没有可用后端
    pub(crate) backend: Option<HookBackend>,
    pub(crate) stubs: StubGenerator,
    pub(crate) registry: HookRegistry,
    pub(crate) deopter: Deoptimizer,
    pub(crate) fork: ForkState,
    pub(crate) modules: ModuleManager,
    pub(crate) records: Mutex<RecordLog>,
    pub(crate) app: Mutex<AppContext>,
    pub(crate) hooks_disabled: AtomicBool,
    weak_self: Weak<Runtime>,
}

pub struct RuntimeBuilder {
    bridge: Arc<dyn VmBridge>,
    synthesizer: Arc<dyn CodeSynthesizer>,
    config: Option<RuntimeConfig>,
    source: Option<Arc<dyn ModuleSource>>,
    whitelist: DeoptWhitelist,
}

impl RuntimeBuilder {
    // 未指定时从环境变量读取
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn module_source(mut self, source: Arc<dyn ModuleSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn whitelist(mut self, whitelist: DeoptWhitelist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn build(self) -> Arc<Runtime> {
        let config = self.config.unwrap_or_else(RuntimeConfig::from_env);
        log::init_platform_logger(config.debug);

        let backend = match HookBackend::select(self.bridge.as_ref(), config.backend) {
            Ok(backend) => Some(backend),
            Err(err) => {
                log::error(format_args!("{err}, hooks disabled"));
                None
            }
        };
        let disabled = backend.is_none();
        let recordable = config.recordable;
        let synthesizer = self.synthesizer;

        Arc::new_cyclic(|weak: &Weak<Runtime>| {
            let dispatcher: Weak<dyn StubDispatch> = weak.clone();
            Runtime {
                config,
                bridge: self.bridge,
                backend,
                stubs: StubGenerator::new(synthesizer, dispatcher),
                registry: HookRegistry::new(),
                deopter: Deoptimizer::new(self.whitelist),
                fork: ForkState::new(),
                modules: ModuleManager::new(self.source),
                records: Mutex::new(RecordLog::new(recordable)),
                app: Mutex::new(AppContext::default()),
                hooks_disabled: AtomicBool::new(disabled),
                weak_self: weak.clone(),
            }
        })
    }
}

impl Runtime {
    pub fn builder(bridge: Arc<dyn VmBridge>, synthesizer: Arc<dyn CodeSynthesizer>) -> RuntimeBuilder {
        RuntimeBuilder {
            bridge,
            synthesizer,
            config: None,
            source: None,
            whitelist: DeoptWhitelist::builtin(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(HookBackend::kind)
    }

    pub fn app_context(&self) -> AppContext {
        self.app.lock_or_poison().clone()
    }

    pub(crate) fn weak(&self) -> Weak<Runtime> {
        Weak::clone(&self.weak_self)
    }

    pub(crate) fn bridge(&self) -> &dyn VmBridge {
        self.bridge.as_ref()
    }

    pub(crate) fn disable_hooks(&self) {
        self.hooks_disabled.store(true, Ordering::Release);
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.hooks_disabled.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn stub_shape_count(&self) -> usize {
        self.stubs.shape_count()
    }

    // 安装 hook 或复用已有记录，并在安装锁内挂上回调；失败时不留下任何改动
    pub(crate) fn install_hook(
        &self,
        target: &ResolvedMethod,
        callback: Arc<dyn HookCallback>,
        priority: i32,
    ) -> Result<(Arc<HookRecord>, CallbackId), HookError> {
        let result = self.install_hook_inner(target, callback, priority);
        let status = result.as_ref().map_or_else(HookError::code, |_| 0);
        let record = result.as_ref().ok().map(|(record, _)| record.as_ref());
        self.push_record(RecordOp::Hook, target.identity(), status, record);
        if let Err(err) = &result {
            log::warn(format_args!("hook {} failed: {err}", target.identity()));
        }
        result
    }

    fn install_hook_inner(
        &self,
        target: &ResolvedMethod,
        callback: Arc<dyn HookCallback>,
        priority: i32,
    ) -> Result<(Arc<HookRecord>, CallbackId), HookError> {
        if self.is_disabled() {
            return Err(HookError::HooksDisabled);
        }
        let backend = self.backend.as_ref().ok_or(HookError::HooksDisabled)?;
        let abi = describe(&target.executable);
        let hook_abi = backend.hook_abi(&abi);

        let commit = |abi: &AbiDescriptor| -> Result<HookRecord, HookError> {
            let (_, entry) = self.stubs.trampoline(&hook_abi, target.handle)?;
            match backend.install(self.bridge(), target, abi, entry) {
                Ok(installed) => Ok(HookRecord {
                    identity: target.identity().clone(),
                    abi: abi.clone(),
                    target: target.handle,
                    backup: installed.backup,
                    entry,
                    backend: backend.kind(),
                    original: installed.original,
                    chain: Arc::new(CallbackChain::new()),
                }),
                Err(err) => {
                    self.stubs.release(entry);
                    Err(err)
                }
            }
        };
        let (record, created, callback) = self.registry.install_with(
            target,
            &hook_abi,
            &abi,
            commit,
            |record| record.chain.add(callback, priority),
        )?;
        if created {
            log::info(format_args!(
                "hooked {} via {} backup {}",
                record.identity, record.backend, record.backup
            ));
        }
        Ok((record, callback))
    }

    pub(crate) fn unhook_identity(&self, identity: &MethodIdentity) -> Result<UnhookOutcome, HookError> {
        let mut released = None;
        let result = match self.backend.as_ref() {
            Some(backend) => self.registry.unhook(identity, |record| {
                let outcome = backend.uninstall(self.bridge(), record)?;
                if outcome == UnhookOutcome::Restored {
                    released = Some(record.entry);
                }
                Ok(outcome)
            }),
            None => Err(HookError::NotHooked(identity.to_string())),
        };
        if let Some(entry) = released {
            self.stubs.release(entry);
        }
        let status = result.as_ref().map_or_else(HookError::code, |_| 0);
        self.push_record(RecordOp::Unhook, identity, status, None);
        result
    }

    // fork 后清空注册表；能还原的还原并回收 trampoline
    pub(crate) fn reset_hooks(&self) -> usize {
        let Some(backend) = self.backend.as_ref() else {
            return self.registry.reset_for_fork(|_| Ok(UnhookOutcome::DispatchOnly));
        };
        let mut released = Vec::new();
        let count = self.registry.reset_for_fork(|record| {
            let outcome = backend.uninstall(self.bridge(), record)?;
            if outcome == UnhookOutcome::Restored {
                released.push(record.entry);
            }
            Ok(outcome)
        });
        for entry in released {
            self.stubs.release(entry);
        }
        count
    }

    pub(crate) fn push_record(
        &self,
        op: RecordOp,
        method: &dyn fmt::Display,
        status_code: i32,
        record: Option<&HookRecord>,
    ) {
        let mut records = self.records.lock_or_poison();
        if !records.enabled() {
            return;
        }
        let mut entry = RecordEntry::new(op, method.to_string(), status_code);
        if let Some(record) = record {
            entry.backend = record.backend.name();
            entry.target = record.target.0;
            entry.entry = record.entry;
        } else if let Some(backend) = self.backend.as_ref() {
            entry.backend = backend.kind().name();
        }
        records.push(entry);
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.backend_kind())
            .field("hooked", &self.registry.len())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}
