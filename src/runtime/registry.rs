// hook 注册表：方法身份 -> hook 记录，安装串行化，派发路径只做并发 map 查询
use crate::error::HookError;
use crate::log;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};

use super::backend::{BackendKind, MethodRecord};
use super::chain::{CallbackChain, CallbackId};
use super::descriptor::{AbiDescriptor, MethodIdentity, Modifiers, ResolvedMethod, check_signature};
use super::state::MutexPoisonRecover;
use super::value::MethodHandle;

// 对外暴露的 hook 标识
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HookHandle {
    pub identity: MethodIdentity,
    pub target: MethodHandle,
}

// unhook 的结果
//
// DispatchOnly：后端无法还原入口（动态生成的 hooker 类仍然绑定在目标上），
// 此后调用仍会经过 trampoline，但只转发到 backup，不再执行任何回调
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnhookOutcome {
    Restored,
    DispatchOnly,
}

pub(crate) struct HookRecord {
    pub(crate) identity: MethodIdentity,
    pub(crate) abi: AbiDescriptor,
    pub(crate) target: MethodHandle,
    pub(crate) backup: MethodHandle,
    pub(crate) entry: usize,
    pub(crate) backend: BackendKind,
    pub(crate) original: MethodRecord,
    pub(crate) chain: Arc<CallbackChain>,
}

impl HookRecord {
    pub(crate) fn handle(&self) -> HookHandle {
        HookHandle {
            identity: self.identity.clone(),
            target: self.target,
        }
    }
}

// 派发路径上的查询结果
pub(crate) enum DispatchRoute {
    Hooked(Arc<HookRecord>),
    // 已 unhook 但入口无法还原，直接转发 backup
    Passthrough(Arc<HookRecord>),
}

#[derive(Default)]
pub(crate) struct HookRegistry {
    records: DashMap<MethodIdentity, Arc<HookRecord>>,
    by_target: DashMap<MethodHandle, Arc<HookRecord>>,
    passthrough: DashMap<MethodHandle, Arc<HookRecord>>,
    install_lock: Mutex<()>,
}

// 接口方法与抽象方法没有可替换的实现
pub(crate) fn check_hookable(target: &ResolvedMethod) -> Result<(), HookError> {
    let executable = &target.executable;
    let reason = if executable.declaring_is_interface
        || executable.modifiers.contains(Modifiers::INTERFACE)
    {
        "interface method"
    } else if executable.is_abstract() {
        "abstract method"
    } else {
        return Ok(());
    };
    Err(HookError::UnhookableTarget {
        target: executable.identity.to_string(),
        reason,
    })
}

impl HookRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // 返回 (记录, 是否新建)；已存在时记录警告并返回原记录
    pub(crate) fn install<F>(
        &self,
        target: &ResolvedMethod,
        hook_abi: &AbiDescriptor,
        backup_abi: &AbiDescriptor,
        commit: F,
    ) -> Result<(Arc<HookRecord>, bool), HookError>
    where
        F: FnOnce(&AbiDescriptor) -> Result<HookRecord, HookError>,
    {
        self.install_with(target, hook_abi, backup_abi, commit, |_| ())
            .map(|(record, created, ())| (record, created))
    }

    // attach 在安装锁内执行，与 unhook 互斥
    pub(crate) fn install_with<F, A, R>(
        &self,
        target: &ResolvedMethod,
        hook_abi: &AbiDescriptor,
        backup_abi: &AbiDescriptor,
        commit: F,
        attach: A,
    ) -> Result<(Arc<HookRecord>, bool, R), HookError>
    where
        F: FnOnce(&AbiDescriptor) -> Result<HookRecord, HookError>,
        A: FnOnce(&HookRecord) -> R,
    {
        check_hookable(target)?;
        let identity = target.identity();
        let abi = AbiDescriptor::of(identity);
        check_signature(identity, &abi, hook_abi, "hook")?;
        check_signature(identity, &abi, backup_abi, "backup")?;

        let _guard = self.install_lock.lock_or_poison();
        let (record, created) = if let Some(existing) = self.get(identity) {
            log::warn(format_args!(
                "{}",
                HookError::AlreadyHooked(identity.to_string())
            ));
            (existing, false)
        } else if let Some(parked) = self.parked(target.handle) {
            // 入口仍绑定着 trampoline，直接复用旧记录；先登记再移出直通表，调用方始终能找到路由
            log::debug(format_args!("revive parked hook for {identity}"));
            self.insert(Arc::clone(&parked));
            self.passthrough.remove(&target.handle);
            (parked, true)
        } else {
            let record = Arc::new(commit(&abi)?);
            self.insert(Arc::clone(&record));
            (record, true)
        };
        let attached = attach(&record);
        Ok((record, created, attached))
    }

    fn parked(&self, target: MethodHandle) -> Option<Arc<HookRecord>> {
        self.passthrough
            .get(&target)
            .map(|entry| Arc::clone(entry.value()))
    }

    // 与 unhook 在同一把锁下移除单个回调，已卸载或被重新安装的记录不受影响
    pub(crate) fn remove_callback(&self, handle: &HookHandle, id: CallbackId) -> bool {
        let _guard = self.install_lock.lock_or_poison();
        match self.get(&handle.identity) {
            Some(record) if record.target == handle.target => record.chain.remove(id),
            _ => false,
        }
    }

    fn insert(&self, record: Arc<HookRecord>) {
        self.by_target.insert(record.target, Arc::clone(&record));
        self.records.insert(record.identity.clone(), record);
    }

    pub(crate) fn get(&self, identity: &MethodIdentity) -> Option<Arc<HookRecord>> {
        self.records.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn route(&self, target: MethodHandle) -> Option<DispatchRoute> {
        if let Some(record) = self.by_target.get(&target) {
            return Some(DispatchRoute::Hooked(Arc::clone(record.value())));
        }
        self.passthrough
            .get(&target)
            .map(|record| DispatchRoute::Passthrough(Arc::clone(record.value())))
    }

    pub(crate) fn lookup_backup(&self, identity: &MethodIdentity) -> Result<MethodHandle, HookError> {
        self.records
            .get(identity)
            .map(|record| record.backup)
            .ok_or_else(|| HookError::NotHooked(identity.to_string()))
    }

    // restore 由后端执行；失败时记录保持不变
    pub(crate) fn unhook<F>(
        &self,
        identity: &MethodIdentity,
        restore: F,
    ) -> Result<UnhookOutcome, HookError>
    where
        F: FnOnce(&HookRecord) -> Result<UnhookOutcome, HookError>,
    {
        let _guard = self.install_lock.lock_or_poison();
        let record = self
            .get(identity)
            .ok_or_else(|| HookError::NotHooked(identity.to_string()))?;
        let outcome = restore(&record)?;
        self.park_or_drop(&record, outcome);
        self.records.remove(identity);
        self.by_target.remove(&record.target);
        Ok(outcome)
    }

    // 必须在移出 by_target 之前调用
    fn park_or_drop(&self, record: &Arc<HookRecord>, outcome: UnhookOutcome) {
        record.chain.clear();
        if outcome == UnhookOutcome::DispatchOnly {
            self.passthrough.insert(record.target, Arc::clone(record));
        }
    }

    // fork 后清空所有记录；能还原的还原，不能还原的转为直通
    pub(crate) fn reset_for_fork<F>(&self, mut restore: F) -> usize
    where
        F: FnMut(&HookRecord) -> Result<UnhookOutcome, HookError>,
    {
        let _guard = self.install_lock.lock_or_poison();
        let records: Vec<Arc<HookRecord>> = self
            .records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let count = records.len();
        for record in records {
            let outcome = restore(&record).unwrap_or_else(|err| {
                log::warn(format_args!(
                    "restore {} on fork failed: {err}",
                    record.identity
                ));
                UnhookOutcome::DispatchOnly
            });
            self.park_or_drop(&record, outcome);
        }
        self.records.clear();
        self.by_target.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn handles(&self) -> Vec<HookHandle> {
        self.records.iter().map(|entry| entry.value().handle()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::chain::do_nothing;
    use crate::runtime::descriptor::Executable;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolved(class: &str, name: &str, sig: &str, modifiers: Modifiers, iface: bool) -> ResolvedMethod {
        ResolvedMethod {
            handle: MethodHandle(0x1000 + name.len()),
            executable: Executable {
                identity: MethodIdentity::from_signature(class, name, sig, false).unwrap(),
                modifiers,
                declaring_is_interface: iface,
            },
        }
    }

    fn record_for(target: &ResolvedMethod, abi: &AbiDescriptor) -> HookRecord {
        HookRecord {
            identity: target.identity().clone(),
            abi: abi.clone(),
            target: target.handle,
            backup: MethodHandle(target.handle.0 + 0x100),
            entry: 0xe000,
            backend: BackendKind::DirectPatch,
            original: MethodRecord::default(),
            chain: Arc::new(CallbackChain::new()),
        }
    }

    #[test]
    fn second_install_returns_existing_record() {
        let registry = HookRegistry::new();
        let target = resolved("com.example.Calc", "add", "(II)I", Modifiers::PUBLIC, false);
        let abi = AbiDescriptor::of(target.identity());
        let commits = AtomicUsize::new(0);

        let (first, created) = registry
            .install(&target, &abi, &abi, |abi| {
                commits.fetch_add(1, Ordering::SeqCst);
                Ok(record_for(&target, abi))
            })
            .unwrap();
        assert!(created);
        let (second, created) = registry
            .install(&target, &abi, &abi, |abi| {
                commits.fetch_add(1, Ordering::SeqCst);
                Ok(record_for(&target, abi))
            })
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.handle(), second.handle());
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rejects_interface_and_abstract_targets() {
        let registry = HookRegistry::new();
        let iface = resolved(
            "java.util.List",
            "add",
            "(Ljava/lang/Object;)Z",
            Modifiers::PUBLIC | Modifiers::ABSTRACT,
            true,
        );
        let abi = AbiDescriptor::of(iface.identity());
        let Err(err) = registry.install(&iface, &abi, &abi, |abi| Ok(record_for(&iface, abi))) else {
            panic!("interface method was hooked");
        };
        assert!(matches!(err, HookError::UnhookableTarget { reason: "interface method", .. }));

        let abstract_method = resolved("java.io.InputStream", "read", "()I", Modifiers::ABSTRACT, false);
        let abi = AbiDescriptor::of(abstract_method.identity());
        let Err(err) =
            registry.install(&abstract_method, &abi, &abi, |abi| Ok(record_for(&abstract_method, abi)))
        else {
            panic!("abstract method was hooked");
        };
        assert!(matches!(err, HookError::UnhookableTarget { reason: "abstract method", .. }));
        assert!(registry.is_empty());

        let native = resolved("java.lang.Object", "hashCode", "()I", Modifiers::NATIVE | Modifiers::FINAL, false);
        let abi = AbiDescriptor::of(native.identity());
        assert!(registry.install(&native, &abi, &abi, |abi| Ok(record_for(&native, abi))).is_ok());
    }

    #[test]
    fn signature_mismatch_is_rejected_before_commit() {
        let registry = HookRegistry::new();
        let target = resolved("com.example.Calc", "add", "(II)I", Modifiers::PUBLIC, false);
        let abi = AbiDescriptor::of(target.identity());
        let wrong = AbiDescriptor::of(
            &MethodIdentity::from_signature("com.example.Calc", "add", "(IJ)I", false).unwrap(),
        );
        let Err(err) = registry.install(&target, &abi, &wrong, |_| panic!("must not commit")) else {
            panic!("mismatched backup was accepted");
        };
        assert!(matches!(err, HookError::SignatureMismatch { role: "backup", .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn unhook_and_lookup() {
        let registry = HookRegistry::new();
        let target = resolved("com.example.Calc", "add", "(II)I", Modifiers::PUBLIC, false);
        let abi = AbiDescriptor::of(target.identity());
        let identity = target.identity().clone();
        assert!(matches!(registry.lookup_backup(&identity), Err(HookError::NotHooked(_))));

        registry
            .install(&target, &abi, &abi, |abi| Ok(record_for(&target, abi)))
            .unwrap();
        assert_eq!(registry.lookup_backup(&identity), Ok(MethodHandle(target.handle.0 + 0x100)));

        // 还原失败时记录保留
        let err = registry.unhook(&identity, |_| Err(HookError::IncompatibleVm("x".into())));
        assert!(err.is_err());
        assert_eq!(registry.len(), 1);

        assert_eq!(
            registry.unhook(&identity, |_| Ok(UnhookOutcome::DispatchOnly)),
            Ok(UnhookOutcome::DispatchOnly)
        );
        assert!(registry.is_empty());
        assert!(matches!(registry.route(target.handle), Some(DispatchRoute::Passthrough(_))));

        // 重新 hook 复用直通记录，不再提交
        let (revived, created) = registry
            .install(&target, &abi, &abi, |_| panic!("parked record must be reused"))
            .unwrap();
        assert!(created);
        assert!(revived.chain.is_empty());
        assert!(matches!(registry.route(target.handle), Some(DispatchRoute::Hooked(_))));
    }

    #[test]
    fn callbacks_follow_live_record_only() {
        let registry = HookRegistry::new();
        let target = resolved("com.example.Calc", "scale", "(I)J", Modifiers::PUBLIC, false);
        let abi = AbiDescriptor::of(target.identity());
        let (record, _, id) = registry
            .install_with(
                &target,
                &abi,
                &abi,
                |abi| Ok(record_for(&target, abi)),
                |record| record.chain.add(do_nothing(), 0),
            )
            .unwrap();
        let handle = record.handle();
        assert_eq!(record.chain.len(), 1);

        registry
            .unhook(target.identity(), |_| Ok(UnhookOutcome::DispatchOnly))
            .unwrap();
        assert!(record.chain.is_empty());
        // 直通记录上的旧凭证不再生效
        assert!(!registry.remove_callback(&handle, id));

        let (revived, created, fresh) = registry
            .install_with(
                &target,
                &abi,
                &abi,
                |_| panic!("parked record must be reused"),
                |record| record.chain.add(do_nothing(), 0),
            )
            .unwrap();
        assert!(created);
        assert!(Arc::ptr_eq(&record, &revived));
        assert_eq!(revived.chain.len(), 1);
        assert!(registry.remove_callback(&handle, fresh));
        assert!(revived.chain.is_empty());
    }

    #[test]
    fn reset_for_fork_clears_everything() {
        let registry = HookRegistry::new();
        for name in ["a", "bb", "ccc"] {
            let target = resolved("com.example.Calc", name, "()V", Modifiers::PUBLIC, false);
            let abi = AbiDescriptor::of(target.identity());
            registry
                .install(&target, &abi, &abi, |abi| Ok(record_for(&target, abi)))
                .unwrap();
        }
        let restored = AtomicUsize::new(0);
        let count = registry.reset_for_fork(|_| {
            restored.fetch_add(1, Ordering::SeqCst);
            Ok(UnhookOutcome::Restored)
        });
        assert_eq!(count, 3);
        assert_eq!(restored.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
        assert!(registry.handles().is_empty());
    }
}
