// 对外接口：方法查找、hook 安装与卸载、调用原方法、反优化与审计记录
use crate::error::{HookError, VmError};
use crate::log;
use crate::runtime::Runtime;
use crate::runtime::chain::{AfterFn, BeforeFn, CallbackId, HookCallback, MethodHook, PRIORITY_DEFAULT};
use crate::runtime::deopt::DeoptReport;
use crate::runtime::descriptor::{
    CONSTRUCTOR_NAME, MethodIdentity, ResolvedMethod, TypeDesc, parse_method_signature,
};
use crate::runtime::record::{self, RecordOp};
use crate::runtime::registry::{HookHandle, UnhookOutcome};
use crate::runtime::value::{ClassLoaderRef, ObjectRef, Outcome, Value};
use crate::runtime::MutexPoisonRecover;
use crate::version;
use std::io;
use std::sync::{Arc, Weak};

pub use crate::runtime::record::{
    RECORD_ITEM_ALL, RECORD_ITEM_BACKEND, RECORD_ITEM_ENTRY, RECORD_ITEM_METHOD, RECORD_ITEM_OP,
    RECORD_ITEM_STATUS, RECORD_ITEM_TARGET, RECORD_ITEM_TIMESTAMP,
};

// 单个回调的注册凭证，drop 不会卸载
#[derive(Clone, Debug)]
pub struct Unhook {
    runtime: Weak<Runtime>,
    handle: HookHandle,
    callback: CallbackId,
}

impl Unhook {
    pub fn handle(&self) -> &HookHandle {
        &self.handle
    }

    pub fn identity(&self) -> &MethodIdentity {
        &self.handle.identity
    }

    pub fn callback_id(&self) -> CallbackId {
        self.callback
    }

    // 只移除本回调，方法上的其他回调和 hook 本身保留
    pub fn unhook(&self) -> bool {
        let Some(runtime) = self.runtime.upgrade() else {
            return false;
        };
        runtime.registry.remove_callback(&self.handle, self.callback)
    }
}

pub fn get_version() -> String {
    version::version_str_full()
}

impl Runtime {
    pub fn version(&self) -> String {
        get_version()
    }

    pub fn find_method(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
        name: &str,
        params: &[TypeDesc],
    ) -> Result<ResolvedMethod, HookError> {
        Ok(self.bridge().find_method(loader, class_name, name, params)?)
    }

    // signature 为 JNI 形式，返回类型也参与匹配
    pub fn find_method_sig(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
        name: &str,
        signature: &str,
    ) -> Result<ResolvedMethod, HookError> {
        let (params, return_type) = parse_method_signature(signature)?;
        let method = self.find_method(loader, class_name, name, &params)?;
        if name != CONSTRUCTOR_NAME && method.identity().return_type != return_type {
            return Err(HookError::MethodNotFound(format!(
                "{class_name}#{name}{signature}"
            )));
        }
        Ok(method)
    }

    pub fn find_constructor(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
        params: &[TypeDesc],
    ) -> Result<ResolvedMethod, HookError> {
        self.find_method(loader, class_name, CONSTRUCTOR_NAME, params)
    }

    // 方法尚未 hook 时先安装；回调与安装在同一临界区内挂上，不会落进刚被卸载的记录
    pub fn hook(
        &self,
        method: &ResolvedMethod,
        callback: Arc<dyn HookCallback>,
        priority: i32,
    ) -> Result<Unhook, HookError> {
        let (record, callback) = self.install_hook(method, callback, priority)?;
        Ok(Unhook {
            runtime: self.weak(),
            handle: record.handle(),
            callback,
        })
    }

    pub fn hook_with(
        &self,
        method: &ResolvedMethod,
        before: Option<Box<BeforeFn>>,
        after: Option<Box<AfterFn>>,
        priority: i32,
    ) -> Result<Unhook, HookError> {
        let name = format!("hook:{}", method.identity());
        self.hook(method, Arc::new(MethodHook::from_parts(name, before, after)), priority)
    }

    pub fn find_and_hook_method(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
        name: &str,
        signature: &str,
        callback: Arc<dyn HookCallback>,
    ) -> Result<Unhook, HookError> {
        let method = self.find_method_sig(loader, class_name, name, signature)?;
        self.hook(&method, callback, PRIORITY_DEFAULT)
    }

    // 抽象方法与接口方法跳过，其余失败立即返回
    pub fn hook_all_methods(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
        name: &str,
        callback: Arc<dyn HookCallback>,
    ) -> Result<Vec<Unhook>, HookError> {
        let methods = self.bridge().declared_methods(loader, class_name)?;
        self.hook_each(
            methods
                .into_iter()
                .filter(|method| &*method.identity().name == name),
            callback,
        )
    }

    pub fn hook_all_constructors(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
        callback: Arc<dyn HookCallback>,
    ) -> Result<Vec<Unhook>, HookError> {
        let methods = self.bridge().declared_methods(loader, class_name)?;
        self.hook_each(
            methods
                .into_iter()
                .filter(|method| method.identity().is_constructor()),
            callback,
        )
    }

    fn hook_each(
        &self,
        methods: impl Iterator<Item = ResolvedMethod>,
        callback: Arc<dyn HookCallback>,
    ) -> Result<Vec<Unhook>, HookError> {
        let mut unhooks = Vec::new();
        for method in methods {
            match self.hook(&method, Arc::clone(&callback), PRIORITY_DEFAULT) {
                Ok(unhook) => unhooks.push(unhook),
                Err(HookError::UnhookableTarget { target, reason }) => {
                    log::debug(format_args!("skip {target}: {reason}"));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(unhooks)
    }

    // 直接调用 backup，不经过任何回调
    pub fn invoke_original(
        &self,
        identity: &MethodIdentity,
        this: Option<ObjectRef>,
        args: &[Value],
    ) -> Result<Outcome, HookError> {
        if args.len() != identity.params.len() {
            return Err(HookError::SignatureMismatch {
                target: identity.to_string(),
                role: "invoke",
                expected: format!("{} arguments", identity.params.len()),
                actual: format!("{} arguments", args.len()),
            });
        }
        let backup = self.registry.lookup_backup(identity)?;
        Ok(self.bridge().invoke(backup, this, args)?)
    }

    pub fn unhook_method(&self, identity: &MethodIdentity) -> Result<UnhookOutcome, HookError> {
        self.unhook_identity(identity)
    }

    // 返回 false 表示之前已经反优化过
    pub fn deoptimize_method(&self, method: &ResolvedMethod) -> Result<bool, HookError> {
        let result = self.deopter.deopt_method(self.bridge(), method);
        let status = result.as_ref().map_or_else(HookError::code, |_| 0);
        self.push_record(RecordOp::Deopt, method.identity(), status, None);
        result
    }

    // 按白名单 key 反优化内联了被 hook 方法的调用方
    pub fn deoptimize_callers(&self, key: &str, loader: ClassLoaderRef) -> DeoptReport {
        let report = self.deopter.deopt(self.bridge(), key, loader);
        let status = if report.failed == 0 {
            0
        } else {
            HookError::DeoptimizationFailed {
                target: key.to_string(),
                source: VmError::DeoptRejected(format!("{} entries failed", report.failed)),
            }
            .code()
        };
        self.push_record(RecordOp::Deopt, &key, status, None);
        report
    }

    pub fn is_hooked(&self, identity: &MethodIdentity) -> bool {
        self.registry.get(identity).is_some()
    }

    pub fn hooked_count(&self) -> usize {
        self.registry.len()
    }

    pub fn hooked_methods(&self) -> Vec<HookHandle> {
        self.registry.handles()
    }

    pub fn hooks_disabled(&self) -> bool {
        self.is_disabled()
    }

    pub fn loaded_modules(&self) -> Vec<String> {
        self.modules.loaded_names()
    }

    pub fn set_debug(&self, debug: bool) {
        log::set_debug_enabled(debug);
    }

    pub fn get_recordable(&self) -> bool {
        self.records.lock_or_poison().enabled()
    }

    pub fn set_recordable(&self, recordable: bool) {
        self.records.lock_or_poison().set_enabled(recordable);
    }

    pub fn records_text(&self, item_flags: u32) -> Option<String> {
        self.records.lock_or_poison().text(item_flags)
    }

    // 没有记录时不写入任何内容
    pub fn dump_records(&self, writer: &mut dyn io::Write, item_flags: u32) -> io::Result<()> {
        match self.records_text(item_flags) {
            Some(text) => record::dump_text(writer, &text),
            None => Ok(()),
        }
    }
}
