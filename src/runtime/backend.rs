// hook 后端：VM 桥接接口与两种方法元数据改写策略
use crate::config::BackendPreference;
use crate::error::{HookError, VmError};
use crate::log;
use bitflags::bitflags;
use std::fmt;

use super::descriptor::{AbiDescriptor, MethodIdentity, ResolvedMethod, TypeDesc};
use super::registry::{HookRecord, UnhookOutcome};
use super::value::{ClassLoaderRef, MethodHandle, ObjectRef, Outcome, Throwable, Value};

mod direct_patch;
mod dynamic_proxy;

pub(crate) use direct_patch::DirectPatch;
pub(crate) use dynamic_proxy::DynamicProxy;

pub const ANDROID_N: i32 = 24;
pub const ANDROID_O: i32 = 26;
pub const ANDROID_O_MR1: i32 = 27;
pub const ANDROID_Q: i32 = 29;
pub const ANDROID_R: i32 = 30;
pub const ANDROID_S: i32 = 31;
pub const ANDROID_MAX_SUPPORTED: i32 = 34;

bitflags! {
    // ArtMethod::access_flags_ 中与 hook 相关的位，未知位原样保留
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const PRE_COMPILED_R = 0x0020_0000;
        const PRE_COMPILED_S = 0x0080_0000;
        const COMPILE_DONT_BOTHER_O = 0x0100_0000;
        const COMPILE_DONT_BOTHER = 0x0200_0000;
        const FAST_INTERPRETER_TO_INTERPRETER_INVOKE = 0x4000_0000;
        const _ = !0;
    }
}

// 方法元数据中后端会读写的部分
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MethodRecord {
    pub access_flags: AccessFlags,
    pub entry_point: usize,
    // native 方法为 JNI 函数地址
    pub data: usize,
}

// 动态生成 hooker 类的描述，abi 为带显式接收者的静态形式
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookerSpec {
    pub class_name: String,
    pub target: MethodIdentity,
    pub abi: AbiDescriptor,
    pub native_entry: usize,
}

// 访问 VM 内部的窄接口，设备上由 JNI/ArtMethod 实现
pub trait VmBridge: Send + Sync {
    fn sdk_int(&self) -> i32;

    fn find_method(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
        name: &str,
        params: &[TypeDesc],
    ) -> Result<ResolvedMethod, VmError>;

    // 包含构造方法
    fn declared_methods(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
    ) -> Result<Vec<ResolvedMethod>, VmError>;

    fn read_method(&self, method: MethodHandle) -> Result<MethodRecord, VmError>;
    fn write_method(&self, method: MethodHandle, record: &MethodRecord) -> Result<(), VmError>;
    // 复制出一个独立的方法对象，作为 backup
    fn copy_method(&self, method: MethodHandle) -> Result<MethodHandle, VmError>;
    // 只用于释放安装失败时遗留的 copy_method 副本
    fn free_method(&self, method: MethodHandle);

    fn is_compiled(&self, method: MethodHandle) -> bool;
    fn deoptimize(&self, method: MethodHandle) -> Result<(), VmError>;

    fn define_hooker(&self, spec: &HookerSpec) -> Result<MethodHandle, VmError>;
    fn generic_jni_trampoline(&self) -> usize;

    fn invoke(
        &self,
        method: MethodHandle,
        this: Option<ObjectRef>,
        args: &[Value],
    ) -> Result<Outcome, VmError>;
    fn throw_pending(&self, throwable: &Throwable);
    fn new_throwable(&self, class_name: &str, message: &str) -> Result<Throwable, VmError>;

    fn read_field(&self, object: ObjectRef, field: &str) -> Result<Value, VmError>;
    fn read_string(&self, object: ObjectRef) -> Result<String, VmError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    DirectPatch,
    DynamicProxy,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::DirectPatch => "direct_patch",
            Self::DynamicProxy => "dynamic_proxy",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// 安装成功后交给注册表保存的信息
#[derive(Clone, Copy, Debug)]
pub(crate) struct Installed {
    pub(crate) backup: MethodHandle,
    pub(crate) original: MethodRecord,
}

// 进程初始化时选定一次，之后不混用
pub(crate) enum HookBackend {
    DirectPatch(DirectPatch),
    DynamicProxy(DynamicProxy),
}

impl HookBackend {
    pub(crate) fn select(
        bridge: &dyn VmBridge,
        preference: BackendPreference,
    ) -> Result<Self, HookError> {
        let sdk = bridge.sdk_int();
        let backend = match preference {
            BackendPreference::DirectPatch => DirectPatch::probe(sdk).map(Self::DirectPatch),
            BackendPreference::DynamicProxy => DynamicProxy::probe(sdk).map(Self::DynamicProxy),
            BackendPreference::Auto => DirectPatch::probe(sdk)
                .map(Self::DirectPatch)
                .or_else(|| DynamicProxy::probe(sdk).map(Self::DynamicProxy)),
        };
        match backend {
            Some(backend) => {
                log::info(format_args!("hook backend {} on sdk {sdk}", backend.kind()));
                Ok(backend)
            }
            None => Err(HookError::IncompatibleVm(format!(
                "no {preference:?} backend supports sdk {sdk}"
            ))),
        }
    }

    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            Self::DirectPatch(_) => BackendKind::DirectPatch,
            Self::DynamicProxy(_) => BackendKind::DynamicProxy,
        }
    }

    // hook 端的签名形状，注册表据此校验
    pub(crate) fn hook_abi(&self, abi: &AbiDescriptor) -> AbiDescriptor {
        match self {
            Self::DirectPatch(_) => abi.clone(),
            Self::DynamicProxy(_) => abi.as_static_form(),
        }
    }

    pub(crate) fn install(
        &self,
        bridge: &dyn VmBridge,
        target: &ResolvedMethod,
        abi: &AbiDescriptor,
        entry: usize,
    ) -> Result<Installed, HookError> {
        match self {
            Self::DirectPatch(backend) => backend.install(bridge, target, entry),
            Self::DynamicProxy(backend) => backend.install(bridge, target, abi, entry),
        }
    }

    pub(crate) fn uninstall(
        &self,
        bridge: &dyn VmBridge,
        record: &HookRecord,
    ) -> Result<UnhookOutcome, HookError> {
        match self {
            Self::DirectPatch(backend) => backend.uninstall(bridge, record),
            Self::DynamicProxy(_) => Ok(UnhookOutcome::DispatchOnly),
        }
    }
}

// 强制方法回到解释执行，失败只影响本次操作
pub(crate) fn deoptimize(
    bridge: &dyn VmBridge,
    method: MethodHandle,
    name: &dyn fmt::Display,
) -> Result<(), HookError> {
    bridge
        .deoptimize(method)
        .map_err(|source| HookError::DeoptimizationFailed {
            target: name.to_string(),
            source,
        })
}

pub(crate) fn compile_dont_bother(sdk: i32) -> AccessFlags {
    if sdk >= ANDROID_O_MR1 {
        AccessFlags::COMPILE_DONT_BOTHER
    } else {
        AccessFlags::COMPILE_DONT_BOTHER_O
    }
}

// 禁止 JIT 再编译；R 起还要清除预编译标记
pub(crate) fn mark_non_compilable(flags: AccessFlags, sdk: i32) -> AccessFlags {
    if sdk < ANDROID_N {
        return flags;
    }
    let mut flags = flags | compile_dont_bother(sdk);
    if sdk >= ANDROID_S {
        flags.remove(AccessFlags::PRE_COMPILED_S);
    } else if sdk >= ANDROID_R {
        flags.remove(AccessFlags::PRE_COMPILED_R);
    }
    flags
}

// backup 走 direct 调用，不能参与虚分派
pub(crate) fn mark_private(flags: AccessFlags) -> AccessFlags {
    if flags.contains(AccessFlags::STATIC) {
        return flags;
    }
    (flags | AccessFlags::PRIVATE) - AccessFlags::PROTECTED - AccessFlags::PUBLIC
}

// Q 起解释器快速路径缓存在 access_flags 中，变为 native 后必须清除
pub(crate) fn mark_native(flags: AccessFlags, sdk: i32) -> AccessFlags {
    let mut flags = flags | AccessFlags::NATIVE;
    if sdk >= ANDROID_Q {
        flags.remove(AccessFlags::FAST_INTERPRETER_TO_INTERPRETER_INVOKE);
    }
    flags
}

// 两个后端共用：必要时先反优化目标，快照原始元数据，复制出不可编译的 backup
pub(crate) fn prepare_backup(
    bridge: &dyn VmBridge,
    target: &ResolvedMethod,
) -> Result<Installed, HookError> {
    let sdk = bridge.sdk_int();
    let identity = target.identity();
    if bridge.is_compiled(target.handle) {
        deoptimize(bridge, target.handle, identity)?;
    }

    let original = bridge.read_method(target.handle)?;
    let backup = bridge.copy_method(target.handle)?;
    let backup_record = bridge.read_method(backup).and_then(|mut record| {
        record.access_flags = mark_non_compilable(mark_private(record.access_flags), sdk);
        bridge.write_method(backup, &record)?;
        Ok(record)
    });
    let backup_record = match backup_record {
        Ok(record) => record,
        Err(err) => {
            bridge.free_method(backup);
            return Err(err.into());
        }
    };
    log::debug(format_args!(
        "backup {backup} for {identity}, flags 0x{:x} -> 0x{:x}",
        original.access_flags.bits(),
        backup_record.access_flags.bits()
    ));
    Ok(Installed { backup, original })
}

// 改写目标失败时丢弃 backup 副本，目标本身尚未被修改
pub(crate) fn discard_backup(bridge: &dyn VmBridge, installed: &Installed, err: HookError) -> HookError {
    log::debug(format_args!("discard backup {}: {err}", installed.backup));
    bridge.free_method(installed.backup);
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_compilable_flags_follow_sdk() {
        let base = AccessFlags::PUBLIC | AccessFlags::PRE_COMPILED_R | AccessFlags::PRE_COMPILED_S;
        assert_eq!(mark_non_compilable(AccessFlags::PUBLIC, 23), AccessFlags::PUBLIC);
        assert!(mark_non_compilable(base, ANDROID_O).contains(AccessFlags::COMPILE_DONT_BOTHER_O));

        let r = mark_non_compilable(base, ANDROID_R);
        assert!(r.contains(AccessFlags::COMPILE_DONT_BOTHER));
        assert!(!r.contains(AccessFlags::PRE_COMPILED_R));
        assert!(r.contains(AccessFlags::PRE_COMPILED_S));

        let s = mark_non_compilable(base, ANDROID_S);
        assert!(!s.contains(AccessFlags::PRE_COMPILED_S));
    }

    #[test]
    fn private_and_native_marks() {
        let flags = AccessFlags::PUBLIC | AccessFlags::FINAL;
        assert_eq!(mark_private(flags), AccessFlags::PRIVATE | AccessFlags::FINAL);
        let statik = AccessFlags::PUBLIC | AccessFlags::STATIC;
        assert_eq!(mark_private(statik), statik);

        let fast = AccessFlags::FAST_INTERPRETER_TO_INTERPRETER_INVOKE;
        assert!(mark_native(fast, ANDROID_O).contains(fast));
        let native = mark_native(fast, ANDROID_Q);
        assert!(native.contains(AccessFlags::NATIVE));
        assert!(!native.contains(fast));
    }

    #[test]
    fn unknown_bits_are_retained() {
        let flags = AccessFlags::from_bits_retain(0x0008_0001);
        assert_eq!(mark_private(flags).bits(), 0x0008_0002);
    }
}
