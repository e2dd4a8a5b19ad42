#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
compile_error!("lsphook supports only 64-bit architectures: aarch64 and x86_64");

// 公共 API 层：方法查找、hook、调用原方法、反优化、审计记录
mod api;
// 运行时配置，支持环境变量覆盖
pub mod config;
// 错误类型与状态码
pub mod error;
// 日志输出，Android 上写入 logcat
mod log;
// Android 相关：trampoline 页的内存保护
#[cfg(target_os = "android")]
mod android;
// 运行时核心：后端、注册表、回调链、stub、反优化、fork 生命周期
pub mod runtime;
// 纯内存 VM 模拟器
#[cfg(any(test, feature = "simulator"))]
pub mod simulator;
// 版本信息
mod version;

pub use api::{
    RECORD_ITEM_ALL, RECORD_ITEM_BACKEND, RECORD_ITEM_ENTRY, RECORD_ITEM_METHOD, RECORD_ITEM_OP,
    RECORD_ITEM_STATUS, RECORD_ITEM_TARGET, RECORD_ITEM_TIMESTAMP, Unhook, get_version,
};
pub use config::{BackendPreference, RuntimeConfig};
pub use error::{CallbackError, HookError, ModuleError, VmError};
pub use log::{LOG_TAG, debug_enabled, init_platform_logger, set_debug_enabled};
pub use runtime::backend::{AccessFlags, BackendKind, HookerSpec, MethodRecord, VmBridge};
pub use runtime::chain::{
    AfterDecision, CallbackId, DispatchDecision, HookCallback, InvocationContext, MethodHook,
    MethodReplacement, PRIORITY_DEFAULT, PRIORITY_HIGHEST, PRIORITY_LOWEST, do_nothing,
    returns_constant,
};
pub use runtime::deopt::{DeoptEntry, DeoptReport, DeoptWhitelist};
pub use runtime::descriptor::{
    AbiDescriptor, Executable, MethodIdentity, Modifiers, ResolvedMethod, TypeDesc, TypeKind,
};
pub use runtime::lifecycle::{ForkPhase, SpecializeArgs};
pub use runtime::modules::{
    HookModule, LoadReport, ModuleDescriptor, ModuleEvent, ModuleScope, ModuleSource,
    PackageLoadedParam, ResourcesLoadedParam, StartupParam, StaticModuleSource,
};
pub use runtime::registry::{HookHandle, UnhookOutcome};
pub use runtime::stub::CodeSynthesizer;
#[cfg(target_os = "android")]
pub use runtime::stub::trampoline::NativeSynthesizer;
pub use runtime::value::{ClassLoaderRef, MethodHandle, ObjectRef, Outcome, Throwable, Value};
pub use runtime::{AppContext, Runtime, RuntimeBuilder};
