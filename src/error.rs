// 框架错误类型定义，code() 返回稳定的数值状态码，供审计记录使用
use crate::runtime::value::Throwable;
use thiserror::Error;

// VM 桥接层返回的错误
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VmError {
    #[error("class not found: {0}")]
    ClassNotFound(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid method handle 0x{0:x}")]
    InvalidHandle(usize),
    #[error("invalid object 0x{0:x}")]
    InvalidObject(usize),
    #[error("field {field} not found on object 0x{object:x}")]
    FieldNotFound { object: usize, field: String },
    #[error("deoptimization rejected: {0}")]
    DeoptRejected(String),
    #[error("hooker definition failed: {0}")]
    HookerDefinition(String),
    #[error("unsupported vm operation: {0}")]
    Unsupported(String),
}

impl VmError {
    // 类或方法缺失，deopt 白名单据此静默跳过
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::ClassNotFound(_) | Self::MethodNotFound(_))
    }
}

// hook 安装/调用路径上的错误
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("method already hooked: {0}")]
    AlreadyHooked(String),
    #[error("cannot hook {target}: {reason}")]
    UnhookableTarget { target: String, reason: &'static str },
    #[error("{role} signature mismatch for {target}: expected {expected}, got {actual}")]
    SignatureMismatch {
        target: String,
        role: &'static str,
        expected: String,
        actual: String,
    },
    #[error("method not hooked: {0}")]
    NotHooked(String),
    #[error("deoptimization failed for {target}: {source}")]
    DeoptimizationFailed {
        target: String,
        #[source]
        source: VmError,
    },
    #[error("incompatible vm: {0}")]
    IncompatibleVm(String),
    #[error("class not found: {0}")]
    ClassNotFound(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("trampoline synthesis failed: {0}")]
    Synthesis(String),
    #[error("hooking is disabled in this process")]
    HooksDisabled,
    #[error(transparent)]
    Vm(VmError),
}

impl From<VmError> for HookError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::ClassNotFound(name) => Self::ClassNotFound(name),
            VmError::MethodNotFound(name) => Self::MethodNotFound(name),
            other => Self::Vm(other),
        }
    }
}

impl HookError {
    // 0 保留给成功
    pub fn code(&self) -> i32 {
        match self {
            Self::AlreadyHooked(_) => 1,
            Self::UnhookableTarget { .. } => 2,
            Self::SignatureMismatch { .. } => 3,
            Self::NotHooked(_) => 4,
            Self::DeoptimizationFailed { .. } => 5,
            Self::IncompatibleVm(_) => 6,
            Self::ClassNotFound(_) => 7,
            Self::MethodNotFound(_) => 8,
            Self::InvalidDescriptor(_) => 9,
            Self::Synthesis(_) => 10,
            Self::HooksDisabled => 11,
            Self::Vm(_) => 1001,
        }
    }
}

// 用户回调失败，只在回调链边界被捕获并记录
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CallbackError {
    #[error("{0}")]
    Failed(String),
    #[error("callback threw {0}")]
    Thrown(Throwable),
    #[error("callback panicked: {0}")]
    Panicked(String),
}

impl CallbackError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

// 模块加载与事件分发错误，按模块隔离
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {name} failed to load: {reason}")]
    Load { name: String, reason: String },
    #[error("module {name} failed handling {event}: {reason}")]
    Event {
        name: String,
        event: &'static str,
        reason: String,
    },
    #[error("module {name} panicked: {reason}")]
    Panicked { name: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_vm_errors_map_to_lookup_errors() {
        let err: HookError = VmError::ClassNotFound("a.B".into()).into();
        assert_eq!(err, HookError::ClassNotFound("a.B".into()));
        assert_eq!(err.code(), 7);

        let err: HookError = VmError::InvalidHandle(0x10).into();
        assert_eq!(err.code(), 1001);
        assert!(err.to_string().contains("0x10"));
    }

    #[test]
    fn deopt_failure_keeps_source() {
        let err = HookError::DeoptimizationFailed {
            target: "a.B#c()V".into(),
            source: VmError::DeoptRejected("jit busy".into()),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("deoptimization rejected: jit busy"));
    }
}
