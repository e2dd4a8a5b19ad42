// Stub 生成与缓存：同一 ABI 形状共享一个 Stub，每个被 hook 的方法拥有独立 trampoline
use crate::error::HookError;
use crate::log;
use dashmap::DashMap;
use std::sync::{Arc, Weak};

use super::descriptor::{AbiDescriptor, TypeKind};
use super::value::{MethodHandle, ObjectRef, Outcome, Throwable, Value};

pub mod layout;
#[cfg(target_os = "android")]
pub mod trampoline;

use layout::{ArgLayout, CallingConvention, RegisterFrame, SlotError};

// Stub 缓存键：返回类型、参数槽种类、是否静态
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StubShape {
    pub return_kind: TypeKind,
    pub param_kinds: Arc<[TypeKind]>,
    pub is_static: bool,
}

impl From<&AbiDescriptor> for StubShape {
    fn from(abi: &AbiDescriptor) -> Self {
        Self {
            return_kind: abi.return_kind,
            param_kinds: Arc::clone(&abi.param_kinds),
            is_static: abi.is_static,
        }
    }
}

// Stub 进入派发层的出口
pub(crate) trait StubDispatch: Send + Sync {
    fn dispatch(&self, method: MethodHandle, this: Option<ObjectRef>, args: Vec<Value>) -> Outcome;
    fn raise(&self, class_name: &str, message: &str) -> Option<Throwable>;
    fn throw_pending(&self, throwable: &Throwable);
}

// 把 Stub 与方法绑定成可执行入口，返回入口地址
pub trait CodeSynthesizer: Send + Sync {
    fn synthesize(&self, stub: &Arc<Stub>, method: MethodHandle) -> Result<usize, HookError>;
    fn release(&self, entry: usize);
}

pub struct Stub {
    shape: StubShape,
    layout: ArgLayout,
    dispatcher: Weak<dyn StubDispatch>,
}

impl Stub {
    pub fn shape(&self) -> &StubShape {
        &self.shape
    }

    pub fn layout(&self) -> &ArgLayout {
        &self.layout
    }

    // native trampoline 的唯一入口
    //
    // Safety: frame.stack_args 为 0，或指向至少 layout.stack_slots() 个可读 u64
    pub unsafe fn enter(&self, method: MethodHandle, frame: &mut RegisterFrame) {
        let slots = self.layout.stack_slots();
        let stack: &[u64] = if slots == 0 || frame.stack_args == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(frame.stack_args as *const u64, slots) }
        };
        self.enter_with_stack(method, frame, stack);
    }

    pub fn enter_with_stack(&self, method: MethodHandle, frame: &mut RegisterFrame, stack: &[u64]) {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            log::error(format_args!("stub entered after runtime shutdown, method {method}"));
            self.layout.clear_return(frame);
            return;
        };

        let (this, args) = self.layout.unpack_args(frame, stack);
        match dispatcher.dispatch(method, this, args) {
            Ok(value) => {
                if let Err(err) = self.layout.pack_return(frame, &value) {
                    self.layout.clear_return(frame);
                    let (class_name, message) = describe_slot_error(&err);
                    log::warn(format_args!("bad hook result for {method}: {message}"));
                    if let Some(throwable) = dispatcher.raise(class_name, &message) {
                        dispatcher.throw_pending(&throwable);
                    }
                }
            }
            Err(throwable) => {
                self.layout.clear_return(frame);
                dispatcher.throw_pending(&throwable);
            }
        }
    }
}

fn describe_slot_error(err: &SlotError) -> (&'static str, String) {
    match err {
        SlotError::NullForPrimitive(kind) => (
            "java.lang.NullPointerException",
            format!("null result for primitive return type {}", kind.java_name()),
        ),
        SlotError::WrongKind { expected, actual } => (
            "java.lang.ClassCastException",
            format!(
                "{} cannot be cast to {}",
                actual.java_name(),
                expected.java_name()
            ),
        ),
        SlotError::Arity { expected, actual } => (
            "java.lang.IllegalArgumentException",
            format!("expected {expected} arguments, got {actual}"),
        ),
    }
}

pub(crate) struct StubGenerator {
    cache: DashMap<StubShape, Arc<Stub>>,
    convention: CallingConvention,
    dispatcher: Weak<dyn StubDispatch>,
    synthesizer: Arc<dyn CodeSynthesizer>,
}

impl StubGenerator {
    pub(crate) fn new(
        synthesizer: Arc<dyn CodeSynthesizer>,
        dispatcher: Weak<dyn StubDispatch>,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            convention: CallingConvention::native(),
            dispatcher,
            synthesizer,
        }
    }

    pub(crate) fn stub_for(&self, abi: &AbiDescriptor) -> Arc<Stub> {
        let shape = StubShape::from(abi);
        if let Some(stub) = self.cache.get(&shape) {
            return Arc::clone(stub.value());
        }
        let entry = self.cache.entry(shape.clone()).or_insert_with(|| {
            log::debug(format_args!("new stub for shape {}", abi.shorty()));
            Arc::new(Stub {
                layout: ArgLayout::new(&shape, self.convention),
                shape,
                dispatcher: Weak::clone(&self.dispatcher),
            })
        });
        Arc::clone(entry.value())
    }

    // 为单个方法生成 trampoline，返回 (stub, 入口地址)
    pub(crate) fn trampoline(
        &self,
        abi: &AbiDescriptor,
        method: MethodHandle,
    ) -> Result<(Arc<Stub>, usize), HookError> {
        let stub = self.stub_for(abi);
        let entry = self.synthesizer.synthesize(&stub, method)?;
        Ok((stub, entry))
    }

    pub(crate) fn release(&self, entry: usize) {
        self.synthesizer.release(entry);
    }

    pub(crate) fn shape_count(&self) -> usize {
        self.cache.len()
    }
}
