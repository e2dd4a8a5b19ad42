// 回调链引擎：按优先级派发 before/after 回调，处理跳过原方法与结果覆盖
use crate::error::CallbackError;
use crate::log;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::descriptor::MethodIdentity;
use super::state::RwLockPoisonRecover;
use super::value::{MethodHandle, ObjectRef, Outcome, Throwable, Value};


pub const PRIORITY_DEFAULT: i32 = 50;
pub const PRIORITY_HIGHEST: i32 = 10000;
pub const PRIORITY_LOWEST: i32 = -10000;

// before 回调的决定
#[derive(Clone, Debug, PartialEq)]
pub enum DispatchDecision {
    Continue,
    SkipWithResult(Value),
    SkipWithException(Throwable),
}

// after 回调的决定
#[derive(Clone, Debug, PartialEq)]
pub enum AfterDecision {
    Keep,
    ReplaceResult(Value),
    ReplaceException(Throwable),
}

// 单次调用的上下文，只存在于调用线程的栈上
#[derive(Debug)]
pub struct InvocationContext {
    method: MethodIdentity,
    handle: MethodHandle,
    this: Option<ObjectRef>,
    args: Vec<Value>,
    outcome: Option<Outcome>,
}

impl InvocationContext {
    pub fn new(
        method: MethodIdentity,
        handle: MethodHandle,
        this: Option<ObjectRef>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            method,
            handle,
            this,
            args,
            outcome: None,
        }
    }

    pub fn method(&self) -> &MethodIdentity {
        &self.method
    }

    pub fn handle(&self) -> MethodHandle {
        self.handle
    }

    pub fn this(&self) -> Option<ObjectRef> {
        self.this
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut [Value] {
        &mut self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    // 越界返回 false
    pub fn set_arg(&mut self, index: usize, value: Value) -> bool {
        match self.args.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    // before 阶段为 None
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().and_then(|o| o.as_ref().ok())
    }

    pub fn throwable(&self) -> Option<&Throwable> {
        self.outcome.as_ref().and_then(|o| o.as_ref().err())
    }

    pub fn has_throwable(&self) -> bool {
        self.throwable().is_some()
    }
}

// 用户回调，before/after 均有默认实现
pub trait HookCallback: Send + Sync {
    fn before(&self, ctx: &mut InvocationContext) -> Result<DispatchDecision, CallbackError> {
        let _ = ctx;
        Ok(DispatchDecision::Continue)
    }

    fn after(&self, ctx: &InvocationContext) -> Result<AfterDecision, CallbackError> {
        let _ = ctx;
        Ok(AfterDecision::Keep)
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

#[derive(Clone)]
pub struct CallbackEntry {
    pub id: CallbackId,
    pub priority: i32,
    pub callback: Arc<dyn HookCallback>,
}

// 快照按 (priority desc, 注册序号 asc) 排序，派发时整体替换，读者拿到的是不可变副本
pub struct CallbackChain {
    entries: RwLock<Arc<[CallbackEntry]>>,
    next_seq: AtomicU64,
}

impl Default for CallbackChain {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackChain {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::from(Vec::new())),
            next_seq: AtomicU64::new(1),
        }
    }

    // 同一个 Arc 重复注册返回已有 id
    pub fn add(&self, callback: Arc<dyn HookCallback>, priority: i32) -> CallbackId {
        let mut entries = self.entries.write_or_poison();
        if let Some(existing) = entries
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.callback, &callback))
        {
            return existing.id;
        }

        let id = CallbackId(self.next_seq.fetch_add(1, Ordering::Relaxed));
        let mut next: Vec<CallbackEntry> = entries.iter().cloned().collect();
        next.push(CallbackEntry {
            id,
            priority,
            callback,
        });
        next.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        *entries = next.into();
        id
    }

    pub fn remove(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.write_or_poison();
        if !entries.iter().any(|entry| entry.id == id) {
            return false;
        }
        let next: Vec<CallbackEntry> = entries
            .iter()
            .filter(|entry| entry.id != id)
            .cloned()
            .collect();
        *entries = next.into();
        true
    }

    pub fn clear(&self) {
        *self.entries.write_or_poison() = Arc::from(Vec::new());
    }

    pub fn snapshot(&self) -> Arc<[CallbackEntry]> {
        Arc::clone(&self.entries.read_or_poison())
    }

    pub fn len(&self) -> usize {
        self.entries.read_or_poison().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // 派发一次调用，original 只在没有回调要求跳过时执行
    pub fn dispatch<F>(&self, ctx: &mut InvocationContext, original: F) -> Outcome
    where
        F: FnOnce(&InvocationContext) -> Outcome,
    {
        let snapshot = self.snapshot();
        let mut ran = 0usize;
        let mut forced = None;

        for entry in snapshot.iter() {
            ran += 1;
            let saved_args = ctx.args.clone();
            match guarded(|| entry.callback.before(ctx)) {
                Ok(DispatchDecision::Continue) => {}
                Ok(DispatchDecision::SkipWithResult(value)) => {
                    forced = Some(Ok(value));
                    break;
                }
                Ok(DispatchDecision::SkipWithException(throwable)) => {
                    forced = Some(Err(throwable));
                    break;
                }
                Err(err) => {
                    log::warn(format_args!(
                        "before callback {} failed on {}: {err}",
                        entry.callback.name(),
                        ctx.method
                    ));
                    ctx.args = saved_args;
                }
            }
        }

        let outcome = match forced {
            Some(outcome) => outcome,
            None => original(ctx),
        };
        ctx.outcome = Some(outcome);

        for entry in snapshot[..ran].iter().rev() {
            match guarded(|| entry.callback.after(ctx)) {
                Ok(AfterDecision::Keep) => {}
                Ok(AfterDecision::ReplaceResult(value)) => ctx.outcome = Some(Ok(value)),
                Ok(AfterDecision::ReplaceException(throwable)) => {
                    ctx.outcome = Some(Err(throwable))
                }
                Err(err) => {
                    log::warn(format_args!(
                        "after callback {} failed on {}: {err}",
                        entry.callback.name(),
                        ctx.method
                    ));
                }
            }
        }

        ctx.outcome.clone().unwrap_or(Ok(Value::Void))
    }
}

// 捕获回调中的 panic，转为 CallbackError
fn guarded<T>(f: impl FnOnce() -> Result<T, CallbackError>) -> Result<T, CallbackError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(CallbackError::Panicked(panic_message(payload.as_ref()))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub type BeforeFn =
    dyn Fn(&mut InvocationContext) -> Result<DispatchDecision, CallbackError> + Send + Sync;
pub type AfterFn = dyn Fn(&InvocationContext) -> Result<AfterDecision, CallbackError> + Send + Sync;
type ReplaceFn = dyn Fn(&mut InvocationContext) -> Outcome + Send + Sync;

// 由闭包组成的回调
pub struct MethodHook {
    name: String,
    before: Option<Box<BeforeFn>>,
    after: Option<Box<AfterFn>>,
}

impl MethodHook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before: None,
            after: None,
        }
    }

    pub fn from_parts(
        name: impl Into<String>,
        before: Option<Box<BeforeFn>>,
        after: Option<Box<AfterFn>>,
    ) -> Self {
        Self {
            name: name.into(),
            before,
            after,
        }
    }

    pub fn before<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut InvocationContext) -> Result<DispatchDecision, CallbackError>
            + Send
            + Sync
            + 'static,
    {
        self.before = Some(Box::new(f));
        self
    }

    pub fn after<F>(mut self, f: F) -> Self
    where
        F: Fn(&InvocationContext) -> Result<AfterDecision, CallbackError> + Send + Sync + 'static,
    {
        self.after = Some(Box::new(f));
        self
    }
}

impl HookCallback for MethodHook {
    fn before(&self, ctx: &mut InvocationContext) -> Result<DispatchDecision, CallbackError> {
        match &self.before {
            Some(f) => f(ctx),
            None => Ok(DispatchDecision::Continue),
        }
    }

    fn after(&self, ctx: &InvocationContext) -> Result<AfterDecision, CallbackError> {
        match &self.after {
            Some(f) => f(ctx),
            None => Ok(AfterDecision::Keep),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// 整体替换方法体，原方法不再执行
pub struct MethodReplacement {
    name: String,
    replace: Box<ReplaceFn>,
}

impl MethodReplacement {
    pub fn new<F>(name: impl Into<String>, replace: F) -> Self
    where
        F: Fn(&mut InvocationContext) -> Outcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            replace: Box::new(replace),
        }
    }
}

impl HookCallback for MethodReplacement {
    fn before(&self, ctx: &mut InvocationContext) -> Result<DispatchDecision, CallbackError> {
        Ok(match (self.replace)(ctx) {
            Ok(value) => DispatchDecision::SkipWithResult(value),
            Err(throwable) => DispatchDecision::SkipWithException(throwable),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub fn do_nothing() -> Arc<dyn HookCallback> {
    Arc::new(MethodReplacement::new("do_nothing", |_| Ok(Value::Void)))
}

pub fn returns_constant(value: Value) -> Arc<dyn HookCallback> {
    Arc::new(MethodReplacement::new("returns_constant", move |_| {
        Ok(value.clone())
    }))
}
