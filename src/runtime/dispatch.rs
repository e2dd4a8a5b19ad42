// stub 回调入口：按目标方法查记录，执行回调链，最终调用 backup
use crate::log;
use std::sync::Arc;

use super::Runtime;
use super::backend::BackendKind;
use super::chain::InvocationContext;
use super::registry::{DispatchRoute, HookRecord};
use super::stub::StubDispatch;
use super::value::{MethodHandle, ObjectRef, Outcome, Throwable, Value};

const INTERNAL_ERROR_CLASS: &str = "java.lang.IllegalStateException";

impl Runtime {
    fn dispatch_hooked(
        &self,
        record: &Arc<HookRecord>,
        this: Option<ObjectRef>,
        args: Vec<Value>,
    ) -> Outcome {
        let (this, args) = split_receiver(record, this, args);
        if self.is_disabled() || record.chain.is_empty() {
            return self.invoke_backup(record.backup, this, &args);
        }
        let mut ctx = InvocationContext::new(record.identity.clone(), record.target, this, args);
        record
            .chain
            .dispatch(&mut ctx, |ctx| self.invoke_backup(record.backup, ctx.this(), ctx.args()))
    }

    pub(crate) fn invoke_backup(
        &self,
        backup: MethodHandle,
        this: Option<ObjectRef>,
        args: &[Value],
    ) -> Outcome {
        self.bridge()
            .invoke(backup, this, args)
            .unwrap_or_else(|err| Err(self.internal_error(&format!("invoke backup {backup}: {err}"))))
    }

    // 构造异常失败时仍返回一个只带类名的 Throwable
    pub(crate) fn internal_error(&self, message: &str) -> Throwable {
        log::error(format_args!("{message}"));
        self.bridge()
            .new_throwable(INTERNAL_ERROR_CLASS, message)
            .unwrap_or_else(|_| Throwable::new(ObjectRef(0), INTERNAL_ERROR_CLASS, Some(message)))
    }
}

// 动态代理后端的 hooker 是静态形式，实例方法的接收者作为首个参数传入
fn split_receiver(
    record: &HookRecord,
    this: Option<ObjectRef>,
    mut args: Vec<Value>,
) -> (Option<ObjectRef>, Vec<Value>) {
    if record.backend == BackendKind::DynamicProxy
        && !record.abi.is_static
        && this.is_none()
        && !args.is_empty()
    {
        let receiver = args.remove(0).as_object();
        return (receiver, args);
    }
    (this, args)
}

impl StubDispatch for Runtime {
    fn dispatch(&self, method: MethodHandle, this: Option<ObjectRef>, args: Vec<Value>) -> Outcome {
        match self.registry.route(method) {
            Some(DispatchRoute::Hooked(record)) => self.dispatch_hooked(&record, this, args),
            Some(DispatchRoute::Passthrough(record)) => {
                let (this, args) = split_receiver(&record, this, args);
                self.invoke_backup(record.backup, this, &args)
            }
            None => Err(self.internal_error(&format!("no hook record for method {method}"))),
        }
    }

    fn raise(&self, class_name: &str, message: &str) -> Option<Throwable> {
        match self.bridge().new_throwable(class_name, message) {
            Ok(throwable) => Some(throwable),
            Err(err) => {
                log::error(format_args!("cannot raise {class_name}: {err}"));
                None
            }
        }
    }

    fn throw_pending(&self, throwable: &Throwable) {
        self.bridge().throw_pending(throwable);
    }
}
