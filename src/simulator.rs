// 纯内存的 VM 模拟：类表、方法元数据、代码表与对象表，在宿主机上驱动完整的 hook 流程
//
// 方法入口地址映射到代码表中的条目：原始方法体或 trampoline。trampoline 条目
// 按真实调用约定编码寄存器帧后进入 Stub，因此参数槽布局与派发路径都被覆盖。
use crate::error::{HookError, VmError};
use crate::runtime::backend::{AccessFlags, HookerSpec, MethodRecord, VmBridge};
use crate::runtime::MutexPoisonRecover;
use crate::runtime::descriptor::{Executable, MethodIdentity, Modifiers, ResolvedMethod, TypeDesc};
use crate::runtime::stub::{CodeSynthesizer, Stub};
use crate::runtime::value::{ClassLoaderRef, MethodHandle, ObjectRef, Outcome, Throwable, Value};
use dashmap::DashMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

pub const DEFAULT_SDK: i32 = 30;
pub const GENERIC_JNI_TRAMPOLINE: usize = 0x7f00_0000;
const SIM_ENV: usize = 0xe000;
const ID_BASE: usize = 0x1000;
const ID_STEP: usize = 0x10;

pub type MethodBody = dyn Fn(&SimVm, Option<ObjectRef>, &[Value]) -> Outcome + Send + Sync;

#[derive(Clone)]
enum Code {
    Body(Arc<MethodBody>),
    Trampoline { stub: Arc<Stub>, method: MethodHandle },
}

#[derive(Clone)]
struct SimMethod {
    resolved: ResolvedMethod,
    record: MethodRecord,
    // 定义时的方法体入口，内联进调用方的代码直接执行它
    body_entry: usize,
    compiled: bool,
    inlined: Vec<MethodHandle>,
    reject_deopt: bool,
    deopt_count: usize,
}

struct SimClass {
    is_interface: bool,
    methods: Vec<MethodHandle>,
}

#[derive(Default)]
struct SimObject {
    class_name: String,
    fields: HashMap<String, Value>,
    text: Option<String>,
}

thread_local! {
    static PENDING: RefCell<Option<Throwable>> = const { RefCell::new(None) };
}

fn take_pending() -> Option<Throwable> {
    PENDING.with(|pending| pending.borrow_mut().take())
}

pub struct SimVm {
    sdk: AtomicI32,
    next_id: AtomicUsize,
    hookers_supported: AtomicBool,
    hookers: AtomicUsize,
    // 设置后 define_hooker 以该原因失败，模拟类校验拒绝
    hooker_rejection: Mutex<Option<String>>,
    classes: DashMap<(ClassLoaderRef, String), SimClass>,
    methods: DashMap<MethodHandle, SimMethod>,
    codes: DashMap<usize, Code>,
    objects: DashMap<usize, SimObject>,
}

impl SimVm {
    pub fn new(sdk: i32) -> Arc<Self> {
        Arc::new(Self {
            sdk: AtomicI32::new(sdk),
            next_id: AtomicUsize::new(ID_BASE),
            hookers_supported: AtomicBool::new(true),
            hookers: AtomicUsize::new(0),
            hooker_rejection: Mutex::new(None),
            classes: DashMap::new(),
            methods: DashMap::new(),
            codes: DashMap::new(),
            objects: DashMap::new(),
        })
    }

    pub fn set_sdk(&self, sdk: i32) {
        self.sdk.store(sdk, Ordering::Release);
    }

    // 关闭后 define_hooker 返回 Unsupported
    pub fn set_hookers_supported(&self, supported: bool) {
        self.hookers_supported.store(supported, Ordering::Release);
    }

    pub fn reject_hookers(&self, reason: Option<&str>) {
        *self.hooker_rejection.lock_or_poison() = reason.map(str::to_string);
    }

    pub fn hooker_count(&self) -> usize {
        self.hookers.load(Ordering::Acquire)
    }

    fn alloc_id(&self) -> usize {
        self.next_id.fetch_add(ID_STEP, Ordering::AcqRel)
    }

    pub fn define_class(&self, loader: ClassLoaderRef, class_name: &str, is_interface: bool) {
        self.classes
            .entry((loader, class_name.to_string()))
            .or_insert_with(|| SimClass {
                is_interface,
                methods: Vec::new(),
            });
    }

    // 类不存在时按普通类创建
    pub fn define_method<F>(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
        name: &str,
        signature: &str,
        modifiers: Modifiers,
        body: F,
    ) -> Result<ResolvedMethod, HookError>
    where
        F: Fn(&SimVm, Option<ObjectRef>, &[Value]) -> Outcome + Send + Sync + 'static,
    {
        let identity = MethodIdentity::from_signature(
            class_name,
            name,
            signature,
            modifiers.contains(Modifiers::STATIC),
        )?;
        let handle = MethodHandle(self.alloc_id());
        let body_entry = self.alloc_id();
        self.codes.insert(body_entry, Code::Body(Arc::new(body)));

        let mut class = self
            .classes
            .entry((loader, class_name.to_string()))
            .or_insert_with(|| SimClass {
                is_interface: false,
                methods: Vec::new(),
            });
        class.methods.push(handle);
        let resolved = ResolvedMethod {
            handle,
            executable: Executable {
                identity,
                modifiers,
                declaring_is_interface: class.is_interface,
            },
        };
        drop(class);

        self.methods.insert(
            handle,
            SimMethod {
                resolved: resolved.clone(),
                record: MethodRecord {
                    access_flags: AccessFlags::from_bits_retain(modifiers.bits()),
                    entry_point: body_entry,
                    data: 0,
                },
                body_entry,
                compiled: false,
                inlined: Vec::new(),
                reject_deopt: false,
                deopt_count: 0,
            },
        );
        Ok(resolved)
    }

    // 标记为已编译，inlined 中的方法视为已内联进 caller
    pub fn set_compiled(&self, caller: MethodHandle, inlined: &[MethodHandle]) {
        if let Some(mut method) = self.methods.get_mut(&caller) {
            method.compiled = true;
            method.inlined = inlined.to_vec();
        }
    }

    pub fn reject_deopt(&self, method: MethodHandle) {
        if let Some(mut method) = self.methods.get_mut(&method) {
            method.reject_deopt = true;
        }
    }

    pub fn deopt_count(&self, method: MethodHandle) -> usize {
        self.methods.get(&method).map_or(0, |m| m.deopt_count)
    }

    pub fn new_object(&self, class_name: &str) -> ObjectRef {
        let id = self.alloc_id();
        self.objects.insert(
            id,
            SimObject {
                class_name: class_name.to_string(),
                ..SimObject::default()
            },
        );
        ObjectRef(id)
    }

    pub fn new_string(&self, text: &str) -> ObjectRef {
        let object = self.new_object("java.lang.String");
        if let Some(mut string) = self.objects.get_mut(&object.0) {
            string.text = Some(text.to_string());
        }
        object
    }

    pub fn set_field(&self, object: ObjectRef, field: &str, value: Value) {
        if let Some(mut object) = self.objects.get_mut(&object.0) {
            object.fields.insert(field.to_string(), value);
        }
    }

    pub fn class_of(&self, object: ObjectRef) -> Option<String> {
        self.objects.get(&object.0).map(|o| o.class_name.clone())
    }

    // 包含 backup 副本与 hooker 方法
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn live_trampolines(&self) -> usize {
        self.codes
            .iter()
            .filter(|code| matches!(code.value(), Code::Trampoline { .. }))
            .count()
    }

    // 经方法当前入口调用，与设备上的普通调用等价
    pub fn call(&self, method: MethodHandle, this: Option<ObjectRef>, args: &[Value]) -> Outcome {
        match self.resolve_code(method) {
            Ok(code) => self.run(code, this, args),
            Err(err) => Err(self.raise("java.lang.NoSuchMethodError", &err.to_string())),
        }
    }

    // caller 已编译且内联了 callee 时直接执行 callee 的方法体，不经过入口
    pub fn call_from(
        &self,
        caller: MethodHandle,
        callee: MethodHandle,
        this: Option<ObjectRef>,
        args: &[Value],
    ) -> Outcome {
        let inlined = self
            .methods
            .get(&caller)
            .is_some_and(|c| c.compiled && c.inlined.contains(&callee));
        if !inlined {
            return self.call(callee, this, args);
        }
        let body = self
            .methods
            .get(&callee)
            .and_then(|m| self.codes.get(&m.body_entry).map(|code| code.value().clone()));
        match body {
            Some(code) => self.run(code, this, args),
            None => Err(self.raise("java.lang.NoSuchMethodError", "inlined body missing")),
        }
    }

    fn resolve_code(&self, method: MethodHandle) -> Result<Code, VmError> {
        let record = self
            .methods
            .get(&method)
            .map(|m| m.record)
            .ok_or(VmError::InvalidHandle(method.0))?;
        // 通用 JNI 跳板从 data 取 JNI 函数地址
        let address = if record.entry_point == GENERIC_JNI_TRAMPOLINE
            && record.access_flags.contains(AccessFlags::NATIVE)
        {
            record.data
        } else {
            record.entry_point
        };
        self.codes
            .get(&address)
            .map(|code| code.value().clone())
            .ok_or_else(|| VmError::Unsupported(format!("no code at 0x{address:x}")))
    }

    fn run(&self, code: Code, this: Option<ObjectRef>, args: &[Value]) -> Outcome {
        match code {
            Code::Body(body) => body(self, this, args),
            Code::Trampoline { stub, method } => self.enter_trampoline(&stub, method, this, args),
        }
    }

    // 静态形式的 stub 把接收者作为首个参数
    fn enter_trampoline(
        &self,
        stub: &Stub,
        method: MethodHandle,
        this: Option<ObjectRef>,
        args: &[Value],
    ) -> Outcome {
        let mut call_args = Vec::with_capacity(args.len() + 1);
        let receiver = if stub.shape().is_static {
            call_args.extend(this.map(Value::Object));
            0
        } else {
            this.map_or(0, |object| object.0)
        };
        call_args.extend_from_slice(args);

        let (mut frame, stack) = stub
            .layout()
            .encode_call(SIM_ENV, receiver, &call_args)
            .map_err(|err| self.raise("java.lang.IllegalArgumentException", &format!("{err:?}")))?;
        take_pending();
        stub.enter_with_stack(method, &mut frame, &stack);
        match take_pending() {
            Some(throwable) => Err(throwable),
            None => Ok(stub.layout().decode_return(&frame)),
        }
    }

    fn raise(&self, class_name: &str, message: &str) -> Throwable {
        Throwable::new(self.new_object(class_name), class_name, Some(message))
    }

    fn with_method<T>(
        &self,
        method: MethodHandle,
        f: impl FnOnce(&mut SimMethod) -> T,
    ) -> Result<T, VmError> {
        let mut entry = self
            .methods
            .get_mut(&method)
            .ok_or(VmError::InvalidHandle(method.0))?;
        Ok(f(&mut entry))
    }

    fn class_methods(&self, loader: ClassLoaderRef, class_name: &str) -> Result<Vec<MethodHandle>, VmError> {
        // 先查指定加载器，再委托给 boot
        [loader, ClassLoaderRef::BOOT]
            .iter()
            .find_map(|l| {
                self.classes
                    .get(&(*l, class_name.to_string()))
                    .map(|class| class.methods.clone())
            })
            .ok_or_else(|| VmError::ClassNotFound(class_name.to_string()))
    }
}

impl VmBridge for SimVm {
    fn sdk_int(&self) -> i32 {
        self.sdk.load(Ordering::Acquire)
    }

    fn find_method(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
        name: &str,
        params: &[TypeDesc],
    ) -> Result<ResolvedMethod, VmError> {
        self.class_methods(loader, class_name)?
            .iter()
            .find_map(|handle| {
                self.methods.get(handle).and_then(|m| {
                    let identity = m.resolved.identity();
                    (&*identity.name == name && identity.params.as_ref() == params)
                        .then(|| m.resolved.clone())
                })
            })
            .ok_or_else(|| VmError::MethodNotFound(format!("{class_name}#{name}")))
    }

    fn declared_methods(
        &self,
        loader: ClassLoaderRef,
        class_name: &str,
    ) -> Result<Vec<ResolvedMethod>, VmError> {
        Ok(self
            .class_methods(loader, class_name)?
            .iter()
            .filter_map(|handle| self.methods.get(handle).map(|m| m.resolved.clone()))
            .collect())
    }

    fn read_method(&self, method: MethodHandle) -> Result<MethodRecord, VmError> {
        self.with_method(method, |m| m.record)
    }

    fn write_method(&self, method: MethodHandle, record: &MethodRecord) -> Result<(), VmError> {
        self.with_method(method, |m| m.record = *record)
    }

    fn copy_method(&self, method: MethodHandle) -> Result<MethodHandle, VmError> {
        let mut copy = self.with_method(method, |m| m.clone())?;
        let handle = MethodHandle(self.alloc_id());
        copy.resolved.handle = handle;
        copy.compiled = false;
        copy.inlined.clear();
        copy.deopt_count = 0;
        self.methods.insert(handle, copy);
        Ok(handle)
    }

    fn free_method(&self, method: MethodHandle) {
        self.methods.remove(&method);
    }

    fn is_compiled(&self, method: MethodHandle) -> bool {
        self.methods.get(&method).is_some_and(|m| m.compiled)
    }

    fn deoptimize(&self, method: MethodHandle) -> Result<(), VmError> {
        self.with_method(method, |m| {
            if m.reject_deopt {
                return Err(VmError::DeoptRejected(m.resolved.identity().to_string()));
            }
            m.compiled = false;
            m.inlined.clear();
            m.deopt_count += 1;
            Ok(())
        })?
    }

    fn define_hooker(&self, spec: &HookerSpec) -> Result<MethodHandle, VmError> {
        if !self.hookers_supported.load(Ordering::Acquire) {
            return Err(VmError::Unsupported("dynamic class definition unavailable".into()));
        }
        if let Some(reason) = self.hooker_rejection.lock_or_poison().clone() {
            return Err(VmError::HookerDefinition(format!("{}: {reason}", spec.class_name)));
        }
        let handle = MethodHandle(self.alloc_id());
        let identity = MethodIdentity {
            declaring_class: Arc::from(spec.class_name.as_str()),
            is_static: true,
            ..spec.target.clone()
        };
        self.methods.insert(
            handle,
            SimMethod {
                resolved: ResolvedMethod {
                    handle,
                    executable: Executable {
                        identity,
                        modifiers: Modifiers::PUBLIC | Modifiers::STATIC,
                        declaring_is_interface: false,
                    },
                },
                record: MethodRecord {
                    access_flags: AccessFlags::PUBLIC | AccessFlags::STATIC,
                    entry_point: spec.native_entry,
                    data: 0,
                },
                body_entry: spec.native_entry,
                compiled: false,
                inlined: Vec::new(),
                reject_deopt: false,
                deopt_count: 0,
            },
        );
        self.hookers.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    fn generic_jni_trampoline(&self) -> usize {
        GENERIC_JNI_TRAMPOLINE
    }

    fn invoke(
        &self,
        method: MethodHandle,
        this: Option<ObjectRef>,
        args: &[Value],
    ) -> Result<Outcome, VmError> {
        let code = self.resolve_code(method)?;
        Ok(self.run(code, this, args))
    }

    fn throw_pending(&self, throwable: &Throwable) {
        PENDING.with(|pending| *pending.borrow_mut() = Some(throwable.clone()));
    }

    fn new_throwable(&self, class_name: &str, message: &str) -> Result<Throwable, VmError> {
        Ok(self.raise(class_name, message))
    }

    fn read_field(&self, object: ObjectRef, field: &str) -> Result<Value, VmError> {
        let entry = self
            .objects
            .get(&object.0)
            .ok_or(VmError::InvalidObject(object.0))?;
        entry
            .fields
            .get(field)
            .cloned()
            .ok_or_else(|| VmError::FieldNotFound {
                object: object.0,
                field: field.to_string(),
            })
    }

    fn read_string(&self, object: ObjectRef) -> Result<String, VmError> {
        self.objects
            .get(&object.0)
            .and_then(|o| o.text.clone())
            .ok_or(VmError::InvalidObject(object.0))
    }
}

impl CodeSynthesizer for SimVm {
    fn synthesize(&self, stub: &Arc<Stub>, method: MethodHandle) -> Result<usize, HookError> {
        let entry = self.alloc_id();
        self.codes.insert(
            entry,
            Code::Trampoline {
                stub: Arc::clone(stub),
                method,
            },
        );
        Ok(entry)
    }

    fn release(&self, entry: usize) {
        self.codes.remove(&entry);
    }
}
