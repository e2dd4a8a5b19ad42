// JNI native 调用约定下的参数槽布局，负责寄存器帧与装箱值之间的精确转换
use super::StubShape;
use crate::runtime::descriptor::TypeKind;
use crate::runtime::value::{ObjectRef, Value};

pub const FRAME_GPR_COUNT: usize = 8;
pub const FRAME_FPR_COUNT: usize = 8;

// trampoline 保存的寄存器现场，字段顺序与汇编模板一致
#[repr(C)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterFrame {
    pub gpr: [u64; FRAME_GPR_COUNT],
    pub fpr: [u64; FRAME_FPR_COUNT],
    // 调用方栈上传参区的首地址
    pub stack_args: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallingConvention {
    // aarch64: x0-x7, d0-d7
    Aapcs64Jni,
    // x86_64: rdi rsi rdx rcx r8 r9, xmm0-xmm7
    SysV64Jni,
}

impl CallingConvention {
    pub fn native() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self::SysV64Jni
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self::Aapcs64Jni
        }
    }

    fn gpr_count(self) -> usize {
        match self {
            Self::Aapcs64Jni => 8,
            Self::SysV64Jni => 6,
        }
    }

    fn fpr_count(self) -> usize {
        8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Gpr(usize),
    Fpr(usize),
    Stack(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SlotError {
    NullForPrimitive(TypeKind),
    WrongKind { expected: TypeKind, actual: TypeKind },
    Arity { expected: usize, actual: usize },
}

// 0 号通用寄存器固定为 JNIEnv*，1 号为 this 或 jclass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgLayout {
    convention: CallingConvention,
    is_static: bool,
    return_kind: TypeKind,
    params: Vec<(TypeKind, Location)>,
    stack_slots: usize,
}

impl ArgLayout {
    pub fn new(shape: &StubShape, convention: CallingConvention) -> Self {
        let mut next_gpr = 2usize;
        let mut next_fpr = 0usize;
        let mut stack_slots = 0usize;
        let mut params = Vec::with_capacity(shape.param_kinds.len());

        for kind in shape.param_kinds.iter().copied() {
            let location = if kind.is_floating() && next_fpr < convention.fpr_count() {
                next_fpr += 1;
                Location::Fpr(next_fpr - 1)
            } else if !kind.is_floating() && next_gpr < convention.gpr_count() {
                next_gpr += 1;
                Location::Gpr(next_gpr - 1)
            } else {
                stack_slots += 1;
                Location::Stack(stack_slots - 1)
            };
            params.push((kind, location));
        }

        Self {
            convention,
            is_static: shape.is_static,
            return_kind: shape.return_kind,
            params,
            stack_slots,
        }
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn return_kind(&self) -> TypeKind {
        self.return_kind
    }

    pub fn stack_slots(&self) -> usize {
        self.stack_slots
    }

    pub fn locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.params.iter().map(|(_, location)| *location)
    }

    // 返回 (this, 参数)，静态方法忽略 jclass
    pub fn unpack_args(&self, frame: &RegisterFrame, stack: &[u64]) -> (Option<ObjectRef>, Vec<Value>) {
        let this = if self.is_static {
            None
        } else {
            decode_slot(TypeKind::Reference, frame.gpr[1]).as_object()
        };
        let args = self
            .params
            .iter()
            .map(|(kind, location)| {
                let raw = match *location {
                    Location::Gpr(idx) => frame.gpr[idx],
                    Location::Fpr(idx) => frame.fpr[idx],
                    Location::Stack(idx) => stack.get(idx).copied().unwrap_or(0),
                };
                decode_slot(*kind, raw)
            })
            .collect();
        (this, args)
    }

    // void 方法忽略任何返回值
    pub fn pack_return(&self, frame: &mut RegisterFrame, value: &Value) -> Result<(), SlotError> {
        if self.return_kind == TypeKind::Void {
            return Ok(());
        }
        let raw = encode_slot(self.return_kind, value)?;
        if self.return_kind.is_floating() {
            frame.fpr[0] = raw;
        } else {
            frame.gpr[0] = raw;
        }
        Ok(())
    }

    // 异常返回时清零返回寄存器
    pub fn clear_return(&self, frame: &mut RegisterFrame) {
        frame.gpr[0] = 0;
        frame.fpr[0] = 0;
    }

    // 调用方视角：构造寄存器帧与栈参数区
    pub fn encode_call(
        &self,
        env: usize,
        receiver: usize,
        args: &[Value],
    ) -> Result<(RegisterFrame, Vec<u64>), SlotError> {
        if args.len() != self.params.len() {
            return Err(SlotError::Arity {
                expected: self.params.len(),
                actual: args.len(),
            });
        }
        let mut frame = RegisterFrame::default();
        let mut stack = vec![0u64; self.stack_slots];
        frame.gpr[0] = env as u64;
        frame.gpr[1] = receiver as u64;
        for ((kind, location), value) in self.params.iter().zip(args) {
            let raw = encode_slot(*kind, value)?;
            match *location {
                Location::Gpr(idx) => frame.gpr[idx] = raw,
                Location::Fpr(idx) => frame.fpr[idx] = raw,
                Location::Stack(idx) => stack[idx] = raw,
            }
        }
        Ok((frame, stack))
    }

    pub fn decode_return(&self, frame: &RegisterFrame) -> Value {
        match self.return_kind {
            TypeKind::Void => Value::Void,
            kind if kind.is_floating() => decode_slot(kind, frame.fpr[0]),
            kind => decode_slot(kind, frame.gpr[0]),
        }
    }
}

// 只取对应宽度的低位，高位内容不可信
pub fn decode_slot(kind: TypeKind, raw: u64) -> Value {
    match kind {
        TypeKind::Void => Value::Void,
        TypeKind::Boolean => Value::Boolean(raw as u8 != 0),
        TypeKind::Byte => Value::Byte(raw as u8 as i8),
        TypeKind::Char => Value::Char(raw as u16),
        TypeKind::Short => Value::Short(raw as u16 as i16),
        TypeKind::Int => Value::Int(raw as u32 as i32),
        TypeKind::Long => Value::Long(raw as i64),
        TypeKind::Float => Value::Float(f32::from_bits(raw as u32)),
        TypeKind::Double => Value::Double(f64::from_bits(raw)),
        TypeKind::Reference => match raw as usize {
            0 => Value::Null,
            addr => Value::Object(ObjectRef(addr)),
        },
    }
}

// 有符号类型做符号扩展，char/boolean 做零扩展
pub fn encode_slot(kind: TypeKind, value: &Value) -> Result<u64, SlotError> {
    let raw = match (kind, value) {
        (TypeKind::Reference, Value::Null) => 0,
        (TypeKind::Reference, Value::Object(object)) => object.0 as u64,
        (kind, Value::Null) if kind.is_primitive() => {
            return Err(SlotError::NullForPrimitive(kind));
        }
        (TypeKind::Boolean, Value::Boolean(v)) => u64::from(*v),
        (TypeKind::Byte, Value::Byte(v)) => *v as i64 as u64,
        (TypeKind::Char, Value::Char(v)) => u64::from(*v),
        (TypeKind::Short, Value::Short(v)) => *v as i64 as u64,
        (TypeKind::Int, Value::Int(v)) => *v as i64 as u64,
        (TypeKind::Long, Value::Long(v)) => *v as u64,
        (TypeKind::Float, Value::Float(v)) => u64::from(v.to_bits()),
        (TypeKind::Double, Value::Double(v)) => v.to_bits(),
        (TypeKind::Void, _) => 0,
        (expected, actual) => {
            return Err(SlotError::WrongKind {
                expected,
                actual: actual.kind(),
            });
        }
    };
    Ok(raw)
}
