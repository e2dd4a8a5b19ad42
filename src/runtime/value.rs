// Java 值模型：装箱值、对象引用与异常，在 trampoline 与回调链之间传递
use std::fmt;
use std::sync::Arc;

use super::descriptor::TypeKind;

// VM 内部的方法指针（设备上为 ArtMethod*）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodHandle(pub usize);

// 非空对象引用（设备上为 jobject），null 由 Value::Null 表示
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(pub usize);

// 类加载器引用，0 表示 boot class loader
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ClassLoaderRef(pub usize);

impl ClassLoaderRef {
    pub const BOOT: Self = Self(0);

    pub fn is_boot(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Void,
    Null,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectRef),
}

impl Value {
    // Null 没有独立类型，返回 Reference
    pub fn kind(&self) -> TypeKind {
        match self {
            Self::Void => TypeKind::Void,
            Self::Null | Self::Object(_) => TypeKind::Reference,
            Self::Boolean(_) => TypeKind::Boolean,
            Self::Byte(_) => TypeKind::Byte,
            Self::Char(_) => TypeKind::Char,
            Self::Short(_) => TypeKind::Short,
            Self::Int(_) => TypeKind::Int,
            Self::Long(_) => TypeKind::Long,
            Self::Float(_) => TypeKind::Float,
            Self::Double(_) => TypeKind::Double,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn from_object(object: Option<ObjectRef>) -> Self {
        object.map_or(Self::Null, Self::Object)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Self::Object(object) => Some(*object),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Null => f.write_str("null"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Char(v) => write!(f, "\\u{v:04x}"),
            Self::Short(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}L"),
            Self::Float(v) => write!(f, "{v}f"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Object(o) => write!(f, "@0x{:x}", o.0),
        }
    }
}

// Java 异常，object 保持原始身份，不做包装
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Throwable {
    pub object: ObjectRef,
    pub class_name: Arc<str>,
    pub message: Option<Arc<str>>,
}

impl Throwable {
    pub fn new(object: ObjectRef, class_name: &str, message: Option<&str>) -> Self {
        Self {
            object,
            class_name: Arc::from(class_name),
            message: message.map(Arc::from),
        }
    }

    pub fn is(&self, class_name: &str) -> bool {
        &*self.class_name == class_name
    }
}

impl fmt::Display for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.class_name, message),
            None => f.write_str(&self.class_name),
        }
    }
}

// 一次调用的最终结果：返回值或抛出的异常
pub type Outcome = Result<Value, Throwable>;
