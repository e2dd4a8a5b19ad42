// 方法身份与 ABI 描述：解析 JVM 类型描述符，推导 trampoline 需要的参数槽布局
use crate::error::HookError;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

use super::value::MethodHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeKind {
    Void,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl TypeKind {
    pub fn shorty(self) -> char {
        match self {
            Self::Void => 'V',
            Self::Boolean => 'Z',
            Self::Byte => 'B',
            Self::Char => 'C',
            Self::Short => 'S',
            Self::Int => 'I',
            Self::Long => 'J',
            Self::Float => 'F',
            Self::Double => 'D',
            Self::Reference => 'L',
        }
    }

    pub fn from_shorty(c: char) -> Option<Self> {
        Some(match c {
            'V' => Self::Void,
            'Z' => Self::Boolean,
            'B' => Self::Byte,
            'C' => Self::Char,
            'S' => Self::Short,
            'I' => Self::Int,
            'J' => Self::Long,
            'F' => Self::Float,
            'D' => Self::Double,
            'L' | '[' => Self::Reference,
            _ => return None,
        })
    }

    pub fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    // 八种基本类型，不含 void 与引用
    pub fn is_primitive(self) -> bool {
        !matches!(self, Self::Void | Self::Reference)
    }

    pub fn java_name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Boolean => "boolean",
            Self::Byte => "byte",
            Self::Char => "char",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Reference => "java.lang.Object",
        }
    }
}

// 单个 JVM 类型描述符，如 "I"、"[J"、"Ljava/lang/String;"
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeDesc(Arc<str>);

impl TypeDesc {
    pub fn parse(desc: &str) -> Result<Self, HookError> {
        match scan_type(desc.as_bytes(), 0) {
            Some(end) if end == desc.len() => Ok(Self(Arc::from(desc))),
            _ => Err(HookError::InvalidDescriptor(desc.to_string())),
        }
    }

    // 接受 Java 源码写法："int"、"java.lang.String"、"int[][]"
    pub fn from_java_name(name: &str) -> Result<Self, HookError> {
        let name = name.trim();
        let mut base = name;
        let mut dims = 0usize;
        while let Some(stripped) = base.strip_suffix("[]") {
            base = stripped.trim_end();
            dims += 1;
        }
        if base.is_empty() {
            return Err(HookError::InvalidDescriptor(name.to_string()));
        }
        let mut desc = "[".repeat(dims);
        match base {
            "void" if dims == 0 => desc.push('V'),
            "boolean" => desc.push('Z'),
            "byte" => desc.push('B'),
            "char" => desc.push('C'),
            "short" => desc.push('S'),
            "int" => desc.push('I'),
            "long" => desc.push('J'),
            "float" => desc.push('F'),
            "double" => desc.push('D'),
            _ if base.starts_with('[') || (base.starts_with('L') && base.ends_with(';')) => {
                return Self::parse(&format!("{desc}{}", base.replace('.', "/")));
            }
            _ => {
                if base.contains(['/', ';', '[', ' ']) || base == "void" {
                    return Err(HookError::InvalidDescriptor(name.to_string()));
                }
                desc.push('L');
                desc.push_str(&base.replace('.', "/"));
                desc.push(';');
            }
        }
        Ok(Self(Arc::from(desc)))
    }

    pub fn void() -> Self {
        Self(Arc::from("V"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> TypeKind {
        self.0
            .chars()
            .next()
            .and_then(TypeKind::from_shorty)
            .unwrap_or(TypeKind::Reference)
    }

    pub fn java_name(&self) -> String {
        let dims = self.0.bytes().take_while(|b| *b == b'[').count();
        let base = &self.0[dims..];
        let mut name = match base.strip_prefix('L').and_then(|s| s.strip_suffix(';')) {
            Some(class) => class.replace('/', "."),
            None => base
                .chars()
                .next()
                .and_then(TypeKind::from_shorty)
                .map(|kind| kind.java_name().to_string())
                .unwrap_or_default(),
        };
        for _ in 0..dims {
            name.push_str("[]");
        }
        name
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// 从 pos 处扫描一个完整类型，返回结束位置
fn scan_type(bytes: &[u8], mut pos: usize) -> Option<usize> {
    while bytes.get(pos) == Some(&b'[') {
        pos += 1;
    }
    match *bytes.get(pos)? {
        b'Z' | b'B' | b'C' | b'S' | b'I' | b'J' | b'F' | b'D' => Some(pos + 1),
        b'V' if pos == 0 || bytes[pos - 1] != b'[' => Some(pos + 1),
        b'L' => {
            let end = pos + bytes[pos..].iter().position(|b| *b == b';')?;
            if end == pos + 1 {
                return None;
            }
            Some(end + 1)
        }
        _ => None,
    }
}

// 解析方法签名 "(ILjava/lang/String;)V"
pub fn parse_method_signature(sig: &str) -> Result<(Vec<TypeDesc>, TypeDesc), HookError> {
    let invalid = || HookError::InvalidDescriptor(sig.to_string());
    let bytes = sig.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(invalid());
    }
    let mut params = Vec::new();
    let mut pos = 1;
    while bytes.get(pos) != Some(&b')') {
        let end = scan_type(bytes, pos).ok_or_else(invalid)?;
        if bytes[pos] == b'V' {
            return Err(invalid());
        }
        params.push(TypeDesc(Arc::from(&sig[pos..end])));
        pos = end;
    }
    let ret = &sig[pos + 1..];
    match scan_type(ret.as_bytes(), 0) {
        Some(end) if end == ret.len() => Ok((params, TypeDesc(Arc::from(ret)))),
        _ => Err(invalid()),
    }
}

pub const CONSTRUCTOR_NAME: &str = "<init>";

// 方法的唯一身份，作为注册表键
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodIdentity {
    pub declaring_class: Arc<str>,
    pub name: Arc<str>,
    pub params: Arc<[TypeDesc]>,
    pub return_type: TypeDesc,
    pub is_static: bool,
}

impl MethodIdentity {
    pub fn new(
        declaring_class: &str,
        name: &str,
        params: Vec<TypeDesc>,
        return_type: TypeDesc,
        is_static: bool,
    ) -> Self {
        Self {
            declaring_class: Arc::from(declaring_class),
            name: Arc::from(name),
            params: params.into(),
            return_type,
            is_static,
        }
    }

    pub fn from_signature(
        declaring_class: &str,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> Result<Self, HookError> {
        let (params, return_type) = parse_method_signature(signature)?;
        Ok(Self::new(declaring_class, name, params, return_type, is_static))
    }

    pub fn constructor(declaring_class: &str, params: Vec<TypeDesc>) -> Self {
        Self::new(declaring_class, CONSTRUCTOR_NAME, params, TypeDesc::void(), false)
    }

    pub fn is_constructor(&self) -> bool {
        &*self.name == CONSTRUCTOR_NAME
    }

    pub fn signature(&self) -> String {
        let mut sig = String::from("(");
        for param in self.params.iter() {
            sig.push_str(param.as_str());
        }
        sig.push(')');
        sig.push_str(self.return_type.as_str());
        sig
    }
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}{}", self.declaring_class, self.name, self.signature())
    }
}

bitflags! {
    // Java 语言层面的修饰符
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Modifiers: u32 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
    }
}

// 已解析的成员：身份 + 修饰符 + 声明类是否为接口
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Executable {
    pub identity: MethodIdentity,
    pub modifiers: Modifiers,
    pub declaring_is_interface: bool,
}

impl Executable {
    pub fn is_abstract(&self) -> bool {
        self.modifiers.contains(Modifiers::ABSTRACT)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMethod {
    pub handle: MethodHandle,
    pub executable: Executable,
}

impl ResolvedMethod {
    pub fn identity(&self) -> &MethodIdentity {
        &self.executable.identity
    }
}

// trampoline 只关心槽位种类，不关心引用的具体类型
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AbiDescriptor {
    pub return_kind: TypeKind,
    pub param_kinds: Arc<[TypeKind]>,
    pub is_static: bool,
    pub is_constructor: bool,
}

pub fn describe(executable: &Executable) -> AbiDescriptor {
    AbiDescriptor::of(&executable.identity)
}

impl AbiDescriptor {
    pub fn of(identity: &MethodIdentity) -> Self {
        let is_constructor = identity.is_constructor();
        Self {
            return_kind: if is_constructor {
                TypeKind::Void
            } else {
                identity.return_type.kind()
            },
            param_kinds: identity.params.iter().map(TypeDesc::kind).collect(),
            is_static: identity.is_static,
            is_constructor,
        }
    }

    // ART shorty：返回类型在首位，引用统一为 L
    pub fn shorty(&self) -> String {
        std::iter::once(self.return_kind)
            .chain(self.param_kinds.iter().copied())
            .map(TypeKind::shorty)
            .collect()
    }

    // 实例方法在首位补上接收者槽
    pub fn slot_kinds(&self) -> Vec<TypeKind> {
        let receiver = (!self.is_static).then_some(TypeKind::Reference);
        receiver
            .into_iter()
            .chain(self.param_kinds.iter().copied())
            .collect()
    }

    // 将接收者展开为显式首参的静态形式，动态生成的 hooker 方法使用此形式
    pub fn as_static_form(&self) -> Self {
        Self {
            return_kind: self.return_kind,
            param_kinds: self.slot_kinds().into(),
            is_static: true,
            is_constructor: false,
        }
    }

    fn slot_shorty(&self) -> String {
        let mut text = String::from("(");
        text.extend(self.slot_kinds().into_iter().map(TypeKind::shorty));
        text.push(')');
        text.push(self.return_kind.shorty());
        text
    }
}

// 按位置比较槽位：基本类型必须相同，引用只与引用匹配
pub fn check_signature(
    target: &MethodIdentity,
    original: &AbiDescriptor,
    candidate: &AbiDescriptor,
    role: &'static str,
) -> Result<(), HookError> {
    let expected = original.slot_kinds();
    let actual = candidate.slot_kinds();
    let slots_match =
        expected.len() == actual.len() && expected.iter().zip(&actual).all(|(a, b)| a == b);
    if slots_match && original.return_kind == candidate.return_kind {
        return Ok(());
    }
    Err(HookError::SignatureMismatch {
        target: target.to_string(),
        role,
        expected: original.slot_shorty(),
        actual: candidate.slot_shorty(),
    })
}
