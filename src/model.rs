//! Logical container model.
//!
//! The owned, structurally comparable representation of everything that can
//! appear in a container: classes, members, method bodies, annotations,
//! constant values, and symbolic references. A front end hands these items to
//! the builder, which interns their shared sub-structures; the rewriter
//! consumes and produces the same shapes, so a rewritten container can be fed
//! straight back into a fresh builder.
//!
//! Every type here is plain data with deep equality. Canonical (deduplicated)
//! identity only exists inside a builder session; two structurally equal
//! items are interchangeable everywhere in this module.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

pub const ACC_PUBLIC: u32 = 0x1;
pub const ACC_PRIVATE: u32 = 0x2;
pub const ACC_STATIC: u32 = 0x8;
pub const ACC_FINAL: u32 = 0x10;
pub const ACC_INTERFACE: u32 = 0x200;
pub const ACC_ABSTRACT: u32 = 0x400;
pub const ACC_CONSTRUCTOR: u32 = 0x1_0000;

/// A constant value as it appears in annotations, static field initializers,
/// and call-site payloads.
#[derive(Debug, Clone)]
pub enum Value {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    MethodType(ProtoItem),
    MethodHandle(MethodHandleItem),
    String(String),
    Type(String),
    Field(FieldRefItem),
    Method(MethodRefItem),
    Enum(FieldRefItem),
    Array(Vec<Value>),
    Annotation {
        ty: String,
        elements: Vec<AnnotationElement>,
    },
    Null,
    Boolean(bool),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Byte(_) => 0,
            Value::Short(_) => 1,
            Value::Char(_) => 2,
            Value::Int(_) => 3,
            Value::Long(_) => 4,
            Value::Float(_) => 5,
            Value::Double(_) => 6,
            Value::MethodType(_) => 7,
            Value::MethodHandle(_) => 8,
            Value::String(_) => 9,
            Value::Type(_) => 10,
            Value::Field(_) => 11,
            Value::Method(_) => 12,
            Value::Enum(_) => 13,
            Value::Array(_) => 14,
            Value::Annotation { .. } => 15,
            Value::Null => 16,
            Value::Boolean(_) => 17,
        }
    }

    /// Whether this is the zero/null value serialization elides from the
    /// tail of a static initializer array.
    pub fn is_default(&self) -> bool {
        match self {
            Value::Byte(0) | Value::Short(0) | Value::Char(0) | Value::Int(0) | Value::Long(0) => {
                true
            }
            Value::Float(f) => f.to_bits() == 0,
            Value::Double(d) => d.to_bits() == 0,
            Value::Boolean(false) | Value::Null => true,
            _ => false,
        }
    }
}

// Floats are compared and hashed by bit pattern (total order) so values can
// serve as interning keys.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Byte(a), Value::Byte(b)) => a.cmp(b),
            (Value::Short(a), Value::Short(b)) => a.cmp(b),
            (Value::Char(a), Value::Char(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Long(a), Value::Long(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::MethodType(a), Value::MethodType(b)) => a.cmp(b),
            (Value::MethodHandle(a), Value::MethodHandle(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Type(a), Value::Type(b)) => a.cmp(b),
            (Value::Field(a), Value::Field(b)) => a.cmp(b),
            (Value::Method(a), Value::Method(b)) => a.cmp(b),
            (Value::Enum(a), Value::Enum(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (
                Value::Annotation { ty: at, elements: ae },
                Value::Annotation { ty: bt, elements: be },
            ) => at.cmp(bt).then_with(|| ae.cmp(be)),
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            Value::Byte(v) => v.hash(state),
            Value::Short(v) => v.hash(state),
            Value::Char(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::Long(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::MethodType(v) => v.hash(state),
            Value::MethodHandle(v) => v.hash(state),
            Value::String(v) => v.hash(state),
            Value::Type(v) => v.hash(state),
            Value::Field(v) => v.hash(state),
            Value::Method(v) => v.hash(state),
            Value::Enum(v) => v.hash(state),
            Value::Array(v) => v.hash(state),
            Value::Annotation { ty, elements } => {
                ty.hash(state);
                elements.hash(state);
            }
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
        }
    }
}

/// Symbolic reference to a field: defining class, name, type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRefItem {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

/// Symbolic reference to a method. Ordered by class, name, return type, then
/// parameters, matching the member collation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodRefItem {
    pub class: String,
    pub name: String,
    pub return_type: String,
    pub parameters: Vec<String>,
}

impl MethodRefItem {
    pub fn proto(&self) -> ProtoItem {
        ProtoItem {
            return_type: self.return_type.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Method prototype: return type plus parameter descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtoItem {
    pub return_type: String,
    pub parameters: Vec<String>,
}

impl ProtoItem {
    /// Short-form descriptor: one character per type, reference types
    /// collapsed to `L`, return type first.
    pub fn shorty(&self) -> String {
        let mut shorty = String::with_capacity(self.parameters.len() + 1);
        shorty.push(shorty_char(&self.return_type));
        for parameter in &self.parameters {
            shorty.push(shorty_char(parameter));
        }
        shorty
    }
}

fn shorty_char(descriptor: &str) -> char {
    match descriptor.as_bytes().first() {
        Some(b'[') | Some(b'L') => 'L',
        Some(&c) => c as char,
        None => panic!("empty type descriptor"),
    }
}

/// Width in register units of a value of the given type (wide primitives
/// occupy two).
pub fn type_width(descriptor: &str) -> u16 {
    match descriptor.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}

/// A method handle constant: the invocation/access kind plus the member it
/// designates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MethodHandleItem {
    StaticPut(FieldRefItem),
    StaticGet(FieldRefItem),
    InstancePut(FieldRefItem),
    InstanceGet(FieldRefItem),
    InvokeStatic(MethodRefItem),
    InvokeInstance(MethodRefItem),
    InvokeConstructor(MethodRefItem),
    InvokeDirect(MethodRefItem),
    InvokeInterface(MethodRefItem),
}

impl MethodHandleItem {
    pub fn kind(&self) -> u16 {
        match self {
            MethodHandleItem::StaticPut(_) => 0x00,
            MethodHandleItem::StaticGet(_) => 0x01,
            MethodHandleItem::InstancePut(_) => 0x02,
            MethodHandleItem::InstanceGet(_) => 0x03,
            MethodHandleItem::InvokeStatic(_) => 0x04,
            MethodHandleItem::InvokeInstance(_) => 0x05,
            MethodHandleItem::InvokeConstructor(_) => 0x06,
            MethodHandleItem::InvokeDirect(_) => 0x07,
            MethodHandleItem::InvokeInterface(_) => 0x08,
        }
    }

    pub fn field_ref(&self) -> Option<&FieldRefItem> {
        match self {
            MethodHandleItem::StaticPut(f)
            | MethodHandleItem::StaticGet(f)
            | MethodHandleItem::InstancePut(f)
            | MethodHandleItem::InstanceGet(f) => Some(f),
            _ => None,
        }
    }

    pub fn method_ref(&self) -> Option<&MethodRefItem> {
        match self {
            MethodHandleItem::InvokeStatic(m)
            | MethodHandleItem::InvokeInstance(m)
            | MethodHandleItem::InvokeConstructor(m)
            | MethodHandleItem::InvokeDirect(m)
            | MethodHandleItem::InvokeInterface(m) => Some(m),
            _ => None,
        }
    }
}

/// A call-site constant. The payload is a fixed-shape encoded array: method
/// handle, method name, method prototype, then any extra bootstrap arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSiteItem {
    pub name: String,
    pub payload: Vec<Value>,
}

impl CallSiteItem {
    /// The bootstrap method handle at payload position 0.
    ///
    /// Panics if the payload does not have the mandated shape; producing such
    /// a payload is a caller contract violation.
    pub fn method_handle(&self) -> &MethodHandleItem {
        match self.payload.first() {
            Some(Value::MethodHandle(handle)) => handle,
            other => panic!("call site payload[0] must be a method handle, got {other:?}"),
        }
    }

    /// The dynamic method name at payload position 1.
    pub fn method_name(&self) -> &str {
        match self.payload.get(1) {
            Some(Value::String(name)) => name,
            other => panic!("call site payload[1] must be a string, got {other:?}"),
        }
    }

    /// The dynamic method prototype at payload position 2.
    pub fn method_proto(&self) -> &ProtoItem {
        match self.payload.get(2) {
            Some(Value::MethodType(proto)) => proto,
            other => panic!("call site payload[2] must be a method type, got {other:?}"),
        }
    }

    /// Extra bootstrap arguments: the payload tail past the three fixed
    /// entries, empty when the payload has no more than three.
    pub fn extra_arguments(&self) -> &[Value] {
        if self.payload.len() <= 3 {
            &[]
        } else {
            &self.payload[3..]
        }
    }
}

/// Annotation retention class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Visibility {
    Build = 0,
    Runtime = 1,
    System = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnnotationElement {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnnotationItem {
    pub visibility: Visibility,
    pub ty: String,
    pub elements: Vec<AnnotationElement>,
}

/// A declared field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldItem {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u32,
    pub initial_value: Option<Value>,
    pub annotations: Vec<AnnotationItem>,
}

impl FieldItem {
    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

/// A declared method parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterItem {
    pub descriptor: String,
    pub name: Option<String>,
    pub annotations: Vec<AnnotationItem>,
}

/// Debug stream entries attached to a method body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DebugItem {
    LineNumber {
        address: u32,
        line: u32,
    },
    StartLocal {
        address: u32,
        register: u16,
        name: Option<String>,
        descriptor: Option<String>,
    },
    EndLocal {
        address: u32,
        register: u16,
    },
    PrologueEnd {
        address: u32,
    },
}

/// A handler in a try block; `None` for the exception type is a catch-all.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExceptionHandler {
    pub exception_type: Option<String>,
    pub handler_address: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TryBlock {
    pub start_address: u32,
    pub unit_count: u16,
    pub handlers: Vec<ExceptionHandler>,
}

/// One instruction of a method body. Instructions carrying symbolic
/// references keep them in model form so interning and rewriting can reach
/// them; everything else is pre-encoded code units.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instruction {
    /// Pre-encoded units with no symbolic references.
    Plain { units: Vec<u16> },
    /// `const-string` (format 21c).
    ConstString { register: u8, value: String },
    /// Type-referencing single-register op, e.g. `new-instance`,
    /// `const-class`, `check-cast` (format 21c).
    TypeOp {
        opcode: u8,
        register: u8,
        descriptor: String,
    },
    /// Instance field access (format 22c); registers are 4-bit.
    FieldOp {
        opcode: u8,
        value_register: u8,
        object_register: u8,
        field: FieldRefItem,
    },
    /// Method invocation with up to five argument registers (format 35c).
    Invoke {
        opcode: u8,
        registers: Vec<u8>,
        method: MethodRefItem,
    },
}

impl Instruction {
    /// Size of the encoded instruction in 16-bit code units.
    pub fn unit_count(&self) -> usize {
        match self {
            Instruction::Plain { units } => units.len(),
            Instruction::ConstString { .. }
            | Instruction::TypeOp { .. }
            | Instruction::FieldOp { .. } => 2,
            Instruction::Invoke { .. } => 3,
        }
    }
}

/// A method body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodImplItem {
    pub register_count: u16,
    pub instructions: Vec<Instruction>,
    pub try_blocks: Vec<TryBlock>,
    pub debug: Vec<DebugItem>,
}

impl MethodImplItem {
    /// Total body size in code units.
    pub fn unit_count(&self) -> usize {
        self.instructions.iter().map(Instruction::unit_count).sum()
    }
}

/// A declared method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodItem {
    pub name: String,
    pub return_type: String,
    pub parameters: Vec<ParameterItem>,
    pub access_flags: u32,
    pub annotations: Vec<AnnotationItem>,
    pub body: Option<MethodImplItem>,
}

impl MethodItem {
    /// Direct methods have a body bound to a specific instance or class:
    /// static, private, or constructor. Everything else dispatches virtually.
    pub fn is_direct(&self) -> bool {
        self.access_flags & (ACC_STATIC | ACC_PRIVATE | ACC_CONSTRUCTOR) != 0
    }

    pub fn parameter_types(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.descriptor.clone()).collect()
    }
}

/// A declared class: the aggregate root for one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassItem {
    pub descriptor: String,
    pub access_flags: u32,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub source_file: Option<String>,
    pub annotations: Vec<AnnotationItem>,
    pub fields: Vec<FieldItem>,
    pub methods: Vec<MethodItem>,
}

/// A whole logical container: what a parser produces and the builder
/// consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub classes: Vec<ClassItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> MethodHandleItem {
        MethodHandleItem::InvokeStatic(MethodRefItem {
            class: "Ljava/lang/invoke/LambdaMetafactory;".to_string(),
            name: "metafactory".to_string(),
            return_type: "Ljava/lang/invoke/CallSite;".to_string(),
            parameters: vec![],
        })
    }

    fn call_site(extra: Vec<Value>) -> CallSiteItem {
        let mut payload = vec![
            Value::MethodHandle(handle()),
            Value::String("run".to_string()),
            Value::MethodType(ProtoItem {
                return_type: "V".to_string(),
                parameters: vec![],
            }),
        ];
        payload.extend(extra);
        CallSiteItem {
            name: "call_site_0".to_string(),
            payload,
        }
    }

    #[test]
    fn test_call_site_accessors() {
        let site = call_site(vec![]);
        assert_eq!(site.method_handle().kind(), 0x04);
        assert_eq!(site.method_name(), "run");
        assert_eq!(site.method_proto().return_type, "V");
        assert!(site.extra_arguments().is_empty());
    }

    #[test]
    fn test_call_site_extra_arguments_tail() {
        let site = call_site(vec![Value::Int(7), Value::String("x".to_string())]);
        assert_eq!(
            site.extra_arguments(),
            &[Value::Int(7), Value::String("x".to_string())]
        );
    }

    #[test]
    #[should_panic(expected = "method handle")]
    fn test_call_site_malformed_payload_panics() {
        let site = CallSiteItem {
            name: "bad".to_string(),
            payload: vec![Value::Int(1)],
        };
        site.method_handle();
    }

    #[test]
    fn test_shorty() {
        let proto = ProtoItem {
            return_type: "V".to_string(),
            parameters: vec![
                "I".to_string(),
                "[B".to_string(),
                "Ljava/lang/String;".to_string(),
                "D".to_string(),
            ],
        };
        assert_eq!(proto.shorty(), "VILLD");
    }

    #[test]
    fn test_value_float_equality_by_bits() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
        assert_eq!(Value::Float(1.5), Value::Float(1.5));
    }

    #[test]
    fn test_value_default_detection() {
        assert!(Value::Int(0).is_default());
        assert!(Value::Null.is_default());
        assert!(Value::Boolean(false).is_default());
        assert!(Value::Double(0.0).is_default());
        assert!(!Value::Double(-0.0).is_default());
        assert!(!Value::Int(1).is_default());
        assert!(!Value::String(String::new()).is_default());
    }

    #[test]
    fn test_field_ref_ordering() {
        let a = FieldRefItem {
            class: "LA;".to_string(),
            name: "a".to_string(),
            descriptor: "I".to_string(),
        };
        let b = FieldRefItem {
            class: "LA;".to_string(),
            name: "b".to_string(),
            descriptor: "I".to_string(),
        };
        assert!(a < b);
    }

    #[test]
    fn test_method_direct_predicate() {
        let mut method = MethodItem {
            name: "m".to_string(),
            return_type: "V".to_string(),
            parameters: vec![],
            access_flags: ACC_PUBLIC,
            annotations: vec![],
            body: None,
        };
        assert!(!method.is_direct());
        method.access_flags |= ACC_STATIC;
        assert!(method.is_direct());
        method.access_flags = ACC_CONSTRUCTOR;
        assert!(method.is_direct());
    }
}
