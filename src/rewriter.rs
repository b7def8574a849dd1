//! Container rewriting.
//!
//! A [`DexRewriter`] holds at most one override per structural category;
//! every category without an override falls back to structural identity,
//! which clones the item while recursing into its children so a nested
//! override still reaches them. Rewriting never mutates the input: the
//! output is a fresh logical container that can be fed straight into a new
//! [`crate::DexBuilder`].
//!
//! Overrides receive the rewriter itself so they can delegate the parts
//! they do not change back to the structural defaults.

use crate::model::{
    AnnotationElement, AnnotationItem, CallSiteItem, ClassItem, Container, DebugItem,
    ExceptionHandler, FieldItem, FieldRefItem, Instruction, MethodHandleItem, MethodImplItem,
    MethodItem, MethodRefItem, ParameterItem, ProtoItem, TryBlock, Value,
};
use std::borrow::Cow;

type RewriteFn<T> = Box<dyn Fn(&DexRewriter, &T) -> T + Send + Sync>;

/// Composable container rewriter. Construct through [`DexRewriter::builder`].
#[derive(Default)]
pub struct DexRewriter {
    containers: Option<RewriteFn<Container>>,
    classes: Option<RewriteFn<ClassItem>>,
    fields: Option<RewriteFn<FieldItem>>,
    methods: Option<RewriteFn<MethodItem>>,
    parameters: Option<RewriteFn<ParameterItem>>,
    implementations: Option<RewriteFn<MethodImplItem>>,
    instructions: Option<RewriteFn<Instruction>>,
    try_blocks: Option<RewriteFn<TryBlock>>,
    exception_handlers: Option<RewriteFn<ExceptionHandler>>,
    debug_items: Option<RewriteFn<DebugItem>>,
    types: Option<RewriteFn<String>>,
    strings: Option<RewriteFn<String>>,
    field_references: Option<RewriteFn<FieldRefItem>>,
    method_references: Option<RewriteFn<MethodRefItem>>,
    annotations: Option<RewriteFn<AnnotationItem>>,
    annotation_elements: Option<RewriteFn<AnnotationElement>>,
    values: Option<RewriteFn<Value>>,
}

macro_rules! override_setters {
    ($($setter:ident => $field:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $setter<F>(mut self, f: F) -> Self
            where
                F: Fn(&DexRewriter, &$ty) -> $ty + Send + Sync + 'static,
            {
                self.0.$field = Some(Box::new(f));
                self
            }
        )*
    };
}

/// Builder for [`DexRewriter`]: one optional override per category.
#[derive(Default)]
pub struct DexRewriterBuilder(DexRewriter);

impl DexRewriterBuilder {
    override_setters! {
        rewrite_containers => containers: Container,
        rewrite_classes => classes: ClassItem,
        rewrite_fields => fields: FieldItem,
        rewrite_methods => methods: MethodItem,
        rewrite_parameters => parameters: ParameterItem,
        rewrite_implementations => implementations: MethodImplItem,
        rewrite_instructions => instructions: Instruction,
        rewrite_try_blocks => try_blocks: TryBlock,
        rewrite_exception_handlers => exception_handlers: ExceptionHandler,
        rewrite_debug_items => debug_items: DebugItem,
        rewrite_types => types: String,
        rewrite_strings => strings: String,
        rewrite_field_references => field_references: FieldRefItem,
        rewrite_method_references => method_references: MethodRefItem,
        rewrite_annotations => annotations: AnnotationItem,
        rewrite_annotation_elements => annotation_elements: AnnotationElement,
        rewrite_values => values: Value,
    }

    pub fn build(self) -> DexRewriter {
        self.0
    }
}

impl DexRewriter {
    pub fn builder() -> DexRewriterBuilder {
        DexRewriterBuilder::default()
    }

    /// Rewrite a whole container eagerly.
    pub fn rewrite(&self, container: &Container) -> Container {
        match &self.containers {
            Some(f) => f(self, container),
            None => self.rewrite_container_structure(container),
        }
    }

    pub fn rewrite_container_structure(&self, container: &Container) -> Container {
        Container {
            classes: container.classes.iter().map(|c| self.rewrite_class(c)).collect(),
        }
    }

    /// Lazy view over a container: classes are rewritten as they are pulled,
    /// nothing is cloned up front.
    pub fn rewritten<'a>(&'a self, container: &'a Container) -> RewrittenContainer<'a> {
        RewrittenContainer {
            rewriter: self,
            base: Cow::Borrowed(container),
        }
    }

    pub fn rewrite_class(&self, class: &ClassItem) -> ClassItem {
        match &self.classes {
            Some(f) => f(self, class),
            None => self.rewrite_class_structure(class),
        }
    }

    /// Structural identity for a class: recurse into every child category.
    pub fn rewrite_class_structure(&self, class: &ClassItem) -> ClassItem {
        ClassItem {
            descriptor: self.rewrite_type(&class.descriptor),
            access_flags: class.access_flags,
            superclass: class.superclass.as_deref().map(|s| self.rewrite_type(s)),
            interfaces: class.interfaces.iter().map(|i| self.rewrite_type(i)).collect(),
            source_file: class.source_file.clone(),
            annotations: class
                .annotations
                .iter()
                .map(|a| self.rewrite_annotation(a))
                .collect(),
            fields: class.fields.iter().map(|f| self.rewrite_field(f)).collect(),
            methods: class.methods.iter().map(|m| self.rewrite_method(m)).collect(),
        }
    }

    pub fn rewrite_field(&self, field: &FieldItem) -> FieldItem {
        match &self.fields {
            Some(f) => f(self, field),
            None => self.rewrite_field_structure(field),
        }
    }

    pub fn rewrite_field_structure(&self, field: &FieldItem) -> FieldItem {
        FieldItem {
            name: field.name.clone(),
            descriptor: self.rewrite_type(&field.descriptor),
            access_flags: field.access_flags,
            initial_value: field.initial_value.as_ref().map(|v| self.rewrite_value(v)),
            annotations: field
                .annotations
                .iter()
                .map(|a| self.rewrite_annotation(a))
                .collect(),
        }
    }

    pub fn rewrite_method(&self, method: &MethodItem) -> MethodItem {
        match &self.methods {
            Some(f) => f(self, method),
            None => self.rewrite_method_structure(method),
        }
    }

    pub fn rewrite_method_structure(&self, method: &MethodItem) -> MethodItem {
        MethodItem {
            name: method.name.clone(),
            return_type: self.rewrite_type(&method.return_type),
            parameters: method
                .parameters
                .iter()
                .map(|p| self.rewrite_parameter(p))
                .collect(),
            access_flags: method.access_flags,
            annotations: method
                .annotations
                .iter()
                .map(|a| self.rewrite_annotation(a))
                .collect(),
            body: method.body.as_ref().map(|b| self.rewrite_implementation(b)),
        }
    }

    pub fn rewrite_parameter(&self, parameter: &ParameterItem) -> ParameterItem {
        match &self.parameters {
            Some(f) => f(self, parameter),
            None => ParameterItem {
                descriptor: self.rewrite_type(&parameter.descriptor),
                name: parameter.name.clone(),
                annotations: parameter
                    .annotations
                    .iter()
                    .map(|a| self.rewrite_annotation(a))
                    .collect(),
            },
        }
    }

    pub fn rewrite_implementation(&self, body: &MethodImplItem) -> MethodImplItem {
        match &self.implementations {
            Some(f) => f(self, body),
            None => MethodImplItem {
                register_count: body.register_count,
                instructions: body
                    .instructions
                    .iter()
                    .map(|i| self.rewrite_instruction(i))
                    .collect(),
                try_blocks: body
                    .try_blocks
                    .iter()
                    .map(|t| self.rewrite_try_block(t))
                    .collect(),
                debug: body.debug.iter().map(|d| self.rewrite_debug_item(d)).collect(),
            },
        }
    }

    pub fn rewrite_instruction(&self, instruction: &Instruction) -> Instruction {
        match &self.instructions {
            Some(f) => f(self, instruction),
            None => match instruction {
                Instruction::Plain { units } => Instruction::Plain { units: units.clone() },
                Instruction::ConstString { register, value } => Instruction::ConstString {
                    register: *register,
                    value: self.rewrite_string(value),
                },
                Instruction::TypeOp {
                    opcode,
                    register,
                    descriptor,
                } => Instruction::TypeOp {
                    opcode: *opcode,
                    register: *register,
                    descriptor: self.rewrite_type(descriptor),
                },
                Instruction::FieldOp {
                    opcode,
                    value_register,
                    object_register,
                    field,
                } => Instruction::FieldOp {
                    opcode: *opcode,
                    value_register: *value_register,
                    object_register: *object_register,
                    field: self.rewrite_field_reference(field),
                },
                Instruction::Invoke {
                    opcode,
                    registers,
                    method,
                } => Instruction::Invoke {
                    opcode: *opcode,
                    registers: registers.clone(),
                    method: self.rewrite_method_reference(method),
                },
            },
        }
    }

    pub fn rewrite_try_block(&self, try_block: &TryBlock) -> TryBlock {
        match &self.try_blocks {
            Some(f) => f(self, try_block),
            None => TryBlock {
                start_address: try_block.start_address,
                unit_count: try_block.unit_count,
                handlers: try_block
                    .handlers
                    .iter()
                    .map(|h| self.rewrite_exception_handler(h))
                    .collect(),
            },
        }
    }

    pub fn rewrite_exception_handler(&self, handler: &ExceptionHandler) -> ExceptionHandler {
        match &self.exception_handlers {
            Some(f) => f(self, handler),
            None => ExceptionHandler {
                exception_type: handler
                    .exception_type
                    .as_deref()
                    .map(|t| self.rewrite_type(t)),
                handler_address: handler.handler_address,
            },
        }
    }

    pub fn rewrite_debug_item(&self, item: &DebugItem) -> DebugItem {
        match &self.debug_items {
            Some(f) => f(self, item),
            None => match item {
                DebugItem::StartLocal {
                    address,
                    register,
                    name,
                    descriptor,
                } => DebugItem::StartLocal {
                    address: *address,
                    register: *register,
                    name: name.clone(),
                    descriptor: descriptor.as_deref().map(|d| self.rewrite_type(d)),
                },
                other => other.clone(),
            },
        }
    }

    pub fn rewrite_type(&self, descriptor: &str) -> String {
        match &self.types {
            Some(f) => f(self, &descriptor.to_string()),
            None => descriptor.to_string(),
        }
    }

    /// String references (`const-string` payloads and string constants), a
    /// category distinct from type descriptors.
    pub fn rewrite_string(&self, value: &str) -> String {
        match &self.strings {
            Some(f) => f(self, &value.to_string()),
            None => value.to_string(),
        }
    }

    pub fn rewrite_field_reference(&self, field: &FieldRefItem) -> FieldRefItem {
        match &self.field_references {
            Some(f) => f(self, field),
            None => FieldRefItem {
                class: self.rewrite_type(&field.class),
                name: field.name.clone(),
                descriptor: self.rewrite_type(&field.descriptor),
            },
        }
    }

    pub fn rewrite_method_reference(&self, method: &MethodRefItem) -> MethodRefItem {
        match &self.method_references {
            Some(f) => f(self, method),
            None => MethodRefItem {
                class: self.rewrite_type(&method.class),
                name: method.name.clone(),
                return_type: self.rewrite_type(&method.return_type),
                parameters: method
                    .parameters
                    .iter()
                    .map(|p| self.rewrite_type(p))
                    .collect(),
            },
        }
    }

    pub fn rewrite_proto(&self, proto: &ProtoItem) -> ProtoItem {
        ProtoItem {
            return_type: self.rewrite_type(&proto.return_type),
            parameters: proto.parameters.iter().map(|p| self.rewrite_type(p)).collect(),
        }
    }

    pub fn rewrite_method_handle(&self, handle: &MethodHandleItem) -> MethodHandleItem {
        match handle {
            MethodHandleItem::StaticPut(f) => {
                MethodHandleItem::StaticPut(self.rewrite_field_reference(f))
            }
            MethodHandleItem::StaticGet(f) => {
                MethodHandleItem::StaticGet(self.rewrite_field_reference(f))
            }
            MethodHandleItem::InstancePut(f) => {
                MethodHandleItem::InstancePut(self.rewrite_field_reference(f))
            }
            MethodHandleItem::InstanceGet(f) => {
                MethodHandleItem::InstanceGet(self.rewrite_field_reference(f))
            }
            MethodHandleItem::InvokeStatic(m) => {
                MethodHandleItem::InvokeStatic(self.rewrite_method_reference(m))
            }
            MethodHandleItem::InvokeInstance(m) => {
                MethodHandleItem::InvokeInstance(self.rewrite_method_reference(m))
            }
            MethodHandleItem::InvokeConstructor(m) => {
                MethodHandleItem::InvokeConstructor(self.rewrite_method_reference(m))
            }
            MethodHandleItem::InvokeDirect(m) => {
                MethodHandleItem::InvokeDirect(self.rewrite_method_reference(m))
            }
            MethodHandleItem::InvokeInterface(m) => {
                MethodHandleItem::InvokeInterface(self.rewrite_method_reference(m))
            }
        }
    }

    pub fn rewrite_call_site(&self, call_site: &CallSiteItem) -> CallSiteItem {
        CallSiteItem {
            name: call_site.name.clone(),
            payload: call_site.payload.iter().map(|v| self.rewrite_value(v)).collect(),
        }
    }

    pub fn rewrite_annotation(&self, annotation: &AnnotationItem) -> AnnotationItem {
        match &self.annotations {
            Some(f) => f(self, annotation),
            None => AnnotationItem {
                visibility: annotation.visibility,
                ty: self.rewrite_type(&annotation.ty),
                elements: annotation
                    .elements
                    .iter()
                    .map(|e| self.rewrite_annotation_element(e))
                    .collect(),
            },
        }
    }

    pub fn rewrite_annotation_element(&self, element: &AnnotationElement) -> AnnotationElement {
        match &self.annotation_elements {
            Some(f) => f(self, element),
            None => AnnotationElement {
                name: element.name.clone(),
                value: self.rewrite_value(&element.value),
            },
        }
    }

    pub fn rewrite_value(&self, value: &Value) -> Value {
        match &self.values {
            Some(f) => f(self, value),
            None => self.rewrite_value_structure(value),
        }
    }

    pub fn rewrite_value_structure(&self, value: &Value) -> Value {
        match value {
            Value::MethodType(proto) => Value::MethodType(self.rewrite_proto(proto)),
            Value::MethodHandle(handle) => {
                Value::MethodHandle(self.rewrite_method_handle(handle))
            }
            Value::String(s) => Value::String(self.rewrite_string(s)),
            Value::Type(t) => Value::Type(self.rewrite_type(t)),
            Value::Field(f) => Value::Field(self.rewrite_field_reference(f)),
            Value::Method(m) => Value::Method(self.rewrite_method_reference(m)),
            Value::Enum(f) => Value::Enum(self.rewrite_field_reference(f)),
            Value::Array(values) => {
                Value::Array(values.iter().map(|v| self.rewrite_value(v)).collect())
            }
            Value::Annotation { ty, elements } => Value::Annotation {
                ty: self.rewrite_type(ty),
                elements: elements
                    .iter()
                    .map(|e| self.rewrite_annotation_element(e))
                    .collect(),
            },
            other => other.clone(),
        }
    }
}

/// Lazily rewritten view over a base container.
pub struct RewrittenContainer<'a> {
    rewriter: &'a DexRewriter,
    base: Cow<'a, Container>,
}

impl RewrittenContainer<'_> {
    /// Rewritten classes, produced on demand.
    pub fn classes(&self) -> impl Iterator<Item = ClassItem> + '_ {
        self.base
            .classes
            .iter()
            .map(|c| self.rewriter.rewrite_class(c))
    }

    pub fn class_count(&self) -> usize {
        self.base.classes.len()
    }

    /// Materialize the whole rewritten container.
    pub fn into_container(self) -> Container {
        Container {
            classes: self.classes().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Visibility, ACC_PUBLIC, ACC_STATIC};

    fn sample_container() -> Container {
        Container {
            classes: vec![ClassItem {
                descriptor: "Lcom/example/Old;".to_string(),
                access_flags: ACC_PUBLIC,
                superclass: Some("Ljava/lang/Object;".to_string()),
                interfaces: vec!["Lcom/example/Iface;".to_string()],
                source_file: Some("Old.java".to_string()),
                annotations: vec![AnnotationItem {
                    visibility: Visibility::Runtime,
                    ty: "Lcom/example/Anno;".to_string(),
                    elements: vec![AnnotationElement {
                        name: "target".to_string(),
                        value: Value::Type("Lcom/example/Old;".to_string()),
                    }],
                }],
                fields: vec![FieldItem {
                    name: "self".to_string(),
                    descriptor: "Lcom/example/Old;".to_string(),
                    access_flags: ACC_PUBLIC,
                    initial_value: None,
                    annotations: vec![],
                }],
                methods: vec![MethodItem {
                    name: "run".to_string(),
                    return_type: "Lcom/example/Old;".to_string(),
                    parameters: vec![ParameterItem {
                        descriptor: "I".to_string(),
                        name: None,
                        annotations: vec![],
                    }],
                    access_flags: ACC_PUBLIC | ACC_STATIC,
                    annotations: vec![],
                    body: Some(MethodImplItem {
                        register_count: 2,
                        instructions: vec![
                            Instruction::ConstString {
                                register: 0,
                                value: "hello".to_string(),
                            },
                            Instruction::TypeOp {
                                opcode: 0x22,
                                register: 1,
                                descriptor: "Lcom/example/Old;".to_string(),
                            },
                            Instruction::Invoke {
                                opcode: 0x71,
                                registers: vec![0],
                                method: MethodRefItem {
                                    class: "Lcom/example/Old;".to_string(),
                                    name: "helper".to_string(),
                                    return_type: "V".to_string(),
                                    parameters: vec!["Lcom/example/Old;".to_string()],
                                },
                            },
                        ],
                        try_blocks: vec![TryBlock {
                            start_address: 0,
                            unit_count: 5,
                            handlers: vec![ExceptionHandler {
                                exception_type: Some("Lcom/example/Old;".to_string()),
                                handler_address: 5,
                            }],
                        }],
                        debug: vec![],
                    }),
                }],
            }],
        }
    }

    #[test]
    fn test_identity_rewrite_is_structural_noop() {
        let container = sample_container();
        let rewriter = DexRewriter::builder().build();
        assert_eq!(rewriter.rewrite(&container), container);
    }

    #[test]
    fn test_type_rename_reaches_every_position() {
        let container = sample_container();
        let rewriter = DexRewriter::builder()
            .rewrite_types(|_, ty| ty.replace("Lcom/example/Old;", "Lcom/example/New;"))
            .build();
        let rewritten = rewriter.rewrite(&container);

        let class = &rewritten.classes[0];
        assert_eq!(class.descriptor, "Lcom/example/New;");
        assert_eq!(class.fields[0].descriptor, "Lcom/example/New;");
        assert_eq!(class.methods[0].return_type, "Lcom/example/New;");
        assert_eq!(
            class.annotations[0].elements[0].value,
            Value::Type("Lcom/example/New;".to_string())
        );
        let body = class.methods[0].body.as_ref().unwrap();
        assert!(matches!(
            &body.instructions[1],
            Instruction::TypeOp { descriptor, .. } if descriptor == "Lcom/example/New;"
        ));
        assert!(matches!(
            &body.instructions[2],
            Instruction::Invoke { method, .. }
                if method.class == "Lcom/example/New;"
                    && method.parameters == ["Lcom/example/New;"]
        ));
        assert_eq!(
            body.try_blocks[0].handlers[0].exception_type.as_deref(),
            Some("Lcom/example/New;")
        );
        // Plain strings are a separate category and stay put.
        assert!(matches!(
            &body.instructions[0],
            Instruction::ConstString { value, .. } if value == "hello"
        ));
    }

    #[test]
    fn test_string_rewrite_only_touches_string_references() {
        let container = sample_container();
        let rewriter = DexRewriter::builder()
            .rewrite_strings(|_, s| s.to_uppercase())
            .build();
        let rewritten = rewriter.rewrite(&container);
        let body = rewritten.classes[0].methods[0].body.as_ref().unwrap();
        assert!(matches!(
            &body.instructions[0],
            Instruction::ConstString { value, .. } if value == "HELLO"
        ));
        // Type descriptors are untouched.
        assert_eq!(rewritten.classes[0].descriptor, "Lcom/example/Old;");
    }

    #[test]
    fn test_override_can_delegate_to_structure() {
        let container = sample_container();
        let rewriter = DexRewriter::builder()
            .rewrite_classes(|rw, class| {
                let mut class = rw.rewrite_class_structure(class);
                class.source_file = None;
                class
            })
            .rewrite_types(|_, ty| ty.replace("Old", "New"))
            .build();
        let rewritten = rewriter.rewrite(&container);
        // The override dropped the source file while the nested type
        // category still ran.
        assert_eq!(rewritten.classes[0].source_file, None);
        assert_eq!(rewritten.classes[0].descriptor, "Lcom/example/New;");
    }

    #[test]
    fn test_lazy_view_materializes_on_demand() {
        let container = sample_container();
        let rewriter = DexRewriter::builder()
            .rewrite_types(|_, ty| ty.replace("Old", "New"))
            .build();
        let view = rewriter.rewritten(&container);
        assert_eq!(view.class_count(), 1);
        let classes: Vec<ClassItem> = view.classes().collect();
        assert_eq!(classes[0].descriptor, "Lcom/example/New;");
        // The base is untouched.
        assert_eq!(container.classes[0].descriptor, "Lcom/example/Old;");
        let materialized = view.into_container();
        assert_eq!(materialized.classes, classes);
    }

    #[test]
    fn test_container_override_controls_class_set() {
        let mut container = sample_container();
        let mut second = container.classes[0].clone();
        second.descriptor = "Lcom/example/Other;".to_string();
        container.classes.push(second);

        let rewriter = DexRewriter::builder()
            .rewrite_containers(|rw, container| Container {
                classes: container
                    .classes
                    .iter()
                    .filter(|c| c.descriptor != "Lcom/example/Other;")
                    .map(|c| rw.rewrite_class(c))
                    .collect(),
            })
            .build();
        let rewritten = rewriter.rewrite(&container);
        assert_eq!(rewritten.classes.len(), 1);
        assert_eq!(rewritten.classes[0].descriptor, "Lcom/example/Old;");
    }

    #[test]
    fn test_method_handle_and_call_site_rewrite() {
        let rewriter = DexRewriter::builder()
            .rewrite_types(|_, ty| ty.replace("Old", "New"))
            .build();
        let site = CallSiteItem {
            name: "cs0".to_string(),
            payload: vec![
                Value::MethodHandle(MethodHandleItem::InvokeStatic(MethodRefItem {
                    class: "LOld;".to_string(),
                    name: "bootstrap".to_string(),
                    return_type: "V".to_string(),
                    parameters: vec![],
                })),
                Value::String("target".to_string()),
                Value::MethodType(ProtoItem {
                    return_type: "LOld;".to_string(),
                    parameters: vec![],
                }),
            ],
        };
        let rewritten = rewriter.rewrite_call_site(&site);
        assert_eq!(rewritten.method_handle().method_ref().unwrap().class, "LNew;");
        assert_eq!(rewritten.method_proto().return_type, "LNew;");
        assert_eq!(rewritten.method_name(), "target");
    }
}
