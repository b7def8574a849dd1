//! Builder context: one interning pool per structural category plus the
//! class-definition registry.
//!
//! A `DexBuilder` owns every canonical item created during one construction
//! session. All methods take `&self`, so parallel producer tasks (typically
//! one per declaration unit) can feed a shared builder directly; the only
//! cross-task contention is inside the pools. Once every producer has
//! finished, [`DexBuilder::write_to`] runs layout and serialization.

use crate::encoding::{cmp_utf16, cmp_utf16_seq};
use crate::error::{DexError, Result};
use crate::model::{
    AnnotationItem, CallSiteItem, ClassItem, FieldItem, FieldRefItem, MethodHandleItem,
    MethodImplItem, MethodItem, MethodRefItem, ProtoItem, Value, ACC_STATIC,
};
use crate::pool::{InternPool, NO_INDEX, NO_OFFSET};
use crate::sink::{DataSink, FileSink};
use crate::writer::DexWriter;
use ahash::RandomState;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

macro_rules! handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub(crate) u32);

            impl $name {
                pub fn raw(self) -> u32 {
                    self.0
                }
            }
        )*
    };
}

handles! {
    /// Canonical string handle.
    StringId,
    /// Canonical type-descriptor handle.
    TypeId,
    /// Canonical method-prototype handle.
    ProtoId,
    /// Canonical field-reference handle.
    FieldId,
    /// Canonical method-reference handle.
    MethodId,
    /// Canonical method-handle-constant handle.
    MethodHandleId,
    /// Canonical call-site handle.
    CallSiteId,
    /// Canonical type-list handle.
    TypeListId,
    /// Canonical annotation handle.
    AnnotationId,
    /// Canonical annotation-set handle.
    AnnotationSetId,
    /// Canonical encoded-array handle.
    ArrayId,
}

impl TypeListId {
    /// The shared empty type list. It owns no pool entry and no serialized
    /// record; its nullable offset is the no-offset sentinel.
    pub const EMPTY: TypeListId = TypeListId(NO_INDEX);

    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }
}

impl AnnotationSetId {
    /// The shared empty annotation set.
    pub const EMPTY: AnnotationSetId = AnnotationSetId(NO_INDEX);

    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }
}

/// A field as placed in a class definition: the canonical reference plus the
/// per-declaration metadata. Ordered by the reference.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub key: FieldRefItem,
    pub id: FieldId,
    pub access_flags: u32,
    pub annotations: AnnotationSetId,
}

impl PartialEq for FieldDef {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for FieldDef {}

impl PartialOrd for FieldDef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldDef {
    // Collates the way the serialized field_ids section does: UTF-16 code
    // units, not Rust code points. The two diverge for supplementary-plane
    // characters, and static initializer values are paired with fields by
    // position, so class-local order here must match the emitted order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        cmp_utf16(&self.key.class, &other.key.class)
            .then_with(|| cmp_utf16(&self.key.name, &other.key.name))
            .then_with(|| cmp_utf16(&self.key.descriptor, &other.key.descriptor))
    }
}

impl FieldDef {
    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

/// A method as placed in a class definition. Ordered by the reference.
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub key: MethodRefItem,
    pub id: MethodId,
    pub access_flags: u32,
    pub annotations: AnnotationSetId,
    pub body: Option<MethodImplItem>,
}

impl PartialEq for MethodDef {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for MethodDef {}

impl PartialOrd for MethodDef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MethodDef {
    // UTF-16 collation, same reasoning as `FieldDef`.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        cmp_utf16(&self.key.class, &other.key.class)
            .then_with(|| cmp_utf16(&self.key.name, &other.key.name))
            .then_with(|| cmp_utf16(&self.key.return_type, &other.key.return_type))
            .then_with(|| cmp_utf16_seq(&self.key.parameters, &other.key.parameters))
    }
}

/// A fully interned class definition: the aggregate root registered against
/// the builder. Members are partitioned once at construction into four
/// immutable, strictly ordered sets.
#[derive(Debug)]
pub struct ClassDef {
    pub descriptor: String,
    pub ty: TypeId,
    pub access_flags: u32,
    pub superclass: Option<TypeId>,
    pub interfaces: TypeListId,
    pub source_file: Option<StringId>,
    pub annotations: AnnotationSetId,
    pub static_fields: BTreeSet<FieldDef>,
    pub instance_fields: BTreeSet<FieldDef>,
    pub direct_methods: BTreeSet<MethodDef>,
    pub virtual_methods: BTreeSet<MethodDef>,
    pub static_values: Option<ArrayId>,
}

impl ClassDef {
    /// Build from pre-partitioned member sets.
    ///
    /// Panics if a member's declared staticness or dispatch contradicts the
    /// partition it was placed in; that is a caller contract violation, not
    /// a recoverable condition.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        descriptor: String,
        ty: TypeId,
        access_flags: u32,
        superclass: Option<TypeId>,
        interfaces: TypeListId,
        source_file: Option<StringId>,
        annotations: AnnotationSetId,
        static_fields: BTreeSet<FieldDef>,
        instance_fields: BTreeSet<FieldDef>,
        direct_methods: BTreeSet<MethodDef>,
        virtual_methods: BTreeSet<MethodDef>,
        static_values: Option<ArrayId>,
    ) -> ClassDef {
        for field in &static_fields {
            assert!(
                field.is_static(),
                "field {} placed in static partition without ACC_STATIC",
                field.key.name
            );
        }
        for field in &instance_fields {
            assert!(
                !field.is_static(),
                "field {} placed in instance partition with ACC_STATIC",
                field.key.name
            );
        }
        ClassDef {
            descriptor,
            ty,
            access_flags,
            superclass,
            interfaces,
            source_file,
            annotations,
            static_fields,
            instance_fields,
            direct_methods,
            virtual_methods,
            static_values,
        }
    }

    /// All fields, statics first, each partition in its own order. The view
    /// is a lazy chain over the two sorted sets, never a stored collection.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.static_fields.iter().chain(self.instance_fields.iter())
    }

    /// All methods, direct first, each partition in its own order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    pub fn field_count(&self) -> usize {
        self.static_fields.len() + self.instance_fields.len()
    }

    pub fn method_count(&self) -> usize {
        self.direct_methods.len() + self.virtual_methods.len()
    }
}

/// Pool population counters, mainly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuilderStats {
    pub strings: usize,
    pub types: usize,
    pub protos: usize,
    pub field_refs: usize,
    pub method_refs: usize,
    pub method_handles: usize,
    pub call_sites: usize,
    pub type_lists: usize,
    pub annotations: usize,
    pub annotation_sets: usize,
    pub arrays: usize,
    pub classes: usize,
}

/// The top-level builder context for one construction session.
pub struct DexBuilder {
    pub(crate) strings: InternPool<String>,
    pub(crate) types: InternPool<String>,
    pub(crate) protos: InternPool<ProtoItem>,
    pub(crate) field_refs: InternPool<FieldRefItem>,
    pub(crate) method_refs: InternPool<MethodRefItem>,
    pub(crate) method_handles: InternPool<MethodHandleItem>,
    pub(crate) call_sites: InternPool<CallSiteItem>,
    pub(crate) type_lists: InternPool<Vec<TypeId>>,
    pub(crate) annotations: InternPool<AnnotationItem>,
    pub(crate) annotation_sets: InternPool<Vec<AnnotationId>>,
    pub(crate) arrays: InternPool<Vec<Value>>,
    pub(crate) classes: DashMap<String, Arc<ClassDef>, RandomState>,
}

impl DexBuilder {
    pub fn new() -> Self {
        DexBuilder {
            strings: InternPool::new(),
            types: InternPool::new(),
            protos: InternPool::new(),
            field_refs: InternPool::new(),
            method_refs: InternPool::new(),
            method_handles: InternPool::new(),
            call_sites: InternPool::new(),
            type_lists: InternPool::new(),
            annotations: InternPool::new(),
            annotation_sets: InternPool::new(),
            arrays: InternPool::new(),
            classes: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn intern_string(&self, value: &str) -> StringId {
        StringId(self.strings.intern(value.to_string()))
    }

    pub fn intern_type(&self, descriptor: &str) -> TypeId {
        self.intern_string(descriptor);
        TypeId(self.types.intern(descriptor.to_string()))
    }

    /// Intern a type list; empty and absent lists share one empty singleton
    /// that never allocates a pool entry.
    pub fn intern_type_list(&self, descriptors: &[String]) -> TypeListId {
        if descriptors.is_empty() {
            return TypeListId::EMPTY;
        }
        let types: Vec<TypeId> = descriptors.iter().map(|d| self.intern_type(d)).collect();
        TypeListId(self.type_lists.intern(types))
    }

    pub fn intern_proto(&self, proto: &ProtoItem) -> ProtoId {
        self.intern_string(&proto.shorty());
        self.intern_type(&proto.return_type);
        self.intern_type_list(&proto.parameters);
        ProtoId(self.protos.intern(proto.clone()))
    }

    pub fn intern_field_ref(&self, field: &FieldRefItem) -> FieldId {
        self.intern_type(&field.class);
        self.intern_string(&field.name);
        self.intern_type(&field.descriptor);
        FieldId(self.field_refs.intern(field.clone()))
    }

    pub fn intern_method_ref(&self, method: &MethodRefItem) -> MethodId {
        self.intern_type(&method.class);
        self.intern_string(&method.name);
        self.intern_proto(&method.proto());
        MethodId(self.method_refs.intern(method.clone()))
    }

    pub fn intern_method_handle(&self, handle: &MethodHandleItem) -> MethodHandleId {
        if let Some(field) = handle.field_ref() {
            self.intern_field_ref(field);
        }
        if let Some(method) = handle.method_ref() {
            self.intern_method_ref(method);
        }
        MethodHandleId(self.method_handles.intern(handle.clone()))
    }

    pub fn intern_call_site(&self, call_site: &CallSiteItem) -> CallSiteId {
        self.intern_array(&call_site.payload);
        CallSiteId(self.call_sites.intern(call_site.clone()))
    }

    pub fn intern_array(&self, values: &[Value]) -> ArrayId {
        for value in values {
            self.intern_value(value);
        }
        ArrayId(self.arrays.intern(values.to_vec()))
    }

    /// Intern an annotation in canonical form (elements sorted by name).
    pub fn intern_annotation(&self, annotation: &AnnotationItem) -> AnnotationId {
        let mut canonical = annotation.clone();
        canonical.elements.sort_by(|a, b| cmp_utf16(&a.name, &b.name));
        self.intern_type(&canonical.ty);
        for element in &canonical.elements {
            self.intern_string(&element.name);
            self.intern_value(&element.value);
        }
        AnnotationId(self.annotations.intern(canonical))
    }

    /// Intern a set of annotations; empty and absent sets share one empty
    /// singleton.
    pub fn intern_annotation_set(&self, annotations: &[AnnotationItem]) -> AnnotationSetId {
        if annotations.is_empty() {
            return AnnotationSetId::EMPTY;
        }
        let mut ids: Vec<AnnotationId> = annotations
            .iter()
            .map(|a| self.intern_annotation(a))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        AnnotationSetId(self.annotation_sets.intern(ids))
    }

    /// Register the references nested in a constant value.
    fn intern_value(&self, value: &Value) {
        match value {
            Value::MethodType(proto) => {
                self.intern_proto(proto);
            }
            Value::MethodHandle(handle) => {
                self.intern_method_handle(handle);
            }
            Value::String(s) => {
                self.intern_string(s);
            }
            Value::Type(t) => {
                self.intern_type(t);
            }
            Value::Field(f) | Value::Enum(f) => {
                self.intern_field_ref(f);
            }
            Value::Method(m) => {
                self.intern_method_ref(m);
            }
            Value::Array(values) => {
                for nested in values {
                    self.intern_value(nested);
                }
            }
            Value::Annotation { ty, elements } => {
                self.intern_type(ty);
                for element in elements {
                    self.intern_string(&element.name);
                    self.intern_value(&element.value);
                }
            }
            _ => {}
        }
    }

    /// Register a class declaration, interning every structural value it
    /// references. Fields partition static/instance by `ACC_STATIC`, methods
    /// direct/virtual by the direct-method predicate; both partitions happen
    /// here, once, and the resulting sets are immutable.
    pub fn add_class(&self, class: &ClassItem) -> Result<()> {
        let ty = self.intern_type(&class.descriptor);
        let superclass = class.superclass.as_deref().map(|s| self.intern_type(s));
        let interfaces = self.intern_type_list(&class.interfaces);
        let source_file = class.source_file.as_deref().map(|s| self.intern_string(s));
        let annotations = self.intern_annotation_set(&class.annotations);

        let mut static_fields = BTreeSet::new();
        let mut instance_fields = BTreeSet::new();
        let mut static_values = Vec::new();
        for field in &class.fields {
            let def = self.intern_field(&class.descriptor, field);
            assert!(
                !static_fields.contains(&def) && !instance_fields.contains(&def),
                "field {} declared twice in class {}",
                field.name,
                class.descriptor
            );
            if field.is_static() {
                if let Some(value) = &field.initial_value {
                    self.intern_value(value);
                }
                static_fields.insert(def);
            } else {
                assert!(
                    field.initial_value.is_none(),
                    "instance field {} carries a static initializer",
                    field.name
                );
                instance_fields.insert(def);
            }
        }
        // Static values are emitted in static field order, trailing defaults
        // trimmed.
        for def in &static_fields {
            let item = class
                .fields
                .iter()
                .find(|f| f.is_static() && f.name == def.key.name && f.descriptor == def.key.descriptor)
                .expect("partitioned field originates from the declaration");
            static_values.push(
                item.initial_value
                    .clone()
                    .unwrap_or_else(|| default_value(&item.descriptor)),
            );
        }
        while static_values.last().is_some_and(Value::is_default) {
            static_values.pop();
        }
        let static_values = if static_values.is_empty() {
            None
        } else {
            Some(self.intern_array(&static_values))
        };

        let mut direct_methods = BTreeSet::new();
        let mut virtual_methods = BTreeSet::new();
        for method in &class.methods {
            let def = self.intern_method(&class.descriptor, method);
            assert!(
                !direct_methods.contains(&def) && !virtual_methods.contains(&def),
                "method {} declared twice in class {}",
                method.name,
                class.descriptor
            );
            if method.is_direct() {
                direct_methods.insert(def);
            } else {
                virtual_methods.insert(def);
            }
        }

        let def = ClassDef::new(
            class.descriptor.clone(),
            ty,
            class.access_flags,
            superclass,
            interfaces,
            source_file,
            annotations,
            static_fields,
            instance_fields,
            direct_methods,
            virtual_methods,
            static_values,
        );

        match self.classes.entry(class.descriptor.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(DexError::DuplicateClass(class.descriptor.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                debug!(
                    class = %class.descriptor,
                    fields = def.field_count(),
                    methods = def.method_count(),
                    "registered class"
                );
                entry.insert(Arc::new(def));
                Ok(())
            }
        }
    }

    fn intern_field(&self, class_descriptor: &str, field: &FieldItem) -> FieldDef {
        let key = FieldRefItem {
            class: class_descriptor.to_string(),
            name: field.name.clone(),
            descriptor: field.descriptor.clone(),
        };
        let id = self.intern_field_ref(&key);
        FieldDef {
            key,
            id,
            access_flags: field.access_flags,
            annotations: self.intern_annotation_set(&field.annotations),
        }
    }

    fn intern_method(&self, class_descriptor: &str, method: &MethodItem) -> MethodDef {
        let key = MethodRefItem {
            class: class_descriptor.to_string(),
            name: method.name.clone(),
            return_type: method.return_type.clone(),
            parameters: method.parameter_types(),
        };
        let id = self.intern_method_ref(&key);
        if let Some(body) = &method.body {
            self.intern_body(body);
        }
        MethodDef {
            key,
            id,
            access_flags: method.access_flags,
            annotations: self.intern_annotation_set(&method.annotations),
            body: method.body.clone(),
        }
    }

    fn intern_body(&self, body: &MethodImplItem) {
        use crate::model::Instruction;
        for instruction in &body.instructions {
            match instruction {
                Instruction::ConstString { value, .. } => {
                    self.intern_string(value);
                }
                Instruction::TypeOp { descriptor, .. } => {
                    self.intern_type(descriptor);
                }
                Instruction::FieldOp { field, .. } => {
                    self.intern_field_ref(field);
                }
                Instruction::Invoke { method, .. } => {
                    self.intern_method_ref(method);
                }
                Instruction::Plain { .. } => {}
            }
        }
        for try_block in &body.try_blocks {
            for handler in &try_block.handlers {
                if let Some(exception_type) = &handler.exception_type {
                    self.intern_type(exception_type);
                }
            }
        }
    }

    pub fn class(&self, descriptor: &str) -> Option<Arc<ClassDef>> {
        self.classes.get(descriptor).map(|entry| entry.value().clone())
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn stats(&self) -> BuilderStats {
        BuilderStats {
            strings: self.strings.len(),
            types: self.types.len(),
            protos: self.protos.len(),
            field_refs: self.field_refs.len(),
            method_refs: self.method_refs.len(),
            method_handles: self.method_handles.len(),
            call_sites: self.call_sites.len(),
            type_lists: self.type_lists.len(),
            annotations: self.annotations.len(),
            annotation_sets: self.annotation_sets.len(),
            arrays: self.arrays.len(),
            classes: self.classes.len(),
        }
    }

    /// Serialized offset of a string's data record. Valid after layout.
    pub fn string_offset(&self, id: StringId) -> u32 {
        self.strings.offset(id.0)
    }

    /// Serialized offset of a type list, or the no-offset sentinel for the
    /// empty singleton (no layout required for the sentinel case).
    pub fn type_list_offset(&self, id: TypeListId) -> u32 {
        if id.is_empty() {
            NO_OFFSET
        } else {
            self.type_lists.offset(id.0)
        }
    }

    /// Serialized offset of an annotation set, or the no-offset sentinel for
    /// the empty singleton.
    pub fn annotation_set_offset(&self, id: AnnotationSetId) -> u32 {
        if id.is_empty() {
            NO_OFFSET
        } else {
            self.annotation_sets.offset(id.0)
        }
    }

    /// Serialized offset of an encoded array. Valid after layout.
    pub fn array_offset(&self, id: ArrayId) -> u32 {
        self.arrays.offset(id.0)
    }

    /// Run the layout and write engine end to end, leaving `sink` holding a
    /// complete image. Requires all producer tasks to have finished.
    pub fn write_to<S: DataSink>(&self, sink: &mut S) -> Result<()> {
        DexWriter::new(self).write_to(sink)
    }

    /// Convenience overload targeting a filesystem path.
    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut sink = FileSink::create(path)?;
        self.write_to(&mut sink)?;
        sink.sync()?;
        Ok(())
    }
}

impl Default for DexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Zero/null constant for a field of the given type, used to fill holes in
/// static initializer arrays.
fn default_value(descriptor: &str) -> Value {
    match descriptor.as_bytes().first() {
        Some(b'Z') => Value::Boolean(false),
        Some(b'B') => Value::Byte(0),
        Some(b'S') => Value::Short(0),
        Some(b'C') => Value::Char(0),
        Some(b'I') => Value::Int(0),
        Some(b'J') => Value::Long(0),
        Some(b'F') => Value::Float(0.0),
        Some(b'D') => Value::Double(0.0),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ACC_PUBLIC, ACC_STATIC};

    fn field(name: &str, descriptor: &str, access_flags: u32) -> FieldItem {
        FieldItem {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags,
            initial_value: None,
            annotations: vec![],
        }
    }

    fn method(name: &str, access_flags: u32) -> MethodItem {
        MethodItem {
            name: name.to_string(),
            return_type: "V".to_string(),
            parameters: vec![],
            access_flags,
            annotations: vec![],
            body: None,
        }
    }

    fn simple_class(descriptor: &str) -> ClassItem {
        ClassItem {
            descriptor: descriptor.to_string(),
            access_flags: ACC_PUBLIC,
            superclass: Some("Ljava/lang/Object;".to_string()),
            interfaces: vec![],
            source_file: None,
            annotations: vec![],
            fields: vec![],
            methods: vec![],
        }
    }

    #[test]
    fn test_intern_type_registers_string() {
        let builder = DexBuilder::new();
        let a = builder.intern_type("LA;");
        let b = builder.intern_type("LA;");
        assert_eq!(a, b);
        assert_eq!(builder.stats().types, 1);
        assert_eq!(builder.stats().strings, 1);
    }

    #[test]
    fn test_empty_type_list_is_shared_singleton() {
        let builder = DexBuilder::new();
        let a = builder.intern_type_list(&[]);
        let b = builder.intern_type_list(&[]);
        assert_eq!(a, TypeListId::EMPTY);
        assert_eq!(a, b);
        // No pool entry and no layout needed for its offset.
        assert_eq!(builder.stats().type_lists, 0);
        assert_eq!(builder.type_list_offset(a), NO_OFFSET);
    }

    #[test]
    fn test_type_list_interns_elements() {
        let builder = DexBuilder::new();
        let list = builder.intern_type_list(&["LA;".to_string(), "LB;".to_string()]);
        assert_ne!(list, TypeListId::EMPTY);
        assert_eq!(builder.stats().types, 2);
        let again = builder.intern_type_list(&["LA;".to_string(), "LB;".to_string()]);
        assert_eq!(list, again);
        assert_eq!(builder.stats().type_lists, 1);
    }

    #[test]
    fn test_annotation_elements_canonicalized_by_name() {
        let builder = DexBuilder::new();
        let forward = AnnotationItem {
            visibility: crate::model::Visibility::Runtime,
            ty: "LAnno;".to_string(),
            elements: vec![
                crate::model::AnnotationElement {
                    name: "a".to_string(),
                    value: Value::Int(1),
                },
                crate::model::AnnotationElement {
                    name: "b".to_string(),
                    value: Value::Int(2),
                },
            ],
        };
        let mut reversed = forward.clone();
        reversed.elements.reverse();
        assert_eq!(
            builder.intern_annotation(&forward),
            builder.intern_annotation(&reversed)
        );
        assert_eq!(builder.stats().annotations, 1);
    }

    #[test]
    fn test_duplicate_class_is_recoverable_error() {
        let builder = DexBuilder::new();
        builder.add_class(&simple_class("LA;")).unwrap();
        let err = builder.add_class(&simple_class("LA;")).unwrap_err();
        assert!(matches!(err, DexError::DuplicateClass(_)));
        // The first registration is untouched.
        assert_eq!(builder.class_count(), 1);
        assert!(builder.class("LA;").is_some());
    }

    #[test]
    fn test_member_partitioning_and_merged_views() {
        let builder = DexBuilder::new();
        let mut class = simple_class("LC;");
        class.fields = vec![
            field("beta", "I", ACC_STATIC),
            field("alpha", "I", ACC_STATIC),
            field("gamma", "I", ACC_PUBLIC),
        ];
        class.methods = vec![
            method("c", ACC_STATIC),
            method("a", ACC_STATIC),
            method("b", ACC_STATIC | ACC_PUBLIC),
            method("z", ACC_PUBLIC),
        ];
        builder.add_class(&class).unwrap();
        let def = builder.class("LC;").unwrap();

        assert_eq!(def.static_fields.len(), 2);
        assert_eq!(def.instance_fields.len(), 1);
        assert_eq!(def.direct_methods.len(), 3);
        assert_eq!(def.virtual_methods.len(), 1);

        // Merged views: statics/directs first, then each partition's own
        // sorted order.
        let field_names: Vec<&str> = def.fields().map(|f| f.key.name.as_str()).collect();
        assert_eq!(field_names, ["alpha", "beta", "gamma"]);
        let method_names: Vec<&str> = def.methods().map(|m| m.key.name.as_str()).collect();
        assert_eq!(method_names, ["a", "b", "c", "z"]);
    }

    #[test]
    #[should_panic(expected = "static partition")]
    fn test_inconsistent_partition_panics() {
        let mut statics = BTreeSet::new();
        statics.insert(FieldDef {
            key: FieldRefItem {
                class: "LC;".to_string(),
                name: "f".to_string(),
                descriptor: "I".to_string(),
            },
            id: FieldId(0),
            access_flags: ACC_PUBLIC, // not static
            annotations: AnnotationSetId::EMPTY,
        });
        ClassDef::new(
            "LC;".to_string(),
            TypeId(0),
            ACC_PUBLIC,
            None,
            TypeListId::EMPTY,
            None,
            AnnotationSetId::EMPTY,
            statics,
            BTreeSet::new(),
            BTreeSet::new(),
            BTreeSet::new(),
            None,
        );
    }

    #[test]
    fn test_static_values_trim_trailing_defaults() {
        let builder = DexBuilder::new();
        let mut class = simple_class("LS;");
        class.fields = vec![
            FieldItem {
                initial_value: Some(Value::Int(7)),
                ..field("a", "I", ACC_STATIC)
            },
            FieldItem {
                initial_value: Some(Value::Int(0)),
                ..field("b", "I", ACC_STATIC)
            },
        ];
        builder.add_class(&class).unwrap();
        let def = builder.class("LS;").unwrap();
        let array_id = def.static_values.expect("non-default value present");
        assert_eq!(builder.arrays.get(array_id.0), vec![Value::Int(7)]);
    }

    #[test]
    fn test_static_values_follow_utf16_field_collation() {
        // U+FFFD precedes U+10400 in code-point order, but U+10400 encodes
        // to a surrogate pair starting at 0xD801, which sorts first in
        // UTF-16 units. The initializer array must pair up with the fields
        // as they are emitted, not as Rust string order would place them.
        let builder = DexBuilder::new();
        let mut class = simple_class("LS;");
        class.fields = vec![
            FieldItem {
                initial_value: Some(Value::Int(2)),
                ..field("\u{fffd}", "I", ACC_STATIC)
            },
            FieldItem {
                initial_value: Some(Value::Int(1)),
                ..field("\u{10400}", "I", ACC_STATIC)
            },
        ];
        builder.add_class(&class).unwrap();
        let def = builder.class("LS;").unwrap();
        let field_names: Vec<&str> = def.fields().map(|f| f.key.name.as_str()).collect();
        assert_eq!(field_names, ["\u{10400}", "\u{fffd}"]);
        let array_id = def.static_values.expect("initializers present");
        assert_eq!(
            builder.arrays.get(array_id.0),
            vec![Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn test_annotation_elements_sorted_by_utf16_units() {
        let builder = DexBuilder::new();
        let id = builder.intern_annotation(&AnnotationItem {
            visibility: crate::model::Visibility::Runtime,
            ty: "LAnno;".to_string(),
            elements: vec![
                crate::model::AnnotationElement {
                    name: "\u{fffd}".to_string(),
                    value: Value::Int(2),
                },
                crate::model::AnnotationElement {
                    name: "\u{10400}".to_string(),
                    value: Value::Int(1),
                },
            ],
        });
        let canonical = builder.annotations.get(id.0);
        let names: Vec<&str> = canonical.elements.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["\u{10400}", "\u{fffd}"]);
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn test_duplicate_field_declaration_panics() {
        let builder = DexBuilder::new();
        let mut class = simple_class("LD;");
        class.fields = vec![field("f", "I", ACC_STATIC), field("f", "I", ACC_STATIC)];
        let _ = builder.add_class(&class);
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn test_duplicate_method_declaration_panics() {
        let builder = DexBuilder::new();
        let mut class = simple_class("LD;");
        // Same name and prototype in both partitions still names one method.
        class.methods = vec![method("m", ACC_STATIC), method("m", ACC_PUBLIC)];
        let _ = builder.add_class(&class);
    }

    #[test]
    fn test_all_default_static_values_elided() {
        let builder = DexBuilder::new();
        let mut class = simple_class("LS;");
        class.fields = vec![FieldItem {
            initial_value: Some(Value::Int(0)),
            ..field("a", "I", ACC_STATIC)
        }];
        builder.add_class(&class).unwrap();
        assert!(builder.class("LS;").unwrap().static_values.is_none());
    }

    #[test]
    fn test_call_site_interns_payload() {
        let builder = DexBuilder::new();
        let site = CallSiteItem {
            name: "cs0".to_string(),
            payload: vec![
                Value::MethodHandle(MethodHandleItem::InvokeStatic(MethodRefItem {
                    class: "LBootstrap;".to_string(),
                    name: "bootstrap".to_string(),
                    return_type: "V".to_string(),
                    parameters: vec![],
                })),
                Value::String("target".to_string()),
                Value::MethodType(ProtoItem {
                    return_type: "V".to_string(),
                    parameters: vec![],
                }),
            ],
        };
        let a = builder.intern_call_site(&site);
        let b = builder.intern_call_site(&site);
        assert_eq!(a, b);
        assert_eq!(builder.stats().call_sites, 1);
        assert_eq!(builder.stats().method_handles, 1);
        assert_eq!(builder.stats().arrays, 1);
    }
}
