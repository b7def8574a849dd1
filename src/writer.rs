//! Layout and write engine.
//!
//! Walks every pool in the fixed section order the container format
//! mandates, assigns each canonical item its final byte offset, and emits
//! the fixed-format records referencing those offsets. Runs strictly after
//! the producing phase has joined: offset assignment needs a closed, fully
//! populated set of canonical items.
//!
//! Id sections are sorted into the format's collation before indices are
//! assigned, so re-serializing an unmodified builder graph reproduces a
//! byte-identical image regardless of intern order.

use crate::builder::{ClassDef, DexBuilder, FieldDef, MethodDef};
use crate::encoding::{cmp_utf16, mutf8, utf16_len, write_sleb128, write_uleb128};
use crate::error::{DexError, Result};
use crate::model::{
    type_width, AnnotationElement, CallSiteItem, FieldRefItem, Instruction, MethodHandleItem,
    MethodImplItem, MethodRefItem, ProtoItem, TryBlock, Value, ACC_STATIC,
};
use crate::pool::{InternPool, NO_INDEX, NO_OFFSET};
use crate::sink::DataSink;
use std::cmp::Ordering;
use std::hash::Hash;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, trace};

/// Magic for the emitted format version.
pub const MAGIC: [u8; 8] = *b"dex\n039\0";

pub const HEADER_SIZE: u32 = 0x70;
const ENDIAN_TAG: u32 = 0x1234_5678;

const TYPE_HEADER_ITEM: u16 = 0x0000;
const TYPE_STRING_ID_ITEM: u16 = 0x0001;
const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
const TYPE_FIELD_ID_ITEM: u16 = 0x0004;
const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
const TYPE_CALL_SITE_ID_ITEM: u16 = 0x0007;
const TYPE_METHOD_HANDLE_ITEM: u16 = 0x0008;
const TYPE_MAP_LIST: u16 = 0x1000;
const TYPE_TYPE_LIST: u16 = 0x1001;
const TYPE_ANNOTATION_SET_ITEM: u16 = 0x1003;
const TYPE_CLASS_DATA_ITEM: u16 = 0x2000;
const TYPE_CODE_ITEM: u16 = 0x2001;
const TYPE_STRING_DATA_ITEM: u16 = 0x2002;
const TYPE_ANNOTATION_ITEM: u16 = 0x2004;
const TYPE_ENCODED_ARRAY_ITEM: u16 = 0x2005;
const TYPE_ANNOTATIONS_DIRECTORY_ITEM: u16 = 0x2006;

// Encoded value type tags.
const VALUE_BYTE: u8 = 0x00;
const VALUE_SHORT: u8 = 0x02;
const VALUE_CHAR: u8 = 0x03;
const VALUE_INT: u8 = 0x04;
const VALUE_LONG: u8 = 0x06;
const VALUE_FLOAT: u8 = 0x10;
const VALUE_DOUBLE: u8 = 0x11;
const VALUE_METHOD_TYPE: u8 = 0x15;
const VALUE_METHOD_HANDLE: u8 = 0x16;
const VALUE_STRING: u8 = 0x17;
const VALUE_TYPE: u8 = 0x18;
const VALUE_FIELD: u8 = 0x19;
const VALUE_METHOD: u8 = 0x1a;
const VALUE_ENUM: u8 = 0x1b;
const VALUE_ARRAY: u8 = 0x1c;
const VALUE_ANNOTATION: u8 = 0x1d;
const VALUE_NULL: u8 = 0x1e;
const VALUE_BOOLEAN: u8 = 0x1f;

const OP_CONST_STRING: u16 = 0x1a;

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Pad `data` so that `base + data.len()` is 4-byte aligned.
fn align4(data: &mut Vec<u8>, base: u32) {
    while (base as usize + data.len()) % 4 != 0 {
        data.push(0);
    }
}

/// Checksum over everything after the checksum field, back-patched into the
/// header once the image is complete.
fn adler32(bytes: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in bytes.chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Sort a pool's snapshot, returning items in sorted order plus the
/// handle-to-sorted-index table.
fn sorted_with_index<K: Eq + Hash + Clone, F>(pool: &InternPool<K>, mut cmp: F) -> (Vec<K>, Vec<u32>)
where
    F: FnMut(&K, &K) -> Ordering,
{
    let items = pool.snapshot();
    let mut order: Vec<u32> = (0..items.len() as u32).collect();
    order.sort_by(|&a, &b| cmp(&items[a as usize], &items[b as usize]));
    let mut index = vec![0u32; items.len()];
    for (position, &handle) in order.iter().enumerate() {
        index[handle as usize] = position as u32;
    }
    let sorted = order.iter().map(|&h| items[h as usize].clone()).collect();
    (sorted, index)
}

/// Sorted id tables: items in final index order plus handle-to-index maps.
struct Tables {
    strings: Vec<String>,
    string_index: Vec<u32>,
    types: Vec<String>,
    type_index: Vec<u32>,
    protos: Vec<ProtoItem>,
    proto_index: Vec<u32>,
    fields: Vec<FieldRefItem>,
    field_index: Vec<u32>,
    methods: Vec<MethodRefItem>,
    method_index: Vec<u32>,
    handles: Vec<MethodHandleItem>,
    handle_index: Vec<u32>,
    call_sites: Vec<CallSiteItem>,
}

/// One layout/write run over a fully populated builder.
pub(crate) struct DexWriter<'a> {
    builder: &'a DexBuilder,
}

impl<'a> DexWriter<'a> {
    pub fn new(builder: &'a DexBuilder) -> Self {
        DexWriter { builder }
    }

    pub fn write_to<S: DataSink>(&self, sink: &mut S) -> Result<()> {
        let tables = self.build_tables()?;
        let image = self.assemble(&tables)?;

        sink.write_at(0, &image)?;

        // Back-patch the checksum by reading the image back out of the sink,
        // exercising the store the downstream consumer will read.
        let mut body = Vec::with_capacity(image.len() - 12);
        sink.reader_at(12).read_to_end(&mut body)?;
        let checksum = adler32(&body);
        sink.write_at(8, &checksum.to_le_bytes())?;

        debug!(
            size = image.len(),
            classes = self.builder.class_count(),
            checksum,
            "image serialized"
        );
        Ok(())
    }

    fn build_tables(&self) -> Result<Tables> {
        let b = self.builder;
        let (strings, string_index) = sorted_with_index(&b.strings, |a, k| cmp_utf16(a, k));

        let string_idx_of = |s: &String| -> u32 {
            let handle = b.strings.lookup(s).expect("string interned during population");
            string_index[handle as usize]
        };
        let (types, type_index) =
            sorted_with_index(&b.types, |a, k| string_idx_of(a).cmp(&string_idx_of(k)));

        if types.len() > 0x1_0000 {
            return Err(DexError::CapacityExceeded {
                section: "type_ids",
                requested: types.len() as u64,
                limit: 0x1_0000,
            });
        }

        let type_idx_of = |t: &String| -> u32 {
            let handle = b.types.lookup(t).expect("type interned during population");
            type_index[handle as usize]
        };
        let proto_key = |p: &ProtoItem| -> (u32, Vec<u32>) {
            (
                type_idx_of(&p.return_type),
                p.parameters.iter().map(|t| type_idx_of(t)).collect(),
            )
        };
        let (protos, proto_index) =
            sorted_with_index(&b.protos, |a, k| proto_key(a).cmp(&proto_key(k)));

        if protos.len() > 0x1_0000 {
            return Err(DexError::CapacityExceeded {
                section: "proto_ids",
                requested: protos.len() as u64,
                limit: 0x1_0000,
            });
        }

        let field_key = |f: &FieldRefItem| -> (u32, u32, u32) {
            (
                type_idx_of(&f.class),
                string_idx_of(&f.name),
                type_idx_of(&f.descriptor),
            )
        };
        let (fields, field_index) =
            sorted_with_index(&b.field_refs, |a, k| field_key(a).cmp(&field_key(k)));

        let proto_idx_of = |p: &ProtoItem| -> u32 {
            let handle = b.protos.lookup(p).expect("proto interned during population");
            proto_index[handle as usize]
        };
        let method_key = |m: &MethodRefItem| -> (u32, u32, u32) {
            (
                type_idx_of(&m.class),
                string_idx_of(&m.name),
                proto_idx_of(&m.proto()),
            )
        };
        let (methods, method_index) =
            sorted_with_index(&b.method_refs, |a, k| method_key(a).cmp(&method_key(k)));

        let member_key = |h: &MethodHandleItem| -> u32 {
            match (h.field_ref(), h.method_ref()) {
                (Some(f), _) => {
                    let handle = b
                        .field_refs
                        .lookup(f)
                        .expect("handle member interned during population");
                    field_index[handle as usize]
                }
                (_, Some(m)) => {
                    let handle = b
                        .method_refs
                        .lookup(m)
                        .expect("handle member interned during population");
                    method_index[handle as usize]
                }
                _ => unreachable!(),
            }
        };
        let (handles, handle_index) = sorted_with_index(&b.method_handles, |a, k| {
            (a.kind(), member_key(a)).cmp(&(k.kind(), member_key(k)))
        });

        let (call_sites, _) = sorted_with_index(&b.call_sites, |a, k| a.cmp(k));

        Ok(Tables {
            strings,
            string_index,
            types,
            type_index,
            protos,
            proto_index,
            fields,
            field_index,
            methods,
            method_index,
            handles,
            handle_index,
            call_sites,
        })
    }

    fn string_idx(&self, t: &Tables, s: &str) -> u32 {
        let handle = self
            .builder
            .strings
            .lookup(&s.to_string())
            .expect("string interned during population");
        t.string_index[handle as usize]
    }

    fn type_idx(&self, t: &Tables, descriptor: &str) -> u32 {
        let handle = self
            .builder
            .types
            .lookup(&descriptor.to_string())
            .expect("type interned during population");
        t.type_index[handle as usize]
    }

    fn proto_idx(&self, t: &Tables, proto: &ProtoItem) -> u32 {
        let handle = self
            .builder
            .protos
            .lookup(proto)
            .expect("proto interned during population");
        t.proto_index[handle as usize]
    }

    fn field_idx(&self, t: &Tables, field: &FieldRefItem) -> u32 {
        let handle = self
            .builder
            .field_refs
            .lookup(field)
            .expect("field reference interned during population");
        t.field_index[handle as usize]
    }

    fn method_idx(&self, t: &Tables, method: &MethodRefItem) -> u32 {
        let handle = self
            .builder
            .method_refs
            .lookup(method)
            .expect("method reference interned during population");
        t.method_index[handle as usize]
    }

    fn handle_idx(&self, t: &Tables, handle: &MethodHandleItem) -> u32 {
        let pool_handle = self
            .builder
            .method_handles
            .lookup(handle)
            .expect("method handle interned during population");
        t.handle_index[pool_handle as usize]
    }

    /// Class emission order: superclasses and implemented interfaces first,
    /// ties broken by type index.
    fn class_order(&self, t: &Tables) -> Vec<Arc<ClassDef>> {
        let b = self.builder;
        let mut descriptors: Vec<String> =
            b.classes.iter().map(|entry| entry.key().clone()).collect();
        descriptors.sort_by_key(|d| self.type_idx(t, d));

        let mut order = Vec::with_capacity(descriptors.len());
        let mut visited: HashSet<String> = HashSet::new();
        for descriptor in &descriptors {
            self.visit_class(descriptor, &mut visited, &mut order);
        }
        order
    }

    fn visit_class(
        &self,
        descriptor: &str,
        visited: &mut HashSet<String>,
        order: &mut Vec<Arc<ClassDef>>,
    ) {
        let Some(class) = self.builder.class(descriptor) else {
            return; // external type, defined elsewhere
        };
        if !visited.insert(descriptor.to_string()) {
            return;
        }
        if let Some(superclass) = class.superclass {
            self.visit_class(&self.builder.types.get(superclass.raw()), visited, order);
        }
        if !class.interfaces.is_empty() {
            for type_id in self.builder.type_lists.get(class.interfaces.raw()) {
                self.visit_class(&self.builder.types.get(type_id.raw()), visited, order);
            }
        }
        order.push(class);
    }

    fn assemble(&self, t: &Tables) -> Result<Vec<u8>> {
        let b = self.builder;
        let classes = self.class_order(t);

        // Fixed-width id sections determine where the data section starts.
        let mut cursor = HEADER_SIZE;
        let mut section_off = |count: usize, record: u32| -> u32 {
            if count == 0 {
                return 0;
            }
            let off = cursor;
            cursor += count as u32 * record;
            off
        };
        let string_ids_off = section_off(t.strings.len(), 4);
        let type_ids_off = section_off(t.types.len(), 4);
        let proto_ids_off = section_off(t.protos.len(), 12);
        let field_ids_off = section_off(t.fields.len(), 8);
        let method_ids_off = section_off(t.methods.len(), 8);
        let class_defs_off = section_off(classes.len(), 32);
        let call_site_ids_off = section_off(t.call_sites.len(), 4);
        let method_handles_off = section_off(t.handles.len(), 8);
        let data_off = cursor;

        let mut data = Vec::new();
        let mut map: Vec<(u16, u32, u32)> = Vec::new();

        // --- string data ---
        let first_string_off = data_off + data.len() as u32;
        let mut string_data_offs = Vec::with_capacity(t.strings.len());
        for s in &t.strings {
            string_data_offs.push(data_off + data.len() as u32);
            write_uleb128(&mut data, utf16_len(s));
            data.extend_from_slice(&mutf8(s));
            data.push(0);
        }
        if !t.strings.is_empty() {
            map.push((TYPE_STRING_DATA_ITEM, t.strings.len() as u32, first_string_off));
        }
        // Record offsets by handle for the pool's offset side table.
        let mut string_offsets = vec![NO_OFFSET; t.strings.len()];
        for (handle, &sorted) in t.string_index.iter().enumerate() {
            string_offsets[handle] = string_data_offs[sorted as usize];
        }
        b.strings.set_offsets(string_offsets);

        // --- type lists ---
        let list_snapshot = b.type_lists.snapshot();
        let resolved = |list: &Vec<crate::builder::TypeId>| -> Vec<u32> {
            list.iter().map(|id| t.type_index[id.raw() as usize]).collect()
        };
        let mut list_order: Vec<u32> = (0..list_snapshot.len() as u32).collect();
        list_order.sort_by(|&a, &b_| {
            resolved(&list_snapshot[a as usize]).cmp(&resolved(&list_snapshot[b_ as usize]))
        });
        let mut list_offsets = vec![NO_OFFSET; list_snapshot.len()];
        let mut first_list_off = 0;
        for &handle in &list_order {
            align4(&mut data, data_off);
            let off = data_off + data.len() as u32;
            if first_list_off == 0 {
                first_list_off = off;
            }
            list_offsets[handle as usize] = off;
            let entries = resolved(&list_snapshot[handle as usize]);
            put_u32(&mut data, entries.len() as u32);
            for type_idx in entries {
                put_u16(&mut data, type_idx as u16);
            }
        }
        if !list_snapshot.is_empty() {
            map.push((TYPE_TYPE_LIST, list_snapshot.len() as u32, first_list_off));
        }
        b.type_lists.set_offsets(list_offsets.clone());

        // --- encoded arrays ---
        let array_snapshot = b.arrays.snapshot();
        let mut array_order: Vec<u32> = (0..array_snapshot.len() as u32).collect();
        array_order
            .sort_by(|&a, &b_| array_snapshot[a as usize].cmp(&array_snapshot[b_ as usize]));
        let mut array_offsets = vec![NO_OFFSET; array_snapshot.len()];
        let mut first_array_off = 0;
        for &handle in &array_order {
            let off = data_off + data.len() as u32;
            if first_array_off == 0 {
                first_array_off = off;
            }
            array_offsets[handle as usize] = off;
            self.encode_array(t, &mut data, &array_snapshot[handle as usize])?;
        }
        if !array_snapshot.is_empty() {
            map.push((TYPE_ENCODED_ARRAY_ITEM, array_snapshot.len() as u32, first_array_off));
        }
        b.arrays.set_offsets(array_offsets.clone());

        // --- annotations ---
        let annotation_snapshot = b.annotations.snapshot();
        let mut annotation_order: Vec<u32> = (0..annotation_snapshot.len() as u32).collect();
        annotation_order.sort_by(|&x, &y| {
            let a = &annotation_snapshot[x as usize];
            let k = &annotation_snapshot[y as usize];
            self.type_idx(t, &a.ty)
                .cmp(&self.type_idx(t, &k.ty))
                .then_with(|| a.cmp(k))
        });
        let mut annotation_offsets = vec![NO_OFFSET; annotation_snapshot.len()];
        let mut first_annotation_off = 0;
        for &handle in &annotation_order {
            let off = data_off + data.len() as u32;
            if first_annotation_off == 0 {
                first_annotation_off = off;
            }
            annotation_offsets[handle as usize] = off;
            let annotation = &annotation_snapshot[handle as usize];
            data.push(annotation.visibility as u8);
            self.encode_annotation_body(t, &mut data, &annotation.ty, &annotation.elements)?;
        }
        if !annotation_snapshot.is_empty() {
            map.push((
                TYPE_ANNOTATION_ITEM,
                annotation_snapshot.len() as u32,
                first_annotation_off,
            ));
        }
        b.annotations.set_offsets(annotation_offsets.clone());

        // --- annotation sets ---
        let set_snapshot = b.annotation_sets.snapshot();
        let mut annotation_sorted_pos = vec![0u32; annotation_order.len()];
        for (position, &handle) in annotation_order.iter().enumerate() {
            annotation_sorted_pos[handle as usize] = position as u32;
        }
        let set_key = |set: &Vec<crate::builder::AnnotationId>| -> Vec<u32> {
            let mut sorted: Vec<u32> = set
                .iter()
                .map(|id| annotation_sorted_pos[id.raw() as usize])
                .collect();
            sorted.sort_unstable();
            sorted
        };
        let mut set_order: Vec<u32> = (0..set_snapshot.len() as u32).collect();
        set_order.sort_by(|&a, &b_| {
            set_key(&set_snapshot[a as usize]).cmp(&set_key(&set_snapshot[b_ as usize]))
        });
        let mut set_offsets = vec![NO_OFFSET; set_snapshot.len()];
        let mut first_set_off = 0;
        for &handle in &set_order {
            align4(&mut data, data_off);
            let off = data_off + data.len() as u32;
            if first_set_off == 0 {
                first_set_off = off;
            }
            set_offsets[handle as usize] = off;
            let set = &set_snapshot[handle as usize];
            // Entries ordered by annotation type, i.e. by sorted position.
            let mut entry_offs: Vec<u32> = set
                .iter()
                .map(|id| annotation_offsets[id.raw() as usize])
                .collect();
            entry_offs.sort_unstable();
            put_u32(&mut data, entry_offs.len() as u32);
            for entry in entry_offs {
                put_u32(&mut data, entry);
            }
        }
        if !set_snapshot.is_empty() {
            map.push((TYPE_ANNOTATION_SET_ITEM, set_snapshot.len() as u32, first_set_off));
        }
        b.annotation_sets.set_offsets(set_offsets.clone());

        // --- annotation directories ---
        let mut directory_offs: HashMap<String, u32> = HashMap::new();
        let mut directory_count = 0u32;
        let mut first_directory_off = 0;
        for class in &classes {
            let class_set = if class.annotations.is_empty() {
                NO_OFFSET
            } else {
                set_offsets[class.annotations.raw() as usize]
            };
            let mut field_entries: Vec<(u32, u32)> = class
                .fields()
                .filter(|f| !f.annotations.is_empty())
                .map(|f| {
                    (
                        self.field_idx(t, &f.key),
                        set_offsets[f.annotations.raw() as usize],
                    )
                })
                .collect();
            let mut method_entries: Vec<(u32, u32)> = class
                .methods()
                .filter(|m| !m.annotations.is_empty())
                .map(|m| {
                    (
                        self.method_idx(t, &m.key),
                        set_offsets[m.annotations.raw() as usize],
                    )
                })
                .collect();
            if class_set == NO_OFFSET && field_entries.is_empty() && method_entries.is_empty() {
                continue;
            }
            field_entries.sort_unstable();
            method_entries.sort_unstable();

            align4(&mut data, data_off);
            let off = data_off + data.len() as u32;
            if first_directory_off == 0 {
                first_directory_off = off;
            }
            directory_offs.insert(class.descriptor.clone(), off);
            directory_count += 1;
            put_u32(&mut data, class_set);
            put_u32(&mut data, field_entries.len() as u32);
            put_u32(&mut data, method_entries.len() as u32);
            put_u32(&mut data, 0); // annotated parameters
            for (idx, set_off) in field_entries.into_iter().chain(method_entries) {
                put_u32(&mut data, idx);
                put_u32(&mut data, set_off);
            }
        }
        if directory_count > 0 {
            map.push((
                TYPE_ANNOTATIONS_DIRECTORY_ITEM,
                directory_count,
                first_directory_off,
            ));
        }

        // --- code items ---
        let mut code_offs: HashMap<MethodRefItem, u32> = HashMap::new();
        let mut code_count = 0u32;
        let mut first_code_off = 0;
        for class in &classes {
            for method in class.methods() {
                let Some(body) = &method.body else { continue };
                align4(&mut data, data_off);
                let off = data_off + data.len() as u32;
                if first_code_off == 0 {
                    first_code_off = off;
                }
                code_count += 1;
                self.encode_code_item(t, &mut data, method, body)?;
                code_offs.insert(method.key.clone(), off);
            }
        }
        if code_count > 0 {
            map.push((TYPE_CODE_ITEM, code_count, first_code_off));
        }

        // --- class data ---
        let mut class_data_offs: HashMap<String, u32> = HashMap::new();
        let mut class_data_count = 0u32;
        let mut first_class_data_off = 0;
        for class in &classes {
            if class.field_count() == 0 && class.method_count() == 0 {
                continue;
            }
            let off = data_off + data.len() as u32;
            if first_class_data_off == 0 {
                first_class_data_off = off;
            }
            class_data_offs.insert(class.descriptor.clone(), off);
            class_data_count += 1;

            write_uleb128(&mut data, class.static_fields.len() as u32);
            write_uleb128(&mut data, class.instance_fields.len() as u32);
            write_uleb128(&mut data, class.direct_methods.len() as u32);
            write_uleb128(&mut data, class.virtual_methods.len() as u32);
            self.encode_encoded_fields(t, &mut data, &class.static_fields);
            self.encode_encoded_fields(t, &mut data, &class.instance_fields);
            self.encode_encoded_methods(t, &mut data, &class.direct_methods, &code_offs);
            self.encode_encoded_methods(t, &mut data, &class.virtual_methods, &code_offs);
        }
        if class_data_count > 0 {
            map.push((TYPE_CLASS_DATA_ITEM, class_data_count, first_class_data_off));
        }

        // --- map list ---
        align4(&mut data, data_off);
        let map_off = data_off + data.len() as u32;
        let mut entries: Vec<(u16, u32, u32)> = vec![(TYPE_HEADER_ITEM, 1, 0)];
        let mut id_entry = |ty: u16, count: usize, off: u32| {
            if count > 0 {
                entries.push((ty, count as u32, off));
            }
        };
        id_entry(TYPE_STRING_ID_ITEM, t.strings.len(), string_ids_off);
        id_entry(TYPE_TYPE_ID_ITEM, t.types.len(), type_ids_off);
        id_entry(TYPE_PROTO_ID_ITEM, t.protos.len(), proto_ids_off);
        id_entry(TYPE_FIELD_ID_ITEM, t.fields.len(), field_ids_off);
        id_entry(TYPE_METHOD_ID_ITEM, t.methods.len(), method_ids_off);
        id_entry(TYPE_CLASS_DEF_ITEM, classes.len(), class_defs_off);
        id_entry(TYPE_CALL_SITE_ID_ITEM, t.call_sites.len(), call_site_ids_off);
        id_entry(TYPE_METHOD_HANDLE_ITEM, t.handles.len(), method_handles_off);
        entries.extend(&map);
        entries.push((TYPE_MAP_LIST, 1, map_off));
        put_u32(&mut data, entries.len() as u32);
        for (ty, count, off) in &entries {
            put_u16(&mut data, *ty);
            put_u16(&mut data, 0);
            put_u32(&mut data, *count);
            put_u32(&mut data, *off);
        }

        let file_size = data_off as u64 + data.len() as u64;
        if file_size > u32::MAX as u64 {
            return Err(DexError::CapacityExceeded {
                section: "file",
                requested: file_size,
                limit: u32::MAX as u64,
            });
        }
        let file_size = file_size as u32;
        trace!(
            data = data.len(),
            ids = data_off,
            map_entries = entries.len(),
            "layout complete"
        );

        // --- assemble the image: header, id sections, data ---
        let mut image = Vec::with_capacity(file_size as usize);
        image.extend_from_slice(&MAGIC);
        put_u32(&mut image, 0); // checksum, back-patched later
        image.extend_from_slice(&[0u8; 20]); // signature, left to the consumer
        put_u32(&mut image, file_size);
        put_u32(&mut image, HEADER_SIZE);
        put_u32(&mut image, ENDIAN_TAG);
        put_u32(&mut image, 0); // link_size
        put_u32(&mut image, 0); // link_off
        put_u32(&mut image, map_off);
        put_u32(&mut image, t.strings.len() as u32);
        put_u32(&mut image, string_ids_off);
        put_u32(&mut image, t.types.len() as u32);
        put_u32(&mut image, type_ids_off);
        put_u32(&mut image, t.protos.len() as u32);
        put_u32(&mut image, proto_ids_off);
        put_u32(&mut image, t.fields.len() as u32);
        put_u32(&mut image, field_ids_off);
        put_u32(&mut image, t.methods.len() as u32);
        put_u32(&mut image, method_ids_off);
        put_u32(&mut image, classes.len() as u32);
        put_u32(&mut image, class_defs_off);
        put_u32(&mut image, data.len() as u32);
        put_u32(&mut image, data_off);
        debug_assert_eq!(image.len(), HEADER_SIZE as usize);

        for &off in &string_data_offs {
            put_u32(&mut image, off);
        }
        for ty in &t.types {
            put_u32(&mut image, self.string_idx(t, ty));
        }
        for proto in &t.protos {
            put_u32(&mut image, self.string_idx(t, &proto.shorty()));
            put_u32(&mut image, self.type_idx(t, &proto.return_type));
            let parameters_off = if proto.parameters.is_empty() {
                NO_OFFSET
            } else {
                let type_ids: Vec<crate::builder::TypeId> = proto
                    .parameters
                    .iter()
                    .map(|d| {
                        crate::builder::TypeId(
                            b.types.lookup(d).expect("type interned during population"),
                        )
                    })
                    .collect();
                let handle = b
                    .type_lists
                    .lookup(&type_ids)
                    .expect("parameter list interned during population");
                list_offsets[handle as usize]
            };
            put_u32(&mut image, parameters_off);
        }
        for field in &t.fields {
            put_u16(&mut image, self.type_idx(t, &field.class) as u16);
            put_u16(&mut image, self.type_idx(t, &field.descriptor) as u16);
            put_u32(&mut image, self.string_idx(t, &field.name));
        }
        for method in &t.methods {
            put_u16(&mut image, self.type_idx(t, &method.class) as u16);
            put_u16(&mut image, self.proto_idx(t, &method.proto()) as u16);
            put_u32(&mut image, self.string_idx(t, &method.name));
        }
        for class in &classes {
            put_u32(&mut image, self.type_idx(t, &class.descriptor));
            put_u32(&mut image, class.access_flags);
            let superclass_idx = class
                .superclass
                .map(|s| t.type_index[s.raw() as usize])
                .unwrap_or(NO_INDEX);
            put_u32(&mut image, superclass_idx);
            let interfaces_off = if class.interfaces.is_empty() {
                NO_OFFSET
            } else {
                list_offsets[class.interfaces.raw() as usize]
            };
            put_u32(&mut image, interfaces_off);
            let source_file_idx = class
                .source_file
                .map(|s| t.string_index[s.raw() as usize])
                .unwrap_or(NO_INDEX);
            put_u32(&mut image, source_file_idx);
            put_u32(
                &mut image,
                directory_offs.get(&class.descriptor).copied().unwrap_or(NO_OFFSET),
            );
            put_u32(
                &mut image,
                class_data_offs.get(&class.descriptor).copied().unwrap_or(NO_OFFSET),
            );
            let static_values_off = class
                .static_values
                .map(|id| array_offsets[id.raw() as usize])
                .unwrap_or(NO_OFFSET);
            put_u32(&mut image, static_values_off);
        }
        // Call-site ids are sorted by payload offset.
        let mut call_site_offs: Vec<u32> = t
            .call_sites
            .iter()
            .map(|site| {
                let handle = b
                    .arrays
                    .lookup(&site.payload)
                    .expect("call site payload interned during population");
                array_offsets[handle as usize]
            })
            .collect();
        call_site_offs.sort_unstable();
        for off in call_site_offs {
            put_u32(&mut image, off);
        }
        for handle in &t.handles {
            let (member_idx, section) = match (handle.field_ref(), handle.method_ref()) {
                (Some(f), _) => (self.field_idx(t, f), "field_ids"),
                (_, Some(m)) => (self.method_idx(t, m), "method_ids"),
                _ => unreachable!(),
            };
            if member_idx > 0xffff {
                return Err(DexError::CapacityExceeded {
                    section,
                    requested: u64::from(member_idx),
                    limit: 0xffff,
                });
            }
            put_u16(&mut image, handle.kind());
            put_u16(&mut image, 0);
            put_u16(&mut image, member_idx as u16);
            put_u16(&mut image, 0);
        }
        debug_assert_eq!(image.len() as u32, data_off);
        image.extend_from_slice(&data);
        Ok(image)
    }

    fn encode_encoded_fields(
        &self,
        t: &Tables,
        data: &mut Vec<u8>,
        fields: &std::collections::BTreeSet<FieldDef>,
    ) {
        let mut sorted: Vec<(u32, u32)> = fields
            .iter()
            .map(|f| (self.field_idx(t, &f.key), f.access_flags))
            .collect();
        sorted.sort_unstable();
        let mut previous = 0;
        for (idx, access_flags) in sorted {
            write_uleb128(data, idx - previous);
            write_uleb128(data, access_flags);
            previous = idx;
        }
    }

    fn encode_encoded_methods(
        &self,
        t: &Tables,
        data: &mut Vec<u8>,
        methods: &std::collections::BTreeSet<MethodDef>,
        code_offs: &HashMap<MethodRefItem, u32>,
    ) {
        let mut sorted: Vec<(u32, u32, u32)> = methods
            .iter()
            .map(|m| {
                let code_off = if m.body.is_some() {
                    *code_offs
                        .get(&m.key)
                        .expect("code item emitted before class data")
                } else {
                    NO_OFFSET
                };
                (self.method_idx(t, &m.key), m.access_flags, code_off)
            })
            .collect();
        sorted.sort_unstable();
        let mut previous = 0;
        for (idx, access_flags, code_off) in sorted {
            write_uleb128(data, idx - previous);
            write_uleb128(data, access_flags);
            write_uleb128(data, code_off);
            previous = idx;
        }
    }

    fn encode_code_item(
        &self,
        t: &Tables,
        data: &mut Vec<u8>,
        method: &MethodDef,
        body: &MethodImplItem,
    ) -> Result<()> {
        let this_width: u16 = if method.access_flags & ACC_STATIC != 0 { 0 } else { 1 };
        let ins = this_width
            + method
                .key
                .parameters
                .iter()
                .map(|p| type_width(p))
                .sum::<u16>();
        let outs = body
            .instructions
            .iter()
            .map(|i| match i {
                Instruction::Invoke { registers, .. } => registers.len() as u16,
                _ => 0,
            })
            .max()
            .unwrap_or(0);

        put_u16(data, body.register_count);
        put_u16(data, ins);
        put_u16(data, outs);
        put_u16(data, body.try_blocks.len() as u16);
        put_u32(data, 0); // debug_info_off: debug stream not emitted
        let mut units = Vec::new();
        for instruction in &body.instructions {
            units.extend(self.instruction_units(t, instruction)?);
        }
        put_u32(data, units.len() as u32);
        for unit in &units {
            put_u16(data, *unit);
        }
        if !body.try_blocks.is_empty() {
            if units.len() % 2 != 0 {
                put_u16(data, 0);
            }
            self.encode_tries(t, data, &body.try_blocks);
        }
        Ok(())
    }

    fn encode_tries(&self, t: &Tables, data: &mut Vec<u8>, tries: &[TryBlock]) {
        // The handler list is assembled first so try records can carry the
        // byte offset of their handler block within it.
        let mut handler_list = Vec::new();
        write_uleb128(&mut handler_list, tries.len() as u32);
        let mut handler_offs = Vec::with_capacity(tries.len());
        for try_block in tries {
            handler_offs.push(handler_list.len() as u32);
            let catch_all = try_block
                .handlers
                .iter()
                .find(|h| h.exception_type.is_none());
            let typed: Vec<_> = try_block
                .handlers
                .iter()
                .filter(|h| h.exception_type.is_some())
                .collect();
            let size = if catch_all.is_some() {
                -(typed.len() as i32)
            } else {
                typed.len() as i32
            };
            write_sleb128(&mut handler_list, size);
            for handler in &typed {
                let exception_type = handler.exception_type.as_ref().unwrap();
                write_uleb128(&mut handler_list, self.type_idx(t, exception_type));
                write_uleb128(&mut handler_list, handler.handler_address);
            }
            if let Some(catch_all) = catch_all {
                write_uleb128(&mut handler_list, catch_all.handler_address);
            }
        }
        for (try_block, handler_off) in tries.iter().zip(&handler_offs) {
            put_u32(data, try_block.start_address);
            put_u16(data, try_block.unit_count);
            put_u16(data, *handler_off as u16);
        }
        data.extend_from_slice(&handler_list);
    }

    fn instruction_units(&self, t: &Tables, instruction: &Instruction) -> Result<Vec<u16>> {
        match instruction {
            Instruction::Plain { units } => Ok(units.clone()),
            Instruction::ConstString { register, value } => {
                let idx = self.string_idx(t, value);
                if idx > 0xffff {
                    return Err(DexError::CapacityExceeded {
                        section: "string_ids",
                        requested: idx as u64,
                        limit: 0xffff,
                    });
                }
                Ok(vec![OP_CONST_STRING | (u16::from(*register) << 8), idx as u16])
            }
            Instruction::TypeOp {
                opcode,
                register,
                descriptor,
            } => Ok(vec![
                u16::from(*opcode) | (u16::from(*register) << 8),
                self.type_idx(t, descriptor) as u16,
            ]),
            Instruction::FieldOp {
                opcode,
                value_register,
                object_register,
                field,
            } => {
                assert!(
                    *value_register < 16 && *object_register < 16,
                    "field op registers are 4-bit"
                );
                let idx = self.field_idx(t, field);
                if idx > 0xffff {
                    return Err(DexError::CapacityExceeded {
                        section: "field_ids",
                        requested: idx as u64,
                        limit: 0xffff,
                    });
                }
                Ok(vec![
                    u16::from(*opcode)
                        | (u16::from(*value_register) << 8)
                        | (u16::from(*object_register) << 12),
                    idx as u16,
                ])
            }
            Instruction::Invoke {
                opcode,
                registers,
                method,
            } => {
                assert!(registers.len() <= 5, "invoke takes at most five registers");
                let mut packed = 0u16;
                for (position, register) in registers.iter().take(4).enumerate() {
                    assert!(*register < 16, "invoke registers are 4-bit");
                    packed |= u16::from(*register) << (4 * position);
                }
                let fifth = if registers.len() == 5 {
                    assert!(registers[4] < 16, "invoke registers are 4-bit");
                    u16::from(registers[4])
                } else {
                    0
                };
                let idx = self.method_idx(t, method);
                if idx > 0xffff {
                    return Err(DexError::CapacityExceeded {
                        section: "method_ids",
                        requested: idx as u64,
                        limit: 0xffff,
                    });
                }
                Ok(vec![
                    u16::from(*opcode) | ((registers.len() as u16) << 12) | (fifth << 8),
                    idx as u16,
                    packed,
                ])
            }
        }
    }

    fn encode_array(&self, t: &Tables, data: &mut Vec<u8>, values: &[Value]) -> Result<()> {
        write_uleb128(data, values.len() as u32);
        for value in values {
            self.encode_value(t, data, value)?;
        }
        Ok(())
    }

    fn encode_value(&self, t: &Tables, data: &mut Vec<u8>, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => {
                data.push(VALUE_BYTE);
                data.push(*v as u8);
            }
            Value::Short(v) => encode_sized_int(data, VALUE_SHORT, i64::from(*v)),
            Value::Char(v) => encode_sized_uint(data, VALUE_CHAR, u64::from(*v)),
            Value::Int(v) => encode_sized_int(data, VALUE_INT, i64::from(*v)),
            Value::Long(v) => encode_sized_int(data, VALUE_LONG, *v),
            Value::Float(v) => {
                encode_sized_float(data, VALUE_FLOAT, u64::from(v.to_bits()) << 32)
            }
            Value::Double(v) => encode_sized_float(data, VALUE_DOUBLE, v.to_bits()),
            Value::MethodType(proto) => {
                encode_sized_uint(data, VALUE_METHOD_TYPE, u64::from(self.proto_idx(t, proto)))
            }
            Value::MethodHandle(handle) => encode_sized_uint(
                data,
                VALUE_METHOD_HANDLE,
                u64::from(self.handle_idx(t, handle)),
            ),
            Value::String(s) => {
                encode_sized_uint(data, VALUE_STRING, u64::from(self.string_idx(t, s)))
            }
            Value::Type(ty) => {
                encode_sized_uint(data, VALUE_TYPE, u64::from(self.type_idx(t, ty)))
            }
            Value::Field(f) => {
                encode_sized_uint(data, VALUE_FIELD, u64::from(self.field_idx(t, f)))
            }
            Value::Method(m) => {
                encode_sized_uint(data, VALUE_METHOD, u64::from(self.method_idx(t, m)))
            }
            Value::Enum(f) => {
                encode_sized_uint(data, VALUE_ENUM, u64::from(self.field_idx(t, f)))
            }
            Value::Array(values) => {
                data.push(VALUE_ARRAY);
                self.encode_array(t, data, values)?;
            }
            Value::Annotation { ty, elements } => {
                data.push(VALUE_ANNOTATION);
                self.encode_annotation_body(t, data, ty, elements)?;
            }
            Value::Null => data.push(VALUE_NULL),
            Value::Boolean(v) => data.push(VALUE_BOOLEAN | (u8::from(*v) << 5)),
        }
        Ok(())
    }

    fn encode_annotation_body(
        &self,
        t: &Tables,
        data: &mut Vec<u8>,
        ty: &str,
        elements: &[AnnotationElement],
    ) -> Result<()> {
        write_uleb128(data, self.type_idx(t, ty));
        write_uleb128(data, elements.len() as u32);
        for element in elements {
            write_uleb128(data, self.string_idx(t, &element.name));
            self.encode_value(t, data, &element.value)?;
        }
        Ok(())
    }
}

/// Sized little-endian unsigned value: minimal bytes, zero-extended on read.
fn encode_sized_uint(data: &mut Vec<u8>, value_type: u8, value: u64) {
    let mut size = 1;
    while size < 8 && (value >> (8 * size)) != 0 {
        size += 1;
    }
    data.push(value_type | (((size - 1) as u8) << 5));
    for i in 0..size {
        data.push((value >> (8 * i)) as u8);
    }
}

/// Sized little-endian signed value: minimal bytes, sign-extended on read.
fn encode_sized_int(data: &mut Vec<u8>, value_type: u8, value: i64) {
    let mut size = 8usize;
    while size > 1 {
        let bits = 8 * (size - 1) as u32;
        let truncated = (value << (64 - bits)) >> (64 - bits);
        if truncated == value {
            size -= 1;
        } else {
            break;
        }
    }
    data.push(value_type | (((size - 1) as u8) << 5));
    for i in 0..size {
        data.push((value >> (8 * i)) as u8);
    }
}

/// Sized floating-point value: low zero bytes dropped, zero-extended to the
/// right on read.
fn encode_sized_float(data: &mut Vec<u8>, value_type: u8, mut bits: u64) {
    let mut size = 8usize;
    while size > 1 && bits & 0xff == 0 {
        bits >>= 8;
        size -= 1;
    }
    data.push(value_type | (((size - 1) as u8) << 5));
    for i in 0..size {
        data.push((bits >> (8 * i)) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adler32_known_values() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11e6_0398);
    }

    #[test]
    fn test_sized_uint_minimal_bytes() {
        let mut out = Vec::new();
        encode_sized_uint(&mut out, VALUE_STRING, 0);
        assert_eq!(out, [VALUE_STRING, 0x00]);

        out.clear();
        encode_sized_uint(&mut out, VALUE_STRING, 0x1234);
        assert_eq!(out, [VALUE_STRING | (1 << 5), 0x34, 0x12]);
    }

    #[test]
    fn test_sized_int_sign_extension() {
        let mut out = Vec::new();
        encode_sized_int(&mut out, VALUE_INT, -1);
        assert_eq!(out, [VALUE_INT, 0xff]);

        out.clear();
        encode_sized_int(&mut out, VALUE_INT, 127);
        assert_eq!(out, [VALUE_INT, 0x7f]);

        out.clear();
        encode_sized_int(&mut out, VALUE_INT, 128);
        assert_eq!(out, [VALUE_INT | (1 << 5), 0x80, 0x00]);

        out.clear();
        encode_sized_int(&mut out, VALUE_INT, -129);
        assert_eq!(out, [VALUE_INT | (1 << 5), 0x7f, 0xff]);
    }

    #[test]
    fn test_sized_float_drops_low_zero_bytes() {
        let mut out = Vec::new();
        encode_sized_float(&mut out, VALUE_DOUBLE, 1.0f64.to_bits());
        // 1.0 is 0x3ff0_0000_0000_0000: two significant high bytes.
        assert_eq!(out, [VALUE_DOUBLE | (1 << 5), 0xf0, 0x3f]);

        out.clear();
        encode_sized_float(&mut out, VALUE_FLOAT, u64::from(2.0f32.to_bits()) << 32);
        assert_eq!(out, [VALUE_FLOAT, 0x40]);
    }

    #[test]
    fn test_align4() {
        let mut data = vec![1, 2, 3];
        align4(&mut data, 0x70);
        assert_eq!(data.len(), 4);
        align4(&mut data, 0x70);
        assert_eq!(data.len(), 4);
    }
}
