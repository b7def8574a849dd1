//! # dexbuild - Concurrent Container Construction
//!
//! `dexbuild` builds executable-container images from a logical model of
//! classes, methods, and constants. Structural values are interned into
//! shared pools, so any number of producer threads can populate one builder
//! without external locking; serialization then lays the pools out in the
//! format's canonical order and emits a deterministic byte image.
//!
//! - **Interning pools** deduplicate strings, types, prototypes, member
//!   references, annotations, and constant arrays
//! - **Lock-free population**: every builder method takes `&self`
//! - **Deterministic output**: the same logical input produces the same
//!   bytes, whatever order producers ran in
//! - **Rewriting**: per-category overrides transform a container before it
//!   is rebuilt
//!
//! ## Quick Start
//!
//! ```rust
//! use dexbuild::{ClassItem, DexBuilder, MemorySink, Result, ACC_PUBLIC};
//!
//! # fn main() -> Result<()> {
//! let builder = DexBuilder::new();
//! builder.add_class(&ClassItem {
//!     descriptor: "Lcom/example/Hello;".to_string(),
//!     access_flags: ACC_PUBLIC,
//!     superclass: Some("Ljava/lang/Object;".to_string()),
//!     interfaces: vec![],
//!     source_file: None,
//!     annotations: vec![],
//!     fields: vec![],
//!     methods: vec![],
//! })?;
//!
//! let mut sink = MemorySink::new();
//! builder.write_to(&mut sink)?;
//! let image = sink.data();
//! assert_eq!(&image[..4], b"dex\n");
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod encoding;
pub mod error;
pub mod model;
pub mod pool;
pub mod rewriter;
pub mod sink;
pub mod writer;

pub use crate::builder::{
    AnnotationId, AnnotationSetId, ArrayId, BuilderStats, CallSiteId, ClassDef, DexBuilder,
    FieldDef, FieldId, MethodDef, MethodHandleId, MethodId, ProtoId, StringId, TypeId, TypeListId,
};
pub use crate::error::{DexError, Result};
pub use crate::model::{
    AnnotationElement, AnnotationItem, CallSiteItem, ClassItem, Container, DebugItem,
    ExceptionHandler, FieldItem, FieldRefItem, Instruction, MethodHandleItem, MethodImplItem,
    MethodItem, MethodRefItem, ParameterItem, ProtoItem, TryBlock, Value, Visibility, ACC_ABSTRACT,
    ACC_CONSTRUCTOR, ACC_FINAL, ACC_INTERFACE, ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC,
};
pub use crate::pool::{NO_INDEX, NO_OFFSET};
pub use crate::rewriter::{DexRewriter, DexRewriterBuilder, RewrittenContainer};
pub use crate::sink::{DataSink, FileSink, MemorySink, SinkReader};
pub use crate::writer::{HEADER_SIZE, MAGIC};
