//! Concurrent population: many producer threads feed one shared builder and
//! the result must be indistinguishable from single-threaded population.

use dexbuild::{
    ClassItem, DexBuilder, FieldItem, FieldRefItem, MemorySink, MethodRefItem, ACC_PUBLIC,
    ACC_STATIC,
};

const THREADS: usize = 8;
const PER_THREAD: usize = 200;

fn serialize(builder: &DexBuilder) -> Vec<u8> {
    let mut sink = MemorySink::new();
    builder.write_to(&mut sink).unwrap();
    sink.data()
}

#[test]
fn test_shared_strings_converge_to_one_handle() {
    let builder = DexBuilder::new();
    crossbeam::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|_| {
                for i in 0..PER_THREAD {
                    builder.intern_string(&format!("shared-{i}"));
                }
            });
        }
    })
    .unwrap();
    assert_eq!(builder.stats().strings, PER_THREAD);

    // Every thread resolves the same handle for the same content.
    let canonical = builder.intern_string("shared-0");
    assert_eq!(builder.intern_string("shared-0"), canonical);
}

#[test]
fn test_disjoint_and_overlapping_interning() {
    let builder = DexBuilder::new();
    crossbeam::thread::scope(|scope| {
        for thread in 0..THREADS {
            let builder = &builder;
            scope.spawn(move |_| {
                for i in 0..PER_THREAD {
                    // Half the keys are private to the thread, half shared.
                    builder.intern_type(&format!("LThread{thread}$Item{i};"));
                    builder.intern_field_ref(&FieldRefItem {
                        class: "LShared;".to_string(),
                        name: format!("field{i}"),
                        descriptor: "I".to_string(),
                    });
                }
            });
        }
    })
    .unwrap();

    let stats = builder.stats();
    assert_eq!(stats.types, THREADS * PER_THREAD + 1 + 1); // + LShared; + "I"
    assert_eq!(stats.field_refs, PER_THREAD);
}

#[test]
fn test_parallel_class_registration() {
    let builder = DexBuilder::new();
    crossbeam::thread::scope(|scope| {
        for thread in 0..THREADS {
            let builder = &builder;
            scope.spawn(move |_| {
                for i in 0..20 {
                    let class = ClassItem {
                        descriptor: format!("LT{thread}C{i};"),
                        access_flags: ACC_PUBLIC,
                        superclass: Some("Ljava/lang/Object;".to_string()),
                        interfaces: vec![],
                        source_file: None,
                        annotations: vec![],
                        fields: vec![FieldItem {
                            name: "x".to_string(),
                            descriptor: "I".to_string(),
                            access_flags: ACC_PUBLIC | ACC_STATIC,
                            initial_value: None,
                            annotations: vec![],
                        }],
                        methods: vec![],
                    };
                    builder.add_class(&class).unwrap();
                }
            });
        }
    })
    .unwrap();
    assert_eq!(builder.class_count(), THREADS * 20);
}

#[test]
fn test_concurrent_population_is_deterministic() {
    let classes: Vec<ClassItem> = (0..THREADS * 10)
        .map(|i| ClassItem {
            descriptor: format!("LC{i:03};"),
            access_flags: ACC_PUBLIC,
            superclass: Some("Ljava/lang/Object;".to_string()),
            interfaces: vec![],
            source_file: None,
            annotations: vec![],
            fields: vec![],
            methods: vec![],
        })
        .collect();

    let hash_code = MethodRefItem {
        class: "Ljava/lang/Object;".to_string(),
        name: "hashCode".to_string(),
        return_type: "I".to_string(),
        parameters: vec![],
    };

    // Sequential reference image.
    let sequential = DexBuilder::new();
    for class in &classes {
        sequential.add_class(class).unwrap();
    }
    sequential.intern_method_ref(&hash_code);
    let reference = serialize(&sequential);

    // Concurrent runs in whatever interleaving the scheduler picks must
    // still produce the reference bytes.
    for _ in 0..3 {
        let builder = DexBuilder::new();
        crossbeam::thread::scope(|scope| {
            for chunk in classes.chunks(10) {
                let builder = &builder;
                let hash_code = &hash_code;
                scope.spawn(move |_| {
                    for class in chunk {
                        builder.add_class(class).unwrap();
                        // Redundant interning mixed in from every thread.
                        builder.intern_method_ref(hash_code);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(serialize(&builder), reference);
    }
}
