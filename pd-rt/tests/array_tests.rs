mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::*;
use rt::{LayoutOwnership, ObjectRef, RtError, TypeLoadError};

fn int32(fx: &Fixture) -> TypeHandle {
    fx.universe.primitive(PrimitiveType::I4)
}

#[test]
fn reference_vectors_report_every_element_slot() {
    let fx = fixture();
    let table = fx
        .loader
        .build_array_type(&fx.universe.string(), 1, ArrayKind::Vector)
        .expect("string[]");
    for len in [0i64, 1, 5] {
        let array = fx.loader.construct(&table, &[len]).expect("construct");
        let offsets = table.gc_desc().pointer_offsets(array.object_size());
        let expected: Vec<u64> = (0..len as u64).map(|index| 16 + index * 8).collect();
        assert_eq!(offsets, expected, "length {len}");
    }
}

#[test]
fn struct_vectors_repeat_the_field_pattern() {
    let fx = fixture();
    let table = fx
        .loader
        .build_array_type(&fx.pair, 1, ArrayKind::Vector)
        .expect("Pair[]");
    assert_eq!(table.component_size(), 24);
    assert!(matches!(table.gc_desc(), GcDesc::Repeating { .. }));
    assert_eq!(table.gc_desc().count(), -2);

    for len in [0u64, 1, 4] {
        let offsets: BTreeSet<u64> = table
            .gc_desc()
            .pointer_offsets(table.instance_size(len))
            .into_iter()
            .collect();
        let expected: BTreeSet<u64> = (0..len)
            .flat_map(|index| [16 + index * 24, 32 + index * 24])
            .collect();
        assert_eq!(offsets, expected, "length {len}");
    }

    let decoded = GcDesc::decode(&table.gc_desc().encode()).expect("decode");
    assert_eq!(&decoded, table.gc_desc());
}

#[test]
fn arrays_without_references_have_empty_descriptors() {
    let fx = fixture();
    for element in [int32(&fx), fx.point.clone()] {
        let table = fx
            .loader
            .build_array_type(&element, 1, ArrayKind::Vector)
            .expect("vector");
        assert!(table.gc_desc().is_empty());
        assert!(table.gc_desc().pointer_offsets(table.instance_size(8)).is_empty());
        assert_eq!(table.gc_desc().encode(), 0i64.to_le_bytes().to_vec());
    }
}

#[test]
fn general_struct_arrays_start_after_the_bounds() {
    let fx = fixture();
    let table = fx
        .loader
        .build_array_type(&fx.pair, 2, ArrayKind::General)
        .expect("Pair[,]");
    assert_eq!(table.data_offset(), 32);
    assert_eq!(table.base_size(), 40);
    let array = fx.loader.construct(&table, &[2, 1]).expect("construct");
    let offsets = table.gc_desc().pointer_offsets(array.object_size());
    assert_eq!(offsets, vec![32, 48, 56, 72]);
}

#[test]
fn vector_accessors_check_bounds_at_both_edges() {
    let fx = fixture();
    let table = fx
        .loader
        .build_array_type(&int32(&fx), 1, ArrayKind::Vector)
        .expect("int32[]");

    for len in [0i64, 3] {
        let mut array = fx.loader.construct(&table, &[len]).expect("construct");
        for index in [-1, 0, len - 1, len] {
            let in_range = index >= 0 && index < len;
            let get = fx
                .loader
                .invoke_accessor(&mut array, ArrayMethodKind::Get, &AccessorArgs::get([index]));
            let set = fx.loader.invoke_accessor(
                &mut array,
                ArrayMethodKind::Set,
                &AccessorArgs::set([index], ElementValue::Int(index * 10)),
            );
            let address = fx.loader.invoke_accessor(
                &mut array,
                ArrayMethodKind::Address,
                &AccessorArgs::get([index]),
            );
            if in_range {
                assert_eq!(get, Ok(AccessorOutcome::Value(ElementValue::Int(0))));
                assert_eq!(set, Ok(AccessorOutcome::Stored));
                assert_eq!(address, Ok(AccessorOutcome::Address(16 + index as u64 * 4)));
            } else {
                for outcome in [get, set, address] {
                    assert_eq!(outcome, Err(ArrayAccessFault::IndexOutOfRange), "{len}/{index}");
                }
            }
        }
    }
}

#[test]
fn general_accessors_honour_lower_bounds() {
    let fx = fixture();
    let table = fx
        .loader
        .build_array_type(&int32(&fx), 2, ArrayKind::General)
        .expect("int32[,]");
    // dimension 0 spans 1..=2, dimension 1 spans -1..=1
    let mut array = fx
        .loader
        .construct(&table, &[1, 2, -1, 3])
        .expect("construct");
    assert_eq!(array.lengths(), &[2, 3]);
    assert_eq!(array.lower_bounds(), &[1, -1]);

    let set = AccessorArgs::set([2, 1], ElementValue::Int(99));
    assert_eq!(
        fx.loader.invoke_accessor(&mut array, ArrayMethodKind::Set, &set),
        Ok(AccessorOutcome::Stored)
    );
    assert_eq!(
        fx.loader
            .invoke_accessor(&mut array, ArrayMethodKind::Get, &AccessorArgs::get([2, 1])),
        Ok(AccessorOutcome::Value(ElementValue::Int(99)))
    );
    // row-major: (2 - 1) * 3 + (1 + 1) = 5
    assert_eq!(
        fx.loader.invoke_accessor(
            &mut array,
            ArrayMethodKind::Address,
            &AccessorArgs::get([2, 1])
        ),
        Ok(AccessorOutcome::Address(32 + 5 * 4))
    );
    for indices in [[0, 0], [3, 0], [1, -2], [1, 2]] {
        assert_eq!(
            fx.loader
                .invoke_accessor(&mut array, ArrayMethodKind::Get, &AccessorArgs::get(indices)),
            Err(ArrayAccessFault::IndexOutOfRange),
            "{indices:?}"
        );
    }
    assert!(matches!(
        fx.loader
            .invoke_accessor(&mut array, ArrayMethodKind::Get, &AccessorArgs::get([1])),
        Err(ArrayAccessFault::BadArguments { expected: 2, got: 1 })
    ));
}

#[test]
fn covariant_stores_are_checked_against_the_element_type() {
    let fx = fixture();
    let shapes = fx
        .loader
        .build_array_type(&fx.shape, 1, ArrayKind::Vector)
        .expect("Shape[]");
    let circles = fx
        .loader
        .build_array_type(&fx.circle, 1, ArrayKind::Vector)
        .expect("Circle[]");
    let mut shape_array = fx.loader.construct(&shapes, &[2]).expect("construct");
    let mut circle_array = fx.loader.construct(&circles, &[2]).expect("construct");

    let circle = ElementValue::Ref(Some(ObjectRef::object(fx.circle.id, 1)));
    let shape = ElementValue::Ref(Some(ObjectRef::object(fx.shape.id, 2)));
    assert_eq!(
        fx.loader.invoke_accessor(
            &mut shape_array,
            ArrayMethodKind::Set,
            &AccessorArgs::set([0], circle.clone())
        ),
        Ok(AccessorOutcome::Stored)
    );
    assert_eq!(
        fx.loader.invoke_accessor(
            &mut circle_array,
            ArrayMethodKind::Set,
            &AccessorArgs::set([0], shape)
        ),
        Err(ArrayAccessFault::ArrayTypeMismatch)
    );
    assert_eq!(
        fx.loader.invoke_accessor(
            &mut circle_array,
            ArrayMethodKind::Set,
            &AccessorArgs::set([1], ElementValue::NULL)
        ),
        Ok(AccessorOutcome::Stored)
    );

    let exact = AccessorArgs::get([0]).with_type_token(fx.shape.id);
    let wrong = AccessorArgs::get([0]).with_type_token(fx.circle.id);
    assert_eq!(
        fx.loader
            .invoke_accessor(&mut shape_array, ArrayMethodKind::Address, &exact),
        Ok(AccessorOutcome::Address(16))
    );
    assert_eq!(
        fx.loader
            .invoke_accessor(&mut shape_array, ArrayMethodKind::Address, &wrong),
        Err(ArrayAccessFault::TypeMismatch)
    );
}

#[test]
fn reference_vectors_share_the_canonical_layout() {
    let fx = fixture();
    let object = fx.loader.canonical_object_vector().expect("object[]");
    let strings = fx
        .loader
        .build_array_type(&fx.universe.string(), 1, ArrayKind::Vector)
        .expect("string[]");
    let shapes = fx
        .loader
        .build_array_type(&fx.shape, 1, ArrayKind::Vector)
        .expect("Shape[]");
    let ints = fx
        .loader
        .build_array_type(&int32(&fx), 1, ArrayKind::Vector)
        .expect("int32[]");

    assert_eq!(object.ownership(), LayoutOwnership::Owns);
    for shared in [&strings, &shapes] {
        assert_eq!(shared.ownership(), LayoutOwnership::AliasesCanonical);
        assert!(shared.shares_layout_with(&object));
        assert!(Arc::ptr_eq(shared.interfaces(), object.interfaces()));
        assert_ne!(shared.id(), object.id());
    }
    assert!(!ints.shares_layout_with(&object));

    let general = fx
        .loader
        .build_array_type(&fx.universe.string(), 1, ArrayKind::General)
        .expect("string[*]");
    assert_eq!(general.ownership(), LayoutOwnership::AliasesCanonical);
    assert!(!general.shares_layout_with(&object));
}

#[test]
fn reference_arrays_share_per_kind_and_rank() {
    let fx = fixture();
    let object_2d = fx
        .loader
        .build_array_type(&fx.universe.object(), 2, ArrayKind::General)
        .expect("object[,]");
    let strings_2d = fx
        .loader
        .build_array_type(&fx.universe.string(), 2, ArrayKind::General)
        .expect("string[,]");
    let shapes_2d = fx
        .loader
        .build_array_type(&fx.shape, 2, ArrayKind::General)
        .expect("Shape[,]");
    let strings_3d = fx
        .loader
        .build_array_type(&fx.universe.string(), 3, ArrayKind::General)
        .expect("string[,,]");

    assert!(Arc::ptr_eq(
        &object_2d,
        &fx.loader.canonical_table(2, ArrayKind::General).expect("canonical")
    ));
    assert_eq!(object_2d.ownership(), LayoutOwnership::Owns);
    for shared in [&strings_2d, &shapes_2d] {
        assert_eq!(shared.ownership(), LayoutOwnership::AliasesCanonical);
        assert!(shared.shares_layout_with(&object_2d));
        assert_eq!(shared.rank(), 2);
        assert_eq!(shared.kind(), ArrayKind::General);
        assert_eq!(shared.data_offset(), object_2d.data_offset());
    }
    assert!(!strings_3d.shares_layout_with(&object_2d));
    assert_eq!(strings_2d.constructors().count(), 2);

    // aliased tables still check stores against their own element type
    let mut strings = fx.loader.construct(&strings_2d, &[2, 2]).expect("construct");
    let shape = ElementValue::Ref(Some(ObjectRef::object(fx.shape.id, 1)));
    assert_eq!(
        fx.loader.invoke_accessor(
            &mut strings,
            ArrayMethodKind::Set,
            &AccessorArgs::set([1, 1], shape)
        ),
        Err(ArrayAccessFault::ArrayTypeMismatch)
    );
}

#[test]
fn nested_vectors_get_one_constructor_per_level() {
    let fx = fixture();
    let inner = fx
        .loader
        .build_array_type(&int32(&fx), 1, ArrayKind::Vector)
        .expect("int32[]");
    let outer = fx
        .loader
        .build_array_type(inner.array_type(), 1, ArrayKind::Vector)
        .expect("int32[][]");
    assert_eq!(outer.name(), "int32[][]");
    assert_eq!(outer.ownership(), LayoutOwnership::Owns);
    assert!(!outer.shares_layout_with(&fx.loader.canonical_object_vector().expect("object[]")));

    let arities: Vec<ArrayMethodKind> = outer.constructors().map(|ctor| ctor.kind()).collect();
    assert_eq!(
        arities,
        vec![
            ArrayMethodKind::Ctor { arity: 1 },
            ArrayMethodKind::Ctor { arity: 2 }
        ]
    );

    let jagged = fx.loader.construct(&outer, &[2, 3]).expect("construct");
    assert_eq!(jagged.len(), 2);
    for element in jagged.elements() {
        match element {
            ElementValue::Ref(Some(ObjectRef::Array(child))) => {
                assert_eq!(child.len(), 3);
                assert_eq!(child.method_table().id(), inner.id());
            }
            other => panic!("expected a nested array, got {other:?}"),
        }
    }

    let err = fx
        .loader
        .construct(&outer, &[1, 2, 3])
        .expect_err("too many lengths");
    assert!(matches!(
        err,
        RtError::Fault(ArrayAccessFault::BadArguments { expected: 2, got: 3 })
    ));
    assert!(matches!(
        fx.loader.construct(&inner, &[-1]),
        Err(RtError::Fault(ArrayAccessFault::Overflow))
    ));
}

#[test]
fn array_types_are_built_once() {
    let fx = fixture();
    let tables: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    fx.loader
                        .build_array_type(&fx.pair, 1, ArrayKind::Vector)
                        .expect("Pair[]")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect()
    });
    assert!(tables.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(fx.loader.cached_count(), 1);
}

#[test]
fn invalid_shapes_fail_to_load() {
    let fx = fixture();
    let void = fx.universe.primitive(PrimitiveType::Void);
    assert!(matches!(
        fx.loader.build_array_type(&void, 1, ArrayKind::Vector),
        Err(TypeLoadError::InvalidElement { .. })
    ));
    assert!(matches!(
        fx.loader.build_array_type(&int32(&fx), 1 + rt_abi::MAX_ARRAY_RANK, ArrayKind::General),
        Err(TypeLoadError::InvalidRank { .. })
    ));
    let huge = fx
        .universe
        .define_value_type("Huge", ValueTypeLayout::new(rt_abi::MAX_COMPONENT_SIZE + 8));
    assert!(matches!(
        fx.loader.build_array_type(&huge, 1, ArrayKind::Vector),
        Err(TypeLoadError::ElementTooLarge { .. })
    ));
}

#[test]
fn snapshots_are_stable_across_loaders() {
    let render = || {
        let fx = fixture();
        ["Pair", "string", "int32"]
            .into_iter()
            .flat_map(|name| {
                let element = fx.universe.by_name(name).expect("known type");
                [
                    fx.loader
                        .build_array_type(&element, 1, ArrayKind::Vector)
                        .expect("vector"),
                    fx.loader
                        .build_array_type(&element, 3, ArrayKind::General)
                        .expect("general"),
                ]
            })
            .map(|table| serde_json::to_string(&table.snapshot()).expect("json"))
            .collect::<Vec<_>>()
    };
    let first = render();
    assert_eq!(first, render());

    let fx = fixture();
    let snapshot = fx
        .loader
        .build_array_type(&fx.pair, 1, ArrayKind::Vector)
        .expect("Pair[]")
        .snapshot();
    assert_eq!(snapshot.name, "Pair[]");
    assert_eq!(snapshot.methods.len(), 4);
    assert!(snapshot.interfaces.contains(&"IList`1<Pair>".to_string()));
}

#[test]
fn list_interfaces_on_vectors_route_to_shared_helpers() {
    let fx = fixture();
    let strings = fx
        .loader
        .build_array_type(&fx.universe.string(), 1, ArrayKind::Vector)
        .expect("string[]");
    let points = fx
        .loader
        .build_array_type(&fx.point, 1, ArrayKind::Vector)
        .expect("Point[]");
    let object = fx.universe.object().id;
    let string = fx.universe.string().id;

    let enumerator =
        rt::resolve_list_method(&fx.universe, &strings, "IEnumerable`1", 0).expect("enumerator");
    assert_eq!(enumerator.helper, "GetEnumerator");
    assert_eq!(enumerator.type_arg, string);

    let count = rt::resolve_list_method(&fx.universe, &strings, "IReadOnlyCollection`1", 0)
        .expect("count");
    assert_eq!(count.helper, "get_Count");
    assert_eq!(count.type_arg, object);

    let contains =
        rt::resolve_list_method(&fx.universe, &strings, "ICollection`1", 4).expect("contains");
    assert_eq!(contains.helper, "Contains");

    let set_item = rt::resolve_list_method(&fx.universe, &points, "IList`1", 1).expect("set_Item");
    assert_eq!(set_item.helper, "set_Item");
    assert_eq!(set_item.type_arg, fx.point.id);
    assert_eq!(
        rt::resolve_list_method(&fx.universe, &points, "IReadOnlyList`1", 0)
            .map(|call| call.helper),
        Some("get_Item")
    );

    assert!(rt::resolve_list_method(&fx.universe, &strings, "IList`1", 5).is_none());
    assert!(rt::resolve_list_method(&fx.universe, &strings, "IList", 0).is_none());
    let general = fx
        .loader
        .build_array_type(&fx.universe.string(), 2, ArrayKind::General)
        .expect("string[,]");
    assert!(rt::resolve_list_method(&fx.universe, &general, "IList`1", 0).is_none());
    assert!(
        general
            .interfaces()
            .entries
            .iter()
            .all(|entry| !rt::is_implicit_vector_interface(entry.name))
    );
}

#[test]
fn constructors_are_runtime_special_names() {
    let fx = fixture();
    let table = fx
        .loader
        .build_array_type(&int32(&fx), 2, ArrayKind::General)
        .expect("int32[,]");
    for method in table.methods() {
        let special = method.kind().attributes() & rt_abi::METHOD_ATTR_RT_SPECIAL_NAME != 0;
        assert_eq!(special, method.name() == ".ctor", "{}", method.name());
        assert_eq!(
            method.kind().attributes() & rt_abi::METHOD_ATTR_PUBLIC,
            rt_abi::METHOD_ATTR_PUBLIC
        );
    }
    let snapshot = table.snapshot();
    assert!(snapshot.methods.iter().any(|method| method.attributes == 0x1006));
}
