use super::*;

use crate::ir::types::{CallConv, FuncType, ScalarType, TypeTable, ValType};

const U8: ValType = ValType::Scalar(ScalarType::U8);
const U32: ValType = ValType::Scalar(ScalarType::U32);
const U64: ValType = ValType::Scalar(ScalarType::U64);

#[test]
fn fields_get_natural_alignment() {
    let types = TypeTable::default();
    let mut f = FrameLayout::new();

    assert_eq!(f.add_field(&types, "a", U8), 0);
    assert_eq!(f.add_field(&types, "b", U64), 8);
    assert_eq!(f.add_field(&types, "c", U8), 16);

    assert_eq!(f.field_offset("b", "f"), 8);
    assert!(f.has_field("c"));
    assert!(!f.has_field("d"));
    // Rounded up to the frame's largest alignment.
    assert_eq!(f.size(), 24);
}

#[test]
#[should_panic(expected = "unknown field $result in frame of orphan")]
fn missing_frame_field_names_the_function() {
    let f = FrameLayout::new();
    let _ = f.field_offset("$result", "orphan");
}

#[test]
fn empty_frame_has_no_size() {
    let f = FrameLayout::new();
    assert!(f.is_empty());
    assert_eq!(f.size(), 0);
}

#[test]
fn coroutine_header_layout_is_fixed() {
    let types = TypeTable::default();
    let h = coroutine_frame_header(&types);

    assert_eq!(h.field_offset("$func", "co"), 0);
    assert_eq!(h.field_offset("$sp", "co"), 4);
    assert_eq!(h.field_offset("$step", "co"), 8);
    assert_eq!(h.field_offset("$prevFrame", "co"), 12);
    assert_eq!(h.size(), 16);
}

#[test]
fn call_frame_holds_aggregate_params_only() {
    let mut types = TypeTable::default();
    let pair = types.add_struct(Some("Pair".to_string()));
    types.add_field(pair, "x", U32, 1);
    types.add_field(pair, "y", U32, 1);
    types.finalize_struct(pair);

    let ft = FuncType {
        params: vec![U32, ValType::Struct(pair)],
        result: Some(U32),
        conv: CallConv::Fyr,
    };
    let f = call_frame(&types, &ft);

    // Scalars travel on the target stack; only the struct parameter needs
    // a frame slot. A scalar result of a plain function does too.
    assert!(!f.has_field("$p0"));
    assert!(f.has_field("$p1"));
    assert!(!f.has_field("$result"));
}

#[test]
fn call_frame_reserves_result_for_aggregates_and_coroutines() {
    let mut types = TypeTable::default();
    let pair = types.add_struct(Some("Pair".to_string()));
    types.add_field(pair, "x", U32, 1);
    types.add_field(pair, "y", U32, 1);
    types.finalize_struct(pair);

    let by_value = FuncType {
        params: vec![],
        result: Some(ValType::Struct(pair)),
        conv: CallConv::Fyr,
    };
    assert!(call_frame(&types, &by_value).has_field("$result"));

    let suspendable = FuncType {
        params: vec![],
        result: Some(U32),
        conv: CallConv::FyrCoroutine,
    };
    assert!(call_frame(&types, &suspendable).has_field("$result"));
}
