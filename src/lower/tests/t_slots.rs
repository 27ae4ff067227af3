use super::*;

use crate::wasm::StackType;

#[test]
fn slots_are_typed() {
    let mut pool = SlotPool::new();
    let mut used: SlotUse = Vec::new();

    assert_eq!(pool.allocate(StackType::I32, &mut used), 0);
    // A live i32 slot cannot serve an f64 request.
    assert_eq!(pool.allocate(StackType::F64, &mut used), 1);
    assert_eq!(pool.slots(), &[StackType::I32, StackType::F64]);
}

#[test]
fn sibling_branches_share_slots() {
    let mut pool = SlotPool::new();
    let mut used: SlotUse = Vec::new();

    // A variable live before the branch keeps its slot in both arms.
    assert_eq!(pool.allocate(StackType::I32, &mut used), 0);

    let mut then_arm = used.clone();
    assert_eq!(pool.allocate(StackType::I32, &mut then_arm), 1);

    // The else arm forks from the pre-branch flags, so the then arm's slot
    // is free again.
    let mut else_arm = used.clone();
    assert_eq!(pool.allocate(StackType::I32, &mut else_arm), 1);

    assert_eq!(pool.len(), 2);
}

#[test]
fn flags_shorter_than_the_pool_count_as_free() {
    let mut pool = SlotPool::new();

    let mut a: SlotUse = Vec::new();
    pool.allocate(StackType::I64, &mut a);
    pool.allocate(StackType::I64, &mut a);

    // A fresh flag vector sees every slot as reusable.
    let mut b: SlotUse = Vec::new();
    assert_eq!(pool.allocate(StackType::I64, &mut b), 0);
    assert_eq!(pool.allocate(StackType::I64, &mut b), 1);
    assert_eq!(pool.len(), 2);
}
