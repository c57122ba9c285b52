use crate::{CallbackIndex, ChainPool, ContextIndex, FrameArena, SgEntry, SlotState};
use mpt_protocol::{AddressWidth, SgeFlags};
use proptest::prelude::*;

const DEPTH: u16 = 16;
const FRAME_SIZE: usize = 128;

#[derive(Debug, Clone)]
enum Op {
    Acquire(u8),
    Release(u16),
    Submit(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u8..4).prop_map(Op::Acquire),
        (0u16..DEPTH + 2).prop_map(Op::Release),
        (0u16..DEPTH).prop_map(Op::Submit),
    ]
}

fn sg_strategy() -> impl Strategy<Value = Vec<SgEntry>> {
    prop::collection::vec(
        (0u64..0xffff_0000, prop_oneof![Just(0u32), 1u32..0x1_0000]).prop_map(|(a, l)| SgEntry::new(a, l)),
        0..64,
    )
}

proptest! {
    #[test]
    fn frames_are_never_lost_or_shared(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let arena = FrameArena::new(0x10_0000, FRAME_SIZE, DEPTH);
        arena.set_active(true);
        let mut held: Vec<u16> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire(cb) => {
                    if let Ok(h) = arena.acquire(CallbackIndex::new(cb).unwrap()) {
                        prop_assert!(!held.contains(&h.index()));
                        held.push(h.index());
                    } else {
                        prop_assert_eq!(held.len(), DEPTH as usize);
                    }
                }
                Op::Release(index) => {
                    let res = arena.release(index);
                    match held.iter().position(|&i| i == index) {
                        Some(pos) => {
                            prop_assert!(res.is_ok());
                            held.remove(pos);
                            prop_assert!(arena.is_marked_released(index));
                        }
                        None => prop_assert!(res.is_err()),
                    }
                }
                Op::Submit(index) => {
                    let submitted = arena.mark_submitted(index);
                    prop_assert_eq!(submitted.is_some(), held.contains(&index));
                }
            }

            let stats = arena.stats();
            prop_assert_eq!(stats.total, DEPTH as usize);
            prop_assert_eq!(stats.free + stats.owned + stats.submitted, stats.total);
            prop_assert_eq!(stats.owned + stats.submitted, held.len());
            for &index in &held {
                prop_assert_ne!(arena.state(index), Some(SlotState::Free));
            }
        }
    }

    #[test]
    fn bus_addresses_map_back_to_their_frame(
        base in (0u64..0x1000_0000).prop_map(|b| b * 16),
        frame_dwords in 8usize..64,
        depth in 1u16..512,
        pick in any::<u16>(),
    ) {
        let arena = FrameArena::new(base, frame_dwords * 4, depth);
        let index = ContextIndex(pick % depth);
        let addr = arena.bus_addr_of(index).unwrap();
        prop_assert_eq!(arena.index_of(addr), Ok(index));
        prop_assert!(arena.index_of(addr + 4).is_err());
        prop_assert!(arena.bus_addr_of(ContextIndex(depth)).is_none());
    }

    #[test]
    fn chain_buffers_are_returned(
        lists in prop::collection::vec(sg_strategy(), 1..8),
        chains in 1u16..8,
    ) {
        let arena = FrameArena::new(0x10_0000, FRAME_SIZE, 4);
        arena.set_active(true);
        let pool = ChainPool::new(0x20_0000, FRAME_SIZE, chains, 4);
        let h = arena.acquire(CallbackIndex::new(1).unwrap()).unwrap();

        for list in &lists {
            let mut frame = arena.lock_frame(h.index()).unwrap();
            let res = pool.build_sgl(&mut frame, 48, list, SgeFlags::empty(), AddressWidth::Sge32);
            match res {
                Ok(used) => prop_assert_eq!(pool.chains_of(h.index()).len(), used),
                Err(_) => prop_assert!(pool.chains_of(h.index()).is_empty()),
            }
            prop_assert_eq!(pool.free_count() + pool.chains_of(h.index()).len(), chains as usize);
        }

        pool.release_for_request(h.index());
        prop_assert_eq!(pool.free_count(), chains as usize);
    }
}
