//! Scatter-gather lists and chain buffers.
//!
//! A request frame has room for a handful of simple elements after its fixed fields. When a
//! transfer needs more, the last slot of the frame holds a chain element pointing at a chain
//! buffer, which is filled the same way and may itself chain on. Every chain element records
//! the length of the segment it points at and the offset of that segment's own chain element
//! (zero for the final segment).
//!
//! Chain buffers come from their own pool, carved from one DMA region. The pool tracks which
//! request owns which chain (`req_to_chain`, then `chain_to_chain`), so releasing a request
//! frame returns its whole chain.

use std::collections::VecDeque;
use std::sync::Mutex;

use mpt_protocol::header;
use mpt_protocol::sge::{self, MAX_SGE_LENGTH, TERMINATOR_FLAGS};
use mpt_protocol::{AddressWidth, Sge, SgeFlags};

use crate::arena::Frame;
use crate::error::ChainError;
use crate::hw::Hardware;
use crate::sync::lock;

/// One contiguous piece of a host buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub addr: u64,
    pub len: u32,
}

impl SgEntry {
    pub fn new(addr: u64, len: u32) -> Self {
        SgEntry { addr, len }
    }
}

struct ChainInner {
    free: VecDeque<u16>,
    req_to_chain: Vec<Option<u16>>,
    chain_to_chain: Vec<Option<u16>>,
    data: Vec<Box<[u8]>>,
}

impl ChainInner {
    fn release_for_request(&mut self, req: u16) -> usize {
        let mut next = self.req_to_chain.get_mut(req as usize).and_then(Option::take);
        let mut released = 0;
        while let Some(idx) = next {
            next = self.chain_to_chain[idx as usize].take();
            self.free.push_back(idx);
            released += 1;
        }
        released
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Segment {
    Frame,
    Chain(u16),
}

pub struct ChainPool {
    base: u64,
    chain_size: usize,
    inner: Mutex<ChainInner>,
}

impl ChainPool {
    /// `count` chain buffers of `chain_size` bytes each starting at `base`, for a request queue
    /// of `req_depth` frames.
    pub fn new(base: u64, chain_size: usize, count: u16, req_depth: u16) -> Self {
        ChainPool {
            base,
            chain_size,
            inner: Mutex::new(ChainInner {
                free: (0..count).collect(),
                req_to_chain: vec![None; req_depth as usize],
                chain_to_chain: vec![None; count as usize],
                data: (0..count)
                    .map(|_| vec![0u8; chain_size].into_boxed_slice())
                    .collect(),
            }),
        }
    }

    pub fn total(&self) -> usize {
        lock(&self.inner).data.len()
    }

    pub fn free_count(&self) -> usize {
        lock(&self.inner).free.len()
    }

    pub fn bus_addr(&self, idx: u16) -> u64 {
        self.base + idx as u64 * self.chain_size as u64
    }

    /// Chain buffers linked to request `req`, in list order.
    pub fn chains_of(&self, req: u16) -> Vec<u16> {
        let inner = lock(&self.inner);
        let mut out = Vec::new();
        let mut next = inner.req_to_chain.get(req as usize).copied().flatten();
        while let Some(idx) = next {
            out.push(idx);
            next = inner.chain_to_chain[idx as usize];
        }
        out
    }

    /// Returns every chain buffer owned by request `req`; returns how many were freed.
    pub fn release_for_request(&self, req: u16) -> usize {
        lock(&self.inner).release_for_request(req)
    }

    /// Copy of a chain buffer's host bytes.
    pub fn chain_bytes(&self, idx: u16) -> Option<Vec<u8>> {
        lock(&self.inner).data.get(idx as usize).map(|d| d.to_vec())
    }

    /// Writes the host copy of every chain buffer owned by `req` to DMA memory.
    pub fn flush_to_dma(&self, req: u16, hw: &dyn Hardware) {
        let inner = lock(&self.inner);
        let mut next = inner.req_to_chain.get(req as usize).copied().flatten();
        while let Some(idx) = next {
            hw.write_dma(self.bus_addr(idx), &inner.data[idx as usize]);
            next = inner.chain_to_chain[idx as usize];
        }
    }

    /// Writes a scatter-gather list for `entries` into `frame` starting at byte `offset`,
    /// spilling into chain buffers as needed. Returns the number of chain buffers used.
    ///
    /// On failure no chain buffer stays linked to the frame. Releasing the frame itself is left
    /// to the caller.
    pub fn build_sgl(
        &self,
        frame: &mut Frame,
        offset: usize,
        entries: &[SgEntry],
        direction: SgeFlags,
        width: AddressWidth,
    ) -> Result<usize, ChainError> {
        let entries: Vec<SgEntry> = entries.iter().copied().filter(|e| e.len > 0).collect();
        for e in &entries {
            if e.len > MAX_SGE_LENGTH {
                return Err(ChainError::LengthTooLarge(e.len));
            }
            let end = e
                .addr
                .checked_add(e.len as u64)
                .ok_or(ChainError::AddressTooWide(e.addr))?;
            if width == AddressWidth::Sge32 && end > 1 << 32 {
                return Err(ChainError::AddressTooWide(e.addr));
            }
        }

        let sge_size = width.simple_size();
        if offset + sge_size > frame.len() {
            return Err(ChainError::NoRoom(offset));
        }

        let req = frame.index();
        let mut inner = lock(&self.inner);
        inner.release_for_request(req);
        let res = self.write_segments(&mut inner, frame, offset, &entries, direction, width);
        if res.is_err() {
            inner.release_for_request(req);
        }
        res
    }

    fn write_segments(
        &self,
        inner: &mut ChainInner,
        frame: &mut Frame,
        offset: usize,
        entries: &[SgEntry],
        direction: SgeFlags,
        width: AddressWidth,
    ) -> Result<usize, ChainError> {
        let sge_size = width.simple_size();
        let req = frame.index();
        let frame_bytes = frame.as_bytes_mut();

        if entries.is_empty() {
            sge::encode(&mut frame_bytes[offset..], width, &Sge::terminator())?;
            header::set_chain_offset(frame_bytes, 0);
            return Ok(0);
        }

        let mut seg = Segment::Frame;
        let mut off = offset;
        // Where the chain element pointing at `seg` lives, and the address it points to.
        let mut link: Option<(Segment, usize, u64)> = None;
        let mut remaining = entries;
        let mut used = 0;

        loop {
            let cap = match seg {
                Segment::Frame => frame_bytes.len(),
                Segment::Chain(_) => self.chain_size,
            };
            let slots = (cap - off) / sge_size;
            if slots == 0 {
                return Err(ChainError::NoRoom(off));
            }

            if remaining.len() <= slots {
                for (i, e) in remaining.iter().enumerate() {
                    let flags = if i + 1 == remaining.len() {
                        direction | TERMINATOR_FLAGS
                    } else {
                        direction
                    };
                    let buf = segment_buf(frame_bytes, inner, seg);
                    sge::encode(&mut buf[off..], width, &Sge::simple(flags, e.len, e.addr))?;
                    off += sge_size;
                }
                match link {
                    Some((at, at_off, address)) => {
                        let chain = Sge::Chain {
                            length: off as u16,
                            next_chain_offset: 0,
                            address,
                        };
                        sge::encode(&mut segment_buf(frame_bytes, inner, at)[at_off..], width, &chain)?;
                    }
                    None => header::set_chain_offset(frame_bytes, 0),
                }
                return Ok(used);
            }

            let direct = slots - 1;
            for (i, e) in remaining[..direct].iter().enumerate() {
                let flags = if i + 1 == direct {
                    direction | SgeFlags::LAST_ELEMENT
                } else {
                    direction
                };
                let buf = segment_buf(frame_bytes, inner, seg);
                sge::encode(&mut buf[off..], width, &Sge::simple(flags, e.len, e.addr))?;
                off += sge_size;
            }
            remaining = &remaining[direct..];

            match link {
                Some((at, at_off, address)) => {
                    let chain = Sge::Chain {
                        length: (off + sge_size) as u16,
                        next_chain_offset: (off / 4) as u8,
                        address,
                    };
                    sge::encode(&mut segment_buf(frame_bytes, inner, at)[at_off..], width, &chain)?;
                }
                None => header::set_chain_offset(frame_bytes, (off / 4) as u8),
            }

            let next = inner.free.pop_front().ok_or(ChainError::Exhausted)?;
            match seg {
                Segment::Frame => inner.req_to_chain[req as usize] = Some(next),
                Segment::Chain(cur) => inner.chain_to_chain[cur as usize] = Some(next),
            }
            inner.data[next as usize].fill(0);
            used += 1;

            // The element itself is written once the next segment's length is known.
            link = Some((seg, off, self.bus_addr(next)));
            seg = Segment::Chain(next);
            off = 0;
        }
    }
}

fn segment_buf<'a>(frame: &'a mut [u8], inner: &'a mut ChainInner, seg: Segment) -> &'a mut [u8] {
    match seg {
        Segment::Frame => frame,
        Segment::Chain(idx) => &mut inner.data[idx as usize],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::FrameArena;
    use crate::registry::CallbackIndex;

    const CHAIN_BASE: u64 = 0x20_0000;

    fn setup(chains: u16) -> (FrameArena, ChainPool) {
        let arena = FrameArena::new(0x10_0000, 128, 4);
        arena.set_active(true);
        (arena, ChainPool::new(CHAIN_BASE, 128, chains, 4))
    }

    fn entries(n: usize) -> Vec<SgEntry> {
        (0..n)
            .map(|i| SgEntry::new(0x8000_0000 + i as u64 * 0x1000, 0x1000))
            .collect()
    }

    fn simple_flags(buf: &[u8]) -> SgeFlags {
        match sge::decode(buf).unwrap() {
            Sge::Simple { flags, .. } => flags,
            other => panic!("expected simple element, got {other:?}"),
        }
    }

    #[test]
    fn empty_list_is_a_single_terminator() {
        let (arena, pool) = setup(2);
        let h = arena.acquire(CallbackIndex::new(1).unwrap()).unwrap();
        let mut frame = arena.lock_frame(h.index()).unwrap();
        let sgl = [SgEntry::new(0x1000, 0)];
        let used = pool
            .build_sgl(&mut frame, 48, &sgl, SgeFlags::empty(), AddressWidth::Sge32)
            .unwrap();
        assert_eq!(used, 0);
        assert_eq!(sge::decode(&frame.as_bytes()[48..]).unwrap(), Sge::terminator());
        assert_eq!(frame.as_bytes()[header::CHAIN_OFFSET_BYTE], 0);
    }

    #[test]
    fn short_list_fits_in_the_frame() {
        let (arena, pool) = setup(2);
        let h = arena.acquire(CallbackIndex::new(1).unwrap()).unwrap();
        let mut frame = arena.lock_frame(h.index()).unwrap();
        let mut sgl = entries(3);
        sgl.insert(1, SgEntry::new(0x9000_0000, 0));
        let used = pool
            .build_sgl(&mut frame, 48, &sgl, SgeFlags::HOST_TO_IOC, AddressWidth::Sge32)
            .unwrap();
        assert_eq!(used, 0);

        let bytes = frame.as_bytes();
        assert_eq!(simple_flags(&bytes[48..]), SgeFlags::HOST_TO_IOC);
        assert_eq!(
            sge::decode(&bytes[56..]).unwrap().address(),
            0x8000_1000,
            "zero-length entry must be skipped"
        );
        assert_eq!(simple_flags(&bytes[64..]), SgeFlags::HOST_TO_IOC | TERMINATOR_FLAGS);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn long_list_spills_into_chain_buffers() {
        let (arena, pool) = setup(4);
        let h = arena.acquire(CallbackIndex::new(1).unwrap()).unwrap();
        let mut frame = arena.lock_frame(h.index()).unwrap();
        // 3 simples + chain in the frame, 15 + chain in the first buffer, 5 in the second.
        let used = pool
            .build_sgl(&mut frame, 96, &entries(23), SgeFlags::empty(), AddressWidth::Sge32)
            .unwrap();
        assert_eq!(used, 2);

        let bytes = frame.as_bytes();
        assert_eq!(bytes[header::CHAIN_OFFSET_BYTE], 120 / 4);
        assert_eq!(simple_flags(&bytes[112..]), SgeFlags::LAST_ELEMENT);

        let chains = pool.chains_of(h.index());
        assert_eq!(chains.len(), 2);
        assert_eq!(
            sge::decode(&bytes[120..]).unwrap(),
            Sge::Chain {
                length: 128,
                next_chain_offset: 120 / 4,
                address: pool.bus_addr(chains[0]),
            }
        );

        let first = pool.chain_bytes(chains[0]).unwrap();
        assert_eq!(simple_flags(&first[112..]), SgeFlags::LAST_ELEMENT);
        assert_eq!(
            sge::decode(&first[120..]).unwrap(),
            Sge::Chain {
                length: 40,
                next_chain_offset: 0,
                address: pool.bus_addr(chains[1]),
            }
        );

        let second = pool.chain_bytes(chains[1]).unwrap();
        assert_eq!(simple_flags(&second[32..]), TERMINATOR_FLAGS);
        assert_eq!(sge::decode(&second[32..]).unwrap().address(), 0x8000_0000 + 22 * 0x1000);

        assert_eq!(pool.release_for_request(h.index()), 2);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhaustion_returns_every_chain_acquired() {
        let (arena, pool) = setup(1);
        let h = arena.acquire(CallbackIndex::new(1).unwrap()).unwrap();
        let mut frame = arena.lock_frame(h.index()).unwrap();
        let res = pool.build_sgl(&mut frame, 96, &entries(23), SgeFlags::empty(), AddressWidth::Sge32);
        assert_eq!(res, Err(ChainError::Exhausted));
        assert_eq!(pool.free_count(), 1);
        assert!(pool.chains_of(h.index()).is_empty());
    }

    #[test]
    fn narrow_elements_reject_high_addresses() {
        let (arena, pool) = setup(1);
        let h = arena.acquire(CallbackIndex::new(1).unwrap()).unwrap();
        let mut frame = arena.lock_frame(h.index()).unwrap();
        let sgl = [SgEntry::new(0x1_0000_0000, 512)];
        assert_eq!(
            pool.build_sgl(&mut frame, 48, &sgl, SgeFlags::empty(), AddressWidth::Sge32),
            Err(ChainError::AddressTooWide(0x1_0000_0000))
        );
        let used = pool
            .build_sgl(&mut frame, 48, &sgl, SgeFlags::empty(), AddressWidth::Sge64)
            .unwrap();
        assert_eq!(used, 0);
        assert_eq!(sge::decode(&frame.as_bytes()[48..]).unwrap().address(), 0x1_0000_0000);
    }

    #[test]
    fn elements_ending_past_the_address_space_are_rejected() {
        let (arena, pool) = setup(1);
        let h = arena.acquire(CallbackIndex::new(1).unwrap()).unwrap();
        let mut frame = arena.lock_frame(h.index()).unwrap();
        let sgl = [SgEntry::new(u64::MAX - 0xff, 0x1000)];
        for width in [AddressWidth::Sge32, AddressWidth::Sge64] {
            assert_eq!(
                pool.build_sgl(&mut frame, 48, &sgl, SgeFlags::empty(), width),
                Err(ChainError::AddressTooWide(u64::MAX - 0xff))
            );
        }
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn oversized_elements_and_offsets_are_rejected() {
        let (arena, pool) = setup(1);
        let h = arena.acquire(CallbackIndex::new(1).unwrap()).unwrap();
        let mut frame = arena.lock_frame(h.index()).unwrap();
        assert_eq!(
            pool.build_sgl(
                &mut frame,
                48,
                &[SgEntry::new(0x1000, MAX_SGE_LENGTH + 1)],
                SgeFlags::empty(),
                AddressWidth::Sge32
            ),
            Err(ChainError::LengthTooLarge(MAX_SGE_LENGTH + 1))
        );
        assert_eq!(
            pool.build_sgl(&mut frame, 124, &entries(1), SgeFlags::empty(), AddressWidth::Sge32),
            Err(ChainError::NoRoom(124))
        );
    }
}
