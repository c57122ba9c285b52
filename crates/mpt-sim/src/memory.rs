//! Host memory as the simulated controller sees it: one flat window handed out by a bump
//! allocator. Accesses outside what has been allocated read as zero and are otherwise ignored.

use mpt_engine::{DmaError, DmaRegion};

pub struct DmaMemory {
    base: u64,
    limit: usize,
    bytes: Vec<u8>,
}

impl DmaMemory {
    pub fn new(base: u64, limit: usize) -> Self {
        DmaMemory {
            base,
            limit,
            bytes: Vec::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    pub fn alloc(&mut self, len: usize, align: usize) -> Result<DmaRegion, DmaError> {
        let align = align.max(1) as u64;
        let start = (self.base + self.bytes.len() as u64).next_multiple_of(align);
        let end = start + len as u64;
        let size = (end - self.base) as usize;
        if size > self.limit {
            return Err(DmaError::OutOfMemory { len });
        }
        self.bytes.resize(size, 0);
        Ok(DmaRegion {
            bus_addr: start,
            len,
        })
    }

    fn range(&self, addr: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start..end)
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        match self.range(addr, buf.len()) {
            Some(r) => {
                buf.copy_from_slice(&self.bytes[r]);
                true
            }
            None => {
                buf.fill(0);
                false
            }
        }
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> bool {
        match self.range(addr, data.len()) {
            Some(r) => {
                self.bytes[r].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub fn read_vec(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut mem = DmaMemory::new(0x1000_0000, 4096);
        let a = mem.alloc(10, 16).unwrap();
        let b = mem.alloc(32, 64).unwrap();
        assert_eq!(a.bus_addr, 0x1000_0000);
        assert_eq!(b.bus_addr % 64, 0);
        assert!(b.bus_addr >= a.end());
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut mem = DmaMemory::new(0x1000_0000, 64);
        assert!(mem.alloc(48, 16).is_ok());
        assert_eq!(mem.alloc(48, 16), Err(DmaError::OutOfMemory { len: 48 }));
    }

    #[test]
    fn out_of_window_access_is_ignored() {
        let mut mem = DmaMemory::new(0x1000_0000, 64);
        let r = mem.alloc(16, 4).unwrap();
        assert!(mem.write(r.bus_addr, &[1, 2, 3, 4]));
        assert!(!mem.write(r.bus_addr + 14, &[0; 4]));
        let mut buf = [0xffu8; 4];
        assert!(!mem.read(0x10, &mut buf));
        assert_eq!(buf, [0; 4]);
        assert_eq!(mem.read_vec(r.bus_addr, 4), vec![1, 2, 3, 4]);
    }
}
