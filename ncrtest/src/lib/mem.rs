use std::sync::atomic::{fence, Ordering};

use crate::error::{NcrError, NcrResult};

/// A chip-visible (bus) address. The controller fetches scripts and moves
/// data through these; they are only meaningful inside a [`DmaArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BusAddr(pub u32);

impl std::fmt::Display for BusAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl BusAddr {
    /// Wraps on overflow; a wrapped address falls outside every region and
    /// is rejected at the access.
    pub fn offset(self, bytes: u32) -> BusAddr {
        BusAddr(self.0.wrapping_add(bytes))
    }
}

/// Memory classes the allocator distinguishes. There is no default class;
/// every allocation states which bus the buffer must be reachable from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemClass {
    /// Chip-local memory: reachable by every bus master.
    Chip,
    /// General bus-reachable ("fast") memory.
    Fast,
}

struct Region {
    base: u32,
    bytes: Vec<u8>,
    // Free blocks as (offset, size), kept sorted by offset.
    free: Vec<(u32, u32)>,
}

impl Region {
    fn new(base: u32, size: u32) -> Self {
        // Clamp so base + size cannot wrap.
        let size = size.min(u32::MAX - base);
        Region {
            base,
            bytes: vec![0; size as usize],
            free: vec![(0, size)],
        }
    }

    fn contains(&self, addr: u32, len: u32) -> bool {
        // Widen so addresses near the top of the space cannot wrap.
        let end = addr as u64 + len as u64;
        addr >= self.base && end <= self.base as u64 + self.bytes.len() as u64
    }

    /// First-fit allocation.
    fn alloc(&mut self, size: u32) -> Option<u32> {
        let idx = self.free.iter().position(|&(_, len)| len >= size)?;
        let (offset, len) = self.free[idx];
        if len == size {
            self.free.remove(idx);
        } else {
            self.free[idx] = (offset + size, len - size);
        }
        Some(self.base + offset)
    }

    fn dealloc(&mut self, addr: u32, size: u32) -> NcrResult<()> {
        if !self.contains(addr, size) {
            return Err(NcrError::BadFree(BusAddr(addr), size));
        }
        let offset = addr - self.base;
        // Reject frees overlapping a free block.
        for &(start, len) in &self.free {
            if offset < start + len && start < offset + size {
                return Err(NcrError::BadFree(BusAddr(addr), size));
            }
        }
        let idx = self.free.partition_point(|&(start, _)| start < offset);
        self.free.insert(idx, (offset, size));
        // Coalesce with neighbours.
        if idx + 1 < self.free.len() && offset + size == self.free[idx + 1].0 {
            self.free[idx].1 += self.free[idx + 1].1;
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].0 + self.free[idx - 1].1 == offset {
            self.free[idx - 1].1 += self.free[idx].1;
            self.free.remove(idx);
        }
        Ok(())
    }
}

/// DMA-visible memory, split into one region per [`MemClass`].
///
/// Buffers handed out by [`DmaArena::alloc`] must not be freed while a script
/// referencing them is outstanding: the chip is a concurrent actor and may
/// still be mid-fetch against those addresses.
pub struct DmaArena {
    // Chip first, fast second.
    regions: [Region; 2],
}

impl DmaArena {
    pub fn new(chip_base: u32, chip_size: u32, fast_base: u32, fast_size: u32) -> Self {
        DmaArena {
            regions: [
                Region::new(chip_base, chip_size),
                Region::new(fast_base, fast_size),
            ],
        }
    }

    fn region_mut(&mut self, class: MemClass) -> &mut Region {
        match class {
            MemClass::Chip => &mut self.regions[0],
            MemClass::Fast => &mut self.regions[1],
        }
    }

    fn holder(&self, addr: BusAddr, len: u32) -> NcrResult<&Region> {
        self.regions
            .iter()
            .find(|r| r.contains(addr.0, len))
            .ok_or(NcrError::BadAddress(addr))
    }

    fn holder_mut(&mut self, addr: BusAddr, len: u32) -> NcrResult<&mut Region> {
        self.regions
            .iter_mut()
            .find(|r| r.contains(addr.0, len))
            .ok_or(NcrError::BadAddress(addr))
    }

    /// Allocate `size` bytes of the given class. The returned buffer is
    /// zeroed.
    pub fn alloc(&mut self, size: u32, class: MemClass) -> NcrResult<BusAddr> {
        let region = self.region_mut(class);
        match region.alloc(size) {
            Some(addr) => {
                let offset = (addr - region.base) as usize;
                region.bytes[offset..offset + size as usize].fill(0);
                Ok(BusAddr(addr))
            }
            None => Err(NcrError::NoMemory(class)),
        }
    }

    /// Return a previously allocated buffer. Size must match the allocation.
    pub fn free(&mut self, addr: BusAddr, size: u32) -> NcrResult<()> {
        let region = self.holder_mut(addr, size)?;
        region.dealloc(addr.0, size)
    }

    pub fn write(&mut self, addr: BusAddr, data: &[u8]) -> NcrResult<()> {
        let region = self.holder_mut(addr, data.len() as u32)?;
        let offset = (addr.0 - region.base) as usize;
        region.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, addr: BusAddr, out: &mut [u8]) -> NcrResult<()> {
        let region = self.holder(addr, out.len() as u32)?;
        let offset = (addr.0 - region.base) as usize;
        out.copy_from_slice(&region.bytes[offset..offset + out.len()]);
        Ok(())
    }

    pub fn read_u8(&self, addr: BusAddr) -> NcrResult<u8> {
        let mut byte = [0u8];
        self.read(addr, &mut byte)?;
        Ok(byte[0])
    }

    /// Bus-master copy, as the controller's memory-to-memory move performs
    /// it. Regions may differ; ranges must not overlap.
    pub fn copy(&mut self, src: BusAddr, dst: BusAddr, len: u32) -> NcrResult<()> {
        let mut buf = vec![0u8; len as usize];
        self.read(src, &mut buf)?;
        self.write(dst, &buf)
    }
}

/// Make all CPU writes to source buffers globally visible before the chip's
/// sequencer is started. Must be called before every `DSP` write.
pub fn pre_dma_barrier() {
    fence(Ordering::SeqCst);
}

/// Discard stale CPU views of destination buffers after the chip has stopped.
/// Must be called before returning transferred data to the caller.
pub fn post_dma_barrier() {
    fence(Ordering::SeqCst);
}
