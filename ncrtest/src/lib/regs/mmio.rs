use super::{Register, RegisterFile, LONG_WRITE_OFFSET};

/// Memory-mapped register access over the live chip.
///
/// The register block is big-endian; 8-bit accesses go straight to the
/// field's offset, 32-bit writes go through [`LONG_WRITE_OFFSET`].
#[derive(Clone, Copy)]
pub struct MmioRegisters {
    base: *mut u8,
}

// Safety: the chip is a single shared peripheral; exclusive use is the
// caller's responsibility (one controller instance, one outstanding script).
unsafe impl Send for MmioRegisters {}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must be the virtual address of the controller's register
    /// block, mapped uncached, and must stay valid for the lifetime of the
    /// returned value.
    pub unsafe fn new(base: *mut u8) -> Self {
        MmioRegisters { base }
    }
}

impl RegisterFile for MmioRegisters {
    fn read8(&mut self, reg: Register) -> u8 {
        unsafe { self.base.add(reg.offset() as usize).read_volatile() }
    }

    fn write8(&mut self, reg: Register, value: u8) {
        unsafe { self.base.add(reg.offset() as usize).write_volatile(value) }
    }

    fn read32(&mut self, reg: Register) -> u32 {
        let ptr = unsafe { self.base.add(reg.offset() as usize) } as *const u32;
        u32::from_be(unsafe { ptr.read_volatile() })
    }

    fn write32(&mut self, reg: Register, value: u32) {
        // Longword writes decode at a shifted address; see LONG_WRITE_OFFSET.
        let ptr = unsafe {
            self.base
                .add((LONG_WRITE_OFFSET + reg.offset()) as usize)
        } as *mut u32;
        unsafe { ptr.write_volatile(value.to_be()) }
    }
}
