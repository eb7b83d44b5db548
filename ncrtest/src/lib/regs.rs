mod mmio;

pub use mmio::MmioRegisters;

// Mock implementation for testing.
#[cfg(test)]
mod mock;
#[cfg(test)]
pub use mock::{FaultMode, MockController, MockTarget};

/// 32-bit register writes go through this positive offset from the chip
/// base: longword writes decode at a different address than byte reads of
/// the same logical register.
pub const LONG_WRITE_OFFSET: u32 = 0x80;

// Bit flags for the DSTAT register.
pub const DSTAT_DFE: u8 = 1 << 7; // DMA FIFO empty
pub const DSTAT_BF: u8 = 1 << 5; // Bus fault
pub const DSTAT_ABRT: u8 = 1 << 4; // Aborted
pub const DSTAT_SSI: u8 = 1 << 3; // Single-step interrupt
pub const DSTAT_SIR: u8 = 1 << 2; // Script interrupt received
pub const DSTAT_WTD: u8 = 1 << 1; // Watchdog timeout
pub const DSTAT_IID: u8 = 1 << 0; // Illegal instruction detected

// Bit flags for the ISTAT register.
pub const ISTAT_ABRT: u8 = 1 << 7; // Abort operation
pub const ISTAT_RST: u8 = 1 << 6; // Software reset
pub const ISTAT_SIGP: u8 = 1 << 5; // Signal process
pub const ISTAT_CON: u8 = 1 << 3; // Connected
pub const ISTAT_SIP: u8 = 1 << 1; // SCSI interrupt pending
pub const ISTAT_DIP: u8 = 1 << 0; // DMA interrupt pending

// Bit flags for the DMODE register.
pub const DMODE_BL1: u8 = 1 << 7;
pub const DMODE_BL0: u8 = 1 << 6;
pub const DMODE_FC2: u8 = 1 << 5;
pub const DMODE_FC1: u8 = 1 << 4;
pub const DMODE_PD: u8 = 1 << 3;
pub const DMODE_FAM: u8 = 1 << 2;
pub const DMODE_MAN: u8 = 1 << 0;

// Bit flags for the DIEN register (DMA interrupt enables).
pub const DIEN_BF: u8 = 1 << 5;
pub const DIEN_ABRT: u8 = 1 << 4;
pub const DIEN_SSI: u8 = 1 << 3;
pub const DIEN_SIR: u8 = 1 << 2;
pub const DIEN_WTD: u8 = 1 << 1;
pub const DIEN_IID: u8 = 1 << 0;

// Bit flags for the DCNTL register.
pub const DCNTL_CF1: u8 = 1 << 7;
pub const DCNTL_CF0: u8 = 1 << 6;
pub const DCNTL_EA: u8 = 1 << 5; // Enable Ack: must be set before any other access
pub const DCNTL_SSM: u8 = 1 << 4;
pub const DCNTL_LLM: u8 = 1 << 3;
pub const DCNTL_STD: u8 = 1 << 2;
pub const DCNTL_FA: u8 = 1 << 1;
pub const DCNTL_COM: u8 = 1 << 0;

// Bit flags for the SCNTL0 register.
pub const SCNTL0_ARB1: u8 = 1 << 7;
pub const SCNTL0_ARB0: u8 = 1 << 6;
pub const SCNTL0_START: u8 = 1 << 5;
pub const SCNTL0_WATN: u8 = 1 << 4;
pub const SCNTL0_EPC: u8 = 1 << 3; // Enable parity checking
pub const SCNTL0_EPG: u8 = 1 << 2; // Enable parity generation
pub const SCNTL0_AAP: u8 = 1 << 1;
pub const SCNTL0_TRG: u8 = 1 << 0;

// Bit flags for the SCNTL1 register.
pub const SCNTL1_EXC: u8 = 1 << 7;
pub const SCNTL1_ADB: u8 = 1 << 6;
pub const SCNTL1_ESR: u8 = 1 << 5; // Enable selection/reselection
pub const SCNTL1_CON: u8 = 1 << 4;
pub const SCNTL1_RST: u8 = 1 << 3; // Assert SCSI RST
pub const SCNTL1_AESP: u8 = 1 << 2;
pub const SCNTL1_SND: u8 = 1 << 1;
pub const SCNTL1_RCV: u8 = 1 << 0;

// Bit flags for the SSTAT0 register.
pub const SSTAT0_MA: u8 = 1 << 7; // Phase mismatch
pub const SSTAT0_FCMP: u8 = 1 << 6; // Function complete
pub const SSTAT0_STO: u8 = 1 << 5; // Selection timeout
pub const SSTAT0_SEL: u8 = 1 << 4; // Selected
pub const SSTAT0_SGE: u8 = 1 << 3; // SCSI gross error
pub const SSTAT0_UDC: u8 = 1 << 2; // Unexpected disconnect
pub const SSTAT0_RST: u8 = 1 << 1; // SCSI RST received
pub const SSTAT0_PAR: u8 = 1 << 0; // Parity error

// Bit flags for the SXFER register.
pub const SXFER_DHP: u8 = 1 << 7; // Disable halt on parity error

/// The chip's registers, laid out big-endian from the base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Sien,
    Sdid,
    Scntl1,
    Scntl0,
    Socl,
    Sodl,
    Sxfer,
    Scid,
    Sbcl,
    Sbdl,
    Sidl,
    Sfbr,
    Sstat2,
    Sstat1,
    Sstat0,
    Dstat,
    Dsa,
    Ctest3,
    Ctest2,
    Ctest1,
    Ctest0,
    Ctest7,
    Ctest6,
    Ctest5,
    Ctest4,
    Temp,
    Lcrc,
    Ctest8,
    Istat,
    Dfifo,
    Dbc,
    Dnad,
    Dsp,
    Dsps,
    Scratch,
    Dcntl,
    Dwt,
    Dien,
    Dmode,
    Adder,
}

impl Register {
    /// Byte offset from the chip base.
    pub const fn offset(self) -> u32 {
        match self {
            Register::Sien => 0,
            Register::Sdid => 1,
            Register::Scntl1 => 2,
            Register::Scntl0 => 3,
            Register::Socl => 4,
            Register::Sodl => 5,
            Register::Sxfer => 6,
            Register::Scid => 7,
            Register::Sbcl => 8,
            Register::Sbdl => 9,
            Register::Sidl => 10,
            Register::Sfbr => 11,
            Register::Sstat2 => 12,
            Register::Sstat1 => 13,
            Register::Sstat0 => 14,
            Register::Dstat => 15,
            Register::Dsa => 16,
            Register::Ctest3 => 20,
            Register::Ctest2 => 21,
            Register::Ctest1 => 22,
            Register::Ctest0 => 23,
            Register::Ctest7 => 24,
            Register::Ctest6 => 25,
            Register::Ctest5 => 26,
            Register::Ctest4 => 27,
            Register::Temp => 28,
            Register::Lcrc => 32,
            Register::Ctest8 => 33,
            Register::Istat => 34,
            Register::Dfifo => 35,
            Register::Dbc => 36,
            Register::Dnad => 40,
            Register::Dsp => 44,
            Register::Dsps => 48,
            Register::Scratch => 52,
            Register::Dcntl => 56,
            Register::Dwt => 57,
            Register::Dien => 58,
            Register::Dmode => 59,
            Register::Adder => 60,
        }
    }
}

/// Typed access to the controller's register block.
///
/// Reads of the status-class registers have a side effect: reading `Dstat`
/// acknowledges a pending DMA interrupt (clears `ISTAT.DIP` and the `DSTAT`
/// latches), reading `Sstat0` acknowledges a pending SCSI interrupt. The
/// order of status reads is therefore part of the caller's contract, and
/// implementations (including test doubles) must reproduce it. Reads take
/// `&mut self` for exactly this reason.
///
/// `write32` addresses the logical register; applying [`LONG_WRITE_OFFSET`]
/// is the memory-mapped implementation's concern.
pub trait RegisterFile {
    fn read8(&mut self, reg: Register) -> u8;
    fn write8(&mut self, reg: Register, value: u8);
    fn read32(&mut self, reg: Register) -> u32;
    fn write32(&mut self, reg: Register, value: u32);
}
