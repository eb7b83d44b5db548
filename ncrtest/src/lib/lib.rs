mod bridge;
mod error;
mod exec;
mod init;
mod mem;
pub mod regs;
mod scan;
pub mod scsi;
mod script;
mod transfer;

pub use bridge::{CancelHandle, CompletionBridge, CompletionState, InterruptHost, IrqHandler};
pub use error::{ControllerFault, DeviceFault, FaultKind, NcrError, NcrResult, RegisterSnapshot};
pub use exec::{execute_blocking, execute_polling, Deadline, Outcome};
pub use init::{detect, init_dma, init_scsi, reset};
pub use mem::{post_dma_barrier, pre_dma_barrier, BusAddr, DmaArena, MemClass};
pub use regs::{MmioRegisters, Register, RegisterFile, LONG_WRITE_OFFSET};
pub use scan::{scan_bus, ProbeResult, ScanReport};
pub use scsi::{Cdb, CompletionModel, EngineConfig, InquiryData, TransactionEngine};
pub use script::{
    decode_script, Instruction, Phase, Script, ScriptBuilder, MAX_SG_SEGMENTS, TOKEN_COMPLETE,
    TOKEN_DMA_DONE, TOKEN_SELECT_FAILED,
};
pub use transfer::{run_gather, run_transfer, Pattern};

// Mock implementation for testing.
#[cfg(test)]
pub use regs::{FaultMode, MockController, MockTarget};

/// Initialise logging for tests.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use simplelog::{Config, LevelFilter, TestLogger};

    // The logger can only be initialised once, but we don't know the order of
    // tests. Therefore we ignore the result.
    let _ = TestLogger::init(LevelFilter::Trace, Config::default());
}
