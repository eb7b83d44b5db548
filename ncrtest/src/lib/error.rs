use thiserror::Error;

use crate::mem::{BusAddr, MemClass};

/// Register state captured when a failure is observed. Carried on every
/// controller-class error so a failure can be diagnosed without re-running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub istat: u8,
    pub dstat: u8,
    pub sstat0: u8,
    pub dsp: u32,
    pub dsps: u32,
}

impl std::fmt::Display for RegisterSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ISTAT={:#04x} DSTAT={:#04x} SSTAT0={:#04x} DSP={:#010x} DSPS={:#010x}",
            self.istat, self.dstat, self.sstat0, self.dsp, self.dsps
        )
    }
}

/// What the controller reported when a script went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    IllegalInstruction,
    Aborted,
    Watchdog,
    BusFault,
    /// The save register held a value that is neither the completion token
    /// nor the selection-failure token of the running script.
    UnexpectedToken(u32),
    /// An unexpected SCSI-side interrupt; the payload is SSTAT0.
    ScsiInterrupt(u8),
    /// The blocking waiter was woken without a captured completion.
    SpuriousWake,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::IllegalInstruction => write!(f, "illegal instruction"),
            FaultKind::Aborted => write!(f, "script aborted"),
            FaultKind::Watchdog => write!(f, "watchdog timer expired"),
            FaultKind::BusFault => write!(f, "bus fault"),
            FaultKind::UnexpectedToken(t) => write!(f, "unexpected token {:#010x}", t),
            FaultKind::ScsiInterrupt(s) => write!(f, "SCSI interrupt (SSTAT0={:#04x})", s),
            FaultKind::SpuriousWake => write!(f, "spurious wake"),
        }
    }
}

/// A controller-level failure plus the registers at the time it was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} [{snapshot}]")]
pub struct ControllerFault {
    pub kind: FaultKind,
    pub snapshot: RegisterSnapshot,
}

/// Device-level failures: the bus handshake itself worked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceFault {
    #[error("no device responded to selection")]
    NoDevice,
    #[error("device returned CHECK CONDITION")]
    CheckCondition,
    #[error("device returned unexpected status {0:#04x}")]
    UnexpectedStatus(u8),
}

/// Everything that can go wrong in this crate.
///
/// Nothing here is retried internally; retry policy belongs to the caller.
#[derive(Debug, Clone, Error)]
pub enum NcrError {
    /// Controller absent or undetectable; aborts the run.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Chip-level protocol error; a chip reset is recommended before reuse.
    #[error("controller error: {0}")]
    Controller(ControllerFault),
    /// The target misbehaved; no chip-level reset required.
    #[error("device error: {0}")]
    Device(DeviceFault),
    /// The bounded wait elapsed without a completion.
    #[error("timed out waiting for script completion")]
    Timeout,
    /// The blocking wait was cancelled before completion.
    #[error("wait cancelled")]
    Cancelled,
    /// Post-transfer content check failed. Data-level, not chip-level.
    #[error("verify mismatch at offset {offset:#x}: expected {expected:#04x}, actual {actual:#04x}")]
    VerifyMismatch {
        offset: u32,
        expected: u8,
        actual: u8,
    },
    #[error("out of {0:?} memory")]
    NoMemory(MemClass),
    #[error("address {0} out of arena bounds")]
    BadAddress(BusAddr),
    #[error("bad free of {0} ({1} bytes)")]
    BadFree(BusAddr, u32),
    #[error("{0} scatter-gather segments requested, script buffer holds {MAX}", MAX = crate::script::MAX_SG_SEGMENTS)]
    TooManySegments(usize),
    #[error("transfer length {0:#x} does not fit in 24 bits")]
    LengthOverflow(u32),
    #[error("data length {0:#x} is not a whole number of blocks")]
    PartialBlock(u32),
    #[error("cannot decode instruction: {0}")]
    BadInstruction(String),
}

pub type NcrResult<T> = Result<T, NcrError>;
