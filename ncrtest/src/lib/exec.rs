use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use crate::bridge::CompletionBridge;
use crate::error::{ControllerFault, FaultKind, NcrError, RegisterSnapshot};
use crate::mem::{post_dma_barrier, pre_dma_barrier};
use crate::regs::{
    Register, RegisterFile, DSTAT_ABRT, DSTAT_BF, DSTAT_IID, DSTAT_SIR, DSTAT_WTD, ISTAT_DIP,
    ISTAT_SIP,
};
use crate::script::Script;

/// How long a script is given to complete.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// Give up after exactly this many status polls.
    Iterations(u32),
    /// Give up after this much wall-clock time.
    Wall(Duration),
}

const POLL_INTERVAL: Duration = Duration::from_micros(100);

impl Deadline {
    /// Equivalent wall-clock budget, for waits that cannot count polls.
    pub fn as_duration(self) -> Duration {
        match self {
            Deadline::Wall(limit) => limit,
            Deadline::Iterations(n) => POLL_INTERVAL * n,
        }
    }
}

/// How a script run ended. Every run is classified; there is no partial or
/// unknown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The script reached its completion interrupt.
    Success,
    /// The script took its selection-failure branch.
    SelectionFailed,
    /// The deadline elapsed; the script may still be running.
    Timeout,
    /// The controller reported a fault.
    Controller(ControllerFault),
    /// A blocking wait was cancelled before completion.
    Cancelled,
}

/// Start `script` and busy-poll the status registers until it ends or the
/// deadline expires.
pub fn execute_polling<R: RegisterFile>(
    regs: &mut R,
    script: &Script,
    deadline: Deadline,
) -> Outcome {
    drain_stale(regs);
    pre_dma_barrier();
    trace!("Starting script at {}", script.base);
    regs.write32(Register::Dsp, script.base.0);
    let outcome = match deadline {
        Deadline::Iterations(n) => {
            let mut result = Outcome::Timeout;
            for _ in 0..n {
                if let Some(outcome) = poll_once(regs, script) {
                    result = outcome;
                    break;
                }
            }
            result
        }
        Deadline::Wall(limit) => {
            let end = Instant::now() + limit;
            loop {
                if let Some(outcome) = poll_once(regs, script) {
                    break outcome;
                }
                if Instant::now() >= end {
                    break Outcome::Timeout;
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };
    post_dma_barrier();
    trace!("Script outcome: {:?}", outcome);
    outcome
}

/// Start `script` and sleep on the bridge until its completion interrupt is
/// delivered, the wait is cancelled, or `timeout` elapses.
///
/// The bridge is armed before the controller is started, so a completion
/// firing at any point after start is observed. A cancellation that races a
/// completion loses: the completion is returned.
pub fn execute_blocking<R: RegisterFile + Clone + Send + 'static>(
    regs: &mut R,
    bridge: &mut CompletionBridge<R>,
    script: &Script,
    timeout: Duration,
) -> Outcome {
    bridge.arm();
    pre_dma_barrier();
    trace!("Starting script at {} (blocking)", script.base);
    regs.write32(Register::Dsp, script.base.0);
    let outcome = match bridge.wait(timeout) {
        Ok(snap) => classify_or_spurious(script, &snap),
        Err(NcrError::Cancelled) => match bridge.take_completion() {
            Some(snap) => classify_or_spurious(script, &snap),
            None => Outcome::Cancelled,
        },
        Err(NcrError::Controller(fault)) => Outcome::Controller(fault),
        Err(_) => Outcome::Timeout,
    };
    bridge.disarm();
    post_dma_barrier();
    trace!("Script outcome: {:?}", outcome);
    outcome
}

/// Force a running script to stop and acknowledge the fallout. Safe to call
/// when no script is running. Until this has been done, buffers referenced
/// by a timed-out script must be treated as still in use.
pub fn abort<R: RegisterFile>(regs: &mut R) {
    regs.write8(Register::Istat, crate::regs::ISTAT_ABRT);
    let istat = regs.read8(Register::Istat);
    if istat & ISTAT_DIP != 0 {
        let _ = regs.read8(Register::Dstat);
    }
    if istat & ISTAT_SIP != 0 {
        let _ = regs.read8(Register::Sstat0);
    }
    regs.write8(Register::Istat, 0);
}

// Interrupts latched by an earlier run (or by bus reset during init) must
// not be mistaken for this script's completion.
fn drain_stale<R: RegisterFile>(regs: &mut R) {
    let istat = regs.read8(Register::Istat);
    if istat & ISTAT_DIP != 0 {
        let dstat = regs.read8(Register::Dstat);
        trace!("Discarding stale DMA interrupt (DSTAT={:#04x})", dstat);
    }
    if istat & ISTAT_SIP != 0 {
        let sstat0 = regs.read8(Register::Sstat0);
        trace!("Discarding stale SCSI interrupt (SSTAT0={:#04x})", sstat0);
    }
}

// One poll of ISTAT; reads (and thereby acknowledges) the status registers
// only once an interrupt is actually pending.
fn poll_once<R: RegisterFile>(regs: &mut R, script: &Script) -> Option<Outcome> {
    let istat = regs.read8(Register::Istat);
    if istat & (ISTAT_DIP | ISTAT_SIP) == 0 {
        return None;
    }
    let mut snap = RegisterSnapshot {
        istat,
        ..RegisterSnapshot::default()
    };
    if istat & ISTAT_DIP != 0 {
        snap.dstat = regs.read8(Register::Dstat);
        snap.dsps = regs.read32(Register::Dsps);
        snap.dsp = regs.read32(Register::Dsp);
    }
    if istat & ISTAT_SIP != 0 {
        snap.sstat0 = regs.read8(Register::Sstat0);
    }
    classify(script, &snap)
}

/// Map captured completion state to an [`Outcome`]. `None` means nothing
/// conclusive was latched and the caller should keep waiting.
fn classify(script: &Script, snap: &RegisterSnapshot) -> Option<Outcome> {
    let fault = |kind| {
        Some(Outcome::Controller(ControllerFault {
            kind,
            snapshot: *snap,
        }))
    };
    if snap.istat & ISTAT_SIP != 0 {
        return fault(FaultKind::ScsiInterrupt(snap.sstat0));
    }
    if snap.dstat & DSTAT_SIR != 0 {
        if snap.dsps == script.ok_token {
            return Some(Outcome::Success);
        }
        if script.fail_token == Some(snap.dsps) {
            return Some(Outcome::SelectionFailed);
        }
        return fault(FaultKind::UnexpectedToken(snap.dsps));
    }
    if snap.dstat & DSTAT_IID != 0 {
        return fault(FaultKind::IllegalInstruction);
    }
    if snap.dstat & DSTAT_ABRT != 0 {
        return fault(FaultKind::Aborted);
    }
    if snap.dstat & DSTAT_WTD != 0 {
        return fault(FaultKind::Watchdog);
    }
    if snap.dstat & DSTAT_BF != 0 {
        return fault(FaultKind::BusFault);
    }
    None
}

fn classify_or_spurious(script: &Script, snap: &RegisterSnapshot) -> Outcome {
    classify(script, snap).unwrap_or(Outcome::Controller(ControllerFault {
        kind: FaultKind::SpuriousWake,
        snapshot: *snap,
    }))
}
