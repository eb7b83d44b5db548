use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{ControllerFault, FaultKind, NcrError, NcrResult, RegisterSnapshot};
use crate::regs::{
    Register, RegisterFile, DIEN_ABRT, DIEN_BF, DIEN_IID, DIEN_SIR, DIEN_WTD, ISTAT_DIP, ISTAT_SIP,
};

/// Registers captured by the interrupt handler at the moment of completion.
pub type CompletionState = RegisterSnapshot;

/// An interrupt service routine. Returns true if the interrupt belonged to
/// the controller (and was acknowledged), false to pass it on.
pub type IrqHandler = Box<dyn FnMut() -> bool + Send>;

/// Where interrupt handlers get installed. On real systems this is the
/// platform's shared-interrupt chain; tests provide their own host.
pub trait InterruptHost {
    fn install(&mut self, handler: IrqHandler, priority: i8);
    fn remove(&mut self);
}

const IRQ_PRIORITY: i8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArmState {
    /// No waiter; interrupts are acknowledged and dropped.
    Idle,
    /// A waiter has registered interest; the next completion is captured.
    Armed,
    /// A completion has been captured and not yet collected.
    Fired,
}

struct Shared {
    state: ArmState,
    snap: CompletionState,
}

enum Wake {
    Interrupt,
    Cancel,
}

/// Lets another thread abort a blocking [`CompletionBridge::wait`].
///
/// Cancelling never discards a completion that has already fired: the
/// captured state stays latched until the bridge is disarmed, so the caller
/// can tell a true cancellation from a lost race.
#[derive(Clone)]
pub struct CancelHandle {
    wake_tx: Sender<Wake>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // The bridge may already be gone; a dead channel is fine.
        let _ = self.wake_tx.send(Wake::Cancel);
    }
}

/// Carries a completion from interrupt context to a blocked waiter.
///
/// The handler runs on the interrupt side: it checks that the interrupt is
/// ours, reads the status registers (which acknowledges the interrupt as a
/// side effect), and hands the captured state over. The waiting side arms
/// the bridge *before* starting the script, so a completion can never slip
/// through between start and wait.
pub struct CompletionBridge<R: RegisterFile + Clone + Send + 'static> {
    regs: R,
    shared: Arc<Mutex<Shared>>,
    wake_tx: Sender<Wake>,
    wake_rx: Receiver<Wake>,
}

impl<R: RegisterFile + Clone + Send + 'static> CompletionBridge<R> {
    /// Enable the controller's interrupt sources and hook the handler into
    /// `host`. The bridge starts idle.
    pub fn install<H: InterruptHost>(regs: R, host: &mut H) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            state: ArmState::Idle,
            snap: CompletionState::default(),
        }));
        let (wake_tx, wake_rx) = mpsc::channel();

        let mut handler_regs = regs.clone();
        let handler_shared = Arc::clone(&shared);
        let handler_tx = wake_tx.clone();
        let handler: IrqHandler = Box::new(move || {
            let istat = handler_regs.read8(Register::Istat);
            if istat & (ISTAT_DIP | ISTAT_SIP) == 0 {
                return false;
            }
            // Reading the status registers acknowledges the interrupt.
            let mut snap = CompletionState {
                istat,
                ..CompletionState::default()
            };
            if istat & ISTAT_DIP != 0 {
                snap.dstat = handler_regs.read8(Register::Dstat);
                snap.dsps = handler_regs.read32(Register::Dsps);
                snap.dsp = handler_regs.read32(Register::Dsp);
            }
            if istat & ISTAT_SIP != 0 {
                snap.sstat0 = handler_regs.read8(Register::Sstat0);
            }
            let mut shared = handler_shared.lock().unwrap();
            match shared.state {
                ArmState::Armed => {
                    shared.snap = snap;
                    shared.state = ArmState::Fired;
                    drop(shared);
                    let _ = handler_tx.send(Wake::Interrupt);
                }
                state => {
                    // Nobody is waiting. Acknowledged above, so just log it.
                    drop(shared);
                    warn!(
                        "Completion interrupt with no waiter (state {:?}): {}",
                        state, snap
                    );
                }
            }
            true
        });

        let mut regs = regs;
        regs.write8(
            Register::Dien,
            DIEN_BF | DIEN_ABRT | DIEN_SIR | DIEN_WTD | DIEN_IID,
        );
        regs.write8(Register::Sien, 0xFF);
        host.install(handler, IRQ_PRIORITY);
        debug!("Interrupt handler installed.");

        CompletionBridge {
            regs,
            shared,
            wake_tx,
            wake_rx,
        }
    }

    /// Register interest in the next completion. Must be called before the
    /// script is started. Stale wakes from earlier rounds are discarded.
    pub fn arm(&mut self) {
        while self.wake_rx.try_recv().is_ok() {}
        let mut shared = self.shared.lock().unwrap();
        shared.state = ArmState::Armed;
        trace!("Bridge armed.");
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            wake_tx: self.wake_tx.clone(),
        }
    }

    /// Block until the armed completion fires, the wait is cancelled, or
    /// `timeout` elapses. A wake with no captured completion means the
    /// delivery chain is broken (someone else consumed the capture, or the
    /// handler woke us without latching) and is surfaced as a fault rather
    /// than retried.
    pub fn wait(&mut self, timeout: Duration) -> NcrResult<CompletionState> {
        match self.wake_rx.recv_timeout(timeout) {
            Ok(Wake::Interrupt) => {
                let mut shared = self.shared.lock().unwrap();
                if shared.state == ArmState::Fired {
                    shared.state = ArmState::Idle;
                    return Ok(shared.snap);
                }
                drop(shared);
                let snapshot = RegisterSnapshot {
                    istat: self.regs.read8(Register::Istat),
                    ..RegisterSnapshot::default()
                };
                warn!("Wake received with no captured completion.");
                Err(NcrError::Controller(ControllerFault {
                    kind: FaultKind::SpuriousWake,
                    snapshot,
                }))
            }
            Ok(Wake::Cancel) => {
                debug!("Wait cancelled.");
                Err(NcrError::Cancelled)
            }
            Err(RecvTimeoutError::Timeout) => Err(NcrError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                // We hold a sender ourselves, so this cannot happen.
                Err(NcrError::Timeout)
            }
        }
    }

    /// True if a completion fired and has not been collected. Lets a
    /// cancelled caller detect that the script actually finished.
    pub fn completion_pending(&self) -> bool {
        self.shared.lock().unwrap().state == ArmState::Fired
    }

    /// Collect a latched completion without waiting.
    pub fn take_completion(&mut self) -> Option<CompletionState> {
        let mut shared = self.shared.lock().unwrap();
        if shared.state == ArmState::Fired {
            shared.state = ArmState::Idle;
            Some(shared.snap)
        } else {
            None
        }
    }

    /// Return to idle, discarding any queued wakes and latched completion.
    pub fn disarm(&mut self) {
        while self.wake_rx.try_recv().is_ok() {}
        let mut shared = self.shared.lock().unwrap();
        if shared.state == ArmState::Fired {
            debug!("Disarm discarding uncollected completion: {}", shared.snap);
        }
        shared.state = ArmState::Idle;
    }

    /// Mask the controller's interrupt sources and unhook the handler.
    pub fn remove<H: InterruptHost>(mut self, host: &mut H) {
        self.regs.write8(Register::Dien, 0);
        self.regs.write8(Register::Sien, 0);
        host.remove();
        debug!("Interrupt handler removed.");
    }
}
