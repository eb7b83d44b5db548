use log::{info, warn};

use crate::error::{DeviceFault, NcrError};
use crate::regs::RegisterFile;
use crate::scsi::TransactionEngine;

pub const BUS_WIDTH: u8 = 8;

/// What a single target ID's probe found.
#[derive(Debug, Clone)]
pub enum ProbeResult {
    /// Selected and reported GOOD status.
    Ready,
    /// Selected but not ready for media commands.
    NotReady,
    /// Nobody answered selection.
    Absent,
    /// The probe itself went wrong; later IDs are still probed.
    Failed(NcrError),
}

impl ProbeResult {
    /// True if something answered selection at this ID.
    pub fn is_present(&self) -> bool {
        matches!(self, ProbeResult::Ready | ProbeResult::NotReady)
    }
}

#[derive(Debug)]
pub struct ScanReport {
    /// One entry per probed ID, in bus order. The host's own ID is skipped.
    pub results: Vec<(u8, ProbeResult)>,
    /// Lowest ID where a device answered selection.
    pub first_present: Option<u8>,
}

/// Probe every target ID on the bus with TEST UNIT READY, skipping the
/// host's own ID. A failing probe is recorded and the scan carries on.
pub fn scan_bus<R: RegisterFile + Clone + Send + 'static>(
    engine: &mut TransactionEngine<R>,
) -> ScanReport {
    let host_id = engine.host_id();
    let mut results = Vec::with_capacity(BUS_WIDTH as usize - 1);
    let mut first_present = None;
    for id in 0..BUS_WIDTH {
        if id == host_id {
            continue;
        }
        // Probe LUN 0; anything answering selection will decode it.
        let probe = match engine.test_unit_ready(id, 0) {
            Ok(()) => ProbeResult::Ready,
            Err(NcrError::Device(DeviceFault::NoDevice)) => ProbeResult::Absent,
            Err(NcrError::Device(DeviceFault::CheckCondition)) => ProbeResult::NotReady,
            Err(e) => {
                warn!("Probe of target {} failed: {}", id, e);
                ProbeResult::Failed(e)
            }
        };
        if probe.is_present() && first_present.is_none() {
            first_present = Some(id);
        }
        info!("Target {}: {:?}", id, probe);
        results.push((id, probe));
    }
    ScanReport {
        results,
        first_present,
    }
}
