use std::time::Duration;

use log::{debug, info};

use crate::error::{NcrError, NcrResult};
use crate::regs::{
    Register, RegisterFile, DCNTL_EA, DMODE_BL0, DMODE_BL1, DMODE_FC1, ISTAT_DIP, ISTAT_RST,
    ISTAT_SIP, SCNTL0_EPG, SCNTL1_ESR, SCNTL1_RST, SXFER_DHP,
};

const RESET_SETTLE_POLLS: u32 = 100;
const SCSI_RST_PULSE: Duration = Duration::from_micros(25);
const SCSI_RST_SETTLE: Duration = Duration::from_millis(250);

/// Check that a controller answers at the configured base address and
/// report its revision. An unpopulated bus floats high, so all-ones reads
/// mean nothing is there.
pub fn detect<R: RegisterFile>(regs: &mut R) -> NcrResult<u8> {
    // Nothing else responds until Enable Ack is set.
    regs.write8(Register::Dcntl, DCNTL_EA);
    let first = regs.read8(Register::Istat);
    let second = regs.read8(Register::Istat);
    let ctest8 = regs.read8(Register::Ctest8);
    if first == 0xFF && second == 0xFF && ctest8 == 0xFF {
        return Err(NcrError::Fatal(
            "no controller responding at the configured base address".to_string(),
        ));
    }
    let revision = ctest8 >> 4;
    info!("Controller detected, revision {:#x}.", revision);
    Ok(revision)
}

/// Soft-reset the chip and drain anything latched across the reset.
pub fn reset<R: RegisterFile>(regs: &mut R) -> NcrResult<()> {
    debug!("Soft-resetting controller.");
    regs.write8(Register::Istat, ISTAT_RST);
    regs.write8(Register::Istat, 0);
    let mut istat = 0;
    for _ in 0..RESET_SETTLE_POLLS {
        istat = regs.read8(Register::Istat);
        if istat == 0 {
            return Ok(());
        }
        if istat & ISTAT_DIP != 0 {
            let _ = regs.read8(Register::Dstat);
        }
        if istat & ISTAT_SIP != 0 {
            let _ = regs.read8(Register::Sstat0);
        }
    }
    Err(NcrError::Fatal(format!(
        "controller stuck after reset (ISTAT={:#04x})",
        istat
    )))
}

/// Program the DMA core: burst length, function codes, masked interrupts.
/// A completion bridge unmasks what it needs when installed.
pub fn init_dma<R: RegisterFile>(regs: &mut R) {
    regs.write8(Register::Dmode, DMODE_BL1 | DMODE_BL0 | DMODE_FC1);
    regs.write8(Register::Dien, 0);
    regs.write8(Register::Dwt, 0);
    regs.write8(Register::Dcntl, DCNTL_EA);
    regs.write32(Register::Scratch, 0);
    regs.write32(Register::Temp, 0);
    debug!("DMA core initialised.");
}

/// Program the SCSI core and pulse bus reset so every target starts from a
/// known state. `delay` supplies the timed waits; tests pass a no-op.
pub fn init_scsi<R: RegisterFile>(
    regs: &mut R,
    host_id: u8,
    mut delay: impl FnMut(Duration),
) -> NcrResult<()> {
    if host_id > 7 {
        return Err(NcrError::Fatal(format!(
            "host ID {} out of range (0-7)",
            host_id
        )));
    }
    regs.write8(Register::Scntl0, SCNTL0_EPG);
    regs.write8(Register::Sxfer, SXFER_DHP);
    regs.write8(Register::Sien, 0);

    regs.write8(Register::Scntl1, SCNTL1_RST);
    delay(SCSI_RST_PULSE);
    regs.write8(Register::Scntl1, 0);
    delay(SCSI_RST_SETTLE);

    regs.write8(Register::Scid, 1 << host_id);
    regs.write8(Register::Scntl1, SCNTL1_ESR);
    // The reset pulse latches SSTAT0.RST; acknowledge it.
    let _ = regs.read8(Register::Sstat0);
    debug!("SCSI core initialised as ID {}.", host_id);
    Ok(())
}
