use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::trace;

use super::{
    Register, RegisterFile, DSTAT_ABRT, DSTAT_BF, DSTAT_DFE, DSTAT_IID, DSTAT_SIR, DSTAT_WTD,
    ISTAT_ABRT, ISTAT_DIP, ISTAT_RST, ISTAT_SIP,
};
use crate::bridge::{InterruptHost, IrqHandler};
use crate::mem::{BusAddr, DmaArena};
use crate::script::Instruction;
use crate::scsi::{
    MSG_COMMAND_COMPLETE, OP_INQUIRY, OP_READ_6, OP_TEST_UNIT_READY, OP_WRITE_6,
    STATUS_CHECK_CONDITION, STATUS_GOOD,
};

const SECTOR_SIZE: usize = 512;
// A runaway script must not hang a test.
const MAX_STEPS: usize = 256;
const MOCK_REVISION: u8 = 0x20;

/// Ways the mock controller can be told to misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// No chip at this address: every read returns 0xFF.
    Absent,
    /// Scripts start but never raise an interrupt.
    NeverComplete,
    IllegalInstruction,
    Abort,
    Watchdog,
    BusFault,
    /// Raise a SCSI-side interrupt with this SSTAT0 value instead of
    /// running the script.
    ScsiInterrupt(u8),
    /// Run normally but flip one byte of every memory move's destination.
    CorruptCopy,
}

/// A scripted SCSI device on the mock bus.
pub struct MockTarget {
    inquiry: [u8; 36],
    ready: bool,
    status_override: Option<u8>,
    sectors: HashMap<u32, Vec<u8>>,
}

impl MockTarget {
    pub fn disk(vendor: &str, product: &str) -> Self {
        let mut inquiry = [0u8; 36];
        inquiry[2] = 0x02; // SCSI-2
        inquiry[4] = 31; // additional length
        write_padded(&mut inquiry[8..16], vendor);
        write_padded(&mut inquiry[16..32], product);
        write_padded(&mut inquiry[32..36], "1.0");
        MockTarget {
            inquiry,
            ready: true,
            status_override: None,
            sectors: HashMap::new(),
        }
    }

    /// TEST UNIT READY will return CHECK CONDITION.
    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    /// Every command returns this status, whatever the command.
    pub fn with_status(mut self, status: u8) -> Self {
        self.status_override = Some(status);
        self
    }

    pub fn with_sector(mut self, lba: u32, data: Vec<u8>) -> Self {
        assert_eq!(data.len(), SECTOR_SIZE);
        self.sectors.insert(lba, data);
        self
    }

    fn status_for(&self, cdb: &[u8]) -> u8 {
        if let Some(status) = self.status_override {
            return status;
        }
        match cdb.first() {
            Some(&OP_TEST_UNIT_READY) => {
                if self.ready {
                    STATUS_GOOD
                } else {
                    STATUS_CHECK_CONDITION
                }
            }
            Some(&OP_INQUIRY) | Some(&OP_READ_6) | Some(&OP_WRITE_6) => STATUS_GOOD,
            _ => STATUS_CHECK_CONDITION,
        }
    }

    fn read_blocks(&self, lba: u32, len: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(len);
        let mut block = lba;
        while data.len() < len {
            match self.sectors.get(&block) {
                Some(sector) => data.extend_from_slice(sector),
                None => data.extend_from_slice(&[0; SECTOR_SIZE]),
            }
            block += 1;
        }
        data.truncate(len);
        data
    }

    fn write_blocks(&mut self, lba: u32, data: &[u8]) {
        for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            let mut sector = vec![0u8; SECTOR_SIZE];
            sector[..chunk.len()].copy_from_slice(chunk);
            self.sectors.insert(lba + i as u32, sector);
        }
    }
}

fn write_padded(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let n = s.len().min(dst.len());
    dst[..n].copy_from_slice(&s.as_bytes()[..n]);
}

#[derive(Default)]
struct MockState {
    fault: Option<FaultMode>,
    istat: u8,
    dstat: u8,
    sstat0: u8,
    dsp: u32,
    dsps: u32,
    dsa: u32,
    scratch: u32,
    temp: u32,
    scntl0: u8,
    scntl1: u8,
    scid: u8,
    sxfer: u8,
    sien: u8,
    dmode: u8,
    dien: u8,
    dcntl: u8,
    dwt: u8,
    targets: HashMap<u8, MockTarget>,
    handler: Option<IrqHandler>,
    // Transaction context while a script runs.
    cur_target: Option<u8>,
    cur_cdb: Vec<u8>,
    last_msg_out: Option<u8>,
}

/// In-memory stand-in for the real chip.
///
/// Cloning yields another handle onto the same controller, so the interrupt
/// handler and the test body can both poke at it. Register side effects
/// (latch clears on status reads) match the contract documented on
/// [`RegisterFile`]. Writing `DSP` runs the whole script synchronously
/// against the shared arena and then, if a handler is installed, invokes it
/// as the interrupt would.
#[derive(Clone)]
pub struct MockController {
    state: Arc<Mutex<MockState>>,
    arena: Arc<Mutex<DmaArena>>,
}

impl MockController {
    pub fn new(arena: Arc<Mutex<DmaArena>>) -> Self {
        MockController {
            state: Arc::new(Mutex::new(MockState::default())),
            arena,
        }
    }

    pub fn add_target(&self, id: u8, target: MockTarget) {
        self.state.lock().unwrap().targets.insert(id, target);
    }

    pub fn set_fault(&self, fault: FaultMode) {
        self.state.lock().unwrap().fault = Some(fault);
    }

    pub fn clear_fault(&self) {
        self.state.lock().unwrap().fault = None;
    }

    /// Contents of a target's sector, for checking what a write stored.
    pub fn sector(&self, id: u8, lba: u32) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.targets.get(&id)?.sectors.get(&lba).cloned()
    }

    pub fn handler_installed(&self) -> bool {
        self.state.lock().unwrap().handler.is_some()
    }

    /// The message-out byte sent by the most recent selection.
    pub fn last_identify(&self) -> Option<u8> {
        self.state.lock().unwrap().last_msg_out
    }

    /// Invoke the installed handler as a shared interrupt line would,
    /// without latching anything first. Returns the handler's claim result.
    pub fn trigger_irq(&self) -> Option<bool> {
        self.with_handler(|h| h())
    }

    /// Latch a SCSI interrupt and deliver it.
    pub fn raise_scsi_interrupt(&self, sstat0: u8) {
        {
            let mut state = self.state.lock().unwrap();
            state.sstat0 |= sstat0;
            state.istat |= ISTAT_SIP;
        }
        self.fire_interrupt();
    }

    // Take the handler out, run `f` on it with the state lock released (the
    // handler reads registers through its own clone of this controller),
    // then put it back.
    fn with_handler<T>(&self, f: impl FnOnce(&mut IrqHandler) -> T) -> Option<T> {
        let handler = self.state.lock().unwrap().handler.take();
        match handler {
            Some(mut handler) => {
                let result = f(&mut handler);
                let mut state = self.state.lock().unwrap();
                // remove() may have raced us; only restore if still empty.
                if state.handler.is_none() {
                    state.handler = Some(handler);
                }
                Some(result)
            }
            None => None,
        }
    }

    fn fire_interrupt(&self) {
        self.with_handler(|h| h());
    }

    fn soft_reset(state: &mut MockState) {
        state.istat = ISTAT_RST;
        state.dstat = 0;
        state.sstat0 = 0;
        state.dsp = 0;
        state.dsps = 0;
        state.dsa = 0;
        state.scratch = 0;
        state.temp = 0;
        state.scntl0 = 0;
        state.scntl1 = 0;
        state.scid = 0;
        state.sxfer = 0;
        state.sien = 0;
        state.dmode = 0;
        state.dien = 0;
        state.dcntl = 0;
        state.dwt = 0;
        state.cur_target = None;
        state.cur_cdb.clear();
        state.last_msg_out = None;
    }

    fn start_script(&self, start: u32) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            state.dsp = start;
            match state.fault {
                Some(FaultMode::NeverComplete) => false,
                Some(FaultMode::IllegalInstruction) => {
                    state.dstat |= DSTAT_IID;
                    state.istat |= ISTAT_DIP;
                    true
                }
                Some(FaultMode::Abort) => {
                    state.dstat |= DSTAT_ABRT;
                    state.istat |= ISTAT_DIP;
                    true
                }
                Some(FaultMode::Watchdog) => {
                    state.dstat |= DSTAT_WTD;
                    state.istat |= ISTAT_DIP;
                    true
                }
                Some(FaultMode::BusFault) => {
                    state.dstat |= DSTAT_BF;
                    state.istat |= ISTAT_DIP;
                    true
                }
                Some(FaultMode::ScsiInterrupt(sstat0)) => {
                    state.sstat0 |= sstat0;
                    state.istat |= ISTAT_SIP;
                    true
                }
                _ => {
                    self.run_script(&mut state, start);
                    true
                }
            }
        };
        if fire {
            self.fire_interrupt();
        }
    }

    fn run_script(&self, state: &mut MockState, start: u32) {
        let corrupt = state.fault == Some(FaultMode::CorruptCopy);
        let mut pc = start;
        for _ in 0..MAX_STEPS {
            let instr = match self.fetch(pc) {
                Some(instr) => instr,
                None => {
                    state.dstat |= DSTAT_IID;
                    state.istat |= ISTAT_DIP;
                    state.dsp = pc;
                    return;
                }
            };
            trace!("Mock executing {:?} at {:#010x}", instr, pc);
            pc += instr.encoded_len();
            match instr {
                Instruction::MemoryMove { len, src, dst } => {
                    let mut arena = self.arena.lock().unwrap();
                    if arena.copy(src, dst, len).is_err() {
                        state.dstat |= DSTAT_BF;
                        state.istat |= ISTAT_DIP;
                        state.dsp = pc;
                        return;
                    }
                    if corrupt {
                        let byte = arena.read_u8(dst).unwrap();
                        arena.write(dst, &[!byte]).unwrap();
                    }
                }
                Instruction::SelectAtn {
                    target_mask,
                    fail_addr,
                } => {
                    let id = target_mask.trailing_zeros() as u8;
                    if state.targets.contains_key(&id) {
                        state.cur_target = Some(id);
                        state.cur_cdb.clear();
                    } else {
                        pc = fail_addr.0;
                    }
                }
                Instruction::PhaseMove { len, phase, addr } => {
                    if self.phase_move(state, phase, addr, len).is_none() {
                        state.dstat |= DSTAT_BF;
                        state.istat |= ISTAT_DIP;
                        state.dsp = pc;
                        return;
                    }
                }
                Instruction::WaitDisconnect => {
                    state.cur_target = None;
                }
                Instruction::ScriptInt { token } => {
                    state.dsps = token;
                    state.dstat |= DSTAT_SIR;
                    state.istat |= ISTAT_DIP;
                    state.dsp = pc;
                    return;
                }
            }
        }
        // Ran off the end of the instruction budget.
        state.dstat |= DSTAT_IID;
        state.istat |= ISTAT_DIP;
        state.dsp = pc;
    }

    fn fetch(&self, pc: u32) -> Option<Instruction> {
        let arena = self.arena.lock().unwrap();
        let mut bytes = [0u8; 12];
        arena.read(BusAddr(pc), &mut bytes[..8]).ok()?;
        let needed = if bytes[0] == 0xC0 { 12 } else { 8 };
        if needed == 12 {
            arena.read(BusAddr(pc), &mut bytes).ok()?;
        }
        Instruction::decode(&bytes[..needed]).ok().map(|(i, _)| i)
    }

    fn phase_move(
        &self,
        state: &mut MockState,
        phase: crate::script::Phase,
        addr: BusAddr,
        len: u32,
    ) -> Option<()> {
        use crate::script::Phase;

        let id = state.cur_target?;
        match phase {
            Phase::MsgOut => {
                let mut buf = vec![0u8; len as usize];
                self.arena.lock().unwrap().read(addr, &mut buf).ok()?;
                // The IDENTIFY byte is recorded so tests can check routing.
                state.last_msg_out = buf.first().copied();
            }
            Phase::Command => {
                let mut cdb = vec![0u8; len as usize];
                self.arena.lock().unwrap().read(addr, &mut cdb).ok()?;
                state.cur_cdb = cdb;
            }
            Phase::DataIn => {
                let target = state.targets.get(&id)?;
                let data = match state.cur_cdb.first() {
                    Some(&OP_INQUIRY) => {
                        let mut data = target.inquiry.to_vec();
                        data.resize(len as usize, 0);
                        data
                    }
                    Some(&OP_READ_6) => {
                        let lba = read6_lba(&state.cur_cdb);
                        target.read_blocks(lba, len as usize)
                    }
                    _ => vec![0u8; len as usize],
                };
                self.arena.lock().unwrap().write(addr, &data).ok()?;
            }
            Phase::DataOut => {
                let mut data = vec![0u8; len as usize];
                self.arena.lock().unwrap().read(addr, &mut data).ok()?;
                if state.cur_cdb.first() == Some(&OP_WRITE_6) {
                    let lba = read6_lba(&state.cur_cdb);
                    state.targets.get_mut(&id)?.write_blocks(lba, &data);
                }
            }
            Phase::Status => {
                let cdb = state.cur_cdb.clone();
                let status = state.targets.get(&id)?.status_for(&cdb);
                self.arena.lock().unwrap().write(addr, &[status]).ok()?;
            }
            Phase::MsgIn => {
                self.arena
                    .lock()
                    .unwrap()
                    .write(addr, &[MSG_COMMAND_COMPLETE])
                    .ok()?;
            }
        }
        Some(())
    }
}

fn read6_lba(cdb: &[u8]) -> u32 {
    (((cdb[1] & 0x1F) as u32) << 16) | ((cdb[2] as u32) << 8) | cdb[3] as u32
}

impl RegisterFile for MockController {
    fn read8(&mut self, reg: Register) -> u8 {
        let mut state = self.state.lock().unwrap();
        if state.fault == Some(FaultMode::Absent) {
            return 0xFF;
        }
        match reg {
            Register::Istat => state.istat,
            Register::Dstat => {
                let value = state.dstat | DSTAT_DFE;
                state.dstat = 0;
                state.istat &= !ISTAT_DIP;
                value
            }
            Register::Sstat0 => {
                let value = state.sstat0;
                state.sstat0 = 0;
                state.istat &= !ISTAT_SIP;
                value
            }
            Register::Ctest8 => MOCK_REVISION,
            Register::Scntl0 => state.scntl0,
            Register::Scntl1 => state.scntl1,
            Register::Scid => state.scid,
            Register::Sxfer => state.sxfer,
            Register::Sien => state.sien,
            Register::Dmode => state.dmode,
            Register::Dien => state.dien,
            Register::Dcntl => state.dcntl,
            Register::Dwt => state.dwt,
            _ => 0,
        }
    }

    fn write8(&mut self, reg: Register, value: u8) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            if state.fault == Some(FaultMode::Absent) {
                return;
            }
            match reg {
                Register::Istat => {
                    if value & ISTAT_RST != 0 {
                        Self::soft_reset(&mut state);
                        false
                    } else {
                        state.istat &= !ISTAT_RST;
                        if value & ISTAT_ABRT != 0 {
                            state.dstat |= DSTAT_ABRT;
                            state.istat |= ISTAT_DIP;
                            true
                        } else {
                            false
                        }
                    }
                }
                Register::Scntl0 => {
                    state.scntl0 = value;
                    false
                }
                Register::Scntl1 => {
                    state.scntl1 = value;
                    false
                }
                Register::Scid => {
                    state.scid = value;
                    false
                }
                Register::Sxfer => {
                    state.sxfer = value;
                    false
                }
                Register::Sien => {
                    state.sien = value;
                    false
                }
                Register::Dmode => {
                    state.dmode = value;
                    false
                }
                Register::Dien => {
                    state.dien = value;
                    false
                }
                Register::Dcntl => {
                    state.dcntl = value;
                    false
                }
                Register::Dwt => {
                    state.dwt = value;
                    false
                }
                _ => false,
            }
        };
        if fire {
            self.fire_interrupt();
        }
    }

    fn read32(&mut self, reg: Register) -> u32 {
        let state = self.state.lock().unwrap();
        if state.fault == Some(FaultMode::Absent) {
            return 0xFFFF_FFFF;
        }
        match reg {
            Register::Dsp => state.dsp,
            Register::Dsps => state.dsps,
            Register::Dsa => state.dsa,
            Register::Scratch => state.scratch,
            Register::Temp => state.temp,
            _ => 0,
        }
    }

    fn write32(&mut self, reg: Register, value: u32) {
        {
            let mut state = self.state.lock().unwrap();
            if state.fault == Some(FaultMode::Absent) {
                return;
            }
            match reg {
                Register::Dsp => {} // handled below, outside the lock scope
                Register::Dsa => {
                    state.dsa = value;
                    return;
                }
                Register::Scratch => {
                    state.scratch = value;
                    return;
                }
                Register::Temp => {
                    state.temp = value;
                    return;
                }
                _ => return,
            }
        }
        self.start_script(value);
    }
}

impl InterruptHost for MockController {
    fn install(&mut self, handler: IrqHandler, _priority: i8) {
        self.state.lock().unwrap().handler = Some(handler);
    }

    fn remove(&mut self) {
        self.state.lock().unwrap().handler = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_test_logging;
    use crate::mem::MemClass;
    use crate::script::{ScriptBuilder, TOKEN_DMA_DONE};

    fn fixture() -> (MockController, Arc<Mutex<DmaArena>>) {
        init_test_logging();
        let arena = Arc::new(Mutex::new(DmaArena::new(0x1000, 0x1000, 0x8000, 0x4000)));
        (MockController::new(Arc::clone(&arena)), arena)
    }

    #[test]
    fn test_absent_chip_reads_ff() {
        let (mut mock, _arena) = fixture();
        mock.set_fault(FaultMode::Absent);
        assert_eq!(mock.read8(Register::Istat), 0xFF);
        assert_eq!(mock.read8(Register::Ctest8), 0xFF);
        assert_eq!(mock.read32(Register::Dsps), 0xFFFF_FFFF);
    }

    #[test]
    fn test_dstat_read_clears_latches() {
        let (mut mock, arena) = fixture();
        let script = {
            let mut arena = arena.lock().unwrap();
            let src = arena.alloc(16, MemClass::Fast).unwrap();
            let dst = arena.alloc(16, MemClass::Fast).unwrap();
            ScriptBuilder::transfer(src, dst, 16, TOKEN_DMA_DONE)
                .unwrap()
                .build(&mut arena, MemClass::Chip)
                .unwrap()
        };
        mock.write32(Register::Dsp, script.base.0);

        assert_eq!(mock.read8(Register::Istat) & ISTAT_DIP, ISTAT_DIP);
        let dstat = mock.read8(Register::Dstat);
        assert_eq!(dstat & DSTAT_SIR, DSTAT_SIR);
        assert_eq!(dstat & DSTAT_DFE, DSTAT_DFE);
        // The read acknowledged the interrupt.
        assert_eq!(mock.read8(Register::Istat) & ISTAT_DIP, 0);
        assert_eq!(mock.read8(Register::Dstat), DSTAT_DFE);
        assert_eq!(mock.read32(Register::Dsps), TOKEN_DMA_DONE);
    }

    #[test]
    fn test_sstat0_read_clears_sip() {
        let (mut mock, _arena) = fixture();
        mock.raise_scsi_interrupt(0x04);
        assert_eq!(mock.read8(Register::Istat) & ISTAT_SIP, ISTAT_SIP);
        assert_eq!(mock.read8(Register::Sstat0), 0x04);
        assert_eq!(mock.read8(Register::Istat) & ISTAT_SIP, 0);
        assert_eq!(mock.read8(Register::Sstat0), 0);
    }

    #[test]
    fn test_memory_move_copies_through_arena() {
        let (mut mock, arena) = fixture();
        let (script, src, dst) = {
            let mut arena = arena.lock().unwrap();
            let src = arena.alloc(32, MemClass::Chip).unwrap();
            let dst = arena.alloc(32, MemClass::Fast).unwrap();
            arena.write(src, &[0x5A; 32]).unwrap();
            let script = ScriptBuilder::transfer(src, dst, 32, TOKEN_DMA_DONE)
                .unwrap()
                .build(&mut arena, MemClass::Chip)
                .unwrap();
            (script, src, dst)
        };
        let _ = src;
        mock.write32(Register::Dsp, script.base.0);
        assert_eq!(mock.read8(Register::Dstat) & DSTAT_SIR, DSTAT_SIR);
        let mut out = [0u8; 32];
        arena.lock().unwrap().read(dst, &mut out).unwrap();
        assert_eq!(out, [0x5A; 32]);
    }

    #[test]
    fn test_soft_reset_clears_everything() {
        let (mut mock, _arena) = fixture();
        mock.raise_scsi_interrupt(0x04);
        mock.write8(Register::Scid, 0x80);
        mock.write8(Register::Istat, ISTAT_RST);
        assert_eq!(mock.read8(Register::Istat), ISTAT_RST);
        mock.write8(Register::Istat, 0);
        assert_eq!(mock.read8(Register::Istat), 0);
        assert_eq!(mock.read8(Register::Scid), 0);
        assert_eq!(mock.read8(Register::Sstat0), 0);
    }

    #[test]
    fn test_abort_write_latches_abrt() {
        let (mut mock, _arena) = fixture();
        mock.write8(Register::Istat, ISTAT_ABRT);
        assert_eq!(mock.read8(Register::Istat) & ISTAT_DIP, ISTAT_DIP);
        assert_eq!(mock.read8(Register::Dstat) & DSTAT_ABRT, DSTAT_ABRT);
    }

    #[test]
    fn test_garbage_script_is_illegal_instruction() {
        let (mut mock, arena) = fixture();
        let junk = {
            let mut arena = arena.lock().unwrap();
            let junk = arena.alloc(8, MemClass::Chip).unwrap();
            arena.write(junk, &[0x12, 0, 0, 0, 0, 0, 0, 0]).unwrap();
            junk
        };
        mock.write32(Register::Dsp, junk.0);
        assert_eq!(mock.read8(Register::Dstat) & DSTAT_IID, DSTAT_IID);
    }
}
