use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use crate::bridge::{CancelHandle, CompletionBridge, InterruptHost};
use crate::error::{DeviceFault, NcrError, NcrResult};
use crate::exec::{execute_blocking, execute_polling, Deadline, Outcome};
use crate::mem::{BusAddr, DmaArena, MemClass};
use crate::regs::RegisterFile;
use crate::script::{Phase, ScriptBuilder, TOKEN_COMPLETE, TOKEN_SELECT_FAILED};

// Command opcodes.
pub const OP_TEST_UNIT_READY: u8 = 0x00;
pub const OP_REQUEST_SENSE: u8 = 0x03;
pub const OP_READ_6: u8 = 0x08;
pub const OP_WRITE_6: u8 = 0x0A;
pub const OP_INQUIRY: u8 = 0x12;
pub const OP_READ_CAPACITY: u8 = 0x25;
pub const OP_READ_10: u8 = 0x28;
pub const OP_WRITE_10: u8 = 0x2A;

// Status byte values.
pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;
pub const STATUS_BUSY: u8 = 0x08;

// Messages.
pub const MSG_COMMAND_COMPLETE: u8 = 0x00;
pub const MSG_IDENTIFY: u8 = 0x80;

/// The IDENTIFY message routing a transaction to one logical unit.
pub fn identify(lun: u8) -> u8 {
    MSG_IDENTIFY | (lun & 0x07)
}

pub const INQUIRY_LEN: u32 = 36;
pub const BLOCK_SIZE: u32 = 512;

// Per-transaction control block: message buffers, command buffer and the
// status landing byte share one chip-memory allocation.
const CTL_MSG_OUT: u32 = 0;
const CTL_MSG_IN: u32 = 8;
const CTL_CMD: u32 = 16;
const CTL_STATUS: u32 = 28;
const CTL_SIZE: u32 = 32;

/// A command descriptor block. Only 6-byte commands are issued today but
/// the buffer leaves room for 12-byte ones.
#[derive(Debug, Clone, Copy)]
pub struct Cdb {
    bytes: [u8; 12],
    len: u8,
}

impl Cdb {
    pub fn test_unit_ready() -> Cdb {
        let mut bytes = [0; 12];
        bytes[0] = OP_TEST_UNIT_READY;
        Cdb { bytes, len: 6 }
    }

    pub fn inquiry(alloc_len: u8) -> Cdb {
        let mut bytes = [0; 12];
        bytes[0] = OP_INQUIRY;
        bytes[4] = alloc_len;
        Cdb { bytes, len: 6 }
    }

    /// 6-byte READ. `lba` is truncated to the command's 21-bit field, the
    /// LUN shares the same byte; `blocks` of 0 means 256.
    pub fn read6(lun: u8, lba: u32, blocks: u8) -> Cdb {
        Self::rw6(OP_READ_6, lun, lba, blocks)
    }

    /// 6-byte WRITE, same field limits as [`Cdb::read6`].
    pub fn write6(lun: u8, lba: u32, blocks: u8) -> Cdb {
        Self::rw6(OP_WRITE_6, lun, lba, blocks)
    }

    fn rw6(op: u8, lun: u8, lba: u32, blocks: u8) -> Cdb {
        let mut bytes = [0; 12];
        bytes[0] = op;
        bytes[1] = ((lun & 0x07) << 5) | ((lba >> 16) & 0x1F) as u8;
        bytes[2] = (lba >> 8) as u8;
        bytes[3] = lba as u8;
        bytes[4] = blocks;
        Cdb { bytes, len: 6 }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }
}

/// Parsed standard INQUIRY response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryData {
    pub device_type: u8,
    pub removable: bool,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl InquiryData {
    pub fn parse(raw: &[u8; 36]) -> InquiryData {
        InquiryData {
            device_type: raw[0] & 0x1F,
            removable: raw[1] & 0x80 != 0,
            vendor: ascii_field(&raw[8..16]),
            product: ascii_field(&raw[16..32]),
            revision: ascii_field(&raw[32..36]),
        }
    }
}

fn ascii_field(raw: &[u8]) -> String {
    raw.iter()
        .map(|&b| {
            if (0x20..0x7F).contains(&b) {
                b as char
            } else {
                '.'
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

impl std::fmt::Display for InquiryData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} (type {:#04x})",
            self.vendor, self.product, self.revision, self.device_type
        )
    }
}

/// How completions are delivered to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionModel {
    /// Busy-poll the status registers.
    Polling,
    /// Sleep on the interrupt bridge.
    Interrupt,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Our own bus ID; never probed or selected.
    pub host_id: u8,
    pub completion: CompletionModel,
    pub deadline: Deadline,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            host_id: 7,
            completion: CompletionModel::Polling,
            deadline: Deadline::Wall(std::time::Duration::from_secs(2)),
        }
    }
}

enum DataPhase<'a> {
    None,
    In(u32),
    Out(&'a [u8]),
}

/// Runs whole SCSI transactions: builds the script, drives the controller,
/// and maps the raw outcome to a per-device result.
///
/// One engine owns the controller; transactions run one at a time.
pub struct TransactionEngine<R: RegisterFile + Clone + Send + 'static> {
    regs: R,
    arena: Arc<Mutex<DmaArena>>,
    config: EngineConfig,
    bridge: Option<CompletionBridge<R>>,
}

impl<R: RegisterFile + Clone + Send + 'static> TransactionEngine<R> {
    /// Polling engine; completions are picked up by busy-waiting.
    pub fn new(regs: R, arena: Arc<Mutex<DmaArena>>, config: EngineConfig) -> Self {
        TransactionEngine {
            regs,
            arena,
            config,
            bridge: None,
        }
    }

    /// Interrupt-driven engine: installs a handler into `host` and sleeps
    /// on completions.
    pub fn with_interrupts<H: InterruptHost>(
        regs: R,
        arena: Arc<Mutex<DmaArena>>,
        config: EngineConfig,
        host: &mut H,
    ) -> Self {
        let bridge = CompletionBridge::install(regs.clone(), host);
        TransactionEngine {
            regs,
            arena,
            config,
            bridge: Some(bridge),
        }
    }

    /// Unhook the interrupt handler, if one was installed.
    pub fn shutdown<H: InterruptHost>(self, host: &mut H) {
        if let Some(bridge) = self.bridge {
            bridge.remove(host);
        }
    }

    pub fn host_id(&self) -> u8 {
        self.config.host_id
    }

    /// Handle for aborting a blocked transaction from another thread.
    /// `None` for a polling engine.
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.bridge.as_ref().map(CompletionBridge::cancel_handle)
    }

    pub fn test_unit_ready(&mut self, target_id: u8, lun: u8) -> NcrResult<()> {
        let (status, _) = self.run(target_id, lun, &Cdb::test_unit_ready(), DataPhase::None)?;
        check_status(status)
    }

    pub fn inquiry(&mut self, target_id: u8, lun: u8) -> NcrResult<InquiryData> {
        let cdb = Cdb::inquiry(INQUIRY_LEN as u8);
        let (status, data) = self.run(target_id, lun, &cdb, DataPhase::In(INQUIRY_LEN))?;
        check_status(status)?;
        let mut raw = [0u8; INQUIRY_LEN as usize];
        raw.copy_from_slice(&data);
        Ok(InquiryData::parse(&raw))
    }

    /// Read `blocks` blocks starting at `lba` (0 means 256).
    pub fn read6(&mut self, target_id: u8, lun: u8, lba: u32, blocks: u8) -> NcrResult<Vec<u8>> {
        let count = if blocks == 0 { 256 } else { blocks as u32 };
        let cdb = Cdb::read6(lun, lba, blocks);
        let (status, data) = self.run(target_id, lun, &cdb, DataPhase::In(count * BLOCK_SIZE))?;
        check_status(status)?;
        Ok(data)
    }

    /// Write whole blocks starting at `lba`.
    pub fn write6(&mut self, target_id: u8, lun: u8, lba: u32, data: &[u8]) -> NcrResult<()> {
        if data.is_empty() || data.len() % BLOCK_SIZE as usize != 0 {
            return Err(NcrError::PartialBlock(data.len() as u32));
        }
        let blocks = data.len() as u32 / BLOCK_SIZE;
        let cdb = Cdb::write6(lun, lba, blocks as u8);
        let (status, _) = self.run(target_id, lun, &cdb, DataPhase::Out(data))?;
        check_status(status)
    }

    // Run one whole transaction. Returns the status byte and, for a data-in
    // phase, the transferred bytes (empty otherwise). All DMA memory is
    // reclaimed on every path; on timeout or cancellation the chip is
    // aborted first so it cannot touch freed buffers.
    fn run(&mut self, target_id: u8, lun: u8, cdb: &Cdb, data: DataPhase) -> NcrResult<(u8, Vec<u8>)> {
        debug!(
            "Transaction: target {} lun {}, opcode {:#04x}.",
            target_id,
            lun,
            cdb.opcode()
        );
        let (ctl, data_buf, script) = {
            let mut arena = self.arena.lock().unwrap();
            let ctl = arena.alloc(CTL_SIZE, MemClass::Chip)?;
            arena.write(ctl.offset(CTL_MSG_OUT), &[identify(lun)])?;
            arena.write(ctl.offset(CTL_CMD), cdb.bytes())?;

            let data_buf = match &data {
                DataPhase::None => None,
                DataPhase::In(len) => Some((arena.alloc(*len, MemClass::Fast)?, *len)),
                DataPhase::Out(bytes) => {
                    let buf = arena.alloc(bytes.len() as u32, MemClass::Fast)?;
                    arena.write(buf, bytes)?;
                    Some((buf, bytes.len() as u32))
                }
            };
            let phase = match &data {
                DataPhase::Out(_) => Phase::DataOut,
                _ => Phase::DataIn,
            };
            let data_move = data_buf.map(|(addr, len)| (phase, addr, len));

            let build = ScriptBuilder::transaction(
                target_id,
                (ctl.offset(CTL_MSG_OUT), 1),
                (ctl.offset(CTL_CMD), cdb.bytes().len() as u32),
                data_move,
                ctl.offset(CTL_STATUS),
                ctl.offset(CTL_MSG_IN),
                TOKEN_COMPLETE,
                TOKEN_SELECT_FAILED,
            )
            .and_then(|b| b.build(&mut arena, MemClass::Chip));
            let script = match build {
                Ok(script) => script,
                Err(e) => {
                    let _ = arena.free(ctl, CTL_SIZE);
                    if let Some((addr, len)) = data_buf {
                        let _ = arena.free(addr, len);
                    }
                    return Err(e);
                }
            };
            (ctl, data_buf, script)
        };

        let outcome = match &mut self.bridge {
            Some(bridge) => execute_blocking(
                &mut self.regs,
                bridge,
                &script,
                self.config.deadline.as_duration(),
            ),
            None => execute_polling(&mut self.regs, &script, self.config.deadline),
        };

        let data_in = match data {
            DataPhase::In(_) => data_buf,
            _ => None,
        };
        let result = match outcome {
            Outcome::Success => self.collect(ctl, data_in),
            Outcome::SelectionFailed => Err(NcrError::Device(DeviceFault::NoDevice)),
            Outcome::Timeout => {
                self.abort_script();
                Err(NcrError::Timeout)
            }
            Outcome::Cancelled => {
                self.abort_script();
                Err(NcrError::Cancelled)
            }
            Outcome::Controller(fault) => Err(NcrError::Controller(fault)),
        };

        let mut arena = self.arena.lock().unwrap();
        let _ = script.release(&mut arena);
        let _ = arena.free(ctl, CTL_SIZE);
        if let Some((addr, len)) = data_buf {
            let _ = arena.free(addr, len);
        }
        result
    }

    // Pick up the status byte and any data-in bytes after a successful run.
    fn collect(&self, ctl: BusAddr, data_in: Option<(BusAddr, u32)>) -> NcrResult<(u8, Vec<u8>)> {
        let arena = self.arena.lock().unwrap();
        let status = arena.read_u8(ctl.offset(CTL_STATUS))?;
        let data = match data_in {
            Some((addr, len)) => {
                let mut out = vec![0u8; len as usize];
                arena.read(addr, &mut out)?;
                out
            }
            None => Vec::new(),
        };
        trace!("Transaction complete, status {:#04x}.", status);
        Ok((status, data))
    }

    // Stop a script that may still be running and acknowledge the resulting
    // interrupt. Only after this is it safe to free the script's buffers.
    fn abort_script(&mut self) {
        warn!("Aborting outstanding script.");
        crate::exec::abort(&mut self.regs);
    }
}

fn check_status(status: u8) -> NcrResult<()> {
    match status {
        STATUS_GOOD => Ok(()),
        STATUS_CHECK_CONDITION => Err(NcrError::Device(DeviceFault::CheckCondition)),
        other => Err(NcrError::Device(DeviceFault::UnexpectedStatus(other))),
    }
}
