use crate::error::{NcrError, NcrResult};
use crate::mem::{BusAddr, DmaArena, MemClass};

/// Token placed in the terminal interrupt of a plain memory-move script.
pub const TOKEN_DMA_DONE: u32 = 0xDEAD_BEEF;
/// Token signalling that a device transaction ran to completion.
pub const TOKEN_COMPLETE: u32 = 0xFEED_0000;
/// Token reachable only through the selection-failure branch.
pub const TOKEN_SELECT_FAILED: u32 = 0xDEAD_0000;

/// Most scripts fit comfortably; the cap exists because the script buffer is
/// a bounded pre-allocated region, not because of any transfer-size limit.
pub const MAX_SG_SEGMENTS: usize = 8;

const LEN_MAX: u32 = 0x00FF_FFFF;

// Opcode bytes (the top byte of the first instruction word).
const OP_MEMORY_MOVE: u8 = 0xC0;
const OP_PHASE_MOVE_BASE: u8 = 0x08; // plus the 3-bit phase
const OP_SELECT_ATN: u8 = 0x47;
const OP_WAIT_DISCONNECT: u8 = 0x48;
const OP_INT: u8 = 0x98;
const INT_CONTROL_ALWAYS: u8 = 0x08; // second byte of an INT instruction

/// Bus phases as encoded on the SCSI control lines. 4 and 5 are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    DataOut = 0,
    DataIn = 1,
    Command = 2,
    Status = 3,
    MsgOut = 6,
    MsgIn = 7,
}

impl Phase {
    pub fn from_bits(bits: u8) -> Option<Phase> {
        match bits {
            0 => Some(Phase::DataOut),
            1 => Some(Phase::DataIn),
            2 => Some(Phase::Command),
            3 => Some(Phase::Status),
            6 => Some(Phase::MsgOut),
            7 => Some(Phase::MsgIn),
            _ => None,
        }
    }
}

/// One instruction of the chip's micro-sequencer.
///
/// Instructions encode as big-endian word pairs (8 bytes); the
/// memory-to-memory move carries both a source and a destination and takes a
/// third word (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Bus-master copy of `len` bytes, no SCSI involvement.
    MemoryMove { len: u32, src: BusAddr, dst: BusAddr },
    /// Move `len` bytes to or from `addr`, gated on the bus being in
    /// `phase`. A mismatch with the live bus phase is a run-time protocol
    /// error, never a builder error.
    PhaseMove { len: u32, phase: Phase, addr: BusAddr },
    /// Select the target in `target_mask` with ATN; on failure the sequencer
    /// branches to the absolute address `fail_addr`.
    SelectAtn { target_mask: u8, fail_addr: BusAddr },
    /// Wait for the target to release the bus.
    WaitDisconnect,
    /// Halt the sequencer and raise a script interrupt; `token` becomes
    /// readable in the save register.
    ScriptInt { token: u32 },
}

impl Instruction {
    /// Size of the encoded instruction in bytes.
    pub fn encoded_len(&self) -> u32 {
        match self {
            Instruction::MemoryMove { .. } => 12,
            _ => 8,
        }
    }

    /// Append the encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> NcrResult<()> {
        match *self {
            Instruction::MemoryMove { len, src, dst } => {
                check_len(len)?;
                out.extend_from_slice(&(((OP_MEMORY_MOVE as u32) << 24) | len).to_be_bytes());
                out.extend_from_slice(&src.0.to_be_bytes());
                out.extend_from_slice(&dst.0.to_be_bytes());
            }
            Instruction::PhaseMove { len, phase, addr } => {
                check_len(len)?;
                let op = (OP_PHASE_MOVE_BASE | phase as u8) as u32;
                out.extend_from_slice(&((op << 24) | len).to_be_bytes());
                out.extend_from_slice(&addr.0.to_be_bytes());
            }
            Instruction::SelectAtn {
                target_mask,
                fail_addr,
            } => {
                let word = ((OP_SELECT_ATN as u32) << 24) | ((target_mask as u32) << 16);
                out.extend_from_slice(&word.to_be_bytes());
                out.extend_from_slice(&fail_addr.0.to_be_bytes());
            }
            Instruction::WaitDisconnect => {
                out.extend_from_slice(&((OP_WAIT_DISCONNECT as u32) << 24).to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
            }
            Instruction::ScriptInt { token } => {
                let word = ((OP_INT as u32) << 24) | ((INT_CONTROL_ALWAYS as u32) << 16);
                out.extend_from_slice(&word.to_be_bytes());
                out.extend_from_slice(&token.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Decode one instruction from the front of `bytes`, returning it along
    /// with the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> NcrResult<(Instruction, usize)> {
        if bytes.len() < 8 {
            return Err(NcrError::BadInstruction(format!(
                "truncated instruction ({} bytes)",
                bytes.len()
            )));
        }
        let word0 = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let word1 = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let op = (word0 >> 24) as u8;
        match op {
            OP_MEMORY_MOVE => {
                if bytes.len() < 12 {
                    return Err(NcrError::BadInstruction(
                        "truncated memory move".to_string(),
                    ));
                }
                let word2 = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
                Ok((
                    Instruction::MemoryMove {
                        len: word0 & LEN_MAX,
                        src: BusAddr(word1),
                        dst: BusAddr(word2),
                    },
                    12,
                ))
            }
            OP_SELECT_ATN => Ok((
                Instruction::SelectAtn {
                    target_mask: ((word0 >> 16) & 0xFF) as u8,
                    fail_addr: BusAddr(word1),
                },
                8,
            )),
            OP_WAIT_DISCONNECT => Ok((Instruction::WaitDisconnect, 8)),
            OP_INT => {
                if (word0 >> 16) as u8 as u32 != INT_CONTROL_ALWAYS as u32 {
                    return Err(NcrError::BadInstruction(format!(
                        "unsupported INT control byte in {:#010x}",
                        word0
                    )));
                }
                Ok((Instruction::ScriptInt { token: word1 }, 8))
            }
            _ if op & 0xF8 == OP_PHASE_MOVE_BASE => {
                let phase = Phase::from_bits(op & 0x07).ok_or_else(|| {
                    NcrError::BadInstruction(format!("reserved phase in {:#010x}", word0))
                })?;
                Ok((
                    Instruction::PhaseMove {
                        len: word0 & LEN_MAX,
                        phase,
                        addr: BusAddr(word1),
                    },
                    8,
                ))
            }
            _ => Err(NcrError::BadInstruction(format!(
                "unknown opcode {:#04x}",
                op
            ))),
        }
    }
}

fn check_len(len: u32) -> NcrResult<()> {
    if len > LEN_MAX {
        return Err(NcrError::LengthOverflow(len));
    }
    if len == 0 {
        return Err(NcrError::BadInstruction("zero-length move".to_string()));
    }
    Ok(())
}

/// Decode a whole instruction stream, for inspection and tests.
pub fn decode_script(bytes: &[u8]) -> NcrResult<Vec<Instruction>> {
    let mut instrs = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let (instr, used) = Instruction::decode(&bytes[pos..])?;
        instrs.push(instr);
        pos += used;
    }
    Ok(instrs)
}

/// A script resident in chip-addressable memory, ready to execute.
///
/// The backing allocation (and every buffer the script references) must not
/// be freed or moved while the script is outstanding.
#[derive(Debug, Clone, Copy)]
pub struct Script {
    pub base: BusAddr,
    /// Encoded length in bytes; also the allocation size.
    pub len: u32,
    /// Token the terminal interrupt reports on completion.
    pub ok_token: u32,
    /// Token of the selection-failure branch, if the script has one.
    pub fail_token: Option<u32>,
}

impl Script {
    pub fn release(self, arena: &mut DmaArena) -> NcrResult<()> {
        arena.free(self.base, self.len)
    }
}

/// Builds the three program shapes the tool uses and writes them into a
/// [`DmaArena`].
pub struct ScriptBuilder {
    instrs: Vec<Instruction>,
    ok_token: u32,
    fail_token: Option<u32>,
    // Index of a SelectAtn whose fail_addr must be patched to the absolute
    // address of the final instruction once the script base is known.
    select_fixup: Option<usize>,
}

impl ScriptBuilder {
    /// Plain transfer: one memory move plus the terminal interrupt.
    pub fn transfer(src: BusAddr, dst: BusAddr, len: u32, token: u32) -> NcrResult<Self> {
        check_len(len)?;
        Ok(ScriptBuilder {
            instrs: vec![
                Instruction::MemoryMove { len, src, dst },
                Instruction::ScriptInt { token },
            ],
            ok_token: token,
            fail_token: None,
            select_fixup: None,
        })
    }

    /// Gather `segments` into one contiguous destination: segment `i` lands
    /// at `dst` plus the sum of the lengths of segments `0..i`.
    pub fn gather(segments: &[(BusAddr, u32)], dst: BusAddr, token: u32) -> NcrResult<Self> {
        if segments.is_empty() || segments.len() > MAX_SG_SEGMENTS {
            return Err(NcrError::TooManySegments(segments.len()));
        }
        let mut instrs = Vec::with_capacity(segments.len() + 1);
        let mut dst_offset: u32 = 0;
        for &(src, len) in segments {
            check_len(len)?;
            instrs.push(Instruction::MemoryMove {
                len,
                src,
                dst: dst.offset(dst_offset),
            });
            dst_offset += len;
        }
        check_len(dst_offset)?;
        instrs.push(Instruction::ScriptInt { token });
        Ok(ScriptBuilder {
            instrs,
            ok_token: token,
            fail_token: None,
            select_fixup: None,
        })
    }

    /// The six-phase device transaction, with an optional data phase between
    /// command and status. The selection-failure branch lands on a second
    /// interrupt instruction placed after the main body; its address is
    /// resolved to an absolute target when the script is written out.
    #[allow(clippy::too_many_arguments)]
    pub fn transaction(
        target_id: u8,
        msg_out: (BusAddr, u32),
        cmd: (BusAddr, u32),
        data: Option<(Phase, BusAddr, u32)>,
        status: BusAddr,
        msg_in: BusAddr,
        ok_token: u32,
        fail_token: u32,
    ) -> NcrResult<Self> {
        let mut instrs = vec![
            Instruction::SelectAtn {
                target_mask: 1 << target_id,
                fail_addr: BusAddr(0), // patched in build()
            },
            Instruction::PhaseMove {
                len: msg_out.1,
                phase: Phase::MsgOut,
                addr: msg_out.0,
            },
            Instruction::PhaseMove {
                len: cmd.1,
                phase: Phase::Command,
                addr: cmd.0,
            },
        ];
        if let Some((phase, addr, len)) = data {
            if phase != Phase::DataIn && phase != Phase::DataOut {
                return Err(NcrError::BadInstruction(format!(
                    "{:?} is not a data phase",
                    phase
                )));
            }
            instrs.push(Instruction::PhaseMove { len, phase, addr });
        }
        instrs.push(Instruction::PhaseMove {
            len: 1,
            phase: Phase::Status,
            addr: status,
        });
        instrs.push(Instruction::PhaseMove {
            len: 1,
            phase: Phase::MsgIn,
            addr: msg_in,
        });
        instrs.push(Instruction::WaitDisconnect);
        instrs.push(Instruction::ScriptInt { token: ok_token });
        instrs.push(Instruction::ScriptInt { token: fail_token });
        Ok(ScriptBuilder {
            instrs,
            ok_token,
            fail_token: Some(fail_token),
            select_fixup: Some(0),
        })
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instrs
    }

    fn encoded_size(&self) -> u32 {
        self.instrs.iter().map(Instruction::encoded_len).sum()
    }

    /// Allocate space in the arena, resolve the selection-failure address,
    /// and write the encoded program.
    pub fn build(mut self, arena: &mut DmaArena, class: MemClass) -> NcrResult<Script> {
        let size = self.encoded_size();
        let base = arena.alloc(size, class)?;
        if let Some(idx) = self.select_fixup {
            // The failure branch is the last instruction; its target is
            // absolute, never an offset.
            let fail_offset = size - 8;
            if let Instruction::SelectAtn { fail_addr, .. } = &mut self.instrs[idx] {
                *fail_addr = base.offset(fail_offset);
            }
        }
        let mut encoded = Vec::with_capacity(size as usize);
        for instr in &self.instrs {
            instr.encode_into(&mut encoded)?;
        }
        match arena.write(base, &encoded) {
            Ok(()) => Ok(Script {
                base,
                len: size,
                ok_token: self.ok_token,
                fail_token: self.fail_token,
            }),
            Err(e) => {
                let _ = arena.free(base, size);
                Err(e)
            }
        }
    }
}
