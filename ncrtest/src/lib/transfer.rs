use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::error::{NcrError, NcrResult};
use crate::exec::{self, execute_polling, Deadline, Outcome};
use crate::mem::{BusAddr, DmaArena, MemClass};
use crate::regs::RegisterFile;
use crate::script::{ScriptBuilder, MAX_SG_SEGMENTS, TOKEN_DMA_DONE};

// Same generator the verify side regenerates, so no reference buffer needs
// to be kept around for large transfers.
const LCG_MULTIPLIER: u32 = 1_103_515_245;
const LCG_INCREMENT: u32 = 12_345;
const LCG_SEED: u32 = 0x1234_5678;

/// Fill patterns for exercising the DMA path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Zeros,
    Ones,
    /// A single bit walking through each byte.
    Walking,
    Alternating,
    /// Deterministic pseudo-random bytes.
    Random,
}

impl Pattern {
    pub fn fill(self, buf: &mut [u8]) {
        match self {
            Pattern::Zeros => buf.fill(0x00),
            Pattern::Ones => buf.fill(0xFF),
            Pattern::Walking => {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = 1 << (i % 8);
                }
            }
            Pattern::Alternating => {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = if i % 2 == 0 { 0xAA } else { 0x55 };
                }
            }
            Pattern::Random => {
                let mut seed = LCG_SEED;
                for byte in buf.iter_mut() {
                    seed = seed.wrapping_mul(LCG_MULTIPLIER).wrapping_add(LCG_INCREMENT);
                    *byte = (seed >> 16) as u8;
                }
            }
        }
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Pattern::Zeros => "zeros",
            Pattern::Ones => "ones",
            Pattern::Walking => "walking",
            Pattern::Alternating => "alternating",
            Pattern::Random => "random",
        };
        write!(f, "{}", name)
    }
}

/// One patterned memory-to-memory transfer, verified byte for byte.
pub fn run_transfer<R: RegisterFile>(
    regs: &mut R,
    arena: &Arc<Mutex<DmaArena>>,
    src_class: MemClass,
    dst_class: MemClass,
    len: u32,
    pattern: Pattern,
    deadline: Deadline,
) -> NcrResult<()> {
    debug!(
        "Transfer: {} bytes, {:?} -> {:?}, pattern {}.",
        len, src_class, dst_class, pattern
    );
    let mut expected = vec![0u8; len as usize];
    pattern.fill(&mut expected);

    let (src, dst, script) = {
        let mut arena = arena.lock().unwrap();
        let src = arena.alloc(len, src_class)?;
        let dst = match arena.alloc(len, dst_class) {
            Ok(dst) => dst,
            Err(e) => {
                let _ = arena.free(src, len);
                return Err(e);
            }
        };
        let script = arena
            .write(src, &expected)
            .and_then(|()| ScriptBuilder::transfer(src, dst, len, TOKEN_DMA_DONE))
            .and_then(|b| b.build(&mut arena, MemClass::Chip));
        match script {
            Ok(script) => (src, dst, script),
            Err(e) => {
                let _ = arena.free(src, len);
                let _ = arena.free(dst, len);
                return Err(e);
            }
        }
    };

    let outcome = execute_polling(regs, &script, deadline);
    if matches!(outcome, Outcome::Timeout | Outcome::Cancelled) {
        exec::abort(regs);
    }
    let result = outcome_to_result(outcome).and_then(|()| {
        let arena = arena.lock().unwrap();
        let mut actual = vec![0u8; len as usize];
        arena.read(dst, &mut actual)?;
        verify(&expected, &actual)
    });

    let mut arena = arena.lock().unwrap();
    let _ = script.release(&mut arena);
    let _ = arena.free(src, len);
    let _ = arena.free(dst, len);
    if result.is_ok() {
        info!("Transfer of {} bytes verified.", len);
    }
    result
}

/// Gather scattered segments into one contiguous buffer and verify that the
/// destination is the exact concatenation of the sources.
pub fn run_gather<R: RegisterFile>(
    regs: &mut R,
    arena: &Arc<Mutex<DmaArena>>,
    segment_lens: &[u32],
    pattern: Pattern,
    deadline: Deadline,
) -> NcrResult<()> {
    if segment_lens.is_empty() || segment_lens.len() > MAX_SG_SEGMENTS {
        return Err(NcrError::TooManySegments(segment_lens.len()));
    }
    let total: u32 = segment_lens.iter().sum();
    debug!(
        "Gather: {} segments, {} bytes total, pattern {}.",
        segment_lens.len(),
        total,
        pattern
    );
    let mut expected = vec![0u8; total as usize];
    pattern.fill(&mut expected);

    let (segments, dst, script) = {
        let mut arena = arena.lock().unwrap();
        let mut segments: Vec<(BusAddr, u32)> = Vec::with_capacity(segment_lens.len());
        let mut offset = 0usize;
        let mut failure = None;
        for &len in segment_lens {
            match arena.alloc(len, MemClass::Fast) {
                Ok(addr) => {
                    segments.push((addr, len));
                    if let Err(e) = arena.write(addr, &expected[offset..offset + len as usize]) {
                        failure = Some(e);
                        break;
                    }
                    offset += len as usize;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let built = match failure {
            Some(e) => Err(e),
            None => arena.alloc(total, MemClass::Fast).and_then(|dst| {
                ScriptBuilder::gather(&segments, dst, TOKEN_DMA_DONE)
                    .and_then(|b| b.build(&mut arena, MemClass::Chip))
                    .map(|script| (dst, script))
                    .map_err(|e| {
                        let _ = arena.free(dst, total);
                        e
                    })
            }),
        };
        match built {
            Ok((dst, script)) => (segments, dst, script),
            Err(e) => {
                for (addr, len) in segments {
                    let _ = arena.free(addr, len);
                }
                return Err(e);
            }
        }
    };

    let outcome = execute_polling(regs, &script, deadline);
    if matches!(outcome, Outcome::Timeout | Outcome::Cancelled) {
        exec::abort(regs);
    }
    let result = outcome_to_result(outcome).and_then(|()| {
        let arena = arena.lock().unwrap();
        let mut actual = vec![0u8; total as usize];
        arena.read(dst, &mut actual)?;
        verify(&expected, &actual)
    });

    let mut arena = arena.lock().unwrap();
    let _ = script.release(&mut arena);
    let _ = arena.free(dst, total);
    for (addr, len) in segments {
        let _ = arena.free(addr, len);
    }
    if result.is_ok() {
        info!(
            "Gather of {} segments ({} bytes) verified.",
            segment_lens.len(),
            total
        );
    }
    result
}

fn outcome_to_result(outcome: Outcome) -> NcrResult<()> {
    match outcome {
        Outcome::Success => Ok(()),
        Outcome::Timeout => Err(NcrError::Timeout),
        Outcome::Cancelled => Err(NcrError::Cancelled),
        Outcome::Controller(fault) => Err(NcrError::Controller(fault)),
        // Memory-only scripts have no selection branch.
        Outcome::SelectionFailed => Err(NcrError::Fatal(
            "selection failure from a memory-only script".to_string(),
        )),
    }
}

fn verify(expected: &[u8], actual: &[u8]) -> NcrResult<()> {
    for (offset, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        if e != a {
            return Err(NcrError::VerifyMismatch {
                offset: offset as u32,
                expected: *e,
                actual: *a,
            });
        }
    }
    Ok(())
}
