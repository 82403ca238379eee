use rt_abi::{
    PRECODE_FALLBACK_OFFSET, PRECODE_INLINE_FALLBACK_OFFSET, PRECODE_SECRET_OFFSET,
    PRECODE_SLOT_SIZE, PRECODE_TARGET_OFFSET,
};

use super::{StubCodegen, TargetArch, unsupported};
use crate::error::{RtError, RtResult};
use crate::precode::PrecodeKind;

const BRK_0: u32 = 0xD4200000;
const LDR_LITERAL_X: u32 = 0x58000000;
const BR: u32 = 0xD61F0000;

const TARGET_REG: u32 = 9;
const SECRET_REG: u32 = 10;
const IMPORT_CELL_REG: u32 = 11;
const INTERPRETER_REG: u32 = 12;

// imm19 is a signed word offset.
const LITERAL_RANGE: usize = (1 << 18) * 4;

pub struct Aarch64Stubs;

impl StubCodegen for Aarch64Stubs {
    fn arch(&self) -> TargetArch {
        TargetArch::Aarch64
    }

    // The return buffer has its own register (x8), so there is nothing to swap.
    fn supports(&self, kind: PrecodeKind) -> bool {
        !matches!(kind, PrecodeKind::ThisPtrRetBuf)
    }

    fn emit_template(&self, kind: PrecodeKind, page_size: usize) -> RtResult<Vec<u8>> {
        if !self.supports(kind) {
            return Err(unsupported(kind, self.arch()));
        }
        if page_size + PRECODE_SLOT_SIZE >= LITERAL_RANGE {
            return Err(RtError::ExecutableMemory(format!(
                "page size {page_size} exceeds ldr literal range"
            )));
        }
        let mut code = Vec::with_capacity(PRECODE_SLOT_SIZE);
        match kind {
            PrecodeKind::Stub => {
                emit_ldr_data(&mut code, SECRET_REG, PRECODE_SECRET_OFFSET, page_size);
                emit_ldr_data(&mut code, TARGET_REG, PRECODE_TARGET_OFFSET, page_size);
                emit_u32(&mut code, BR | (TARGET_REG << 5));
            }
            PrecodeKind::Fixup | PrecodeKind::Import => {
                let cell_reg = if kind == PrecodeKind::Fixup {
                    SECRET_REG
                } else {
                    IMPORT_CELL_REG
                };
                emit_ldr_data(&mut code, TARGET_REG, PRECODE_TARGET_OFFSET, page_size);
                emit_u32(&mut code, BR | (TARGET_REG << 5));
                pad_to(&mut code, PRECODE_INLINE_FALLBACK_OFFSET);
                emit_ldr_data(&mut code, cell_reg, PRECODE_SECRET_OFFSET, page_size);
                emit_ldr_data(&mut code, TARGET_REG, PRECODE_FALLBACK_OFFSET, page_size);
                emit_u32(&mut code, BR | (TARGET_REG << 5));
            }
            PrecodeKind::Interpreter => {
                emit_ldr_data(&mut code, INTERPRETER_REG, PRECODE_SECRET_OFFSET, page_size);
                emit_ldr_data(&mut code, TARGET_REG, PRECODE_TARGET_OFFSET, page_size);
                emit_u32(&mut code, BR | (TARGET_REG << 5));
            }
            PrecodeKind::ThisPtrRetBuf => return Err(unsupported(kind, self.arch())),
        }
        pad_to(&mut code, PRECODE_SLOT_SIZE);
        Ok(code)
    }
}

fn emit_u32(code: &mut Vec<u8>, insn: u32) {
    code.extend_from_slice(&insn.to_le_bytes());
}

fn emit_ldr_data(code: &mut Vec<u8>, rt: u32, field: usize, page_size: usize) {
    let pc = code.len();
    let words = ((page_size + field - pc) / 4) as u32;
    emit_u32(code, LDR_LITERAL_X | ((words & 0x7FFFF) << 5) | rt);
}

fn pad_to(code: &mut Vec<u8>, len: usize) {
    while code.len() < len {
        emit_u32(code, BRK_0);
    }
}
