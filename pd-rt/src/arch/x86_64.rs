use rt_abi::{
    PRECODE_FALLBACK_OFFSET, PRECODE_INLINE_FALLBACK_OFFSET, PRECODE_SECRET_OFFSET,
    PRECODE_SLOT_SIZE, PRECODE_TARGET_OFFSET,
};

use super::{StubCodegen, TargetArch, unsupported};
use crate::error::{RtError, RtResult};
use crate::precode::PrecodeKind;

const INT3: u8 = 0xCC;

// REX.W/REX.WR + mov r64, [rip+disp32]
const MOV_R10_RIP: [u8; 3] = [0x4C, 0x8B, 0x15];
const MOV_R11_RIP: [u8; 3] = [0x4C, 0x8B, 0x1D];
const MOV_RAX_RIP: [u8; 3] = [0x48, 0x8B, 0x05];
const JMP_RIP: [u8; 2] = [0xFF, 0x25];

// mov rax, rcx; mov rcx, rdx; mov rdx, rax
const SWAP_RCX_RDX: [u8; 9] = [0x48, 0x89, 0xC8, 0x48, 0x89, 0xD1, 0x48, 0x89, 0xC2];
// mov rax, rdi; mov rdi, rsi; mov rsi, rax
const SWAP_RDI_RSI: [u8; 9] = [0x48, 0x89, 0xF8, 0x48, 0x89, 0xF7, 0x48, 0x89, 0xC6];

/// Registers carrying the first two integer arguments, which are the ones a
/// this/return-buffer precode exchanges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgRegisters {
    /// rdi, rsi
    SysV,
    /// rcx, rdx
    Windows,
}

impl ArgRegisters {
    pub const fn host() -> Self {
        if cfg!(windows) {
            ArgRegisters::Windows
        } else {
            ArgRegisters::SysV
        }
    }

    fn swap_sequence(self) -> &'static [u8; 9] {
        match self {
            ArgRegisters::SysV => &SWAP_RDI_RSI,
            ArgRegisters::Windows => &SWAP_RCX_RDX,
        }
    }
}

pub struct X86_64Stubs {
    pub args: ArgRegisters,
}

impl X86_64Stubs {
    pub const HOST: X86_64Stubs = X86_64Stubs {
        args: ArgRegisters::host(),
    };

    pub const fn new(args: ArgRegisters) -> Self {
        Self { args }
    }
}

impl StubCodegen for X86_64Stubs {
    fn arch(&self) -> TargetArch {
        TargetArch::X86_64
    }

    fn supports(&self, _kind: PrecodeKind) -> bool {
        true
    }

    fn emit_template(&self, kind: PrecodeKind, page_size: usize) -> RtResult<Vec<u8>> {
        if !self.supports(kind) {
            return Err(unsupported(kind, self.arch()));
        }
        let mut code = Vec::with_capacity(PRECODE_SLOT_SIZE);
        match kind {
            PrecodeKind::Stub => {
                emit_rip_load(&mut code, MOV_R10_RIP, PRECODE_SECRET_OFFSET, page_size)?;
                emit_rip_jump(&mut code, PRECODE_TARGET_OFFSET, page_size)?;
            }
            PrecodeKind::Fixup => {
                emit_rip_jump(&mut code, PRECODE_TARGET_OFFSET, page_size)?;
                pad_to(&mut code, PRECODE_INLINE_FALLBACK_OFFSET);
                emit_rip_load(&mut code, MOV_R10_RIP, PRECODE_SECRET_OFFSET, page_size)?;
                emit_rip_jump(&mut code, PRECODE_FALLBACK_OFFSET, page_size)?;
            }
            PrecodeKind::Import => {
                emit_rip_jump(&mut code, PRECODE_TARGET_OFFSET, page_size)?;
                pad_to(&mut code, PRECODE_INLINE_FALLBACK_OFFSET);
                emit_rip_load(&mut code, MOV_RAX_RIP, PRECODE_SECRET_OFFSET, page_size)?;
                emit_rip_jump(&mut code, PRECODE_FALLBACK_OFFSET, page_size)?;
            }
            PrecodeKind::ThisPtrRetBuf => {
                code.extend_from_slice(self.args.swap_sequence());
                emit_rip_jump(&mut code, PRECODE_TARGET_OFFSET, page_size)?;
            }
            PrecodeKind::Interpreter => {
                emit_rip_load(&mut code, MOV_R11_RIP, PRECODE_SECRET_OFFSET, page_size)?;
                emit_rip_jump(&mut code, PRECODE_TARGET_OFFSET, page_size)?;
            }
        }
        if code.len() > PRECODE_SLOT_SIZE {
            return Err(RtError::ExecutableMemory(format!(
                "x86_64 {kind:?} template is {} bytes, slot is {PRECODE_SLOT_SIZE}",
                code.len()
            )));
        }
        pad_to(&mut code, PRECODE_SLOT_SIZE);
        Ok(code)
    }
}

fn emit_rip_load(
    code: &mut Vec<u8>,
    opcode: [u8; 3],
    field: usize,
    page_size: usize,
) -> RtResult<()> {
    code.extend_from_slice(&opcode);
    emit_data_disp32(code, field, page_size)
}

fn emit_rip_jump(code: &mut Vec<u8>, field: usize, page_size: usize) -> RtResult<()> {
    code.extend_from_slice(&JMP_RIP);
    emit_data_disp32(code, field, page_size)
}

// rip-relative displacements are measured from the end of the instruction,
// which is the end of the disp32 itself for every form used here.
fn emit_data_disp32(code: &mut Vec<u8>, field: usize, page_size: usize) -> RtResult<()> {
    let insn_end = code.len() + 4;
    let disp = (page_size + field) as i64 - insn_end as i64;
    let disp = i32::try_from(disp).map_err(|_| {
        RtError::ExecutableMemory(format!("page size {page_size} exceeds rip-relative range"))
    })?;
    code.extend_from_slice(&disp.to_le_bytes());
    Ok(())
}

fn pad_to(code: &mut Vec<u8>, len: usize) {
    while code.len() < len {
        code.push(INT3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disp_at(code: &[u8], offset: usize) -> i32 {
        i32::from_le_bytes([
            code[offset],
            code[offset + 1],
            code[offset + 2],
            code[offset + 3],
        ])
    }

    #[test]
    fn stub_template_addresses_parallel_data_page() {
        let code = X86_64Stubs::HOST
            .emit_template(PrecodeKind::Stub, 4096)
            .expect("template");
        assert_eq!(&code[0..3], &MOV_R10_RIP);
        // mov ends at 7, secret lives at 4096 + 8
        assert_eq!(disp_at(&code, 3), 4096 + 8 - 7);
        assert_eq!(&code[7..9], &JMP_RIP);
        assert_eq!(disp_at(&code, 9), 4096 - 13);
        assert!(code[13..].iter().all(|byte| *byte == INT3));
    }

    #[test]
    fn fixup_template_has_inline_fallback_at_fixed_offset() {
        let code = X86_64Stubs::HOST
            .emit_template(PrecodeKind::Fixup, 4096)
            .expect("template");
        assert_eq!(&code[0..2], &JMP_RIP);
        assert_eq!(&code[6..8], &[INT3, INT3]);
        assert_eq!(&code[8..11], &MOV_R10_RIP);
        assert_eq!(disp_at(&code, 11), 4096 + 8 - 15);
        assert_eq!(&code[15..17], &JMP_RIP);
        assert_eq!(disp_at(&code, 17), 4096 + 16 - 21);
        assert_eq!(
            X86_64Stubs::HOST.fallback_offset(PrecodeKind::Fixup),
            Some(PRECODE_INLINE_FALLBACK_OFFSET)
        );
        assert_eq!(X86_64Stubs::HOST.fallback_offset(PrecodeKind::Stub), None);
    }

    #[test]
    fn this_ptr_swap_follows_the_argument_registers() {
        let sysv = X86_64Stubs::new(ArgRegisters::SysV)
            .emit_template(PrecodeKind::ThisPtrRetBuf, 4096)
            .expect("template");
        assert_eq!(&sysv[0..9], &[0x48, 0x89, 0xF8, 0x48, 0x89, 0xF7, 0x48, 0x89, 0xC6]);
        assert_eq!(&sysv[9..11], &JMP_RIP);
        assert_eq!(disp_at(&sysv, 11), 4096 - 15);

        let windows = X86_64Stubs::new(ArgRegisters::Windows)
            .emit_template(PrecodeKind::ThisPtrRetBuf, 4096)
            .expect("template");
        assert_eq!(&windows[0..9], &[0x48, 0x89, 0xC8, 0x48, 0x89, 0xD1, 0x48, 0x89, 0xC2]);
        assert_eq!(&windows[9..], &sysv[9..]);

        let expected = if cfg!(windows) { ArgRegisters::Windows } else { ArgRegisters::SysV };
        assert_eq!(X86_64Stubs::HOST.args, expected);
    }
}
