//! Register display driven by an external unwinder.
//!
//! The unwinder numbers registers its own way (the libunwind numbering in
//! `rt_abi`); the tables here map those numbers onto the saved context of
//! the frame being unwound. Callee-saved registers also remember the stack
//! slot they were restored from.

use rt_abi::{
    UNW_AARCH64_D8, UNW_AARCH64_D15, UNW_AARCH64_FP, UNW_AARCH64_LR, UNW_AARCH64_PC,
    UNW_AARCH64_SP, UNW_AARCH64_V0, UNW_AARCH64_X0, UNW_AARCH64_X28, UNW_REG_IP, UNW_REG_SP,
    UNW_X86_64_R15, UNW_X86_64_RAX, UNW_X86_64_RBP, UNW_X86_64_RIP, UNW_X86_64_RSP,
    UNW_X86_64_XMM0, UNW_X86_64_XMM15,
};

use crate::arch::TargetArch;
use crate::error::UnwindError;

const X86_64_RSP_INDEX: usize = 4;
const X86_64_RBP_INDEX: usize = 5;
const WORD: u64 = 8;

// libunwind orders rax, rdx, rcx, rbx, rsi, rdi, rbp, rsp; the context uses
// the encoding order rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi.
const X86_64_UNWIND_TO_CONTEXT: [u8; 16] = [0, 2, 1, 3, 6, 7, 5, 4, 8, 9, 10, 11, 12, 13, 14, 15];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegLocation {
    Gpr(u8),
    Fpr(u8),
    Sp,
    Ip,
    Fp,
    Lr,
}

impl RegLocation {
    pub fn resolve(arch: TargetArch, regnum: i32) -> Option<Self> {
        match regnum {
            UNW_REG_SP => return Some(RegLocation::Sp),
            UNW_REG_IP => return Some(RegLocation::Ip),
            _ => {}
        }
        match arch {
            TargetArch::X86_64 => match regnum {
                UNW_X86_64_RSP => Some(RegLocation::Sp),
                UNW_X86_64_RAX..=UNW_X86_64_R15 => {
                    Some(RegLocation::Gpr(X86_64_UNWIND_TO_CONTEXT[regnum as usize]))
                }
                UNW_X86_64_RIP => Some(RegLocation::Ip),
                UNW_X86_64_XMM0..=UNW_X86_64_XMM15 => {
                    Some(RegLocation::Fpr((regnum - UNW_X86_64_XMM0) as u8))
                }
                _ => None,
            },
            TargetArch::Aarch64 => match regnum {
                UNW_AARCH64_X0..=UNW_AARCH64_X28 => Some(RegLocation::Gpr(regnum as u8)),
                UNW_AARCH64_FP => Some(RegLocation::Fp),
                UNW_AARCH64_LR => Some(RegLocation::Lr),
                UNW_AARCH64_SP => Some(RegLocation::Sp),
                UNW_AARCH64_PC => Some(RegLocation::Ip),
                UNW_AARCH64_D8..=UNW_AARCH64_D15 => {
                    Some(RegLocation::Fpr((regnum - UNW_AARCH64_V0) as u8))
                }
                _ => None,
            },
        }
    }

    pub fn is_fp(self) -> bool {
        matches!(self, RegLocation::Fpr(_))
    }
}

/// Every architectural register number the unwinder may ask for on `arch`.
/// The `UNW_REG_*` pseudo numbers are accepted as well but not listed.
pub fn unwind_register_numbers(arch: TargetArch) -> Vec<i32> {
    match arch {
        TargetArch::X86_64 => (UNW_X86_64_RAX..=UNW_X86_64_XMM15).collect(),
        TargetArch::Aarch64 => (UNW_AARCH64_X0..=UNW_AARCH64_PC)
            .chain(UNW_AARCH64_D8..=UNW_AARCH64_D15)
            .collect(),
    }
}

/// Stack addresses registers were last restored from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SavedLocations(Vec<(RegLocation, u64)>);

impl SavedLocations {
    pub fn get(&self, location: RegLocation) -> Option<u64> {
        self.0
            .iter()
            .find(|(saved, _)| *saved == location)
            .map(|(_, addr)| *addr)
    }

    fn record(&mut self, location: RegLocation, addr: u64) {
        match self.0.iter_mut().find(|(saved, _)| *saved == location) {
            Some(entry) => entry.1 = addr,
            None => self.0.push((location, addr)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct X86_64Context {
    /// rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15
    pub gpr: [u64; 16],
    pub rip: u64,
    pub xmm: [u128; 16],
    pub saved: SavedLocations,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Aarch64Context {
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub v: [u128; 32],
    pub saved: SavedLocations,
}

impl Default for Aarch64Context {
    fn default() -> Self {
        Self {
            x: [0; 29],
            fp: 0,
            lr: 0,
            sp: 0,
            pc: 0,
            v: [0; 32],
            saved: SavedLocations::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegDisplay {
    X86_64(X86_64Context),
    Aarch64(Aarch64Context),
}

impl RegDisplay {
    pub fn new(arch: TargetArch) -> Self {
        match arch {
            TargetArch::X86_64 => RegDisplay::X86_64(X86_64Context::default()),
            TargetArch::Aarch64 => RegDisplay::Aarch64(Aarch64Context::default()),
        }
    }

    pub fn arch(&self) -> TargetArch {
        match self {
            RegDisplay::X86_64(_) => TargetArch::X86_64,
            RegDisplay::Aarch64(_) => TargetArch::Aarch64,
        }
    }

    pub fn sp(&self) -> u64 {
        match self {
            RegDisplay::X86_64(ctx) => ctx.gpr[X86_64_RSP_INDEX],
            RegDisplay::Aarch64(ctx) => ctx.sp,
        }
    }

    pub fn set_sp(&mut self, value: u64) {
        match self {
            RegDisplay::X86_64(ctx) => ctx.gpr[X86_64_RSP_INDEX] = value,
            RegDisplay::Aarch64(ctx) => ctx.sp = value,
        }
    }

    pub fn ip(&self) -> u64 {
        match self {
            RegDisplay::X86_64(ctx) => ctx.rip,
            RegDisplay::Aarch64(ctx) => ctx.pc,
        }
    }

    pub fn set_ip(&mut self, value: u64) {
        match self {
            RegDisplay::X86_64(ctx) => ctx.rip = value,
            RegDisplay::Aarch64(ctx) => ctx.pc = value,
        }
    }

    /// The frame pointer: rbp on x86_64, x29 on aarch64.
    pub fn fp(&self) -> u64 {
        match self {
            RegDisplay::X86_64(ctx) => ctx.gpr[X86_64_RBP_INDEX],
            RegDisplay::Aarch64(ctx) => ctx.fp,
        }
    }

    pub fn saved_locations(&self) -> &SavedLocations {
        match self {
            RegDisplay::X86_64(ctx) => &ctx.saved,
            RegDisplay::Aarch64(ctx) => &ctx.saved,
        }
    }

    /// Sets `regnum` to `value`, loaded from the stack slot at `location`.
    /// The stack and instruction pointers are not restored from a slot, so
    /// their location is not kept.
    pub fn set_reg_saved_at(
        &mut self,
        regnum: i32,
        value: u64,
        location: u64,
    ) -> Result<(), UnwindError> {
        self.set_reg(regnum, value)?;
        let register = self.locate(regnum)?;
        if !matches!(register, RegLocation::Sp | RegLocation::Ip) {
            match self {
                RegDisplay::X86_64(ctx) => ctx.saved.record(register, location),
                RegDisplay::Aarch64(ctx) => ctx.saved.record(register, location),
            }
        }
        Ok(())
    }

    pub fn reg_location(&self, regnum: i32) -> Result<Option<u64>, UnwindError> {
        Ok(self.saved_locations().get(self.locate(regnum)?))
    }

    /// Steps one frame along the frame-pointer chain: the caller's frame
    /// pointer is stored at `fp` and the return address one word above it.
    /// Returns `false` once the chain ends at a null frame pointer.
    pub fn step_frame_pointer(
        &mut self,
        read_word: impl Fn(u64) -> Option<u64>,
    ) -> Result<bool, UnwindError> {
        let fp = self.fp();
        if fp == 0 {
            return Ok(false);
        }
        let ra_slot = fp
            .checked_add(WORD)
            .ok_or(UnwindError::UnreadableFrame(fp))?;
        let caller_sp = ra_slot
            .checked_add(WORD)
            .ok_or(UnwindError::UnreadableFrame(fp))?;
        let caller_fp = read_word(fp).ok_or(UnwindError::UnreadableFrame(fp))?;
        let return_address = read_word(ra_slot).ok_or(UnwindError::UnreadableFrame(ra_slot))?;
        // stacks grow down, so callers live at higher addresses
        if caller_fp != 0 && caller_fp <= fp {
            return Err(UnwindError::FrameChainNotAscending {
                fp,
                caller: caller_fp,
            });
        }
        match self.arch() {
            TargetArch::X86_64 => {
                self.set_reg_saved_at(UNW_X86_64_RBP, caller_fp, fp)?;
            }
            TargetArch::Aarch64 => {
                self.set_reg_saved_at(UNW_AARCH64_FP, caller_fp, fp)?;
                self.set_reg_saved_at(UNW_AARCH64_LR, return_address, ra_slot)?;
            }
        }
        self.set_ip(return_address);
        self.set_sp(caller_sp);
        Ok(true)
    }

    /// General purpose register by context index (encoding order on x86_64).
    pub fn gpr(&self, index: usize) -> Option<u64> {
        match self {
            RegDisplay::X86_64(ctx) => ctx.gpr.get(index).copied(),
            RegDisplay::Aarch64(ctx) => ctx.x.get(index).copied(),
        }
    }

    pub fn set_gpr(&mut self, index: usize, value: u64) -> bool {
        let slot = match self {
            RegDisplay::X86_64(ctx) => ctx.gpr.get_mut(index),
            RegDisplay::Aarch64(ctx) => ctx.x.get_mut(index),
        };
        slot.map(|slot| *slot = value).is_some()
    }

    pub fn fpr(&self, index: usize) -> Option<u128> {
        match self {
            RegDisplay::X86_64(ctx) => ctx.xmm.get(index).copied(),
            RegDisplay::Aarch64(ctx) => ctx.v.get(index).copied(),
        }
    }

    pub fn set_fpr(&mut self, index: usize, value: u128) -> bool {
        let slot = match self {
            RegDisplay::X86_64(ctx) => ctx.xmm.get_mut(index),
            RegDisplay::Aarch64(ctx) => ctx.v.get_mut(index),
        };
        slot.map(|slot| *slot = value).is_some()
    }

    fn locate(&self, regnum: i32) -> Result<RegLocation, UnwindError> {
        RegLocation::resolve(self.arch(), regnum).ok_or(UnwindError::BadRegister(regnum))
    }
}

/// The surface an unwinder steps a frame through.
pub trait UnwindRegisters {
    fn get_reg(&self, regnum: i32) -> Result<u64, UnwindError>;
    fn set_reg(&mut self, regnum: i32, value: u64) -> Result<(), UnwindError>;
    fn get_fpreg(&self, regnum: i32) -> Result<u128, UnwindError>;
    fn set_fpreg(&mut self, regnum: i32, value: u128) -> Result<(), UnwindError>;
    fn is_fp_reg(&self, regnum: i32) -> bool;
    fn validate_reg(&self, regnum: i32) -> bool;
}

impl UnwindRegisters for RegDisplay {
    fn get_reg(&self, regnum: i32) -> Result<u64, UnwindError> {
        let value = match (self.locate(regnum)?, self) {
            (RegLocation::Sp, _) => Some(self.sp()),
            (RegLocation::Ip, _) => Some(self.ip()),
            (RegLocation::Gpr(index), _) => self.gpr(index as usize),
            (RegLocation::Fp, RegDisplay::Aarch64(ctx)) => Some(ctx.fp),
            (RegLocation::Lr, RegDisplay::Aarch64(ctx)) => Some(ctx.lr),
            _ => None,
        };
        value.ok_or(UnwindError::BadRegister(regnum))
    }

    fn set_reg(&mut self, regnum: i32, value: u64) -> Result<(), UnwindError> {
        let location = self.locate(regnum)?;
        let stored = match (location, &mut *self) {
            (RegLocation::Sp, display) => {
                display.set_sp(value);
                true
            }
            (RegLocation::Ip, display) => {
                display.set_ip(value);
                true
            }
            (RegLocation::Gpr(index), display) => display.set_gpr(index as usize, value),
            (RegLocation::Fp, RegDisplay::Aarch64(ctx)) => {
                ctx.fp = value;
                true
            }
            (RegLocation::Lr, RegDisplay::Aarch64(ctx)) => {
                ctx.lr = value;
                true
            }
            _ => false,
        };
        if stored {
            Ok(())
        } else {
            Err(UnwindError::BadRegister(regnum))
        }
    }

    fn get_fpreg(&self, regnum: i32) -> Result<u128, UnwindError> {
        match self.locate(regnum)? {
            RegLocation::Fpr(index) => self
                .fpr(index as usize)
                .ok_or(UnwindError::BadRegister(regnum)),
            _ => Err(UnwindError::BadRegister(regnum)),
        }
    }

    fn set_fpreg(&mut self, regnum: i32, value: u128) -> Result<(), UnwindError> {
        match self.locate(regnum)? {
            RegLocation::Fpr(index) if self.set_fpr(index as usize, value) => Ok(()),
            _ => Err(UnwindError::BadRegister(regnum)),
        }
    }

    fn is_fp_reg(&self, regnum: i32) -> bool {
        RegLocation::resolve(self.arch(), regnum).is_some_and(RegLocation::is_fp)
    }

    fn validate_reg(&self, regnum: i32) -> bool {
        RegLocation::resolve(self.arch(), regnum).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use rt_abi::{UNW_X86_64_RCX, UNW_X86_64_RDX};

    #[test]
    fn x86_64_numbering_is_remapped_to_encoding_order() {
        let mut display = RegDisplay::new(TargetArch::X86_64);
        display.set_reg(UNW_X86_64_RDX, 0xD).expect("rdx");
        display.set_reg(UNW_X86_64_RCX, 0xC).expect("rcx");
        display.set_reg(UNW_X86_64_RBP, 0xB9).expect("rbp");
        assert_eq!(display.gpr(1), Some(0xC));
        assert_eq!(display.gpr(2), Some(0xD));
        assert_eq!(display.gpr(5), Some(0xB9));

        display.set_reg(UNW_X86_64_RSP, 0x7000).expect("rsp");
        assert_eq!(display.sp(), 0x7000);
    }

    #[test]
    fn aarch64_frame_registers_have_their_own_slots() {
        let mut display = RegDisplay::new(TargetArch::Aarch64);
        display.set_reg(UNW_AARCH64_FP, 0xF0).expect("fp");
        display.set_reg(UNW_AARCH64_LR, 0x1E).expect("lr");
        display.set_reg(UNW_AARCH64_PC, 0x4000).expect("pc");
        assert_eq!(display.get_reg(UNW_AARCH64_FP), Ok(0xF0));
        assert_eq!(display.get_reg(UNW_AARCH64_LR), Ok(0x1E));
        assert_eq!(display.ip(), 0x4000);
        assert!(display.is_fp_reg(UNW_AARCH64_D8));
        assert!(!display.validate_reg(UNW_AARCH64_V0 + 3));
        assert!(!display.validate_reg(40));
    }

    #[test]
    fn integer_access_to_vector_registers_is_rejected() {
        let mut display = RegDisplay::new(TargetArch::X86_64);
        assert_eq!(
            display.get_reg(UNW_X86_64_XMM0),
            Err(UnwindError::BadRegister(UNW_X86_64_XMM0))
        );
        assert_eq!(display.set_fpreg(UNW_X86_64_RAX, 1), Err(UnwindError::BadRegister(0)));
        display.set_fpreg(UNW_X86_64_XMM15, 7).expect("xmm15");
        assert_eq!(display.fpr(15), Some(7));
    }

    #[test]
    fn pseudo_registers_alias_the_stack_and_instruction_pointers() {
        for arch in [TargetArch::X86_64, TargetArch::Aarch64] {
            let mut display = RegDisplay::new(arch);
            display.set_reg(UNW_REG_SP, 0x7F00).expect("sp");
            display.set_reg(UNW_REG_IP, 0x4444).expect("ip");
            assert_eq!(display.sp(), 0x7F00);
            assert_eq!(display.ip(), 0x4444);
            assert!(!display.is_fp_reg(UNW_REG_IP));
        }
    }

    #[test]
    fn frame_pointer_chain_walks_to_the_outermost_frame() {
        // inner frame at 0x1000 -> caller at 0x1040 -> end of chain
        let stack: HashMap<u64, u64> = [
            (0x1000, 0x1040),
            (0x1008, 0xAAAA),
            (0x1040, 0),
            (0x1048, 0xBBBB),
        ]
        .into_iter()
        .collect();
        let read = |addr| stack.get(&addr).copied();

        let mut display = RegDisplay::new(TargetArch::Aarch64);
        display.set_reg(UNW_AARCH64_FP, 0x1000).expect("fp");
        assert_eq!(display.step_frame_pointer(read), Ok(true));
        assert_eq!(display.ip(), 0xAAAA);
        assert_eq!(display.sp(), 0x1010);
        assert_eq!(display.fp(), 0x1040);
        assert_eq!(display.reg_location(UNW_AARCH64_LR), Ok(Some(0x1008)));
        assert_eq!(display.reg_location(UNW_AARCH64_FP), Ok(Some(0x1000)));
        assert_eq!(display.reg_location(UNW_REG_IP), Ok(None));

        assert_eq!(display.step_frame_pointer(read), Ok(true));
        assert_eq!(display.ip(), 0xBBBB);
        assert_eq!(display.step_frame_pointer(read), Ok(false));
    }

    #[test]
    fn descending_or_unreadable_frames_stop_the_walk() {
        let mut display = RegDisplay::new(TargetArch::X86_64);
        display.set_reg(UNW_X86_64_RBP, 0x2000).expect("rbp");
        assert_eq!(
            display.step_frame_pointer(|addr| (addr == 0x2000).then_some(0x1000)),
            Err(UnwindError::UnreadableFrame(0x2008))
        );
        assert_eq!(
            display.step_frame_pointer(|addr| Some(if addr == 0x2000 { 0x1000 } else { 1 })),
            Err(UnwindError::FrameChainNotAscending {
                fp: 0x2000,
                caller: 0x1000
            })
        );
        // nothing was written on failure
        assert_eq!(display.fp(), 0x2000);
        assert_eq!(display.reg_location(UNW_X86_64_RBP), Ok(None));
    }
}
