//! Method entry precodes.
//!
//! A precode is a small trampoline a call lands on before the method has
//! native code. It forwards to a compile trigger until the entry-point
//! manager swaps its `target` to the compiled body. `target` is the only
//! mutable field and is always updated with a single atomic word.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use rt_abi::{
    PRECODE_FALLBACK_OFFSET, PRECODE_INLINE_FALLBACK_OFFSET, PRECODE_SECRET_OFFSET,
    PRECODE_SLOT_SIZE, PRECODE_TAG_FIXUP, PRECODE_TAG_IMPORT, PRECODE_TAG_INTERPRETER,
    PRECODE_TAG_INVALID, PRECODE_TAG_OFFSET, PRECODE_TAG_STUB, PRECODE_TAG_THIS_PTR_RET_BUF,
    PRECODE_TARGET_OFFSET,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::arch::{StubCodegen, TargetArch, classify_precode_bytes};
use crate::error::{RtError, RtResult};
use crate::logging::Component;

mod heap;
mod memory;

use heap::InterleavedHeap;

const MAX_CHAIN_DEPTH: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeAddr(pub usize);

impl CodeAddr {
    pub const NULL: CodeAddr = CodeAddr(0);

    pub fn from_fn_ptr(ptr: *const ()) -> Self {
        CodeAddr(ptr as usize)
    }

    pub fn offset(self, bytes: usize) -> Self {
        CodeAddr(self.0 + bytes)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for CodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque identity of the method a precode dispatches for. It is what most
/// precodes hand to their target in the secret-parameter register;
/// interpreter precodes pass the method's bytecode instead.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MethodToken(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecodeKind {
    Stub,
    Fixup,
    Import,
    ThisPtrRetBuf,
    Interpreter,
}

impl PrecodeKind {
    pub const ALL: [PrecodeKind; 5] = [
        PrecodeKind::Stub,
        PrecodeKind::Fixup,
        PrecodeKind::Import,
        PrecodeKind::ThisPtrRetBuf,
        PrecodeKind::Interpreter,
    ];

    pub fn tag(self) -> u8 {
        match self {
            PrecodeKind::Stub => PRECODE_TAG_STUB,
            PrecodeKind::Fixup => PRECODE_TAG_FIXUP,
            PrecodeKind::Import => PRECODE_TAG_IMPORT,
            PrecodeKind::ThisPtrRetBuf => PRECODE_TAG_THIS_PTR_RET_BUF,
            PrecodeKind::Interpreter => PRECODE_TAG_INTERPRETER,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stub" => Some(PrecodeKind::Stub),
            "fixup" => Some(PrecodeKind::Fixup),
            "import" => Some(PrecodeKind::Import),
            "this_ptr_ret_buf" | "thisptr" => Some(PrecodeKind::ThisPtrRetBuf),
            "interpreter" => Some(PrecodeKind::Interpreter),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            PrecodeKind::Stub => 0,
            PrecodeKind::Fixup => 1,
            PrecodeKind::Import => 2,
            PrecodeKind::ThisPtrRetBuf => 3,
            PrecodeKind::Interpreter => 4,
        }
    }
}

#[derive(Debug)]
#[repr(C)]
pub(crate) struct PrecodeData {
    target: AtomicUsize,
    secret: AtomicUsize,
    fallback: AtomicUsize,
    tag: AtomicU8,
}

const _: () = {
    assert!(std::mem::size_of::<PrecodeData>() == PRECODE_SLOT_SIZE);
    assert!(std::mem::offset_of!(PrecodeData, target) == PRECODE_TARGET_OFFSET);
    assert!(std::mem::offset_of!(PrecodeData, secret) == PRECODE_SECRET_OFFSET);
    assert!(std::mem::offset_of!(PrecodeData, fallback) == PRECODE_FALLBACK_OFFSET);
    assert!(std::mem::offset_of!(PrecodeData, tag) == PRECODE_TAG_OFFSET);
};

/// Well-known routines precodes forward to while a method is uncompiled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PrecodeEntryPoints {
    pub prestub: CodeAddr,
    pub fixup_thunk: CodeAddr,
    pub import_thunk: CodeAddr,
    pub interpreter_entry: CodeAddr,
}

/// Handle to one allocated precode. Valid for as long as the registry that
/// allocated it.
#[derive(Clone, Copy, Debug)]
pub struct Precode<'r> {
    kind: PrecodeKind,
    code: CodeAddr,
    trigger: CodeAddr,
    prestub: CodeAddr,
    data: &'r PrecodeData,
}

impl<'r> Precode<'r> {
    pub fn kind(&self) -> PrecodeKind {
        self.kind
    }

    /// The address callers branch to.
    pub fn entry(&self) -> CodeAddr {
        self.code
    }

    pub fn compile_trigger(&self) -> CodeAddr {
        self.trigger
    }

    pub fn target(&self) -> CodeAddr {
        CodeAddr(self.data.target.load(Ordering::Acquire))
    }

    /// The raw word loaded into the secret-parameter register.
    pub fn secret(&self) -> usize {
        self.data.secret.load(Ordering::Relaxed)
    }

    /// The method this precode dispatches for. Interpreter precodes carry
    /// bytecode rather than a method and report `None`.
    pub fn method_token(&self) -> Option<MethodToken> {
        match self.kind {
            PrecodeKind::Interpreter => None,
            _ => Some(MethodToken(self.secret() as u64)),
        }
    }

    pub fn bytecode(&self) -> Option<CodeAddr> {
        match self.kind {
            PrecodeKind::Interpreter => Some(CodeAddr(self.secret())),
            _ => None,
        }
    }

    pub fn fallback(&self) -> CodeAddr {
        CodeAddr(self.data.fallback.load(Ordering::Relaxed))
    }

    pub fn tag(&self) -> u8 {
        self.data.tag.load(Ordering::Relaxed)
    }

    /// Rewrites `target` only if it still equals `expected`. Exactly one of
    /// several racing callers with the same `expected` succeeds.
    ///
    /// The target is read by the stub as data from its data page, so no
    /// instruction cache maintenance is needed after a successful swap.
    pub fn set_target_atomic(&self, new: CodeAddr, expected: CodeAddr) -> bool {
        let swapped = self
            .data
            .target
            .compare_exchange(expected.0, new.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !swapped {
            trace!(
                "{} retarget of {} to {new} lost, target is {}",
                Component::Precode,
                self.code,
                self.target()
            );
        }
        swapped
    }

    /// Replaces whatever target is current when loaded. With
    /// `only_redirect_from_trigger` the swap is refused unless that target
    /// still sends the call to be compiled.
    pub fn set_target_interlocked(&self, new: CodeAddr, only_redirect_from_trigger: bool) -> bool {
        debug_assert_ne!(new, self.prestub, "precodes are reset, not retargeted, to the prestub");
        let expected = self.target();
        if only_redirect_from_trigger
            && expected != self.trigger
            && !self.is_pointing_to_prestub(expected)
        {
            return false;
        }
        self.set_target_atomic(new, expected)
    }

    /// Whether `target` is the shared prestub or this precode's own inline
    /// fallback. Narrower than the compile trigger for interpreter precodes,
    /// whose trigger is the interpreter entry.
    pub fn is_pointing_to_prestub(&self, target: CodeAddr) -> bool {
        target == self.prestub || target == self.code.offset(PRECODE_INLINE_FALLBACK_OFFSET)
    }

    /// Points the precode back at its compile trigger.
    ///
    /// Callers must guarantee that no other compilation of this method is
    /// between reading the trigger and publishing through
    /// [`Precode::set_target_atomic`]; a racing publish may otherwise land
    /// after the reset and resurrect discarded code.
    pub fn reset_atomic(&self) {
        self.data.target.store(self.trigger.0, Ordering::SeqCst);
    }

    pub fn is_pointing_at_compile_trigger(&self) -> bool {
        self.target() == self.trigger
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PrecodeStats {
    pub arch: String,
    pub page_size: usize,
    pub kinds: Vec<PrecodeKindStats>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PrecodeKindStats {
    pub kind: PrecodeKind,
    pub allocated: usize,
    pub pages: usize,
}

/// Read `read_width_of_precode_type` bytes at
/// `entry + offset_of_precode_type` and shift right by
/// `shift_of_precode_type` to get a precode's type byte.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PrecodeMachineDescriptor {
    pub offset_of_precode_type: usize,
    pub read_width_of_precode_type: u8,
    pub shift_of_precode_type: u8,
    pub invalid_precode_type: u8,
    pub stub_precode_type: u8,
    pub pinvoke_import_precode_type: u8,
    pub fixup_precode_type: u8,
    pub this_ptr_ret_buf_precode_type: Option<u8>,
    pub interpreter_precode_type: u8,
    pub stub_code_page_size: usize,
}

impl PrecodeMachineDescriptor {
    pub fn kind_of(&self, raw: u8) -> Option<PrecodeKind> {
        let tag = raw >> self.shift_of_precode_type;
        if tag == self.invalid_precode_type {
            return None;
        }
        PrecodeKind::from_tag(tag)
            .filter(|kind| *kind != PrecodeKind::ThisPtrRetBuf || self.this_ptr_ret_buf_precode_type.is_some())
    }
}

pub struct PrecodeRegistry {
    arch: TargetArch,
    page_size: usize,
    entry_points: PrecodeEntryPoints,
    heaps: Vec<Option<InterleavedHeap>>,
}

impl PrecodeRegistry {
    pub fn new(entry_points: PrecodeEntryPoints) -> RtResult<Self> {
        let arch = TargetArch::host().ok_or_else(|| {
            RtError::UnsupportedArch(std::env::consts::ARCH.to_string())
        })?;
        Self::with_arch(arch, entry_points)
    }

    /// Registries for a foreign architecture map their pages like any other
    /// but must never be branched into; they exist for inspection and replay.
    pub fn with_arch(arch: TargetArch, entry_points: PrecodeEntryPoints) -> RtResult<Self> {
        let page_size = memory::page_size();
        let codegen = arch.codegen();
        let mut heaps = Vec::with_capacity(PrecodeKind::ALL.len());
        for kind in PrecodeKind::ALL {
            if codegen.supports(kind) {
                let template = codegen.emit_template(kind, page_size)?;
                heaps.push(Some(InterleavedHeap::new(kind, template, page_size)));
            } else {
                heaps.push(None);
            }
        }
        Ok(Self {
            arch,
            page_size,
            entry_points,
            heaps,
        })
    }

    pub fn arch(&self) -> TargetArch {
        self.arch
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn entry_points(&self) -> &PrecodeEntryPoints {
        &self.entry_points
    }

    pub fn supports(&self, kind: PrecodeKind) -> bool {
        self.heap(kind).is_some()
    }

    pub fn template_bytes(&self, kind: PrecodeKind) -> Option<&[u8]> {
        self.heap(kind).map(InterleavedHeap::template)
    }

    /// Allocates a precode for `method`, initially pointing at the compile
    /// trigger for its kind. Usable for dispatch as soon as it is returned.
    ///
    /// Interpreter precodes carry bytecode, not a method; use
    /// [`PrecodeRegistry::allocate_interpreter`] for those.
    pub fn allocate(&self, kind: PrecodeKind, method: MethodToken) -> RtResult<Precode<'_>> {
        if kind == PrecodeKind::Interpreter {
            return Err(RtError::InterpreterPrecodeNeedsBytecode);
        }
        let precode = self.allocate_slot(kind, method.0 as usize)?;
        debug!(
            "{} allocated {kind:?} precode at {} for method {:#x}",
            Component::Precode,
            precode.code,
            method.0
        );
        Ok(precode)
    }

    /// Allocates an interpreter precode that enters the interpreter with
    /// `bytecode` in the secret-parameter register.
    pub fn allocate_interpreter(&self, bytecode: CodeAddr) -> RtResult<Precode<'_>> {
        let precode = self.allocate_slot(PrecodeKind::Interpreter, bytecode.0)?;
        debug!(
            "{} allocated interpreter precode at {} for bytecode {bytecode}",
            Component::Precode,
            precode.code
        );
        Ok(precode)
    }

    fn allocate_slot(&self, kind: PrecodeKind, secret: usize) -> RtResult<Precode<'_>> {
        let heap = self.heap(kind).ok_or(RtError::UnsupportedPrecodeKind {
            kind,
            arch: self.arch.name(),
        })?;
        let mut trigger = CodeAddr::NULL;
        let slot = heap.allocate(|code, data| {
            trigger = self.initialize(kind, CodeAddr(code), secret, data);
        })?;
        // SAFETY: the data page lives as long as the heap, which `self` owns.
        let data = unsafe { &*slot.data };
        Ok(self.handle(kind, CodeAddr(slot.code), data))
    }

    /// Re-initializes the precode at `addr` for the method it already
    /// belongs to: every data field is rewritten and the target goes back to
    /// the compile trigger. Interpreter precodes cannot be reset.
    pub fn reset(&self, addr: CodeAddr) -> RtResult<Precode<'_>> {
        let precode = self.precode_at(addr).ok_or(RtError::NotAPrecode(addr.0))?;
        if precode.kind == PrecodeKind::Interpreter {
            return Err(RtError::PrecodeNotResettable(precode.kind));
        }
        self.initialize(precode.kind, precode.code, precode.secret(), precode.data);
        debug!(
            "{} reset {:?} precode at {addr}",
            Component::Precode,
            precode.kind
        );
        Ok(precode)
    }

    /// Writes a slot's data block. `target` is stored last so a concurrent
    /// caller never dispatches through half-written fields.
    fn initialize(
        &self,
        kind: PrecodeKind,
        code: CodeAddr,
        secret: usize,
        data: &PrecodeData,
    ) -> CodeAddr {
        let trigger = self.compile_trigger_for(self.arch.codegen(), kind, code);
        data.secret.store(secret, Ordering::Relaxed);
        data.fallback.store(self.fallback_for(kind).0, Ordering::Relaxed);
        data.tag.store(kind.tag(), Ordering::Relaxed);
        data.target.store(trigger.0, Ordering::Release);
        trigger
    }

    fn handle<'a>(&self, kind: PrecodeKind, code: CodeAddr, data: &'a PrecodeData) -> Precode<'a> {
        Precode {
            kind,
            code,
            trigger: self.compile_trigger_for(self.arch.codegen(), kind, code),
            prestub: self.entry_points.prestub,
            data,
        }
    }

    /// Recognises a precode at `addr` from its instruction bytes alone.
    /// Addresses outside this registry's code pages are never recognised.
    pub fn precode_at(&self, addr: CodeAddr) -> Option<Precode<'_>> {
        let data_ptr = self
            .heaps
            .iter()
            .flatten()
            .find_map(|heap| heap.slot_data(addr.0))?;
        // SAFETY: `slot_data` only returns slots on pages owned by this
        // registry, whose code pages are mapped readable.
        let bytes = unsafe { std::slice::from_raw_parts(addr.0 as *const u8, PRECODE_SLOT_SIZE) };
        let kind = classify_precode_bytes(self.arch, bytes, self.page_size)?;
        // SAFETY: the data page is mapped read-write for as long as its heap,
        // which `self` owns, and the slot was initialized before `slot_data`
        // could return it.
        let data = unsafe { &*data_ptr };
        Some(self.handle(kind, addr, data))
    }

    pub fn does_address_call_compile_trigger(&self, addr: CodeAddr) -> bool {
        if addr.0 % PRECODE_SLOT_SIZE != 0 {
            return false;
        }
        self.precode_at(addr)
            .is_some_and(|precode| precode.is_pointing_at_compile_trigger())
    }

    /// Maps an entry point back to the method it was allocated for.
    pub fn method_token_of(&self, addr: CodeAddr) -> Option<MethodToken> {
        self.precode_at(addr).and_then(|precode| precode.method_token())
    }

    /// For a fixup precode whose method has been compiled, the compiled code,
    /// so callers can branch there directly. `None` for anything else.
    pub fn try_to_skip_fixup_precode(&self, addr: CodeAddr) -> Option<CodeAddr> {
        let precode = self.precode_at(addr)?;
        if precode.kind != PrecodeKind::Fixup {
            return None;
        }
        let target = precode.target();
        (!precode.is_pointing_to_prestub(target)).then_some(target)
    }

    /// How a reader without this registry's types finds a precode's kind.
    pub fn machine_descriptor(&self) -> PrecodeMachineDescriptor {
        PrecodeMachineDescriptor {
            offset_of_precode_type: self.page_size + PRECODE_TAG_OFFSET,
            read_width_of_precode_type: 1,
            shift_of_precode_type: 0,
            invalid_precode_type: PRECODE_TAG_INVALID,
            stub_precode_type: PRECODE_TAG_STUB,
            pinvoke_import_precode_type: PRECODE_TAG_IMPORT,
            fixup_precode_type: PRECODE_TAG_FIXUP,
            this_ptr_ret_buf_precode_type: self
                .supports(PrecodeKind::ThisPtrRetBuf)
                .then_some(PRECODE_TAG_THIS_PTR_RET_BUF),
            interpreter_precode_type: PRECODE_TAG_INTERPRETER,
            stub_code_page_size: self.page_size,
        }
    }

    /// Follows precode-to-precode targets until reaching code that is not
    /// one of ours.
    pub fn resolve_final_target(&self, addr: CodeAddr) -> CodeAddr {
        let mut current = addr;
        for _ in 0..MAX_CHAIN_DEPTH {
            match self.precode_at(current) {
                Some(precode) if !precode.is_pointing_at_compile_trigger() => {
                    current = precode.target();
                }
                Some(precode) => return precode.target(),
                None => return current,
            }
        }
        current
    }

    pub fn stats(&self) -> PrecodeStats {
        let kinds = PrecodeKind::ALL
            .into_iter()
            .filter_map(|kind| {
                self.heap(kind).map(|heap| {
                    let (allocated, pages) = heap.counts();
                    PrecodeKindStats {
                        kind,
                        allocated,
                        pages,
                    }
                })
            })
            .collect();
        PrecodeStats {
            arch: self.arch.name().to_string(),
            page_size: self.page_size,
            kinds,
        }
    }

    fn heap(&self, kind: PrecodeKind) -> Option<&InterleavedHeap> {
        self.heaps.get(kind.index()).and_then(Option::as_ref)
    }

    fn compile_trigger_for(
        &self,
        codegen: &dyn StubCodegen,
        kind: PrecodeKind,
        code: CodeAddr,
    ) -> CodeAddr {
        match kind {
            PrecodeKind::Stub | PrecodeKind::ThisPtrRetBuf => self.entry_points.prestub,
            PrecodeKind::Fixup | PrecodeKind::Import => codegen
                .fallback_offset(kind)
                .map(|offset| code.offset(offset))
                .unwrap_or(self.entry_points.prestub),
            PrecodeKind::Interpreter => self.entry_points.interpreter_entry,
        }
    }

    fn fallback_for(&self, kind: PrecodeKind) -> CodeAddr {
        match kind {
            PrecodeKind::Fixup => self.entry_points.fixup_thunk,
            PrecodeKind::Import => self.entry_points.import_thunk,
            _ => CodeAddr::NULL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_points() -> PrecodeEntryPoints {
        PrecodeEntryPoints {
            prestub: CodeAddr(0x1000),
            fixup_thunk: CodeAddr(0x2000),
            import_thunk: CodeAddr(0x3000),
            interpreter_entry: CodeAddr(0x4000),
        }
    }

    #[test]
    fn tags_round_trip() {
        for kind in PrecodeKind::ALL {
            assert_eq!(PrecodeKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(PrecodeKind::from_tag(PRECODE_TAG_INVALID), None);
    }

    #[test]
    fn fixup_trigger_is_its_own_inline_fallback() {
        let registry = PrecodeRegistry::new(entry_points()).expect("registry");
        let precode = registry
            .allocate(PrecodeKind::Fixup, MethodToken(7))
            .expect("allocate");
        assert_eq!(
            precode.compile_trigger(),
            precode.entry().offset(rt_abi::PRECODE_INLINE_FALLBACK_OFFSET)
        );
        assert_eq!(precode.fallback(), CodeAddr(0x2000));
        assert_eq!(precode.tag(), PRECODE_TAG_FIXUP);
        assert!(precode.is_pointing_at_compile_trigger());
    }

    #[test]
    fn heaps_roll_over_to_new_pages() {
        let registry = PrecodeRegistry::new(entry_points()).expect("registry");
        let per_page = registry.page_size() / PRECODE_SLOT_SIZE;
        let mut last = None;
        for index in 0..=per_page {
            last = Some(
                registry
                    .allocate(PrecodeKind::Stub, MethodToken(index as u64))
                    .expect("allocate"),
            );
        }
        let stats = registry.stats();
        let stub = stats
            .kinds
            .iter()
            .find(|entry| entry.kind == PrecodeKind::Stub)
            .expect("stub stats");
        assert_eq!(stub.allocated, per_page + 1);
        assert_eq!(stub.pages, 2);
        let last = last.expect("allocated");
        assert_eq!(
            registry.method_token_of(last.entry()),
            Some(MethodToken(per_page as u64))
        );
    }

    #[test]
    fn prestub_check_is_narrower_than_the_compile_trigger() {
        let registry = PrecodeRegistry::new(entry_points()).expect("registry");
        let interpreter = registry
            .allocate_interpreter(CodeAddr(0x7000))
            .expect("allocate");
        assert!(interpreter.is_pointing_at_compile_trigger());
        assert!(!interpreter.is_pointing_to_prestub(interpreter.target()));
        assert!(interpreter.is_pointing_to_prestub(CodeAddr(0x1000)));

        let fixup = registry
            .allocate(PrecodeKind::Fixup, MethodToken(1))
            .expect("allocate");
        assert!(fixup.is_pointing_to_prestub(fixup.target()));
        assert!(!fixup.is_pointing_to_prestub(CodeAddr(0x9000)));
    }
}
