//! Per-architecture precode templates.
//!
//! Every precode kind is a fixed-size, position-independent fragment that
//! reaches its data block at `+page_size`. One template is generated per
//! registry and replicated onto each code page; only this layer differs
//! between targets.

use serde::{Deserialize, Serialize};

use crate::error::{RtError, RtResult};
use crate::precode::PrecodeKind;

mod aarch64;
mod x86_64;

pub use aarch64::Aarch64Stubs;
pub use x86_64::{ArgRegisters, X86_64Stubs};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetArch {
    X86_64,
    Aarch64,
}

impl TargetArch {
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(TargetArch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(TargetArch::Aarch64)
        } else {
            None
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "x64" | "amd64" => Some(TargetArch::X86_64),
            "aarch64" | "arm64" => Some(TargetArch::Aarch64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TargetArch::X86_64 => "x86_64",
            TargetArch::Aarch64 => "aarch64",
        }
    }

    pub fn has_fixed_outgoing_area(self) -> bool {
        true
    }

    pub fn codegen(self) -> &'static dyn StubCodegen {
        static X86_64: X86_64Stubs = X86_64Stubs::HOST;
        static AARCH64: Aarch64Stubs = Aarch64Stubs;
        match self {
            TargetArch::X86_64 => &X86_64,
            TargetArch::Aarch64 => &AARCH64,
        }
    }
}

pub trait StubCodegen: Sync {
    fn arch(&self) -> TargetArch;

    fn supports(&self, kind: PrecodeKind) -> bool;

    /// Emits one `PRECODE_SLOT_SIZE` template for `kind`, padded with trap
    /// instructions.
    fn emit_template(&self, kind: PrecodeKind, page_size: usize) -> RtResult<Vec<u8>>;

    fn fallback_offset(&self, kind: PrecodeKind) -> Option<usize> {
        match kind {
            PrecodeKind::Fixup | PrecodeKind::Import => Some(rt_abi::PRECODE_INLINE_FALLBACK_OFFSET),
            _ => None,
        }
    }
}

pub(crate) fn unsupported(kind: PrecodeKind, arch: TargetArch) -> RtError {
    RtError::UnsupportedPrecodeKind {
        kind,
        arch: arch.name(),
    }
}

/// Identifies a precode purely by its instruction bytes. Kinds whose
/// template does not match byte for byte are never reported.
pub fn classify_precode_bytes(
    arch: TargetArch,
    bytes: &[u8],
    page_size: usize,
) -> Option<PrecodeKind> {
    let codegen = arch.codegen();
    PrecodeKind::ALL
        .iter()
        .copied()
        .filter(|kind| codegen.supports(*kind))
        .find(|kind| {
            codegen
                .emit_template(*kind, page_size)
                .is_ok_and(|template| bytes.len() >= template.len() && bytes[..template.len()] == template[..])
        })
}
