#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrowHelper {
    pub index: u8,
    pub name: &'static str,
    pub exception: &'static str,
}

pub const ABI_VERSION: u16 = 3;

// Object layout, 64-bit targets. Offsets are relative to the object pointer,
// which addresses the method-table word; the object header sits before it.
pub const POINTER_SIZE: u32 = 8;
pub const OBJ_HEADER_SIZE: u32 = 8;
pub const ARRAY_LENGTH_OFFSET: u32 = 8;
pub const VECTOR_DATA_OFFSET: u32 = 16;
pub const ARRAY_BOUNDS_OFFSET: u32 = 16;
pub const ARRAY_BOUND_WORDS_PER_RANK: u32 = 2;
pub const ARRAY_BOUND_WORD_SIZE: u32 = 4;
pub const MAX_ARRAY_RANK: u32 = 32;
pub const MAX_COMPONENT_SIZE: u32 = u16::MAX as u32;

// GC descriptor wire format.
pub const GCDESC_COUNT_SIZE: usize = 8;
pub const GCDESC_SERIES_SIZE: usize = 16;
pub const GCDESC_PATTERN_ITEM_SIZE: usize = 4;
pub const GCDESC_MAX_PATTERN_FIELD: u32 = u16::MAX as u32;

// ECMA-335 signature element types used by synthesized array accessors.
pub const ELEMENT_TYPE_VOID: u8 = 0x01;
pub const ELEMENT_TYPE_BOOLEAN: u8 = 0x02;
pub const ELEMENT_TYPE_CHAR: u8 = 0x03;
pub const ELEMENT_TYPE_I1: u8 = 0x04;
pub const ELEMENT_TYPE_U1: u8 = 0x05;
pub const ELEMENT_TYPE_I2: u8 = 0x06;
pub const ELEMENT_TYPE_U2: u8 = 0x07;
pub const ELEMENT_TYPE_I4: u8 = 0x08;
pub const ELEMENT_TYPE_U4: u8 = 0x09;
pub const ELEMENT_TYPE_I8: u8 = 0x0A;
pub const ELEMENT_TYPE_U8: u8 = 0x0B;
pub const ELEMENT_TYPE_R4: u8 = 0x0C;
pub const ELEMENT_TYPE_R8: u8 = 0x0D;
pub const ELEMENT_TYPE_STRING: u8 = 0x0E;
pub const ELEMENT_TYPE_BYREF: u8 = 0x10;
pub const ELEMENT_TYPE_VALUETYPE: u8 = 0x11;
pub const ELEMENT_TYPE_CLASS: u8 = 0x12;
pub const ELEMENT_TYPE_VAR: u8 = 0x13;
pub const ELEMENT_TYPE_ARRAY: u8 = 0x14;
pub const ELEMENT_TYPE_I: u8 = 0x18;
pub const ELEMENT_TYPE_U: u8 = 0x19;
pub const ELEMENT_TYPE_OBJECT: u8 = 0x1C;
pub const ELEMENT_TYPE_SZARRAY: u8 = 0x1D;

pub const CALLCONV_DEFAULT: u8 = 0x00;
pub const CALLCONV_HASTHIS: u8 = 0x20;

// ECMA-335 MethodAttributes.
pub const METHOD_ATTR_PUBLIC: u16 = 0x0006;
pub const METHOD_ATTR_RT_SPECIAL_NAME: u16 = 0x1000;

// Precode data block, mirrored at the same offset on the page after the code.
pub const PRECODE_SLOT_SIZE: usize = 32;
pub const PRECODE_TARGET_OFFSET: usize = 0;
pub const PRECODE_SECRET_OFFSET: usize = 8;
pub const PRECODE_FALLBACK_OFFSET: usize = 16;
pub const PRECODE_TAG_OFFSET: usize = 24;
pub const PRECODE_INLINE_FALLBACK_OFFSET: usize = 8;

// Data pages start zeroed, so slots never handed out read as invalid.
pub const PRECODE_TAG_INVALID: u8 = 0x00;
pub const PRECODE_TAG_STUB: u8 = 0x4C;
pub const PRECODE_TAG_FIXUP: u8 = 0xFF;
pub const PRECODE_TAG_IMPORT: u8 = 0x48;
pub const PRECODE_TAG_THIS_PTR_RET_BUF: u8 = 0x90;
pub const PRECODE_TAG_INTERPRETER: u8 = 0x4D;

// Encodable bound on pushed pointer arguments before the GC info encoder
// has to fall back to partially interruptible code.
pub const MAX_PTR_ARG_COUNT: u32 = 1024;

pub const THROW_RANGE_CHECK: u8 = 0;
pub const THROW_ARGUMENT: u8 = 1;
pub const THROW_INDEX: u8 = 2;
pub const THROW_OVERFLOW: u8 = 3;
pub const THROW_ARITHMETIC: u8 = 4;
pub const THROW_DIV_BY_ZERO: u8 = 5;
pub const THROW_NULL_CHECK: u8 = 6;

pub const THROW_HELPERS: [ThrowHelper; 7] = [
    ThrowHelper {
        index: THROW_RANGE_CHECK,
        name: "HELP_RNGCHKFAIL",
        exception: "IndexOutOfRangeException",
    },
    ThrowHelper {
        index: THROW_ARGUMENT,
        name: "HELP_THROW_ARGUMENTEXCEPTION",
        exception: "ArgumentException",
    },
    ThrowHelper {
        index: THROW_INDEX,
        name: "HELP_THROW_ARGUMENTOUTOFRANGEEXCEPTION",
        exception: "ArgumentOutOfRangeException",
    },
    ThrowHelper {
        index: THROW_OVERFLOW,
        name: "HELP_OVERFLOW",
        exception: "OverflowException",
    },
    ThrowHelper {
        index: THROW_ARITHMETIC,
        name: "HELP_THROW_ARITHMETICEXCEPTION",
        exception: "ArithmeticException",
    },
    ThrowHelper {
        index: THROW_DIV_BY_ZERO,
        name: "HELP_THROWDIVZERO",
        exception: "DivideByZeroException",
    },
    ThrowHelper {
        index: THROW_NULL_CHECK,
        name: "HELP_THROWNULLREF",
        exception: "NullReferenceException",
    },
];

pub fn throw_helper_by_index(index: u8) -> Option<&'static ThrowHelper> {
    THROW_HELPERS.iter().find(|helper| helper.index == index)
}

pub fn throw_helper_by_name(name: &str) -> Option<&'static ThrowHelper> {
    THROW_HELPERS.iter().find(|helper| helper.name == name)
}

// libunwind pseudo registers, valid on every architecture.
pub const UNW_REG_IP: i32 = -1;
pub const UNW_REG_SP: i32 = -2;

// libunwind register numbering, x86_64.
pub const UNW_X86_64_RAX: i32 = 0;
pub const UNW_X86_64_RDX: i32 = 1;
pub const UNW_X86_64_RCX: i32 = 2;
pub const UNW_X86_64_RBX: i32 = 3;
pub const UNW_X86_64_RSI: i32 = 4;
pub const UNW_X86_64_RDI: i32 = 5;
pub const UNW_X86_64_RBP: i32 = 6;
pub const UNW_X86_64_RSP: i32 = 7;
pub const UNW_X86_64_R8: i32 = 8;
pub const UNW_X86_64_R15: i32 = 15;
pub const UNW_X86_64_RIP: i32 = 16;
pub const UNW_X86_64_XMM0: i32 = 17;
pub const UNW_X86_64_XMM15: i32 = 32;

// libunwind register numbering, aarch64.
pub const UNW_AARCH64_X0: i32 = 0;
pub const UNW_AARCH64_X28: i32 = 28;
pub const UNW_AARCH64_FP: i32 = 29;
pub const UNW_AARCH64_LR: i32 = 30;
pub const UNW_AARCH64_SP: i32 = 31;
pub const UNW_AARCH64_PC: i32 = 32;
pub const UNW_AARCH64_V0: i32 = 64;
// Only the callee-saved d8-d15 survive a call, so only they are unwound.
pub const UNW_AARCH64_D8: i32 = 72;
pub const UNW_AARCH64_D15: i32 = 79;
pub const UNW_AARCH64_V31: i32 = 95;

pub fn abi_summary() -> String {
    let mut out = String::new();
    out.push_str(&format!("abi_version={ABI_VERSION}\n"));
    out.push_str(&format!(
        "precode slot={PRECODE_SLOT_SIZE} target@{PRECODE_TARGET_OFFSET} secret@{PRECODE_SECRET_OFFSET} fallback@{PRECODE_FALLBACK_OFFSET} tag@{PRECODE_TAG_OFFSET}\n"
    ));
    for helper in THROW_HELPERS.iter() {
        out.push_str(&format!(
            "throw#{} {} -> {}\n",
            helper.index, helper.name, helper.exception
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throw_helper_indexes_match_table_positions() {
        for (position, helper) in THROW_HELPERS.iter().enumerate() {
            assert_eq!(helper.index as usize, position);
            assert_eq!(throw_helper_by_name(helper.name), Some(helper));
        }
        assert!(throw_helper_by_index(200).is_none());
    }

    #[test]
    fn summary_lists_every_throw_helper() {
        let summary = abi_summary();
        assert!(summary.starts_with(&format!("abi_version={ABI_VERSION}\n")));
        for helper in THROW_HELPERS.iter() {
            assert!(summary.contains(helper.name));
        }
    }

    #[test]
    fn precode_data_fits_in_one_slot() {
        assert!(PRECODE_TAG_OFFSET < PRECODE_SLOT_SIZE);
        assert!(PRECODE_INLINE_FALLBACK_OFFSET < PRECODE_SLOT_SIZE);
        assert_eq!(PRECODE_SLOT_SIZE % POINTER_SIZE as usize, 0);
    }
}
