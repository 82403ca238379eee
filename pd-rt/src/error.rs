use thiserror::Error;

use crate::array::ArrayKind;
use crate::jit::BlockId;
use crate::precode::PrecodeKind;
use crate::types::TypeId;

#[derive(Debug, Error)]
pub enum RtError {
    #[error("out of memory while allocating {0}")]
    OutOfMemory(&'static str),
    #[error("unsupported target architecture: {0}")]
    UnsupportedArch(String),
    #[error("precode kind {kind:?} is not supported on {arch}")]
    UnsupportedPrecodeKind { kind: PrecodeKind, arch: &'static str },
    #[error("executable memory error: {0}")]
    ExecutableMemory(String),
    #[error("interpreter precodes are allocated from bytecode, not a method token")]
    InterpreterPrecodeNeedsBytecode,
    #[error("{0:#x} is not the entry of an allocated precode")]
    NotAPrecode(usize),
    #[error("{0:?} precodes cannot be reset")]
    PrecodeNotResettable(PrecodeKind),
    #[error("unknown method token {0:#x}")]
    UnknownMethod(u64),
    #[error("adjusting entry for method {method:#x} could not chain to its canonical entry, target is {target:#x}")]
    AdjustingEntryNotChained { method: u64, target: usize },
    #[error("compilation failed: {0}")]
    Compile(String),
    #[error("type load failed: {0}")]
    TypeLoad(#[from] TypeLoadError),
    #[error("managed exception: {0}")]
    Fault(#[from] ArrayAccessFault),
    #[error("stack level pass failed: {0}")]
    StackLevel(#[from] StackLevelError),
    #[error("cannot install log subscriber: {0}")]
    Logging(String),
    #[error("invalid configuration value for {key}: {value}")]
    Config { key: &'static str, value: String },
}

pub type RtResult<T> = Result<T, RtError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TypeLoadError {
    #[error("invalid rank {rank} for {kind:?} array")]
    InvalidRank { rank: u32, kind: ArrayKind },
    #[error("array element type {element:?} is too large ({size} bytes)")]
    ElementTooLarge { element: TypeId, size: u32 },
    #[error("gc layout of {element:?} is too complex to encode for an array")]
    SeriesTooComplex { element: TypeId },
    #[error("gc layout of {element:?} is malformed: {reason}")]
    InvalidGcLayout { element: TypeId, reason: &'static str },
    #[error("{element:?} cannot be used as an array element")]
    InvalidElement { element: TypeId },
}

/// Managed exceptions raised by array accessor bodies.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ArrayAccessFault {
    #[error("index was outside the bounds of the array")]
    IndexOutOfRange,
    #[error("attempted to access an element as a type incompatible with the array")]
    ArrayTypeMismatch,
    #[error("type token does not match the array element type")]
    TypeMismatch,
    #[error("array dimensions resulted in an overflow")]
    Overflow,
    #[error("accessor invoked with {got} arguments, expected {expected}")]
    BadArguments { expected: usize, got: usize },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StackLevelError {
    #[error("block {block:?} leaves {level} outgoing stack slots unbalanced")]
    Unbalanced { block: BlockId, level: u32 },
    #[error("stack argument node {node} in block {block:?} has no consuming call")]
    OrphanArgument { block: BlockId, node: u32 },
    #[error("call {call} in block {block:?} consumes stack argument {arg} that is not in the block")]
    MissingArgument { block: BlockId, call: u32, arg: u32 },
    #[error("call {call} in block {block:?} pushes more stack argument slots than fit in 32 bits")]
    LevelOverflow { block: BlockId, call: u32 },
    #[error("exception target references unknown block {0:?}")]
    UnknownBlock(BlockId),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GcDescError {
    #[error("unexpected end of gc descriptor")]
    UnexpectedEof,
    #[error("trailing bytes after gc descriptor")]
    TrailingBytes,
    #[error("gc descriptor series count {0} is out of range")]
    BadCount(i64),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UnwindError {
    #[error("bad register number {0}")]
    BadRegister(i32),
    #[error("cannot read frame word at {0:#x}")]
    UnreadableFrame(u64),
    #[error("frame pointer chain does not ascend: {fp:#x} links to {caller:#x}")]
    FrameChainNotAscending { fp: u64, caller: u64 },
}
