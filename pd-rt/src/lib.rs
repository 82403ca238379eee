pub mod arch;
pub mod array;
pub mod config;
pub mod entry_point;
pub mod error;
pub mod jit;
pub mod logging;
pub mod precode;
pub mod types;
pub mod unwind;

pub use arch::{ArgRegisters, StubCodegen, TargetArch, X86_64Stubs, classify_precode_bytes};
pub use array::{
    AccessorArgs, AccessorBody, AccessorOp, AccessorOutcome, ArrayKind, ArrayLayoutSnapshot,
    ArrayMethodDesc, ArrayMethodKind, ArrayMethodTable, ArrayObject, ArrayTypeLoader, ElementValue,
    GcDesc, GcSeries, InterfaceEntry, InterfaceInstantiation, InterfaceMap, LayoutOwnership,
    ListHelperCall, ObjectRef, PatternItem, SignatureBuilder, VirtualSlot, VirtualTable,
    is_implicit_vector_interface, resolve_list_method,
};
pub use config::RuntimeConfig;
pub use entry_point::{
    MethodEntryPointManager, MethodInfo, MethodState, Publication, ResetReason,
};
pub use error::{
    ArrayAccessFault, GcDescError, RtError, RtResult, StackLevelError, TypeLoadError, UnwindError,
};
pub use jit::{
    AddCodeDsc, AddCodeKey, AddCodeMap, BasicBlock, BlockId, GcEncoding, MethodBody,
    MethodDescription, Node, NodeId, NodeKind, StackLevelOptions, StackLevelReport, ThrowKind,
    run_stack_level_pass,
};
pub use logging::{Component, LOG_ENV, init as init_logging};
pub use precode::{
    CodeAddr, MethodToken, Precode, PrecodeEntryPoints, PrecodeKind, PrecodeMachineDescriptor,
    PrecodeRegistry, PrecodeStats,
};
pub use types::{PrimitiveType, TypeDesc, TypeHandle, TypeId, TypeKind, TypeUniverse, ValueTypeLayout};
pub use unwind::{
    Aarch64Context, RegDisplay, RegLocation, SavedLocations, UnwindRegisters, X86_64Context,
};
