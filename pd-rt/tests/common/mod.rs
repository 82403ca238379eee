#![allow(dead_code, unused_imports)]

use std::sync::Arc;

pub use rt::{
    AccessorArgs, AccessorOutcome, ArrayAccessFault, ArrayKind, ArrayMethodKind, ArrayTypeLoader,
    BlockId, CodeAddr, ElementValue, GcDesc, MethodBody, MethodToken, NodeId, NodeKind,
    PrecodeEntryPoints, PrecodeKind, PrecodeRegistry, PrimitiveType, RuntimeConfig,
    StackLevelOptions, ThrowKind, TypeHandle, TypeUniverse, ValueTypeLayout,
};

pub const PRESTUB: CodeAddr = CodeAddr(0x1000);
pub const FIXUP_THUNK: CodeAddr = CodeAddr(0x2000);
pub const IMPORT_THUNK: CodeAddr = CodeAddr(0x3000);
pub const INTERPRETER_ENTRY: CodeAddr = CodeAddr(0x4000);

/// Entry points that are never branched to.
pub fn dummy_entry_points() -> PrecodeEntryPoints {
    PrecodeEntryPoints {
        prestub: PRESTUB,
        fixup_thunk: FIXUP_THUNK,
        import_thunk: IMPORT_THUNK,
        interpreter_entry: INTERPRETER_ENTRY,
    }
}

pub fn native_precode_supported() -> bool {
    (cfg!(target_arch = "x86_64") && cfg!(unix) && !cfg!(target_os = "macos"))
        || (cfg!(target_arch = "aarch64") && cfg!(target_os = "linux"))
}

/// A universe with `Pair` (references at 0 and 16, 24 bytes), `Point`
/// (no references) and a `Shape` <- `Circle` class chain.
pub struct Fixture {
    pub universe: Arc<TypeUniverse>,
    pub loader: ArrayTypeLoader,
    pub pair: TypeHandle,
    pub point: TypeHandle,
    pub shape: TypeHandle,
    pub circle: TypeHandle,
}

pub fn fixture() -> Fixture {
    let universe = Arc::new(TypeUniverse::new());
    let pair = universe.define_value_type("Pair", ValueTypeLayout::from_ref_offsets(24, [0, 16]));
    let point = universe.define_value_type("Point", ValueTypeLayout::new(8));
    let shape = universe.define_class("Shape", None);
    let circle = universe.define_class("Circle", Some(shape.id));
    Fixture {
        loader: ArrayTypeLoader::new(universe.clone()),
        universe,
        pair,
        point,
        shape,
        circle,
    }
}

pub fn options(optimize: bool) -> StackLevelOptions {
    StackLevelOptions {
        optimize,
        fixed_outgoing_area: false,
    }
}

/// Pushes `slots_per_arg` for each argument and then a call consuming them,
/// returning the call's id.
pub fn push_call(body: &mut MethodBody, block: BlockId, slots_per_arg: &[u32]) -> NodeId {
    let args: Vec<NodeId> = slots_per_arg
        .iter()
        .map(|slots| body.push(block, NodeKind::PutArgStk { slots: *slots }))
        .collect();
    body.push(block, NodeKind::Call { stack_args: args })
}
