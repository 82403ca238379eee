//! Per-method entry point lifecycle.
//!
//! Every method gets one canonical precode, allocated lazily and pointing at
//! its compile trigger. Compilations may race; publishing is a single CAS on
//! the precode target and the losers adopt the winner's code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::RuntimeConfig;
use crate::error::{RtError, RtResult};
use crate::logging::Component;
use crate::precode::{CodeAddr, MethodToken, Precode, PrecodeKind, PrecodeRegistry};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodInfo {
    pub token: MethodToken,
    pub name: String,
    /// Receiver and hidden return buffer arrive in swapped registers.
    pub requires_this_ret_buf_swap: bool,
    pub prefer_fixup: bool,
    pub interpreted: bool,
    /// Handed to the interpreter when the method runs interpreted.
    pub bytecode: CodeAddr,
}

impl MethodInfo {
    pub fn new(token: u64, name: impl Into<String>) -> Self {
        Self {
            token: MethodToken(token),
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodState {
    Uncompiled,
    Compiled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    Tiering,
    Unload,
}

/// Outcome of publishing compiled code. Losing the race is an expected
/// outcome: the caller must continue with [`Publication::entry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Publication {
    Installed(CodeAddr),
    RaceLost {
        installed: CodeAddr,
        discarded: CodeAddr,
    },
}

impl Publication {
    pub fn entry(&self) -> CodeAddr {
        match self {
            Publication::Installed(addr) => *addr,
            Publication::RaceLost { installed, .. } => *installed,
        }
    }

    pub fn won(&self) -> bool {
        matches!(self, Publication::Installed(_))
    }
}

struct MethodEntry<'r> {
    token: MethodToken,
    name: String,
    precode: Precode<'r>,
    version: AtomicU32,
    adjusting: OnceLock<CodeAddr>,
}

pub struct MethodEntryPointManager<'r> {
    registry: &'r PrecodeRegistry,
    config: RuntimeConfig,
    entries: RwLock<HashMap<MethodToken, Arc<MethodEntry<'r>>>>,
}

impl<'r> MethodEntryPointManager<'r> {
    pub fn new(registry: &'r PrecodeRegistry, config: RuntimeConfig) -> Self {
        Self {
            registry,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &'r PrecodeRegistry {
        self.registry
    }

    pub fn choose_kind(&self, info: &MethodInfo) -> PrecodeKind {
        if self.config.interpreter_tier || info.interpreted {
            PrecodeKind::Interpreter
        } else if info.requires_this_ret_buf_swap
            && self.registry.supports(PrecodeKind::ThisPtrRetBuf)
        {
            PrecodeKind::ThisPtrRetBuf
        } else if self.config.prefer_fixup_precodes || info.prefer_fixup {
            PrecodeKind::Fixup
        } else {
            PrecodeKind::Stub
        }
    }

    /// Returns the method's canonical precode, allocating it on first use.
    pub fn ensure_entry_point(&self, info: &MethodInfo) -> RtResult<Precode<'r>> {
        if let Some(entry) = self.lookup(info.token) {
            return Ok(entry.precode);
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(&info.token) {
            return Ok(entry.precode);
        }
        let kind = self.choose_kind(info);
        let precode = match kind {
            PrecodeKind::Interpreter => self.registry.allocate_interpreter(info.bytecode)?,
            _ => self.registry.allocate(kind, info.token)?,
        };
        debug!(
            "{} entry point for {} is {kind:?} precode {}",
            Component::Precode,
            display_name(&info.name, info.token),
            precode.entry()
        );
        entries.insert(
            info.token,
            Arc::new(MethodEntry {
                token: info.token,
                name: info.name.clone(),
                precode,
                version: AtomicU32::new(0),
                adjusting: OnceLock::new(),
            }),
        );
        Ok(precode)
    }

    pub fn entry_point(&self, token: MethodToken) -> Option<Precode<'r>> {
        self.lookup(token).map(|entry| entry.precode)
    }

    /// Handles a call that landed on the compile trigger. Compilation runs
    /// without any lock held, so several threads may compile the same method;
    /// all of them return the one address that ends up installed.
    pub fn prestub(
        &self,
        token: MethodToken,
        compile: impl FnOnce() -> RtResult<CodeAddr>,
    ) -> RtResult<CodeAddr> {
        let entry = self.lookup(token).ok_or(RtError::UnknownMethod(token.0))?;
        if !entry.precode.is_pointing_at_compile_trigger() {
            return Ok(entry.precode.target());
        }
        let code = compile()?;
        Ok(self.publish_entry(&entry, code).entry())
    }

    pub fn publish(&self, token: MethodToken, code: CodeAddr) -> RtResult<Publication> {
        let entry = self.lookup(token).ok_or(RtError::UnknownMethod(token.0))?;
        Ok(self.publish_entry(&entry, code))
    }

    /// Moves a compiled method back to uncompiled and starts a new code
    /// version. Returns `false` when the method had no code installed.
    ///
    /// No other compilation of this method may be publishing concurrently;
    /// see [`Precode::reset_atomic`].
    pub fn reset(&self, token: MethodToken, reason: ResetReason) -> RtResult<bool> {
        let entry = self.lookup(token).ok_or(RtError::UnknownMethod(token.0))?;
        if entry.precode.is_pointing_at_compile_trigger() {
            return Ok(false);
        }
        entry.precode.reset_atomic();
        let version = entry.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            "{} reset {} ({reason:?}), now {} at version {version}",
            Component::Precode,
            display_name(&entry.name, token),
            MethodState::Uncompiled
        );
        Ok(true)
    }

    pub fn state(&self, token: MethodToken) -> Option<MethodState> {
        self.lookup(token).map(|entry| {
            if entry.precode.is_pointing_at_compile_trigger() {
                MethodState::Uncompiled
            } else {
                MethodState::Compiled
            }
        })
    }

    pub fn code_version(&self, token: MethodToken) -> Option<u32> {
        self.lookup(token)
            .map(|entry| entry.version.load(Ordering::Acquire))
    }

    /// Allocates, once per method, a receiver-adjusting precode that chains
    /// to the canonical entry point. Racing callers all get the same address.
    pub fn create_adjusting_entry(&self, token: MethodToken) -> RtResult<CodeAddr> {
        let entry = self.lookup(token).ok_or(RtError::UnknownMethod(token.0))?;
        if let Some(addr) = entry.adjusting.get() {
            return Ok(*addr);
        }
        let adjusting = self.registry.allocate(PrecodeKind::ThisPtrRetBuf, token)?;
        if !adjusting.set_target_interlocked(entry.precode.entry(), true) {
            // Never published, so nothing can be dispatching through it.
            return Err(RtError::AdjustingEntryNotChained {
                method: token.0,
                target: adjusting.target().0,
            });
        }
        let addr = *entry.adjusting.get_or_init(|| adjusting.entry());
        if addr != adjusting.entry() {
            trace!(
                "{} adjusting entry for {} already created, dropping {}",
                Component::Precode,
                display_name(&entry.name, token),
                adjusting.entry()
            );
        }
        Ok(addr)
    }

    pub fn method_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lookup(&self, token: MethodToken) -> Option<Arc<MethodEntry<'r>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
            .cloned()
    }

    fn publish_entry(&self, entry: &MethodEntry<'r>, code: CodeAddr) -> Publication {
        let precode = entry.precode;
        if precode.set_target_atomic(code, precode.compile_trigger()) {
            debug!(
                "{} {} {} at {code}",
                Component::Precode,
                display_name(&entry.name, entry.token),
                MethodState::Compiled
            );
            Publication::Installed(code)
        } else {
            Publication::RaceLost {
                installed: precode.target(),
                discarded: code,
            }
        }
    }
}

fn display_name(name: &str, token: MethodToken) -> String {
    if name.is_empty() {
        format!("method {:#x}", token.0)
    } else {
        name.to_string()
    }
}
