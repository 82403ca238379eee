use serde::Serialize;

use crate::arch::TargetArch;
use crate::error::{RtError, RtResult};

pub const ENV_ARCH: &str = "PDRT_ARCH";
pub const ENV_OPTIMIZE: &str = "PDRT_OPTIMIZE";
pub const ENV_PREFER_FIXUP: &str = "PDRT_PREFER_FIXUP";
pub const ENV_INTERPRETER: &str = "PDRT_INTERPRETER";
pub const ENV_FIXED_OUT_ARGS: &str = "PDRT_FIXED_OUT_ARGS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    pub arch: TargetArch,
    pub optimize: bool,
    pub prefer_fixup_precodes: bool,
    pub interpreter_tier: bool,
    /// Whether outgoing call arguments live in a reserved area of the frame
    /// rather than being pushed, which turns stack-level tracking off.
    pub fixed_outgoing_area: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let arch = TargetArch::host().unwrap_or(TargetArch::X86_64);
        Self {
            arch,
            optimize: true,
            prefer_fixup_precodes: false,
            interpreter_tier: false,
            fixed_outgoing_area: arch.has_fixed_outgoing_area(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> RtResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RtResult<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_ARCH) {
            config.arch = TargetArch::parse(&value).ok_or(RtError::Config {
                key: ENV_ARCH,
                value: value.clone(),
            })?;
            config.fixed_outgoing_area = config.arch.has_fixed_outgoing_area();
        }
        if let Some(value) = lookup(ENV_OPTIMIZE) {
            config.optimize = parse_bool(ENV_OPTIMIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_PREFER_FIXUP) {
            config.prefer_fixup_precodes = parse_bool(ENV_PREFER_FIXUP, &value)?;
        }
        if let Some(value) = lookup(ENV_INTERPRETER) {
            config.interpreter_tier = parse_bool(ENV_INTERPRETER, &value)?;
        }
        if let Some(value) = lookup(ENV_FIXED_OUT_ARGS) {
            config.fixed_outgoing_area = parse_bool(ENV_FIXED_OUT_ARGS, &value)?;
        }
        Ok(config)
    }
}

pub fn parse_bool(key: &'static str, value: &str) -> RtResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RtError::Config {
            key,
            value: value.to_string(),
        }),
    }
}
