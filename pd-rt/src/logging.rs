//! Tracing setup and the coloured component prefixes used in log lines.

use std::fmt;
use std::sync::OnceLock;

use owo_colors::{OwoColorize, Style};
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

use crate::entry_point::MethodState;
use crate::error::{RtError, RtResult};

/// Filter directives are read from here first, then from `RUST_LOG`.
pub const LOG_ENV: &str = "PD_RT_LOG";

/// Installs the global fmt subscriber. Fails if one is already installed.
pub fn init() -> RtResult<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(colored())
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| RtError::Logging(err.to_string()))
}

/// Runtime subsystem a log line comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Precode,
    Layout,
    Jit,
}

impl Component {
    pub fn name(self) -> &'static str {
        match self {
            Component::Precode => "PRECODE",
            Component::Layout => "LAYOUT",
            Component::Jit => "JIT",
        }
    }

    fn style(self) -> Style {
        let style = Style::new().bold();
        match self {
            Component::Precode => style.bright_cyan(),
            Component::Layout => style.bright_green(),
            Component::Jit => style.bright_magenta(),
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if colored() {
            write!(f, "{}", self.name().style(Component::style(*self)))
        } else {
            f.write_str(self.name())
        }
    }
}

impl MethodState {
    pub fn name(self) -> &'static str {
        match self {
            MethodState::Uncompiled => "uncompiled",
            MethodState::Compiled => "compiled",
        }
    }
}

impl fmt::Display for MethodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (colored(), self) {
            (false, _) => f.write_str(self.name()),
            (true, MethodState::Compiled) => write!(f, "{}", self.name().bright_green()),
            (true, MethodState::Uncompiled) => write!(f, "{}", self.name().bright_yellow()),
        }
    }
}

fn colored() -> bool {
    static COLORED: OnceLock<bool> = OnceLock::new();
    *COLORED.get_or_init(|| {
        color_from_env(|key| std::env::var_os(key).is_some())
            .unwrap_or_else(|| supports_color::on_cached(Stream::Stdout).is_some())
    })
}

/// `NO_COLOR` wins over `FORCE_COLOR`; with neither set the terminal decides.
fn color_from_env(is_set: impl Fn(&str) -> bool) -> Option<bool> {
    if is_set("NO_COLOR") {
        Some(false)
    } else if is_set("FORCE_COLOR") {
        Some(true)
    } else {
        None
    }
}
