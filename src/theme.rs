//! Terminal colours for the interactive client.
//!
//! Respects `NO_COLOR` and `--no-color`.

use colored::Colorize;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::state::{AgentStatus, Phase};

static COLOR_DISABLED: AtomicBool = AtomicBool::new(false);

pub fn init_color(no_color_flag: bool) {
    if no_color_flag || std::env::var("NO_COLOR").is_ok_and(|v| !v.is_empty()) {
        COLOR_DISABLED.store(true, Ordering::Relaxed);
        colored::control::set_override(false);
    }
}

fn is_color() -> bool {
    !COLOR_DISABLED.load(Ordering::Relaxed)
}

pub mod palette {
    pub const ACCENT: (u8, u8, u8) = (0x4F, 0x9D, 0xDE);
    pub const SUCCESS: (u8, u8, u8) = (0x2F, 0xBF, 0x71);
    pub const WARN: (u8, u8, u8) = (0xFF, 0xB0, 0x20);
    pub const ERROR: (u8, u8, u8) = (0xE2, 0x3D, 0x2D);
    pub const MUTED: (u8, u8, u8) = (0x8B, 0x8F, 0x97);
}

fn apply(text: &str, (r, g, b): (u8, u8, u8)) -> String {
    if is_color() {
        text.truecolor(r, g, b).to_string()
    } else {
        text.to_string()
    }
}

pub fn accent(text: &str) -> String {
    apply(text, palette::ACCENT)
}

pub fn success(text: &str) -> String {
    apply(text, palette::SUCCESS)
}

pub fn warn(text: &str) -> String {
    apply(text, palette::WARN)
}

pub fn error(text: &str) -> String {
    apply(text, palette::ERROR)
}

pub fn muted(text: &str) -> String {
    apply(text, palette::MUTED)
}

/// One-line activity indicator, e.g. `[tool: query_sql]`.
pub fn status_line(status: &AgentStatus) -> String {
    let label = match (status.phase, status.tool_name.as_deref()) {
        (Phase::ToolCalling, Some(tool)) => format!("tool: {tool}"),
        (phase, _) => phase.to_string(),
    };
    muted(&format!("[{label}]"))
}

pub fn connection_label(connected: bool) -> String {
    if connected {
        success("connected")
    } else {
        error("disconnected")
    }
}
