//! Centralized path definitions for configuration and log files.
//!
//! Leaf filenames and directory names live here; no other module should
//! hard-code them.

use std::path::{Path, PathBuf};

// ── Application identity ─────────────────────────────────────────

pub const APP_ID: &str = "edit-bridge";

/// Overrides the whole config directory when set.
pub const CONFIG_DIR_ENV: &str = "EDIT_BRIDGE_CONFIG_DIR";

// ── Leaf filenames ───────────────────────────────────────────────

pub const SETTINGS_FILE: &str = "settings.json";
pub const CREDENTIALS_FILE: &str = ".credentials";

// ── Directory names ──────────────────────────────────────────────

pub const AUDIT_LOGS_DIR: &str = "audit-logs";

// ── Config-dir functions (take config_dir) ───────────────────────

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE)
}

pub fn credentials_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CREDENTIALS_FILE)
}

pub fn audit_logs_dir(config_dir: &Path) -> PathBuf {
    config_dir.join(AUDIT_LOGS_DIR)
}

/// `<platform config dir>/edit-bridge`, or `$EDIT_BRIDGE_CONFIG_DIR`.
pub fn default_config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    let base = if cfg!(target_os = "windows") {
        std::env::var("APPDATA")
            .map_or_else(|_| PathBuf::from("C:\\Users\\Default\\AppData\\Roaming"), PathBuf::from)
    } else if cfg!(target_os = "macos") {
        home_dir().join("Library/Application Support")
    } else {
        std::env::var("XDG_CONFIG_HOME").map_or_else(|_| home_dir().join(".config"), PathBuf::from)
    };
    base.join(APP_ID)
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_or_else(|_| PathBuf::from("."), PathBuf::from)
}
