//! # duplex-settings
//!
//! Layered configuration for the duplex gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`DuplexSettings::default()`]
//! 2. **Settings file**: `~/.duplex/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables**: `DUPLEX_*` overrides (highest priority)
//!
//! The binary applies CLI flags on top of the loaded value.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
