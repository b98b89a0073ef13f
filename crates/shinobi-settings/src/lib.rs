//! # shinobi-settings
//!
//! Runtime limits and defaults, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ShinobiSettings::default()`]
//! 2. **User file**: `~/.shinobi/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `SHINOBI_*` overrides
//!
//! Settings are plain values handed to the runtime by the caller; there is no
//! global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
