pub mod activity_log;
pub mod bundle;
pub(crate) mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod icon;
pub mod manifest;
pub(crate) mod migration;
pub mod models;
pub mod process;
pub mod reconciler;
pub mod registry;
pub mod signer;
pub mod store;
pub(crate) mod tool_cmd;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{EngineHandle, EngineParts, TileStatus, UpdateOutcome, spawn};
pub use error::{TileError, TileResult};
pub use models::{
    BundleIdentity, ConfigId, Configuration, GlyphKind, IconSpec, LayoutMode, MemberItem,
    MemberKind, TintColor,
};
