//! Snapshot backup and diff-based restore for torrent client instances.
//!
//! A run captures an instance's categories, tags, torrents and `.torrent`
//! files into a manifest. Runs can be exported in several archive formats,
//! imported back, and restored onto the instance through a computed plan.

pub mod archive;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod instance;
pub mod manifest;
pub mod models;
pub mod restore;
pub mod services;
pub mod state;
pub mod utils;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{BackupError, Result};
pub use manifest::{Manifest, ManifestItem};
pub use state::AppState;
