//! Shared helpers: logging setup and path validation.

pub mod logger;
pub mod safe_path;
