//! Shared primitives for the TPN federation node: data model, persistence,
//! error type, the named-lock registry (C1), and the geolocation resolver (C13).

pub mod db;
pub mod error;
pub mod geoip;
pub mod locks;
pub mod types;

pub use db::Database;
pub use error::{Error, Result};
pub use geoip::GeoResolver;
pub use locks::NamedLockRegistry;
pub use types::*;

/// Crate version, surfaced in the `GET /` node-identity payload alongside the
/// git branch/hash (those come from the build environment, not this crate).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default on-disk state directory, mirroring the teacher's `default_store_path`
/// idiom but rooted for this node rather than a VM store.
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".tpn-node")
}

pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
