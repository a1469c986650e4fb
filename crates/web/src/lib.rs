//! HTTP surface for the federation node (`tpnd`, §6).
//!
//! Wires an axum [`Router`](axum::Router) directly onto `tpn-daemon`'s engine
//! types — one process, one wire protocol (HTTP), no RPC hop between a
//! "daemon" and a "web" process the way the teacher split things.

pub mod app;
pub mod error;
pub mod server;

pub use app::AppState;
pub use error::ApiError;
