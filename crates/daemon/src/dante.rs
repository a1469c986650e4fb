//! Dante SOCKS5 container driver (C3) and credential lease store (C5).

pub mod driver;
pub mod lease;

pub use driver::{DanteContainerCommand, DanteDriver, MockDanteContainerCommand, SubprocessDanteContainerCommand};
pub use lease::Socks5LeaseStore;
