//! WireGuard container driver (C2) and peer-slot lease store (C4).

pub mod config;
pub mod driver;
pub mod lease;

pub use config::ClientConfig;
pub use driver::{ContainerCommand, MockContainerCommand, SubprocessContainerCommand, WgKeyTriple, WireGuardDriver};
pub use lease::{LeaseRange, WireGuardLeaseStore};
