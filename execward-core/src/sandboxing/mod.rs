//! Sandbox selection and enforcement.
//!
//! The [`SandboxManager`] picks one [`Sandbox`] variant from the configured
//! technology and the detected [`Capabilities`], then caches it for its
//! lifetime. Enforcement is a pure transform from a [`CommandSpec`] to a
//! [`ConfinedCommand`]; the confinement itself is applied by
//! `execward-process` between fork and exec.

mod capabilities;
mod command;
pub mod env;
mod manager;
pub mod policy;
mod sandbox;

pub use capabilities::{
    Capabilities, CapabilityDetector, CapabilityProbe, StaticProbe, SystemProbe,
};
pub use command::{CommandSpec, ConfinedCommand};
pub use manager::{SandboxManager, SandboxStatus};
pub use policy::SandboxPolicy;
pub use sandbox::{Sandbox, SandboxType};
