//! Capability modules reachable from scripts
//!
//! Built-ins (`str`, `array`, `debug`) are bound directly into the context. User
//! extensions live behind the `ext` directory and boot on first use.

pub mod builtins;
pub mod extension;
pub mod registry;


pub use builtins::{builtin_registry, builtins, Builtin};
pub use extension::{Extension, ExtensionDirectory, ExtensionError, DIRECTORY_CLASS};
pub use registry::CapabilityRegistry;
