//! Restricted script dialect compiled to a sandboxed block template engine
//!
//! ```text
//! set total = 0;
//! for n in input.numbers;
//!     set total = total + n;
//! endfor;
//! return total;
//! ```
//!
//! Scripts are rewritten into block tags, cached by content hash and rendered in a
//! sandbox that only reaches host code through allow-listed capability methods.
//! `return` hands a typed value back to the caller alongside the rendered text.

pub mod capabilities;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod store;

pub use capabilities::{CapabilityRegistry, Extension, ExtensionError};
pub use compiler::{CompileError, Compiler};
pub use config::RuntimeConfig;
pub use engine::{Object, ObjectError, Value};
pub use error::ScriptError;
pub use runtime::{hash_source, ReturnResult, Runtime};
pub use store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, StoreError};
