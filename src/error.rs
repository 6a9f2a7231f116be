//! Public error type

use thiserror::Error;

use crate::compiler::CompileError;
use crate::engine::EngineError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script was rejected before reaching the engine
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Engine failure while parsing, checking or rendering the compiled script
    #[error("{}, line {}.", .message.trim_end_matches('.'), .line)]
    Runtime { message: String, line: usize },

    /// An extension failed; the error is the extension's own
    #[error(transparent)]
    Extension(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<EngineError> for ScriptError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Syntax { message, line }
            | EngineError::Security { message, line }
            | EngineError::Runtime { message, line } => ScriptError::Runtime { message, line },
            EngineError::Host(err) => ScriptError::Extension(err),
        }
    }
}
