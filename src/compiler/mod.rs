//! Dialect compiler
//!
//! Rewrites `<leading-token><body>;` statements into the engine's block syntax:
//!
//! ```text
//! set x = 1;                  =>  {% set x = 1 %}
//! ext.str.contains(a, b);     =>  {% do ext.str.contains(a, b) %}
//! ```
//!
//! The rewrite is purely lexical. Whatever the engine cannot parse surfaces later as
//! a runtime error carrying the engine's message and line.

pub mod lexer;


use thiserror::Error;

pub use lexer::{Lexer, Token, TokenKind};

/// Opening delimiter of a generic block
pub const BLOCK_OPEN: &str = "{% ";
/// Closing delimiter of any block
pub const BLOCK_CLOSE: &str = " %}";
/// Opening delimiter of a side-effecting call block
pub const DO_OPEN: &str = "{% do ";
/// Line separator emitted for CR, LF and CRLF
pub const LINE_SEPARATOR: &str = "\n";

/* ===================== Error Types ===================== */

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    /// The compiled output assigns to the reserved correlation variable
    #[error("Cannot reassign \"{variable}\".")]
    ReservedReassignment { variable: String },
}

/* ===================== Compiler ===================== */

/// Statement-to-block rewriter
#[derive(Debug, Clone)]
pub struct Compiler {
    lexer: Lexer,
    reserved: String,
}

impl Compiler {
    /// Create a compiler aware of `capabilities` (for direct-call detection) and of
    /// the `reserved` variable that compiled scripts may never assign.
    pub fn new<I, S>(capabilities: I, reserved: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            lexer: Lexer::new(capabilities),
            reserved: reserved.to_string(),
        }
    }

    /// Compile a script into engine syntax
    pub fn compile(&self, input: &str) -> Result<String, CompileError> {
        let output: String = self
            .lexer
            .tokenize(input)
            .iter()
            .map(rewrite_token)
            .collect();

        self.verify_no_reassignment(&output)?;

        Ok(output)
    }

    /// Plain substring scan for `<reserved> =`
    ///
    /// Matches inside string literals or longer identifiers too, and misses
    /// assignments written without exactly one space before `=`.
    fn verify_no_reassignment(&self, compiled: &str) -> Result<(), CompileError> {
        let pattern = format!("{} =", self.reserved);
        if !compiled.contains(&pattern) {
            return Ok(());
        }

        Err(CompileError::ReservedReassignment {
            variable: self.reserved.clone(),
        })
    }
}

fn rewrite_token(token: &Token) -> String {
    match token.kind {
        TokenKind::Ignore => String::new(),
        TokenKind::BlockOpen => format!("{}{}", BLOCK_OPEN, token.value),
        TokenKind::BlockClose => BLOCK_CLOSE.to_string(),
        TokenKind::Keep => token.value.clone(),
        TokenKind::DirectCall => format!("{}{}", DO_OPEN, token.value),
        TokenKind::LineSeparator => LINE_SEPARATOR.to_string(),
        TokenKind::Space | TokenKind::Tab => token.value.clone(),
    }
}
