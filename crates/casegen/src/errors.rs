use std::fmt;

use crate::lexer::Token;

/// A code-generation failure at a source location. There is no recovery
/// within one instruction's emission; these propagate to the top level
/// and abort the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl CodegenError {
    pub fn new(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }

    pub fn at(message: impl Into<String>, tkn: &Token) -> Self {
        Self::new(message, tkn.line, tkn.column)
    }
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for CodegenError {}
