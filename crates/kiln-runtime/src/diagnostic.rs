//! Located diagnostics shared by the validator and compiler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Diagnostic severity, ordered from least to most serious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// A finding at a source position. Lines and columns are 1-based; 0 means
/// the finding applies to the whole script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Stable machine-readable code, e.g. `forbidden-api`.
    pub code: String,
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl Diagnostic {
    pub fn new(
        severity: Severity,
        code: impl Into<String>,
        message: impl Into<String>,
        line: u32,
        column: u32,
    ) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            line,
            column,
        }
    }

    pub fn error(code: &str, message: impl Into<String>, line: u32, column: u32) -> Self {
        Self::new(Severity::Error, code, message, line, column)
    }

    pub fn warning(code: &str, message: impl Into<String>, line: u32, column: u32) -> Self {
        Self::new(Severity::Warning, code, message, line, column)
    }

    pub fn info(code: &str, message: impl Into<String>, line: u32, column: u32) -> Self {
        Self::new(Severity::Info, code, message, line, column)
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {} [{}] {}",
            self.line, self.column, self.severity, self.code, self.message
        )
    }
}
