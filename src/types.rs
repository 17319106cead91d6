use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a blocked action originated in the served build
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeLocation {
    /// URL of the served script or document
    pub url: String,
    /// Line (1-indexed)
    pub line: u32,
    /// Column (1-indexed)
    pub column: u32,
}

/// Position in the original, pre-build source tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Source path as recorded in the position map
    pub path: String,
    /// Line (1-indexed)
    pub line: u32,
    /// Column (1-indexed)
    pub column: u32,
}

impl RuntimeLocation {
    pub fn new(url: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            url: url.into(),
            line,
            column,
        }
    }
}

impl SourceLocation {
    pub fn new(path: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            path: path.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for RuntimeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.url, self.line, self.column)
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.path, self.line, self.column)
    }
}
