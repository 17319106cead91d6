use crate::types::{RuntimeLocation, SourceLocation};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One distinct offending location and every script sample reported for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Location in the served build, as reported by the browser
    pub runtime: RuntimeLocation,
    /// Location in the original source, set once during the resolve phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<SourceLocation>,
    /// Script samples, one per observed report
    pub samples: Vec<String>,
}

impl ViolationRecord {
    pub fn new(runtime: RuntimeLocation) -> Self {
        Self {
            runtime,
            resolved: None,
            samples: Vec::new(),
        }
    }

    /// Key of a not yet resolved location
    pub fn key_for(url: &str, line: u32, column: u32) -> String {
        format!("{}:{}:{}", url, line, column)
    }

    /// Resolved location if present, otherwise the runtime one
    pub fn key(&self) -> String {
        match &self.resolved {
            Some(source) => source.to_string(),
            None => Self::key_for(&self.runtime.url, self.runtime.line, self.runtime.column),
        }
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn add_occurrence(&mut self, sample: impl Into<String>) {
        self.samples.push(sample.into());
    }

    pub fn attach_resolved(&mut self, source: SourceLocation) {
        self.resolved = Some(source);
    }

    /// Exact triple equality against a source location.
    /// Unresolved records compare their runtime URL against the path.
    pub fn location_equals(&self, other: &SourceLocation) -> bool {
        match &self.resolved {
            Some(source) => source == other,
            None => {
                self.runtime.url == other.path
                    && self.runtime.line == other.line
                    && self.runtime.column == other.column
            }
        }
    }
}

impl fmt::Display for ViolationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "source: {}\n code samples: {}",
            self.key(),
            self.samples.join("\n")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ViolationRecord {
        ViolationRecord::new(RuntimeLocation::new("http://localhost:8080/app.js", 12, 3))
    }

    #[test]
    fn test_key_switches_to_resolved_location() {
        let mut r = record();
        assert_eq!(r.key(), "http://localhost:8080/app.js:12:3");
        r.attach_resolved(SourceLocation::new("src/app.ts", 4, 7));
        assert_eq!(r.key(), "src/app.ts:4:7");
    }

    #[test]
    fn test_count_follows_samples() {
        let mut r = record();
        assert_eq!(r.count(), 0);
        r.add_occurrence("eval('x')");
        r.add_occurrence("");
        assert_eq!(r.count(), 2);
    }

    #[test]
    fn test_location_equals_exact_only() {
        let mut r = record();
        r.attach_resolved(SourceLocation::new("a.ts", 10, 5));
        assert!(r.location_equals(&SourceLocation::new("a.ts", 10, 5)));
        assert!(!r.location_equals(&SourceLocation::new("a.ts", 11, 5)));
        assert!(!r.location_equals(&SourceLocation::new("a.ts", 10, 4)));
        assert!(!r.location_equals(&SourceLocation::new("b.ts", 10, 5)));
    }

    #[test]
    fn test_location_equals_unresolved_uses_runtime() {
        let r = record();
        assert!(r.location_equals(&SourceLocation::new("http://localhost:8080/app.js", 12, 3)));
    }

    #[test]
    fn test_display() {
        let mut r = record();
        r.add_occurrence("a");
        r.add_occurrence("b");
        assert_eq!(
            r.to_string(),
            "source: http://localhost:8080/app.js:12:3\n code samples: a\nb"
        );
    }
}
